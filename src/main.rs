use anyhow::{Context, Result};
use aurora_orchestrator::cli::{Args, Commands, ConfigDiscovery, DeadLetterCommand};
use aurora_orchestrator::{DeadLetterFilter, Orchestrator, OrchestratorConfig, Task};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over --log-level; logs go to stderr so listings stay pipeable
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_directive()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::ShowConfig = args.command {
        ConfigDiscovery::show_discovery_info();
        return Ok(());
    }

    let mut config = ConfigDiscovery::load(args.config.as_ref())?;
    if let Some(state_dir) = &args.state_dir {
        config.state_dir = state_dir.clone();
    }
    debug!("Effective configuration: {:?}", config);

    let orchestrator = open(config).await?;

    match args.command {
        Commands::Status => {
            println!("{}", orchestrator.status().await);
        }
        Commands::Tasks { status } => {
            let tasks = match status {
                Some(status) => orchestrator.list_by_status(status).await,
                None => orchestrator.list_tasks().await,
            };
            print_tasks(&tasks);
        }
        Commands::DeadLetter(DeadLetterCommand::List { kind, limit }) => {
            let mut filter = DeadLetterFilter::new();
            if let Some(kind) = kind {
                filter = filter.kind(kind);
            }
            if let Some(limit) = limit {
                filter = filter.limit(limit);
            }
            print_tasks(&orchestrator.dead_letters().list_dead_lettered(&filter).await);
        }
        Commands::DeadLetter(DeadLetterCommand::Retry {
            task_id: Some(task_id),
            ..
        }) => {
            let task = orchestrator.dead_letters().retry(task_id).await?;
            println!(
                "Requeued {} ({}), manual retry #{}",
                task.id, task.kind, task.manual_retries
            );
        }
        Commands::DeadLetter(DeadLetterCommand::Retry {
            task_id: None,
            kind,
            since,
            ..
        }) => {
            let mut filter = DeadLetterFilter::new();
            if let Some(kind) = kind {
                filter = filter.kind(kind);
            }
            if let Some(since) = since {
                filter = filter.within(since);
            }
            let retried = orchestrator.dead_letters().retry_matching(&filter).await?;
            for task_id in &retried {
                println!("Requeued {}", task_id);
            }
            println!("Requeued {} dead-lettered tasks", retried.len());
        }
        Commands::DeadLetter(DeadLetterCommand::Purge { older_than }) => {
            let purged = orchestrator.dead_letters().purge(older_than).await?;
            println!("Purged {} dead-lettered tasks", purged);
        }
        Commands::PurgeCompleted { older_than } => {
            let purged = orchestrator.purge_completed(older_than).await?;
            println!("Purged {} completed tasks", purged);
        }
        Commands::Recover => {
            let report = orchestrator.recovery_report();
            if report.is_clean() {
                println!("Recovered {} tasks, nothing to repair", report.tasks_loaded);
            } else {
                println!("{}", serde_json::to_string_pretty(report)?);
            }
        }
        Commands::ShowConfig => ConfigDiscovery::show_discovery_info(),
    }

    Ok(())
}

async fn open(config: OrchestratorConfig) -> Result<Orchestrator> {
    info!("Opening state in {:?}", config.state_dir);
    let state_dir = config.state_dir.clone();
    Orchestrator::open(config)
        .await
        .with_context(|| format!("Failed to open orchestrator state in {}", state_dir.display()))
}

fn print_tasks(tasks: &[Task]) {
    if tasks.is_empty() {
        println!("No tasks");
        return;
    }

    for task in tasks {
        println!(
            "{}  {:<14} {:<12} attempts={} updated={}{}",
            task.id,
            task.status,
            task.kind,
            task.attempts,
            task.updated_at.format("%Y-%m-%d %H:%M:%S"),
            task.error
                .as_deref()
                .map(|e| format!("  error: {}", e))
                .unwrap_or_default()
        );
    }
}
