//! Command line argument parsing
//!
//! Every subcommand works on the durable state of a stopped orchestrator:
//! - `status`: queue depths and task counts
//! - `tasks`: list tasks, optionally by status
//! - `dead-letter`: list, retry (one or in bulk) or purge dead-lettered tasks
//! - `purge-completed`: drop old completed tasks
//! - `recover`: run startup recovery and report what it repaired
//! - `show-config`: show configuration discovery information

use crate::task::{TaskId, TaskStatus};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "aurora-orch")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Inspect and repair the durable state of an AURORA task orchestrator")]
#[command(long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Args {
    /// Configuration file path (skips discovery)
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// State directory override
    #[arg(short = 's', long = "state-dir", global = true)]
    pub state_dir: Option<PathBuf>,

    /// Log level for the orchestrator (ignored when RUST_LOG is set)
    #[arg(long = "log-level", global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Show queue depths and task counts
    Status,
    /// List tasks
    Tasks {
        /// Only tasks in this status (queued, processing, completed, failed, dead_lettered)
        #[arg(long = "status", value_parser = parse_status)]
        status: Option<TaskStatus>,
    },
    /// Manage dead-lettered tasks
    #[command(subcommand)]
    DeadLetter(DeadLetterCommand),
    /// Delete completed tasks older than the retention
    PurgeCompleted {
        #[arg(long = "older-than-days", default_value = "30", value_parser = parse_days)]
        older_than: chrono::Duration,
    },
    /// Run recovery on the state directory and report the repairs
    Recover,
    /// Show configuration discovery information
    ShowConfig,
}

#[derive(Debug, Subcommand)]
pub enum DeadLetterCommand {
    /// List dead-lettered tasks, most recent first
    List {
        #[arg(long = "kind")]
        kind: Option<String>,
        #[arg(long = "limit")]
        limit: Option<usize>,
    },
    /// Send one dead-lettered task, or every match with `--all`, back to main
    Retry {
        #[arg(required_unless_present = "all", conflicts_with = "all")]
        task_id: Option<TaskId>,
        /// Retry every dead-lettered task matching the filters
        #[arg(long = "all")]
        all: bool,
        #[arg(long = "kind", requires = "all")]
        kind: Option<String>,
        /// Only tasks dead-lettered within this many hours
        #[arg(long = "since-hours", requires = "all", value_parser = parse_hours)]
        since: Option<chrono::Duration>,
    },
    /// Delete dead-lettered tasks older than the given age
    Purge {
        #[arg(long = "older-than-hours", value_parser = parse_hours)]
        older_than: chrono::Duration,
    },
}

fn parse_status(value: &str) -> Result<TaskStatus, String> {
    value.parse()
}

fn parse_hours(value: &str) -> Result<chrono::Duration, String> {
    parse_age(value, chrono::Duration::try_hours)
}

fn parse_days(value: &str) -> Result<chrono::Duration, String> {
    parse_age(value, chrono::Duration::try_days)
}

/// Non-negative age that fits a `chrono::Duration`
fn parse_age(
    value: &str,
    to_duration: fn(i64) -> Option<chrono::Duration>,
) -> Result<chrono::Duration, String> {
    let amount: i64 = value
        .parse()
        .map_err(|e| format!("invalid age '{}': {}", value, e))?;
    if amount < 0 {
        return Err(format!("age must not be negative, got {}", amount));
    }
    to_duration(amount).ok_or_else(|| format!("age {} is out of range", amount))
}

impl Args {
    pub fn parse() -> Self {
        Parser::parse()
    }

    /// Filter directive used when RUST_LOG is not set
    pub fn log_directive(&self) -> String {
        format!("aurora_orchestrator={}", self.log_level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_command_with_globals() {
        let args = Args::try_parse_from([
            "aurora-orch",
            "status",
            "--state-dir",
            "/var/lib/aurora",
            "--log-level",
            "debug",
        ])
        .unwrap();

        assert!(matches!(args.command, Commands::Status));
        assert_eq!(args.state_dir, Some(PathBuf::from("/var/lib/aurora")));
        assert_eq!(args.log_directive(), "aurora_orchestrator=debug");
        assert!(args.config.is_none());
    }

    #[test]
    fn test_tasks_status_filter() {
        let args = Args::try_parse_from(["aurora-orch", "tasks", "--status", "dead-lettered"]).unwrap();
        assert!(matches!(
            args.command,
            Commands::Tasks {
                status: Some(TaskStatus::DeadLettered)
            }
        ));

        assert!(Args::try_parse_from(["aurora-orch", "tasks", "--status", "sleeping"]).is_err());
    }

    #[test]
    fn test_dead_letter_subcommands() {
        let args = Args::try_parse_from([
            "aurora-orch",
            "dead-letter",
            "list",
            "--kind",
            "grade",
            "--limit",
            "10",
        ])
        .unwrap();
        match args.command {
            Commands::DeadLetter(DeadLetterCommand::List { kind, limit }) => {
                assert_eq!(kind.as_deref(), Some("grade"));
                assert_eq!(limit, Some(10));
            }
            other => panic!("unexpected command {:?}", other),
        }

        let id = uuid::Uuid::new_v4();
        let args =
            Args::try_parse_from(["aurora-orch", "dead-letter", "retry", &id.to_string()]).unwrap();
        assert!(matches!(
            args.command,
            Commands::DeadLetter(DeadLetterCommand::Retry { task_id: Some(task_id), all: false, .. })
                if task_id == id
        ));

        assert!(Args::try_parse_from(["aurora-orch", "dead-letter", "retry", "not-a-uuid"]).is_err());
    }

    #[test]
    fn test_dead_letter_bulk_retry() {
        let args = Args::try_parse_from([
            "aurora-orch",
            "dead-letter",
            "retry",
            "--all",
            "--kind",
            "grade",
            "--since-hours",
            "6",
        ])
        .unwrap();
        match args.command {
            Commands::DeadLetter(DeadLetterCommand::Retry {
                task_id,
                all,
                kind,
                since,
            }) => {
                assert!(task_id.is_none());
                assert!(all);
                assert_eq!(kind.as_deref(), Some("grade"));
                assert_eq!(since, Some(chrono::Duration::hours(6)));
            }
            other => panic!("unexpected command {:?}", other),
        }

        // Either an id or --all, never both or neither
        assert!(Args::try_parse_from(["aurora-orch", "dead-letter", "retry"]).is_err());
        let id = uuid::Uuid::new_v4().to_string();
        assert!(
            Args::try_parse_from(["aurora-orch", "dead-letter", "retry", &id, "--all"]).is_err()
        );
        // Filters only apply to --all
        assert!(
            Args::try_parse_from(["aurora-orch", "dead-letter", "retry", &id, "--kind", "grade"])
                .is_err()
        );
    }

    #[test]
    fn test_purge_completed_default_retention() {
        let args = Args::try_parse_from(["aurora-orch", "purge-completed"]).unwrap();
        match args.command {
            Commands::PurgeCompleted { older_than } => {
                assert_eq!(older_than, chrono::Duration::days(30));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_retention_ages_are_bounded() {
        let args = Args::try_parse_from([
            "aurora-orch",
            "dead-letter",
            "purge",
            "--older-than-hours",
            "48",
        ])
        .unwrap();
        assert!(matches!(
            args.command,
            Commands::DeadLetter(DeadLetterCommand::Purge { older_than })
                if older_than == chrono::Duration::hours(48)
        ));

        for bad in ["-1", "9223372036854775807", "soon"] {
            assert!(
                Args::try_parse_from([
                    "aurora-orch",
                    "dead-letter",
                    "purge",
                    "--older-than-hours",
                    bad,
                ])
                .is_err(),
                "accepted {}",
                bad
            );
        }
        assert!(
            Args::try_parse_from(["aurora-orch", "purge-completed", "--older-than-days", "-3"])
                .is_err()
        );
        assert!(
            Args::try_parse_from([
                "aurora-orch",
                "purge-completed",
                "--older-than-days",
                "999999999999"
            ])
            .is_err()
        );
    }

    #[test]
    fn test_no_command_error() {
        assert!(Args::try_parse_from(["aurora-orch"]).is_err());
    }
}
