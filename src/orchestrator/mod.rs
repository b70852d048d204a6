//! Composition root: configuration, startup recovery and the public facade.

pub mod config;
pub mod recovery;
pub mod service;
pub mod status;


pub use config::OrchestratorConfig;
pub use recovery::RecoveryReport;
pub use service::Orchestrator;
pub use status::OrchestratorStatus;
