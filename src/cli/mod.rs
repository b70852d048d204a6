//! CLI-specific functionality for the orchestrator
//!
//! This module contains argument parsing and configuration discovery.

pub mod args;
pub mod config;

pub use args::{Args, Commands, DeadLetterCommand};
pub use config::ConfigDiscovery;
