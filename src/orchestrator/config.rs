use crate::env;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::retry::{RetryPolicies, RetryPolicy};
use crate::storage::StorageKind;
use crate::task::TaskKind;
use crate::worker::WorkerSettings;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const MAX_DEQUEUE_TIMEOUT_SECS: u64 = 3600;

/// Orchestrator configuration, loaded once at startup.
///
/// Every field has a default, so a TOML file only needs the keys it changes.
/// Table-valued fields come last to keep the serialized form valid TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Where the file backend keeps tasks and channels
    pub state_dir: PathBuf,
    pub storage: StorageKind,
    pub worker_count: usize,
    /// Longest a worker parks on an empty main channel before re-checking shutdown
    pub dequeue_timeout_secs: u64,
    pub handler_timeout_secs: u64,
    /// Grace period of `Orchestrator::stop_default`
    pub stop_grace_secs: u64,
    /// Consecutive dead-letters of one kind that raise an alert, 0 disables
    pub alert_threshold: u32,
    /// Per-subscriber event buffer before the oldest events are dropped
    pub event_buffer: usize,
    /// Outcomes considered by the recent failure rate
    pub failure_window: usize,
    pub checksum_validation: bool,
    /// Handler timeout overrides per kind, in seconds
    pub handler_timeouts: BTreeMap<String, u64>,
    pub default_retry: RetryPolicy,
    pub retry_policies: BTreeMap<String, RetryPolicy>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(env::DEFAULT_STATE_DIR),
            storage: StorageKind::File,
            worker_count: 5,
            dequeue_timeout_secs: 5,
            handler_timeout_secs: 1800,
            stop_grace_secs: 30,
            alert_threshold: 5,
            event_buffer: 1024,
            failure_window: 100,
            checksum_validation: true,
            handler_timeouts: BTreeMap::new(),
            default_retry: RetryPolicy::default(),
            retry_policies: BTreeMap::new(),
        }
    }
}

impl OrchestratorConfig {
    /// Defaults on top of the in-memory backend
    pub fn in_memory() -> Self {
        Self {
            storage: StorageKind::Memory,
            ..Self::default()
        }
    }

    pub fn with_state_dir(mut self, state_dir: impl Into<PathBuf>) -> Self {
        self.state_dir = state_dir.into();
        self
    }

    pub fn with_retry_policy(mut self, kind: impl Into<String>, policy: RetryPolicy) -> Self {
        self.retry_policies.insert(kind.into(), policy);
        self
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse orchestrator configuration")
    }

    /// Load from TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content).with_context(|| format!("In {}", path.display()))
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize orchestrator configuration")
    }

    /// Save to TOML file
    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        fs::write(path, self.to_toml_string()?)
            .with_context(|| format!("Failed to write config file {}", path.display()))
    }

    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.worker_count == 0 {
            return Err(OrchestratorError::Config(
                "worker_count must be at least 1".to_string(),
            ));
        }
        if !(1..=MAX_DEQUEUE_TIMEOUT_SECS).contains(&self.dequeue_timeout_secs) {
            return Err(OrchestratorError::Config(format!(
                "dequeue_timeout_secs must be between 1 and {}",
                MAX_DEQUEUE_TIMEOUT_SECS
            )));
        }
        if self.handler_timeout_secs == 0 {
            return Err(OrchestratorError::Config(
                "handler_timeout_secs must be at least 1".to_string(),
            ));
        }
        if let Some((kind, _)) = self.handler_timeouts.iter().find(|(_, secs)| **secs == 0) {
            return Err(OrchestratorError::Config(format!(
                "handler timeout for {} must be at least 1 second",
                kind
            )));
        }
        if self.event_buffer == 0 {
            return Err(OrchestratorError::Config(
                "event_buffer must be at least 1".to_string(),
            ));
        }
        if self.failure_window == 0 {
            return Err(OrchestratorError::Config(
                "failure_window must be at least 1".to_string(),
            ));
        }
        if self.storage == StorageKind::File && self.state_dir.as_os_str().is_empty() {
            return Err(OrchestratorError::Config(
                "state_dir is required for file storage".to_string(),
            ));
        }

        self.retry_policies()
            .validate()
            .map_err(OrchestratorError::Config)
    }

    pub fn retry_policies(&self) -> RetryPolicies {
        self.retry_policies.iter().fold(
            RetryPolicies::new(self.default_retry.clone()),
            |policies, (kind, policy)| policies.with_policy(kind.as_str(), policy.clone()),
        )
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            dequeue_timeout: Duration::from_secs(self.dequeue_timeout_secs),
            handler_timeout: Duration::from_secs(self.handler_timeout_secs),
            handler_timeouts: self
                .handler_timeouts
                .iter()
                .map(|(kind, secs)| (TaskKind::new(kind.as_str()), Duration::from_secs(*secs)))
                .collect(),
            failure_window: self.failure_window,
        }
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}
