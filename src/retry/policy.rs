use crate::task::TaskKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Redelivery policy for one task kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Handler invocations allowed before the task is dead-lettered
    pub max_attempts: u32,
    pub base_delay_secs: f64,
    pub multiplier: f64,
    pub max_delay_secs: f64,
    /// Fraction of the delay used as the ± jitter band
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_secs: 1.0,
            multiplier: 2.0,
            max_delay_secs: 300.0,
            jitter_fraction: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn with_delays(mut self, base_delay_secs: f64, multiplier: f64, max_delay_secs: f64) -> Self {
        self.base_delay_secs = base_delay_secs;
        self.multiplier = multiplier;
        self.max_delay_secs = max_delay_secs;
        self
    }

    pub fn with_jitter(mut self, jitter_fraction: f64) -> Self {
        self.jitter_fraction = jitter_fraction;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if !self.base_delay_secs.is_finite() || self.base_delay_secs < 0.0 {
            return Err(format!(
                "base_delay_secs must be a non-negative number, got {}",
                self.base_delay_secs
            ));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(format!(
                "multiplier must be at least 1.0, got {}",
                self.multiplier
            ));
        }
        if !self.max_delay_secs.is_finite() || self.max_delay_secs < 0.0 {
            return Err(format!(
                "max_delay_secs must be a non-negative number, got {}",
                self.max_delay_secs
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(format!(
                "jitter_fraction must be within [0, 1], got {}",
                self.jitter_fraction
            ));
        }
        Ok(())
    }
}

/// Policies per kind, with a fallback for kinds that have none
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryPolicies {
    default: RetryPolicy,
    per_kind: HashMap<TaskKind, RetryPolicy>,
}

impl RetryPolicies {
    pub fn new(default: RetryPolicy) -> Self {
        Self {
            default,
            per_kind: HashMap::new(),
        }
    }

    pub fn with_policy(mut self, kind: impl Into<TaskKind>, policy: RetryPolicy) -> Self {
        self.per_kind.insert(kind.into(), policy);
        self
    }

    pub fn for_kind(&self, kind: &TaskKind) -> &RetryPolicy {
        self.per_kind.get(kind).unwrap_or(&self.default)
    }

    pub fn default_policy(&self) -> &RetryPolicy {
        &self.default
    }

    pub fn validate(&self) -> Result<(), String> {
        self.default
            .validate()
            .map_err(|e| format!("default retry policy: {}", e))?;
        for (kind, policy) in &self.per_kind {
            policy
                .validate()
                .map_err(|e| format!("retry policy for {}: {}", kind, e))?;
        }
        Ok(())
    }
}
