use super::policy::RetryPolicy;
use crate::worker::HandlerFailure;
use std::time::Duration;

/// What to do with a task after a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Redeliver after `delay`; `attempt` is the number the next try will carry
    Retry { attempt: u32, delay: Duration },
    DeadLetter { reason: String },
}

/// Backoff delay after `attempt` failed attempts, jitter drawn at random
pub fn compute_delay(attempt: u32, policy: &RetryPolicy) -> Duration {
    let unit = rand::random::<f64>() * 2.0 - 1.0;
    compute_delay_with_jitter(attempt, policy, unit)
}

/// Backoff delay with the jitter draw supplied by the caller.
///
/// `unit` is clamped to [-1, 1]; the result is
/// `min(max_delay, base * multiplier^(attempt-1)) * (1 + unit * jitter_fraction)`,
/// never negative.
pub fn compute_delay_with_jitter(attempt: u32, policy: &RetryPolicy, unit: f64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    let raw = policy.base_delay_secs * policy.multiplier.powi(exponent);
    let capped = if raw.is_finite() {
        raw.min(policy.max_delay_secs)
    } else {
        policy.max_delay_secs
    };

    let jitter = capped * policy.jitter_fraction * unit.clamp(-1.0, 1.0);
    let secs = (capped + jitter).max(0.0);

    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Retry or dead-letter, given the attempts already made (including the one
/// that just failed)
pub fn decide(attempts_made: u32, failure: &HandlerFailure, policy: &RetryPolicy) -> RetryDecision {
    if !failure.is_recoverable() {
        return RetryDecision::DeadLetter {
            reason: failure.to_string(),
        };
    }

    if attempts_made >= policy.max_attempts {
        return RetryDecision::DeadLetter {
            reason: format!(
                "retries exhausted after {} attempts: {}",
                attempts_made, failure
            ),
        };
    }

    RetryDecision::Retry {
        attempt: attempts_made + 1,
        delay: compute_delay(attempts_made, policy),
    }
}
