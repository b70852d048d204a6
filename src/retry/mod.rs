//! Retry/backoff: per-kind policies, delay computation and the retry vs
//! dead-letter decision the worker pool applies after each failed attempt.

pub mod backoff;
pub mod policy;

#[cfg(test)]
mod tests;

pub use backoff::{RetryDecision, compute_delay, compute_delay_with_jitter, decide};
pub use policy::{RetryPolicies, RetryPolicy};
