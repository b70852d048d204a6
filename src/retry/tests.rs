use super::*;
use crate::task::TaskKind;
use crate::worker::HandlerFailure;
use std::time::Duration;

fn no_jitter() -> RetryPolicy {
    RetryPolicy::default().with_jitter(0.0)
}

#[test]
fn test_default_policy() {
    let policy = RetryPolicy::default();
    assert_eq!(policy.max_attempts, 5);
    assert_eq!(policy.base_delay_secs, 1.0);
    assert_eq!(policy.multiplier, 2.0);
    assert_eq!(policy.max_delay_secs, 300.0);
    assert_eq!(policy.jitter_fraction, 0.1);
    assert!(policy.validate().is_ok());
}

#[test]
fn test_exponential_growth_and_cap() {
    let policy = no_jitter();

    assert_eq!(compute_delay(1, &policy), Duration::from_secs(1));
    assert_eq!(compute_delay(2, &policy), Duration::from_secs(2));
    assert_eq!(compute_delay(3, &policy), Duration::from_secs(4));
    assert_eq!(compute_delay(9, &policy), Duration::from_secs(256));
    assert_eq!(compute_delay(10, &policy), Duration::from_secs(300));
    assert_eq!(compute_delay(500, &policy), Duration::from_secs(300));
    assert_eq!(compute_delay(u32::MAX, &policy), Duration::from_secs(300));
}

#[test]
fn test_delay_is_monotonic_without_jitter() {
    let policy = no_jitter().with_delays(0.5, 1.7, 120.0);

    let mut previous = Duration::ZERO;
    for attempt in 1..=40 {
        let delay = compute_delay(attempt, &policy);
        assert!(delay >= previous, "attempt {} went backwards", attempt);
        assert!(delay <= Duration::from_secs(120));
        previous = delay;
    }
}

#[test]
fn test_jitter_band() {
    let policy = RetryPolicy::default();

    let low = compute_delay_with_jitter(3, &policy, -1.0);
    let high = compute_delay_with_jitter(3, &policy, 1.0);
    let mid = compute_delay_with_jitter(3, &policy, 0.0);

    assert_eq!(mid, Duration::from_secs(4));
    assert!((low.as_secs_f64() - 3.6).abs() < 1e-6);
    assert!((high.as_secs_f64() - 4.4).abs() < 1e-6);

    // Out of range draws are clamped
    assert_eq!(compute_delay_with_jitter(3, &policy, 7.0), high);

    for _ in 0..200 {
        let delay = compute_delay(3, &policy);
        assert!(delay >= low && delay <= high);
    }
}

#[test]
fn test_delay_never_negative() {
    let policy = RetryPolicy::default()
        .with_delays(0.0, 1.0, 0.0)
        .with_jitter(1.0);
    assert_eq!(compute_delay_with_jitter(1, &policy, -1.0), Duration::ZERO);
}

#[test]
fn test_decide() {
    let policy = RetryPolicy::new(3).with_jitter(0.0);
    let flaky = HandlerFailure::recoverable("upstream 503");

    assert_eq!(
        decide(1, &flaky, &policy),
        RetryDecision::Retry {
            attempt: 2,
            delay: Duration::from_secs(1)
        }
    );
    assert_eq!(
        decide(2, &flaky, &policy),
        RetryDecision::Retry {
            attempt: 3,
            delay: Duration::from_secs(2)
        }
    );
    match decide(3, &flaky, &policy) {
        RetryDecision::DeadLetter { reason } => {
            assert!(reason.contains("3 attempts"));
            assert!(reason.contains("upstream 503"));
        }
        other => panic!("expected dead letter, got {:?}", other),
    }

    let timeout = HandlerFailure::Timeout(Duration::from_secs(30));
    assert!(matches!(
        decide(1, &timeout, &policy),
        RetryDecision::Retry { .. }
    ));

    let fatal = HandlerFailure::non_recoverable("payload missing rubric");
    assert_eq!(
        decide(1, &fatal, &policy),
        RetryDecision::DeadLetter {
            reason: "payload missing rubric".to_string()
        }
    );
}

#[test]
fn test_single_attempt_policy_dead_letters_first_failure() {
    let policy = RetryPolicy::new(1);
    assert!(matches!(
        decide(1, &HandlerFailure::recoverable("nope"), &policy),
        RetryDecision::DeadLetter { .. }
    ));
}

#[test]
fn test_policy_lookup_falls_back_to_default() {
    let policies = RetryPolicies::new(RetryPolicy::default())
        .with_policy("grade", RetryPolicy::new(3));

    assert_eq!(policies.for_kind(&TaskKind::new("grade")).max_attempts, 3);
    assert_eq!(
        policies.for_kind(&TaskKind::new("generate_paper")).max_attempts,
        5
    );
    assert!(policies.validate().is_ok());
}

#[test]
fn test_policy_validation() {
    assert!(RetryPolicy::new(0).validate().is_err());
    assert!(
        RetryPolicy::default()
            .with_delays(1.0, 0.5, 10.0)
            .validate()
            .is_err()
    );
    assert!(
        RetryPolicy::default()
            .with_delays(-1.0, 2.0, 10.0)
            .validate()
            .is_err()
    );
    assert!(RetryPolicy::default().with_jitter(1.5).validate().is_err());

    let policies = RetryPolicies::default().with_policy("grade", RetryPolicy::new(0));
    let err = policies.validate().unwrap_err();
    assert!(err.contains("grade"));
}
