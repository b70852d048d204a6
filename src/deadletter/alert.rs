use crate::task::TaskKind;
use dashmap::DashMap;

#[derive(Debug, Default, Clone, Copy)]
struct Streak {
    count: u32,
    alerted: bool,
}

/// Counts consecutive dead-letters per kind and fires once per streak.
///
/// A completion of the kind ends the streak and re-arms the alert. A
/// threshold of zero disables alerting.
#[derive(Debug, Default)]
pub struct AlertTracker {
    threshold: u32,
    streaks: DashMap<TaskKind, Streak>,
}

impl AlertTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            streaks: DashMap::new(),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    /// Count a dead-letter; returns the streak length when an alert is due
    pub fn record_dead_letter(&self, kind: &TaskKind) -> Option<u32> {
        if self.threshold == 0 {
            return None;
        }

        let mut streak = self.streaks.entry(kind.clone()).or_default();
        streak.count = streak.count.saturating_add(1);

        if !streak.alerted && streak.count >= self.threshold {
            streak.alerted = true;
            Some(streak.count)
        } else {
            None
        }
    }

    pub fn record_success(&self, kind: &TaskKind) {
        self.streaks.remove(kind);
    }

    pub fn streak(&self, kind: &TaskKind) -> u32 {
        self.streaks.get(kind).map(|s| s.count).unwrap_or(0)
    }
}
