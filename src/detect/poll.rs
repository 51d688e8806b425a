//! Completion poll budget.

use std::time::Duration;

use super::EvidenceLabel;
use crate::config::Timings;

/// Lower bound of the ceiling applied after weak evidence.
pub const WEAK_CEILING_MIN: Duration = Duration::from_secs(30);
/// Upper bound of the ceiling applied after weak evidence.
pub const WEAK_CEILING_MAX: Duration = Duration::from_secs(60);

/// Bounded completion loop state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PollState {
    /// Time spent polling so far.
    pub elapsed: Duration,
    /// Total budget.
    pub ceiling: Duration,
    /// Pause between probes.
    pub interval: Duration,
}

impl PollState {
    /// Budget for the given quick-check label. Weak evidence clamps the
    /// ceiling into `[WEAK_CEILING_MIN, WEAK_CEILING_MAX]`, never above the
    /// full ceiling.
    #[must_use]
    pub fn for_evidence(label: EvidenceLabel, timings: &Timings) -> Self {
        let ceiling = if label.is_weak() {
            timings
                .weak_ceiling
                .clamp(WEAK_CEILING_MIN, WEAK_CEILING_MAX)
                .min(timings.completion_ceiling)
        } else {
            timings.completion_ceiling
        };
        Self {
            elapsed: Duration::ZERO,
            ceiling,
            interval: timings.completion_interval,
        }
    }

    /// Whether the budget is spent.
    #[must_use]
    pub fn exhausted(&self) -> bool {
        self.elapsed >= self.ceiling
    }

    /// Records elapsed wall time.
    pub fn record(&mut self, elapsed: Duration) {
        self.elapsed = elapsed;
    }

    /// Pause before the next probe, trimmed so the loop does not overshoot
    /// its ceiling.
    #[must_use]
    pub fn next_pause(&self) -> Duration {
        self.interval.min(self.ceiling.saturating_sub(self.elapsed))
    }
}
