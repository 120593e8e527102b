use std::time::Duration;

/// # Backoff Policy
///
/// Delays between reconnect attempts start at `base` and grow by `step` after
/// every failed attempt. When the next step would pass `ceiling`, the delay
/// starts over from `step`, so the delays form a bounded sawtooth
/// (2, 4, 6, 8, 10, 2, 4, ... seconds with the defaults).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first attempt after a loss.
    pub base: Duration,
    /// Added to the delay after every failed attempt.
    pub step: Duration,
    /// Largest delay used before wrapping.
    pub ceiling: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            step: Duration::from_secs(2),
            ceiling: Duration::from_secs(10),
        }
    }
}

/// Backoff state for one loss event. A new one is created every time the
/// connection drops, so earlier outages never lengthen later delays.
#[derive(Debug, Clone)]
pub struct ReconnectBackoff {
    policy: BackoffPolicy,
    interval: Duration,
}

impl ReconnectBackoff {
    /// Starts at `policy.base`.
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            interval: policy.base,
        }
    }

    /// The delay currently armed.
    pub fn delay(&self) -> Duration {
        self.interval
    }

    /// Records a failed attempt and returns the delay before the next one.
    pub fn on_failure(&mut self) -> Duration {
        let next = self.interval.saturating_add(self.policy.step);
        self.interval = if next > self.policy.ceiling {
            self.policy.step.min(self.policy.ceiling)
        } else {
            next
        };
        self.interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(delays: &[Duration]) -> Vec<u64> {
        delays.iter().map(Duration::as_secs).collect()
    }

    #[test]
    fn default_policy_is_a_bounded_sawtooth() {
        let mut backoff = ReconnectBackoff::new(BackoffPolicy::default());
        let mut delays = vec![backoff.delay()];
        for _ in 0..11 {
            delays.push(backoff.on_failure());
        }
        assert_eq!(secs(&delays), vec![2, 4, 6, 8, 10, 2, 4, 6, 8, 10, 2, 4]);
    }

    #[test]
    fn custom_policy_wraps_after_ceiling() {
        let mut backoff = ReconnectBackoff::new(BackoffPolicy {
            base: Duration::from_secs(1),
            step: Duration::from_secs(3),
            ceiling: Duration::from_secs(7),
        });
        let mut delays = vec![backoff.delay()];
        for _ in 0..4 {
            delays.push(backoff.on_failure());
        }
        // 1, 4, 7 reaches the ceiling, then the sawtooth restarts at the step.
        assert_eq!(secs(&delays), vec![1, 4, 7, 3, 6]);
    }

    #[test]
    fn unaligned_step_never_passes_ceiling() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(1),
            step: Duration::from_secs(3),
            ceiling: Duration::from_secs(8),
        };
        let mut backoff = ReconnectBackoff::new(policy);
        let mut delays = vec![backoff.delay()];
        for _ in 0..6 {
            delays.push(backoff.on_failure());
        }
        assert_eq!(secs(&delays), vec![1, 4, 7, 3, 6, 3, 6]);
        assert!(delays.iter().all(|d| *d <= policy.ceiling));
    }

    #[test]
    fn step_larger_than_ceiling_is_clamped() {
        let mut backoff = ReconnectBackoff::new(BackoffPolicy {
            base: Duration::from_secs(1),
            step: Duration::from_secs(20),
            ceiling: Duration::from_secs(5),
        });
        assert_eq!(backoff.on_failure(), Duration::from_secs(5));
        assert_eq!(backoff.on_failure(), Duration::from_secs(5));
    }

    #[test]
    fn fresh_state_per_loss_event() {
        let policy = BackoffPolicy::default();
        let mut first = ReconnectBackoff::new(policy);
        first.on_failure();
        first.on_failure();

        let second = ReconnectBackoff::new(policy);
        assert_eq!(second.delay(), Duration::from_secs(2));
    }
}
