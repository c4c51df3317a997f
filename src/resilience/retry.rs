use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_millis(5_000),
        }
    }
}

impl RetryPolicy {
    /// Un-jittered delay after the given 1-based attempt: `base * 2^(attempt-1)`, capped.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1_u32 << exponent)
            .min(self.max_delay)
    }

    /// Backoff with jitter drawn uniformly from `[delay / 2, delay]`.
    pub fn jittered_backoff(&self, attempt: u32) -> Duration {
        let delay = self.backoff(attempt);
        let delay_ms = delay.as_millis() as u64;
        let half = delay_ms / 2;
        let span = delay_ms - half;
        if span == 0 {
            return delay;
        }
        let mut bytes = [0_u8; 8];
        if getrandom::getrandom(&mut bytes).is_err() {
            return delay;
        }
        let sample = u64::from_le_bytes(bytes) % (span + 1);
        Duration::from_millis(half + sample)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(350));
        assert_eq!(policy.backoff(40), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_half_to_full_delay() {
        let policy = RetryPolicy::default();
        for attempt in 1..=4 {
            let delay = policy.backoff(attempt);
            for _ in 0..20 {
                let jittered = policy.jittered_backoff(attempt);
                assert!(jittered <= delay);
                assert!(jittered >= delay / 2);
            }
        }
    }
}
