//! Reconnect backoff
//!
//! Exponential delay between connect attempts with optional jitter.
//! Attempts are unlimited; the delay sequence restarts after a successful
//! connect.

use std::time::{Duration, Instant};

use rand::Rng;
use tracing::debug;

/// Backoff policy
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound for any delay
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// Randomise each delay by +-25%
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }
}

/// Reconnect statistics for one gateway
#[derive(Debug, Default, Clone)]
pub struct ReconnectStats {
    /// Connect attempts, successful or not
    pub total_attempts: u64,
    pub successful_connects: u64,
    pub failed_attempts: u64,
    pub last_connected: Option<Instant>,
}

/// Tracks consecutive failures and hands out the next delay
#[derive(Debug)]
pub struct ReconnectHelper {
    policy: ReconnectPolicy,
    consecutive_failures: u32,
    stats: ReconnectStats,
}

impl ReconnectHelper {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            consecutive_failures: 0,
            stats: ReconnectStats::default(),
        }
    }

    pub fn stats(&self) -> &ReconnectStats {
        &self.stats
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Connect succeeded: restart the delay sequence
    pub fn mark_connected(&mut self) {
        self.consecutive_failures = 0;
        self.stats.total_attempts += 1;
        self.stats.successful_connects += 1;
        self.stats.last_connected = Some(Instant::now());
    }

    /// Connect attempt failed
    pub fn mark_failed(&mut self) {
        self.stats.total_attempts += 1;
        self.stats.failed_attempts += 1;
    }

    /// Delay before the next attempt; each call counts as one more failure
    /// (a failed attempt or a dropped connection)
    pub fn next_delay(&mut self) -> Duration {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let delay = self.calculate_delay(self.consecutive_failures);
        debug!(
            "Backoff: failure #{} -> {:?}",
            self.consecutive_failures, delay
        );
        delay
    }

    /// `initial * multiplier^(failures - 1)`, capped at `max_delay`
    pub fn calculate_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
        let factor = self.policy.backoff_multiplier.powi(exponent);

        let max_ms = self.policy.max_delay.as_millis() as f64;
        let ms = self.policy.initial_delay.as_millis() as f64 * factor;
        let mut delay = if ms.is_finite() && ms < max_ms {
            Duration::from_millis(ms as u64)
        } else {
            self.policy.max_delay
        };

        if self.policy.jitter {
            let jitter_range = delay.as_millis() as f64 * 0.25;
            if jitter_range > 0.0 {
                let jitter = rand::thread_rng().gen_range(-jitter_range..jitter_range);
                let delay_ms = (delay.as_millis() as f64 + jitter).max(0.0);
                delay = Duration::from_millis(delay_ms as u64);
            }
        }

        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(initial_ms: u64, max_ms: u64, jitter: bool) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(initial_ms),
            max_delay: Duration::from_millis(max_ms),
            backoff_multiplier: 2.0,
            jitter,
        }
    }

    #[test]
    fn test_exponential_backoff() {
        let mut helper = ReconnectHelper::new(ReconnectPolicy::default());

        assert_eq!(helper.next_delay(), Duration::from_secs(1));
        assert_eq!(helper.next_delay(), Duration::from_secs(2));
        assert_eq!(helper.next_delay(), Duration::from_secs(4));
        assert_eq!(helper.next_delay(), Duration::from_secs(8));
        assert_eq!(helper.consecutive_failures(), 4);
    }

    #[test]
    fn test_max_delay_cap() {
        let helper = ReconnectHelper::new(ReconnectPolicy::default());

        assert_eq!(helper.calculate_delay(6), Duration::from_secs(32));
        assert_eq!(helper.calculate_delay(7), Duration::from_secs(60));
        assert_eq!(helper.calculate_delay(500), Duration::from_secs(60));
        assert_eq!(helper.calculate_delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn test_success_resets_sequence() {
        let mut helper = ReconnectHelper::new(policy(100, 10_000, false));
        helper.mark_failed();
        helper.next_delay();
        helper.mark_failed();
        assert_eq!(helper.next_delay(), Duration::from_millis(200));

        helper.mark_connected();
        assert_eq!(helper.consecutive_failures(), 0);
        assert_eq!(helper.next_delay(), Duration::from_millis(100));

        let stats = helper.stats();
        assert_eq!(stats.total_attempts, 3);
        assert_eq!(stats.failed_attempts, 2);
        assert_eq!(stats.successful_connects, 1);
        assert!(stats.last_connected.is_some());
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let helper = ReconnectHelper::new(policy(1000, 60_000, true));
        for _ in 0..100 {
            let delay = helper.calculate_delay(2);
            assert!(delay >= Duration::from_millis(1500));
            assert!(delay <= Duration::from_millis(2500));
        }
    }
}
