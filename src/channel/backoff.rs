use std::time::Duration;

use rand::Rng;

/// Exponents beyond this already exceed any sensible `max_delay`.
const MAX_EXPONENT: u32 = 32;

/// How the push channel paces reconnection attempts.
///
/// Delays start at `min_delay`, grow by `grow_factor` per failed attempt, get
/// up to `jitter` added at random, and never exceed `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub grow_factor: f64,
    pub jitter: Duration,
    /// How long a single connection attempt may take before it counts as failed.
    pub connect_timeout: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            grow_factor: 1.3,
            jitter: Duration::from_millis(4000),
            connect_timeout: Duration::from_millis(4000),
        }
    }
}

/// Delay sequence for consecutive reconnection attempts.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Start over after a connection succeeded.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn next_delay(&mut self) -> Duration {
        let exponent = self.attempt.min(MAX_EXPONENT) as i32;
        self.attempt = self.attempt.saturating_add(1);

        let growth = self.policy.grow_factor.max(1.0).powi(exponent);
        let base = self.policy.min_delay.as_secs_f64() * growth;
        let jitter = if self.policy.jitter.is_zero() {
            0.0
        } else {
            rand::rng().random_range(0.0..=self.policy.jitter.as_secs_f64())
        };

        let capped = (base + jitter).min(self.policy.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter_ms: u64) -> ReconnectPolicy {
        ReconnectPolicy {
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            grow_factor: 2.0,
            jitter: Duration::from_millis(jitter_ms),
            connect_timeout: Duration::from_millis(500),
        }
    }

    fn millis(d: Duration) -> u128 {
        d.as_millis()
    }

    #[test]
    fn grows_geometrically_until_the_cap() {
        let mut backoff = Backoff::new(policy(0));
        let delays: Vec<_> = (0..6).map(|_| millis(backoff.next_delay())).collect();
        assert_eq!(delays, [100, 200, 400, 800, 1000, 1000]);
        assert_eq!(backoff.attempt(), 6);
    }

    #[test]
    fn reset_starts_from_the_minimum_again() {
        let mut backoff = Backoff::new(policy(0));
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(millis(backoff.next_delay()), 100);
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut backoff = Backoff::new(policy(50));
        for _ in 0..20 {
            backoff.reset();
            let first = backoff.next_delay();
            assert!(first >= Duration::from_millis(100));
            assert!(first <= Duration::from_millis(150));
        }
        for _ in 0..40 {
            assert!(backoff.next_delay() <= Duration::from_millis(1000));
        }
    }

    #[test]
    fn never_shrinks_with_a_factor_below_one() {
        let mut backoff = Backoff::new(ReconnectPolicy {
            grow_factor: 0.5,
            ..policy(0)
        });
        assert_eq!(millis(backoff.next_delay()), 100);
        assert_eq!(millis(backoff.next_delay()), 100);
    }

    #[test]
    fn default_matches_documented_values() {
        let p = ReconnectPolicy::default();
        assert_eq!(p.min_delay, Duration::from_secs(1));
        assert_eq!(p.max_delay, Duration::from_secs(10));
        assert_eq!(p.connect_timeout, Duration::from_secs(4));
    }
}
