use std::time::Duration;

use crate::{ObsError, Result};

/// Exponential backoff applied to retryable server errors.
///
/// The delay before attempt `i + 1` (0-indexed) is
/// `initial_sleep * growth_factor^i`; no delay follows the final attempt.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BackOff {
    retries: usize,
    initial_sleep: Duration,
    growth_factor: f64,
}

impl BackOff {
    /// Builds a backoff policy.
    ///
    /// `retries` is the total attempt budget and must be at least 1; the
    /// growth factor must be finite and strictly positive.
    pub fn new(retries: usize, initial_sleep: Duration, growth_factor: f64) -> Result<Self> {
        if retries == 0 {
            return Err(ObsError::Config(
                "backoff needs at least one attempt".to_owned(),
            ));
        }
        if !growth_factor.is_finite() || growth_factor <= 0.0 {
            return Err(ObsError::Config(format!(
                "backoff growth factor must be positive, got {growth_factor}"
            )));
        }
        Ok(Self {
            retries,
            initial_sleep,
            growth_factor,
        })
    }

    pub fn retries(&self) -> usize {
        self.retries
    }

    pub fn initial_sleep(&self) -> Duration {
        self.initial_sleep
    }

    pub fn growth_factor(&self) -> f64 {
        self.growth_factor
    }

    /// Delay to wait after the failed attempt `attempt` (0-indexed).
    pub fn delay_after(&self, attempt: usize) -> Duration {
        if self.initial_sleep.is_zero() {
            return Duration::ZERO;
        }
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_sleep.as_secs_f64() * self.growth_factor.powi(exp);
        Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
    }
}

impl Default for BackOff {
    fn default() -> Self {
        Self {
            retries: 5,
            initial_sleep: Duration::from_secs(1),
            growth_factor: 2.0,
        }
    }
}

/// Configures per-attempt timeout and the default retry behavior.
#[derive(Clone, Debug, PartialEq)]
pub struct ClientOptions {
    /// Per-attempt timeout in milliseconds.
    pub timeout_ms: u64,
    /// Backoff used by requests that do not carry their own.
    pub backoff: BackOff,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout_ms: 60_000,
            backoff: BackOff::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::BackOff;

    #[test]
    fn default_backoff_doubles_from_one_second() {
        let backoff = BackOff::default();
        let delays: Vec<_> = (0..4).map(|i| backoff.delay_after(i)).collect();
        assert_eq!(
            delays,
            [1, 2, 4, 8].map(Duration::from_secs).to_vec(),
            "delays must follow initial_sleep * factor^i"
        );
        assert_eq!(backoff.retries(), 5);
    }

    #[test]
    fn zero_initial_sleep_never_waits() {
        let backoff = BackOff::new(3, Duration::ZERO, 3.0).expect("valid backoff");
        assert_eq!(backoff.delay_after(2), Duration::ZERO);
    }

    #[test]
    fn rejects_invalid_parameters() {
        assert!(BackOff::new(0, Duration::from_secs(1), 2.0).is_err());
        assert!(BackOff::new(1, Duration::from_secs(1), 0.0).is_err());
        assert!(BackOff::new(1, Duration::from_secs(1), f64::NAN).is_err());
    }

    #[test]
    fn huge_exponent_saturates_instead_of_panicking() {
        let backoff = BackOff::new(2, Duration::from_secs(1), 10.0).expect("valid backoff");
        assert_eq!(backoff.delay_after(10_000), Duration::MAX);
    }
}
