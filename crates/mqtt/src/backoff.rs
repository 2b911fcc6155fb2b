//! Bounded exponential backoff for broker reconnection.
//!
//! After every failed connection attempt the kernel asks the backoff for the
//! next pause. Pauses grow geometrically and saturate at a ceiling:
//!
//! ```text
//! delay[n] = min(min_delay * multiplier^(n-1), max_delay)
//! ```
//!
//! With the defaults (1 s, x2, 30 s) the schedule is 1, 2, 4, 8, 16, 30, 30, ...
//! A successful CONNACK resets the schedule to the minimum.
//!
//! The number of attempts is unlimited unless a limit is configured; a limit
//! of `0` in configuration also means unlimited.
//!
//! # Examples
//!
//! ```
//! use std::time::Duration;
//! use stacklight_mqtt::Backoff;
//!
//! let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30), 2.0);
//! assert_eq!(backoff.next_sleep().unwrap(), Duration::from_secs(1));
//! assert_eq!(backoff.next_sleep().unwrap(), Duration::from_secs(2));
//!
//! backoff.reset();
//! assert_eq!(backoff.next_sleep().unwrap(), Duration::from_secs(1));
//! ```

use std::time::Duration;

use thiserror::Error;

use crate::config::Config;

/// Returned when a configured attempt limit has been used up.
#[derive(Debug, Error)]
pub enum BackoffError {
    /// The `u32` is the configured limit.
    #[error("Maximum number of attempts exceeded: {0}")]
    MaxAttemptLimitError(u32),
}

/// Exponential backoff controller.
///
/// Not shared between tasks; the connection kernel owns one and drives it
/// from its event loop.
#[derive(Debug, Clone)]
pub struct Backoff {
    min_delay: Duration,
    current_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    attempt: u32,
    /// `None` retries forever.
    max_attempts: Option<u32>,
}

impl Backoff {
    /// Creates an unlimited backoff.
    ///
    /// A `multiplier` below `1.0` is treated as `1.0` (constant delay), and a
    /// `max` smaller than `min` is raised to `min`.
    pub fn new(min: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            min_delay: min,
            current_delay: min,
            max_delay: max.max(min),
            multiplier: multiplier.max(1.0),
            attempt: 0,
            max_attempts: None,
        }
    }

    /// Builds the schedule described by the transport configuration.
    pub fn from_config(config: &Config) -> Self {
        let mut backoff = Self::new(
            Duration::from_secs(config.reconnect_min_delay),
            Duration::from_secs(config.reconnect_max_delay),
            config.reconnect_multiplier,
        );
        if config.max_reconnect_attempts > 0 {
            backoff.set_max_attempts(config.max_reconnect_attempts);
        }
        backoff
    }

    /// Caps the number of attempts. After `max` pauses, `next_sleep` fails.
    pub fn set_max_attempts(&mut self, max: u32) {
        self.max_attempts = Some(max);
    }

    /// Restarts the schedule at the minimum delay.
    pub fn reset(&mut self) {
        self.current_delay = self.min_delay;
        self.attempt = 0;
    }

    /// Returns the pause before the next attempt and advances the schedule.
    ///
    /// # Errors
    ///
    /// `BackoffError::MaxAttemptLimitError` once a configured limit is used up.
    pub fn next_sleep(&mut self) -> Result<Duration, BackoffError> {
        if let Some(limit) = self.max_attempts {
            if self.attempt >= limit {
                return Err(BackoffError::MaxAttemptLimitError(limit));
            }
        }
        self.attempt = self.attempt.saturating_add(1);

        let sleep = self.current_delay;
        let next = self.current_delay.as_secs_f64() * self.multiplier;
        self.current_delay = Duration::from_secs_f64(next).min(self.max_delay);

        Ok(sleep)
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

}

impl Default for Backoff {
    /// 1 s doubling up to 30 s, unlimited attempts.
    fn default() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(30), 2.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_default_schedule() {
        let mut backoff = Backoff::default();
        let delays: Vec<u64> = (0..8)
            .map(|_| backoff.next_sleep().unwrap().as_secs())
            .collect();

        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30]);
    }

    #[test]
    fn test_backoff_is_unlimited_by_default() {
        let mut backoff = Backoff::default();
        for _ in 0..10_000 {
            assert!(backoff.next_sleep().is_ok());
        }
        assert_eq!(backoff.next_sleep().unwrap(), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_reset() {
        let mut backoff = Backoff::default();

        backoff.set_max_attempts(2);
        backoff.next_sleep().unwrap();
        backoff.next_sleep().unwrap();
        assert!(backoff.next_sleep().is_err());

        backoff.reset();
        assert_eq!(backoff.next_sleep().unwrap(), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_max_attempts_exceeded() {
        let mut backoff = Backoff::default();
        backoff.set_max_attempts(2);

        assert!(backoff.next_sleep().is_ok());
        assert!(backoff.next_sleep().is_ok());

        match backoff.next_sleep() {
            Err(BackoffError::MaxAttemptLimitError(max)) => assert_eq!(max, 2),
            other => panic!("expected attempt limit error, got {other:?}"),
        }
    }

    #[test]
    fn test_backoff_degenerate_parameters() {
        let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(1), 0.5);

        assert_eq!(backoff.max_delay(), Duration::from_secs(5));
        assert_eq!(backoff.next_sleep().unwrap(), Duration::from_secs(5));
        assert_eq!(backoff.next_sleep().unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_from_config_zero_means_unlimited() {
        let config = Config {
            reconnect_min_delay: 2,
            reconnect_max_delay: 10,
            reconnect_multiplier: 3.0,
            max_reconnect_attempts: 0,
            ..Default::default()
        };
        let mut backoff = Backoff::from_config(&config);

        assert_eq!(backoff.next_sleep().unwrap(), Duration::from_secs(2));
        assert_eq!(backoff.next_sleep().unwrap(), Duration::from_secs(6));
        assert_eq!(backoff.next_sleep().unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_from_config_with_limit() {
        let config = Config {
            max_reconnect_attempts: 3,
            ..Default::default()
        };
        let mut backoff = Backoff::from_config(&config);
        for _ in 0..3 {
            assert!(backoff.next_sleep().is_ok());
        }
        assert!(matches!(
            backoff.next_sleep(),
            Err(BackoffError::MaxAttemptLimitError(3))
        ));
    }
}
