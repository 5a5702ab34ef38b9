use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Shape of the delay curve between task retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Constant delay: `base_delay` every time.
    None,
    /// `base_delay * attempt`.
    Linear,
    /// `base_delay * 2^(attempt - 1)`.
    Exponential,
}

impl fmt::Display for BackoffKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Linear => "linear",
            Self::Exponential => "exponential",
        };
        f.write_str(s)
    }
}

impl FromStr for BackoffKind {
    type Err = BackoffKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "linear" => Ok(Self::Linear),
            "exponential" => Ok(Self::Exponential),
            other => Err(BackoffKindParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`BackoffKind`] string.
#[derive(Debug, Clone)]
pub struct BackoffKindParseError(pub String);

impl fmt::Display for BackoffKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid backoff kind: {:?}", self.0)
    }
}

impl std::error::Error for BackoffKindParseError {}

/// Retry policy for a single task.
///
/// `max_attempts` counts total executions, so `max_attempts = 1` means no
/// retry at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            backoff: BackoffKind::None,
            base_delay: Duration::ZERO,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, backoff: BackoffKind, base_delay: Duration) -> Self {
        Self {
            // A policy of zero attempts would never run the task.
            max_attempts: max_attempts.max(1),
            backoff,
            base_delay,
        }
    }

    /// Delay to sleep after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self.backoff {
            BackoffKind::None => self.base_delay,
            BackoffKind::Linear => self.base_delay.saturating_mul(attempt),
            BackoffKind::Exponential => {
                let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
                self.base_delay.saturating_mul(factor)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_kind_roundtrip() {
        for k in [BackoffKind::None, BackoffKind::Linear, BackoffKind::Exponential] {
            assert_eq!(k.to_string().parse::<BackoffKind>().unwrap(), k);
        }
        assert!("fibonacci".parse::<BackoffKind>().is_err());
    }

    #[test]
    fn default_policy_is_single_attempt() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_attempts, 1);
        assert_eq!(p.delay_for(1), Duration::ZERO);
    }

    #[test]
    fn zero_attempts_clamped_to_one() {
        let p = RetryPolicy::new(0, BackoffKind::None, Duration::from_millis(10));
        assert_eq!(p.max_attempts, 1);
    }

    #[test]
    fn none_backoff_is_constant() {
        let p = RetryPolicy::new(5, BackoffKind::None, Duration::from_millis(20));
        assert_eq!(p.delay_for(1), Duration::from_millis(20));
        assert_eq!(p.delay_for(4), Duration::from_millis(20));
    }

    #[test]
    fn linear_backoff_scales_with_attempt() {
        let p = RetryPolicy::new(5, BackoffKind::Linear, Duration::from_millis(20));
        assert_eq!(p.delay_for(1), Duration::from_millis(20));
        assert_eq!(p.delay_for(2), Duration::from_millis(40));
        assert_eq!(p.delay_for(3), Duration::from_millis(60));
    }

    #[test]
    fn exponential_backoff_doubles() {
        let p = RetryPolicy::new(5, BackoffKind::Exponential, Duration::from_millis(10));
        assert_eq!(p.delay_for(1), Duration::from_millis(10));
        assert_eq!(p.delay_for(2), Duration::from_millis(20));
        assert_eq!(p.delay_for(3), Duration::from_millis(40));
        assert_eq!(p.delay_for(4), Duration::from_millis(80));
    }

    #[test]
    fn exponential_backoff_saturates() {
        let p = RetryPolicy::new(200, BackoffKind::Exponential, Duration::from_secs(1));
        // Shift overflow must saturate rather than panic.
        let d = p.delay_for(100);
        assert!(d >= Duration::from_secs(1));
    }
}
