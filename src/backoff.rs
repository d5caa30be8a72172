//! Backoff applied by the gate loop after a store round trip fails.
//!
//! Attempt semantics: attempt `1` is the first consecutive failure. Attempt `0` means the
//! store is healthy and yields no delay. Delays saturate at [`MAX_BACKOFF`].
//!
//! ```rust
//! use std::time::Duration;
//! use lmqueue::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(50))
//!     .with_max(Duration::from_secs(1))
//!     .unwrap();
//! assert_eq!(backoff.delay(0), Duration::ZERO);
//! assert_eq!(backoff.delay(1), Duration::from_millis(50));
//! assert_eq!(backoff.delay(3), Duration::from_millis(200));
//! assert_eq!(backoff.delay(10), Duration::from_secs(1));
//! ```

use std::time::Duration;

use crate::error::ConfigError;

/// Upper bound on any computed delay (one hour).
pub const MAX_BACKOFF: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Constant,
    Exponential,
}

/// Delay schedule for consecutive store failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    shape: Shape,
    base: Duration,
    max: Option<Duration>,
}

impl Backoff {
    /// Same delay after every failure.
    pub fn constant(delay: Duration) -> Self {
        Self { shape: Shape::Constant, base: delay, max: None }
    }

    /// `base * 2^(attempt - 1)`.
    pub fn exponential(base: Duration) -> Self {
        Self { shape: Shape::Exponential, base, max: None }
    }

    /// Cap exponential growth. Rejects a zero cap or a cap below `base`.
    pub fn with_max(mut self, max: Duration) -> Result<Self, ConfigError> {
        if max.is_zero() {
            return Err(ConfigError::Zero { field: "backoff max" });
        }
        if max < self.base {
            return Err(ConfigError::TooShort {
                field: "backoff max",
                min_ms: u64::try_from(self.base.as_millis()).unwrap_or(u64::MAX),
            });
        }
        self.max = Some(max);
        Ok(self)
    }

    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let raw = match self.shape {
            Shape::Constant => self.base,
            Shape::Exponential => {
                let exponent = attempt.saturating_sub(1).min(u32::MAX as usize) as u32;
                let nanos = self.base.as_nanos().saturating_mul(2u128.saturating_pow(exponent));
                Duration::from_nanos(nanos.min(MAX_BACKOFF.as_nanos()) as u64)
            }
        };
        self.max.map_or(raw, |m| raw.min(m)).min(MAX_BACKOFF)
    }
}

impl Default for Backoff {
    /// 100ms doubling up to 5s.
    fn default() -> Self {
        Self {
            shape: Shape::Exponential,
            base: Duration::from_millis(100),
            max: Some(Duration::from_secs(5)),
        }
    }
}
