//! Backoff policies applied between retry attempts of a failed job.
//!
//! A policy only matters for jobs whose `attempts_max` is greater than one.
//! The delay is a function of how many attempts have already been made, so
//! the first retry (after attempt 1) waits `backoff(1)`, the second waits
//! `backoff(2)`, and so on.
//!
//! # Examples
//!
//! ```rust
//! use ticket_queue::retry::BackoffPolicy;
//! use std::time::Duration;
//!
//! let policy = BackoffPolicy::exponential(Duration::from_secs(3));
//!
//! // 3s, 6s, 12s...
//! assert_eq!(policy.delay_for(1), Duration::from_secs(3));
//! assert_eq!(policy.delay_for(2), Duration::from_secs(6));
//! assert_eq!(policy.delay_for(3), Duration::from_secs(12));
//! ```

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound on the exponent so a large attempt count cannot overflow.
const MAX_EXPONENT: u32 = 30;

/// How long a failed job waits before it becomes eligible again.
///
/// Serialized with an explicit `type` tag and millisecond delays so the
/// stored form stays readable in the job table:
///
/// ```json
/// {"type": "exponential", "delay_ms": 3000}
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// The same delay before every retry.
    Fixed {
        #[serde(rename = "delay_ms", with = "millis")]
        delay: Duration,
    },

    /// `base * 2^(attempts_made - 1)`, optionally capped.
    Exponential {
        #[serde(rename = "delay_ms", with = "millis")]
        base: Duration,
        #[serde(
            rename = "max_delay_ms",
            default,
            skip_serializing_if = "Option::is_none",
            with = "millis_opt"
        )]
        max_delay: Option<Duration>,
    },
}

impl BackoffPolicy {
    pub fn fixed(delay: Duration) -> Self {
        BackoffPolicy::Fixed { delay }
    }

    pub fn exponential(base: Duration) -> Self {
        BackoffPolicy::Exponential {
            base,
            max_delay: None,
        }
    }

    pub fn exponential_capped(base: Duration, max_delay: Duration) -> Self {
        BackoffPolicy::Exponential {
            base,
            max_delay: Some(max_delay),
        }
    }

    /// Delay before the next attempt, given the number of attempts already made.
    ///
    /// `attempts_made` is 1-based; zero is treated as one.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        match self {
            BackoffPolicy::Fixed { delay } => *delay,
            BackoffPolicy::Exponential { base, max_delay } => {
                let exponent = attempts_made.saturating_sub(1).min(MAX_EXPONENT);
                let delay = base.saturating_mul(1u32 << exponent);
                match max_delay {
                    Some(max) => delay.min(*max),
                    None => delay,
                }
            }
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod millis_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}
