//! Shared, `envconfig`-driven option types used by every producer's config
//! struct: millisecond durations, non-empty strings, and the batch/rotation
//! option groups common to more than one producer flavor.

use std::str::FromStr;
use std::time::Duration as StdDuration;

use envconfig::Envconfig;

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub StdDuration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;
        Ok(EnvMsDuration(StdDuration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

/// Shared by every producer flavor that batches (Ticker, Batched): how many
/// messages to accumulate before flushing, and how long to wait even if the
/// count threshold is never reached.
#[derive(Envconfig, Clone)]
pub struct BatchConfig {
    #[envconfig(default = "500")]
    pub max_count: usize,

    /// Clamped to `max_count` if configured higher; see
    /// [`crate::batch::MessageBatch::push`].
    #[envconfig(default = "500")]
    pub flush_count: usize,

    #[envconfig(default = "1000")]
    pub max_linger: EnvMsDuration,
}

/// Shared by every producer flavor that owns a rotatable writer resource
/// (File, Spooling).
#[derive(Envconfig, Clone)]
pub struct RotationConfig {
    /// 0 disables the size trigger.
    #[envconfig(default = "0")]
    pub max_size_bytes: u64,

    /// 0 disables the age trigger.
    #[envconfig(default = "0")]
    pub max_age_secs: u64,

    /// Hour of day (UTC, 0-23) to rotate at; unset disables the clock
    /// trigger.
    pub at_clock_hour: Option<u32>,

    /// Minute of the hour (UTC, 0-59) paired with `at_clock_hour`.
    #[envconfig(default = "0")]
    pub at_clock_minute: u32,
}

impl RotationConfig {
    pub fn to_policy(&self) -> crate::rotation::RotationPolicy {
        crate::rotation::RotationPolicy {
            max_size_bytes: (self.max_size_bytes > 0).then_some(self.max_size_bytes),
            max_age: (self.max_age_secs > 0).then(|| chrono::Duration::seconds(self.max_age_secs as i64)),
            at_clock_hour: self.at_clock_hour,
            at_clock_minute: self.at_clock_minute,
        }
    }
}

/// How long the coordinator waits for producers to drain on shutdown before
/// moving on regardless.
#[derive(Envconfig, Clone)]
pub struct ShutdownConfig {
    #[envconfig(default = "5000")]
    pub timeout: EnvMsDuration,
}
