//! Rotation policy for writer-like producer resources (files, spool
//! segments): roll over on size, age, or wall-clock boundary, whichever
//! comes first.

use chrono::{DateTime, Utc};

/// A resource a producer writes to and occasionally rotates, such as an
/// open file handle or the current spool segment.
pub trait BatchedWriter: Send {
    /// Stable identifier for logging and metrics (e.g. a file path).
    fn name(&self) -> &str;
    /// Current size in bytes, used by the size-based rotation trigger.
    fn size(&self) -> u64;
    /// Whether the underlying resource can still be written to (e.g. the
    /// file has not been deleted out from under the producer).
    fn is_accessible(&self) -> bool;
}

#[derive(Debug, Clone, Copy)]
pub struct RotationPolicy {
    pub max_size_bytes: Option<u64>,
    pub max_age: Option<chrono::Duration>,
    /// Rotate at this hour-of-day boundary (UTC), e.g. `Some(0)` for daily
    /// rotation at midnight. Paired with `at_clock_minute` (default 0) for
    /// the full `(atHour, atMinute)` wall-clock point.
    pub at_clock_hour: Option<u32>,
    pub at_clock_minute: u32,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            max_size_bytes: None,
            max_age: None,
            at_clock_hour: None,
            at_clock_minute: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationReason {
    Size,
    Age,
    Clock,
    Inaccessible,
}

impl RotationPolicy {
    /// Returns the first triggered reason to rotate, if any. `opened_at` is
    /// when the current resource was opened; `now` lets tests drive the
    /// clock deterministically.
    pub fn should_rotate(
        &self,
        writer: &dyn BatchedWriter,
        opened_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Option<RotationReason> {
        if !writer.is_accessible() {
            return Some(RotationReason::Inaccessible);
        }

        if let Some(max_size) = self.max_size_bytes {
            if writer.size() >= max_size {
                return Some(RotationReason::Size);
            }
        }

        if let Some(max_age) = self.max_age {
            if now - opened_at >= max_age {
                return Some(RotationReason::Age);
            }
        }

        if let Some(hour) = self.at_clock_hour {
            let scheduled_today = now
                .date_naive()
                .and_hms_opt(hour.min(23), self.at_clock_minute.min(59), 0)
                .expect("hour/minute clamped to valid ranges")
                .and_utc();
            // The most recent scheduled instant at or before `now`: today's if
            // we've already passed it, otherwise yesterday's.
            let most_recent_scheduled = if now >= scheduled_today {
                scheduled_today
            } else {
                scheduled_today - chrono::Duration::days(1)
            };

            if opened_at < most_recent_scheduled {
                return Some(RotationReason::Clock);
            }
        }

        None
    }
}
