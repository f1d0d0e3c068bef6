//! Calendar-aligned time bucketing for rolling counters
//!
//! Every timestamp maps to a monotonically increasing window number for a
//! given [`WindowWidth`]. Windows are aligned to the Unix epoch
//! (1970-01-01T00:00:00Z): fixed-duration units divide the millisecond
//! timestamp, calendar units (month, year) count calendar months or years.
//!
//! ```text
//!   epoch                     t
//!     |----|----|----|----|---+|----|
//!     0    1    2    3    4    5        window_number(t, 1) == 4
//!                         ^
//!                         start_timestamp(4, 1)
//! ```
//!
//! # Example
//!
//! ```rust
//! use cascade_store::window::{WindowTimeUnit, WindowWidth};
//!
//! let width = WindowWidth::new(15, WindowTimeUnit::Minute).unwrap();
//! let n = width.window_number(1_000_000);
//! assert!(width.start_timestamp(n) <= 1_000_000);
//! ```

use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ValidationError;
use crate::types::Timestamp;

const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;
const WEEK_MS: i64 = 7 * DAY_MS;

const EPOCH_YEAR: i64 = 1970;

// ============================================================================
// Window Time Unit
// ============================================================================

/// Unit of a counter window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowTimeUnit {
    /// Fixed 60 second windows
    Minute,
    /// Fixed 60 minute windows
    Hour,
    /// Fixed 24 hour windows (UTC days)
    Day,
    /// Fixed 7 day windows, epoch aligned
    Week,
    /// Calendar months
    Month,
    /// Calendar years
    Year,
    /// A single window covering all time
    Always,
}

impl WindowTimeUnit {
    /// All units, finest first
    pub const ALL: [WindowTimeUnit; 7] = [
        WindowTimeUnit::Minute,
        WindowTimeUnit::Hour,
        WindowTimeUnit::Day,
        WindowTimeUnit::Week,
        WindowTimeUnit::Month,
        WindowTimeUnit::Year,
        WindowTimeUnit::Always,
    ];

    /// Unit name used in logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            WindowTimeUnit::Minute => "minute",
            WindowTimeUnit::Hour => "hour",
            WindowTimeUnit::Day => "day",
            WindowTimeUnit::Week => "week",
            WindowTimeUnit::Month => "month",
            WindowTimeUnit::Year => "year",
            WindowTimeUnit::Always => "always",
        }
    }

    /// Largest amount a single width may use before the next unit should be
    /// chosen instead; `None` means unlimited
    pub fn max_amount(&self) -> Option<u32> {
        match self {
            WindowTimeUnit::Minute => Some(59),
            WindowTimeUnit::Hour => Some(23),
            WindowTimeUnit::Day => Some(30),
            WindowTimeUnit::Week => Some(51),
            WindowTimeUnit::Month => Some(11),
            WindowTimeUnit::Year => Some(1000),
            WindowTimeUnit::Always => None,
        }
    }

    fn fixed_millis(&self) -> Option<i64> {
        match self {
            WindowTimeUnit::Minute => Some(MINUTE_MS),
            WindowTimeUnit::Hour => Some(HOUR_MS),
            WindowTimeUnit::Day => Some(DAY_MS),
            WindowTimeUnit::Week => Some(WEEK_MS),
            _ => None,
        }
    }

    /// Window number containing `ts` for windows of `amount` units
    pub fn window_number(&self, ts: Timestamp, amount: u32) -> i64 {
        let amount = i64::from(amount.max(1));
        if let Some(unit_ms) = self.fixed_millis() {
            return ts.div_euclid(unit_ms.saturating_mul(amount));
        }
        match self {
            WindowTimeUnit::Month => {
                let dt = utc_datetime(ts);
                let months = (i64::from(dt.year()) - EPOCH_YEAR) * 12 + i64::from(dt.month0());
                months.div_euclid(amount)
            },
            WindowTimeUnit::Year => {
                let dt = utc_datetime(ts);
                (i64::from(dt.year()) - EPOCH_YEAR).div_euclid(amount)
            },
            _ => 0,
        }
    }

    /// First millisecond of window `window` for windows of `amount` units
    ///
    /// Inverse of [`WindowTimeUnit::window_number`].
    pub fn start_timestamp(&self, window: i64, amount: u32) -> Timestamp {
        let amount = i64::from(amount.max(1));
        if let Some(unit_ms) = self.fixed_millis() {
            return window.saturating_mul(unit_ms.saturating_mul(amount));
        }
        match self {
            WindowTimeUnit::Month => {
                let months = window.saturating_mul(amount);
                month_start(
                    EPOCH_YEAR + months.div_euclid(12),
                    months.rem_euclid(12) as u32 + 1,
                )
            },
            WindowTimeUnit::Year => month_start(EPOCH_YEAR + window.saturating_mul(amount), 1),
            _ => Timestamp::MIN,
        }
    }
}

impl fmt::Display for WindowTimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn utc_datetime(ts: Timestamp) -> DateTime<Utc> {
    match Utc.timestamp_millis_opt(ts).single() {
        Some(dt) => dt,
        None if ts < 0 => DateTime::<Utc>::MIN_UTC,
        None => DateTime::<Utc>::MAX_UTC,
    }
}

fn month_start(year: i64, month: u32) -> Timestamp {
    let date = i32::try_from(year)
        .ok()
        .and_then(|y| NaiveDate::from_ymd_opt(y, month, 1))
        .and_then(|d| d.and_hms_opt(0, 0, 0));
    match date {
        Some(naive) => Utc.from_utc_datetime(&naive).timestamp_millis(),
        None if year < EPOCH_YEAR => Timestamp::MIN,
        None => Timestamp::MAX,
    }
}

// ============================================================================
// Window Width
// ============================================================================

/// Width of a counter window: `amount` units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowWidth {
    amount: u32,
    unit: WindowTimeUnit,
}

impl WindowWidth {
    /// Create a width, rejecting amounts outside `1..=unit.max_amount()`
    pub fn new(amount: u32, unit: WindowTimeUnit) -> Result<Self, ValidationError> {
        let max = unit.max_amount().unwrap_or(u32::MAX);
        if amount == 0 || amount > max {
            return Err(ValidationError::InvalidWindow {
                unit: unit.name(),
                amount,
                max,
            });
        }
        Ok(Self { amount, unit })
    }

    /// The single window covering all time
    pub fn always() -> Self {
        Self {
            amount: 1,
            unit: WindowTimeUnit::Always,
        }
    }

    /// Width spanning `multiple` consecutive windows of this width
    ///
    /// Wide windows may exceed the unit's maximum amount; only overflow is
    /// rejected.
    pub fn scaled(&self, multiple: u32) -> Result<Self, ValidationError> {
        let amount = self
            .amount
            .checked_mul(multiple)
            .filter(|a| *a > 0)
            .ok_or(ValidationError::InvalidWindow {
                unit: self.unit.name(),
                amount: multiple,
                max: u32::MAX / self.amount,
            })?;
        Ok(Self {
            amount,
            unit: self.unit,
        })
    }

    /// Number of units in one window
    pub fn amount(&self) -> u32 {
        self.amount
    }

    /// Window unit
    pub fn unit(&self) -> WindowTimeUnit {
        self.unit
    }

    /// Window number containing `ts`
    pub fn window_number(&self, ts: Timestamp) -> i64 {
        self.unit.window_number(ts, self.amount)
    }

    /// First millisecond of window `window`
    pub fn start_timestamp(&self, window: i64) -> Timestamp {
        self.unit.start_timestamp(window, self.amount)
    }

    /// First millisecond after window `window`
    pub fn end_timestamp(&self, window: i64) -> Timestamp {
        match self.unit {
            WindowTimeUnit::Always => Timestamp::MAX,
            _ => self.start_timestamp(window.saturating_add(1)),
        }
    }
}

impl fmt::Display for WindowWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.amount, self.unit)
    }
}

// ============================================================================
// Window Values
// ============================================================================

/// Aggregate of one window bucket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowValue {
    /// Number of events in the bucket
    pub count: i64,
    /// Sum of event deltas in the bucket
    pub sum: i64,
}

impl WindowValue {
    /// Create a window value
    pub fn new(count: i64, sum: i64) -> Self {
        Self { count, sum }
    }

    /// Fold one signed contribution into the bucket
    pub fn apply(&mut self, count: i64, sum: i64) {
        self.count = self.count.saturating_add(count);
        self.sum = self.sum.saturating_add(sum);
    }

    /// True if nothing was recorded in the bucket
    pub fn is_empty(&self) -> bool {
        self.count == 0 && self.sum == 0
    }
}

/// Narrow and wide window values reported for a counter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterValue {
    /// Value of the wide window
    pub wide: WindowValue,
    /// Value of the narrow window
    pub narrow: WindowValue,
}
