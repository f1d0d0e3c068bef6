//! Typed leaf payloads stored against contexts
//!
//! Every [`Value`] reduces to a [`PersistedValue`] (a 64-bit integer or a
//! string) for storage and to a list of string parts for text transport.
//! [`ValueKind`] is the dispatch table that rebuilds a value from either form.
//!
//! # Example
//!
//! ```rust
//! use cascade_store::value::{Value, ValueKind};
//!
//! let value = Value::decimal(12345, 2);
//! let parts = value.string_parts();
//! assert_eq!(ValueKind::Decimal.build_from_string_parts(&parts).unwrap(), value);
//! ```

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::error::ValidationError;

/// Storage form of a value or dimension
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PersistedValue {
    /// 64-bit integer column
    Long(i64),
    /// String column
    Text(String),
}

impl fmt::Display for PersistedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistedValue::Long(v) => write!(f, "{}", v),
            PersistedValue::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Fixed-point decimal: `unscaled * 10^-scale`
///
/// Scale is preserved through round trips, so `1.50` and `1.5` are distinct
/// values that compare equal numerically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Decimal {
    /// Digits without the decimal point
    pub unscaled: i64,
    /// Number of digits after the decimal point
    pub scale: u8,
}

/// Largest supported decimal scale; keeps scaling inside i128
const MAX_DECIMAL_SCALE: u8 = 18;

impl Decimal {
    /// `None` when the rescaled magnitude leaves i128
    fn rescaled(&self, extra_digits: u8) -> Option<i128> {
        if self.unscaled == 0 {
            return Some(0);
        }
        10i128
            .checked_pow(u32::from(extra_digits))?
            .checked_mul(i128::from(self.unscaled))
    }

    // Scales past MAX_DECIMAL_SCALE reach here through the public fields; a
    // side that overflows when rescaled outweighs the other
    fn numeric_cmp(&self, other: &Decimal) -> Ordering {
        match self.scale.cmp(&other.scale) {
            Ordering::Equal => self.unscaled.cmp(&other.unscaled),
            Ordering::Less => match self.rescaled(other.scale - self.scale) {
                Some(scaled) => scaled.cmp(&i128::from(other.unscaled)),
                None => self.unscaled.cmp(&0),
            },
            Ordering::Greater => match other.rescaled(self.scale - other.scale) {
                Some(scaled) => i128::from(self.unscaled).cmp(&scaled),
                None => 0.cmp(&other.unscaled),
            },
        }
    }

    fn parse(s: &str) -> Result<Self, ValidationError> {
        let invalid = |message: &str| ValidationError::InvalidFormat {
            field: "decimal".to_string(),
            message: format!("'{}': {}", s, message),
        };
        let (negative, body) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let (int_part, frac_part) = match body.split_once('.') {
            Some((i, f)) => (i, f),
            None => (body, ""),
        };
        if int_part.is_empty() || !int_part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("integer part must be digits"));
        }
        if !frac_part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid("fraction part must be digits"));
        }
        let scale = u8::try_from(frac_part.len())
            .ok()
            .filter(|s| *s <= MAX_DECIMAL_SCALE)
            .ok_or_else(|| invalid("too many fraction digits"))?;
        let digits = format!("{}{}", int_part, frac_part);
        let magnitude: i64 = digits.parse().map_err(|_| invalid("out of range"))?;
        Ok(Self {
            unscaled: if negative { -magnitude } else { magnitude },
            scale,
        })
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scale == 0 {
            return write!(f, "{}", self.unscaled);
        }
        let sign = if self.unscaled < 0 { "-" } else { "" };
        let digits = self.unscaled.unsigned_abs().to_string();
        let scale = usize::from(self.scale);
        let padded = if digits.len() <= scale {
            format!("{}{}", "0".repeat(scale - digits.len() + 1), digits)
        } else {
            digits
        };
        let (int_part, frac_part) = padded.split_at(padded.len() - scale);
        write!(f, "{}{}.{}", sign, int_part, frac_part)
    }
}

/// Kind tag of a [`Value`], used to rebuild values from storage or text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    /// Signed 64-bit integer
    Long,
    /// Boolean flag
    Bool,
    /// Free text
    Text,
    /// Duration in milliseconds
    Duration,
    /// Instant in milliseconds since the epoch
    Timestamp,
    /// Fixed-point decimal
    Decimal,
}

impl ValueKind {
    /// Kind name used in error messages
    pub fn name(&self) -> &'static str {
        match self {
            ValueKind::Long => "long",
            ValueKind::Bool => "bool",
            ValueKind::Text => "text",
            ValueKind::Duration => "duration",
            ValueKind::Timestamp => "timestamp",
            ValueKind::Decimal => "decimal",
        }
    }

    /// Rebuild a value from its persisted column
    pub fn build_from_persisted(&self, persisted: &PersistedValue) -> Result<Value, ValidationError> {
        match (self, persisted) {
            (ValueKind::Long, PersistedValue::Long(v)) => Ok(Value::Long(*v)),
            (ValueKind::Bool, PersistedValue::Long(v)) => match v {
                0 => Ok(Value::Bool(false)),
                1 => Ok(Value::Bool(true)),
                other => Err(ValidationError::InvalidFormat {
                    field: "bool".to_string(),
                    message: format!("persisted flag must be 0 or 1, got {}", other),
                }),
            },
            (ValueKind::Text, PersistedValue::Text(s)) => Ok(Value::Text(s.clone())),
            (ValueKind::Duration, PersistedValue::Long(v)) => Ok(Value::Duration(*v)),
            (ValueKind::Timestamp, PersistedValue::Long(v)) => Ok(Value::Timestamp(*v)),
            (ValueKind::Decimal, PersistedValue::Text(s)) => Decimal::parse(s).map(Value::Decimal),
            (kind, persisted) => Err(ValidationError::WrongKind {
                expected: kind.name().to_string(),
                actual: format!("persisted {:?}", persisted),
            }),
        }
    }

    /// Rebuild a value from the parts produced by [`Value::string_parts`]
    pub fn build_from_string_parts<S: AsRef<str>>(&self, parts: &[S]) -> Result<Value, ValidationError> {
        let parse_long = |field: &str, s: &str| -> Result<i64, ValidationError> {
            s.parse().map_err(|_| ValidationError::InvalidFormat {
                field: field.to_string(),
                message: format!("'{}' is not an integer", s),
            })
        };

        match self {
            ValueKind::Long => Ok(Value::Long(parse_long("long", single_part(self, parts)?)?)),
            ValueKind::Bool => match single_part(self, parts)? {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                other => Err(ValidationError::InvalidFormat {
                    field: "bool".to_string(),
                    message: format!("'{}' is not true or false", other),
                }),
            },
            ValueKind::Text => Ok(Value::Text(single_part(self, parts)?.to_string())),
            ValueKind::Duration => Ok(Value::Duration(parse_long("duration", single_part(self, parts)?)?)),
            ValueKind::Timestamp => {
                let raw = single_part(self, parts)?;
                DateTime::parse_from_rfc3339(raw)
                    .map(|dt| Value::Timestamp(dt.timestamp_millis()))
                    .map_err(|e| ValidationError::InvalidFormat {
                        field: "timestamp".to_string(),
                        message: format!("'{}': {}", raw, e),
                    })
            },
            ValueKind::Decimal => {
                if parts.len() != 2 {
                    return Err(ValidationError::InvalidFormat {
                        field: "decimal".to_string(),
                        message: format!("expected 2 string parts, got {}", parts.len()),
                    });
                }
                let unscaled = parse_long("decimal", parts[0].as_ref())?;
                let scale = parts[1]
                    .as_ref()
                    .parse::<u8>()
                    .ok()
                    .filter(|s| *s <= MAX_DECIMAL_SCALE)
                    .ok_or_else(|| ValidationError::InvalidFormat {
                        field: "decimal".to_string(),
                        message: format!("invalid scale '{}'", parts[1].as_ref()),
                    })?;
                Ok(Value::Decimal(Decimal { unscaled, scale }))
            },
        }
    }
}

fn single_part<'a, S: AsRef<str>>(
    kind: &ValueKind,
    parts: &'a [S],
) -> Result<&'a str, ValidationError> {
    match parts {
        [only] => Ok(only.as_ref()),
        _ => Err(ValidationError::InvalidFormat {
            field: kind.name().to_string(),
            message: format!("expected 1 string part, got {}", parts.len()),
        }),
    }
}

/// A typed config payload
///
/// The derived `Ord` is structural and only used to keep sets in a stable
/// order; use [`Value::compare`] for semantic ordering.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Value {
    /// Signed 64-bit integer
    Long(i64),
    /// Boolean flag
    Bool(bool),
    /// Free text
    Text(String),
    /// Duration in milliseconds
    Duration(i64),
    /// Instant in milliseconds since the epoch
    Timestamp(i64),
    /// Fixed-point decimal
    Decimal(Decimal),
}

impl Value {
    /// Convenience constructor for decimals
    pub fn decimal(unscaled: i64, scale: u8) -> Self {
        Value::Decimal(Decimal {
            unscaled,
            scale: scale.min(MAX_DECIMAL_SCALE),
        })
    }

    /// Kind tag of this value
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Long(_) => ValueKind::Long,
            Value::Bool(_) => ValueKind::Bool,
            Value::Text(_) => ValueKind::Text,
            Value::Duration(_) => ValueKind::Duration,
            Value::Timestamp(_) => ValueKind::Timestamp,
            Value::Decimal(_) => ValueKind::Decimal,
        }
    }

    /// Storage form of this value
    pub fn persisted_value(&self) -> PersistedValue {
        match self {
            Value::Long(v) | Value::Duration(v) | Value::Timestamp(v) => PersistedValue::Long(*v),
            Value::Bool(b) => PersistedValue::Long(i64::from(*b)),
            Value::Text(s) => PersistedValue::Text(s.clone()),
            Value::Decimal(d) => PersistedValue::Text(d.to_string()),
        }
    }

    /// Text transport form of this value
    pub fn string_parts(&self) -> Vec<String> {
        match self {
            Value::Long(v) | Value::Duration(v) => vec![v.to_string()],
            Value::Bool(b) => vec![b.to_string()],
            Value::Text(s) => vec![s.clone()],
            Value::Timestamp(ts) => vec![match Utc.timestamp_millis_opt(*ts).single() {
                Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
                None => ts.to_string(),
            }],
            Value::Decimal(d) => vec![d.unscaled.to_string(), d.scale.to_string()],
        }
    }

    /// Order two values of the same kind; `None` across kinds
    ///
    /// Decimals compare numerically regardless of scale.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Long(a), Value::Long(b))
            | (Value::Duration(a), Value::Duration(b))
            | (Value::Timestamp(a), Value::Timestamp(b)) => Some(a.cmp(b)),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Decimal(a), Value::Decimal(b)) => Some(a.numeric_cmp(b)),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Long(v) => write!(f, "{}", v),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Text(s) => write!(f, "{:?}", s),
            Value::Duration(ms) => write!(f, "{}ms", ms),
            Value::Timestamp(_) => write!(f, "{}", self.string_parts()[0]),
            Value::Decimal(d) => write!(f, "{}", d),
        }
    }
}
