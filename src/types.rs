//! Core identifier and time types used throughout the store
//!
//! # Key Types
//!
//! - **`EventId`**: Unique identifier for a recorded counter event (UUID)
//! - **`ShardId`**: Logical partition of the keyspace owned by one node
//! - **`Timestamp`**: Milliseconds since the Unix epoch (UTC)
//! - **`SequenceNumber`**: Monotonic number assigned to queue rows

use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Milliseconds since 1970-01-01T00:00:00Z
pub type Timestamp = i64;

/// Shard identifier
pub type ShardId = usize;

/// Monotonic sequence number assigned by the persistence provider
pub type SequenceNumber = u64;

/// Current wall-clock time in milliseconds
pub fn now_millis() -> Timestamp {
    Utc::now().timestamp_millis()
}

/// Render a timestamp as RFC 3339 for logs, falling back to the raw number
pub fn format_timestamp(ts: Timestamp) -> String {
    match Utc.timestamp_millis_opt(ts).single() {
        Some(dt) => dt.to_rfc3339(),
        None => ts.to_string(),
    }
}

/// Unique identifier for a recorded counter event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub uuid::Uuid);

impl EventId {
    /// Create a new randomly generated event ID
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    /// Parse an event ID from its hyphenated string form
    pub fn parse(s: &str) -> Result<Self, String> {
        uuid::Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| format!("Invalid event ID '{}': {}", s, e))
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_id_parse_roundtrip() {
        let id = EventId::new();
        let parsed = EventId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
        assert!(EventId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0), "1970-01-01T00:00:00+00:00");
    }
}
