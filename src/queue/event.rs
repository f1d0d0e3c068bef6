//! Recorded counter events and their queue rows

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::context::PersistedContext;
use crate::types::{EventId, SequenceNumber, ShardId, Timestamp};

/// Direction of a counter event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Adds one to the count and the delta to the sum
    Increment,
    /// Reverses a previous increment
    Decrement,
}

/// A counter event recorded alongside its queue rows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterEvent {
    /// Unique event id
    pub event_id: EventId,
    /// Counter definition key
    pub counter_key: String,
    /// Full context the event happened in
    pub context: PersistedContext,
    /// Amount added to (or removed from) the sum
    pub delta: i64,
    /// When the event happened
    pub timestamp: Timestamp,
    /// Increment or decrement
    pub kind: EventKind,
}

/// Partition dimension and value a queue row is sharded by
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey {
    /// Dimension key
    pub dimension: String,
    /// Dimension value in string form
    pub value: String,
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.dimension, self.value)
    }
}

/// One pending application of an event to one partition
///
/// `partition` is `None` for the aggregate row, which updates counters that
/// carry no partition dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedCounterEvent {
    /// Monotonic sequence number assigned on insert
    pub seq: SequenceNumber,
    /// Event this row applies
    pub event_id: EventId,
    /// Counter definition key
    pub counter_key: String,
    /// Affected partition
    pub partition: Option<PartitionKey>,
    /// Shard owning the partition
    pub shard: ShardId,
    /// Number of failed apply attempts
    pub failure_count: u32,
    /// Earliest time of the next attempt
    pub next_retry_at: Timestamp,
}

impl QueuedCounterEvent {
    /// Key serializing applies on the same counter partition
    pub fn execution_key(&self) -> (String, String) {
        let partition = self
            .partition
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        (self.counter_key.clone(), partition)
    }

    /// Key hashed onto the shard ring
    pub fn routing_key(counter_key: &str, partition: Option<&PartitionKey>) -> String {
        match partition {
            Some(p) => format!("{}/{}", counter_key, p),
            None => counter_key.to_string(),
        }
    }
}

/// Result of one apply attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Event applied to this many counters
    Applied {
        /// Number of counters updated
        counters: usize,
    },
    /// Row already deleted by an earlier attempt
    AlreadyApplied,
    /// Shard is owned by another node; row left for its owner
    Abandoned,
}
