//! At-least-once counter event queue
//!
//! Events are recorded together with one queue row per affected partition.
//! The [`EventProcessor`] fetches due rows for local shards and applies them
//! idempotently, serialized per `(counter, partition)` by a
//! [`KeyedExecutionQueue`]. Failed applies are retried after a delay chosen
//! by a [`BackoffStrategy`].

pub mod backoff;
mod event;
mod keyed;
mod processor;

pub use backoff::{BackoffStrategy, ExponentialBackoff, FixedBackoff};
pub use event::{ApplyOutcome, CounterEvent, EventKind, PartitionKey, QueuedCounterEvent};
pub use keyed::KeyedExecutionQueue;
pub use processor::EventProcessor;
