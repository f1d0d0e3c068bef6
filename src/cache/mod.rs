//! Caching layer
//!
//! In-process caches for hot counters and resolved config lookups. Entries
//! are only written after the transaction producing them commits, so a cache
//! never holds state the store has not made durable.

pub mod local;

pub use local::{CachedEntry, LocalCounterCache, TtlLruCache};
