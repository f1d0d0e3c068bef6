//! Cascade Store - context-cascaded configuration and windowed counters
//!
//! This library provides:
//! - Multi-dimensional contexts whose specificity is packed into one integer
//! - Config overrides resolved to the most specific matching context, with
//!   max/min bounds enforced down the context hierarchy
//! - Calendar-aligned windowed counters (count and sum per window)
//! - An at-least-once, shard-routed event queue applied effectively once

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod context;
pub mod counter;
pub mod definition;
pub mod engine;
pub mod error;
pub mod overrides;
pub mod queue;
pub mod types;
pub mod value;
pub mod window;

/// Prometheus metrics and telemetry
pub mod metrics;

/// Configuration management with TOML support
pub mod config;

/// Tracing subscriber setup
pub mod logging;

/// In-process counter and config caches
pub mod cache;

/// Consistent-hash shard routing and local shard ownership
pub mod cluster;

/// Background services hosting the counter event poller
pub mod services;

// Re-export main types
pub use context::{Context, ContextDef, DimensionDef};
pub use definition::{ConfigDef, CounterDef, CounterWindow, DefinitionRegistry};
pub use engine::{CascadeEngine, CascadeEngineBuilder};
pub use error::{Error, Result};
pub use value::Value;
pub use window::{CounterValue, WindowTimeUnit, WindowValue, WindowWidth};
