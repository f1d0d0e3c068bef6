//! Rolling windowed counters
//!
//! A counter tracks a narrow window and a wide window spanning `multiple`
//! narrow windows. Both are epoch aligned, so a wide window always starts on
//! a narrow window boundary.
//!
//! ```text
//!   narrow   | w-1 (last full) | w (current) |
//!   wide     |<------------ W (current) ------------>|
//! ```
//!
//! Reading a counter rolls it forward to the current time first. Moving
//! exactly one narrow window ahead keeps the previous window as the last full
//! window; skipping further leaves an empty last full window.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::context::{Context, PersistedContext};
use crate::definition::CounterWindow;
use crate::types::Timestamp;
use crate::window::{CounterValue, WindowValue};

/// Storage key of one counter: definition, context, and tracked window
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CounterKey {
    /// Counter definition key
    pub counter_key: String,
    /// Aggregated context
    pub context: PersistedContext,
    /// Index of the window in the definition
    pub window: usize,
}

impl CounterKey {
    /// Build the key of a counter
    pub fn new(counter_key: impl Into<String>, context: &Context, window: usize) -> Self {
        Self {
            counter_key: counter_key.into(),
            context: context.persisted(),
            window,
        }
    }
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.counter_key)?;
        for (key, value) in &self.context.dimensions {
            match value {
                Some(v) => write!(f, "/{}={}", key, v)?,
                None => write!(f, "/{}=*", key)?,
            }
        }
        write!(f, "#{}", self.window)
    }
}

/// Persisted state of one counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterState {
    /// Current narrow window number
    pub narrow_window: i64,
    /// Current narrow window value
    pub narrow: WindowValue,
    /// Current wide window number
    pub wide_window: i64,
    /// Current wide window value
    pub wide: WindowValue,
    /// Number of the last full narrow window
    pub last_full_window: i64,
    /// Value of the last full narrow window
    pub last_full: WindowValue,
    /// When the counter was last read
    pub last_queried: Timestamp,
}

impl CounterState {
    /// Empty state positioned at `now`
    pub fn new(window: &CounterWindow, now: Timestamp) -> Self {
        let narrow_window = window.narrow().window_number(now);
        Self {
            narrow_window,
            narrow: WindowValue::default(),
            wide_window: window.wide().window_number(now),
            wide: WindowValue::default(),
            last_full_window: narrow_window - 1,
            last_full: WindowValue::default(),
            last_queried: 0,
        }
    }
}

/// A windowed count and sum for one context
#[derive(Debug, Clone)]
pub struct Counter {
    context: Context,
    window: CounterWindow,
    state: CounterState,
    persisted_query: Timestamp,
}

impl Counter {
    /// Fresh counter positioned at `now`
    pub fn new(context: Context, window: CounterWindow, now: Timestamp) -> Self {
        let state = CounterState::new(&window, now);
        Self {
            context,
            window,
            state,
            persisted_query: state.last_queried,
        }
    }

    /// Counter restored from persisted state
    pub fn from_state(context: Context, window: CounterWindow, state: CounterState) -> Self {
        Self {
            context,
            window,
            state,
            persisted_query: state.last_queried,
        }
    }

    /// Context the counter aggregates
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Tracked window pair
    pub fn window(&self) -> &CounterWindow {
        &self.window
    }

    /// Persisted state
    pub fn state(&self) -> &CounterState {
        &self.state
    }

    fn tracks_wide(&self) -> bool {
        self.window.multiple() > 1
    }

    /// Advance windows so that `now` falls inside the current ones
    pub fn roll_to(&mut self, now: Timestamp) {
        let state = &mut self.state;
        let narrow = self.window.narrow().window_number(now);
        if narrow > state.narrow_window {
            if narrow == state.narrow_window + 1 {
                state.last_full = state.narrow;
                state.last_full_window = state.narrow_window;
            } else {
                state.last_full = WindowValue::default();
                state.last_full_window = narrow - 1;
            }
            state.narrow = WindowValue::default();
            state.narrow_window = narrow;
        }

        let wide = self.window.wide().window_number(now);
        if wide > state.wide_window {
            state.wide = WindowValue::default();
            state.wide_window = wide;
        }
    }

    /// Record an event of `delta` at `ts`
    ///
    /// Returns false when the event is too old for any live window.
    pub fn increment(&mut self, ts: Timestamp, delta: i64, now: Timestamp) -> bool {
        self.apply(ts, 1, delta, now)
    }

    /// Reverse an event of `delta` at `ts`
    pub fn decrement(&mut self, ts: Timestamp, delta: i64, now: Timestamp) -> bool {
        self.apply(ts, -1, delta.saturating_neg(), now)
    }

    fn apply(&mut self, ts: Timestamp, count: i64, sum: i64, now: Timestamp) -> bool {
        self.roll_to(now.max(ts));
        let tracks_wide = self.tracks_wide();
        let state = &mut self.state;

        let narrow = self.window.narrow().window_number(ts);
        let mut applied = false;
        if narrow == state.narrow_window {
            state.narrow.apply(count, sum);
            applied = true;
        } else if narrow == state.last_full_window {
            state.last_full.apply(count, sum);
            applied = true;
        }

        if tracks_wide && self.window.wide().window_number(ts) == state.wide_window {
            state.wide.apply(count, sum);
            applied = true;
        }
        if !applied {
            tracing::debug!(
                context = %self.context,
                event_ts = ts,
                window = %self.window.narrow(),
                "Dropping event outside live windows"
            );
        }
        applied
    }

    /// Narrow and wide values as of `now`
    pub fn value(&mut self, now: Timestamp) -> CounterValue {
        self.roll_to(now);
        let narrow = self.state.narrow;
        let wide = if self.tracks_wide() {
            self.state.wide
        } else {
            narrow
        };
        CounterValue { wide, narrow }
    }

    /// Value of the last complete narrow window as of `now`
    pub fn last_full(&mut self, now: Timestamp) -> WindowValue {
        self.roll_to(now);
        self.state.last_full
    }

    /// Record a read at `now`
    ///
    /// Returns true when the last persisted read is older than
    /// `persist_interval_ms` and the state should be written back.
    pub fn record_query(&mut self, now: Timestamp, persist_interval_ms: i64) -> bool {
        self.state.last_queried = now;
        if now.saturating_sub(self.persisted_query) >= persist_interval_ms {
            self.persisted_query = now;
            return true;
        }
        false
    }

    /// Note that the current state was written to the store
    pub fn mark_persisted(&mut self) {
        self.persisted_query = self.state.last_queried;
    }
}
