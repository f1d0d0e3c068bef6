//! Error types for the store

use thiserror::Error;

/// Main error type for the store
#[derive(Error, Debug)]
pub enum Error {
    /// A write or lookup was rejected by validation
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Persistence provider error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Lookup of a config or counter definition that was never registered
    #[error("Unknown definition: {0}")]
    UnknownDefinition(String),

    /// No context in the hierarchy holds a value for a required config entry
    #[error("No value for required config '{config_key}' at {context}")]
    MissingValue {
        /// Config definition key
        config_key: String,
        /// Rendering of the queried context
        context: String,
    },

    /// Background service error
    #[error("Service error: {0}")]
    Service(#[from] crate::services::ServiceError),

    /// Applying a queued counter event failed for a transient reason
    #[error("Apply failed: {0}")]
    Apply(String),

    /// General error
    #[error("{0}")]
    General(String),
}

impl Error {
    /// True when the underlying cause is an optimistic concurrency conflict
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Store(StoreError::Conflict(_)))
    }
}

/// Validation errors
///
/// Always surfaced synchronously to the writer and never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Value cannot be bound to a dimension
    #[error("Unsupported value for dimension '{dimension}': {message}")]
    UnsupportedValue {
        /// Dimension key
        dimension: String,
        /// Description of the problem
        message: String,
    },

    /// A dimension requires another one that is not present in the context
    #[error("Dimension '{dimension}' requires '{requires}' to be present first")]
    MissingDependency {
        /// Dimension being added
        dimension: String,
        /// Dimension it depends on
        requires: String,
    },

    /// Context definition packs more specificity bits than the 63-bit budget
    #[error("Context definition '{context_def}' exceeds 63 bits ({bits} requested)")]
    BitBudgetExceeded {
        /// Context definition name
        context_def: String,
        /// Total bits requested
        bits: u32,
    },

    /// Definition built with an invalid shape
    #[error("Invalid definition '{key}': {message}")]
    InvalidDefinition {
        /// Definition key
        key: String,
        /// Description of the problem
        message: String,
    },

    /// Context holds a match-any dimension and cannot be used for lookups
    #[error("Context {0} contains match-any dimensions and cannot be queried")]
    NotQueryable(String),

    /// Context was built from a different context definition
    #[error("Context built from '{actual}' but '{expected}' is required")]
    ContextDefMismatch {
        /// Expected context definition name
        expected: String,
        /// Actual context definition name
        actual: String,
    },

    /// Value kind does not match the definition
    #[error("Expected a {expected} value, got {actual}")]
    WrongKind {
        /// Expected value kind
        expected: String,
        /// Actual value kind
        actual: String,
    },

    /// Write at a context breaks a bound set at a less specific context
    #[error("Config '{config_key}' value {value} at {context} violates {bound_kind} bound {bound} set at {bound_context}")]
    BoundViolation {
        /// Config definition key
        config_key: String,
        /// Context being written
        context: String,
        /// Rendering of the rejected value
        value: String,
        /// Ancestor context holding the bound
        bound_context: String,
        /// Rendering of the ancestor value
        bound: String,
        /// "max" or "min"
        bound_kind: &'static str,
    },

    /// New bound is already violated by a more specific override
    #[error("Config '{config_key}' bound {bound} at {context} is violated by {value} at {descendant}")]
    DescendantViolation {
        /// Config definition key
        config_key: String,
        /// Context being written
        context: String,
        /// Rendering of the new bound
        bound: String,
        /// Descendant context holding the offending value
        descendant: String,
        /// Rendering of the offending value
        value: String,
    },

    /// Window width outside the range supported by its unit
    #[error("Window amount {amount} is out of range [1, {max}] for unit {unit}")]
    InvalidWindow {
        /// Unit name
        unit: &'static str,
        /// Requested amount
        amount: u32,
        /// Maximum amount for the unit
        max: u32,
    },

    /// Invalid format
    #[error("Invalid format for {field}: {message}")]
    InvalidFormat {
        /// Field being parsed
        field: String,
        /// Description of the format error
        message: String,
    },
}

/// Persistence provider errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Data changed underneath an optimistic transaction
    #[error("Optimistic concurrency conflict: {0}")]
    Conflict(String),

    /// Transaction was used after commit or rollback
    #[error("Transaction closed")]
    Closed,

    /// Backend failure
    #[error("Backend error: {0}")]
    Backend(String),
}

/// Raised when two dimension values (or contexts) are unrelated
///
/// Internal to comparison logic; callers convert it to "no match".
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("values are not comparable")]
pub struct NotComparable;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
