//! Config and counter definitions and their registry
//!
//! Definitions are created once at startup and looked up by key. A
//! [`ConfigDef`] describes a cascaded setting; a [`CounterDef`] describes a
//! family of windowed counters fed by recorded events.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::context::ContextDef;
use crate::error::{Error, Result, ValidationError};
use crate::overrides::Constraint;
use crate::value::{Value, ValueKind};
use crate::window::WindowWidth;

// ============================================================================
// Config Definitions
// ============================================================================

/// Schema of a cascaded config entry
#[derive(Debug)]
pub struct ConfigDef {
    key: String,
    kind: ValueKind,
    context_def: Arc<ContextDef>,
    default: Option<Value>,
    default_set: BTreeSet<Value>,
    required: bool,
    constraint: Option<Constraint>,
    set_valued: bool,
}

impl ConfigDef {
    /// Start building a config definition
    pub fn builder(
        key: impl Into<String>,
        kind: ValueKind,
        context_def: Arc<ContextDef>,
    ) -> ConfigDefBuilder {
        ConfigDefBuilder {
            def: ConfigDef {
                key: key.into(),
                kind,
                context_def,
                default: None,
                default_set: BTreeSet::new(),
                required: false,
                constraint: None,
                set_valued: false,
            },
        }
    }

    /// Config key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Kind of every value stored under this key
    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    /// Context definition for overrides of this entry
    pub fn context_def(&self) -> &Arc<ContextDef> {
        &self.context_def
    }

    /// Scalar default used when no override matches
    pub fn default_value(&self) -> Option<&Value> {
        self.default.as_ref()
    }

    /// Set default used when no override matches
    pub fn default_set(&self) -> &BTreeSet<Value> {
        &self.default_set
    }

    /// Whether a lookup with no applicable value is an error
    pub fn is_required(&self) -> bool {
        self.required
    }

    /// Bound enforced between ancestor and descendant overrides
    pub fn constraint(&self) -> Option<Constraint> {
        self.constraint
    }

    /// True for set-valued entries
    pub fn is_set_valued(&self) -> bool {
        self.set_valued
    }

    /// Reject values of the wrong kind
    pub fn check_kind(&self, value: &Value) -> std::result::Result<(), ValidationError> {
        if value.kind() != self.kind {
            return Err(ValidationError::WrongKind {
                expected: self.kind.name().to_string(),
                actual: value.kind().name().to_string(),
            });
        }
        Ok(())
    }
}

/// Builder for [`ConfigDef`]
pub struct ConfigDefBuilder {
    def: ConfigDef,
}

impl ConfigDefBuilder {
    /// Scalar default value
    pub fn default_value(mut self, value: Value) -> Self {
        self.def.default = Some(value);
        self
    }

    /// Default members of a set-valued entry
    pub fn default_set<I: IntoIterator<Item = Value>>(mut self, values: I) -> Self {
        self.def.default_set = values.into_iter().collect();
        self
    }

    /// Fail lookups that resolve to nothing
    pub fn required(mut self, required: bool) -> Self {
        self.def.required = required;
        self
    }

    /// Enforce a cascading bound
    pub fn constraint(mut self, constraint: Constraint) -> Self {
        self.def.constraint = Some(constraint);
        self
    }

    /// Store sets of values instead of a scalar
    pub fn set_valued(mut self) -> Self {
        self.def.set_valued = true;
        self
    }

    /// Validate and build the definition
    pub fn build(self) -> std::result::Result<ConfigDef, ValidationError> {
        let def = self.def;
        if def.key.is_empty() {
            return Err(ValidationError::InvalidDefinition {
                key: def.key,
                message: "config key must not be empty".to_string(),
            });
        }
        if def.set_valued && def.default.is_some() {
            return Err(ValidationError::InvalidDefinition {
                key: def.key,
                message: "set-valued entries take a default set".to_string(),
            });
        }
        if let Some(default) = &def.default {
            def.check_kind(default)?;
        }
        for member in &def.default_set {
            def.check_kind(member)?;
        }
        Ok(def)
    }
}

// ============================================================================
// Counter Definitions
// ============================================================================

/// A tracked window: narrow width plus the multiple that yields the wide one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CounterWindow {
    narrow: WindowWidth,
    multiple: u32,
}

impl CounterWindow {
    /// Create a narrow and wide window pair; `multiple` of 1 tracks a single window
    pub fn new(narrow: WindowWidth, multiple: u32) -> std::result::Result<Self, ValidationError> {
        narrow.scaled(multiple)?;
        Ok(Self { narrow, multiple })
    }

    /// Narrow window width
    pub fn narrow(&self) -> WindowWidth {
        self.narrow
    }

    /// Wide window width
    pub fn wide(&self) -> WindowWidth {
        // checked in `new`
        self.narrow.scaled(self.multiple).unwrap_or(self.narrow)
    }

    /// Narrow windows per wide window
    pub fn multiple(&self) -> u32 {
        self.multiple
    }
}

/// Schema of a family of counters
///
/// Every recorded event is projected onto each aggregation template to find
/// the counter contexts it updates, once per tracked window.
#[derive(Debug)]
pub struct CounterDef {
    key: String,
    context_def: Arc<ContextDef>,
    partition_dimensions: Vec<String>,
    templates: Vec<Vec<String>>,
    windows: Vec<CounterWindow>,
}

impl CounterDef {
    /// Create a counter definition
    pub fn new(
        key: impl Into<String>,
        context_def: Arc<ContextDef>,
        partition_dimensions: Vec<String>,
        templates: Vec<Vec<String>>,
        windows: Vec<CounterWindow>,
    ) -> std::result::Result<Self, ValidationError> {
        let key = key.into();
        let invalid = |message: String| ValidationError::InvalidDefinition {
            key: key.clone(),
            message,
        };
        if windows.is_empty() {
            return Err(invalid("at least one window is required".to_string()));
        }
        if templates.is_empty() {
            return Err(invalid("at least one aggregation template is required".to_string()));
        }
        let unknown = partition_dimensions
            .iter()
            .chain(templates.iter().flatten())
            .find(|k| !context_def.supports(k));
        if let Some(unknown) = unknown {
            return Err(invalid(format!(
                "dimension '{}' is not part of context definition '{}'",
                unknown,
                context_def.name()
            )));
        }
        for template in &templates {
            let dependency = template.iter().find_map(|k| {
                context_def
                    .dimension(k)
                    .and_then(|dim| dim.requires().iter().find(|r| !template.contains(r)))
                    .map(|r| (k, r))
            });
            if let Some((dimension, requires)) = dependency {
                return Err(ValidationError::MissingDependency {
                    dimension: dimension.clone(),
                    requires: requires.clone(),
                });
            }
        }
        Ok(Self {
            key,
            context_def,
            partition_dimensions,
            templates,
            windows,
        })
    }

    /// Counter key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Context definition counters are keyed by
    pub fn context_def(&self) -> &Arc<ContextDef> {
        &self.context_def
    }

    /// Dimensions events are sharded by
    pub fn partition_dimensions(&self) -> &[String] {
        &self.partition_dimensions
    }

    /// Dimension subsets tracked as counters
    pub fn templates(&self) -> &[Vec<String>] {
        &self.templates
    }

    /// Tracked windows
    pub fn windows(&self) -> &[CounterWindow] {
        &self.windows
    }

    /// Index of a tracked window
    pub fn window_index(&self, window: &CounterWindow) -> Option<usize> {
        self.windows.iter().position(|w| w == window)
    }

    /// Partition dimension owning counters built from `template`
    ///
    /// `None` means the template is updated by the aggregate queue row.
    pub fn partition_for(&self, template: &[String]) -> Option<&str> {
        self.partition_dimensions
            .iter()
            .find(|d| template.contains(d))
            .map(String::as_str)
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Explicit registry of config and counter definitions
#[derive(Debug, Default)]
pub struct DefinitionRegistry {
    configs: HashMap<String, Arc<ConfigDef>>,
    counters: HashMap<String, Arc<CounterDef>>,
}

impl DefinitionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a config definition
    pub fn register_config(&mut self, def: ConfigDef) -> Result<Arc<ConfigDef>> {
        if self.configs.contains_key(def.key()) {
            return Err(duplicate(def.key()));
        }
        let def = Arc::new(def);
        self.configs.insert(def.key().to_string(), Arc::clone(&def));
        tracing::debug!(config = def.key(), kind = def.kind().name(), "Config registered");
        Ok(def)
    }

    /// Register a counter definition
    pub fn register_counter(&mut self, def: CounterDef) -> Result<Arc<CounterDef>> {
        if self.counters.contains_key(def.key()) {
            return Err(duplicate(def.key()));
        }
        let def = Arc::new(def);
        self.counters.insert(def.key().to_string(), Arc::clone(&def));
        tracing::debug!(counter = def.key(), windows = def.windows().len(), "Counter registered");
        Ok(def)
    }

    /// Look up a config definition
    pub fn config(&self, key: &str) -> Result<&Arc<ConfigDef>> {
        self.configs
            .get(key)
            .ok_or_else(|| Error::UnknownDefinition(key.to_string()))
    }

    /// Look up a counter definition
    pub fn counter(&self, key: &str) -> Result<&Arc<CounterDef>> {
        self.counters
            .get(key)
            .ok_or_else(|| Error::UnknownDefinition(key.to_string()))
    }
}

fn duplicate(key: &str) -> Error {
    ValidationError::InvalidDefinition {
        key: key.to_string(),
        message: "definition already registered".to_string(),
    }
    .into()
}
