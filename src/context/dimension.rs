//! Dimension schemas and instances
//!
//! A [`DimensionDef`] describes one axis of context (for example `currency`):
//! how its values match each other and how many bits of specificity it needs.
//! A [`Dimension`] binds a definition to a concrete value or to match-any.
//!
//! # Specificity bytes
//!
//! | value                      | hash                                   |
//! |----------------------------|----------------------------------------|
//! | absent from the context    | 0                                      |
//! | match-any / catch-all      | 1                                      |
//! | exact value                | base                                   |
//! | hierarchy path of depth d  | base + d - 1                           |
//! | range value                | base + index of largest boundary <= v  |
//!
//! `base` is 2 when the dimension supports match-any, otherwise 1.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use super::context::ContextBuilder;
use crate::error::{NotComparable, ValidationError};
use crate::value::PersistedValue;

/// Separator between hierarchy path segments in string and persisted forms
pub const PATH_SEPARATOR: char = '/';

/// String form of the match-any value
pub const MATCH_ANY: &str = "*";

/// Largest specificity byte width
const MAX_HASH_WIDTH: u8 = 8;

// ============================================================================
// Match Kind
// ============================================================================

/// Scalar type of an exact-match dimension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalarKind {
    /// 64-bit integer identifiers
    Long,
    /// String identifiers
    Text,
}

/// How values of a dimension match each other
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    /// Values match only when equal
    Exact(ScalarKind),
    /// Integer thresholds; a stored threshold matches every query value at or
    /// above it and higher thresholds are more specific
    Range {
        /// Ascending, distinct thresholds that determine specificity
        boundaries: Vec<i64>,
    },
    /// Paths; a stored path matches every query path it prefixes
    Hierarchy {
        /// Deepest path allowed
        max_depth: u8,
    },
    /// Every value matches every other value
    CatchAll,
}

/// A value bound to a dimension
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DimensionValue {
    /// Integer value (exact or range dimensions)
    Long(i64),
    /// String value (exact or catch-all dimensions)
    Text(String),
    /// Path value (hierarchy dimensions)
    Path(Vec<String>),
}

impl fmt::Display for DimensionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DimensionValue::Long(v) => write!(f, "{}", v),
            DimensionValue::Text(s) => f.write_str(s),
            DimensionValue::Path(segments) => {
                f.write_str(&segments.join(&PATH_SEPARATOR.to_string()))
            },
        }
    }
}

// ============================================================================
// Dimension Definition
// ============================================================================

/// Schema of one context dimension
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DimensionDef {
    key: String,
    hash_width: u8,
    match_kind: MatchKind,
    match_any: bool,
    cacheable: bool,
    requires: Vec<String>,
}

impl DimensionDef {
    /// Start building a dimension definition
    pub fn builder(key: impl Into<String>, match_kind: MatchKind) -> DimensionDefBuilder {
        DimensionDefBuilder {
            key: key.into(),
            match_kind,
            hash_width: None,
            match_any: false,
            cacheable: true,
            requires: Vec::new(),
        }
    }

    /// Unique key of the dimension
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Number of bits of specificity this dimension occupies
    pub fn hash_width(&self) -> u8 {
        self.hash_width
    }

    /// Matching semantics
    pub fn match_kind(&self) -> &MatchKind {
        &self.match_kind
    }

    /// Whether the match-any value is accepted
    pub fn supports_match_any(&self) -> bool {
        self.match_any
    }

    /// Whether contexts holding this dimension may be cached
    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    /// Dimensions that must be added to a context before this one
    pub fn requires(&self) -> &[String] {
        &self.requires
    }

    fn base_hash(&self) -> u8 {
        if self.match_any {
            2
        } else {
            1
        }
    }

    fn max_hash(&self) -> u32 {
        let base = u32::from(self.base_hash());
        match &self.match_kind {
            MatchKind::Exact(_) => base,
            MatchKind::Range { boundaries } => base + boundaries.len().saturating_sub(1) as u32,
            MatchKind::Hierarchy { max_depth } => base + u32::from(*max_depth).saturating_sub(1),
            MatchKind::CatchAll => 1,
        }
    }

    fn unsupported(&self, message: impl Into<String>) -> ValidationError {
        ValidationError::UnsupportedValue {
            dimension: self.key.clone(),
            message: message.into(),
        }
    }

    /// Bind a concrete value
    pub fn create(self: &Arc<Self>, value: DimensionValue) -> Result<Dimension, ValidationError> {
        self.check_value(&value)?;
        Ok(Dimension {
            def: Arc::clone(self),
            value: Some(value),
        })
    }

    /// Bind the match-any value
    pub fn match_any(self: &Arc<Self>) -> Result<Dimension, ValidationError> {
        if !self.match_any && self.match_kind != MatchKind::CatchAll {
            return Err(self.unsupported("match-any is not supported"));
        }
        Ok(Dimension {
            def: Arc::clone(self),
            value: None,
        })
    }

    /// Rebuild a dimension from its persisted column (`None` is match-any)
    pub fn create_from_persisted(
        self: &Arc<Self>,
        persisted: Option<&PersistedValue>,
    ) -> Result<Dimension, ValidationError> {
        let Some(persisted) = persisted else {
            return self.match_any();
        };
        let value = match (&self.match_kind, persisted) {
            (MatchKind::Exact(ScalarKind::Long), PersistedValue::Long(v))
            | (MatchKind::Range { .. }, PersistedValue::Long(v)) => DimensionValue::Long(*v),
            (MatchKind::Exact(ScalarKind::Text), PersistedValue::Text(s))
            | (MatchKind::CatchAll, PersistedValue::Text(s)) => DimensionValue::Text(s.clone()),
            (MatchKind::Hierarchy { .. }, PersistedValue::Text(s)) => split_path(s),
            (_, other) => {
                return Err(self.unsupported(format!("unexpected persisted form {:?}", other)))
            },
        };
        self.create(value)
    }

    /// Parse a dimension from text; `*` is match-any
    pub fn create_from_string(self: &Arc<Self>, raw: &str) -> Result<Dimension, ValidationError> {
        if raw == MATCH_ANY {
            return self.match_any();
        }
        let value = match &self.match_kind {
            MatchKind::Exact(ScalarKind::Long) | MatchKind::Range { .. } => {
                DimensionValue::Long(raw.parse().map_err(|_| {
                    self.unsupported(format!("'{}' is not an integer", raw))
                })?)
            },
            MatchKind::Exact(ScalarKind::Text) | MatchKind::CatchAll => {
                DimensionValue::Text(raw.to_string())
            },
            MatchKind::Hierarchy { .. } => split_path(raw),
        };
        self.create(value)
    }

    fn check_value(&self, value: &DimensionValue) -> Result<(), ValidationError> {
        match (&self.match_kind, value) {
            (MatchKind::Exact(ScalarKind::Long), DimensionValue::Long(_))
            | (MatchKind::Exact(ScalarKind::Text), DimensionValue::Text(_))
            | (MatchKind::CatchAll, DimensionValue::Text(_)) => Ok(()),
            (MatchKind::Range { boundaries }, DimensionValue::Long(v)) => match boundaries.first() {
                Some(lowest) if v >= lowest => Ok(()),
                _ => Err(self.unsupported(format!("{} is below the lowest range boundary", v))),
            },
            (MatchKind::Hierarchy { max_depth }, DimensionValue::Path(segments)) => {
                if segments.is_empty() || segments.len() > usize::from(*max_depth) {
                    return Err(self.unsupported(format!(
                        "path depth {} outside 1..={}",
                        segments.len(),
                        max_depth
                    )));
                }
                if segments.iter().any(|s| s.is_empty() || s.contains(PATH_SEPARATOR)) {
                    return Err(self.unsupported("path segments must be non-empty"));
                }
                Ok(())
            },
            (kind, value) => Err(self.unsupported(format!(
                "value {:?} does not fit match kind {:?}",
                value, kind
            ))),
        }
    }

    /// Specificity byte of a value (`None` is match-any)
    pub fn specificity(&self, value: Option<&DimensionValue>) -> u8 {
        let Some(value) = value else {
            return 1;
        };
        let base = self.base_hash();
        let offset = match (&self.match_kind, value) {
            (MatchKind::Range { boundaries }, DimensionValue::Long(v)) => {
                boundaries.partition_point(|b| b <= v).saturating_sub(1)
            },
            (MatchKind::Hierarchy { .. }, DimensionValue::Path(segments)) => {
                segments.len().saturating_sub(1)
            },
            (MatchKind::CatchAll, _) => return 1,
            _ => 0,
        };
        base.saturating_add(offset as u8)
    }

    /// Compare how specific two values are
    ///
    /// `Greater` means `a` is strictly more specific than `b`. Values that
    /// can never match each other (different exact values, different branches
    /// of a hierarchy) are not comparable.
    pub fn compare(
        &self,
        a: Option<&DimensionValue>,
        b: Option<&DimensionValue>,
    ) -> Result<Ordering, NotComparable> {
        let (a, b) = match (a, b) {
            (None, None) => return Ok(Ordering::Equal),
            (Some(_), None) => return Ok(Ordering::Greater),
            (None, Some(_)) => return Ok(Ordering::Less),
            (Some(a), Some(b)) => (a, b),
        };
        match (&self.match_kind, a, b) {
            (MatchKind::CatchAll, _, _) => Ok(Ordering::Equal),
            (MatchKind::Range { .. }, DimensionValue::Long(x), DimensionValue::Long(y)) => {
                Ok(x.cmp(y))
            },
            (MatchKind::Hierarchy { .. }, DimensionValue::Path(x), DimensionValue::Path(y)) => {
                if x.len() >= y.len() && x.starts_with(y) {
                    Ok(x.len().cmp(&y.len()))
                } else if y.starts_with(x) {
                    Ok(Ordering::Less)
                } else {
                    Err(NotComparable)
                }
            },
            _ if a == b => Ok(Ordering::Equal),
            _ => Err(NotComparable),
        }
    }

    /// Check that the dimensions this one requires are already present
    pub fn validate(&self, context: &ContextBuilder) -> Result<(), ValidationError> {
        for required in &self.requires {
            if !context.contains(required) {
                return Err(ValidationError::MissingDependency {
                    dimension: self.key.clone(),
                    requires: required.clone(),
                });
            }
        }
        Ok(())
    }
}

fn split_path(raw: &str) -> DimensionValue {
    DimensionValue::Path(raw.split(PATH_SEPARATOR).map(str::to_string).collect())
}

/// Builder for [`DimensionDef`]
pub struct DimensionDefBuilder {
    key: String,
    match_kind: MatchKind,
    hash_width: Option<u8>,
    match_any: bool,
    cacheable: bool,
    requires: Vec<String>,
}

impl DimensionDefBuilder {
    /// Reserve an explicit number of specificity bits
    ///
    /// Defaults to the fewest bits that hold the largest hash.
    pub fn hash_width(mut self, bits: u8) -> Self {
        self.hash_width = Some(bits);
        self
    }

    /// Accept the match-any value
    pub fn match_any(mut self, enabled: bool) -> Self {
        self.match_any = enabled;
        self
    }

    /// Mark high-cardinality dimensions that must not be cached
    pub fn cacheable(mut self, enabled: bool) -> Self {
        self.cacheable = enabled;
        self
    }

    /// Require another dimension to be present first
    pub fn requires(mut self, key: impl Into<String>) -> Self {
        self.requires.push(key.into());
        self
    }

    /// Validate and build the definition
    pub fn build(self) -> Result<DimensionDef, ValidationError> {
        let invalid = |message: String| ValidationError::InvalidDefinition {
            key: self.key.clone(),
            message,
        };
        if self.key.is_empty() {
            return Err(invalid("dimension key must not be empty".to_string()));
        }
        match &self.match_kind {
            MatchKind::Range { boundaries } => {
                if boundaries.is_empty() || boundaries.windows(2).any(|w| w[0] >= w[1]) {
                    return Err(invalid(
                        "range boundaries must be non-empty and strictly ascending".to_string(),
                    ));
                }
            },
            MatchKind::Hierarchy { max_depth } if *max_depth == 0 => {
                return Err(invalid("hierarchy max depth must be at least 1".to_string()));
            },
            _ => {},
        }

        let mut def = DimensionDef {
            key: self.key.clone(),
            hash_width: 0,
            match_kind: self.match_kind.clone(),
            match_any: self.match_any,
            cacheable: self.cacheable,
            requires: self.requires.clone(),
        };
        let max_hash = def.max_hash();
        let needed = (u32::BITS - max_hash.leading_zeros()) as u8;
        let width = self.hash_width.unwrap_or(needed);
        if width == 0 || width > MAX_HASH_WIDTH || needed > width {
            return Err(invalid(format!(
                "hash width {} cannot hold specificity {} (needs {} bits, max {})",
                width, max_hash, needed, MAX_HASH_WIDTH
            )));
        }
        def.hash_width = width;
        Ok(def)
    }
}

// ============================================================================
// Dimension
// ============================================================================

/// A dimension definition bound to a value
#[derive(Debug, Clone)]
pub struct Dimension {
    def: Arc<DimensionDef>,
    value: Option<DimensionValue>,
}

impl Dimension {
    /// The dimension's definition
    pub fn def(&self) -> &Arc<DimensionDef> {
        &self.def
    }

    /// Dimension key
    pub fn key(&self) -> &str {
        self.def.key()
    }

    /// Bound value; `None` is match-any
    pub fn value(&self) -> Option<&DimensionValue> {
        self.value.as_ref()
    }

    /// True when the dimension matches any value
    pub fn is_match_any(&self) -> bool {
        self.value.is_none()
    }

    /// Specificity byte
    pub fn specificity(&self) -> u8 {
        self.def.specificity(self.value.as_ref())
    }

    /// Storage form; `None` is match-any
    pub fn persisted(&self) -> Option<PersistedValue> {
        self.value.as_ref().map(|v| match v {
            DimensionValue::Long(n) => PersistedValue::Long(*n),
            DimensionValue::Text(s) => PersistedValue::Text(s.clone()),
            DimensionValue::Path(_) => PersistedValue::Text(v.to_string()),
        })
    }

    /// Text form accepted by [`DimensionDef::create_from_string`]
    pub fn to_string_value(&self) -> String {
        match &self.value {
            Some(v) => v.to_string(),
            None => MATCH_ANY.to_string(),
        }
    }
}

impl PartialEq for Dimension {
    fn eq(&self, other: &Self) -> bool {
        self.def.key() == other.def.key() && self.value == other.value
    }
}

impl Eq for Dimension {}

impl Hash for Dimension {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.def.key().hash(state);
        self.value.hash(state);
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key(), self.to_string_value())
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Process-wide set of dimension definitions, populated once at startup
#[derive(Debug, Default, Clone)]
pub struct DimensionRegistry {
    dimensions: HashMap<String, Arc<DimensionDef>>,
}

impl DimensionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a definition; keys must be unique
    pub fn register(&mut self, def: DimensionDef) -> Result<Arc<DimensionDef>, ValidationError> {
        if self.dimensions.contains_key(def.key()) {
            return Err(ValidationError::InvalidDefinition {
                key: def.key().to_string(),
                message: "dimension already registered".to_string(),
            });
        }
        let def = Arc::new(def);
        self.dimensions.insert(def.key().to_string(), Arc::clone(&def));
        tracing::debug!(dimension = def.key(), bits = def.hash_width(), "Dimension registered");
        Ok(def)
    }

    /// Look up a definition by key
    pub fn get(&self, key: &str) -> Option<&Arc<DimensionDef>> {
        self.dimensions.get(key)
    }

    /// Number of registered definitions
    pub fn len(&self) -> usize {
        self.dimensions.len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.dimensions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exact_text(key: &str) -> Arc<DimensionDef> {
        Arc::new(
            DimensionDef::builder(key, MatchKind::Exact(ScalarKind::Text))
                .match_any(true)
                .build()
                .unwrap(),
        )
    }

    fn region() -> Arc<DimensionDef> {
        Arc::new(
            DimensionDef::builder("region", MatchKind::Hierarchy { max_depth: 3 })
                .build()
                .unwrap(),
        )
    }

    fn amount() -> Arc<DimensionDef> {
        Arc::new(
            DimensionDef::builder(
                "amount",
                MatchKind::Range {
                    boundaries: vec![0, 100, 1_000],
                },
            )
            .build()
            .unwrap(),
        )
    }

    #[test]
    fn test_default_hash_width() {
        assert_eq!(exact_text("currency").hash_width(), 2);
        assert_eq!(region().hash_width(), 2);
        assert_eq!(amount().hash_width(), 2);
        let flag = DimensionDef::builder("account", MatchKind::Exact(ScalarKind::Long))
            .build()
            .unwrap();
        assert_eq!(flag.hash_width(), 1);
    }

    #[test]
    fn test_explicit_width_too_small() {
        let result = DimensionDef::builder("region", MatchKind::Hierarchy { max_depth: 5 })
            .hash_width(2)
            .build();
        assert!(matches!(result, Err(ValidationError::InvalidDefinition { .. })));
    }

    #[test]
    fn test_hash_values() {
        let currency = exact_text("currency");
        assert_eq!(currency.match_any().unwrap().specificity(), 1);
        assert_eq!(currency.create_from_string("USD").unwrap().specificity(), 2);

        let region = region();
        assert_eq!(region.create_from_string("eu").unwrap().specificity(), 1);
        assert_eq!(region.create_from_string("eu/de/berlin").unwrap().specificity(), 3);

        let amount = amount();
        assert_eq!(amount.create_from_string("50").unwrap().specificity(), 1);
        assert_eq!(amount.create_from_string("100").unwrap().specificity(), 2);
        assert_eq!(amount.create_from_string("99999").unwrap().specificity(), 3);
    }

    #[test]
    fn test_exact_compare() {
        let currency = exact_text("currency");
        let usd = DimensionValue::Text("USD".to_string());
        let eur = DimensionValue::Text("EUR".to_string());
        assert_eq!(currency.compare(Some(&usd), Some(&usd)), Ok(Ordering::Equal));
        assert_eq!(currency.compare(Some(&usd), None), Ok(Ordering::Greater));
        assert_eq!(currency.compare(None, Some(&usd)), Ok(Ordering::Less));
        assert_eq!(currency.compare(Some(&usd), Some(&eur)), Err(NotComparable));
    }

    #[test]
    fn test_hierarchy_compare() {
        let region = region();
        let eu = split_path("eu");
        let de = split_path("eu/de");
        let fr = split_path("eu/fr");
        assert_eq!(region.compare(Some(&de), Some(&eu)), Ok(Ordering::Greater));
        assert_eq!(region.compare(Some(&eu), Some(&de)), Ok(Ordering::Less));
        assert_eq!(region.compare(Some(&de), Some(&fr)), Err(NotComparable));
    }

    #[test]
    fn test_range_compare_orders_thresholds() {
        let amount = amount();
        let low = DimensionValue::Long(100);
        let high = DimensionValue::Long(1_000);
        assert_eq!(amount.compare(Some(&high), Some(&low)), Ok(Ordering::Greater));
        assert!(amount.create(DimensionValue::Long(-1)).is_err());
    }

    #[test]
    fn test_catch_all_always_equal() {
        let def = Arc::new(DimensionDef::builder("channel", MatchKind::CatchAll).build().unwrap());
        let web = def.create_from_string("web").unwrap();
        let pos = def.create_from_string("pos").unwrap();
        assert_eq!(web.specificity(), 1);
        assert_eq!(def.compare(web.value(), pos.value()), Ok(Ordering::Equal));
    }

    #[test]
    fn test_match_any_requires_support() {
        let account = Arc::new(
            DimensionDef::builder("account", MatchKind::Exact(ScalarKind::Long))
                .build()
                .unwrap(),
        );
        assert!(account.match_any().is_err());
        assert!(account.create_from_string("*").is_err());
        assert!(account.create_from_string("abc").is_err());
    }

    #[test]
    fn test_persisted_roundtrip() {
        let region = region();
        let dim = region.create_from_string("eu/de").unwrap();
        let persisted = dim.persisted();
        assert_eq!(persisted, Some(PersistedValue::Text("eu/de".to_string())));
        let rebuilt = region.create_from_persisted(persisted.as_ref()).unwrap();
        assert_eq!(rebuilt, dim);

        let currency = exact_text("currency");
        let any = currency.create_from_persisted(None).unwrap();
        assert!(any.is_match_any());
        assert_eq!(any.to_string(), "currency=*");
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let mut registry = DimensionRegistry::new();
        let def = DimensionDef::builder("currency", MatchKind::Exact(ScalarKind::Text))
            .build()
            .unwrap();
        registry.register(def.clone()).unwrap();
        assert!(registry.register(def).is_err());
        assert_eq!(registry.len(), 1);
        assert!(registry.get("currency").is_some());
    }
}
