//! Context instances, their builder, and resolution predicates

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use super::def::ContextDef;
use super::dimension::{Dimension, DimensionDef};
use crate::error::{NotComparable, ValidationError};
use crate::value::PersistedValue;

// ============================================================================
// Context
// ============================================================================

/// An immutable set of dimension values bound to a [`ContextDef`]
#[derive(Debug, Clone)]
pub struct Context {
    def: Arc<ContextDef>,
    dimensions: BTreeMap<usize, Dimension>,
    depth: u64,
    dimension_mask: u64,
    cacheable: bool,
    valid_for_query: bool,
}

impl Context {
    /// Definition this context was built from
    pub fn def(&self) -> &Arc<ContextDef> {
        &self.def
    }

    /// Packed specificity; greater is more specific
    pub fn depth(&self) -> u64 {
        self.depth
    }

    /// Bit `i` is set when the i-th dimension of the definition is present
    pub fn dimension_mask(&self) -> u64 {
        self.dimension_mask
    }

    /// False when any dimension is marked non-cacheable
    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    /// False when any dimension holds match-any
    pub fn is_valid_for_query(&self) -> bool {
        self.valid_for_query
    }

    /// True for the root context
    pub fn is_root(&self) -> bool {
        self.dimensions.is_empty()
    }

    /// Dimension bound for `key`, if present
    pub fn get(&self, key: &str) -> Option<&Dimension> {
        self.def
            .slot(key)
            .and_then(|slot| self.dimensions.get(&slot.index))
    }

    /// Dimensions in importance order
    pub fn dimensions(&self) -> impl Iterator<Item = &Dimension> {
        self.dimensions.values()
    }

    /// Number of dimensions present
    pub fn len(&self) -> usize {
        self.dimensions.len()
    }

    /// True for the root context
    pub fn is_empty(&self) -> bool {
        self.dimensions.is_empty()
    }

    /// Builder seeded with this context's dimensions
    pub fn to_builder(&self) -> ContextBuilder {
        ContextBuilder {
            def: Arc::clone(&self.def),
            dimensions: self.dimensions.clone(),
            depth: self.depth,
            dimension_mask: self.dimension_mask,
        }
    }

    /// Context keeping only the listed dimension keys
    pub fn project(&self, keys: &[String]) -> Context {
        let mut builder = self.to_builder();
        for dim in self.dimensions() {
            if !keys.iter().any(|k| k == dim.key()) {
                builder.remove(dim.key());
            }
        }
        builder.build()
    }

    /// Specificity order; fails when some dimension pair is unrelated
    ///
    /// Equal depths fall back to the first dimension, in importance order,
    /// whose values differ (range thresholds in the same boundary bucket).
    pub fn compare_to(&self, other: &Context) -> Result<Ordering, NotComparable> {
        let mut slots = Ordering::Equal;
        for (index, def) in self.def.dimensions().iter().enumerate() {
            let order = compare_slot(def, self.dimensions.get(&index), other.dimensions.get(&index))?;
            if slots == Ordering::Equal {
                slots = order;
            }
        }
        Ok(self.depth.cmp(&other.depth).then(slots))
    }

    /// True when `self` is a strict ancestor of `other`
    pub fn is_ancestor_of(&self, other: &Context) -> bool {
        self != other && is_matching(self, other)
    }

    /// Storage form
    pub fn persisted(&self) -> PersistedContext {
        PersistedContext {
            context_def: self.def.name().to_string(),
            depth: self.depth,
            dimensions: self
                .dimensions()
                .map(|d| (d.key().to_string(), d.persisted()))
                .collect(),
        }
    }

    /// Rebuild a context from storage
    pub fn from_persisted(
        def: &Arc<ContextDef>,
        persisted: &PersistedContext,
    ) -> Result<Context, ValidationError> {
        if persisted.context_def != def.name() {
            return Err(ValidationError::ContextDefMismatch {
                expected: def.name().to_string(),
                actual: persisted.context_def.clone(),
            });
        }
        let mut builder = def.builder();
        for (key, value) in &persisted.dimensions {
            if let Some(dim_def) = def.dimension(key) {
                builder.add(dim_def.create_from_persisted(value.as_ref())?)?;
            }
        }
        Ok(builder.build())
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        self.def.name() == other.def.name() && self.dimensions == other.dimensions
    }
}

impl Eq for Context {}

impl Hash for Context {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.def.name().hash(state);
        for dim in self.dimensions.values() {
            dim.hash(state);
        }
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, dim) in self.dimensions().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", dim)?;
        }
        f.write_str("}")
    }
}

// ============================================================================
// Builder
// ============================================================================

/// Mutable accumulator for a [`Context`]
///
/// Dimensions not declared by the definition are ignored. Depth is maintained
/// incrementally: adding ORs the dimension's hash into its slot, removing
/// clears the slot.
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    def: Arc<ContextDef>,
    dimensions: BTreeMap<usize, Dimension>,
    depth: u64,
    dimension_mask: u64,
}

impl ContextBuilder {
    pub(crate) fn new(def: Arc<ContextDef>) -> Self {
        Self {
            def,
            dimensions: BTreeMap::new(),
            depth: 0,
            dimension_mask: 0,
        }
    }

    /// Add or replace a dimension
    ///
    /// A newly added dimension must have its required dimensions present.
    pub fn add(&mut self, dim: Dimension) -> Result<&mut Self, ValidationError> {
        let Some(slot) = self.def.slot(dim.key()) else {
            tracing::trace!(
                context_def = self.def.name(),
                dimension = dim.key(),
                "Ignoring unsupported dimension"
            );
            return Ok(self);
        };

        match self.dimensions.get(&slot.index) {
            Some(previous) => {
                self.depth &= !(u64::from(previous.specificity()) << slot.shift);
            },
            None => dim.def().validate(self)?,
        }
        self.depth |= u64::from(dim.specificity()) << slot.shift;
        self.dimension_mask |= 1 << slot.index;
        self.dimensions.insert(slot.index, dim);
        Ok(self)
    }

    /// Chaining form of [`ContextBuilder::add`]
    pub fn with(mut self, dim: Dimension) -> Result<Self, ValidationError> {
        self.add(dim)?;
        Ok(self)
    }

    /// Remove a dimension by key
    pub fn remove(&mut self, key: &str) -> Option<Dimension> {
        let slot = self.def.slot(key)?;
        let removed = self.dimensions.remove(&slot.index)?;
        self.depth &= !(u64::from(removed.specificity()) << slot.shift);
        self.dimension_mask &= !(1 << slot.index);
        Some(removed)
    }

    /// True when a dimension with `key` is present
    pub fn contains(&self, key: &str) -> bool {
        self.def
            .slot(key)
            .is_some_and(|slot| self.dimensions.contains_key(&slot.index))
    }

    /// Freeze the builder into a context
    pub fn build(&self) -> Context {
        Context {
            def: Arc::clone(&self.def),
            dimensions: self.dimensions.clone(),
            depth: self.depth,
            dimension_mask: self.dimension_mask,
            cacheable: self.dimensions.values().all(|d| d.def().is_cacheable()),
            valid_for_query: self.dimensions.values().all(|d| !d.is_match_any()),
        }
    }
}

// ============================================================================
// Resolution Predicates
// ============================================================================

fn compare_slot(
    def: &DimensionDef,
    a: Option<&Dimension>,
    b: Option<&Dimension>,
) -> Result<Ordering, NotComparable> {
    match (a, b) {
        (None, None) => Ok(Ordering::Equal),
        (Some(_), None) => Ok(Ordering::Greater),
        (None, Some(_)) => Ok(Ordering::Less),
        (Some(a), Some(b)) => def.compare(a.value(), b.value()),
    }
}

fn all_slots(stored: &Context, query: &Context, accept: impl Fn(Ordering) -> bool) -> bool {
    if stored.def.name() != query.def.name() {
        return false;
    }
    stored
        .def
        .dimensions()
        .iter()
        .enumerate()
        .all(|(index, def)| {
            compare_slot(def, stored.dimensions.get(&index), query.dimensions.get(&index))
                .is_ok_and(&accept)
        })
}

/// True when `stored` applies to `query`: every dimension of `stored` is at
/// most as specific as the matching dimension of `query`
pub fn is_matching(stored: &Context, query: &Context) -> bool {
    all_slots(stored, query, |o| o != Ordering::Greater)
}

/// True when `stored` is at least as specific as `query` in every dimension
pub fn is_containing(stored: &Context, query: &Context) -> bool {
    all_slots(stored, query, |o| o != Ordering::Less)
}

// ============================================================================
// Persisted Form
// ============================================================================

/// Storage form of a context, ordered by importance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PersistedContext {
    /// Name of the context definition
    pub context_def: String,
    /// Packed specificity
    pub depth: u64,
    /// `(dimension key, value)` pairs; `None` is match-any
    pub dimensions: Vec<(String, Option<PersistedValue>)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::dimension::{DimensionValue, MatchKind, ScalarKind};

    struct Fixture {
        def: Arc<ContextDef>,
        account: Arc<DimensionDef>,
        merchant: Arc<DimensionDef>,
        currency: Arc<DimensionDef>,
        region: Arc<DimensionDef>,
    }

    fn fixture() -> Fixture {
        let account = Arc::new(
            DimensionDef::builder("account", MatchKind::Exact(ScalarKind::Long))
                .build()
                .unwrap(),
        );
        let merchant = Arc::new(
            DimensionDef::builder("merchant", MatchKind::Exact(ScalarKind::Long))
                .requires("account")
                .cacheable(false)
                .build()
                .unwrap(),
        );
        let currency = Arc::new(
            DimensionDef::builder("currency", MatchKind::Exact(ScalarKind::Text))
                .match_any(true)
                .build()
                .unwrap(),
        );
        let region = Arc::new(
            DimensionDef::builder("region", MatchKind::Hierarchy { max_depth: 3 })
                .build()
                .unwrap(),
        );
        let def = ContextDef::new(
            "payments",
            vec![account.clone(), merchant.clone(), currency.clone(), region.clone()],
        )
        .unwrap();
        Fixture {
            def,
            account,
            merchant,
            currency,
            region,
        }
    }

    fn ctx(f: &Fixture, pairs: &[(&str, &str)]) -> Context {
        f.def.parse(pairs.iter().copied()).unwrap()
    }

    #[test]
    fn test_depth_add_remove() {
        let f = fixture();
        let mut builder = f.def.builder();
        builder
            .add(f.account.create(DimensionValue::Long(1)).unwrap())
            .unwrap();
        let with_account = builder.build().depth();
        builder
            .add(f.currency.create_from_string("USD").unwrap())
            .unwrap();
        assert!(builder.build().depth() > with_account);
        builder.remove("currency");
        assert_eq!(builder.build().depth(), with_account);
        assert_eq!(builder.build().dimension_mask(), 0b1);
    }

    #[test]
    fn test_replace_dimension_keeps_depth_consistent() {
        let f = fixture();
        let mut builder = f.def.builder();
        builder.add(f.region.create_from_string("eu/de").unwrap()).unwrap();
        builder.add(f.region.create_from_string("eu").unwrap()).unwrap();
        let expected = ctx(&f, &[("region", "eu")]);
        assert_eq!(builder.build().depth(), expected.depth());
    }

    #[test]
    fn test_unsupported_dimension_ignored() {
        let f = fixture();
        let other = Arc::new(
            DimensionDef::builder("channel", MatchKind::CatchAll)
                .build()
                .unwrap(),
        );
        let built = f
            .def
            .builder()
            .with(other.create_from_string("web").unwrap())
            .unwrap()
            .build();
        assert!(built.is_root());
    }

    #[test]
    fn test_dependency_order_enforced() {
        let f = fixture();
        let err = f
            .def
            .builder()
            .with(f.merchant.create(DimensionValue::Long(9)).unwrap())
            .unwrap_err();
        assert!(matches!(err, ValidationError::MissingDependency { .. }));

        let ok = ctx(&f, &[("account", "1"), ("merchant", "9")]);
        assert_eq!(ok.len(), 2);
        assert!(!ok.is_cacheable());
    }

    #[test]
    fn test_match_any_not_queryable() {
        let f = fixture();
        let c = ctx(&f, &[("currency", "*")]);
        assert!(!c.is_valid_for_query());
        assert!(ctx(&f, &[("currency", "EUR")]).is_valid_for_query());
    }

    #[test]
    fn test_matching_and_containing() {
        let f = fixture();
        let root = f.def.root();
        let account = ctx(&f, &[("account", "1")]);
        let full = ctx(&f, &[("account", "1"), ("currency", "USD")]);
        let other_account = ctx(&f, &[("account", "2"), ("currency", "USD")]);
        let any_currency = ctx(&f, &[("currency", "*")]);

        assert!(is_matching(&root, &full));
        assert!(is_matching(&account, &full));
        assert!(!is_matching(&account, &other_account));
        assert!(is_matching(&any_currency, &full));
        assert!(is_containing(&full, &account));
        assert!(!is_containing(&account, &full));

        assert!(account.is_ancestor_of(&full));
        assert!(!full.is_ancestor_of(&full));
    }

    #[test]
    fn test_hierarchy_matching() {
        let f = fixture();
        let eu = ctx(&f, &[("region", "eu")]);
        let berlin = ctx(&f, &[("region", "eu/de/berlin")]);
        let paris = ctx(&f, &[("region", "eu/fr/paris")]);
        assert!(is_matching(&eu, &berlin));
        assert!(!is_matching(&berlin, &paris));
        assert_eq!(berlin.compare_to(&eu), Ok(Ordering::Greater));
        assert_eq!(berlin.compare_to(&paris), Err(NotComparable));
    }

    #[test]
    fn test_importance_dominates_depth() {
        let f = fixture();
        let account = ctx(&f, &[("account", "1")]);
        let currency_region = ctx(&f, &[("currency", "USD"), ("region", "eu/de/berlin")]);
        assert!(account.depth() > currency_region.depth());
    }

    #[test]
    fn test_persisted_roundtrip() {
        let f = fixture();
        let c = ctx(&f, &[("account", "1"), ("currency", "*"), ("region", "eu/de")]);
        let persisted = c.persisted();
        assert_eq!(persisted.depth, c.depth());
        let rebuilt = Context::from_persisted(&f.def, &persisted).unwrap();
        assert_eq!(rebuilt, c);
        assert_eq!(rebuilt.depth(), c.depth());
        assert_eq!(c.to_string(), "{account=1, currency=*, region=eu/de}");
    }

    #[test]
    fn test_equal_contexts_hash_alike() {
        let f = fixture();
        let mut set = std::collections::HashSet::new();
        set.insert(ctx(&f, &[("account", "1"), ("region", "eu/de")]));
        set.insert(ctx(&f, &[("region", "eu/de"), ("account", "1")]));
        set.insert(ctx(&f, &[("account", "1"), ("region", "eu")]));
        assert_eq!(set.len(), 2);
        assert!(set.contains(&ctx(&f, &[("region", "eu"), ("account", "1")])));
    }

    #[test]
    fn test_project() {
        let f = fixture();
        let c = ctx(&f, &[("account", "1"), ("currency", "USD")]);
        let projected = c.project(&["currency".to_string()]);
        assert_eq!(projected, ctx(&f, &[("currency", "USD")]));
    }
}
