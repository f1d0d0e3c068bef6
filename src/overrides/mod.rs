//! Override resolution and cascading bound validation
//!
//! Config values are stored as overrides keyed by context. A lookup picks the
//! most specific override whose context matches the query context. Entries
//! with a [`Constraint`] additionally require every override to stay within
//! the bound set by each of its ancestors:
//!
//! ```text
//!   {}            max 10
//!   {account=1}   max  9    ok: 9 <= 10
//!   {account=1,
//!    merchant=2}  max  8    ok: 8 <= 9 and 8 <= 10
//! ```
//!
//! Tightening an ancestor below an existing descendant either fails
//! ([`ConflictPolicy::Reject`]) or removes the descendant so it falls back
//! to the new bound ([`ConflictPolicy::Cascade`]).

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeSet;

use crate::context::{is_matching, Context};
use crate::error::ValidationError;
use crate::value::Value;

/// Bound direction enforced between ancestors and descendants
///
/// For set-valued entries `Max` means subset and `Min` means superset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Constraint {
    /// Descendants may not exceed their ancestors
    Max,
    /// Descendants may not fall below their ancestors
    Min,
}

impl Constraint {
    /// Lowercase name used in messages
    pub fn name(&self) -> &'static str {
        match self {
            Constraint::Max => "max",
            Constraint::Min => "min",
        }
    }
}

/// What to do with descendants that violate a newly written bound
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Fail the write
    Reject,
    /// Remove the violating descendants in the same transaction
    #[default]
    Cascade,
}

/// A stored value at a context
#[derive(Debug, Clone, PartialEq)]
pub struct Override<V> {
    /// Context the value applies to
    pub context: Context,
    /// Stored value
    pub value: V,
}

/// Values that can be checked against an ancestor's bound
pub trait Bounded {
    /// True when `self` stays within `bound` under `constraint`
    fn satisfies(&self, bound: &Self, constraint: Constraint) -> bool;

    /// Rendering used in validation errors
    fn render(&self) -> String;
}

impl Bounded for Value {
    fn satisfies(&self, bound: &Self, constraint: Constraint) -> bool {
        match (self.compare(bound), constraint) {
            (Some(order), Constraint::Max) => order != Ordering::Greater,
            (Some(order), Constraint::Min) => order != Ordering::Less,
            (None, _) => false,
        }
    }

    fn render(&self) -> String {
        self.to_string()
    }
}

impl Bounded for BTreeSet<Value> {
    fn satisfies(&self, bound: &Self, constraint: Constraint) -> bool {
        match constraint {
            Constraint::Max => self.is_subset(bound),
            Constraint::Min => self.is_superset(bound),
        }
    }

    fn render(&self) -> String {
        let members: Vec<String> = self.iter().map(Value::to_string).collect();
        format!("[{}]", members.join(", "))
    }
}

/// Most specific override applying to `query`
///
/// Highest depth wins; equal depths (range values in the same boundary
/// bucket) are broken by direct comparison.
pub fn resolve<'a, V>(overrides: &'a [Override<V>], query: &Context) -> Option<&'a Override<V>> {
    let mut best: Option<&Override<V>> = None;
    for candidate in overrides.iter().filter(|o| is_matching(&o.context, query)) {
        best = match best {
            None => Some(candidate),
            Some(current) => {
                let better = match candidate.context.depth().cmp(&current.context.depth()) {
                    Ordering::Greater => true,
                    Ordering::Less => false,
                    Ordering::Equal => {
                        candidate.context.compare_to(&current.context) == Ok(Ordering::Greater)
                    },
                };
                Some(if better { candidate } else { current })
            },
        };
    }
    best
}

/// Validate a write of `value` at `context` against stored overrides
///
/// Returns the descendant contexts to delete alongside the write. Nothing is
/// returned or checked when the entry has no constraint.
pub fn plan_write<V: Bounded>(
    config_key: &str,
    constraint: Option<Constraint>,
    policy: ConflictPolicy,
    overrides: &[Override<V>],
    context: &Context,
    value: &V,
) -> Result<Vec<Context>, ValidationError> {
    let Some(constraint) = constraint else {
        return Ok(Vec::new());
    };

    for ancestor in overrides.iter().filter(|o| o.context.is_ancestor_of(context)) {
        if !value.satisfies(&ancestor.value, constraint) {
            return Err(ValidationError::BoundViolation {
                config_key: config_key.to_string(),
                context: context.to_string(),
                value: value.render(),
                bound_context: ancestor.context.to_string(),
                bound: ancestor.value.render(),
                bound_kind: constraint.name(),
            });
        }
    }

    let mut removals = Vec::new();
    for descendant in overrides.iter().filter(|o| context.is_ancestor_of(&o.context)) {
        if descendant.value.satisfies(value, constraint) {
            continue;
        }
        match policy {
            ConflictPolicy::Reject => {
                return Err(ValidationError::DescendantViolation {
                    config_key: config_key.to_string(),
                    context: context.to_string(),
                    bound: value.render(),
                    descendant: descendant.context.to_string(),
                    value: descendant.value.render(),
                })
            },
            ConflictPolicy::Cascade => removals.push(descendant.context.clone()),
        }
    }
    if !removals.is_empty() {
        tracing::debug!(
            config = config_key,
            context = %context,
            removed = removals.len(),
            "Cascading bound removes descendant overrides"
        );
    }
    Ok(removals)
}

/// Apply add/remove deltas to a resolved set
pub fn apply_set_delta(
    current: &BTreeSet<Value>,
    add: &BTreeSet<Value>,
    remove: &BTreeSet<Value>,
) -> BTreeSet<Value> {
    current
        .iter()
        .chain(add.iter())
        .filter(|v| !remove.contains(*v))
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ContextDef, DimensionDef, MatchKind, ScalarKind};
    use std::sync::Arc;

    fn def() -> Arc<ContextDef> {
        let account = DimensionDef::builder("account", MatchKind::Exact(ScalarKind::Long))
            .build()
            .unwrap();
        let merchant = DimensionDef::builder("merchant", MatchKind::Exact(ScalarKind::Long))
            .build()
            .unwrap();
        let amount = DimensionDef::builder(
            "amount",
            MatchKind::Range {
                boundaries: vec![0, 1_000],
            },
        )
        .build()
        .unwrap();
        ContextDef::new(
            "limits",
            vec![Arc::new(account), Arc::new(merchant), Arc::new(amount)],
        )
        .unwrap()
    }

    fn ctx(def: &Arc<ContextDef>, pairs: &[(&str, &str)]) -> Context {
        def.parse(pairs.iter().copied()).unwrap()
    }

    fn ov(context: Context, value: i64) -> Override<Value> {
        Override {
            context,
            value: Value::Long(value),
        }
    }

    #[test]
    fn test_resolve_most_specific() {
        let def = def();
        let overrides = vec![
            ov(def.root(), 10),
            ov(ctx(&def, &[("account", "1")]), 9),
            ov(ctx(&def, &[("account", "2")]), 5),
        ];
        let query = ctx(&def, &[("account", "1"), ("merchant", "2")]);
        assert_eq!(resolve(&overrides, &query).unwrap().value, Value::Long(9));

        let query = ctx(&def, &[("account", "3")]);
        assert_eq!(resolve(&overrides, &query).unwrap().value, Value::Long(10));
        assert!(resolve(&overrides[1..], &query).is_none());
    }

    #[test]
    fn test_resolve_range_tie_break() {
        let def = def();
        let overrides = vec![
            ov(ctx(&def, &[("amount", "100")]), 1),
            ov(ctx(&def, &[("amount", "500")]), 2),
            ov(ctx(&def, &[("amount", "900")]), 3),
        ];
        let query = ctx(&def, &[("amount", "600")]);
        assert_eq!(resolve(&overrides, &query).unwrap().value, Value::Long(2));

        // Closest threshold wins wherever it sits in the list
        let overrides = vec![
            ov(ctx(&def, &[("amount", "900")]), 3),
            ov(ctx(&def, &[("amount", "300")]), 4),
            ov(ctx(&def, &[("amount", "500")]), 2),
            ov(ctx(&def, &[("amount", "100")]), 1),
        ];
        assert_eq!(resolve(&overrides, &query).unwrap().value, Value::Long(2));

        let a = ctx(&def, &[("amount", "500")]);
        let b = ctx(&def, &[("amount", "100")]);
        assert_eq!(a.depth(), b.depth());
        assert_eq!(a.compare_to(&b), Ok(Ordering::Greater));
        assert_eq!(b.compare_to(&a), Ok(Ordering::Less));
    }

    #[test]
    fn test_ancestor_bound_enforced() {
        let def = def();
        let overrides = vec![ov(def.root(), 10), ov(ctx(&def, &[("account", "1")]), 9)];
        let child = ctx(&def, &[("account", "1"), ("merchant", "2")]);

        let removals = plan_write(
            "limit",
            Some(Constraint::Max),
            ConflictPolicy::Cascade,
            &overrides,
            &child,
            &Value::Long(8),
        )
        .unwrap();
        assert!(removals.is_empty());

        let err = plan_write(
            "limit",
            Some(Constraint::Max),
            ConflictPolicy::Cascade,
            &overrides,
            &ctx(&def, &[("account", "1")]),
            &Value::Long(11),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::BoundViolation { bound_kind: "max", .. }));
    }

    #[test]
    fn test_tightening_cascades_or_rejects() {
        let def = def();
        let account = ctx(&def, &[("account", "1")]);
        let merchant = ctx(&def, &[("account", "1"), ("merchant", "2")]);
        let overrides = vec![
            ov(def.root(), 10),
            ov(account.clone(), 9),
            ov(merchant.clone(), 8),
        ];
        let root = def.root();

        let removals = plan_write(
            "limit",
            Some(Constraint::Max),
            ConflictPolicy::Cascade,
            &overrides,
            &root,
            &Value::Long(7),
        )
        .unwrap();
        assert_eq!(removals, vec![account, merchant]);

        let err = plan_write(
            "limit",
            Some(Constraint::Max),
            ConflictPolicy::Reject,
            &overrides,
            &root,
            &Value::Long(7),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::DescendantViolation { .. }));
    }

    #[test]
    fn test_unconstrained_write_skips_checks() {
        let def = def();
        let overrides = vec![ov(def.root(), 1)];
        let removals = plan_write(
            "label",
            None,
            ConflictPolicy::Reject,
            &overrides,
            &ctx(&def, &[("account", "1")]),
            &Value::Long(100),
        )
        .unwrap();
        assert!(removals.is_empty());
    }

    #[test]
    fn test_set_subset_bound() {
        let def = def();
        let set = |items: &[&str]| -> BTreeSet<Value> {
            items.iter().map(|s| Value::Text(s.to_string())).collect()
        };
        let overrides = vec![Override {
            context: def.root(),
            value: set(&["USD", "EUR", "GBP"]),
        }];
        let account = ctx(&def, &[("account", "1")]);

        assert!(plan_write(
            "currencies",
            Some(Constraint::Max),
            ConflictPolicy::Reject,
            &overrides,
            &account,
            &set(&["USD", "EUR"]),
        )
        .is_ok());
        assert!(plan_write(
            "currencies",
            Some(Constraint::Max),
            ConflictPolicy::Reject,
            &overrides,
            &account,
            &set(&["USD", "JPY"]),
        )
        .is_err());
        assert!(plan_write(
            "currencies",
            Some(Constraint::Min),
            ConflictPolicy::Reject,
            &overrides,
            &account,
            &set(&["USD", "EUR", "GBP", "JPY"]),
        )
        .is_ok());
    }

    #[test]
    fn test_apply_set_delta() {
        let current: BTreeSet<Value> = [Value::Long(1), Value::Long(2)].into_iter().collect();
        let add: BTreeSet<Value> = [Value::Long(3)].into_iter().collect();
        let remove: BTreeSet<Value> = [Value::Long(1)].into_iter().collect();
        let next = apply_set_delta(&current, &add, &remove);
        assert_eq!(next, [Value::Long(2), Value::Long(3)].into_iter().collect());
    }
}
