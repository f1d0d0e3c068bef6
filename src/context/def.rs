//! Context definitions: ordered dimension lists packed into a 63-bit depth

use std::collections::HashMap;
use std::sync::Arc;

use super::context::{Context, ContextBuilder};
use super::dimension::{Dimension, DimensionDef};
use crate::error::ValidationError;

/// Bits available for specificity (the sign bit of the depth stays clear)
pub const DEPTH_BITS: u32 = 63;

/// Position of one dimension inside the packed depth
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Slot {
    pub(crate) index: usize,
    pub(crate) shift: u32,
}

/// An ordered list of dimensions, most important first
///
/// The most important dimension occupies the highest bits of the depth, so
/// comparing two depths as integers compares specificity lexicographically
/// by importance.
#[derive(Debug)]
pub struct ContextDef {
    name: String,
    dimensions: Vec<Arc<DimensionDef>>,
    slots: HashMap<String, Slot>,
    used_bits: u32,
}

impl ContextDef {
    /// Pack the dimensions and fail if they need more than 63 bits
    pub fn new(
        name: impl Into<String>,
        dimensions: Vec<Arc<DimensionDef>>,
    ) -> Result<Arc<Self>, ValidationError> {
        let name = name.into();
        let mut slots = HashMap::with_capacity(dimensions.len());
        let mut cursor = DEPTH_BITS;
        let mut used_bits = 0u32;

        for (index, dim) in dimensions.iter().enumerate() {
            let width = u32::from(dim.hash_width());
            used_bits += width;
            if used_bits > DEPTH_BITS {
                return Err(ValidationError::BitBudgetExceeded {
                    context_def: name,
                    bits: dimensions.iter().map(|d| u32::from(d.hash_width())).sum(),
                });
            }
            cursor -= width;
            let slot = Slot {
                index,
                shift: cursor,
            };
            if slots.insert(dim.key().to_string(), slot).is_some() {
                return Err(ValidationError::InvalidDefinition {
                    key: name,
                    message: format!("dimension '{}' listed twice", dim.key()),
                });
            }
        }

        Ok(Arc::new(Self {
            name,
            dimensions,
            slots,
            used_bits,
        }))
    }

    /// Definition name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dimensions in importance order
    pub fn dimensions(&self) -> &[Arc<DimensionDef>] {
        &self.dimensions
    }

    /// Look up a dimension definition by key
    pub fn dimension(&self, key: &str) -> Option<&Arc<DimensionDef>> {
        self.slots.get(key).map(|slot| &self.dimensions[slot.index])
    }

    /// True when the key is one of this definition's dimensions
    pub fn supports(&self, key: &str) -> bool {
        self.slots.contains_key(key)
    }

    /// Bit offset of a dimension's specificity byte
    pub fn shift_of(&self, key: &str) -> Option<u32> {
        self.slots.get(key).map(|slot| slot.shift)
    }

    /// Total specificity bits in use
    pub fn used_bits(&self) -> u32 {
        self.used_bits
    }

    pub(crate) fn slot(&self, key: &str) -> Option<Slot> {
        self.slots.get(key).copied()
    }

    /// Start an empty context
    pub fn builder(self: &Arc<Self>) -> ContextBuilder {
        ContextBuilder::new(Arc::clone(self))
    }

    /// The empty (root) context
    pub fn root(self: &Arc<Self>) -> Context {
        self.builder().build()
    }

    /// Build a context from dimensions added in order
    pub fn context<I>(self: &Arc<Self>, dimensions: I) -> Result<Context, ValidationError>
    where
        I: IntoIterator<Item = Dimension>,
    {
        let mut builder = self.builder();
        for dim in dimensions {
            builder.add(dim)?;
        }
        Ok(builder.build())
    }

    /// Build a context from `(key, text)` pairs
    pub fn parse<'a, I>(self: &Arc<Self>, pairs: I) -> Result<Context, ValidationError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut builder = self.builder();
        for (key, raw) in pairs {
            match self.dimension(key) {
                Some(def) => {
                    builder.add(def.create_from_string(raw)?)?;
                },
                None => {
                    tracing::trace!(context_def = %self.name, dimension = key, "Ignoring unsupported dimension");
                },
            }
        }
        Ok(builder.build())
    }
}

impl PartialEq for ContextDef {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for ContextDef {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::dimension::{MatchKind, ScalarKind};

    fn long_dim(key: &str, width: u8) -> Arc<DimensionDef> {
        Arc::new(
            DimensionDef::builder(key, MatchKind::Exact(ScalarKind::Long))
                .hash_width(width)
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_shifts_descend_by_importance() {
        let def = ContextDef::new("merchant", vec![long_dim("account", 2), long_dim("merchant", 3)])
            .unwrap();
        assert_eq!(def.shift_of("account"), Some(61));
        assert_eq!(def.shift_of("merchant"), Some(58));
        assert_eq!(def.used_bits(), 5);
        assert!(def.supports("merchant"));
        assert!(!def.supports("currency"));
    }

    #[test]
    fn test_bit_budget() {
        let dims: Vec<_> = (0..8).map(|i| long_dim(&format!("d{}", i), 8)).collect();
        let err = ContextDef::new("wide", dims).unwrap_err();
        assert_eq!(
            err,
            ValidationError::BitBudgetExceeded {
                context_def: "wide".to_string(),
                bits: 64
            }
        );

        let mut dims: Vec<_> = (0..7).map(|i| long_dim(&format!("d{}", i), 8)).collect();
        dims.push(long_dim("last", 7));
        assert_eq!(ContextDef::new("exact", dims).unwrap().used_bits(), 63);
    }

    #[test]
    fn test_duplicate_dimension_rejected() {
        let account = long_dim("account", 1);
        assert!(ContextDef::new("dup", vec![account.clone(), account]).is_err());
    }
}
