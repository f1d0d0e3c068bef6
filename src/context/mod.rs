//! Multi-dimensional contexts
//!
//! A context is a set of dimension values, such as
//! `{account=42, currency=USD}`. Contexts form a hierarchy: the empty context
//! is the root, and a context is an ancestor of every context it matches.
//!
//! ```text
//!                 {}
//!                /  \
//!     {account=42}   {currency=USD}
//!                \  /
//!        {account=42, currency=USD}
//! ```
//!
//! Each context carries a packed `depth`: one specificity byte per
//! dimension, placed by importance. The most specific matching context is the
//! one with the greatest depth.
//!
//! # Example
//!
//! ```rust,ignore
//! let account = Arc::new(DimensionDef::builder("account", MatchKind::Exact(ScalarKind::Long)).build()?);
//! let def = ContextDef::new("merchant", vec![account.clone()])?;
//! let ctx = def.builder().with(account.create(DimensionValue::Long(42))?)?.build();
//! assert!(is_matching(&def.root(), &ctx));
//! ```

#[allow(clippy::module_inception)]
mod context;
mod def;
pub mod dimension;

pub use context::{is_containing, is_matching, Context, ContextBuilder, PersistedContext};
pub use def::{ContextDef, DEPTH_BITS};
pub use dimension::{
    Dimension, DimensionDef, DimensionDefBuilder, DimensionRegistry, DimensionValue, MatchKind,
    ScalarKind,
};
