//! Feature calculation session cache.
//!
//! Prism memoizes expensive scalar feature computations for one unit of work
//! (an image, a record, a batch element). The moving parts:
//! - A [`CalculationPool`] interns structurally equal operations, so
//!   sub-computations shared between features run once per session.
//! - Results are cached per feature handle and per declared name, with both
//!   views kept consistent.
//! - [`SessionCache`]s form hierarchies: child caches scope other input
//!   types under the same session and share its parameters. Invalidation
//!   walks the tree and can protect named children.
//! - Identifier resolution strips nesting-scope prefixes before lookup, so
//!   outer scopes can address inner features by qualified name.
//!
//! Sessions are single-threaded by design; wrap per-thread sessions around a
//! shared immutable [`FeatureSet`] for parallel batches.

pub mod error;
pub mod params;
pub mod pool;
pub mod resolve;
mod results;
pub mod session;
pub mod stats;

pub use error::{EvalError, SessionError};
pub use params::{ParamValue, ParamsError, SessionParams};
pub use pool::{CalcHandle, Calculation, CalculationPool, Operation};
pub use resolve::{IdentifierResolver, PrefixStage};
pub use results::ResultIndex;
pub use session::{ChildCacheName, Evaluator, SessionCache};
pub use stats::{SessionStats, SessionStatsReport};

pub use prism_core::{
    DuplicateFeatureName, Feature, FeatureId, FeatureLookup, FeatureName, FeatureSet,
};
