//! The session cache itself: initialization, hierarchy and invalidation.
//!
//! A [`SessionCache`] scopes memoized feature results, a calculation pool and
//! any number of lazily created child caches to one unit of work. Everything
//! is single-threaded; interior mutability is `Cell`/`RefCell`, and no borrow
//! is held across evaluator callbacks.

use std::any::Any;
use std::borrow::Borrow;
use std::cell::{Cell, RefCell};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::rc::Rc;

use prism_core::{Feature, FeatureLookup};

use crate::error::{EvalError, SessionError};
use crate::params::SessionParams;
use crate::pool::CalculationPool;
use crate::resolve::IdentifierResolver;
use crate::results::ResultCache;
use crate::stats::SessionStats;

/// Computes feature values on cache misses.
///
/// Implementations receive the owning session and may re-enter it: request
/// other features, intern pooled calculations, or descend into child caches.
/// The one thing an evaluator must not do is require the value of the
/// feature currently being evaluated.
pub trait Evaluator<I> {
    fn evaluate(
        &self,
        feature: &Feature,
        input: &I,
        session: &SessionCache<I>,
    ) -> Result<f64, EvalError>;
}

/// Name of a nested cache scope, unique among the parent's children.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChildCacheName(String);

impl ChildCacheName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChildCacheName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChildCacheName {
    fn from(name: &str) -> Self {
        Self(name.to_owned())
    }
}

impl From<String> for ChildCacheName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl Borrow<str> for ChildCacheName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Bound by `init`; present means the session is usable.
struct SessionState {
    params: Rc<SessionParams>,
    span: tracing::Span,
}

/// A child cache with its input type erased.
///
/// `SessionCache<J>` is the only implementor. The erased `Rc` is recovered
/// with a single downcast in [`SessionCache::child_cache_for`].
trait ChildSlot {
    fn invalidate_subtree(&self);
    fn rebind(&self, params: Rc<SessionParams>);
    fn as_any_rc(self: Rc<Self>) -> Rc<dyn Any>;
}

/// Feature calculation cache for one unit of work.
///
/// Construction wires up the evaluator and feature lookup; [`init`]
/// (SessionCache::init) binds parameters and unlocks calculation. Child
/// caches scope other input types under the same session and share its
/// parameters.
pub struct SessionCache<I> {
    pool: CalculationPool<I>,
    results: ResultCache<I>,
    resolver: IdentifierResolver,
    children: RefCell<BTreeMap<ChildCacheName, Rc<dyn ChildSlot>>>,
    state: RefCell<Option<SessionState>>,
    invalidations: Cell<u64>,
}

impl<I> SessionCache<I> {
    pub fn new(evaluator: Rc<dyn Evaluator<I>>, lookup: Rc<dyn FeatureLookup>) -> Self {
        Self {
            pool: CalculationPool::new(),
            results: ResultCache::new(evaluator, lookup),
            resolver: IdentifierResolver::new(),
            children: RefCell::new(BTreeMap::new()),
            state: RefCell::new(None),
            invalidations: Cell::new(0),
        }
    }

    pub fn with_resolver(mut self, resolver: IdentifierResolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Shorthand for a single-stage resolver over `prefixes`.
    pub fn with_ignore_prefixes<P>(self, prefixes: impl IntoIterator<Item = P>) -> Self
    where
        P: Into<String>,
    {
        self.with_resolver(IdentifierResolver::from_prefixes(prefixes))
    }

    /// Binds `params` to this session and all existing children, making the
    /// cache usable.
    ///
    /// Re-initializing an already initialized session re-binds parameters
    /// (recursively) but deliberately keeps cached results; call
    /// [`invalidate`](Self::invalidate) when the new parameters change what
    /// features mean.
    pub fn init(&self, params: Rc<SessionParams>) {
        let span = tracing::debug_span!(
            target: "prism.session",
            "session",
            label = params.label.as_deref().unwrap_or("unnamed")
        );
        *self.state.borrow_mut() = Some(SessionState {
            params: Rc::clone(&params),
            span,
        });
        for child in self.children.borrow().values() {
            child.rebind(Rc::clone(&params));
        }
        tracing::debug!(target: "prism.session", "session initialized");
    }

    pub fn is_initialized(&self) -> bool {
        self.state.borrow().is_some()
    }

    /// Parameters bound by `init`, if any.
    pub fn params(&self) -> Option<Rc<SessionParams>> {
        self.state
            .borrow()
            .as_ref()
            .map(|state| Rc::clone(&state.params))
    }

    /// The calculation pool of this scope. Evaluators intern shared
    /// sub-computations here.
    pub fn pool(&self) -> &CalculationPool<I> {
        &self.pool
    }

    pub fn resolver(&self) -> &IdentifierResolver {
        &self.resolver
    }

    /// Applies prefix stripping without touching the cache.
    pub fn resolve_identifier<'a>(&self, identifier: &'a str) -> &'a str {
        self.resolver.resolve(identifier)
    }

    /// Returns the value of `feature`, evaluating it on a miss.
    ///
    /// Named features are memoized; anonymous features are evaluated every
    /// call. Fails with [`SessionError::Uninitialized`] before `init`, and
    /// failed evaluations leave the cache unchanged.
    pub fn calc(&self, feature: &Feature, input: &I) -> Result<f64, SessionError> {
        let span = self.active_span()?;
        let _guard = span.enter();
        self.results.calc(feature, input, self)
    }

    /// Like [`calc`](Self::calc), addressing the feature by identifier.
    ///
    /// Scope prefixes are stripped first; the remainder is answered from the
    /// by-name view or resolved through the feature lookup. Unknown
    /// identifiers fail with the identifier as the caller wrote it.
    pub fn calc_by_identifier(&self, identifier: &str, input: &I) -> Result<f64, SessionError> {
        let span = self.active_span()?;
        let _guard = span.enter();
        let resolved = self.resolver.resolve(identifier);
        if resolved != identifier {
            tracing::trace!(
                target: "prism.session",
                identifier,
                resolved,
                "stripped scope prefixes"
            );
        }
        self.results
            .calc_by_identifier(resolved, identifier, input, self)
    }

    /// Evaluates `features` in order, stopping at the first error.
    pub fn calc_each(&self, features: &[Feature], input: &I) -> Result<Vec<f64>, SessionError> {
        features
            .iter()
            .map(|feature| self.calc(feature, input))
            .collect()
    }

    /// Cached value of `feature`, without evaluating.
    pub fn cached_value(&self, feature: &Feature) -> Option<f64> {
        self.results.cached(feature.id())
    }

    /// Cached value under `identifier` (prefixes stripped), without
    /// evaluating or consulting the feature lookup.
    pub fn cached_value_for_identifier(&self, identifier: &str) -> Option<f64> {
        self.results.cached_by_name(self.resolver.resolve(identifier))
    }

    /// Number of memoized results in this scope.
    pub fn cached_result_count(&self) -> usize {
        self.results.len()
    }

    /// Clears results, resets pool memos and recursively invalidates every
    /// child. Pool membership and the child caches themselves survive, so
    /// handles stay canonical and children keep their bound parameters.
    pub fn invalidate(&self) {
        self.invalidations.set(self.invalidations.get() + 1);
        self.pool.invalidate();
        self.results.clear();
        for child in self.children.borrow().values() {
            child.invalidate_subtree();
        }
        tracing::debug!(target: "prism.session", "session invalidated");
    }

    /// [`invalidate`](Self::invalidate), except children named in
    /// `protected` are skipped entirely (their whole subtree survives).
    /// This scope's own results and pool memos are always cleared.
    pub fn invalidate_except(&self, protected: &BTreeSet<ChildCacheName>) {
        self.invalidations.set(self.invalidations.get() + 1);
        self.pool.invalidate();
        self.results.clear();
        for (name, child) in self.children.borrow().iter() {
            if !protected.contains(name) {
                child.invalidate_subtree();
            }
        }
        tracing::debug!(
            target: "prism.session",
            protected = protected.len(),
            "session invalidated except protected children"
        );
    }

    /// Returns the child cache `name`, creating it with `factory` on first
    /// request.
    ///
    /// At most one child exists per name. Requesting an existing name with a
    /// different input type `J` fails with
    /// [`SessionError::ChildCacheTypeMismatch`] and leaves the stored child
    /// untouched. A child created after `init` is bound to the session's
    /// parameters immediately; children created before inherit them when the
    /// parent is initialized.
    pub fn child_cache_for<J: 'static>(
        &self,
        name: impl Into<ChildCacheName>,
        factory: impl FnOnce() -> SessionCache<J>,
    ) -> Result<Rc<SessionCache<J>>, SessionError> {
        let name = name.into();
        let existing = self.children.borrow().get(&name).cloned();
        if let Some(slot) = existing {
            return downcast_child(slot, &name);
        }

        let child = Rc::new(factory());
        if let Some(params) = self.params() {
            child.init(params);
        }

        match self.children.borrow_mut().entry(name.clone()) {
            Entry::Occupied(entry) => {
                // A re-entrant factory registered this name first; the child
                // already stored stays canonical.
                downcast_child(Rc::clone(entry.get()), &name)
            }
            Entry::Vacant(entry) => {
                entry.insert(child.clone());
                tracing::debug!(target: "prism.session", child = %name, "created child cache");
                Ok(child)
            }
        }
    }

    /// Names of the child caches created so far, in order.
    pub fn child_names(&self) -> Vec<ChildCacheName> {
        self.children.borrow().keys().cloned().collect()
    }

    pub fn has_child(&self, name: &str) -> bool {
        self.children.borrow().contains_key(name)
    }

    /// Snapshot of this scope's counters. Children report their own.
    pub fn stats(&self) -> SessionStats {
        let counters = self.results.counters();
        SessionStats {
            result_hits: counters.result_hits,
            result_misses: counters.result_misses,
            evaluations: counters.evaluations,
            anonymous_evaluations: counters.anonymous_evaluations,
            failed_evaluations: counters.failed_evaluations,
            nan_results: counters.nan_results,
            pool_hits: self.pool.hits(),
            pool_misses: self.pool.misses(),
            pool_len: self.pool.len() as u64,
            invalidations: self.invalidations.get(),
            eval_time_total: counters.eval_time_total,
            eval_time_max: counters.eval_time_max,
        }
    }

    fn active_span(&self) -> Result<tracing::Span, SessionError> {
        match self.state.borrow().as_ref() {
            Some(state) => Ok(state.span.clone()),
            None => Err(SessionError::Uninitialized),
        }
    }
}

fn downcast_child<J: 'static>(
    slot: Rc<dyn ChildSlot>,
    name: &ChildCacheName,
) -> Result<Rc<SessionCache<J>>, SessionError> {
    slot.as_any_rc()
        .downcast::<SessionCache<J>>()
        .map_err(|_| SessionError::ChildCacheTypeMismatch { name: name.clone() })
}

impl<I: 'static> ChildSlot for SessionCache<I> {
    fn invalidate_subtree(&self) {
        SessionCache::invalidate(self);
    }

    fn rebind(&self, params: Rc<SessionParams>) {
        SessionCache::init(self, params);
    }

    fn as_any_rc(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}

impl<I> fmt::Debug for SessionCache<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCache")
            .field("initialized", &self.is_initialized())
            .field("results", &self.cached_result_count())
            .field("pool", &self.pool)
            .field("children", &self.child_names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use prism_core::FeatureSet;

    struct ConstEvaluator(f64);

    impl Evaluator<Vec<f64>> for ConstEvaluator {
        fn evaluate(
            &self,
            _feature: &Feature,
            _input: &Vec<f64>,
            _session: &SessionCache<Vec<f64>>,
        ) -> Result<f64, EvalError> {
            Ok(self.0)
        }
    }

    fn const_session(value: f64) -> (SessionCache<Vec<f64>>, Feature) {
        let mut set = FeatureSet::new();
        let feature = set.declare("const").unwrap();
        let session = SessionCache::new(Rc::new(ConstEvaluator(value)), Rc::new(set));
        (session, feature)
    }

    #[test]
    fn calc_before_init_fails() {
        let (session, feature) = const_session(1.0);
        assert!(!session.is_initialized());
        let err = session.calc(&feature, &vec![]).unwrap_err();
        assert!(matches!(err, SessionError::Uninitialized));
        let err = session.calc_by_identifier("const", &vec![]).unwrap_err();
        assert!(matches!(err, SessionError::Uninitialized));
    }

    #[test]
    fn init_unlocks_calculation() {
        let (session, feature) = const_session(7.0);
        session.init(Rc::new(SessionParams::with_label("t")));
        assert!(session.is_initialized());
        assert_eq!(session.calc(&feature, &vec![]).unwrap(), 7.0);
        assert_eq!(session.params().unwrap().label.as_deref(), Some("t"));
    }

    #[test]
    fn reinit_rebinds_params_but_keeps_results() {
        let (session, feature) = const_session(3.0);
        session.init(Rc::new(SessionParams::with_label("first")));
        session.calc(&feature, &vec![]).unwrap();

        session.init(Rc::new(SessionParams::with_label("second")));
        assert_eq!(session.params().unwrap().label.as_deref(), Some("second"));
        assert_eq!(session.cached_value(&feature), Some(3.0));
    }

    #[test]
    fn ignore_prefixes_feed_identifier_resolution() {
        let (session, _) = const_session(0.0);
        let session = session.with_ignore_prefixes(["roi."]);
        assert_eq!(session.resolve_identifier("roi.const"), "const");
        assert_eq!(session.resolve_identifier("const"), "const");

        let stages = session.resolver().stages();
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].prefixes(), ["roi.".to_owned()]);
    }

    #[test]
    fn child_names_are_ordered() {
        let (session, _) = const_session(0.0);
        session
            .child_cache_for("zeta", || {
                SessionCache::<Vec<f64>>::new(Rc::new(ConstEvaluator(0.0)), Rc::new(FeatureSet::new()))
            })
            .unwrap();
        session
            .child_cache_for("alpha", || {
                SessionCache::<Vec<f64>>::new(Rc::new(ConstEvaluator(0.0)), Rc::new(FeatureSet::new()))
            })
            .unwrap();

        let names: Vec<_> = session
            .child_names()
            .iter()
            .map(|n| n.as_str().to_owned())
            .collect();
        assert_eq!(names, ["alpha", "zeta"]);
        assert!(session.has_child("alpha"));
        assert!(!session.has_child("beta"));
    }
}
