//! Memoized feature results, indexed by id and by declared name.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::time::{Duration, Instant};

use prism_core::{Feature, FeatureId, FeatureLookup, FeatureName};

use crate::error::SessionError;
use crate::session::{Evaluator, SessionCache};

/// Two always-consistent views over one set of cached results.
///
/// Entries exist only for named features and are written to both views in
/// the same call, so a value reachable by handle is reachable by name and
/// vice versa.
#[derive(Debug, Clone, Default)]
pub struct ResultIndex {
    by_id: HashMap<FeatureId, f64>,
    by_name: HashMap<FeatureName, f64>,
}

impl ResultIndex {
    pub fn get(&self, id: FeatureId) -> Option<f64> {
        self.by_id.get(&id).copied()
    }

    pub fn get_by_name(&self, name: &str) -> Option<f64> {
        self.by_name.get(name).copied()
    }

    pub fn insert(&mut self, id: FeatureId, name: FeatureName, value: f64) {
        self.by_id.insert(id, value);
        self.by_name.insert(name, value);
    }

    pub fn clear(&mut self) {
        self.by_id.clear();
        self.by_name.clear();
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct EvalCounters {
    pub result_hits: u64,
    pub result_misses: u64,
    pub evaluations: u64,
    pub anonymous_evaluations: u64,
    pub failed_evaluations: u64,
    pub nan_results: u64,
    pub eval_time_total: Duration,
    pub eval_time_max: Duration,
}

/// Memoizing wrapper around the external evaluator.
///
/// No `RefCell` borrow is held while the evaluator runs, so evaluators may
/// re-enter the owning session (for other features, the pool, or child
/// caches) freely.
pub(crate) struct ResultCache<I> {
    evaluator: Rc<dyn Evaluator<I>>,
    lookup: Rc<dyn FeatureLookup>,
    index: RefCell<ResultIndex>,
    counters: Cell<EvalCounters>,
}

impl<I> ResultCache<I> {
    pub(crate) fn new(evaluator: Rc<dyn Evaluator<I>>, lookup: Rc<dyn FeatureLookup>) -> Self {
        Self {
            evaluator,
            lookup,
            index: RefCell::new(ResultIndex::default()),
            counters: Cell::new(EvalCounters::default()),
        }
    }

    /// Returns the cached value for `feature`, evaluating on a miss.
    ///
    /// Anonymous features bypass the cache entirely: evaluated every call,
    /// never stored.
    pub(crate) fn calc(
        &self,
        feature: &Feature,
        input: &I,
        session: &SessionCache<I>,
    ) -> Result<f64, SessionError> {
        let Some(name) = feature.name() else {
            self.bump(|c| c.anonymous_evaluations += 1);
            tracing::trace!(
                target: "prism.session",
                feature = %feature,
                "anonymous feature, evaluating uncached"
            );
            return self.run_evaluator(feature, input, session);
        };

        if let Some(value) = self.index.borrow().get(feature.id()) {
            self.bump(|c| c.result_hits += 1);
            tracing::trace!(target: "prism.session", feature = %name, value, "result cache hit");
            return Ok(value);
        }
        self.bump(|c| c.result_misses += 1);

        let value = self.run_evaluator(feature, input, session)?;
        if value.is_nan() {
            self.bump(|c| c.nan_results += 1);
            tracing::warn!(
                target: "prism.session",
                feature = %name,
                "feature evaluated to NaN, caching it"
            );
        }
        self.index
            .borrow_mut()
            .insert(feature.id(), name.clone(), value);
        Ok(value)
    }

    /// By-name entry point. `resolved` has scope prefixes already stripped;
    /// `original` is the identifier as the caller wrote it, used for error
    /// reporting.
    pub(crate) fn calc_by_identifier(
        &self,
        resolved: &str,
        original: &str,
        input: &I,
        session: &SessionCache<I>,
    ) -> Result<f64, SessionError> {
        if let Some(value) = self.index.borrow().get_by_name(resolved) {
            self.bump(|c| c.result_hits += 1);
            tracing::trace!(
                target: "prism.session",
                identifier = resolved,
                value,
                "result cache hit by name"
            );
            return Ok(value);
        }

        let Some(feature) = self.lookup.resolve(resolved) else {
            return Err(SessionError::UnknownFeature {
                identifier: original.to_owned(),
            });
        };
        self.calc(&feature, input, session)
    }

    fn run_evaluator(
        &self,
        feature: &Feature,
        input: &I,
        session: &SessionCache<I>,
    ) -> Result<f64, SessionError> {
        let started = Instant::now();
        let outcome = self.evaluator.evaluate(feature, input, session);
        let elapsed = started.elapsed();
        self.bump(|c| {
            c.evaluations += 1;
            c.eval_time_total += elapsed;
            c.eval_time_max = c.eval_time_max.max(elapsed);
        });

        match outcome {
            Ok(value) => Ok(value),
            Err(source) => {
                self.bump(|c| c.failed_evaluations += 1);
                tracing::warn!(
                    target: "prism.session",
                    feature = %feature,
                    error = %source,
                    "feature evaluation failed"
                );
                Err(SessionError::Evaluation {
                    feature: feature.to_string(),
                    source,
                })
            }
        }
    }

    pub(crate) fn cached(&self, id: FeatureId) -> Option<f64> {
        self.index.borrow().get(id)
    }

    pub(crate) fn cached_by_name(&self, name: &str) -> Option<f64> {
        self.index.borrow().get_by_name(name)
    }

    pub(crate) fn len(&self) -> usize {
        self.index.borrow().len()
    }

    pub(crate) fn clear(&self) {
        self.index.borrow_mut().clear();
    }

    pub(crate) fn counters(&self) -> EvalCounters {
        self.counters.get()
    }

    fn bump(&self, update: impl FnOnce(&mut EvalCounters)) {
        let mut counters = self.counters.get();
        update(&mut counters);
        self.counters.set(counters);
    }
}

impl<I> fmt::Debug for ResultCache<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultCache")
            .field("results", &self.len())
            .field("counters", &self.counters.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_keeps_both_views_consistent() {
        let mut index = ResultIndex::default();
        let id = FeatureId::from_raw(3);
        index.insert(id, FeatureName::new("mean"), 12.5);

        assert_eq!(index.get(id), Some(12.5));
        assert_eq!(index.get_by_name("mean"), Some(12.5));
        assert_eq!(index.len(), 1);

        index.clear();
        assert_eq!(index.get(id), None);
        assert_eq!(index.get_by_name("mean"), None);
        assert!(index.is_empty());
    }

    #[test]
    fn index_overwrites_in_both_views() {
        let mut index = ResultIndex::default();
        let id = FeatureId::from_raw(0);
        index.insert(id, FeatureName::new("mean"), 1.0);
        index.insert(id, FeatureName::new("mean"), 2.0);

        assert_eq!(index.get(id), Some(2.0));
        assert_eq!(index.get_by_name("mean"), Some(2.0));
        assert_eq!(index.len(), 1);
    }
}
