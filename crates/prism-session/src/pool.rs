//! Structural deduplication of calculations.
//!
//! Evaluators assemble small operation graphs per feature, and many features
//! share sub-computations (one histogram feeds entropy, uniformity and
//! percentiles). The pool interns operations by value, so structurally equal
//! operations collapse to a single canonical [`Calculation`] whose result is
//! computed at most once per session.

use std::any::{Any, TypeId};
use std::cell::{Cell, RefCell};
use std::collections::HashSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::rc::Rc;

use crate::error::EvalError;

/// A reusable sub-computation.
///
/// Implementations are plain data structs describing the operation and its
/// parameters; derived `Eq` and `Hash` over those fields define structural
/// identity in the pool. Operations with floating-point parameters should
/// compare the bit patterns (`f64::to_bits`) to stay `Eq`-compatible.
///
/// Composite operations hold [`CalcHandle`]s of their canonical inputs, which
/// keeps their own equality cheap and reliable.
pub trait Operation<I>: 'static {
    fn run(&self, input: &I) -> Result<f64, EvalError>;
}

/// Object-safe mirror of [`Operation`] plus the value-identity hooks the
/// pool needs. Implemented once, below, for every `Operation + Eq + Hash`.
trait DynOperation<I> {
    fn run(&self, input: &I) -> Result<f64, EvalError>;
    fn type_name(&self) -> &'static str;
    fn dyn_eq(&self, other: &dyn DynOperation<I>) -> bool;
    fn dyn_hash(&self, state: &mut dyn Hasher);
    fn as_any(&self) -> &dyn Any;
}

impl<I, T> DynOperation<I> for T
where
    T: Operation<I> + Eq + Hash,
{
    fn run(&self, input: &I) -> Result<f64, EvalError> {
        Operation::run(self, input)
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn dyn_eq(&self, other: &dyn DynOperation<I>) -> bool {
        other
            .as_any()
            .downcast_ref::<T>()
            .is_some_and(|other| other == self)
    }

    fn dyn_hash(&self, mut state: &mut dyn Hasher) {
        // Two operations of different types must never collide as equal, so
        // the type id participates in the hash alongside the value.
        TypeId::of::<T>().hash(&mut state);
        self.hash(&mut state);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A pooled operation together with its memoized result.
///
/// The memo holds whatever the operation returned, NaN included; failures
/// are not memoized, so the next [`evaluate`](Calculation::evaluate) retries.
pub struct Calculation<I> {
    op: Box<dyn DynOperation<I>>,
    memo: Cell<Option<f64>>,
}

impl<I> Calculation<I> {
    fn new(op: Box<dyn DynOperation<I>>) -> Self {
        Self {
            op,
            memo: Cell::new(None),
        }
    }

    /// Returns the memoized value, running the operation on first use.
    pub fn evaluate(&self, input: &I) -> Result<f64, EvalError> {
        if let Some(value) = self.memo.get() {
            return Ok(value);
        }
        let value = self.op.run(input)?;
        self.memo.set(Some(value));
        Ok(value)
    }

    /// Currently memoized value, if the calculation has run.
    pub fn cached(&self) -> Option<f64> {
        self.memo.get()
    }

    /// Drops the memoized value; the next `evaluate` recomputes.
    pub fn reset(&self) {
        self.memo.set(None);
    }

    /// Type name of the underlying operation, for diagnostics.
    pub fn operation_name(&self) -> &'static str {
        self.op.type_name()
    }
}

impl<I> fmt::Debug for Calculation<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Calculation")
            .field("operation", &self.op.type_name())
            .field("memo", &self.memo.get())
            .finish()
    }
}

/// Canonical handle to a pooled [`Calculation`].
///
/// Clones are cheap. Equality and hashing are by pointer identity: the pool
/// guarantees one calculation per distinct operation value, so two handles
/// compare equal exactly when their operations are structurally equal. That
/// makes handles themselves good keys and good fields of composite
/// operations.
pub struct CalcHandle<I>(Rc<Calculation<I>>);

impl<I> Clone for CalcHandle<I> {
    fn clone(&self) -> Self {
        Self(Rc::clone(&self.0))
    }
}

impl<I> Deref for CalcHandle<I> {
    type Target = Calculation<I>;

    fn deref(&self) -> &Calculation<I> {
        &self.0
    }
}

impl<I> PartialEq for CalcHandle<I> {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl<I> Eq for CalcHandle<I> {}

impl<I> Hash for CalcHandle<I> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        Rc::as_ptr(&self.0).hash(state);
    }
}

impl<I> fmt::Debug for CalcHandle<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

/// Pool set key: compares and hashes by operation value, not by pointer.
struct ByOperation<I>(CalcHandle<I>);

impl<I> PartialEq for ByOperation<I> {
    fn eq(&self, other: &Self) -> bool {
        self.0.op.dyn_eq(other.0.op.as_ref())
    }
}

impl<I> Eq for ByOperation<I> {}

impl<I> Hash for ByOperation<I> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.op.dyn_hash(state);
    }
}

/// Interning pool of calculations for one session scope.
///
/// [`intern`](CalculationPool::intern) is the only way in: it either finds
/// the existing calculation equal to the candidate or admits the candidate
/// as canonical. Membership survives invalidation; only memos are reset.
pub struct CalculationPool<I> {
    entries: RefCell<HashSet<ByOperation<I>>>,
    hits: Cell<u64>,
    misses: Cell<u64>,
}

impl<I> Default for CalculationPool<I> {
    fn default() -> Self {
        Self {
            entries: RefCell::new(HashSet::new()),
            hits: Cell::new(0),
            misses: Cell::new(0),
        }
    }
}

impl<I> CalculationPool<I> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interns `candidate`, returning the canonical handle for its value.
    ///
    /// On a hit the candidate is discarded and the existing handle returned,
    /// so any memoized result is preserved.
    pub fn intern<O>(&self, candidate: O) -> CalcHandle<I>
    where
        O: Operation<I> + Eq + Hash,
    {
        let candidate = ByOperation(CalcHandle(Rc::new(Calculation::new(Box::new(candidate)))));
        let mut entries = self.entries.borrow_mut();
        if let Some(existing) = entries.get(&candidate) {
            self.hits.set(self.hits.get() + 1);
            return existing.0.clone();
        }
        self.misses.set(self.misses.get() + 1);
        let handle = candidate.0.clone();
        entries.insert(candidate);
        handle
    }

    /// Resets every memoized result while keeping pool membership, so
    /// previously handed out handles stay canonical.
    pub fn invalidate(&self) {
        for entry in self.entries.borrow().iter() {
            entry.0.reset();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }

    /// Interns that found an existing calculation.
    pub fn hits(&self) -> u64 {
        self.hits.get()
    }

    /// Interns that admitted the candidate as a new calculation.
    pub fn misses(&self) -> u64 {
        self.misses.get()
    }
}

impl<I> fmt::Debug for CalculationPool<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CalculationPool")
            .field("len", &self.len())
            .field("hits", &self.hits.get())
            .field("misses", &self.misses.get())
            .finish()
    }
}
