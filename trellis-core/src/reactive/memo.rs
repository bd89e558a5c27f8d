//! Memos
//!
//! A memo is a derived value that is both an observable and a derivation:
//! it observes whatever its computation reads, and is observed by whoever
//! reads it. Between those two roles sits a cache.
//!
//! # Laziness
//!
//! A memo never recomputes eagerly. When its inputs change it only marks
//! its own observers possibly stale; the actual recompute happens on the
//! next read, and only if the recompute-decision walk confirms that some
//! input truly changed. If the fresh result compares equal to the cached
//! one, downstream observers are not disturbed at all.
//!
//! # Suspension
//!
//! When a memo loses its last observer it drops its dependency edges and
//! its cache. Reads while unobserved compute on the fly without touching
//! the graph, so a forgotten memo costs nothing.
//!
//! # Failures
//!
//! A panic in the computation is cached like a value: every read observes
//! the same failure until an input changes, at which point the memo
//! recomputes and can recover.

use std::cell::{Cell, RefCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};

use crate::graph::batch::{end_batch, start_batch};
use crate::graph::derivation::{
    clear_observing, register_derivation, should_compute, track, unregister_derivation, untracked,
    CaughtException, DerivationId, TrackedResult,
};
use crate::graph::observable::{
    has_observers, propagate_change_confirmed, propagate_maybe_changed, register_observable,
    report_observed, unregister_observable, ObservableId,
};
use crate::graph::spy::{spy_report, SpyEvent, SpyKind, SpyPhase};
use crate::graph::state::with_state;

/// A cached, lazily recomputed derived value.
///
/// `T` must be `PartialEq` so an unchanged recompute can stop propagation.
/// Cloning is cheap and clones share the cache.
#[derive(Clone)]
pub struct Memo<T> {
    inner: Rc<MemoInner<T>>,
}

enum MemoValue<T> {
    Value(T),
    Caught(CaughtException),
}

struct MemoInner<T> {
    name: String,
    derivation: DerivationId,
    observable: ObservableId,
    compute: Box<dyn Fn() -> T>,
    value: RefCell<Option<MemoValue<T>>>,
    is_computing: Cell<bool>,
}

impl<T: Clone + PartialEq + 'static> Memo<T> {
    /// Create a memo with a generated diagnostic name. The computation does
    /// not run until the first read.
    pub fn new(compute: impl Fn() -> T + 'static) -> Self {
        let id = crate::graph::state::next_guid();
        Self::named(format!("Memo@{id}"), compute)
    }

    /// Create a memo with an explicit diagnostic name.
    pub fn named(name: impl Into<String>, compute: impl Fn() -> T + 'static) -> Self {
        let name = name.into();
        let inner = Rc::new_cyclic(|weak: &Weak<MemoInner<T>>| {
            // The three hooks below hold weak handles: the graph must not
            // keep the memo alive once every user handle is gone.
            let observable = {
                let unobserved = weak.clone();
                let force = weak.clone();
                register_observable(
                    name.clone(),
                    Some(Rc::new(move || {
                        if let Some(inner) = unobserved.upgrade() {
                            inner.suspend();
                        }
                    })),
                    Some(Rc::new(move || {
                        if let Some(inner) = force.upgrade() {
                            inner.ensure_up_to_date();
                        }
                    })),
                )
            };
            let derivation = {
                let stale = weak.clone();
                register_derivation(
                    name.clone(),
                    Rc::new(move || {
                        if let Some(inner) = stale.upgrade() {
                            propagate_maybe_changed(inner.observable);
                        }
                    }),
                )
            };
            MemoInner {
                name,
                derivation,
                observable,
                compute: Box::new(compute),
                value: RefCell::new(None),
                is_computing: Cell::new(false),
            }
        });
        Memo { inner }
    }

    /// Read the memo's value, recomputing if an input changed.
    ///
    /// Registers the memo as a dependency when a tracked run is active.
    ///
    /// # Panics
    ///
    /// Re-raises a failure cached from the computation, and panics on a
    /// computation that reads itself.
    pub fn get(&self) -> T {
        if self.inner.is_computing.get() {
            panic!(
                "cycle detected: the computation of '{}' reads its own value",
                self.inner.name
            );
        }

        let standalone = with_state(|g| g.in_batch == 0 && g.tracking_derivation.is_none())
            && !has_observers(self.inner.observable);
        if standalone {
            // Nobody is watching and no batch is open. Compute on the fly
            // without binding edges or touching the cache.
            return match self.inner.compute_value(false) {
                MemoValue::Value(value) => value,
                MemoValue::Caught(exception) => exception.resume(),
            };
        }

        start_batch();
        report_observed(self.inner.observable);
        if should_compute(self.inner.derivation) && self.inner.track_and_compute() {
            propagate_change_confirmed(self.inner.observable);
        }
        let cached: Option<MemoValue<T>> = match &*self.inner.value.borrow() {
            Some(MemoValue::Value(value)) => Some(MemoValue::Value(value.clone())),
            Some(MemoValue::Caught(exception)) => Some(MemoValue::Caught(exception.clone())),
            None => None,
        };
        end_batch();

        match cached {
            Some(MemoValue::Value(value)) => value,
            Some(MemoValue::Caught(exception)) => exception.resume(),
            // An empty cache implies a not-tracking state, which the
            // recompute decision answers with yes; this branch is a
            // fallback for an observer-less read racing a suspension.
            None => match self.inner.compute_value(false) {
                MemoValue::Value(value) => value,
                MemoValue::Caught(exception) => exception.resume(),
            },
        }
    }

    /// Read the value without registering a dependency.
    pub fn get_untracked(&self) -> T {
        untracked(|| self.get())
    }

    /// Diagnostic name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether anything currently observes this memo.
    pub fn is_observed(&self) -> bool {
        has_observers(self.inner.observable)
    }
}

impl<T: Clone + PartialEq + 'static> MemoInner<T> {
    /// Resolve the cached value so observers can trust their staleness
    /// state. This is the recompute-decision walk's entry point; it must
    /// not panic, so a failing computation is cached, not raised.
    fn ensure_up_to_date(&self) {
        start_batch();
        if should_compute(self.derivation) && self.track_and_compute() {
            propagate_change_confirmed(self.observable);
        }
        end_batch();
    }

    /// Recompute with tracking and refresh the cache. Returns whether the
    /// result differs from the cached one. A failure always counts as
    /// changed.
    fn track_and_compute(&self) -> bool {
        spy_report(|| SpyEvent::new(SpyPhase::Start, SpyKind::Track, &self.name));
        let result = self.compute_value(true);
        spy_report(|| SpyEvent::new(SpyPhase::End, SpyKind::Track, &self.name));

        let mut slot = self.value.borrow_mut();
        let changed = match (&*slot, &result) {
            (Some(MemoValue::Value(old)), MemoValue::Value(new)) => old != new,
            _ => true,
        };
        *slot = Some(result);
        changed
    }

    /// Run the computation with the write guard raised. `tracked` decides
    /// whether dependencies are rebound or the run is fully detached.
    fn compute_value(&self, tracked: bool) -> MemoValue<T> {
        self.is_computing.set(true);
        with_state(|g| g.computation_depth += 1);
        let outcome = if tracked {
            track(self.derivation, || (self.compute)())
        } else {
            match catch_unwind(AssertUnwindSafe(|| untracked(|| (self.compute)()))) {
                Ok(value) => TrackedResult::Value(value),
                Err(payload) => TrackedResult::Caught(CaughtException::from_panic(payload)),
            }
        };
        with_state(|g| g.computation_depth -= 1);
        self.is_computing.set(false);
        match outcome {
            TrackedResult::Value(value) => MemoValue::Value(value),
            TrackedResult::Caught(exception) => MemoValue::Caught(exception),
        }
    }

    /// Drop dependency edges and the cache. Called when the last observer
    /// leaves; the next read starts from scratch.
    fn suspend(&self) {
        with_state(|g| clear_observing(g, self.derivation));
        *self.value.borrow_mut() = None;
    }
}

impl<T> Drop for MemoInner<T> {
    fn drop(&mut self) {
        unregister_derivation(self.derivation);
        unregister_observable(self.observable);
    }
}

impl<T: Clone + PartialEq + std::fmt::Debug + 'static> std::fmt::Debug for Memo<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memo").field("name", &self.inner.name).finish()
    }
}
