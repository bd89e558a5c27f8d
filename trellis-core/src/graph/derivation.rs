//! Derivations and the Tracking Protocol
//!
//! A derivation is any computation that may read observables: a memoized
//! derived value or a reaction. This module owns the observing side of the
//! edge structure, the tracked-run protocol that rebuilds a derivation's
//! edge set on every run, and the recompute decision that walks
//! possibly-stale chains lazily.
//!
//! # How a tracked run works
//!
//! 1. The derivation's state resets to `UpToDate` and a fresh, globally
//!    unique run id is assigned.
//! 2. The run installs itself as the thread's tracking derivation, saving
//!    the previous one so runs nest.
//! 3. The body executes. Every observable read calls
//!    [`report_observed`](crate::graph::observable::report_observed),
//!    which appends to a scratch list, collapsing duplicate reads via the
//!    run id.
//! 4. The previous tracking derivation is restored.
//! 5. The scratch list is diffed against the previous edge set; only the
//!    symmetric difference is added or removed.
//!
//! Panics inside the body are captured as a value, not propagated, so step
//! 5 always runs and the edges stay correct even when the body fails. The
//! caller inspects the result and decides whether to re-raise.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

use smallvec::SmallVec;

use crate::graph::batch::{end_batch, start_batch};
use crate::graph::observable::{add_observer, remove_observer, ObservableId};
use crate::graph::state::{with_state, GlobalState};

/// Extra scratch capacity reserved above the previous edge count, so a run
/// that grows its dependency set does not reallocate for every read.
const NEW_OBSERVING_HEADROOM: usize = 16;

/// Staleness state of a derivation.
///
/// Ordered from cheapest to most stale; `lowest_observer_state` relies on
/// this ordering.
#[repr(i8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DerivationState {
    /// Not holding any dependency data: never tracked, or suspended after
    /// losing all observers.
    NotTracking = -1,

    /// No shallow dependency changed since the last run. Reading the
    /// derivation costs nothing.
    UpToDate = 0,

    /// Some deep dependency changed, but whether a shallow dependency
    /// actually changed is not yet known. Only memoized values propagate
    /// this state.
    PossiblyStale = 1,

    /// A shallow dependency changed. The next read or run must recompute.
    Stale = 2,
}

/// Stable identity of a derivation node. Doubles as the key in observables'
/// reverse-index maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DerivationId(pub(crate) u64);

impl DerivationId {
    /// Get the raw id value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Per-derivation bookkeeping held in the node arena.
pub(crate) struct DerivationNode {
    /// Diagnostic label.
    pub name: String,

    /// Deduplicated observables read on the last completed run.
    pub observing: SmallVec<[ObservableId; 4]>,

    /// Scratch list accumulating reads for the run in progress. Absent
    /// outside a run.
    pub new_observing: Option<Vec<ObservableId>>,

    /// Number of entries appended to `new_observing` so far this run.
    pub unbound_count: usize,

    /// Current staleness state.
    pub state: DerivationState,

    /// Id of the last tracked run, globally unique and monotonic.
    pub run_id: u64,

    /// Invoked when this derivation transitions out of `UpToDate` during
    /// propagation. Reactions schedule themselves here; memoized values
    /// push possibly-stale further out.
    pub on_become_stale: Rc<dyn Fn()>,
}

/// Register a new derivation node and return its id.
pub fn register_derivation(name: impl Into<String>, on_become_stale: Rc<dyn Fn()>) -> DerivationId {
    with_state(|g| {
        let id = DerivationId(g.next_guid());
        g.derivations.insert(
            id,
            DerivationNode {
                name: name.into(),
                observing: SmallVec::new(),
                new_observing: None,
                unbound_count: 0,
                state: DerivationState::NotTracking,
                run_id: 0,
                on_become_stale,
            },
        );
        id
    })
}

/// Drop a derivation's edges and remove its node from the arena.
pub fn unregister_derivation(id: DerivationId) {
    with_state(|g| {
        clear_observing(g, id);
        g.derivations.shift_remove(&id);
    });
}

/// Current staleness state of a derivation, if it is still registered.
pub fn derivation_state(id: DerivationId) -> Option<DerivationState> {
    with_state(|g| g.derivations.get(&id).map(|n| n.state))
}

/// Diagnostic name of a derivation.
pub fn derivation_name(id: DerivationId) -> Option<String> {
    with_state(|g| g.derivations.get(&id).map(|n| n.name.clone()))
}

/// Snapshot of the observables a derivation currently observes, in the
/// order they were first read. For diagnostics.
pub fn observing(id: DerivationId) -> Vec<ObservableId> {
    with_state(|g| {
        g.derivations
            .get(&id)
            .map(|n| n.observing.to_vec())
            .unwrap_or_default()
    })
}

/// A panic captured during a tracked run, normalized to its message.
#[derive(Debug, Clone)]
pub struct CaughtException {
    message: String,
}

impl CaughtException {
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "tracked run panicked with a non-string payload".to_string()
        };
        Self { message }
    }

    /// The captured panic message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Re-raise the captured failure on the current thread.
    pub fn resume(&self) -> ! {
        std::panic::resume_unwind(Box::new(self.message.clone()))
    }
}

impl fmt::Display for CaughtException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

/// Outcome of a tracked run: the body's value, or its captured failure.
///
/// Edge rebinding has already completed by the time the caller sees this,
/// whichever variant it is.
#[derive(Debug)]
pub enum TrackedResult<T> {
    Value(T),
    Caught(CaughtException),
}

impl<T> TrackedResult<T> {
    /// Unwrap the value, re-raising a captured failure.
    pub fn unwrap_or_resume(self) -> T {
        match self {
            TrackedResult::Value(value) => value,
            TrackedResult::Caught(exception) => exception.resume(),
        }
    }

    /// Whether the body failed.
    pub fn is_caught(&self) -> bool {
        matches!(self, TrackedResult::Caught(_))
    }
}

/// Execute `body` as a tracked run of `derivation`, recording every
/// observable it reads and rebinding the derivation's edge set afterwards.
///
/// The whole run is scoped inside one batch, so edges that flicker on and
/// off during the run never trigger teardown. Panics in `body` are
/// captured into the result; binding is never skipped by unwinding.
pub fn track<T>(derivation: DerivationId, body: impl FnOnce() -> T) -> TrackedResult<T> {
    start_batch();
    let previous = with_state(|g| {
        change_dependencies_state_to_up_to_date(g, derivation);
        let run_id = g.next_run_id();
        if let Some(node) = g.derivations.get_mut(&derivation) {
            node.run_id = run_id;
            node.unbound_count = 0;
            let capacity = node.observing.len() + NEW_OBSERVING_HEADROOM;
            node.new_observing = Some(Vec::with_capacity(capacity));
        }
        g.tracking_derivation.replace(derivation)
    });

    let result = catch_unwind(AssertUnwindSafe(body));

    with_state(|g| g.tracking_derivation = previous);
    bind_dependencies(derivation);
    end_batch();

    match result {
        Ok(value) => TrackedResult::Value(value),
        Err(payload) => TrackedResult::Caught(CaughtException::from_panic(payload)),
    }
}

/// Reset a derivation to `UpToDate` and relax the cached observer bound of
/// everything it observes, so the next change report propagates again.
pub(crate) fn change_dependencies_state_to_up_to_date(g: &mut GlobalState, derivation: DerivationId) {
    let observing = {
        let Some(node) = g.derivations.get_mut(&derivation) else {
            return;
        };
        if node.state == DerivationState::UpToDate {
            return;
        }
        node.state = DerivationState::UpToDate;
        node.observing.clone()
    };
    for observable in observing {
        if let Some(node) = g.observables.get_mut(&observable) {
            node.lowest_observer_state = DerivationState::UpToDate;
        }
    }
}

/// Diff the scratch read list against the previous edge set and install the
/// result, touching only the symmetric difference.
///
/// Three linear passes over `diff_value` scratch bits:
/// 1. dedup and compact the new list (marks survivors with 1),
/// 2. walk the old list, removing edges whose bit is still 0 and zeroing
///    every bit,
/// 3. walk the new list, adding edges whose bit is still 1 and zeroing it.
///
/// Every `diff_value` is back to 0 when this returns.
pub(crate) fn bind_dependencies(derivation: DerivationId) {
    with_state(|g| {
        let (previous_observing, mut new_observing, unbound_count) = {
            let Some(node) = g.derivations.get_mut(&derivation) else {
                return;
            };
            let previous = std::mem::take(&mut node.observing);
            let fresh = node.new_observing.take().unwrap_or_default();
            (previous, fresh, node.unbound_count)
        };

        // Pass 1: dedup in place. Interleaved nested runs can leave
        // duplicates even with the run-id check, so dedup again here.
        let mut kept = 0;
        for i in 0..unbound_count.min(new_observing.len()) {
            let dep = new_observing[i];
            if let Some(node) = g.observables.get_mut(&dep) {
                if node.diff_value == 0 {
                    node.diff_value = 1;
                    new_observing[kept] = dep;
                    kept += 1;
                }
            }
        }
        new_observing.truncate(kept);

        // Pass 2: edges no longer read. Bits are zeroed unconditionally so
        // shared members are not re-added in pass 3.
        for &dep in previous_observing.iter().rev() {
            let remove = match g.observables.get_mut(&dep) {
                Some(node) => {
                    let unused = node.diff_value == 0;
                    node.diff_value = 0;
                    unused
                }
                None => false,
            };
            if remove {
                remove_observer(g, dep, derivation);
            }
        }

        // Pass 3: freshly read edges still carry their mark.
        for i in (0..new_observing.len()).rev() {
            let dep = new_observing[i];
            let add = match g.observables.get_mut(&dep) {
                Some(node) => {
                    let fresh = node.diff_value == 1;
                    node.diff_value = 0;
                    fresh
                }
                None => false,
            };
            if add {
                add_observer(g, dep, derivation);
            }
        }

        if let Some(node) = g.derivations.get_mut(&derivation) {
            node.observing = SmallVec::from_vec(new_observing);
            node.unbound_count = 0;
        }
    });
}

/// Drop all of a derivation's edges and mark it `NotTracking`.
///
/// Used when a reaction is disposed and when a memoized value suspends
/// after losing its last observer.
pub(crate) fn clear_observing(g: &mut GlobalState, derivation: DerivationId) {
    let observing = match g.derivations.get_mut(&derivation) {
        Some(node) => {
            node.state = DerivationState::NotTracking;
            std::mem::take(&mut node.observing)
        }
        None => return,
    };
    for observable in observing {
        remove_observer(g, observable, derivation);
    }
}

/// Decide whether a derivation needs to re-run.
///
/// `UpToDate` is a cheap no. `NotTracking` and `Stale` are a cheap yes.
/// `PossiblyStale` walks the observed list in its original read order and
/// forces each memoized dependency to resolve; the first one whose
/// confirmed change leaves this derivation stale answers yes immediately.
/// Later dependencies are never forced once an earlier change is
/// confirmed, because a re-run will resolve them in order anyway. If the
/// walk exhausts without a confirmed change, the derivation is reset to
/// `UpToDate` and the answer is no.
pub fn should_compute(derivation: DerivationId) -> bool {
    let Some(state) = derivation_state(derivation) else {
        return false;
    };
    match state {
        DerivationState::UpToDate => false,
        DerivationState::NotTracking | DerivationState::Stale => true,
        DerivationState::PossiblyStale => {
            let previous = untracked_start();
            let observing: Vec<ObservableId> = with_state(|g| {
                g.derivations
                    .get(&derivation)
                    .map(|n| n.observing.to_vec())
                    .unwrap_or_default()
            });
            let mut confirmed = false;
            for dep in observing {
                let force = with_state(|g| g.observables.get(&dep).and_then(|n| n.force.clone()));
                let Some(force) = force else { continue };
                // A failure while resolving counts as a change; the re-run
                // will surface it.
                if catch_unwind(AssertUnwindSafe(|| force())).is_err() {
                    confirmed = true;
                    break;
                }
                if derivation_state(derivation) == Some(DerivationState::Stale) {
                    confirmed = true;
                    break;
                }
            }
            if !confirmed {
                with_state(|g| change_dependencies_state_to_up_to_date(g, derivation));
            }
            untracked_end(previous);
            confirmed
        }
    }
}

/// Suspend read tracking, returning the previous tracking derivation.
pub(crate) fn untracked_start() -> Option<DerivationId> {
    with_state(|g| g.tracking_derivation.take())
}

/// Restore the tracking derivation saved by [`untracked_start`].
pub(crate) fn untracked_end(previous: Option<DerivationId>) {
    with_state(|g| g.tracking_derivation = previous);
}

struct UntrackedGuard(Option<DerivationId>);

impl Drop for UntrackedGuard {
    fn drop(&mut self) {
        untracked_end(self.0.take());
    }
}

/// Run `f` with read tracking suspended: observables read inside do not
/// become dependencies of any enclosing tracked run.
pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
    let _guard = UntrackedGuard(untracked_start());
    f()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::observable::{
        observer_count, observers, propagate_changed, register_observable, report_observed,
    };
    use crate::graph::state::reset_global_state;

    fn noop_hook() -> Rc<dyn Fn()> {
        Rc::new(|| {})
    }

    #[test]
    fn repeated_reads_collapse_to_one_edge() {
        reset_global_state();
        let a = register_observable("a", None, None);
        let d = register_derivation("d", noop_hook());

        let result = track(d, || {
            for _ in 0..5 {
                report_observed(a);
            }
            7
        });

        assert!(matches!(result, TrackedResult::Value(7)));
        assert_eq!(observing(d), vec![a]);
        assert_eq!(observers(a), vec![d]);
    }

    #[test]
    fn rebinding_touches_only_the_symmetric_difference() {
        reset_global_state();
        let a = register_observable("a", None, None);
        let b = register_observable("b", None, None);
        let c = register_observable("c", None, None);
        let d = register_derivation("d", noop_hook());
        let other = register_derivation("other", noop_hook());

        track(d, || {
            report_observed(a);
            report_observed(b);
        });
        track(other, || {
            report_observed(a);
            report_observed(b);
        });

        // Snapshot a's observer layout, then re-track d with the same set
        // plus c. An unchanged member must keep its slot: a remove and
        // re-add would have swapped it to the tail.
        let layout_before = observers(a);
        track(d, || {
            report_observed(a);
            report_observed(b);
            report_observed(c);
        });
        assert_eq!(observers(a), layout_before);
        assert_eq!(observing(d), vec![a, b, c]);
        assert_eq!(observers(c), vec![d]);
    }

    #[test]
    fn dropped_reads_are_unbound() {
        reset_global_state();
        let a = register_observable("a", None, None);
        let b = register_observable("b", None, None);
        let d = register_derivation("d", noop_hook());

        track(d, || {
            report_observed(a);
            report_observed(b);
        });
        track(d, || {
            report_observed(b);
        });

        assert_eq!(observing(d), vec![b]);
        assert_eq!(observer_count(a), 0);
        assert_eq!(observer_count(b), 1);
    }

    #[test]
    fn diff_scratch_bits_are_clean_after_rebinding() {
        reset_global_state();
        let a = register_observable("a", None, None);
        let b = register_observable("b", None, None);
        let d = register_derivation("d", noop_hook());

        track(d, || {
            report_observed(a);
            report_observed(b);
        });
        track(d, || {
            report_observed(b);
        });

        with_state(|g| {
            assert_eq!(g.observables[&a].diff_value, 0);
            assert_eq!(g.observables[&b].diff_value, 0);
        });
    }

    #[test]
    fn panicking_body_still_binds_dependencies() {
        reset_global_state();
        let a = register_observable("a", None, None);
        let d = register_derivation("d", noop_hook());

        let result = track(d, || {
            report_observed(a);
            panic!("boom");
        });

        assert!(result.is_caught());
        if let TrackedResult::Caught(exception) = &result {
            assert_eq!(exception.message(), "boom");
        }
        assert_eq!(observing(d), vec![a]);
        assert_eq!(observers(a), vec![d]);
    }

    #[test]
    fn nested_runs_restore_the_outer_tracking_derivation() {
        reset_global_state();
        let a = register_observable("a", None, None);
        let b = register_observable("b", None, None);
        let outer = register_derivation("outer", noop_hook());
        let inner = register_derivation("inner", noop_hook());

        track(outer, || {
            report_observed(a);
            track(inner, || {
                report_observed(b);
            });
            // Still tracking `outer` here.
            report_observed(a);
        });

        assert_eq!(observing(outer), vec![a]);
        assert_eq!(observing(inner), vec![b]);
    }

    #[test]
    fn untracked_reads_do_not_bind() {
        reset_global_state();
        let a = register_observable("a", None, None);
        let b = register_observable("b", None, None);
        let d = register_derivation("d", noop_hook());

        track(d, || {
            report_observed(a);
            untracked(|| report_observed(b));
        });

        assert_eq!(observing(d), vec![a]);
        assert_eq!(observer_count(b), 0);
    }

    #[test]
    fn stale_after_change_and_fresh_after_retrack() {
        reset_global_state();
        let a = register_observable("a", None, None);
        let d = register_derivation("d", noop_hook());

        track(d, || report_observed(a));
        assert_eq!(derivation_state(d), Some(DerivationState::UpToDate));

        propagate_changed(a);
        assert_eq!(derivation_state(d), Some(DerivationState::Stale));
        assert!(should_compute(d));

        track(d, || report_observed(a));
        assert_eq!(derivation_state(d), Some(DerivationState::UpToDate));

        // The bound was relaxed by the re-run, so the next change
        // propagates again.
        propagate_changed(a);
        assert_eq!(derivation_state(d), Some(DerivationState::Stale));
    }
}
