//! Observable Nodes and Propagation
//!
//! An observable is any graph node that holds readable state: a root cell,
//! or the output side of a memoized derived value. This module owns the
//! observer edge structure on the observable side and the three propagation
//! algorithms that push staleness outward when state changes.
//!
//! # Edge representation
//!
//! Observers are kept in a raw list for fast iteration during propagation,
//! together with a reverse map from observer id to list position. By
//! convention position 0 is never stored in the map, which saves one entry
//! per observable. Removal swaps the last observer into the freed slot and
//! repairs both map entries, so adding and removing an edge are both O(1).
//!
//! # Propagation
//!
//! Three entry points push staleness through the graph:
//!
//! - [`propagate_changed`]: a root cell's value changed. Observers go
//!   straight to `Stale`.
//! - [`propagate_maybe_changed`]: a memoized value's inputs changed but it
//!   has not recomputed yet, so its own output status is unknown. Observers
//!   go to `PossiblyStale`.
//! - [`propagate_change_confirmed`]: a memoized value recomputed and its
//!   result actually changed. `PossiblyStale` observers are confirmed
//!   `Stale`.
//!
//! Each observable caches `lowest_observer_state`, a conservative lower
//! bound on its observers' states. Propagation consults it to skip passes
//! that cannot change anything, which makes repeated change reports on the
//! same observable O(1).

use std::collections::HashMap;
use std::rc::Rc;

use smallvec::SmallVec;

use crate::graph::derivation::{DerivationId, DerivationState};
use crate::graph::state::{with_state, GlobalState};

/// Stable identity of an observable node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObservableId(pub(crate) u64);

impl ObservableId {
    /// Get the raw id value.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Per-observable bookkeeping held in the node arena.
pub(crate) struct ObservableNode {
    /// Diagnostic label.
    pub name: String,

    /// Scratch bit used by the dependency diff. Zero outside a diff pass.
    pub diff_value: u8,

    /// Id of the tracked run that last read this node. Lets a run collapse
    /// repeated reads of the same observable in O(1).
    pub last_accessed_by: u64,

    /// Conservative lower bound on the observers' staleness states. Never
    /// an over-estimate; used to short-circuit redundant propagation.
    pub lowest_observer_state: DerivationState,

    /// True while queued for deferred teardown.
    pub is_pending_unobservation: bool,

    /// Current observers. Order carries no meaning, but stays stable within
    /// a batch so removal can swap from the tail.
    pub observers: SmallVec<[DerivationId; 4]>,

    /// Reverse lookup from observer id to its position in `observers`.
    /// Position 0 is never stored.
    pub observers_index: HashMap<DerivationId, usize>,

    /// Fired when the node loses its last observer at the close of the
    /// outermost batch.
    pub on_become_unobserved: Option<Rc<dyn Fn()>>,

    /// Present only for observables backed by a memoized computation.
    /// Resolves the cached value, recomputing if needed, without panicking.
    pub force: Option<Rc<dyn Fn()>>,
}

/// Register a new observable node and return its id.
///
/// `on_become_unobserved` fires at most once per outermost batch, when the
/// node has no observers at that moment. `force` must be provided for
/// observables whose value is itself derived; the recompute-decision walk
/// uses it to resolve possibly-stale chains lazily.
pub fn register_observable(
    name: impl Into<String>,
    on_become_unobserved: Option<Rc<dyn Fn()>>,
    force: Option<Rc<dyn Fn()>>,
) -> ObservableId {
    with_state(|g| {
        let id = ObservableId(g.next_guid());
        g.observables.insert(
            id,
            ObservableNode {
                name: name.into(),
                diff_value: 0,
                last_accessed_by: 0,
                lowest_observer_state: DerivationState::UpToDate,
                is_pending_unobservation: false,
                observers: SmallVec::new(),
                observers_index: HashMap::new(),
                on_become_unobserved,
                force,
            },
        );
        id
    })
}

/// Remove an observable node from the arena.
///
/// Called by the owning collaborator when it is dropped. Any ids still held
/// elsewhere become inert; all graph operations on a missing node are
/// no-ops.
pub fn unregister_observable(id: ObservableId) {
    with_state(|g| {
        g.observables.shift_remove(&id);
    });
}

/// Replace the teardown callback of an observable.
pub fn set_on_become_unobserved(id: ObservableId, callback: Option<Rc<dyn Fn()>>) {
    with_state(|g| {
        if let Some(node) = g.observables.get_mut(&id) {
            node.on_become_unobserved = callback;
        }
    });
}

/// Diagnostic name of an observable.
pub fn observable_name(id: ObservableId) -> Option<String> {
    with_state(|g| g.observables.get(&id).map(|n| n.name.clone()))
}

/// Number of current observers of an observable.
pub fn observer_count(id: ObservableId) -> usize {
    with_state(|g| g.observables.get(&id).map_or(0, |n| n.observers.len()))
}

/// Whether an observable currently has observers.
pub fn has_observers(id: ObservableId) -> bool {
    observer_count(id) > 0
}

/// Snapshot of an observable's current observers, for diagnostics.
pub fn observers(id: ObservableId) -> Vec<DerivationId> {
    with_state(|g| {
        g.observables
            .get(&id)
            .map(|n| n.observers.to_vec())
            .unwrap_or_default()
    })
}

/// Append `derivation` to the observer list of `observable`.
///
/// Keeps `lowest_observer_state` a valid lower bound by folding in the new
/// observer's state. The bound may temporarily under-count, which is fine:
/// it only ever causes extra propagation work, never skipped work.
pub(crate) fn add_observer(
    g: &mut GlobalState,
    observable: ObservableId,
    derivation: DerivationId,
) {
    let derivation_state = match g.derivations.get(&derivation) {
        Some(node) => node.state,
        None => return,
    };
    let Some(node) = g.observables.get_mut(&observable) else {
        return;
    };
    let count = node.observers.len();
    if count > 0 {
        node.observers_index.insert(derivation, count);
    }
    node.observers.push(derivation);
    if node.lowest_observer_state > derivation_state {
        node.lowest_observer_state = derivation_state;
    }
    #[cfg(debug_assertions)]
    check_observers_integrity(g, observable);
}

/// Remove `derivation` from the observer list of `observable` in O(1).
///
/// The last observer is popped and, if it is not the one being removed,
/// written into the freed slot; both reverse-map entries are repaired. When
/// the last observer goes away the node is queued for deferred teardown.
pub(crate) fn remove_observer(
    g: &mut GlobalState,
    observable: ObservableId,
    derivation: DerivationId,
) {
    let became_unobserved = {
        let Some(node) = g.observables.get_mut(&observable) else {
            return;
        };
        if node.observers.len() == 1 {
            debug_assert_eq!(
                node.observers[0], derivation,
                "removing an observer that is not present on '{}'",
                node.name
            );
            node.observers.clear();
            node.observers_index.clear();
            true
        } else {
            let Some(filler) = node.observers.pop() else {
                return;
            };
            if filler != derivation {
                // Index 0 is never stored in the map; a missing entry means
                // the removed observer sits at the front.
                let index = node.observers_index.get(&derivation).copied().unwrap_or(0);
                if index != 0 {
                    node.observers_index.insert(filler, index);
                } else {
                    node.observers_index.remove(&filler);
                }
                node.observers[index] = filler;
            }
            node.observers_index.remove(&derivation);
            false
        }
    };
    if became_unobserved {
        queue_for_unobservation(g, observable);
    }
    #[cfg(debug_assertions)]
    check_observers_integrity(g, observable);
}

/// Queue an observable for deferred teardown, at most once per batch.
pub(crate) fn queue_for_unobservation(g: &mut GlobalState, observable: ObservableId) {
    if let Some(node) = g.observables.get_mut(&observable) {
        if !node.is_pending_unobservation {
            node.is_pending_unobservation = true;
            g.pending_unobservations.push(observable);
        }
    }
}

/// Record that `observable` was read.
///
/// If a tracked run is active, the read is appended to the run's scratch
/// dependency list, deduplicated against repeated reads within the same run
/// via `last_accessed_by`. A read outside any tracked run of a node with no
/// observers queues the node for deferred teardown, so it does not linger
/// half-alive.
pub fn report_observed(observable: ObservableId) {
    with_state(|g| {
        let Some(derivation) = g.tracking_derivation else {
            let unobserved = g
                .observables
                .get(&observable)
                .is_some_and(|n| n.observers.is_empty());
            if unobserved {
                queue_for_unobservation(g, observable);
            }
            return;
        };
        let run_id = match g.derivations.get(&derivation) {
            Some(node) => node.run_id,
            None => return,
        };
        let already_seen = match g.observables.get_mut(&observable) {
            Some(node) => {
                if node.last_accessed_by == run_id {
                    true
                } else {
                    node.last_accessed_by = run_id;
                    false
                }
            }
            None => return,
        };
        if !already_seen {
            if let Some(node) = g.derivations.get_mut(&derivation) {
                if let Some(new_observing) = node.new_observing.as_mut() {
                    new_observing.push(observable);
                    node.unbound_count += 1;
                }
            }
        }
    });
}

/// A root state cell's value changed: mark every observer stale.
///
/// Observers that were up to date get their staleness hook invoked, which
/// is what ultimately schedules reactions. Calling this twice without an
/// intervening recompute is a no-op the second time.
///
/// A write can also land inside the writing derivation's own tracked run.
/// The edges for that run are not bound yet, so the observers walk cannot
/// see it; `last_accessed_by` tells us whether the current run already read
/// this observable, and if so the run is marked stale and rescheduled.
pub fn propagate_changed(observable: ObservableId) {
    let stale_hooks: Vec<Rc<dyn Fn()>> = with_state(|g| {
        let observers = {
            let Some(node) = g.observables.get_mut(&observable) else {
                return Vec::new();
            };
            if node.lowest_observer_state == DerivationState::Stale {
                return Vec::new();
            }
            node.lowest_observer_state = DerivationState::Stale;
            node.observers.clone()
        };

        let mut hooks = Vec::new();
        for &observer in observers.iter().rev() {
            if let Some(node) = g.derivations.get_mut(&observer) {
                if node.state == DerivationState::UpToDate {
                    hooks.push(node.on_become_stale.clone());
                }
                node.state = DerivationState::Stale;
            }
        }

        if let Some(tracking) = g.tracking_derivation {
            let read_this_run = g
                .observables
                .get(&observable)
                .zip(g.derivations.get(&tracking))
                .is_some_and(|(o, d)| o.last_accessed_by == d.run_id);
            if read_this_run {
                if let Some(node) = g.derivations.get_mut(&tracking) {
                    if node.state != DerivationState::Stale {
                        hooks.push(node.on_become_stale.clone());
                        node.state = DerivationState::Stale;
                    }
                }
            }
        }

        hooks
    });
    for hook in stale_hooks {
        hook();
    }
}

/// A memoized value recomputed and its result genuinely changed: confirm
/// previously deferred staleness.
///
/// An observer that is still up to date at this point is the one currently
/// recomputing upstream of this change; the lower bound is relaxed back to
/// up-to-date as a signal that the chain stays consistent for it. No
/// staleness hooks fire here: observers already got theirs when they went
/// possibly-stale.
pub fn propagate_change_confirmed(observable: ObservableId) {
    with_state(|g| {
        let observers = {
            let Some(node) = g.observables.get_mut(&observable) else {
                return;
            };
            if node.lowest_observer_state == DerivationState::Stale {
                return;
            }
            node.lowest_observer_state = DerivationState::Stale;
            node.observers.clone()
        };

        let mut lowest = DerivationState::Stale;
        for &observer in observers.iter().rev() {
            if let Some(node) = g.derivations.get_mut(&observer) {
                match node.state {
                    DerivationState::PossiblyStale => node.state = DerivationState::Stale,
                    DerivationState::UpToDate => lowest = DerivationState::UpToDate,
                    _ => {}
                }
            }
        }
        if lowest != DerivationState::Stale {
            if let Some(node) = g.observables.get_mut(&observable) {
                node.lowest_observer_state = lowest;
            }
        }
    });
}

/// A memoized value's inputs changed but it has not recomputed yet: mark
/// up-to-date observers possibly stale and fire their staleness hooks.
///
/// If the lower bound already says the observers are not all up to date,
/// this propagation has happened before and the call is a no-op.
pub fn propagate_maybe_changed(observable: ObservableId) {
    let stale_hooks: Vec<Rc<dyn Fn()>> = with_state(|g| {
        let observers = {
            let Some(node) = g.observables.get_mut(&observable) else {
                return Vec::new();
            };
            if node.lowest_observer_state != DerivationState::UpToDate {
                return Vec::new();
            }
            node.lowest_observer_state = DerivationState::PossiblyStale;
            node.observers.clone()
        };

        let mut hooks = Vec::new();
        for &observer in observers.iter().rev() {
            if let Some(node) = g.derivations.get_mut(&observer) {
                if node.state == DerivationState::UpToDate {
                    node.state = DerivationState::PossiblyStale;
                    hooks.push(node.on_become_stale.clone());
                }
            }
        }
        hooks
    });
    for hook in stale_hooks {
        hook();
    }
}

/// Verify the observers list and its reverse map agree. Debug builds only.
#[cfg(debug_assertions)]
pub(crate) fn check_observers_integrity(g: &GlobalState, observable: ObservableId) {
    let Some(node) = g.observables.get(&observable) else {
        return;
    };
    for (i, observer) in node.observers.iter().enumerate() {
        if i == 0 {
            debug_assert!(
                !node.observers_index.contains_key(observer),
                "observer at position 0 of '{}' must not be held in the reverse map",
                node.name
            );
        } else {
            debug_assert_eq!(
                node.observers_index.get(observer).copied(),
                Some(i),
                "reverse map out of sync for '{}'",
                node.name
            );
        }
    }
    debug_assert!(
        node.observers.is_empty() || node.observers_index.len() == node.observers.len() - 1,
        "junk entries in the reverse map of '{}'",
        node.name
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::derivation::register_derivation;
    use crate::graph::state::reset_global_state;

    fn noop_hook() -> Rc<dyn Fn()> {
        Rc::new(|| {})
    }

    #[test]
    fn add_and_remove_observer_repair_the_reverse_map() {
        reset_global_state();
        let observable = register_observable("cell", None, None);
        let d1 = register_derivation("d1", noop_hook());
        let d2 = register_derivation("d2", noop_hook());
        let d3 = register_derivation("d3", noop_hook());

        with_state(|g| {
            add_observer(g, observable, d1);
            add_observer(g, observable, d2);
            add_observer(g, observable, d3);
        });
        assert_eq!(observers(observable), vec![d1, d2, d3]);

        // Removing from the middle swaps the tail observer into the slot.
        with_state(|g| remove_observer(g, observable, d2));
        assert_eq!(observers(observable), vec![d1, d3]);

        // Removing the front slot, which is not held in the reverse map.
        with_state(|g| remove_observer(g, observable, d1));
        assert_eq!(observers(observable), vec![d3]);

        with_state(|g| remove_observer(g, observable, d3));
        assert_eq!(observer_count(observable), 0);
    }

    #[test]
    fn removing_last_observer_queues_deferred_teardown() {
        reset_global_state();
        let observable = register_observable("cell", None, None);
        let d = register_derivation("d", noop_hook());

        with_state(|g| add_observer(g, observable, d));
        with_state(|g| remove_observer(g, observable, d));

        with_state(|g| {
            assert!(g.observables[&observable].is_pending_unobservation);
            assert_eq!(g.pending_unobservations, vec![observable]);
        });
    }

    #[test]
    fn propagate_changed_is_idempotent_between_recomputes() {
        reset_global_state();
        let observable = register_observable("cell", None, None);
        let hits = Rc::new(std::cell::Cell::new(0));
        let hook: Rc<dyn Fn()> = {
            let hits = hits.clone();
            Rc::new(move || hits.set(hits.get() + 1))
        };
        let d = register_derivation("d", hook);
        with_state(|g| {
            g.derivations.get_mut(&d).unwrap().state = DerivationState::UpToDate;
            add_observer(g, observable, d);
        });

        propagate_changed(observable);
        assert_eq!(hits.get(), 1);

        // Second report without a recompute short-circuits on the bound.
        propagate_changed(observable);
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn maybe_changed_only_touches_up_to_date_observers() {
        reset_global_state();
        let observable = register_observable("memo", None, None);
        let hits = Rc::new(std::cell::Cell::new(0));
        let hook: Rc<dyn Fn()> = {
            let hits = hits.clone();
            Rc::new(move || hits.set(hits.get() + 1))
        };
        let d = register_derivation("d", hook);
        with_state(|g| {
            g.derivations.get_mut(&d).unwrap().state = DerivationState::UpToDate;
            add_observer(g, observable, d);
        });

        propagate_maybe_changed(observable);
        assert_eq!(hits.get(), 1);
        with_state(|g| {
            assert_eq!(
                g.derivations[&d].state,
                DerivationState::PossiblyStale
            );
        });

        // Already propagated; nothing further to do.
        propagate_maybe_changed(observable);
        assert_eq!(hits.get(), 1);
    }

    #[test]
    fn confirmed_change_upgrades_possibly_stale_without_new_hooks() {
        reset_global_state();
        let observable = register_observable("memo", None, None);
        let hits = Rc::new(std::cell::Cell::new(0));
        let hook: Rc<dyn Fn()> = {
            let hits = hits.clone();
            Rc::new(move || hits.set(hits.get() + 1))
        };
        let d = register_derivation("d", hook);
        with_state(|g| {
            g.derivations.get_mut(&d).unwrap().state = DerivationState::UpToDate;
            add_observer(g, observable, d);
        });

        propagate_maybe_changed(observable);
        propagate_change_confirmed(observable);

        assert_eq!(hits.get(), 1, "confirmation must not fire hooks again");
        with_state(|g| {
            assert_eq!(g.derivations[&d].state, DerivationState::Stale);
        });
    }
}
