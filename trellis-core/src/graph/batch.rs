//! Batching
//!
//! A batch delimits a unit of work during which the graph may pass through
//! inconsistent intermediate shapes. Two things are deferred to the close
//! of the outermost batch: scheduled reactions, and the teardown of
//! observables that lost their last observer.
//!
//! Deferring teardown matters because edges flicker during a tracked run:
//! rebinding can drop an edge and re-add it moments later. Tearing down a
//! derived value in that window would wastefully discard its cache. Every
//! tracked run and every reaction run is wrapped in its own batch, so the
//! guarantee holds without callers doing anything.
//!
//! Batches nest freely; only the outermost close triggers the flush.

use std::rc::Rc;

use crate::graph::reaction::run_reactions;
use crate::graph::state::with_state;

/// Open a batch. Must be paired with [`end_batch`].
pub fn start_batch() {
    with_state(|g| g.in_batch += 1);
}

/// Close a batch. When the outermost batch closes, pending reactions run
/// and deferred unobservations are flushed.
pub fn end_batch() {
    let outermost = with_state(|g| {
        debug_assert!(g.in_batch > 0, "end_batch without a matching start_batch");
        g.in_batch -= 1;
        g.in_batch == 0
    });
    if outermost {
        run_reactions();
        drain_pending_unobservations();
    }
}

/// Fire teardown callbacks for every queued observable that is still
/// unobserved.
///
/// A node queued earlier in the batch may have been re-observed since, in
/// which case only its pending flag is cleared. Callbacks run outside the
/// state borrow and may queue further unobservations, which the index loop
/// picks up.
fn drain_pending_unobservations() {
    let mut i = 0;
    loop {
        let callback: Option<Rc<dyn Fn()>> = {
            let next = with_state(|g| g.pending_unobservations.get(i).copied());
            let Some(observable) = next else { break };
            with_state(|g| {
                let Some(node) = g.observables.get_mut(&observable) else {
                    return None;
                };
                node.is_pending_unobservation = false;
                if node.observers.is_empty() {
                    node.on_become_unobserved.clone()
                } else {
                    None
                }
            })
        };
        if let Some(callback) = callback {
            callback();
        }
        i += 1;
    }
    with_state(|g| g.pending_unobservations.clear());
}

/// Run `f` inside a batch: writes made by `f` propagate staleness
/// immediately, but reactions and teardown wait for the batch to close.
pub fn transaction<R>(f: impl FnOnce() -> R) -> R {
    let _guard = BatchGuard::open();
    f()
}

struct BatchGuard;

impl BatchGuard {
    fn open() -> Self {
        start_batch();
        BatchGuard
    }
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        end_batch();
    }
}
