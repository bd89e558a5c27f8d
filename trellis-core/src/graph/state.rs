//! Global Reactive State
//!
//! The runtime keeps all bookkeeping for one reactive universe in a single
//! mutable structure: the node arenas, the currently tracking derivation,
//! batch and computation depth counters, the deferred-unobservation queue,
//! the pending-reaction queue, and process-wide flags.
//!
//! # Why thread-local
//!
//! The runtime is single-threaded and fully synchronous by contract. There
//! is no suspension point anywhere in the engine, so a `thread_local!`
//! `RefCell` is all the "synchronization" that is needed. Every thread gets
//! an independent reactive universe, which also keeps tests isolated for
//! free.
//!
//! # Borrow discipline
//!
//! All state access goes through [`with_state`], which holds the `RefCell`
//! borrow only for the duration of one closure. User callbacks (tracked
//! bodies, staleness hooks, teardown hooks, spy listeners) must never run
//! while the borrow is held; callers collect whatever they need under the
//! borrow and invoke callbacks after releasing it.

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::graph::derivation::{CaughtException, DerivationId, DerivationNode};
use crate::graph::error::ReactiveError;
use crate::graph::observable::{ObservableId, ObservableNode};
use crate::graph::reaction::Reaction;
use crate::graph::spy::SpyEvent;

/// Handler invoked for reaction errors that have no per-reaction handler.
/// Receives the reaction's name and the captured failure.
pub(crate) type ReactionErrorListener = Rc<dyn Fn(&str, &CaughtException)>;

/// All mutable state of one reactive universe.
pub(crate) struct GlobalState {
    /// Arena of observable nodes, keyed by their stable id.
    pub observables: IndexMap<ObservableId, ObservableNode>,

    /// Arena of derivation nodes, keyed by their stable id. The id doubles
    /// as the key in observables' reverse-index maps.
    pub derivations: IndexMap<DerivationId, DerivationNode>,

    /// The derivation whose tracked run is currently executing, if any.
    /// Nested runs save and restore this slot explicitly.
    pub tracking_derivation: Option<DerivationId>,

    /// Monotonically increasing id handed to each tracked run.
    /// Persists across [`reset_global_state`].
    pub run_id: u64,

    /// General purpose id counter. Persists across [`reset_global_state`].
    pub guid: u64,

    /// Batch nesting depth. Deferred unobservations drain only when the
    /// outermost batch closes.
    pub in_batch: u32,

    /// How many memoized computations are currently recomputing. Writes to
    /// root cells are rejected while this is non-zero.
    pub computation_depth: u32,

    /// Observables that lost their last observer and are waiting for the
    /// outermost batch to close before their teardown callback fires.
    pub pending_unobservations: Vec<ObservableId>,

    /// Reactions that have been scheduled but not yet run.
    pub pending_reactions: Vec<Rc<Reaction>>,

    /// True while the scheduler trampoline is draining the pending queue.
    pub is_running_reactions: bool,

    /// Whether root state cells may currently be written.
    pub allow_state_changes: bool,

    /// If enabled, observed cells may only be written inside an action.
    /// Persists across [`reset_global_state`].
    pub strict_mode: bool,

    /// Incremented on every [`reset_global_state`]. Persists across resets.
    pub reset_id: u64,

    /// Registered spy listeners. Persists across [`reset_global_state`].
    pub spy_listeners: Vec<(u64, Rc<dyn Fn(&SpyEvent)>)>,

    /// Process-wide fallback handlers for reaction errors.
    pub reaction_error_handlers: Vec<(u64, ReactionErrorListener)>,
}

impl Default for GlobalState {
    fn default() -> Self {
        Self {
            observables: IndexMap::new(),
            derivations: IndexMap::new(),
            tracking_derivation: None,
            run_id: 0,
            guid: 0,
            in_batch: 0,
            computation_depth: 0,
            pending_unobservations: Vec::new(),
            pending_reactions: Vec::new(),
            is_running_reactions: false,
            allow_state_changes: true,
            strict_mode: false,
            reset_id: 0,
            spy_listeners: Vec::new(),
            reaction_error_handlers: Vec::new(),
        }
    }
}

impl GlobalState {
    /// Hand out the next general purpose unique id.
    pub fn next_guid(&mut self) -> u64 {
        self.guid += 1;
        self.guid
    }

    /// Hand out the next tracked-run id. Run ids start at 1 so that the
    /// zero default of `last_accessed_by` never collides with a real run.
    pub fn next_run_id(&mut self) -> u64 {
        self.run_id += 1;
        self.run_id
    }
}

thread_local! {
    static STATE: RefCell<GlobalState> = RefCell::new(GlobalState::default());
}

/// Run `f` with exclusive access to the reactive state of this thread.
///
/// The borrow is held only while `f` runs; `f` must not call back into user
/// code.
pub(crate) fn with_state<R>(f: impl FnOnce(&mut GlobalState) -> R) -> R {
    STATE.with(|state| f(&mut state.borrow_mut()))
}

/// Hand out the next general purpose unique id.
///
/// Useful for building diagnostic names before a node is registered.
pub fn next_guid() -> u64 {
    with_state(|g| g.next_guid())
}

/// Enable or disable strict mode.
///
/// Under strict mode, observed state cells may only be modified inside an
/// action. Toggling while a tracked run or batch is in progress is a
/// programming error.
pub fn set_strict_mode(enabled: bool) {
    with_state(|g| {
        debug_assert!(
            g.tracking_derivation.is_none() && g.in_batch == 0,
            "strict mode may not be toggled while a tracked run or batch is in progress"
        );
        g.strict_mode = enabled;
        g.allow_state_changes = !enabled;
    });
}

/// Whether strict mode is currently enabled.
pub fn is_strict_mode() -> bool {
    with_state(|g| g.strict_mode)
}

/// Restore all mutable runtime state to its defaults, for test isolation.
///
/// This breaks the internal bookkeeping of any live observables and
/// derivations, but gets the runtime back to a stable baseline after a
/// failure. The id counters, registered spy listeners, the strict-mode
/// flag, and the reset counter survive the reset.
pub fn reset_global_state() {
    let previous = with_state(|g| {
        let fresh = GlobalState {
            run_id: g.run_id,
            guid: g.guid,
            strict_mode: g.strict_mode,
            reset_id: g.reset_id + 1,
            allow_state_changes: !g.strict_mode,
            spy_listeners: std::mem::take(&mut g.spy_listeners),
            ..GlobalState::default()
        };
        std::mem::replace(g, fresh)
    });
    // The old state can hold the last handle to reactions and node hooks,
    // whose teardown calls back into the runtime. It must drop only after
    // the borrow is released.
    drop(previous);
}

/// How many times [`reset_global_state`] has been called on this thread.
pub fn reset_id() -> u64 {
    with_state(|g| g.reset_id)
}

/// Check whether a root state cell may be written right now.
///
/// Fails if a memoized computation is currently recomputing, or if strict
/// mode is on, the cell has observers, and the write is not wrapped in an
/// action. The check happens before the write, so a rejected write is never
/// partially applied.
pub fn check_writes_allowed(observable: ObservableId) -> Result<(), ReactiveError> {
    with_state(|g| {
        let (name, has_observers) = match g.observables.get(&observable) {
            Some(node) => (node.name.clone(), !node.observers.is_empty()),
            None => return Ok(()),
        };
        if g.computation_depth > 0 {
            return Err(ReactiveError::WriteDuringComputation { name });
        }
        if !g.allow_state_changes && has_observers {
            return Err(ReactiveError::WriteOutsideAction { name });
        }
        Ok(())
    })
}
