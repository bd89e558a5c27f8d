//! The Dependency Graph Engine
//!
//! Everything reactive sits on a bidirectional graph between observables
//! (things that hold readable state) and derivations (things that compute
//! from it). This module owns that graph and the algorithms over it:
//!
//! - [`observable`]: observer edges and staleness propagation
//! - [`derivation`]: tracked runs, dependency diffing, the recompute
//!   decision
//! - [`batch`]: nested batches and deferred teardown
//! - [`reaction`]: the effect scheduler and its trampoline
//! - [`state`]: the thread-local runtime state
//! - [`spy`]: runtime introspection events
//!
//! The higher-level vocabulary ([`Signal`](crate::reactive::Signal),
//! [`Memo`](crate::reactive::Memo), [`Effect`](crate::reactive::Effect))
//! lives in [`reactive`](crate::reactive) and is what most code should
//! use; this layer is public for building new reactive primitives.

pub mod batch;
pub mod derivation;
pub mod error;
pub mod observable;
pub mod reaction;
pub mod spy;
pub mod state;

pub use batch::{end_batch, start_batch, transaction};
pub use derivation::{
    derivation_name, derivation_state, observing, register_derivation, should_compute, track,
    unregister_derivation, untracked, CaughtException, DerivationId, DerivationState,
    TrackedResult,
};
pub use error::ReactiveError;
pub use observable::{
    has_observers, observable_name, observer_count, observers, propagate_change_confirmed,
    propagate_changed, propagate_maybe_changed, register_observable, report_observed,
    unregister_observable, ObservableId,
};
pub use reaction::{
    on_reaction_error, Reaction, ReactionErrorHandle, MAX_REACTION_ITERATIONS,
};
pub use spy::{is_spy_enabled, spy, SpyEvent, SpyHandle, SpyKind, SpyPhase};
pub use state::{
    check_writes_allowed, is_strict_mode, next_guid, reset_global_state, reset_id,
    set_strict_mode,
};
