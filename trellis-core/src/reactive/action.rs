//! Actions
//!
//! An action is the unit of intentional state mutation: a batch, with read
//! tracking suspended, and with the strict-mode write guard lowered for
//! its duration. All writes belong in actions; under strict mode the
//! runtime enforces it.

use crate::graph::batch::{end_batch, start_batch};
use crate::graph::derivation::{untracked_end, untracked_start, DerivationId};
use crate::graph::spy::{spy_report, SpyEvent, SpyKind, SpyPhase};
use crate::graph::state::with_state;

/// Run `f` as a named action.
///
/// Writes inside are always allowed, reads inside do not bind to any
/// enclosing tracked run, and reactions triggered by the writes run once,
/// when the action (and any enclosing batch) completes.
pub fn action<R>(name: &str, f: impl FnOnce() -> R) -> R {
    let _guard = ActionGuard::start(name);
    f()
}

/// Run `f` as an anonymous action.
pub fn run_in_action<R>(f: impl FnOnce() -> R) -> R {
    action("<unnamed action>", f)
}

struct ActionGuard {
    name: String,
    previous_allow: bool,
    previous_tracking: Option<DerivationId>,
}

impl ActionGuard {
    fn start(name: &str) -> Self {
        spy_report(|| SpyEvent::new(SpyPhase::Start, SpyKind::Action, name));
        tracing::trace!(action = name, "action start");
        let previous_allow = with_state(|g| {
            let previous = g.allow_state_changes;
            g.allow_state_changes = true;
            previous
        });
        start_batch();
        let previous_tracking = untracked_start();
        ActionGuard {
            name: name.to_string(),
            previous_allow,
            previous_tracking,
        }
    }
}

impl Drop for ActionGuard {
    fn drop(&mut self) {
        // Unwound in reverse order of setup. The write guard is restored
        // before the batch closes so reactions run with it back in force.
        with_state(|g| g.allow_state_changes = self.previous_allow);
        end_batch();
        untracked_end(self.previous_tracking.take());
        spy_report(|| SpyEvent::new(SpyPhase::End, SpyKind::Action, &self.name));
    }
}
