//! Reactions and the Scheduler
//!
//! A reaction is a derivation that produces effects instead of a value.
//! When something it observed goes stale, the reaction schedules itself;
//! the scheduler drains the pending queue as soon as the outermost batch
//! closes, so effects run exactly once per batch no matter how many of
//! their dependencies changed.
//!
//! # The trampoline
//!
//! Reactions may write state, which can schedule further reactions. The
//! scheduler therefore loops: take the whole queue, run it, and repeat
//! until a pass leaves the queue empty. A cycle of reactions that keeps
//! re-invalidating itself would loop forever, so the trampoline gives up
//! after [`MAX_REACTION_ITERATIONS`] passes and reports the cycle as a
//! fatal error.
//!
//! # Error routing
//!
//! A panic inside a reaction body is captured, the reaction's dependencies
//! stay bound (it will re-run when they change), and the failure is routed
//! to the reaction's own error handler, falling back to process-wide
//! handlers, falling back to the log.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::graph::batch::{end_batch, start_batch};
use crate::graph::derivation::{
    clear_observing, register_derivation, should_compute, track, unregister_derivation,
    CaughtException, DerivationId, TrackedResult,
};
use crate::graph::error::ReactiveError;
use crate::graph::spy::{spy_report, SpyEvent, SpyKind, SpyPhase};
use crate::graph::state::{with_state, ReactionErrorListener};

/// Scheduler passes allowed before a reaction cycle is declared
/// non-converging.
pub const MAX_REACTION_ITERATIONS: usize = 100;

/// An effectful derivation driven by the scheduler.
///
/// `on_invalidate` decides what a scheduled run actually does; the common
/// choice is to call [`Reaction::track`] with the effect body, but a
/// delayed or coalesced runner can do something else entirely.
pub struct Reaction {
    name: String,
    derivation: DerivationId,
    is_scheduled: Cell<bool>,
    is_track_pending: Cell<bool>,
    is_running: Cell<bool>,
    is_disposed: Cell<bool>,
    on_invalidate: Box<dyn Fn(&Rc<Reaction>)>,
    error_handler: RefCell<Option<Rc<dyn Fn(&CaughtException)>>>,
}

impl Reaction {
    /// Create a reaction. It does nothing until [`schedule`](Self::schedule)
    /// is called or a tracked dependency goes stale.
    pub fn new(
        name: impl Into<String>,
        on_invalidate: impl Fn(&Rc<Reaction>) + 'static,
    ) -> Rc<Self> {
        let name = name.into();
        Rc::new_cyclic(|weak: &Weak<Reaction>| {
            let hook_weak = weak.clone();
            let on_become_stale: Rc<dyn Fn()> = Rc::new(move || {
                if let Some(reaction) = hook_weak.upgrade() {
                    reaction.schedule();
                }
            });
            let derivation = register_derivation(name.clone(), on_become_stale);
            Reaction {
                name,
                derivation,
                is_scheduled: Cell::new(false),
                is_track_pending: Cell::new(false),
                is_running: Cell::new(false),
                is_disposed: Cell::new(false),
                on_invalidate: Box::new(on_invalidate),
                error_handler: RefCell::new(None),
            }
        })
    }

    /// Diagnostic name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Id of the underlying derivation node.
    pub fn derivation(&self) -> DerivationId {
        self.derivation
    }

    /// Whether this reaction has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.is_disposed.get()
    }

    /// Whether an invalidation has been delivered but the re-tracking run
    /// has not happened yet. Diagnostic.
    pub fn is_track_pending(&self) -> bool {
        self.is_track_pending.get()
    }

    /// Install a handler that receives failures from this reaction's runs
    /// instead of the process-wide fallback chain.
    pub fn set_error_handler(&self, handler: Option<Rc<dyn Fn(&CaughtException)>>) {
        *self.error_handler.borrow_mut() = handler;
    }

    /// Queue this reaction for execution. Scheduling an already scheduled
    /// or disposed reaction is a no-op. Outside a batch the queue drains
    /// immediately.
    pub fn schedule(self: &Rc<Self>) {
        if self.is_scheduled.get() || self.is_disposed.get() {
            return;
        }
        self.is_scheduled.set(true);
        spy_report(|| SpyEvent::new(SpyPhase::Start, SpyKind::Schedule, &self.name));
        with_state(|g| g.pending_reactions.push(self.clone()));
        run_reactions();
    }

    /// One scheduler-driven execution: decide whether a re-run is needed
    /// and, if so, hand control to `on_invalidate`.
    fn run_reaction(self: &Rc<Self>) {
        if self.is_disposed.get() {
            return;
        }
        start_batch();
        self.is_scheduled.set(false);
        if should_compute(self.derivation) {
            self.is_track_pending.set(true);
            (self.on_invalidate)(self);
        }
        end_batch();
    }

    /// Run `body` as this reaction's tracked effect, rebinding its
    /// dependencies and routing any failure to the error handlers.
    pub fn track(self: &Rc<Self>, body: impl FnOnce()) {
        if self.is_disposed.get() {
            return;
        }
        start_batch();
        spy_report(|| SpyEvent::new(SpyPhase::Start, SpyKind::Reaction, &self.name));
        self.is_running.set(true);
        let result = track(self.derivation, body);
        self.is_running.set(false);
        self.is_track_pending.set(false);
        if self.is_disposed.get() {
            // Disposed from within its own body; the fresh edges must go.
            with_state(|g| clear_observing(g, self.derivation));
        }
        if let TrackedResult::Caught(exception) = result {
            self.report_error(&exception);
        }
        spy_report(|| SpyEvent::new(SpyPhase::End, SpyKind::Reaction, &self.name));
        end_batch();
    }

    fn report_error(&self, exception: &CaughtException) {
        tracing::error!(reaction = %self.name, error = %exception, "reaction failed");
        let own = self.error_handler.borrow().clone();
        if let Some(handler) = own {
            handler(exception);
            return;
        }
        let fallbacks: Vec<ReactionErrorListener> =
            with_state(|g| g.reaction_error_handlers.iter().map(|(_, h)| h.clone()).collect());
        for handler in fallbacks {
            handler(&self.name, exception);
        }
    }

    /// Permanently stop this reaction and drop its dependency edges.
    /// Idempotent. If called from inside the reaction's own body, edge
    /// cleanup happens when the body finishes.
    pub fn dispose(&self) {
        if self.is_disposed.get() {
            return;
        }
        self.is_disposed.set(true);
        if !self.is_running.get() {
            start_batch();
            with_state(|g| clear_observing(g, self.derivation));
            end_batch();
        }
    }
}

impl Drop for Reaction {
    fn drop(&mut self) {
        self.dispose();
        unregister_derivation(self.derivation);
    }
}

impl std::fmt::Debug for Reaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reaction")
            .field("name", &self.name)
            .field("scheduled", &self.is_scheduled.get())
            .field("disposed", &self.is_disposed.get())
            .finish()
    }
}

/// Drain the pending-reaction queue until it stays empty.
///
/// No-op while a batch is open or while another drain is already on the
/// stack; in both cases the active frame picks the new entries up. Panics
/// with [`ReactiveError::NonConvergingCycle`] when the queue refuses to
/// drain.
pub(crate) fn run_reactions() {
    let proceed = with_state(|g| {
        if g.in_batch > 0 || g.is_running_reactions {
            return false;
        }
        g.is_running_reactions = true;
        true
    });
    if !proceed {
        return;
    }

    let mut iterations = 0;
    loop {
        let pass: Vec<Rc<Reaction>> = with_state(|g| std::mem::take(&mut g.pending_reactions));
        if pass.is_empty() {
            break;
        }
        iterations += 1;
        if iterations > MAX_REACTION_ITERATIONS {
            for reaction in &pass {
                reaction.is_scheduled.set(false);
            }
            // Taken out under the borrow, dropped outside it: releasing a
            // queue entry can run reaction teardown that re-enters the
            // runtime.
            let overflow = with_state(|g| {
                g.is_running_reactions = false;
                std::mem::take(&mut g.pending_reactions)
            });
            drop(overflow);
            let error = ReactiveError::NonConvergingCycle {
                limit: MAX_REACTION_ITERATIONS,
            };
            tracing::error!(%error, "reaction scheduler gave up");
            panic!("{error}");
        }
        for reaction in pass {
            reaction.run_reaction();
        }
    }
    with_state(|g| g.is_running_reactions = false);
}

/// Handle for a process-wide reaction error handler. Dropping it
/// unregisters the handler.
pub struct ReactionErrorHandle {
    id: u64,
}

/// Register a fallback handler for reaction failures that have no
/// per-reaction handler. Handlers receive the reaction's name and the
/// captured failure.
pub fn on_reaction_error(
    handler: impl Fn(&str, &CaughtException) + 'static,
) -> ReactionErrorHandle {
    let handler: ReactionErrorListener = Rc::new(handler);
    let id = with_state(|g| {
        let id = g.next_guid();
        g.reaction_error_handlers.push((id, handler));
        id
    });
    ReactionErrorHandle { id }
}

impl Drop for ReactionErrorHandle {
    fn drop(&mut self) {
        with_state(|g| {
            g.reaction_error_handlers.retain(|(id, _)| *id != self.id);
        });
    }
}
