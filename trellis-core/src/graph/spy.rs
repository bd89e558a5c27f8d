//! Spy Instrumentation
//!
//! Spies observe the runtime itself: every change report, tracked run,
//! reaction execution, action, and scheduling decision is reported to the
//! registered listeners. Listener registration survives
//! [`reset_global_state`](crate::graph::state::reset_global_state) so a
//! debugging session can span test-style resets.
//!
//! Event construction is skipped entirely when no listener is registered;
//! the hot paths pay one cheap emptiness check. A `tracing` event at trace
//! level is emitted unconditionally alongside, so the usual subscriber
//! machinery sees the same stream.

use std::rc::Rc;
use std::time::Instant;

use crate::graph::state::with_state;

/// Whether an event marks the start or the end of a span. Instantaneous
/// events use `Start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpyPhase {
    Start,
    End,
}

/// What kind of runtime activity an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpyKind {
    /// A value change was reported on an observable.
    Change,
    /// A derivation ran with tracking enabled.
    Track,
    /// A reaction's effect body executed.
    Reaction,
    /// An action ran.
    Action,
    /// A reaction was queued with the scheduler.
    Schedule,
}

/// One spy event.
#[derive(Debug, Clone)]
pub struct SpyEvent {
    pub phase: SpyPhase,
    pub kind: SpyKind,
    /// Diagnostic name of the node or action involved.
    pub subject: String,
    pub timestamp: Instant,
}

impl SpyEvent {
    pub(crate) fn new(phase: SpyPhase, kind: SpyKind, subject: &str) -> Self {
        Self {
            phase,
            kind,
            subject: subject.to_string(),
            timestamp: Instant::now(),
        }
    }
}

/// Handle for a registered spy listener. Dropping it unregisters the
/// listener.
pub struct SpyHandle {
    id: u64,
}

/// Register a listener for all runtime events on this thread.
pub fn spy(listener: impl Fn(&SpyEvent) + 'static) -> SpyHandle {
    let listener: Rc<dyn Fn(&SpyEvent)> = Rc::new(listener);
    let id = with_state(|g| {
        let id = g.next_guid();
        g.spy_listeners.push((id, listener));
        id
    });
    SpyHandle { id }
}

impl Drop for SpyHandle {
    fn drop(&mut self) {
        with_state(|g| {
            g.spy_listeners.retain(|(id, _)| *id != self.id);
        });
    }
}

/// Whether any spy listener is currently registered.
pub fn is_spy_enabled() -> bool {
    with_state(|g| !g.spy_listeners.is_empty())
}

/// Report an event to all listeners. `make` runs only when a listener is
/// registered. Listeners are invoked outside the state borrow and may
/// themselves touch the graph.
pub(crate) fn spy_report(make: impl FnOnce() -> SpyEvent) {
    if !is_spy_enabled() {
        return;
    }
    let event = make();
    tracing::trace!(
        kind = ?event.kind,
        phase = ?event.phase,
        subject = %event.subject,
        "spy event"
    );
    let listeners: Vec<Rc<dyn Fn(&SpyEvent)>> =
        with_state(|g| g.spy_listeners.iter().map(|(_, l)| l.clone()).collect());
    for listener in listeners {
        listener(&event);
    }
}
