//! Effects
//!
//! An effect runs a side-effecting body once immediately, tracks what it
//! reads, and re-runs whenever any of it changes. It is the bridge from
//! the reactive graph back out to the world.

use std::cell::RefCell;
use std::rc::Rc;

use crate::graph::derivation::CaughtException;
use crate::graph::reaction::Reaction;

/// A running observer of reactive state.
///
/// The effect stays live until [`dispose`](Self::dispose) is called or the
/// handle is dropped. It is deliberately not cloneable; exactly one place
/// owns an effect's lifetime.
pub struct Effect {
    reaction: Rc<Reaction>,
}

impl Effect {
    /// Start an effect with a generated diagnostic name. `body` runs once
    /// before this returns.
    pub fn new(body: impl FnMut() + 'static) -> Self {
        let id = crate::graph::state::next_guid();
        Self::named(format!("Effect@{id}"), body)
    }

    /// Start an effect with an explicit diagnostic name.
    pub fn named(name: impl Into<String>, body: impl FnMut() + 'static) -> Self {
        let body = RefCell::new(body);
        let reaction = Reaction::new(name, move |reaction| {
            reaction.track(|| (*body.borrow_mut())());
        });
        reaction.schedule();
        Effect { reaction }
    }

    /// Route this effect's failures to `handler` instead of the
    /// process-wide fallback chain.
    pub fn set_error_handler(&self, handler: impl Fn(&CaughtException) + 'static) {
        self.reaction.set_error_handler(Some(Rc::new(handler)));
    }

    /// Stop the effect and release its dependency edges. Idempotent.
    pub fn dispose(&self) {
        self.reaction.dispose();
    }

    /// Whether the effect has been disposed.
    pub fn is_disposed(&self) -> bool {
        self.reaction.is_disposed()
    }

    /// Diagnostic name.
    pub fn name(&self) -> &str {
        self.reaction.name()
    }
}

impl Drop for Effect {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Effect")
            .field("name", &self.name())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
