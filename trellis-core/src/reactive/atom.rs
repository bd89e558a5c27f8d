//! Atoms
//!
//! An atom is the thinnest possible handle on an observable graph node: it
//! can report that it was read and that it changed, and nothing else. The
//! higher-level cells are built on it, and it is the right tool for
//! bridging external mutable state (a file watcher, a clock, a cache) into
//! the reactive graph.

use std::rc::Rc;

use crate::graph::batch::{end_batch, start_batch};
use crate::graph::observable::{
    has_observers, observer_count, propagate_changed, register_observable, report_observed,
    set_on_become_unobserved, unregister_observable, ObservableId,
};
use crate::graph::spy::{spy_report, SpyEvent, SpyKind, SpyPhase};

/// A minimal observable participant in the dependency graph.
///
/// Cloning an atom clones the handle; all clones refer to the same node,
/// and the node is unregistered when the last clone drops.
#[derive(Clone)]
pub struct Atom {
    inner: Rc<AtomInner>,
}

struct AtomInner {
    id: ObservableId,
    name: String,
}

impl Atom {
    /// Create an atom with a generated diagnostic name.
    pub fn new() -> Self {
        let id = crate::graph::state::next_guid();
        Self::named(format!("Atom@{id}"))
    }

    /// Create an atom with an explicit diagnostic name.
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        let id = register_observable(name.clone(), None, None);
        Atom {
            inner: Rc::new(AtomInner { id, name }),
        }
    }

    /// Report that whatever this atom stands for was read. Inside a tracked
    /// run this binds the atom as a dependency.
    pub fn report_observed(&self) {
        report_observed(self.inner.id);
    }

    /// Report that whatever this atom stands for changed. Every observer is
    /// marked stale and dependent reactions are scheduled; outside a batch
    /// they run before this returns.
    pub fn report_changed(&self) {
        spy_report(|| SpyEvent::new(SpyPhase::Start, SpyKind::Change, &self.inner.name));
        start_batch();
        propagate_changed(self.inner.id);
        end_batch();
    }

    /// Install a callback fired when the atom loses its last observer at
    /// the close of the outermost batch. Useful to stop feeding external
    /// state into an atom nobody is watching.
    pub fn on_become_unobserved(&self, callback: impl Fn() + 'static) {
        set_on_become_unobserved(self.inner.id, Some(Rc::new(callback)));
    }

    /// The underlying graph node id.
    pub fn id(&self) -> ObservableId {
        self.inner.id
    }

    /// Diagnostic name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether anything currently observes this atom.
    pub fn is_observed(&self) -> bool {
        has_observers(self.inner.id)
    }

    /// Number of current observers.
    pub fn observer_count(&self) -> usize {
        observer_count(self.inner.id)
    }
}

impl Default for Atom {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AtomInner {
    fn drop(&mut self) {
        unregister_observable(self.id);
    }
}

impl std::fmt::Debug for Atom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Atom").field("name", &self.inner.name).finish()
    }
}
