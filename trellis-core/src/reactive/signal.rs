//! Signals
//!
//! A signal is a root state cell: it holds a value, reports reads to the
//! tracking machinery, and pushes staleness outward when written. All
//! change in a reactive program ultimately enters through a signal (or a
//! raw [`Atom`](crate::reactive::Atom)).

use std::cell::RefCell;
use std::rc::Rc;

use crate::graph::state::check_writes_allowed;
use crate::reactive::atom::Atom;

/// A mutable reactive value.
///
/// Reads inside a tracked run (a [`Memo`](crate::reactive::Memo) body or an
/// [`Effect`](crate::reactive::Effect) body) register the signal as a
/// dependency. Writes mark every dependent stale and, outside a batch, run
/// the affected effects before returning.
///
/// Cloning is cheap and clones share the same cell.
#[derive(Clone)]
pub struct Signal<T> {
    inner: Rc<SignalInner<T>>,
}

struct SignalInner<T> {
    atom: Atom,
    value: RefCell<T>,
}

impl<T: Clone + 'static> Signal<T> {
    /// Create a signal with a generated diagnostic name.
    pub fn new(value: T) -> Self {
        let id = crate::graph::state::next_guid();
        Self::named(format!("Signal@{id}"), value)
    }

    /// Create a signal with an explicit diagnostic name.
    pub fn named(name: impl Into<String>, value: T) -> Self {
        Signal {
            inner: Rc::new(SignalInner {
                atom: Atom::named(name),
                value: RefCell::new(value),
            }),
        }
    }

    /// Read the value, registering a dependency if a tracked run is active.
    pub fn get(&self) -> T {
        self.inner.atom.report_observed();
        self.inner.value.borrow().clone()
    }

    /// Read the value without registering a dependency.
    pub fn get_untracked(&self) -> T {
        self.inner.value.borrow().clone()
    }

    /// Replace the value and notify observers.
    ///
    /// # Panics
    ///
    /// Panics if called while a memoized computation is running, or if
    /// strict mode is on, the signal is observed, and the write is not
    /// inside an action. The guard fires before the value is touched.
    pub fn set(&self, value: T) {
        if let Err(error) = check_writes_allowed(self.inner.atom.id()) {
            panic!("{error}");
        }
        *self.inner.value.borrow_mut() = value;
        self.inner.atom.report_changed();
    }

    /// Compute a new value from the current one and store it. The read is
    /// tracked like [`get`](Self::get), so an enclosing run depends on the
    /// signal it updates.
    pub fn update(&self, f: impl FnOnce(&T) -> T) {
        let current = self.get();
        let next = f(&current);
        self.set(next);
    }

    /// Diagnostic name.
    pub fn name(&self) -> &str {
        self.inner.atom.name()
    }

    /// Number of derivations currently depending on this signal.
    pub fn observer_count(&self) -> usize {
        self.inner.atom.observer_count()
    }
}

impl<T: Clone + std::fmt::Debug + 'static> std::fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("name", &self.name())
            .field("value", &*self.inner.value.borrow())
            .finish()
    }
}
