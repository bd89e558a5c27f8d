//! # Trellis
//!
//! A transparent reactive state engine: plain values become observable
//! cells, derived values recompute only when something they actually read
//! changes, and effects re-run themselves with no subscription management
//! in sight.
//!
//! ```
//! use std::cell::Cell;
//! use std::rc::Rc;
//! use trellis_core::reactive::{Effect, Memo, Signal};
//!
//! let count = Signal::new(1);
//! let doubled = {
//!     let count = count.clone();
//!     Memo::new(move || count.get() * 2)
//! };
//!
//! let seen = Rc::new(Cell::new(0));
//! let _effect = {
//!     let doubled = doubled.clone();
//!     let seen = seen.clone();
//!     Effect::new(move || seen.set(doubled.get()))
//! };
//! assert_eq!(seen.get(), 2);
//!
//! count.set(5);
//! assert_eq!(seen.get(), 10);
//! ```
//!
//! # Architecture
//!
//! Two layers:
//!
//! - [`graph`]: the dependency graph engine. Observable nodes, derivation
//!   nodes, the edges between them, staleness propagation, batching, and
//!   the reaction scheduler. Dependency edges are discovered by running
//!   code, not declared, and are rebuilt from scratch on every run, so a
//!   computation that stops reading a value really stops depending on it.
//! - [`reactive`]: the vocabulary most code uses. [`Signal`], [`Memo`],
//!   [`Effect`], [`Atom`], and [`action`].
//!
//! The runtime is single-threaded and synchronous; each thread hosts an
//! independent reactive universe.
//!
//! [`Signal`]: reactive::Signal
//! [`Memo`]: reactive::Memo
//! [`Effect`]: reactive::Effect
//! [`Atom`]: reactive::Atom
//! [`action`]: reactive::action

pub mod graph;
pub mod reactive;

pub use graph::{transaction, untracked, ReactiveError};
pub use reactive::{action, Atom, Effect, Memo, Signal};
