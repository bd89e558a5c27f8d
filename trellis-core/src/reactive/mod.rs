//! The Reactive Vocabulary
//!
//! The user-facing cells built on the dependency graph:
//!
//! - [`Signal`]: a mutable root value
//! - [`Memo`]: a cached, lazily recomputed derived value
//! - [`Effect`]: a side effect that re-runs when its reads change
//! - [`Atom`]: a raw graph participant for bridging external state
//! - [`action`] / [`transaction`] / [`untracked`]: control over batching
//!   and tracking
//!
//! # How It Works
//!
//! Reading a cell inside a memo or effect body records a dependency edge;
//! writing a signal walks those edges and marks dependents stale. Memos
//! recompute lazily on their next read and cut propagation short when the
//! fresh value compares equal to the cached one. Effects are scheduled and
//! run when the outermost batch closes, so grouped writes trigger each
//! effect at most once.

pub mod action;
pub mod atom;
pub mod effect;
pub mod memo;
pub mod signal;

pub use action::{action, run_in_action};
pub use atom::Atom;
pub use effect::Effect;
pub use memo::Memo;
pub use signal::Signal;

pub use crate::graph::batch::transaction;
pub use crate::graph::derivation::untracked;
