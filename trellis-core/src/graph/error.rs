//! Error types for the reactive runtime.

use thiserror::Error;

/// Errors surfaced by the reactive runtime.
///
/// Write-guard violations are raised synchronously at the call site of the
/// offending write, before the value is touched. A non-converging reaction
/// cycle is a logic error in the reactive graph itself and is surfaced as a
/// fatal condition by the scheduler.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ReactiveError {
    /// A root state cell was written while a derived value was computing.
    /// Computations must stay pure.
    #[error("side effects are not allowed here: tried to modify '{name}' while a computation is in progress")]
    WriteDuringComputation { name: String },

    /// Strict mode is enabled and an observed cell was written outside of
    /// an action.
    #[error("strict mode: '{name}' is observed, so it may only be modified inside an action")]
    WriteOutsideAction { name: String },

    /// The reaction scheduler hit its iteration cap without draining the
    /// pending queue. Some reaction keeps invalidating itself.
    #[error("reactions did not converge after {limit} scheduler iterations; a reaction is probably modifying state it always reacts to")]
    NonConvergingCycle { limit: usize },
}
