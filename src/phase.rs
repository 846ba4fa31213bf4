//! Phase state machine for operation resources
//!
//! ```text
//! Initializing --(volume+compute ready)--> Running
//! Initializing --(provisioning error)----> Failed
//! Running -----(agent reports success)---> Succeeded
//! Running -----(agent reports failure)---> Failed
//! Running -----(status retries exhausted)> Failed
//! ```
//!
//! Succeeded and Failed are terminal. Re-running an operation means creating
//! a new resource; the engine never moves a resource backwards.

use crate::crd::OperationPhase;
use crate::Error;

/// Returns true if an operation may move from `from` to `to`
///
/// Staying in the same phase is always allowed so callers can refresh the
/// reason of a non-terminal phase after a transient error.
pub fn can_transition(from: OperationPhase, to: OperationPhase) -> bool {
    use OperationPhase::*;

    if from == to {
        return !from.is_terminal();
    }
    matches!(
        (from, to),
        (Initializing, Running) | (Initializing, Failed) | (Running, Succeeded) | (Running, Failed)
    )
}

/// Validate a transition, returning an internal error for illegal moves
pub fn validate_transition(
    operation: &str,
    from: OperationPhase,
    to: OperationPhase,
) -> Result<(), Error> {
    if can_transition(from, to) {
        Ok(())
    } else {
        Err(Error::internal_with_context(
            "phase",
            format!("{operation}: illegal phase transition {from} -> {to}"),
        ))
    }
}
