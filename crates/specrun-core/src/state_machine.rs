use specrun_artifact::RunState;

use crate::error::StateMachineError;

/// Validates a run state transition.
///
/// Working states may advance to their successor, stay put for a revision,
/// or stop. Terminal states accept nothing.
pub fn validate_transition(from: RunState, to: RunState) -> Result<(), StateMachineError> {
    if allowed(from, to) {
        Ok(())
    } else {
        Err(StateMachineError::IllegalTransition { from, to })
    }
}

pub fn allowed_transitions(from: RunState) -> Vec<RunState> {
    if from.is_terminal() {
        return vec![];
    }
    let mut out = Vec::with_capacity(3);
    if let Some(next) = from.next() {
        out.push(next);
    }
    out.push(from);
    out.push(RunState::Stopped);
    out
}

fn allowed(from: RunState, to: RunState) -> bool {
    allowed_transitions(from).into_iter().any(|s| s == to)
}
