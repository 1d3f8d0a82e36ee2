use crate::error::{EngineError, EngineResult};
use crate::types::StepStatus;
use std::collections::HashMap;

/// Lifecycle tracker for every step of a run, keyed by step name.
///
/// All status changes made by the executor go through `transition`, which
/// rejects anything outside the allowed edges.
#[derive(Debug, Default, Clone)]
pub struct StepStateMachine {
    states: HashMap<String, StepStatus>,
    order: Vec<String>,
}

impl StepStateMachine {
    pub fn new<I, S>(steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut machine = Self::default();
        for step in steps {
            let step = step.into();
            if machine.states.insert(step.clone(), StepStatus::Pending).is_none() {
                machine.order.push(step);
            }
        }
        machine
    }

    /// Whether `from -> to` is a permitted edge
    pub fn is_valid(from: StepStatus, to: StepStatus) -> bool {
        use StepStatus::*;

        matches!(
            (from, to),
            (Pending, Ready)
                | (Pending, Skipped)
                | (Ready, Running)
                | (Running, Success)
                | (Running, Failed)
                | (Running, Retrying)
                | (Running, Cancelled)
                | (Retrying, Running)
        )
    }

    pub fn status(&self, step: &str) -> Option<StepStatus> {
        self.states.get(step).copied()
    }

    pub fn transition(&mut self, step: &str, to: StepStatus) -> EngineResult<StepStatus> {
        let current = self
            .states
            .get_mut(step)
            .ok_or_else(|| EngineError::UnknownStep(step.to_string()))?;

        if !Self::is_valid(*current, to) {
            return Err(EngineError::InvalidTransition {
                step: step.to_string(),
                from: *current,
                to,
            });
        }

        let from = std::mem::replace(current, to);
        tracing::trace!(step, %from, %to, "step transition");
        Ok(from)
    }

    pub fn all_terminal(&self) -> bool {
        self.states.values().all(|s| s.is_terminal())
    }

    /// Steps in the given state, in registration order
    pub fn in_state(&self, status: StepStatus) -> Vec<String> {
        self.order
            .iter()
            .filter(|name| self.states.get(*name) == Some(&status))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use StepStatus::*;

    #[test]
    fn test_happy_path() {
        let mut machine = StepStateMachine::new(["a"]);
        assert_eq!(machine.status("a"), Some(Pending));

        machine.transition("a", Ready).unwrap();
        machine.transition("a", Running).unwrap();
        machine.transition("a", Retrying).unwrap();
        machine.transition("a", Running).unwrap();
        assert_eq!(machine.transition("a", Success).unwrap(), Running);
        assert!(machine.all_terminal());
    }

    #[test]
    fn test_pending_to_success_rejected() {
        let mut machine = StepStateMachine::new(["a"]);
        let err = machine.transition("a", Success).unwrap_err();

        assert!(matches!(
            err,
            EngineError::InvalidTransition {
                from: Pending,
                to: Success,
                ..
            }
        ));
        assert_eq!(machine.status("a"), Some(Pending));
    }

    #[test]
    fn test_terminal_states_are_final() {
        let all = [Pending, Ready, Running, Retrying, Success, Failed, Skipped, Cancelled];
        for terminal in [Success, Failed, Skipped, Cancelled] {
            for to in all {
                assert!(
                    !StepStateMachine::is_valid(terminal, to),
                    "{terminal} -> {to} should be rejected"
                );
            }
        }
    }

    #[test]
    fn test_skip_only_from_pending() {
        let mut machine = StepStateMachine::new(["a", "b"]);
        machine.transition("a", Skipped).unwrap();

        machine.transition("b", Ready).unwrap();
        assert!(machine.transition("b", Skipped).is_err());
        assert!(machine.transition("a", Ready).is_err());
    }

    #[test]
    fn test_cancel_only_from_running() {
        assert!(StepStateMachine::is_valid(Running, Cancelled));
        assert!(!StepStateMachine::is_valid(Ready, Cancelled));
        assert!(!StepStateMachine::is_valid(Pending, Cancelled));
    }

    #[test]
    fn test_unknown_step() {
        let mut machine = StepStateMachine::new(["a"]);
        assert!(matches!(
            machine.transition("zzz", Ready),
            Err(EngineError::UnknownStep(_))
        ));
    }

    #[test]
    fn test_in_state_keeps_registration_order() {
        let mut machine = StepStateMachine::new(["c", "a", "b"]);
        machine.transition("a", Ready).unwrap();

        assert_eq!(machine.in_state(Pending), vec!["c".to_string(), "b".to_string()]);
        assert_eq!(machine.in_state(Ready), vec!["a".to_string()]);
        assert!(!machine.all_terminal());
    }
}
