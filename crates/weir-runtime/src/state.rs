use std::fmt;

use crate::error::{RuntimeError, RuntimeResult};

/// A state type with a fixed table of legal transitions.
pub trait StateSpec: Copy + Eq + fmt::Debug + fmt::Display {
    /// The entity name used in error messages.
    const ENTITY: &'static str;

    fn can_transition(self, next: Self) -> bool;
}

/// Holds the current state of one entity and rejects reports that are not
/// legal successors of it. Out-of-order and duplicate reports surface as
/// [`RuntimeError::IllegalStateTransition`] instead of being applied.
#[derive(Debug)]
pub struct StateMachine<S: StateSpec> {
    current: S,
}

impl<S: StateSpec> StateMachine<S> {
    pub fn new(initial: S) -> Self {
        Self { current: initial }
    }

    pub fn current_state(&self) -> S {
        self.current
    }

    pub fn set_state(&mut self, next: S) -> RuntimeResult<()> {
        if !self.current.can_transition(next) {
            return Err(RuntimeError::IllegalStateTransition {
                entity: S::ENTITY,
                from: self.current.to_string(),
                to: next.to_string(),
            });
        }
        self.current = next;
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TaskState {
    Ready,
    Executing,
    Complete,
    FailedRecoverable,
    FailedUnrecoverable,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskState::Ready => write!(f, "READY"),
            TaskState::Executing => write!(f, "EXECUTING"),
            TaskState::Complete => write!(f, "COMPLETE"),
            TaskState::FailedRecoverable => write!(f, "FAILED_RECOVERABLE"),
            TaskState::FailedUnrecoverable => write!(f, "FAILED_UNRECOVERABLE"),
        }
    }
}

impl StateSpec for TaskState {
    const ENTITY: &'static str = "task";

    fn can_transition(self, next: Self) -> bool {
        match self {
            TaskState::Ready => matches!(next, TaskState::Executing),
            TaskState::Executing => matches!(
                next,
                TaskState::Complete
                    | TaskState::FailedRecoverable
                    | TaskState::FailedUnrecoverable
            ),
            // A completed task may be demoted when its output is later lost.
            TaskState::Complete => matches!(next, TaskState::FailedRecoverable),
            TaskState::FailedRecoverable => {
                matches!(next, TaskState::Ready | TaskState::FailedUnrecoverable)
            }
            TaskState::FailedUnrecoverable => false,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TaskGroupState {
    Ready,
    Executing,
    Complete,
    FailedRecoverable,
    FailedUnrecoverable,
}

impl fmt::Display for TaskGroupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskGroupState::Ready => write!(f, "READY"),
            TaskGroupState::Executing => write!(f, "EXECUTING"),
            TaskGroupState::Complete => write!(f, "COMPLETE"),
            TaskGroupState::FailedRecoverable => write!(f, "FAILED_RECOVERABLE"),
            TaskGroupState::FailedUnrecoverable => write!(f, "FAILED_UNRECOVERABLE"),
        }
    }
}

impl StateSpec for TaskGroupState {
    const ENTITY: &'static str = "task group";

    fn can_transition(self, next: Self) -> bool {
        match self {
            TaskGroupState::Ready => matches!(next, TaskGroupState::Executing),
            TaskGroupState::Executing => matches!(
                next,
                TaskGroupState::Complete
                    | TaskGroupState::FailedRecoverable
                    | TaskGroupState::FailedUnrecoverable
            ),
            TaskGroupState::Complete => matches!(next, TaskGroupState::FailedRecoverable),
            TaskGroupState::FailedRecoverable => matches!(
                next,
                TaskGroupState::Ready | TaskGroupState::FailedUnrecoverable
            ),
            TaskGroupState::FailedUnrecoverable => false,
        }
    }
}

/// Stage state is an aggregate derived from the task groups the stage
/// contains; executors never report it directly.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum StageState {
    Ready,
    Executing,
    Complete,
    Failed,
}

impl fmt::Display for StageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageState::Ready => write!(f, "READY"),
            StageState::Executing => write!(f, "EXECUTING"),
            StageState::Complete => write!(f, "COMPLETE"),
            StageState::Failed => write!(f, "FAILED"),
        }
    }
}

impl StateSpec for StageState {
    const ENTITY: &'static str = "stage";

    fn can_transition(self, next: Self) -> bool {
        match self {
            StageState::Ready => matches!(next, StageState::Executing),
            StageState::Executing => matches!(next, StageState::Complete | StageState::Failed),
            // A completed stage re-executes when its output is recomputed.
            StageState::Complete => matches!(next, StageState::Executing),
            StageState::Failed => false,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum JobState {
    Ready,
    Executing,
    Complete,
    Failed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Ready => write!(f, "READY"),
            JobState::Executing => write!(f, "EXECUTING"),
            JobState::Complete => write!(f, "COMPLETE"),
            JobState::Failed => write!(f, "FAILED"),
        }
    }
}

impl StateSpec for JobState {
    const ENTITY: &'static str = "job";

    fn can_transition(self, next: Self) -> bool {
        match self {
            JobState::Ready => matches!(next, JobState::Executing),
            JobState::Executing => matches!(next, JobState::Complete | JobState::Failed),
            JobState::Complete | JobState::Failed => false,
        }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum PartitionState {
    Created,
    Scheduled,
    Committed,
    /// The partition was lost before any producer committed it.
    LostBeforeCommit,
    /// The committed partition was lost, typically with its owning executor.
    Lost,
    Removed,
}

impl PartitionState {
    /// Whether a location request observing this state must fail with
    /// an absent-partition error instead of waiting.
    pub fn is_absent(self) -> bool {
        matches!(
            self,
            PartitionState::Created
                | PartitionState::LostBeforeCommit
                | PartitionState::Lost
                | PartitionState::Removed
        )
    }
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionState::Created => write!(f, "CREATED"),
            PartitionState::Scheduled => write!(f, "SCHEDULED"),
            PartitionState::Committed => write!(f, "COMMITTED"),
            PartitionState::LostBeforeCommit => write!(f, "LOST_BEFORE_COMMIT"),
            PartitionState::Lost => write!(f, "LOST"),
            PartitionState::Removed => write!(f, "REMOVED"),
        }
    }
}

impl StateSpec for PartitionState {
    const ENTITY: &'static str = "partition";

    fn can_transition(self, next: Self) -> bool {
        match self {
            PartitionState::Created => matches!(next, PartitionState::Scheduled),
            PartitionState::Scheduled => {
                matches!(next, PartitionState::Committed | PartitionState::LostBeforeCommit)
            }
            PartitionState::Committed => {
                matches!(next, PartitionState::Lost | PartitionState::Removed)
            }
            // A lost partition may be superseded by a new attempt.
            PartitionState::LostBeforeCommit | PartitionState::Lost => {
                matches!(next, PartitionState::Scheduled | PartitionState::Removed)
            }
            PartitionState::Removed => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_task_group_path() {
        let mut machine = StateMachine::new(TaskGroupState::Ready);
        machine.set_state(TaskGroupState::Executing).unwrap();
        machine.set_state(TaskGroupState::Complete).unwrap();
        machine.set_state(TaskGroupState::FailedRecoverable).unwrap();
        machine.set_state(TaskGroupState::Ready).unwrap();
        assert_eq!(machine.current_state(), TaskGroupState::Ready);
    }

    #[test]
    fn test_illegal_transition_is_rejected() {
        let mut machine = StateMachine::new(TaskGroupState::Ready);
        let result = machine.set_state(TaskGroupState::Complete);
        assert!(matches!(
            result,
            Err(RuntimeError::IllegalStateTransition { .. })
        ));
        // The state is left untouched by a rejected report.
        assert_eq!(machine.current_state(), TaskGroupState::Ready);
    }

    #[test]
    fn test_duplicate_report_is_rejected() {
        let mut machine = StateMachine::new(TaskGroupState::Ready);
        machine.set_state(TaskGroupState::Executing).unwrap();
        machine.set_state(TaskGroupState::Complete).unwrap();
        assert!(machine.set_state(TaskGroupState::Complete).is_err());
    }

    #[test]
    fn test_partition_lifecycle_is_monotonic() {
        let mut machine = StateMachine::new(PartitionState::Created);
        assert!(machine.set_state(PartitionState::Committed).is_err());
        machine.set_state(PartitionState::Scheduled).unwrap();
        machine.set_state(PartitionState::Committed).unwrap();
        machine.set_state(PartitionState::Lost).unwrap();
        machine.set_state(PartitionState::Scheduled).unwrap();
        machine.set_state(PartitionState::Committed).unwrap();
        machine.set_state(PartitionState::Removed).unwrap();
        // REMOVED is terminal.
        assert!(machine.set_state(PartitionState::Scheduled).is_err());
    }

    #[test]
    fn test_unrecoverable_failure_is_terminal() {
        let mut machine = StateMachine::new(TaskGroupState::Executing);
        machine
            .set_state(TaskGroupState::FailedUnrecoverable)
            .unwrap();
        assert!(machine.set_state(TaskGroupState::Ready).is_err());
    }
}
