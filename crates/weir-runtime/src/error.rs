use std::sync::PoisonError;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::id::{ExecutorId, PartitionId};
use crate::state::PartitionState;

pub type RuntimeResult<T> = Result<T, RuntimeError>;

#[derive(Debug, Error)]
pub enum RuntimeError {
    /// A state report incompatible with the current state of an entity.
    /// This indicates a programming error and is never retried.
    #[error("illegal state transition for {entity}: {from} -> {to}")]
    IllegalStateTransition {
        entity: &'static str,
        from: String,
        to: String,
    },
    #[error("duplicate executor id: {0}")]
    DuplicateExecutorId(ExecutorId),
    #[error("no such executor: {0}")]
    NoSuchExecutor(ExecutorId),
    /// The partition cannot currently be located. The requester decides
    /// whether to retry after the producer has been rescheduled.
    #[error("partition {id} is absent ({state})")]
    AbsentPartition {
        id: PartitionId,
        state: PartitionState,
    },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("internal error: {0}")]
    InternalError(String),
}

impl<T> From<PoisonError<T>> for RuntimeError {
    fn from(error: PoisonError<T>) -> Self {
        RuntimeError::InternalError(error.to_string())
    }
}

impl<T> From<mpsc::error::SendError<T>> for RuntimeError {
    fn from(_: mpsc::error::SendError<T>) -> Self {
        RuntimeError::InternalError("event channel closed".to_string())
    }
}
