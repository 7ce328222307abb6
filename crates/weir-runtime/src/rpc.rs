use async_trait::async_trait;

use crate::error::RuntimeResult;
use crate::plan::TaskGroup;

/// A command pushed from the master to one executor.
#[derive(Debug, Clone)]
pub enum ExecutorCommand {
    LaunchTaskGroup {
        task_group: TaskGroup,
        attempt: usize,
    },
}

/// The transport-agnostic client for one executor. Implementations provide
/// at-least-once delivery; a send that never completes is bounded by a
/// timeout at the call site.
#[async_trait]
pub trait ExecutorClient: Send + Sync {
    async fn send(&self, command: ExecutorCommand) -> RuntimeResult<()>;
}
