use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::sync::Notify;
use tokio::time::{timeout_at, Instant};

use crate::error::RuntimeResult;
use crate::executor::{ExecutorRegistry, ExecutorRepresenter};
use crate::id::{ExecutorId, TaskGroupId};
use crate::plan::{ResourceType, TaskGroup};

/// The pluggable placement algorithm mapping a task group to an executor.
///
/// `attempt_schedule` must only return an executor whose resource type
/// matches the task group's requirement and must atomically reserve one
/// capacity slot on it, so that concurrent calls cannot oversubscribe an
/// executor. The slot is released by exactly one of the two completion
/// callbacks.
#[async_trait]
pub trait SchedulingPolicy: Send + Sync {
    /// Finds an assignable executor, waiting up to `timeout` for capacity to
    /// free up. `None` is a retry signal for the caller, not an error.
    async fn attempt_schedule(
        &self,
        task_group: &TaskGroup,
        timeout: Duration,
    ) -> RuntimeResult<Option<Arc<ExecutorRepresenter>>>;

    fn on_task_group_execution_complete(
        &self,
        executor_id: &ExecutorId,
        task_group_id: TaskGroupId,
    ) -> RuntimeResult<()>;

    fn on_task_group_execution_failed(
        &self,
        executor_id: &ExecutorId,
        task_group_id: TaskGroupId,
    ) -> RuntimeResult<()>;

    fn on_executor_added(&self, executor_id: &ExecutorId) -> RuntimeResult<()>;

    /// Removes the executor from the capacity pool and returns the task
    /// groups that were running on it.
    fn on_executor_removed(&self, executor_id: &ExecutorId) -> RuntimeResult<Vec<TaskGroupId>>;
}

/// The default policy: rotates among the running executors of the matching
/// resource type, skipping those without free capacity.
pub struct RoundRobinPolicy {
    registry: Arc<ExecutorRegistry>,
    rotation: Mutex<HashMap<ResourceType, usize>>,
    available: Notify,
}

impl RoundRobinPolicy {
    pub fn new(registry: Arc<ExecutorRegistry>) -> Self {
        Self {
            registry,
            rotation: Mutex::new(HashMap::new()),
            available: Notify::new(),
        }
    }

    /// One reservation pass under the rotation lock; the lock makes the
    /// capacity check and the slot reservation atomic with respect to
    /// concurrent passes.
    fn try_reserve(
        &self,
        task_group: &TaskGroup,
    ) -> RuntimeResult<Option<Arc<ExecutorRepresenter>>> {
        let mut rotation = self.rotation.lock()?;
        let executors = self
            .registry
            .running_executors_of_type(task_group.resource_type)?;
        if executors.is_empty() {
            return Ok(None);
        }
        let start = *rotation.get(&task_group.resource_type).unwrap_or(&0) % executors.len();
        for offset in 0..executors.len() {
            let candidate = &executors[(start + offset) % executors.len()];
            if candidate.reserve(task_group.id)? {
                rotation.insert(
                    task_group.resource_type,
                    (start + offset + 1) % executors.len(),
                );
                debug!(
                    "task group {} reserved a slot on executor {}",
                    task_group.id,
                    candidate.executor_id()
                );
                return Ok(Some(Arc::clone(candidate)));
            }
        }
        Ok(None)
    }

    fn release(&self, executor_id: &ExecutorId, task_group_id: TaskGroupId) -> RuntimeResult<()> {
        let executor = self.registry.executor(executor_id)?;
        executor.release(task_group_id)?;
        self.available.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl SchedulingPolicy for RoundRobinPolicy {
    async fn attempt_schedule(
        &self,
        task_group: &TaskGroup,
        timeout: Duration,
    ) -> RuntimeResult<Option<Arc<ExecutorRepresenter>>> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.available.notified();
            if let Some(executor) = self.try_reserve(task_group)? {
                return Ok(Some(executor));
            }
            if timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    fn on_task_group_execution_complete(
        &self,
        executor_id: &ExecutorId,
        task_group_id: TaskGroupId,
    ) -> RuntimeResult<()> {
        self.release(executor_id, task_group_id)
    }

    fn on_task_group_execution_failed(
        &self,
        executor_id: &ExecutorId,
        task_group_id: TaskGroupId,
    ) -> RuntimeResult<()> {
        self.release(executor_id, task_group_id)
    }

    fn on_executor_added(&self, _executor_id: &ExecutorId) -> RuntimeResult<()> {
        // The registry already tracks the executor; wake up any waiter so it
        // can observe the new capacity.
        self.available.notify_waiters();
        Ok(())
    }

    fn on_executor_removed(&self, executor_id: &ExecutorId) -> RuntimeResult<Vec<TaskGroupId>> {
        let executor = self.registry.executor(executor_id)?;
        let orphaned = executor.running_task_groups()?;
        for &task_group_id in &orphaned {
            executor.release(task_group_id)?;
        }
        Ok(orphaned)
    }
}
