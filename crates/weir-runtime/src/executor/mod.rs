mod registry;

use std::sync::{Arc, Mutex};

use indexmap::IndexSet;
pub use registry::ExecutorRegistry;

use crate::error::{RuntimeError, RuntimeResult};
use crate::id::{ExecutorId, TaskGroupId};
use crate::plan::ResourceType;
use crate::rpc::ExecutorClient;

/// The class and size of the resource container backing one executor.
#[derive(Debug, Copy, Clone)]
pub struct ResourceSpecification {
    pub resource_type: ResourceType,
    /// The number of task groups the executor can run concurrently.
    pub capacity: usize,
}

impl ResourceSpecification {
    pub fn new(resource_type: ResourceType, capacity: usize) -> Self {
        Self {
            resource_type,
            capacity,
        }
    }
}

/// The master-side handle for one remote executor process: its resource
/// specification, the RPC client for reaching it, and the set of task groups
/// currently running on it.
pub struct ExecutorRepresenter {
    executor_id: ExecutorId,
    resource: ResourceSpecification,
    client: Arc<dyn ExecutorClient>,
    inner: Mutex<ExecutorSlots>,
}

#[derive(Debug)]
struct ExecutorSlots {
    running: IndexSet<TaskGroupId>,
    failed: bool,
}

impl ExecutorRepresenter {
    pub fn new(
        executor_id: ExecutorId,
        resource: ResourceSpecification,
        client: Arc<dyn ExecutorClient>,
    ) -> Self {
        Self {
            executor_id,
            resource,
            client,
            inner: Mutex::new(ExecutorSlots {
                running: IndexSet::new(),
                failed: false,
            }),
        }
    }

    pub fn executor_id(&self) -> &ExecutorId {
        &self.executor_id
    }

    pub fn resource_type(&self) -> ResourceType {
        self.resource.resource_type
    }

    pub fn capacity(&self) -> usize {
        self.resource.capacity
    }

    pub fn client(&self) -> Arc<dyn ExecutorClient> {
        Arc::clone(&self.client)
    }

    pub fn running_task_groups(&self) -> RuntimeResult<Vec<TaskGroupId>> {
        let inner = self.inner.lock()?;
        Ok(inner.running.iter().copied().collect())
    }

    pub fn remaining_capacity(&self) -> RuntimeResult<usize> {
        let inner = self.inner.lock()?;
        if inner.failed {
            return Ok(0);
        }
        Ok(self.resource.capacity.saturating_sub(inner.running.len()))
    }

    /// Claims one capacity slot for the task group. Returns `false` without
    /// reserving when the executor is full or failed.
    pub fn reserve(&self, task_group_id: TaskGroupId) -> RuntimeResult<bool> {
        let mut inner = self.inner.lock()?;
        if inner.failed || inner.running.len() >= self.resource.capacity {
            return Ok(false);
        }
        if !inner.running.insert(task_group_id) {
            return Err(RuntimeError::InternalError(format!(
                "task group {task_group_id} is already running on executor {}",
                self.executor_id
            )));
        }
        Ok(true)
    }

    /// Releases the slot held by the task group. Returns `false` when the
    /// task group was not running here.
    pub fn release(&self, task_group_id: TaskGroupId) -> RuntimeResult<bool> {
        let mut inner = self.inner.lock()?;
        Ok(inner.running.swap_remove(&task_group_id))
    }

    pub fn mark_failed(&self) -> RuntimeResult<()> {
        let mut inner = self.inner.lock()?;
        inner.failed = true;
        Ok(())
    }

    pub fn is_failed(&self) -> RuntimeResult<bool> {
        let inner = self.inner.lock()?;
        Ok(inner.failed)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::rpc::ExecutorCommand;

    pub(crate) struct NullExecutorClient;

    #[async_trait]
    impl ExecutorClient for NullExecutorClient {
        async fn send(&self, _command: ExecutorCommand) -> RuntimeResult<()> {
            Ok(())
        }
    }

    pub(crate) fn representer(id: &str, capacity: usize) -> ExecutorRepresenter {
        ExecutorRepresenter::new(
            ExecutorId::from(id),
            ResourceSpecification::new(ResourceType::Compute, capacity),
            Arc::new(NullExecutorClient),
        )
    }

    #[test]
    fn test_reserve_and_release_round_trip() {
        let executor = representer("a1", 1);
        assert_eq!(executor.remaining_capacity().unwrap(), 1);
        assert!(executor.reserve(TaskGroupId::from(1)).unwrap());
        assert_eq!(executor.remaining_capacity().unwrap(), 0);
        // A full executor refuses further reservations.
        assert!(!executor.reserve(TaskGroupId::from(2)).unwrap());
        assert!(executor.release(TaskGroupId::from(1)).unwrap());
        assert_eq!(executor.remaining_capacity().unwrap(), 1);
    }

    #[test]
    fn test_failed_executor_has_no_capacity() {
        let executor = representer("a1", 4);
        executor.reserve(TaskGroupId::from(1)).unwrap();
        executor.mark_failed().unwrap();
        assert_eq!(executor.remaining_capacity().unwrap(), 0);
        assert!(!executor.reserve(TaskGroupId::from(2)).unwrap());
        // The running set is retained for forensic queries.
        assert_eq!(
            executor.running_task_groups().unwrap(),
            vec![TaskGroupId::from(1)]
        );
    }
}
