use std::sync::{Arc, Mutex};

use indexmap::IndexMap;

use crate::error::{RuntimeError, RuntimeResult};
use crate::executor::ExecutorRepresenter;
use crate::id::ExecutorId;
use crate::plan::ResourceType;

/// Maintains the map between executor ids and their representers, split into
/// running and failed pools. Failed representers are retained rather than
/// deleted so that recovery code can still resolve them.
pub struct ExecutorRegistry {
    inner: Mutex<RegistryMaps>,
}

#[derive(Default)]
struct RegistryMaps {
    running: IndexMap<ExecutorId, Arc<ExecutorRepresenter>>,
    failed: IndexMap<ExecutorId, Arc<ExecutorRepresenter>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryMaps::default()),
        }
    }

    pub fn register(&self, representer: Arc<ExecutorRepresenter>) -> RuntimeResult<()> {
        let mut inner = self.inner.lock()?;
        let executor_id = representer.executor_id().clone();
        if inner.running.contains_key(&executor_id) || inner.failed.contains_key(&executor_id) {
            return Err(RuntimeError::DuplicateExecutorId(executor_id));
        }
        inner.running.insert(executor_id, representer);
        Ok(())
    }

    pub fn deregister(&self, executor_id: &ExecutorId) -> RuntimeResult<Arc<ExecutorRepresenter>> {
        let mut inner = self.inner.lock()?;
        inner
            .running
            .shift_remove(executor_id)
            .or_else(|| inner.failed.shift_remove(executor_id))
            .ok_or_else(|| RuntimeError::NoSuchExecutor(executor_id.clone()))
    }

    /// Moves the representer into the failed pool and flags it as failed.
    pub fn set_as_failed(
        &self,
        executor_id: &ExecutorId,
    ) -> RuntimeResult<Arc<ExecutorRepresenter>> {
        let mut inner = self.inner.lock()?;
        let representer = inner
            .running
            .shift_remove(executor_id)
            .ok_or_else(|| RuntimeError::NoSuchExecutor(executor_id.clone()))?;
        representer.mark_failed()?;
        inner
            .failed
            .insert(executor_id.clone(), Arc::clone(&representer));
        Ok(representer)
    }

    /// Resolves a representer from either pool.
    pub fn executor(&self, executor_id: &ExecutorId) -> RuntimeResult<Arc<ExecutorRepresenter>> {
        let inner = self.inner.lock()?;
        inner
            .running
            .get(executor_id)
            .or_else(|| inner.failed.get(executor_id))
            .cloned()
            .ok_or_else(|| RuntimeError::NoSuchExecutor(executor_id.clone()))
    }

    pub fn running_executor(
        &self,
        executor_id: &ExecutorId,
    ) -> RuntimeResult<Arc<ExecutorRepresenter>> {
        let inner = self.inner.lock()?;
        inner
            .running
            .get(executor_id)
            .cloned()
            .ok_or_else(|| RuntimeError::NoSuchExecutor(executor_id.clone()))
    }

    /// A sorted snapshot of running executor ids; later registry changes are
    /// not reflected in the returned set.
    pub fn running_executor_ids(&self) -> RuntimeResult<Vec<ExecutorId>> {
        let inner = self.inner.lock()?;
        let mut ids: Vec<_> = inner.running.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    pub fn failed_executor_ids(&self) -> RuntimeResult<Vec<ExecutorId>> {
        let inner = self.inner.lock()?;
        let mut ids: Vec<_> = inner.failed.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    /// Running executors of one resource type, in registration order. The
    /// round-robin policy relies on this order being stable.
    pub fn running_executors_of_type(
        &self,
        resource_type: ResourceType,
    ) -> RuntimeResult<Vec<Arc<ExecutorRepresenter>>> {
        let inner = self.inner.lock()?;
        Ok(inner
            .running
            .values()
            .filter(|representer| representer.resource_type() == resource_type)
            .cloned()
            .collect())
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
