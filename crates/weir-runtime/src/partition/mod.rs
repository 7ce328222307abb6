mod metadata;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use log::warn;
pub use metadata::{BlockDescriptor, BlockMetadata, PartitionLocationFuture, PartitionMetadata};

use crate::error::{RuntimeError, RuntimeResult};
use crate::id::{ExecutorId, PartitionId, TaskGroupId};
use crate::state::PartitionState;

/// The master-side registry of intermediate-data state and location.
///
/// The registry lock is acquired shared for operations on a single partition
/// (the per-partition metadata is itself thread-safe) and exclusively for
/// structural changes and whole-registry operations such as
/// [`PartitionManager::remove_worker`].
pub struct PartitionManager {
    registry: RwLock<PartitionRegistry>,
}

#[derive(Default)]
struct PartitionRegistry {
    partitions: HashMap<PartitionId, Arc<PartitionMetadata>>,
    producers: HashMap<TaskGroupId, HashSet<PartitionId>>,
}

impl PartitionManager {
    pub fn new() -> Self {
        Self {
            registry: RwLock::new(PartitionRegistry::default()),
        }
    }

    /// Registers a partition that the given task groups will produce. Must be
    /// called exactly once per partition id before any state report for it;
    /// an id is never reused, not even after removal.
    pub fn initialize_partition(
        &self,
        partition_id: PartitionId,
        producer_indices: HashSet<usize>,
        producer_task_group_ids: HashSet<TaskGroupId>,
    ) -> RuntimeResult<()> {
        let mut registry = self.registry.write()?;
        if registry.partitions.contains_key(&partition_id) {
            return Err(RuntimeError::InvalidArgument(format!(
                "partition {partition_id} is already initialized"
            )));
        }
        registry.partitions.insert(
            partition_id,
            Arc::new(PartitionMetadata::new(partition_id, producer_indices)),
        );
        for task_group_id in producer_task_group_ids {
            registry
                .producers
                .entry(task_group_id)
                .or_default()
                .insert(partition_id);
        }
        Ok(())
    }

    /// Applies a partition state report from an executor.
    pub fn on_partition_state_changed(
        &self,
        partition_id: PartitionId,
        new_state: PartitionState,
        location: Option<ExecutorId>,
        producer_index: Option<usize>,
    ) -> RuntimeResult<()> {
        let metadata = self.metadata(partition_id)?;
        metadata.on_state_changed(new_state, location, producer_index)
    }

    pub fn get_partition_state(&self, partition_id: PartitionId) -> RuntimeResult<PartitionState> {
        self.metadata(partition_id)?.state()
    }

    /// A future for the partition's owning executor; see
    /// [`PartitionMetadata::location_future`] for the state rules.
    pub fn get_partition_location_future(
        &self,
        partition_id: PartitionId,
    ) -> RuntimeResult<PartitionLocationFuture> {
        self.metadata(partition_id)?.location_future()
    }

    /// All committed partitions whose resolved location is the given
    /// executor; used to compute recovery fallout.
    pub fn get_committed_partitions_by_executor(
        &self,
        executor_id: &ExecutorId,
    ) -> RuntimeResult<Vec<PartitionId>> {
        let registry = self.registry.read()?;
        Self::committed_partitions_of(&registry, executor_id)
    }

    /// The task groups that produced or will produce the partition.
    pub fn get_producer_task_group_ids(
        &self,
        partition_id: PartitionId,
    ) -> RuntimeResult<HashSet<TaskGroupId>> {
        let registry = self.registry.read()?;
        Ok(Self::producers_of(&registry, partition_id))
    }

    /// To be called when a producer task group is enqueued for scheduling:
    /// its partitions leave the created or lost states.
    pub fn on_producer_task_group_scheduled(
        &self,
        task_group_id: TaskGroupId,
    ) -> RuntimeResult<()> {
        let registry = self.registry.write()?;
        let Some(partition_ids) = registry.producers.get(&task_group_id) else {
            // This task group does not produce any partition.
            return Ok(());
        };
        for partition_id in partition_ids {
            let metadata = registry.partitions.get(partition_id).ok_or_else(|| {
                RuntimeError::InternalError(format!(
                    "producer index refers to unknown partition {partition_id}"
                ))
            })?;
            match metadata.state()? {
                PartitionState::Created
                | PartitionState::Lost
                | PartitionState::LostBeforeCommit => {
                    metadata.on_state_changed(PartitionState::Scheduled, None, None)?;
                }
                // Scheduled partitions stay as they are; committed partitions
                // of a retried producer have been demoted by the failure path.
                PartitionState::Scheduled
                | PartitionState::Committed
                | PartitionState::Removed => {}
            }
        }
        Ok(())
    }

    /// To be called when a producer task group fails before completing:
    /// whatever it committed is lost, and whatever it was writing never
    /// committed.
    pub fn on_producer_task_group_failed(&self, task_group_id: TaskGroupId) -> RuntimeResult<()> {
        let registry = self.registry.write()?;
        let Some(partition_ids) = registry.producers.get(&task_group_id) else {
            return Ok(());
        };
        for partition_id in partition_ids {
            let metadata = registry.partitions.get(partition_id).ok_or_else(|| {
                RuntimeError::InternalError(format!(
                    "producer index refers to unknown partition {partition_id}"
                ))
            })?;
            match metadata.state()? {
                PartitionState::Committed => {
                    metadata.on_state_changed(PartitionState::Lost, None, None)?;
                }
                PartitionState::Scheduled => {
                    metadata.on_state_changed(PartitionState::LostBeforeCommit, None, None)?;
                }
                PartitionState::Created
                | PartitionState::Lost
                | PartitionState::LostBeforeCommit
                | PartitionState::Removed => {}
            }
        }
        Ok(())
    }

    /// Marks every committed partition owned by the executor as lost and
    /// returns the union of their producer task groups, which the scheduler
    /// must recompute.
    pub fn remove_worker(&self, executor_id: &ExecutorId) -> RuntimeResult<HashSet<TaskGroupId>> {
        warn!("removing partitions owned by executor {executor_id}");
        let registry = self.registry.write()?;
        let mut task_groups_to_recompute = HashSet::new();
        for partition_id in Self::committed_partitions_of(&registry, executor_id)? {
            let metadata = registry.partitions.get(&partition_id).ok_or_else(|| {
                RuntimeError::InternalError(format!("unknown partition {partition_id}"))
            })?;
            metadata.on_state_changed(PartitionState::Lost, None, None)?;
            task_groups_to_recompute.extend(Self::producers_of(&registry, partition_id));
        }
        Ok(task_groups_to_recompute)
    }

    /// Explicitly removes a partition; the id stays registered so it can
    /// never be reused.
    pub fn remove_partition(&self, partition_id: PartitionId) -> RuntimeResult<()> {
        let registry = self.registry.write()?;
        let metadata = registry.partitions.get(&partition_id).ok_or_else(|| {
            RuntimeError::InvalidArgument(format!("unknown partition {partition_id}"))
        })?;
        metadata.on_state_changed(PartitionState::Removed, None, None)
    }

    /// Reserves the region for a sub-block; replies with the block index and
    /// the position to write at.
    pub fn reserve_block(
        &self,
        partition_id: PartitionId,
        block: BlockMetadata,
    ) -> RuntimeResult<(usize, u64)> {
        self.metadata(partition_id)?.reserve_block(block)
    }

    pub fn commit_blocks(
        &self,
        partition_id: PartitionId,
        block_indices: &[usize],
    ) -> RuntimeResult<()> {
        self.metadata(partition_id)?.commit_blocks(block_indices)
    }

    /// The committed sub-block descriptors of a partition that is being
    /// written or has committed; absent otherwise.
    pub fn get_committed_block_metadata(
        &self,
        partition_id: PartitionId,
    ) -> RuntimeResult<Vec<BlockDescriptor>> {
        let metadata = self.metadata(partition_id)?;
        let state = metadata.state()?;
        match state {
            PartitionState::Scheduled | PartitionState::Committed => metadata.committed_blocks(),
            _ => Err(RuntimeError::AbsentPartition {
                id: partition_id,
                state,
            }),
        }
    }

    fn metadata(&self, partition_id: PartitionId) -> RuntimeResult<Arc<PartitionMetadata>> {
        let registry = self.registry.read()?;
        registry.partitions.get(&partition_id).cloned().ok_or_else(|| {
            RuntimeError::InvalidArgument(format!("unknown partition {partition_id}"))
        })
    }

    fn committed_partitions_of(
        registry: &PartitionRegistry,
        executor_id: &ExecutorId,
    ) -> RuntimeResult<Vec<PartitionId>> {
        let mut partition_ids = vec![];
        for metadata in registry.partitions.values() {
            if metadata.state()? == PartitionState::Committed
                && metadata.location()?.as_ref() == Some(executor_id)
            {
                partition_ids.push(metadata.partition_id());
            }
        }
        Ok(partition_ids)
    }

    fn producers_of(registry: &PartitionRegistry, partition_id: PartitionId) -> HashSet<TaskGroupId> {
        registry
            .producers
            .iter()
            .filter(|(_, partition_ids)| partition_ids.contains(&partition_id))
            .map(|(task_group_id, _)| *task_group_id)
            .collect()
    }
}

impl Default for PartitionManager {
    fn default() -> Self {
        Self::new()
    }
}
