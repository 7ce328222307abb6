use std::sync::Arc;

use tokio::sync::oneshot;

use crate::error::RuntimeResult;
use crate::executor::ExecutorRepresenter;
use crate::id::{ExecutorId, PartitionId, TaskGroupId, TaskId};
use crate::partition::{BlockDescriptor, BlockMetadata};
use crate::plan::PhysicalPlan;
use crate::progress::JobStateManager;
use crate::state::{PartitionState, TaskGroupState};

/// A control-plane event delivered to the runtime master: job submissions,
/// resource-layer notifications, and the reports executors send over RPC.
pub enum MasterEvent {
    ExecuteJob {
        plan: PhysicalPlan,
        result: oneshot::Sender<RuntimeResult<Arc<JobStateManager>>>,
    },
    ExecutorAdded {
        executor: Arc<ExecutorRepresenter>,
        result: oneshot::Sender<RuntimeResult<()>>,
    },
    ExecutorRemoved {
        executor_id: ExecutorId,
    },
    TaskGroupStateChanged {
        executor_id: ExecutorId,
        task_group_id: TaskGroupId,
        state: TaskGroupState,
        failed_task: Option<TaskId>,
    },
    PartitionStateChanged {
        partition_id: PartitionId,
        state: PartitionState,
        location: Option<ExecutorId>,
        producer_index: Option<usize>,
    },
    RequestPartitionLocation {
        partition_id: PartitionId,
        result: oneshot::Sender<RuntimeResult<ExecutorId>>,
    },
    ReserveBlock {
        partition_id: PartitionId,
        block: BlockMetadata,
        result: oneshot::Sender<RuntimeResult<(usize, u64)>>,
    },
    CommitBlocks {
        partition_id: PartitionId,
        block_indices: Vec<usize>,
    },
    RequestBlockMetadata {
        partition_id: PartitionId,
        result: oneshot::Sender<RuntimeResult<Vec<BlockDescriptor>>>,
    },
    Shutdown,
}
