mod event;
mod handler;

use std::sync::Arc;

pub use event::MasterEvent;

use crate::actor::{Actor, ActorAction, ActorContext};
use crate::error::RuntimeError;
use crate::partition::PartitionManager;
use crate::scheduler::BatchScheduler;

/// The central controller of the runtime: a single actor that serializes
/// inbound control events and drives the scheduler and the partition
/// manager. Serializing the events makes multi-component sequences such as
/// executor-loss recovery atomic with respect to other control traffic.
pub struct RuntimeMaster {
    scheduler: Arc<BatchScheduler>,
    partitions: Arc<PartitionManager>,
}

pub struct MasterOptions {
    pub scheduler: Arc<BatchScheduler>,
    pub partitions: Arc<PartitionManager>,
}

impl Actor for RuntimeMaster {
    type Message = MasterEvent;
    type Options = MasterOptions;
    type Error = RuntimeError;

    fn new(options: MasterOptions) -> Self {
        Self {
            scheduler: options.scheduler,
            partitions: options.partitions,
        }
    }

    fn start(&mut self, _ctx: &mut ActorContext<Self>) -> Result<(), RuntimeError> {
        Ok(())
    }

    fn receive(&mut self, ctx: &mut ActorContext<Self>, message: MasterEvent) -> ActorAction {
        match message {
            MasterEvent::ExecuteJob { plan, result } => self.handle_execute_job(ctx, plan, result),
            MasterEvent::ExecutorAdded { executor, result } => {
                self.handle_executor_added(ctx, executor, result)
            }
            MasterEvent::ExecutorRemoved { executor_id } => {
                self.handle_executor_removed(ctx, executor_id)
            }
            MasterEvent::TaskGroupStateChanged {
                executor_id,
                task_group_id,
                state,
                failed_task,
            } => self.handle_task_group_state_changed(
                ctx,
                executor_id,
                task_group_id,
                state,
                failed_task,
            ),
            MasterEvent::PartitionStateChanged {
                partition_id,
                state,
                location,
                producer_index,
            } => self.handle_partition_state_changed(ctx, partition_id, state, location, producer_index),
            MasterEvent::RequestPartitionLocation {
                partition_id,
                result,
            } => self.handle_request_partition_location(ctx, partition_id, result),
            MasterEvent::ReserveBlock {
                partition_id,
                block,
                result,
            } => self.handle_reserve_block(ctx, partition_id, block, result),
            MasterEvent::CommitBlocks {
                partition_id,
                block_indices,
            } => self.handle_commit_blocks(ctx, partition_id, block_indices),
            MasterEvent::RequestBlockMetadata {
                partition_id,
                result,
            } => self.handle_request_block_metadata(ctx, partition_id, result),
            MasterEvent::Shutdown => {
                if let Err(e) = self.scheduler.terminate() {
                    return ActorAction::fail(e);
                }
                ActorAction::Stop
            }
        }
    }

    fn stop(self) -> Result<(), RuntimeError> {
        Ok(())
    }
}
