use std::sync::Arc;

use tokio::sync::oneshot;

use crate::actor::{ActorAction, ActorContext};
use crate::error::RuntimeResult;
use crate::executor::ExecutorRepresenter;
use crate::id::{ExecutorId, PartitionId, TaskGroupId, TaskId};
use crate::master::RuntimeMaster;
use crate::partition::{BlockDescriptor, BlockMetadata};
use crate::plan::PhysicalPlan;
use crate::progress::JobStateManager;
use crate::state::{PartitionState, TaskGroupState};

impl RuntimeMaster {
    pub(super) fn handle_execute_job(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        plan: PhysicalPlan,
        result: oneshot::Sender<RuntimeResult<Arc<JobStateManager>>>,
    ) -> ActorAction {
        let _ = result.send(self.scheduler.schedule_job(plan));
        ActorAction::Continue
    }

    pub(super) fn handle_executor_added(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        executor: Arc<ExecutorRepresenter>,
        result: oneshot::Sender<RuntimeResult<()>>,
    ) -> ActorAction {
        let _ = result.send(self.scheduler.on_executor_added(executor));
        ActorAction::Continue
    }

    pub(super) fn handle_executor_removed(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        executor_id: ExecutorId,
    ) -> ActorAction {
        match self.scheduler.on_executor_removed(&executor_id) {
            Ok(()) => ActorAction::Continue,
            Err(e) => ActorAction::warn(format!("failed to remove executor {executor_id}: {e}")),
        }
    }

    pub(super) fn handle_task_group_state_changed(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        executor_id: ExecutorId,
        task_group_id: TaskGroupId,
        state: TaskGroupState,
        failed_task: Option<TaskId>,
    ) -> ActorAction {
        match self
            .scheduler
            .on_task_group_state_changed(&executor_id, task_group_id, state, failed_task)
        {
            Ok(()) => ActorAction::Continue,
            Err(e) => ActorAction::warn(format!(
                "failed to apply the {state} report for task group {task_group_id}: {e}"
            )),
        }
    }

    pub(super) fn handle_partition_state_changed(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        partition_id: PartitionId,
        state: PartitionState,
        location: Option<ExecutorId>,
        producer_index: Option<usize>,
    ) -> ActorAction {
        match self
            .partitions
            .on_partition_state_changed(partition_id, state, location, producer_index)
        {
            Ok(()) => ActorAction::Continue,
            Err(e) => ActorAction::warn(format!(
                "failed to apply the {state} report for partition {partition_id}: {e}"
            )),
        }
    }

    /// Replies once the partition commits; an unlocatable partition fails the
    /// request immediately, and the requester decides whether to retry.
    pub(super) fn handle_request_partition_location(
        &mut self,
        ctx: &mut ActorContext<Self>,
        partition_id: PartitionId,
        result: oneshot::Sender<RuntimeResult<ExecutorId>>,
    ) -> ActorAction {
        match self.partitions.get_partition_location_future(partition_id) {
            Ok(future) => {
                ctx.spawn(async move {
                    let _ = result.send(future.resolve().await);
                });
            }
            Err(e) => {
                let _ = result.send(Err(e));
            }
        }
        ActorAction::Continue
    }

    pub(super) fn handle_reserve_block(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        partition_id: PartitionId,
        block: BlockMetadata,
        result: oneshot::Sender<RuntimeResult<(usize, u64)>>,
    ) -> ActorAction {
        let _ = result.send(self.partitions.reserve_block(partition_id, block));
        ActorAction::Continue
    }

    pub(super) fn handle_commit_blocks(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        partition_id: PartitionId,
        block_indices: Vec<usize>,
    ) -> ActorAction {
        match self.partitions.commit_blocks(partition_id, &block_indices) {
            Ok(()) => ActorAction::Continue,
            Err(e) => ActorAction::warn(format!(
                "failed to commit blocks of partition {partition_id}: {e}"
            )),
        }
    }

    pub(super) fn handle_request_block_metadata(
        &mut self,
        _ctx: &mut ActorContext<Self>,
        partition_id: PartitionId,
        result: oneshot::Sender<RuntimeResult<Vec<BlockDescriptor>>>,
    ) -> ActorAction {
        let _ = result.send(self.partitions.get_committed_block_metadata(partition_id));
        ActorAction::Continue
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::*;
    use crate::actor::ActorHandle;
    use crate::error::RuntimeError;
    use crate::executor::{ExecutorRegistry, ResourceSpecification};
    use crate::master::{MasterEvent, MasterOptions};
    use crate::partition::PartitionManager;
    use crate::plan::ResourceType;
    use crate::progress::tests::two_stage_plan;
    use crate::rpc::{ExecutorClient, ExecutorCommand};
    use crate::scheduler::{BatchScheduler, RoundRobinPolicy, SchedulerOptions};
    use crate::state::JobState;

    struct RecordingClient {
        executor_id: ExecutorId,
        launches: mpsc::UnboundedSender<(ExecutorId, TaskGroupId)>,
    }

    #[async_trait]
    impl ExecutorClient for RecordingClient {
        async fn send(&self, command: ExecutorCommand) -> RuntimeResult<()> {
            let ExecutorCommand::LaunchTaskGroup { task_group, .. } = command;
            let _ = self.launches.send((self.executor_id.clone(), task_group.id));
            Ok(())
        }
    }

    async fn request_location(
        master: &ActorHandle<RuntimeMaster>,
        partition_id: PartitionId,
    ) -> RuntimeResult<ExecutorId> {
        let (tx, rx) = oneshot::channel();
        master
            .send(MasterEvent::RequestPartitionLocation {
                partition_id,
                result: tx,
            })
            .await
            .unwrap();
        timeout(Duration::from_secs(2), rx).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_job_runs_to_completion_through_the_master() {
        let registry = Arc::new(ExecutorRegistry::new());
        let partitions = Arc::new(PartitionManager::new());
        let policy = Arc::new(RoundRobinPolicy::new(Arc::clone(&registry)));
        let scheduler = BatchScheduler::new(
            SchedulerOptions {
                schedule_timeout: Duration::from_millis(50),
                max_schedule_attempts: 3,
            },
            policy,
            Arc::clone(&registry),
            Arc::clone(&partitions),
        );
        let master = ActorHandle::<RuntimeMaster>::new(MasterOptions {
            scheduler,
            partitions,
        });

        let (launch_tx, mut launches) = mpsc::unbounded_channel();
        let (tx, rx) = oneshot::channel();
        master
            .send(MasterEvent::ExecutorAdded {
                executor: Arc::new(ExecutorRepresenter::new(
                    ExecutorId::from("a1"),
                    ResourceSpecification::new(ResourceType::Compute, 2),
                    Arc::new(RecordingClient {
                        executor_id: ExecutorId::from("a1"),
                        launches: launch_tx,
                    }),
                )),
                result: tx,
            })
            .await
            .unwrap();
        rx.await.unwrap().unwrap();

        let plan = two_stage_plan(&[1, 1]);
        let edge = plan.outgoing_edges(plan.stages()[0].id).next().unwrap().id;
        let partition_id = PartitionId::new(edge, 0);
        let (tx, rx) = oneshot::channel();
        master
            .send(MasterEvent::ExecuteJob { plan, result: tx })
            .await
            .unwrap();
        let state = rx.await.unwrap().unwrap();

        // The first stage's task group is dispatched; a location request for
        // its output stays pending until the partition commits.
        let (executor_id, first_group) =
            timeout(Duration::from_secs(2), launches.recv()).await.unwrap().unwrap();
        let pending = {
            let master = master.clone();
            tokio::spawn(async move { request_location(&master, partition_id).await })
        };
        master
            .send(MasterEvent::PartitionStateChanged {
                partition_id,
                state: PartitionState::Committed,
                location: Some(executor_id.clone()),
                producer_index: Some(0),
            })
            .await
            .unwrap();
        assert_eq!(pending.await.unwrap().unwrap(), ExecutorId::from("a1"));

        master
            .send(MasterEvent::TaskGroupStateChanged {
                executor_id: executor_id.clone(),
                task_group_id: first_group,
                state: TaskGroupState::Complete,
                failed_task: None,
            })
            .await
            .unwrap();
        let (executor_id, second_group) =
            timeout(Duration::from_secs(2), launches.recv()).await.unwrap().unwrap();
        master
            .send(MasterEvent::TaskGroupStateChanged {
                executor_id,
                task_group_id: second_group,
                state: TaskGroupState::Complete,
                failed_task: None,
            })
            .await
            .unwrap();

        // Drain the event queue before polling the aggregate state.
        let resolved = request_location(&master, partition_id).await.unwrap();
        assert_eq!(resolved, ExecutorId::from("a1"));
        assert_eq!(state.job_state().unwrap(), JobState::Complete);

        master.send(MasterEvent::Shutdown).await.unwrap();
        master.wait_for_stop().await;
    }

    #[tokio::test]
    async fn test_location_request_for_unknown_partition_fails() {
        let registry = Arc::new(ExecutorRegistry::new());
        let partitions = Arc::new(PartitionManager::new());
        let policy = Arc::new(RoundRobinPolicy::new(Arc::clone(&registry)));
        let scheduler = BatchScheduler::new(
            SchedulerOptions {
                schedule_timeout: Duration::from_millis(50),
                max_schedule_attempts: 3,
            },
            policy,
            registry,
            Arc::clone(&partitions),
        );
        let master = ActorHandle::<RuntimeMaster>::new(MasterOptions {
            scheduler,
            partitions,
        });
        let result = request_location(&master, PartitionId::new(crate::id::EdgeId::from(9), 0)).await;
        assert!(matches!(result, Err(RuntimeError::InvalidArgument(_))));
        master.send(MasterEvent::Shutdown).await.unwrap();
        master.wait_for_stop().await;
    }
}
