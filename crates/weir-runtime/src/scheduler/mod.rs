mod options;
mod policy;
mod queue;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use log::{debug, error, info, warn};
pub use options::SchedulerOptions;
pub use policy::{RoundRobinPolicy, SchedulingPolicy};
pub use queue::{PendingTaskGroup, PendingTaskGroupQueue};

use crate::error::{RuntimeError, RuntimeResult};
use crate::executor::{ExecutorRegistry, ExecutorRepresenter};
use crate::id::{ExecutorId, PartitionId, TaskGroupId, TaskId};
use crate::partition::PartitionManager;
use crate::plan::{PhysicalPlan, TaskGroup};
use crate::progress::{JobProgress, JobStateManager};
use crate::rpc::ExecutorCommand;
use crate::state::{JobState, TaskGroupState};

/// Schedules the task groups of a physical plan onto executors, one schedule
/// group at a time, and recovers from task and executor failures.
///
/// A single dispatch loop owns the pending queue; everything else (state
/// reports, executor arrivals and losses) is applied concurrently through the
/// locks internal to each component.
pub struct BatchScheduler {
    options: SchedulerOptions,
    policy: Arc<dyn SchedulingPolicy>,
    registry: Arc<ExecutorRegistry>,
    partitions: Arc<PartitionManager>,
    queue: Arc<PendingTaskGroupQueue>,
    job: Mutex<Option<ActiveJob>>,
}

struct ActiveJob {
    plan: PhysicalPlan,
    state: Arc<JobStateManager>,
    /// Scheduling attempts per task group, across failures and recomputes.
    attempts: HashMap<TaskGroupId, usize>,
    current_schedule_group: usize,
}

impl BatchScheduler {
    pub fn new(
        options: SchedulerOptions,
        policy: Arc<dyn SchedulingPolicy>,
        registry: Arc<ExecutorRegistry>,
        partitions: Arc<PartitionManager>,
    ) -> Arc<Self> {
        let scheduler = Arc::new(Self {
            options,
            policy,
            registry,
            partitions,
            queue: Arc::new(PendingTaskGroupQueue::new()),
            job: Mutex::new(None),
        });
        let runner = Arc::clone(&scheduler);
        tokio::spawn(async move { runner.run().await });
        scheduler
    }

    /// Accepts a plan, registers its partitions, and pushes the first
    /// schedule group onto the queue. Plans submitted to one scheduler must
    /// carry ids from the same generator so that partition ids never collide.
    pub fn schedule_job(&self, plan: PhysicalPlan) -> RuntimeResult<Arc<JobStateManager>> {
        let mut guard = self.job.lock()?;
        if let Some(job) = guard.as_ref() {
            if job.state.job_state()? == JobState::Executing {
                return Err(RuntimeError::InvalidArgument(
                    "a job is already executing".to_string(),
                ));
            }
        }
        for stage in plan.stages() {
            for edge in plan.outgoing_edges(stage.id) {
                for group in &stage.task_groups {
                    self.partitions.initialize_partition(
                        PartitionId::new(edge.id, group.index),
                        HashSet::from([group.index]),
                        HashSet::from([group.id]),
                    )?;
                }
            }
        }
        let state = Arc::new(JobStateManager::new(&plan));
        *guard = Some(ActiveJob {
            plan,
            state: Arc::clone(&state),
            attempts: HashMap::new(),
            current_schedule_group: 0,
        });
        if let Some(job) = guard.as_mut() {
            self.start_schedule_group(job, 0)?;
        }
        Ok(state)
    }

    /// Applies a task-group state report from an executor.
    pub fn on_task_group_state_changed(
        &self,
        executor_id: &ExecutorId,
        task_group_id: TaskGroupId,
        new_state: TaskGroupState,
        failed_task: Option<TaskId>,
    ) -> RuntimeResult<()> {
        match new_state {
            TaskGroupState::Complete => {
                self.on_task_group_execution_complete(executor_id, task_group_id)
            }
            TaskGroupState::FailedRecoverable => {
                self.on_task_group_execution_failed(executor_id, task_group_id, failed_task)
            }
            TaskGroupState::FailedUnrecoverable => {
                self.on_task_group_execution_unrecoverable(executor_id, task_group_id, failed_task)
            }
            TaskGroupState::Ready | TaskGroupState::Executing => {
                Err(RuntimeError::InvalidArgument(format!(
                    "executors do not report the {new_state} state"
                )))
            }
        }
    }

    pub fn on_executor_added(&self, representer: Arc<ExecutorRepresenter>) -> RuntimeResult<()> {
        let executor_id = representer.executor_id().clone();
        self.registry.register(representer)?;
        info!("executor {executor_id} is available for scheduling");
        self.policy.on_executor_added(&executor_id)
    }

    /// The recovery protocol for a lost executor. The steps are ordered so
    /// that no new work lands on the dead executor while cleanup is in
    /// flight, and so that a task group already being retried for direct
    /// failure is not enqueued twice for its lost output.
    pub fn on_executor_removed(&self, executor_id: &ExecutorId) -> RuntimeResult<()> {
        warn!("executor {executor_id} was removed");
        self.registry.set_as_failed(executor_id)?;
        let orphaned = self.policy.on_executor_removed(executor_id)?;

        let mut guard = self.job.lock()?;
        let Some(job) = guard.as_mut() else {
            return Ok(());
        };
        let mut retried = HashSet::new();
        for task_group_id in orphaned {
            if let Err(e) = self.fail_running_task_group(job, task_group_id) {
                warn!("failed to recover task group {task_group_id}: {e}");
            }
            retried.insert(task_group_id);
        }

        let recompute = self.partitions.remove_worker(executor_id)?;
        for task_group_id in recompute {
            if retried.contains(&task_group_id) || self.queue.contains(task_group_id)? {
                continue;
            }
            match job.state.task_group_state(task_group_id)? {
                TaskGroupState::Complete => {
                    info!(
                        "recomputing task group {task_group_id}: its committed output was lost \
                         with executor {executor_id}"
                    );
                    if let Err(e) = self.recompute_task_group(job, task_group_id) {
                        warn!("failed to recompute task group {task_group_id}: {e}");
                    }
                }
                state => {
                    debug!("task group {task_group_id} is {state}; no recompute needed");
                }
            }
        }
        Ok(())
    }

    /// Stops the dispatch loop. Pending task groups are dropped.
    pub fn terminate(&self) -> RuntimeResult<()> {
        self.queue.close()
    }

    fn on_task_group_execution_complete(
        &self,
        executor_id: &ExecutorId,
        task_group_id: TaskGroupId,
    ) -> RuntimeResult<()> {
        self.policy
            .on_task_group_execution_complete(executor_id, task_group_id)?;
        let mut guard = self.job.lock()?;
        let job = guard
            .as_mut()
            .ok_or_else(|| RuntimeError::InvalidArgument("no active job".to_string()))?;
        match job
            .state
            .on_task_group_state_changed(task_group_id, TaskGroupState::Complete, None)?
        {
            JobProgress::Continue => {}
            JobProgress::StageCompleted(stage_id) => {
                debug!("stage {stage_id} completed; checking the schedule-group barrier");
                while job.current_schedule_group < job.plan.max_schedule_group()
                    && job
                        .state
                        .is_schedule_group_complete(job.current_schedule_group)?
                {
                    let next = job.current_schedule_group + 1;
                    job.current_schedule_group = next;
                    self.start_schedule_group(job, next)?;
                }
            }
            JobProgress::JobCompleted => {}
            JobProgress::JobFailed => {}
        }
        Ok(())
    }

    fn on_task_group_execution_failed(
        &self,
        executor_id: &ExecutorId,
        task_group_id: TaskGroupId,
        failed_task: Option<TaskId>,
    ) -> RuntimeResult<()> {
        self.policy
            .on_task_group_execution_failed(executor_id, task_group_id)?;
        let mut guard = self.job.lock()?;
        let job = guard
            .as_mut()
            .ok_or_else(|| RuntimeError::InvalidArgument("no active job".to_string()))?;
        job.state.on_task_group_state_changed(
            task_group_id,
            TaskGroupState::FailedRecoverable,
            failed_task,
        )?;
        self.partitions.on_producer_task_group_failed(task_group_id)?;
        self.retry_task_group(job, task_group_id)
    }

    fn on_task_group_execution_unrecoverable(
        &self,
        executor_id: &ExecutorId,
        task_group_id: TaskGroupId,
        failed_task: Option<TaskId>,
    ) -> RuntimeResult<()> {
        self.policy
            .on_task_group_execution_failed(executor_id, task_group_id)?;
        let mut guard = self.job.lock()?;
        let job = guard
            .as_mut()
            .ok_or_else(|| RuntimeError::InvalidArgument("no active job".to_string()))?;
        error!(
            "task {} of task group {task_group_id} failed unrecoverably on executor {executor_id}",
            failed_task.map_or_else(|| "<unknown>".to_string(), |task| task.to_string()),
        );
        job.state.on_task_group_state_changed(
            task_group_id,
            TaskGroupState::FailedUnrecoverable,
            failed_task,
        )?;
        Ok(())
    }

    /// Marks every stage of the schedule group as executing and enqueues its
    /// task groups.
    fn start_schedule_group(&self, job: &mut ActiveJob, schedule_group: usize) -> RuntimeResult<()> {
        info!("starting schedule group {schedule_group}");
        let mut stage_ids = vec![];
        let mut task_groups = vec![];
        for stage in job.plan.stages() {
            if stage.schedule_group == schedule_group {
                stage_ids.push(stage.id);
                task_groups.extend(stage.task_groups.iter().cloned());
            }
        }
        for stage_id in stage_ids {
            job.state.on_stage_executing(stage_id)?;
        }
        for task_group in task_groups {
            self.enqueue_task_group(job, task_group)?;
        }
        Ok(())
    }

    /// Pushes a task group onto the queue, counting the scheduling attempt
    /// and moving its partitions to SCHEDULED. Idempotent per task group.
    fn enqueue_task_group(&self, job: &mut ActiveJob, task_group: TaskGroup) -> RuntimeResult<bool> {
        let task_group_id = task_group.id;
        let attempt = job.attempts.get(&task_group_id).copied().unwrap_or(0) + 1;
        if !self.queue.enqueue(PendingTaskGroup {
            task_group,
            attempt,
        })? {
            return Ok(false);
        }
        job.attempts.insert(task_group_id, attempt);
        self.partitions.on_producer_task_group_scheduled(task_group_id)?;
        Ok(true)
    }

    /// The direct-failure recovery path for a task group that was running on
    /// a lost executor.
    fn fail_running_task_group(
        &self,
        job: &mut ActiveJob,
        task_group_id: TaskGroupId,
    ) -> RuntimeResult<()> {
        job.state.on_task_group_state_changed(
            task_group_id,
            TaskGroupState::FailedRecoverable,
            None,
        )?;
        self.partitions.on_producer_task_group_failed(task_group_id)?;
        self.retry_task_group(job, task_group_id)
    }

    /// The cascading-recompute path for a task group whose committed output
    /// was lost after it completed.
    fn recompute_task_group(
        &self,
        job: &mut ActiveJob,
        task_group_id: TaskGroupId,
    ) -> RuntimeResult<()> {
        job.state.on_task_group_state_changed(
            task_group_id,
            TaskGroupState::FailedRecoverable,
            None,
        )?;
        self.retry_task_group(job, task_group_id)
    }

    /// Re-enqueues a recoverably failed task group, or escalates once its
    /// attempts are exhausted.
    fn retry_task_group(&self, job: &mut ActiveJob, task_group_id: TaskGroupId) -> RuntimeResult<()> {
        let attempts = job.attempts.get(&task_group_id).copied().unwrap_or(0);
        if attempts >= self.options.max_schedule_attempts {
            error!(
                "task group {task_group_id} exhausted its {attempts} scheduling attempts; \
                 the job is unrecoverable"
            );
            job.state.on_task_group_state_changed(
                task_group_id,
                TaskGroupState::FailedUnrecoverable,
                None,
            )?;
            return Ok(());
        }
        job.state
            .on_task_group_state_changed(task_group_id, TaskGroupState::Ready, None)?;
        let task_group = job.plan.task_group(task_group_id).cloned().ok_or_else(|| {
            RuntimeError::InvalidArgument(format!("unknown task group {task_group_id}"))
        })?;
        if self.enqueue_task_group(job, task_group)? {
            info!(
                "task group {task_group_id} re-enqueued for attempt {}",
                attempts + 1
            );
        }
        Ok(())
    }

    async fn run(self: Arc<Self>) {
        while let Some(pending) = self.queue.take_first().await {
            if let Err(e) = self.dispatch(pending).await {
                error!("failed to dispatch a task group: {e}");
            }
        }
        debug!("the dispatch loop has stopped");
    }

    /// One iteration of the dispatch loop: find an executor within the
    /// timeout, or send the task group to the back of the queue.
    async fn dispatch(&self, pending: PendingTaskGroup) -> RuntimeResult<()> {
        let task_group = &pending.task_group;
        {
            let guard = self.job.lock()?;
            let Some(job) = guard.as_ref() else {
                return Ok(());
            };
            if job.state.job_state()? != JobState::Executing {
                debug!(
                    "dropping task group {}: the job is no longer executing",
                    task_group.id
                );
                return Ok(());
            }
            match job.state.task_group_state(task_group.id)? {
                TaskGroupState::Ready => {}
                state => {
                    debug!("dropping task group {} in state {state}", task_group.id);
                    return Ok(());
                }
            }
        }
        let executor = self
            .policy
            .attempt_schedule(task_group, self.options.schedule_timeout)
            .await?;
        let Some(executor) = executor else {
            info!(
                "no executor for task group {} within {:?}; requeueing",
                task_group.id, self.options.schedule_timeout
            );
            self.queue.enqueue(pending.clone())?;
            return Ok(());
        };
        {
            let guard = self.job.lock()?;
            let Some(job) = guard.as_ref() else {
                let _ = executor.release(task_group.id);
                return Ok(());
            };
            if let Err(e) = job.state.on_task_group_state_changed(
                task_group.id,
                TaskGroupState::Executing,
                None,
            ) {
                let _ = self
                    .policy
                    .on_task_group_execution_failed(executor.executor_id(), task_group.id);
                return Err(e);
            }
        }
        info!(
            "task group {} (attempt {}) dispatched to executor {}",
            task_group.id,
            pending.attempt,
            executor.executor_id()
        );
        let client = executor.client();
        let executor_id = executor.executor_id().clone();
        let command = ExecutorCommand::LaunchTaskGroup {
            task_group: task_group.clone(),
            attempt: pending.attempt,
        };
        tokio::spawn(async move {
            if let Err(e) = client.send(command).await {
                error!("failed to launch a task group on executor {executor_id}: {e}");
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    use super::*;
    use crate::executor::ResourceSpecification;
    use crate::plan::ResourceType;
    use crate::progress::tests::two_stage_plan;
    use crate::rpc::ExecutorClient;
    use crate::state::PartitionState;

    struct RecordingClient {
        executor_id: ExecutorId,
        launches: mpsc::UnboundedSender<(ExecutorId, TaskGroupId, usize)>,
    }

    #[async_trait]
    impl ExecutorClient for RecordingClient {
        async fn send(&self, command: ExecutorCommand) -> RuntimeResult<()> {
            let ExecutorCommand::LaunchTaskGroup {
                task_group,
                attempt,
            } = command;
            let _ = self
                .launches
                .send((self.executor_id.clone(), task_group.id, attempt));
            Ok(())
        }
    }

    struct Harness {
        scheduler: Arc<BatchScheduler>,
        registry: Arc<ExecutorRegistry>,
        partitions: Arc<PartitionManager>,
        launches: mpsc::UnboundedReceiver<(ExecutorId, TaskGroupId, usize)>,
    }

    impl Harness {
        fn new(executors: &[(&str, usize)], max_schedule_attempts: usize) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            let registry = Arc::new(ExecutorRegistry::new());
            for &(id, capacity) in executors {
                let client = Arc::new(RecordingClient {
                    executor_id: ExecutorId::from(id),
                    launches: tx.clone(),
                });
                registry
                    .register(Arc::new(ExecutorRepresenter::new(
                        ExecutorId::from(id),
                        ResourceSpecification::new(ResourceType::Compute, capacity),
                        client,
                    )))
                    .unwrap();
            }
            let partitions = Arc::new(PartitionManager::new());
            let policy = Arc::new(RoundRobinPolicy::new(Arc::clone(&registry)));
            let scheduler = BatchScheduler::new(
                SchedulerOptions {
                    schedule_timeout: Duration::from_millis(50),
                    max_schedule_attempts,
                },
                policy,
                Arc::clone(&registry),
                Arc::clone(&partitions),
            );
            Self {
                scheduler,
                registry,
                partitions,
                launches: rx,
            }
        }

        async fn next_launch(&mut self) -> (ExecutorId, TaskGroupId, usize) {
            timeout(Duration::from_secs(2), self.launches.recv())
                .await
                .expect("timed out waiting for a task group launch")
                .expect("the launch channel closed")
        }

        async fn expect_no_launch(&mut self) {
            let result = timeout(Duration::from_millis(200), self.launches.recv()).await;
            assert!(result.is_err(), "unexpected launch: {:?}", result.unwrap());
        }
    }

    #[tokio::test]
    async fn test_stage_advancement_follows_schedule_groups() {
        let mut harness = Harness::new(&[("a1", 2), ("a2", 2), ("a3", 2)], 3);
        let plan = two_stage_plan(&[3, 2]);
        let second_stage: Vec<TaskGroupId> = plan.stages()[1]
            .task_groups
            .iter()
            .map(|group| group.id)
            .collect();
        let state = harness.scheduler.schedule_job(plan).unwrap();

        let mut first_stage_launches = vec![];
        for _ in 0..3 {
            first_stage_launches.push(harness.next_launch().await);
        }
        // The second schedule group is gated behind the first.
        harness.expect_no_launch().await;

        for (executor_id, task_group_id, _) in &first_stage_launches {
            harness
                .scheduler
                .on_task_group_state_changed(
                    executor_id,
                    *task_group_id,
                    TaskGroupState::Complete,
                    None,
                )
                .unwrap();
        }
        let mut launched = vec![];
        for _ in 0..2 {
            let (_, task_group_id, _) = harness.next_launch().await;
            launched.push(task_group_id);
        }
        launched.sort();
        assert_eq!(launched, second_stage);

        for &task_group_id in &launched {
            let executor_id = harness
                .registry
                .running_executor_ids()
                .unwrap()
                .into_iter()
                .find(|id| {
                    harness
                        .registry
                        .executor(id)
                        .unwrap()
                        .running_task_groups()
                        .unwrap()
                        .contains(&task_group_id)
                })
                .unwrap();
            harness
                .scheduler
                .on_task_group_state_changed(
                    &executor_id,
                    task_group_id,
                    TaskGroupState::Complete,
                    None,
                )
                .unwrap();
        }
        assert_eq!(state.job_state().unwrap(), JobState::Complete);
        harness.scheduler.terminate().unwrap();
    }

    #[tokio::test]
    async fn test_executor_loss_triggers_cascading_recompute() {
        let mut harness = Harness::new(&[("a1", 3)], 5);
        let plan = two_stage_plan(&[1, 2]);
        let edge = plan.stages()[0].id;
        let edge = plan.outgoing_edges(edge).next().unwrap().id;
        let producer = plan.stages()[0].task_groups[0].id;
        let consumers: Vec<TaskGroupId> = plan.stages()[1]
            .task_groups
            .iter()
            .map(|group| group.id)
            .collect();
        let state = harness.scheduler.schedule_job(plan).unwrap();

        // The producer completes and commits its partition on a1.
        let (executor_id, task_group_id, _) = harness.next_launch().await;
        assert_eq!(task_group_id, producer);
        harness
            .partitions
            .on_partition_state_changed(
                PartitionId::new(edge, 0),
                PartitionState::Committed,
                Some(executor_id.clone()),
                None,
            )
            .unwrap();
        harness
            .scheduler
            .on_task_group_state_changed(&executor_id, producer, TaskGroupState::Complete, None)
            .unwrap();

        // Both consumers start executing on a1.
        for _ in 0..2 {
            harness.next_launch().await;
        }
        for &consumer in &consumers {
            assert_eq!(
                state.task_group_state(consumer).unwrap(),
                TaskGroupState::Executing
            );
        }

        harness
            .scheduler
            .on_executor_removed(&ExecutorId::from("a1"))
            .unwrap();

        // The running consumers were failed over and requeued.
        for &consumer in &consumers {
            assert_eq!(
                state.task_group_state(consumer).unwrap(),
                TaskGroupState::Ready
            );
        }
        // The committed partition is lost, and its completed producer is
        // requeued even though it had already completed.
        assert_eq!(
            harness
                .partitions
                .get_partition_state(PartitionId::new(edge, 0))
                .unwrap(),
            PartitionState::Scheduled
        );
        assert_eq!(
            state.task_group_state(producer).unwrap(),
            TaskGroupState::Ready
        );
        // The job is still recoverable.
        assert_eq!(state.job_state().unwrap(), JobState::Executing);
        harness.scheduler.terminate().unwrap();
    }

    #[tokio::test]
    async fn test_exhausted_attempts_fail_the_job() {
        let mut harness = Harness::new(&[("a1", 1)], 3);
        let plan = two_stage_plan(&[1]);
        let group = plan.stages()[0].task_groups[0].id;
        let task = plan.stages()[0].task_groups[0].tasks[0].id;
        let state = harness.scheduler.schedule_job(plan).unwrap();

        for attempt in 1..=3 {
            let (executor_id, task_group_id, launched_attempt) = harness.next_launch().await;
            assert_eq!(task_group_id, group);
            assert_eq!(launched_attempt, attempt);
            harness
                .scheduler
                .on_task_group_state_changed(
                    &executor_id,
                    group,
                    TaskGroupState::FailedRecoverable,
                    Some(task),
                )
                .unwrap();
        }
        assert_eq!(
            state.task_group_state(group).unwrap(),
            TaskGroupState::FailedUnrecoverable
        );
        assert_eq!(state.job_state().unwrap(), JobState::Failed);
        // No further scheduling attempt occurs.
        harness.expect_no_launch().await;
        harness.scheduler.terminate().unwrap();
    }

    #[tokio::test]
    async fn test_unrecoverable_report_aborts_the_job() {
        let mut harness = Harness::new(&[("a1", 1)], 3);
        let plan = two_stage_plan(&[1, 1]);
        let group = plan.stages()[0].task_groups[0].id;
        let state = harness.scheduler.schedule_job(plan).unwrap();
        let (executor_id, _, _) = harness.next_launch().await;
        harness
            .scheduler
            .on_task_group_state_changed(
                &executor_id,
                group,
                TaskGroupState::FailedUnrecoverable,
                None,
            )
            .unwrap();
        assert_eq!(state.job_state().unwrap(), JobState::Failed);
        harness.expect_no_launch().await;
        harness.scheduler.terminate().unwrap();
    }

    #[tokio::test]
    async fn test_second_job_while_executing_is_rejected() {
        let harness = Harness::new(&[("a1", 1)], 3);
        harness.scheduler.schedule_job(two_stage_plan(&[1])).unwrap();
        let plan = {
            // A distinct plan with non-colliding ids would be accepted once
            // the first job finishes; while it runs, any submission fails.
            two_stage_plan(&[1])
        };
        let result = harness.scheduler.schedule_job(plan);
        assert!(matches!(result, Err(RuntimeError::InvalidArgument(_))));
        harness.scheduler.terminate().unwrap();
    }
}
