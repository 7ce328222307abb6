use std::collections::HashMap;
use std::sync::Mutex;

use indexmap::IndexMap;
use log::{debug, info, warn};

use crate::error::{RuntimeError, RuntimeResult};
use crate::id::{StageId, TaskGroupId, TaskId};
use crate::plan::PhysicalPlan;
use crate::state::{
    JobState, StageState, StateMachine, TaskGroupState, TaskState, StateSpec,
};

/// What the caller must do after a task-group transition has been applied.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum JobProgress {
    Continue,
    /// The owning stage just completed; the scheduler may advance the
    /// schedule group.
    StageCompleted(StageId),
    JobCompleted,
    JobFailed,
}

/// Tracks the full state tree of one running job: job, stages, task groups,
/// and tasks. This component only records state and reports aggregate
/// completion upward; retry and recompute decisions belong to the scheduler.
pub struct JobStateManager {
    tree: Mutex<StateTree>,
}

struct StateTree {
    job: StateMachine<JobState>,
    stages: IndexMap<StageId, StageRecord>,
    task_groups: HashMap<TaskGroupId, TaskGroupRecord>,
}

struct StageRecord {
    state: StateMachine<StageState>,
    schedule_group: usize,
    /// Task groups of this stage that have not reached COMPLETE.
    outstanding: usize,
}

struct TaskGroupRecord {
    stage: StageId,
    state: StateMachine<TaskGroupState>,
    tasks: IndexMap<TaskId, StateMachine<TaskState>>,
}

impl JobStateManager {
    /// Flattens the plan into job, stage, task-group and task records, all
    /// initialized to READY.
    pub fn new(plan: &PhysicalPlan) -> Self {
        let mut stages = IndexMap::new();
        let mut task_groups = HashMap::new();
        for stage in plan.stages() {
            stages.insert(
                stage.id,
                StageRecord {
                    state: StateMachine::new(StageState::Ready),
                    schedule_group: stage.schedule_group,
                    outstanding: stage.task_groups.len(),
                },
            );
            for group in &stage.task_groups {
                let tasks = group
                    .tasks
                    .iter()
                    .map(|task| (task.id, StateMachine::new(TaskState::Ready)))
                    .collect();
                task_groups.insert(
                    group.id,
                    TaskGroupRecord {
                        stage: stage.id,
                        state: StateMachine::new(TaskGroupState::Ready),
                        tasks,
                    },
                );
            }
        }
        Self {
            tree: Mutex::new(StateTree {
                job: StateMachine::new(JobState::Ready),
                stages,
                task_groups,
            }),
        }
    }

    /// Marks a stage as executing when its schedule group is entered; the
    /// first executing stage also moves the job to EXECUTING, and a completed
    /// stage re-enters EXECUTING when its output must be recomputed.
    pub fn on_stage_executing(&self, stage_id: StageId) -> RuntimeResult<()> {
        let mut tree = self.tree.lock()?;
        if tree.job.current_state() == JobState::Ready {
            tree.job.set_state(JobState::Executing)?;
        }
        let stage = Self::stage_record(&mut tree, stage_id)?;
        if stage.state.current_state() != StageState::Executing {
            stage.state.set_state(StageState::Executing)?;
        }
        Ok(())
    }

    /// Validates and applies a task-group transition, mirrors it onto the
    /// nested tasks, and reports the aggregate effect.
    pub fn on_task_group_state_changed(
        &self,
        task_group_id: TaskGroupId,
        new_state: TaskGroupState,
        failed_task: Option<TaskId>,
    ) -> RuntimeResult<JobProgress> {
        let mut tree = self.tree.lock()?;
        let record = tree.task_groups.get_mut(&task_group_id).ok_or_else(|| {
            RuntimeError::InvalidArgument(format!("unknown task group {task_group_id}"))
        })?;
        let previous = record.state.current_state();
        record.state.set_state(new_state)?;
        debug!("task group {task_group_id}: {previous} -> {new_state}");
        let stage_id = record.stage;
        match new_state {
            TaskGroupState::Executing => {
                Self::mirror_tasks(record, TaskState::Executing, None);
                Ok(JobProgress::Continue)
            }
            TaskGroupState::Ready => {
                Self::mirror_tasks(record, TaskState::Ready, None);
                Ok(JobProgress::Continue)
            }
            TaskGroupState::Complete => {
                Self::mirror_tasks(record, TaskState::Complete, None);
                let stage = Self::stage_record(&mut tree, stage_id)?;
                stage.outstanding -= 1;
                if stage.outstanding > 0 {
                    return Ok(JobProgress::Continue);
                }
                stage.state.set_state(StageState::Complete)?;
                info!("stage {stage_id} is complete");
                let all_complete = tree
                    .stages
                    .values()
                    .all(|stage| stage.state.current_state() == StageState::Complete);
                if all_complete {
                    tree.job.set_state(JobState::Complete)?;
                    info!("job is complete");
                    Ok(JobProgress::JobCompleted)
                } else {
                    Ok(JobProgress::StageCompleted(stage_id))
                }
            }
            TaskGroupState::FailedRecoverable => {
                if let Some(task_id) = failed_task {
                    warn!("task {task_id} of task group {task_group_id} failed");
                }
                Self::mirror_tasks(record, TaskState::FailedRecoverable, failed_task);
                if previous == TaskGroupState::Complete {
                    // The group's committed output was lost after the stage
                    // finished; the stage has work outstanding again.
                    let stage = Self::stage_record(&mut tree, stage_id)?;
                    stage.outstanding += 1;
                    if stage.state.current_state() == StageState::Complete {
                        stage.state.set_state(StageState::Executing)?;
                    }
                }
                Ok(JobProgress::Continue)
            }
            TaskGroupState::FailedUnrecoverable => {
                Self::mirror_tasks(record, TaskState::FailedUnrecoverable, failed_task);
                let stage = Self::stage_record(&mut tree, stage_id)?;
                stage.state.set_state(StageState::Failed)?;
                tree.job.set_state(JobState::Failed)?;
                Ok(JobProgress::JobFailed)
            }
        }
    }

    /// Non-blocking poll of the aggregate job state.
    pub fn job_state(&self) -> RuntimeResult<JobState> {
        let tree = self.tree.lock()?;
        Ok(tree.job.current_state())
    }

    pub fn stage_state(&self, stage_id: StageId) -> RuntimeResult<StageState> {
        let mut tree = self.tree.lock()?;
        Ok(Self::stage_record(&mut tree, stage_id)?.state.current_state())
    }

    pub fn task_group_state(&self, task_group_id: TaskGroupId) -> RuntimeResult<TaskGroupState> {
        let tree = self.tree.lock()?;
        tree.task_groups
            .get(&task_group_id)
            .map(|record| record.state.current_state())
            .ok_or_else(|| {
                RuntimeError::InvalidArgument(format!("unknown task group {task_group_id}"))
            })
    }

    pub fn task_state(&self, task_group_id: TaskGroupId, task_id: TaskId) -> RuntimeResult<TaskState> {
        let tree = self.tree.lock()?;
        tree.task_groups
            .get(&task_group_id)
            .and_then(|record| record.tasks.get(&task_id))
            .map(|machine| machine.current_state())
            .ok_or_else(|| RuntimeError::InvalidArgument(format!("unknown task {task_id}")))
    }

    pub fn is_schedule_group_complete(&self, schedule_group: usize) -> RuntimeResult<bool> {
        let tree = self.tree.lock()?;
        Ok(tree
            .stages
            .values()
            .filter(|stage| stage.schedule_group == schedule_group)
            .all(|stage| stage.state.current_state() == StageState::Complete))
    }

    fn stage_record(tree: &mut StateTree, stage_id: StageId) -> RuntimeResult<&mut StageRecord> {
        tree.stages
            .get_mut(&stage_id)
            .ok_or_else(|| RuntimeError::InvalidArgument(format!("unknown stage {stage_id}")))
    }

    /// Applies a group-level transition to the tasks it contains, skipping
    /// tasks for which the transition is not meaningful (e.g. a task that
    /// never started when its group is demoted).
    fn mirror_tasks(record: &mut TaskGroupRecord, target: TaskState, failed_task: Option<TaskId>) {
        for (task_id, machine) in record.tasks.iter_mut() {
            if machine.current_state() == target {
                continue;
            }
            if machine.current_state().can_transition(target) {
                let _ = machine.set_state(target);
            } else if failed_task == Some(*task_id) {
                warn!(
                    "task {task_id} cannot move from {} to {target}",
                    machine.current_state()
                );
            }
        }
    }
}
