use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::error::RuntimeResult;
use crate::id::TaskGroupId;
use crate::plan::TaskGroup;

/// One scheduling attempt of a task group waiting for dispatch.
#[derive(Debug, Clone)]
pub struct PendingTaskGroup {
    pub task_group: TaskGroup,
    pub attempt: usize,
}

/// The FIFO work queue feeding the dispatch loop. Enqueueing is idempotent
/// per task group id, so recovery paths can re-enqueue without checking for
/// duplicates first.
pub struct PendingTaskGroupQueue {
    inner: Mutex<QueueFields>,
    available: Notify,
}

struct QueueFields {
    queue: VecDeque<PendingTaskGroup>,
    enqueued: HashSet<TaskGroupId>,
    closed: bool,
}

impl PendingTaskGroupQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueFields {
                queue: VecDeque::new(),
                enqueued: HashSet::new(),
                closed: false,
            }),
            available: Notify::new(),
        }
    }

    /// Adds the task group to the back of the queue. Returns `false` when it
    /// is already enqueued or the queue has been closed.
    pub fn enqueue(&self, pending: PendingTaskGroup) -> RuntimeResult<bool> {
        let mut inner = self.inner.lock()?;
        if inner.closed || !inner.enqueued.insert(pending.task_group.id) {
            return Ok(false);
        }
        inner.queue.push_back(pending);
        drop(inner);
        self.available.notify_one();
        Ok(true)
    }

    pub fn contains(&self, task_group_id: TaskGroupId) -> RuntimeResult<bool> {
        let inner = self.inner.lock()?;
        Ok(inner.enqueued.contains(&task_group_id))
    }

    /// Takes the task group at the front, waiting until one is available.
    /// Returns `None` once the queue is closed.
    pub async fn take_first(&self) -> Option<PendingTaskGroup> {
        loop {
            let notified = self.available.notified();
            {
                let mut inner = self.inner.lock().ok()?;
                if let Some(pending) = inner.queue.pop_front() {
                    inner.enqueued.remove(&pending.task_group.id);
                    return Some(pending);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn close(&self) -> RuntimeResult<()> {
        let mut inner = self.inner.lock()?;
        inner.closed = true;
        drop(inner);
        self.available.notify_waiters();
        Ok(())
    }
}

impl Default for PendingTaskGroupQueue {
    fn default() -> Self {
        Self::new()
    }
}
