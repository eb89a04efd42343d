use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use relive_types::{TaskId, TaskState};

#[derive(Debug)]
struct TaskSlot {
    id: TaskId,
    state: AtomicU8,
    pending: AtomicBool,
}

/// A task known to the gradual transition. The host keeps one per thread
/// of execution and passes it to `redirect` on every patched call.
#[derive(Debug, Clone)]
pub struct TaskHandle(Arc<TaskSlot>);

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.0.id
    }

    pub fn state(&self) -> TaskState {
        TaskState::from_u8(self.0.state.load(Ordering::Acquire))
    }

    pub fn pending(&self) -> bool {
        self.0.pending.load(Ordering::Acquire)
    }

    pub(crate) fn set_state(&self, state: TaskState) {
        self.0.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn set_pending(&self, pending: bool) {
        self.0.pending.store(pending, Ordering::Release);
    }

    /// Moves the task to `target` and clears its pending flag.
    pub(crate) fn switch(&self, target: TaskState) {
        self.set_state(target);
        self.set_pending(false);
    }
}

#[derive(Debug)]
pub(crate) struct TaskTable {
    tasks: RwLock<HashMap<TaskId, TaskHandle>>,
    target: AtomicU8,
}

impl TaskTable {
    pub fn new() -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            target: AtomicU8::new(TaskState::Undefined as u8),
        }
    }

    pub fn target(&self) -> TaskState {
        TaskState::from_u8(self.target.load(Ordering::Acquire))
    }

    /// New tasks start in the target state of a running transition, they
    /// can't be inside any of its functions yet.
    pub fn attach(&self, id: TaskId) -> TaskHandle {
        let mut tasks = self.tasks.write();
        let handle = tasks
            .entry(id)
            .or_insert_with(|| {
                TaskHandle(Arc::new(TaskSlot {
                    id,
                    state: AtomicU8::new(TaskState::Undefined as u8),
                    pending: AtomicBool::new(false),
                }))
            })
            .clone();
        handle.switch(self.target());
        handle
    }

    pub fn detach(&self, id: TaskId) -> Option<TaskHandle> {
        self.tasks.write().remove(&id)
    }

    pub fn get(&self, id: TaskId) -> Option<TaskHandle> {
        self.tasks.read().get(&id).cloned()
    }

    pub fn all(&self) -> Vec<TaskHandle> {
        self.tasks.read().values().cloned().collect()
    }

    /// Sets up a transition towards `target`: every task starts out in
    /// the opposite state.
    pub fn init(&self, target: TaskState) {
        self.target.store(target as u8, Ordering::Release);
        for task in self.tasks.read().values() {
            task.switch(target.flip());
        }
    }

    /// Points a running transition the other way. Pending flags are
    /// cleared, `start` marks the tasks again.
    pub fn retarget(&self, target: TaskState) {
        for task in self.tasks.read().values() {
            task.set_pending(false);
        }
        self.target.store(target as u8, Ordering::Release);
    }

    /// Marks every task not yet in the target state as pending.
    pub fn start(&self) {
        let target = self.target();
        for task in self.tasks.read().values() {
            task.set_pending(task.state() != target);
        }
    }

    /// Back to the idle state once a transition is over.
    pub fn reset(&self) {
        self.target
            .store(TaskState::Undefined as u8, Ordering::Release);
        for task in self.tasks.read().values() {
            task.switch(TaskState::Undefined);
        }
    }

    pub fn pending(&self) -> Vec<TaskHandle> {
        self.tasks
            .read()
            .values()
            .filter(|t| t.pending())
            .cloned()
            .collect()
    }
}
