use relive_types::{Addr, TaskId};

use crate::host::{Calltrace, StackError};

/// Calltrace of the calling thread, unwound with `backtrace`. Only the
/// thread's own task can be walked; any other task reads as running.
#[derive(Debug, Clone, Copy)]
pub struct LocalCalltrace {
    task: TaskId,
}

impl LocalCalltrace {
    pub fn new(task: TaskId) -> Self {
        Self { task }
    }
}

impl Calltrace for LocalCalltrace {
    fn tasks(&self) -> Vec<TaskId> {
        vec![self.task]
    }

    fn walk(&self, task: TaskId, f: &mut dyn FnMut(Addr) -> bool) -> Result<(), StackError> {
        if task != self.task {
            return Err(StackError::Running);
        }

        let mut frames = 0;
        backtrace::trace(|frame| {
            frames += 1;
            f(Addr(frame.ip() as u64))
        });
        if frames == 0 {
            return Err(StackError::Unreliable);
        }
        Ok(())
    }
}
