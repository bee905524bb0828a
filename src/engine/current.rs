use std::cell::RefCell;

use crate::engine::task::Task;
use crate::error::TaskError;

thread_local! {
    static CURRENT: RefCell<Option<Task>> = const { RefCell::new(None) };
}

/// Restores the previously current task when dropped.
pub(crate) struct CurrentGuard {
    previous: Option<Task>,
}

/// Marks `task` as the one executing on this thread until the guard drops.
/// Nested inline tasks shadow the outer one and hand it back afterwards.
pub(crate) fn enter(task: Task) -> CurrentGuard {
    let previous = CURRENT.with(|current| current.replace(Some(task)));
    CurrentGuard { previous }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

/// Returns the task whose function is executing on the calling thread, if
/// any. Outside of a task function this is `None`.
pub fn current() -> Option<Task> {
    CURRENT.with(|current| current.borrow().clone())
}

/// Delays completion of the current task until `children` have completed.
///
/// Returns `Ok(false)` when called outside of a task function, in which case
/// nothing is attached.
pub fn attach(children: &[Task]) -> Result<bool, TaskError> {
    match current() {
        Some(task) => task.complete_after(children).map(|_| true),
        None => Ok(false),
    }
}
