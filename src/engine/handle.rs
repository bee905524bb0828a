use std::marker::PhantomData;
use std::sync::Arc;

use crate::engine::task::Task;

/// A typed view of a task's eventual output.
///
/// A `Deferred<T>` is what you get back when you want to hand the result of a
/// task to someone who only cares about the value. It can be used as a
/// predecessor like any other task through [`task`](Self::task), and once the
/// task succeeded [`get`](Self::get) yields the value.
#[derive(Debug)]
pub struct Deferred<T> {
    task: Task,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Deferred<T>
where
    T: Send + Sync + 'static,
{
    /// Wraps a task whose function returns `T`.
    pub fn new<F>(name: &str, function: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        Self::from_task(Task::named(name, function))
    }

    pub(crate) fn from_task(task: Task) -> Self {
        Self {
            task,
            _phantom: PhantomData,
        }
    }

    /// Returns the underlying task.
    pub fn task(&self) -> &Task {
        &self.task
    }

    /// The output, if the task has succeeded.
    pub fn get(&self) -> Option<Arc<T>> {
        self.task.output::<T>()
    }
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            task: self.task.clone(),
            _phantom: PhantomData,
        }
    }
}

impl<T> From<Deferred<T>> for Task {
    fn from(deferred: Deferred<T>) -> Self {
        deferred.task
    }
}
