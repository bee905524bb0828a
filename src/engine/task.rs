use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::core::{ArcStr, Dynamic, lock};
use crate::engine::current;
use crate::engine::pool::{ThreadPool, panic_message};
use crate::error::{TaskError, TaskFailure};

type Function = Box<dyn FnOnce(&Task) -> anyhow::Result<Dynamic> + Send>;
type Callback = Box<dyn FnOnce(&Task) + Send>;

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Lifecycle of a [`Task`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Created but neither `start` nor `start_after` has been called.
    Unstarted,
    /// Waiting for predecessors to complete.
    Waiting,
    /// Submitted to a thread pool.
    Queued,
    /// The function is executing, or it has returned and the task is waiting
    /// for tasks passed to [`Task::complete_after`].
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

enum Dispatch {
    Pool(ThreadPool),
    Inline,
}

struct State {
    status: TaskState,
    started: bool,
    function: Option<Function>,
    dispatch: Option<Dispatch>,
    /// Predecessors that have not completed yet.
    waiting_on: usize,
    /// The running function plus every unfinished `complete_after` task.
    deferred: usize,
    returned: Option<Result<Dynamic, TaskFailure>>,
    child_failed: bool,
    cancel_requested: bool,
    callbacks: Vec<Callback>,
    outcome: Option<Result<Dynamic, TaskFailure>>,
    /// Set once the callbacks registered before completion have run.
    settled: bool,
}

struct Inner {
    id: u64,
    name: Option<ArcStr>,
    state: Mutex<State>,
    done: Condvar,
}

/// A unit of asynchronous work.
///
/// A task wraps a function and runs it at most once, on a [`ThreadPool`] or
/// inline on the thread that activates it. Tasks are ordered only through
/// explicit edges:
///
/// * [`start_after`](Self::start_after) delays a task until all of its
///   predecessors completed. If any of them failed the task fails without
///   running its function.
/// * [`complete_after`](Self::complete_after) keeps a running task from
///   completing until the given tasks have completed. If any of them failed
///   the task fails even if its own function succeeded.
///
/// No worker thread ever blocks on another task: every edge is resolved by a
/// completion callback. `Task` is a cheap handle; clones refer to the same
/// task.
#[derive(Clone)]
pub struct Task {
    inner: Arc<Inner>,
}

impl Task {
    /// Creates a task wrapping `function`. Its return value becomes the
    /// task's output, see [`output`](Self::output).
    pub fn new<F, T>(function: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + Sync + 'static,
    {
        Self::create(None, Some(erase(move |_| function())))
    }

    /// Like [`new`](Self::new) with a name shown in logs and diagnostics.
    pub fn named<F, T>(name: impl Into<ArcStr>, function: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
        T: Send + Sync + 'static,
    {
        Self::create(Some(name.into()), Some(erase(move |_| function())))
    }

    /// Creates a task whose function receives a handle to the task itself, so
    /// it can defer its own completion without going through
    /// [`current`](crate::engine::current).
    pub fn with_handle<F, T>(name: impl Into<ArcStr>, function: F) -> Self
    where
        F: FnOnce(&Task) -> anyhow::Result<T> + Send + 'static,
        T: Send + Sync + 'static,
    {
        Self::create(Some(name.into()), Some(erase(function)))
    }

    /// Creates a task without a function, used only to group other tasks.
    pub fn group() -> Self {
        Self::create(None, None)
    }

    /// Returns a task that completes once every task in `tasks` has
    /// completed. It succeeds only if all of them succeeded.
    pub fn join(tasks: impl IntoIterator<Item = Task>) -> Self {
        let tasks: Vec<Task> = tasks.into_iter().collect();
        let join = Self::with_handle("join", move |this| -> anyhow::Result<()> {
            this.complete_after(&tasks)?;
            Ok(())
        });

        {
            let mut state = lock(&join.inner.state);
            state.started = true;
        }
        join.activate(Dispatch::Inline);

        join
    }

    fn create(name: Option<ArcStr>, function: Option<Function>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
                name,
                state: Mutex::new(State {
                    status: TaskState::Unstarted,
                    started: false,
                    function,
                    dispatch: None,
                    waiting_on: 0,
                    deferred: 0,
                    returned: None,
                    child_failed: false,
                    cancel_requested: false,
                    callbacks: Vec::new(),
                    outcome: None,
                    settled: false,
                }),
                done: Condvar::new(),
            }),
        }
    }

    /// Returns the task whose function is executing on the calling thread.
    pub fn current() -> Option<Task> {
        current::current()
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    pub fn state(&self) -> TaskState {
        lock(&self.inner.state).status
    }

    pub fn started(&self) -> bool {
        lock(&self.inner.state).started
    }

    /// True once the task reached a terminal state and every callback
    /// registered before that has run.
    pub fn completed(&self) -> bool {
        lock(&self.inner.state).settled
    }

    pub fn succeeded(&self) -> bool {
        self.state() == TaskState::Succeeded
    }

    /// True for failed and cancelled tasks.
    pub fn failed(&self) -> bool {
        matches!(self.state(), TaskState::Failed | TaskState::Cancelled)
    }

    /// The reason this task failed, once it has.
    pub fn failure(&self) -> Option<TaskFailure> {
        match &lock(&self.inner.state).outcome {
            Some(Err(failure)) => Some(failure.clone()),
            _ => None,
        }
    }

    /// The value returned by the task's function, once the task succeeded.
    /// Returns `None` if the output is not a `T`.
    pub fn output<T>(&self) -> Option<Arc<T>>
    where
        T: Send + Sync + 'static,
    {
        match &lock(&self.inner.state).outcome {
            Some(Ok(output)) => output.clone().downcast::<T>().ok(),
            _ => None,
        }
    }

    /// Queues the task on `pool`.
    pub fn start(&self, pool: &ThreadPool) -> Result<(), TaskError> {
        self.schedule(&[], Dispatch::Pool(pool.clone()))
    }

    /// Runs the task right away on the calling thread.
    pub fn start_inline(&self) -> Result<(), TaskError> {
        self.schedule(&[], Dispatch::Inline)
    }

    /// Queues the task on `pool` once every predecessor has completed.
    pub fn start_after(&self, predecessors: &[Task], pool: &ThreadPool) -> Result<(), TaskError> {
        self.schedule(predecessors, Dispatch::Pool(pool.clone()))
    }

    /// Runs the task on whichever thread completes the last predecessor, or
    /// on the calling thread if they have all completed already.
    pub fn start_after_inline(&self, predecessors: &[Task]) -> Result<(), TaskError> {
        self.schedule(predecessors, Dispatch::Inline)
    }

    fn schedule(&self, predecessors: &[Task], dispatch: Dispatch) -> Result<(), TaskError> {
        {
            let mut state = lock(&self.inner.state);
            if state.started {
                return Err(TaskError::AlreadyStarted);
            }
            state.started = true;

            // Cancelled before anyone got to start it.
            if state.status.is_terminal() {
                return Ok(());
            }

            if !predecessors.is_empty() {
                state.status = TaskState::Waiting;
                state.waiting_on = predecessors.len();
                state.dispatch = Some(dispatch);
            } else {
                drop(state);
                self.activate(dispatch);
                return Ok(());
            }
        }

        for predecessor in predecessors {
            let this = self.clone();
            predecessor.add_callback(move |predecessor| {
                this.on_predecessor(predecessor.succeeded());
            });
        }

        Ok(())
    }

    fn on_predecessor(&self, succeeded: bool) {
        let dispatch = {
            let mut state = lock(&self.inner.state);
            if state.status != TaskState::Waiting {
                return;
            }

            if !succeeded {
                tracing::debug!(target: "kiln::task", "{} skipped, a predecessor failed", self);
                state.function = None;
                state.dispatch = None;
                self.finish(state, Err(TaskFailure::PredecessorFailed));
                return;
            }

            state.waiting_on -= 1;
            if state.waiting_on > 0 {
                return;
            }

            state.dispatch.take()
        };

        if let Some(dispatch) = dispatch {
            self.activate(dispatch);
        }
    }

    fn activate(&self, dispatch: Dispatch) {
        match dispatch {
            Dispatch::Inline => self.run(),
            Dispatch::Pool(pool) => {
                {
                    let mut state = lock(&self.inner.state);
                    if state.status.is_terminal() {
                        return;
                    }
                    state.status = TaskState::Queued;
                }

                let this = self.clone();
                if let Err(err) = pool.submit(move || this.run()) {
                    let mut state = lock(&self.inner.state);
                    if state.status.is_terminal() {
                        return;
                    }
                    state.function = None;
                    self.finish(state, Err(TaskFailure::Rejected(err)));
                }
            }
        }
    }

    fn run(&self) {
        let function = {
            let mut state = lock(&self.inner.state);
            // Cancelled while queued.
            if state.status.is_terminal() {
                return;
            }
            state.status = TaskState::Running;
            state.deferred += 1;
            state.function.take()
        };

        let returned = match function {
            None => Ok(Arc::new(()) as Dynamic),
            Some(function) => {
                let _current = current::enter(self.clone());
                match panic::catch_unwind(AssertUnwindSafe(|| function(self))) {
                    Ok(Ok(output)) => Ok(output),
                    Ok(Err(err)) => Err(TaskFailure::from(err)),
                    Err(payload) => Err(TaskFailure::Panicked(panic_message(&*payload))),
                }
            }
        };

        if let Err(failure) = &returned {
            tracing::debug!(target: "kiln::task", "{} failed: {}", self, failure);
        }

        self.settle(move |state| state.returned = Some(returned));
    }

    /// Keeps this running task from completing until every task in `others`
    /// has completed. May be called repeatedly while the task is running,
    /// including after its function returned.
    pub fn complete_after(&self, others: &[Task]) -> Result<(), TaskError> {
        {
            let mut state = lock(&self.inner.state);
            if state.status != TaskState::Running {
                return Err(TaskError::NotRunning);
            }
            state.deferred += others.len();
        }

        for other in others {
            let this = self.clone();
            other.add_callback(move |other| {
                let failed = other.failed();
                this.settle(move |state| state.child_failed |= failed);
            });
        }

        Ok(())
    }

    fn settle(&self, update: impl FnOnce(&mut State)) {
        let mut state = lock(&self.inner.state);
        update(&mut state);
        state.deferred -= 1;

        if state.deferred > 0 || state.status.is_terminal() {
            return;
        }

        let outcome = if state.cancel_requested {
            Err(TaskFailure::Cancelled)
        } else {
            match state.returned.take() {
                Some(Err(failure)) => Err(failure),
                _ if state.child_failed => Err(TaskFailure::ChildFailed),
                Some(Ok(output)) => Ok(output),
                None => Ok(Arc::new(()) as Dynamic),
            }
        };

        self.finish(state, outcome);
    }

    /// Cancels a task that has not completed yet.
    ///
    /// A task that has not started running completes immediately as
    /// cancelled and its function never runs. A running task keeps running,
    /// but its result is discarded and it completes as cancelled.
    pub fn cancel(&self) -> Result<(), TaskError> {
        let mut state = lock(&self.inner.state);
        let status = state.status;
        match status {
            status if status.is_terminal() => Err(TaskError::AlreadyCompleted),
            TaskState::Running => {
                state.cancel_requested = true;
                Ok(())
            }
            _ => {
                state.function = None;
                state.dispatch = None;
                self.finish(state, Err(TaskFailure::Cancelled));
                Ok(())
            }
        }
    }

    /// Registers `callback` to run once the task has completed. If it has
    /// completed already, `callback` runs immediately on the calling thread.
    pub fn add_callback<F>(&self, callback: F)
    where
        F: FnOnce(&Task) + Send + 'static,
    {
        let mut state = lock(&self.inner.state);
        if state.status.is_terminal() {
            drop(state);
            callback(self);
        } else {
            state.callbacks.push(Box::new(callback));
        }
    }

    /// Blocks the calling thread until the task has completed.
    ///
    /// Meant for the top-level driver. Calling it from inside a task running
    /// on a pool ties up a worker.
    pub fn wait(&self) {
        let state = lock(&self.inner.state);
        let _state = self
            .inner
            .done
            .wait_while(state, |state| !state.settled)
            .unwrap_or_else(PoisonError::into_inner);
    }

    /// Like [`wait`](Self::wait), giving up after `timeout`. Returns whether
    /// the task completed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let state = lock(&self.inner.state);
        let (state, _) = self
            .inner
            .done
            .wait_timeout_while(state, timeout, |state| !state.settled)
            .unwrap_or_else(PoisonError::into_inner);

        state.settled
    }

    pub fn ptr_eq(&self, other: &Task) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Moves the task into its terminal state and runs its callbacks, then
    /// wakes waiters. The callbacks run after the lock is released.
    fn finish(&self, mut state: MutexGuard<'_, State>, outcome: Result<Dynamic, TaskFailure>) {
        state.status = match &outcome {
            Ok(_) => TaskState::Succeeded,
            Err(TaskFailure::Cancelled) => TaskState::Cancelled,
            Err(_) => TaskState::Failed,
        };
        state.outcome = Some(outcome);

        let callbacks = std::mem::take(&mut state.callbacks);
        drop(state);

        for callback in callbacks {
            callback(self);
        }

        lock(&self.inner.state).settled = true;
        self.inner.done.notify_all();
    }
}

fn erase<F, T>(function: F) -> Function
where
    F: FnOnce(&Task) -> anyhow::Result<T> + Send + 'static,
    T: Send + Sync + 'static,
{
    Box::new(move |task| function(task).map(|output| Arc::new(output) as Dynamic))
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner.name {
            Some(name) => write!(f, "task '{}' (#{})", name, self.inner.id),
            None => write!(f, "task #{}", self.inner.id),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}
