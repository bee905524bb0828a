use std::any::Any;
use std::num::NonZeroUsize;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::core::{ArcStr, lock};
use crate::error::PoolError;

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Job),
    Exit,
}

/// A fixed set of worker threads draining a shared job queue.
///
/// Cloning a `ThreadPool` yields another handle to the same workers. The
/// workers are stopped when [`shutdown`](Self::shutdown) is called or when the
/// last handle is dropped.
///
/// Jobs are independent closures. The pool makes no ordering promise between
/// them; anything that must happen in order has to be expressed with task
/// predecessors.
#[derive(Clone)]
pub struct ThreadPool {
    inner: Arc<Inner>,
}

struct Inner {
    name: ArcStr,
    size: usize,
    /// `None` once the pool has been shut down.
    sender: Mutex<Option<Sender<Message>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    outstanding: Arc<AtomicUsize>,
}

impl ThreadPool {
    /// Starts `size` worker threads named `<name>-<n>`. A size of zero is
    /// treated as one.
    pub fn new(name: impl Into<ArcStr>, size: usize) -> std::io::Result<Self> {
        let name = name.into();
        let size = size.max(1);
        let (sender, receiver) = unbounded::<Message>();
        let outstanding = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(size);
        for n in 0..size {
            let receiver = receiver.clone();
            let outstanding = outstanding.clone();
            let pool = name.clone();

            let handle = thread::Builder::new()
                .name(format!("{name}-{n}"))
                .spawn(move || work(&pool, receiver, outstanding))?;

            workers.push(handle);
        }

        tracing::debug!(target: "kiln::task", "started pool {} with {} workers", name, size);

        Ok(Self {
            inner: Arc::new(Inner {
                name,
                size,
                sender: Mutex::new(Some(sender)),
                workers: Mutex::new(workers),
                outstanding,
            }),
        })
    }

    /// Creates a pool with one worker per available CPU.
    pub fn with_default_size(name: impl Into<ArcStr>) -> std::io::Result<Self> {
        Self::new(name, default_size())
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    /// The number of jobs queued or currently executing.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner.sender).is_none()
    }

    /// Queues a job. A panic escaping the job is caught and logged by the
    /// worker; it never reaches the caller.
    pub fn submit<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = lock(&self.inner.sender);
        let sender = sender.as_ref().ok_or(PoolError::Closed)?;

        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        if sender.send(Message::Run(Box::new(job))).is_err() {
            self.inner.outstanding.fetch_sub(1, Ordering::AcqRel);
            return Err(PoolError::Closed);
        }

        Ok(())
    }

    /// Lets every queued job finish, then stops and joins the workers.
    ///
    /// Calling this more than once, or from one of the pool's own workers, is
    /// allowed. A worker never joins itself.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

impl Inner {
    fn shutdown(&self) {
        let Some(sender) = lock(&self.sender).take() else {
            return;
        };

        // Exit messages go to the back of the queue, so earlier jobs still run.
        for _ in 0..self.size {
            let _ = sender.send(Message::Exit);
        }
        drop(sender);

        let current = thread::current().id();
        let workers = std::mem::take(&mut *lock(&self.workers));

        for worker in workers {
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                tracing::error!("worker thread of pool {} terminated abnormally", self.name);
            }
        }

        tracing::debug!(target: "kiln::task", "pool {} shut down", self.name);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("name", &self.inner.name)
            .field("size", &self.inner.size)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

fn work(pool: &str, receiver: Receiver<Message>, outstanding: Arc<AtomicUsize>) {
    while let Ok(message) = receiver.recv() {
        match message {
            Message::Run(job) => {
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(job)) {
                    tracing::error!("uncaught panic in pool {}: {}", pool, panic_message(&*payload));
                }
                outstanding.fetch_sub(1, Ordering::AcqRel);
            }
            Message::Exit => break,
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        String::from("unknown panic payload")
    }
}

pub(crate) fn default_size() -> usize {
    thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1)
}
