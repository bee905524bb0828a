//! The scheduler: tasks with explicit predecessor and completion edges,
//! executed on fixed-size thread pools.

mod current;
mod handle;
mod pool;
mod task;

pub use crate::engine::current::{attach, current};
pub use crate::engine::handle::Deferred;
pub use crate::engine::pool::ThreadPool;
pub use crate::engine::task::{Task, TaskState};

pub(crate) use crate::engine::pool::default_size;
