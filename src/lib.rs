#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod builder;
mod cache;
mod config;
mod core;
mod diagnostics;
pub mod engine;
mod error;
#[cfg(feature = "logging")]
pub mod logging;
pub mod state;

pub use crate::builder::{ActionContext, ActionDef, Engine};
pub use crate::cache::{ObjectCache, Restore};
pub use crate::config::{ChangeDetection, Config};
pub use crate::core::{Hash32, ParseHashError};
pub use crate::diagnostics::{ActionReport, Diagnostics, Outcome, TaskExecution};
pub use crate::engine::{Deferred, Task, TaskState, ThreadPool};
pub use crate::error::*;
pub use crate::state::{BuildArgs, Check, DependencyInfo, FileInfo, RebuildReason, StateTracker};
