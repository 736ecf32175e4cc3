#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod core;
mod engine;
mod error;
mod pool;
pub mod promise;
mod scheduler;
mod utils;

pub use crate::core::{Config, EX_TEMPFAIL, Specification, Value};
pub use crate::engine::{Dependency, Entry, Lookup, Progress, Resource, Step, StepOutcome, Task};
pub use crate::error::*;
pub use crate::pool::Pool;
pub use crate::promise::{
    Awaiting, Coroutine, Eventual, Promise, PromiseState, StepResult, Watcher, call, interpret,
    spawn,
};
pub use crate::scheduler::{Diagnostics, RunStatus, Scheduler, Target, WaitGraph};
#[cfg(feature = "logging")]
pub use crate::utils::init_logging;
