//! yardmaster - supervisor for in-process workers and child processes.
//!
//! A [`Supervisor`] owns a table of records identified by a monotonically
//! increasing id and drives a uniform lifecycle over two kinds of worker:
//!
//! - **In-process workers**: a function run on its own OS thread. Pause and
//!   stop are cooperative - the worker calls
//!   [`WorkerContext::check_pause`]/[`WorkerContext::should_exit`] at safe
//!   points; work between two checkpoints is not preemptible.
//! - **Child processes**: a command plus argv with piped stdio. Pause and
//!   resume map to SIGSTOP/SIGCONT; stop is SIGTERM with a bounded grace
//!   before SIGKILL.
//!
//! Records can also be tagged with opaque attachment strings for
//! name-based lookup.
//!
//! This crate is deliberately synchronous: one OS thread per worker, one
//! monitor thread per child, condition variables for pause cooperation. No
//! async runtime.

pub mod child;
pub mod error;
pub mod supervisor;
pub mod worker;

pub use error::SupervisorError;
pub use supervisor::{Supervisor, ThreadInfo, ThreadState, WorkerKind};
pub use worker::{WorkerContext, WorkerFn};
