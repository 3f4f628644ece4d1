//! Bounded handler execution.
//!
//! Every execution request runs one external handler program:
//! - **Deadline**: the child is waited on with a wall-clock deadline, then
//!   terminated (SIGTERM, then SIGKILL after a grace period) and reaped
//! - **Bounded capture**: stdout and stderr are drained concurrently, each kept
//!   up to a byte cap; bytes past the cap are read and discarded so the child
//!   never blocks on a full pipe
//!
//! # Components
//!
//! - [`Executor`]: applies the node's [`ExecConfig`](crate::config::ExecConfig)
//!   to an [`ExecRequest`]
//! - [`run_handler`]: the engine itself, usable without an `Executor`
//!
//! # Execution Flow
//!
//! 1. `/exec` (or a dispatched slot execution) yields an [`ExecRequest`]
//! 2. [`Executor::execute`] resolves the timeout and spawns
//!    `<handler> <command_path> <args...>` in its own process group
//! 3. Output readers run until EOF, or until a short drain grace after exit
//! 4. Returns [`ExecResult`]; a timeout is a result with exit code
//!    [`TIMEOUT_EXIT_CODE`], not an error

mod capture;
pub mod executor;

pub use executor::{
    run_handler, ExecLimits, ExecRequest, ExecResponse, ExecResult, Executor, TIMEOUT_EXIT_CODE,
};
