//! limitbox: run untrusted submissions under time and memory limits
//!
//! A launched child is placed in a resource-limited group before it may
//! execute, watched by a limit monitor and a wall-clock watchdog, and
//! classified afterwards as TLE, MLE, RE or OK from the flags raised while
//! it ran plus its reaped resource usage.
//!
//! # Architecture
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::cgroup`]: Limit groups (cgroup v2 backend, rlimit fallback)
//! - [`kernel::notify`]: Group event sources (event files or sampling)
//! - [`kernel::process`]: Race-safe reaping and forced termination
//! - [`kernel::accounting`]: rusage and `/proc` readings
//!
//! ## Execution Control ([`exec`])
//! - [`exec::spawn`]: Fork parked at a gate, exec status pipe
//! - [`exec::preexec`]: Type-state enforced spawn, attach, arm, resume
//!
//! ## Sandbox Core ([`core`])
//! - [`core::controller`]: [`SandboxedProcess`] lifecycle and accessors
//! - [`core::monitor`]: Limit-violation monitor thread
//! - [`core::watchdog`]: Wall-clock deadline thread
//!
//! ## Verdict ([`verdict`])
//! - [`verdict::flags`]: Sticky TLE/MLE flags
//! - [`verdict::stats`]: Post-hoc limit checks and the JSON report
//! - [`verdict::feedback`]: Exception type extraction from stderr
//!
//! ## Judge ([`judge`])
//! - [`judge::compiler`]: Command-driven compilation and launch
//! - [`judge::workspace`]: Run-scoped artifact directories
//!
//! ## Configuration ([`config`]) and Utilities ([`utils`])
//! - [`config::types`]: Shared types, constants and the error taxonomy
//! - [`config::loader`]: JSON files and `LIMITBOX_*` overrides
//! - [`utils::output`]: Bounded concurrent stream collection
//!
//! # Example
//!
//! ```no_run
//! use limitbox::{LaunchRequest, SandboxConfig, SandboxedProcess};
//!
//! let request = LaunchRequest::new("/usr/bin/python3", "/tmp", 2.0, 262_144)
//!     .args(["solution.py"]);
//! let mut process = SandboxedProcess::launch(&request, &SandboxConfig::default())?;
//! let (stdout, _stderr) = process.communicate(Some(b"1 2\n"))?;
//! println!("{:?} {}", process.report().status, String::from_utf8_lossy(&stdout));
//! # Ok::<(), limitbox::SandboxError>(())
//! ```

pub mod kernel;

pub mod exec;

pub mod core;

pub mod judge;

pub mod verdict;

pub mod config;

pub mod utils;

pub mod cli;

pub use crate::config::types::{
    BackendKind, ExecutionStatus, OutputIntegrity, Result, SandboxConfig, SandboxError,
};
pub use crate::core::controller::{LaunchRequest, SandboxedProcess};
pub use crate::verdict::stats::ExecutionReport;
