//! Judge layer.
//!
//! Compiles a submission into a run-scoped workspace and launches the
//! artifact through the sandbox. Compiler diagnostics are passed through
//! verbatim, never parsed.

pub mod compiler;
pub mod workspace;

use crate::config::types::{SandboxConfig, SandboxError};
use crate::core::controller::SandboxedProcess;
use std::process::Child;
use thiserror::Error;

pub use compiler::{CompiledExecutor, CompilerSpec, Launcher};
pub use workspace::Workspace;

#[derive(Error, Debug)]
pub enum JudgeError {
    /// The compiler rejected the submission; `output` is its merged output.
    #[error("Compilation failed:\n{output}")]
    Compile { output: String },

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Something that can run a submission
pub trait Executor {
    /// Launch inside the sandbox with `time_limit` seconds and
    /// `memory_limit` KiB.
    fn launch(
        &self,
        time_limit: f64,
        memory_limit: u64,
        config: &SandboxConfig,
    ) -> Result<SandboxedProcess, JudgeError>;

    /// Run without any limits, e.g. for trusted checkers.
    fn launch_unsafe(&self, args: &[String]) -> Result<Child, JudgeError>;
}
