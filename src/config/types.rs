/// Core types shared across the limitbox crate
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Exit code reported for a child this controller terminated.
pub const FORCED_EXIT_CODE: i32 = 0xDEAD_BEEF_u32 as i32;

/// Literal marker the in-sandbox harness prints before an exception name.
pub const EXCEPTION_SENTINEL: &str = "E1AE1B1F-C5FE-4335-B642-9446634350A0:";

/// Stderr captures at or above this size are not scanned for feedback.
pub const FEEDBACK_SCAN_LIMIT: usize = 8192;

/// Default parent directory for per-run cgroups.
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup/limitbox";

/// Which resource-limited group implementation to use
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum BackendKind {
    /// cgroup v2 when available, rlimit fallback outside strict mode
    #[serde(rename = "auto")]
    Auto,
    /// cgroup v2 group with event-file notifications
    #[serde(rename = "cgroup_v2")]
    CgroupV2,
    /// Per-process rlimits with a sampling notification source
    #[serde(rename = "rlimit")]
    Rlimit,
}

impl BackendKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Self::Auto),
            "cgroup_v2" | "cgroup-v2" | "cgroup" | "v2" => Some(Self::CgroupV2),
            "rlimit" | "fallback" => Some(Self::Rlimit),
            _ => None,
        }
    }
}

impl Default for BackendKind {
    fn default() -> Self {
        BackendKind::Auto
    }
}

/// Exception feedback scanning parameters
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FeedbackConfig {
    /// Marker preceding the exception type line
    pub sentinel: String,
    /// Captures of this many bytes or more are skipped
    pub scan_limit: usize,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            sentinel: EXCEPTION_SENTINEL.to_string(),
            scan_limit: FEEDBACK_SCAN_LIMIT,
        }
    }
}

/// Host-side sandbox configuration.
///
/// Launch parameters (program, directory, limits) are not part of this
/// struct; they always come from the caller's [`crate::LaunchRequest`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Group backend selection
    pub backend: BackendKind,
    /// Strict mode: refuse the rlimit fallback when cgroups are unusable
    pub strict_mode: bool,
    /// Parent directory under which per-run cgroups are created
    pub cgroup_root: PathBuf,
    /// Maximum number of live processes in the group
    pub process_limit: u32,
    /// Poll/sampling period of notification sources (milliseconds)
    pub sample_interval_ms: u64,
    /// Exit code recorded for forced terminations
    pub forced_exit_code: i32,
    /// Exception feedback extraction
    pub feedback: FeedbackConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Auto,
            strict_mode: true,
            cgroup_root: PathBuf::from(DEFAULT_CGROUP_ROOT),
            process_limit: 1,
            sample_interval_ms: 10,
            forced_exit_code: FORCED_EXIT_CODE,
            feedback: FeedbackConfig::default(),
        }
    }
}

impl SandboxConfig {
    /// Permissive profile on the rlimit backend; works without root.
    pub fn unprivileged() -> Self {
        Self {
            backend: BackendKind::Rlimit,
            strict_mode: false,
            ..Self::default()
        }
    }
}

/// Output integrity classification
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum OutputIntegrity {
    #[serde(rename = "complete")]
    Complete,
    #[serde(rename = "truncated_by_judge_limit")]
    TruncatedByJudgeLimit,
    #[serde(rename = "write_error")]
    WriteError,
}

impl std::fmt::Display for OutputIntegrity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputIntegrity::Complete => write!(f, "complete"),
            OutputIntegrity::TruncatedByJudgeLimit => write!(f, "truncated_by_judge_limit"),
            OutputIntegrity::WriteError => write!(f, "write_error"),
        }
    }
}

impl Default for OutputIntegrity {
    fn default() -> Self {
        OutputIntegrity::Complete
    }
}

/// Status of a sandboxed run derived from verdict flags
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Clean exit, no limit violated
    #[serde(rename = "OK")]
    Ok,
    /// Time limit exceeded (CPU or wall clock)
    #[serde(rename = "TLE")]
    TimeLimit,
    /// Memory limit exceeded
    #[serde(rename = "MLE")]
    MemoryLimit,
    /// Nonzero exit, fatal signal, or reported exception
    #[serde(rename = "RE")]
    RuntimeError,
    /// Judge infrastructure failure
    #[serde(rename = "IE")]
    InternalError,
}

impl Default for ExecutionStatus {
    fn default() -> Self {
        ExecutionStatus::Ok
    }
}

/// Custom error types for limitbox
#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cgroup error: {0}")]
    Cgroup(String),

    #[error("Sandbox setup error: {0}")]
    Setup(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Limit monitor failure: {0}")]
    Monitor(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SandboxError {
    /// Host or infrastructure failure, as opposed to a submission problem.
    pub fn is_setup_failure(&self) -> bool {
        matches!(
            self,
            SandboxError::Cgroup(_) | SandboxError::Setup(_) | SandboxError::Io(_)
        )
    }
}

impl From<nix::errno::Errno> for SandboxError {
    fn from(err: nix::errno::Errno) -> Self {
        SandboxError::Process(err.to_string())
    }
}

/// Result type alias for limitbox operations
pub type Result<T> = std::result::Result<T, SandboxError>;
