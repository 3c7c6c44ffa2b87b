/// Execution statistics, post-hoc limit comparison and the JSON report
use crate::config::types::{ExecutionStatus, OutputIntegrity};
use crate::kernel::process::{ExitRecord, ExitStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Statistics of a reaped child
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ExecutionStats {
    /// User plus system CPU seconds
    pub execution_time: f64,
    /// Peak resident memory in KiB
    pub max_memory: u64,
    pub status: ExitStatus,
}

impl ExecutionStats {
    /// `max_memory` is the program's own peak; `record.usage.max_rss_kb`
    /// may still include the pre-exec fork image.
    pub fn from_record(record: &ExitRecord, max_memory: u64) -> Self {
        Self {
            execution_time: record.usage.cpu_time.as_secs_f64(),
            max_memory,
            status: record.status,
        }
    }

    /// `(tle, mle)` derived from the statistics alone.
    pub fn limit_violations(&self, time_limit: f64, memory_limit_kb: u64) -> (bool, bool) {
        let tle = self.execution_time > time_limit
            || matches!(self.status, ExitStatus::Signaled(libc::SIGXCPU));
        let mle = self.max_memory > memory_limit_kb;
        (tle, mle)
    }
}

/// Status precedence: TLE, MLE, then RE for a failing exit or feedback.
pub fn classify(tle: bool, mle: bool, returncode: Option<i32>, feedback: Option<&str>) -> ExecutionStatus {
    if tle {
        ExecutionStatus::TimeLimit
    } else if mle {
        ExecutionStatus::MemoryLimit
    } else if feedback.is_some() || returncode.map_or(true, |code| code != 0) {
        ExecutionStatus::RuntimeError
    } else {
        ExecutionStatus::Ok
    }
}

/// Serializable outcome of one sandboxed run
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub status: ExecutionStatus,
    pub tle: bool,
    pub mle: bool,
    pub returncode: Option<i32>,
    /// The controller killed the child
    pub forced: bool,
    /// CPU seconds
    pub execution_time: f64,
    /// Peak resident memory in KiB
    pub max_memory: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub stdout_integrity: OutputIntegrity,
    pub stderr_integrity: OutputIntegrity,
    pub backend: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Wall-clock seconds from launch to finalization
    pub wall_time: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionReport {
    /// Report for a run that never got a child going.
    pub fn internal_error(message: String, backend: &str, started_at: DateTime<Utc>) -> Self {
        let finished_at = Utc::now();
        Self {
            status: ExecutionStatus::InternalError,
            tle: false,
            mle: false,
            returncode: None,
            forced: false,
            execution_time: 0.0,
            max_memory: 0,
            feedback: None,
            stdout: String::new(),
            stderr: String::new(),
            stdout_integrity: OutputIntegrity::Complete,
            stderr_integrity: OutputIntegrity::Complete,
            backend: backend.to_string(),
            started_at,
            finished_at,
            wall_time: (finished_at - started_at).num_milliseconds().max(0) as f64 / 1000.0,
            error: Some(message),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::accounting::ResourceUsage;
    use std::time::{Duration, Instant};

    fn stats(cpu_ms: u64, rss_kb: u64, status: ExitStatus) -> ExecutionStats {
        let record = ExitRecord {
            status,
            usage: ResourceUsage {
                cpu_time: Duration::from_millis(cpu_ms),
                max_rss_kb: rss_kb,
            },
            reaped_at: Instant::now(),
        };
        ExecutionStats::from_record(&record, rss_kb)
    }

    #[test]
    fn cpu_over_limit_is_tle() {
        assert_eq!(
            stats(1500, 100, ExitStatus::Exited(0)).limit_violations(1.0, 1024),
            (true, false)
        );
        assert_eq!(
            stats(1000, 100, ExitStatus::Exited(0)).limit_violations(1.0, 1024),
            (false, false)
        );
    }

    #[test]
    fn sigxcpu_death_is_tle() {
        let (tle, _) = stats(900, 100, ExitStatus::Signaled(libc::SIGXCPU)).limit_violations(1.0, 1024);
        assert!(tle);
    }

    #[test]
    fn rss_over_limit_is_mle() {
        assert_eq!(
            stats(10, 2048, ExitStatus::Exited(0)).limit_violations(1.0, 1024),
            (false, true)
        );
    }

    #[test]
    fn inflated_rusage_does_not_decide_mle() {
        let record = ExitRecord {
            status: ExitStatus::Exited(0),
            usage: ResourceUsage {
                cpu_time: Duration::from_millis(5),
                max_rss_kb: 206_264,
            },
            reaped_at: Instant::now(),
        };
        let stats = ExecutionStats::from_record(&record, 1200);
        assert_eq!(stats.limit_violations(1.0, 65_536), (false, false));
    }

    #[test]
    fn classification_precedence() {
        assert_eq!(classify(true, true, Some(0), None), ExecutionStatus::TimeLimit);
        assert_eq!(classify(false, true, Some(1), None), ExecutionStatus::MemoryLimit);
        assert_eq!(classify(false, false, Some(1), None), ExecutionStatus::RuntimeError);
        assert_eq!(
            classify(false, false, Some(0), Some("KeyError")),
            ExecutionStatus::RuntimeError
        );
        assert_eq!(classify(false, false, Some(0), None), ExecutionStatus::Ok);
        assert_eq!(classify(false, false, None, None), ExecutionStatus::RuntimeError);
    }

    #[test]
    fn internal_error_report_serializes() {
        let report = ExecutionReport::internal_error("no cgroup".into(), "auto", Utc::now());
        let json = report.to_json().unwrap();
        assert!(json.contains("\"status\": \"IE\""));
        assert!(json.contains("no cgroup"));
    }
}
