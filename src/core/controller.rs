//! Sandboxed process controller.
//!
//! Launch order: create the limit group, fork the child parked at its gate,
//! attach it, start the limit monitor, release the gate, start the
//! wall-clock watchdog. Finalization reaps the child, merges the post-hoc
//! limit comparison into the verdict flags and collects the monitor.

use crate::config::types::{BackendKind, Result, SandboxConfig, SandboxError};
use crate::core::monitor::{start_monitor, MonitorHandle};
use crate::core::watchdog::Watchdog;
use crate::exec::preexec::PendingChild;
use crate::exec::spawn::SpawnPlan;
use crate::kernel::cgroup::backend::{backend_name, create_limit_group, GroupLimits, LimitGroup};
use crate::kernel::accounting::program_peak_kb;
use crate::kernel::process::{ChildProcess, ExitRecord};
use crate::utils::output::{communicate, CapturedOutput, StreamCeilings};
use crate::verdict::feedback::FeedbackExtractor;
use crate::verdict::flags::VerdictFlags;
use crate::verdict::stats::{classify, ExecutionReport, ExecutionStats};
use chrono::{DateTime, Utc};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Upper bound on waiting for the monitor once the child is reaped.
const MONITOR_COLLECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Largest accepted time limit in seconds (one day).
pub const MAX_TIME_LIMIT: f64 = 86_400.0;

/// What to run and under which limits
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub executable: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    pub workdir: PathBuf,
    /// CPU and wall-clock budget in seconds
    pub time_limit: f64,
    /// Memory ceiling in KiB
    pub memory_limit: u64,
}

impl LaunchRequest {
    pub fn new(
        executable: impl Into<PathBuf>,
        workdir: impl Into<PathBuf>,
        time_limit: f64,
        memory_limit: u64,
    ) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            workdir: workdir.into(),
            time_limit,
            memory_limit,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.time_limit.is_finite() || self.time_limit <= 0.0 {
            return Err(SandboxError::Config(format!(
                "time limit must be a positive number of seconds, got {}",
                self.time_limit
            )));
        }
        if self.time_limit > MAX_TIME_LIMIT {
            return Err(SandboxError::Config(format!(
                "time limit of {}s exceeds the maximum of {}s",
                self.time_limit, MAX_TIME_LIMIT
            )));
        }
        if self.memory_limit == 0 {
            return Err(SandboxError::Config(
                "memory limit must be positive".to_string(),
            ));
        }
        if self.executable.as_os_str().is_empty() {
            return Err(SandboxError::Config("empty executable path".to_string()));
        }
        if !self.workdir.is_dir() {
            return Err(SandboxError::Setup(format!(
                "working directory does not exist: {}",
                self.workdir.display()
            )));
        }
        Ok(())
    }
}

/// One launched attempt of an untrusted program
pub struct SandboxedProcess {
    stdin: Option<File>,
    stdout: Option<File>,
    stderr: Option<File>,
    child: Arc<ChildProcess>,
    flags: Arc<VerdictFlags>,
    watchdog: Option<Watchdog>,
    monitor: Option<MonitorHandle>,
    extractor: FeedbackExtractor,
    time_limit: f64,
    memory_limit: u64,
    forced_exit_code: i32,
    returncode: Option<i32>,
    stats: Option<ExecutionStats>,
    feedback: Option<String>,
    captured: Option<CapturedOutput>,
    started_at: DateTime<Utc>,
    started: Instant,
    finished_at: Option<DateTime<Utc>>,
    wall_time: Option<Duration>,
    // Dropped last: the group outlives the child it contains.
    group: Box<dyn LimitGroup>,
}

impl SandboxedProcess {
    /// Launch `request` under `config`. Any failure before the child runs is
    /// returned as an error and leaves neither child nor group behind.
    pub fn launch(request: &LaunchRequest, config: &SandboxConfig) -> Result<Self> {
        request.validate()?;
        config.validate()?;
        let limits = GroupLimits::new(
            request.time_limit,
            request.memory_limit,
            config.process_limit,
        );
        let group = create_limit_group(config, limits)?;
        Self::launch_in(request, config, group)
    }

    /// Launch into an already created group.
    pub(crate) fn launch_in(
        request: &LaunchRequest,
        config: &SandboxConfig,
        group: Box<dyn LimitGroup>,
    ) -> Result<Self> {
        let extractor = FeedbackExtractor::for_config(&config.feedback)?;
        let limits = *group.limits();
        let plan = SpawnPlan::new(
            &request.executable,
            &request.args,
            &request.workdir,
            limits.child_rlimits(),
        )?;
        let flags = Arc::new(VerdictFlags::new());
        let interval = Duration::from_millis(config.sample_interval_ms);

        let started_at = Utc::now();
        let started = Instant::now();
        let (armed, monitor) = PendingChild::spawn(&plan)?
            .attach(group.as_ref())?
            .arm(|child| {
                let source = group.open_notifications(child, interval)?;
                start_monitor(source, group.id().clone(), Arc::clone(child), Arc::clone(&flags))
            })?;
        let (child, pipes) = armed.resume()?;
        if !child.has_pidfd() {
            log::debug!("No pidfd for child {}, falling back to polling waits", child.pid());
        }

        log::info!(
            "Launched {} as pid {} (backend={}, time_limit={}s, memory_limit={}KB)",
            request.executable.display(),
            child.pid(),
            backend_name(group.kind()),
            request.time_limit,
            request.memory_limit
        );

        let mut process = SandboxedProcess {
            stdin: Some(pipes.stdin),
            stdout: Some(pipes.stdout),
            stderr: Some(pipes.stderr),
            child,
            flags,
            watchdog: None,
            monitor: Some(monitor),
            extractor,
            time_limit: request.time_limit,
            memory_limit: request.memory_limit,
            forced_exit_code: config.forced_exit_code,
            returncode: None,
            stats: None,
            feedback: None,
            captured: None,
            started_at,
            started,
            finished_at: None,
            wall_time: None,
            group,
        };
        // On failure the half-built process is dropped, which kills the child.
        process.watchdog = Some(Watchdog::start(
            Arc::clone(&process.child),
            Arc::clone(&process.flags),
            limits.wall_limit(),
        )?);
        Ok(process)
    }

    fn record_exit(&mut self, record: ExitRecord) -> i32 {
        if let Some(code) = self.returncode {
            return code;
        }
        // Nothing may outlive the leader; this also unblocks readers of
        // pipes a background process still holds.
        if self.child.kill_group() {
            log::warn!("Killed processes left behind by child {}", self.child.pid());
        }
        let observed = self
            .child
            .observed_peak_kb()
            .max(self.group.peak_memory_kb().unwrap_or(0));
        let max_memory = program_peak_kb(record.usage.max_rss_kb, self.child.fork_image_kb(), observed);
        let stats = ExecutionStats::from_record(&record, max_memory);
        let (tle, mle) = stats.limit_violations(self.time_limit, self.memory_limit);
        self.flags.merge(tle, mle);
        log::debug!(
            "Child {} finished: status={:?} cpu={:.3}s rss={}KB (rusage {}KB, fork image {}KB)",
            self.child.pid(),
            record.status,
            stats.execution_time,
            stats.max_memory,
            record.usage.max_rss_kb,
            self.child.fork_image_kb()
        );
        self.returncode = Some(record.status.returncode(self.forced_exit_code));
        self.stats = Some(stats);
        self.attribute_limit_kill();
        self.finished_at = Some(Utc::now());
        self.wall_time = Some(record.reaped_at.saturating_duration_since(self.started));
        if let Some(mut watchdog) = self.watchdog.take() {
            watchdog.cancel();
        }
        self.returncode.unwrap_or(self.forced_exit_code)
    }

    /// Map a SIGKILL death that followed a memory violation onto the forced
    /// exit code; the kernel's OOM kill can beat the monitor to it.
    fn attribute_limit_kill(&mut self) {
        let mle = self.flags.mle();
        if let Some(stats) = self.stats.as_mut() {
            let status = stats.status.attribute_limit_kill(mle);
            if status != stats.status {
                stats.status = status;
                self.returncode = Some(status.returncode(self.forced_exit_code));
            }
        }
    }

    /// Reap, record statistics and collect the monitor outcome.
    fn finalize(&mut self) -> Result<i32> {
        let record = self.child.wait()?;
        let code = self.record_exit(record);
        let collected = match self.monitor.take() {
            Some(monitor) => monitor.finish(MONITOR_COLLECT_TIMEOUT).map(|_| ()),
            None => Ok(()),
        };
        self.attribute_limit_kill();
        collected?;
        Ok(self.returncode.unwrap_or(code))
    }

    /// Wait up to the time limit. On timeout `tle` is raised and the child is
    /// killed with the forced exit code.
    pub fn wait(&mut self) -> Result<i32> {
        if let Some(code) = self.returncode {
            return Ok(code);
        }
        let limit = Duration::from_millis((self.time_limit * 1000.0).ceil() as u64);
        if self.child.wait_timeout(limit)?.is_none() {
            self.flags.mark_tle();
            log::warn!(
                "Child {} still running after {:?}, terminating",
                self.child.pid(),
                limit
            );
            self.child.terminate_and_reap()?;
        }
        self.finalize()
    }

    /// Non-blocking exit check.
    pub fn poll(&mut self) -> Result<Option<i32>> {
        if let Some(code) = self.returncode {
            return Ok(Some(code));
        }
        Ok(self.child.try_wait()?.map(|record| self.record_exit(record)))
    }

    fn exchange(&mut self, input: Option<&[u8]>, ceilings: StreamCeilings) -> Result<(Vec<u8>, Vec<u8>)> {
        let drained = communicate(
            self.stdin.take(),
            input,
            self.stdout.take(),
            self.stderr.take(),
            ceilings,
        );
        let finalized = self.finalize();
        let captured = drained?;
        self.feedback = self.extractor.extract(&captured.stderr);
        let result = (captured.stdout.clone(), captured.stderr.clone());
        self.captured = Some(captured);
        finalized?;
        Ok(result)
    }

    /// Feed `input`, drain both streams completely and finalize.
    pub fn communicate(&mut self, input: Option<&[u8]>) -> Result<(Vec<u8>, Vec<u8>)> {
        self.exchange(input, StreamCeilings::unbounded())
    }

    /// Like [`communicate`](Self::communicate) but keeps at most the given
    /// number of bytes per stream while still draining the pipes.
    pub fn safe_communicate(
        &mut self,
        input: Option<&[u8]>,
        stdout_limit: usize,
        stderr_limit: usize,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        self.exchange(input, StreamCeilings::bounded(stdout_limit, stderr_limit))
    }

    pub fn tle(&self) -> bool {
        self.flags.tle()
    }

    pub fn mle(&self) -> bool {
        self.flags.mle()
    }

    /// CPU seconds; available once the child was reaped.
    pub fn execution_time(&self) -> Option<f64> {
        self.stats.map(|s| s.execution_time)
    }

    /// Peak resident memory in KiB; available once the child was reaped.
    pub fn max_memory(&self) -> Option<u64> {
        self.stats.map(|s| s.max_memory)
    }

    pub fn feedback(&self) -> Option<&str> {
        self.feedback.as_deref()
    }

    pub fn returncode(&self) -> Option<i32> {
        self.returncode
    }

    pub fn pid(&self) -> Pid {
        self.child.pid()
    }

    pub fn backend(&self) -> BackendKind {
        self.group.kind()
    }

    pub fn time_limit(&self) -> f64 {
        self.time_limit
    }

    pub fn memory_limit(&self) -> u64 {
        self.memory_limit
    }

    pub fn report(&self) -> ExecutionReport {
        let captured = self.captured.clone().unwrap_or_default();
        let now = Utc::now();
        ExecutionReport {
            status: classify(self.tle(), self.mle(), self.returncode, self.feedback()),
            tle: self.tle(),
            mle: self.mle(),
            returncode: self.returncode,
            forced: self.stats.map_or(false, |s| s.status.is_forced()),
            execution_time: self.execution_time().unwrap_or(0.0),
            max_memory: self.max_memory().unwrap_or(0),
            feedback: self.feedback.clone(),
            stdout: String::from_utf8_lossy(&captured.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&captured.stderr).into_owned(),
            stdout_integrity: captured.stdout_integrity,
            stderr_integrity: captured.stderr_integrity,
            backend: backend_name(self.backend()).to_string(),
            started_at: self.started_at,
            finished_at: self.finished_at.unwrap_or(now),
            wall_time: self
                .wall_time
                .unwrap_or_else(|| self.started.elapsed())
                .as_secs_f64(),
            error: None,
        }
    }
}

impl Drop for SandboxedProcess {
    fn drop(&mut self) {
        if self.child.exit_record().is_none() {
            log::warn!("Dropping running child {}, terminating", self.child.pid());
            if let Err(e) = self.child.terminate_and_reap() {
                log::error!("Failed to reap child {} on drop: {}", self.child.pid(), e);
            }
        }
        if let Some(mut watchdog) = self.watchdog.take() {
            watchdog.cancel();
        }
        // The monitor must stop reading group files before the group goes.
        if let Some(monitor) = self.monitor.take() {
            if let Err(e) = monitor.finish(MONITOR_COLLECT_TIMEOUT) {
                log::debug!("Monitor ended with error during drop: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for SandboxedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxedProcess")
            .field("pid", &self.child.pid())
            .field("group", self.group.id())
            .field("backend", &self.backend())
            .field("returncode", &self.returncode)
            .field("tle", &self.tle())
            .field("mle", &self.mle())
            .finish()
    }
}
