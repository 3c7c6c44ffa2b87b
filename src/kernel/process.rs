//! Child process handle shared by the controller, monitor and watchdog.
//!
//! The handle only ever moves toward "more terminal": running → exited →
//! reaped. Whichever thread reaps first stores the [`ExitRecord`]; every
//! other waiter picks it up from the condvar. Termination of a child that is
//! already reaped is a no-op, and signals go through a pidfd when the kernel
//! offers one so a recycled pid is never hit.

use crate::config::types::{Result, SandboxError};
use crate::kernel::accounting::ResourceUsage;
use crate::kernel::fd::poll_fd;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// How long a waiter that lost the reaping race waits for the winner to
/// publish the record.
const REAP_HANDOFF_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll period used when no pidfd is available.
const FALLBACK_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How the child ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitStatus {
    /// Normal exit with the program's own code
    Exited(i32),
    /// Killed by a signal this controller did not send
    Signaled(i32),
    /// Killed by this controller (watchdog, monitor, or `wait` timeout)
    Terminated,
}

impl ExitStatus {
    fn decode(status: libc::c_int, forced: bool) -> Self {
        if libc::WIFEXITED(status) {
            ExitStatus::Exited(libc::WEXITSTATUS(status))
        } else if libc::WIFSIGNALED(status) {
            let signal = libc::WTERMSIG(status);
            if forced && signal == libc::SIGKILL {
                ExitStatus::Terminated
            } else {
                ExitStatus::Signaled(signal)
            }
        } else {
            ExitStatus::Signaled(0)
        }
    }

    /// Integer return code: exit code, `-signal`, or the forced sentinel.
    pub fn returncode(&self, forced_exit_code: i32) -> i32 {
        match *self {
            ExitStatus::Exited(code) => code,
            ExitStatus::Signaled(signal) => -signal,
            ExitStatus::Terminated => forced_exit_code,
        }
    }

    pub fn is_forced(&self) -> bool {
        matches!(self, ExitStatus::Terminated)
    }

    /// A SIGKILL death after a limit violation was the enforcement kill,
    /// whether the kernel or this controller sent it.
    pub fn attribute_limit_kill(self, limit_violated: bool) -> Self {
        match self {
            ExitStatus::Signaled(libc::SIGKILL) if limit_violated => ExitStatus::Terminated,
            other => other,
        }
    }
}

/// Final state of a reaped child
#[derive(Clone, Copy, Debug)]
pub struct ExitRecord {
    pub status: ExitStatus,
    pub usage: ResourceUsage,
    pub reaped_at: Instant,
}

fn wait4(pid: Pid, options: libc::c_int) -> io::Result<Option<(libc::c_int, libc::rusage)>> {
    let mut status: libc::c_int = 0;
    // SAFETY: rusage is plain old data; zero is a valid bit pattern.
    let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
    loop {
        // SAFETY: both out-pointers reference live locals.
        let rc = unsafe { libc::wait4(pid.as_raw(), &mut status, options, &mut usage) };
        if rc == pid.as_raw() {
            return Ok(Some((status, usage)));
        }
        if rc == 0 {
            return Ok(None);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn open_pidfd(pid: Pid) -> Option<OwnedFd> {
    // SAFETY: pidfd_open takes a pid and flags and returns a new descriptor.
    let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid.as_raw(), 0) };
    if fd >= 0 {
        // SAFETY: the syscall returned a fresh descriptor we now own.
        Some(unsafe { OwnedFd::from_raw_fd(fd as RawFd) })
    } else {
        log::debug!(
            "pidfd_open({}) unavailable, using pid signalling: {}",
            pid,
            io::Error::last_os_error()
        );
        None
    }
}

fn is_echild(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ECHILD)
}

/// Handle to a forked child
pub struct ChildProcess {
    pid: Pid,
    pidfd: Option<OwnedFd>,
    forced: AtomicBool,
    exec_confirmed: AtomicBool,
    fork_image_kb: AtomicU64,
    observed_peak_kb: AtomicU64,
    record: Mutex<Option<ExitRecord>>,
    reaped: Condvar,
}

impl ChildProcess {
    /// Take ownership of a forked child of this process.
    pub(crate) fn new(pid: Pid) -> Self {
        Self {
            pid,
            pidfd: open_pidfd(pid),
            forced: AtomicBool::new(false),
            exec_confirmed: AtomicBool::new(false),
            fork_image_kb: AtomicU64::new(0),
            observed_peak_kb: AtomicU64::new(0),
            record: Mutex::new(None),
            reaped: Condvar::new(),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Whether signalling and exit waits go through a pidfd.
    pub fn has_pidfd(&self) -> bool {
        self.pidfd.is_some()
    }

    pub(crate) fn pidfd(&self) -> Option<RawFd> {
        self.pidfd.as_ref().map(|fd| fd.as_raw_fd())
    }

    pub(crate) fn mark_exec_confirmed(&self) {
        self.exec_confirmed.store(true, Ordering::SeqCst);
    }

    /// The target program replaced the forked image.
    pub fn exec_confirmed(&self) -> bool {
        self.exec_confirmed.load(Ordering::SeqCst)
    }

    pub(crate) fn record_fork_image(&self, kb: u64) {
        self.fork_image_kb.store(kb, Ordering::SeqCst);
    }

    /// Peak RSS of the forked copy before exec; `0` if it was not read.
    pub fn fork_image_kb(&self) -> u64 {
        self.fork_image_kb.load(Ordering::SeqCst)
    }

    pub(crate) fn observe_peak(&self, kb: u64) {
        self.observed_peak_kb.fetch_max(kb, Ordering::SeqCst);
    }

    /// Largest `VmHWM` sampled after exec.
    pub fn observed_peak_kb(&self) -> u64 {
        self.observed_peak_kb.load(Ordering::SeqCst)
    }

    fn lock_record(&self) -> MutexGuard<'_, Option<ExitRecord>> {
        self.record.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record stored by whichever thread reaped the child.
    pub fn exit_record(&self) -> Option<ExitRecord> {
        *self.lock_record()
    }

    fn make_record(&self, status: libc::c_int, usage: &libc::rusage) -> ExitRecord {
        ExitRecord {
            status: ExitStatus::decode(status, self.forced.load(Ordering::SeqCst)),
            usage: ResourceUsage::from(usage),
            reaped_at: Instant::now(),
        }
    }

    fn publish(&self, status: libc::c_int, usage: &libc::rusage) -> ExitRecord {
        let record = self.make_record(status, usage);
        let mut guard = self.lock_record();
        let stored = *guard.get_or_insert(record);
        drop(guard);
        self.reaped.notify_all();
        stored
    }

    fn await_handoff(&self) -> Result<ExitRecord> {
        let guard = self.lock_record();
        let (guard, _) = self
            .reaped
            .wait_timeout_while(guard, REAP_HANDOFF_TIMEOUT, |record| record.is_none())
            .unwrap_or_else(PoisonError::into_inner);
        (*guard).ok_or_else(|| {
            SandboxError::Process(format!(
                "child {} was reaped outside the controller",
                self.pid
            ))
        })
    }

    /// Non-blocking exit check; reaps the child if it has exited.
    pub fn try_wait(&self) -> Result<Option<ExitRecord>> {
        let mut guard = self.lock_record();
        if let Some(record) = *guard {
            return Ok(Some(record));
        }
        match wait4(self.pid, libc::WNOHANG) {
            Ok(Some((status, usage))) => {
                let record = self.make_record(status, &usage);
                *guard = Some(record);
                drop(guard);
                self.reaped.notify_all();
                Ok(Some(record))
            }
            Ok(None) => Ok(None),
            Err(e) if is_echild(&e) => {
                drop(guard);
                self.await_handoff().map(Some)
            }
            Err(e) => Err(SandboxError::Process(format!(
                "wait4({}, WNOHANG): {}",
                self.pid, e
            ))),
        }
    }

    /// Block until the child is reaped.
    pub fn wait(&self) -> Result<ExitRecord> {
        if let Some(record) = self.exit_record() {
            return Ok(record);
        }
        match wait4(self.pid, 0) {
            Ok(Some((status, usage))) => Ok(self.publish(status, &usage)),
            Ok(None) => Err(SandboxError::Process(format!(
                "wait4({}) returned without a status",
                self.pid
            ))),
            Err(e) if is_echild(&e) => self.await_handoff(),
            Err(e) => Err(SandboxError::Process(format!("wait4({}): {}", self.pid, e))),
        }
    }

    /// Wait for exit up to `timeout`; `Ok(None)` if the child is still alive.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Option<ExitRecord>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(record) = self.try_wait()? {
                return Ok(Some(record));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let remaining = deadline - now;
            match self.pidfd() {
                Some(fd) => {
                    poll_fd(fd, libc::POLLIN, remaining).map_err(|e| {
                        SandboxError::Process(format!("poll(pidfd {}): {}", self.pid, e))
                    })?;
                }
                None => std::thread::sleep(remaining.min(FALLBACK_POLL_INTERVAL)),
            }
        }
    }

    fn send_kill(&self) -> io::Result<()> {
        match self.pidfd() {
            Some(fd) => {
                // SAFETY: pidfd_send_signal with a null siginfo and no flags.
                let rc = unsafe {
                    libc::syscall(
                        libc::SYS_pidfd_send_signal,
                        fd,
                        libc::SIGKILL,
                        std::ptr::null::<libc::siginfo_t>(),
                        0u32,
                    )
                };
                if rc == 0 {
                    Ok(())
                } else {
                    Err(io::Error::last_os_error())
                }
            }
            None => kill(self.pid, Signal::SIGKILL)
                .map_err(|errno| io::Error::from_raw_os_error(errno as i32)),
        }
    }

    /// Send SIGKILL unless the child is already reaped.
    ///
    /// Returns whether a signal was delivered. A child that is already gone
    /// yields `Ok(false)`, never an error.
    pub fn terminate(&self) -> Result<bool> {
        let guard = self.lock_record();
        if guard.is_some() {
            return Ok(false);
        }
        self.forced.store(true, Ordering::SeqCst);
        let delivered = self.send_kill();
        // The unreaped leader pins its pid as a group id, so this never
        // reaches an unrelated group.
        let _ = kill(Pid::from_raw(-self.pid.as_raw()), Signal::SIGKILL);
        drop(guard);
        match delivered {
            Ok(()) => Ok(true),
            Err(e) if e.raw_os_error() == Some(libc::ESRCH) => Ok(false),
            Err(e) => Err(SandboxError::Process(format!(
                "failed to kill child {}: {}",
                self.pid, e
            ))),
        }
    }

    /// SIGKILL whatever is left of the child's process group.
    ///
    /// The child leads its own session, and the kernel keeps a group id
    /// allocated while any member lives, so this stays safe after the
    /// leader was reaped. Returns whether any process was signalled.
    pub fn kill_group(&self) -> bool {
        kill(Pid::from_raw(-self.pid.as_raw()), Signal::SIGKILL).is_ok()
    }

    /// Terminate and block until reaped.
    pub fn terminate_and_reap(&self) -> Result<ExitRecord> {
        self.terminate()?;
        self.wait()
    }
}

impl std::fmt::Debug for ChildProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChildProcess")
            .field("pid", &self.pid)
            .field("pidfd", &self.pidfd.is_some())
            .field("exit", &self.exit_record().map(|r| r.status))
            .finish()
    }
}
