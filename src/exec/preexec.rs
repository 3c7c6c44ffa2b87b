//! Launch ordering enforcement
//!
//! A launched child moves through a fixed sequence before it may run:
//! 1. forked and parked at its gate (`Suspended`)
//! 2. placed into its limit group (`Attached`)
//! 3. observed by a started limit monitor (`Armed`)
//! 4. released to exec (`resume`)
//!
//! Each step consumes the prior state, so skipping one does not compile.
//! Resuming before attaching:
//!
//! ```compile_fail
//! use limitbox::exec::preexec::{PendingChild, Suspended};
//!
//! fn skip_attach(child: PendingChild<Suspended>) {
//!     let _ = child.resume();
//! }
//! ```
//!
//! Starting the monitor before the child is in its group:
//!
//! ```compile_fail
//! use limitbox::exec::preexec::{PendingChild, Suspended};
//!
//! fn arm_early(child: PendingChild<Suspended>) {
//!     let _ = child.arm(|_| Ok(()));
//! }
//! ```
//!
//! Resuming before the monitor runs:
//!
//! ```compile_fail
//! use limitbox::exec::preexec::{Attached, PendingChild};
//!
//! fn skip_monitor(child: PendingChild<Attached>) {
//!     let _ = child.resume();
//! }
//! ```
//!
//! A child dropped anywhere along the chain is killed and reaped.

use crate::config::types::{Result, SandboxError};
use crate::exec::spawn::{fork_suspended, read_exec_status, release_gate, ChildPipes, SpawnPlan};
use crate::kernel::accounting::sample_process;
use crate::kernel::cgroup::backend::LimitGroup;
use crate::kernel::process::ChildProcess;
use nix::unistd::Pid;
use std::marker::PhantomData;
use std::os::fd::OwnedFd;
use std::sync::Arc;

/// Type-state marker: forked, parked at the gate
pub struct Suspended;

/// Type-state marker: member of its limit group
pub struct Attached;

/// Type-state marker: limit monitor running
pub struct Armed;

/// Kills and reaps the child unless the launch completes.
struct SpawnGuard {
    child: Option<Arc<ChildProcess>>,
    gate: Option<OwnedFd>,
    exec_status: Option<OwnedFd>,
}

impl SpawnGuard {
    fn child(&self) -> Option<&Arc<ChildProcess>> {
        self.child.as_ref()
    }
}

impl Drop for SpawnGuard {
    fn drop(&mut self) {
        // Closing the gate makes a parked child exit on its own.
        self.gate.take();
        self.exec_status.take();
        if let Some(child) = self.child.take() {
            log::warn!("Aborting launch of child {}", child.pid());
            if let Err(e) = child.terminate_and_reap() {
                log::error!("Failed to reap aborted child {}: {}", child.pid(), e);
            }
        }
    }
}

/// A child on its way from fork to exec
pub struct PendingChild<S> {
    guard: SpawnGuard,
    pipes: ChildPipes,
    _state: PhantomData<S>,
}

impl<S> PendingChild<S> {
    fn advance<T>(self) -> PendingChild<T> {
        PendingChild {
            guard: self.guard,
            pipes: self.pipes,
            _state: PhantomData,
        }
    }

    pub fn pid(&self) -> Option<Pid> {
        self.guard.child().map(|c| c.pid())
    }
}

impl PendingChild<Suspended> {
    /// Fork the child described by `plan`; it stays parked until `resume`.
    pub fn spawn(plan: &SpawnPlan) -> Result<Self> {
        let forked = fork_suspended(plan)?;
        let child = Arc::new(ChildProcess::new(forked.pid));
        // The parked copy's peak is what rusage will carry past exec.
        match sample_process(forked.pid) {
            Ok(Some(snapshot)) => {
                if let Some(kb) = snapshot.vm_hwm_kb {
                    child.record_fork_image(kb);
                }
            }
            Ok(None) => {}
            Err(e) => log::debug!("Fork image of {} not sampled: {}", forked.pid, e),
        }
        Ok(Self {
            guard: SpawnGuard {
                child: Some(child),
                gate: Some(forked.gate),
                exec_status: Some(forked.exec_status),
            },
            pipes: forked.pipes,
            _state: PhantomData,
        })
    }

    pub fn attach(self, group: &dyn LimitGroup) -> Result<PendingChild<Attached>> {
        if let Some(child) = self.guard.child() {
            group.attach(child.pid())?;
            log::debug!("Attached child {} to group {}", child.pid(), group.id());
        }
        Ok(self.advance())
    }
}

impl PendingChild<Attached> {
    /// Start the limit monitor; its handle is returned alongside.
    pub fn arm<F, T>(self, start_monitor: F) -> Result<(PendingChild<Armed>, T)>
    where
        F: FnOnce(&Arc<ChildProcess>) -> Result<T>,
    {
        let handle = match self.guard.child() {
            Some(child) => start_monitor(child)?,
            None => {
                return Err(SandboxError::Setup(
                    "pending child already released".to_string(),
                ))
            }
        };
        Ok((self.advance(), handle))
    }
}

impl PendingChild<Armed> {
    /// Release the gate and wait for the exec outcome.
    pub fn resume(mut self) -> Result<(Arc<ChildProcess>, ChildPipes)> {
        if let Some(gate) = self.guard.gate.take() {
            release_gate(gate)?;
        }
        if let Some(status) = self.guard.exec_status.take() {
            read_exec_status(status)?;
        }
        let child = self.guard.child.take().ok_or_else(|| {
            SandboxError::Setup("pending child already released".to_string())
        })?;
        child.mark_exec_confirmed();
        log::debug!("Child {} resumed", child.pid());
        Ok((child, self.pipes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::cgroup::backend::GroupLimits;
    use crate::kernel::cgroup::rlimit::RlimitGroup;
    use crate::kernel::process::ExitStatus;
    use std::io::Read;
    use std::path::Path;

    fn plan(program: &str, args: &[&str]) -> SpawnPlan {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        SpawnPlan::new(Path::new(program), &args, Path::new("/"), Vec::new()).unwrap()
    }

    #[test]
    fn full_chain_reaches_exec() {
        let group = RlimitGroup::new(GroupLimits::new(5.0, 65536, 1));
        let (armed, monitored) = PendingChild::spawn(&plan("/bin/sh", &["-c", "echo ready"]))
            .unwrap()
            .attach(&group)
            .unwrap()
            .arm(|child| Ok(child.pid()))
            .unwrap();
        let (child, pipes) = armed.resume().unwrap();
        assert_eq!(monitored, child.pid());
        assert!(child.exec_confirmed());
        assert!(child.fork_image_kb() > 0);
        let mut out = String::new();
        let mut stdout = pipes.stdout;
        stdout.read_to_string(&mut out).unwrap();
        assert_eq!(out, "ready\n");
        assert_eq!(child.wait().unwrap().status, ExitStatus::Exited(0));
    }

    #[test]
    fn dropped_pending_child_is_reaped() {
        let pending = PendingChild::spawn(&plan("/bin/sleep", &["5"])).unwrap();
        let pid = pending.pid().unwrap();
        drop(pending);
        // The pid is no longer our child once reaped.
        let rc = unsafe { libc::waitpid(pid.as_raw(), std::ptr::null_mut(), libc::WNOHANG) };
        assert_eq!(rc, -1);
    }

    #[test]
    fn failed_monitor_start_aborts_launch() {
        let group = RlimitGroup::new(GroupLimits::new(5.0, 65536, 1));
        let result = PendingChild::spawn(&plan("/bin/sleep", &["5"]))
            .unwrap()
            .attach(&group)
            .unwrap()
            .arm(|_| -> Result<()> {
                Err(SandboxError::Monitor("refused".into()))
            });
        assert!(result.is_err());
    }

    #[test]
    fn exec_failure_surfaces_as_setup_error() {
        let group = RlimitGroup::new(GroupLimits::new(5.0, 65536, 1));
        let (armed, ()) = PendingChild::spawn(&plan("/nonexistent/limitbox", &[]))
            .unwrap()
            .attach(&group)
            .unwrap()
            .arm(|_| Ok(()))
            .unwrap();
        let err = armed.resume().unwrap_err();
        assert!(err.is_setup_failure());
    }
}
