//! Wall-clock watchdog.
//!
//! Backstops the CPU limit for children that sleep or block: once the
//! deadline passes with the child still running, `tle` is raised and the
//! child is killed. A leader that already exited does not end the budget:
//! anything still running in its process group is killed the same way.
//! Dropping the [`Watchdog`] cancels it.

use crate::config::types::{Result, SandboxError};
use crate::kernel::process::ChildProcess;
use crate::verdict::flags::VerdictFlags;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchdogOutcome {
    Cancelled,
    /// Deadline passed after the child had already exited
    ChildExited,
    /// Deadline passed with only processes the child left behind running
    GroupKilled,
    /// Deadline passed with the child running; it was killed
    Fired,
    Failed(String),
}

pub struct Watchdog {
    cancel: Option<Sender<()>>,
    handle: Option<JoinHandle<WatchdogOutcome>>,
}

fn run_watchdog(
    cancel: Receiver<()>,
    child: &ChildProcess,
    flags: &VerdictFlags,
    limit: Duration,
) -> WatchdogOutcome {
    match cancel.recv_timeout(limit) {
        Err(RecvTimeoutError::Timeout) => {}
        Ok(()) | Err(RecvTimeoutError::Disconnected) => return WatchdogOutcome::Cancelled,
    }
    match child.try_wait() {
        Ok(Some(_)) => {
            if child.kill_group() {
                flags.mark_tle();
                log::warn!(
                    "Wall-clock limit of {:?} reached, killed the remaining group of child {}",
                    limit,
                    child.pid()
                );
                WatchdogOutcome::GroupKilled
            } else {
                WatchdogOutcome::ChildExited
            }
        }
        Ok(None) => {
            flags.mark_tle();
            log::warn!(
                "Wall-clock limit of {:?} reached, killing child {}",
                limit,
                child.pid()
            );
            match child.terminate_and_reap() {
                Ok(_) => WatchdogOutcome::Fired,
                Err(e) => {
                    log::error!("Watchdog failed to kill child {}: {}", child.pid(), e);
                    WatchdogOutcome::Failed(e.to_string())
                }
            }
        }
        Err(e) => WatchdogOutcome::Failed(e.to_string()),
    }
}

impl Watchdog {
    pub fn start(child: Arc<ChildProcess>, flags: Arc<VerdictFlags>, limit: Duration) -> Result<Self> {
        let (tx, rx) = bounded(1);
        let handle = thread::Builder::new()
            .name("limitbox-watchdog".to_string())
            .spawn(move || run_watchdog(rx, &child, &flags, limit))
            .map_err(|e| SandboxError::Setup(format!("Failed to start watchdog: {}", e)))?;
        Ok(Self {
            cancel: Some(tx),
            handle: Some(handle),
        })
    }

    /// Stop waiting. The thread exits on its own; it is not joined.
    pub fn cancel(&mut self) {
        self.cancel.take();
        self.handle.take();
    }

    /// Cancel and wait for the thread's outcome.
    #[cfg(test)]
    pub fn cancel_and_join(mut self) -> Option<WatchdogOutcome> {
        self.cancel.take();
        self.handle.take().and_then(|handle| handle.join().ok())
    }

    /// Wait for the thread without cancelling it.
    #[cfg(test)]
    pub fn join(mut self) -> Option<WatchdogOutcome> {
        self.handle.take().and_then(|handle| handle.join().ok())
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.cancel.take();
    }
}
