//! Limit-violation monitor.
//!
//! A detached thread consumes the group's notification source. It ends on
//! the first `Emptied` event, or after handling `MemoryExceeded` by raising
//! `mle` and killing the child. Its outcome reaches the controller through a
//! one-slot channel.

use crate::config::types::{Result, SandboxError};
use crate::kernel::cgroup::backend::GroupId;
use crate::kernel::notify::{GroupEventKind, NotificationSource};
use crate::kernel::process::ChildProcess;
use crate::verdict::flags::VerdictFlags;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MonitorOutcome {
    /// The group emptied without a violation
    Emptied,
    /// Memory ceiling hit; the child was killed
    MemoryExceeded,
    /// The notification source failed
    Failed(String),
}

/// Receiving end of a running monitor
pub struct MonitorHandle {
    outcome: Receiver<MonitorOutcome>,
}

impl MonitorHandle {
    /// Wait up to `timeout` for the monitor to finish.
    ///
    /// `Ok(None)` means it is still running; a failed source becomes
    /// [`SandboxError::Monitor`].
    pub fn finish(&self, timeout: Duration) -> Result<Option<MonitorOutcome>> {
        match self.outcome.recv_timeout(timeout) {
            Ok(MonitorOutcome::Failed(reason)) => Err(SandboxError::Monitor(reason)),
            Ok(outcome) => Ok(Some(outcome)),
            Err(RecvTimeoutError::Timeout) => {
                log::warn!("Limit monitor still running after {:?}", timeout);
                Ok(None)
            }
            Err(RecvTimeoutError::Disconnected) => Err(SandboxError::Monitor(
                "monitor thread exited without reporting".to_string(),
            )),
        }
    }
}

/// Consume events until the group empties or the memory ceiling is hit.
pub fn run_monitor(
    source: &mut dyn NotificationSource,
    group: &GroupId,
    child: &ChildProcess,
    flags: &VerdictFlags,
) -> MonitorOutcome {
    let outcome = loop {
        let event = match source.next_event() {
            Ok(event) => event,
            Err(e) => {
                log::error!("Limit monitor for group {} failed: {}", group, e);
                break MonitorOutcome::Failed(e.to_string());
            }
        };
        if &event.group != group {
            log::debug!("Ignoring event for foreign group {}", event.group);
            continue;
        }
        match event.kind {
            GroupEventKind::Emptied => break MonitorOutcome::Emptied,
            GroupEventKind::MemoryExceeded => {
                flags.mark_mle();
                log::warn!(
                    "Group {} exceeded its memory limit, killing child {}",
                    group,
                    child.pid()
                );
                break match child.terminate_and_reap() {
                    Ok(_) => MonitorOutcome::MemoryExceeded,
                    Err(e) => MonitorOutcome::Failed(e.to_string()),
                };
            }
        }
    };
    source.close();
    outcome
}

/// Start the monitor thread for one launch.
pub fn start_monitor(
    mut source: Box<dyn NotificationSource>,
    group: GroupId,
    child: Arc<ChildProcess>,
    flags: Arc<VerdictFlags>,
) -> Result<MonitorHandle> {
    let (tx, rx) = bounded(1);
    thread::Builder::new()
        .name("limitbox-monitor".to_string())
        .spawn(move || {
            let outcome = run_monitor(source.as_mut(), &group, &child, &flags);
            // The controller may be gone already.
            let _ = tx.send(outcome);
        })
        .map_err(|e| SandboxError::Setup(format!("Failed to start limit monitor: {}", e)))?;
    Ok(MonitorHandle { outcome: rx })
}
