//! Fallback group built from per-process rlimits.
//!
//! CPU time is enforced by RLIMIT_CPU (installed for every backend), memory
//! by the sampling notification source. The process ceiling cannot be
//! expressed per child (RLIMIT_NPROC counts per user) and is not enforced.

use crate::config::types::{BackendKind, Result};
use crate::kernel::cgroup::backend::{GroupId, GroupLimits, LimitGroup};
use crate::kernel::notify::{NotificationSource, SamplingEventSource};
use crate::kernel::process::ChildProcess;
use nix::unistd::Pid;
use std::sync::{Arc, Once};
use std::time::Duration;

static PROCESS_LIMIT_WARNING: Once = Once::new();

pub struct RlimitGroup {
    id: GroupId,
    limits: GroupLimits,
}

impl RlimitGroup {
    pub fn new(limits: GroupLimits) -> Self {
        PROCESS_LIMIT_WARNING.call_once(|| {
            log::warn!("rlimit backend: process count limit is not enforced");
        });
        Self {
            id: GroupId::generate(),
            limits,
        }
    }
}

impl LimitGroup for RlimitGroup {
    fn id(&self) -> &GroupId {
        &self.id
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Rlimit
    }

    fn limits(&self) -> &GroupLimits {
        &self.limits
    }

    fn attach(&self, pid: Pid) -> Result<()> {
        log::debug!("rlimit group {} tracks pid {}", self.id, pid);
        Ok(())
    }

    fn open_notifications(
        &self,
        child: &Arc<ChildProcess>,
        interval: Duration,
    ) -> Result<Box<dyn NotificationSource>> {
        Ok(Box::new(SamplingEventSource::new(
            self.id.clone(),
            Arc::clone(child),
            self.limits.memory_limit_kb,
            interval,
        )))
    }
}
