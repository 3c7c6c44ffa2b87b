//! Resource-limited group abstraction with cgroup v2 and rlimit backends.

use crate::config::types::{BackendKind, Result, SandboxConfig, SandboxError};
use crate::kernel::cgroup::rlimit::RlimitGroup;
use crate::kernel::cgroup::v2::CgroupV2Group;
use crate::kernel::notify::NotificationSource;
use crate::kernel::process::ChildProcess;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Identity of one group; carried by every notification event.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupId(String);

impl GroupId {
    pub fn generate() -> Self {
        GroupId(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for GroupId {
    fn from(value: &str) -> Self {
        GroupId(value.to_string())
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A resource limit installed in the child right before exec.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChildRlimit {
    pub resource: libc::__rlimit_resource_t,
    pub soft: libc::rlim_t,
    pub hard: libc::rlim_t,
}

/// Limits fixed at group creation
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GroupLimits {
    /// Wall-clock and CPU budget in seconds
    pub time_limit: f64,
    /// Memory ceiling in KiB
    pub memory_limit_kb: u64,
    /// Maximum number of live processes
    pub process_limit: u32,
}

impl GroupLimits {
    pub fn new(time_limit: f64, memory_limit_kb: u64, process_limit: u32) -> Self {
        Self {
            time_limit,
            memory_limit_kb,
            process_limit: process_limit.max(1),
        }
    }

    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_kb.saturating_mul(1024)
    }

    /// RLIMIT_CPU granularity is whole seconds, so the budget rounds up.
    pub fn cpu_limit_secs(&self) -> u64 {
        (self.time_limit.ceil() as u64).max(1)
    }

    pub fn wall_limit(&self) -> Duration {
        Duration::try_from_secs_f64(self.time_limit).unwrap_or(Duration::MAX)
    }

    /// Limits applied inside the child on every backend.
    ///
    /// The hard CPU limit sits one second above the soft limit so the kernel
    /// delivers SIGXCPU before SIGKILL.
    pub fn child_rlimits(&self) -> Vec<ChildRlimit> {
        let cpu = self.cpu_limit_secs() as libc::rlim_t;
        vec![
            ChildRlimit {
                resource: libc::RLIMIT_CPU,
                soft: cpu,
                hard: cpu.saturating_add(1),
            },
            ChildRlimit {
                resource: libc::RLIMIT_CORE,
                soft: 0,
                hard: 0,
            },
        ]
    }
}

/// A kernel-level container that constrains one child.
///
/// Limits are immutable after creation. Dropping the group releases its
/// kernel object; callers drop it only after the child has been reaped.
pub trait LimitGroup: Send + Sync {
    fn id(&self) -> &GroupId;
    /// Concrete backend, never [`BackendKind::Auto`].
    fn kind(&self) -> BackendKind;
    fn limits(&self) -> &GroupLimits;
    /// Place a suspended child into the group.
    fn attach(&self, pid: Pid) -> Result<()>;
    /// Peak memory charged to the group in KiB, when the backend tracks it.
    fn peak_memory_kb(&self) -> Option<u64> {
        None
    }
    /// Open the notification channel observing this group.
    fn open_notifications(
        &self,
        child: &Arc<ChildProcess>,
        interval: Duration,
    ) -> Result<Box<dyn NotificationSource>>;
}

/// cgroup v2 is usable when the unified hierarchy is mounted.
pub fn cgroup_v2_available() -> bool {
    Path::new("/sys/fs/cgroup/cgroup.controllers").exists()
}

/// Backend `Auto` would resolve to on this host, ignoring privileges.
pub fn detect_backend() -> BackendKind {
    if cgroup_v2_available() {
        BackendKind::CgroupV2
    } else {
        BackendKind::Rlimit
    }
}

pub fn backend_name(kind: BackendKind) -> &'static str {
    match kind {
        BackendKind::Auto => "auto",
        BackendKind::CgroupV2 => "cgroup_v2",
        BackendKind::Rlimit => "rlimit",
    }
}

/// Create the group for one launch according to the configured backend.
pub fn create_limit_group(
    config: &SandboxConfig,
    limits: GroupLimits,
) -> Result<Box<dyn LimitGroup>> {
    log::info!(
        "Limit group selection: backend={}, strict_mode={}, detected={}",
        backend_name(config.backend),
        config.strict_mode,
        backend_name(detect_backend())
    );

    match config.backend {
        BackendKind::CgroupV2 => Ok(Box::new(CgroupV2Group::create(
            &config.cgroup_root,
            limits,
        )?)),
        BackendKind::Rlimit => {
            if config.strict_mode {
                return Err(SandboxError::Config(
                    "rlimit backend requested in strict mode".to_string(),
                ));
            }
            Ok(Box::new(RlimitGroup::new(limits)))
        }
        BackendKind::Auto => {
            let attempt = if cgroup_v2_available() {
                CgroupV2Group::create(&config.cgroup_root, limits)
            } else {
                Err(SandboxError::Cgroup(
                    "cgroup v2 hierarchy not mounted".to_string(),
                ))
            };
            match attempt {
                Ok(group) => {
                    log::info!("Using cgroup v2 group {}", group.id());
                    Ok(Box::new(group))
                }
                Err(e) if config.strict_mode => Err(SandboxError::Cgroup(format!(
                    "no cgroup backend usable in strict mode: {}",
                    e
                ))),
                Err(e) => {
                    log::warn!("cgroup v2 unusable ({}), falling back to rlimit group", e);
                    Ok(Box::new(RlimitGroup::new(limits)))
                }
            }
        }
    }
}
