/// Cgroup v2 limit group
///
/// One directory per launch under the configured root. `memory.max` and
/// `pids.max` are written at creation and never touched again; the child is
/// attached through `cgroup.procs` while it is still suspended.
use crate::config::types::{BackendKind, Result, SandboxError};
use crate::kernel::cgroup::backend::{GroupId, GroupLimits, LimitGroup};
use crate::kernel::notify::{CgroupEventSource, NotificationSource};
use crate::kernel::process::ChildProcess;
use nix::unistd::Pid;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const REMOVE_ATTEMPTS: u32 = 50;
const REMOVE_BACKOFF: Duration = Duration::from_millis(10);

/// Read one counter from a flat-keyed cgroup file (`memory.events`,
/// `cgroup.events`).
pub(crate) fn keyed_value(content: &str, key: &str) -> Option<u64> {
    content.lines().find_map(|line| {
        let mut parts = line.split_whitespace();
        match (parts.next(), parts.next()) {
            (Some(k), Some(v)) if k == key => v.parse::<u64>().ok(),
            _ => None,
        }
    })
}

fn write_file(path: &Path, value: &str) -> Result<()> {
    fs::write(path, value)
        .map_err(|e| SandboxError::Cgroup(format!("Failed to write {}: {}", path.display(), e)))
}

/// Enable the controllers a run group needs in `root`'s children.
fn enable_controllers(root: &Path) -> Result<()> {
    let available = fs::read_to_string(root.join("cgroup.controllers")).map_err(|e| {
        SandboxError::Cgroup(format!(
            "{} is not a cgroup v2 directory: {}",
            root.display(),
            e
        ))
    })?;
    for controller in ["memory", "pids"] {
        if !available.split_whitespace().any(|c| c == controller) {
            return Err(SandboxError::Cgroup(format!(
                "{} controller not delegated to {}",
                controller,
                root.display()
            )));
        }
    }
    let control = root.join("cgroup.subtree_control");
    let enabled = fs::read_to_string(&control).unwrap_or_default();
    if enabled.contains("memory") && enabled.contains("pids") {
        return Ok(());
    }
    write_file(&control, "+memory +pids")
}

/// Per-launch cgroup v2 directory
pub struct CgroupV2Group {
    id: GroupId,
    path: PathBuf,
    limits: GroupLimits,
}

impl CgroupV2Group {
    /// Create `<root>/<uuid>` and write its limits.
    pub fn create(root: &Path, limits: GroupLimits) -> Result<Self> {
        if !root.exists() {
            fs::create_dir_all(root).map_err(|e| {
                SandboxError::Cgroup(format!("Failed to create {}: {}", root.display(), e))
            })?;
        }
        enable_controllers(root)?;

        let id = GroupId::generate();
        let path = root.join(id.as_str());
        fs::create_dir(&path).map_err(|e| {
            SandboxError::Cgroup(format!("Failed to create cgroup {}: {}", path.display(), e))
        })?;
        // Constructed before any limit write so a failure below still removes
        // the directory.
        let group = CgroupV2Group { id, path, limits };

        write_file(
            &group.path.join("memory.max"),
            &limits.memory_limit_bytes().to_string(),
        )?;
        write_file(
            &group.path.join("pids.max"),
            &limits.process_limit.to_string(),
        )?;
        if let Err(e) = write_file(&group.path.join("memory.swap.max"), "0") {
            log::debug!("memory.swap.max not applied: {}", e);
        }
        if let Err(e) = write_file(&group.path.join("memory.oom.group"), "1") {
            log::warn!("memory.oom.group not applied: {}", e);
        }

        log::debug!(
            "Created cgroup {} (memory.max={} pids.max={})",
            group.path.display(),
            limits.memory_limit_bytes(),
            limits.process_limit
        );
        Ok(group)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn remove(&self) {
        let kill = self.path.join("cgroup.kill");
        if kill.exists() {
            if let Err(e) = fs::write(&kill, "1") {
                log::debug!("cgroup.kill on {} failed: {}", self.path.display(), e);
            }
        }
        for attempt in 0..REMOVE_ATTEMPTS {
            match fs::remove_dir(&self.path) {
                Ok(()) => return,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
                Err(e) if attempt + 1 == REMOVE_ATTEMPTS => {
                    log::error!("Failed to remove cgroup {}: {}", self.path.display(), e);
                }
                Err(_) => std::thread::sleep(REMOVE_BACKOFF),
            }
        }
    }
}

impl LimitGroup for CgroupV2Group {
    fn id(&self) -> &GroupId {
        &self.id
    }

    fn kind(&self) -> BackendKind {
        BackendKind::CgroupV2
    }

    fn limits(&self) -> &GroupLimits {
        &self.limits
    }

    fn attach(&self, pid: Pid) -> Result<()> {
        write_file(&self.path.join("cgroup.procs"), &pid.as_raw().to_string())
    }

    /// `memory.peak` (Linux 5.19+). The fork image stays charged to the
    /// parent's cgroup, so this only covers what was faulted in after attach.
    fn peak_memory_kb(&self) -> Option<u64> {
        match fs::read_to_string(self.path.join("memory.peak")) {
            Ok(content) => content.trim().parse::<u64>().ok().map(|bytes| bytes / 1024),
            Err(e) => {
                log::debug!("memory.peak of {} unreadable: {}", self.path.display(), e);
                None
            }
        }
    }

    fn open_notifications(
        &self,
        _child: &Arc<ChildProcess>,
        interval: Duration,
    ) -> Result<Box<dyn NotificationSource>> {
        Ok(Box::new(CgroupEventSource::open(
            self.id.clone(),
            &self.path,
            interval,
        )?))
    }
}

impl Drop for CgroupV2Group {
    fn drop(&mut self) {
        self.remove();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyed_values_are_parsed() {
        let events = "low 0\nhigh 0\nmax 3\noom 1\noom_kill 1\n";
        assert_eq!(keyed_value(events, "oom"), Some(1));
        assert_eq!(keyed_value(events, "max"), Some(3));
        assert_eq!(keyed_value(events, "oom_group_kill"), None);
        assert_eq!(keyed_value("populated 0\nfrozen 0\n", "populated"), Some(0));
    }

    #[test]
    fn plain_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = CgroupV2Group::create(dir.path(), GroupLimits::new(1.0, 1024, 1));
        assert!(matches!(result, Err(SandboxError::Cgroup(_))));
    }

    #[test]
    fn group_is_removed_on_drop() {
        let root = PathBuf::from(crate::config::types::DEFAULT_CGROUP_ROOT);
        let group = match CgroupV2Group::create(&root, GroupLimits::new(1.0, 65536, 1)) {
            Ok(group) => group,
            // Needs root and a delegated hierarchy.
            Err(_) => return,
        };
        let path = group.path().to_path_buf();
        assert!(path.join("cgroup.procs").exists());
        assert_eq!(
            fs::read_to_string(path.join("pids.max")).unwrap().trim(),
            "1"
        );
        let events = fs::read_to_string(path.join("memory.events")).unwrap();
        assert_eq!(keyed_value(&events, "oom_kill"), Some(0));
        assert!(group.peak_memory_kb().map_or(true, |kb| kb < 1024));
        drop(group);
        assert!(!path.exists());
    }
}
