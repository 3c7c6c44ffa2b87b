//! Group notification channels.
//!
//! A [`NotificationSource`] turns kernel state changes of one limit group
//! into [`GroupEvent`]s. The cgroup v2 source waits on the group's event
//! files; the rlimit fallback samples `/proc` on a fixed period.

use crate::config::types::{Result, SandboxError};
use crate::kernel::accounting::sample_process;
use crate::kernel::cgroup::backend::GroupId;
use crate::kernel::cgroup::v2::keyed_value;
use crate::kernel::fd::{poll_fd, poll_many};
use crate::kernel::process::ChildProcess;
use std::collections::VecDeque;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GroupEventKind {
    /// The last member of the group terminated
    Emptied,
    /// The group hit its memory ceiling
    MemoryExceeded,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupEvent {
    pub group: GroupId,
    pub kind: GroupEventKind,
}

impl GroupEvent {
    pub fn new(group: GroupId, kind: GroupEventKind) -> Self {
        Self { group, kind }
    }
}

/// Blocking event stream for one group.
pub trait NotificationSource: Send {
    /// Block until the next event. Errors are fatal to the consumer.
    fn next_event(&mut self) -> Result<GroupEvent>;

    /// Release kernel resources early; dropping the source does the same.
    fn close(&mut self) {}
}

fn read_whole(file: &File) -> std::io::Result<String> {
    let mut buf = vec![0u8; 512];
    let mut len = 0;
    loop {
        if len == buf.len() {
            buf.resize(buf.len() * 2, 0);
        }
        let n = file.read_at(&mut buf[len..], len as u64)?;
        if n == 0 {
            break;
        }
        len += n;
    }
    buf.truncate(len);
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Watches `cgroup.events` and `memory.events` of a cgroup v2 group.
pub struct CgroupEventSource {
    group: GroupId,
    files: Option<(File, File)>,
    interval: Duration,
    memory_reported: bool,
    pending: VecDeque<GroupEventKind>,
}

impl CgroupEventSource {
    pub fn open(group: GroupId, path: &Path, interval: Duration) -> Result<Self> {
        let open = |name: &str| {
            File::open(path.join(name)).map_err(|e| {
                SandboxError::Cgroup(format!("Failed to open {}/{}: {}", path.display(), name, e))
            })
        };
        Ok(Self {
            group,
            files: Some((open("cgroup.events")?, open("memory.events")?)),
            interval,
            memory_reported: false,
            pending: VecDeque::new(),
        })
    }

    fn scan(&mut self) -> Result<()> {
        let (cgroup_events, memory_events) = self
            .files
            .as_ref()
            .ok_or_else(|| SandboxError::Monitor("notification source closed".to_string()))?;
        let memory = read_whole(memory_events)
            .map_err(|e| SandboxError::Monitor(format!("memory.events: {}", e)))?;
        let populated = read_whole(cgroup_events)
            .map_err(|e| SandboxError::Monitor(format!("cgroup.events: {}", e)))?;

        let ooms = keyed_value(&memory, "oom").unwrap_or(0)
            + keyed_value(&memory, "oom_kill").unwrap_or(0);
        if ooms > 0 && !self.memory_reported {
            self.memory_reported = true;
            self.pending.push_back(GroupEventKind::MemoryExceeded);
        }
        if keyed_value(&populated, "populated") == Some(0) {
            self.pending.push_back(GroupEventKind::Emptied);
        }
        Ok(())
    }
}

impl NotificationSource for CgroupEventSource {
    fn next_event(&mut self) -> Result<GroupEvent> {
        loop {
            if let Some(kind) = self.pending.pop_front() {
                return Ok(GroupEvent::new(self.group.clone(), kind));
            }
            self.scan()?;
            if !self.pending.is_empty() {
                continue;
            }
            let fds = match self.files.as_ref() {
                Some((a, b)) => [a.as_raw_fd(), b.as_raw_fd()],
                None => return Err(SandboxError::Monitor("notification source closed".to_string())),
            };
            poll_many(&fds, libc::POLLPRI, self.interval)
                .map_err(|e| SandboxError::Monitor(format!("poll on cgroup events: {}", e)))?;
        }
    }

    fn close(&mut self) {
        self.files = None;
    }
}

/// Samples the child's `/proc` entry; used with the rlimit fallback group.
pub struct SamplingEventSource {
    group: GroupId,
    child: Arc<ChildProcess>,
    memory_limit_kb: u64,
    interval: Duration,
    memory_reported: bool,
    closed: bool,
}

impl SamplingEventSource {
    pub fn new(
        group: GroupId,
        child: Arc<ChildProcess>,
        memory_limit_kb: u64,
        interval: Duration,
    ) -> Self {
        Self {
            group,
            child,
            memory_limit_kb,
            interval,
            memory_reported: false,
            closed: false,
        }
    }

    fn sample(&mut self) -> Result<Option<GroupEventKind>> {
        if self.closed || self.child.exit_record().is_some() {
            return Ok(Some(GroupEventKind::Emptied));
        }
        let snapshot = sample_process(self.child.pid()).map_err(|e| {
            SandboxError::Monitor(format!("sampling pid {}: {}", self.child.pid(), e))
        })?;
        let snapshot = match snapshot {
            Some(snapshot) if !snapshot.is_exited() => snapshot,
            _ => return Ok(Some(GroupEventKind::Emptied)),
        };
        // Before exec the child is still a copy of this process; its peak RSS
        // says nothing about the submission.
        if let (true, Some(hwm)) = (self.child.exec_confirmed(), snapshot.vm_hwm_kb) {
            self.child.observe_peak(hwm);
            if !self.memory_reported && hwm > self.memory_limit_kb {
                self.memory_reported = true;
                return Ok(Some(GroupEventKind::MemoryExceeded));
            }
        }
        Ok(None)
    }

    fn pause(&self) -> Result<()> {
        match self.child.pidfd() {
            Some(fd) => {
                poll_fd(fd, libc::POLLIN, self.interval)
                    .map_err(|e| SandboxError::Monitor(format!("poll on pidfd: {}", e)))?;
            }
            None => std::thread::sleep(self.interval),
        }
        Ok(())
    }
}

impl NotificationSource for SamplingEventSource {
    fn next_event(&mut self) -> Result<GroupEvent> {
        loop {
            if let Some(kind) = self.sample()? {
                return Ok(GroupEvent::new(self.group.clone(), kind));
            }
            self.pause()?;
        }
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;
    use std::process::Command;

    fn adopt(program: &str, args: &[&str]) -> Arc<ChildProcess> {
        let child = Command::new(program).args(args).spawn().unwrap();
        Arc::new(ChildProcess::new(Pid::from_raw(child.id() as i32)))
    }

    #[test]
    fn sampler_reports_emptied_after_exit() {
        let child = adopt("/bin/sh", &["-c", "exit 0"]);
        let group = GroupId::from("sampler-exit");
        let mut source = SamplingEventSource::new(
            group.clone(),
            Arc::clone(&child),
            1 << 20,
            Duration::from_millis(5),
        );
        let event = source.next_event().unwrap();
        assert_eq!(event, GroupEvent::new(group, GroupEventKind::Emptied));
        child.wait().unwrap();
    }

    #[test]
    fn sampler_ignores_memory_before_exec_confirmation() {
        let child = adopt("/bin/sleep", &["0.3"]);
        let mut source = SamplingEventSource::new(
            GroupId::from("sampler-gate"),
            Arc::clone(&child),
            1,
            Duration::from_millis(5),
        );
        assert_eq!(source.next_event().unwrap().kind, GroupEventKind::Emptied);
        assert_eq!(child.observed_peak_kb(), 0);
        child.wait().unwrap();
    }

    #[test]
    fn sampler_reports_memory_once_confirmed() {
        let child = adopt("/bin/sleep", &["5"]);
        child.mark_exec_confirmed();
        let mut source = SamplingEventSource::new(
            GroupId::from("sampler-mle"),
            Arc::clone(&child),
            1,
            Duration::from_millis(5),
        );
        assert_eq!(
            source.next_event().unwrap().kind,
            GroupEventKind::MemoryExceeded
        );
        assert!(child.observed_peak_kb() > 1);
        child.terminate_and_reap().unwrap();
        assert_eq!(source.next_event().unwrap().kind, GroupEventKind::Emptied);
    }

    #[test]
    fn closed_sampler_reports_emptied() {
        let child = adopt("/bin/sleep", &["5"]);
        let mut source = SamplingEventSource::new(
            GroupId::from("sampler-closed"),
            Arc::clone(&child),
            1 << 20,
            Duration::from_millis(5),
        );
        source.close();
        assert_eq!(source.next_event().unwrap().kind, GroupEventKind::Emptied);
        child.terminate_and_reap().unwrap();
    }

    #[test]
    fn cgroup_source_reads_plain_event_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cgroup.events"), "populated 0\nfrozen 0\n").unwrap();
        std::fs::write(
            dir.path().join("memory.events"),
            "low 0\nhigh 0\nmax 4\noom 1\noom_kill 1\n",
        )
        .unwrap();
        let group = GroupId::from("cgroup-files");
        let mut source =
            CgroupEventSource::open(group.clone(), dir.path(), Duration::from_millis(5)).unwrap();
        assert_eq!(
            source.next_event().unwrap(),
            GroupEvent::new(group.clone(), GroupEventKind::MemoryExceeded)
        );
        assert_eq!(
            source.next_event().unwrap(),
            GroupEvent::new(group, GroupEventKind::Emptied)
        );
    }

    #[test]
    fn cgroup_source_requires_event_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(CgroupEventSource::open(GroupId::from("x"), dir.path(), Duration::from_millis(5))
            .is_err());
    }
}
