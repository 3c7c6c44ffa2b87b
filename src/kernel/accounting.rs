//! Time and memory accounting for sandboxed children.
//!
//! CPU time and peak RSS come from the `rusage` the kernel hands back when
//! the child is reaped. Live samples (used by the rlimit fallback's
//! notification source) come from `/proc/<pid>/status`.
//!
//! `ru_maxrss` is the maximum over every image the child ever had, and
//! that includes the forked copy of this process that ran until exec. It
//! only describes the program when it rises above that copy's peak; below
//! it, [`program_peak_kb`] falls back to what was observed after exec.

use nix::unistd::Pid;
use std::io;
use std::time::Duration;

/// Resource usage of a reaped child
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResourceUsage {
    /// User plus system CPU time
    pub cpu_time: Duration,
    /// Peak resident set size in KiB
    pub max_rss_kb: u64,
}

fn timeval_to_duration(tv: &libc::timeval) -> Duration {
    Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
}

impl From<&libc::rusage> for ResourceUsage {
    fn from(usage: &libc::rusage) -> Self {
        Self {
            cpu_time: timeval_to_duration(&usage.ru_utime) + timeval_to_duration(&usage.ru_stime),
            // Linux reports ru_maxrss in kilobytes.
            max_rss_kb: usage.ru_maxrss.max(0) as u64,
        }
    }
}

/// Pages the forked image may fault in between fork and exec.
pub const FORK_IMAGE_SLACK_KB: u64 = 512;

/// Peak resident memory of the exec'd program in KiB.
///
/// `fork_image_kb` is the forked copy's `VmHWM` read while it was parked,
/// `observed_kb` the largest post-exec reading (sampled `VmHWM`, cgroup
/// `memory.peak`). An unknown fork image (`0`) leaves `rusage_kb` as is.
pub fn program_peak_kb(rusage_kb: u64, fork_image_kb: u64, observed_kb: u64) -> u64 {
    if fork_image_kb == 0 || rusage_kb > fork_image_kb.saturating_add(FORK_IMAGE_SLACK_KB) {
        rusage_kb
    } else {
        observed_kb.min(rusage_kb)
    }
}

/// Snapshot of a live process taken from `/proc/<pid>/status`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcSnapshot {
    /// Scheduler state letter (`R`, `S`, `Z`, ...)
    pub state: char,
    /// Peak resident set size in KiB (`VmHWM`)
    pub vm_hwm_kb: Option<u64>,
}

impl ProcSnapshot {
    /// The process has exited and is waiting to be reaped.
    pub fn is_exited(&self) -> bool {
        matches!(self.state, 'Z' | 'X')
    }
}

/// Parse the text of a `/proc/<pid>/status` file.
pub fn parse_proc_status(content: &str) -> Option<ProcSnapshot> {
    let mut state = None;
    let mut vm_hwm_kb = None;
    for line in content.lines() {
        if let Some(rest) = line.strip_prefix("State:") {
            state = rest.trim().chars().next();
        } else if let Some(rest) = line.strip_prefix("VmHWM:") {
            vm_hwm_kb = rest
                .split_whitespace()
                .next()
                .and_then(|v| v.parse::<u64>().ok());
        }
    }
    state.map(|state| ProcSnapshot { state, vm_hwm_kb })
}

/// Sample a live process. `Ok(None)` means the process no longer exists.
pub fn sample_process(pid: Pid) -> io::Result<Option<ProcSnapshot>> {
    let path = format!("/proc/{}/status", pid.as_raw());
    match std::fs::read_to_string(&path) {
        Ok(content) => Ok(parse_proc_status(&content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        // ESRCH surfaces when the task disappears mid-read.
        Err(e) if e.raw_os_error() == Some(libc::ESRCH) => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS: &str = "Name:\tsh\nUmask:\t0022\nState:\tS (sleeping)\nTgid:\t4242\n\
VmPeak:\t    2580 kB\nVmSize:\t    2580 kB\nVmHWM:\t    1024 kB\nVmRSS:\t     900 kB\n";

    #[test]
    fn parses_state_and_hwm() {
        let snapshot = parse_proc_status(STATUS).unwrap();
        assert_eq!(snapshot.state, 'S');
        assert_eq!(snapshot.vm_hwm_kb, Some(1024));
        assert!(!snapshot.is_exited());
    }

    #[test]
    fn zombie_has_no_hwm() {
        let snapshot = parse_proc_status("Name:\tsh\nState:\tZ (zombie)\n").unwrap();
        assert!(snapshot.is_exited());
        assert_eq!(snapshot.vm_hwm_kb, None);
    }

    #[test]
    fn rusage_conversion_sums_user_and_system() {
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        usage.ru_utime.tv_sec = 1;
        usage.ru_utime.tv_usec = 250_000;
        usage.ru_stime.tv_usec = 250_000;
        usage.ru_maxrss = 2048;
        let converted = ResourceUsage::from(&usage);
        assert_eq!(converted.cpu_time, Duration::from_millis(1500));
        assert_eq!(converted.max_rss_kb, 2048);
    }

    #[test]
    fn rusage_wins_above_fork_image() {
        assert_eq!(program_peak_kb(300_000, 4096, 120_000), 300_000);
    }

    #[test]
    fn fork_image_peak_is_not_charged() {
        // A 200 MiB controller forking a program that touched 1 MiB.
        assert_eq!(program_peak_kb(204_800, 204_700, 1024), 1024);
        assert_eq!(program_peak_kb(204_800, 204_700, 0), 0);
    }

    #[test]
    fn small_controller_keeps_rusage() {
        assert_eq!(program_peak_kb(2048, 1024, 0), 2048);
        assert_eq!(program_peak_kb(400, 0, 0), 400);
    }

    #[test]
    fn sampling_self_works() {
        let pid = Pid::from_raw(std::process::id() as i32);
        let snapshot = sample_process(pid).unwrap().unwrap();
        assert!(snapshot.vm_hwm_kb.unwrap_or(0) > 0);
    }
}
