//! Fork a child that waits at a gate before it execs.
//!
//! Everything the child touches is prepared before `fork`: C strings, the
//! argv pointer array, rlimit values and descriptor numbers. Between `fork`
//! and `execv` the child only makes async-signal-safe libc calls, because
//! the parent is multi-threaded.
//!
//! Child protocol:
//! 1. close the parent's pipe ends and every descriptor it does not need
//! 2. block reading one byte from the gate pipe (EOF means abort)
//! 3. start a new session, redirect stdio, reset signal state, chdir,
//!    install rlimits, exec
//! 4. on failure write `[stage, errno as i32 LE]` to the exec-status pipe
//!    and `_exit(127)`
//!
//! The exec-status pipe is close-on-exec, so the parent reads EOF with no
//! payload exactly when exec succeeded.

use crate::config::types::{Result, SandboxError};
use crate::kernel::cgroup::backend::ChildRlimit;
use crate::kernel::fd::{above_stdio, cloexec_pipe};
use nix::unistd::Pid;
use std::ffi::{CString, OsStr};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

const CHILD_FAILURE_EXIT: libc::c_int = 127;
const STATUS_LEN: usize = 5;

/// Step of child setup that failed
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildStage {
    Stdio = 1,
    Chdir = 2,
    Rlimit = 3,
    Exec = 4,
    Session = 5,
}

impl ChildStage {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Stdio),
            2 => Some(Self::Chdir),
            3 => Some(Self::Rlimit),
            4 => Some(Self::Exec),
            5 => Some(Self::Session),
            _ => None,
        }
    }

    fn describe(&self) -> &'static str {
        match self {
            Self::Stdio => "redirecting stdio",
            Self::Chdir => "changing working directory",
            Self::Rlimit => "installing resource limits",
            Self::Exec => "executing program",
            Self::Session => "creating a session",
        }
    }
}

fn c_string(value: &OsStr, what: &str) -> Result<CString> {
    CString::new(value.as_bytes())
        .map_err(|_| SandboxError::Setup(format!("{} contains a NUL byte", what)))
}

/// Resolve a bare program name against `PATH`; paths with a slash are kept.
fn resolve_program(executable: &Path) -> PathBuf {
    if executable.as_os_str().as_bytes().contains(&b'/') {
        return executable.to_path_buf();
    }
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths)
                .map(|dir| dir.join(executable))
                .find(|candidate| candidate.is_file())
        })
        .unwrap_or_else(|| executable.to_path_buf())
}

/// Everything the child needs, owned by the parent across `fork`.
pub struct SpawnPlan {
    program: CString,
    argv: Vec<CString>,
    workdir: CString,
    rlimits: Vec<ChildRlimit>,
}

impl SpawnPlan {
    pub fn new(
        executable: &Path,
        args: &[String],
        workdir: &Path,
        rlimits: Vec<ChildRlimit>,
    ) -> Result<Self> {
        let program_path = resolve_program(executable);
        let program = c_string(program_path.as_os_str(), "executable path")?;
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(c_string(executable.as_os_str(), "executable path")?);
        for arg in args {
            argv.push(c_string(OsStr::new(arg), "argument")?);
        }
        Ok(Self {
            program,
            argv,
            workdir: c_string(workdir.as_os_str(), "working directory")?,
            rlimits,
        })
    }

    pub fn program(&self) -> &CString {
        &self.program
    }
}

/// Parent ends of the child's standard streams
#[derive(Debug)]
pub struct ChildPipes {
    pub stdin: File,
    pub stdout: File,
    pub stderr: File,
}

/// A forked child parked at its gate
pub struct ForkedChild {
    pub pid: Pid,
    pub gate: OwnedFd,
    pub exec_status: OwnedFd,
    pub pipes: ChildPipes,
}

/// Raw view of the descriptors handed to the child.
struct ChildFds {
    stdin: RawFd,
    stdout: RawFd,
    stderr: RawFd,
    gate: RawFd,
    status: RawFd,
    parent_ends: [RawFd; 5],
}

/// Runs in the forked child. Only async-signal-safe calls are allowed.
unsafe fn child_main(
    fds: &ChildFds,
    program: *const libc::c_char,
    argv: &[*const libc::c_char],
    workdir: *const libc::c_char,
    rlimits: &[ChildRlimit],
) -> ! {
    for fd in fds.parent_ends {
        libc::close(fd);
    }
    close_unneeded(fds);

    let mut byte = 0u8;
    loop {
        let n = libc::read(fds.gate, &mut byte as *mut u8 as *mut libc::c_void, 1);
        if n == 1 {
            break;
        }
        if n < 0 && *libc::__errno_location() == libc::EINTR {
            continue;
        }
        // Parent went away or aborted the launch.
        libc::_exit(CHILD_FAILURE_EXIT);
    }
    libc::close(fds.gate);

    // Own process group, so a forced kill reaches helpers the program forks.
    if libc::setsid() < 0 {
        report_failure(fds.status, ChildStage::Session);
    }
    if libc::dup2(fds.stdin, 0) < 0 || libc::dup2(fds.stdout, 1) < 0 || libc::dup2(fds.stderr, 2) < 0
    {
        report_failure(fds.status, ChildStage::Stdio);
    }

    let mut empty: libc::sigset_t = std::mem::zeroed();
    libc::sigemptyset(&mut empty);
    libc::pthread_sigmask(libc::SIG_SETMASK, &empty, std::ptr::null_mut());
    // The Rust runtime ignores SIGPIPE; the submission gets the default.
    libc::signal(libc::SIGPIPE, libc::SIG_DFL);

    if libc::chdir(workdir) != 0 {
        report_failure(fds.status, ChildStage::Chdir);
    }
    for limit in rlimits {
        let value = libc::rlimit {
            rlim_cur: limit.soft,
            rlim_max: limit.hard,
        };
        if libc::setrlimit(limit.resource, &value) != 0 {
            report_failure(fds.status, ChildStage::Rlimit);
        }
    }

    libc::execv(program, argv.as_ptr());
    report_failure(fds.status, ChildStage::Exec)
}

/// Close every descriptor above stdio except the ones the child still uses.
unsafe fn close_unneeded(fds: &ChildFds) {
    let mut keep = [fds.stdin, fds.stdout, fds.stderr, fds.gate, fds.status];
    keep.sort_unstable();
    let mut next: libc::c_uint = 3;
    for fd in keep {
        let fd = fd as libc::c_uint;
        if fd > next {
            libc::syscall(libc::SYS_close_range, next, fd - 1, 0 as libc::c_uint);
        }
        if fd >= next {
            next = fd + 1;
        }
    }
    // Unsupported kernels leave the rest open; they are close-on-exec anyway.
    libc::syscall(libc::SYS_close_range, next, libc::c_uint::MAX, 0 as libc::c_uint);
}

unsafe fn report_failure(status_fd: RawFd, stage: ChildStage) -> ! {
    let errno = *libc::__errno_location();
    let mut buf = [0u8; STATUS_LEN];
    buf[0] = stage as u8;
    buf[1..].copy_from_slice(&errno.to_le_bytes());
    libc::write(status_fd, buf.as_ptr() as *const libc::c_void, STATUS_LEN);
    libc::_exit(CHILD_FAILURE_EXIT)
}

fn pipe_above_stdio() -> io::Result<(OwnedFd, OwnedFd)> {
    let (read_end, write_end) = cloexec_pipe()?;
    Ok((above_stdio(read_end)?, above_stdio(write_end)?))
}

/// Fork a child that blocks at its gate until [`release_gate`].
pub fn fork_suspended(plan: &SpawnPlan) -> Result<ForkedChild> {
    let setup = |what: &str, e: io::Error| SandboxError::Setup(format!("{}: {}", what, e));
    let (stdin_r, stdin_w) = pipe_above_stdio().map_err(|e| setup("stdin pipe", e))?;
    let (stdout_r, stdout_w) = pipe_above_stdio().map_err(|e| setup("stdout pipe", e))?;
    let (stderr_r, stderr_w) = pipe_above_stdio().map_err(|e| setup("stderr pipe", e))?;
    let (gate_r, gate_w) = pipe_above_stdio().map_err(|e| setup("gate pipe", e))?;
    let (status_r, status_w) = pipe_above_stdio().map_err(|e| setup("exec status pipe", e))?;

    let mut argv: Vec<*const libc::c_char> = plan.argv.iter().map(|a| a.as_ptr()).collect();
    argv.push(std::ptr::null());

    let fds = ChildFds {
        stdin: stdin_r.as_raw_fd(),
        stdout: stdout_w.as_raw_fd(),
        stderr: stderr_w.as_raw_fd(),
        gate: gate_r.as_raw_fd(),
        status: status_w.as_raw_fd(),
        parent_ends: [
            stdin_w.as_raw_fd(),
            stdout_r.as_raw_fd(),
            stderr_r.as_raw_fd(),
            gate_w.as_raw_fd(),
            status_r.as_raw_fd(),
        ],
    };

    // SAFETY: the child branch only calls async-signal-safe functions on
    // data prepared above and never returns.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(setup("fork", io::Error::last_os_error()));
    }
    if pid == 0 {
        unsafe {
            child_main(
                &fds,
                plan.program.as_ptr(),
                &argv,
                plan.workdir.as_ptr(),
                &plan.rlimits,
            )
        }
    }

    // Child-side ends close here; only the child holds them now.
    drop((stdin_r, stdout_w, stderr_w, gate_r, status_w));
    log::debug!("Forked suspended child {}", pid);

    Ok(ForkedChild {
        pid: Pid::from_raw(pid),
        gate: gate_w,
        exec_status: status_r,
        pipes: ChildPipes {
            stdin: File::from(stdin_w),
            stdout: File::from(stdout_r),
            stderr: File::from(stderr_r),
        },
    })
}

/// Let the child proceed to exec.
pub fn release_gate(gate: OwnedFd) -> Result<()> {
    let mut gate = File::from(gate);
    gate.write_all(&[1])
        .map_err(|e| SandboxError::Setup(format!("Failed to release child gate: {}", e)))
}

/// Block until the child execs or reports a setup failure.
pub fn read_exec_status(status: OwnedFd) -> Result<()> {
    let mut buf = Vec::with_capacity(STATUS_LEN);
    File::from(status)
        .read_to_end(&mut buf)
        .map_err(|e| SandboxError::Setup(format!("Failed to read exec status: {}", e)))?;
    decode_exec_status(&buf)
}

fn decode_exec_status(buf: &[u8]) -> Result<()> {
    if buf.is_empty() {
        return Ok(());
    }
    if buf.len() != STATUS_LEN {
        return Err(SandboxError::Setup(format!(
            "child sent a malformed exec status ({} bytes)",
            buf.len()
        )));
    }
    let errno = i32::from_le_bytes([buf[1], buf[2], buf[3], buf[4]]);
    let stage = ChildStage::from_byte(buf[0])
        .map(|s| s.describe())
        .unwrap_or("unknown setup step");
    Err(SandboxError::Setup(format!(
        "child failed while {}: {}",
        stage,
        io::Error::from_raw_os_error(errno)
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::process::ChildProcess;

    fn plan(program: &str, args: &[&str], workdir: &str) -> SpawnPlan {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        SpawnPlan::new(Path::new(program), &args, Path::new(workdir), Vec::new()).unwrap()
    }

    #[test]
    fn exec_status_decoding() {
        assert!(decode_exec_status(&[]).is_ok());
        let mut buf = vec![ChildStage::Chdir as u8];
        buf.extend_from_slice(&libc::ENOENT.to_le_bytes());
        let err = decode_exec_status(&buf).unwrap_err().to_string();
        assert!(err.contains("changing working directory"), "{}", err);
        assert!(decode_exec_status(&[4, 0]).is_err());
    }

    #[test]
    fn nul_in_argument_is_rejected() {
        let args = vec!["a\0b".to_string()];
        assert!(SpawnPlan::new(Path::new("/bin/true"), &args, Path::new("/"), Vec::new()).is_err());
    }

    #[test]
    fn bare_names_resolve_through_path() {
        let plan = plan("sh", &[], "/");
        assert!(plan.program().to_bytes().starts_with(b"/"));
    }

    #[test]
    fn gated_child_runs_after_release() {
        let forked = fork_suspended(&plan("/bin/sh", &["-c", "echo gated"], "/")).unwrap();
        let child = ChildProcess::new(forked.pid);
        assert!(child.try_wait().unwrap().is_none());
        release_gate(forked.gate).unwrap();
        read_exec_status(forked.exec_status).unwrap();
        drop(forked.pipes.stdin);
        let mut out = String::new();
        let mut stdout = forked.pipes.stdout;
        stdout.read_to_string(&mut out).unwrap();
        assert_eq!(out, "gated\n");
        assert_eq!(child.wait().unwrap().status.returncode(0), 0);
    }

    #[test]
    fn missing_binary_reports_exec_stage() {
        let forked = fork_suspended(&plan("/nonexistent/limitbox-binary", &[], "/")).unwrap();
        let child = ChildProcess::new(forked.pid);
        release_gate(forked.gate).unwrap();
        let err = read_exec_status(forked.exec_status).unwrap_err().to_string();
        assert!(err.contains("executing program"), "{}", err);
        assert_eq!(child.wait().unwrap().status.returncode(0), 127);
    }

    #[test]
    fn closed_gate_aborts_child() {
        let forked = fork_suspended(&plan("/bin/true", &[], "/")).unwrap();
        let child = ChildProcess::new(forked.pid);
        drop(forked.gate);
        assert_eq!(child.wait().unwrap().status.returncode(0), 127);
    }
}
