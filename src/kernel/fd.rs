//! File descriptor helpers: close-on-exec pipes and single-fd poll.
//!
//! Every descriptor created here carries `O_CLOEXEC`. A child only receives a
//! descriptor through an explicit `dup2` onto its standard streams, so
//! concurrent launches from other threads never leak pipe ends into each
//! other's children.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

/// Create a pipe as `(read_end, write_end)`, both close-on-exec.
pub fn cloexec_pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    // SAFETY: `fds` is a valid two-element buffer for pipe2 to fill.
    let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: pipe2 succeeded, so both descriptors are open and owned by us.
    let read_end = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let write_end = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    Ok((read_end, write_end))
}

/// Move a descriptor above the standard streams, keeping close-on-exec.
///
/// A child redirects its stdio with `dup2(src, 0..=2)`; a source that already
/// sits on one of those numbers would be clobbered by an earlier redirect.
pub fn above_stdio(fd: OwnedFd) -> io::Result<OwnedFd> {
    let raw = fd.as_raw_fd();
    if raw > 2 {
        return Ok(fd);
    }
    // SAFETY: F_DUPFD_CLOEXEC only reads `raw`, which `fd` keeps open.
    let moved = unsafe { libc::fcntl(raw, libc::F_DUPFD_CLOEXEC, 3) };
    if moved < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fcntl returned a fresh descriptor we now own.
    Ok(unsafe { OwnedFd::from_raw_fd(moved) })
}

/// Wait until `fd` reports any of `events` or the timeout elapses.
///
/// Returns the reported `revents` (0 on timeout). `EINTR` is retried with the
/// full timeout, which only ever lengthens a wait that callers re-check.
pub fn poll_fd(fd: RawFd, events: libc::c_short, timeout: Duration) -> io::Result<libc::c_short> {
    let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    loop {
        // SAFETY: `pfd` is a single valid pollfd entry.
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc >= 0 {
            return Ok(if rc == 0 { 0 } else { pfd.revents });
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Wait on several descriptors at once; returns `revents` per entry.
pub fn poll_many(
    fds: &[RawFd],
    events: libc::c_short,
    timeout: Duration,
) -> io::Result<Vec<libc::c_short>> {
    let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;
    let mut pfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events,
            revents: 0,
        })
        .collect();
    loop {
        // SAFETY: `pfds` holds `pfds.len()` initialised pollfd entries.
        let rc = unsafe { libc::poll(pfds.as_mut_ptr(), pfds.len() as libc::nfds_t, timeout_ms) };
        if rc >= 0 {
            return Ok(pfds.iter().map(|p| p.revents).collect());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    #[test]
    fn pipe_ends_are_cloexec() {
        let (read_end, write_end) = cloexec_pipe().unwrap();
        for fd in [read_end.as_raw_fd(), write_end.as_raw_fd()] {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
            assert!(flags >= 0);
            assert_ne!(flags & libc::FD_CLOEXEC, 0);
        }
    }

    #[test]
    fn poll_times_out_on_idle_pipe() {
        let (read_end, _write_end) = cloexec_pipe().unwrap();
        let revents = poll_fd(read_end.as_raw_fd(), libc::POLLIN, Duration::from_millis(20)).unwrap();
        assert_eq!(revents, 0);
    }

    #[test]
    fn poll_reports_readable_pipe() {
        let (read_end, write_end) = cloexec_pipe().unwrap();
        let mut writer = File::from(write_end);
        writer.write_all(b"x").unwrap();
        let revents = poll_fd(read_end.as_raw_fd(), libc::POLLIN, Duration::from_secs(1)).unwrap();
        assert_ne!(revents & libc::POLLIN, 0);
    }
}
