/// Bounded communication with a child's standard streams
///
/// One scoped thread feeds stdin while one thread per output stream drains
/// it. Readers keep at most the configured ceiling and keep reading to EOF,
/// so a chatty child never blocks on a full pipe.
use crate::config::types::{OutputIntegrity, Result, SandboxError};
use std::io::{ErrorKind, Read, Write};
use std::thread;

const CHUNK_SIZE: usize = 4096;

/// Per-stream capture ceilings in bytes; `None` is unbounded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamCeilings {
    pub stdout: Option<usize>,
    pub stderr: Option<usize>,
}

impl StreamCeilings {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn bounded(stdout: usize, stderr: usize) -> Self {
        Self {
            stdout: Some(stdout),
            stderr: Some(stderr),
        }
    }
}

/// Captured output with per-stream integrity
#[derive(Clone, Debug, Default)]
pub struct CapturedOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_integrity: OutputIntegrity,
    pub stderr_integrity: OutputIntegrity,
}

/// Drain one stream to EOF, keeping at most `ceiling` bytes.
fn drain_stream<R: Read>(mut stream: R, ceiling: Option<usize>) -> (Vec<u8>, OutputIntegrity) {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; CHUNK_SIZE];
    let mut integrity = OutputIntegrity::Complete;
    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                let keep = match ceiling {
                    Some(limit) => n.min(limit.saturating_sub(buffer.len())),
                    None => n,
                };
                buffer.extend_from_slice(&chunk[..keep]);
                if keep < n {
                    integrity = OutputIntegrity::TruncatedByJudgeLimit;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                log::warn!("Output stream read failed: {}", e);
                integrity = OutputIntegrity::WriteError;
                break;
            }
        }
    }
    (buffer, integrity)
}

/// Feed `input` and close stdin. A child that stops reading is not an error.
fn feed_stdin<W: Write>(mut stdin: W, input: Option<&[u8]>) -> std::io::Result<()> {
    if let Some(data) = input {
        match stdin.write_all(data).and_then(|()| stdin.flush()) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::BrokenPipe => {
                log::debug!("Child closed stdin after accepting part of the input");
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Exchange data with a child until both output streams reach EOF.
///
/// `stdin` is closed after `input` is written, or immediately when `input`
/// is `None`.
pub fn communicate<W, R, E>(
    stdin: Option<W>,
    input: Option<&[u8]>,
    stdout: Option<R>,
    stderr: Option<E>,
    ceilings: StreamCeilings,
) -> Result<CapturedOutput>
where
    W: Write + Send,
    R: Read + Send,
    E: Read + Send,
{
    thread::scope(|scope| {
        let writer = stdin.map(|stdin| scope.spawn(move || feed_stdin(stdin, input)));
        let out_reader = stdout.map(|s| scope.spawn(move || drain_stream(s, ceilings.stdout)));
        let err_reader = stderr.map(|s| scope.spawn(move || drain_stream(s, ceilings.stderr)));

        let joined = |what: &str| SandboxError::Process(format!("{} thread panicked", what));
        let (stdout, stdout_integrity) = match out_reader {
            Some(handle) => handle.join().map_err(|_| joined("stdout reader"))?,
            None => (Vec::new(), OutputIntegrity::Complete),
        };
        let (stderr, stderr_integrity) = match err_reader {
            Some(handle) => handle.join().map_err(|_| joined("stderr reader"))?,
            None => (Vec::new(), OutputIntegrity::Complete),
        };
        if let Some(handle) = writer {
            handle.join().map_err(|_| joined("stdin writer"))??;
        }
        Ok(CapturedOutput {
            stdout,
            stderr,
            stdout_integrity,
            stderr_integrity,
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Cursor;
    use std::process::{Command, Stdio};

    #[test]
    fn ceiling_truncates_but_drains() {
        let data = vec![b'x'; 3 * CHUNK_SIZE + 17];
        let (kept, integrity) = drain_stream(Cursor::new(data), Some(100));
        assert_eq!(kept.len(), 100);
        assert_eq!(integrity, OutputIntegrity::TruncatedByJudgeLimit);
    }

    #[test]
    fn exact_ceiling_is_complete() {
        let (kept, integrity) = drain_stream(Cursor::new(vec![b'y'; 64]), Some(64));
        assert_eq!(kept.len(), 64);
        assert_eq!(integrity, OutputIntegrity::Complete);
    }

    #[test]
    fn zero_ceiling_keeps_nothing() {
        let (kept, integrity) = drain_stream(Cursor::new(b"abc".to_vec()), Some(0));
        assert!(kept.is_empty());
        assert_eq!(integrity, OutputIntegrity::TruncatedByJudgeLimit);
    }

    #[test]
    fn round_trips_through_cat() {
        let mut child = Command::new("/bin/cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();
        let output = communicate(
            child.stdin.take(),
            Some(b"hello judge\n".as_slice()),
            child.stdout.take(),
            child.stderr.take(),
            StreamCeilings::unbounded(),
        )
        .unwrap();
        child.wait().unwrap();
        assert_eq!(output.stdout, b"hello judge\n");
        assert!(output.stderr.is_empty());
        assert_eq!(output.stdout_integrity, OutputIntegrity::Complete);
    }

    #[test]
    fn child_ignoring_stdin_is_not_an_error() {
        let mut child = Command::new("/bin/sh")
            .args(["-c", "exec 0<&-; echo done"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let input = vec![b'z'; 1 << 20];
        let output = communicate(
            child.stdin.take(),
            Some(input.as_slice()),
            child.stdout.take(),
            None::<File>,
            StreamCeilings::unbounded(),
        )
        .unwrap();
        child.wait().unwrap();
        assert_eq!(output.stdout, b"done\n");
    }
}
