//! Running external converter tools under a wall-clock limit.

use std::ffi::OsStr;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const STDERR_LIMIT: usize = 512;

#[derive(Debug, Error)]
pub enum SubprocessError {
    #[error("{0} is not installed")]
    NotInstalled(String),

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} did not finish within {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: ExitStatus,
        stderr: String,
    },
}

#[derive(Debug)]
pub struct Output {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Whether `program` can be found on `PATH`.
pub fn is_available(program: &str) -> bool {
    which::which(program).is_ok()
}

fn resolve(program: &str) -> Result<PathBuf, SubprocessError> {
    which::which(program).map_err(|_| SubprocessError::NotInstalled(program.to_string()))
}

fn drain(mut reader: impl Read + Send + 'static) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        buf
    })
}

/// Runs `program` with `args`, killing it once `timeout` has passed.
///
/// The child gets a private `TMPDIR` that is removed afterwards, so tools
/// that leave scratch files behind do not leak them.
pub fn run<I, S>(program: &str, args: I, timeout: Duration) -> Result<Output, SubprocessError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let path = resolve(program)?;
    let spawn_error = |source| SubprocessError::Spawn {
        program: program.to_string(),
        source,
    };
    let scratch = tempfile::Builder::new()
        .prefix("nestscan-tmp-")
        .tempdir()
        .map_err(spawn_error)?;

    let mut child = Command::new(&path)
        .args(args)
        .env("TMPDIR", scratch.path())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(spawn_error)?;
    debug!(program, pid = child.id(), "Spawned converter");

    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let status = wait_with_deadline(&mut child, program, timeout)?;
    let stdout = stdout.and_then(|h| h.join().ok()).unwrap_or_default();
    let stderr = stderr.and_then(|h| h.join().ok()).unwrap_or_default();

    if !status.success() {
        let mut message = String::from_utf8_lossy(&stderr).trim().to_string();
        if message.len() > STDERR_LIMIT {
            let mut cut = STDERR_LIMIT;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        return Err(SubprocessError::Failed {
            program: program.to_string(),
            status,
            stderr: message,
        });
    }

    Ok(Output { stdout, stderr })
}

fn wait_with_deadline(
    child: &mut Child,
    program: &str,
    timeout: Duration,
) -> Result<ExitStatus, SubprocessError> {
    let start = Instant::now();
    loop {
        let polled = child.try_wait().map_err(|source| SubprocessError::Spawn {
            program: program.to_string(),
            source,
        })?;
        if let Some(status) = polled {
            return Ok(status);
        }
        if start.elapsed() >= timeout {
            warn!(program, ?timeout, "Converter timed out, killing it");
            if let Err(err) = child.kill() {
                warn!(program, error = %err, "Failed to kill timed out converter");
            }
            if let Err(err) = child.wait() {
                warn!(program, error = %err, "Failed to reap timed out converter");
            }
            return Err(SubprocessError::Timeout {
                program: program.to_string(),
                timeout,
            });
        }
        thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_program() {
        let result = run("nestscan-no-such-tool", ["x"], Duration::from_secs(1));
        assert!(matches!(result, Err(SubprocessError::NotInstalled(_))));
    }

    #[test]
    fn test_captures_stdout() {
        if !is_available("sh") {
            return;
        }
        let output = run("sh", ["-c", "printf hello"], Duration::from_secs(5)).unwrap();
        assert_eq!(output.stdout, b"hello");
    }

    #[test]
    fn test_non_zero_exit_reports_stderr() {
        if !is_available("sh") {
            return;
        }
        let result = run("sh", ["-c", "echo broken >&2; exit 3"], Duration::from_secs(5));
        match result {
            Err(SubprocessError::Failed { stderr, status, .. }) => {
                assert_eq!(stderr, "broken");
                assert_eq!(status.code(), Some(3));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_timeout_kills_child() {
        if !is_available("sleep") {
            return;
        }
        let start = Instant::now();
        let result = run("sleep", ["5"], Duration::from_millis(100));
        assert!(matches!(result, Err(SubprocessError::Timeout { .. })));
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_tmpdir_is_private() {
        if !is_available("sh") {
            return;
        }
        let output = run("sh", ["-c", "printf %s \"$TMPDIR\""], Duration::from_secs(5)).unwrap();
        let tmpdir = String::from_utf8(output.stdout).unwrap();
        assert!(tmpdir.contains("nestscan-tmp-"));
        assert!(!std::path::Path::new(&tmpdir).exists());
    }
}
