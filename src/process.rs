//! Cancellable subprocess execution for the embedding and completion
//! executables.
//!
//! [`run_process`] races the child against its operation token and a
//! timeout. When either fires first the child is killed and reaped before
//! the call returns, so no executable outlives the request that started it.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::error::ProcessError;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;
#[cfg(windows)]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

/// Longest stderr excerpt carried into error messages.
const STDERR_TAIL_BYTES: usize = 2048;

/// Captured result of a subprocess that exited on its own.
#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub elapsed: Duration,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// The last part of stderr, lossily decoded and trimmed.
    pub fn stderr_tail(&self) -> String {
        let start = self.stderr.len().saturating_sub(STDERR_TAIL_BYTES);
        String::from_utf8_lossy(&self.stderr[start..]).trim().to_string()
    }
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    Cancelled,
    TimedOut,
}

/// Run `program` with `args` until it exits, `cancel` fires, or `timeout`
/// elapses.
///
/// A nonzero exit is not an error here; callers inspect
/// [`ProcessOutput::success`] and the captured streams.
pub async fn run_process(
    cancel: &CancellationToken,
    program: &Path,
    args: &[String],
    timeout: Duration,
) -> Result<ProcessOutput, ProcessError> {
    if cancel.is_cancelled() {
        return Err(ProcessError::Cancelled);
    }

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    isolate(&mut command);

    let started = Instant::now();
    let deadline = tokio::time::Instant::now() + timeout;
    let mut child = command.spawn().map_err(|error| {
        if error.kind() == std::io::ErrorKind::NotFound {
            ProcessError::NotFound(program.to_path_buf())
        } else {
            ProcessError::Spawn {
                program: program.to_path_buf(),
                error,
            }
        }
    })?;
    // `Child::id` goes away once the child is reaped; the group outlives it.
    let group = child.id();

    tracing::debug!(
        program = %program.display(),
        pid = ?group,
        args = args.len(),
        "spawned subprocess"
    );

    // Drain both pipes concurrently so a chatty child never blocks on a full pipe.
    let mut stdout = tokio::spawn(read_pipe(child.stdout.take()));
    let mut stderr = tokio::spawn(read_pipe(child.stderr.take()));

    let outcome = tokio::select! {
        biased;
        _ = cancel.cancelled() => Outcome::Cancelled,
        status = child.wait() => Outcome::Exited(status),
        _ = tokio::time::sleep_until(deadline) => Outcome::TimedOut,
    };

    let io_err = |error| ProcessError::Io {
        program: program.to_path_buf(),
        error,
    };

    let outcome = match outcome {
        Outcome::Exited(status) => {
            let status = status.map_err(io_err)?;
            // A background grandchild can hold the pipes open after the
            // direct child is gone, so draining obeys the same token and
            // deadline.
            let drained = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                pipes = async { (join_pipe(&mut stdout).await, join_pipe(&mut stderr).await) } => Some(pipes),
                _ = tokio::time::sleep_until(deadline) => None,
            };
            match drained {
                Some((out, err)) => {
                    let elapsed = started.elapsed();
                    tracing::debug!(
                        program = %program.display(),
                        %status,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "subprocess exited"
                    );
                    return Ok(ProcessOutput {
                        status,
                        stdout: out.map_err(io_err)?,
                        stderr: err.map_err(io_err)?,
                        elapsed,
                    });
                }
                None => {
                    tracing::debug!(
                        program = %program.display(),
                        pid = ?group,
                        "subprocess exited but its pipes are still held open"
                    );
                    kill_group(group, program);
                    if cancel.is_cancelled() {
                        Outcome::Cancelled
                    } else {
                        Outcome::TimedOut
                    }
                }
            }
        }
        other => {
            kill_group(group, program);
            terminate(&mut child, program).await;
            other
        }
    };

    stdout.abort();
    stderr.abort();
    match outcome {
        Outcome::TimedOut => Err(ProcessError::TimedOut {
            program: program.to_path_buf(),
            secs: timeout.as_secs(),
        }),
        _ => Err(ProcessError::Cancelled),
    }
}

/// Kill and reap. Never returns while the child is still running unless the
/// OS refuses both the kill and the wait.
async fn terminate(child: &mut Child, program: &Path) {
    let pid = child.id();
    if let Err(e) = child.start_kill() {
        tracing::warn!(program = %program.display(), ?pid, error = %e, "failed to kill subprocess");
    }
    match child.wait().await {
        Ok(status) => {
            tracing::debug!(program = %program.display(), ?pid, %status, "subprocess terminated")
        }
        Err(e) => {
            tracing::warn!(program = %program.display(), ?pid, error = %e, "failed to reap subprocess")
        }
    }
}

/// SIGKILL every process in the child's group, grandchildren included.
#[cfg(unix)]
fn kill_group(group: Option<u32>, program: &Path) {
    let Some(pgid) = group.and_then(|pid| libc::pid_t::try_from(pid).ok()) else {
        return;
    };
    // SAFETY: killpg has no memory-safety preconditions.
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        let error = std::io::Error::last_os_error();
        if error.raw_os_error() != Some(libc::ESRCH) {
            tracing::warn!(program = %program.display(), pgid, %error, "failed to kill process group");
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_group: Option<u32>, _program: &Path) {}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

async fn join_pipe(
    handle: &mut tokio::task::JoinHandle<std::io::Result<Vec<u8>>>,
) -> std::io::Result<Vec<u8>> {
    handle.await.map_err(std::io::Error::other)?
}

#[cfg(windows)]
fn isolate(command: &mut Command) {
    command.creation_flags(CREATE_NO_WINDOW | CREATE_NEW_PROCESS_GROUP);
}

#[cfg(unix)]
fn isolate(command: &mut Command) {
    // Own process group: terminal signals aimed at us don't reach the child.
    command.process_group(0);
}

#[cfg(not(any(unix, windows)))]
fn isolate(_command: &mut Command) {}
