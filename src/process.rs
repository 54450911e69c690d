//! External command execution and process liveness.
//!
//! Every external command runs with a deadline. Callers that only need
//! "information if available" use [`capture_stdout`], which folds every
//! failure into `None` so a single bad probe can't abort a batch.

use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Default deadline for git, ps and lsof invocations.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} timed out after {after:?}")]
    Timeout { program: String, after: Duration },
    #[error("{program} exited with {status:?}: {stderr}")]
    Failed {
        program: String,
        status: Option<i32>,
        stdout: String,
        stderr: String,
    },
}

impl CommandError {
    /// Stdout of a command that ran to completion but exited non-zero.
    /// Some tools (lsof) still print useful output in that case.
    pub fn partial_stdout(&self) -> Option<&str> {
        match self {
            CommandError::Failed { stdout, .. } if !stdout.trim().is_empty() => Some(stdout),
            _ => None,
        }
    }
}

/// Run a command and return its stdout if it exits successfully in time.
///
/// The child is killed if the deadline passes.
pub async fn run_capture<I, S>(
    program: &str,
    args: I,
    cwd: Option<&Path>,
    timeout: Duration,
) -> Result<String, CommandError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    let child = command.spawn().map_err(|source| CommandError::Spawn {
        program: program.to_string(),
        source,
    })?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(source)) => {
            return Err(CommandError::Spawn {
                program: program.to_string(),
                source,
            })
        }
        Err(_) => {
            return Err(CommandError::Timeout {
                program: program.to_string(),
                after: timeout,
            })
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    if !output.status.success() {
        return Err(CommandError::Failed {
            program: program.to_string(),
            status: output.status.code(),
            stdout,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(stdout)
}

/// Like [`run_capture`] but any failure means "no information".
pub async fn capture_stdout<I, S>(
    program: &str,
    args: I,
    cwd: Option<&Path>,
    timeout: Duration,
) -> Option<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    match run_capture(program, args, cwd, timeout).await {
        Ok(stdout) => Some(stdout),
        Err(e) => {
            debug!(program, error = %e, "external command gave no result");
            None
        }
    }
}

/// Check whether a process with the given pid exists.
///
/// A pid owned by another user still counts as alive.
#[cfg(unix)]
pub fn is_pid_alive(pid: u32) -> bool {
    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    let result = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if result == 0 {
        return true;
    }
    let err = std::io::Error::last_os_error();
    err.raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn is_pid_alive(_pid: u32) -> bool {
    false
}

/// OS-level facts the registry reconciles against.
///
/// Implementations never fail: an inconclusive check answers `false`.
pub trait LivenessProbe {
    fn pid_alive(&self, pid: u32) -> bool;
    fn port_listening(&self, port: u16) -> bool;
}

/// Probes the real process table and loopback ports.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl LivenessProbe for SystemProbe {
    fn pid_alive(&self, pid: u32) -> bool {
        is_pid_alive(pid)
    }

    fn port_listening(&self, port: u16) -> bool {
        crate::port::is_listening(port)
    }
}
