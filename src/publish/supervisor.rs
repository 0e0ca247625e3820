//! Supervision of locally spawned build processes.
//!
//! Each project owns at most one build process. Its pid is kept in memory
//! and persisted on the project row, so an attempt started after a crash or
//! restart can still find and terminate an orphaned build.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout};

use crate::errors::{PublishError, PublishResult};

use super::store::ProjectStore;

/// Line reader over a child's output pipe. Bytes that are not valid UTF-8
/// are replaced instead of ending the stream.
pub struct OutputLines<R> {
    reader: BufReader<R>,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> OutputLines<R> {
    fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            buf: Vec::new(),
        }
    }

    /// Next line without its terminator, or `None` once the pipe closes.
    pub async fn next_line(&mut self) -> std::io::Result<Option<String>> {
        self.buf.clear();
        if self.reader.read_until(b'\n', &mut self.buf).await? == 0 {
            return Ok(None);
        }
        let line = self.buf.strip_suffix(b"\n").unwrap_or(&self.buf[..]);
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        Ok(Some(String::from_utf8_lossy(line).into_owned()))
    }
}

/// A child process started by [`ProcessSupervisor::spawn`].
pub struct SupervisedProcess {
    command: String,
    pid: Option<u32>,
    child: Child,
    stdout: Option<OutputLines<ChildStdout>>,
    stderr: Option<OutputLines<ChildStderr>>,
}

impl SupervisedProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn take_stdout(&mut self) -> Option<OutputLines<ChildStdout>> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<OutputLines<ChildStderr>> {
        self.stderr.take()
    }

    /// Wait for the process to exit. Yields `None` when it was terminated by
    /// a signal and therefore reported no exit code.
    pub async fn wait(&mut self) -> PublishResult<Option<i32>> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|source| PublishError::SpawnFailed {
                command: self.command.clone(),
                source,
            })?;
        Ok(status.code())
    }
}

/// Tracks the build process of every project and terminates stale ones.
#[derive(Clone, Default)]
pub struct ProcessSupervisor {
    /// Map from project id to the pid of its running build.
    running: Arc<std::sync::Mutex<HashMap<String, u32>>>,
}

impl ProcessSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `program` with piped stdout/stderr and register it under the
    /// project. `stdin`, if given, is written in the background and the pipe
    /// closed afterwards.
    pub fn spawn(
        &self,
        project_id: &str,
        program: &str,
        args: &[String],
        stdin: Option<Vec<u8>>,
    ) -> PublishResult<SupervisedProcess> {
        let command = format!("{} {}", program, args.first().map(String::as_str).unwrap_or(""))
            .trim_end()
            .to_string();

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|source| PublishError::SpawnFailed {
            command: command.clone(),
            source,
        })?;
        let pid = child.id();

        if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
            tokio::spawn(async move {
                // The process may exit before reading everything; a broken
                // pipe here surfaces through its exit code instead.
                if let Err(e) = pipe.write_all(&bytes).await {
                    tracing::debug!(error = %e, "stdin write to child failed");
                }
                let _ = pipe.shutdown().await;
            });
        }

        let stdout = child.stdout.take().map(OutputLines::new);
        let stderr = child.stderr.take().map(OutputLines::new);

        if let Some(pid) = pid {
            let previous = self.lock_running().insert(project_id.to_string(), pid);
            if let Some(previous) = previous.filter(|p| *p != pid) {
                tracing::warn!(
                    project_id,
                    pid,
                    previous_pid = previous,
                    "replacing a build that is still registered for this project"
                );
            }
        }
        tracing::debug!(project_id, ?pid, command = %command, "spawned supervised process");

        Ok(SupervisedProcess {
            command,
            pid,
            child,
            stdout,
            stderr,
        })
    }

    /// The pid registered for a project, if its build is running in this process.
    pub fn running_pid(&self, project_id: &str) -> Option<u32> {
        self.lock_running().get(project_id).copied()
    }

    /// Forget the project's registration once its build has exited. A newer
    /// build registered under the same project is left in place.
    pub fn release(&self, project_id: &str, pid: Option<u32>) {
        let mut running = self.lock_running();
        if pid.is_some() && running.get(project_id).copied() == pid {
            running.remove(project_id);
        }
    }

    /// Persist the pid of a freshly spawned build on the project row.
    pub async fn track(
        &self,
        store: &dyn ProjectStore,
        project_id: &str,
        pid: Option<u32>,
    ) -> PublishResult<()> {
        store.set_supervised_process(project_id, pid).await
    }

    /// Terminate a stale build if it is still alive, then clear the persisted
    /// pid. A dead pid is never signalled.
    pub async fn reap(
        &self,
        store: &dyn ProjectStore,
        project_id: &str,
        pid: Option<u32>,
    ) -> PublishResult<()> {
        if let Some(pid) = pid.filter(|p| Self::is_alive(Some(*p))) {
            tracing::warn!(project_id, pid, "terminating build left over from a previous attempt");
            Self::kill(Some(pid));
        } else {
            tracing::debug!(project_id, ?pid, "stale build already gone");
        }
        self.release(project_id, pid);
        store.set_supervised_process(project_id, None).await
    }

    /// True if a process with this pid exists. `None` and pid 0 are never alive.
    #[cfg(unix)]
    pub fn is_alive(pid: Option<u32>) -> bool {
        let Some(pid) = pid.and_then(to_pid_t) else {
            return false;
        };
        // SAFETY: signal 0 performs only the existence and permission check.
        let rc = unsafe { libc::kill(pid, 0) };
        if rc == 0 {
            return true;
        }
        std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    }

    #[cfg(not(unix))]
    pub fn is_alive(_pid: Option<u32>) -> bool {
        false
    }

    /// Send SIGKILL. A process that already exited is not an error; any other
    /// failure is logged and otherwise ignored.
    #[cfg(unix)]
    pub fn kill(pid: Option<u32>) {
        let Some(raw) = pid.and_then(to_pid_t) else {
            return;
        };
        // SAFETY: `raw` is a positive pid, so this never signals a process group.
        let rc = unsafe { libc::kill(raw, libc::SIGKILL) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                tracing::warn!(pid = raw, error = %err, "failed to kill supervised process");
            }
        }
    }

    #[cfg(not(unix))]
    pub fn kill(pid: Option<u32>) {
        if pid.is_some() {
            tracing::warn!(?pid, "killing processes by pid is only supported on unix");
        }
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, HashMap<String, u32>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Convert to `pid_t`, rejecting 0 and values that would wrap negative.
#[cfg(unix)]
fn to_pid_t(pid: u32) -> Option<libc::pid_t> {
    libc::pid_t::try_from(pid).ok().filter(|p| *p > 0)
}
