/// Background session lifecycle: spawn a long-lived process with streamed
/// stdout/stderr, then tear its whole process tree down on stop.
///
/// Output is not captured automatically. Callers read the `stdout`/`stderr`
/// readers themselves; whatever is left unread is only drained on stop when
/// the test has failed. A chatty process that nobody reads can fill the pipe
/// buffer and block on write until then.
use crate::command::CommandSpec;
use crate::process_tree::{ProcessTreeTerminator, TeardownReport};
use crate::reporter::Reporter;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio_util::sync::CancellationToken;

/// How long stop waits for the killed process to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(5);
/// How long the post-mortem drain may block on each stream.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors that can occur while starting a session.
#[derive(Debug)]
pub enum SessionError {
    /// Failed to spawn the subprocess.
    Spawn {
        args: Vec<String>,
        source: std::io::Error,
    },
    /// A piped stream was not available after spawn.
    MissingPipe { args: Vec<String>, stream: &'static str },
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Spawn { args, source } => {
                write!(f, "failed to spawn {:?}: {}", args, source)
            }
            SessionError::MissingPipe { args, stream } => {
                write!(f, "{} pipe unavailable for {:?}", stream, args)
            }
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Spawn { source, .. } => Some(source),
            SessionError::MissingPipe { .. } => None,
        }
    }
}

/// A running background process.
pub struct Session {
    args: Vec<String>,
    child: Option<Child>,
    pub stdout: BufReader<ChildStdout>,
    pub stderr: BufReader<ChildStderr>,
    terminator: ProcessTreeTerminator,
    reporter: Arc<dyn Reporter>,
    stopped: CancellationToken,
}

impl Session {
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Pid of the live process, `None` once stopped or reaped.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    pub fn is_stopped(&self) -> bool {
        self.child.is_none()
    }

    /// Tear down the process tree. Calling this again is a no-op.
    ///
    /// Returns the teardown report, or `None` if there was nothing to stop.
    pub async fn stop(&mut self) -> Option<TeardownReport> {
        self.reporter
            .log(&format!("(dbg) stopping {:?} ...", self.args));
        self.stopped.cancel();

        let Some(mut child) = self.child.take() else {
            self.reporter.log(&format!(
                "{:?} has no process handle. Maybe it's dead?",
                self.args
            ));
            return None;
        };
        let Some(pid) = child.id() else {
            self.reporter
                .log(&format!("{:?} was already reaped", self.args));
            return None;
        };

        let report = self.terminator.terminate(pid).await;
        match tokio::time::timeout(REAP_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(pid, status = %status, "session reaped"),
            Ok(Err(e)) => tracing::warn!(pid, error = %e, "failed to reap session"),
            Err(_) => tracing::warn!(pid, "session not reaped within timeout"),
        }

        if self.reporter.failed() {
            self.dump_remaining_output().await;
        }
        Some(report)
    }

    async fn dump_remaining_output(&mut self) {
        let args = self.args.clone();
        for (name, drained) in [
            ("stdout", drain(&mut self.stdout).await),
            ("stderr", drain(&mut self.stderr).await),
        ] {
            match drained {
                Ok(bytes) if bytes.is_empty() => {}
                Ok(bytes) => self.reporter.log(&format!(
                    "(dbg) {:?} {}:\n{}",
                    args,
                    name,
                    String::from_utf8_lossy(&bytes)
                )),
                Err(e) => self.reporter.log(&format!("read {name} failed: {e}")),
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stopped.cancel();
    }
}

async fn drain<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    match tokio::time::timeout(DRAIN_TIMEOUT, reader.read_to_end(&mut buf)).await {
        Ok(Ok(_)) => Ok(buf),
        Ok(Err(e)) => Err(e),
        // A grandchild may still hold the pipe open; keep what arrived.
        Err(_) => Ok(buf),
    }
}

/// Starts background sessions for a single test case.
#[derive(Clone)]
pub struct SessionManager {
    reporter: Arc<dyn Reporter>,
    terminator: ProcessTreeTerminator,
}

impl SessionManager {
    pub fn new(reporter: Arc<dyn Reporter>, terminator: ProcessTreeTerminator) -> Self {
        Self {
            reporter,
            terminator,
        }
    }

    /// Launch `spec` in the background. Never waits for it to exit.
    pub fn start(&self, spec: &CommandSpec) -> Result<Session, SessionError> {
        self.start_with_cancel(spec, &CancellationToken::new())
    }

    /// Like `start`, but the process tree is torn down if `cancel` fires
    /// before the session is stopped.
    pub fn start_with_cancel(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<Session, SessionError> {
        let args = spec.argv();
        self.reporter.log(&format!("(dbg) daemon: {:?}", args));

        let mut child = spec
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SessionError::Spawn {
                args: args.clone(),
                source: e,
            })?;

        let stdout = child.stdout.take().ok_or_else(|| SessionError::MissingPipe {
            args: args.clone(),
            stream: "stdout",
        })?;
        let stderr = child.stderr.take().ok_or_else(|| SessionError::MissingPipe {
            args: args.clone(),
            stream: "stderr",
        })?;

        let stopped = CancellationToken::new();
        if let Some(pid) = child.id() {
            tracing::info!(pid, args = ?args, "session started");
            let cancel = cancel.clone();
            let stopped = stopped.clone();
            let terminator = self.terminator.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!(pid, "session cancelled, tearing down");
                        terminator.terminate(pid).await;
                    }
                    _ = stopped.cancelled() => {}
                }
            });
        }

        Ok(Session {
            args,
            child: Some(child),
            stdout: BufReader::new(stdout),
            stderr: BufReader::new(stderr),
            terminator: self.terminator.clone(),
            reporter: self.reporter.clone(),
            stopped,
        })
    }
}
