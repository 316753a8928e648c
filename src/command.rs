/// Synchronous command execution: run an external program to completion,
/// capture both output streams in full, and record the exit status.
use crate::config::RunnerConfig;
use crate::reporter::Reporter;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Exit code recorded when the process was terminated by a signal.
pub const SIGNALED_EXIT_CODE: i32 = -1;

/// What to run: program, arguments, and environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Program followed by its arguments.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    pub(crate) fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (k, v) in &self.env {
            cmd.env(k, v);
        }
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }
}

/// Outcome of a completed command. Immutable once returned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// 0 on success, the exit status otherwise, `SIGNALED_EXIT_CODE` if killed.
    pub exit_code: i32,
    pub args: Vec<String>,
}

impl CommandResult {
    fn new(args: Vec<String>) -> Self {
        Self {
            args,
            ..Default::default()
        }
    }

    /// Human readable command line.
    pub fn command(&self) -> String {
        let Some((first, rest)) = self.args.split_first() else {
            return String::new();
        };
        let mut out = first.trim_start_matches("../../").to_string();
        for a in rest {
            if a.contains(' ') {
                out.push_str(&format!(" \"{a}\""));
            } else {
                out.push(' ');
                out.push_str(a);
            }
        }
        out
    }

    /// Framed dump of whichever streams produced output.
    pub fn output(&self) -> String {
        let mut out = String::new();
        if !self.stdout.is_empty() {
            out.push_str(&format!(
                "-- stdout --\n{}\n-- /stdout --",
                String::from_utf8_lossy(&self.stdout)
            ));
        }
        if !self.stderr.is_empty() {
            out.push_str(&format!(
                "\n** stderr ** \n{}\n** /stderr **",
                String::from_utf8_lossy(&self.stderr)
            ));
        }
        out
    }

    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Errors from `CommandRunner::run`. Every variant carries whatever output was
/// captured before the failure.
#[derive(Debug)]
pub enum CommandError {
    /// The program could not be launched (e.g. binary not found).
    Spawn {
        result: CommandResult,
        source: std::io::Error,
    },
    /// Waiting on the child or reading its pipes failed.
    Io {
        result: CommandResult,
        source: std::io::Error,
    },
    /// The program ran and exited unsuccessfully.
    NonZeroExit { result: CommandResult },
    /// The cancellation token fired before the program exited.
    Cancelled { result: CommandResult },
}

impl CommandError {
    pub fn result(&self) -> &CommandResult {
        match self {
            CommandError::Spawn { result, .. }
            | CommandError::Io { result, .. }
            | CommandError::NonZeroExit { result }
            | CommandError::Cancelled { result } => result,
        }
    }

    pub fn into_result(self) -> CommandResult {
        match self {
            CommandError::Spawn { result, .. }
            | CommandError::Io { result, .. }
            | CommandError::NonZeroExit { result }
            | CommandError::Cancelled { result } => result,
        }
    }
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::Spawn { result, source } => {
                write!(f, "failed to start {}: {}", result.command(), source)
            }
            CommandError::Io { result, source } => {
                write!(f, "I/O error running {}: {}", result.command(), source)
            }
            CommandError::NonZeroExit { result } => {
                if result.exit_code == SIGNALED_EXIT_CODE {
                    write!(f, "{} was terminated by a signal", result.command())
                } else {
                    write!(f, "{} exited with status {}", result.command(), result.exit_code)
                }
            }
            CommandError::Cancelled { result } => {
                write!(f, "{} was cancelled", result.command())
            }
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::Spawn { source, .. } => Some(source),
            CommandError::Io { source, .. } => Some(source),
            CommandError::NonZeroExit { .. } | CommandError::Cancelled { .. } => None,
        }
    }
}

/// Map a process exit status to the recorded exit code.
fn exit_code_of(status: ExitStatus) -> i32 {
    status.code().unwrap_or(SIGNALED_EXIT_CODE)
}

/// Upper bound on waiting for pipe EOF after a cancelled command was killed.
/// A process that left the group (e.g. a daemon) may hold the pipe forever.
const CANCEL_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

fn lock_buf(buf: &Mutex<Vec<u8>>) -> MutexGuard<'_, Vec<u8>> {
    match buf.lock() {
        Ok(b) => b,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Background pipe reader. Bytes land in a shared buffer as they arrive, so
/// they survive even when the reader is abandoned before EOF.
struct OutputCapture {
    buf: Arc<Mutex<Vec<u8>>>,
    handle: JoinHandle<std::io::Result<()>>,
}

impl OutputCapture {
    fn spawn<R>(reader: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = buf.clone();
        let handle = tokio::spawn(async move {
            let Some(mut reader) = reader else {
                return Ok(());
            };
            let mut chunk = [0u8; 8192];
            loop {
                let n = reader.read(&mut chunk).await?;
                if n == 0 {
                    return Ok(());
                }
                lock_buf(&sink).extend_from_slice(&chunk[..n]);
            }
        });
        Self { buf, handle }
    }

    /// Wait for EOF (at most `limit`, if set) and hand back what was read.
    async fn finish(mut self, limit: Option<Duration>) -> (Vec<u8>, Option<std::io::Error>) {
        let joined = match limit {
            None => Some((&mut self.handle).await),
            Some(limit) => match tokio::time::timeout(limit, &mut self.handle).await {
                Ok(joined) => Some(joined),
                Err(_) => {
                    tracing::debug!("pipe still open after cancel, abandoning reader");
                    self.handle.abort();
                    None
                }
            },
        };
        let err = match joined {
            None | Some(Ok(Ok(()))) => None,
            Some(Ok(Err(e))) => Some(e),
            Some(Err(e)) => Some(std::io::Error::other(e)),
        };
        let bytes = std::mem::take(&mut *lock_buf(&self.buf));
        (bytes, err)
    }
}

/// Store both streams in `result`, returning the first read error if any.
async fn collect_output(
    stdout: OutputCapture,
    stderr: OutputCapture,
    limit: Option<Duration>,
    result: &mut CommandResult,
) -> Option<std::io::Error> {
    let (out, out_err) = stdout.finish(limit).await;
    let (err, err_err) = stderr.finish(limit).await;
    result.stdout = out;
    result.stderr = err;
    out_err.or(err_err)
}

/// Kill the whole process group led by `child`, falling back to the child.
fn kill_group(child: &mut Child) {
    let group = child.id().and_then(|pid| i32::try_from(pid).ok());
    if let Some(pgid) = group {
        match signal::killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
            Ok(()) => return,
            Err(e) => tracing::debug!(pgid, error = %e, "killpg failed"),
        }
    }
    if let Err(e) = child.start_kill() {
        tracing::warn!(error = %e, "failed to kill cancelled command");
    }
}

/// Runs short-lived commands to completion for a single test case.
#[derive(Clone)]
pub struct CommandRunner {
    reporter: Arc<dyn Reporter>,
    slow_threshold: Duration,
}

impl CommandRunner {
    pub fn new(reporter: Arc<dyn Reporter>) -> Self {
        Self::from_config(reporter, &RunnerConfig::default())
    }

    pub fn from_config(reporter: Arc<dyn Reporter>, config: &RunnerConfig) -> Self {
        Self {
            reporter,
            slow_threshold: config.slow_command_threshold(),
        }
    }

    pub fn reporter(&self) -> &Arc<dyn Reporter> {
        &self.reporter
    }

    /// Run `spec` to completion.
    pub async fn run(&self, spec: &CommandSpec) -> Result<CommandResult, CommandError> {
        self.run_with_cancel(spec, &CancellationToken::new()).await
    }

    /// Run `spec` to completion, abandoning (and killing) it if `cancel` fires.
    pub async fn run_with_cancel(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
    ) -> Result<CommandResult, CommandError> {
        let mut result = CommandResult::new(spec.argv());
        self.reporter
            .log(&format!("(dbg) Run:  {}", result.command()));

        let start = Instant::now();
        let outcome = self.execute(spec, cancel, &mut result).await;
        let elapsed = start.elapsed();

        match outcome {
            Ok(()) => {
                // Reduce log spam
                if elapsed > self.slow_threshold {
                    self.reporter.log(&format!(
                        "(dbg) Done: {}: ({:?})",
                        result.command(),
                        elapsed
                    ));
                }
                tracing::debug!(
                    command = %result.command(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "command completed"
                );
                Ok(result)
            }
            Err(err) => {
                self.reporter.log(&format!(
                    "(dbg) Non-zero exit: {}: {} ({:?})\n{}",
                    err.result().command(),
                    err,
                    elapsed,
                    err.result().output()
                ));
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        spec: &CommandSpec,
        cancel: &CancellationToken,
        result: &mut CommandResult,
    ) -> Result<(), CommandError> {
        let mut child = match spec
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Own group, so cancellation reaches grandchildren too.
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return Err(CommandError::Spawn {
                    result: std::mem::take(result),
                    source: e,
                })
            }
        };

        let stdout = OutputCapture::spawn(child.stdout.take());
        let stderr = OutputCapture::spawn(child.stderr.take());

        let (wait, cancelled) = tokio::select! {
            status = child.wait() => (status, false),
            _ = cancel.cancelled() => {
                tracing::debug!(command = %result.command(), "command cancelled, killing");
                kill_group(&mut child);
                (child.wait().await, true)
            }
        };

        let limit = cancelled.then_some(CANCEL_DRAIN_TIMEOUT);
        let read_err = collect_output(stdout, stderr, limit, result).await;

        let status = match wait {
            Ok(status) => status,
            Err(e) => {
                return Err(CommandError::Io {
                    result: std::mem::take(result),
                    source: e,
                })
            }
        };
        if !status.success() {
            result.exit_code = exit_code_of(status);
        }

        if cancelled {
            return Err(CommandError::Cancelled {
                result: std::mem::take(result),
            });
        }
        if let Some(e) = read_err {
            return Err(CommandError::Io {
                result: std::mem::take(result),
                source: e,
            });
        }
        if !status.success() {
            return Err(CommandError::NonZeroExit {
                result: std::mem::take(result),
            });
        }
        Ok(())
    }
}
