//! Process Execution Engine
//!
//! Launches native SDK tools, captures their output line by line and
//! supervises them until they exit or are killed.
//!
//! Stdout and stderr are drained by two independent reader tasks. Each
//! stream keeps its own order and both also feed one interleaved list, but
//! ordering across the two streams is best effort only: a stderr line
//! written before a stdout line may be recorded after it. Parsers reading
//! the interleaved view must tolerate diagnostic and progress lines from
//! either stream showing up between real records, including progress bars
//! that arrive as one line with embedded `\r` separators.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Stderr text adb prints when a command needs `-s <serial>`
pub const MULTIPLE_DEVICES_MARKER: &str = "error: more than one device/emulator";

/// Exit code recorded when the process was terminated by a signal
pub const SIGNAL_EXIT_CODE: i32 = -1;

/// Upper bound for draining output after exit; grandchildren may hold the pipes open
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Process errors
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Tool not found: {}", .0.display())]
    ToolNotFound(PathBuf),
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with status {exit_code}")]
    Failed {
        program: String,
        exit_code: i32,
        stdout: Vec<String>,
        stderr: Vec<String>,
    },
    #[error("More than one device/emulator detected, a serial must be specified")]
    MultipleDevices { stdout: Vec<String>, stderr: Vec<String> },
    #[error("Process was not started with interactive input")]
    NotInteractive,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Everything a finished process produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code, [`SIGNAL_EXIT_CODE`] when terminated by a signal
    pub exit_code: i32,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
    /// Both streams in best-effort arrival order
    pub interleaved: Vec<String>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_text(&self) -> String {
        self.stdout.join("\n")
    }

    pub fn stderr_text(&self) -> String {
        self.stderr.join("\n")
    }

    pub fn all_text(&self) -> String {
        self.interleaved.join("\n")
    }

    /// Apply the failure policy: a nonzero exit is an error, and the
    /// multi-device message wins over the generic failure.
    pub fn into_result(self, program: &str) -> Result<Self, ProcessError> {
        if self.success() {
            return Ok(self);
        }

        if self.stderr.iter().any(|l| l.contains(MULTIPLE_DEVICES_MARKER)) {
            return Err(ProcessError::MultipleDevices {
                stdout: self.stdout,
                stderr: self.stderr,
            });
        }

        Err(ProcessError::Failed {
            program: program.to_string(),
            exit_code: self.exit_code,
            stdout: self.stdout,
            stderr: self.stderr,
        })
    }
}

/// Launch description for a native executable
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    current_dir: Option<PathBuf>,
    interactive: bool,
    cancel: Option<CancellationToken>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
            interactive: false,
            cancel: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args.extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs.push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Pipe stdin so the caller can answer prompts
    pub fn interactive(mut self, interactive: bool) -> Self {
        self.interactive = interactive;
        self
    }

    /// Kill the process when `token` is cancelled
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn display_name(&self) -> String {
        self.program
            .file_name()
            .unwrap_or(self.program.as_os_str())
            .to_string_lossy()
            .into_owned()
    }

    /// Spawn the process. Must be called from within a tokio runtime.
    pub fn launch(self) -> Result<RunningProcess, ProcessError> {
        let program = self.display_name();

        // Bare names are left to PATH lookup
        let is_path = self.program.components().count() > 1;
        if is_path && !self.program.exists() {
            return Err(ProcessError::ToolNotFound(self.program));
        }

        debug!("{} {:?}", program, self.args);

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(if self.interactive { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ProcessError::ToolNotFound(self.program.clone())
            } else {
                ProcessError::Spawn { program: program.clone(), source }
            }
        })?;

        let pid = child.id();
        let stdin = child.stdin.take();
        let captured = Arc::new(Mutex::new(Captured::default()));

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, Stream::Stdout, Arc::clone(&captured), program.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, Stream::Stderr, Arc::clone(&captured), program.clone()));
        }

        let kill_switch = match &self.cancel {
            Some(token) => token.child_token(),
            None => CancellationToken::new(),
        };

        let (exit_tx, exit_rx) = watch::channel(None);
        spawn_supervisor(child, kill_switch.clone(), exit_tx, program.clone());

        Ok(RunningProcess {
            program,
            pid,
            stdin,
            captured,
            readers,
            kill_switch,
            exit: ExitWatch { rx: exit_rx },
        })
    }

    /// Launch and wait, applying the nonzero-exit policy
    pub async fn run(self) -> Result<ProcessOutput, ProcessError> {
        self.launch()?.wait_for_exit().await
    }
}

#[derive(Debug, Default, Clone)]
struct Captured {
    stdout: Vec<String>,
    stderr: Vec<String>,
    interleaved: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Read-only view of a process's exit, cloneable into poll loops
#[derive(Debug, Clone)]
pub struct ExitWatch {
    rx: watch::Receiver<Option<i32>>,
}

impl ExitWatch {
    pub fn has_exited(&self) -> bool {
        self.rx.borrow().is_some()
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.rx.borrow()
    }

    /// Wait until the process exits and return its exit code
    pub async fn wait(&mut self) -> i32 {
        loop {
            if let Some(code) = *self.rx.borrow_and_update() {
                return code;
            }
            if self.rx.changed().await.is_err() {
                return self.rx.borrow().unwrap_or(SIGNAL_EXIT_CODE);
            }
        }
    }
}

/// A spawned native process. Only its owner may kill it; dropping it
/// without waiting kills the process.
pub struct RunningProcess {
    program: String,
    pid: Option<u32>,
    stdin: Option<ChildStdin>,
    captured: Arc<Mutex<Captured>>,
    readers: Vec<JoinHandle<()>>,
    kill_switch: CancellationToken,
    exit: ExitWatch,
}

impl RunningProcess {
    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn id(&self) -> Option<u32> {
        self.pid
    }

    pub fn has_exited(&self) -> bool {
        self.exit.has_exited()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit.exit_code()
    }

    pub fn exit_watch(&self) -> ExitWatch {
        self.exit.clone()
    }

    pub fn is_interactive(&self) -> bool {
        self.stdin.is_some()
    }

    /// Snapshot of the output captured so far
    pub fn output(&self) -> ProcessOutput {
        let captured = self.captured.lock();
        ProcessOutput {
            exit_code: self.exit.exit_code().unwrap_or(SIGNAL_EXIT_CODE),
            stdout: captured.stdout.clone(),
            stderr: captured.stderr.clone(),
            interleaved: captured.interleaved.clone(),
        }
    }

    /// Write raw text to the process's stdin
    pub async fn write(&mut self, text: &str) -> Result<(), ProcessError> {
        let stdin = self.stdin.as_mut().ok_or(ProcessError::NotInteractive)?;
        stdin.write_all(text.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Write one line to the process's stdin and flush it
    pub async fn write_line(&mut self, line: &str) -> Result<(), ProcessError> {
        trace!("{} <- {:?}", self.program, line);
        self.write(&format!("{}\n", line)).await
    }

    /// Close stdin so the process sees EOF
    pub fn close_stdin(&mut self) {
        self.stdin.take();
    }

    /// Forcefully terminate the process. Returns `false` if it had already exited.
    pub async fn kill(&mut self) -> bool {
        if self.exit.has_exited() {
            return false;
        }

        debug!("Killing {} (pid {:?})", self.program, self.pid);
        self.kill_switch.cancel();
        self.exit.wait().await;
        true
    }

    /// Wait for exit and collect output, whatever the exit code
    pub async fn wait_with_output(mut self) -> ProcessOutput {
        let exit_code = self.exit.wait().await;
        self.stdin.take();

        for reader in self.readers.drain(..) {
            if tokio::time::timeout(READER_DRAIN_TIMEOUT, reader).await.is_err() {
                warn!("{} output still open after exit, not waiting for it", self.program);
            }
        }

        let captured = self.captured.lock().clone();
        ProcessOutput {
            exit_code,
            stdout: captured.stdout,
            stderr: captured.stderr,
            interleaved: captured.interleaved,
        }
    }

    /// Wait for exit; a nonzero exit code is an error carrying the output
    pub async fn wait_for_exit(self) -> Result<ProcessOutput, ProcessError> {
        let program = self.program.clone();
        self.wait_with_output().await.into_result(&program)
    }
}

impl Drop for RunningProcess {
    fn drop(&mut self) {
        if !self.exit.has_exited() {
            debug!("{} dropped while running, killing it", self.program);
            self.kill_switch.cancel();
        }
    }
}

fn spawn_supervisor(
    mut child: Child,
    kill_switch: CancellationToken,
    exit_tx: watch::Sender<Option<i32>>,
    program: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = kill_switch.cancelled() => {
                if let Err(e) = child.start_kill() {
                    warn!("Failed to kill {}: {}", program, e);
                }
                child.wait().await
            }
        };

        let code = match status {
            Ok(status) => exit_code(status),
            Err(e) => {
                warn!("Failed to wait for {}: {}", program, e);
                SIGNAL_EXIT_CODE
            }
        };

        debug!("{} exited with {}", program, code);
        let _ = exit_tx.send(Some(code));
    })
}

fn spawn_reader<R>(
    reader: R,
    stream: Stream,
    captured: Arc<Mutex<Captured>>,
    program: String,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = decode_line(&buf);
                    trace!("{} {:?}: {}", program, stream, line);

                    let mut captured = captured.lock();
                    match stream {
                        Stream::Stdout => captured.stdout.push(line.clone()),
                        Stream::Stderr => captured.stderr.push(line.clone()),
                    }
                    captured.interleaved.push(line);
                }
                Err(e) => {
                    warn!("Reading {} {:?} failed: {}", program, stream, e);
                    break;
                }
            }
        }
    })
}

/// Strip the line terminator, keeping interior `\r` progress segments intact
fn decode_line(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let text = text.strip_suffix('\n').unwrap_or(&text);
    text.strip_suffix('\r').unwrap_or(text).to_string()
}

fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(SIGNAL_EXIT_CODE)
}
