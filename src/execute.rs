//! Execution of shell commands on behalf of an environment runner.
//!
//! The runner never spawns processes itself. It describes each command as an
//! [`ExecuteRequest`] and asks an [`ExecuteFactory`] for an [`ExecuteInstance`].
//! Starting the instance yields an [`ExecuteStatus`] handle; dropping the handle
//! ends the execution scope.

use crate::error::{Result, RunnerError};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// How long captured streams may stay open after the child exited.
const READER_GRACE: Duration = Duration::from_secs(2);

/// One shell command the runner wants executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecuteRequest {
    pub cmd: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    /// Semantic tag of the command, e.g. `_get_python` or `commands[0]`.
    pub run_id: String,
    /// Attach a pipe to the child's stdin instead of `/dev/null`.
    pub interactive: bool,
}

impl ExecuteRequest {
    pub fn new(
        cmd: Vec<String>,
        cwd: impl Into<PathBuf>,
        env: BTreeMap<String, String>,
        run_id: impl Into<String>,
    ) -> Self {
        Self {
            cmd,
            cwd: cwd.into(),
            env,
            run_id: run_id.into(),
            interactive: false,
        }
    }

    /// The command as it would be typed into a POSIX shell.
    pub fn shell_cmd(&self) -> String {
        self.cmd
            .iter()
            .map(|arg| shell_quote(arg))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn shell_quote(arg: &str) -> Cow<'_, str> {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "@%+=:,./-_".contains(c));
    if safe {
        Cow::Borrowed(arg)
    } else {
        Cow::Owned(format!("'{}'", arg.replace('\'', r#"'"'"'"#)))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Upper bound for a single command; `None` waits forever.
    pub timeout: Option<Duration>,
}

/// Shared capture buffer for one output stream of an execution.
///
/// Clones share the same buffer. With `echo` set, everything written is also
/// forwarded to the parent's stdout (or stderr for a stream named `err`).
#[derive(Debug, Clone)]
pub struct SyncWrite {
    name: String,
    buffer: Arc<Mutex<Vec<u8>>>,
    echo: bool,
}

impl SyncWrite {
    pub fn new(name: impl Into<String>, echo: bool) -> Self {
        Self {
            name: name.into(),
            buffer: Arc::new(Mutex::new(Vec::new())),
            echo,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn text(&self) -> String {
        let buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl Write for SyncWrite {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        if self.echo {
            if self.name == "err" {
                io::stderr().write_all(buf)?;
            } else {
                io::stdout().write_all(buf)?;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if self.echo {
            io::stdout().flush()?;
            io::stderr().flush()?;
        }
        Ok(())
    }
}

/// Handle on an execution that has been started.
pub trait ExecuteStatus: Send {
    /// Exit code once known; `None` while still running.
    fn exit_code(&self) -> Option<i32>;

    /// Blocks until the execution finishes or `timeout` elapses.
    fn wait(&mut self, timeout: Option<Duration>) -> Result<Option<i32>>;

    fn write_stdin(&mut self, content: &str) -> Result<()>;

    fn interrupt(&mut self) -> Result<()>;

    fn out(&self) -> &SyncWrite;

    fn err(&self) -> &SyncWrite;
}

/// An execution that has been prepared but not started.
pub trait ExecuteInstance: Send {
    fn request(&self) -> &ExecuteRequest;

    fn cmd(&self) -> &[String];

    /// Enters the execution scope. The scope ends when the returned status is dropped.
    fn start(self: Box<Self>) -> Result<Box<dyn ExecuteStatus>>;
}

/// Strategy used by environment runners to turn requests into executions.
pub trait ExecuteFactory: Send + Sync {
    fn create(
        &self,
        request: ExecuteRequest,
        options: ExecuteOptions,
        out: SyncWrite,
        err: SyncWrite,
    ) -> Box<dyn ExecuteInstance>;
}

/// Runs requests as real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalExecutor;

impl ExecuteFactory for LocalExecutor {
    fn create(
        &self,
        request: ExecuteRequest,
        options: ExecuteOptions,
        out: SyncWrite,
        err: SyncWrite,
    ) -> Box<dyn ExecuteInstance> {
        Box::new(LocalSubProcessInstance {
            request,
            options,
            out,
            err,
        })
    }
}

pub struct LocalSubProcessInstance {
    request: ExecuteRequest,
    options: ExecuteOptions,
    out: SyncWrite,
    err: SyncWrite,
}

impl ExecuteInstance for LocalSubProcessInstance {
    fn request(&self) -> &ExecuteRequest {
        &self.request
    }

    fn cmd(&self) -> &[String] {
        &self.request.cmd
    }

    fn start(self: Box<Self>) -> Result<Box<dyn ExecuteStatus>> {
        let Self {
            request,
            options,
            out,
            err,
        } = *self;
        let (program, args) = request.cmd.split_first().ok_or_else(|| {
            RunnerError::InvalidConfig(format!("{}: empty command", request.run_id))
        })?;

        debug!(run_id = %request.run_id, cmd = %request.shell_cmd(), "spawning");
        let mut command = Command::new(program);
        // Own process group, so an interrupt reaches everything the command started.
        #[cfg(unix)]
        std::os::unix::process::CommandExt::process_group(&mut command, 0);
        let mut child = command
            .args(args)
            .current_dir(&request.cwd)
            .envs(&request.env)
            .stdin(if request.interactive {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                cmd: request.shell_cmd(),
                source,
            })?;

        let (done_tx, done) = mpsc::channel();
        let mut readers = 0;
        if let Some(stdout) = child.stdout.take() {
            pump(stdout, out.clone(), done_tx.clone());
            readers += 1;
        }
        if let Some(stderr) = child.stderr.take() {
            pump(stderr, err.clone(), done_tx);
            readers += 1;
        }
        let stdin = child.stdin.take();

        Ok(Box::new(LocalSubProcessStatus {
            child,
            stdin,
            readers,
            done,
            exit_code: None,
            timeout: options.timeout,
            out,
            err,
        }))
    }
}

/// Copies one stream into its sink on a detached thread, signalling `done` at EOF.
fn pump<R: Read + Send + 'static>(mut source: R, mut sink: SyncWrite, done: Sender<()>) {
    thread::spawn(move || {
        if let Err(e) = io::copy(&mut source, &mut sink) {
            warn!(stream = sink.name(), "failed to capture output: {}", e);
        }
        let _ = done.send(());
    });
}

pub struct LocalSubProcessStatus {
    child: Child,
    stdin: Option<ChildStdin>,
    /// Reader threads that have not reported EOF yet.
    readers: usize,
    done: Receiver<()>,
    exit_code: Option<i32>,
    timeout: Option<Duration>,
    out: SyncWrite,
    err: SyncWrite,
}

impl LocalSubProcessStatus {
    /// Records the exit code and drains the output readers.
    ///
    /// A descendant that inherited the pipes can keep them open after the child
    /// exits; such readers are left detached once `READER_GRACE` runs out.
    fn finish(&mut self, status: ExitStatus) {
        self.exit_code = Some(exit_code_of(status));
        self.stdin = None;
        let deadline = Instant::now() + READER_GRACE;
        while self.readers > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.done.recv_timeout(remaining) {
                Ok(()) => self.readers -= 1,
                Err(_) => {
                    warn!(
                        pid = self.child.id(),
                        "output streams still open after exit, detaching"
                    );
                    self.readers = 0;
                }
            }
        }
    }

    #[cfg(unix)]
    fn kill(&mut self) -> io::Result<()> {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let pgid = Pid::from_raw(self.child.id() as i32);
        match killpg(pgid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    #[cfg(not(unix))]
    fn kill(&mut self) -> io::Result<()> {
        match self.child.kill() {
            Err(e) if e.kind() != io::ErrorKind::InvalidInput => Err(e),
            _ => Ok(()),
        }
    }
}

#[cfg(unix)]
fn exit_code_of(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| -signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code_of(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

impl ExecuteStatus for LocalSubProcessStatus {
    fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    fn wait(&mut self, timeout: Option<Duration>) -> Result<Option<i32>> {
        if self.exit_code.is_some() {
            return Ok(self.exit_code);
        }
        let status = match timeout.or(self.timeout) {
            Some(limit) => self.child.wait_timeout(limit)?,
            None => Some(self.child.wait()?),
        };
        if let Some(status) = status {
            self.finish(status);
        }
        Ok(self.exit_code)
    }

    fn write_stdin(&mut self, content: &str) -> Result<()> {
        let stdin = self.stdin.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "stdin is not attached")
        })?;
        stdin.write_all(content.as_bytes())?;
        stdin.flush()?;
        Ok(())
    }

    fn interrupt(&mut self) -> Result<()> {
        if self.exit_code.is_none() {
            debug!(pid = self.child.id(), "interrupting");
            self.kill()?;
        }
        Ok(())
    }

    fn out(&self) -> &SyncWrite {
        &self.out
    }

    fn err(&self) -> &SyncWrite {
        &self.err
    }
}

impl Drop for LocalSubProcessStatus {
    fn drop(&mut self) {
        if self.exit_code.is_none() {
            let _ = self.kill();
            if let Ok(status) = self.child.wait() {
                self.finish(status);
            }
        }
    }
}
