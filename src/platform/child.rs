use std::io::{Read, Write};
use std::process::{ExitStatus, Output};
use std::time::{Duration, Instant};

use async_io::Timer;
use blocking::{Task, unblock};
use futures_lite::future;

use crate::error::{Error, Result};
use crate::keep_alive::KeepAlive;

/// How often a bounded wait re-checks the process
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Signals that can be delivered to a sandboxed process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
    Interrupt,
    Hangup,
    User1,
    User2,
}

#[cfg(unix)]
impl From<Signal> for nix::sys::signal::Signal {
    fn from(signal: Signal) -> Self {
        use nix::sys::signal::Signal as Nix;
        match signal {
            Signal::Terminate => Nix::SIGTERM,
            Signal::Kill => Nix::SIGKILL,
            Signal::Interrupt => Nix::SIGINT,
            Signal::Hangup => Nix::SIGHUP,
            Signal::User1 => Nix::SIGUSR1,
            Signal::User2 => Nix::SIGUSR2,
        }
    }
}

pub type ChildStdin = Box<dyn Write + Send>;
pub type ChildStdout = Box<dyn Read + Send>;
pub type ChildStderr = Box<dyn Read + Send>;

/// The OS process behind a [`Child`]
pub(crate) enum Process {
    Std(std::process::Child),
    #[cfg(windows)]
    Container(crate::platform::container::windows::ContainerProcess),
    #[cfg(feature = "embedded-wasm")]
    Guest(crate::platform::wasm::embedded::GuestProcess),
}

impl Process {
    fn id(&self) -> u32 {
        match self {
            Process::Std(child) => child.id(),
            #[cfg(windows)]
            Process::Container(process) => process.id(),
            #[cfg(feature = "embedded-wasm")]
            Process::Guest(process) => process.id(),
        }
    }

    fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        match self {
            Process::Std(child) => child.try_wait(),
            #[cfg(windows)]
            Process::Container(process) => process.try_wait(),
            #[cfg(feature = "embedded-wasm")]
            Process::Guest(process) => process.try_wait(),
        }
    }

    fn kill(&mut self) -> std::io::Result<()> {
        match self {
            Process::Std(child) => child.kill(),
            #[cfg(windows)]
            Process::Container(process) => process.kill(),
            #[cfg(feature = "embedded-wasm")]
            Process::Guest(process) => process.kill(),
        }
    }
}

/// A spawned sandboxed process
///
/// The handle owns the keep-alive markers of the launch that created it.
/// Dropping it releases those markers and closes the OS handle; the process
/// itself keeps running unless it was terminated.
pub struct Child {
    process: Option<Process>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    keep_alive: Vec<KeepAlive>,
    status: Option<ExitStatus>,
    pid: u32,
}

impl Child {
    pub(crate) fn new(mut inner: std::process::Child, keep_alive: Vec<KeepAlive>) -> Self {
        let stdin = inner.stdin.take().map(|s| Box::new(s) as ChildStdin);
        let stdout = inner.stdout.take().map(|s| Box::new(s) as ChildStdout);
        let stderr = inner.stderr.take().map(|s| Box::new(s) as ChildStderr);
        Self::from_parts(Process::Std(inner), stdin, stdout, stderr, keep_alive)
    }

    pub(crate) fn from_parts(
        process: Process,
        stdin: Option<ChildStdin>,
        stdout: Option<ChildStdout>,
        stderr: Option<ChildStderr>,
        keep_alive: Vec<KeepAlive>,
    ) -> Self {
        let pid = process.id();
        Self {
            process: Some(process),
            stdin,
            stdout,
            stderr,
            keep_alive,
            status: None,
            pid,
        }
    }

    /// Get the process ID
    pub fn id(&self) -> u32 {
        self.pid
    }

    /// Number of keep-alive markers held by this handle
    pub fn keep_alive_count(&self) -> usize {
        self.keep_alive.len()
    }

    /// Access the child's stdin
    pub fn stdin(&mut self) -> Option<&mut ChildStdin> {
        self.stdin.as_mut()
    }

    /// Access the child's stdout
    pub fn stdout(&mut self) -> Option<&mut ChildStdout> {
        self.stdout.as_mut()
    }

    /// Access the child's stderr
    pub fn stderr(&mut self) -> Option<&mut ChildStderr> {
        self.stderr.as_mut()
    }

    /// Take ownership of the child's stdin
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    /// Take ownership of the child's stdout
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Take ownership of the child's stderr
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    fn process(&mut self) -> Result<&mut Process> {
        self.process
            .as_mut()
            .ok_or_else(|| Error::InvalidRequest("child process no longer available".to_string()))
    }

    /// Check if the child has exited without blocking
    pub fn poll(&mut self) -> Result<Option<ExitStatus>> {
        if self.status.is_none() {
            self.status = self
                .process()?
                .try_wait()
                .map_err(|e| Error::os("poll process", e))?;
        }
        Ok(self.status)
    }

    /// Wait for the child to exit
    ///
    /// With a timeout, returns [`Error::Timeout`] once it expires; the process
    /// is left running. Dropping the future before it completes leaves the
    /// child fully usable.
    pub async fn wait(&mut self, timeout: Option<Duration>) -> Result<ExitStatus> {
        if let Some(status) = self.status {
            return Ok(status);
        }
        let deadline = timeout.map(|limit| (Instant::now() + limit, limit));
        let status = loop {
            if let Some(status) = self.poll()? {
                break status;
            }
            if let Some((deadline, limit)) = deadline {
                if Instant::now() >= deadline {
                    return Err(Error::Timeout(limit));
                }
            }
            Timer::after(POLL_INTERVAL).await;
        };
        tracing::debug!(pid = self.pid, code = ?status.code(), "sandbox: process exited");
        self.status = Some(status);
        Ok(status)
    }

    /// Forcefully terminate the child
    pub fn terminate(&mut self) -> Result<()> {
        if self.poll()?.is_some() {
            return Ok(());
        }
        self.process()?
            .kill()
            .map_err(|e| Error::os("terminate process", e))
    }

    /// Deliver a signal to the child; a no-op once it has exited
    pub fn send_signal(&mut self, signal: Signal) -> Result<()> {
        if self.poll()?.is_some() {
            return Ok(());
        }
        // An in-process guest has no pid of its own to signal.
        #[cfg(feature = "embedded-wasm")]
        if matches!(self.process, Some(Process::Guest(_))) {
            return match signal {
                Signal::Terminate | Signal::Kill | Signal::Interrupt => self.terminate(),
                other => Err(Error::UnsupportedSignal(other)),
            };
        }
        #[cfg(unix)]
        {
            let pid = nix::unistd::Pid::from_raw(self.pid as i32);
            nix::sys::signal::kill(pid, nix::sys::signal::Signal::from(signal))
                .map_err(|e| Error::os("send signal", std::io::Error::from(e)))
        }
        #[cfg(not(unix))]
        match signal {
            Signal::Terminate | Signal::Kill => self.terminate(),
            other => Err(Error::UnsupportedSignal(other)),
        }
    }

    /// Feed `input` to stdin, drain stdout and stderr, and wait for exit
    ///
    /// Each output stream is read on its own background task so a full pipe
    /// never stalls the child.
    pub async fn communicate(&mut self, input: Option<Vec<u8>>) -> Result<Output> {
        let stdout_reader = self.stdout.take().map(|pipe| unblock(move || drain(pipe)));
        let stderr_reader = self.stderr.take().map(|pipe| unblock(move || drain(pipe)));

        let stdin = self.stdin.take();
        if let (Some(mut pipe), Some(input)) = (stdin, input) {
            unblock(move || match pipe.write_all(&input).and_then(|()| pipe.flush()) {
                Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => Err(e),
                _ => Ok(()),
            })
            .await
            .map_err(|e| Error::os("write to stdin", e))?;
        }

        let status = self.wait(None).await?;

        let (stdout, stderr) = future::zip(collect(stdout_reader), collect(stderr_reader)).await;
        let stdout = stdout.map_err(|e| Error::os("read stdout", e))?;
        let stderr = stderr.map_err(|e| Error::os("read stderr", e))?;

        Ok(Output {
            status,
            stdout,
            stderr,
        })
    }
}

impl std::fmt::Debug for Child {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Child")
            .field("pid", &self.pid)
            .field("status", &self.status)
            .field("keep_alive", &self.keep_alive.len())
            .finish()
    }
}

async fn collect(task: Option<Task<std::io::Result<Vec<u8>>>>) -> std::io::Result<Vec<u8>> {
    match task {
        Some(task) => task.await,
        None => Ok(Vec::new()),
    }
}

fn drain(mut pipe: Box<dyn Read + Send>) -> std::io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    pipe.read_to_end(&mut buf)?;
    Ok(buf)
}
