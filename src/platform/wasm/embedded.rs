//! In-process WASI interpreter used when no engine is installed
//!
//! Best effort: the guest runs on a host thread with WASI preview1 only.
//! Piped output is handed over once the guest finishes, and piped input is
//! delivered when the host side of stdin is closed.

use std::io::{self, Cursor, Read, Write};
use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::thread::JoinHandle;
use std::time::Duration;

use wasmtime::{Config, Engine, Linker, Module, Store};
use wasmtime_wasi::pipe::{MemoryInputPipe, MemoryOutputPipe};
use wasmtime_wasi::preview1::{self, WasiP1Ctx};
use wasmtime_wasi::{DirPerms, FilePerms, I32Exit, WasiCtxBuilder};

use super::Mapping;
use crate::config::{SandboxRequest, StdioConfig};
use crate::error::{Error, Result};
use crate::keep_alive::KeepAlive;
use crate::platform::{Child, ChildStdin, ChildStdout, Process};

/// Upper bound on buffered guest output per stream
const OUTPUT_CAPACITY: usize = 64 * 1024 * 1024;
const STDIN_POLL: Duration = Duration::from_millis(20);

/// Exit code reported for a guest that trapped
#[cfg(unix)]
const TRAP_EXIT_CODE: i32 = 128 + libc::SIGABRT;
#[cfg(not(unix))]
const TRAP_EXIT_CODE: i32 = 3;

enum GuestInput {
    Inherit,
    Null,
    Deferred(Receiver<Vec<u8>>),
}

enum GuestOutput {
    Inherit,
    Null,
    Pipe(SyncSender<Vec<u8>>),
}

/// Everything the guest thread needs to build its WASI context
struct GuestSetup {
    argv: Vec<String>,
    env: Vec<(String, String)>,
    mappings: Vec<Mapping>,
    stdin: GuestInput,
    stdout: GuestOutput,
    stderr: GuestOutput,
}

/// Compile the module of `request` and start it on a guest thread
pub(crate) fn launch(
    request: &SandboxRequest,
    mappings: &[Mapping],
    keep_alive: Vec<KeepAlive>,
) -> Result<Child> {
    let mut config = Config::new();
    config.epoch_interruption(true);
    let engine = Engine::new(&config)
        .map_err(|e| Error::os("start wasm engine", io::Error::other(e)))?;
    let module = Module::from_file(&engine, request.program())
        .map_err(|e| Error::os_path("load wasm module", request.program(), io::Error::other(e)))?;

    if request.current_dir().is_some() {
        tracing::debug!("wasm: embedded interpreter ignores the working directory");
    }
    if !request.options().wasm_packages().is_empty() {
        tracing::warn!("wasm: embedded interpreter cannot load packages, ignoring them");
    }

    let (stdin, stdin_handle) = input(request.stdin());
    let (stdout, stdout_handle) = output(request.stdout());
    let (stderr, stderr_handle) = output(request.stderr());

    let mut argv = vec![request.program().to_string()];
    argv.extend(request.args().iter().cloned());
    let env = request
        .env()
        .map(|env| env.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();
    let setup = GuestSetup {
        argv,
        env,
        mappings: mappings.to_vec(),
        stdin,
        stdout,
        stderr,
    };

    let killed = Arc::new(AtomicBool::new(false));
    let thread = {
        let engine = engine.clone();
        let killed = Arc::clone(&killed);
        std::thread::Builder::new()
            .name(format!("wasm-guest-{}", request.id()))
            .spawn(move || run_guest(&engine, &module, setup, &killed))
            .map_err(|e| Error::os("spawn guest thread", e))?
    };

    let process = GuestProcess {
        engine,
        killed,
        thread: Some(thread),
        status: None,
    };
    Ok(Child::from_parts(
        Process::Guest(process),
        stdin_handle,
        stdout_handle,
        stderr_handle,
        keep_alive,
    ))
}

fn input(config: StdioConfig) -> (GuestInput, Option<ChildStdin>) {
    match config {
        StdioConfig::Inherit => (GuestInput::Inherit, None),
        StdioConfig::Null => (GuestInput::Null, None),
        StdioConfig::Piped => {
            let (tx, rx) = mpsc::sync_channel(1);
            let writer = DeferredStdin {
                buf: Vec::new(),
                tx: Some(tx),
            };
            (GuestInput::Deferred(rx), Some(Box::new(writer) as ChildStdin))
        }
    }
}

fn output(config: StdioConfig) -> (GuestOutput, Option<ChildStdout>) {
    match config {
        StdioConfig::Inherit => (GuestOutput::Inherit, None),
        StdioConfig::Null => (GuestOutput::Null, None),
        StdioConfig::Piped => {
            let (tx, rx) = mpsc::sync_channel(1);
            let reader = DeferredOutput { rx, buf: None };
            (GuestOutput::Pipe(tx), Some(Box::new(reader) as ChildStdout))
        }
    }
}

fn run_guest(
    engine: &Engine,
    module: &Module,
    setup: GuestSetup,
    killed: &AtomicBool,
) -> io::Result<ExitStatus> {
    let mut builder = WasiCtxBuilder::new();
    builder.args(&setup.argv[..]).envs(&setup.env[..]);
    for mapping in &setup.mappings {
        builder
            .preopened_dir(
                &mapping.host,
                mapping.guest.to_string_lossy(),
                DirPerms::all(),
                FilePerms::all(),
            )
            .map_err(io::Error::other)?;
    }

    match setup.stdin {
        GuestInput::Inherit => {
            builder.inherit_stdin();
        }
        GuestInput::Null => {}
        GuestInput::Deferred(rx) => match wait_for_stdin(&rx, killed) {
            Some(bytes) => {
                builder.stdin(MemoryInputPipe::new(bytes));
            }
            None => return Ok(killed_status()),
        },
    }
    let stdout = match setup.stdout {
        GuestOutput::Inherit => {
            builder.inherit_stdout();
            None
        }
        GuestOutput::Null => None,
        GuestOutput::Pipe(tx) => {
            let pipe = MemoryOutputPipe::new(OUTPUT_CAPACITY);
            builder.stdout(pipe.clone());
            Some((pipe, tx))
        }
    };
    let stderr = match setup.stderr {
        GuestOutput::Inherit => {
            builder.inherit_stderr();
            None
        }
        GuestOutput::Null => None,
        GuestOutput::Pipe(tx) => {
            let pipe = MemoryOutputPipe::new(OUTPUT_CAPACITY);
            builder.stderr(pipe.clone());
            Some((pipe, tx))
        }
    };

    let status = execute(engine, module, builder.build_p1(), killed);

    for (pipe, tx) in [stdout, stderr].into_iter().flatten() {
        let _ = tx.send(pipe.contents().to_vec());
    }
    status
}

fn execute(
    engine: &Engine,
    module: &Module,
    ctx: WasiP1Ctx,
    killed: &AtomicBool,
) -> io::Result<ExitStatus> {
    let mut linker: Linker<WasiP1Ctx> = Linker::new(engine);
    preview1::add_to_linker_sync(&mut linker, |ctx| ctx).map_err(io::Error::other)?;
    let mut store = Store::new(engine, ctx);
    // Armed before the kill flag is read, so a later kill always traps.
    store.set_epoch_deadline(1);
    if killed.load(Ordering::SeqCst) {
        return Ok(killed_status());
    }

    let instance = linker
        .instantiate(&mut store, module)
        .map_err(io::Error::other)?;
    let start = instance
        .get_typed_func::<(), ()>(&mut store, "_start")
        .map_err(io::Error::other)?;
    match start.call(&mut store, ()) {
        Ok(()) => Ok(exit_status(0)),
        Err(e) => {
            if let Some(exit) = e.downcast_ref::<I32Exit>() {
                Ok(exit_status(exit.0))
            } else if killed.load(Ordering::SeqCst) {
                Ok(killed_status())
            } else {
                tracing::debug!(error = %e, "wasm: guest trapped");
                Ok(exit_status(TRAP_EXIT_CODE))
            }
        }
    }
}

/// Block until the host closes stdin; `None` once the guest was killed
fn wait_for_stdin(rx: &Receiver<Vec<u8>>, killed: &AtomicBool) -> Option<Vec<u8>> {
    loop {
        if killed.load(Ordering::SeqCst) {
            return None;
        }
        match rx.recv_timeout(STDIN_POLL) {
            Ok(bytes) => return Some(bytes),
            Err(RecvTimeoutError::Disconnected) => return Some(Vec::new()),
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}

fn exit_status(code: i32) -> ExitStatus {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        ExitStatus::from_raw((code & 0xff) << 8)
    }
    #[cfg(windows)]
    {
        use std::os::windows::process::ExitStatusExt;
        ExitStatus::from_raw(code as u32)
    }
}

fn killed_status() -> ExitStatus {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        ExitStatus::from_raw(libc::SIGKILL)
    }
    #[cfg(windows)]
    {
        use std::os::windows::process::ExitStatusExt;
        ExitStatus::from_raw(1)
    }
}

/// Stdin handed to the guest in one piece when dropped
struct DeferredStdin {
    buf: Vec<u8>,
    tx: Option<SyncSender<Vec<u8>>>,
}

impl Write for DeferredStdin {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for DeferredStdin {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(std::mem::take(&mut self.buf));
        }
    }
}

/// Guest output, readable once the guest has finished
struct DeferredOutput {
    rx: Receiver<Vec<u8>>,
    buf: Option<Cursor<Vec<u8>>>,
}

impl Read for DeferredOutput {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let rx = &self.rx;
        self.buf
            .get_or_insert_with(|| Cursor::new(rx.recv().unwrap_or_default()))
            .read(out)
    }
}

/// A guest running on a host thread
pub(crate) struct GuestProcess {
    engine: Engine,
    killed: Arc<AtomicBool>,
    thread: Option<JoinHandle<io::Result<ExitStatus>>>,
    status: Option<ExitStatus>,
}

impl GuestProcess {
    /// The guest shares the host's process id
    pub(crate) fn id(&self) -> u32 {
        std::process::id()
    }

    pub(crate) fn try_wait(&mut self) -> io::Result<Option<ExitStatus>> {
        if self.status.is_none() && self.thread.as_ref().is_some_and(JoinHandle::is_finished) {
            if let Some(thread) = self.thread.take() {
                let status = thread
                    .join()
                    .map_err(|_| io::Error::other("wasm guest thread panicked"))??;
                self.status = Some(status);
            }
        }
        Ok(self.status)
    }

    pub(crate) fn kill(&mut self) -> io::Result<()> {
        self.killed.store(true, Ordering::SeqCst);
        self.engine.increment_epoch();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::platform::wasm::WasmRuntime;

    const HELLO_EXIT_3: &str = r#"
(module
  (import "wasi_snapshot_preview1" "fd_write"
    (func $fd_write (param i32 i32 i32 i32) (result i32)))
  (import "wasi_snapshot_preview1" "proc_exit" (func $proc_exit (param i32)))
  (memory (export "memory") 1)
  (data (i32.const 16) "hello\n")
  (func (export "_start")
    (i32.store (i32.const 0) (i32.const 16))
    (i32.store (i32.const 4) (i32.const 6))
    (drop (call $fd_write (i32.const 1) (i32.const 0) (i32.const 1) (i32.const 8)))
    (call $proc_exit (i32.const 3))))
"#;

    const SPIN: &str = r#"
(module
  (memory (export "memory") 1)
  (func (export "_start") (loop $l (br $l))))
"#;

    fn module(dir: &std::path::Path, name: &str, text: &str) -> String {
        let path = dir.join(name);
        std::fs::write(&path, text).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn runtime(dir: &std::path::Path) -> WasmRuntime {
        WasmRuntime::embedded(dir.join("mirror")).unwrap()
    }

    #[tokio::test]
    async fn test_guest_output_and_exit_code() {
        let temp = tempfile::tempdir().unwrap();
        let program = module(temp.path(), "hello.wat", HELLO_EXIT_3);
        let request = SandboxRequest::builder([program], "embedded-hello")
            .build()
            .unwrap();

        let mut child = runtime(temp.path()).launch(&request).unwrap();
        let output = child.communicate(None).await.unwrap();
        assert_eq!(output.stdout, b"hello\n");
        assert_eq!(output.status.code(), Some(3));
    }

    #[tokio::test]
    async fn test_terminate_stops_spinning_guest() {
        let temp = tempfile::tempdir().unwrap();
        let program = module(temp.path(), "spin.wat", SPIN);
        let request = SandboxRequest::builder([program], "embedded-spin")
            .build()
            .unwrap();

        let mut child = runtime(temp.path()).launch(&request).unwrap();
        let result = child.wait(Some(Duration::from_millis(50))).await;
        assert!(matches!(result, Err(Error::Timeout(_))));

        child.terminate().unwrap();
        let status = child.wait(Some(Duration::from_secs(10))).await.unwrap();
        assert!(!status.success());
    }

    #[test]
    fn test_missing_module_fails_launch() {
        let temp = tempfile::tempdir().unwrap();
        let missing: PathBuf = temp.path().join("absent.wasm");
        let request = SandboxRequest::builder([missing.to_string_lossy().into_owned()], "embedded-missing")
            .build()
            .unwrap();
        assert!(runtime(temp.path()).launch(&request).is_err());
    }
}
