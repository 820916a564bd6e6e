//! Environment probing and backend selection
//!
//! Probing only records where external tools live. Selection is a pure
//! function of those facts, the target OS and whether the request needs the
//! WebAssembly runtime.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::config::SandboxRequest;
use crate::error::{Error, Result};
use crate::platform::wasm::WasmEngine;

static TOOL_CACHE: Mutex<BTreeMap<String, Option<PathBuf>>> = Mutex::new(BTreeMap::new());

/// The isolation backend variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Linux namespaces through `bwrap`
    Namespace,
    /// macOS `sandbox-exec` with a generated profile
    DeclarativeProfile,
    /// FreeBSD jail set up by the privileged warden
    JailBroker,
    /// Windows AppContainer with per-path ACLs
    AppContainer,
    /// WebAssembly engine with explicit directory mapping
    Wasm,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BackendKind::Namespace => "namespace",
            BackendKind::DeclarativeProfile => "declarative-profile",
            BackendKind::JailBroker => "jail-broker",
            BackendKind::AppContainer => "app-container",
            BackendKind::Wasm => "wasm",
        };
        f.write_str(name)
    }
}

/// Operating system families with a distinct backend order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetOs {
    Linux,
    MacOs,
    FreeBsd,
    Windows,
    Other,
}

impl TargetOs {
    pub fn current() -> Self {
        if cfg!(target_os = "linux") {
            TargetOs::Linux
        } else if cfg!(target_os = "macos") {
            TargetOs::MacOs
        } else if cfg!(target_os = "freebsd") {
            TargetOs::FreeBsd
        } else if cfg!(windows) {
            TargetOs::Windows
        } else {
            TargetOs::Other
        }
    }
}

/// Locations of the external tools each backend needs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Probe {
    pub bwrap: Option<PathBuf>,
    pub sandbox_exec: Option<PathBuf>,
    pub elevation: Option<PathBuf>,
    pub warden: Option<PathBuf>,
    pub wasmer: Option<PathBuf>,
    pub wasmtime: Option<PathBuf>,
    pub app_container: bool,
    /// The in-process interpreter was compiled in
    pub embedded_wasm: bool,
}

impl Probe {
    /// Look up every tool on the current host
    ///
    /// `elevation` and `warden` may be bare names (searched on `PATH`) or
    /// explicit paths.
    pub fn detect(elevation: &Path, warden: &Path) -> Self {
        let probe = Self {
            bwrap: find_tool("bwrap"),
            sandbox_exec: find_tool("sandbox-exec"),
            elevation: resolve(elevation),
            warden: resolve(warden),
            wasmer: find_tool(WasmEngine::Wasmer.tool_name()),
            wasmtime: find_tool(WasmEngine::Wasmtime.tool_name()),
            app_container: cfg!(windows),
            embedded_wasm: cfg!(feature = "embedded-wasm"),
        };
        tracing::debug!(?probe, "sandbox: probed environment");
        probe
    }

    /// Preferred WebAssembly engine, wasmer before wasmtime
    pub fn wasm_engine(&self) -> Option<(WasmEngine, PathBuf)> {
        self.wasmer
            .clone()
            .map(|p| (WasmEngine::Wasmer, p))
            .or_else(|| self.wasmtime.clone().map(|p| (WasmEngine::Wasmtime, p)))
    }

    /// Whether any WebAssembly engine can run a module, embedded included
    pub fn has_wasm(&self) -> bool {
        self.wasm_engine().is_some() || self.embedded_wasm
    }

    /// The native backend of `os`, if its tools are present
    pub(crate) fn native(&self, os: TargetOs) -> Option<BackendKind> {
        match os {
            TargetOs::Linux => self.bwrap.as_ref().map(|_| BackendKind::Namespace),
            TargetOs::MacOs => self
                .sandbox_exec
                .as_ref()
                .map(|_| BackendKind::DeclarativeProfile),
            TargetOs::FreeBsd => (self.elevation.is_some() && self.warden.is_some())
                .then_some(BackendKind::JailBroker),
            TargetOs::Windows => self.app_container.then_some(BackendKind::AppContainer),
            TargetOs::Other => None,
        }
    }
}

/// Pick the backend for a launch
///
/// The native mechanism of `os` wins when its tools are present, then the
/// WebAssembly runtime: an installed engine, else the embedded interpreter.
/// A request that needs Wasm only ever gets Wasm.
pub fn select(os: TargetOs, probe: &Probe, wants_wasm: bool) -> Result<BackendKind> {
    let has_engine = probe.has_wasm();
    if wants_wasm {
        return if has_engine {
            Ok(BackendKind::Wasm)
        } else {
            Err(Error::EnvironmentUnsupported(
                "WebAssembly execution requested but no engine is installed or embedded"
                    .to_string(),
            ))
        };
    }
    if let Some(kind) = probe.native(os) {
        return Ok(kind);
    }
    if has_engine {
        return Ok(BackendKind::Wasm);
    }
    Err(Error::EnvironmentUnsupported(format!(
        "no isolation tool found for {os:?} and no WebAssembly engine installed"
    )))
}

/// Whether the request must run under the WebAssembly runtime
pub(crate) fn wants_wasm(request: &SandboxRequest) -> bool {
    request.options().force_wasm() || is_wasm_module(Path::new(request.program()))
}

/// Whether `path` is an absolute path to a Wasm or WebC module
pub fn is_wasm_module(path: &Path) -> bool {
    if !path.is_absolute() {
        return false;
    }
    let mut magic = [0u8; 5];
    let read = File::open(path).and_then(|mut file| {
        let mut filled = 0;
        while filled < magic.len() {
            match file.read(&mut magic[filled..])? {
                0 => break,
                n => filled += n,
            }
        }
        Ok(filled)
    });
    match read {
        Ok(n) => magic[..n].starts_with(b"\0asm") || magic[..n].starts_with(b"\0webc"),
        Err(_) => false,
    }
}

/// Drop every cached tool lookup so the next probe re-scans `PATH`
pub fn invalidate_probe() {
    TOOL_CACHE
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clear();
}

fn find_tool(name: &str) -> Option<PathBuf> {
    let mut cache = TOOL_CACHE.lock().unwrap_or_else(PoisonError::into_inner);
    cache
        .entry(name.to_string())
        .or_insert_with(|| which::which(name).ok())
        .clone()
}

fn resolve(program: &Path) -> Option<PathBuf> {
    if program.components().count() > 1 {
        return program.is_file().then(|| program.to_path_buf());
    }
    find_tool(&program.to_string_lossy())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe() -> Probe {
        Probe::default()
    }

    #[test]
    fn test_native_tool_wins() {
        let facts = Probe {
            bwrap: Some("/usr/bin/bwrap".into()),
            wasmer: Some("/usr/bin/wasmer".into()),
            ..probe()
        };
        assert_eq!(select(TargetOs::Linux, &facts, false).unwrap(), BackendKind::Namespace);
    }

    #[test]
    fn test_falls_back_to_secondary() {
        let facts = Probe {
            wasmtime: Some("/usr/bin/wasmtime".into()),
            ..probe()
        };
        for os in [TargetOs::Linux, TargetOs::MacOs, TargetOs::FreeBsd, TargetOs::Other] {
            assert_eq!(select(os, &facts, false).unwrap(), BackendKind::Wasm);
        }
    }

    #[test]
    fn test_nothing_available_is_unsupported() {
        for os in [TargetOs::Linux, TargetOs::MacOs, TargetOs::FreeBsd, TargetOs::Windows] {
            assert!(matches!(
                select(os, &probe(), false),
                Err(Error::EnvironmentUnsupported(_))
            ));
        }
    }

    #[test]
    fn test_jail_needs_elevation_and_warden() {
        let only_sudo = Probe {
            elevation: Some("/usr/local/bin/sudo".into()),
            ..probe()
        };
        assert!(select(TargetOs::FreeBsd, &only_sudo, false).is_err());

        let both = Probe {
            warden: Some("/usr/local/bin/kennel-warden".into()),
            ..only_sudo
        };
        assert_eq!(select(TargetOs::FreeBsd, &both, false).unwrap(), BackendKind::JailBroker);
    }

    #[test]
    fn test_forced_wasm_overrides_native() {
        let facts = Probe {
            sandbox_exec: Some("/usr/bin/sandbox-exec".into()),
            wasmer: Some("/opt/wasmer".into()),
            ..probe()
        };
        assert_eq!(select(TargetOs::MacOs, &facts, true).unwrap(), BackendKind::Wasm);

        let no_engine = Probe {
            sandbox_exec: Some("/usr/bin/sandbox-exec".into()),
            ..probe()
        };
        assert!(matches!(
            select(TargetOs::MacOs, &no_engine, true),
            Err(Error::EnvironmentUnsupported(_))
        ));
    }

    #[test]
    fn test_embedded_engine_is_last_resort() {
        let facts = Probe {
            embedded_wasm: true,
            ..probe()
        };
        for os in [TargetOs::Linux, TargetOs::MacOs, TargetOs::FreeBsd, TargetOs::Other] {
            assert_eq!(select(os, &facts, false).unwrap(), BackendKind::Wasm);
        }
        assert_eq!(select(TargetOs::Linux, &facts, true).unwrap(), BackendKind::Wasm);
        assert!(facts.wasm_engine().is_none());

        let native = Probe {
            bwrap: Some("/usr/bin/bwrap".into()),
            ..facts
        };
        assert_eq!(select(TargetOs::Linux, &native, false).unwrap(), BackendKind::Namespace);
    }

    #[test]
    fn test_detect_reports_embedded_build() {
        let facts = Probe::detect(Path::new("sudo"), Path::new("kennel-warden"));
        assert_eq!(facts.embedded_wasm, cfg!(feature = "embedded-wasm"));
    }

    #[test]
    fn test_wasmer_preferred_over_wasmtime() {
        let facts = Probe {
            wasmer: Some("/a/wasmer".into()),
            wasmtime: Some("/a/wasmtime".into()),
            ..probe()
        };
        assert_eq!(facts.wasm_engine().unwrap().0, WasmEngine::Wasmer);
    }

    #[test]
    fn test_detects_wasm_magic() {
        let dir = tempfile::tempdir().unwrap();
        let module = dir.path().join("hello.wasm");
        std::fs::write(&module, b"\0asm\x01\0\0\0").unwrap();
        let webc = dir.path().join("pkg.webc");
        std::fs::write(&webc, b"\0webc002").unwrap();
        let script = dir.path().join("run.sh");
        std::fs::write(&script, b"#!/bin/sh\n").unwrap();

        assert!(is_wasm_module(&module));
        assert!(is_wasm_module(&webc));
        assert!(!is_wasm_module(&script));
        assert!(!is_wasm_module(Path::new("hello.wasm")));
    }
}
