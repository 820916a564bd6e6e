//! WebAssembly runtime backend
//!
//! Runs a Wasm module under an external engine, or the embedded interpreter
//! when none is installed. Engines can only map directories, so readable
//! paths are snapshotted into a per-id mirror and writable files are exposed
//! through a staging directory of symlinks.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Mutex, MutexGuard, PoisonError};

use sha2::{Digest, Sha256};

use crate::config::SandboxRequest;
use crate::error::{Error, Result};
use crate::keep_alive::{self, KeepAlive};
use crate::platform::Child;
use crate::policy::AccessPolicy;

#[cfg(feature = "embedded-wasm")]
pub(crate) mod embedded;

const NETWORK_DENY_ALL: &str = "--net=ipv4:deny=*:*,ipv6:deny=*:*,dns:deny=*:*";
const STAGING_DIR: &str = ".writable";

/// Serializes every change to the mirror tree
static MIRROR_LOCK: Mutex<()> = Mutex::new(());

fn lock_mirror() -> MutexGuard<'static, ()> {
    MIRROR_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Supported external engines, in preference order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WasmEngine {
    Wasmer,
    Wasmtime,
}

impl WasmEngine {
    pub(crate) fn tool_name(self) -> &'static str {
        match self {
            WasmEngine::Wasmer => "wasmer",
            WasmEngine::Wasmtime => "wasmtime",
        }
    }
}

/// A guest directory backed by a host directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Mapping {
    pub(crate) guest: PathBuf,
    pub(crate) host: PathBuf,
}

/// What executes the module
enum Runner {
    External { engine: WasmEngine, program: PathBuf },
    #[cfg(feature = "embedded-wasm")]
    Embedded,
}

pub(crate) struct WasmRuntime {
    runner: Runner,
    mirror_root: PathBuf,
}

impl WasmRuntime {
    pub(crate) fn new(engine: WasmEngine, program: PathBuf, mirror_root: PathBuf) -> Self {
        Self {
            runner: Runner::External { engine, program },
            mirror_root,
        }
    }

    /// Runtime backed by the in-process interpreter
    ///
    /// Fails unless the crate was built with the `embedded-wasm` feature.
    pub(crate) fn embedded(mirror_root: PathBuf) -> Result<Self> {
        #[cfg(feature = "embedded-wasm")]
        {
            tracing::warn!(
                "wasm: no engine installed, using the embedded interpreter (best effort, no package support)"
            );
            Ok(Self {
                runner: Runner::Embedded,
                mirror_root,
            })
        }
        #[cfg(not(feature = "embedded-wasm"))]
        {
            let _ = mirror_root;
            Err(Error::EnvironmentUnsupported(
                "no WebAssembly engine installed and the embedded interpreter is not built in"
                    .to_string(),
            ))
        }
    }

    /// Mirror directory owned by one sandbox id
    fn mirror_dir(&self, id: &str) -> PathBuf {
        let digest = Sha256::digest(id.as_bytes());
        let name: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        self.mirror_root.join(name)
    }

    pub(crate) fn launch(&self, request: &SandboxRequest) -> Result<Child> {
        let policy = AccessPolicy::from_request(request);
        if !policy.readable().is_empty() && !request.options().mirror_readable_paths() {
            return Err(Error::InvalidRequest(
                "readable paths need mirror_readable_paths under the Wasm runtime".to_string(),
            ));
        }

        let mut mappings = self.prepare_mirror(request, &policy)?;

        let keep_alive: Vec<KeepAlive> = keep_alive::ensure_all(policy.ensure_exists())?
            .into_iter()
            .map(|(handle, _)| handle)
            .collect();
        for path in policy.ensure_exists() {
            push_unique(&mut mappings, path, path);
        }

        match &self.runner {
            Runner::External { engine, program } => {
                spawn_external(*engine, program, request, &mappings, keep_alive)
            }
            #[cfg(feature = "embedded-wasm")]
            Runner::Embedded => {
                tracing::info!(
                    id = request.id(),
                    engine = "embedded",
                    module = request.program(),
                    "sandbox: launching under wasm runtime"
                );
                embedded::launch(request, &mappings, keep_alive)
            }
        }
    }

    /// Rebuild the mirror of `request` and return the directories to map
    ///
    /// Holds the mirror lock throughout, so a concurrent launch or clear
    /// never sees a half-copied tree.
    fn prepare_mirror(&self, request: &SandboxRequest, policy: &AccessPolicy) -> Result<Vec<Mapping>> {
        let _guard = lock_mirror();
        let mirror = self.mirror_dir(request.id());
        remove_tree(&mirror)?;

        let mut mappings = Vec::new();
        let mut staged = false;
        let missing = request.options().missing_sources();

        for path in policy.readable() {
            if !missing.check(path)? {
                continue;
            }
            let copy = mirror.join(relative_to_root(path));
            copy_tree(path, &copy)?;
            tracing::debug!(path = %path.display(), mirror = %copy.display(), "wasm: mirrored readable path");
            staged = true;
            if path.is_dir() {
                mappings.push(Mapping {
                    guest: path.clone(),
                    host: copy,
                });
            } else if let (Some(guest), Some(host)) = (path.parent(), copy.parent()) {
                push_unique(&mut mappings, guest, host);
            }
        }

        // Writable files share a staging directory per parent.
        let mut staging: BTreeMap<PathBuf, PathBuf> = BTreeMap::new();
        for path in policy.writable() {
            if !missing.check(path)? {
                continue;
            }
            if path.is_dir() {
                tracing::debug!(path = %path.display(), "wasm: map writable directory");
                push_unique(&mut mappings, path, path);
                continue;
            }
            let Some(parent) = path.parent() else {
                continue;
            };
            let stage = staging.entry(parent.to_path_buf()).or_insert_with(|| {
                mirror.join(STAGING_DIR).join(relative_to_root(parent))
            });
            link_file(path, stage)?;
            tracing::debug!(path = %path.display(), stage = %stage.display(), "wasm: staged writable file");
            staged = true;
        }
        for (guest, host) in &staging {
            push_unique(&mut mappings, guest, host);
        }

        if !staged {
            self.cleanup_mirror(&mirror)?;
        }
        Ok(mappings)
    }

    /// Remove an unused mirror and the root if nothing else lives there
    fn cleanup_mirror(&self, mirror: &Path) -> Result<()> {
        remove_tree(mirror)?;
        match fs::remove_dir(&self.mirror_root) {
            Ok(()) => Ok(()),
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::DirectoryNotEmpty
                ) =>
            {
                Ok(())
            }
            Err(e) => Err(Error::os_path("remove directory", &self.mirror_root, e)),
        }
    }

    pub(crate) fn delete_all(&self) -> Result<()> {
        clear_mirror(&self.mirror_root)
    }
}

/// Remove every mirrored and staged path under `root`
pub(crate) fn clear_mirror(root: &Path) -> Result<()> {
    let _guard = lock_mirror();
    remove_tree(root)?;
    tracing::info!(path = %root.display(), "sandbox: wasm mirror cleared");
    Ok(())
}

fn spawn_external(
    engine: WasmEngine,
    program: &Path,
    request: &SandboxRequest,
    mappings: &[Mapping],
    keep_alive: Vec<KeepAlive>,
) -> Result<Child> {
    let mut cmd = Command::new(program);
    cmd.args(engine_args(engine, request, mappings));
    if let Some(dir) = request.current_dir() {
        cmd.current_dir(dir);
    }
    cmd.stdin(Stdio::from(request.stdin()));
    cmd.stdout(Stdio::from(request.stdout()));
    cmd.stderr(Stdio::from(request.stderr()));

    tracing::info!(
        id = request.id(),
        engine = engine.tool_name(),
        module = request.program(),
        "sandbox: launching under wasm runtime"
    );
    let child = cmd
        .spawn()
        .map_err(|e| Error::os_path("spawn", program, e))?;
    Ok(Child::new(child, keep_alive))
}

/// Engine arguments for a request, up to and including the module's own
fn engine_args(engine: WasmEngine, request: &SandboxRequest, mappings: &[Mapping]) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["run".into()];
    if engine == WasmEngine::Wasmer {
        args.push(NETWORK_DENY_ALL.into());
    }

    for mapping in mappings {
        let (flag, first, second) = match engine {
            WasmEngine::Wasmer => ("--mapdir", &mapping.guest, &mapping.host),
            WasmEngine::Wasmtime => ("--dir", &mapping.host, &mapping.guest),
        };
        let mut pair = OsString::from(first.as_os_str());
        pair.push("::");
        pair.push(second.as_os_str());
        args.push(flag.into());
        args.push(pair);
    }

    if engine == WasmEngine::Wasmer {
        for package in request.options().wasm_packages() {
            args.push("--use".into());
            args.push(package.into());
        }
    } else if !request.options().wasm_packages().is_empty() {
        tracing::warn!("wasm: wasmtime cannot load packages, ignoring them");
    }

    if let Some(env) = request.env() {
        for (key, value) in env {
            args.push("--env".into());
            args.push(format!("{key}={value}").into());
        }
    }

    args.push(request.program().into());
    if engine == WasmEngine::Wasmer {
        args.push("--".into());
    }
    args.extend(request.args().iter().map(OsString::from));
    args
}

fn push_unique(mappings: &mut Vec<Mapping>, guest: &Path, host: &Path) {
    let mapping = Mapping {
        guest: guest.to_path_buf(),
        host: host.to_path_buf(),
    };
    if !mappings.contains(&mapping) {
        mappings.push(mapping);
    }
}

/// `path` without its root or prefix, for nesting under a mirror
fn relative_to_root(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}

/// Copy a file, or a directory recursively, to `dest`
fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    let meta = fs::metadata(src).map_err(|e| Error::os_path("stat", src, e))?;
    if meta.is_dir() {
        fs::create_dir_all(dest).map_err(|e| Error::os_path("create directory", dest, e))?;
        let entries = fs::read_dir(src).map_err(|e| Error::os_path("read directory", src, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| Error::os_path("read directory", src, e))?;
            copy_tree(&entry.path(), &dest.join(entry.file_name()))?;
        }
        return Ok(());
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::os_path("create directory", parent, e))?;
    }
    fs::copy(src, dest).map_err(|e| Error::os_path("copy", src, e))?;
    Ok(())
}

/// Place a symlink to the writable file `path` inside `stage`
fn link_file(path: &Path, stage: &Path) -> Result<()> {
    fs::create_dir_all(stage).map_err(|e| Error::os_path("create directory", stage, e))?;
    let name = path
        .file_name()
        .ok_or_else(|| Error::InvalidRequest(format!("{} has no file name", path.display())))?;
    let target = std::path::absolute(path).map_err(|e| Error::os_path("resolve", path, e))?;
    let link = stage.join(name);

    #[cfg(unix)]
    let linked = std::os::unix::fs::symlink(&target, &link);
    #[cfg(windows)]
    let linked = std::os::windows::fs::symlink_file(&target, &link);
    #[cfg(not(any(unix, windows)))]
    let linked: std::io::Result<()> = Err(std::io::Error::from(std::io::ErrorKind::Unsupported));

    linked.map_err(|e| Error::os_path("symlink", &link, e))
}

fn remove_tree(path: &Path) -> Result<()> {
    match remove_dir_all::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::os_path("remove tree", path, e)),
    }
}
