use crate::config::SandboxRequest;
use crate::error::{Error, Result};
use crate::sandbox::SandboxSettings;

mod child;
pub(crate) mod container;
#[cfg(unix)]
pub(crate) mod jail;
pub(crate) mod namespace;
pub(crate) mod probe;
pub(crate) mod seatbelt;
pub(crate) mod wasm;

pub use child::{Child, ChildStderr, ChildStdin, ChildStdout, Signal};
pub(crate) use child::Process;
pub use probe::{BackendKind, Probe, TargetOs, invalidate_probe};

/// One isolation backend, chosen per launch
pub(crate) enum Backend {
    Namespace(namespace::Namespace),
    Profile(seatbelt::Seatbelt),
    #[cfg(unix)]
    Jail(jail::JailClient),
    AppContainer(container::AppContainer),
    Wasm(wasm::WasmRuntime),
}

impl Backend {
    /// Instantiate the backend for `kind` from probed tool locations
    pub(crate) fn new(kind: BackendKind, settings: &SandboxSettings, probe: &Probe) -> Result<Self> {
        let backend = match kind {
            BackendKind::Namespace => Backend::Namespace(namespace::Namespace::new(
                probe.bwrap.clone().ok_or(Error::ToolNotFound("bwrap"))?,
            )),
            BackendKind::DeclarativeProfile => Backend::Profile(seatbelt::Seatbelt::new(
                probe
                    .sandbox_exec
                    .clone()
                    .ok_or(Error::ToolNotFound("sandbox-exec"))?,
            )),
            #[cfg(unix)]
            BackendKind::JailBroker => Backend::Jail(jail::JailClient::new(
                probe
                    .elevation
                    .clone()
                    .ok_or(Error::ToolNotFound("sudo"))?,
                probe
                    .warden
                    .clone()
                    .ok_or(Error::ToolNotFound("kennel-warden"))?,
            )),
            #[cfg(not(unix))]
            BackendKind::JailBroker => {
                return Err(Error::EnvironmentUnsupported(
                    "jail broker requires a unix host".to_string(),
                ));
            }
            BackendKind::AppContainer => Backend::AppContainer(container::AppContainer::new(
                settings.registry_path().to_path_buf(),
            )),
            BackendKind::Wasm => {
                let mirror_root = settings.wasm_mirror_root().to_path_buf();
                match probe.wasm_engine() {
                    Some((engine, program)) => {
                        Backend::Wasm(wasm::WasmRuntime::new(engine, program, mirror_root))
                    }
                    None if probe.embedded_wasm => {
                        Backend::Wasm(wasm::WasmRuntime::embedded(mirror_root)?)
                    }
                    None => {
                        return Err(Error::EnvironmentUnsupported(
                            "no WebAssembly engine installed".to_string(),
                        ));
                    }
                }
            }
        };
        Ok(backend)
    }

    pub(crate) fn kind(&self) -> BackendKind {
        match self {
            Backend::Namespace(_) => BackendKind::Namespace,
            Backend::Profile(_) => BackendKind::DeclarativeProfile,
            #[cfg(unix)]
            Backend::Jail(_) => BackendKind::JailBroker,
            Backend::AppContainer(_) => BackendKind::AppContainer,
            Backend::Wasm(_) => BackendKind::Wasm,
        }
    }

    /// Provision the sandbox for `request` and spawn its command
    pub(crate) fn launch(&self, request: &SandboxRequest) -> Result<Child> {
        match self {
            Backend::Namespace(backend) => backend.launch(request),
            Backend::Profile(backend) => backend.launch(request),
            #[cfg(unix)]
            Backend::Jail(backend) => backend.launch(request),
            Backend::AppContainer(backend) => backend.launch(request),
            Backend::Wasm(backend) => backend.launch(request),
        }
    }

    /// Remove every sandbox this backend has persisted
    pub(crate) fn delete_all(&self) -> Result<()> {
        match self {
            Backend::Namespace(_) | Backend::Profile(_) => Ok(()),
            #[cfg(unix)]
            Backend::Jail(backend) => backend.delete_all(),
            Backend::AppContainer(backend) => backend.delete_all(),
            Backend::Wasm(backend) => backend.delete_all(),
        }
    }
}
