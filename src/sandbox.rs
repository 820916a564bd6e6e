use std::path::{Path, PathBuf};

use crate::config::SandboxRequest;
use crate::error::Result;
use crate::platform::{self, Backend, BackendKind, Child, Probe, TargetOs};

const DEFAULT_WARDEN: &str = "kennel-warden";
const DEFAULT_ELEVATION: &str = "sudo";

/// Locations the engine reads and writes, fixed at construction
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SandboxSettings {
    warden_program: PathBuf,
    elevation_program: PathBuf,
    registry_path: PathBuf,
    wasm_mirror_root: PathBuf,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir().unwrap_or_else(std::env::temp_dir);
        Self {
            warden_program: PathBuf::from(DEFAULT_WARDEN),
            elevation_program: PathBuf::from(DEFAULT_ELEVATION),
            registry_path: data_dir.join("Kennel").join("containers.json"),
            wasm_mirror_root: std::env::temp_dir().join(format!("kennel_wasm_{}", current_user())),
        }
    }
}

impl SandboxSettings {
    pub(crate) fn warden_program(&self) -> &Path {
        &self.warden_program
    }

    pub(crate) fn elevation_program(&self) -> &Path {
        &self.elevation_program
    }

    pub(crate) fn registry_path(&self) -> &Path {
        &self.registry_path
    }

    pub(crate) fn wasm_mirror_root(&self) -> &Path {
        &self.wasm_mirror_root
    }

    fn probe(&self) -> Probe {
        Probe::detect(&self.elevation_program, &self.warden_program)
    }
}

fn current_user() -> String {
    ["USER", "LOGNAME", "USERNAME"]
        .iter()
        .find_map(|key| std::env::var(key).ok().filter(|v| !v.is_empty()))
        .unwrap_or_else(|| "user".to_string())
}

/// The launch engine
///
/// Each launch probes the host, picks the strongest available backend and
/// provisions the sandbox on the blocking thread pool.
///
/// # Example
///
/// ```rust,ignore
/// use kennel::{Sandbox, SandboxRequest};
///
/// async fn run() -> kennel::Result<()> {
///     let request = SandboxRequest::builder(["/usr/bin/ls", "/data"], "lister")
///         .readable("/usr")
///         .readable("/data")
///         .build()?;
///     let mut child = Sandbox::new().launch(&request).await?;
///     let output = child.communicate(None).await?;
///     println!("{}", String::from_utf8_lossy(&output.stdout));
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct Sandbox {
    settings: SandboxSettings,
}

impl Sandbox {
    /// An engine with default settings
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> SandboxBuilder {
        SandboxBuilder::default()
    }

    pub fn warden_program(&self) -> &Path {
        self.settings.warden_program()
    }

    pub fn elevation_program(&self) -> &Path {
        self.settings.elevation_program()
    }

    pub fn registry_path(&self) -> &Path {
        self.settings.registry_path()
    }

    pub fn wasm_mirror_root(&self) -> &Path {
        self.settings.wasm_mirror_root()
    }

    /// The backend a launch of `request` would use right now
    pub fn select_backend(&self, request: &SandboxRequest) -> Result<BackendKind> {
        platform::probe::select(
            TargetOs::current(),
            &self.settings.probe(),
            platform::probe::wants_wasm(request),
        )
    }

    /// Provision a sandbox for `request` and start its command
    ///
    /// Dropping the returned [`Child`] does not kill the process.
    pub async fn launch(&self, request: &SandboxRequest) -> Result<Child> {
        let settings = self.settings.clone();
        let request = request.clone();
        blocking::unblock(move || {
            let probe = settings.probe();
            let kind = platform::probe::select(
                TargetOs::current(),
                &probe,
                platform::probe::wants_wasm(&request),
            )?;
            tracing::info!(backend = %kind, id = request.id(), "sandbox: backend selected");
            Backend::new(kind, &settings, &probe)?.launch(&request)
        })
        .await
    }

    /// Remove every persisted sandbox of the native backend and the Wasm mirror
    pub async fn delete_all_sandboxes(&self) -> Result<()> {
        let settings = self.settings.clone();
        blocking::unblock(move || {
            let probe = settings.probe();
            let native = match probe.native(TargetOs::current()) {
                Some(kind) => Backend::new(kind, &settings, &probe)
                    .and_then(|backend| backend.delete_all()),
                None => {
                    tracing::debug!("sandbox: no native backend to tear down");
                    Ok(())
                }
            };
            let mirror = platform::wasm::clear_mirror(settings.wasm_mirror_root());
            native.and(mirror)
        })
        .await
    }
}

/// Builder for Sandbox
#[derive(Debug, Default)]
pub struct SandboxBuilder {
    inner: SandboxSettings,
}

impl SandboxBuilder {
    /// Broker binary run through the elevation program (jail backend)
    pub fn warden_program(mut self, path: impl Into<PathBuf>) -> Self {
        self.inner.warden_program = path.into();
        self
    }

    pub fn elevation_program(mut self, path: impl Into<PathBuf>) -> Self {
        self.inner.elevation_program = path.into();
        self
    }

    /// Where the container backend keeps its grant records
    pub fn registry_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.inner.registry_path = path.into();
        self
    }

    pub fn wasm_mirror_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.inner.wasm_mirror_root = path.into();
        self
    }

    pub fn build(self) -> Sandbox {
        Sandbox {
            settings: self.inner,
        }
    }
}

/// Launch `request` with a default [`Sandbox`]
pub async fn launch(request: &SandboxRequest) -> Result<Child> {
    Sandbox::new().launch(request).await
}

/// Tear down every sandbox with a default [`Sandbox`]
pub async fn delete_all_sandboxes() -> Result<()> {
    Sandbox::new().delete_all_sandboxes().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LaunchOptions;
    use crate::error::Error;

    #[test]
    fn test_default_settings() {
        let sandbox = Sandbox::new();
        assert_eq!(sandbox.warden_program(), Path::new("kennel-warden"));
        assert_eq!(sandbox.elevation_program(), Path::new("sudo"));
        assert!(sandbox.registry_path().ends_with("Kennel/containers.json"));
        assert!(
            sandbox
                .wasm_mirror_root()
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("kennel_wasm_")
        );
    }

    #[test]
    fn test_builder_overrides() {
        let sandbox = Sandbox::builder()
            .warden_program("/usr/local/bin/kennel-warden")
            .elevation_program("/usr/local/bin/doas")
            .registry_path("/tmp/registry.json")
            .wasm_mirror_root("/tmp/mirror")
            .build();
        assert_eq!(sandbox.warden_program(), Path::new("/usr/local/bin/kennel-warden"));
        assert_eq!(sandbox.elevation_program(), Path::new("/usr/local/bin/doas"));
        assert_eq!(sandbox.registry_path(), Path::new("/tmp/registry.json"));
        assert_eq!(sandbox.wasm_mirror_root(), Path::new("/tmp/mirror"));
    }

    #[test]
    fn test_forced_wasm_selects_wasm_or_fails() {
        let request = SandboxRequest::builder(["/opt/module.wasm"], "forced")
            .options(LaunchOptions::builder().force_wasm(true).build())
            .build()
            .unwrap();
        match Sandbox::new().select_backend(&request) {
            Ok(kind) => assert_eq!(kind, BackendKind::Wasm),
            Err(e) => assert!(matches!(e, Error::EnvironmentUnsupported(_))),
        }
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    #[tokio::test]
    async fn test_delete_all_clears_wasm_mirror() {
        let temp = tempfile::tempdir().unwrap();
        let mirror = temp.path().join("mirror");
        std::fs::create_dir_all(mirror.join("abc")).unwrap();
        std::fs::write(mirror.join("abc").join("copy"), "x").unwrap();

        let sandbox = Sandbox::builder().wasm_mirror_root(&mirror).build();
        sandbox.delete_all_sandboxes().await.unwrap();
        assert!(!mirror.exists());

        // A second teardown finds nothing left and still succeeds.
        sandbox.delete_all_sandboxes().await.unwrap();
    }
}
