use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Standard I/O configuration for a sandboxed command
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StdioConfig {
    /// Create a new pipe owned by the [`Child`](crate::Child)
    #[default]
    Piped,
    /// Inherit from parent process
    Inherit,
    /// Redirect to null
    Null,
}

impl From<StdioConfig> for Stdio {
    fn from(config: StdioConfig) -> Self {
        match config {
            StdioConfig::Inherit => Stdio::inherit(),
            StdioConfig::Piped => Stdio::piped(),
            StdioConfig::Null => Stdio::null(),
        }
    }
}

/// What to do when a granted source path does not exist
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingSourceBehavior {
    /// Leave the grant out and carry on
    #[default]
    Skip,
    /// Abort the launch with [`Error::PathNotFound`]
    Fail,
}

impl MissingSourceBehavior {
    /// Check that `path` exists, returning whether the grant should be applied
    pub(crate) fn check(self, path: &Path) -> Result<bool> {
        if path.symlink_metadata().is_ok() {
            return Ok(true);
        }
        match self {
            MissingSourceBehavior::Skip => {
                tracing::debug!(path = %path.display(), "sandbox: skipping missing source");
                Ok(false)
            }
            MissingSourceBehavior::Fail => Err(Error::PathNotFound(path.to_path_buf())),
        }
    }
}

/// Backend-specific launch options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchOptions {
    allow_networking: bool,
    force_wasm: bool,
    wasm_packages: Vec<String>,
    mirror_readable_paths: bool,
    missing_sources: MissingSourceBehavior,
}

impl LaunchOptions {
    pub fn builder() -> LaunchOptionsBuilder {
        LaunchOptionsBuilder::default()
    }

    pub fn allow_networking(&self) -> bool {
        self.allow_networking
    }

    pub fn force_wasm(&self) -> bool {
        self.force_wasm
    }

    pub fn wasm_packages(&self) -> &[String] {
        &self.wasm_packages
    }

    pub fn mirror_readable_paths(&self) -> bool {
        self.mirror_readable_paths
    }

    pub fn missing_sources(&self) -> MissingSourceBehavior {
        self.missing_sources
    }
}

/// Builder for LaunchOptions
#[derive(Debug, Default)]
pub struct LaunchOptionsBuilder {
    inner: LaunchOptions,
}

impl LaunchOptionsBuilder {
    /// Share the host network instead of denying it
    pub fn allow_networking(mut self, enabled: bool) -> Self {
        self.inner.allow_networking = enabled;
        self
    }

    /// Always run through the WebAssembly runtime
    pub fn force_wasm(mut self, enabled: bool) -> Self {
        self.inner.force_wasm = enabled;
        self
    }

    /// Extra packages the Wasm engine loads alongside the module
    pub fn wasm_packages(mut self, packages: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.inner
            .wasm_packages
            .extend(packages.into_iter().map(Into::into));
        self
    }

    /// Copy readable paths into a staging mirror (Wasm backend only)
    pub fn mirror_readable_paths(mut self, enabled: bool) -> Self {
        self.inner.mirror_readable_paths = enabled;
        self
    }

    pub fn missing_sources(mut self, behavior: MissingSourceBehavior) -> Self {
        self.inner.missing_sources = behavior;
        self
    }

    pub fn build(self) -> LaunchOptions {
        self.inner
    }
}

/// A request to run one command inside a sandbox
#[derive(Debug, Clone)]
pub struct SandboxRequest {
    command: Vec<String>,
    id: String,
    readable_paths: Vec<PathBuf>,
    writable_paths: Vec<PathBuf>,
    writable_paths_ensure_exists: Vec<PathBuf>,
    env: Option<BTreeMap<String, String>>,
    current_dir: Option<PathBuf>,
    stdin: StdioConfig,
    stdout: StdioConfig,
    stderr: StdioConfig,
    options: LaunchOptions,
}

impl SandboxRequest {
    /// Start building a request for `command` in the sandbox named `id`
    ///
    /// The id is stable across invocations; backends with persisted state
    /// key their incremental updates on it.
    pub fn builder(
        command: impl IntoIterator<Item = impl Into<String>>,
        id: impl Into<String>,
    ) -> SandboxRequestBuilder {
        SandboxRequestBuilder {
            inner: SandboxRequest {
                command: command.into_iter().map(Into::into).collect(),
                id: id.into(),
                readable_paths: Vec::new(),
                writable_paths: Vec::new(),
                writable_paths_ensure_exists: Vec::new(),
                env: None,
                current_dir: None,
                stdin: StdioConfig::Piped,
                stdout: StdioConfig::Piped,
                stderr: StdioConfig::Piped,
                options: LaunchOptions::default(),
            },
        }
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    pub fn program(&self) -> &str {
        &self.command[0]
    }

    pub fn args(&self) -> &[String] {
        &self.command[1..]
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn readable_paths(&self) -> &[PathBuf] {
        &self.readable_paths
    }

    pub fn writable_paths(&self) -> &[PathBuf] {
        &self.writable_paths
    }

    pub fn writable_paths_ensure_exists(&self) -> &[PathBuf] {
        &self.writable_paths_ensure_exists
    }

    /// Explicit environment, or `None` to inherit the caller's
    pub fn env(&self) -> Option<&BTreeMap<String, String>> {
        self.env.as_ref()
    }

    pub fn current_dir(&self) -> Option<&Path> {
        self.current_dir.as_deref()
    }

    pub fn stdin(&self) -> StdioConfig {
        self.stdin
    }

    pub fn stdout(&self) -> StdioConfig {
        self.stdout
    }

    pub fn stderr(&self) -> StdioConfig {
        self.stderr
    }

    pub fn options(&self) -> &LaunchOptions {
        &self.options
    }

    /// The environment the sandboxed command will see
    pub(crate) fn effective_env(&self) -> BTreeMap<String, String> {
        match &self.env {
            Some(env) => env.clone(),
            None => utf8_env(std::env::vars_os()),
        }
    }

    /// Apply env, working directory and stdio to a host-side command
    pub(crate) fn configure(&self, cmd: &mut std::process::Command) {
        if let Some(env) = &self.env {
            cmd.env_clear();
            cmd.envs(env);
        }
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::from(self.stdin));
        cmd.stdout(Stdio::from(self.stdout));
        cmd.stderr(Stdio::from(self.stderr));
    }
}

/// Builder for SandboxRequest
#[derive(Debug)]
pub struct SandboxRequestBuilder {
    inner: SandboxRequest,
}

impl SandboxRequestBuilder {
    /// Grant read access to a path
    pub fn readable(mut self, path: impl Into<PathBuf>) -> Self {
        self.inner.readable_paths.push(path.into());
        self
    }

    pub fn readable_paths(mut self, paths: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        self.inner
            .readable_paths
            .extend(paths.into_iter().map(Into::into));
        self
    }

    /// Grant read and write access to a path
    pub fn writable(mut self, path: impl Into<PathBuf>) -> Self {
        self.inner.writable_paths.push(path.into());
        self
    }

    pub fn writable_paths(mut self, paths: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        self.inner
            .writable_paths
            .extend(paths.into_iter().map(Into::into));
        self
    }

    /// Grant write access to a directory, creating it if absent
    ///
    /// The directory is kept alive for as long as the returned
    /// [`Child`](crate::Child) exists.
    pub fn writable_ensure_exists(mut self, path: impl Into<PathBuf>) -> Self {
        self.inner.writable_paths_ensure_exists.push(path.into());
        self
    }

    pub fn writable_paths_ensure_exists(
        mut self,
        paths: impl IntoIterator<Item = impl Into<PathBuf>>,
    ) -> Self {
        self.inner
            .writable_paths_ensure_exists
            .extend(paths.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable (switches off environment inheritance)
    pub fn env(mut self, key: impl Into<String>, val: impl Into<String>) -> Self {
        self.inner
            .env
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), val.into());
        self
    }

    pub fn envs(
        mut self,
        envs: impl IntoIterator<Item = (impl Into<String>, impl Into<String>)>,
    ) -> Self {
        let env = self.inner.env.get_or_insert_with(BTreeMap::new);
        env.extend(envs.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.inner.current_dir = Some(dir.into());
        self
    }

    pub fn stdin(mut self, cfg: StdioConfig) -> Self {
        self.inner.stdin = cfg;
        self
    }

    pub fn stdout(mut self, cfg: StdioConfig) -> Self {
        self.inner.stdout = cfg;
        self
    }

    pub fn stderr(mut self, cfg: StdioConfig) -> Self {
        self.inner.stderr = cfg;
        self
    }

    pub fn options(mut self, options: LaunchOptions) -> Self {
        self.inner.options = options;
        self
    }

    pub fn build(self) -> Result<SandboxRequest> {
        if self.inner.command.is_empty() || self.inner.command[0].is_empty() {
            return Err(Error::InvalidRequest("command must not be empty".to_string()));
        }
        validate_id(&self.inner.id)?;
        Ok(self.inner)
    }
}

/// Variables whose name and value are both UTF-8; the rest are dropped
fn utf8_env(vars: impl IntoIterator<Item = (OsString, OsString)>) -> BTreeMap<String, String> {
    vars.into_iter()
        .filter_map(|(key, value)| match (key.into_string(), value.into_string()) {
            (Ok(key), Ok(value)) => Some((key, value)),
            (key, _) => {
                tracing::warn!(key = ?key, "sandbox: dropping non UTF-8 environment variable");
                None
            }
        })
        .collect()
}

/// Reject ids that could escape the directories derived from them
pub(crate) fn validate_id(id: &str) -> Result<()> {
    let mut components = Path::new(id).components();
    let single_normal = matches!(components.next(), Some(Component::Normal(_)))
        && components.next().is_none();
    if id.is_empty()
        || !single_normal
        || id.contains(['/', '\\', '\0'])
        || id.contains("..")
    {
        return Err(Error::InvalidId(id.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_collects_paths_and_env() {
        let request = SandboxRequest::builder(["echo", "hi"], "t1")
            .readable("/usr")
            .writable("/tmp/out")
            .writable_ensure_exists("/tmp/t1")
            .env("LANG", "C")
            .current_dir("/tmp")
            .build()
            .unwrap();

        assert_eq!(request.program(), "echo");
        assert_eq!(request.args(), ["hi".to_string()]);
        assert_eq!(request.readable_paths(), [PathBuf::from("/usr")]);
        assert_eq!(request.writable_paths_ensure_exists(), [PathBuf::from("/tmp/t1")]);
        assert_eq!(request.env().unwrap().get("LANG").map(String::as_str), Some("C"));
        assert_eq!(request.stdout(), StdioConfig::Piped);
    }

    #[test]
    fn test_env_absent_means_inherit() {
        let request = SandboxRequest::builder(["true"], "inherit").build().unwrap();
        assert!(request.env().is_none());
        assert_eq!(
            request.effective_env().len(),
            utf8_env(std::env::vars_os()).len()
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_variables_are_dropped() {
        use std::os::unix::ffi::OsStringExt;

        let env = utf8_env([
            (OsString::from("LANG"), OsString::from("C")),
            (OsString::from("BROKEN"), OsString::from_vec(vec![0x66, 0xff, 0x6f])),
            (OsString::from_vec(vec![0xfe]), OsString::from("x")),
        ]);
        assert_eq!(env, BTreeMap::from([("LANG".to_string(), "C".to_string())]));
    }

    #[test]
    fn test_rejects_bad_ids() {
        for id in ["", "a/b", "..", "a\\b", "x..y", "nul\0"] {
            let result = SandboxRequest::builder(["true"], id).build();
            assert!(matches!(result, Err(Error::InvalidId(_))), "accepted {id:?}");
        }
        assert!(SandboxRequest::builder(["true"], "job-42_a.b").build().is_ok());
    }

    #[test]
    fn test_rejects_empty_command() {
        let result = SandboxRequest::builder(Vec::<String>::new(), "x").build();
        assert!(matches!(result, Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn test_missing_source_behavior() {
        let missing = Path::new("/definitely/not/here");
        assert!(!MissingSourceBehavior::Skip.check(missing).unwrap());
        assert!(matches!(
            MissingSourceBehavior::Fail.check(missing),
            Err(Error::PathNotFound(_))
        ));
        assert!(MissingSourceBehavior::Fail.check(Path::new("/")).unwrap());
    }
}
