use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use kennel::{LaunchOptions, MissingSourceBehavior, SandboxRequestBuilder};

use crate::cli::CommonArgs;

/// TOML config file structure
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// Path settings
    pub paths: PathsSection,

    /// Launch options
    pub options: OptionsSection,

    /// Environment settings
    pub env: EnvSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct PathsSection {
    pub readable: Option<Vec<PathBuf>>,
    pub writable: Option<Vec<PathBuf>>,
    pub ensure_exists: Option<Vec<PathBuf>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct OptionsSection {
    pub allow_networking: Option<bool>,
    pub force_wasm: Option<bool>,
    pub mirror_readable_paths: Option<bool>,
    pub strict_paths: Option<bool>,
    pub wasm_packages: Option<Vec<String>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct EnvSection {
    pub set: Option<BTreeMap<String, String>>,
}

/// Merged configuration from file + CLI
#[derive(Debug)]
pub struct MergedConfig {
    pub id: String,
    pub readable_paths: Vec<PathBuf>,
    pub writable_paths: Vec<PathBuf>,
    pub ensure_exists: Vec<PathBuf>,
    pub options: LaunchOptions,
    pub env_set: BTreeMap<String, String>,
}

impl MergedConfig {
    /// Apply paths, options and environment to a request under construction
    ///
    /// The child inherits this process's environment; variables from the
    /// config are layered on top.
    pub fn apply(&self, builder: SandboxRequestBuilder) -> SandboxRequestBuilder {
        let mut builder = builder
            .readable_paths(self.readable_paths.iter().cloned())
            .writable_paths(self.writable_paths.iter().cloned())
            .writable_paths_ensure_exists(self.ensure_exists.iter().cloned())
            .options(self.options.clone());
        if !self.env_set.is_empty() {
            let inherited = std::env::vars_os().filter_map(|(key, value)| {
                Some((key.into_string().ok()?, value.into_string().ok()?))
            });
            builder = builder
                .envs(inherited)
                .envs(self.env_set.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        builder
    }
}

/// Load config from file
pub fn load_config(path: Option<&Path>) -> Result<FileConfig> {
    match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file: {}", path.display()))?;
            let config: FileConfig = toml::from_str(&content)
                .with_context(|| format!("failed to parse config file: {}", path.display()))?;
            Ok(config)
        }
        None => Ok(FileConfig::default()),
    }
}

/// Merge file config with CLI args (CLI takes precedence)
pub fn merge_config(file: FileConfig, cli: &CommonArgs) -> Result<MergedConfig> {
    // Paths: merge CLI + file
    let mut readable_paths = file.paths.readable.unwrap_or_default();
    readable_paths.extend(cli.readable_paths.iter().cloned());

    let mut writable_paths = file.paths.writable.unwrap_or_default();
    writable_paths.extend(cli.writable_paths.iter().cloned());

    let mut ensure_exists = file.paths.ensure_exists.unwrap_or_default();
    ensure_exists.extend(cli.ensure_exists.iter().cloned());

    // Flags: a CLI switch turns an option on, the file decides otherwise
    let options = &file.options;
    let strict_paths = cli.strict_paths || options.strict_paths.unwrap_or(false);
    let mut wasm_packages = options.wasm_packages.clone().unwrap_or_default();
    wasm_packages.extend(cli.wasm_packages.iter().cloned());

    let options = LaunchOptions::builder()
        .allow_networking(cli.allow_networking || options.allow_networking.unwrap_or(false))
        .force_wasm(cli.force_wasm || options.force_wasm.unwrap_or(false))
        .mirror_readable_paths(
            cli.mirror_readable || options.mirror_readable_paths.unwrap_or(false),
        )
        .wasm_packages(wasm_packages)
        .missing_sources(if strict_paths {
            MissingSourceBehavior::Fail
        } else {
            MissingSourceBehavior::Skip
        })
        .build();

    // Environment: CLI values override file values
    let mut env_set = file.env.set.unwrap_or_default();
    for env_str in &cli.envs {
        if let Some((key, value)) = env_str.split_once('=') {
            env_set.insert(key.to_string(), value.to_string());
        } else {
            anyhow::bail!("invalid env format (expected KEY=VALUE): {}", env_str);
        }
    }

    Ok(MergedConfig {
        id: cli.id.clone(),
        readable_paths,
        writable_paths,
        ensure_exists,
        options,
        env_set,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    use crate::cli::{Cli, Commands};

    fn common(args: &[&str]) -> CommonArgs {
        let mut argv = vec!["kennel", "run"];
        argv.extend_from_slice(args);
        argv.push("/bin/true");
        match Cli::parse_from(argv).command {
            Commands::Run(run) => run.common,
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_load_missing_path_is_default() {
        let config = load_config(None).unwrap();
        assert!(config.paths.readable.is_none());
        assert!(config.env.set.is_none());
    }

    #[test]
    fn test_load_and_merge() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kennel.toml");
        std::fs::write(
            &path,
            r#"
[paths]
readable = ["/usr"]
writable = ["/tmp/out"]

[options]
allow_networking = true
strict_paths = true

[env.set]
LANG = "C"
MODE = "file"
"#,
        )
        .unwrap();

        let file = load_config(Some(&path)).unwrap();
        let merged = merge_config(file, &common(&["-r", "/opt", "-e", "MODE=cli"])).unwrap();

        assert_eq!(merged.readable_paths, [PathBuf::from("/usr"), PathBuf::from("/opt")]);
        assert_eq!(merged.writable_paths, [PathBuf::from("/tmp/out")]);
        assert!(merged.options.allow_networking());
        assert!(!merged.options.force_wasm());
        assert_eq!(merged.options.missing_sources(), MissingSourceBehavior::Fail);
        assert_eq!(merged.env_set["LANG"], "C");
        assert_eq!(merged.env_set["MODE"], "cli");
    }

    #[test]
    fn test_invalid_toml_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        std::fs::write(&path, "[paths\nreadable = 1").unwrap();
        let err = load_config(Some(&path)).unwrap_err();
        assert!(err.to_string().contains("broken.toml"));
    }

    #[test]
    fn test_invalid_env_is_rejected() {
        let err = merge_config(FileConfig::default(), &common(&["-e", "NOEQUALS"])).unwrap_err();
        assert!(err.to_string().contains("KEY=VALUE"));
    }

    #[test]
    fn test_apply_builds_request() {
        let merged = merge_config(
            FileConfig::default(),
            &common(&["--id", "job", "-w", "/tmp/out", "--ensure-exists", "/tmp/cache"]),
        )
        .unwrap();
        let request = merged
            .apply(kennel::SandboxRequest::builder(["/bin/true"], merged.id.clone()))
            .build()
            .unwrap();
        assert_eq!(request.id(), "job");
        assert_eq!(request.writable_paths(), [PathBuf::from("/tmp/out")]);
        assert_eq!(request.writable_paths_ensure_exists(), [PathBuf::from("/tmp/cache")]);
        // No variables set: the child inherits the environment
        assert!(request.env().is_none());
    }
}
