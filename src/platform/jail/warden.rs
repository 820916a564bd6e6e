//! The privileged side of the jail broker
//!
//! The warden runs as root through `sudo`. For each launch it mirrors every
//! granted path into a per-user, per-id jail root with nullfs mounts, drops
//! mounts left over from earlier launches of the same id, and runs the
//! command under `quickjail`. The live mount table is the only record of
//! what a jail currently holds.

use std::collections::BTreeSet;
use std::fs;
use std::io::Read;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};
use std::process::Command;

use serde::Deserialize;

use crate::config::{MissingSourceBehavior, validate_id};
use crate::error::{Access, Error, Result};
use crate::lock::GlobalLock;
use crate::platform::jail::mount_table::mounts_under;
use crate::platform::jail::protocol::{self, MAX_REQUEST_LEN};

pub use crate::platform::jail::protocol::{LaunchPayload, WardenRequest};

/// Root-owned configuration file of the warden
pub const CONFIG_PATH: &str = "/usr/local/etc/kennel/warden.toml";

const JAIL_PREFIX: &str = "kennel_jail_";
const PROXY_DIR: &str = ".kennel_proxies";
const LOCK_FILE: &str = ".kennel_warden.lock";

/// Warden settings, read only from [`CONFIG_PATH`]
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WardenConfig {
    /// Directory holding every jail root
    pub jail_parent: PathBuf,
    /// Candidate directories for hard-link proxies of single files
    pub proxy_roots: Vec<PathBuf>,
    /// Utility that runs a command inside a jail root
    pub jail_program: PathBuf,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            jail_parent: PathBuf::from("/tmp"),
            proxy_roots: vec![PathBuf::from("/usr/jails")],
            jail_program: PathBuf::from("quickjail"),
        }
    }
}

impl WardenConfig {
    /// Load the configuration, falling back to defaults when the file is absent
    pub fn load(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(text) => toml::from_str(&text).map_err(|e| Error::CorruptState {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(Error::os_path("read warden config", path, e)),
        }
    }
}

/// Privileged filesystem operations the warden depends on
pub trait Mounter {
    /// Current output of `mount`
    fn mount_table(&self) -> Result<String>;
    fn mount(&self, source: &Path, target: &Path, read_only: bool) -> Result<()>;
    fn unmount(&self, target: &Path) -> Result<()>;
    /// Check, as `user`, that `path` grants `access`
    fn verify_access(&self, user: &str, path: &Path, access: Access) -> Result<()>;
}

/// FreeBSD mounts through `mount_nullfs` and `umount`
#[derive(Debug, Default)]
pub struct NullfsMounter;

impl Mounter for NullfsMounter {
    fn mount_table(&self) -> Result<String> {
        let output = Command::new("mount")
            .output()
            .map_err(|e| Error::os("list mounts", e))?;
        check_status("mount", &output)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn mount(&self, source: &Path, target: &Path, read_only: bool) -> Result<()> {
        let mut cmd = Command::new("mount_nullfs");
        if read_only {
            cmd.args(["-o", "ro"]);
        }
        let output = cmd
            .arg(source)
            .arg(target)
            .output()
            .map_err(|e| Error::os_path("mount_nullfs", target, e))?;
        check_status("mount_nullfs", &output)
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        let output = Command::new("umount")
            .arg(target)
            .output()
            .map_err(|e| Error::os_path("umount", target, e))?;
        check_status("umount", &output)
    }

    fn verify_access(&self, user: &str, path: &Path, access: Access) -> Result<()> {
        let flag = match access {
            Access::Read => "-r",
            Access::Write => "-w",
        };
        let quoted = shell_escape::unix::escape(path.to_string_lossy());
        let status = Command::new("su")
            .args(["-m", user, "-c"])
            .arg(format!("test {flag} {quoted}"))
            .status()
            .map_err(|e| Error::os_path("su", path, e))?;
        if status.success() {
            Ok(())
        } else {
            Err(Error::AccessDenied {
                user: user.to_string(),
                path: path.to_path_buf(),
                access,
            })
        }
    }
}

fn check_status(program: &str, output: &std::process::Output) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    Err(Error::CommandFailed {
        code: output.status.code().unwrap_or(-1),
        message: format!(
            "{program}: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        ),
    })
}

/// Jail provisioning for one invoking user
pub struct Warden<M> {
    config: WardenConfig,
    user: String,
    mounter: M,
}

impl<M: Mounter> Warden<M> {
    pub fn new(config: WardenConfig, user: impl Into<String>, mounter: M) -> Self {
        Self {
            config,
            user: user.into(),
            mounter,
        }
    }

    pub fn config(&self) -> &WardenConfig {
        &self.config
    }

    fn prefix(&self) -> String {
        format!("{JAIL_PREFIX}{}_", self.user)
    }

    /// Jail root for a sandbox id of the invoking user
    pub fn jail_root(&self, id: &str) -> Result<PathBuf> {
        validate_id(id)?;
        Ok(self.config.jail_parent.join(format!("{}{id}", self.prefix())))
    }

    fn lock(&self) -> Result<GlobalLock> {
        GlobalLock::file(&self.config.jail_parent.join(LOCK_FILE))
    }

    /// Proxy directory on the candidate root closest to `path`
    ///
    /// Closeness is the number of leading path components shared, so the
    /// chosen root most likely lives on the same volume.
    pub fn proxy_root(&self, path: &Path) -> Option<PathBuf> {
        self.config
            .proxy_roots
            .iter()
            .max_by_key(|root| {
                root.components()
                    .zip(path.components())
                    .take_while(|(a, b)| a == b)
                    .count()
            })
            .map(|root| root.join(PROXY_DIR))
    }

    /// Bring the jail for `payload` to exactly the requested mounts
    ///
    /// Must run under the warden lock. Returns the jail root. Every grant is
    /// checked before the first directory or mount is created.
    pub fn provision(&self, payload: &LaunchPayload) -> Result<PathBuf> {
        let root = self.jail_root(&payload.id)?;
        let grants = self.checked_grants(payload)?;
        create_dir_all(&root)?;

        let existing: BTreeSet<PathBuf> = mounts_under(&self.mounter.mount_table()?, &root)
            .into_iter()
            .collect();
        let mut desired = BTreeSet::new();

        for (path, access) in grants {
            if let Some(target) = self.mount_or_link(
                &root,
                path,
                access,
                &existing,
                &desired,
                payload.missing_sources,
            )? {
                desired.insert(target);
            }
        }

        let mut stale: Vec<&PathBuf> = existing.difference(&desired).collect();
        stale.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
        for target in stale {
            tracing::debug!(path = %target.display(), "warden: removing stale mount");
            self.mounter.unmount(target)?;
            remove_empty_dir(target)?;
        }

        Ok(root)
    }

    /// Grants that exist and that the invoking user may access
    fn checked_grants<'a>(&self, payload: &'a LaunchPayload) -> Result<Vec<(&'a Path, Access)>> {
        let grants = payload
            .readable_paths
            .iter()
            .map(|p| (p, Access::Read))
            .chain(payload.writable_paths.iter().map(|p| (p, Access::Write)));
        let mut checked = Vec::new();
        for (path, access) in grants {
            if !path.is_absolute() {
                return Err(Error::InvalidRequest(format!(
                    "grant {} is not absolute",
                    path.display()
                )));
            }
            if !payload.missing_sources.check(path)? {
                continue;
            }
            self.mounter.verify_access(&self.user, path, access)?;
            checked.push((path.as_path(), access));
        }
        Ok(checked)
    }

    fn mount_or_link(
        &self,
        root: &Path,
        path: &Path,
        access: Access,
        existing: &BTreeSet<PathBuf>,
        desired: &BTreeSet<PathBuf>,
        missing: MissingSourceBehavior,
    ) -> Result<Option<PathBuf>> {
        // Mounted before this launch, or earlier in it by a sibling grant
        let mounted = |target: &Path| existing.contains(target) || desired.contains(target);
        let read_only = access == Access::Read;
        let dest = root.join(relative(path));

        if path.is_dir() {
            if !mounted(&dest) {
                create_dir_all(&dest)?;
                tracing::debug!(path = %path.display(), read_only, "warden: mounting directory");
                self.mounter.mount(path, &dest, read_only)?;
            }
            return Ok(Some(dest));
        }

        // nullfs mounts directories only, so a file is hard-linked into a
        // proxy directory whose parent is then mounted over the file's parent.
        let Some(dest_dir) = dest.parent().map(Path::to_path_buf) else {
            return Ok(None);
        };
        let proxy_base = self.proxy_root(path).ok_or_else(|| {
            Error::InvalidRequest("no proxy roots configured for file grants".to_string())
        })?;
        let proxy_path = proxy_base.join(relative(&dest));
        let Some(proxy_dir) = proxy_path.parent() else {
            return Ok(None);
        };
        create_dir_all(&dest_dir)?;
        create_dir_all(proxy_dir)?;

        if !link_into_proxy(path, &proxy_path)? {
            tracing::warn!(
                path = %path.display(),
                proxy = %proxy_base.display(),
                "warden: file is on a different volume than every proxy root"
            );
            return match missing {
                MissingSourceBehavior::Skip => Ok(None),
                MissingSourceBehavior::Fail => Err(Error::ProxyLinkUnavailable(path.to_path_buf())),
            };
        }

        if !mounted(&dest_dir) {
            tracing::debug!(path = %path.display(), read_only, "warden: mounting file proxy");
            self.mounter.mount(proxy_dir, &dest_dir, read_only)?;
        }
        Ok(Some(dest_dir))
    }

    /// Command that runs the payload inside `root`
    pub fn jail_command(&self, root: &Path, payload: &LaunchPayload) -> Result<Command> {
        let (program, args) = payload
            .cmd
            .split_first()
            .ok_or_else(|| Error::InvalidRequest("command must not be empty".to_string()))?;
        let mut cmd = Command::new(&self.config.jail_program);
        if payload.allow_networking {
            cmd.args(["ip4=inherit", "ip6=inherit"]);
        }
        cmd.arg(format!("path={}", root.display()))
            .arg(format!("command={program}"))
            .args(args)
            .env_clear()
            .envs(&payload.env);
        if let Some(cwd) = payload.cwd.as_deref().filter(|dir| dir.is_dir()) {
            cmd.current_dir(cwd);
        }
        Ok(cmd)
    }

    /// Provision under the lock and start the command
    ///
    /// The lock is released as soon as the jailed process exists.
    pub fn launch(&self, payload: &LaunchPayload) -> Result<std::process::Child> {
        let _lock = self.lock()?;
        let root = self.provision(payload)?;
        let mut cmd = self.jail_command(&root, payload)?;
        tracing::info!(id = %payload.id, root = %root.display(), "warden: starting jailed command");
        cmd.spawn()
            .map_err(|e| Error::os_path("spawn", &self.config.jail_program, e))
    }

    /// Unmount and remove every jail of the invoking user, then all proxies
    pub fn delete_all(&self) -> Result<()> {
        let _lock = self.lock()?;
        let prefix = self.prefix();

        let entries = match fs::read_dir(&self.config.jail_parent) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::os_path("read dir", &self.config.jail_parent, e)),
        };
        for entry in entries {
            let entry = entry.map_err(|e| Error::os_path("read dir", &self.config.jail_parent, e))?;
            if !entry.file_name().to_string_lossy().starts_with(&prefix) {
                continue;
            }
            let root = entry.path();
            let mut mounts = mounts_under(&self.mounter.mount_table()?, &root);
            mounts.sort_by_key(|p| std::cmp::Reverse(p.components().count()));
            for target in &mounts {
                self.mounter.unmount(target)?;
            }
            // Removing a tree that still has a mount inside would reach host files.
            let remaining = mounts_under(&self.mounter.mount_table()?, &root);
            if let Some(target) = remaining.first() {
                return Err(Error::CorruptState {
                    path: target.clone(),
                    reason: "still mounted after unmount".to_string(),
                });
            }
            tracing::debug!(path = %root.display(), "warden: removing jail root");
            remove_tree(&root)?;
        }

        for root in &self.config.proxy_roots {
            remove_tree(&root.join(PROXY_DIR))?;
        }
        Ok(())
    }
}

/// Hard-link `source` at `proxy`, returning `false` across volumes
///
/// A stale link to a replaced file is refreshed.
fn link_into_proxy(source: &Path, proxy: &Path) -> Result<bool> {
    if let Ok(existing) = fs::metadata(proxy) {
        let current = fs::metadata(source).map_err(|e| Error::os_path("stat", source, e))?;
        if existing.dev() == current.dev() && existing.ino() == current.ino() {
            return Ok(true);
        }
        fs::remove_file(proxy).map_err(|e| Error::os_path("remove stale proxy", proxy, e))?;
    }
    match fs::hard_link(source, proxy) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(true),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => Ok(false),
        Err(e) => Err(Error::os_path("hard link", proxy, e)),
    }
}

fn relative(path: &Path) -> PathBuf {
    path.components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect()
}

fn create_dir_all(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| Error::os_path("create directory", path, e))
}

fn remove_empty_dir(path: &Path) -> Result<()> {
    match fs::remove_dir(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::DirectoryNotEmpty => {
            tracing::debug!(path = %path.display(), "warden: keeping non-empty directory");
            Ok(())
        }
        Err(e) => Err(Error::os_path("remove directory", path, e)),
    }
}

fn remove_tree(path: &Path) -> Result<()> {
    match remove_dir_all::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::os_path("remove tree", path, e)),
    }
}

/// Read exactly one request line from `input` without consuming more
///
/// Bytes after the newline stay in the stream for the jailed command.
pub fn read_request(mut input: impl Read) -> Result<WardenRequest> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match input.read(&mut byte) {
            Ok(0) => break,
            Ok(_) if byte[0] == b'\n' => break,
            Ok(_) => {
                line.push(byte[0]);
                if line.len() > MAX_REQUEST_LEN {
                    return Err(Error::Protocol("request line too long".to_string()));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::os("read request", e)),
        }
    }
    let line = String::from_utf8(line)
        .map_err(|_| Error::Protocol("request is not UTF-8".to_string()))?;
    protocol::decode(&line)
}
