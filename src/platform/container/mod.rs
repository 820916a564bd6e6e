//! Windows AppContainer backend
//!
//! Each sandbox id maps to one named AppContainer. Grants are applied as ACL
//! entries for the container's SID and recorded in the registry, so a
//! relaunch only touches the paths whose grant changed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::config::{MissingSourceBehavior, SandboxRequest};
use crate::error::{Access, Result};
use crate::keep_alive::{self, KeepAlive};
use crate::platform::Child;

pub mod registry;
#[cfg(windows)]
pub(crate) mod windows;

pub use registry::{ContainerRecord, Registry};

/// Upper bound on AppContainer names
pub const MAX_CONTAINER_NAME: usize = 50;

#[cfg(windows)]
const MUTEX_NAME: &str = "Kennel_Global_Mutex";

/// Deterministic container name for a sandbox id
pub fn container_name(id: &str) -> String {
    let digest = Sha256::digest(id.as_bytes());
    let mut name = String::from("kennel_");
    for byte in digest {
        name.push_str(&format!("{byte:02x}"));
    }
    name.truncate(MAX_CONTAINER_NAME);
    name
}

/// ACL operations against one container
pub trait ContainerAcl {
    /// Remove the container's entry from its own storage folder
    fn strip_container_folder(&mut self) -> Result<()>;
    /// Remove every entry for the container from `path`
    fn revoke(&mut self, path: &Path) -> Result<()>;
    /// Grant read or full access on `path`, inherited by children
    fn grant(&mut self, path: &Path, access: Access) -> Result<()>;
}

/// Strongest access each path of a record grants
fn access_map(record: &ContainerRecord) -> BTreeMap<&Path, Access> {
    let mut map = BTreeMap::new();
    for path in &record.readable_paths {
        map.insert(path.as_path(), Access::Read);
    }
    for path in record
        .writable_paths
        .iter()
        .chain(&record.writable_paths_ensure_exists)
    {
        map.insert(path.as_path(), Access::Write);
    }
    map
}

/// The grants of `record` whose paths exist right now
fn present(record: &ContainerRecord, missing: MissingSourceBehavior) -> Result<ContainerRecord> {
    let keep = |paths: &[PathBuf]| -> Result<Vec<PathBuf>> {
        let mut kept = Vec::with_capacity(paths.len());
        for path in paths {
            if missing.check(path)? {
                kept.push(path.clone());
            }
        }
        Ok(kept)
    };
    Ok(ContainerRecord {
        readable_paths: keep(&record.readable_paths)?,
        writable_paths: keep(&record.writable_paths)?,
        writable_paths_ensure_exists: keep(&record.writable_paths_ensure_exists)?,
    })
}

/// Apply the difference between `old` and `new` through `acl`
///
/// Missing paths of `new` are left out of the applied grants, so they are
/// granted by the first launch that finds them. `fresh` lists ensure-exists
/// directories created by this launch; their previous entries vanished with
/// the old directory, so they are granted again even when unchanged.
/// Returns the record to persist when it differs from `old`.
pub fn provision(
    acl: &mut impl ContainerAcl,
    old: Option<&ContainerRecord>,
    new: &ContainerRecord,
    fresh: &[PathBuf],
    missing: MissingSourceBehavior,
) -> Result<Option<ContainerRecord>> {
    let applied = present(new, missing)?;
    let changed = old != Some(&applied);
    let before = old.map(access_map).unwrap_or_default();
    let after = access_map(&applied);

    if changed {
        acl.strip_container_folder()?;

        for (path, access) in &before {
            if after.get(path) == Some(access) {
                continue;
            }
            tracing::debug!(path = %path.display(), "container: revoke");
            match acl.revoke(path) {
                Err(e) if e.is_not_found() => {}
                other => other?,
            }
        }
    }

    for (path, access) in &after {
        let unchanged = before.get(path) == Some(access);
        let recreated = fresh.iter().any(|f| f == path);
        if unchanged && !recreated {
            continue;
        }
        tracing::debug!(path = %path.display(), %access, "container: grant");
        acl.grant(path, *access)?;
    }

    Ok(changed.then_some(applied))
}

/// Bring the container for `request` up to date
///
/// Must run under the global lock. Persists the registry only on change.
#[cfg_attr(not(windows), allow(dead_code))]
pub(crate) fn reconcile(
    registry: &mut Registry,
    request: &SandboxRequest,
    acl: &mut impl ContainerAcl,
) -> Result<Vec<KeepAlive>> {
    let policy = crate::policy::AccessPolicy::from_request(request);
    let ensured = keep_alive::ensure_all(policy.ensure_exists())?;
    let fresh: Vec<PathBuf> = ensured
        .iter()
        .filter(|(_, created)| *created)
        .map(|(handle, _)| handle.dir().to_path_buf())
        .collect();

    let record = ContainerRecord::from_policy(&policy);
    let applied = provision(
        acl,
        registry.get(request.id()),
        &record,
        &fresh,
        request.options().missing_sources(),
    )?;
    if let Some(applied) = applied {
        registry.insert(request.id(), applied);
        registry.save()?;
    }
    Ok(ensured.into_iter().map(|(handle, _)| handle).collect())
}

pub(crate) struct AppContainer {
    #[cfg_attr(not(windows), allow(dead_code))]
    registry_path: PathBuf,
}

impl AppContainer {
    pub(crate) fn new(registry_path: PathBuf) -> Self {
        Self { registry_path }
    }

    #[cfg(windows)]
    pub(crate) fn launch(&self, request: &SandboxRequest) -> Result<Child> {
        let _lock = crate::lock::GlobalLock::named(MUTEX_NAME)?;
        let mut registry = Registry::load(&self.registry_path)?;
        let container = windows::Container::create_or_get(&container_name(request.id()))?;
        let keep_alive = reconcile(&mut registry, request, &mut container.acl())?;
        tracing::info!(id = request.id(), container = container.name(), "sandbox: launching in AppContainer");
        container.spawn(request, keep_alive)
    }

    #[cfg(not(windows))]
    pub(crate) fn launch(&self, _request: &SandboxRequest) -> Result<Child> {
        Err(crate::error::Error::EnvironmentUnsupported(
            "AppContainer isolation requires Windows".to_string(),
        ))
    }

    /// Revoke and delete every registered container, then the registry
    #[cfg(windows)]
    pub(crate) fn delete_all(&self) -> Result<()> {
        let _lock = crate::lock::GlobalLock::named(MUTEX_NAME)?;
        let registry = Registry::load(&self.registry_path)?;
        for (id, record) in registry.iter() {
            let name = container_name(id);
            let container = windows::Container::create_or_get(&name)?;
            let mut acl = container.acl();
            for path in record.paths() {
                match acl.revoke(path) {
                    Err(e) if e.is_not_found() => {}
                    other => other?,
                }
            }
            drop(container);
            windows::delete_container(&name)?;
            tracing::debug!(id = %id, container = %name, "container: deleted");
        }
        registry.remove()
    }

    #[cfg(not(windows))]
    pub(crate) fn delete_all(&self) -> Result<()> {
        Err(crate::error::Error::EnvironmentUnsupported(
            "AppContainer isolation requires Windows".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[derive(Default)]
    struct FakeAcl {
        ops: Vec<String>,
        gone: Vec<PathBuf>,
    }

    impl ContainerAcl for FakeAcl {
        fn strip_container_folder(&mut self) -> Result<()> {
            self.ops.push("strip".to_string());
            Ok(())
        }

        fn revoke(&mut self, path: &Path) -> Result<()> {
            if self.gone.iter().any(|p| p == path) {
                return Err(Error::os_path(
                    "get security info",
                    path,
                    std::io::Error::from(std::io::ErrorKind::NotFound),
                ));
            }
            self.ops.push(format!("revoke {}", path.display()));
            Ok(())
        }

        fn grant(&mut self, path: &Path, access: Access) -> Result<()> {
            self.ops.push(format!("grant {access} {}", path.display()));
            Ok(())
        }
    }

    fn record(temp: &Path, readable: &[&str], writable: &[&str]) -> ContainerRecord {
        let make = |names: &[&str]| -> Vec<PathBuf> {
            names
                .iter()
                .map(|n| {
                    let p = temp.join(n);
                    std::fs::create_dir_all(&p).unwrap();
                    p
                })
                .collect()
        };
        ContainerRecord {
            readable_paths: make(readable),
            writable_paths: make(writable),
            writable_paths_ensure_exists: Vec::new(),
        }
    }

    #[test]
    fn test_name_is_stable_and_bounded() {
        let a = container_name("job");
        assert_eq!(a, container_name("job"));
        assert_ne!(a, container_name("job2"));
        assert_eq!(a.len(), MAX_CONTAINER_NAME);
        assert!(a.starts_with("kennel_"));
    }

    #[test]
    fn test_first_launch_grants_everything() {
        let temp = tempfile::tempdir().unwrap();
        let new = record(temp.path(), &["x"], &["z"]);
        let mut acl = FakeAcl::default();

        let applied = provision(&mut acl, None, &new, &[], MissingSourceBehavior::Skip).unwrap();
        assert_eq!(applied, Some(new.clone()));
        assert_eq!(acl.ops[0], "strip");
        assert!(acl.ops.contains(&format!("grant read {}", temp.path().join("x").display())));
        assert!(acl.ops.contains(&format!("grant write {}", temp.path().join("z").display())));
    }

    #[test]
    fn test_unchanged_policy_performs_no_operations() {
        let temp = tempfile::tempdir().unwrap();
        let rec = record(temp.path(), &["x", "y"], &["z"]);
        let mut acl = FakeAcl::default();

        let applied =
            provision(&mut acl, Some(&rec), &rec.clone(), &[], MissingSourceBehavior::Skip).unwrap();
        assert!(applied.is_none());
        assert!(acl.ops.is_empty());
    }

    #[test]
    fn test_incremental_diff() {
        let temp = tempfile::tempdir().unwrap();
        let old = record(temp.path(), &["x", "y"], &["z"]);
        let new = record(temp.path(), &["y", "w"], &["z"]);
        let mut acl = FakeAcl::default();

        provision(&mut acl, Some(&old), &new, &[], MissingSourceBehavior::Skip).unwrap();
        assert_eq!(
            acl.ops,
            vec![
                "strip".to_string(),
                format!("revoke {}", temp.path().join("x").display()),
                format!("grant read {}", temp.path().join("w").display()),
            ]
        );
    }

    #[test]
    fn test_downgrade_revokes_before_regrant() {
        let temp = tempfile::tempdir().unwrap();
        let old = record(temp.path(), &[], &["z"]);
        let new = record(temp.path(), &["z"], &[]);
        let mut acl = FakeAcl::default();

        provision(&mut acl, Some(&old), &new, &[], MissingSourceBehavior::Skip).unwrap();
        let z = temp.path().join("z");
        assert_eq!(
            acl.ops,
            vec![
                "strip".to_string(),
                format!("revoke {}", z.display()),
                format!("grant read {}", z.display()),
            ]
        );
    }

    #[test]
    fn test_revoke_tolerates_vanished_paths() {
        let temp = tempfile::tempdir().unwrap();
        let old = record(temp.path(), &["x"], &[]);
        let new = record(temp.path(), &[], &[]);
        let mut acl = FakeAcl {
            gone: vec![temp.path().join("x")],
            ..FakeAcl::default()
        };
        let applied = provision(&mut acl, Some(&old), &new, &[], MissingSourceBehavior::Skip).unwrap();
        assert!(applied.is_some());
        assert_eq!(acl.ops, vec!["strip".to_string()]);
    }

    #[test]
    fn test_missing_paths_are_not_granted() {
        let temp = tempfile::tempdir().unwrap();
        let new = ContainerRecord {
            readable_paths: vec![temp.path().join("missing")],
            ..ContainerRecord::default()
        };
        let mut acl = FakeAcl::default();
        let applied = provision(&mut acl, None, &new, &[], MissingSourceBehavior::Skip).unwrap();
        assert_eq!(acl.ops, vec!["strip".to_string()]);
        assert_eq!(applied, Some(ContainerRecord::default()));

        let mut acl = FakeAcl::default();
        let result = provision(&mut acl, None, &new, &[], MissingSourceBehavior::Fail);
        assert!(matches!(result, Err(Error::PathNotFound(_))));
        assert!(acl.ops.is_empty());
    }

    #[test]
    fn test_skipped_path_is_granted_once_it_appears() {
        let temp = tempfile::tempdir().unwrap();
        let later = temp.path().join("later");
        let wanted = ContainerRecord {
            readable_paths: vec![later.clone()],
            ..ContainerRecord::default()
        };

        let mut acl = FakeAcl::default();
        let recorded = provision(&mut acl, None, &wanted, &[], MissingSourceBehavior::Skip)
            .unwrap()
            .unwrap();
        assert!(recorded.readable_paths.is_empty());

        std::fs::create_dir_all(&later).unwrap();
        let mut acl = FakeAcl::default();
        let applied =
            provision(&mut acl, Some(&recorded), &wanted, &[], MissingSourceBehavior::Skip).unwrap();
        assert_eq!(applied, Some(wanted.clone()));
        assert_eq!(
            acl.ops,
            vec!["strip".to_string(), format!("grant read {}", later.display())]
        );
    }

    #[test]
    fn test_reconcile_records_only_present_paths() {
        let temp = tempfile::tempdir().unwrap();
        let registry_path = temp.path().join("containers.json");
        let later = temp.path().join("later");
        let request = SandboxRequest::builder(["cmd"], "job")
            .readable(&later)
            .build()
            .unwrap();

        let mut registry = Registry::load(&registry_path).unwrap();
        reconcile(&mut registry, &request, &mut FakeAcl::default()).unwrap();
        assert!(registry.get("job").unwrap().readable_paths.is_empty());

        std::fs::create_dir_all(&later).unwrap();
        let mut acl = FakeAcl::default();
        reconcile(&mut registry, &request, &mut acl).unwrap();
        assert!(acl.ops.contains(&format!("grant read {}", later.display())));
        assert_eq!(registry.get("job").unwrap().readable_paths, vec![later.clone()]);
    }

    #[test]
    fn test_reconcile_persists_and_regrants_recreated_dirs() {
        let temp = tempfile::tempdir().unwrap();
        let registry_path = temp.path().join("state").join("containers.json");
        let out = temp.path().join("out");
        let request = SandboxRequest::builder(["cmd"], "job")
            .writable_ensure_exists(&out)
            .build()
            .unwrap();

        let mut registry = Registry::load(&registry_path).unwrap();
        let mut acl = FakeAcl::default();
        let keep_alive = reconcile(&mut registry, &request, &mut acl).unwrap();
        assert_eq!(keep_alive.len(), 1);
        assert!(registry_path.exists());
        assert_eq!(acl.ops, vec!["strip".to_string(), format!("grant write {}", out.display())]);
        drop(keep_alive);

        let mut registry = Registry::load(&registry_path).unwrap();
        let mut acl = FakeAcl::default();
        let keep_alive = reconcile(&mut registry, &request, &mut acl).unwrap();
        assert!(acl.ops.is_empty());
        drop(keep_alive);

        std::fs::remove_dir_all(&out).unwrap();
        let mut acl = FakeAcl::default();
        let _keep_alive = reconcile(&mut registry, &request, &mut acl).unwrap();
        assert_eq!(acl.ops, vec![format!("grant write {}", out.display())]);
    }
}
