//! Persisted record of the grants applied to each container
//!
//! A JSON object keyed by sandbox id. Each record holds three sorted path
//! lists. The file is only touched while the global lock is held.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::policy::AccessPolicy;

/// Grants last applied for one sandbox id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    pub readable_paths: Vec<PathBuf>,
    pub writable_paths: Vec<PathBuf>,
    pub writable_paths_ensure_exists: Vec<PathBuf>,
}

impl ContainerRecord {
    pub fn from_policy(policy: &AccessPolicy) -> Self {
        Self {
            readable_paths: policy.readable().sorted(),
            writable_paths: policy.writable().sorted(),
            writable_paths_ensure_exists: policy.ensure_exists().sorted(),
        }
    }

    /// Every path of the record
    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.readable_paths
            .iter()
            .chain(&self.writable_paths)
            .chain(&self.writable_paths_ensure_exists)
    }
}

/// The container registry file and its records
#[derive(Debug)]
pub struct Registry {
    path: PathBuf,
    records: BTreeMap<String, ContainerRecord>,
}

impl Registry {
    /// Read the registry; a missing file is an empty registry
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| Error::CorruptState {
                path: path.clone(),
                reason: e.to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(Error::os_path("read registry", &path, e)),
        };
        Ok(Self { path, records })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, id: &str) -> Option<&ContainerRecord> {
        self.records.get(id)
    }

    pub fn insert(&mut self, id: impl Into<String>, record: ContainerRecord) {
        self.records.insert(id.into(), record);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ContainerRecord)> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Write the registry atomically, creating its directory if needed
    pub fn save(&self) -> Result<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| Error::InvalidRequest("registry path has no parent".to_string()))?;
        fs::create_dir_all(dir).map_err(|e| Error::os_path("create directory", dir, e))?;

        let mut file = tempfile::NamedTempFile::new_in(dir)
            .map_err(|e| Error::os_path("create temp file", dir, e))?;
        serde_json::to_writer_pretty(&mut file, &self.records)?;
        file.write_all(b"\n")
            .map_err(|e| Error::os_path("write registry", &self.path, e))?;
        file.persist(&self.path)
            .map_err(|e| Error::os_path("persist registry", &self.path, e.error))?;
        tracing::debug!(path = %self.path.display(), records = self.records.len(), "container: registry saved");
        Ok(())
    }

    /// Delete the registry file and its directory if it is left empty
    pub fn remove(self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::os_path("remove registry", &self.path, e)),
        }
        if let Some(dir) = self.path.parent() {
            match fs::remove_dir(dir) {
                Ok(()) => {}
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::NotFound | std::io::ErrorKind::DirectoryNotEmpty
                    ) => {}
                Err(e) => return Err(Error::os_path("remove directory", dir, e)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxRequest;

    #[test]
    fn test_missing_file_is_empty_registry() {
        let temp = tempfile::tempdir().unwrap();
        let registry = Registry::load(temp.path().join("Kennel").join("containers.json")).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_records_persist_sorted() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("Kennel").join("containers.json");

        let request = SandboxRequest::builder(["cmd"], "job")
            .readable("/b")
            .readable("/a")
            .writable("/w")
            .build()
            .unwrap();
        let record = ContainerRecord::from_policy(&AccessPolicy::from_request(&request));
        assert_eq!(record.readable_paths, vec![PathBuf::from("/a"), PathBuf::from("/b")]);

        let mut registry = Registry::load(&path).unwrap();
        registry.insert("job", record.clone());
        registry.save().unwrap();

        let reloaded = Registry::load(&path).unwrap();
        assert_eq!(reloaded.get("job"), Some(&record));
        assert_eq!(reloaded.len(), 1);

        reloaded.remove().unwrap();
        assert!(!path.exists());
        assert!(!path.parent().unwrap().exists());
    }

    #[test]
    fn test_corrupt_file_is_reported() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("containers.json");
        fs::write(&path, "{not json").unwrap();
        assert!(matches!(Registry::load(&path), Err(Error::CorruptState { .. })));
    }
}
