//! Persistent records for cloud accounts and deployed instances.
//!
//! Records are kept in a single JSON document keyed by unique name. The
//! file is rewritten on every mutation; the design assumes a single
//! operator and a single process, so there is no cross-process locking.

use std::collections::BTreeMap;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cloud::ProviderKind;

/// A stored cloud provider account.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct CloudRecord {
    /// Unique, user-chosen account name.
    pub name: String,
    /// Provider this account belongs to.
    pub kind: ProviderKind,
    /// Provider-specific credential map.
    pub auth: BTreeMap<String, String>,
}

/// A volume attached to a deployed instance.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VolumeRecord {
    /// Human-friendly volume name.
    pub name: String,
    /// Provider-assigned volume identifier.
    pub volume_id: String,
}

/// A deployed instance as tracked locally.
///
/// The record is persisted twice during provisioning: once after the
/// instance is created (without `key_seed`) and once after it has started
/// (with `key_seed`), so a crash mid-pipeline leaves a recoverable partial
/// record.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct InstanceRecord {
    /// Unique, user-chosen instance name.
    pub name: String,
    /// Name of the cloud account the instance was deployed through.
    pub cloud_name: String,
    /// Provider-assigned virtual machine identifier.
    pub vm_id: String,
    /// Deployment location (provider specific).
    pub location: String,
    /// Public IPv4 address, once assigned.
    pub public_ip: String,
    /// Volumes attached to the instance, in attachment order.
    pub volumes: Vec<VolumeRecord>,
    /// Seed of the SSH key pair injected at creation. Empty until the
    /// instance has started successfully.
    #[serde(default)]
    pub key_seed: Vec<u8>,
}

/// Errors raised by record stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Raised when the named record does not exist.
    #[error("{kind} '{name}' not found")]
    NotFound {
        /// Record kind, `cloud` or `instance`.
        kind: &'static str,
        /// Name that was looked up.
        name: String,
    },
    /// Raised when file system operations fail.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path that could not be accessed.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
    /// Raised when the store document cannot be parsed or rendered.
    #[error("invalid store document at {path}: {message}")]
    Document {
        /// Path of the offending document.
        path: Utf8PathBuf,
        /// Human-readable error message.
        message: String,
    },
}

impl StoreError {
    pub(crate) fn cloud_not_found(name: &str) -> Self {
        Self::NotFound {
            kind: "cloud",
            name: name.to_owned(),
        }
    }

    pub(crate) fn instance_not_found(name: &str) -> Self {
        Self::NotFound {
            kind: "instance",
            name: name.to_owned(),
        }
    }
}

/// Persistence boundary for cloud and instance records.
pub trait Store {
    /// Returns all stored cloud accounts ordered by name.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be read.
    fn get_all_clouds(&self) -> Result<Vec<CloudRecord>, StoreError>;

    /// Returns the named cloud account.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the name is absent.
    fn get_cloud(&self, name: &str) -> Result<CloudRecord, StoreError>;

    /// Inserts or replaces a cloud account.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be written.
    fn save_cloud(&self, record: &CloudRecord) -> Result<(), StoreError>;

    /// Removes the named cloud account.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the name is absent.
    fn delete_cloud(&self, name: &str) -> Result<(), StoreError>;

    /// Returns all stored instances ordered by name.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be read.
    fn get_all_instances(&self) -> Result<Vec<InstanceRecord>, StoreError>;

    /// Returns the named instance.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the name is absent.
    fn get_instance(&self, name: &str) -> Result<InstanceRecord, StoreError>;

    /// Inserts or replaces an instance record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store cannot be written.
    fn save_instance(&self, record: &InstanceRecord) -> Result<(), StoreError>;

    /// Removes the named instance record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when the name is absent.
    fn delete_instance(&self, name: &str) -> Result<(), StoreError>;
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
struct StoreDocument {
    #[serde(default)]
    clouds: BTreeMap<String, CloudRecord>,
    #[serde(default)]
    instances: BTreeMap<String, InstanceRecord>,
}

/// JSON file backed [`Store`].
#[derive(Clone, Debug)]
pub struct FileStore {
    path: Utf8PathBuf,
}

impl FileStore {
    /// Creates a store backed by the given JSON file path. The file is
    /// created on first write.
    #[must_use]
    pub const fn new(path: Utf8PathBuf) -> Self {
        Self { path }
    }

    fn load(&self) -> Result<StoreDocument, StoreError> {
        let Some(contents) = read_document(&self.path)? else {
            return Ok(StoreDocument::default());
        };
        serde_json::from_str(&contents).map_err(|err| StoreError::Document {
            path: self.path.clone(),
            message: err.to_string(),
        })
    }

    fn save(&self, document: &StoreDocument) -> Result<(), StoreError> {
        let rendered =
            serde_json::to_string_pretty(document).map_err(|err| StoreError::Document {
                path: self.path.clone(),
                message: err.to_string(),
            })?;
        write_document(&self.path, &rendered)
    }

    fn update<T>(
        &self,
        apply: impl FnOnce(&mut StoreDocument) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut document = self.load()?;
        let outcome = apply(&mut document)?;
        self.save(&document)?;
        Ok(outcome)
    }
}

impl Store for FileStore {
    fn get_all_clouds(&self) -> Result<Vec<CloudRecord>, StoreError> {
        Ok(self.load()?.clouds.into_values().collect())
    }

    fn get_cloud(&self, name: &str) -> Result<CloudRecord, StoreError> {
        self.load()?
            .clouds
            .remove(name)
            .ok_or_else(|| StoreError::cloud_not_found(name))
    }

    fn save_cloud(&self, record: &CloudRecord) -> Result<(), StoreError> {
        self.update(|document| {
            document.clouds.insert(record.name.clone(), record.clone());
            Ok(())
        })
    }

    fn delete_cloud(&self, name: &str) -> Result<(), StoreError> {
        self.update(|document| {
            document
                .clouds
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| StoreError::cloud_not_found(name))
        })
    }

    fn get_all_instances(&self) -> Result<Vec<InstanceRecord>, StoreError> {
        Ok(self.load()?.instances.into_values().collect())
    }

    fn get_instance(&self, name: &str) -> Result<InstanceRecord, StoreError> {
        self.load()?
            .instances
            .remove(name)
            .ok_or_else(|| StoreError::instance_not_found(name))
    }

    fn save_instance(&self, record: &InstanceRecord) -> Result<(), StoreError> {
        self.update(|document| {
            document
                .instances
                .insert(record.name.clone(), record.clone());
            Ok(())
        })
    }

    fn delete_instance(&self, name: &str) -> Result<(), StoreError> {
        self.update(|document| {
            document
                .instances
                .remove(name)
                .map(|_| ())
                .ok_or_else(|| StoreError::instance_not_found(name))
        })
    }
}

fn split_path(path: &Utf8Path) -> Result<(&Utf8Path, &str), StoreError> {
    let parent = path.parent().unwrap_or_else(|| Utf8Path::new("."));
    let file_name = path.file_name().ok_or_else(|| StoreError::Document {
        path: path.to_path_buf(),
        message: String::from("store path is missing a filename"),
    })?;
    Ok((parent, file_name))
}

fn read_document(path: &Utf8Path) -> Result<Option<String>, StoreError> {
    let (parent, file_name) = split_path(path)?;
    let dir = match Dir::open_ambient_dir(parent, ambient_authority()) {
        Ok(dir) => dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(StoreError::Io {
                path: parent.to_path_buf(),
                message: err.to_string(),
            });
        }
    };

    match dir.read_to_string(file_name) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(StoreError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }),
    }
}

fn write_document(path: &Utf8Path, contents: &str) -> Result<(), StoreError> {
    let (parent, file_name) = split_path(path)?;
    Dir::create_ambient_dir_all(parent, ambient_authority()).map_err(|err| StoreError::Io {
        path: parent.to_path_buf(),
        message: err.to_string(),
    })?;
    let dir = Dir::open_ambient_dir(parent, ambient_authority()).map_err(|err| StoreError::Io {
        path: parent.to_path_buf(),
        message: err.to_string(),
    })?;
    dir.write(file_name, contents)
        .map_err(|err| StoreError::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store_in(tmp: &TempDir) -> FileStore {
        let path = Utf8PathBuf::from_path_buf(tmp.path().join("store.json"))
            .unwrap_or_else(|err| panic!("temp path should be utf8: {}", err.display()));
        FileStore::new(path)
    }

    fn sample_instance(name: &str) -> InstanceRecord {
        InstanceRecord {
            name: name.to_owned(),
            cloud_name: String::from("scw-main"),
            vm_id: String::from("vm-1"),
            location: String::from("fr-par-1"),
            public_ip: String::from("192.0.2.10"),
            volumes: vec![VolumeRecord {
                name: String::from("web1"),
                volume_id: String::from("vol-1"),
            }],
            key_seed: vec![1, 2, 3],
        }
    }

    #[test]
    fn save_and_get_instance_round_trips() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let store = store_in(&tmp);
        let record = sample_instance("web1");

        store
            .save_instance(&record)
            .unwrap_or_else(|err| panic!("save: {err}"));
        let loaded = store
            .get_instance("web1")
            .unwrap_or_else(|err| panic!("get: {err}"));

        assert_eq!(loaded, record);
    }

    #[test]
    fn get_missing_instance_is_not_found() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let store = store_in(&tmp);

        let result = store.get_instance("ghost");
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
    }

    #[test]
    fn delete_instance_removes_record() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let store = store_in(&tmp);
        store
            .save_instance(&sample_instance("web1"))
            .unwrap_or_else(|err| panic!("save: {err}"));

        store
            .delete_instance("web1")
            .unwrap_or_else(|err| panic!("delete: {err}"));

        assert!(matches!(
            store.get_instance("web1"),
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(
            store.delete_instance("web1"),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn clouds_and_instances_are_independent() {
        let tmp = TempDir::new().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let store = store_in(&tmp);
        let cloud = CloudRecord {
            name: String::from("scw-main"),
            kind: ProviderKind::Scaleway,
            auth: BTreeMap::from([(String::from("secret_key"), String::from("s3cret"))]),
        };

        store
            .save_cloud(&cloud)
            .unwrap_or_else(|err| panic!("save cloud: {err}"));
        store
            .save_instance(&sample_instance("web1"))
            .unwrap_or_else(|err| panic!("save instance: {err}"));

        assert_eq!(
            store
                .get_all_clouds()
                .unwrap_or_else(|err| panic!("clouds: {err}")),
            vec![cloud]
        );
        assert_eq!(
            store
                .get_all_instances()
                .unwrap_or_else(|err| panic!("instances: {err}"))
                .len(),
            1
        );
    }
}
