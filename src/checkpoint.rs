//! Allocation checkpointing.
//!
//! One flat JSON file per resource name records which device IDs are
//! allocated to which pod.  The file is read once at startup to repopulate
//! allocation bookkeeping and fully rewritten on every allocation change.
//!
//! # On-disk layout
//!
//! ```text
//! <dir>/
//!   <resource-name>.checkpoint.json
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::DpError;

/// One pod's allocated device IDs, in allocation order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PodDevicesEntry {
    /// Pod identifier.
    #[serde(rename = "podUID")]
    pub pod_uid: String,
    /// Devices allocated to the pod, ordered.
    #[serde(rename = "deviceIDs")]
    pub device_ids: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct CheckpointData {
    #[serde(rename = "resourceName")]
    resource_name: String,
    #[serde(rename = "podEntries", default)]
    pod_entries: Vec<PodDevicesEntry>,
}

/// Persists pod-to-device mappings for one resource name.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    resource_name: String,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>, resource_name: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            resource_name: resource_name.into(),
        }
    }

    /// Path of the checkpoint file for this resource name.
    pub fn path(&self) -> PathBuf {
        let sanitized = self.resource_name.replace('/', "_");
        self.dir.join(format!("{sanitized}.checkpoint.json"))
    }

    /// Read the persisted mapping.
    ///
    /// A missing file yields an empty mapping.  An unreadable or malformed
    /// file is treated as "no prior state" with a warning, never as fatal.
    pub async fn load(&self) -> Vec<PodDevicesEntry> {
        let path = self.path();
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no checkpoint file, starting empty");
                return Vec::new();
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read checkpoint, starting empty");
                return Vec::new();
            }
        };
        match serde_json::from_str::<CheckpointData>(&raw) {
            Ok(data) if data.resource_name == self.resource_name => data.pod_entries,
            Ok(data) => {
                warn!(
                    path = %path.display(),
                    found = %data.resource_name,
                    expected = %self.resource_name,
                    "checkpoint belongs to a different resource, starting empty",
                );
                Vec::new()
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot parse checkpoint, starting empty");
                Vec::new()
            }
        }
    }

    /// Overwrite the record for this resource name with `entries`.
    pub async fn save(&self, entries: &[PodDevicesEntry]) -> Result<(), DpError> {
        let data = CheckpointData {
            resource_name: self.resource_name.clone(),
            pod_entries: entries.to_vec(),
        };
        let json = serde_json::to_string_pretty(&data).map_err(DpError::checkpoint)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(DpError::checkpoint)?;
        tokio::fs::write(self.path(), json)
            .await
            .map_err(|e| DpError::Checkpoint(format!("write {}: {e}", self.path().display())))?;
        debug!(path = %self.path().display(), pods = entries.len(), "checkpoint written");
        Ok(())
    }
}

/// Convenience: does `entries` record `device_id` for any pod?
pub fn contains_device(entries: &[PodDevicesEntry], device_id: &str) -> bool {
    entries
        .iter()
        .any(|e| e.device_ids.iter().any(|d| d == device_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(tmp.path(), "sriov_net_A");
        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn save_then_load_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(tmp.path(), "sriov_net_A");

        let entries = vec![PodDevicesEntry {
            pod_uid: "pod-1".into(),
            device_ids: vec!["0000:02:02.0".into(), "0000:02:02.1".into()],
        }];
        store.save(&entries).await.unwrap();

        let loaded = store.load().await;
        assert_eq!(loaded, entries);
        assert!(contains_device(&loaded, "0000:02:02.1"));
        assert!(!contains_device(&loaded, "0000:02:02.2"));
    }

    #[tokio::test]
    async fn save_fully_overwrites() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(tmp.path(), "sriov_net_A");

        store
            .save(&[PodDevicesEntry {
                pod_uid: "pod-1".into(),
                device_ids: vec!["0000:02:02.0".into()],
            }])
            .await
            .unwrap();
        store
            .save(&[PodDevicesEntry {
                pod_uid: "pod-2".into(),
                device_ids: vec!["0000:02:02.1".into()],
            }])
            .await
            .unwrap();

        let loaded = store.load().await;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].pod_uid, "pod-2");
    }

    #[tokio::test]
    async fn corrupt_file_loads_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(tmp.path(), "sriov_net_A");
        tokio::fs::write(store.path(), "{not json").await.unwrap();
        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn foreign_resource_checkpoint_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let other = CheckpointStore::new(tmp.path(), "sriov_net_A");
        other
            .save(&[PodDevicesEntry {
                pod_uid: "pod-1".into(),
                device_ids: vec!["0000:02:02.0".into()],
            }])
            .await
            .unwrap();

        // Same file name would collide, so force it: write A's data under B's path.
        let store = CheckpointStore::new(tmp.path(), "sriov_net_B");
        tokio::fs::copy(other.path(), store.path()).await.unwrap();
        assert!(store.load().await.is_empty());
    }
}
