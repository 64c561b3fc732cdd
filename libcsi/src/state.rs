//! Durable node state.
//!
//! The node keeps one JSON document listing every staged volume.  It is read
//! once at startup and rewritten wholesale after each stage or unstage, via a
//! temporary sibling file that is renamed over the previous one so a crash never
//! leaves a truncated snapshot behind.
//!
//! ```text
//! <state file>        # {"volumes": {"<volume-id>": VolumeRecord, ...}}
//! <state file>.tmp    # exists only while a save is in flight
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use url::Url;

use crate::error::CsiError;
use crate::types::VolumeId;

/// Everything needed to re-activate a staged volume after a restart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VolumeRecord {
    /// Source directory that gets bind-mounted on publish.
    pub mount_path: PathBuf,
    /// Staging directory on this node.
    pub staging_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_hook_url: Option<Url>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unstage_hook_url: Option<Url>,
    /// Variables captured from the stage request, opaque to the node.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    volumes: BTreeMap<VolumeId, VolumeRecord>,
}

/// The on-disk record set plus the path it lives at.
#[derive(Debug)]
pub struct StateStore {
    path: PathBuf,
    volumes: BTreeMap<VolumeId, VolumeRecord>,
}

impl StateStore {
    /// Load the state file at `path`, creating an empty one if it does not
    /// exist yet.
    pub async fn load_or_init(path: impl Into<PathBuf>) -> Result<Self, CsiError> {
        let path = path.into();
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let snapshot: Snapshot = serde_json::from_slice(&bytes).map_err(|e| {
                    CsiError::State(format!("parse {}: {e}", path.display()))
                })?;
                info!(
                    path = %path.display(),
                    count = snapshot.volumes.len(),
                    "state file loaded",
                );
                Ok(Self {
                    path,
                    volumes: snapshot.volumes,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent).await.map_err(|e| {
                        CsiError::State(format!("create dir {}: {e}", parent.display()))
                    })?;
                }
                let store = Self {
                    path,
                    volumes: BTreeMap::new(),
                };
                store.save().await?;
                info!(path = %store.path.display(), "state file initialized");
                Ok(store)
            }
            Err(e) => Err(CsiError::State(format!("read {}: {e}", path.display()))),
        }
    }

    /// Write the full record set to disk, replacing the previous snapshot
    /// atomically.
    pub async fn save(&self) -> Result<(), CsiError> {
        let snapshot = SnapshotRef {
            volumes: &self.volumes,
        };
        let json = serde_json::to_vec_pretty(&snapshot).map_err(CsiError::state)?;

        let tmp = self.tmp_path();
        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|e| CsiError::State(format!("create {}: {e}", tmp.display())))?;
        file.write_all(&json)
            .await
            .map_err(|e| CsiError::State(format!("write {}: {e}", tmp.display())))?;
        file.sync_all()
            .await
            .map_err(|e| CsiError::State(format!("sync {}: {e}", tmp.display())))?;
        drop(file);

        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            CsiError::State(format!(
                "rename {} -> {}: {e}",
                tmp.display(),
                self.path.display()
            ))
        })?;
        debug!(path = %self.path.display(), count = self.volumes.len(), "state saved");
        Ok(())
    }

    pub fn get(&self, volume_id: &VolumeId) -> Option<&VolumeRecord> {
        self.volumes.get(volume_id)
    }

    /// Insert a record, returning the one it replaced.
    pub fn insert(&mut self, volume_id: VolumeId, record: VolumeRecord) -> Option<VolumeRecord> {
        self.volumes.insert(volume_id, record)
    }

    pub fn remove(&mut self, volume_id: &VolumeId) -> Option<VolumeRecord> {
        self.volumes.remove(volume_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&VolumeId, &VolumeRecord)> {
        self.volumes.iter()
    }

    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }

    /// The volume currently staged at `staging_path`, if any.
    pub fn find_by_staging_path(&self, staging_path: &Path) -> Option<&VolumeId> {
        self.volumes
            .iter()
            .find(|(_, r)| r.staging_path == staging_path)
            .map(|(id, _)| id)
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    volumes: &'a BTreeMap<VolumeId, VolumeRecord>,
}
