//! CSI Node service trait.
//!
//! The Node service runs on each worker node and handles the local filesystem
//! operations required to make a volume available to a workload:
//!
//! 1. **Stage**: create the staging directory and fire the stage hook.
//! 2. **Publish**: read-only bind-mount the source directory to the target.
//! 3. **Unpublish**: remove the bind-mount and the target directory.
//! 4. **Unstage**: fire the unstage hook and remove the staging directory.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{
    NodeCapability, NodeInfo, NodePublishVolumeRequest, NodeStageVolumeRequest, VolumeId,
};

/// Node service: local mount and hook operations.
#[async_trait]
pub trait CsiNode: Send + Sync {
    /// Stage a volume at its staging path.
    ///
    /// Idempotent: calling it again with the same staging path
    /// succeeds without error.
    async fn stage_volume(&self, req: NodeStageVolumeRequest) -> Result<(), CsiError>;

    /// Unstage a volume.
    ///
    /// Idempotent: calling it on an already-unstaged volume
    /// succeeds without error.
    async fn unstage_volume(
        &self,
        volume_id: &VolumeId,
        staging_target_path: &str,
    ) -> Result<(), CsiError>;

    /// Publish a staged volume at `target_path`.
    ///
    /// Idempotent: calling it again for the same `target_path`
    /// succeeds without error.
    async fn publish_volume(&self, req: NodePublishVolumeRequest) -> Result<(), CsiError>;

    /// Unpublish a volume from `target_path`.
    ///
    /// This is idempotent.
    async fn unpublish_volume(
        &self,
        volume_id: &VolumeId,
        target_path: &str,
    ) -> Result<(), CsiError>;

    /// Return information about the node on which this service is running.
    async fn get_info(&self) -> Result<NodeInfo, CsiError>;

    /// Advertise the optional Node RPCs this plugin implements.
    async fn get_capabilities(&self) -> Result<Vec<NodeCapability>, CsiError>;
}
