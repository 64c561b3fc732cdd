//! Controller service trait.
//!
//! Volumes served by this plugin are directories that already exist on every
//! node, so the controller has nothing to provision: it hands the storage
//! class parameters through as the volume context and accepts deletes.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{CreateVolumeRequest, Volume, VolumeCapability, VolumeId};

#[async_trait]
pub trait CsiController: Send + Sync {
    /// Register a volume under `req.name`.
    ///
    /// The returned [`Volume::volume_context`] is what the orchestrator later
    /// hands to [`CsiNode::stage_volume`](crate::node::CsiNode::stage_volume).
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError>;

    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError>;

    /// `Ok(false)` when any capability is one this driver cannot serve.
    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<bool, CsiError>;
}
