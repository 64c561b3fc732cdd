//! Controller service that provisions nothing.
//!
//! The directories behind each volume already exist on every node, so
//! `CreateVolume` only echoes the storage class parameters back as the volume
//! context (that is where `mountPath`, the hook URLs and `${name}` variables
//! come from) and `DeleteVolume` has nothing to delete.

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::controller::CsiController;
use crate::error::CsiError;
use crate::types::{CreateVolumeRequest, Volume, VolumeCapability, VolumeId};
use crate::validate::read_volume_capability;

#[derive(Debug, Clone, Copy, Default)]
pub struct PassThroughController {
    allow_writer_access: bool,
}

impl PassThroughController {
    pub fn new(allow_writer_access: bool) -> Self {
        Self {
            allow_writer_access,
        }
    }
}

#[async_trait]
impl CsiController for PassThroughController {
    #[instrument(skip(self, req), fields(name = %req.name))]
    async fn create_volume(&self, req: CreateVolumeRequest) -> Result<Volume, CsiError> {
        if req.name.is_empty() {
            return Err(CsiError::invalid("Name missing in request"));
        }
        for cap in &req.volume_capabilities {
            read_volume_capability(Some(cap), self.allow_writer_access)?;
        }
        debug!("volume created (pass-through)");
        Ok(Volume {
            volume_id: VolumeId(req.name),
            capacity_bytes: req.capacity_bytes,
            volume_context: req.parameters,
        })
    }

    async fn delete_volume(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        if volume_id.is_empty() {
            return Err(CsiError::invalid("VolumeId missing in request"));
        }
        Ok(())
    }

    async fn validate_volume_capabilities(
        &self,
        volume_id: &VolumeId,
        capabilities: &[VolumeCapability],
    ) -> Result<bool, CsiError> {
        if volume_id.is_empty() {
            return Err(CsiError::invalid("VolumeId missing in request"));
        }
        if capabilities.is_empty() {
            return Err(CsiError::invalid("VolumeCapabilities missing in request"));
        }
        Ok(capabilities
            .iter()
            .all(|cap| read_volume_capability(Some(cap), self.allow_writer_access).is_ok()))
    }
}
