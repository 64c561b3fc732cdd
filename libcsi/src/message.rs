//! Wire envelope for CSI calls.
//!
//! A bi-stream carries one JSON-encoded [`CsiMessage`] in each direction: the
//! request from the orchestrator side, then the plugin's reply, which is
//! either the matching response variant or [`CsiMessage::Error`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CsiError;
use crate::types::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CsiMessage {
    // Controller requests.
    CreateVolume(CreateVolumeRequest),
    DeleteVolume(VolumeId),
    ValidateVolumeCapabilities {
        volume_id: VolumeId,
        capabilities: Vec<VolumeCapability>,
    },

    // Node requests.
    StageVolume(NodeStageVolumeRequest),
    UnstageVolume {
        volume_id: VolumeId,
        staging_target_path: String,
    },
    PublishVolume(NodePublishVolumeRequest),
    UnpublishVolume {
        volume_id: VolumeId,
        target_path: String,
    },
    GetNodeInfo,
    GetNodeCapabilities,

    // Identity requests.
    Probe,
    GetPluginInfo,
    GetPluginCapabilities,

    // Replies.
    VolumeCreated(Volume),
    /// Answer to `ValidateVolumeCapabilities`.
    CapabilitiesValid(bool),
    PluginInfoResponse(PluginInfo),
    PluginCapabilitiesResponse(Vec<PluginCapability>),
    NodeInfoResponse(NodeInfo),
    NodeCapabilitiesResponse(Vec<NodeCapability>),
    ProbeResult(bool),
    /// Success of a call that returns nothing (stage, publish, delete, ...).
    Ok,
    Error(CsiError),
}

impl CsiMessage {
    /// Variant name, used as the log label of a message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::CreateVolume(_) => "CreateVolume",
            Self::DeleteVolume(_) => "DeleteVolume",
            Self::ValidateVolumeCapabilities { .. } => "ValidateVolumeCapabilities",
            Self::StageVolume(_) => "StageVolume",
            Self::UnstageVolume { .. } => "UnstageVolume",
            Self::PublishVolume(_) => "PublishVolume",
            Self::UnpublishVolume { .. } => "UnpublishVolume",
            Self::GetNodeInfo => "GetNodeInfo",
            Self::GetNodeCapabilities => "GetNodeCapabilities",
            Self::Probe => "Probe",
            Self::GetPluginInfo => "GetPluginInfo",
            Self::GetPluginCapabilities => "GetPluginCapabilities",
            Self::VolumeCreated(_) => "VolumeCreated",
            Self::CapabilitiesValid(_) => "CapabilitiesValid",
            Self::PluginInfoResponse(_) => "PluginInfo",
            Self::PluginCapabilitiesResponse(_) => "PluginCapabilities",
            Self::NodeInfoResponse(_) => "NodeInfo",
            Self::NodeCapabilitiesResponse(_) => "NodeCapabilities",
            Self::ProbeResult(_) => "ProbeResult",
            Self::Ok => "Ok",
            Self::Error(_) => "Error",
        }
    }

    /// The volume a request or reply refers to, if any.
    pub fn volume_id(&self) -> Option<&VolumeId> {
        match self {
            Self::DeleteVolume(id)
            | Self::ValidateVolumeCapabilities { volume_id: id, .. }
            | Self::UnstageVolume { volume_id: id, .. }
            | Self::UnpublishVolume { volume_id: id, .. } => Some(id),
            Self::StageVolume(req) => Some(&req.volume_id),
            Self::PublishVolume(req) => Some(&req.volume_id),
            Self::VolumeCreated(v) => Some(&v.volume_id),
            _ => None,
        }
    }
}

impl fmt::Display for CsiMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())?;
        if let Some(id) = self.volume_id() {
            return write!(f, "({id})");
        }
        match self {
            Self::CreateVolume(req) => write!(f, "(name={})", req.name),
            Self::CapabilitiesValid(v) | Self::ProbeResult(v) => write!(f, "({v})"),
            Self::PluginInfoResponse(info) => write!(f, "(name={})", info.name),
            Self::PluginCapabilitiesResponse(caps) => write!(f, "(count={})", caps.len()),
            Self::NodeCapabilitiesResponse(caps) => write!(f, "(count={})", caps.len()),
            Self::NodeInfoResponse(info) => write!(f, "({})", info.node_id),
            Self::Error(e) => write!(f, "({e})"),
            _ => Ok(()),
        }
    }
}
