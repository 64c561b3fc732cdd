//! Core CSI types: volumes, capabilities and lifecycle requests.
//!
//! Everything here crosses the wire inside a
//! [`CsiMessage`](crate::message::CsiMessage), so all of it is serde-able.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Volume identity
// ---------------------------------------------------------------------------

/// Volume name as chosen by the orchestrator; the controller uses it verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct VolumeId(pub String);

impl VolumeId {
    /// Whether the caller left the identifier blank.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VolumeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VolumeId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// Access mode & capabilities
// ---------------------------------------------------------------------------

/// Describes how a volume may be accessed, following the CSI access modes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessMode {
    /// Mounted read-write by a single node.
    SingleNodeWriter,
    /// Mounted read-only by a single node.
    SingleNodeReaderOnly,
    /// Mounted read-only by many nodes.
    MultiNodeReaderOnly,
    /// Many nodes, one of them writing.
    MultiNodeSingleWriter,
    /// Many nodes, all writing.
    MultiNodeMultiWriter,
}

/// How the volume is presented to the workload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum AccessType {
    /// A mounted filesystem.
    Mount {
        /// Requested filesystem type; empty means "don't care".
        #[serde(default)]
        fs_type: String,
        /// Mount flags, e.g. `"mode=0755"`.
        #[serde(default)]
        mount_flags: Vec<String>,
    },
    /// A raw block device.
    Block,
}

/// Access requirement attached to create, stage and publish requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeCapability {
    pub access_mode: AccessMode,
    pub access_type: AccessType,
}

impl Default for VolumeCapability {
    fn default() -> Self {
        Self {
            access_mode: AccessMode::MultiNodeReaderOnly,
            access_type: AccessType::Mount {
                fs_type: String::new(),
                mount_flags: Vec::new(),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Volume metadata
// ---------------------------------------------------------------------------

/// A volume as returned by the controller pass-through.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub volume_id: VolumeId,
    /// Requested capacity in bytes (informational only).
    pub capacity_bytes: u64,
    /// Storage class parameters, replayed as the stage request's context.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// `CreateVolume` arguments.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    /// Name for the volume, chosen by the orchestrator.
    pub name: String,
    pub capacity_bytes: u64,
    #[serde(default)]
    pub volume_capabilities: Vec<VolumeCapability>,
    /// Storage class parameters.
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// Request to stage a volume on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStageVolumeRequest {
    pub volume_id: VolumeId,
    /// Node-local staging directory.
    pub staging_target_path: String,
    pub volume_capability: Option<VolumeCapability>,
    /// Opaque context carried from `CreateVolume`: `mountPath`,
    /// `stageHookURL`, `unstageHookURL` and `${name}` variables.
    #[serde(default)]
    pub volume_context: HashMap<String, String>,
}

/// Request to publish (bind-mount) a staged volume to a workload path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodePublishVolumeRequest {
    pub volume_id: VolumeId,
    /// The staging directory the volume was staged to.
    pub staging_target_path: String,
    /// Workload-visible path, e.g. `/var/lib/kubelet/pods/<uid>/volumes/...`.
    pub target_path: String,
    pub volume_capability: Option<VolumeCapability>,
}

// ---------------------------------------------------------------------------
// Plugin & node info
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginInfo {
    /// Plugin name.
    pub name: String,
    /// Crate version of the running binary.
    pub vendor_version: String,
}

/// Optional services a plugin process runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum PluginCapability {
    ControllerService,
}

/// Capabilities advertised by the Node service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum NodeCapability {
    /// The node implements `StageVolume` / `UnstageVolume`.
    StageUnstageVolume,
}

/// Answer to `GetNodeInfo`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
}
