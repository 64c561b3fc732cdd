//! Node plugin configuration.
//!
//! Built once by the binary from its command line and handed to the backend
//! constructors; nothing in the library reads the environment directly.

use std::path::PathBuf;

use crate::hook::HookConfig;

/// Where the node keeps its durable state unless told otherwise.
pub const DEFAULT_STATE_FILE: &str = "/var/lib/universal-csi-driver/state.json";
/// Directory under which every `mountPath` must live unless told otherwise.
pub const DEFAULT_MOUNT_ROOT: &str = "/data";

/// Settings for the Node service.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Identifier reported by `GetNodeInfo`.
    pub node_id: String,
    /// JSON file holding the staged volume records.
    pub state_file: PathBuf,
    /// Root that every volume's `mountPath` must be contained in.
    pub mount_root: PathBuf,
    /// Accept `SingleNodeWriter` capabilities (CSI sanity testing only).
    pub allow_writer_access: bool,
    pub hook: HookConfig,
}

impl NodeConfig {
    /// Configuration with default paths and hook timeouts.
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            state_file: PathBuf::from(DEFAULT_STATE_FILE),
            mount_root: PathBuf::from(DEFAULT_MOUNT_ROOT),
            allow_writer_access: false,
            hook: HookConfig::default(),
        }
    }
}
