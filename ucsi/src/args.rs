//! Command line of the `ucsi` daemon.
//!
//! Every flag can also be supplied through a `UCSI_*` environment variable,
//! which is how the DaemonSet and controller Deployment manifests set them.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use libcsi::config::{DEFAULT_MOUNT_ROOT, DEFAULT_STATE_FILE};
use libcsi::{HookConfig, NodeConfig};

#[derive(Parser, Debug)]
#[command(
    name = "ucsi",
    version,
    about = "CSI driver that exposes host directories read-only and signals hooks on stage/unstage"
)]
pub struct Args {
    /// QUIC listen address.
    #[arg(long, env = "UCSI_ENDPOINT", default_value = "0.0.0.0:7443")]
    pub endpoint: SocketAddr,

    /// Serve the Controller service.
    #[arg(long, env = "UCSI_CONTROLLER")]
    pub controller: bool,

    /// Serve the Node service under this node id.
    #[arg(long, env = "UCSI_NODE", value_name = "NODE_ID")]
    pub node: Option<String>,

    /// File holding the staged volume records.
    #[arg(long, env = "UCSI_STATE", default_value = DEFAULT_STATE_FILE)]
    pub state: PathBuf,

    /// Root directory every volume's mountPath must live under.
    #[arg(long, env = "UCSI_MOUNT_PATH", default_value = DEFAULT_MOUNT_ROOT)]
    pub mount_path: PathBuf,

    /// PEM certificate chain presented by the QUIC server.
    #[arg(long, env = "UCSI_TLS_CERT")]
    pub tls_cert: PathBuf,

    /// PEM private key matching `--tls-cert`.
    #[arg(long, env = "UCSI_TLS_KEY")]
    pub tls_key: PathBuf,

    #[arg(long, env = "UCSI_HOOK_CONNECT_TIMEOUT_MS", default_value_t = 1000)]
    pub hook_connect_timeout_ms: u64,

    #[arg(long, env = "UCSI_HOOK_REQUEST_TIMEOUT_MS", default_value_t = 1000)]
    pub hook_request_timeout_ms: u64,

    /// Accept SINGLE_NODE_WRITER capabilities. Only meant for csi-sanity runs.
    #[arg(long, env = "UCSI_ALLOW_WRITER_ACCESS")]
    pub allow_writer_access: bool,

    /// Emit logs as JSON lines.
    #[arg(long, env = "UCSI_LOG_JSON")]
    pub log_json: bool,
}

impl Args {
    /// Node service settings, if the Node service was requested.
    pub fn node_config(&self) -> Option<NodeConfig> {
        let node_id = self.node.as_ref()?;
        let mut config = NodeConfig::new(node_id.clone());
        config.state_file = self.state.clone();
        config.mount_root = self.mount_path.clone();
        config.allow_writer_access = self.allow_writer_access;
        config.hook = HookConfig {
            connect_timeout: Duration::from_millis(self.hook_connect_timeout_ms),
            request_timeout: Duration::from_millis(self.hook_request_timeout_ms),
        };
        Some(config)
    }
}
