//! Identity service: who the plugin is and whether it can take requests.
//!
//! Served by every deployment of the driver, node and controller alike.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::types::{PluginCapability, PluginInfo};

#[async_trait]
pub trait CsiIdentity: Send + Sync {
    /// Registered driver name and build version.
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError>;

    /// `true` once the process has loaded its state and serves requests.
    async fn probe(&self) -> Result<bool, CsiError>;

    /// Optional services running in this process.
    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError>;
}
