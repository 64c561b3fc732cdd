//! Identity service for the driver.

use async_trait::async_trait;

use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::types::{PluginCapability, PluginInfo};

/// Name the driver registers under.
pub const PLUGIN_NAME: &str = "universal-csi-driver";

/// [`CsiIdentity`] reporting the driver name and which services run in this
/// process.
#[derive(Debug, Clone, Copy, Default)]
pub struct DriverIdentity {
    controller: bool,
}

impl DriverIdentity {
    /// `controller` advertises the Controller service.
    pub fn new(controller: bool) -> Self {
        Self { controller }
    }
}

#[async_trait]
impl CsiIdentity for DriverIdentity {
    async fn get_plugin_info(&self) -> Result<PluginInfo, CsiError> {
        Ok(PluginInfo {
            name: PLUGIN_NAME.to_owned(),
            vendor_version: env!("CARGO_PKG_VERSION").to_owned(),
        })
    }

    async fn probe(&self) -> Result<bool, CsiError> {
        // All state is loaded before the server starts accepting requests.
        Ok(true)
    }

    async fn get_plugin_capabilities(&self) -> Result<Vec<PluginCapability>, CsiError> {
        if self.controller {
            Ok(vec![PluginCapability::ControllerService])
        } else {
            Ok(Vec::new())
        }
    }
}
