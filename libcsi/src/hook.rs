//! Stage / unstage hooks.
//!
//! A hook is an operator-supplied HTTP endpoint that is called with a plain
//! `GET` whenever a volume becomes active or inactive on this node.  Any 2xx
//! answer counts as success; everything else aborts the transition that
//! triggered it.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, instrument};
use url::Url;

use crate::error::CsiError;

/// Default timeout for establishing the hook connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
/// Default timeout for the whole hook request, body included.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(1);

/// Timeouts applied to every hook call.
#[derive(Debug, Clone, Copy)]
pub struct HookConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
}

impl Default for HookConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Calls a hook endpoint and returns its response body.
#[async_trait]
pub trait HookInvoker: Send + Sync {
    async fn invoke(&self, url: &Url) -> Result<String, CsiError>;
}

/// [`HookInvoker`] backed by a shared `reqwest` client.
///
/// Certificate validation is disabled: hooks run on trusted infrastructure
/// and commonly use self-signed certificates.
#[derive(Debug, Clone)]
pub struct HttpHook {
    client: reqwest::Client,
}

impl HttpHook {
    pub fn new(config: HookConfig) -> Result<Self, CsiError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| CsiError::Internal(format!("build hook client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HookInvoker for HttpHook {
    #[instrument(skip(self), fields(url = %url))]
    async fn invoke(&self, url: &Url) -> Result<String, CsiError> {
        let failed = |reason: String| CsiError::Hook {
            url: url.to_string(),
            reason,
        };

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| failed(format!("error calling: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(failed(format!("bad response ({status})")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| failed(format!("error reading body: {e}")))?;
        debug!(%status, "hook answered");
        Ok(body)
    }
}
