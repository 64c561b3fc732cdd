//! QUIC server that runs on each worker node and dispatches incoming CSI
//! requests to the configured service implementations.

use std::net::SocketAddr;
use std::sync::Arc;

use quinn::crypto::rustls::QuicServerConfig;
use tracing::{debug, error, info, instrument, warn};

use crate::controller::CsiController;
use crate::error::CsiError;
use crate::identity::CsiIdentity;
use crate::message::CsiMessage;
use crate::node::CsiNode;

/// Upper bound on a single request body.
const MAX_REQUEST_SIZE: usize = 16 * 1024 * 1024;

/// The services a server dispatches to.
///
/// Identity is always served; Node and Controller are optional so one binary
/// can run as the per-node daemon, the controller deployment, or both.
#[derive(Clone)]
pub struct Services {
    pub identity: Arc<dyn CsiIdentity>,
    pub controller: Option<Arc<dyn CsiController>>,
    pub node: Option<Arc<dyn CsiNode>>,
}

/// A CSI server that accepts QUIC connections and dispatches
/// [`CsiMessage`] requests to [`Services`].
pub struct CsiServer {
    endpoint: quinn::Endpoint,
    services: Services,
}

impl CsiServer {
    /// Create a new server bound to `addr`.
    pub fn new(
        addr: SocketAddr,
        tls_config: rustls::ServerConfig,
        services: Services,
    ) -> Result<Self, CsiError> {
        let quic_server_config = QuicServerConfig::try_from(tls_config)
            .map_err(|e| CsiError::TransportError(format!("invalid TLS config: {e}")))?;
        let server_config = quinn::ServerConfig::with_crypto(Arc::new(quic_server_config));
        let endpoint = quinn::Endpoint::server(server_config, addr).map_err(CsiError::transport)?;
        info!(%addr, "CSI QUIC server listening");
        Ok(Self { endpoint, services })
    }

    /// Accept connections in a loop until the endpoint is closed.
    ///
    /// Each accepted connection spawns a Tokio task, and each bi-stream
    /// within a connection is handled concurrently.
    pub async fn serve(&self) -> Result<(), CsiError> {
        while let Some(incoming) = self.endpoint.accept().await {
            let services = self.services.clone();
            tokio::spawn(async move {
                match incoming.await {
                    Ok(conn) => {
                        let remote = conn.remote_address();
                        debug!(%remote, "CSI connection accepted");
                        if let Err(e) = Self::handle_connection(conn, services).await {
                            warn!(%remote, error = %e, "CSI connection error");
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "CSI incoming connection failed");
                    }
                }
            });
        }
        Ok(())
    }

    /// Handle all bi-streams on a single connection.
    async fn handle_connection(conn: quinn::Connection, services: Services) -> Result<(), CsiError> {
        loop {
            let (send, recv) = match conn.accept_bi().await {
                Ok(stream) => stream,
                Err(quinn::ConnectionError::ApplicationClosed(_))
                | Err(quinn::ConnectionError::LocallyClosed) => return Ok(()),
                Err(e) => return Err(CsiError::transport(e)),
            };

            let services = services.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_stream(send, recv, &services).await {
                    error!(error = %e, "CSI stream handler error");
                }
            });
        }
    }

    /// Process a single bi-stream: read request → dispatch → write response.
    #[instrument(skip_all)]
    async fn handle_stream(
        mut send: quinn::SendStream,
        mut recv: quinn::RecvStream,
        services: &Services,
    ) -> Result<(), CsiError> {
        let buf = recv
            .read_to_end(MAX_REQUEST_SIZE)
            .await
            .map_err(CsiError::transport)?;

        let request: CsiMessage = serde_json::from_slice(&buf)
            .map_err(|e| CsiError::TransportError(format!("malformed request: {e}")))?;

        debug!(%request, "CSI request received");

        let response = dispatch(services, request).await;
        if let CsiMessage::Error(e) = &response {
            debug!(error = %e, code = ?e.code(), "CSI request failed");
        }

        let payload = serde_json::to_vec(&response).map_err(CsiError::internal)?;
        send.write_all(&payload)
            .await
            .map_err(CsiError::transport)?;
        send.finish().map_err(CsiError::transport)?;
        Ok(())
    }

    /// The local address the endpoint is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, CsiError> {
        self.endpoint.local_addr().map_err(CsiError::transport)
    }

    /// Stop accepting connections and close existing ones, which makes
    /// [`Self::serve`] return.
    pub fn close(&self) {
        self.endpoint
            .close(quinn::VarInt::from_u32(0), b"server shutdown");
    }
}

fn reply<T>(result: Result<T, CsiError>, ok: impl FnOnce(T) -> CsiMessage) -> CsiMessage {
    match result {
        Ok(v) => ok(v),
        Err(e) => CsiMessage::Error(e),
    }
}

fn disabled(service: &str) -> CsiMessage {
    CsiMessage::Error(CsiError::InvalidArgument(format!(
        "{service} service not enabled"
    )))
}

/// Map a [`CsiMessage`] request to the correct trait method call and wrap
/// the result in a response [`CsiMessage`].
pub async fn dispatch(services: &Services, request: CsiMessage) -> CsiMessage {
    match request {
        // --- Identity -------------------------------------------------------
        CsiMessage::Probe => reply(services.identity.probe().await, CsiMessage::ProbeResult),
        CsiMessage::GetPluginInfo => reply(
            services.identity.get_plugin_info().await,
            CsiMessage::PluginInfoResponse,
        ),
        CsiMessage::GetPluginCapabilities => reply(
            services.identity.get_plugin_capabilities().await,
            CsiMessage::PluginCapabilitiesResponse,
        ),

        // --- Controller -----------------------------------------------------
        CsiMessage::CreateVolume(req) => match &services.controller {
            Some(c) => reply(c.create_volume(req).await, CsiMessage::VolumeCreated),
            None => disabled("controller"),
        },
        CsiMessage::DeleteVolume(id) => match &services.controller {
            Some(c) => reply(c.delete_volume(&id).await, |()| CsiMessage::Ok),
            None => disabled("controller"),
        },
        CsiMessage::ValidateVolumeCapabilities {
            volume_id,
            capabilities,
        } => match &services.controller {
            Some(c) => reply(
                c.validate_volume_capabilities(&volume_id, &capabilities)
                    .await,
                CsiMessage::CapabilitiesValid,
            ),
            None => disabled("controller"),
        },

        // --- Node -----------------------------------------------------------
        CsiMessage::StageVolume(req) => match &services.node {
            Some(n) => reply(n.stage_volume(req).await, |()| CsiMessage::Ok),
            None => disabled("node"),
        },
        CsiMessage::UnstageVolume {
            volume_id,
            staging_target_path,
        } => match &services.node {
            Some(n) => reply(
                n.unstage_volume(&volume_id, &staging_target_path).await,
                |()| CsiMessage::Ok,
            ),
            None => disabled("node"),
        },
        CsiMessage::PublishVolume(req) => match &services.node {
            Some(n) => reply(n.publish_volume(req).await, |()| CsiMessage::Ok),
            None => disabled("node"),
        },
        CsiMessage::UnpublishVolume {
            volume_id,
            target_path,
        } => match &services.node {
            Some(n) => reply(
                n.unpublish_volume(&volume_id, &target_path).await,
                |()| CsiMessage::Ok,
            ),
            None => disabled("node"),
        },
        CsiMessage::GetNodeInfo => match &services.node {
            Some(n) => reply(n.get_info().await, CsiMessage::NodeInfoResponse),
            None => disabled("node"),
        },
        CsiMessage::GetNodeCapabilities => match &services.node {
            Some(n) => reply(
                n.get_capabilities().await,
                CsiMessage::NodeCapabilitiesResponse,
            ),
            None => disabled("node"),
        },

        // --- Response variants should never arrive as requests --------------
        other => {
            warn!(msg = %other, "unexpected message variant received as request");
            CsiMessage::Error(CsiError::InvalidArgument(format!(
                "unexpected message: {other}"
            )))
        }
    }
}
