mod args;

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use libcsi::backend::{DriverIdentity, HostPathBackend, PassThroughController};
use libcsi::transport::{CsiServer, Services};
use libcsi::{CsiController, CsiNode};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::args::Args;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);
    run(args).await
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = result {
        eprintln!("failed to initialize tracing: {e}");
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    if args.node.is_none() && !args.controller {
        bail!("nothing to serve: pass --node <NODE_ID>, --controller, or both");
    }

    let tls = load_tls(&args.tls_cert, &args.tls_key)?;

    let node = match args.node_config() {
        Some(config) => {
            let backend = HostPathBackend::open(&config)
                .await
                .with_context(|| format!("failed to open state {}", config.state_file.display()))?;
            let activated = backend.reconcile().await;
            info!(node_id = %config.node_id, activated, "node service ready");
            Some(Arc::new(backend))
        }
        None => None,
    };

    let services = Services {
        identity: Arc::new(DriverIdentity::new(args.controller)),
        controller: args.controller.then(|| {
            Arc::new(PassThroughController::new(args.allow_writer_access)) as Arc<dyn CsiController>
        }),
        node: node.clone().map(|backend| backend as Arc<dyn CsiNode>),
    };

    let server = Arc::new(
        CsiServer::new(args.endpoint, tls, services).context("failed to start CSI server")?,
    );
    let serving = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.serve().await }
    });

    shutdown_signal().await?;

    server.close();
    match serving.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "CSI server stopped with error"),
        Err(e) => warn!(error = %e, "CSI server task failed"),
    }

    if let Some(backend) = node {
        backend.drain().await;
    }
    info!("ucsi stopped");
    Ok(())
}

async fn shutdown_signal() -> anyhow::Result<()> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        _ = sigint.recv() => info!("received SIGINT, shutting down"),
    }
    Ok(())
}

/// Build the QUIC server TLS configuration from PEM files.
fn load_tls(cert: &Path, key: &Path) -> anyhow::Result<rustls::ServerConfig> {
    let certs = CertificateDer::pem_file_iter(cert)
        .and_then(|iter| iter.collect::<Result<Vec<_>, _>>())
        .with_context(|| format!("failed to read certificates from {}", cert.display()))?;
    if certs.is_empty() {
        bail!("no certificate found in {}", cert.display());
    }
    let key = PrivateKeyDer::from_pem_file(key)
        .with_context(|| format!("failed to read private key from {}", key.display()))?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .context("TLS 1.3 unsupported by crypto provider")?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid TLS certificate or key")
}
