//! TLS remote listener.
//!
//! Accepted TCP connections are wrapped by a rustls acceptor and served
//! with hyper's auto connection builder, one task per connection. Clients
//! are not authenticated by certificate; authorization is by ticket id.

use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use imageio_proto::{Error, ImageResult};

/// Build the rustls server configuration from PEM cert and key files.
pub fn server_config(
    cert_file: &Path,
    key_file: &Path,
    enable_tls1_1: bool,
) -> ImageResult<Arc<ServerConfig>> {
    if enable_tls1_1 {
        // rustls implements TLSv1.2 and TLSv1.3 only.
        warn!("TLSv1.1 requested but the TLS backend supports TLSv1.2 and newer");
    }

    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_file)?))
        .collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(Error::Internal(format!(
            "no certificates found in {cert_file:?}"
        )));
    }
    let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_file)?))?
        .ok_or_else(|| Error::Internal(format!("no private key found in {key_file:?}")))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Internal(format!("invalid TLS configuration: {e}")))?;
    Ok(Arc::new(config))
}

/// Accept loop for the remote TLS listener.
pub async fn serve(
    addr: SocketAddr,
    router: Router,
    tls: Arc<ServerConfig>,
    shutdown: Arc<Notify>,
) -> ImageResult<()> {
    let listener = TcpListener::bind(addr).await?;
    let acceptor = TlsAcceptor::from(tls);
    info!("remote listener on https://{}", addr);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        stream.set_nodelay(true).ok();
                        let acceptor = acceptor.clone();
                        let router = router.clone();
                        tokio::spawn(async move {
                            serve_connection(stream, peer, acceptor, router).await;
                        });
                    }
                    Err(e) => {
                        error!("accept error: {}", e);
                    }
                }
            }
            _ = shutdown.notified() => {
                info!("remote listener shutting down");
                return Ok(());
            }
        }
    }
}

/// Bound on the TLS handshake so half-open clients cannot pin a task.
const HANDSHAKE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

async fn serve_connection(
    stream: tokio::net::TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    router: Router,
) {
    let tls_stream = match tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!("TLS handshake with {} failed: {}", peer, e);
            return;
        }
        Err(_) => {
            debug!("TLS handshake with {} timed out", peer);
            return;
        }
    };

    let service = TowerToHyperService::new(router);
    if let Err(e) = auto::Builder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(TokioIo::new(tls_stream), service)
        .await
    {
        debug!("connection from {} ended: {}", peer, e);
    }
}
