//! HTTP server frame.
//!
//! Three listeners share the handler code:
//! - remote: TLS TCP, data routes only;
//! - local: unix socket (abstract namespace supported), data routes only;
//! - control: unix socket or TCP loopback, data routes plus the ticket
//!   resource and the `*` OPTIONS wildcard.

pub mod extents;
pub mod images;
pub mod range;
pub mod tickets;

#[cfg(test)]
mod tests;

use std::os::linux::net::SocketAddrExt;
use std::sync::Arc;

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use tracing::{info, warn};

use imageio_proto::{Error, ImageResult, Verb};

use crate::auth::{Authorizer, Ticket};
use crate::backend::{self, Backend, BackendOptions};
use crate::config::Config;
use crate::http::range::unsatisfiable_range;

#[derive(Clone)]
pub struct AppState {
    pub auth: Arc<Authorizer>,
    pub cfg: Arc<Config>,
    /// Control listeners may use the `*` OPTIONS wildcard and the ticket
    /// resource; data listeners may not.
    pub control: bool,
}

/// Router for the remote and local data listeners.
pub fn data_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/images/{ticket}",
            get(images::get)
                .put(images::put)
                .patch(images::patch)
                .options(images::options),
        )
        .route("/images/{ticket}/extents", get(extents::get))
        .with_state(state)
}

/// Router for the control listener: data routes plus ticket CRUD.
pub fn control_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/images/{ticket}",
            get(images::get)
                .put(images::put)
                .patch(images::patch)
                .options(images::options),
        )
        .route("/images/{ticket}/extents", get(extents::get))
        .route(
            "/tickets/{ticket}",
            get(tickets::get)
                .put(tickets::put)
                .patch(tickets::patch)
                .delete(tickets::delete),
        )
        .route("/tickets", get(tickets::list).delete(tickets::clear))
        .with_state(state)
}

/// Error wrapper mapping [`Error`] to the protocol's status codes.
///
/// The response body is a short human readable reason; backend errors are
/// logged with context and never leak details to the client.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            warn!("request failed: {}", self.0);
        }

        let mut response = match &self.0 {
            Error::RangeNotSatisfiable { size } => (
                status,
                [(header::CONTENT_RANGE, unsatisfiable_range(*size))],
                self.0.to_string(),
            )
                .into_response(),
            Error::Internal(_) | Error::Io(_) => {
                // Do not leak internal details.
                (status, "internal server error".to_string()).into_response()
            }
            _ => (status, self.0.to_string()).into_response(),
        };

        // A failed request mid-protocol leaves the connection in an
        // undefined state.
        if status.is_server_error() || status == StatusCode::FORBIDDEN {
            response
                .headers_mut()
                .insert(header::CONNECTION, "close".parse().unwrap());
        }
        response
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// The backend serving a ticket, opened on first use and cached on the
/// ticket for its lifetime.
pub async fn ticket_backend(
    state: &AppState,
    ticket: &Arc<Ticket>,
) -> ImageResult<Arc<dyn Backend>> {
    let mut slot = ticket.backend_slot().await;
    if let Some(backend) = slot.as_ref() {
        return Ok(Arc::clone(backend));
    }

    let spec = ticket.spec();
    let opts = BackendOptions {
        writable: spec.may(Verb::Write),
        sparse: spec.sparse,
        dirty: spec.dirty,
        max_connections: state.cfg.daemon.max_connections,
        buffer_size: state.cfg.daemon.buffer_size,
        size_hint: spec.size,
        insecure_tls: state.cfg.tls.insecure_proxy,
    };
    let backend = backend::open(&spec.url, &opts).await?;
    info!(
        "opened {} backend for transfer {}",
        backend.name(),
        ticket.transfer_label()
    );
    *slot = Some(Arc::clone(&backend));
    Ok(backend)
}

/// Serve a listener bound to a unix socket path. A leading `@` selects the
/// abstract namespace.
pub async fn serve_unix(
    path: &str,
    router: Router,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> ImageResult<()> {
    let std_listener = if let Some(name) = path.strip_prefix('@') {
        let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())?;
        std::os::unix::net::UnixListener::bind_addr(&addr)?
    } else {
        // Remove a stale socket from a previous run.
        let _ = std::fs::remove_file(path);
        std::os::unix::net::UnixListener::bind(path)?
    };
    std_listener.set_nonblocking(true)?;
    let listener = tokio::net::UnixListener::from_std(std_listener)?;

    info!("listening on unix socket {:?}", path);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Serve a plain TCP listener (control plane on loopback).
pub async fn serve_tcp(
    addr: std::net::SocketAddr,
    router: Router,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> ImageResult<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on {}", addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

/// Reject empty ticket ids before touching the store.
pub fn require_ticket_id(ticket_id: &str) -> Result<&str, ApiError> {
    if ticket_id.is_empty() {
        return Err(ApiError(Error::BadRequest("ticket id is required".into())));
    }
    Ok(ticket_id)
}
