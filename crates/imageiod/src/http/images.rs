//! Handlers for the `/images/{ticket}` resource.

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use imageio_proto::{Error, ImageResult, Verb};

use crate::http::range::{content_range, parse_content_range, parse_range};
use crate::http::{require_ticket_id, ticket_backend, ApiError, ApiResult, AppState};
use crate::ops;

#[derive(Debug, Default, Deserialize)]
pub struct DataQuery {
    flush: Option<String>,
    close: Option<String>,
}

impl DataQuery {
    /// `flush=y|n`, defaulting to flush for backward compatibility.
    fn flush(&self) -> ImageResult<bool> {
        match self.flush.as_deref() {
            None | Some("y") => Ok(true),
            Some("n") => Ok(false),
            Some(other) => Err(Error::BadRequest(format!(
                "invalid flush value {other:?}, expecting y or n"
            ))),
        }
    }

    /// `close=y` asks the server to close the connection when done; used
    /// by browser clients to end keep-alive sessions.
    fn close(&self) -> bool {
        self.close.as_deref() == Some("y")
    }
}

/// GET /images/{ticket} — stream image bytes.
pub async fn get(
    State(state): State<AppState>,
    Path(ticket_id): Path<String>,
    Query(query): Query<DataQuery>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let ticket_id = require_ticket_id(&ticket_id)?;

    let ticket = state
        .auth
        .get(ticket_id)
        .map_err(|_| Error::Forbidden(format!("no such ticket {ticket_id:?}")))?;
    let ticket_size = ticket.size();

    let range = match headers.get(header::RANGE) {
        Some(value) => {
            let value = value
                .to_str()
                .map_err(|_| ApiError(Error::BadRequest("invalid range header".into())))?;
            Some(parse_range(value, ticket_size)?)
        }
        None => None,
    };

    // A missing upper bound reads through the end of the image.
    let (offset, mut length) = match &range {
        Some(r) => {
            let last = r.last.unwrap_or(ticket_size.saturating_sub(1));
            if r.first >= ticket_size || last >= ticket_size {
                return Err(ApiError(Error::RangeNotSatisfiable { size: ticket_size }));
            }
            (r.first, last - r.first + 1)
        }
        None => (0, ticket_size),
    };

    let lease = state.auth.authorize(ticket_id, Verb::Read, offset, length)?;
    let backend = ticket_backend(&state, lease.ticket()).await?;

    // The image file may be smaller than the ticket claims.
    if range.is_some() {
        if offset + length > backend.size() {
            return Err(ApiError(Error::RangeNotSatisfiable {
                size: backend.size(),
            }));
        }
    } else {
        length = length.min(backend.size().saturating_sub(offset));
    }

    debug!(
        "READ size={} offset={} close={} transfer={}",
        length,
        offset,
        query.close(),
        lease.ticket().transfer_label()
    );

    let mut disposition = String::from("attachment");
    if let Some(filename) = &lease.ticket().spec().filename {
        disposition = format!("attachment; filename={filename}");
    }

    // The spawned task owns the lease for the whole stream; the operation
    // stays registered until the last chunk is sent or the client goes
    // away. A mid-stream backend error aborts the connection instead of
    // padding the body.
    let (tx, rx) = mpsc::channel::<ImageResult<Bytes>>(4);
    let chunk_size = state.cfg.daemon.buffer_size;
    tokio::spawn(async move {
        if let Err(e) = ops::read(backend.as_ref(), &lease, offset, length, chunk_size, &tx).await
        {
            if !matches!(e, Error::Canceled) {
                warn!(
                    "READ failed offset={} transfer={}: {}",
                    offset,
                    lease.ticket().transfer_label(),
                    e
                );
            }
            let _ = tx.try_send(Err(e));
        }
    });

    let stream =
        futures_util::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|i| (i, rx)) });

    let mut builder = Response::builder()
        .status(if range.is_some() {
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::OK
        })
        .header(header::CONTENT_LENGTH, length)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(header::CONTENT_DISPOSITION, disposition);
    if range.is_some() {
        builder = builder.header(header::CONTENT_RANGE, content_range(offset, length));
    }
    if query.close() {
        builder = builder.header(header::CONNECTION, "close");
    }
    Ok(builder.body(Body::from_stream(stream)).unwrap())
}

/// PUT /images/{ticket} — write a byte range from the request body.
pub async fn put(
    State(state): State<AppState>,
    Path(ticket_id): Path<String>,
    Query(query): Query<DataQuery>,
    headers: HeaderMap,
    body: Body,
) -> ApiResult<Response> {
    let ticket_id = require_ticket_id(&ticket_id)?;

    let size: u64 = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| ApiError(Error::BadRequest("Content-Length header is required".into())))?;

    let offset = match headers.get(header::CONTENT_RANGE) {
        Some(value) => {
            let value = value.to_str().map_err(|_| {
                ApiError(Error::BadRequest("invalid content-range header".into()))
            })?;
            parse_content_range(value)?
        }
        None => 0,
    };

    let flush = query.flush()?;
    let lease = state.auth.authorize(ticket_id, Verb::Write, offset, size)?;
    let backend = ticket_backend(&state, lease.ticket()).await?;

    debug!(
        "WRITE size={} offset={} flush={} close={} transfer={}",
        size,
        offset,
        flush,
        query.close(),
        lease.ticket().transfer_label()
    );

    let mut stream = body.into_data_stream();
    ops::write(
        backend.as_ref(),
        &lease,
        offset,
        size,
        flush,
        state.cfg.daemon.buffer_size,
        &mut stream,
    )
    .await?;
    lease.release();

    let mut response = StatusCode::OK.into_response();
    if query.close() {
        response
            .headers_mut()
            .insert(header::CONNECTION, "close".parse().unwrap());
    }
    Ok(response)
}

/// PATCH body. Unknown `op` values fail to parse and map to 400.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum PatchMsg {
    Zero {
        size: u64,
        #[serde(default)]
        offset: u64,
        #[serde(default)]
        flush: bool,
    },
    Flush {},
}

/// PATCH /images/{ticket} — zero a range or flush the image.
pub async fn patch(
    State(state): State<AppState>,
    Path(ticket_id): Path<String>,
    body: Bytes,
) -> ApiResult<Response> {
    let ticket_id = require_ticket_id(&ticket_id)?;

    let msg: PatchMsg = serde_json::from_slice(&body)
        .map_err(|e| ApiError(Error::BadRequest(format!("invalid JSON message: {e}"))))?;

    match msg {
        PatchMsg::Zero { size, offset, flush } => {
            let lease = state.auth.authorize(ticket_id, Verb::Write, offset, size)?;
            let backend = ticket_backend(&state, lease.ticket()).await?;

            debug!(
                "ZERO size={} offset={} flush={} transfer={}",
                size,
                offset,
                flush,
                lease.ticket().transfer_label()
            );

            // Deallocate only when the ticket asked for a sparse image.
            let punch_hole = lease.ticket().spec().sparse;
            ops::zero(backend.as_ref(), &lease, offset, size, flush, punch_hole).await?;
            lease.release();
        }
        PatchMsg::Flush {} => {
            let lease = state.auth.authorize(ticket_id, Verb::Write, 0, 0)?;
            let backend = ticket_backend(&state, lease.ticket()).await?;

            info!("FLUSH transfer={}", lease.ticket().transfer_label());
            ops::flush(backend.as_ref()).await?;
            lease.release();
        }
    }

    Ok(StatusCode::OK.into_response())
}

/// OPTIONS /images/{ticket} — report capabilities.
///
/// The literal `*` id reports the server wide capability set and is
/// served on the control listener only, keeping capability probing off
/// the remote surface.
pub async fn options(
    State(state): State<AppState>,
    Path(ticket_id): Path<String>,
) -> ApiResult<Response> {
    let ticket_id = require_ticket_id(&ticket_id)?;

    let mut options = json!({});
    if state.cfg.local.enable {
        options["unix_socket"] = json!(state.cfg.local.socket);
    }

    let allow: Vec<&str>;
    if ticket_id == "*" {
        if !state.control {
            return Err(ApiError(Error::Forbidden(
                "no such ticket \"*\"".into(),
            )));
        }
        info!("OPTIONS transfer=*");
        allow = vec!["OPTIONS", "GET", "PUT", "PATCH"];
        options["features"] = json!(["extents", "zero", "flush"]);
    } else {
        let ticket = state
            .auth
            .get(ticket_id)
            .map_err(|_| Error::Forbidden(format!("no such ticket {ticket_id:?}")))?;

        let lease = state.auth.authorize(ticket_id, Verb::Read, 0, 0)?;
        let backend = ticket_backend(&state, lease.ticket()).await?;

        info!("OPTIONS transfer={}", ticket.transfer_label());

        // Probing capabilities counts as client activity.
        ticket.touch();

        let mut features: Vec<&str> = Vec::new();
        if backend.supports_extents() {
            features.push("extents");
        }
        if ticket.spec().may(Verb::Write) {
            if backend.supports_zero() {
                features.push("zero");
            }
            if backend.supports_flush() {
                features.push("flush");
            }
            allow = vec!["OPTIONS", "GET", "PUT", "PATCH"];
        } else {
            allow = vec!["OPTIONS", "GET"];
        }

        options["features"] = json!(features);
        options["max_readers"] = json!(backend.max_readers());
        options["max_writers"] = json!(backend.max_writers());
        lease.release();
    }

    let mut response = Json(options).into_response();
    response
        .headers_mut()
        .insert(header::ALLOW, allow.join(",").parse().unwrap());
    Ok(response)
}
