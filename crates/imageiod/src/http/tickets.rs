//! Control-plane handlers for the `/tickets` resource.

use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tracing::info;

use imageio_proto::{Error, TicketSpec};

use crate::http::{require_ticket_id, ApiError, ApiResult, AppState};

/// PUT /tickets/{id} — install or replace a ticket.
pub async fn put(
    State(state): State<AppState>,
    Path(ticket_id): Path<String>,
    body: Bytes,
) -> ApiResult<Response> {
    let ticket_id = require_ticket_id(&ticket_id)?;

    let spec: TicketSpec = serde_json::from_slice(&body)
        .map_err(|e| ApiError(Error::BadRequest(format!("invalid ticket: {e}"))))?;

    if spec.uuid != ticket_id {
        return Err(ApiError(Error::BadRequest(format!(
            "ticket uuid {:?} does not match resource {:?}",
            spec.uuid, ticket_id
        ))));
    }

    info!("ADD transfer={}", spec.transfer_label());
    state.auth.add(spec)?;
    Ok(StatusCode::OK.into_response())
}

/// GET /tickets/{id} — status snapshot.
pub async fn get(
    State(state): State<AppState>,
    Path(ticket_id): Path<String>,
) -> ApiResult<Response> {
    let ticket_id = require_ticket_id(&ticket_id)?;
    let ticket = state.auth.get(ticket_id)?;
    Ok(Json(ticket.info()).into_response())
}

#[derive(Debug, Deserialize)]
struct ExtendPatch {
    timeout: u64,
}

/// PATCH /tickets/{id} — extend or expire.
pub async fn patch(
    State(state): State<AppState>,
    Path(ticket_id): Path<String>,
    body: Bytes,
) -> ApiResult<Response> {
    let ticket_id = require_ticket_id(&ticket_id)?;

    let patch: ExtendPatch = serde_json::from_slice(&body)
        .map_err(|e| ApiError(Error::BadRequest(format!("invalid patch: {e}"))))?;

    // 404 for a missing ticket, unlike the data plane's 403.
    let ticket = state.auth.get(ticket_id)?;
    info!(
        "EXTEND timeout={} transfer={}",
        patch.timeout,
        ticket.transfer_label()
    );
    state.auth.extend(ticket_id, patch.timeout)?;
    Ok(StatusCode::OK.into_response())
}

#[derive(Debug, Default, Deserialize)]
pub struct DeleteQuery {
    timeout: Option<u64>,
}

/// DELETE /tickets/{id}[?timeout=N] — cancel and remove.
///
/// The default waits for the ticket to quiesce; a positive timeout forces
/// removal at the deadline, disconnecting live transfers. DELETE is
/// idempotent so clients can retry over network failures.
pub async fn delete(
    State(state): State<AppState>,
    Path(ticket_id): Path<String>,
    Query(query): Query<DeleteQuery>,
) -> ApiResult<Response> {
    let ticket_id = require_ticket_id(&ticket_id)?;

    match state.auth.get(ticket_id) {
        Ok(ticket) => info!("REMOVE transfer={}", ticket.transfer_label()),
        Err(_) => info!("REMOVE transfer=(deleted)"),
    }

    let timeout = Duration::from_secs(query.timeout.unwrap_or(0));
    state.auth.cancel(ticket_id, timeout).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// GET /tickets — list installed ticket ids.
pub async fn list(State(state): State<AppState>) -> ApiResult<Response> {
    let mut ids = state.auth.ids();
    ids.sort();
    Ok(Json(ids).into_response())
}

/// DELETE /tickets — remove all tickets, forcing after a short grace.
pub async fn clear(State(state): State<AppState>) -> ApiResult<Response> {
    info!("REMOVE all tickets");
    state.auth.clear(Duration::from_secs(1)).await;
    Ok(StatusCode::NO_CONTENT.into_response())
}
