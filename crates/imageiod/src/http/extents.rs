//! Handler for the `/images/{ticket}/extents` resource.

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tracing::info;

use imageio_proto::{Error, Verb};

use crate::http::{require_ticket_id, ticket_backend, ApiError, ApiResult, AppState};

#[derive(Debug, Default, Deserialize)]
pub struct ExtentsQuery {
    context: Option<String>,
}

/// GET /images/{ticket}/extents?context=zero|dirty
pub async fn get(
    State(state): State<AppState>,
    Path(ticket_id): Path<String>,
    Query(query): Query<ExtentsQuery>,
) -> ApiResult<Response> {
    let ticket_id = require_ticket_id(&ticket_id)?;

    let dirty = match query.context.as_deref() {
        None | Some("zero") => false,
        Some("dirty") => true,
        Some(other) => {
            return Err(ApiError(Error::BadRequest(format!(
                "invalid context {other:?}, expecting zero or dirty"
            ))));
        }
    };

    let ticket = state
        .auth
        .get(ticket_id)
        .map_err(|_| Error::Forbidden(format!("no such ticket {ticket_id:?}")))?;

    if dirty && !ticket.spec().dirty {
        return Err(ApiError(Error::NotFound(
            "ticket does not support dirty extents".into(),
        )));
    }

    let lease = state.auth.authorize(ticket_id, Verb::Read, 0, 0)?;
    let backend = ticket_backend(&state, lease.ticket()).await?;

    info!(
        "EXTENTS transfer={} context={}",
        ticket.transfer_label(),
        if dirty { "dirty" } else { "zero" }
    );

    // A backend without the requested extent source is an absent
    // sub-resource, not a protocol error.
    let not_found = |e: Error| match e {
        Error::NotSupported(msg) => Error::NotFound(msg),
        e => e,
    };

    let response = if dirty {
        let extents = backend.extents_dirty().await.map_err(not_found)?;
        Json(extents).into_response()
    } else {
        let extents = backend.extents_zero().await.map_err(not_found)?;
        Json(extents).into_response()
    };
    lease.release();
    Ok(response)
}
