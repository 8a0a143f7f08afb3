//! Unified error type for all imageio operations.
//!
//! Every layer (backends, ticket store, handlers, client) reports errors
//! through this enum. The daemon maps variants to HTTP status codes with
//! [`Error::http_status`]; the client maps origin status codes back to the
//! matching variants.

use thiserror::Error;

/// Unified error type.
#[derive(Debug, Error)]
pub enum Error {
    /// Ticket absent, canceled, or expired, or the verb is not allowed.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Requested byte range is outside `[0, size)`.
    #[error("requested range not satisfiable for image size {size}")]
    RangeNotSatisfiable { size: u64 },

    /// Malformed header, JSON body, or query parameter.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Verb not supported for the resource.
    #[error("method not allowed: {0}")]
    MethodNotAllowed(String),

    /// Unknown sub-resource, or dirty extents without a bitmap.
    #[error("not found: {0}")]
    NotFound(String),

    /// Backend lacks the requested capability.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Resource exists with incompatible attributes.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Body ended before the declared size was transferred.
    #[error("partial content: expected {expected} bytes, got {actual}")]
    PartialContent { expected: u64, actual: u64 },

    /// Operation aborted by ticket cancellation.
    #[error("operation canceled")]
    Canceled,

    /// Uncaught backend or system failure.
    #[error("internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The HTTP status code reported to clients for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::Forbidden(_) => 403,
            Error::RangeNotSatisfiable { .. } => 416,
            Error::BadRequest(_) => 400,
            Error::MethodNotAllowed(_) => 405,
            Error::NotFound(_) => 404,
            Error::NotSupported(_) => 405,
            Error::Conflict(_) => 409,
            Error::PartialContent { .. } => 400,
            Error::Canceled => 500,
            Error::Internal(_) | Error::Io(_) => 500,
        }
    }

    /// Map an origin server status code to the matching error, used by the
    /// http backend and the client library.
    pub fn from_http_status(status: u16, reason: String) -> Self {
        match status {
            400 => Error::BadRequest(reason),
            403 => Error::Forbidden(reason),
            404 => Error::NotFound(reason),
            405 => Error::MethodNotAllowed(reason),
            409 => Error::Conflict(reason),
            416 => Error::RangeNotSatisfiable { size: 0 },
            _ => Error::Internal(reason),
        }
    }
}

/// Result type alias for imageio operations.
pub type ImageResult<T> = Result<T, Error>;
