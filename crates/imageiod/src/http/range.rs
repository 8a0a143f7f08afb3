//! Range and Content-Range header math.
//!
//! Only a single closed range is supported. Multi-range and the
//! suffix-byte-range form are rejected with 416, malformed headers with
//! 400. On PUT only the START of Content-Range is used; the length comes
//! from Content-Length.

use imageio_proto::{Error, ImageResult};

/// Parsed `Range: bytes=START-[END]`, END inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeSpec {
    pub first: u64,
    pub last: Option<u64>,
}

pub fn parse_range(header: &str, size: u64) -> ImageResult<RangeSpec> {
    let spec = header
        .strip_prefix("bytes=")
        .ok_or_else(|| Error::BadRequest(format!("invalid range unit: {header:?}")))?;

    if spec.contains(',') {
        return Err(Error::RangeNotSatisfiable { size });
    }

    let (first, last) = spec
        .split_once('-')
        .ok_or_else(|| Error::BadRequest(format!("invalid range: {header:?}")))?;

    if first.is_empty() {
        // suffix-byte-range-spec "bytes=-N" is not supported.
        return Err(Error::RangeNotSatisfiable { size });
    }

    let first: u64 = first
        .parse()
        .map_err(|_| Error::BadRequest(format!("invalid range start: {header:?}")))?;

    let last: Option<u64> = if last.is_empty() {
        None
    } else {
        let last = last
            .parse()
            .map_err(|_| Error::BadRequest(format!("invalid range end: {header:?}")))?;
        if last < first {
            return Err(Error::BadRequest(format!("invalid range: {header:?}")));
        }
        Some(last)
    };

    Ok(RangeSpec { first, last })
}

/// Parsed `Content-Range: bytes START-END/*`; only START is used.
pub fn parse_content_range(header: &str) -> ImageResult<u64> {
    let spec = header
        .strip_prefix("bytes ")
        .ok_or_else(|| Error::BadRequest(format!("invalid content-range unit: {header:?}")))?;
    let (first, _) = spec
        .split_once('-')
        .ok_or_else(|| Error::BadRequest(format!("invalid content-range: {header:?}")))?;
    first
        .parse()
        .map_err(|_| Error::BadRequest(format!("invalid content-range start: {header:?}")))
}

/// `Content-Range` value for a 206 response.
pub fn content_range(offset: u64, length: u64) -> String {
    format!("bytes {}-{}/*", offset, offset + length - 1)
}

/// `Content-Range` value for a 416 response, reporting the image size.
pub fn unsatisfiable_range(size: u64) -> String {
    format!("bytes */{size}")
}
