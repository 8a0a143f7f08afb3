//! Image backends.
//!
//! A backend abstracts one disk image behind the capability set
//! {size, read_at, write_at, zero, flush, extents}. Concrete backends must
//! support concurrent calls with distinct non-overlapping byte ranges;
//! advisory `max_readers`/`max_writers` tell clients how far to push.

pub mod file;
pub mod http;
pub mod memory;
pub mod nbd;

use std::sync::Arc;

use async_trait::async_trait;

use imageio_proto::{DirtyExtent, Error, Extent, ImageResult};

/// Options controlling how a backend is opened, derived from the ticket
/// and the daemon configuration.
#[derive(Debug, Clone)]
pub struct BackendOptions {
    pub writable: bool,
    pub sparse: bool,
    pub dirty: bool,
    /// Upper bound on per-backend connections; caps max_readers/max_writers.
    pub max_connections: u32,
    /// Transfer buffer size; the largest read_at/write_at request.
    pub buffer_size: usize,
    /// Image size claimed by the ticket; the http backend cannot ask the
    /// origin cheaply, the others ignore it.
    pub size_hint: u64,
    /// Skip TLS verification when proxying to the origin.
    pub insecure_tls: bool,
}

/// Capability-oriented image access.
#[async_trait]
pub trait Backend: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Virtual image size in bytes.
    fn size(&self) -> u64;

    /// Logical block size for direct I/O alignment; 1 when unconstrained.
    fn block_size(&self) -> usize;

    fn max_readers(&self) -> u32;

    fn max_writers(&self) -> u32;

    fn supports_extents(&self) -> bool {
        true
    }

    fn supports_zero(&self) -> bool {
        true
    }

    fn supports_flush(&self) -> bool {
        true
    }

    /// Fill `buf` from `offset`. Fails when the range exceeds the image.
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> ImageResult<()>;

    /// Write `buf` at `offset`; with `flush` the data is durable on return.
    async fn write_at(&self, buf: &[u8], offset: u64, flush: bool) -> ImageResult<()>;

    /// Ensure the range reads as zeroes. With `punch_hole` deallocate when
    /// supported, otherwise allocation is fine.
    async fn zero(&self, offset: u64, length: u64, flush: bool, punch_hole: bool)
        -> ImageResult<()>;

    /// Durably persist prior writes.
    async fn flush(&self) -> ImageResult<()>;

    /// Merged content/allocation extents covering `[0, size)` ascending.
    async fn extents_zero(&self) -> ImageResult<Vec<Extent>>;

    /// Merged dirty extents; fails with `NotSupported` without a bitmap.
    async fn extents_dirty(&self) -> ImageResult<Vec<DirtyExtent>> {
        Err(Error::NotSupported(format!(
            "backend {} does not support dirty extents",
            self.name()
        )))
    }

    /// Release resources. Called when the owning ticket is removed.
    async fn close(&self) -> ImageResult<()>;
}

/// Open the backend for a ticket URL, dispatching on the scheme.
pub async fn open(url: &str, opts: &BackendOptions) -> ImageResult<Arc<dyn Backend>> {
    let scheme = url.split_once(':').map(|(s, _)| s).unwrap_or("");
    match scheme {
        "file" => {
            let path = url
                .strip_prefix("file://")
                .filter(|p| p.starts_with('/'))
                .ok_or_else(|| {
                    Error::BadRequest(format!("file url must be absolute: {url:?}"))
                })?;
            let backend = file::FileBackend::open(path.as_ref(), opts).await?;
            Ok(Arc::new(backend))
        }
        "nbd" | "nbd+unix" => {
            let backend = nbd::NbdBackend::open(url, opts).await?;
            Ok(Arc::new(backend))
        }
        "https" | "http" => {
            let backend = http::HttpBackend::open(url, opts).await?;
            Ok(Arc::new(backend))
        }
        _ => Err(Error::BadRequest(format!(
            "unsupported backend url {url:?}"
        ))),
    }
}
