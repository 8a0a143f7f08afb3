//! NBD backend.
//!
//! Serves a ticket whose URL points at an NBD export, usually a qemu or
//! qemu-nbd process colocated with the disk. I/O runs over a pool of NBD
//! connections sized by the configured cap; the pool shrinks to one
//! connection when the server does not advertise multi-conn consistency.
//! Requests larger than the NBD hard limit are chunked.

use async_trait::async_trait;
use tracing::debug;

use imageio_nbd::{Client, NbdUrl, Pool};
use imageio_proto::defaults::MAX_NBD_REQUEST;
use imageio_proto::extent::{coalesce, coalesce_dirty};
use imageio_proto::{DirtyExtent, Error, Extent, ImageResult};

use crate::backend::{Backend, BackendOptions};

pub struct NbdBackend {
    export: String,
    dirty: bool,
    writable: bool,
    export_size: u64,
    block_size: usize,
    max_connections: u32,
    can_zero: bool,
    can_flush: bool,
    has_base_allocation: bool,
    has_dirty_bitmap: bool,
    pool: Pool,
}

impl std::fmt::Debug for NbdBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NbdBackend").field("export", &self.export).finish()
    }
}

impl NbdBackend {
    pub async fn open(url: &str, opts: &BackendOptions) -> ImageResult<NbdBackend> {
        let url = NbdUrl::parse(url)?;
        let probe = Client::connect(&url, opts.dirty).await?;

        if opts.writable && probe.is_read_only() {
            return Err(Error::NotSupported(format!(
                "NBD export {:?} is read only",
                url.export
            )));
        }

        // Without multi-conn the server gives no flush consistency across
        // connections, so all requests share one.
        let max_connections = if probe.can_multi_conn() {
            opts.max_connections.max(1)
        } else {
            1
        };

        debug!(
            "open {} size={} connections={} dirty={}",
            url,
            probe.export_size(),
            max_connections,
            opts.dirty
        );

        Ok(NbdBackend {
            export: url.export.clone(),
            dirty: opts.dirty,
            writable: opts.writable,
            export_size: probe.export_size(),
            block_size: probe.minimum_block_size().max(1) as usize,
            max_connections,
            can_zero: probe.can_write_zeroes(),
            can_flush: probe.can_flush(),
            has_base_allocation: probe.has_base_allocation(),
            has_dirty_bitmap: probe.dirty_bitmap().is_some(),
            pool: Pool::new(url, opts.dirty, max_connections, probe),
        })
    }
}

#[async_trait]
impl Backend for NbdBackend {
    fn name(&self) -> &'static str {
        "nbd"
    }

    fn size(&self) -> u64 {
        self.export_size
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn max_readers(&self) -> u32 {
        self.max_connections
    }

    fn max_writers(&self) -> u32 {
        self.max_connections
    }

    fn supports_zero(&self) -> bool {
        self.can_zero
    }

    fn supports_flush(&self) -> bool {
        self.can_flush
    }

    async fn read_at(&self, buf: &mut [u8], offset: u64) -> ImageResult<()> {
        let mut conn = self.pool.acquire().await?;
        let mut pos = 0usize;
        while pos < buf.len() {
            let n = (buf.len() - pos).min(MAX_NBD_REQUEST as usize);
            conn.client()
                .read_at(offset + pos as u64, &mut buf[pos..pos + n])
                .await?;
            pos += n;
        }
        conn.put_back();
        Ok(())
    }

    async fn write_at(&self, buf: &[u8], offset: u64, flush: bool) -> ImageResult<()> {
        if !self.writable {
            return Err(Error::NotSupported("backend is read only".into()));
        }
        let mut conn = self.pool.acquire().await?;
        let mut pos = 0usize;
        while pos < buf.len() {
            let n = (buf.len() - pos).min(MAX_NBD_REQUEST as usize);
            conn.client()
                .write_at(offset + pos as u64, &buf[pos..pos + n], false)
                .await?;
            pos += n;
        }
        if flush {
            conn.client().flush().await?;
        }
        conn.put_back();
        Ok(())
    }

    async fn zero(
        &self,
        offset: u64,
        length: u64,
        flush: bool,
        punch_hole: bool,
    ) -> ImageResult<()> {
        if !self.writable {
            return Err(Error::NotSupported("backend is read only".into()));
        }
        let mut conn = self.pool.acquire().await?;
        let mut pos = offset;
        let end = offset + length;
        while pos < end {
            let n = (end - pos).min(MAX_NBD_REQUEST);
            conn.client().zero(pos, n, punch_hole).await?;
            pos += n;
        }
        if flush {
            conn.client().flush().await?;
        }
        conn.put_back();
        Ok(())
    }

    async fn flush(&self) -> ImageResult<()> {
        let mut conn = self.pool.acquire().await?;
        conn.client().flush().await?;
        conn.put_back();
        Ok(())
    }

    async fn extents_zero(&self) -> ImageResult<Vec<Extent>> {
        // Without base:allocation a single data extent is the safe answer,
        // the same shape the other backends produce.
        if !self.has_base_allocation {
            return Ok(vec![Extent::new(0, self.export_size, false, false)]);
        }

        let mut conn = self.pool.acquire().await?;
        let raw = imageio_nbd::extents(conn.client(), 0, self.export_size, false).await?;
        conn.put_back();

        let mut start = 0;
        let extents = raw
            .into_iter()
            .map(|e| {
                let ext = Extent::new(start, e.length, e.zero(), e.hole());
                start += e.length;
                ext
            })
            .collect();
        Ok(coalesce(extents))
    }

    async fn extents_dirty(&self) -> ImageResult<Vec<DirtyExtent>> {
        if !self.dirty || !self.has_dirty_bitmap {
            return Err(Error::NotSupported(format!(
                "NBD export {:?} does not support dirty extents",
                self.export
            )));
        }

        let mut conn = self.pool.acquire().await?;
        let raw = imageio_nbd::extents(conn.client(), 0, self.export_size, true).await?;
        conn.put_back();

        let mut start = 0;
        let extents = raw
            .into_iter()
            .map(|e| {
                let ext = DirtyExtent::new(start, e.length, e.dirty(), e.zero());
                start += e.length;
                ext
            })
            .collect();
        Ok(coalesce_dirty(extents))
    }

    async fn close(&self) -> ImageResult<()> {
        self.pool.close().await;
        debug!("closed NBD backend for export {:?}", self.export);
        Ok(())
    }
}
