//! Multi-worker copy engine.
//!
//! A transfer is planned from the source extent list: data extents become
//! copy requests, zero extents become zero requests (or are skipped when
//! the destination is known to read as zeroes). Large extents are split so
//! the work spreads over all workers and progress updates stay frequent.
//! Workers pull from a bounded queue, each owning its own connections; the
//! first failure closes the queue and the whole transfer fails fast.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use imageio_nbd::{Client, NbdUrl, Pool};
use imageio_proto::defaults::MAX_NBD_REQUEST;
use imageio_proto::units::MIB;
use imageio_proto::{Error, Extent, ImageResult};

use crate::http::ImageioClient;
use crate::progress::Progress;

/// Split limit for copy and zero requests.
pub const MAX_COPY_SIZE: u64 = 128 * MIB;

/// Default transfer buffer size.
pub const BUFFER_SIZE: usize = 4 * MIB as usize;

/// Hard cap on workers, matching what servers typically allow.
pub const MAX_WORKERS: u32 = 8;

/// Work queue depth; bounds in-flight planning, not I/O.
const QUEUE_DEPTH: usize = 32;

/// Read side of a transfer.
#[async_trait]
pub trait Source: Send + Sync {
    fn size(&self) -> u64;
    async fn extents(&self) -> ImageResult<Vec<Extent>>;
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> ImageResult<()>;
    async fn close(&self) -> ImageResult<()>;
}

/// Write side of a transfer.
#[async_trait]
pub trait Target: Send + Sync {
    async fn write_at(&self, data: Vec<u8>, offset: u64) -> ImageResult<()>;
    async fn zero(&self, offset: u64, length: u64) -> ImageResult<()>;
    async fn flush(&self) -> ImageResult<()>;
    async fn close(&self) -> ImageResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Copy,
    Zero,
}

#[derive(Debug, Clone, Copy)]
struct Request {
    op: Op,
    start: u64,
    length: u64,
}

#[derive(Debug, Clone)]
pub struct CopyOptions {
    pub workers: u32,
    pub buffer_size: usize,
    /// Submit zero requests for zero extents. Use false when the
    /// destination is a new empty image that already reads as zeroes.
    pub zero: bool,
}

impl Default for CopyOptions {
    fn default() -> Self {
        CopyOptions {
            workers: 4,
            buffer_size: BUFFER_SIZE,
            zero: true,
        }
    }
}

/// Copy every extent of `src` into `dst` and flush.
pub async fn copy(
    src: Arc<dyn Source>,
    dst: Arc<dyn Target>,
    opts: &CopyOptions,
    progress: Arc<dyn Progress>,
) -> ImageResult<()> {
    progress.start(src.size());
    let extents = src.extents().await?;

    let (tx, rx) = mpsc::channel::<Request>(QUEUE_DEPTH);
    let rx = Arc::new(Mutex::new(rx));

    let mut workers = Vec::new();
    for i in 0..opts.workers.max(1) {
        workers.push(tokio::spawn(worker(
            i,
            Arc::clone(&rx),
            Arc::clone(&src),
            Arc::clone(&dst),
            opts.buffer_size,
            Arc::clone(&progress),
        )));
    }

    // Submit requests. A send fails only when a worker failed and closed
    // the queue; the error surfaces when the workers are joined.
    'submit: for ext in &extents {
        let op = if ext.is_data() {
            Op::Copy
        } else if opts.zero {
            Op::Zero
        } else {
            progress.update(ext.length);
            continue;
        };
        for req in split(op, ext.start, ext.length) {
            if tx.send(req).await.is_err() {
                debug!("work queue closed, stopping submission");
                break 'submit;
            }
        }
    }
    drop(tx);

    let mut first_error = None;
    for worker in workers {
        match worker.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = first_error.get_or_insert(e);
            }
            Err(e) => {
                let _ = first_error.get_or_insert(Error::Internal(format!(
                    "worker panicked: {e}"
                )));
            }
        }
    }
    if let Some(e) = first_error {
        return Err(e);
    }

    dst.flush().await
}

/// Split a request so large extents spread over all workers.
fn split(op: Op, start: u64, length: u64) -> impl Iterator<Item = Request> {
    let mut pos = start;
    let end = start + length;
    std::iter::from_fn(move || {
        if pos >= end {
            return None;
        }
        let step = (end - pos).min(MAX_COPY_SIZE);
        let req = Request {
            op,
            start: pos,
            length: step,
        };
        pos += step;
        Some(req)
    })
}

async fn worker(
    id: u32,
    rx: Arc<Mutex<mpsc::Receiver<Request>>>,
    src: Arc<dyn Source>,
    dst: Arc<dyn Target>,
    buffer_size: usize,
    progress: Arc<dyn Progress>,
) -> ImageResult<()> {
    debug!("worker {} started", id);
    loop {
        let req = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(req) = req else {
            debug!("worker {} finished", id);
            return Ok(());
        };

        let result = match req.op {
            Op::Copy => copy_range(&*src, &*dst, req, buffer_size, &*progress).await,
            Op::Zero => {
                let r = dst.zero(req.start, req.length).await;
                if r.is_ok() {
                    progress.update(req.length);
                }
                r
            }
        };

        if let Err(e) = result {
            debug!("worker {} failed: {}", id, e);
            // Fail fast: close the queue so peers stop after the requests
            // already in flight.
            rx.lock().await.close();
            return Err(e);
        }
    }
}

async fn copy_range(
    src: &dyn Source,
    dst: &dyn Target,
    req: Request,
    buffer_size: usize,
    progress: &dyn Progress,
) -> ImageResult<()> {
    let mut pos = req.start;
    let end = req.start + req.length;
    while pos < end {
        let n = ((end - pos) as usize).min(buffer_size);
        let mut buf = vec![0u8; n];
        src.read_at(&mut buf, pos).await?;
        dst.write_at(buf, pos).await?;
        progress.update(n as u64);
        pos += n as u64;
    }
    Ok(())
}

// ─── NBD source and target ──────────────────────────────────────────────────

pub struct NbdSource {
    pool: Pool,
    size: u64,
    has_base_allocation: bool,
}

impl NbdSource {
    pub async fn connect(url: &NbdUrl, connections: u32) -> ImageResult<NbdSource> {
        let probe = Client::connect(url, false).await?;
        let connections = if probe.can_multi_conn() { connections } else { 1 };
        Ok(NbdSource {
            size: probe.export_size(),
            has_base_allocation: probe.has_base_allocation(),
            pool: Pool::new(url.clone(), false, connections, probe),
        })
    }
}

#[async_trait]
impl Source for NbdSource {
    fn size(&self) -> u64 {
        self.size
    }

    async fn extents(&self) -> ImageResult<Vec<Extent>> {
        if !self.has_base_allocation {
            return Ok(vec![Extent::new(0, self.size, false, false)]);
        }
        let mut conn = self.pool.acquire().await?;
        let raw = imageio_nbd::extents(conn.client(), 0, self.size, false).await?;
        conn.put_back();

        let mut start = 0;
        Ok(raw
            .into_iter()
            .map(|e| {
                let ext = Extent::new(start, e.length, e.zero(), e.hole());
                start += e.length;
                ext
            })
            .collect())
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

    async fn close(&self) -> ImageResult<()> {
        self.pool.close().await;
        Ok(())
    }
}

pub struct NbdTarget {
    pool: Pool,
}

impl NbdTarget {
    pub async fn connect(url: &NbdUrl, connections: u32) -> ImageResult<NbdTarget> {
        let probe = Client::connect(url, false).await?;
        if probe.is_read_only() {
            return Err(Error::NotSupported("NBD export is read only".into()));
        }
        let connections = if probe.can_multi_conn() { connections } else { 1 };
        Ok(NbdTarget {
            pool: Pool::new(url.clone(), false, connections, probe),
        })
    }
}

#[async_trait]
impl Target for NbdTarget {
    async fn write_at(&self, data: Vec<u8>, offset: u64) -> ImageResult<()> {
        let mut conn = self.pool.acquire().await?;
        let mut pos = 0usize;
        while pos < data.len() {
            let n = (data.len() - pos).min(MAX_NBD_REQUEST as usize);
            conn.client()
                .write_at(offset + pos as u64, &data[pos..pos + n], false)
                .await?;
            pos += n;
        }
        conn.put_back();
        Ok(())
    }

    async fn zero(&self, offset: u64, length: u64) -> ImageResult<()> {
        let mut conn = self.pool.acquire().await?;
        let mut pos = offset;
        let end = offset + length;
        while pos < end {
            let n = (end - pos).min(MAX_NBD_REQUEST);
            conn.client().zero(pos, n, true).await?;
            pos += n;
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

    async fn close(&self) -> ImageResult<()> {
        self.pool.close().await;
        Ok(())
    }
}

// ─── HTTP source and target ─────────────────────────────────────────────────

pub struct HttpSource {
    client: ImageioClient,
    extents: Vec<Extent>,
    size: u64,
}

impl HttpSource {
    /// Fetch the extent map up front; it defines the transfer plan and the
    /// image size.
    pub async fn connect(client: ImageioClient) -> ImageResult<HttpSource> {
        let extents = client.extents().await?;
        let size = extents.last().map(|e| e.start + e.length).ok_or_else(|| {
            Error::Internal("server reported no extents".into())
        })?;
        Ok(HttpSource {
            client,
            extents,
            size,
        })
    }
}

#[async_trait]
impl Source for HttpSource {
    fn size(&self) -> u64 {
        self.size
    }

    async fn extents(&self) -> ImageResult<Vec<Extent>> {
        Ok(self.extents.clone())
    }

    async fn read_at(&self, buf: &mut [u8], offset: u64) -> ImageResult<()> {
        self.client.get(offset, buf).await
    }

    async fn close(&self) -> ImageResult<()> {
        Ok(())
    }
}

pub struct HttpTarget {
    client: ImageioClient,
}

impl HttpTarget {
    pub fn new(client: ImageioClient) -> HttpTarget {
        HttpTarget { client }
    }
}

#[async_trait]
impl Target for HttpTarget {
    async fn write_at(&self, data: Vec<u8>, offset: u64) -> ImageResult<()> {
        // Durability comes from the transfer's final flush.
        self.client.put(offset, data, false).await
    }

    async fn zero(&self, offset: u64, length: u64) -> ImageResult<()> {
        self.client.patch_zero(offset, length, false).await
    }

    async fn flush(&self) -> ImageResult<()> {
        self.client.patch_flush().await
    }

    async fn close(&self) -> ImageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NullProgress;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex as StdMutex;

    #[test]
    fn test_split_small_request() {
        let reqs: Vec<_> = split(Op::Copy, 0, 1000).collect();
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].start, 0);
        assert_eq!(reqs[0].length, 1000);
    }

    #[test]
    fn test_split_large_request() {
        let reqs: Vec<_> = split(Op::Zero, 0, MAX_COPY_SIZE * 2 + 5).collect();
        assert_eq!(reqs.len(), 3);
        assert_eq!(reqs[0].length, MAX_COPY_SIZE);
        assert_eq!(reqs[1].start, MAX_COPY_SIZE);
        assert_eq!(reqs[2].length, 5);
        let total: u64 = reqs.iter().map(|r| r.length).sum();
        assert_eq!(total, MAX_COPY_SIZE * 2 + 5);
    }

    struct MemSource {
        data: Vec<u8>,
        extents: Vec<Extent>,
    }

    #[async_trait]
    impl Source for MemSource {
        fn size(&self) -> u64 {
            self.data.len() as u64
        }

        async fn extents(&self) -> ImageResult<Vec<Extent>> {
            Ok(self.extents.clone())
        }

        async fn read_at(&self, buf: &mut [u8], offset: u64) -> ImageResult<()> {
            let start = offset as usize;
            buf.copy_from_slice(&self.data[start..start + buf.len()]);
            Ok(())
        }

        async fn close(&self) -> ImageResult<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemTarget {
        data: StdMutex<Vec<u8>>,
        flushed: AtomicU64,
        fail_writes: bool,
    }

    #[async_trait]
    impl Target for MemTarget {
        async fn write_at(&self, data: Vec<u8>, offset: u64) -> ImageResult<()> {
            if self.fail_writes {
                return Err(Error::Internal("injected failure".into()));
            }
            let mut out = self.data.lock().unwrap();
            let end = offset as usize + data.len();
            if out.len() < end {
                out.resize(end, 0xfe);
            }
            out[offset as usize..end].copy_from_slice(&data);
            Ok(())
        }

        async fn zero(&self, offset: u64, length: u64) -> ImageResult<()> {
            let mut out = self.data.lock().unwrap();
            let end = (offset + length) as usize;
            if out.len() < end {
                out.resize(end, 0xfe);
            }
            out[offset as usize..end].fill(0);
            Ok(())
        }

        async fn flush(&self) -> ImageResult<()> {
            self.flushed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) -> ImageResult<()> {
            Ok(())
        }
    }

    fn image_with_hole() -> (Vec<u8>, Vec<Extent>) {
        let mut data = vec![0u8; 3000];
        data[..1000].fill(0xaa);
        data[2000..].fill(0xbb);
        let extents = vec![
            Extent::new(0, 1000, false, false),
            Extent::new(1000, 1000, true, true),
            Extent::new(2000, 1000, false, false),
        ];
        (data, extents)
    }

    #[tokio::test]
    async fn test_copy_with_zero() {
        let (data, extents) = image_with_hole();
        let src = Arc::new(MemSource {
            data: data.clone(),
            extents,
        });
        let dst = Arc::new(MemTarget::default());

        let opts = CopyOptions {
            workers: 4,
            buffer_size: 256,
            zero: true,
        };
        copy(src, dst.clone(), &opts, Arc::new(NullProgress))
            .await
            .unwrap();

        assert_eq!(*dst.data.lock().unwrap(), data);
        assert_eq!(dst.flushed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_copy_skipping_zero() {
        let (data, extents) = image_with_hole();
        let src = Arc::new(MemSource {
            data,
            extents,
        });
        let dst = Arc::new(MemTarget::default());

        let opts = CopyOptions {
            workers: 2,
            buffer_size: 512,
            zero: false,
        };
        copy(src, dst.clone(), &opts, Arc::new(NullProgress))
            .await
            .unwrap();

        // The hole was never written; only data ranges reached the target.
        let out = dst.data.lock().unwrap();
        assert!(out[..1000].iter().all(|b| *b == 0xaa));
        assert!(out[2000..].iter().all(|b| *b == 0xbb));
    }

    #[tokio::test]
    async fn test_copy_fails_fast() {
        let (data, extents) = image_with_hole();
        let src = Arc::new(MemSource { data, extents });
        let dst = Arc::new(MemTarget {
            fail_writes: true,
            ..Default::default()
        });

        let opts = CopyOptions {
            workers: 4,
            buffer_size: 128,
            zero: true,
        };
        let err = copy(src, dst.clone(), &opts, Arc::new(NullProgress))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));

        // No flush after a failed transfer.
        assert_eq!(dst.flushed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_progress_covers_whole_image() {
        struct CountingProgress(AtomicU64);
        impl Progress for CountingProgress {
            fn update(&self, n: u64) {
                self.0.fetch_add(n, Ordering::SeqCst);
            }
        }

        let (data, extents) = image_with_hole();
        let size = data.len() as u64;
        let src = Arc::new(MemSource { data, extents });
        let dst = Arc::new(MemTarget::default());
        let progress = Arc::new(CountingProgress(AtomicU64::new(0)));

        let opts = CopyOptions {
            workers: 3,
            buffer_size: 100,
            zero: false,
        };
        copy(src, dst, &opts, progress.clone())
            .await
            .unwrap();
        assert_eq!(progress.0.load(Ordering::SeqCst), size);
    }
}
