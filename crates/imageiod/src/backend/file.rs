//! File backend: regular files and block devices.
//!
//! Opens with O_DIRECT when the filesystem supports it, falling back to
//! buffered I/O. Direct I/O requires offset, length, and buffer address
//! aligned to the device logical block size; unaligned request edges are
//! handled with a read-modify-write through a bounce block. All filesystem
//! calls run inside `tokio::task::spawn_blocking` to keep the runtime
//! responsive.

use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileExt, FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use imageio_proto::defaults::{MAX_ZERO_STEP, MIN_BLOCK_SIZE};
use imageio_proto::extent::coalesce;
use imageio_proto::units::MIB;
use imageio_proto::{Error, Extent, ImageResult};

use crate::backend::{Backend, BackendOptions};
use crate::buf::{AlignedBuf, BufPool};

// Not exposed by the libc crate: _IO(0x12, 127).
const BLKZEROOUT: libc::c_ulong = 0x127f;
// _IO(0x12, 104), returns the logical sector size.
const BLKSSZGET: libc::c_ulong = 0x1268;

pub struct FileBackend {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for FileBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBackend")
            .field("path", &self.inner.path)
            .finish()
    }
}

struct Inner {
    file: std::fs::File,
    path: PathBuf,
    direct: bool,
    block_size: usize,
    writable: bool,
    block_device: bool,
    max_connections: u32,
    buffer_size: usize,
    size: AtomicU64,
    pool: Arc<BufPool>,
    // Capability flags flip to false on the first EOPNOTSUPP and are not
    // probed again.
    can_zero_range: AtomicBool,
    can_punch_hole: AtomicBool,
    can_fallocate: AtomicBool,
}

impl FileBackend {
    pub async fn open(path: &Path, opts: &BackendOptions) -> ImageResult<FileBackend> {
        let path = path.to_path_buf();
        let opts = opts.clone();
        tokio::task::spawn_blocking(move || Self::open_sync(path, &opts))
            .await
            .map_err(|e| Error::Internal(format!("open task failed: {e}")))?
    }

    fn open_sync(path: PathBuf, opts: &BackendOptions) -> ImageResult<FileBackend> {
        let (file, direct) = open_file(&path, opts.writable)?;
        let meta = file.metadata()?;
        let block_device = meta.file_type().is_block_device();

        let (size, block_size) = if block_device {
            let size = seek_end(&file)?;
            let block_size = logical_block_size(&file).unwrap_or(MIN_BLOCK_SIZE);
            (size, block_size)
        } else {
            let block_size = if direct {
                detect_block_size(&file)?
            } else {
                1
            };
            (meta.len(), block_size)
        };

        debug!(
            "open path={:?} direct={} block_size={} block_device={} size={}",
            path, direct, block_size, block_device, size
        );

        // Pool buffers hold a full transfer chunk plus the alignment slack
        // of both edges.
        let align = block_size.max(MIN_BLOCK_SIZE);
        let pool_buf = round_up(opts.buffer_size as u64, align as u64) as usize + 2 * align;

        Ok(FileBackend {
            inner: Arc::new(Inner {
                file,
                path,
                direct,
                block_size,
                writable: opts.writable,
                block_device,
                max_connections: opts.max_connections,
                buffer_size: opts.buffer_size,
                size: AtomicU64::new(size),
                pool: BufPool::new(pool_buf, align),
                can_zero_range: AtomicBool::new(true),
                can_punch_hole: AtomicBool::new(true),
                can_fallocate: AtomicBool::new(true),
            }),
        })
    }
}

#[async_trait]
impl Backend for FileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    fn size(&self) -> u64 {
        self.inner.size.load(Ordering::Relaxed)
    }

    fn block_size(&self) -> usize {
        self.inner.block_size
    }

    fn max_readers(&self) -> u32 {
        self.inner.max_connections
    }

    fn max_writers(&self) -> u32 {
        if self.inner.block_device {
            self.inner.max_connections
        } else {
            // Zeroing may grow the file, which assumes a single writer.
            // Multi-writer transfers should use the nbd backend.
            1
        }
    }

    async fn read_at(&self, buf: &mut [u8], offset: u64) -> ImageResult<()> {
        let inner = Arc::clone(&self.inner);
        let len = buf.len();
        if len > inner.buffer_size {
            return Err(Error::Internal(format!(
                "read of {len} bytes exceeds buffer size {}",
                inner.buffer_size
            )));
        }
        let (pbuf, skip) =
            run_blocking(move || inner.pread_window(offset, len)).await?;
        buf.copy_from_slice(&pbuf[skip..skip + len]);
        Ok(())
    }

    async fn write_at(&self, buf: &[u8], offset: u64, flush: bool) -> ImageResult<()> {
        if !self.inner.writable {
            return Err(Error::NotSupported("backend is read only".into()));
        }
        let inner = Arc::clone(&self.inner);
        let len = buf.len();
        if len > inner.buffer_size {
            return Err(Error::Internal(format!(
                "write of {len} bytes exceeds buffer size {}",
                inner.buffer_size
            )));
        }

        // Stage the payload at its in-window position so the aligned write
        // can go out from one buffer.
        let mut pbuf = self.inner.pool.take();
        let skip = (offset % self.inner.block_size.max(1) as u64) as usize;
        pbuf[skip..skip + len].copy_from_slice(buf);

        run_blocking(move || {
            inner.pwrite_window(pbuf, offset, len)?;
            if flush {
                inner.sync()?;
            }
            Ok(())
        })
        .await
    }

    async fn zero(
        &self,
        offset: u64,
        length: u64,
        flush: bool,
        punch_hole: bool,
    ) -> ImageResult<()> {
        if !self.inner.writable {
            return Err(Error::NotSupported("backend is read only".into()));
        }
        let inner = Arc::clone(&self.inner);
        run_blocking(move || {
            let mut pos = offset;
            let end = offset + length;
            while pos < end {
                let step = (end - pos).min(MAX_ZERO_STEP);
                if inner.block_device {
                    inner.zero_block_device(pos, step)?;
                } else if punch_hole {
                    inner.zero_sparse(pos, step)?;
                } else {
                    inner.zero_allocate(pos, step)?;
                }
                pos += step;
            }
            inner.extend_size(end);
            if flush {
                inner.sync()?;
            }
            Ok(())
        })
        .await
    }

    async fn flush(&self) -> ImageResult<()> {
        let inner = Arc::clone(&self.inner);
        run_blocking(move || inner.sync()).await
    }

    async fn extents_zero(&self) -> ImageResult<Vec<Extent>> {
        let inner = Arc::clone(&self.inner);
        run_blocking(move || inner.extents()).await
    }

    async fn close(&self) -> ImageResult<()> {
        debug!("close path={:?}", self.inner.path);
        // The descriptor closes when the last Arc drops; in-flight blocking
        // operations keep it valid until then.
        Ok(())
    }
}

impl Inner {
    /// Read the aligned window covering `[offset, offset + len)` into a
    /// pool buffer. Returns the buffer and the payload offset within it.
    fn pread_window(&self, offset: u64, len: usize) -> ImageResult<(crate::buf::PoolBuf, usize)> {
        let end = offset + len as u64;
        if end > self.size.load(Ordering::Relaxed) {
            return Err(Error::RangeNotSatisfiable {
                size: self.size.load(Ordering::Relaxed),
            });
        }

        let mut pbuf = self.pool.take();
        if !self.direct {
            self.file.read_exact_at(&mut pbuf[..len], offset)?;
            return Ok((pbuf, 0));
        }

        let bs = self.block_size as u64;
        let astart = round_down(offset, bs);
        let aend = round_up(end, bs);
        let alen = (aend - astart) as usize;
        let skip = (offset - astart) as usize;

        // A direct read can stop short at the unaligned end of file; bytes
        // past EOF read as zero.
        let got = read_full(&self.file, &mut pbuf[..alen], astart)?;
        if astart + (got as u64) < end {
            return Err(Error::PartialContent {
                expected: len as u64,
                actual: (astart + got as u64).saturating_sub(offset),
            });
        }
        pbuf[got..alen].fill(0);
        Ok((pbuf, skip))
    }

    /// Write `len` payload bytes staged at their block offset in `pbuf`.
    fn pwrite_window(
        &self,
        mut pbuf: crate::buf::PoolBuf,
        offset: u64,
        len: usize,
    ) -> ImageResult<()> {
        let end = offset + len as u64;
        if !self.direct {
            let skip = (offset % self.block_size.max(1) as u64) as usize;
            self.file.write_all_at(&pbuf[skip..skip + len], offset)?;
            self.extend_size(end);
            return Ok(());
        }

        let bs = self.block_size as u64;
        let astart = round_down(offset, bs);
        let aend = round_up(end, bs);
        let alen = (aend - astart) as usize;
        let skip = (offset - astart) as usize;

        // Merge the partial head block from storage.
        if skip > 0 {
            let head = self.read_block(astart)?;
            pbuf[..skip].copy_from_slice(&head[..skip]);
        }
        // Merge the partial tail block from storage.
        let tail_fill = (aend - end) as usize;
        if tail_fill > 0 && aend - bs != astart {
            let tail = self.read_block(aend - bs)?;
            let bs = bs as usize;
            pbuf[alen - tail_fill..alen].copy_from_slice(&tail[bs - tail_fill..]);
        } else if tail_fill > 0 {
            // Head and tail share one block, already merged above except
            // for the bytes after the payload.
            let block = self.read_block(astart)?;
            pbuf[skip + len..alen].copy_from_slice(&block[skip + len..alen]);
        }

        write_full(&self.file, &pbuf[..alen], astart)?;
        self.extend_size(end);
        Ok(())
    }

    /// Read one block, zero filled past EOF.
    fn read_block(&self, offset: u64) -> ImageResult<AlignedBuf> {
        let mut block = AlignedBuf::new(self.block_size, self.block_size.max(MIN_BLOCK_SIZE));
        let got = read_full(&self.file, &mut block, offset)?;
        block[got..].fill(0);
        Ok(block)
    }

    fn zero_allocate(&self, offset: u64, length: u64) -> ImageResult<()> {
        // The modern way zeroes a range in one call, but NFS 4.2 and older
        // kernels lack it.
        if self.can_zero_range.load(Ordering::Relaxed) {
            if self.fallocate(libc::FALLOC_FL_ZERO_RANGE, offset, length)? {
                return Ok(());
            }
            debug!("cannot zero range");
            self.can_zero_range.store(false, Ordering::Relaxed);
        }

        // Punch a hole and allocate the range again; the qemu fallback
        // since 2015.
        if self.can_punch_hole.load(Ordering::Relaxed)
            && self.can_fallocate.load(Ordering::Relaxed)
        {
            if self.fallocate(
                libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                offset,
                length,
            )? {
                if self.fallocate(0, offset, length)? {
                    return Ok(());
                }
                debug!("cannot fallocate range");
                self.can_fallocate.store(false, Ordering::Relaxed);
            } else {
                debug!("cannot punch hole");
                self.can_punch_hole.store(false, Ordering::Relaxed);
            }
        }

        // Writing after the end of the file can allocate.
        if self.can_fallocate.load(Ordering::Relaxed)
            && offset >= self.file.metadata()?.len()
        {
            if self.fallocate(0, offset, length)? {
                return Ok(());
            }
            debug!("cannot fallocate range");
            self.can_fallocate.store(false, Ordering::Relaxed);
        }

        self.write_zeros(offset, length)
    }

    fn zero_sparse(&self, offset: u64, length: u64) -> ImageResult<()> {
        if self.can_punch_hole.load(Ordering::Relaxed) {
            let file_size = self.file.metadata()?.len();

            // Extend the file first so the punched range stays inside it.
            if offset + length > file_size {
                self.file.set_len(offset + length)?;
                // Zeroing past the old end needs no hole.
                if file_size == offset {
                    return Ok(());
                }
            }

            if self.fallocate(
                libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                offset,
                length,
            )? {
                return Ok(());
            }
            debug!("cannot punch hole");
            self.can_punch_hole.store(false, Ordering::Relaxed);
        }

        self.write_zeros(offset, length)
    }

    fn zero_block_device(&self, offset: u64, length: u64) -> ImageResult<()> {
        // fallocate works for block devices since kernel 4.9 and also
        // invalidates the page cache.
        if self.can_zero_range.load(Ordering::Relaxed) {
            match self.fallocate(libc::FALLOC_FL_ZERO_RANGE, offset, length) {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    debug!("fallocate not supported, zeroing using BLKZEROOUT");
                    self.can_zero_range.store(false, Ordering::Relaxed);
                }
                Err(e) => return Err(e),
            }
        }

        let bs = self.block_size as u64;
        if offset % bs == 0 && length % bs == 0 {
            let range = [offset, length];
            let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), BLKZEROOUT, range.as_ptr()) };
            if rc == 0 {
                return Ok(());
            }
            debug!("BLKZEROOUT failed: {}", std::io::Error::last_os_error());
        }

        self.write_zeros(offset, length)
    }

    /// Try fallocate, returning false when the mode is unsupported here.
    fn fallocate(&self, mode: libc::c_int, offset: u64, length: u64) -> ImageResult<bool> {
        let rc = unsafe {
            libc::fallocate(
                self.file.as_raw_fd(),
                mode,
                offset as libc::off_t,
                length as libc::off_t,
            )
        };
        if rc == 0 {
            return Ok(true);
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EOPNOTSUPP) | Some(libc::ENODEV) | Some(libc::ENOSYS) => Ok(false),
            _ => Err(err.into()),
        }
    }

    /// Last resort: write zero buffers through the regular write path.
    fn write_zeros(&self, offset: u64, length: u64) -> ImageResult<()> {
        let step = (MIB as usize).min(self.pool.buf_size() / 2);
        let mut pos = offset;
        let end = offset + length;
        while pos < end {
            let n = ((end - pos) as usize).min(step);
            let mut pbuf = self.pool.take();
            let skip = (pos % self.block_size.max(1) as u64) as usize;
            pbuf[skip..skip + n].fill(0);
            self.pwrite_window(pbuf, pos, n)?;
            pos += n as u64;
        }
        Ok(())
    }

    fn extents(&self) -> ImageResult<Vec<Extent>> {
        let size = self.size.load(Ordering::Relaxed);

        // Block devices have no allocation map.
        if self.block_device {
            return Ok(vec![Extent::new(0, size, false, false)]);
        }

        let fd = self.file.as_raw_fd();
        let mut extents = Vec::new();
        let mut pos: u64 = 0;

        while pos < size {
            let data = match lseek(fd, pos, libc::SEEK_DATA) {
                Ok(n) => n.min(size),
                // No more data, the rest of the file is one hole.
                Err(e) if e.raw_os_error() == Some(libc::ENXIO) => {
                    extents.push(Extent::new(pos, size - pos, true, true));
                    break;
                }
                // Filesystem without SEEK_HOLE support, report one data
                // extent like the other backends do.
                Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
                    return Ok(vec![Extent::new(0, size, false, false)]);
                }
                Err(e) => return Err(e.into()),
            };
            if data > pos {
                extents.push(Extent::new(pos, data - pos, true, true));
            }
            if data >= size {
                break;
            }
            let hole = lseek(fd, data, libc::SEEK_HOLE)?.min(size);
            extents.push(Extent::new(data, hole - data, false, false));
            pos = hole;
        }

        Ok(coalesce(extents))
    }

    fn sync(&self) -> ImageResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn extend_size(&self, end: u64) {
        self.size.fetch_max(end, Ordering::Relaxed);
    }
}

async fn run_blocking<T, F>(f: F) -> ImageResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> ImageResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("blocking task failed: {e}")))?
}

fn open_file(path: &Path, writable: bool) -> ImageResult<(std::fs::File, bool)> {
    let mut opts = OpenOptions::new();
    opts.read(true).write(writable);

    // Prefer direct I/O; EINVAL means the filesystem cannot do it.
    match opts
        .clone()
        .custom_flags(libc::O_DIRECT)
        .open(path)
    {
        Ok(file) => Ok((file, true)),
        Err(e) if e.raw_os_error() == Some(libc::EINVAL) => {
            debug!("cannot use direct I/O for {:?}, using buffered I/O", path);
            Ok((opts.open(path)?, false))
        }
        Err(e) => Err(e.into()),
    }
}

/// Probe the minimal block size that works for direct reads.
fn detect_block_size(file: &std::fs::File) -> ImageResult<usize> {
    for block_size in [512usize, 4096] {
        let mut buf = AlignedBuf::new(block_size, block_size);
        match file.read_at(&mut buf, 0) {
            Ok(_) => {
                debug!("detected block size {}", block_size);
                return Ok(block_size);
            }
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    // NFS does not pass O_DIRECT to the server; assume the worst case.
    debug!("cannot detect block size, using 4096");
    Ok(4096)
}

fn logical_block_size(file: &std::fs::File) -> Option<usize> {
    let mut ssz: libc::c_int = 0;
    let rc = unsafe { libc::ioctl(file.as_raw_fd(), BLKSSZGET, &mut ssz) };
    (rc == 0 && ssz > 0).then_some(ssz as usize)
}

fn seek_end(file: &std::fs::File) -> ImageResult<u64> {
    lseek(file.as_raw_fd(), 0, libc::SEEK_END).map_err(Into::into)
}

fn lseek(fd: libc::c_int, offset: u64, whence: libc::c_int) -> std::io::Result<u64> {
    let rc = unsafe { libc::lseek(fd, offset as libc::off_t, whence) };
    if rc < 0 {
        Err(std::io::Error::last_os_error())
    } else {
        Ok(rc as u64)
    }
}

/// Positional read until `buf` is full or EOF; returns bytes read.
fn read_full(file: &std::fs::File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match file.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(done)
}

fn write_full(file: &std::fs::File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    file.write_all_at(buf, offset)
}

fn round_down(n: u64, align: u64) -> u64 {
    n / align * align
}

fn round_up(n: u64, align: u64) -> u64 {
    n.div_ceil(align) * align
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn opts(writable: bool) -> BackendOptions {
        BackendOptions {
            writable,
            sparse: false,
            dirty: false,
            max_connections: 8,
            buffer_size: 1024 * 1024,
            size_hint: 0,
            insecure_tls: false,
        }
    }

    fn temp_image(size: usize) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.as_file_mut().set_len(size as u64).unwrap();
        f.flush().unwrap();
        f
    }

    #[tokio::test]
    async fn test_size_and_caps() {
        let img = temp_image(1024 * 1024);
        let backend = FileBackend::open(img.path(), &opts(false)).await.unwrap();
        assert_eq!(backend.size(), 1024 * 1024);
        assert_eq!(backend.name(), "file");
        assert_eq!(backend.max_writers(), 1);
        assert!(backend.max_readers() >= 1);
    }

    #[tokio::test]
    async fn test_read_write_round_trip() {
        let img = temp_image(64 * 1024);
        let backend = FileBackend::open(img.path(), &opts(true)).await.unwrap();

        let payload: Vec<u8> = (0..8192).map(|i| (i % 251) as u8).collect();
        backend.write_at(&payload, 4096, true).await.unwrap();

        let mut out = vec![0u8; 8192];
        backend.read_at(&mut out, 4096).await.unwrap();
        assert_eq!(out, payload);
    }

    #[tokio::test]
    async fn test_unaligned_edges() {
        let img = temp_image(64 * 1024);
        let backend = FileBackend::open(img.path(), &opts(true)).await.unwrap();

        // Surrounding data must survive an unaligned write in the middle.
        backend.write_at(&[0xaa; 4096], 0, false).await.unwrap();
        backend.write_at(&[0xbb; 100], 700, true).await.unwrap();

        let mut out = vec![0u8; 4096];
        backend.read_at(&mut out, 0).await.unwrap();
        assert!(out[..700].iter().all(|b| *b == 0xaa));
        assert!(out[700..800].iter().all(|b| *b == 0xbb));
        assert!(out[800..].iter().all(|b| *b == 0xaa));
    }

    #[tokio::test]
    async fn test_unaligned_read() {
        let img = temp_image(64 * 1024);
        let backend = FileBackend::open(img.path(), &opts(true)).await.unwrap();

        backend.write_at(&[0xcc; 512], 512, true).await.unwrap();
        let mut out = vec![0u8; 10];
        backend.read_at(&mut out, 1000).await.unwrap();
        assert_eq!(out, [0xcc; 10]);
    }

    #[tokio::test]
    async fn test_read_past_end_fails() {
        let img = temp_image(4096);
        let backend = FileBackend::open(img.path(), &opts(false)).await.unwrap();
        let mut out = vec![0u8; 4096];
        let err = backend.read_at(&mut out, 4096).await.unwrap_err();
        assert!(matches!(err, Error::RangeNotSatisfiable { size: 4096 }));
    }

    #[tokio::test]
    async fn test_write_to_read_only_backend_fails() {
        let img = temp_image(4096);
        let backend = FileBackend::open(img.path(), &opts(false)).await.unwrap();
        let err = backend.write_at(&[0u8; 512], 0, false).await.unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
        let err = backend.zero(0, 512, false, false).await.unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }

    #[tokio::test]
    async fn test_zero_reads_back_as_zero() {
        let img = temp_image(64 * 1024);
        let backend = FileBackend::open(img.path(), &opts(true)).await.unwrap();

        backend.write_at(&[0xee; 8192], 0, true).await.unwrap();
        backend.zero(1024, 4096, true, false).await.unwrap();

        let mut out = vec![0u8; 8192];
        backend.read_at(&mut out, 0).await.unwrap();
        assert!(out[..1024].iter().all(|b| *b == 0xee));
        assert!(out[1024..5120].iter().all(|b| *b == 0));
        assert!(out[5120..].iter().all(|b| *b == 0xee));
    }

    #[tokio::test]
    async fn test_zero_sparse_punches_hole() {
        let img = temp_image(10 * 1024 * 1024);
        let backend = FileBackend::open(img.path(), &opts(true)).await.unwrap();

        backend.write_at(&[0x11; 65536], 0, false).await.unwrap();
        backend.write_at(&[0x22; 65536], 65536, true).await.unwrap();
        backend.zero(65536, 65536, true, true).await.unwrap();

        let mut out = vec![0u8; 65536];
        backend.read_at(&mut out, 65536).await.unwrap();
        assert!(out.iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn test_extents_sparse_file() {
        let img = temp_image(1024 * 1024);
        let backend = FileBackend::open(img.path(), &opts(true)).await.unwrap();

        // One data extent in the middle of an otherwise sparse file.
        backend.write_at(&[0x55; 65536], 65536, true).await.unwrap();

        let extents = backend.extents_zero().await.unwrap();

        // Gap-free ascending coverage of the whole image.
        let mut pos = 0;
        for ext in &extents {
            assert_eq!(ext.start, pos);
            pos += ext.length;
        }
        assert_eq!(pos, backend.size());

        // The written range is reported as data. Filesystems may allocate
        // more than we wrote, so only check containment.
        let covering: Vec<_> = extents
            .iter()
            .filter(|e| e.start < 131072 && e.start + e.length > 65536)
            .collect();
        assert!(covering.iter().any(|e| !e.zero), "extents: {extents:?}");
    }

    #[tokio::test]
    async fn test_extents_merged() {
        let img = temp_image(1024 * 1024);
        let backend = FileBackend::open(img.path(), &opts(false)).await.unwrap();
        let extents = backend.extents_zero().await.unwrap();
        for pair in extents.windows(2) {
            assert!(
                pair[0].zero != pair[1].zero || pair[0].hole != pair[1].hole,
                "adjacent extents share flags: {pair:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_dirty_extents_not_supported() {
        let img = temp_image(4096);
        let backend = FileBackend::open(img.path(), &opts(false)).await.unwrap();
        let err = backend.extents_dirty().await.unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
    }
}
