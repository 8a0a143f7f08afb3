//! High level transfer operations.
//!
//! Transfers run through a locally spawned qemu-nbd so qcow2 and raw
//! images get the same treatment: the engine always sees a flat byte
//! range with extent reporting, regardless of the on-disk format.

use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::info;

use imageio_nbd::Client;
use imageio_proto::units::MIB;
use imageio_proto::{Error, ImageResult};

use crate::http::ImageioClient;
use crate::io::{self, CopyOptions, HttpSource, HttpTarget, NbdSource, NbdTarget, MAX_WORKERS};
use crate::progress::{NullProgress, Progress};
use crate::{qemu_img, qemu_nbd};

#[derive(Clone)]
pub struct TransferOptions {
    /// Requested workers; capped by the server's advertised limit and 8.
    pub max_workers: u32,
    pub buffer_size: usize,
    /// Skip TLS certificate verification.
    pub insecure: bool,
    pub progress: Option<Arc<dyn Progress>>,
}

impl Default for TransferOptions {
    fn default() -> Self {
        TransferOptions {
            max_workers: 4,
            buffer_size: io::BUFFER_SIZE,
            insecure: false,
            progress: None,
        }
    }
}

impl TransferOptions {
    fn progress(&self) -> Arc<dyn Progress> {
        self.progress
            .clone()
            .unwrap_or_else(|| Arc::new(NullProgress))
    }
}

/// Upload a local image to a server image URL.
///
/// The local image is exported read-only by a private qemu-nbd; data
/// extents are PUT without flush, zero extents are zeroed with PATCH, and
/// a single flush ends the transfer at its durability point.
pub async fn upload(path: &Path, url: &str, opts: &TransferOptions) -> ImageResult<()> {
    let image = qemu_img::info(path).await?;
    info!(
        "uploading {:?} format={} size={}",
        path, image.format, image.virtual_size
    );

    let client = ImageioClient::new(url, opts.insecure)?;
    let server = client.options().await?;
    let workers = opts
        .max_workers
        .min(server.max_writers.unwrap_or(1))
        .min(MAX_WORKERS)
        .max(1);

    let nbd = qemu_nbd::Server::start(path, &image.format, true, workers + 1).await?;
    let src = Arc::new(NbdSource::connect(&nbd.url(), workers).await?);
    let dst = Arc::new(HttpTarget::new(client));

    let copy_opts = CopyOptions {
        workers,
        buffer_size: opts.buffer_size,
        // The server image may contain stale data; zero extents must be
        // zeroed, not skipped.
        zero: true,
    };
    let result = io::copy(
        src.clone(),
        dst.clone(),
        &copy_opts,
        opts.progress(),
    )
    .await;

    let _ = io::Source::close(&*src).await;
    nbd.stop().await?;
    result
}

/// Download a server image URL into a new local image of `format`.
///
/// Zero extents are skipped; a fresh image already reads as zeroes, and
/// skipping keeps it sparse.
pub async fn download(
    url: &str,
    path: &Path,
    format: &str,
    opts: &TransferOptions,
) -> ImageResult<()> {
    let client = ImageioClient::new(url, opts.insecure)?;
    let server = client.options().await?;
    let workers = opts
        .max_workers
        .min(server.max_readers.unwrap_or(1))
        .min(MAX_WORKERS)
        .max(1);

    let src = Arc::new(HttpSource::connect(client).await?);
    info!("downloading {} size={} to {:?}", url, io::Source::size(&*src), path);

    qemu_img::create(path, format, io::Source::size(&*src)).await?;
    let nbd = qemu_nbd::Server::start(path, format, false, workers + 1).await?;
    let dst = Arc::new(NbdTarget::connect(&nbd.url(), workers).await?);

    let copy_opts = CopyOptions {
        workers,
        buffer_size: opts.buffer_size,
        zero: false,
    };
    let result = io::copy(
        src.clone(),
        dst.clone(),
        &copy_opts,
        opts.progress(),
    )
    .await;

    let _ = io::Target::close(&*dst).await;
    nbd.stop().await?;
    result
}

/// Content checksum of a local image.
///
/// Hashes the full virtual image, reading data extents and synthesizing
/// zeroes for zero extents, so the result is stable across formats and
/// allocation layouts (and across an upload/download round trip).
pub async fn checksum(path: &Path) -> ImageResult<String> {
    const CHUNK: usize = 4 * MIB as usize;

    let image = qemu_img::info(path).await?;
    let nbd = qemu_nbd::Server::start(path, &image.format, true, 2).await?;

    let result = async {
        let mut client = Client::connect(&nbd.url(), false).await?;
        let size = client.export_size();
        if size != image.virtual_size {
            return Err(Error::Internal(format!(
                "qemu-nbd exported {size} bytes, expected {}",
                image.virtual_size
            )));
        }

        let extents = if client.has_base_allocation() {
            imageio_nbd::extents(&mut client, 0, size, false).await?
        } else {
            vec![imageio_nbd::NbdExtent::new(size, 0)]
        };

        let mut hasher = Sha256::new();
        let zeroes = vec![0u8; CHUNK];
        let mut buf = vec![0u8; CHUNK];
        let mut offset = 0u64;

        for ext in extents {
            let mut todo = ext.length;
            if ext.zero() {
                while todo > 0 {
                    let n = (todo as usize).min(CHUNK);
                    hasher.update(&zeroes[..n]);
                    todo -= n as u64;
                }
                offset += ext.length;
            } else {
                while todo > 0 {
                    let n = (todo as usize).min(CHUNK);
                    client.read_at(offset, &mut buf[..n]).await?;
                    hasher.update(&buf[..n]);
                    offset += n as u64;
                    todo -= n as u64;
                }
            }
        }

        let _ = client.disconnect().await;
        let digest = hasher.finalize();
        Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
    }
    .await;

    nbd.stop().await?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_cap() {
        // min(user requested, server limit, hard cap), at least one.
        let cap = |user: u32, server: u32| user.min(server).min(MAX_WORKERS).max(1);
        assert_eq!(cap(4, 8), 4);
        assert_eq!(cap(16, 8), 8);
        assert_eq!(cap(16, 99), 8);
        assert_eq!(cap(4, 1), 1);
        assert_eq!(cap(0, 8), 1);
    }
}
