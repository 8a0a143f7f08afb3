//! Chunked operation drivers.
//!
//! Each data-plane request runs one operation against its ticket's backend:
//! a streaming read, a streaming write, a zero, or a flush. Operations move
//! data in buffer-pool sized chunks, account progress on the lease after
//! every chunk, and check the cancellation signal between chunks so a
//! canceled ticket aborts within one chunk of I/O.

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;

use imageio_proto::defaults::MAX_ZERO_STEP;
use imageio_proto::{Error, ImageResult};

use crate::auth::Lease;
use crate::backend::Backend;

/// Stream `[offset, offset + length)` from the backend into `tx` in
/// `chunk_size` pieces. Ends early with `Canceled` when the ticket is
/// canceled or the receiver is dropped (client went away).
pub async fn read(
    backend: &dyn Backend,
    lease: &Lease,
    offset: u64,
    length: u64,
    chunk_size: usize,
    tx: &mpsc::Sender<ImageResult<Bytes>>,
) -> ImageResult<()> {
    let cancel = lease.cancel_signal();
    let mut pos = offset;
    let end = offset + length;

    while pos < end {
        if cancel.is_set() {
            return Err(Error::Canceled);
        }
        let n = ((end - pos) as usize).min(chunk_size);
        let mut buf = vec![0u8; n];
        backend.read_at(&mut buf, pos).await?;
        if tx.send(Ok(Bytes::from(buf))).await.is_err() {
            return Err(Error::Canceled);
        }
        lease.add_done(n as u64);
        pos += n as u64;
    }
    Ok(())
}

/// Consume exactly `length` bytes from the request body and write them at
/// `offset`, in `chunk_size` pieces. With `flush`, the final write carries
/// the flush so the durability point is reached before returning.
pub async fn write<S, E>(
    backend: &dyn Backend,
    lease: &Lease,
    offset: u64,
    length: u64,
    flush: bool,
    chunk_size: usize,
    body: &mut S,
) -> ImageResult<()>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
    E: std::fmt::Display,
{
    let cancel = lease.cancel_signal();
    let mut written: u64 = 0;
    let mut pending = BytesMut::with_capacity(chunk_size.min(length as usize));

    loop {
        if cancel.is_set() {
            return Err(Error::Canceled);
        }

        let buffered = written + pending.len() as u64;

        // Write a full chunk, or whatever is left once the body ended.
        if pending.len() >= chunk_size || (buffered == length && !pending.is_empty()) {
            let out = pending.split_to(pending.len().min(chunk_size));
            let last = written + out.len() as u64 == length;
            backend
                .write_at(&out, offset + written, flush && last)
                .await?;
            written += out.len() as u64;
            lease.add_done(out.len() as u64);
            continue;
        }

        if written == length {
            // A zero length write still needs its durability point.
            if length == 0 && flush {
                backend.flush().await?;
            }
            return Ok(());
        }

        match body.next().await {
            Some(Ok(mut data)) => {
                // Never consume more than the declared content length.
                let want = (length - buffered) as usize;
                if data.len() > want {
                    data.truncate(want);
                }
                pending.extend_from_slice(&data);
            }
            Some(Err(e)) => {
                return Err(Error::BadRequest(format!(
                    "error reading request body: {e}"
                )));
            }
            None => {
                return Err(Error::PartialContent {
                    expected: length,
                    actual: buffered,
                });
            }
        }
    }
}

/// Zero `[offset, offset + length)` in bounded steps so cancellation and
/// progress stay responsive even on slow storage.
pub async fn zero(
    backend: &dyn Backend,
    lease: &Lease,
    offset: u64,
    length: u64,
    flush: bool,
    punch_hole: bool,
) -> ImageResult<()> {
    let cancel = lease.cancel_signal();
    let mut pos = offset;
    let end = offset + length;

    while pos < end {
        if cancel.is_set() {
            return Err(Error::Canceled);
        }
        let step = (end - pos).min(MAX_ZERO_STEP);
        backend.zero(pos, step, false, punch_hole).await?;
        lease.add_done(step);
        pos += step;
    }

    if flush {
        backend.flush().await?;
    }
    Ok(())
}

pub async fn flush(backend: &dyn Backend) -> ImageResult<()> {
    backend.flush().await
}
