//! NBD client connection.
//!
//! One `Client` is one connection with at most one command in flight.
//! Concurrency is provided by pooling clients (see the daemon's nbd backend
//! and the transfer engine), which is also how qemu-nbd expects multi-conn
//! clients to behave.

use std::collections::HashMap;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::{TcpStream, UnixStream};
use tracing::debug;

use imageio_proto::defaults::MAX_NBD_REQUEST;
use imageio_proto::{Error, ImageResult};

use crate::proto::*;
use crate::url::{NbdAddress, NbdUrl};

/// Upper bound on negotiation payloads we accept from the server.
const MAX_OPTION_DATA: usize = 64 * 1024;

/// How many times BLOCK_STATUS is retried when the server reports EINTR.
/// qemu-nbd returns it transiently while a bitmap is being synchronized.
const BLOCK_STATUS_RETRIES: usize = 4;

trait RawStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> RawStream for T {}

/// Which meta context a server-assigned context id refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaContext {
    BaseAllocation,
    AllocationDepth,
    DirtyBitmap,
}

/// Raw extent pair as returned by BLOCK_STATUS, flags still per-context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawExtent {
    pub length: u32,
    pub flags: u32,
}

/// Command failure reported by the server.
#[derive(Debug)]
struct CmdError {
    code: u32,
    message: String,
}

impl CmdError {
    fn into_error(self, cmd: &str) -> Error {
        match self.code {
            NBD_ENOTSUP => Error::NotSupported(format!("NBD {cmd}: {}", self.message)),
            NBD_EINVAL => Error::BadRequest(format!("NBD {cmd}: {}", self.message)),
            NBD_EPERM => Error::Forbidden(format!("NBD {cmd}: {}", self.message)),
            code => Error::Internal(format!(
                "NBD {cmd} failed: {} (errno {code})",
                self.message
            )),
        }
    }
}

/// An NBD client connection in the transmission phase.
pub struct Client {
    stream: BufStream<Box<dyn RawStream>>,
    url: NbdUrl,
    export_size: u64,
    transmission_flags: u16,
    minimum_block_size: u32,
    preferred_block_size: u32,
    maximum_block_size: u32,
    structured_replies: bool,
    meta_contexts: HashMap<u32, MetaContext>,
    dirty_bitmap: Option<String>,
    cookie: u64,
}

impl Client {
    /// Connect and negotiate an export.
    ///
    /// With `dirty` the client looks up the export's qemu dirty bitmap and
    /// selects it as a meta context; connecting fails if the server exposes
    /// no bitmap. Without `dirty`, `qemu:allocation-depth` is requested so
    /// qcow2 holes can be told apart from allocated zero clusters.
    pub async fn connect(url: &NbdUrl, dirty: bool) -> ImageResult<Client> {
        let stream: Box<dyn RawStream> = match &url.address {
            NbdAddress::Unix(path) => Box::new(UnixStream::connect(path).await?),
            NbdAddress::Tcp(host, port) => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                stream.set_nodelay(true).ok();
                Box::new(stream)
            }
        };

        let mut client = Client {
            stream: BufStream::new(stream),
            url: url.clone(),
            export_size: 0,
            transmission_flags: 0,
            minimum_block_size: 1,
            preferred_block_size: 4096,
            maximum_block_size: MAX_NBD_REQUEST as u32,
            structured_replies: false,
            meta_contexts: HashMap::new(),
            dirty_bitmap: None,
            cookie: 0,
        };

        client.handshake().await?;
        client.structured_replies = client.negotiate_structured_reply().await?;

        if dirty {
            let bitmap = client.find_dirty_bitmap().await?.ok_or_else(|| {
                Error::NotSupported(format!(
                    "NBD export {:?} has no dirty bitmap",
                    url.export
                ))
            })?;
            client.dirty_bitmap = Some(bitmap);
        }

        if client.structured_replies {
            client.set_meta_contexts(dirty).await?;
        }

        client.go().await?;

        debug!(
            "connected to {} export_size={} flags={:#x} contexts={:?}",
            url, client.export_size, client.transmission_flags, client.meta_contexts
        );
        Ok(client)
    }

    pub fn url(&self) -> &NbdUrl {
        &self.url
    }

    pub fn export_size(&self) -> u64 {
        self.export_size
    }

    pub fn minimum_block_size(&self) -> u32 {
        self.minimum_block_size
    }

    pub fn preferred_block_size(&self) -> u32 {
        self.preferred_block_size
    }

    pub fn maximum_block_size(&self) -> u32 {
        self.maximum_block_size
    }

    /// Server allows multiple connections to this export with consistent
    /// cross-connection flush semantics.
    pub fn can_multi_conn(&self) -> bool {
        self.transmission_flags & FLAG_CAN_MULTI_CONN != 0
    }

    pub fn is_read_only(&self) -> bool {
        self.transmission_flags & FLAG_READ_ONLY != 0
    }

    pub fn can_write_zeroes(&self) -> bool {
        self.transmission_flags & FLAG_SEND_WRITE_ZEROES != 0
    }

    pub fn can_flush(&self) -> bool {
        self.transmission_flags & FLAG_SEND_FLUSH != 0
    }

    /// `base:allocation` was selected, so zero extents are meaningful.
    pub fn has_base_allocation(&self) -> bool {
        self.meta_contexts
            .values()
            .any(|c| *c == MetaContext::BaseAllocation)
    }

    /// `qemu:allocation-depth` was selected, so holes are meaningful.
    pub fn has_allocation_depth(&self) -> bool {
        self.meta_contexts
            .values()
            .any(|c| *c == MetaContext::AllocationDepth)
    }

    pub fn dirty_bitmap(&self) -> Option<&str> {
        self.dirty_bitmap.as_deref()
    }

    // ─── Transmission commands ──────────────────────────────────────────────

    /// Read exactly `buf.len()` bytes at `offset`.
    pub async fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> ImageResult<()> {
        check_request(offset, buf.len() as u64, self.export_size)?;
        let cookie = self
            .send_cmd(0, CMD_READ, offset, buf.len() as u32, None)
            .await?;
        self.recv_read_reply(cookie, offset, buf)
            .await?
            .map_err(|e| e.into_error("READ"))
    }

    /// Write `buf` at `offset`. With `fua` the write is durable on return.
    pub async fn write_at(&mut self, offset: u64, buf: &[u8], fua: bool) -> ImageResult<()> {
        check_request(offset, buf.len() as u64, self.export_size)?;
        let flags = if fua { CMD_FLAG_FUA } else { 0 };
        let cookie = self
            .send_cmd(flags, CMD_WRITE, offset, buf.len() as u32, Some(buf))
            .await?;
        self.recv_ack(cookie)
            .await?
            .map_err(|e| e.into_error("WRITE"))
    }

    /// Ensure `length` bytes at `offset` read back as zeroes. With
    /// `punch_hole` the server may deallocate; otherwise allocation is
    /// requested (NO_HOLE).
    pub async fn zero(&mut self, offset: u64, length: u64, punch_hole: bool) -> ImageResult<()> {
        check_request(offset, length, self.export_size)?;
        if self.transmission_flags & FLAG_SEND_WRITE_ZEROES == 0 {
            return Err(Error::NotSupported(
                "NBD server does not support WRITE_ZEROES".into(),
            ));
        }
        let flags = if punch_hole { 0 } else { CMD_FLAG_NO_HOLE };
        let cookie = self
            .send_cmd(flags, CMD_WRITE_ZEROES, offset, length as u32, None)
            .await?;
        self.recv_ack(cookie)
            .await?
            .map_err(|e| e.into_error("WRITE_ZEROES"))
    }

    /// Durably persist all completed writes.
    pub async fn flush(&mut self) -> ImageResult<()> {
        if self.transmission_flags & FLAG_SEND_FLUSH == 0 {
            return Err(Error::NotSupported(
                "NBD server does not support FLUSH".into(),
            ));
        }
        let cookie = self.send_cmd(0, CMD_FLUSH, 0, 0, None).await?;
        self.recv_ack(cookie)
            .await?
            .map_err(|e| e.into_error("FLUSH"))
    }

    /// Query block status for the selected meta contexts.
    ///
    /// Returns raw per-context extents keyed by [`MetaContext`]. Transient
    /// EINTR failures from the server are retried.
    pub async fn block_status(
        &mut self,
        offset: u64,
        length: u32,
    ) -> ImageResult<HashMap<MetaContext, Vec<RawExtent>>> {
        check_request(offset, length as u64, self.export_size)?;
        if !self.structured_replies || self.meta_contexts.is_empty() {
            return Err(Error::NotSupported(
                "NBD server does not support block status".into(),
            ));
        }

        let mut attempt = 0;
        loop {
            let cookie = self
                .send_cmd(0, CMD_BLOCK_STATUS, offset, length, None)
                .await?;
            match self.recv_block_status_reply(cookie).await? {
                Ok(result) => return Ok(result),
                Err(e) if e.code == NBD_EINTR && attempt < BLOCK_STATUS_RETRIES => {
                    attempt += 1;
                    debug!("BLOCK_STATUS interrupted, retrying ({attempt})");
                }
                Err(e) => return Err(e.into_error("BLOCK_STATUS")),
            }
        }
    }

    /// Send a soft disconnect. The server closes the socket without a reply.
    pub async fn disconnect(mut self) -> ImageResult<()> {
        self.send_cmd(0, CMD_DISC, 0, 0, None).await?;
        Ok(())
    }

    // ─── Negotiation ────────────────────────────────────────────────────────

    async fn handshake(&mut self) -> ImageResult<()> {
        let magic = self.stream.read_u64().await?;
        if magic != NBDMAGIC {
            return Err(protocol_error(format!("bad server magic {magic:#x}")));
        }
        let opt_magic = self.stream.read_u64().await?;
        if opt_magic != IHAVEOPT {
            return Err(protocol_error(format!(
                "server does not support fixed newstyle negotiation (magic {opt_magic:#x})"
            )));
        }
        let server_flags = self.stream.read_u16().await?;
        if server_flags & FLAG_FIXED_NEWSTYLE == 0 {
            return Err(protocol_error(
                "server does not advertise fixed newstyle".into(),
            ));
        }

        let mut client_flags = FLAG_C_FIXED_NEWSTYLE;
        if server_flags & FLAG_NO_ZEROES != 0 {
            client_flags |= FLAG_C_NO_ZEROES;
        }
        self.stream.write_u32(client_flags).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn negotiate_structured_reply(&mut self) -> ImageResult<bool> {
        self.send_option(OPT_STRUCTURED_REPLY, &[]).await?;
        let (reply, _) = self.recv_option_reply(OPT_STRUCTURED_REPLY).await?;
        match reply {
            REP_ACK => Ok(true),
            REP_ERR_UNSUP => Ok(false),
            other => Err(protocol_error(format!(
                "unexpected reply {other:#x} to STRUCTURED_REPLY"
            ))),
        }
    }

    /// Find the export's dirty bitmap name via LIST_META_CONTEXT.
    async fn find_dirty_bitmap(&mut self) -> ImageResult<Option<String>> {
        let data = self.meta_context_data(&[QEMU_DIRTY_BITMAP]);
        self.send_option(OPT_LIST_META_CONTEXT, &data).await?;

        let mut found = None;
        loop {
            let (reply, data) = self.recv_option_reply(OPT_LIST_META_CONTEXT).await?;
            match reply {
                REP_META_CONTEXT => {
                    if data.len() < 4 {
                        return Err(protocol_error("short meta context reply".into()));
                    }
                    let name = String::from_utf8_lossy(&data[4..]).to_string();
                    if let Some(bitmap) = name.strip_prefix(QEMU_DIRTY_BITMAP) {
                        found = Some(bitmap.to_string());
                    }
                }
                REP_ACK => return Ok(found),
                REP_ERR_UNSUP => return Ok(None),
                other => {
                    return Err(protocol_error(format!(
                        "unexpected reply {other:#x} to LIST_META_CONTEXT"
                    )))
                }
            }
        }
    }

    async fn set_meta_contexts(&mut self, dirty: bool) -> ImageResult<()> {
        let bitmap_query;
        let mut queries = vec![BASE_ALLOCATION];
        if dirty {
            // Unwrap is safe, connect() resolved the bitmap before this.
            bitmap_query = format!(
                "{}{}",
                QEMU_DIRTY_BITMAP,
                self.dirty_bitmap.as_deref().unwrap()
            );
            queries.push(&bitmap_query);
        } else {
            // Required to detect holes in qcow2 images; a server that does
            // not know this context simply does not select it.
            queries.push(QEMU_ALLOCATION_DEPTH);
        }

        let data = self.meta_context_data(&queries);
        self.send_option(OPT_SET_META_CONTEXT, &data).await?;

        loop {
            let (reply, data) = self.recv_option_reply(OPT_SET_META_CONTEXT).await?;
            match reply {
                REP_META_CONTEXT => {
                    if data.len() < 4 {
                        return Err(protocol_error("short meta context reply".into()));
                    }
                    let id = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
                    let name = String::from_utf8_lossy(&data[4..]).to_string();
                    let context = if name == BASE_ALLOCATION {
                        MetaContext::BaseAllocation
                    } else if name == QEMU_ALLOCATION_DEPTH {
                        MetaContext::AllocationDepth
                    } else if name.starts_with(QEMU_DIRTY_BITMAP) {
                        MetaContext::DirtyBitmap
                    } else {
                        debug!("ignoring unknown meta context {name:?}");
                        continue;
                    };
                    self.meta_contexts.insert(id, context);
                }
                REP_ACK => return Ok(()),
                // Negotiation without meta contexts is still usable for I/O.
                REP_ERR_UNSUP => return Ok(()),
                other => {
                    return Err(protocol_error(format!(
                        "unexpected reply {other:#x} to SET_META_CONTEXT"
                    )))
                }
            }
        }
    }

    async fn go(&mut self) -> ImageResult<()> {
        let export = self.url.export.clone();
        let mut data = Vec::with_capacity(4 + export.len() + 2);
        data.extend_from_slice(&(export.len() as u32).to_be_bytes());
        data.extend_from_slice(export.as_bytes());
        // No information requests; the server sends what it has.
        data.extend_from_slice(&0u16.to_be_bytes());
        self.send_option(OPT_GO, &data).await?;

        let mut have_export_info = false;
        loop {
            let (reply, data) = self.recv_option_reply(OPT_GO).await?;
            match reply {
                REP_INFO => {
                    if data.len() < 2 {
                        return Err(protocol_error("short info reply".into()));
                    }
                    let info_type = u16::from_be_bytes([data[0], data[1]]);
                    match info_type {
                        INFO_EXPORT if data.len() >= 12 => {
                            self.export_size = u64::from_be_bytes(
                                data[2..10].try_into().unwrap(),
                            );
                            self.transmission_flags =
                                u16::from_be_bytes([data[10], data[11]]);
                            have_export_info = true;
                        }
                        INFO_BLOCK_SIZE if data.len() >= 14 => {
                            self.minimum_block_size =
                                u32::from_be_bytes(data[2..6].try_into().unwrap());
                            self.preferred_block_size =
                                u32::from_be_bytes(data[6..10].try_into().unwrap());
                            self.maximum_block_size =
                                u32::from_be_bytes(data[10..14].try_into().unwrap());
                        }
                        _ => {
                            debug!("ignoring info type {info_type}");
                        }
                    }
                }
                REP_ACK => {
                    if !have_export_info {
                        return Err(protocol_error(
                            "server acknowledged GO without export info".into(),
                        ));
                    }
                    return Ok(());
                }
                reply if reply & REP_ERR_BIT != 0 => {
                    let message = String::from_utf8_lossy(&data).to_string();
                    return Err(Error::NotFound(format!(
                        "NBD export {:?} not available: {}",
                        self.url.export, message
                    )));
                }
                other => {
                    return Err(protocol_error(format!(
                        "unexpected reply {other:#x} to GO"
                    )))
                }
            }
        }
    }

    /// Encode export name + queries for the meta context options.
    fn meta_context_data(&self, queries: &[&str]) -> Vec<u8> {
        let export = &self.url.export;
        let mut data = Vec::new();
        data.extend_from_slice(&(export.len() as u32).to_be_bytes());
        data.extend_from_slice(export.as_bytes());
        data.extend_from_slice(&(queries.len() as u32).to_be_bytes());
        for query in queries {
            data.extend_from_slice(&(query.len() as u32).to_be_bytes());
            data.extend_from_slice(query.as_bytes());
        }
        data
    }

    async fn send_option(&mut self, option: u32, data: &[u8]) -> ImageResult<()> {
        self.stream.write_u64(IHAVEOPT).await?;
        self.stream.write_u32(option).await?;
        self.stream.write_u32(data.len() as u32).await?;
        if !data.is_empty() {
            self.stream.write_all(data).await?;
        }
        self.stream.flush().await?;
        Ok(())
    }

    async fn recv_option_reply(&mut self, option: u32) -> ImageResult<(u32, Vec<u8>)> {
        let magic = self.stream.read_u64().await?;
        if magic != OPT_REPLY_MAGIC {
            return Err(protocol_error(format!("bad option reply magic {magic:#x}")));
        }
        let reply_option = self.stream.read_u32().await?;
        if reply_option != option {
            return Err(protocol_error(format!(
                "reply for option {reply_option}, expected {option}"
            )));
        }
        let reply_type = self.stream.read_u32().await?;
        let data_len = self.stream.read_u32().await? as usize;
        if data_len > MAX_OPTION_DATA {
            return Err(protocol_error(format!("option reply too large: {data_len}")));
        }
        let mut data = vec![0u8; data_len];
        if data_len > 0 {
            self.stream.read_exact(&mut data).await?;
        }
        Ok((reply_type, data))
    }

    // ─── Transmission plumbing ──────────────────────────────────────────────

    fn next_cookie(&mut self) -> u64 {
        self.cookie += 1;
        self.cookie
    }

    async fn send_cmd(
        &mut self,
        flags: u16,
        cmd: u16,
        offset: u64,
        length: u32,
        payload: Option<&[u8]>,
    ) -> ImageResult<u64> {
        let cookie = self.next_cookie();
        self.stream.write_u32(REQUEST_MAGIC).await?;
        self.stream.write_u16(flags).await?;
        self.stream.write_u16(cmd).await?;
        self.stream.write_u64(cookie).await?;
        self.stream.write_u64(offset).await?;
        self.stream.write_u32(length).await?;
        if let Some(payload) = payload {
            self.stream.write_all(payload).await?;
        }
        self.stream.flush().await?;
        Ok(cookie)
    }

    /// Receive a reply for a command returning no data.
    async fn recv_ack(&mut self, cookie: u64) -> ImageResult<Result<(), CmdError>> {
        let magic = self.stream.read_u32().await?;
        match magic {
            SIMPLE_REPLY_MAGIC => {
                let error = self.stream.read_u32().await?;
                self.check_cookie(cookie).await?;
                if error != NBD_OK {
                    return Ok(Err(CmdError {
                        code: error,
                        message: "server error".into(),
                    }));
                }
                Ok(Ok(()))
            }
            STRUCTURED_REPLY_MAGIC => {
                let mut failure = None;
                loop {
                    let chunk = self.recv_chunk_header(cookie).await?;
                    match chunk.chunk_type {
                        REPLY_TYPE_NONE => {
                            self.skip_chunk(chunk.length).await?;
                        }
                        t if t & REPLY_TYPE_ERR_BIT != 0 => {
                            let err = self.read_error_chunk(chunk.length).await?;
                            failure.get_or_insert(err);
                        }
                        t => {
                            return Err(protocol_error(format!(
                                "unexpected chunk type {t:#x} in ack reply"
                            )));
                        }
                    }
                    if chunk.done {
                        return Ok(match failure {
                            Some(err) => Err(err),
                            None => Ok(()),
                        });
                    }
                    self.expect_structured_magic().await?;
                }
            }
            other => Err(protocol_error(format!("bad reply magic {other:#x}"))),
        }
    }

    /// Receive a READ reply into `buf`, handling both simple replies and
    /// structured data/hole chunks.
    async fn recv_read_reply(
        &mut self,
        cookie: u64,
        offset: u64,
        buf: &mut [u8],
    ) -> ImageResult<Result<(), CmdError>> {
        let magic = self.stream.read_u32().await?;
        match magic {
            SIMPLE_REPLY_MAGIC => {
                let error = self.stream.read_u32().await?;
                self.check_cookie(cookie).await?;
                if error != NBD_OK {
                    // A simple error reply to READ carries no data; the
                    // connection stays usable.
                    return Ok(Err(CmdError {
                        code: error,
                        message: "server error".into(),
                    }));
                }
                self.stream.read_exact(buf).await?;
                Ok(Ok(()))
            }
            STRUCTURED_REPLY_MAGIC => {
                let mut failure = None;
                loop {
                    let chunk = self.recv_chunk_header(cookie).await?;
                    match chunk.chunk_type {
                        REPLY_TYPE_NONE => {
                            self.skip_chunk(chunk.length).await?;
                        }
                        REPLY_TYPE_OFFSET_DATA => {
                            if chunk.length < 8 {
                                return Err(protocol_error("short data chunk".into()));
                            }
                            let chunk_offset = self.stream.read_u64().await?;
                            let data_len = (chunk.length - 8) as usize;
                            let dst = chunk_slice(buf, offset, chunk_offset, data_len)?;
                            self.stream.read_exact(dst).await?;
                        }
                        REPLY_TYPE_OFFSET_HOLE => {
                            if chunk.length != 12 {
                                return Err(protocol_error("bad hole chunk".into()));
                            }
                            let chunk_offset = self.stream.read_u64().await?;
                            let hole_len = self.stream.read_u32().await? as usize;
                            let dst = chunk_slice(buf, offset, chunk_offset, hole_len)?;
                            dst.fill(0);
                        }
                        t if t & REPLY_TYPE_ERR_BIT != 0 => {
                            let err = self.read_error_chunk(chunk.length).await?;
                            failure.get_or_insert(err);
                        }
                        t => {
                            return Err(protocol_error(format!(
                                "unexpected chunk type {t:#x} in read reply"
                            )));
                        }
                    }
                    if chunk.done {
                        return Ok(match failure {
                            Some(err) => Err(err),
                            None => Ok(()),
                        });
                    }
                    self.expect_structured_magic().await?;
                }
            }
            other => Err(protocol_error(format!("bad reply magic {other:#x}"))),
        }
    }

    async fn recv_block_status_reply(
        &mut self,
        cookie: u64,
    ) -> ImageResult<Result<HashMap<MetaContext, Vec<RawExtent>>, CmdError>> {
        let magic = self.stream.read_u32().await?;
        if magic != STRUCTURED_REPLY_MAGIC {
            return Err(protocol_error(format!(
                "expected structured reply to BLOCK_STATUS, got magic {magic:#x}"
            )));
        }

        let mut result: HashMap<MetaContext, Vec<RawExtent>> = HashMap::new();
        let mut failure = None;
        loop {
            let chunk = self.recv_chunk_header(cookie).await?;
            match chunk.chunk_type {
                REPLY_TYPE_NONE => {
                    self.skip_chunk(chunk.length).await?;
                }
                REPLY_TYPE_BLOCK_STATUS => {
                    if chunk.length < 4 + 8 || (chunk.length - 4) % 8 != 0 {
                        return Err(protocol_error("bad block status chunk".into()));
                    }
                    let context_id = self.stream.read_u32().await?;
                    let count = (chunk.length - 4) / 8;
                    let context = self.meta_contexts.get(&context_id).copied();
                    for _ in 0..count {
                        let length = self.stream.read_u32().await?;
                        let flags = self.stream.read_u32().await?;
                        if length == 0 {
                            return Err(protocol_error("zero length extent".into()));
                        }
                        if let Some(context) = context {
                            result
                                .entry(context)
                                .or_default()
                                .push(RawExtent { length, flags });
                        }
                    }
                }
                t if t & REPLY_TYPE_ERR_BIT != 0 => {
                    let err = self.read_error_chunk(chunk.length).await?;
                    failure.get_or_insert(err);
                }
                t => {
                    return Err(protocol_error(format!(
                        "unexpected chunk type {t:#x} in block status reply"
                    )));
                }
            }
            if chunk.done {
                return Ok(match failure {
                    Some(err) => Err(err),
                    None if result.is_empty() => Err(CmdError {
                        code: NBD_EIO,
                        message: "server sent no block status".into(),
                    }),
                    None => Ok(result),
                });
            }
            self.expect_structured_magic().await?;
        }
    }

    /// Read a structured chunk header. The caller has already consumed the
    /// chunk magic.
    async fn recv_chunk_header(&mut self, cookie: u64) -> ImageResult<ChunkHeader> {
        let flags = self.stream.read_u16().await?;
        let chunk_type = self.stream.read_u16().await?;
        self.check_cookie(cookie).await?;
        let length = self.stream.read_u32().await?;
        Ok(ChunkHeader {
            done: flags & REPLY_FLAG_DONE != 0,
            chunk_type,
            length,
        })
    }

    async fn expect_structured_magic(&mut self) -> ImageResult<()> {
        let magic = self.stream.read_u32().await?;
        if magic != STRUCTURED_REPLY_MAGIC {
            return Err(protocol_error(format!("bad chunk magic {magic:#x}")));
        }
        Ok(())
    }

    async fn check_cookie(&mut self, cookie: u64) -> ImageResult<()> {
        let reply_cookie = self.stream.read_u64().await?;
        if reply_cookie != cookie {
            return Err(protocol_error(format!(
                "reply cookie {reply_cookie} does not match request {cookie}"
            )));
        }
        Ok(())
    }

    async fn skip_chunk(&mut self, length: u32) -> ImageResult<()> {
        let mut remaining = length as usize;
        let mut sink = [0u8; 512];
        while remaining > 0 {
            let n = remaining.min(sink.len());
            self.stream.read_exact(&mut sink[..n]).await?;
            remaining -= n;
        }
        Ok(())
    }

    async fn read_error_chunk(&mut self, length: u32) -> ImageResult<CmdError> {
        if length < 6 {
            return Err(protocol_error("short error chunk".into()));
        }
        let code = self.stream.read_u32().await?;
        let msg_len = self.stream.read_u16().await? as usize;
        if 6 + msg_len > length as usize {
            return Err(protocol_error("bad error chunk message length".into()));
        }
        let mut msg = vec![0u8; msg_len];
        self.stream.read_exact(&mut msg).await?;
        // ERROR_OFFSET carries a trailing offset we don't need.
        self.skip_chunk(length - 6 - msg_len as u32).await?;
        let message = if msg.is_empty() {
            "server error".to_string()
        } else {
            String::from_utf8_lossy(&msg).to_string()
        };
        Ok(CmdError { code, message })
    }
}

struct ChunkHeader {
    done: bool,
    chunk_type: u16,
    length: u32,
}

fn protocol_error(msg: String) -> Error {
    Error::Internal(format!("NBD protocol error: {msg}"))
}

fn check_request(offset: u64, length: u64, export_size: u64) -> ImageResult<()> {
    if length > MAX_NBD_REQUEST {
        return Err(Error::BadRequest(format!(
            "NBD request length {length} exceeds {MAX_NBD_REQUEST}"
        )));
    }
    if offset.checked_add(length).map_or(true, |end| end > export_size) {
        return Err(Error::RangeNotSatisfiable { size: export_size });
    }
    Ok(())
}

/// Slice of `buf` corresponding to a structured chunk at `chunk_offset`.
fn chunk_slice(
    buf: &mut [u8],
    request_offset: u64,
    chunk_offset: u64,
    len: usize,
) -> ImageResult<&mut [u8]> {
    let start = chunk_offset
        .checked_sub(request_offset)
        .ok_or_else(|| protocol_error("chunk before requested range".into()))?
        as usize;
    let end = start
        .checked_add(len)
        .filter(|end| *end <= buf.len())
        .ok_or_else(|| protocol_error("chunk after requested range".into()))?;
    Ok(&mut buf[start..end])
}
