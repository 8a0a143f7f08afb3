//! NBD protocol constants.

// ─── Handshake ──────────────────────────────────────────────────────────────

/// Initial server magic: ASCII "NBDMAGIC"
pub const NBDMAGIC: u64 = 0x4e42444d41474943;
/// Fixed newstyle negotiation magic: ASCII "IHAVEOPT"
pub const IHAVEOPT: u64 = 0x49484156454f5054;
/// Server option reply magic
pub const OPT_REPLY_MAGIC: u64 = 0x3e889045565a9;

// Handshake flags (server → client, 16-bit)
pub const FLAG_FIXED_NEWSTYLE: u16 = 0x0001;
pub const FLAG_NO_ZEROES: u16 = 0x0002;

// Client flags (client → server, 32-bit)
pub const FLAG_C_FIXED_NEWSTYLE: u32 = 0x0001;
pub const FLAG_C_NO_ZEROES: u32 = 0x0002;

// Option types (32-bit)
pub const OPT_ABORT: u32 = 2;
pub const OPT_GO: u32 = 7;
pub const OPT_STRUCTURED_REPLY: u32 = 8;
pub const OPT_LIST_META_CONTEXT: u32 = 9;
pub const OPT_SET_META_CONTEXT: u32 = 10;

// Option reply types (32-bit)
pub const REP_ACK: u32 = 1;
pub const REP_INFO: u32 = 3;
pub const REP_META_CONTEXT: u32 = 4;
pub const REP_ERR_UNSUP: u32 = 0x80000001;
/// High bit set on all error replies.
pub const REP_ERR_BIT: u32 = 0x80000000;

// Info types carried in REP_INFO
pub const INFO_EXPORT: u16 = 0;
pub const INFO_BLOCK_SIZE: u16 = 3;

// Transmission flags (per-export, 16-bit)
pub const FLAG_HAS_FLAGS: u16 = 0x0001;
pub const FLAG_READ_ONLY: u16 = 0x0002;
pub const FLAG_SEND_FLUSH: u16 = 0x0004;
pub const FLAG_SEND_FUA: u16 = 0x0008;
pub const FLAG_SEND_TRIM: u16 = 0x0020;
pub const FLAG_SEND_WRITE_ZEROES: u16 = 0x0040;
pub const FLAG_CAN_MULTI_CONN: u16 = 0x0100;

// ─── Transmission ───────────────────────────────────────────────────────────

pub const REQUEST_MAGIC: u32 = 0x25609513;
pub const SIMPLE_REPLY_MAGIC: u32 = 0x67446698;
pub const STRUCTURED_REPLY_MAGIC: u32 = 0x668e33ef;

// Command types (16-bit)
pub const CMD_READ: u16 = 0;
pub const CMD_WRITE: u16 = 1;
pub const CMD_DISC: u16 = 2;
pub const CMD_FLUSH: u16 = 3;
pub const CMD_WRITE_ZEROES: u16 = 6;
pub const CMD_BLOCK_STATUS: u16 = 7;

// Command flags (16-bit)
pub const CMD_FLAG_FUA: u16 = 0x0001;
pub const CMD_FLAG_NO_HOLE: u16 = 0x0002;

// Structured reply flags (16-bit)
pub const REPLY_FLAG_DONE: u16 = 0x0001;

// Structured reply chunk types (16-bit)
pub const REPLY_TYPE_NONE: u16 = 0;
pub const REPLY_TYPE_OFFSET_DATA: u16 = 1;
pub const REPLY_TYPE_OFFSET_HOLE: u16 = 2;
pub const REPLY_TYPE_BLOCK_STATUS: u16 = 5;
/// High bit set on all error chunk types.
pub const REPLY_TYPE_ERR_BIT: u16 = 0x8000;
pub const REPLY_TYPE_ERROR: u16 = 0x8001;
pub const REPLY_TYPE_ERROR_OFFSET: u16 = 0x8002;

// Error codes (32-bit, errno values)
pub const NBD_OK: u32 = 0;
pub const NBD_EPERM: u32 = 1;
pub const NBD_EINTR: u32 = 4;
pub const NBD_EIO: u32 = 5;
pub const NBD_ENOMEM: u32 = 12;
pub const NBD_EINVAL: u32 = 22;
pub const NBD_ENOSPC: u32 = 28;
pub const NBD_ENOTSUP: u32 = 95;
pub const NBD_ESHUTDOWN: u32 = 108;

// ─── Meta context names ─────────────────────────────────────────────────────

pub const BASE_ALLOCATION: &str = "base:allocation";
pub const QEMU_ALLOCATION_DEPTH: &str = "qemu:allocation-depth";
pub const QEMU_DIRTY_BITMAP: &str = "qemu:dirty-bitmap:";

/// Default NBD TCP port.
pub const DEFAULT_PORT: u16 = 10809;
