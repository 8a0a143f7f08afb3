//! Project-wide default values shared by the daemon and the client.

use crate::units::MIB;

/// Default port of the remote (TLS) data listener.
pub const REMOTE_PORT: u16 = 54322;

/// Default port of the control listener when bound to TCP loopback.
pub const CONTROL_PORT: u16 = 54324;

/// Default local data listener socket; the leading `@` selects the
/// abstract namespace.
pub const LOCAL_SOCKET: &str = "@/org/ovirt/imageio";

/// Default transfer buffer size.
pub const BUFFER_SIZE: usize = 8 * MIB as usize;

/// Hard limit on a single NBD request payload, imposed by common servers.
pub const MAX_NBD_REQUEST: u64 = 32 * MIB;

/// Default cap on per-backend connections, bounding max_readers/max_writers.
pub const MAX_CONNECTIONS: u32 = 8;

/// Seconds a ticket may stay at zero connections before it expires.
pub const INACTIVITY_TIMEOUT: u64 = 60;

/// Largest single zero request submitted to a backend. Smaller steps keep
/// cancellation responsive and avoid SCSI timeouts on thin-provisioned LUNs.
pub const MAX_ZERO_STEP: u64 = 128 * MIB;

/// Minimum alignment for direct I/O buffers.
pub const MIN_BLOCK_SIZE: usize = 512;
