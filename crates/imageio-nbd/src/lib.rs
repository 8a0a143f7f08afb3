//! NBD (Network Block Device) client.
//!
//! Implements the fixed newstyle negotiation with structured replies and
//! meta context selection, and the transmission commands needed for image
//! transfer: READ, WRITE, WRITE_ZEROES, FLUSH, BLOCK_STATUS, DISC.
//!
//! Meta contexts:
//! - `base:allocation` — zero/hole status, always requested.
//! - `qemu:allocation-depth` — distinguishes unallocated qcow2 clusters
//!   (read from the backing chain) from allocated zero clusters.
//! - `qemu:dirty-bitmap:NAME` — incremental backup extents.
//!
//! Wire format reference: <https://github.com/NetworkBlockDevice/nbd/blob/master/doc/proto.md>

mod client;
mod extents;
mod pool;
mod proto;
mod url;

pub use client::{Client, MetaContext, RawExtent};
pub use extents::{extents, merged, NbdExtent, EXTENT_BACKING, EXTENT_DIRTY, STATE_HOLE, STATE_ZERO};
pub use pool::{Pool, PooledClient};
pub use url::{NbdAddress, NbdUrl};
