//! Extent queries over BLOCK_STATUS.
//!
//! The NBD spec is liberal about block status replies: the server may return
//! a single extent per request, stop short of the requested range, let the
//! last extent exceed it, or split one on-storage extent into several with
//! identical flags. This module issues as many BLOCK_STATUS calls as needed,
//! clips the tail, merges same-flag neighbors, and zips the two selected
//! meta contexts into one flag stream.

use std::collections::HashMap;

use imageio_proto::units::GIB;
use imageio_proto::{Error, ImageResult};

use crate::client::{Client, MetaContext, RawExtent};

// Private flag bits, chosen so extents from different contexts can be
// merged into a single value.

/// base:allocation: range is unallocated on the server.
pub const STATE_HOLE: u32 = 1 << 0;
/// base:allocation: range reads as zeroes.
pub const STATE_ZERO: u32 = 1 << 1;
/// qemu:dirty-bitmap: range was modified since the checkpoint.
pub const EXTENT_DIRTY: u32 = 1 << 2;
/// qemu:allocation-depth: range is absent from every layer of the image, so
/// reads are satisfied by the backing chain (a real hole).
pub const EXTENT_BACKING: u32 = 1 << 3;

/// NBD limits one block status request to 4 GiB - 1; a smaller step also
/// bounds the extents held in memory for very fragmented images.
const MAX_STEP: u64 = 2 * GIB;

/// Extent with private flag bits, length mutable for merging and clipping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NbdExtent {
    pub length: u64,
    pub flags: u32,
}

impl NbdExtent {
    pub fn new(length: u64, flags: u32) -> Self {
        NbdExtent { length, flags }
    }

    /// From a raw per-context extent, remapping wire flags to private bits.
    fn from_raw(raw: RawExtent, context: MetaContext) -> Self {
        let flags = match context {
            // Remainder of the flags field is reserved; ignore unknown bits.
            MetaContext::BaseAllocation => raw.flags & (STATE_HOLE | STATE_ZERO),
            MetaContext::DirtyBitmap => {
                if raw.flags & 1 != 0 {
                    EXTENT_DIRTY
                } else {
                    0
                }
            }
            // Depth 0 means no layer of this image allocates the range.
            MetaContext::AllocationDepth => {
                if raw.flags == 0 {
                    EXTENT_BACKING
                } else {
                    0
                }
            }
        };
        NbdExtent::new(raw.length as u64, flags)
    }

    pub fn zero(&self) -> bool {
        self.flags & STATE_ZERO != 0
    }

    /// True only for ranges read from the backing chain. Unallocated ranges
    /// of a raw image are not holes.
    pub fn hole(&self) -> bool {
        self.flags & EXTENT_BACKING != 0
    }

    pub fn dirty(&self) -> bool {
        self.flags & EXTENT_DIRTY != 0
    }
}

/// Query all extents for `[offset, offset + length)`.
///
/// With `dirty` the dirty bitmap context is zipped with base allocation;
/// otherwise allocation depth is zipped in when the server selected it.
/// Returned extents are ascending, gap-free, clipped to the range, and
/// merged so no two neighbors share flags.
pub async fn extents(
    client: &mut Client,
    offset: u64,
    length: u64,
    dirty: bool,
) -> ImageResult<Vec<NbdExtent>> {
    let end = offset
        .checked_add(length)
        .filter(|end| *end <= client.export_size())
        .ok_or(Error::RangeNotSatisfiable {
            size: client.export_size(),
        })?;

    let mut result: Vec<NbdExtent> = Vec::new();
    let mut pos = offset;

    while pos < end {
        let step = (end - pos).min(MAX_STEP) as u32;
        let reply = client.block_status(pos, step).await?;

        let base = take_context(&reply, MetaContext::BaseAllocation)?;
        let extents = if dirty {
            let bitmap = take_context(&reply, MetaContext::DirtyBitmap)?;
            merged(base, bitmap)
        } else if reply.contains_key(&MetaContext::AllocationDepth) {
            let depth = take_context(&reply, MetaContext::AllocationDepth)?;
            merged(base, depth)
        } else {
            base
        };

        if extents.is_empty() {
            return Err(Error::Internal("NBD server sent no extents".into()));
        }

        for mut ext in extents {
            // The last extent of a reply may exceed the requested range.
            if pos + ext.length > end {
                ext.length = end - pos;
            }
            pos += ext.length;
            push_merged(&mut result, ext);

            // A compliant server sends nothing past the request; don't
            // report wrong data if it does anyway.
            if pos == end {
                break;
            }
        }
    }

    Ok(result)
}

fn take_context(
    reply: &HashMap<MetaContext, Vec<RawExtent>>,
    context: MetaContext,
) -> ImageResult<Vec<NbdExtent>> {
    let raw = reply.get(&context).ok_or_else(|| {
        Error::Internal(format!("NBD reply missing {context:?} extents"))
    })?;
    Ok(raw
        .iter()
        .map(|r| NbdExtent::from_raw(*r, context))
        .collect())
}

fn push_merged(result: &mut Vec<NbdExtent>, ext: NbdExtent) {
    match result.last_mut() {
        Some(cur) if cur.flags == ext.flags => cur.length += ext.length,
        _ => result.push(ext),
    }
}

/// Zip two extent lists with distinct flag bits, yielding extents carrying
/// flags from both. Stops when either list is consumed.
pub fn merged(extents_a: Vec<NbdExtent>, extents_b: Vec<NbdExtent>) -> Vec<NbdExtent> {
    let mut out = Vec::new();
    let mut iter_a = extents_a.into_iter();
    let mut iter_b = extents_b.into_iter();
    let mut a: Option<NbdExtent> = None;
    let mut b: Option<NbdExtent> = None;

    loop {
        let Some(cur_a) = a.or_else(|| iter_a.next()) else {
            return out;
        };
        let Some(cur_b) = b.or_else(|| iter_b.next()) else {
            return out;
        };

        let flags = cur_a.flags | cur_b.flags;
        if cur_a.length == cur_b.length {
            out.push(NbdExtent::new(cur_a.length, flags));
            a = None;
            b = None;
        } else if cur_a.length > cur_b.length {
            out.push(NbdExtent::new(cur_b.length, flags));
            a = Some(NbdExtent::new(cur_a.length - cur_b.length, cur_a.flags));
            b = None;
        } else {
            out.push(NbdExtent::new(cur_a.length, flags));
            a = None;
            b = Some(NbdExtent::new(cur_b.length - cur_a.length, cur_b.flags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merged_equal_lengths() {
        let a = vec![NbdExtent::new(100, STATE_ZERO)];
        let b = vec![NbdExtent::new(100, EXTENT_DIRTY)];
        assert_eq!(
            merged(a, b),
            vec![NbdExtent::new(100, STATE_ZERO | EXTENT_DIRTY)]
        );
    }

    #[test]
    fn test_merged_a_longer() {
        let a = vec![NbdExtent::new(300, STATE_ZERO)];
        let b = vec![
            NbdExtent::new(100, EXTENT_DIRTY),
            NbdExtent::new(200, 0),
        ];
        assert_eq!(
            merged(a, b),
            vec![
                NbdExtent::new(100, STATE_ZERO | EXTENT_DIRTY),
                NbdExtent::new(200, STATE_ZERO),
            ]
        );
    }

    #[test]
    fn test_merged_b_longer() {
        let a = vec![
            NbdExtent::new(100, 0),
            NbdExtent::new(100, STATE_ZERO | STATE_HOLE),
        ];
        let b = vec![NbdExtent::new(200, EXTENT_BACKING)];
        assert_eq!(
            merged(a, b),
            vec![
                NbdExtent::new(100, EXTENT_BACKING),
                NbdExtent::new(100, STATE_ZERO | STATE_HOLE | EXTENT_BACKING),
            ]
        );
    }

    #[test]
    fn test_merged_stops_at_shorter_list() {
        let a = vec![NbdExtent::new(100, 0)];
        let b = vec![NbdExtent::new(100, 0), NbdExtent::new(100, EXTENT_DIRTY)];
        assert_eq!(merged(a, b), vec![NbdExtent::new(100, 0)]);
    }

    #[test]
    fn test_flag_accessors() {
        let ext = NbdExtent::new(100, STATE_ZERO | STATE_HOLE);
        assert!(ext.zero());
        // STATE_HOLE alone does not make a qcow2 hole.
        assert!(!ext.hole());

        let ext = NbdExtent::new(100, STATE_ZERO | EXTENT_BACKING);
        assert!(ext.hole());

        let ext = NbdExtent::new(100, EXTENT_DIRTY);
        assert!(ext.dirty());
    }

    #[test]
    fn test_from_raw_remaps_flags() {
        let raw = RawExtent { length: 64, flags: 0b111 };
        let ext = NbdExtent::from_raw(raw, MetaContext::BaseAllocation);
        assert_eq!(ext.flags, STATE_HOLE | STATE_ZERO);

        let ext = NbdExtent::from_raw(
            RawExtent { length: 64, flags: 1 },
            MetaContext::DirtyBitmap,
        );
        assert_eq!(ext.flags, EXTENT_DIRTY);

        // Allocation depth 0 marks a backing-chain hole; any depth does not.
        let ext = NbdExtent::from_raw(
            RawExtent { length: 64, flags: 0 },
            MetaContext::AllocationDepth,
        );
        assert_eq!(ext.flags, EXTENT_BACKING);
        let ext = NbdExtent::from_raw(
            RawExtent { length: 64, flags: 1 },
            MetaContext::AllocationDepth,
        );
        assert_eq!(ext.flags, 0);
    }
}
