//! Image extents.
//!
//! An extent is a contiguous byte range with uniform content properties.
//! Extents are reported in two contexts: `zero` (content and allocation)
//! and `dirty` (modified since the backup checkpoint). Producers must
//! return extents in ascending order, gap-free, with adjacent extents of
//! identical flags merged.

use serde::{Deserialize, Serialize};

/// Extent in the `zero` context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub start: u64,
    pub length: u64,
    /// Range reads as zeroes.
    pub zero: bool,
    /// Range is unallocated; implies `zero`.
    pub hole: bool,
}

impl Extent {
    pub fn new(start: u64, length: u64, zero: bool, hole: bool) -> Self {
        Extent { start, length, zero, hole }
    }

    /// Range contains data that must be copied.
    pub fn is_data(&self) -> bool {
        !self.zero
    }

    fn same_flags(&self, other: &Extent) -> bool {
        self.zero == other.zero && self.hole == other.hole
    }
}

/// Extent in the `dirty` context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirtyExtent {
    pub start: u64,
    pub length: u64,
    /// Range was modified since the backup checkpoint.
    pub dirty: bool,
    /// Range reads as zeroes.
    pub zero: bool,
}

impl DirtyExtent {
    pub fn new(start: u64, length: u64, dirty: bool, zero: bool) -> Self {
        DirtyExtent { start, length, dirty, zero }
    }

    fn same_flags(&self, other: &DirtyExtent) -> bool {
        self.dirty == other.dirty && self.zero == other.zero
    }
}

/// Merge adjacent extents with identical flags.
pub fn coalesce(extents: Vec<Extent>) -> Vec<Extent> {
    let mut out: Vec<Extent> = Vec::with_capacity(extents.len());
    for ext in extents {
        match out.last_mut() {
            Some(cur) if cur.same_flags(&ext) && cur.start + cur.length == ext.start => {
                cur.length += ext.length;
            }
            _ => out.push(ext),
        }
    }
    out
}

/// Merge adjacent dirty extents with identical flags.
pub fn coalesce_dirty(extents: Vec<DirtyExtent>) -> Vec<DirtyExtent> {
    let mut out: Vec<DirtyExtent> = Vec::with_capacity(extents.len());
    for ext in extents {
        match out.last_mut() {
            Some(cur) if cur.same_flags(&ext) && cur.start + cur.length == ext.start => {
                cur.length += ext.length;
            }
            _ => out.push(ext),
        }
    }
    out
}
