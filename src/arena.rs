//! The shared memory arena.
//!
//! Every transient buffer in the engine — per-layer activations, pack
//! staging scratch, and the two ping-pong gradient buffers — lives in one
//! flat `Vec<f32>` owned by the [`Arena`]. Layers never hold references
//! into it; they hold [`ArenaRange`] handles (offset + length, `Copy`) and
//! resolve them against the arena at call time. That keeps the borrow
//! checker out of the topology structs while still giving every access a
//! bounds check, and `read_write`/`split_pair_mut` assert at runtime that a
//! read range and a write range never alias.
//!
//! Range handout happens once per session, in the assign-memory pass:
//! a [`Carver`] bump-allocates from the front of a region in the fixed
//! order each layer declared its needs during planning. Persistent ranges
//! (activations, dropout masks) are carved from one region and stay live
//! for the whole session; scratch ranges are shared between sequential
//! siblings, which is why the planner combines scratch with `max` and
//! persistent storage with `sum`.
//!
//! Content is never guaranteed zeroed: any buffer that needs a defined
//! initial value must clear it itself.

use crate::error::{AllocSite, NetError, NetResult};

/// Handle to a sub-range of the arena. Plain offsets, freely copyable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArenaRange {
    pub offset: usize,
    pub len: usize,
}

impl ArenaRange {
    pub const EMPTY: ArenaRange = ArenaRange { offset: 0, len: 0 };

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sub-range relative to this one.
    ///
    /// # Panics
    ///
    /// Panics if the sub-range does not fit.
    pub fn sub(&self, offset: usize, len: usize) -> ArenaRange {
        assert!(
            offset + len <= self.len,
            "sub-range {}+{} exceeds range of {} elements",
            offset,
            len,
            self.len
        );
        ArenaRange {
            offset: self.offset + offset,
            len,
        }
    }

    fn overlaps(&self, other: &ArenaRange) -> bool {
        self.len != 0
            && other.len != 0
            && self.offset < other.offset + other.len
            && other.offset < self.offset + self.len
    }
}

/// The flat storage region shared by a whole network for one session.
#[derive(Debug, Default)]
pub struct Arena {
    data: Vec<f32>,
}

impl Arena {
    pub fn new(buffer: Vec<f32>) -> Self {
        Self { data: buffer }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Drop the backing storage. Outstanding ranges become invalid; the
    /// driver only calls this after every layer has been deinitialized.
    pub fn release(&mut self) -> Vec<f32> {
        std::mem::take(&mut self.data)
    }

    pub fn slice(&self, range: ArenaRange) -> &[f32] {
        &self.data[range.offset..range.offset + range.len]
    }

    pub fn slice_mut(&mut self, range: ArenaRange) -> &mut [f32] {
        &mut self.data[range.offset..range.offset + range.len]
    }

    /// Borrow one range immutably and another mutably.
    ///
    /// # Panics
    ///
    /// Panics if the ranges overlap.
    pub fn read_write(&mut self, read: ArenaRange, write: ArenaRange) -> (&[f32], &mut [f32]) {
        assert!(
            !read.overlaps(&write),
            "aliasing read {:?} against write {:?}",
            read,
            write
        );
        if read.offset <= write.offset {
            let (lo, hi) = self.data.split_at_mut(write.offset);
            (
                &lo[read.offset..read.offset + read.len],
                &mut hi[..write.len],
            )
        } else {
            let (lo, hi) = self.data.split_at_mut(read.offset);
            (
                &hi[..read.len],
                &mut lo[write.offset..write.offset + write.len],
            )
        }
    }

    /// Borrow two disjoint ranges mutably.
    ///
    /// # Panics
    ///
    /// Panics if the ranges overlap.
    pub fn split_pair_mut(
        &mut self,
        a: ArenaRange,
        b: ArenaRange,
    ) -> (&mut [f32], &mut [f32]) {
        assert!(!a.overlaps(&b), "aliasing ranges {:?} and {:?}", a, b);
        if a.offset <= b.offset {
            let (lo, hi) = self.data.split_at_mut(b.offset);
            (&mut lo[a.offset..a.offset + a.len], &mut hi[..b.len])
        } else {
            let (lo, hi) = self.data.split_at_mut(a.offset);
            (&mut hi[..a.len], &mut lo[b.offset..b.offset + b.len])
        }
    }
}

/// Bump allocator over one region of the arena.
///
/// Each layer carves its named buffers from the front of the region it was
/// given, in the same fixed order it declared them during planning, then
/// hands the remainder unchanged to its children.
#[derive(Debug, Clone, Copy)]
pub struct Carver {
    region: ArenaRange,
    cursor: usize,
    site: AllocSite,
}

impl Carver {
    pub fn new(region: ArenaRange, site: AllocSite) -> Self {
        Self {
            region,
            cursor: 0,
            site,
        }
    }

    /// Carve `len` elements from the front of the remaining region.
    pub fn carve(&mut self, len: usize) -> NetResult<ArenaRange> {
        let remaining = self.region.len - self.cursor;
        if len > remaining {
            return Err(NetError::ArenaExhausted {
                site: self.site,
                requested: len,
                remaining,
            });
        }
        let range = self.region.sub(self.cursor, len);
        self.cursor += len;
        Ok(range)
    }

    /// Everything not yet carved. Sequential siblings each receive this
    /// same remainder; they are never live at the same time.
    pub fn remainder(&self) -> ArenaRange {
        self.region.sub(self.cursor, self.region.len - self.cursor)
    }

    pub fn used(&self) -> usize {
        self.cursor
    }
}

/// The peak memory demand of a planned network, reported by `init` so the
/// caller can size the arena buffer before `assign_memory`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRequirement {
    /// Elements needed for an inference-only session.
    pub eval_elements: usize,
    /// Elements needed for a training session (persistent + scratch peak +
    /// both gradient buffers).
    pub train_elements: usize,
    /// Learnable parameter count across the graph (owned storage, not part
    /// of the arena).
    pub parameters: usize,
}
