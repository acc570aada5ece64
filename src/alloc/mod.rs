//! # Slab Allocator
//!
//! This module implements `SlabAlloc`, the allocator that owns a store's
//! backing bytes and hands out byte ranges ("refs") for array nodes.
//!
//! ## Address Space
//!
//! Refs form a single flat address space:
//!
//! ```text
//! 0..8           top-ref header (never allocated)
//! 8..baseline    committed bytes of the attached file or buffer (read-only)
//! baseline..     heap-grown slabs, chained in allocation order
//! ```
//!
//! The region below `baseline` is the previously committed version of the
//! store. It is never mutated in place: modifying a node that lives there
//! first relocates it into slab space (copy-on-write), and the vacated file
//! range is recorded for the free-space ledger. `bytes_mut` enforces this
//! invariant structurally by refusing any ref below the baseline.
//!
//! ## Allocation Strategy
//!
//! `alloc` prefers reuse of previously freed slab ranges before appending a
//! new slab. The free list is kept sorted by position, so first fit returns
//! the lowest-positioned range that is large enough. Slabs are at least
//! `MIN_SLAB_SIZE` bytes; the unused tail of a fresh slab goes straight onto
//! the free list. All sizes are rounded up to 8-byte alignment so refs stay
//! aligned.
//!
//! Free ranges never span two slabs, so a returned ref always maps to one
//! contiguous memory region.
//!
//! ## Free-Space Tracking
//!
//! Freeing a slab range returns it to the free list. Freeing a committed
//! range (below baseline) records it in a pending list that the commit
//! protocol drains into the persistent free-space ledger. The
//! `set_track_free` toggle disconnects that bookkeeping for transient
//! scratch arrays that never join the committed tree.
//!
//! ## Diagnostics
//!
//! `enable_debug` turns on allocation statistics (`MemStats`). Recording is
//! observational only; it never alters allocation decisions.

use eyre::{ensure, Result};
use tracing::debug;

use crate::storage::{FileMap, FILE_HEADER_SIZE};

/// Byte offset into the allocator's address space identifying an array node.
pub type Ref = u64;

/// Sentinel ref denoting "no node" / detached state.
pub const NO_REF: Ref = u64::MAX;

/// All allocations are aligned to this many bytes.
pub const ALIGNMENT: u64 = 8;

/// Minimum size of a heap-grown slab.
const MIN_SLAB_SIZE: u64 = 4096;

pub(crate) fn round_up(size: u64) -> u64 {
    (size + ALIGNMENT - 1) & !(ALIGNMENT - 1)
}

/// Allocation statistics recorded when diagnostics are enabled.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemStats {
    pub alloc_count: u64,
    pub free_count: u64,
    pub allocated_bytes: u64,
    pub freed_bytes: u64,
    pub slab_count: usize,
    pub slab_bytes: u64,
    pub free_chunk_count: usize,
}

#[derive(Debug)]
struct Slab {
    start: u64,
    data: Vec<u8>,
}

impl Slab {
    fn end(&self) -> u64 {
        self.start + self.data.len() as u64
    }
}

#[derive(Debug, Clone, Copy)]
struct FreeChunk {
    ref_: Ref,
    size: u64,
}

#[derive(Debug)]
enum Backing {
    /// Transient in-memory store with no committed bytes.
    Scratch,
    /// Read-only attachment over a serialized store image.
    Buffer(Vec<u8>),
    /// Memory-mapped store file.
    File(FileMap),
}

#[derive(Debug)]
pub struct SlabAlloc {
    backing: Backing,
    baseline: u64,
    slabs: Vec<Slab>,
    free_list: Vec<FreeChunk>,
    free_read_only: Vec<(Ref, u64)>,
    track_free: bool,
    read_only: bool,
    max_file_size: Option<u64>,
    debug_enabled: bool,
    stats: MemStats,
}

impl SlabAlloc {
    /// Allocator for a transient in-memory store.
    pub fn scratch() -> Self {
        Self::new(Backing::Scratch, FILE_HEADER_SIZE, false)
    }

    /// Allocator attached to a serialized store image (read-only).
    pub fn from_buffer(buffer: Vec<u8>) -> Result<Self> {
        ensure!(
            buffer.len() as u64 >= FILE_HEADER_SIZE,
            "store buffer is truncated: {} bytes is smaller than the {}-byte header",
            buffer.len(),
            FILE_HEADER_SIZE
        );
        let baseline = buffer.len() as u64;
        Ok(Self::new(Backing::Buffer(buffer), baseline, true))
    }

    /// Allocator attached to a store file mapping.
    pub fn from_file(map: FileMap) -> Self {
        let baseline = map.len();
        let read_only = !map.is_writable();
        Self::new(Backing::File(map), baseline, read_only)
    }

    fn new(backing: Backing, baseline: u64, read_only: bool) -> Self {
        Self {
            backing,
            baseline,
            slabs: Vec::new(),
            free_list: Vec::new(),
            free_read_only: Vec::new(),
            track_free: true,
            read_only,
            max_file_size: None,
            debug_enabled: false,
            stats: MemStats::default(),
        }
    }

    /// Reads the top ref stored in the 8-byte file header.
    pub fn top_ref(&self) -> Ref {
        let header = match &self.backing {
            Backing::Scratch => return 0,
            Backing::Buffer(buf) => &buf[0..8],
            Backing::File(map) => &map.as_slice()[0..8],
        };
        u64::from_le_bytes(header.try_into().expect("header is 8 bytes"))
    }

    /// End of the allocated address space.
    pub fn end(&self) -> u64 {
        self.slabs.last().map_or(self.baseline, Slab::end)
    }

    pub fn baseline(&self) -> u64 {
        self.baseline
    }

    /// Whether a ref points into the committed (immutable) region.
    pub fn is_committed(&self, ref_: Ref) -> bool {
        ref_ < self.baseline
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_writable_file(&self) -> bool {
        matches!(&self.backing, Backing::File(map) if map.is_writable())
    }

    pub fn file(&self) -> Result<&FileMap> {
        match &self.backing {
            Backing::File(map) => Ok(map),
            _ => eyre::bail!("store is not backed by a file"),
        }
    }

    pub fn file_mut(&mut self) -> Result<&mut FileMap> {
        match &mut self.backing {
            Backing::File(map) => Ok(map),
            _ => eyre::bail!("store is not backed by a file"),
        }
    }

    /// Returns a byte range of at least `size` bytes, preferring reuse of a
    /// previously freed slab range over growing the heap.
    pub fn alloc(&mut self, size: u64) -> Result<Ref> {
        ensure!(
            !self.read_only,
            "cannot allocate: store was opened read-only"
        );
        ensure!(size > 0, "cannot allocate zero bytes");

        let size = round_up(size);

        if let Some(pos) = self.free_list.iter().position(|c| c.size >= size) {
            let chunk = self.free_list[pos];
            if chunk.size > size {
                self.free_list[pos] = FreeChunk {
                    ref_: chunk.ref_ + size,
                    size: chunk.size - size,
                };
            } else {
                self.free_list.remove(pos);
            }
            self.record_alloc(size);
            return Ok(chunk.ref_);
        }

        let slab_len = size.max(MIN_SLAB_SIZE);
        let start = self.end();
        self.slabs.push(Slab {
            start,
            data: vec![0u8; slab_len as usize],
        });
        debug!(start, len = slab_len, "appended slab");

        if slab_len > size {
            self.insert_free(start + size, slab_len - size);
        }
        self.record_alloc(size);
        Ok(start)
    }

    /// Marks a byte range reclaimable. Slab ranges return to the free list;
    /// committed ranges are queued for the free-space ledger.
    pub fn free(&mut self, ref_: Ref, size: u64) {
        let size = round_up(size);
        if ref_ >= self.baseline {
            self.insert_free(ref_, size);
        } else if self.track_free {
            self.free_read_only.push((ref_, size));
        }
        if self.debug_enabled {
            self.stats.free_count += 1;
            self.stats.freed_bytes += size;
        }
    }

    /// Immutable access to `len` bytes starting at `ref_`.
    pub fn bytes(&self, ref_: Ref, len: u64) -> Result<&[u8]> {
        let end = ref_
            .checked_add(len)
            .ok_or_else(|| eyre::eyre!("ref range overflows: {} + {}", ref_, len))?;
        ensure!(
            ref_ >= FILE_HEADER_SIZE,
            "ref {} points into the file header",
            ref_
        );

        if end <= self.baseline {
            let backing = match &self.backing {
                Backing::Scratch => eyre::bail!("scratch store has no committed bytes"),
                Backing::Buffer(buf) => buf.as_slice(),
                Backing::File(map) => map.as_slice(),
            };
            return Ok(&backing[ref_ as usize..end as usize]);
        }

        let slab = self.slab_containing(ref_, end)?;
        let offset = (ref_ - slab.start) as usize;
        Ok(&slab.data[offset..offset + len as usize])
    }

    /// Mutable access to `len` bytes starting at `ref_`. Refuses committed
    /// refs: bytes visible to a previously committed version are immutable.
    pub fn bytes_mut(&mut self, ref_: Ref, len: u64) -> Result<&mut [u8]> {
        let end = ref_
            .checked_add(len)
            .ok_or_else(|| eyre::eyre!("ref range overflows: {} + {}", ref_, len))?;
        ensure!(
            ref_ >= self.baseline,
            "ref {} is committed and cannot be mutated in place",
            ref_
        );

        let slab = self.slab_containing(ref_, end)?;
        let start = slab.start;
        let offset = (ref_ - start) as usize;
        let slab = self
            .slabs
            .iter_mut()
            .find(|s| s.start == start)
            .expect("slab was just located");
        Ok(&mut slab.data[offset..offset + len as usize])
    }

    /// Inserts a free chunk at its position-sorted slot, keeping first fit
    /// deterministic: the lowest-positioned range that fits wins.
    fn insert_free(&mut self, ref_: Ref, size: u64) {
        let pos = self.free_list.partition_point(|c| c.ref_ < ref_);
        self.free_list.insert(pos, FreeChunk { ref_, size });
    }

    fn slab_containing(&self, ref_: Ref, end: u64) -> Result<&Slab> {
        let idx = self.slabs.partition_point(|s| s.start <= ref_);
        ensure!(idx > 0, "ref {} is outside the allocated address space", ref_);
        let slab = &self.slabs[idx - 1];
        ensure!(
            ref_ >= slab.start && end <= slab.end(),
            "ref range {}..{} is outside the allocated address space",
            ref_,
            end
        );
        Ok(slab)
    }

    /// Toggles whether freed committed ranges feed the free-space ledger.
    pub fn set_track_free(&mut self, track: bool) {
        self.track_free = track;
    }

    pub fn track_free(&self) -> bool {
        self.track_free
    }

    /// Committed ranges freed since the last commit, pending ledger entry.
    pub fn read_only_frees(&self) -> &[(Ref, u64)] {
        &self.free_read_only
    }

    /// Optional hard cap on the store file size; growth past the cap is an
    /// allocation failure for the commit in progress.
    pub fn set_max_file_size(&mut self, cap: Option<u64>) {
        self.max_file_size = cap;
    }

    pub fn max_file_size(&self) -> Option<u64> {
        self.max_file_size
    }

    /// Discards all uncommitted state and re-anchors the baseline at the end
    /// of the backing. Called after a successful commit or when reattaching
    /// to a different committed version.
    pub fn discard_uncommitted(&mut self) {
        self.slabs.clear();
        self.free_list.clear();
        self.free_read_only.clear();
        self.baseline = match &self.backing {
            Backing::Scratch => FILE_HEADER_SIZE,
            Backing::Buffer(buf) => buf.len() as u64,
            Backing::File(map) => map.len(),
        };
    }

    pub fn enable_debug(&mut self, enable: bool) {
        self.debug_enabled = enable;
    }

    pub fn stats(&self) -> MemStats {
        let mut stats = self.stats;
        stats.slab_count = self.slabs.len();
        stats.slab_bytes = self.slabs.iter().map(|s| s.data.len() as u64).sum();
        stats.free_chunk_count = self.free_list.len();
        stats
    }

    fn record_alloc(&mut self, size: u64) {
        if self.debug_enabled {
            self.stats.alloc_count += 1;
            self.stats.allocated_bytes += size;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_allocations_start_after_header() {
        let mut alloc = SlabAlloc::scratch();

        let ref_ = alloc.alloc(32).unwrap();

        assert_eq!(ref_, FILE_HEADER_SIZE);
        assert!(!alloc.is_committed(ref_));
    }

    #[test]
    fn alloc_rounds_to_alignment() {
        let mut alloc = SlabAlloc::scratch();

        let a = alloc.alloc(3).unwrap();
        let b = alloc.alloc(9).unwrap();

        assert_eq!(a % ALIGNMENT, 0);
        assert_eq!(b % ALIGNMENT, 0);
        assert_eq!(b, a + 8);
    }

    #[test]
    fn freed_range_is_reused() {
        let mut alloc = SlabAlloc::scratch();

        let a = alloc.alloc(64).unwrap();
        let _b = alloc.alloc(64).unwrap();
        alloc.free(a, 64);

        let c = alloc.alloc(48).unwrap();

        assert_eq!(c, a);
    }

    #[test]
    fn first_fit_prefers_the_lowest_position() {
        let mut alloc = SlabAlloc::scratch();

        let a = alloc.alloc(64).unwrap();
        let b = alloc.alloc(64).unwrap();
        let _c = alloc.alloc(64).unwrap();
        alloc.free(b, 64);
        alloc.free(a, 64);

        // Both freed ranges and the slab tail fit; the lowest ref wins, and
        // the split remainder is next in line.
        assert_eq!(alloc.alloc(32).unwrap(), a);
        assert_eq!(alloc.alloc(32).unwrap(), a + 32);
        assert_eq!(alloc.alloc(64).unwrap(), b);
    }

    #[test]
    fn large_allocation_gets_its_own_slab() {
        let mut alloc = SlabAlloc::scratch();

        let a = alloc.alloc(16).unwrap();
        let b = alloc.alloc(2 * MIN_SLAB_SIZE).unwrap();

        assert_eq!(a, FILE_HEADER_SIZE);
        assert_eq!(b, FILE_HEADER_SIZE + MIN_SLAB_SIZE);
        assert_eq!(alloc.end(), FILE_HEADER_SIZE + 3 * MIN_SLAB_SIZE);
    }

    #[test]
    fn bytes_round_trip_within_slab() {
        let mut alloc = SlabAlloc::scratch();
        let ref_ = alloc.alloc(16).unwrap();

        alloc.bytes_mut(ref_, 16).unwrap().copy_from_slice(&[7u8; 16]);

        assert_eq!(alloc.bytes(ref_, 16).unwrap(), &[7u8; 16]);
    }

    #[test]
    fn bytes_rejects_out_of_range_ref() {
        let alloc = SlabAlloc::scratch();

        assert!(alloc.bytes(1 << 30, 8).is_err());
        assert!(alloc.bytes(0, 8).is_err());
    }

    #[test]
    fn committed_bytes_cannot_be_mutated() {
        let mut buffer = vec![0u8; 64];
        buffer[0..8].copy_from_slice(&16u64.to_le_bytes());
        let mut alloc = SlabAlloc::from_buffer(buffer).unwrap();

        assert!(alloc.is_committed(16));
        assert!(alloc.bytes(16, 8).is_ok());
        assert!(alloc.bytes_mut(16, 8).is_err());
    }

    #[test]
    fn read_only_attachment_refuses_allocation() {
        let mut alloc = SlabAlloc::from_buffer(vec![0u8; 8]).unwrap();

        let result = alloc.alloc(16);

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }

    #[test]
    fn committed_frees_feed_the_pending_ledger() {
        let mut buffer = vec![0u8; 64];
        buffer[0..8].copy_from_slice(&16u64.to_le_bytes());
        let mut alloc = SlabAlloc::from_buffer(buffer).unwrap();

        alloc.free(16, 24);

        assert_eq!(alloc.read_only_frees(), &[(16, 24)]);
    }

    #[test]
    fn disconnected_free_space_is_not_tracked() {
        let mut buffer = vec![0u8; 64];
        buffer[0..8].copy_from_slice(&16u64.to_le_bytes());
        let mut alloc = SlabAlloc::from_buffer(buffer).unwrap();

        alloc.set_track_free(false);
        alloc.free(16, 24);

        assert!(alloc.read_only_frees().is_empty());
    }

    #[test]
    fn discard_uncommitted_resets_slabs() {
        let mut alloc = SlabAlloc::scratch();
        let ref_ = alloc.alloc(32).unwrap();
        alloc.free(ref_, 32);

        alloc.discard_uncommitted();

        assert_eq!(alloc.end(), FILE_HEADER_SIZE);
        assert!(alloc.bytes(ref_, 8).is_err());
    }

    #[test]
    fn stats_record_only_when_enabled() {
        let mut alloc = SlabAlloc::scratch();

        alloc.alloc(16).unwrap();
        assert_eq!(alloc.stats().alloc_count, 0);

        alloc.enable_debug(true);
        let a = alloc.alloc(16).unwrap();
        alloc.free(a, 16);

        let stats = alloc.stats();
        assert_eq!(stats.alloc_count, 1);
        assert_eq!(stats.free_count, 1);
        assert_eq!(stats.allocated_bytes, 16);
        assert_eq!(stats.freed_bytes, 16);
        assert_eq!(stats.slab_count, 1);
    }

    #[test]
    fn stats_do_not_alter_allocation_decisions() {
        let mut plain = SlabAlloc::scratch();
        let mut debug = SlabAlloc::scratch();
        debug.enable_debug(true);

        for size in [16u64, 64, 24, 8] {
            assert_eq!(plain.alloc(size).unwrap(), debug.alloc(size).unwrap());
        }
    }
}
