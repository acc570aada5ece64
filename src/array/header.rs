//! # Node Header
//!
//! Every array node starts with a 16-byte header encoding the element layout:
//!
//! ```text
//! Offset  Size  Description
//! ------  ----  --------------------------------------------
//! 0       1     flags: HAS_REFS (0x01), STRINGS (0x02)
//! 1       1     reserved (zero)
//! 2       2     width: bytes per element
//! 4       4     size: element count
//! 8       8     capacity: total allocated bytes incl. header
//! ```
//!
//! Int and ref nodes use widths 1/2/4/8 (little-endian values); string nodes
//! use power-of-two widths up to `MAX_STRING_WIDTH`, each element padded with
//! at least one NUL byte. `capacity` covers the whole allocation so a node
//! can grow in place before relocating, and so `free` returns the exact
//! range that was handed out.
//!
//! All multi-byte fields are little-endian via zerocopy wrapper types; a
//! header can be read straight off the mapped file without copying.
//!
//! Header validation is the consistency boundary from the error taxonomy: a
//! ref that does not decode to a valid header is rejected at attach time,
//! not deep inside a later traversal.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::alloc::{Ref, SlabAlloc};

pub const NODE_HEADER_SIZE: u64 = 16;

pub const FLAG_HAS_REFS: u8 = 0x01;
pub const FLAG_STRINGS: u8 = 0x02;
const KNOWN_FLAGS: u8 = FLAG_HAS_REFS | FLAG_STRINGS;

/// Widest string element, bounding stored strings to `MAX_STRING_WIDTH - 1`
/// bytes.
pub const MAX_STRING_WIDTH: usize = 1024;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct NodeHeader {
    flags: u8,
    reserved: u8,
    width: U16,
    size: U32,
    capacity: U64,
}

const _: () = assert!(std::mem::size_of::<NodeHeader>() == NODE_HEADER_SIZE as usize);

impl NodeHeader {
    pub fn new(flags: u8, width: u16, size: u32, capacity: u64) -> Self {
        Self {
            flags,
            reserved: 0,
            width: U16::new(width),
            size: U32::new(size),
            capacity: U64::new(capacity),
        }
    }

    /// Reads and validates the header of the node at `ref_`.
    pub fn read(alloc: &SlabAlloc, ref_: Ref) -> Result<Self> {
        let bytes = alloc.bytes(ref_, NODE_HEADER_SIZE)?;
        let header = *Self::ref_from_bytes(bytes)
            .map_err(|e| eyre::eyre!("failed to decode node header at ref {}: {:?}", ref_, e))?;
        header.validate(ref_)?;
        Ok(header)
    }

    fn validate(&self, ref_: Ref) -> Result<()> {
        ensure!(
            self.flags & !KNOWN_FLAGS == 0,
            "corrupt node at ref {}: unknown flags {:#04x}",
            ref_,
            self.flags
        );
        let width = self.width() as usize;
        if self.is_strings() {
            ensure!(
                self.flags & FLAG_HAS_REFS == 0,
                "corrupt node at ref {}: string node marked as holding refs",
                ref_
            );
            ensure!(
                width.is_power_of_two() && width <= MAX_STRING_WIDTH,
                "corrupt node at ref {}: invalid string width {}",
                ref_,
                width
            );
        } else {
            ensure!(
                matches!(width, 1 | 2 | 4 | 8),
                "corrupt node at ref {}: invalid element width {}",
                ref_,
                width
            );
        }
        ensure!(
            self.capacity() % 8 == 0 && self.capacity() >= self.byte_size(),
            "corrupt node at ref {}: capacity {} is smaller than payload {}",
            ref_,
            self.capacity(),
            self.byte_size()
        );
        Ok(())
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn has_refs(&self) -> bool {
        self.flags & FLAG_HAS_REFS != 0
    }

    pub fn is_strings(&self) -> bool {
        self.flags & FLAG_STRINGS != 0
    }

    /// Header plus payload, without the unused capacity tail.
    pub fn byte_size(&self) -> u64 {
        NODE_HEADER_SIZE + self.size() as u64 * self.width() as u64
    }

    crate::zerocopy_getters! {
        width: u16,
        size: u32,
        capacity: u64,
    }
}

/// Smallest byte width that can represent `value`.
pub(crate) fn width_for(value: u64) -> usize {
    match value {
        0..=0xFF => 1,
        0x100..=0xFFFF => 2,
        0x1_0000..=0xFFFF_FFFF => 4,
        _ => 8,
    }
}

/// Reads the `ndx`-th fixed-width little-endian element from a payload.
pub(crate) fn read_elem(payload: &[u8], width: usize, ndx: usize) -> u64 {
    let start = ndx * width;
    let mut buf = [0u8; 8];
    buf[..width].copy_from_slice(&payload[start..start + width]);
    u64::from_le_bytes(buf)
}

/// Writes the `ndx`-th fixed-width little-endian element into a payload.
pub(crate) fn write_elem(payload: &mut [u8], width: usize, ndx: usize, value: u64) {
    let start = ndx * width;
    payload[start..start + width].copy_from_slice(&value.to_le_bytes()[..width]);
}
