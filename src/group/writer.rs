//! # Commit Writer
//!
//! Two serialization paths share this module:
//!
//! - [`serialize_compact`] renders a whole store tree into a fresh byte
//!   stream for `write`/`write_to_mem`. Nodes are written depth-first with
//!   child refs patched to their stream positions and capacities trimmed to
//!   the used size, so a snapshot carries no slack and no garbage. The free
//!   ledger is written empty for the same reason.
//!
//! - [`GroupWriter`] plans an in-place commit of the dirty subtree into the
//!   store file. Planning is pure: it reads the current tree, consumes a
//!   [`FreeSpacePool`] snapshot of the committed ledger, and produces a
//!   [`CommitPlan`] of byte writes. Nothing touches the file until
//!   [`CommitPlan::execute`], which grows the mapping once, copies every
//!   planned node, syncs, and only then swaps the 8-byte top ref at offset
//!   0. A failure at any earlier point leaves the previous version fully
//!   intact, because no planned write ever lands on a byte the previous
//!   version can reach.
//!
//! ## Placement
//!
//! Clean nodes (below the allocator baseline) keep their refs; only dirty
//! nodes are placed. Ref-bearing nodes are re-encoded from their patched
//! child positions since a patched ref may need a wider element. The new
//! ledger arrays and the new top node are always appended at the end of the
//! file, never placed from the pool they describe.

use eyre::{ensure, Result};
use smallvec::SmallVec;
use tracing::debug;

use crate::alloc::{round_up, Ref, SlabAlloc, NO_REF};
use crate::array::header::{
    read_elem, width_for, write_elem, NodeHeader, FLAG_HAS_REFS, NODE_HEADER_SIZE,
};

use super::freespace::{normalize, FreeSpacePool};

/// Slots in the top node, in order.
pub(crate) const TOP_SLOT_NAMES: usize = 0;
pub(crate) const TOP_SLOT_TABLES: usize = 1;
pub(crate) const TOP_SLOT_FREE_POSITIONS: usize = 2;
pub(crate) const TOP_SLOT_FREE_LENGTHS: usize = 3;
pub(crate) const TOP_SLOTS: usize = 4;

/// Reads a node's header and its element values.
fn load_values(alloc: &SlabAlloc, ref_: Ref) -> Result<(NodeHeader, Vec<u64>)> {
    let header = NodeHeader::read(alloc, ref_)?;
    ensure!(
        !header.is_strings(),
        "node at ref {} holds strings, expected ints",
        ref_
    );
    let width = header.width() as usize;
    let size = header.size() as usize;
    let payload = alloc.bytes(ref_ + NODE_HEADER_SIZE, (size * width) as u64)?;
    let values = (0..size).map(|ndx| read_elem(payload, width, ndx)).collect();
    Ok((header, values))
}

/// Encodes an int/ref node at the narrowest width, capacity trimmed to the
/// padded payload.
fn encode_int_node(values: &[u64], has_refs: bool) -> Vec<u8> {
    let width = values.iter().copied().map(width_for).max().unwrap_or(1);
    encode_node(
        if has_refs { FLAG_HAS_REFS } else { 0 },
        width,
        values.len(),
        |payload| {
            for (ndx, value) in values.iter().enumerate() {
                write_elem(payload, width, ndx, *value);
            }
        },
    )
}

fn encode_node(flags: u8, width: usize, size: usize, fill: impl FnOnce(&mut [u8])) -> Vec<u8> {
    let used = NODE_HEADER_SIZE + (size * width) as u64;
    let capacity = round_up(used);
    let header = NodeHeader::new(flags, width as u16, size as u32, capacity);
    let mut bytes = vec![0u8; capacity as usize];
    bytes[..NODE_HEADER_SIZE as usize]
        .copy_from_slice(zerocopy::IntoBytes::as_bytes(&header));
    fill(&mut bytes[NODE_HEADER_SIZE as usize..used as usize]);
    bytes
}

/// Copies a node byte-for-byte with its capacity trimmed to the used size.
fn encode_trimmed_copy(alloc: &SlabAlloc, ref_: Ref, header: &NodeHeader) -> Result<Vec<u8>> {
    let width = header.width() as usize;
    let size = header.size() as usize;
    let payload = alloc.bytes(ref_ + NODE_HEADER_SIZE, (size * width) as u64)?;
    Ok(encode_node(header.flags(), width, size, |dst| {
        dst.copy_from_slice(payload)
    }))
}

/// Serializes the tree under `top_ref` into a standalone store image:
/// 8-byte top ref, then depth-first compact nodes. `NO_REF` produces the
/// canonical empty-store image (a zero header and nothing else).
pub(crate) fn serialize_compact(alloc: &SlabAlloc, top_ref: Ref) -> Result<Vec<u8>> {
    let mut out = vec![0u8; 8];
    if top_ref == NO_REF {
        return Ok(out);
    }

    let (header, top) = load_values(alloc, top_ref)?;
    ensure!(
        header.has_refs() && top.len() >= TOP_SLOTS,
        "corrupt top node at ref {}",
        top_ref
    );

    let names_pos = write_compact_node(alloc, &mut out, top[TOP_SLOT_NAMES])?;
    let tables_pos = write_compact_node(alloc, &mut out, top[TOP_SLOT_TABLES])?;
    // A snapshot contains no garbage, so its ledger is empty.
    let fp_pos = append(&mut out, encode_int_node(&[], false));
    let fl_pos = append(&mut out, encode_int_node(&[], false));
    let top_pos = append(
        &mut out,
        encode_int_node(&[names_pos, tables_pos, fp_pos, fl_pos], true),
    );

    out[0..8].copy_from_slice(&top_pos.to_le_bytes());
    Ok(out)
}

fn write_compact_node(alloc: &SlabAlloc, out: &mut Vec<u8>, ref_: Ref) -> Result<u64> {
    if ref_ == 0 {
        return Ok(0);
    }
    let header = NodeHeader::read(alloc, ref_)?;
    if !header.has_refs() {
        return Ok(append(out, encode_trimmed_copy(alloc, ref_, &header)?));
    }

    let (_, values) = load_values(alloc, ref_)?;
    let mut placed: SmallVec<[u64; 8]> = SmallVec::with_capacity(values.len());
    for child in values {
        placed.push(write_compact_node(alloc, out, child)?);
    }
    Ok(append(out, encode_int_node(&placed, true)))
}

fn append(out: &mut Vec<u8>, bytes: Vec<u8>) -> u64 {
    let pos = out.len() as u64;
    out.extend_from_slice(&bytes);
    pos
}

/// A fully planned commit: every byte write, the resulting file size, the
/// new top ref, and the ledger it persists.
#[derive(Debug)]
pub(crate) struct CommitPlan {
    writes: Vec<(u64, Vec<u8>)>,
    file_size: u64,
    top_ref: Ref,
    ledger: Vec<(u64, u64)>,
}

impl CommitPlan {
    pub fn top_ref(&self) -> Ref {
        self.top_ref
    }

    pub fn ledger(&self) -> &[(u64, u64)] {
        &self.ledger
    }

    /// Applies the plan to the store file. The top-ref header write is the
    /// single visibility boundary; everything before it lands on bytes the
    /// previous version cannot reach.
    pub fn execute(self, alloc: &mut SlabAlloc) -> Result<Ref> {
        let file = alloc.file_mut()?;
        if self.file_size > file.len() {
            file.grow(self.file_size)?;
        }

        let slice = file.as_mut_slice()?;
        for (pos, bytes) in &self.writes {
            let start = *pos as usize;
            slice[start..start + bytes.len()].copy_from_slice(bytes);
        }
        file.sync()?;

        let slice = file.as_mut_slice()?;
        slice[0..8].copy_from_slice(&self.top_ref.to_le_bytes());
        file.sync()?;

        debug!(
            top_ref = self.top_ref,
            file_size = self.file_size,
            nodes = self.writes.len(),
            ledger_entries = self.ledger.len(),
            "commit written"
        );
        Ok(self.top_ref)
    }
}

/// Plans a commit of the dirty tree under `top_ref`.
pub(crate) struct GroupWriter<'a> {
    alloc: &'a SlabAlloc,
    pool: FreeSpacePool,
    file_size: u64,
    writes: Vec<(u64, Vec<u8>)>,
}

impl<'a> GroupWriter<'a> {
    /// `ledger` holds the committed free-space entries (reusable this commit
    /// when `reclaim` allows); `retired` holds committed ranges this commit
    /// makes unreachable beyond those the allocator already tracks, namely
    /// the old ledger nodes themselves.
    pub fn plan(
        alloc: &'a SlabAlloc,
        top_ref: Ref,
        ledger: Vec<(u64, u64)>,
        retired: Vec<(u64, u64)>,
        reclaim: bool,
    ) -> Result<CommitPlan> {
        let file_size = alloc.file()?.len();
        let pool = if reclaim {
            FreeSpacePool::from_entries(ledger)
        } else {
            FreeSpacePool::empty()
        };
        let mut writer = Self {
            alloc,
            pool,
            file_size,
            writes: Vec::new(),
        };

        let (header, top) = load_values(alloc, top_ref)?;
        ensure!(
            header.has_refs() && top.len() >= TOP_SLOTS,
            "corrupt top node at ref {}",
            top_ref
        );

        let names_pos = writer.place(top[TOP_SLOT_NAMES])?;
        let tables_pos = writer.place(top[TOP_SLOT_TABLES])?;

        let pool = std::mem::replace(&mut writer.pool, FreeSpacePool::empty());
        let mut entries = pool.into_remaining();
        entries.extend(retired);
        entries.extend_from_slice(alloc.read_only_frees());
        let ledger = normalize(entries);

        // The ledger nodes and the top are appended past the end of file,
        // never placed from the pool they describe.
        let positions: Vec<u64> = ledger.iter().map(|&(pos, _)| pos).collect();
        let lengths: Vec<u64> = ledger.iter().map(|&(_, len)| len).collect();
        let fp_pos = writer.append(encode_int_node(&positions, false));
        let fl_pos = writer.append(encode_int_node(&lengths, false));
        let top_pos = writer.append(encode_int_node(
            &[names_pos, tables_pos, fp_pos, fl_pos],
            true,
        ));

        if let Some(cap) = alloc.max_file_size() {
            ensure!(
                writer.file_size <= cap,
                "commit would grow the store to {} bytes, past the {}-byte cap",
                writer.file_size,
                cap
            );
        }

        Ok(CommitPlan {
            writes: writer.writes,
            file_size: writer.file_size,
            top_ref: top_pos,
            ledger,
        })
    }

    /// Assigns a file position to the subtree at `ref_`. Clean nodes keep
    /// their refs; a clean node never has dirty descendants because
    /// copy-on-write relocates every ancestor of a mutation.
    fn place(&mut self, ref_: Ref) -> Result<u64> {
        if ref_ == 0 || self.alloc.is_committed(ref_) {
            return Ok(ref_);
        }
        let header = NodeHeader::read(self.alloc, ref_)?;
        let bytes = if header.has_refs() {
            let (_, values) = load_values(self.alloc, ref_)?;
            let mut placed: SmallVec<[u64; 8]> = SmallVec::with_capacity(values.len());
            for child in values {
                placed.push(self.place(child)?);
            }
            encode_int_node(&placed, true)
        } else {
            encode_trimmed_copy(self.alloc, ref_, &header)?
        };

        let pos = self
            .pool
            .get_free_space(bytes.len() as u64, &mut self.file_size, false, true);
        self.writes.push((pos, bytes));
        Ok(pos)
    }

    fn append(&mut self, bytes: Vec<u8>) -> u64 {
        let pos = self.file_size;
        self.file_size += bytes.len() as u64;
        self.writes.push((pos, bytes));
        pos
    }
}
