//! # Free-Space Pool
//!
//! Commit-time view of the reusable file ranges recorded in the store's
//! free-space ledger. The pool is a plain in-memory list consumed while
//! planning a commit; the surviving entries, together with ranges freed
//! during the session, become the next ledger.
//!
//! Reuse is deliberately one commit behind: only ranges already present in
//! the *committed* ledger enter the pool, so a crashed commit can never have
//! scribbled over bytes the previous version still references.
//!
//! Placement is first-fit over position-sorted chunks. A chunk larger than
//! the request is split and the remainder stays pooled; with `ensure_rest`
//! the split is refused unless the remainder is big enough to ever hold a
//! node again, avoiding unusable slivers in the ledger.

use tracing::trace;

/// Smallest remainder worth keeping when `ensure_rest` splitting: a node
/// header plus one 8-byte element.
const MIN_REMAINDER: u64 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeChunk {
    pub pos: u64,
    pub len: u64,
}

#[derive(Debug)]
pub struct FreeSpacePool {
    chunks: Vec<FreeChunk>,
}

impl FreeSpacePool {
    pub fn empty() -> Self {
        Self { chunks: Vec::new() }
    }

    /// Builds a pool from `(pos, len)` ledger entries, sorting and merging
    /// adjacent ranges.
    pub fn from_entries(entries: Vec<(u64, u64)>) -> Self {
        Self {
            chunks: normalize(entries)
                .into_iter()
                .map(|(pos, len)| FreeChunk { pos, len })
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Finds space for `len` bytes: first-fit from the pool, else at the end
    /// of the file, advancing `filesize`. With `test_only` the pool and
    /// `filesize` are left untouched; with `ensure_rest` a chunk is only
    /// split when the remainder stays usable.
    pub fn get_free_space(
        &mut self,
        len: u64,
        filesize: &mut u64,
        test_only: bool,
        ensure_rest: bool,
    ) -> u64 {
        debug_assert!(len % 8 == 0, "placements are 8-byte aligned");

        for ndx in 0..self.chunks.len() {
            let chunk = self.chunks[ndx];
            if chunk.len < len {
                continue;
            }
            if ensure_rest && chunk.len != len && chunk.len < len + MIN_REMAINDER {
                continue;
            }
            if test_only {
                return chunk.pos;
            }
            trace!(pos = chunk.pos, len, chunk_len = chunk.len, "reusing free chunk");
            if chunk.len == len {
                self.chunks.remove(ndx);
            } else {
                self.chunks[ndx] = FreeChunk {
                    pos: chunk.pos + len,
                    len: chunk.len - len,
                };
            }
            return chunk.pos;
        }

        let pos = *filesize;
        if !test_only {
            *filesize += len;
        }
        pos
    }

    /// Entries still unused after placement, in position order.
    pub fn into_remaining(self) -> Vec<(u64, u64)> {
        self.chunks.into_iter().map(|c| (c.pos, c.len)).collect()
    }
}

/// Sorts `(pos, len)` ranges by position and merges adjacent ones. Empty
/// ranges are dropped.
pub fn normalize(mut entries: Vec<(u64, u64)>) -> Vec<(u64, u64)> {
    entries.retain(|&(_, len)| len > 0);
    entries.sort_unstable_by_key(|&(pos, _)| pos);

    let mut merged: Vec<(u64, u64)> = Vec::with_capacity(entries.len());
    for (pos, len) in entries {
        match merged.last_mut() {
            Some(last) if last.0 + last.1 == pos => last.1 += len,
            _ => merged.push((pos, len)),
        }
    }
    merged
}
