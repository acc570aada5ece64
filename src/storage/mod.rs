//! # Memory-Mapped File Backing
//!
//! This module implements `FileMap`, the byte-granular memory-mapped backing
//! for a store file. It is the lowest layer of stratadb: the slab allocator
//! maps refs below its baseline directly onto these bytes, so a reader holding
//! a committed top ref sees file content with zero copies.
//!
//! ## Internal Component
//!
//! `FileMap` is an internal building block used by `SlabAlloc`. Users should
//! not create `FileMap` instances directly; `Group::open` manages the backing
//! automatically.
//!
//! ## Design
//!
//! Unlike page-oriented engines, the store file is a flat heap of
//! variable-length nodes, so the mapping is byte-granular rather than paged.
//! The first 8 bytes of the file hold the top ref (the only absolute piece of
//! state needed to reopen a store); everything after it is node space.
//!
//! A read-only open maps the file with `Mmap` and refuses mutable access at
//! the type level. A read-write open uses `MmapMut`; growth flushes the old
//! mapping, extends the file, and remaps.
//!
//! ## Safety Considerations
//!
//! Memory-mapped regions become invalid when remapped during `grow()`. The
//! borrow checker enforces safety with zero runtime cost: `grow()` takes
//! `&mut self`, so no slice handed out by `as_slice()` can be held across a
//! remap.
//!
//! ## Durability
//!
//! `sync()` issues `msync` (or the platform equivalent) and returns only once
//! the mapped bytes have reached the file. The commit protocol relies on this
//! ordering: node bytes are synced before the top ref is rewritten.

use std::fs::{File, OpenOptions};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::{Mmap, MmapMut};

/// Minimum size of a store file: the 8-byte top-ref header.
pub const FILE_HEADER_SIZE: u64 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug)]
enum MapInner {
    Ro(Mmap),
    Rw(MmapMut),
}

#[derive(Debug)]
pub struct FileMap {
    file: File,
    map: MapInner,
    len: u64,
}

impl FileMap {
    pub fn open<P: AsRef<Path>>(path: P, mode: MapMode) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(mode == MapMode::ReadWrite)
            .open(path)
            .wrap_err_with(|| format!("failed to open store file '{}'", path.display()))?;

        let len = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat store file '{}'", path.display()))?
            .len();

        ensure!(
            len >= FILE_HEADER_SIZE,
            "store file '{}' is truncated: {} bytes is smaller than the {}-byte header",
            path.display(),
            len,
            FILE_HEADER_SIZE
        );

        let map = match mode {
            // SAFETY: mapping a file is unsafe because another process could
            // modify it underneath us. Store files are owned by a single
            // Group for the life of the mapping, the mapping never outlives
            // `self.file`, and all access is bounds-checked through
            // `as_slice`/`as_mut_slice`.
            MapMode::ReadOnly => MapInner::Ro(unsafe {
                Mmap::map(&file)
                    .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
            }),
            MapMode::ReadWrite => MapInner::Rw(unsafe {
                MmapMut::map_mut(&file)
                    .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
            }),
        };

        Ok(Self { file, map, len })
    }

    /// Creates a fresh store file containing a zeroed top-ref header.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create store file '{}'", path.display()))?;

        file.set_len(FILE_HEADER_SIZE)
            .wrap_err_with(|| format!("failed to reserve header in '{}'", path.display()))?;

        // SAFETY: the file was just created with exclusive access and sized
        // to FILE_HEADER_SIZE; the mapping is tied to `self.file`.
        let map = MapInner::Rw(unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        });

        Ok(Self {
            file,
            map,
            len: FILE_HEADER_SIZE,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_writable(&self) -> bool {
        matches!(self.map, MapInner::Rw(_))
    }

    pub fn as_slice(&self) -> &[u8] {
        match &self.map {
            MapInner::Ro(m) => m,
            MapInner::Rw(m) => m,
        }
    }

    pub fn as_mut_slice(&mut self) -> Result<&mut [u8]> {
        match &mut self.map {
            MapInner::Ro(_) => eyre::bail!("store file is mapped read-only"),
            MapInner::Rw(m) => Ok(m),
        }
    }

    pub fn grow(&mut self, new_len: u64) -> Result<()> {
        if new_len <= self.len {
            return Ok(());
        }

        let MapInner::Rw(map) = &mut self.map else {
            eyre::bail!("cannot grow a read-only store file");
        };

        map.flush().wrap_err("failed to flush mapping before grow")?;

        self.file
            .set_len(new_len)
            .wrap_err_with(|| format!("failed to extend store file to {} bytes", new_len))?;

        // SAFETY: grow() holds &mut self, so no outstanding slices exist; the
        // old mapping was flushed and the file extended before remapping.
        self.map = MapInner::Rw(unsafe {
            MmapMut::map_mut(&self.file).wrap_err("failed to remap store file after grow")?
        });
        self.len = new_len;

        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        match &self.map {
            MapInner::Ro(_) => Ok(()),
            MapInner::Rw(m) => m.flush().wrap_err("failed to sync store file"),
        }
    }
}
