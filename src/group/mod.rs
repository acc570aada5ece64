//! # Group
//!
//! `Group` is the root object of a store: the owner of the allocator, the
//! top node, and the table accessors. It is the only type most callers ever
//! construct.
//!
//! ## Tree Shape
//!
//! ```text
//! offset 0: 8-byte LE top ref (0 = empty store)
//! top (HAS_REFS, 4 slots)
//! ├── slot 0: table names    (ArrayString)
//! ├── slot 1: table roots    (HAS_REFS array)
//! ├── slot 2: free positions (int array)  } the free-space ledger
//! └── slot 3: free lengths   (int array)  }
//! ```
//!
//! Readers tolerate extra trailing top slots so older builds can open files
//! written by newer ones.
//!
//! ## Sessions and Versions
//!
//! A writable group mutates copy-on-write: committed bytes are never touched,
//! every change lands in slab space. `commit` plans the dirty subtree into
//! the file (reusing ledger ranges retired two commits back), writes it, and
//! swaps the top ref at offset 0 as the single visibility boundary. After a
//! commit every live accessor is re-attached to the new version in place, so
//! handles held by the caller stay valid.
//!
//! `write`/`write_to_mem` instead produce a compact standalone snapshot of
//! the current state, committed or not.
//!
//! ## Accessor Identity
//!
//! `get_table` returns `Rc<RefCell<Table>>` and caches it per table index:
//! asking twice for the same table yields the same accessor (`Rc::ptr_eq`),
//! across commits included.

mod freespace;
mod writer;

use std::cell::RefCell;
use std::fmt;
use std::path::Path;
use std::rc::Rc;

use eyre::{ensure, Result, WrapErr};

use crate::alloc::{MemStats, Ref, SlabAlloc, NO_REF};
use crate::array::{Array, ArrayString, ParentLink};
use crate::storage::{FileMap, MapMode};
use crate::table::{write_json_string, Table, MAX_NAME_LEN};

use writer::{
    serialize_compact, GroupWriter, TOP_SLOTS, TOP_SLOT_FREE_LENGTHS, TOP_SLOT_FREE_POSITIONS,
    TOP_SLOT_NAMES, TOP_SLOT_TABLES,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug)]
pub struct Group {
    alloc: Rc<RefCell<SlabAlloc>>,
    top: Rc<RefCell<Array>>,
    table_names: ArrayString,
    tables: Rc<RefCell<Array>>,
    free_positions: Array,
    free_lengths: Array,
    cached_tables: Vec<Option<Rc<RefCell<Table>>>>,
    reclaim_free_space: bool,
    is_valid: bool,
}

impl Group {
    /// A transient in-memory store. Supports everything except `commit`.
    pub fn new() -> Result<Self> {
        let mut group = Self::from_alloc(SlabAlloc::scratch());
        group.create_structure()?;
        Ok(group)
    }

    /// Opens a store file. `ReadWrite` creates the file if it does not
    /// exist; `ReadOnly` requires an existing file.
    pub fn open<P: AsRef<Path>>(path: P, mode: OpenMode) -> Result<Self> {
        let path = path.as_ref();
        let map = match mode {
            OpenMode::ReadOnly => FileMap::open(path, MapMode::ReadOnly)?,
            OpenMode::ReadWrite if path.exists() => FileMap::open(path, MapMode::ReadWrite)?,
            OpenMode::ReadWrite => FileMap::create(path)?,
        };

        let mut group = Self::from_alloc(SlabAlloc::from_file(map));
        let top_ref = group.alloc.borrow().top_ref();
        if top_ref != 0 {
            if group.attach_arrays(top_ref).is_err() {
                group.is_valid = false;
            }
        } else if mode == OpenMode::ReadWrite {
            group.create_structure()?;
        }
        Ok(group)
    }

    /// Attaches read-only to a serialized store image.
    pub fn from_buffer(buffer: Vec<u8>) -> Result<Self> {
        let mut group = Self::from_alloc(SlabAlloc::from_buffer(buffer)?);
        let top_ref = group.alloc.borrow().top_ref();
        if top_ref != 0 && group.attach_arrays(top_ref).is_err() {
            group.is_valid = false;
        }
        Ok(group)
    }

    fn from_alloc(alloc: SlabAlloc) -> Self {
        Self {
            alloc: Rc::new(RefCell::new(alloc)),
            top: Rc::new(RefCell::new(Array::detached())),
            table_names: ArrayString::detached(),
            tables: Rc::new(RefCell::new(Array::detached())),
            free_positions: Array::detached(),
            free_lengths: Array::detached(),
            cached_tables: Vec::new(),
            reclaim_free_space: true,
            is_valid: true,
        }
    }

    fn create_structure(&mut self) -> Result<()> {
        let alloc = self.alloc.clone();
        let mut a = alloc.borrow_mut();

        *self.top.borrow_mut() = Array::create(&mut a, true, None)?;
        for _ in 0..TOP_SLOTS {
            self.top.borrow_mut().add(&mut a, 0)?;
        }

        self.table_names =
            ArrayString::create(&mut a, Some(ParentLink::new(&self.top, TOP_SLOT_NAMES)))?;
        *self.tables.borrow_mut() =
            Array::create(&mut a, true, Some(ParentLink::new(&self.top, TOP_SLOT_TABLES)))?;
        self.free_positions = Array::create(
            &mut a,
            false,
            Some(ParentLink::new(&self.top, TOP_SLOT_FREE_POSITIONS)),
        )?;
        self.free_lengths = Array::create(
            &mut a,
            false,
            Some(ParentLink::new(&self.top, TOP_SLOT_FREE_LENGTHS)),
        )?;

        let mut top = self.top.borrow_mut();
        top.set(&mut a, TOP_SLOT_NAMES, self.table_names.get_ref())?;
        let tables_ref = self.tables.borrow().get_ref();
        top.set(&mut a, TOP_SLOT_TABLES, tables_ref)?;
        top.set(&mut a, TOP_SLOT_FREE_POSITIONS, self.free_positions.get_ref())?;
        top.set(&mut a, TOP_SLOT_FREE_LENGTHS, self.free_lengths.get_ref())?;
        Ok(())
    }

    /// (Re-)attaches all group-level arrays under `top_ref`, reusing the
    /// existing cells so parent links held by accessors stay valid.
    fn attach_arrays(&mut self, top_ref: Ref) -> Result<()> {
        let alloc = self.alloc.clone();
        let a = alloc.borrow();

        let top = Array::attach(&a, top_ref, None)?;
        ensure!(
            top.has_refs() && top.len() >= TOP_SLOTS,
            "corrupt store: top node at ref {} has {} slots",
            top_ref,
            top.len()
        );

        self.table_names = ArrayString::attach(
            &a,
            top.get(&a, TOP_SLOT_NAMES)?,
            Some(ParentLink::new(&self.top, TOP_SLOT_NAMES)),
        )?;
        *self.tables.borrow_mut() = Array::attach(
            &a,
            top.get(&a, TOP_SLOT_TABLES)?,
            Some(ParentLink::new(&self.top, TOP_SLOT_TABLES)),
        )?;
        self.free_positions = Array::attach(
            &a,
            top.get(&a, TOP_SLOT_FREE_POSITIONS)?,
            Some(ParentLink::new(&self.top, TOP_SLOT_FREE_POSITIONS)),
        )?;
        self.free_lengths = Array::attach(
            &a,
            top.get(&a, TOP_SLOT_FREE_LENGTHS)?,
            Some(ParentLink::new(&self.top, TOP_SLOT_FREE_LENGTHS)),
        )?;
        *self.top.borrow_mut() = top;

        ensure!(
            self.table_names.len() == self.tables.borrow().len(),
            "corrupt store: {} table names but {} table roots",
            self.table_names.len(),
            self.tables.borrow().len()
        );
        self.cached_tables.resize(self.tables.borrow().len(), None);
        Ok(())
    }

    /// Whether the store attached cleanly. Operations on an invalid group
    /// fail instead of reading a corrupt tree.
    pub fn is_valid(&self) -> bool {
        self.is_valid
    }

    pub fn table_count(&self) -> usize {
        self.table_names.len()
    }

    pub fn table_name(&self, index: usize) -> Result<String> {
        self.check_valid()?;
        let a = self.alloc.borrow();
        Ok(self.table_names.get(&a, index)?.to_owned())
    }

    pub fn has_table(&self, name: &str) -> bool {
        if !self.is_valid {
            return false;
        }
        let a = self.alloc.borrow();
        matches!(self.table_names.find(&a, name), Ok(Some(_)))
    }

    /// Returns the named table, creating it in a writable store if missing.
    /// The returned accessor is cached: repeated calls yield the same
    /// `Rc`, across commits included.
    pub fn get_table(&mut self, name: &str) -> Result<Rc<RefCell<Table>>> {
        self.check_valid()?;
        ensure!(
            name.len() <= MAX_NAME_LEN,
            "table name '{}' exceeds {} bytes",
            name,
            MAX_NAME_LEN
        );

        let existing = {
            let a = self.alloc.borrow();
            self.table_names.find(&a, name)?
        };
        if let Some(ndx) = existing {
            if let Some(table) = &self.cached_tables[ndx] {
                return Ok(table.clone());
            }
            let root_ref = {
                let a = self.alloc.borrow();
                self.tables.borrow().get(&a, ndx)?
            };
            let table = Table::attach(&self.alloc, root_ref)?;
            table
                .borrow_mut()
                .set_parent(Some(ParentLink::new(&self.tables, ndx)));
            self.cached_tables[ndx] = Some(table.clone());
            return Ok(table);
        }

        ensure!(
            !self.alloc.borrow().is_read_only(),
            "cannot create table '{}': store was opened read-only",
            name
        );

        // Reserve the child-ref slot before wiring the parent link so the
        // table's relocation notifications always land in range.
        let ndx = self.tables.borrow().len();
        {
            let mut a = self.alloc.borrow_mut();
            self.tables.borrow_mut().add(&mut a, 0)?;
        }
        let table = Table::create(&self.alloc)?;
        let root_ref = table.borrow().root_ref();
        table
            .borrow_mut()
            .set_parent(Some(ParentLink::new(&self.tables, ndx)));
        {
            let mut a = self.alloc.borrow_mut();
            self.tables.borrow_mut().set(&mut a, ndx, root_ref)?;
            self.table_names.add(&mut a, name)?;
        }
        self.cached_tables.push(Some(table.clone()));
        Ok(table)
    }

    /// Serializes the current state into a compact standalone store image.
    pub fn write_to_mem(&self) -> Result<Vec<u8>> {
        self.check_valid()?;
        let a = self.alloc.borrow();
        let top_ref = {
            let top = self.top.borrow();
            if top.is_attached() {
                top.get_ref()
            } else {
                NO_REF
            }
        };
        serialize_compact(&a, top_ref)
    }

    /// Writes a compact snapshot of the current state to `path`.
    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let buffer = self.write_to_mem()?;
        std::fs::write(path.as_ref(), buffer)
            .wrap_err_with(|| format!("failed to write store to {}", path.as_ref().display()))
    }

    /// Emits the whole store as `{"<table>": [<rows>], ...}` in insertion
    /// order.
    pub fn to_json<W: fmt::Write>(&self, out: &mut W) -> Result<()> {
        self.check_valid()?;
        out.write_char('{')?;
        for ndx in 0..self.table_count() {
            if ndx > 0 {
                out.write_char(',')?;
            }
            let (name, root_ref) = {
                let a = self.alloc.borrow();
                (
                    self.table_names.get(&a, ndx)?.to_owned(),
                    self.tables.borrow().get(&a, ndx)?,
                )
            };
            write_json_string(out, &name)?;
            out.write_char(':')?;
            match &self.cached_tables[ndx] {
                Some(table) => table.borrow().to_json(out)?,
                None => Table::attach(&self.alloc, root_ref)?.borrow().to_json(out)?,
            }
        }
        out.write_char('}')?;
        Ok(())
    }

    /// Commits the dirty state to the store file and swaps the top ref.
    /// A commit with nothing dirty is a no-op and leaves the file untouched.
    pub fn commit(&mut self) -> Result<()> {
        self.check_valid()?;
        ensure!(
            self.alloc.borrow().is_writable_file(),
            "cannot commit: store is not backed by a writable file"
        );

        let top_ref = self.top.borrow().get_ref();
        let new_top = {
            let a = self.alloc.borrow();
            if a.is_committed(top_ref) && a.read_only_frees().is_empty() {
                return Ok(());
            }

            let ledger = self
                .free_positions
                .values(&a)?
                .into_iter()
                .zip(self.free_lengths.values(&a)?)
                .collect();
            // The ledger nodes themselves are replaced by this commit; their
            // committed ranges are retired into the new ledger.
            let mut retired = Vec::new();
            if a.track_free() {
                for node in [&self.free_positions, &self.free_lengths] {
                    if node.is_attached() && a.is_committed(node.get_ref()) {
                        retired.push((node.get_ref(), node.capacity()));
                    }
                }
            }

            GroupWriter::plan(&a, top_ref, ledger, retired, self.reclaim_free_space)?
        };

        let new_top_ref = new_top.execute(&mut self.alloc.borrow_mut())?;
        self.update_refs(new_top_ref)
    }

    /// Re-anchors every live accessor on the newly committed version.
    fn update_refs(&mut self, new_top_ref: Ref) -> Result<()> {
        self.alloc.borrow_mut().discard_uncommitted();
        self.attach_arrays(new_top_ref)?;

        let roots: Vec<Option<Ref>> = {
            let a = self.alloc.borrow();
            let tables = self.tables.borrow();
            self.cached_tables
                .iter()
                .enumerate()
                .map(|(ndx, slot)| match slot {
                    Some(_) => tables.get(&a, ndx).map(Some),
                    None => Ok(None),
                })
                .collect::<Result<_>>()?
        };
        for (slot, root) in self.cached_tables.iter().zip(roots) {
            if let (Some(table), Some(root_ref)) = (slot, root) {
                table.borrow_mut().update_from_ref(root_ref)?;
            }
        }
        Ok(())
    }

    /// Toggles whether freed committed ranges feed the free-space ledger.
    pub fn connect_free_space(&mut self, connect: bool) {
        self.alloc.borrow_mut().set_track_free(connect);
    }

    /// Toggles reuse of ledger ranges during commit. Leave off when an outer
    /// versioning layer still holds readers on older committed versions.
    pub fn set_reclaim_free_space(&mut self, reclaim: bool) {
        self.reclaim_free_space = reclaim;
    }

    /// Hard cap on the store file size; a commit that would grow past it
    /// fails before writing anything.
    pub fn set_max_file_size(&mut self, cap: Option<u64>) {
        self.alloc.borrow_mut().set_max_file_size(cap);
    }

    pub fn enable_mem_diagnostics(&mut self, enable: bool) {
        self.alloc.borrow_mut().enable_debug(enable);
    }

    pub fn mem_stats(&self) -> MemStats {
        self.alloc.borrow().stats()
    }

    fn check_valid(&self) -> Result<()> {
        ensure!(self.is_valid, "store failed validation when it was opened");
        Ok(())
    }
}
