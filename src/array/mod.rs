//! # Array Nodes
//!
//! `Array` is the fundamental container of the store: a variable-width,
//! resizable run of little-endian integers identified by a ref. Every higher
//! structure (table list, name list, free-space ledger, table roots, int
//! columns) is one or more arrays linked by refs.
//!
//! ## Element Width
//!
//! Elements are stored at the smallest byte width (1/2/4/8) that fits the
//! largest value in the node. Storing a value that exceeds the current width
//! transparently re-encodes the whole node at the next width.
//!
//! ## Copy-on-Write and Relocation
//!
//! An array attached to committed bytes (below the allocator baseline) is
//! never mutated in place. The first mutation relocates the node into slab
//! space, frees the committed range into the pending ledger, and continues
//! there. Growth past the node's capacity relocates the same way.
//!
//! A node's ref is therefore stable only until its next mutation. Whenever a
//! node moves it notifies its parent through a [`ParentLink`] so the
//! parent's child-ref slot is updated in the same operation; since updating
//! that slot may itself relocate the parent, the notification cascades
//! upward until it reaches the top of the tree.
//!
//! ## Parent Links
//!
//! A `ParentLink` is a weak back-reference `{parent node, slot index}`. It
//! is never an ownership edge: the parent owns the child through the ref in
//! its slot, the child refers back only to notify. A link whose parent has
//! been dropped degrades to a no-op, which is the correct behavior for a
//! node that has been detached from a live tree.

pub mod header;
pub mod string;

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use eyre::{ensure, Result};

use crate::alloc::{round_up, Ref, SlabAlloc, NO_REF};
use header::{read_elem, width_for, write_elem, NodeHeader, FLAG_HAS_REFS, NODE_HEADER_SIZE};

pub use string::ArrayString;

/// Weak back-reference to the parent node slot holding this node's ref.
#[derive(Debug, Clone)]
pub struct ParentLink {
    target: Weak<RefCell<Array>>,
    slot: usize,
}

impl ParentLink {
    pub fn new(parent: &Rc<RefCell<Array>>, slot: usize) -> Self {
        Self {
            target: Rc::downgrade(parent),
            slot,
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Propagates a relocated child ref into the parent slot. Cascades: the
    /// slot update may relocate the parent, which notifies its own parent.
    fn notify(&self, alloc: &mut SlabAlloc, new_ref: Ref) -> Result<()> {
        if let Some(parent) = self.target.upgrade() {
            parent.borrow_mut().set(alloc, self.slot, new_ref)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct Array {
    ref_: Ref,
    len: usize,
    width: usize,
    capacity: u64,
    has_refs: bool,
    parent: Option<ParentLink>,
}

/// Initial capacity of a fresh node: header plus 16 one-byte elements.
const INITIAL_CAPACITY: u64 = NODE_HEADER_SIZE + 16;

impl Array {
    /// An array not attached to any node; reads as empty, rejects access.
    pub fn detached() -> Self {
        Self {
            ref_: NO_REF,
            len: 0,
            width: 1,
            capacity: 0,
            has_refs: false,
            parent: None,
        }
    }

    /// Allocates a fresh empty node.
    pub fn create(alloc: &mut SlabAlloc, has_refs: bool, parent: Option<ParentLink>) -> Result<Self> {
        let ref_ = alloc.alloc(INITIAL_CAPACITY)?;
        let arr = Self {
            ref_,
            len: 0,
            width: 1,
            capacity: INITIAL_CAPACITY,
            has_refs,
            parent,
        };
        arr.store_header(alloc)?;
        Ok(arr)
    }

    /// Attaches to an existing node, validating its header.
    pub fn attach(alloc: &SlabAlloc, ref_: Ref, parent: Option<ParentLink>) -> Result<Self> {
        let header = NodeHeader::read(alloc, ref_)?;
        ensure!(
            !header.is_strings(),
            "node at ref {} holds strings, expected ints",
            ref_
        );
        Ok(Self {
            ref_,
            len: header.size() as usize,
            width: header.width() as usize,
            capacity: header.capacity(),
            has_refs: header.has_refs(),
            parent,
        })
    }

    pub fn is_attached(&self) -> bool {
        self.ref_ != NO_REF
    }

    pub fn get_ref(&self) -> Ref {
        self.ref_
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn has_refs(&self) -> bool {
        self.has_refs
    }

    /// Total allocated bytes including header and unused tail.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn set_parent(&mut self, parent: Option<ParentLink>) {
        self.parent = parent;
    }

    pub fn parent_link(&self) -> Option<ParentLink> {
        self.parent.clone()
    }

    pub fn get(&self, alloc: &SlabAlloc, ndx: usize) -> Result<u64> {
        ensure!(self.is_attached(), "array is detached");
        ensure!(
            ndx < self.len,
            "array index {} out of range (len {})",
            ndx,
            self.len
        );
        let payload = self.payload(alloc)?;
        Ok(read_elem(payload, self.width, ndx))
    }

    pub fn set(&mut self, alloc: &mut SlabAlloc, ndx: usize, value: u64) -> Result<()> {
        ensure!(self.is_attached(), "array is detached");
        ensure!(
            ndx < self.len,
            "array index {} out of range (len {})",
            ndx,
            self.len
        );
        if width_for(value) > self.width {
            self.widen(alloc, width_for(value))?;
        }
        self.make_writable(alloc)?;
        let payload = self.payload_mut(alloc)?;
        write_elem(payload, self.width, ndx, value);
        Ok(())
    }

    pub fn add(&mut self, alloc: &mut SlabAlloc, value: u64) -> Result<()> {
        ensure!(self.is_attached(), "array is detached");
        if width_for(value) > self.width {
            self.widen(alloc, width_for(value))?;
        }
        let needed = NODE_HEADER_SIZE + (self.len as u64 + 1) * self.width as u64;
        if needed > self.capacity {
            self.relocate(alloc, round_up(needed.max(self.capacity * 2)))?;
        } else {
            self.make_writable(alloc)?;
        }
        let ndx = self.len;
        self.len += 1;
        let payload = self.payload_mut(alloc)?;
        write_elem(payload, self.width, ndx, value);
        self.store_header(alloc)
    }

    /// Linear scan for `value`.
    pub fn find(&self, alloc: &SlabAlloc, value: u64) -> Result<Option<usize>> {
        if !self.is_attached() || self.len == 0 {
            return Ok(None);
        }
        let payload = self.payload(alloc)?;
        for ndx in 0..self.len {
            if read_elem(payload, self.width, ndx) == value {
                return Ok(Some(ndx));
            }
        }
        Ok(None)
    }

    /// All element values, in order.
    pub fn values(&self, alloc: &SlabAlloc) -> Result<Vec<u64>> {
        if !self.is_attached() || self.len == 0 {
            return Ok(Vec::new());
        }
        let payload = self.payload(alloc)?;
        Ok((0..self.len)
            .map(|ndx| read_elem(payload, self.width, ndx))
            .collect())
    }

    /// Header plus payload, without the unused capacity tail.
    pub fn byte_size(&self) -> u64 {
        NODE_HEADER_SIZE + self.len as u64 * self.width as u64
    }

    fn payload<'a>(&self, alloc: &'a SlabAlloc) -> Result<&'a [u8]> {
        alloc.bytes(
            self.ref_ + NODE_HEADER_SIZE,
            self.len as u64 * self.width as u64,
        )
    }

    fn payload_mut<'a>(&self, alloc: &'a mut SlabAlloc) -> Result<&'a mut [u8]> {
        alloc.bytes_mut(
            self.ref_ + NODE_HEADER_SIZE,
            self.len as u64 * self.width as u64,
        )
    }

    fn store_header(&self, alloc: &mut SlabAlloc) -> Result<()> {
        let flags = if self.has_refs { FLAG_HAS_REFS } else { 0 };
        let header = NodeHeader::new(flags, self.width as u16, self.len as u32, self.capacity);
        let dst = alloc.bytes_mut(self.ref_, NODE_HEADER_SIZE)?;
        dst.copy_from_slice(zerocopy::IntoBytes::as_bytes(&header));
        Ok(())
    }

    /// Relocates the node into slab space if it still lives in committed
    /// bytes. No-op for nodes already writable.
    fn make_writable(&mut self, alloc: &mut SlabAlloc) -> Result<()> {
        if alloc.is_committed(self.ref_) {
            self.relocate(alloc, round_up(self.capacity.max(INITIAL_CAPACITY)))?;
        }
        Ok(())
    }

    /// Moves the node to a fresh allocation of `new_capacity` bytes, frees
    /// the old range, and propagates the new ref to the parent.
    fn relocate(&mut self, alloc: &mut SlabAlloc, new_capacity: u64) -> Result<()> {
        let used = self.byte_size();
        let old_ref = self.ref_;
        let old_capacity = self.capacity;
        let old_bytes = alloc.bytes(old_ref, used)?.to_vec();

        let new_ref = alloc.alloc(new_capacity)?;
        let dst = alloc.bytes_mut(new_ref, new_capacity)?;
        dst[..used as usize].copy_from_slice(&old_bytes);
        dst[used as usize..].fill(0);

        alloc.free(old_ref, old_capacity);
        self.ref_ = new_ref;
        self.capacity = new_capacity;
        self.store_header(alloc)?;
        self.notify_parent(alloc)
    }

    /// Re-encodes every element at a wider width, relocating the node.
    fn widen(&mut self, alloc: &mut SlabAlloc, new_width: usize) -> Result<()> {
        let values = self.values(alloc)?;
        let old_ref = self.ref_;
        let old_capacity = self.capacity;

        let needed = NODE_HEADER_SIZE + (self.len.max(8) as u64) * new_width as u64;
        let new_capacity = round_up(needed.max(old_capacity));
        let new_ref = alloc.alloc(new_capacity)?;

        self.ref_ = new_ref;
        self.width = new_width;
        self.capacity = new_capacity;
        self.store_header(alloc)?;
        let payload = self.payload_mut(alloc)?;
        for (ndx, value) in values.iter().enumerate() {
            write_elem(payload, new_width, ndx, *value);
        }

        if old_ref != NO_REF {
            alloc.free(old_ref, old_capacity);
        }
        self.notify_parent(alloc)
    }

    fn notify_parent(&self, alloc: &mut SlabAlloc) -> Result<()> {
        if let Some(parent) = &self.parent {
            parent.notify(alloc, self.ref_)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{FileMap, FILE_HEADER_SIZE};
    use tempfile::tempdir;
    use zerocopy::IntoBytes;

    #[test]
    fn create_add_get() {
        let mut alloc = SlabAlloc::scratch();
        let mut arr = Array::create(&mut alloc, false, None).unwrap();

        arr.add(&mut alloc, 5).unwrap();
        arr.add(&mut alloc, 9).unwrap();
        arr.add(&mut alloc, 0).unwrap();

        assert_eq!(arr.len(), 3);
        assert_eq!(arr.get(&alloc, 0).unwrap(), 5);
        assert_eq!(arr.get(&alloc, 1).unwrap(), 9);
        assert_eq!(arr.get(&alloc, 2).unwrap(), 0);
    }

    #[test]
    fn get_out_of_range_is_an_error() {
        let mut alloc = SlabAlloc::scratch();
        let mut arr = Array::create(&mut alloc, false, None).unwrap();
        arr.add(&mut alloc, 1).unwrap();

        assert!(arr.get(&alloc, 1).is_err());
        assert!(arr.get(&alloc, 100).is_err());
    }

    #[test]
    fn detached_array_rejects_access() {
        let alloc = SlabAlloc::scratch();
        let arr = Array::detached();

        assert_eq!(arr.len(), 0);
        assert!(!arr.is_attached());
        assert!(arr.get(&alloc, 0).is_err());
        assert_eq!(arr.find(&alloc, 1).unwrap(), None);
    }

    #[test]
    fn set_updates_in_place() {
        let mut alloc = SlabAlloc::scratch();
        let mut arr = Array::create(&mut alloc, false, None).unwrap();
        arr.add(&mut alloc, 1).unwrap();
        arr.add(&mut alloc, 2).unwrap();

        let ref_before = arr.get_ref();
        arr.set(&mut alloc, 1, 200).unwrap();

        assert_eq!(arr.get_ref(), ref_before);
        assert_eq!(arr.get(&alloc, 1).unwrap(), 200);
    }

    #[test]
    fn widening_preserves_values() {
        let mut alloc = SlabAlloc::scratch();
        let mut arr = Array::create(&mut alloc, false, None).unwrap();
        arr.add(&mut alloc, 7).unwrap();
        arr.add(&mut alloc, 42).unwrap();

        arr.add(&mut alloc, 70_000).unwrap();
        arr.add(&mut alloc, u64::MAX).unwrap();

        assert_eq!(arr.get(&alloc, 0).unwrap(), 7);
        assert_eq!(arr.get(&alloc, 1).unwrap(), 42);
        assert_eq!(arr.get(&alloc, 2).unwrap(), 70_000);
        assert_eq!(arr.get(&alloc, 3).unwrap(), u64::MAX);
    }

    #[test]
    fn widening_via_set_preserves_other_values() {
        let mut alloc = SlabAlloc::scratch();
        let mut arr = Array::create(&mut alloc, false, None).unwrap();
        for v in 0..10 {
            arr.add(&mut alloc, v).unwrap();
        }

        arr.set(&mut alloc, 4, 1 << 40).unwrap();

        assert_eq!(arr.get(&alloc, 4).unwrap(), 1 << 40);
        assert_eq!(arr.get(&alloc, 3).unwrap(), 3);
        assert_eq!(arr.get(&alloc, 9).unwrap(), 9);
    }

    #[test]
    fn growth_relocates_and_keeps_content() {
        let mut alloc = SlabAlloc::scratch();
        let mut arr = Array::create(&mut alloc, false, None).unwrap();
        let ref_before = arr.get_ref();

        for v in 0..100u64 {
            arr.add(&mut alloc, v).unwrap();
        }

        assert_ne!(arr.get_ref(), ref_before);
        for v in 0..100u64 {
            assert_eq!(arr.get(&alloc, v as usize).unwrap(), v);
        }
    }

    #[test]
    fn find_scans_linearly() {
        let mut alloc = SlabAlloc::scratch();
        let mut arr = Array::create(&mut alloc, false, None).unwrap();
        for v in [10u64, 20, 30] {
            arr.add(&mut alloc, v).unwrap();
        }

        assert_eq!(arr.find(&alloc, 20).unwrap(), Some(1));
        assert_eq!(arr.find(&alloc, 99).unwrap(), None);
    }

    #[test]
    fn attach_roundtrip() {
        let mut alloc = SlabAlloc::scratch();
        let mut arr = Array::create(&mut alloc, true, None).unwrap();
        arr.add(&mut alloc, 24).unwrap();
        arr.add(&mut alloc, 48).unwrap();

        let attached = Array::attach(&alloc, arr.get_ref(), None).unwrap();

        assert!(attached.has_refs());
        assert_eq!(attached.len(), 2);
        assert_eq!(attached.get(&alloc, 0).unwrap(), 24);
        assert_eq!(attached.get(&alloc, 1).unwrap(), 48);
    }

    #[test]
    fn attach_rejects_garbage() {
        let mut alloc = SlabAlloc::scratch();
        let ref_ = alloc.alloc(32).unwrap();
        alloc.bytes_mut(ref_, 32).unwrap().fill(0xFF);

        assert!(Array::attach(&alloc, ref_, None).is_err());
    }

    #[test]
    fn relocation_notifies_parent_slot() {
        let mut alloc = SlabAlloc::scratch();
        let parent = Rc::new(RefCell::new(Array::create(&mut alloc, true, None).unwrap()));

        let mut child = Array::create(
            &mut alloc,
            false,
            Some(ParentLink::new(&parent, 0)),
        )
        .unwrap();
        parent
            .borrow_mut()
            .add(&mut alloc, child.get_ref())
            .unwrap();

        for v in 0..100u64 {
            child.add(&mut alloc, v).unwrap();
        }

        assert_eq!(
            parent.borrow().get(&alloc, 0).unwrap(),
            child.get_ref(),
            "parent slot follows the child across relocations"
        );
    }

    #[test]
    fn committed_node_is_copied_on_write() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.strata");

        // Hand-build a committed file: header, then one node [5, 6].
        let node = NodeHeader::new(0, 1, 2, 24);
        let mut content = Vec::new();
        content.extend_from_slice(&FILE_HEADER_SIZE.to_le_bytes());
        content.extend_from_slice(node.as_bytes());
        content.extend_from_slice(&[5u8, 6, 0, 0, 0, 0, 0, 0]);
        std::fs::write(&path, &content).unwrap();

        let map = FileMap::open(&path, crate::storage::MapMode::ReadWrite).unwrap();
        let mut alloc = SlabAlloc::from_file(map);
        let mut arr = Array::attach(&alloc, FILE_HEADER_SIZE, None).unwrap();

        assert!(alloc.is_committed(arr.get_ref()));
        arr.set(&mut alloc, 0, 50).unwrap();

        assert!(!alloc.is_committed(arr.get_ref()), "mutation relocated the node");
        assert_eq!(arr.get(&alloc, 0).unwrap(), 50);
        assert_eq!(arr.get(&alloc, 1).unwrap(), 6);
        assert_eq!(
            alloc.read_only_frees(),
            &[(FILE_HEADER_SIZE, 24)],
            "vacated committed range is queued for the ledger"
        );
    }
}
