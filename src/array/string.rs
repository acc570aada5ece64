//! # String Array Nodes
//!
//! `ArrayString` stores a dense index-to-string mapping: every element
//! occupies the same number of bytes (the node width), holding the string
//! followed by NUL padding. A string always leaves at least one NUL, so the
//! stored length never equals the width and `get` can stop at the first NUL
//! without a separate length field.
//!
//! Widths are powers of two up to [`MAX_STRING_WIDTH`]. Adding a
//! string that exceeds the current width transparently re-packs the whole
//! node at a wider width, exactly like int arrays widening their element
//! encoding. Strings must be NUL-free; interior NUL bytes are rejected as a
//! logic error rather than silently truncated.
//!
//! The table-name list and table column-name lists are `ArrayString`s, as
//! are string columns in the minimal table surface.

use eyre::{ensure, Result};

use super::header::{NodeHeader, FLAG_STRINGS, MAX_STRING_WIDTH, NODE_HEADER_SIZE};
use super::ParentLink;
use crate::alloc::{round_up, Ref, SlabAlloc, NO_REF};

#[derive(Debug)]
pub struct ArrayString {
    ref_: Ref,
    len: usize,
    width: usize,
    capacity: u64,
    parent: Option<ParentLink>,
}

const INITIAL_WIDTH: usize = 4;
const INITIAL_CAPACITY: u64 = NODE_HEADER_SIZE + 16 * INITIAL_WIDTH as u64;

impl ArrayString {
    pub fn detached() -> Self {
        Self {
            ref_: NO_REF,
            len: 0,
            width: INITIAL_WIDTH,
            capacity: 0,
            parent: None,
        }
    }

    pub fn create(alloc: &mut SlabAlloc, parent: Option<ParentLink>) -> Result<Self> {
        let ref_ = alloc.alloc(INITIAL_CAPACITY)?;
        let arr = Self {
            ref_,
            len: 0,
            width: INITIAL_WIDTH,
            capacity: INITIAL_CAPACITY,
            parent,
        };
        arr.store_header(alloc)?;
        Ok(arr)
    }

    pub fn attach(alloc: &SlabAlloc, ref_: Ref, parent: Option<ParentLink>) -> Result<Self> {
        let header = NodeHeader::read(alloc, ref_)?;
        ensure!(
            header.is_strings(),
            "node at ref {} holds ints, expected strings",
            ref_
        );
        Ok(Self {
            ref_,
            len: header.size() as usize,
            width: header.width() as usize,
            capacity: header.capacity(),
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

    pub fn set_parent(&mut self, parent: Option<ParentLink>) {
        self.parent = parent;
    }

    pub fn parent_link(&self) -> Option<ParentLink> {
        self.parent.clone()
    }

    pub fn byte_size(&self) -> u64 {
        NODE_HEADER_SIZE + self.len as u64 * self.width as u64
    }

    pub fn get<'a>(&self, alloc: &'a SlabAlloc, ndx: usize) -> Result<&'a str> {
        ensure!(self.is_attached(), "string array is detached");
        ensure!(
            ndx < self.len,
            "string index {} out of range (len {})",
            ndx,
            self.len
        );
        let payload = self.payload(alloc)?;
        let elem = &payload[ndx * self.width..(ndx + 1) * self.width];
        let end = elem.iter().position(|&b| b == 0).ok_or_else(|| {
            eyre::eyre!("corrupt string at index {}: element has no NUL terminator", ndx)
        })?;
        std::str::from_utf8(&elem[..end])
            .map_err(|e| eyre::eyre!("corrupt string at index {}: {}", ndx, e))
    }

    pub fn add(&mut self, alloc: &mut SlabAlloc, value: &str) -> Result<()> {
        ensure!(self.is_attached(), "string array is detached");
        self.check_value(value)?;
        if value.len() >= self.width {
            self.widen(alloc, required_width(value.len())?)?;
        }
        let needed = NODE_HEADER_SIZE + (self.len as u64 + 1) * self.width as u64;
        if needed > self.capacity {
            self.relocate(alloc, round_up(needed.max(self.capacity * 2)))?;
        } else {
            self.make_writable(alloc)?;
        }
        let ndx = self.len;
        self.len += 1;
        self.write_elem(alloc, ndx, value)?;
        self.store_header(alloc)
    }

    pub fn set(&mut self, alloc: &mut SlabAlloc, ndx: usize, value: &str) -> Result<()> {
        ensure!(self.is_attached(), "string array is detached");
        ensure!(
            ndx < self.len,
            "string index {} out of range (len {})",
            ndx,
            self.len
        );
        self.check_value(value)?;
        if value.len() >= self.width {
            self.widen(alloc, required_width(value.len())?)?;
        }
        self.make_writable(alloc)?;
        self.write_elem(alloc, ndx, value)
    }

    /// Linear scan for an exact match.
    pub fn find(&self, alloc: &SlabAlloc, value: &str) -> Result<Option<usize>> {
        if !self.is_attached() || self.len == 0 || value.len() >= self.width {
            return Ok(None);
        }
        for ndx in 0..self.len {
            if self.get(alloc, ndx)? == value {
                return Ok(Some(ndx));
            }
        }
        Ok(None)
    }

    /// All strings, in order.
    pub fn values(&self, alloc: &SlabAlloc) -> Result<Vec<String>> {
        (0..self.len)
            .map(|ndx| self.get(alloc, ndx).map(str::to_owned))
            .collect()
    }

    fn check_value(&self, value: &str) -> Result<()> {
        ensure!(
            !value.bytes().any(|b| b == 0),
            "strings may not contain NUL bytes"
        );
        Ok(())
    }

    fn payload<'a>(&self, alloc: &'a SlabAlloc) -> Result<&'a [u8]> {
        alloc.bytes(
            self.ref_ + NODE_HEADER_SIZE,
            self.len as u64 * self.width as u64,
        )
    }

    fn write_elem(&self, alloc: &mut SlabAlloc, ndx: usize, value: &str) -> Result<()> {
        let width = self.width;
        let payload = alloc.bytes_mut(
            self.ref_ + NODE_HEADER_SIZE,
            self.len as u64 * width as u64,
        )?;
        let elem = &mut payload[ndx * width..(ndx + 1) * width];
        elem[..value.len()].copy_from_slice(value.as_bytes());
        elem[value.len()..].fill(0);
        Ok(())
    }

    fn store_header(&self, alloc: &mut SlabAlloc) -> Result<()> {
        let header = NodeHeader::new(
            FLAG_STRINGS,
            self.width as u16,
            self.len as u32,
            self.capacity,
        );
        let dst = alloc.bytes_mut(self.ref_, NODE_HEADER_SIZE)?;
        dst.copy_from_slice(zerocopy::IntoBytes::as_bytes(&header));
        Ok(())
    }

    fn make_writable(&mut self, alloc: &mut SlabAlloc) -> Result<()> {
        if alloc.is_committed(self.ref_) {
            self.relocate(alloc, round_up(self.capacity.max(INITIAL_CAPACITY)))?;
        }
        Ok(())
    }

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

    /// Re-packs every string at a wider element width, relocating the node.
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
        for (ndx, value) in values.iter().enumerate() {
            self.write_elem(alloc, ndx, value)?;
        }

        alloc.free(old_ref, old_capacity);
        self.notify_parent(alloc)
    }

    fn notify_parent(&self, alloc: &mut SlabAlloc) -> Result<()> {
        if let Some(parent) = &self.parent {
            parent.notify(alloc, self.ref_)?;
        }
        Ok(())
    }
}

/// Smallest power-of-two width leaving room for a trailing NUL.
fn required_width(len: usize) -> Result<usize> {
    ensure!(
        len < MAX_STRING_WIDTH,
        "string of {} bytes exceeds the maximum of {}",
        len,
        MAX_STRING_WIDTH - 1
    );
    Ok((len + 1).next_power_of_two())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_get() {
        let mut alloc = SlabAlloc::scratch();
        let mut arr = ArrayString::create(&mut alloc, None).unwrap();

        arr.add(&mut alloc, "abc").unwrap();
        arr.add(&mut alloc, "").unwrap();
        arr.add(&mut alloc, "xy").unwrap();

        assert_eq!(arr.len(), 3);
        assert_eq!(arr.get(&alloc, 0).unwrap(), "abc");
        assert_eq!(arr.get(&alloc, 1).unwrap(), "");
        assert_eq!(arr.get(&alloc, 2).unwrap(), "xy");
    }

    #[test]
    fn widening_preserves_existing_strings() {
        let mut alloc = SlabAlloc::scratch();
        let mut arr = ArrayString::create(&mut alloc, None).unwrap();
        arr.add(&mut alloc, "ab").unwrap();

        arr.add(&mut alloc, "a longer string than four bytes").unwrap();

        assert_eq!(arr.get(&alloc, 0).unwrap(), "ab");
        assert_eq!(
            arr.get(&alloc, 1).unwrap(),
            "a longer string than four bytes"
        );
    }

    #[test]
    fn set_can_widen() {
        let mut alloc = SlabAlloc::scratch();
        let mut arr = ArrayString::create(&mut alloc, None).unwrap();
        arr.add(&mut alloc, "a").unwrap();
        arr.add(&mut alloc, "b").unwrap();

        arr.set(&mut alloc, 0, "much longer value").unwrap();

        assert_eq!(arr.get(&alloc, 0).unwrap(), "much longer value");
        assert_eq!(arr.get(&alloc, 1).unwrap(), "b");
    }

    #[test]
    fn find_matches_exactly() {
        let mut alloc = SlabAlloc::scratch();
        let mut arr = ArrayString::create(&mut alloc, None).unwrap();
        arr.add(&mut alloc, "people").unwrap();
        arr.add(&mut alloc, "orders").unwrap();

        assert_eq!(arr.find(&alloc, "orders").unwrap(), Some(1));
        assert_eq!(arr.find(&alloc, "order").unwrap(), None);
        assert_eq!(arr.find(&alloc, "missing").unwrap(), None);
    }

    #[test]
    fn interior_nul_is_rejected() {
        let mut alloc = SlabAlloc::scratch();
        let mut arr = ArrayString::create(&mut alloc, None).unwrap();

        let result = arr.add(&mut alloc, "a\0b");

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("NUL"));
        assert_eq!(arr.len(), 0);
    }

    #[test]
    fn oversized_string_is_rejected() {
        let mut alloc = SlabAlloc::scratch();
        let mut arr = ArrayString::create(&mut alloc, None).unwrap();

        let result = arr.add(&mut alloc, &"x".repeat(MAX_STRING_WIDTH));

        assert!(result.is_err());
    }

    #[test]
    fn attach_roundtrip() {
        let mut alloc = SlabAlloc::scratch();
        let mut arr = ArrayString::create(&mut alloc, None).unwrap();
        arr.add(&mut alloc, "people").unwrap();
        arr.add(&mut alloc, "orders").unwrap();

        let attached = ArrayString::attach(&alloc, arr.get_ref(), None).unwrap();

        assert_eq!(attached.len(), 2);
        assert_eq!(attached.get(&alloc, 0).unwrap(), "people");
        assert_eq!(attached.get(&alloc, 1).unwrap(), "orders");
    }

    #[test]
    fn element_without_nul_terminator_is_an_error() {
        // A header that validates but whose element fills the full width.
        let header = NodeHeader::new(FLAG_STRINGS, 4, 1, 24);
        let mut buffer = vec![0u8; 32];
        buffer[0..8].copy_from_slice(&8u64.to_le_bytes());
        buffer[8..24].copy_from_slice(zerocopy::IntoBytes::as_bytes(&header));
        buffer[24..28].copy_from_slice(b"abcd");
        let alloc = SlabAlloc::from_buffer(buffer).unwrap();

        let arr = ArrayString::attach(&alloc, 8, None).unwrap();
        let result = arr.get(&alloc, 0);

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("NUL"));
    }

    #[test]
    fn attach_rejects_int_node() {
        let mut alloc = SlabAlloc::scratch();
        let mut ints = super::super::Array::create(&mut alloc, false, None).unwrap();
        ints.add(&mut alloc, 1).unwrap();

        assert!(ArrayString::attach(&alloc, ints.get_ref(), None).is_err());
    }

    #[test]
    fn many_strings_grow_capacity() {
        let mut alloc = SlabAlloc::scratch();
        let mut arr = ArrayString::create(&mut alloc, None).unwrap();

        for i in 0..200 {
            arr.add(&mut alloc, &format!("value-{}", i)).unwrap();
        }

        assert_eq!(arr.len(), 200);
        assert_eq!(arr.get(&alloc, 0).unwrap(), "value-0");
        assert_eq!(arr.get(&alloc, 199).unwrap(), "value-199");
    }
}
