//! # Table Accessors
//!
//! This module implements the minimal table surface the store commits and
//! serializes. The rich typed-table API (per-row cursors, condition
//! evaluation, subtable columns) is a higher layer consumed through this
//! narrow interface; what lives here is exactly what the tree needs: typed
//! columns of ints and strings, appends, point reads, and a JSON body.
//!
//! ## Node Layout
//!
//! A table is a small subtree of array nodes:
//!
//! ```text
//! table root (HAS_REFS, 3 slots)
//! ├── slot 0: column names   (ArrayString)
//! ├── slot 1: column kinds   (int array: 0 = int, 1 = string)
//! └── slot 2: column data    (HAS_REFS, one ref per column)
//!     ├── slot 0: first column  (int array or ArrayString)
//!     └── ...
//! ```
//!
//! All columns hold the same number of rows; `add_row` appends one value per
//! column and rejects arity, type, and string-value violations before
//! touching any node, so a failed append never leaves columns skewed.
//!
//! ## Relocation Propagation
//!
//! Column nodes carry parent links into the column-data node, the
//! column-data node into the table root, and the root into the Group's
//! tables array. A mutation deep in a column therefore bubbles its new refs
//! all the way to the top array, keeping the committed tree consistent with
//! every accessor's cached refs.
//!
//! ## Integer Encoding
//!
//! Int cells are zigzag-encoded so small negative values stay in narrow
//! element widths instead of forcing every column to 8 bytes.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use eyre::{ensure, Result};

use crate::alloc::{Ref, SlabAlloc};
use crate::array::header::MAX_STRING_WIDTH;
use crate::array::{Array, ArrayString, ParentLink};

/// Longest permitted table or column name, in bytes.
pub const MAX_NAME_LEN: usize = 63;

const SLOT_COL_NAMES: usize = 0;
const SLOT_COL_KINDS: usize = 1;
const SLOT_COL_DATA: usize = 2;
const ROOT_SLOTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Int,
    String,
}

impl ColumnKind {
    fn from_tag(tag: u64) -> Result<Self> {
        match tag {
            0 => Ok(Self::Int),
            1 => Ok(Self::String),
            other => eyre::bail!("corrupt table: unknown column kind tag {}", other),
        }
    }

    fn tag(self) -> u64 {
        match self {
            Self::Int => 0,
            Self::String => 1,
        }
    }
}

/// A single cell value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Str(String),
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_owned())
    }
}

#[derive(Debug)]
enum ColumnStore {
    Int(Array),
    Str(ArrayString),
}

impl ColumnStore {
    fn kind(&self) -> ColumnKind {
        match self {
            Self::Int(_) => ColumnKind::Int,
            Self::Str(_) => ColumnKind::String,
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Int(arr) => arr.len(),
            Self::Str(arr) => arr.len(),
        }
    }
}

#[derive(Debug)]
pub struct Table {
    alloc: Rc<RefCell<SlabAlloc>>,
    root: Rc<RefCell<Array>>,
    col_names: ArrayString,
    col_kinds: Array,
    col_data: Rc<RefCell<Array>>,
    columns: Vec<ColumnStore>,
}

impl Table {
    /// Creates a fresh empty table subtree. The caller wires the root into
    /// its parent slot afterwards via [`Table::set_parent`].
    pub(crate) fn create(alloc: &Rc<RefCell<SlabAlloc>>) -> Result<Rc<RefCell<Self>>> {
        let mut a = alloc.borrow_mut();

        let root = Rc::new(RefCell::new(Array::create(&mut a, true, None)?));
        let col_names = ArrayString::create(&mut a, Some(ParentLink::new(&root, SLOT_COL_NAMES)))?;
        let col_kinds = Array::create(&mut a, false, Some(ParentLink::new(&root, SLOT_COL_KINDS)))?;
        let col_data = Rc::new(RefCell::new(Array::create(
            &mut a,
            true,
            Some(ParentLink::new(&root, SLOT_COL_DATA)),
        )?));

        {
            let mut r = root.borrow_mut();
            r.add(&mut a, col_names.get_ref())?;
            r.add(&mut a, col_kinds.get_ref())?;
            let data_ref = col_data.borrow().get_ref();
            r.add(&mut a, data_ref)?;
        }
        drop(a);

        Ok(Rc::new(RefCell::new(Self {
            alloc: alloc.clone(),
            root,
            col_names,
            col_kinds,
            col_data,
            columns: Vec::new(),
        })))
    }

    /// Attaches to an existing table root.
    pub(crate) fn attach(
        alloc: &Rc<RefCell<SlabAlloc>>,
        root_ref: Ref,
    ) -> Result<Rc<RefCell<Self>>> {
        let a = alloc.borrow();

        let root = Rc::new(RefCell::new(Array::attach(&a, root_ref, None)?));
        let (col_names, col_kinds, col_data) = Self::attach_children(&a, &root)?;
        let col_data = Rc::new(RefCell::new(col_data));
        let columns = Self::attach_columns(&a, &col_kinds, &col_data)?;
        drop(a);

        Ok(Rc::new(RefCell::new(Self {
            alloc: alloc.clone(),
            root,
            col_names,
            col_kinds,
            col_data,
            columns,
        })))
    }

    fn attach_children(
        a: &SlabAlloc,
        root: &Rc<RefCell<Array>>,
    ) -> Result<(ArrayString, Array, Array)> {
        let r = root.borrow();
        ensure!(
            r.has_refs() && r.len() >= ROOT_SLOTS,
            "corrupt table root at ref {}",
            r.get_ref()
        );

        let col_names = ArrayString::attach(
            a,
            r.get(a, SLOT_COL_NAMES)?,
            Some(ParentLink::new(root, SLOT_COL_NAMES)),
        )?;
        let col_kinds = Array::attach(
            a,
            r.get(a, SLOT_COL_KINDS)?,
            Some(ParentLink::new(root, SLOT_COL_KINDS)),
        )?;
        let col_data = Array::attach(
            a,
            r.get(a, SLOT_COL_DATA)?,
            Some(ParentLink::new(root, SLOT_COL_DATA)),
        )?;

        ensure!(
            col_names.len() == col_kinds.len() && col_kinds.len() == col_data.len(),
            "corrupt table: column lists disagree ({} names, {} kinds, {} data refs)",
            col_names.len(),
            col_kinds.len(),
            col_data.len()
        );

        Ok((col_names, col_kinds, col_data))
    }

    fn attach_columns(
        a: &SlabAlloc,
        col_kinds: &Array,
        col_data: &Rc<RefCell<Array>>,
    ) -> Result<Vec<ColumnStore>> {
        let mut columns = Vec::with_capacity(col_kinds.len());
        for slot in 0..col_kinds.len() {
            let kind = ColumnKind::from_tag(col_kinds.get(a, slot)?)?;
            let data_ref = col_data.borrow().get(a, slot)?;
            let link = Some(ParentLink::new(col_data, slot));
            columns.push(match kind {
                ColumnKind::Int => ColumnStore::Int(Array::attach(a, data_ref, link)?),
                ColumnKind::String => ColumnStore::Str(ArrayString::attach(a, data_ref, link)?),
            });
        }
        Ok(columns)
    }

    /// Re-attaches the whole accessor to a (possibly relocated) root after a
    /// commit or version switch, preserving its identity and parent wiring.
    pub(crate) fn update_from_ref(&mut self, new_root_ref: Ref) -> Result<()> {
        let alloc = self.alloc.clone();
        let a = alloc.borrow();

        let parent = self.root.borrow().parent_link();
        *self.root.borrow_mut() = Array::attach(&a, new_root_ref, parent)?;

        let (col_names, col_kinds, col_data) = Self::attach_children(&a, &self.root)?;
        // Column parent links target the existing col_data cell, so refresh
        // it in place rather than replacing the Rc.
        *self.col_data.borrow_mut() = col_data;
        self.columns = Self::attach_columns(&a, &col_kinds, &self.col_data)?;
        self.col_names = col_names;
        self.col_kinds = col_kinds;
        Ok(())
    }

    /// Wires the table root into its owner's child-ref slot.
    pub(crate) fn set_parent(&mut self, parent: Option<ParentLink>) {
        self.root.borrow_mut().set_parent(parent);
    }

    pub fn root_ref(&self) -> Ref {
        self.root.borrow().get_ref()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    pub fn row_count(&self) -> usize {
        self.columns.first().map_or(0, ColumnStore::len)
    }

    pub fn column_name(&self, col: usize) -> Result<String> {
        ensure!(
            col < self.columns.len(),
            "column index {} out of range ({} columns)",
            col,
            self.columns.len()
        );
        let a = self.alloc.borrow();
        Ok(self.col_names.get(&a, col)?.to_owned())
    }

    pub fn column_kind(&self, col: usize) -> Result<ColumnKind> {
        ensure!(
            col < self.columns.len(),
            "column index {} out of range ({} columns)",
            col,
            self.columns.len()
        );
        Ok(self.columns[col].kind())
    }

    /// Appends a column, backfilling default values for existing rows.
    pub fn add_column(&mut self, name: &str, kind: ColumnKind) -> Result<usize> {
        ensure!(
            name.len() <= MAX_NAME_LEN,
            "column name '{}' exceeds {} bytes",
            name,
            MAX_NAME_LEN
        );

        let alloc = self.alloc.clone();
        let mut a = alloc.borrow_mut();

        let slot = self.columns.len();
        let rows = self.row_count();

        // Reserve the child-ref slot first so relocation notifications from
        // the new column always land on an existing slot.
        self.col_data.borrow_mut().add(&mut a, 0)?;

        let link = Some(ParentLink::new(&self.col_data, slot));
        let store = match kind {
            ColumnKind::Int => {
                let mut arr = Array::create(&mut a, false, link)?;
                for _ in 0..rows {
                    arr.add(&mut a, zigzag_encode(0))?;
                }
                ColumnStore::Int(arr)
            }
            ColumnKind::String => {
                let mut arr = ArrayString::create(&mut a, link)?;
                for _ in 0..rows {
                    arr.add(&mut a, "")?;
                }
                ColumnStore::Str(arr)
            }
        };

        let data_ref = match &store {
            ColumnStore::Int(arr) => arr.get_ref(),
            ColumnStore::Str(arr) => arr.get_ref(),
        };
        self.col_data.borrow_mut().set(&mut a, slot, data_ref)?;
        self.col_names.add(&mut a, name)?;
        self.col_kinds.add(&mut a, kind.tag())?;
        self.columns.push(store);

        Ok(slot)
    }

    /// Appends one row, one value per column in column order.
    pub fn add_row(&mut self, values: &[Value]) -> Result<usize> {
        ensure!(!self.columns.is_empty(), "table has no columns");
        ensure!(
            values.len() == self.columns.len(),
            "row has {} values but the table has {} columns",
            values.len(),
            self.columns.len()
        );
        // Every value must be known-good before the first column mutates,
        // otherwise a mid-row failure leaves columns of different lengths.
        for (col, (store, value)) in self.columns.iter().zip(values).enumerate() {
            match (store, value) {
                (ColumnStore::Int(_), Value::Int(_)) => {}
                (ColumnStore::Str(_), Value::Str(s)) => {
                    ensure!(
                        !s.bytes().any(|b| b == 0),
                        "column {}: strings may not contain NUL bytes",
                        col
                    );
                    ensure!(
                        s.len() < MAX_STRING_WIDTH,
                        "column {}: string of {} bytes exceeds the maximum of {}",
                        col,
                        s.len(),
                        MAX_STRING_WIDTH - 1
                    );
                }
                _ => eyre::bail!(
                    "type mismatch in column {}: expected {:?}",
                    col,
                    store.kind()
                ),
            }
        }

        let alloc = self.alloc.clone();
        let mut a = alloc.borrow_mut();
        let row = self.row_count();
        for (store, value) in self.columns.iter_mut().zip(values) {
            match (store, value) {
                (ColumnStore::Int(arr), Value::Int(v)) => arr.add(&mut a, zigzag_encode(*v))?,
                (ColumnStore::Str(arr), Value::Str(s)) => arr.add(&mut a, s)?,
                _ => unreachable!("kinds were checked above"),
            }
        }
        Ok(row)
    }

    pub fn get(&self, col: usize, row: usize) -> Result<Value> {
        ensure!(
            col < self.columns.len(),
            "column index {} out of range ({} columns)",
            col,
            self.columns.len()
        );
        let a = self.alloc.borrow();
        match &self.columns[col] {
            ColumnStore::Int(arr) => Ok(Value::Int(zigzag_decode(arr.get(&a, row)?))),
            ColumnStore::Str(arr) => Ok(Value::Str(arr.get(&a, row)?.to_owned())),
        }
    }

    /// Writes the table body as a JSON array of row objects.
    pub fn to_json<W: fmt::Write>(&self, out: &mut W) -> Result<()> {
        let a = self.alloc.borrow();
        out.write_char('[')?;
        for row in 0..self.row_count() {
            if row > 0 {
                out.write_char(',')?;
            }
            out.write_char('{')?;
            for (col, store) in self.columns.iter().enumerate() {
                if col > 0 {
                    out.write_char(',')?;
                }
                write_json_string(out, self.col_names.get(&a, col)?)?;
                out.write_char(':')?;
                match store {
                    ColumnStore::Int(arr) => {
                        write!(out, "{}", zigzag_decode(arr.get(&a, row)?))?
                    }
                    ColumnStore::Str(arr) => write_json_string(out, arr.get(&a, row)?)?,
                }
            }
            out.write_char('}')?;
        }
        out.write_char(']')?;
        Ok(())
    }
}

fn zigzag_encode(v: i64) -> u64 {
    ((v << 1) ^ (v >> 63)) as u64
}

fn zigzag_decode(u: u64) -> i64 {
    ((u >> 1) as i64) ^ -((u & 1) as i64)
}

/// Writes a JSON string literal with the required escapes.
pub(crate) fn write_json_string<W: fmt::Write>(out: &mut W, s: &str) -> Result<()> {
    out.write_char('"')?;
    for c in s.chars() {
        match c {
            '"' => out.write_str("\\\"")?,
            '\\' => out.write_str("\\\\")?,
            '\n' => out.write_str("\\n")?,
            '\r' => out.write_str("\\r")?,
            '\t' => out.write_str("\\t")?,
            c if (c as u32) < 0x20 => write!(out, "\\u{:04x}", c as u32)?,
            c => out.write_char(c)?,
        }
    }
    out.write_char('"')?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_alloc() -> Rc<RefCell<SlabAlloc>> {
        Rc::new(RefCell::new(SlabAlloc::scratch()))
    }

    #[test]
    fn fresh_table_is_empty() {
        let alloc = scratch_alloc();
        let table = Table::create(&alloc).unwrap();

        let t = table.borrow();
        assert_eq!(t.column_count(), 0);
        assert_eq!(t.row_count(), 0);
    }

    #[test]
    fn add_columns_and_rows() {
        let alloc = scratch_alloc();
        let table = Table::create(&alloc).unwrap();
        let mut t = table.borrow_mut();

        t.add_column("name", ColumnKind::String).unwrap();
        t.add_column("age", ColumnKind::Int).unwrap();

        t.add_row(&["alice".into(), 32i64.into()]).unwrap();
        t.add_row(&["bob".into(), (-7i64).into()]).unwrap();

        assert_eq!(t.column_count(), 2);
        assert_eq!(t.row_count(), 2);
        assert_eq!(t.get(0, 0).unwrap(), Value::Str("alice".into()));
        assert_eq!(t.get(1, 0).unwrap(), Value::Int(32));
        assert_eq!(t.get(0, 1).unwrap(), Value::Str("bob".into()));
        assert_eq!(t.get(1, 1).unwrap(), Value::Int(-7));
    }

    #[test]
    fn add_column_backfills_existing_rows() {
        let alloc = scratch_alloc();
        let table = Table::create(&alloc).unwrap();
        let mut t = table.borrow_mut();

        t.add_column("n", ColumnKind::Int).unwrap();
        t.add_row(&[1i64.into()]).unwrap();
        t.add_row(&[2i64.into()]).unwrap();

        t.add_column("label", ColumnKind::String).unwrap();

        assert_eq!(t.row_count(), 2);
        assert_eq!(t.get(1, 0).unwrap(), Value::Str(String::new()));
        assert_eq!(t.get(1, 1).unwrap(), Value::Str(String::new()));
    }

    #[test]
    fn row_arity_mismatch_is_rejected() {
        let alloc = scratch_alloc();
        let table = Table::create(&alloc).unwrap();
        let mut t = table.borrow_mut();
        t.add_column("a", ColumnKind::Int).unwrap();

        let result = t.add_row(&[1i64.into(), 2i64.into()]);

        assert!(result.is_err());
        assert_eq!(t.row_count(), 0);
    }

    #[test]
    fn type_mismatch_is_rejected_before_mutation() {
        let alloc = scratch_alloc();
        let table = Table::create(&alloc).unwrap();
        let mut t = table.borrow_mut();
        t.add_column("a", ColumnKind::Int).unwrap();
        t.add_column("b", ColumnKind::String).unwrap();

        let result = t.add_row(&["oops".into(), "x".into()]);

        assert!(result.is_err());
        assert_eq!(t.row_count(), 0, "no column was touched");
    }

    #[test]
    fn invalid_string_value_leaves_no_partial_row() {
        let alloc = scratch_alloc();
        let table = Table::create(&alloc).unwrap();
        let mut t = table.borrow_mut();
        t.add_column("name", ColumnKind::String).unwrap();
        t.add_column("note", ColumnKind::String).unwrap();

        // The bad value sits in the second column: the first column must not
        // gain a row before the second is checked.
        assert!(t.add_row(&["ok".into(), "a\0b".into()]).is_err());
        let oversized = "x".repeat(MAX_STRING_WIDTH);
        assert!(t.add_row(&["ok".into(), oversized.as_str().into()]).is_err());
        assert_eq!(t.row_count(), 0, "no column was touched");

        t.add_row(&["ok".into(), "fine".into()]).unwrap();
        assert_eq!(t.row_count(), 1);
        assert_eq!(t.get(0, 0).unwrap(), Value::Str("ok".into()));
    }

    #[test]
    fn oversized_column_name_is_rejected() {
        let alloc = scratch_alloc();
        let table = Table::create(&alloc).unwrap();
        let mut t = table.borrow_mut();

        assert!(t.add_column(&"x".repeat(64), ColumnKind::Int).is_err());
        assert!(t.add_column(&"x".repeat(63), ColumnKind::Int).is_ok());
    }

    #[test]
    fn negative_ints_round_trip_narrowly() {
        let alloc = scratch_alloc();
        let table = Table::create(&alloc).unwrap();
        let mut t = table.borrow_mut();
        t.add_column("v", ColumnKind::Int).unwrap();

        for v in [-1i64, 0, 1, -64, 63, i64::MIN, i64::MAX] {
            t.add_row(&[v.into()]).unwrap();
        }

        for (row, v) in [-1i64, 0, 1, -64, 63, i64::MIN, i64::MAX].iter().enumerate() {
            assert_eq!(t.get(0, row).unwrap(), Value::Int(*v));
        }
    }

    #[test]
    fn attach_reads_existing_table() {
        let alloc = scratch_alloc();
        let root_ref;
        {
            let table = Table::create(&alloc).unwrap();
            let mut t = table.borrow_mut();
            t.add_column("name", ColumnKind::String).unwrap();
            t.add_row(&["carol".into()]).unwrap();
            root_ref = t.root_ref();
        }

        let table = Table::attach(&alloc, root_ref).unwrap();
        let t = table.borrow();

        assert_eq!(t.column_count(), 1);
        assert_eq!(t.column_name(0).unwrap(), "name");
        assert_eq!(t.column_kind(0).unwrap(), ColumnKind::String);
        assert_eq!(t.get(0, 0).unwrap(), Value::Str("carol".into()));
    }

    #[test]
    fn attach_rejects_non_table_node() {
        let alloc = scratch_alloc();
        let ref_ = {
            let mut a = alloc.borrow_mut();
            let mut arr = Array::create(&mut a, false, None).unwrap();
            arr.add(&mut a, 1).unwrap();
            arr.get_ref()
        };

        assert!(Table::attach(&alloc, ref_).is_err());
    }

    #[test]
    fn json_body_is_rows_of_objects() {
        let alloc = scratch_alloc();
        let table = Table::create(&alloc).unwrap();
        let mut t = table.borrow_mut();
        t.add_column("name", ColumnKind::String).unwrap();
        t.add_column("age", ColumnKind::Int).unwrap();
        t.add_row(&["a\"b".into(), 1i64.into()]).unwrap();
        t.add_row(&["c".into(), (-2i64).into()]).unwrap();

        let mut out = String::new();
        t.to_json(&mut out).unwrap();

        assert_eq!(out, r#"[{"name":"a\"b","age":1},{"name":"c","age":-2}]"#);
    }

    #[test]
    fn zigzag_round_trip() {
        for v in [0i64, 1, -1, 2, -2, i64::MAX, i64::MIN, 1234567, -7654321] {
            assert_eq!(zigzag_decode(zigzag_encode(v)), v);
        }
        assert_eq!(zigzag_encode(0), 0);
        assert_eq!(zigzag_encode(-1), 1);
        assert_eq!(zigzag_encode(1), 2);
    }

    #[test]
    fn json_string_escaping() {
        let mut out = String::new();
        write_json_string(&mut out, "a\"b\\c\nd\u{1}").unwrap();

        assert_eq!(out, r#""a\"b\\c\nd\u0001""#);
    }
}
