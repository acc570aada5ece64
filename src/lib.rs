//! # StrataDB - Embedded Copy-on-Write Table Store
//!
//! StrataDB is an embedded, file-backed storage engine: tables of typed
//! columns laid out as a hierarchical tree of binary array nodes over a
//! custom slab allocator. This implementation prioritizes:
//!
//! - **Zero-copy data access**: Nodes are read straight off the mmap,
//!   headers decoded in place
//! - **Copy-on-write versioning**: Committed bytes are immutable; a commit
//!   swaps a single 8-byte top ref as its only visibility boundary
//! - **Self-contained files**: One flat file, no sidecar journal, garbage
//!   reclaimed through an in-file free-space ledger
//!
//! ## Quick Start
//!
//! ```ignore
//! use stratadb::{ColumnKind, Group, OpenMode};
//!
//! let mut group = Group::open("./people.strata", OpenMode::ReadWrite)?;
//! let table = group.get_table("people")?;
//! {
//!     let mut t = table.borrow_mut();
//!     t.add_column("name", ColumnKind::String)?;
//!     t.add_column("age", ColumnKind::Int)?;
//!     t.add_row(&["alice".into(), 32i64.into()])?;
//! }
//! group.commit()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │       Public API (Group/Table)       │
//! ├─────────────────────────────────────┤
//! │  Commit Planner & Free-Space Ledger  │
//! ├─────────────────────────────────────┤
//! │   Array Nodes (ints/refs/strings)    │
//! ├─────────────────────────────────────┤
//! │   Slab Allocator (COW ref space)     │
//! ├─────────────────────────────────────┤
//! │      Memory-Mapped File Backing      │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! ```text
//! offset 0    8-byte LE top ref (0 = empty store)
//! offset 8..  array nodes: 16-byte header + fixed-width elements,
//!             8-byte aligned, linked by byte-offset refs
//! ```
//!
//! ## Module Overview
//!
//! - [`storage`]: Memory-mapped file backing
//! - [`alloc`]: Slab allocator, refs, free tracking
//! - [`array`]: Array nodes, headers, parent links, string nodes
//! - [`group`]: Root object, commit, serialization, free-space pool
//! - [`table`]: Typed-column table accessors

mod macros;

pub mod alloc;
pub mod array;
pub mod group;
pub mod storage;
pub mod table;

pub use alloc::{MemStats, Ref, NO_REF};
pub use group::{Group, OpenMode};
pub use table::{ColumnKind, Table, Value};
