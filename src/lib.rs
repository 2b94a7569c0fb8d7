// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! An on-disk B+tree secondary-index engine with crash recovery.
//!
//! ##### About
//!
//! This crate indexes fixed-length key prefixes of a column value against
//! record offsets in an append-only data table (the table is an external
//! collaborator implementing [`DataTable`]; this crate never owns row
//! storage). It backs the secondary-index layer of a replicated relational
//! store: every row lives once, in the table, and an index here is a
//! disposable, rebuildable acceleration structure over it.
//!
//! The index is a disk-resident B+tree ([`Index`]) backed by a process-wide,
//! reference-counted mmap'd block cache ([`cache`]). Writers are assumed to
//! be externally serialized (a single cooperative task lock per index, see
//! [`Index::write_lock`]); readers may run concurrently and tolerate a
//! writer's in-flight modifications via the cursor-repair protocol
//! ([`cursor`]).
//!
//! Because the index only ever lags the table — never gets ahead of it — a
//! crash mid-update just means "rebuild"; see [`header`]'s `SYNCED` witness
//! and [`lazy_update`]'s catch-up pass for the recovery contract.
//!
//! # Example usage
//!
//! ```
//! use bplustree_index::{Config, DataTable, OperatorClass};
//! use bplustree_index::offset::BlockOffset;
//! use bplustree_index::table_iface::{RecordFingerprint, RecordHeader};
//! use bplustree_index::stop_signal::StopSignal;
//!
//! # struct ExampleTable;
//! # impl DataTable for ExampleTable {
//! #     fn first_block(&self) -> BlockOffset { BlockOffset(0) }
//! #     fn next_block(&self, _bh: BlockOffset, _off: BlockOffset) -> Option<BlockOffset> { None }
//! #     fn append(&self) -> BlockOffset { BlockOffset(0) }
//! #     fn read_record(&self, _pos: BlockOffset) -> bplustree_index::Result<RecordHeader> { unimplemented!() }
//! #     fn column_value(&self, _pos: BlockOffset, _col: u32) -> bplustree_index::Result<Vec<u8>> { unimplemented!() }
//! #     fn fingerprint(&self, _pos: BlockOffset) -> bplustree_index::Result<RecordFingerprint> { unimplemented!() }
//! #     fn generation(&self) -> u64 { 1 }
//! # }
//! # let folder = tempfile::tempdir()?;
//! # let table = ExampleTable;
//!
//! // An index covers one (virtual table, column) pair under one comparator.
//! let index = Config::new(/* vtable_id */ 1, /* col_id */ 0, OperatorClass::Eq)
//!     .slop(1024)
//!     .open(folder.path().join("users.vt0001.i0000.o0"), &table)?;
//!
//! // The scan driver narrows a range, then iterates it.
//! let stop = StopSignal::default();
//! let range = bplustree_index::scan::set_range(
//!     &index, &table, None, 1024, false, &stop, &mut || {},
//! )?;
//! let mut scan = bplustree_index::scan::RangeScan::new(&index, &table, 0, None, &range)?;
//! for record in &mut scan {
//!     let _ro = record?;
//! }
//! scan.finish()?;
//!
//! index.close()?;
//! #
//! # Ok::<(), bplustree_index::Error>(())
//! ```

#![doc(html_logo_url = "https://raw.githubusercontent.com/fjall-rs/lsm-tree/main/logo.png")]
#![doc(html_favicon_url = "https://raw.githubusercontent.com/fjall-rs/lsm-tree/main/logo.png")]
#![deny(unsafe_code)]
#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::indexing_slicing)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![warn(clippy::multiple_crate_versions)]
#![allow(clippy::option_if_let_else)]

pub mod binary_search;

#[doc(hidden)]
pub mod bounds;

pub mod cache;

pub mod coding;

pub mod comparator;

pub mod config;

pub mod constants;

#[doc(hidden)]
pub mod cursor;

pub mod element;

mod error;

pub mod header;

#[doc(hidden)]
pub mod lazy_update;

pub mod lifecycle;

#[doc(hidden)]
pub mod mutator;

pub mod node;

pub mod offset;

pub mod scan;

#[doc(hidden)]
pub mod stop_signal;

pub mod table_iface;

pub use {
    comparator::OperatorClass,
    config::Config,
    error::{Error, Result},
    lifecycle::Index,
    scan::{RangeScan, Relation, ScanRange},
    table_iface::DataTable,
};
