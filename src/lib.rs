//! Yogatable is a schema-less document table over a local SQLite file,
//! with secondary indexes that are declared after the fact and built in
//! the background while reads and writes keep flowing.
//!
//! Documents are free-form maps identified by a unique `_id` string,
//! assigned on insert when absent. Indexes are ordered column lists,
//! with per-column case-insensitive and descending variants; their rows
//! are binary keys packed so that byte order matches value order, which
//! turns every filter+order query into a single range (or IN-set) scan.
//!
//! **Inventory of components**
//!
//! * [pack] encodes heterogeneous scalars into order-preserving bytes.
//! * [rows] expands a document into its index rows, cartesian across
//!   list-valued columns, under configurable count/length policies.
//! * [store] owns the `_data`/`_index`/`_indexes` relations and the
//!   monotonic write-stamp sequence.
//! * [table] serves CRUD, catalog changes and planned queries over one
//!   table, and carries the three background maintenance passes.
//! * [plan] picks the narrowest covering index and compiles filters
//!   into packed range scans.
//! * [worker] runs one gen-server style thread per table, interleaving
//!   requests with indexing, drop draining and vacuum under an
//!   adaptive latency budget.
//!
//! Every on-disk mutation happens inside a transaction of the
//! underlying engine; a table's worker is strictly single-threaded, so
//! there is no intra-table locking anywhere.

#[macro_use]
mod error;

pub mod config;
pub mod pack;
pub mod plan;
pub mod rows;
pub mod store;
pub mod table;
pub mod value;
pub mod worker;

pub use crate::config::Config;
pub use crate::error::{Error, Result};
pub use crate::plan::{Cmp, Filter, Limit};
pub use crate::table::TableAdapter;
pub use crate::value::{Document, Value};
pub use crate::worker::Worker;
