//! A persistent, content-addressed Hash Array Mapped Trie index over an
//! append-only store: nodes live partly in a memory-mapped database file
//! and partly on a transaction-local heap, with snapshot isolation across
//! revisions and copy-on-write mutation.
//!
//! The mapped-file manager, its transaction lifecycle, and user key/value
//! serialization are external collaborators this crate only names through
//! the [`db::Database`]/[`db::Transaction`]/[`db::Codec`] traits; a
//! concrete pair backed by a real file is provided in [`mem_store`] for
//! tests and examples.

mod address;
mod arena;
mod db;
mod error;
mod hamt;
mod header;
mod iter;
pub mod mem_store;
mod node;
mod parent_stack;

pub use address::{Address, NodeRef, StoreRef};
pub use arena::{ArenaIndex, ChunkedArena};
pub use db::{Codec, Database, MutBytes, Reader, SharedBytes, Transaction};
pub use error::{Error, Result};
pub use hamt::HamtMap;
pub use header::{HeaderBlock, HEADER_SIZE};
pub use iter::Iter;
pub use node::{InternalNode, LinearNode, MAX_CHILDREN};
pub use parent_stack::{ParentEntry, ParentStack, MAX_TREE_DEPTH};
