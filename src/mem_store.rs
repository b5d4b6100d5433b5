//! A minimal, concrete `Database`/`Transaction` pair backed by a real
//! append-only file and `memmap2`, so this crate is exercisable end to
//! end without wiring up an external mapped-file manager.
//!
//! Grounded on the teacher's `tmp_nodes.rs`: write through a buffered
//! file, then memory-map it for zero-copy reads. `tmp_nodes.rs` maps once
//! after all writes finish; this store remaps after every commit, since a
//! `HamtMap` keeps reading through the same store across many
//! transactions over its lifetime.
//!
//! This is ambient test/demo infrastructure (SPEC_FULL.md section 1.3),
//! not part of the core index -- the core only ever depends on the
//! `Database`/`Transaction` traits in `db.rs`.

use std::cell::RefCell;
use std::fs::File;
use std::io::{Seek, SeekFrom, Write};

use memmap2::Mmap;

use crate::address::Address;
use crate::db::{Database, MutBytes, SharedBytes, Transaction};
use crate::error::Error;

/// Bytes reserved at the front of every store so address `0` is never
/// handed out to a real allocation and can safely mean "null"
/// (DESIGN.md, "Null address value").
const PROLOGUE_BYTES: u64 = 8;

struct Inner {
    file: File,
    // Every committed mapping is kept alive for the store's lifetime
    // instead of being replaced: a `getro` slice borrowed from an older
    // mapping must stay valid even after a later commit remaps the
    // (now longer) file. Reads always use the most recent entry.
    mmaps: Vec<Mmap>,
    len: u64,
    revision: u64,
    writer_active: bool,
}

/// An append-only, memory-mapped store. Single-writer, many-reader, the
/// way spec.md section 5 describes: `begin_write` fails if a transaction
/// is already open, the way an external transaction manager would refuse
/// a second writer.
pub struct MemStore {
    inner: RefCell<Inner>,
}

impl MemStore {
    pub fn create() -> Result<Self, Error> {
        let mut file = tempfile::tempfile().map_err(io_err)?;
        file.write_all(&[0u8; PROLOGUE_BYTES as usize]).map_err(io_err)?;
        file.flush().map_err(io_err)?;
        let mmap = unsafe { Mmap::map(&file).map_err(io_err)? };
        Ok(MemStore {
            inner: RefCell::new(Inner {
                file,
                mmaps: vec![mmap],
                len: PROLOGUE_BYTES,
                revision: 0,
                writer_active: false,
            }),
        })
    }

    /// Opens the single writable transaction. Fails if one is already
    /// open, matching the "at most one writable transaction" rule.
    pub fn begin_write(&self) -> Result<MemTransaction<'_>, Error> {
        let mut inner = self.inner.borrow_mut();
        if inner.writer_active {
            return Err(Error::Allocation("a writable transaction is already open".into()));
        }
        inner.writer_active = true;
        let base = inner.len;
        Ok(MemTransaction { store: self, pending: Vec::new(), base, committed: false })
    }
}

impl Database for MemStore {
    fn getro(&self, addr: Address, nbytes: usize) -> Result<SharedBytes<'_>, Error> {
        let inner = self.inner.borrow();
        let mmap = inner.mmaps.last().ok_or_else(|| Error::Corrupt("store has no committed data yet".into()))?;
        let start = addr.0 as usize;
        let end = start.checked_add(nbytes).ok_or_else(|| Error::Corrupt("read range overflowed".into()))?;
        if end > mmap.len() {
            return Err(Error::Corrupt("read past the end of the store".into()));
        }
        // Safe because every mapping in `mmaps` is kept for the life of
        // `self` and never removed or replaced in place (see the field
        // comment on `Inner::mmaps`), so the borrow below may outlive the
        // `Ref` guard that produced it without dangling.
        let slice: &[u8] = &mmap[start..end];
        Ok(unsafe { std::slice::from_raw_parts(slice.as_ptr(), slice.len()) })
    }

    fn current_revision(&self) -> u64 {
        self.inner.borrow().revision
    }
}

/// The single writable transaction open against a [`MemStore`]. Allocates
/// by bumping a cursor into an in-memory pending buffer; nothing is
/// visible to readers until [`MemTransaction::commit`].
pub struct MemTransaction<'a> {
    store: &'a MemStore,
    pending: Vec<u8>,
    base: u64,
    committed: bool,
}

impl<'a> MemTransaction<'a> {
    /// Appends the pending bytes to the file, remaps it, and bumps the
    /// revision so new readers see this transaction's writes.
    pub fn commit(mut self) -> Result<(), Error> {
        let mut inner = self.store.inner.borrow_mut();
        inner.file.seek(SeekFrom::End(0)).map_err(io_err)?;
        inner.file.write_all(&self.pending).map_err(io_err)?;
        inner.file.flush().map_err(io_err)?;
        inner.len += self.pending.len() as u64;
        let mmap = unsafe { Mmap::map(&inner.file).map_err(io_err)? };
        inner.mmaps.push(mmap);
        inner.revision += 1;
        self.committed = true;
        Ok(())
    }

    /// Discards every pending write. Since nothing is appended to the
    /// file until `commit`, this just releases the writer slot.
    pub fn rollback(mut self) {
        self.committed = true;
    }
}

impl Transaction for MemTransaction<'_> {
    type Db = MemStore;

    fn db(&self) -> &MemStore {
        self.store
    }

    fn alloc_rw(&mut self, bytes: usize, align: usize) -> Result<(MutBytes<'_>, Address), Error> {
        assert!(align.is_power_of_two(), "alignment must be a power of two");
        let cursor = self.base + self.pending.len() as u64;
        let aligned = (cursor + align as u64 - 1) & !(align as u64 - 1);
        let pad = (aligned - cursor) as usize;
        self.pending.resize(self.pending.len() + pad, 0);
        let start = self.pending.len();
        self.pending.resize(start + bytes, 0);
        Ok((&mut self.pending[start..start + bytes], Address(aligned)))
    }
}

impl Drop for MemTransaction<'_> {
    fn drop(&mut self) {
        self.store.inner.borrow_mut().writer_active = false;
    }
}

fn io_err(e: std::io::Error) -> Error {
    Error::Allocation(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_rw_respects_alignment_and_addresses_are_past_the_prologue() {
        let store = MemStore::create().unwrap();
        let mut tx = store.begin_write().unwrap();
        let (_buf, addr) = tx.alloc_rw(3, 8).unwrap();
        assert_eq!(addr.0 % 8, 0);
        assert!(addr.0 >= PROLOGUE_BYTES);
    }

    #[test]
    fn commit_makes_writes_visible_and_bumps_revision() {
        let store = MemStore::create().unwrap();
        assert_eq!(store.current_revision(), 0);

        let mut tx = store.begin_write().unwrap();
        let (buf, addr) = tx.alloc_rw(4, 4).unwrap();
        buf.copy_from_slice(b"abcd");
        tx.commit().unwrap();

        assert_eq!(store.current_revision(), 1);
        assert_eq!(store.getro(addr, 4).unwrap(), b"abcd");
    }

    #[test]
    fn rollback_leaves_no_trace() {
        let store = MemStore::create().unwrap();
        let mut tx = store.begin_write().unwrap();
        tx.alloc_rw(4, 4).unwrap();
        tx.rollback();

        assert_eq!(store.current_revision(), 0);
        // the writer slot was released, a new transaction can be opened.
        assert!(store.begin_write().is_ok());
    }

    #[test]
    fn only_one_writer_at_a_time() {
        let store = MemStore::create().unwrap();
        let _tx = store.begin_write().unwrap();
        assert!(store.begin_write().is_err());
    }
}
