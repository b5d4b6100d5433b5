//! The collaborator interfaces the core HAMT consumes (spec.md section
//! 6.2). These are deliberately thin: the mapped-file manager, its
//! transaction lifecycle, and user key/value serialization are all
//! external to this crate's scope (spec.md section 1). A concrete pair is
//! provided in [`crate::mem_store`] for tests and examples.

use crate::address::Address;
use crate::error::Error;

/// Shared, read-only bytes borrowed from a mapped region of the store.
pub type SharedBytes<'a> = &'a [u8];

/// A writable view into freshly allocated store bytes, returned by
/// [`Transaction::alloc_rw`].
pub type MutBytes<'a> = &'a mut [u8];

/// Read access to the store. Readers may be held concurrently with the
/// one writer; they observe whatever revision they were opened against
/// and nothing newer (spec.md section 5).
pub trait Database {
    /// Returns `nbytes` bytes starting at `addr`.
    fn getro(&self, addr: Address, nbytes: usize) -> Result<SharedBytes<'_>, Error>;

    /// The revision number of the tip the store last committed.
    fn current_revision(&self) -> u64;
}

/// The single writable transaction a writer may hold at a time.
pub trait Transaction {
    type Db: Database;

    fn db(&self) -> &Self::Db;

    /// Allocates `bytes` bytes aligned to `align`, returning a writable
    /// view and the address it will live at once committed.
    fn alloc_rw(&mut self, bytes: usize, align: usize) -> Result<(MutBytes<'_>, Address), Error>;
}

/// A cursor that pulls bytes out of a [`Database`] one request at a time,
/// advancing past whatever was just read. This is how a `Codec` reads a
/// leaf of unknown length: it asks for exactly the bytes it needs (say, a
/// length prefix), then asks again now that it knows how much payload
/// follows, rather than the core having to know a leaf's total encoded
/// size up front.
pub struct Reader<'a, D: Database> {
    db: &'a D,
    addr: Address,
}

impl<'a, D: Database> Reader<'a, D> {
    pub fn new(db: &'a D, addr: Address) -> Self {
        Reader { db, addr }
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<SharedBytes<'a>, Error> {
        let bytes = self.db.getro(self.addr, n)?;
        self.addr = Address(self.addr.0 + n as u64);
        Ok(bytes)
    }

    pub fn position(&self) -> Address {
        self.addr
    }
}

/// Serializes and deserializes a user key or value to/from store bytes.
/// Stands in for spec.md section 6.2's `read<T>(reader)`/`write(writer, v)`.
pub trait Codec: Sized {
    fn encoded_len(&self) -> usize;
    fn encode_into(&self, buf: &mut [u8]);
    fn read_from<D: Database>(reader: &mut Reader<'_, D>) -> Result<Self, Error>;
}

/// Writes `key` immediately followed by `value` at a freshly allocated,
/// 4-byte aligned address, and returns that address -- the only contract
/// a leaf's address carries (spec.md section 6.1).
pub fn write_leaf<K: Codec, V: Codec>(tx: &mut impl Transaction, key: &K, value: &V) -> Result<Address, Error> {
    let len = key.encoded_len() + value.encoded_len();
    let (buf, addr) = tx.alloc_rw(len, 4)?;
    key.encode_into(&mut buf[..key.encoded_len()]);
    value.encode_into(&mut buf[key.encoded_len()..]);
    Ok(addr)
}

/// Reads a `(key, value)` leaf pair back out of the store at `addr`.
pub fn read_leaf<K: Codec, V: Codec, D: Database>(db: &D, addr: Address) -> Result<(K, V), Error> {
    let mut reader = Reader::new(db, addr);
    let key = K::read_from(&mut reader)?;
    let value = V::read_from(&mut reader)?;
    Ok((key, value))
}

/// Reads just a leaf's key, for the equality checks `find`/`insert` do
/// constantly without needing the associated value.
pub fn read_leaf_key<K: Codec, D: Database>(db: &D, addr: Address) -> Result<K, Error> {
    let mut reader = Reader::new(db, addr);
    K::read_from(&mut reader)
}
