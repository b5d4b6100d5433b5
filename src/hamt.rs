//! The index itself: insert / insert-or-assign / find / iterate / flush /
//! rollback over a trie whose nodes are split between the store and the
//! current transaction's heap (spec.md component G).
//!
//! The public `HamtMap` keeps working state (`root`, `size`) separate from
//! `base_root`/`base_size`, the last committed (flushed-or-opened)
//! snapshot. Rollback just restores working state from the base snapshot
//! and clears the arena -- it never touches the store, since every
//! mutation is copy-on-write into heap nodes first (spec.md 4.G.5).

use std::marker::PhantomData;

use crate::address::{Address, NodeRef, StoreRef};
use crate::arena::ChunkedArena;
use crate::db::{self, Codec, Database, Transaction};
use crate::error::Error;
use crate::header::{self, HeaderBlock};
use crate::iter::Iter;
use crate::node::{self, InternalNode, LinearNode};
use crate::parent_stack::{ParentEntry, ParentStack, NOT_FOUND};

/// Bits of hash consumed per trie level (spec.md section 3,
/// `hash_index_bits`).
pub(crate) const HASH_INDEX_BITS: u32 = 6;
const HASH_INDEX_MASK: u64 = 0x3f;

/// Above this many consumed bits the hash is exhausted and any further
/// collision falls into a `LinearNode` instead of another `InternalNode`
/// (spec.md section 3, `max_hash_bits`; `66 / 6 == 11` internal levels).
pub(crate) const MAX_HASH_BITS: u32 = 66;

pub(crate) fn depth_is_internal_node(shift: u32) -> bool {
    shift < MAX_HASH_BITS
}

/// The persistent index. Borrows the database for reads and a
/// `ChunkedArena` for the internal nodes it creates while mutating.
pub struct HamtMap<'db, D: Database, K: Codec, V: Codec> {
    db: &'db D,
    root: NodeRef,
    size: u64,
    base_root: NodeRef,
    base_size: u64,
    revision: u64,
    arena: ChunkedArena<InternalNode>,
    hash: Box<dyn Fn(&K) -> u64>,
    equal: Box<dyn Fn(&K, &K) -> bool>,
    _value: PhantomData<V>,
}

impl<'db, D: Database, K: Codec, V: Codec> HamtMap<'db, D, K, V> {
    /// Opens the map rooted at `root_addr`, or an empty map if it is
    /// `Address::NULL`. Fails with [`Error::Corrupt`] if the header at
    /// `root_addr` doesn't validate.
    pub fn open(
        db: &'db D,
        root_addr: Address,
        hash: impl Fn(&K) -> u64 + 'static,
        equal: impl Fn(&K, &K) -> bool + 'static,
    ) -> Result<Self, Error> {
        let revision = db.current_revision();
        let (root, size) = if root_addr.is_null() {
            (NodeRef::Null, 0)
        } else {
            let bytes = db.getro(root_addr, header::HEADER_SIZE)?;
            let header = HeaderBlock::decode(bytes)?;
            (NodeRef::from(header.root), header.size)
        };
        tracing::debug!(size, revision, "opened hamt map");
        Ok(HamtMap {
            db,
            root: root.clone(),
            size,
            base_root: root,
            base_size: size,
            revision,
            arena: ChunkedArena::new(),
            hash: Box::new(hash),
            equal: Box::new(equal),
            _value: PhantomData,
        })
    }

    pub(crate) fn db(&self) -> &'db D {
        self.db
    }

    pub(crate) fn arena(&self) -> &ChunkedArena<InternalNode> {
        &self.arena
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Looks up `key`, returning `None` if it is not present.
    pub fn find(&self, key: &K) -> Result<Option<Iter<'_, D, K, V>>, Error> {
        if self.root.is_empty() {
            return Ok(None);
        }
        let hash = (self.hash)(key);
        let mut shift = 0u32;
        let mut node = self.root.clone();
        let mut stack = ParentStack::new();
        loop {
            if node.is_leaf() {
                let found: K = db::read_leaf_key(self.db, node.unwrap_store().address())?;
                if (self.equal)(&found, key) {
                    stack.push(ParentEntry { node, position: NOT_FOUND });
                    return Ok(Some(Iter::new(self, stack)));
                }
                return Ok(None);
            }
            let slot = ((hash >> shift) & HASH_INDEX_MASK) as u32;
            let (index, child) = if depth_is_internal_node(shift) {
                match internal_lookup_child(self.db, &self.arena, &node, slot)? {
                    Some(found) => found,
                    None => return Ok(None),
                }
            } else {
                match linear_lookup_leaf(self.db, &node, key, &*self.equal)? {
                    Some((index, addr)) => (index, NodeRef::from(StoreRef::leaf(addr))),
                    None => return Ok(None),
                }
            };
            stack.push(ParentEntry { node, position: index });
            node = child;
            shift += HASH_INDEX_BITS;
        }
    }

    pub fn contains(&self, key: &K) -> Result<bool, Error> {
        Ok(self.find(key)?.is_some())
    }

    /// An iterator over every (key, value) pair, leftmost leaf first.
    pub fn iter(&self) -> Result<Iter<'_, D, K, V>, Error> {
        let mut stack = ParentStack::new();
        if !self.root.is_empty() {
            descend_leftmost(self.db, &self.arena, self.root.clone(), &mut stack)?;
        }
        Ok(Iter::new(self, stack))
    }

    pub fn insert<T: Transaction<Db = D>>(
        &mut self,
        tx: &mut T,
        key: K,
        value: V,
    ) -> Result<(Iter<'_, D, K, V>, bool), Error> {
        self.insert_impl(tx, key, value, false)
    }

    pub fn insert_or_assign<T: Transaction<Db = D>>(
        &mut self,
        tx: &mut T,
        key: K,
        value: V,
    ) -> Result<(Iter<'_, D, K, V>, bool), Error> {
        self.insert_impl(tx, key, value, true)
    }

    fn insert_impl<T: Transaction<Db = D>>(
        &mut self,
        tx: &mut T,
        key: K,
        value: V,
        upsert: bool,
    ) -> Result<(Iter<'_, D, K, V>, bool), Error> {
        let current = tx.db().current_revision();
        if self.revision != current {
            return Err(Error::StaleRevision { opened: self.revision, current });
        }

        let mut reverse_path = Vec::new();

        if self.root.is_empty() {
            let addr = db::write_leaf(tx, &key, &value)?;
            let leaf = NodeRef::from(StoreRef::leaf(addr));
            reverse_path.push(ParentEntry { node: leaf.clone(), position: NOT_FOUND });
            self.root = leaf;
            self.size = 1;
            tracing::trace!("inserted first leaf into an empty map");
            return Ok((Iter::new(self, forward_stack(reverse_path)), true));
        }

        let hash = (self.hash)(&key);
        let previous_root = self.root.clone();
        let root = std::mem::replace(&mut self.root, NodeRef::Null);
        match self.insert_recursive(tx, root, 0, hash, &key, &value, upsert, &mut reverse_path) {
            Ok((new_root, existed)) => {
                self.root = new_root;
                if !existed {
                    self.size += 1;
                }
                tracing::trace!(existed, size = self.size, "inserted leaf");
                Ok((Iter::new(self, forward_stack(reverse_path)), !existed))
            }
            Err(e) => {
                self.root = previous_root;
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn insert_recursive<T: Transaction<Db = D>>(
        &mut self,
        tx: &mut T,
        node: NodeRef,
        shift: u32,
        hash: u64,
        key: &K,
        value: &V,
        upsert: bool,
        reverse_path: &mut Vec<ParentEntry>,
    ) -> Result<(NodeRef, bool), Error> {
        if node.is_leaf() {
            let store = node.unwrap_store();
            let existing_key: K = db::read_leaf_key(tx.db(), store.address())?;
            if (self.equal)(&existing_key, key) {
                if upsert {
                    let addr = db::write_leaf(tx, key, value)?;
                    let leaf = NodeRef::from(StoreRef::leaf(addr));
                    reverse_path.push(ParentEntry { node: leaf.clone(), position: NOT_FOUND });
                    return Ok((leaf, true));
                }
                reverse_path.push(ParentEntry { node: node.clone(), position: NOT_FOUND });
                return Ok((node, true));
            }
            let new_addr = db::write_leaf(tx, key, value)?;
            let new_leaf = StoreRef::leaf(new_addr);
            let existing_hash = (self.hash)(&existing_key);
            let split = self.insert_into_leaf(store, new_leaf, shift, hash, existing_hash, reverse_path);
            return Ok((split, false));
        }

        let slot = ((hash >> shift) & HASH_INDEX_MASK) as u32;

        if depth_is_internal_node(shift) {
            match internal_lookup_child(tx.db(), &self.arena, &node, slot)? {
                None => {
                    let addr = db::write_leaf(tx, key, value)?;
                    let leaf = NodeRef::from(StoreRef::leaf(addr));
                    reverse_path.push(ParentEntry { node: leaf.clone(), position: NOT_FOUND });
                    let writable = self.make_writable_internal(&node)?;
                    let index = self.arena.get_mut(writable).insert_child(slot, leaf);
                    let final_node = NodeRef::HeapInternal(writable);
                    reverse_path.push(ParentEntry { node: final_node.clone(), position: index });
                    Ok((final_node, false))
                }
                Some((index, child)) => {
                    let (new_child, existed) = self.insert_recursive(
                        tx,
                        child.clone(),
                        shift + HASH_INDEX_BITS,
                        hash,
                        key,
                        value,
                        upsert,
                        reverse_path,
                    )?;
                    let final_node = if same_node_ref(&child, &new_child) {
                        node.clone()
                    } else {
                        let writable = self.make_writable_internal(&node)?;
                        // replaced heap-internal children are arena-owned and never
                        // freed; replaced heap-linear children drop here, in place,
                        // when `_old` goes out of scope (spec.md section 9).
                        let _old = self.arena.get_mut(writable).replace_child(index, new_child);
                        NodeRef::HeapInternal(writable)
                    };
                    reverse_path.push(ParentEntry { node: final_node.clone(), position: index });
                    Ok((final_node, existed))
                }
            }
        } else {
            match linear_lookup_leaf(tx.db(), &node, key, &*self.equal)? {
                None => {
                    let addr = db::write_leaf(tx, key, value)?;
                    reverse_path.push(ParentEntry { node: NodeRef::from(StoreRef::leaf(addr)), position: NOT_FOUND });
                    let mut linear = writable_linear(tx.db(), node)?;
                    linear.leaves.push(addr);
                    let index = linear.leaves.len() - 1;
                    let final_node = NodeRef::from(linear);
                    reverse_path.push(ParentEntry { node: final_node.clone(), position: index });
                    Ok((final_node, false))
                }
                Some((index, existing_addr)) if !upsert => {
                    reverse_path.push(ParentEntry { node: NodeRef::from(StoreRef::leaf(existing_addr)), position: NOT_FOUND });
                    reverse_path.push(ParentEntry { node: node.clone(), position: index });
                    Ok((node, true))
                }
                Some((index, _existing_addr)) => {
                    let new_addr = db::write_leaf(tx, key, value)?;
                    reverse_path.push(ParentEntry { node: NodeRef::from(StoreRef::leaf(new_addr)), position: NOT_FOUND });
                    let mut linear = writable_linear(tx.db(), node)?;
                    linear.leaves[index] = new_addr;
                    let final_node = NodeRef::from(linear);
                    reverse_path.push(ParentEntry { node: final_node.clone(), position: index });
                    Ok((final_node, true))
                }
            }
        }
    }

    /// Splits a leaf slot that collided with a new key (spec.md 4.G.2,
    /// "Leaf split"). Recurses deeper while both keys keep landing in the
    /// same slot; falls back to a `LinearNode` once the hash is exhausted.
    fn insert_into_leaf(
        &mut self,
        existing_leaf: StoreRef,
        new_leaf: StoreRef,
        shift: u32,
        new_hash: u64,
        existing_hash: u64,
        reverse_path: &mut Vec<ParentEntry>,
    ) -> NodeRef {
        if depth_is_internal_node(shift) {
            let old_slot = ((existing_hash >> shift) & HASH_INDEX_MASK) as u32;
            let new_slot = ((new_hash >> shift) & HASH_INDEX_MASK) as u32;
            if old_slot != new_slot {
                reverse_path.push(ParentEntry { node: NodeRef::from(new_leaf), position: NOT_FOUND });
                let mut internal = InternalNode::empty();
                internal.insert_child(old_slot, NodeRef::from(existing_leaf));
                let new_index = internal.insert_child(new_slot, NodeRef::from(new_leaf));
                let idx = self.arena.push(internal);
                let node_ref = NodeRef::HeapInternal(idx);
                reverse_path.push(ParentEntry { node: node_ref.clone(), position: new_index });
                node_ref
            } else {
                let child =
                    self.insert_into_leaf(existing_leaf, new_leaf, shift + HASH_INDEX_BITS, new_hash, existing_hash, reverse_path);
                let mut internal = InternalNode::empty();
                let index = internal.insert_child(old_slot, child);
                let idx = self.arena.push(internal);
                let node_ref = NodeRef::HeapInternal(idx);
                reverse_path.push(ParentEntry { node: node_ref.clone(), position: index });
                node_ref
            }
        } else {
            reverse_path.push(ParentEntry { node: NodeRef::from(new_leaf), position: NOT_FOUND });
            let linear = LinearNode::two(existing_leaf.address(), new_leaf.address());
            let node_ref = NodeRef::from(linear);
            reverse_path.push(ParentEntry { node: node_ref.clone(), position: 1 });
            node_ref
        }
    }

    fn make_writable_internal(&mut self, node: &NodeRef) -> Result<crate::arena::ArenaIndex, Error> {
        match node {
            NodeRef::HeapInternal(idx) => Ok(*idx),
            NodeRef::Store(s) => {
                let decoded = decode_store_internal(self.db, s.address())?;
                let children: Vec<NodeRef> = decoded.children.into_iter().map(NodeRef::from).collect();
                let fresh = InternalNode::from_children(decoded.bitmap, children);
                Ok(self.arena.push(fresh))
            }
            _ => unreachable!("make_writable_internal called on a non-internal NodeRef"),
        }
    }

    /// Depth-first: serializes every heap node reachable from `root`,
    /// writes a fresh `HeaderBlock`, and advances `revision` to
    /// `generation` (spec.md 4.G.4). Returns `None` if the map is empty.
    pub fn flush<T: Transaction<Db = D>>(&mut self, tx: &mut T, generation: u64) -> Result<Option<Address>, Error> {
        let current = tx.db().current_revision();
        if self.revision != current {
            return Err(Error::StaleRevision { opened: self.revision, current });
        }

        if self.root.is_heap() {
            let flushed = self.flush_node(tx, self.root.clone(), 0)?;
            self.root = flushed;
        }

        let result = if self.size > 0 {
            let store_ref = match &self.root {
                NodeRef::Store(s) => *s,
                _ => unreachable!("root must be a resolved store reference once flushed"),
            };
            let header = HeaderBlock { size: self.size, root: store_ref };
            let (buf, addr) = tx.alloc_rw(header::HEADER_SIZE, 8)?;
            let array: &mut [u8; header::HEADER_SIZE] =
                buf.try_into().expect("alloc_rw returned exactly HEADER_SIZE bytes");
            header.write_to(array);
            Some(addr)
        } else {
            None
        };

        self.arena.clear();
        self.revision = generation;
        self.base_root = self.root.clone();
        self.base_size = self.size;
        tracing::debug!(size = self.size, revision = generation, "flushed hamt map");
        Ok(result)
    }

    fn flush_node<T: Transaction<Db = D>>(&mut self, tx: &mut T, node: NodeRef, shift: u32) -> Result<NodeRef, Error> {
        match node {
            NodeRef::HeapInternal(idx) => {
                let len = self.arena.get(idx).len();
                let mut resolved = Vec::with_capacity(len);
                for i in 0..len {
                    let child = self.arena.get(idx).child(i).clone();
                    let flushed =
                        if child.is_heap() { self.flush_node(tx, child, shift + HASH_INDEX_BITS)? } else { child };
                    resolved.push(flushed.unwrap_store());
                }
                let bitmap = self.arena.get(idx).bitmap;
                let len_bytes = node::encoded_len_for_bitmap(bitmap);
                let (buf, addr) = tx.alloc_rw(len_bytes, 8)?;
                self.arena.get(idx).write_to(buf, &resolved);
                tracing::trace!(addr = addr.0, children = len, "flushed internal node");
                Ok(NodeRef::from(StoreRef::internal_or_linear(addr)))
            }
            NodeRef::HeapLinear(boxed) => {
                let len_bytes = boxed.encoded_len();
                let (buf, addr) = tx.alloc_rw(len_bytes, 8)?;
                boxed.write_to(buf);
                tracing::trace!(addr = addr.0, leaves = boxed.len(), "flushed linear node");
                Ok(NodeRef::from(StoreRef::internal_or_linear(addr)))
            }
            other => Ok(other),
        }
    }

    /// Discards every heap node created since the map was opened or last
    /// flushed. Because every mutation is copy-on-write, nothing in the
    /// store is touched -- the map simply reverts to its last committed
    /// shape. Also runs implicitly: a `HamtMap` dropped without a
    /// preceding `flush` leaves the store exactly as it found it, since
    /// leaf and node bytes only become visible once the surrounding
    /// transaction is committed.
    pub fn rollback(&mut self) {
        self.arena.clear();
        self.root = self.base_root.clone();
        self.size = self.base_size;
        tracing::debug!(size = self.size, "rolled back hamt map");
    }
}

fn forward_stack(reverse_path: Vec<ParentEntry>) -> ParentStack {
    let mut stack = ParentStack::new();
    for entry in reverse_path.into_iter().rev() {
        stack.push(entry);
    }
    stack
}

fn same_node_ref(a: &NodeRef, b: &NodeRef) -> bool {
    match (a, b) {
        (NodeRef::Null, NodeRef::Null) => true,
        (NodeRef::Store(x), NodeRef::Store(y)) => x == y,
        (NodeRef::HeapInternal(x), NodeRef::HeapInternal(y)) => x == y,
        _ => false,
    }
}

fn decode_store_internal(db: &impl Database, addr: Address) -> Result<node::DecodedInternal, Error> {
    let prefix = db.getro(addr, 16)?;
    let bitmap = u64::from_ne_bytes(prefix[8..16].try_into().unwrap());
    let total = node::encoded_len_for_bitmap(bitmap);
    let bytes = db.getro(addr, total)?;
    InternalNode::decode(bytes, addr)
}

fn decode_store_linear(db: &impl Database, addr: Address) -> Result<LinearNode, Error> {
    let prefix = db.getro(addr, 16)?;
    let size = u64::from_ne_bytes(prefix[8..16].try_into().unwrap()) as usize;
    let total = 16 + 8 * size;
    let bytes = db.getro(addr, total)?;
    LinearNode::decode(bytes, addr)
}

/// Looks up `slot` and returns its child in one pass -- a store-resident
/// node is decoded once, not once to find the index and again to read the
/// child out of it.
pub(crate) fn internal_lookup_child<D: Database>(
    db: &D,
    arena: &ChunkedArena<InternalNode>,
    node: &NodeRef,
    slot: u32,
) -> Result<Option<(usize, NodeRef)>, Error> {
    let bit = 1u64 << slot;
    match node {
        NodeRef::HeapInternal(idx) => {
            let n = arena.get(*idx);
            if n.bitmap & bit == 0 {
                return Ok(None);
            }
            let index = (n.bitmap & (bit - 1)).count_ones() as usize;
            Ok(Some((index, n.child(index).clone())))
        }
        NodeRef::Store(s) => {
            let decoded = decode_store_internal(db, s.address())?;
            if decoded.bitmap & bit == 0 {
                return Ok(None);
            }
            let index = (decoded.bitmap & (bit - 1)).count_ones() as usize;
            Ok(Some((index, NodeRef::from(decoded.children[index]))))
        }
        _ => unreachable!("internal_lookup_child called on a non-internal NodeRef"),
    }
}

pub(crate) fn internal_len<D: Database>(db: &D, arena: &ChunkedArena<InternalNode>, node: &NodeRef) -> Result<usize, Error> {
    match node {
        NodeRef::HeapInternal(idx) => Ok(arena.get(*idx).len()),
        NodeRef::Store(s) => Ok(decode_store_internal(db, s.address())?.bitmap.count_ones() as usize),
        _ => unreachable!("internal_len called on a non-internal NodeRef"),
    }
}

pub(crate) fn internal_child<D: Database>(
    db: &D,
    arena: &ChunkedArena<InternalNode>,
    node: &NodeRef,
    index: usize,
) -> Result<NodeRef, Error> {
    match node {
        NodeRef::HeapInternal(idx) => Ok(arena.get(*idx).child(index).clone()),
        NodeRef::Store(s) => Ok(NodeRef::from(decode_store_internal(db, s.address())?.children[index])),
        _ => unreachable!("internal_child called on a non-internal NodeRef"),
    }
}

pub(crate) fn linear_children<D: Database>(db: &D, node: &NodeRef) -> Result<Vec<Address>, Error> {
    match node {
        NodeRef::HeapLinear(boxed) => Ok(boxed.leaves.clone()),
        NodeRef::Store(s) => Ok(decode_store_linear(db, s.address())?.leaves),
        _ => unreachable!("linear_children called on a non-linear NodeRef"),
    }
}

fn linear_lookup_leaf<D: Database, K: Codec>(
    db: &D,
    node: &NodeRef,
    key: &K,
    equal: &dyn Fn(&K, &K) -> bool,
) -> Result<Option<(usize, Address)>, Error> {
    let leaves = linear_children(db, node)?;
    for (i, addr) in leaves.into_iter().enumerate() {
        let existing: K = db::read_leaf_key(db, addr)?;
        if equal(&existing, key) {
            return Ok(Some((i, addr)));
        }
    }
    Ok(None)
}

fn writable_linear<D: Database>(db: &D, node: NodeRef) -> Result<LinearNode, Error> {
    match node {
        NodeRef::HeapLinear(boxed) => Ok(*boxed),
        other => Ok(LinearNode { leaves: linear_children(db, &other)? }),
    }
}

/// Pushes the leftmost path from `node` down to a leaf onto `stack`.
pub(crate) fn descend_leftmost<D: Database>(
    db: &D,
    arena: &ChunkedArena<InternalNode>,
    mut node: NodeRef,
    stack: &mut ParentStack,
) -> Result<(), Error> {
    let mut shift = stack.len() as u32 * HASH_INDEX_BITS;
    loop {
        if node.is_leaf() {
            stack.push(ParentEntry { node, position: NOT_FOUND });
            return Ok(());
        }
        if depth_is_internal_node(shift) {
            let child = internal_child(db, arena, &node, 0)?;
            stack.push(ParentEntry { node, position: 0 });
            node = child;
        } else {
            let leaves = linear_children(db, &node)?;
            let addr = leaves[0];
            stack.push(ParentEntry { node, position: 0 });
            node = NodeRef::from(StoreRef::leaf(addr));
        }
        shift += HASH_INDEX_BITS;
    }
}
