//! The HAMT cursor (spec.md 4.G.3): a `ParentStack` whose top is always a
//! leaf terminal, advanced by repeatedly popping exhausted levels and
//! descending the next sibling's leftmost path.
//!
//! Unlike `std::iter::Iterator`, advancing and dereferencing can both fail
//! (a concurrently corrupted store, a bad codec), so this is a cursor with
//! fallible `advance`/`get` rather than an infallible `next`.

use crate::address::{NodeRef, StoreRef};
use crate::db::{self, Codec, Database};
use crate::error::Error;
use crate::hamt::{depth_is_internal_node, descend_leftmost, internal_child, internal_len, linear_children, HamtMap, HASH_INDEX_BITS};
use crate::parent_stack::{ParentEntry, ParentStack, NOT_FOUND};

/// A cursor over one leaf of a [`HamtMap`], or past the end once
/// `advance` returns `false`. Borrows the map it was created from, so the
/// borrow checker enforces spec.md testable property 8: a `HamtMap`
/// cannot be mutated again while one of its iterators is still alive.
pub struct Iter<'a, D: Database, K: Codec, V: Codec> {
    map: &'a HamtMap<'a, D, K, V>,
    stack: ParentStack,
    cached: Option<(K, V)>,
}

impl<'a, D: Database, K: Codec, V: Codec> Iter<'a, D, K, V> {
    pub(crate) fn new(map: &'a HamtMap<'a, D, K, V>, stack: ParentStack) -> Self {
        Iter { map, stack, cached: None }
    }

    fn terminal_addr(&self) -> Option<crate::address::Address> {
        self.stack.top().map(|entry| entry.node.unwrap_store().address())
    }

    /// Reads the (key, value) pair this cursor points at. `Ok(None)` once
    /// the cursor has run past the end.
    pub fn get(&mut self) -> Result<Option<(&K, &V)>, Error> {
        let Some(addr) = self.terminal_addr() else {
            return Ok(None);
        };
        if self.cached.is_none() {
            self.cached = Some(db::read_leaf(self.map.db(), addr)?);
        }
        let (k, v) = self.cached.as_ref().expect("just populated");
        Ok(Some((k, v)))
    }

    /// Advances to the next leaf in leftmost-depth-first order. Returns
    /// `false` once the cursor has run past the end.
    pub fn advance(&mut self) -> Result<bool, Error> {
        self.cached = None;
        self.stack.pop();
        loop {
            let at_root = self.stack.len();
            let Some(top) = self.stack.top_mut() else {
                return Ok(false);
            };
            top.position += 1;
            let pos = top.position;
            let parent = top.node.clone();
            let parent_shift = (at_root - 1) as u32 * HASH_INDEX_BITS;

            if depth_is_internal_node(parent_shift) {
                let len = internal_len(self.map.db(), self.map.arena(), &parent)?;
                if pos < len {
                    let child = internal_child(self.map.db(), self.map.arena(), &parent, pos)?;
                    if child.is_leaf() {
                        self.stack.push(ParentEntry { node: child, position: NOT_FOUND });
                    } else {
                        descend_leftmost(self.map.db(), self.map.arena(), child, &mut self.stack)?;
                    }
                    return Ok(true);
                }
            } else {
                let leaves = linear_children(self.map.db(), &parent)?;
                if pos < leaves.len() {
                    self.stack.push(ParentEntry {
                        node: NodeRef::from(StoreRef::leaf(leaves[pos])),
                        position: NOT_FOUND,
                    });
                    return Ok(true);
                }
            }
            self.stack.pop();
        }
    }
}

impl<'a, D: Database, K: Codec, V: Codec> PartialEq for Iter<'a, D, K, V> {
    /// Iterators from different maps never compare equal, even over
    /// identical data (spec.md section 9, open question on iterator
    /// comparison): the source compares the owning index, not just the
    /// path.
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self.map, other.map) && self.terminal_addr() == other.terminal_addr()
    }
}

impl<'a, D: Database, K: Codec, V: Codec> Eq for Iter<'a, D, K, V> {}

impl<'a, D: Database, K: Codec, V: Codec> std::fmt::Debug for Iter<'a, D, K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Iter").field("terminal_addr", &self.terminal_addr()).finish()
    }
}
