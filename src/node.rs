//! Internal and linear trie nodes: the bitmap-compressed branch node
//! (spec.md component D) and the collision list used once hash bits run
//! out (component E).
//!
//! Both follow the same two-step decode shape the teacher's `NodeCodec`
//! uses for arroy's variable-length records: read a fixed prefix to learn
//! how long the record is, then read a sized tail (spec.md section 9,
//! "Variable-length records").

use std::array;

use crate::address::{Address, NodeRef, StoreRef};
use crate::error::Error;

pub const INTERNAL_SIGNATURE: [u8; 8] = *b"Internal";
pub const LINEAR_SIGNATURE: [u8; 8] = *b"IndxLner";

/// The maximum fan-out of an internal node: one child per possible 6-bit
/// slot value (spec.md section 3, `hash_index_bits = 6`).
pub const MAX_CHILDREN: usize = 64;

/// A bitmap-compressed branch node. The heap representation always
/// reserves capacity for all 64 possible children so `insert_child` never
/// reallocates; only `bitmap.count_ones()` of them are live.
pub struct InternalNode {
    pub bitmap: u64,
    children: Box<[NodeRef; MAX_CHILDREN]>,
}

impl InternalNode {
    pub fn empty() -> Self {
        InternalNode { bitmap: 0, children: Box::new(array::from_fn(|_| NodeRef::Null)) }
    }

    pub fn len(&self) -> usize {
        self.bitmap.count_ones() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.bitmap == 0
    }

    /// The live prefix of the children array, in bitmap order.
    pub fn children(&self) -> &[NodeRef] {
        &self.children[..self.len()]
    }

    /// Finds the child for `slot`, returning its index into `children()`.
    pub fn lookup(&self, slot: u32) -> Option<usize> {
        let bit = 1u64 << slot;
        if self.bitmap & bit == 0 {
            return None;
        }
        Some((self.bitmap & (bit - 1)).count_ones() as usize)
    }

    pub fn child(&self, index: usize) -> &NodeRef {
        &self.children[index]
    }

    pub fn child_mut(&mut self, index: usize) -> &mut NodeRef {
        &mut self.children[index]
    }

    /// Inserts `child` into slot `slot`, which must currently be empty.
    /// Returns the index the new child landed at.
    pub fn insert_child(&mut self, slot: u32, child: NodeRef) -> usize {
        let bit = 1u64 << slot;
        debug_assert_eq!(self.bitmap & bit, 0, "insert_child precondition: slot must be empty");
        let index = (self.bitmap & (bit - 1)).count_ones() as usize;
        let old_len = self.len();
        for i in (index..old_len).rev() {
            self.children[i + 1] = std::mem::replace(&mut self.children[i], NodeRef::Null);
        }
        self.children[index] = child;
        self.bitmap |= bit;
        index
    }

    pub fn replace_child(&mut self, index: usize, child: NodeRef) -> NodeRef {
        std::mem::replace(&mut self.children[index], child)
    }

    /// Builds a heap node directly from an already-valid `(bitmap,
    /// children)` pair, e.g. one just read back from the store and about
    /// to be made writable. `children.len()` must equal `bitmap`'s
    /// popcount.
    pub fn from_children(bitmap: u64, children: Vec<NodeRef>) -> Self {
        debug_assert_eq!(children.len(), bitmap.count_ones() as usize);
        let mut node = InternalNode::empty();
        node.bitmap = bitmap;
        for (i, child) in children.into_iter().enumerate() {
            node.children[i] = child;
        }
        node
    }

    pub fn encoded_len(&self) -> usize {
        encoded_len_for_bitmap(self.bitmap)
    }

    /// Writes the on-disk record: signature, bitmap, then `resolved`
    /// (one fully-resolved store reference per live child, in bitmap
    /// order -- every heap child must already have been flushed).
    pub fn write_to(&self, buf: &mut [u8], resolved: &[StoreRef]) {
        debug_assert_eq!(resolved.len(), self.len());
        debug_assert_eq!(buf.len(), self.encoded_len());
        buf[0..8].copy_from_slice(&INTERNAL_SIGNATURE);
        buf[8..16].copy_from_slice(&self.bitmap.to_ne_bytes());
        for (i, child) in resolved.iter().enumerate() {
            let start = 16 + i * 8;
            buf[start..start + 8].copy_from_slice(&child.raw().to_ne_bytes());
        }
    }

    /// Validates and decodes a store-resident internal node. `self_addr`
    /// is the address the bytes were read from, used to enforce that
    /// every child address is strictly less than it (spec.md 4.D,
    /// testable property 7).
    pub fn decode(bytes: &[u8], self_addr: Address) -> Result<DecodedInternal, Error> {
        if bytes.len() < 16 {
            return Err(Error::Corrupt("internal node shorter than its fixed prefix".into()));
        }
        if bytes[0..8] != INTERNAL_SIGNATURE {
            return Err(Error::Corrupt("internal node signature mismatch".into()));
        }
        let bitmap = u64::from_ne_bytes(bytes[8..16].try_into().unwrap());
        if bitmap == 0 {
            return Err(Error::Corrupt("internal node bitmap is zero".into()));
        }
        let n = bitmap.count_ones() as usize;
        let need = 16 + 8 * n;
        if bytes.len() < need {
            return Err(Error::Corrupt("internal node truncated before its child array".into()));
        }
        let mut children = Vec::with_capacity(n);
        for i in 0..n {
            let start = 16 + i * 8;
            let raw = u64::from_ne_bytes(bytes[start..start + 8].try_into().unwrap());
            let child = StoreRef::from_raw(raw);
            if child.is_null() {
                return Err(Error::Corrupt("internal node has a null child".into()));
            }
            if child.address() >= self_addr {
                return Err(Error::Corrupt(
                    "internal node child address is not strictly less than the node's own address".into(),
                ));
            }
            children.push(child);
        }
        Ok(DecodedInternal { bitmap, children })
    }
}

pub fn encoded_len_for_bitmap(bitmap: u64) -> usize {
    16 + 8 * bitmap.count_ones() as usize
}

/// The result of validating and decoding a store-resident internal node.
pub struct DecodedInternal {
    pub bitmap: u64,
    pub children: Vec<StoreRef>,
}

/// An unordered collision list, used once the hash has been fully
/// consumed and two or more keys still disagree only in their payload
/// (spec.md component E).
#[derive(Debug, Clone)]
pub struct LinearNode {
    pub leaves: Vec<Address>,
}

impl LinearNode {
    pub fn two(a: Address, b: Address) -> Self {
        LinearNode { leaves: vec![a, b] }
    }

    /// Copies `existing`'s addresses into a new node with room for
    /// `extra_children` more, mirroring the spec's
    /// `allocate_from(existing, extra_children)`.
    pub fn allocate_from(existing: &LinearNode, extra_children: usize) -> Self {
        let mut leaves = Vec::with_capacity(existing.leaves.len() + extra_children);
        leaves.extend_from_slice(&existing.leaves);
        LinearNode { leaves }
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    pub fn encoded_len(&self) -> usize {
        16 + 8 * self.leaves.len()
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        debug_assert_eq!(buf.len(), self.encoded_len());
        buf[0..8].copy_from_slice(&LINEAR_SIGNATURE);
        buf[8..16].copy_from_slice(&(self.leaves.len() as u64).to_ne_bytes());
        for (i, addr) in self.leaves.iter().enumerate() {
            let start = 16 + i * 8;
            buf[start..start + 8].copy_from_slice(&addr.0.to_ne_bytes());
        }
    }

    pub fn decode(bytes: &[u8], self_addr: Address) -> Result<Self, Error> {
        if bytes.len() < 16 {
            return Err(Error::Corrupt("linear node shorter than its fixed prefix".into()));
        }
        if bytes[0..8] != LINEAR_SIGNATURE {
            return Err(Error::Corrupt("linear node signature mismatch".into()));
        }
        let size = u64::from_ne_bytes(bytes[8..16].try_into().unwrap()) as usize;
        let need = 16 + 8 * size;
        if bytes.len() < need {
            return Err(Error::Corrupt("linear node truncated before its leaf array".into()));
        }
        let mut leaves = Vec::with_capacity(size);
        for i in 0..size {
            let start = 16 + i * 8;
            let raw = u64::from_ne_bytes(bytes[start..start + 8].try_into().unwrap());
            let addr = Address(raw);
            if addr.is_null() || addr.0 >= self_addr.0 {
                return Err(Error::Corrupt(
                    "linear node leaf address is not strictly less than the node's own address".into(),
                ));
            }
            leaves.push(addr);
        }
        Ok(LinearNode { leaves })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_child_keeps_bitmap_order() {
        let mut node = InternalNode::empty();
        node.insert_child(5, NodeRef::from(StoreRef::leaf(Address(4))));
        node.insert_child(1, NodeRef::from(StoreRef::leaf(Address(8))));
        // slot 1 sorts before slot 5.
        assert_eq!(node.lookup(1), Some(0));
        assert_eq!(node.lookup(5), Some(1));
        assert_eq!(node.len(), 2);
    }

    #[test]
    fn internal_node_round_trips_through_bytes() {
        let mut node = InternalNode::empty();
        node.insert_child(2, NodeRef::from(StoreRef::leaf(Address(4))));
        node.insert_child(10, NodeRef::from(StoreRef::internal_or_linear(Address(100))));
        let resolved = vec![StoreRef::leaf(Address(4)), StoreRef::internal_or_linear(Address(100))];
        let mut buf = vec![0u8; node.encoded_len()];
        node.write_to(&mut buf, &resolved);

        let decoded = InternalNode::decode(&buf, Address(1000)).unwrap();
        assert_eq!(decoded.bitmap, node.bitmap);
        assert_eq!(decoded.children, resolved);
    }

    #[test]
    fn decode_rejects_child_not_less_than_self() {
        let mut node = InternalNode::empty();
        node.insert_child(0, NodeRef::from(StoreRef::leaf(Address(200))));
        let resolved = vec![StoreRef::leaf(Address(200))];
        let mut buf = vec![0u8; node.encoded_len()];
        node.write_to(&mut buf, &resolved);

        assert!(InternalNode::decode(&buf, Address(100)).is_err());
    }

    #[test]
    fn decode_rejects_bad_signature() {
        let mut buf = vec![0u8; 24];
        buf[0..8].copy_from_slice(b"Xnternal");
        buf[8..16].copy_from_slice(&1u64.to_ne_bytes());
        assert!(InternalNode::decode(&buf, Address(1000)).is_err());
    }

    #[test]
    fn decode_rejects_zero_bitmap() {
        let mut buf = vec![0u8; 16];
        buf[0..8].copy_from_slice(&INTERNAL_SIGNATURE);
        assert!(InternalNode::decode(&buf, Address(1000)).is_err());
    }

    #[test]
    fn linear_node_round_trips_and_grows() {
        let base = LinearNode::two(Address(4), Address(8));
        let grown = LinearNode::allocate_from(&base, 1);
        assert_eq!(grown.leaves, vec![Address(4), Address(8)]);

        let mut buf = vec![0u8; base.encoded_len()];
        base.write_to(&mut buf);
        let decoded = LinearNode::decode(&buf, Address(1000)).unwrap();
        assert_eq!(decoded.leaves, base.leaves);
    }
}
