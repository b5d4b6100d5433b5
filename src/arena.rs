//! A chunked arena owning the heap internal nodes created by one open
//! transaction (spec.md component B).
//!
//! Pushing never invalidates a previously returned handle: each chunk is
//! allocated once, at its final capacity, and never grows. Handles are
//! `ArenaIndex(chunk, slot)` pairs rather than raw references, which is
//! the safe-Rust reading of spec.md section 9's "reference stability"
//! requirement -- the borrow checker would never let us hand out a live
//! `&mut T` across later `push` calls anyway, so the original's pointer
//! stability guarantee becomes an index stability guarantee instead.

use std::mem::size_of;

/// A stable handle to an element pushed into a `ChunkedArena`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct ArenaIndex {
    chunk: u32,
    slot: u32,
}

struct Chunk<T> {
    items: Vec<T>,
}

/// An append-only sequence of fixed-capacity chunks.
pub struct ChunkedArena<T> {
    chunks: Vec<Chunk<T>>,
    elems_per_chunk: usize,
}

impl<T> ChunkedArena<T> {
    /// Builds an arena whose chunks hold roughly one page's worth of `T`.
    pub fn new() -> Self {
        let elems_per_chunk = (page_size::get() / size_of::<T>().max(1)).max(1);
        ChunkedArena { chunks: vec![Chunk { items: Vec::with_capacity(elems_per_chunk) }], elems_per_chunk }
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.iter().all(|c| c.items.is_empty())
    }

    pub fn len(&self) -> usize {
        self.chunks.iter().map(|c| c.items.len()).sum()
    }

    /// Appends `value`, returning a stable handle to it. Amortised O(1).
    pub fn push(&mut self, value: T) -> ArenaIndex {
        let needs_new_chunk = match self.chunks.last() {
            Some(c) => c.items.len() == self.elems_per_chunk,
            None => true,
        };
        if needs_new_chunk {
            self.chunks.push(Chunk { items: Vec::with_capacity(self.elems_per_chunk) });
        }
        let chunk = self.chunks.last_mut().expect("just ensured a chunk exists");
        let slot = chunk.items.len();
        chunk.items.push(value);
        ArenaIndex { chunk: (self.chunks.len() - 1) as u32, slot: slot as u32 }
    }

    pub fn get(&self, idx: ArenaIndex) -> &T {
        &self.chunks[idx.chunk as usize].items[idx.slot as usize]
    }

    pub fn get_mut(&mut self, idx: ArenaIndex) -> &mut T {
        &mut self.chunks[idx.chunk as usize].items[idx.slot as usize]
    }

    /// Drops every element, but keeps one empty chunk around for reuse.
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.chunks.push(Chunk { items: Vec::with_capacity(self.elems_per_chunk) });
    }

    /// Moves all of `other`'s chunks onto the end of `self`. O(chunks).
    pub fn splice(&mut self, other: &mut ChunkedArena<T>) {
        self.chunks.append(&mut other.chunks);
        if other.chunks.is_empty() {
            other.chunks.push(Chunk { items: Vec::with_capacity(other.elems_per_chunk) });
        }
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.chunks.iter().flat_map(|c| c.items.iter())
    }
}

impl<T> Default for ChunkedArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_returns_stable_indices() {
        let mut arena = ChunkedArena::new();
        let mut indices = Vec::new();
        for i in 0..10_000u32 {
            indices.push(arena.push(i));
        }
        for (i, idx) in indices.into_iter().enumerate() {
            assert_eq!(*arena.get(idx), i as u32);
        }
    }

    #[test]
    fn clear_keeps_one_empty_chunk() {
        let mut arena: ChunkedArena<u32> = ChunkedArena::new();
        arena.push(1);
        arena.push(2);
        arena.clear();
        assert_eq!(arena.len(), 0);
        assert!(arena.is_empty());
        // still usable after clear
        let idx = arena.push(42);
        assert_eq!(*arena.get(idx), 42);
    }

    #[test]
    fn splice_moves_all_chunks() {
        let mut a: ChunkedArena<u32> = ChunkedArena::new();
        let mut b: ChunkedArena<u32> = ChunkedArena::new();
        a.push(1);
        b.push(2);
        b.push(3);
        a.splice(&mut b);
        let collected: Vec<_> = a.iter().copied().collect();
        assert_eq!(collected, vec![1, 2, 3]);
        assert!(b.is_empty());
    }

    #[test]
    fn iter_is_insertion_order_and_bidirectional() {
        let mut arena: ChunkedArena<u32> = ChunkedArena::new();
        for i in 0..5 {
            arena.push(i);
        }
        let forward: Vec<_> = arena.iter().copied().collect();
        assert_eq!(forward, vec![0, 1, 2, 3, 4]);
        let backward: Vec<_> = arena.iter().rev().copied().collect();
        assert_eq!(backward, vec![4, 3, 2, 1, 0]);
    }
}
