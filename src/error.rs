//! The error taxonomy of spec.md section 7. Precondition violations
//! (`programmer_error`: null deref, popping an empty stack, dereferencing
//! a stale iterator) are not represented here -- they are not recoverable
//! failures, so they `panic!`/`debug_assert!` at the call site the way the
//! teacher's `Key::unwrap_item`/`NodeId::unwrap_item` do on a mode
//! mismatch instead of returning a `Result`.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A load-time structural validation failed: bad signature, a zero
    /// bitmap, a child that isn't strictly less than its parent's
    /// address, or any other inconsistency that means the bytes read from
    /// the store cannot be a valid node. The map is not constructed.
    #[error("index corrupt: {0}")]
    Corrupt(String),

    /// A write was attempted against a `HamtMap` whose captured revision
    /// is no longer the database's tip.
    #[error("index is not at the latest revision: opened at {opened}, current is {current}")]
    StaleRevision { opened: u64, current: u64 },

    /// The `Transaction::alloc_rw` collaborator failed.
    #[error("allocation failed: {0}")]
    Allocation(String),

    /// A `Codec` implementation failed to encode or decode a leaf's key
    /// or value. The core does not inspect the cause, it only propagates
    /// it.
    #[error("key/value serialization failed: {0}")]
    Serialize(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
