//! The fixed 24-byte record flushed at the root of an index: element
//! count and root pointer, guarded by a signature (spec.md component F).

use bytemuck::{Pod, Zeroable};

use crate::address::StoreRef;
use crate::error::Error;

pub const HEADER_SIGNATURE: [u8; 8] = *b"IndxHedr";
pub const HEADER_SIZE: usize = 24;

/// The on-disk layout, byte-exact per spec.md section 6.1: offset 0 the
/// signature, 8 the element count, 16 the root pointer.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct RawHeader {
    signature: [u8; 8],
    size: u64,
    root: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct HeaderBlock {
    pub size: u64,
    pub root: StoreRef,
}

impl HeaderBlock {
    pub fn write_to(&self, buf: &mut [u8; HEADER_SIZE]) {
        let raw = RawHeader { signature: HEADER_SIGNATURE, size: self.size, root: self.root.raw() };
        *buf = bytemuck::bytes_of(&raw).try_into().expect("RawHeader is exactly HEADER_SIZE bytes");
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::Corrupt("header block shorter than 24 bytes".into()));
        }
        let raw: RawHeader = *bytemuck::from_bytes(&bytes[..HEADER_SIZE]);
        if raw.signature != HEADER_SIGNATURE {
            return Err(Error::Corrupt("header block signature mismatch".into()));
        }
        let root = StoreRef::from_raw(raw.root);
        if !root.is_null() && !root.address().is_aligned() {
            return Err(Error::Corrupt("header block root is not properly aligned".into()));
        }
        Ok(HeaderBlock { size: raw.size, root })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;

    #[test]
    fn header_round_trips() {
        let header = HeaderBlock { size: 3, root: StoreRef::internal_or_linear(Address(64)) };
        let mut buf = [0u8; HEADER_SIZE];
        header.write_to(&mut buf);

        let decoded = HeaderBlock::decode(&buf).unwrap();
        assert_eq!(decoded.size, 3);
        assert_eq!(decoded.root, header.root);
    }

    #[test]
    fn header_rejects_bad_signature() {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(b"Xndxhedr");
        assert!(HeaderBlock::decode(&buf).is_err());
    }
}
