//! Smart pointers: the universal address of a stored value.
//!
//! Layout (16 bytes):
//! ```text
//! [0]      (mode << 6) | type_tag
//! [1..16]  payload
//!
//! INLINE payload:        [0] length, [1..15] value bytes
//! HEAP / BLOCK payload:  [0..6] block id (u48), [6..10] length (u32),
//!                        [10..14] offset (u32), [14] chain flag
//! ```

use std::fmt;

use crate::error::{ArborError, ArborResult};
use crate::storage::layout::{
    INLINE_MAX, MAX_BLOCK_ID, POINTER_SIZE, StorageMode, TypeTag, read_u32, read_u48, write_u32,
    write_u48,
};

/// Where a non-inline value lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockRef {
    pub block_id: u64,
    /// Exact payload size in bytes.
    pub length: u32,
    /// Byte offset inside the first block.
    pub offset: u32,
    /// True when the value spans more than one block.
    pub chained: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    Inline { len: u8, bytes: [u8; INLINE_MAX] },
    Heap(BlockRef),
    Block(BlockRef),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SmartPointer {
    pub type_tag: TypeTag,
    pub location: Location,
}

impl SmartPointer {
    /// Pointer carrying `value` directly. Fails if the value does not fit.
    pub fn inline(type_tag: TypeTag, value: &[u8]) -> ArborResult<Self> {
        if value.len() > INLINE_MAX {
            return Err(ArborError::InvalidPointer(format!(
                "inline value of {} bytes exceeds {}",
                value.len(),
                INLINE_MAX
            )));
        }
        let mut bytes = [0u8; INLINE_MAX];
        bytes[..value.len()].copy_from_slice(value);
        Ok(Self {
            type_tag,
            location: Location::Inline {
                len: value.len() as u8,
                bytes,
            },
        })
    }

    pub fn heap(type_tag: TypeTag, block_id: u64, length: u32, offset: u32) -> Self {
        Self {
            type_tag,
            location: Location::Heap(BlockRef {
                block_id,
                length,
                offset,
                chained: false,
            }),
        }
    }

    pub fn block(type_tag: TypeTag, block_id: u64, length: u32, chained: bool, offset: u32) -> Self {
        Self {
            type_tag,
            location: Location::Block(BlockRef {
                block_id,
                length,
                offset,
                chained,
            }),
        }
    }

    pub fn mode(&self) -> StorageMode {
        match self.location {
            Location::Inline { .. } => StorageMode::Inline,
            Location::Heap(_) => StorageMode::Heap,
            Location::Block(_) => StorageMode::Block,
        }
    }

    /// Block coordinates for heap and block values.
    pub fn block_ref(&self) -> Option<BlockRef> {
        match self.location {
            Location::Inline { .. } => None,
            Location::Heap(r) | Location::Block(r) => Some(r),
        }
    }

    pub fn inline_bytes(&self) -> Option<&[u8]> {
        match &self.location {
            Location::Inline { len, bytes } => Some(&bytes[..*len as usize]),
            _ => None,
        }
    }

    /// Exact payload length.
    pub fn len(&self) -> usize {
        match &self.location {
            Location::Inline { len, .. } => *len as usize,
            Location::Heap(r) | Location::Block(r) => r.length as usize,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn encode(&self) -> [u8; POINTER_SIZE] {
        let mut out = [0u8; POINTER_SIZE];
        out[0] = ((self.mode() as u8) << 6) | (self.type_tag as u8 & 0x3F);
        match &self.location {
            Location::Inline { len, bytes } => {
                out[1] = *len;
                out[2..2 + INLINE_MAX].copy_from_slice(bytes);
            }
            Location::Heap(r) | Location::Block(r) => {
                write_u48(&mut out, 1, r.block_id);
                write_u32(&mut out, 7, r.length);
                write_u32(&mut out, 11, r.offset);
                out[15] = r.chained as u8;
            }
        }
        out
    }

    pub fn decode(raw: &[u8]) -> ArborResult<Self> {
        if raw.len() < POINTER_SIZE {
            return Err(ArborError::InvalidPointer(format!(
                "pointer needs {} bytes, got {}",
                POINTER_SIZE,
                raw.len()
            )));
        }
        let mode = StorageMode::try_from(raw[0] >> 6)?;
        let type_tag = TypeTag::try_from(raw[0] & 0x3F)?;

        let location = match mode {
            StorageMode::Inline => {
                let len = raw[1];
                if len as usize > INLINE_MAX {
                    return Err(ArborError::InvalidPointer(format!(
                        "inline length {} exceeds {}",
                        len, INLINE_MAX
                    )));
                }
                let mut bytes = [0u8; INLINE_MAX];
                bytes.copy_from_slice(&raw[2..2 + INLINE_MAX]);
                Location::Inline { len, bytes }
            }
            StorageMode::Heap | StorageMode::Block => {
                let r = BlockRef {
                    block_id: read_u48(raw, 1),
                    length: read_u32(raw, 7),
                    offset: read_u32(raw, 11),
                    chained: raw[15] == 1,
                };
                if mode == StorageMode::Heap {
                    Location::Heap(r)
                } else {
                    Location::Block(r)
                }
            }
        };

        Ok(Self { type_tag, location })
    }

    /// Check that block coordinates are addressable.
    pub fn validate(&self) -> ArborResult<()> {
        if let Some(r) = self.block_ref() {
            if r.block_id == 0 || r.block_id > MAX_BLOCK_ID {
                return Err(ArborError::InvalidPointer(format!(
                    "block id {} is not addressable",
                    r.block_id
                )));
            }
            if r.offset as usize >= crate::storage::layout::BLOCK_SIZE {
                return Err(ArborError::InvalidPointer(format!(
                    "offset {} lies outside the first block",
                    r.offset
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for SmartPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Location::Inline { len, .. } => write!(f, "inline({:?}, {}b)", self.type_tag, len),
            Location::Heap(r) => write!(
                f,
                "heap({:?}, block {} @{}, {}b)",
                self.type_tag, r.block_id, r.offset, r.length
            ),
            Location::Block(r) => write!(
                f,
                "block({:?}, block {} @{}, {}b{})",
                self.type_tag,
                r.block_id,
                r.offset,
                r.length,
                if r.chained { ", chained" } else { "" }
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_pointer_layout() {
        let ptr = SmartPointer::block(TypeTag::Dictionary, 0x0102_0304_0506, 9000, true, 64);
        let raw = ptr.encode();

        assert_eq!(raw[0] >> 6, StorageMode::Block as u8);
        assert_eq!(raw[0] & 0x3F, TypeTag::Dictionary as u8);
        // payload matches the superblock root record layout
        assert_eq!(read_u48(&raw[1..], 0), 0x0102_0304_0506);
        assert_eq!(read_u32(&raw[1..], 6), 9000);
        assert_eq!(read_u32(&raw[1..], 10), 64);
        assert_eq!(raw[15], 1);

        assert_eq!(SmartPointer::decode(&raw).unwrap(), ptr);
    }

    #[test]
    fn test_inline_pointer() {
        let ptr = SmartPointer::inline(TypeTag::String, b"hello").unwrap();
        let back = SmartPointer::decode(&ptr.encode()).unwrap();
        assert_eq!(back.inline_bytes(), Some(&b"hello"[..]));
        assert_eq!(back.mode(), StorageMode::Inline);
        assert!(back.block_ref().is_none());

        assert!(SmartPointer::inline(TypeTag::Buffer, &[0u8; INLINE_MAX + 1]).is_err());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let mut raw = [0u8; POINTER_SIZE];
        raw[0] = 3 << 6;
        assert!(SmartPointer::decode(&raw).is_err());
        raw[0] = 63;
        assert!(SmartPointer::decode(&raw).is_err());
        assert!(SmartPointer::decode(&raw[..4]).is_err());
    }

    #[test]
    fn test_validate() {
        assert!(SmartPointer::heap(TypeTag::String, 0, 10, 64).validate().is_err());
        assert!(SmartPointer::heap(TypeTag::String, 3, 10, 4096).validate().is_err());
        assert!(SmartPointer::heap(TypeTag::String, 3, 10, 64).validate().is_ok());
    }
}
