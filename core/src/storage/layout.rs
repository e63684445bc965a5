//! On-disk geometry and tag spaces.
//!
//! The numeric values here are part of the file format. Changing any of
//! them makes existing data files unreadable.

use crate::error::{ArborError, ArborResult};

// Block geometry

/// Size of one block in bytes.
pub const BLOCK_SIZE: usize = 4096;

/// Header bytes at the start of every block.
pub const HEADER_SIZE: usize = 64;

/// Bytes available after the header.
pub const BLOCK_DATA_SIZE: usize = BLOCK_SIZE - HEADER_SIZE;

/// Page-heap allocation unit.
pub const UNIT_SIZE: usize = 32;

/// Units per heap page: (4096 - 64) / 32.
pub const UNITS_PER_PAGE: usize = BLOCK_DATA_SIZE / UNIT_SIZE;

/// Encoded smart pointer size.
pub const POINTER_SIZE: usize = 16;

/// Heap bitmap location inside a `PAGE` header (after the type tag).
pub const BITMAP_OFFSET: usize = 4;

/// 126 bits rounded up to whole bytes.
pub const BITMAP_SIZE: usize = 16;

/// Largest value carried directly inside a pointer.
pub const INLINE_MAX: usize = POINTER_SIZE - 2;

/// Largest value placed in the page heap (63 units).
pub const HEAP_MAX: usize = 63 * UNIT_SIZE;

/// Leads an empty dictionary directory.
pub const MAGIC_DICT_DIR: &[u8; 4] = b"DDIR";

/// Stamped big-endian at `HEAP_MAGIC_OFFSET` in every `PAGE` header.
pub const HEAP_PAGE_MAGIC: u16 = 0x4850;
pub const HEAP_MAGIC_OFFSET: usize = BITMAP_OFFSET + BITMAP_SIZE;

// Superblock layout (block 0)

pub const SUPERBLOCK_ID: u64 = 0;
pub const SUPERBLOCK_MAGIC: &[u8; 8] = b"ARBORDB\0";
pub const SUPERBLOCK_MAGIC_OFFSET: usize = 4;
pub const SUPERBLOCK_VERSION: u16 = 1;
pub const SUPERBLOCK_VERSION_OFFSET: usize = 12;
pub const SUPERBLOCK_CURSOR_OFFSET: usize = 16;

/// Root record: 48-bit id, u32 length, u32 offset, u8 chain flag.
pub const ROOT_ID_OFFSET: usize = 64;
pub const ROOT_LEN_OFFSET: usize = 70;
pub const ROOT_OFFSET_OFFSET: usize = 74;
pub const ROOT_CHAIN_OFFSET: usize = 78;

// Overflow header layout

pub const OVERFLOW_HEAD_OFFSET: usize = 4;
pub const OVERFLOW_SEGMENT_OFFSET: usize = 10;

// Block types

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockType {
    Free = 0,
    /// Shared small-object heap.
    Page = 1,
    BtreeNode = 2,
    CollectionHeader = 3,
    CollectionPage = 4,
    /// Segment of a large value chain.
    Overflow = 5,
    Meta = 6,
}

impl BlockType {
    /// Read the type tag stamped at the start of a block.
    pub fn of(block: &[u8]) -> ArborResult<Self> {
        if block.len() < 4 {
            return Err(ArborError::Storage("block too short for a type tag".into()));
        }
        Self::try_from(read_u32(block, 0))
    }

    pub fn stamp(self, block: &mut [u8]) {
        write_u32(block, 0, self as u32);
    }

    /// Types kept only so old files still open.
    pub fn is_legacy(self) -> bool {
        matches!(
            self,
            BlockType::BtreeNode | BlockType::CollectionHeader | BlockType::CollectionPage
        )
    }
}

impl TryFrom<u32> for BlockType {
    type Error = ArborError;

    fn try_from(value: u32) -> ArborResult<Self> {
        match value {
            0 => Ok(BlockType::Free),
            1 => Ok(BlockType::Page),
            2 => Ok(BlockType::BtreeNode),
            3 => Ok(BlockType::CollectionHeader),
            4 => Ok(BlockType::CollectionPage),
            5 => Ok(BlockType::Overflow),
            6 => Ok(BlockType::Meta),
            _ => Err(ArborError::Storage(format!("invalid block type: {}", value))),
        }
    }
}

// Storage modes

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageMode {
    Inline = 0,
    Heap = 1,
    Block = 2,
}

impl TryFrom<u8> for StorageMode {
    type Error = ArborError;

    fn try_from(value: u8) -> ArborResult<Self> {
        match value {
            0 => Ok(StorageMode::Inline),
            1 => Ok(StorageMode::Heap),
            2 => Ok(StorageMode::Block),
            _ => Err(ArborError::InvalidPointer(format!(
                "invalid storage mode: {}",
                value
            ))),
        }
    }
}

// Universal value types

/// Type tag carried by every smart pointer.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Null = 0,
    Undefined = 1,
    Boolean = 2,
    Number = 3,
    String = 4,
    Buffer = 5,
    Sequence = 6,
    Dictionary = 7,
    Map = 8,
    Json = 9,
    Date = 10,
    RegExp = 11,
    Error = 12,
    /// Legacy generic bigint.
    BigInt = 13,
    Symbol = 14,
    Set = 15,
    TypedArray = 16,
    Function = 17,
    CustomInstance = 18,
    BigIntPos = 19,
    BigIntNeg = 20,
}

impl TryFrom<u8> for TypeTag {
    type Error = ArborError;

    fn try_from(value: u8) -> ArborResult<Self> {
        use TypeTag::*;
        const TAGS: [TypeTag; 21] = [
            Null,
            Undefined,
            Boolean,
            Number,
            String,
            Buffer,
            Sequence,
            Dictionary,
            Map,
            Json,
            Date,
            RegExp,
            Error,
            BigInt,
            Symbol,
            Set,
            TypedArray,
            Function,
            CustomInstance,
            BigIntPos,
            BigIntNeg,
        ];
        TAGS.get(value as usize).copied().ok_or_else(|| {
            ArborError::InvalidPointer(format!("invalid type tag: {}", value))
        })
    }
}

// Serializer tags

/// Tag byte leading every encoded value.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValTag {
    Null = 0,
    Undefined = 1,
    BooleanTrue = 2,
    BooleanFalse = 3,
    NaN = 4,
    Infinity = 5,
    NegInfinity = 6,
    Uint8 = 7,
    Uint16 = 8,
    Uint32 = 9,
    Uint64 = 10,
    Int8Neg = 11,
    Int16Neg = 12,
    Int32Neg = 13,
    Int64Neg = 14,
    DoublePos = 15,
    DoubleNeg = 16,
    Float1 = 17,
    Float2 = 18,
    Float4 = 19,
    FloatNeg1 = 20,
    FloatNeg2 = 21,
    FloatNeg4 = 22,
    String = 23,
    Buffer = 24,
    Array = 25,
    Object = 26,
    Date = 27,
    JsBigInt = 28,
    RegExp = 29,
    Map = 30,
    Set = 31,
    Error = 32,
    Function = 33,
    Symbol = 34,
    TypedArray = 35,
    StringRle = 36,
    StringHebrew = 37,
    BigIntPos = 38,
    BigIntNeg = 39,
}

impl TryFrom<u8> for ValTag {
    type Error = ArborError;

    fn try_from(value: u8) -> ArborResult<Self> {
        use ValTag::*;
        const TAGS: [ValTag; 40] = [
            Null,
            Undefined,
            BooleanTrue,
            BooleanFalse,
            NaN,
            Infinity,
            NegInfinity,
            Uint8,
            Uint16,
            Uint32,
            Uint64,
            Int8Neg,
            Int16Neg,
            Int32Neg,
            Int64Neg,
            DoublePos,
            DoubleNeg,
            Float1,
            Float2,
            Float4,
            FloatNeg1,
            FloatNeg2,
            FloatNeg4,
            String,
            Buffer,
            Array,
            Object,
            Date,
            JsBigInt,
            RegExp,
            Map,
            Set,
            Error,
            Function,
            Symbol,
            TypedArray,
            StringRle,
            StringHebrew,
            BigIntPos,
            BigIntNeg,
        ];
        TAGS.get(value as usize)
            .copied()
            .ok_or_else(|| ArborError::Codec(format!("unknown value tag: {}", value)))
    }
}

// Big-endian field helpers

#[inline]
pub fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

#[inline]
pub fn write_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_be_bytes());
}

#[inline]
pub fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

#[inline]
pub fn write_u16(buf: &mut [u8], at: usize, value: u16) {
    buf[at..at + 2].copy_from_slice(&value.to_be_bytes());
}

#[inline]
pub fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[at..at + 8]);
    u64::from_be_bytes(bytes)
}

#[inline]
pub fn write_u64(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 8].copy_from_slice(&value.to_be_bytes());
}

/// Read a 48-bit big-endian block id.
#[inline]
pub fn read_u48(buf: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes[2..].copy_from_slice(&buf[at..at + 6]);
    u64::from_be_bytes(bytes)
}

/// Write the low 48 bits of `value` big-endian.
#[inline]
pub fn write_u48(buf: &mut [u8], at: usize, value: u64) {
    buf[at..at + 6].copy_from_slice(&value.to_be_bytes()[2..]);
}

/// Largest block id a 48-bit field can address.
pub const MAX_BLOCK_ID: u64 = (1 << 48) - 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geometry() {
        assert_eq!(UNITS_PER_PAGE, 126);
        assert!(UNITS_PER_PAGE <= BITMAP_SIZE * 8);
        assert!(HEAP_MAGIC_OFFSET + 2 <= HEADER_SIZE);
        assert!(ROOT_CHAIN_OFFSET < BLOCK_SIZE);
    }

    #[test]
    fn test_tag_values_are_stable() {
        assert_eq!(TypeTag::try_from(7).unwrap(), TypeTag::Dictionary);
        assert_eq!(TypeTag::try_from(20).unwrap(), TypeTag::BigIntNeg);
        assert!(TypeTag::try_from(21).is_err());

        assert_eq!(ValTag::try_from(36).unwrap(), ValTag::StringRle);
        assert_eq!(ValTag::BigIntNeg as u8, 39);
        assert!(ValTag::try_from(40).is_err());

        assert_eq!(BlockType::try_from(5).unwrap(), BlockType::Overflow);
        assert!(BlockType::CollectionPage.is_legacy());
    }

    #[test]
    fn test_u48_field() {
        let mut buf = [0u8; 8];
        write_u48(&mut buf, 1, 0x0000_1234_5678_9ABC);
        assert_eq!(read_u48(&buf, 1), 0x1234_5678_9ABC);
        assert_eq!(buf[0], 0);
        assert_eq!(buf[7], 0);
    }
}
