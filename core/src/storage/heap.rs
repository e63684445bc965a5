//! Occupancy bitmap of a page-heap block.
//!
//! One bit per 32-byte unit of the block body, most significant bit first.
//! A set bit means the unit belongs to a live value.

use crate::error::{ArborError, ArborResult};
use crate::storage::layout::{BITMAP_OFFSET, BITMAP_SIZE, HEADER_SIZE, UNIT_SIZE, UNITS_PER_PAGE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageBitmap {
    bits: [u8; BITMAP_SIZE],
}

impl PageBitmap {
    /// Every unit free.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every unit taken. Blocks formatted this way are never sub-allocated.
    pub fn sealed() -> Self {
        let mut bitmap = Self::new();
        bitmap.set_range(0, UNITS_PER_PAGE);
        bitmap
    }

    /// Read the bitmap out of a block header.
    pub fn from_block(block: &[u8]) -> Self {
        let mut bits = [0u8; BITMAP_SIZE];
        bits.copy_from_slice(&block[BITMAP_OFFSET..BITMAP_OFFSET + BITMAP_SIZE]);
        Self { bits }
    }

    /// Store the bitmap into a block header.
    pub fn write_to(&self, block: &mut [u8]) {
        block[BITMAP_OFFSET..BITMAP_OFFSET + BITMAP_SIZE].copy_from_slice(&self.bits);
    }

    #[inline]
    pub fn is_set(&self, unit: usize) -> bool {
        self.bits[unit / 8] & (0x80 >> (unit % 8)) != 0
    }

    #[inline]
    fn set(&mut self, unit: usize) {
        self.bits[unit / 8] |= 0x80 >> (unit % 8);
    }

    #[inline]
    fn clear(&mut self, unit: usize) {
        self.bits[unit / 8] &= !(0x80 >> (unit % 8));
    }

    pub fn set_range(&mut self, start: usize, count: usize) {
        for unit in start..(start + count).min(UNITS_PER_PAGE) {
            self.set(unit);
        }
    }

    pub fn clear_range(&mut self, start: usize, count: usize) {
        for unit in start..(start + count).min(UNITS_PER_PAGE) {
            self.clear(unit);
        }
    }

    /// First run of `count` free units, scanning from unit 0.
    pub fn find_run(&self, count: usize) -> Option<usize> {
        if count == 0 || count > UNITS_PER_PAGE {
            return None;
        }

        let mut run_start = 0;
        let mut run_len = 0;
        for unit in 0..UNITS_PER_PAGE {
            if self.is_set(unit) {
                run_len = 0;
                run_start = unit + 1;
            } else {
                run_len += 1;
                if run_len == count {
                    return Some(run_start);
                }
            }
        }
        None
    }

    pub fn free_units(&self) -> usize {
        (0..UNITS_PER_PAGE).filter(|&u| !self.is_set(u)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.free_units() == UNITS_PER_PAGE
    }
}

/// Units needed to hold `len` bytes.
pub fn units_for(len: usize) -> usize {
    len.div_ceil(UNIT_SIZE).max(1)
}

/// Byte offset inside the block of the given unit.
pub fn unit_offset(unit: usize) -> u32 {
    (HEADER_SIZE + unit * UNIT_SIZE) as u32
}

/// Unit index addressed by a heap pointer offset.
pub fn offset_unit(offset: u32) -> ArborResult<usize> {
    let offset = offset as usize;
    if offset < HEADER_SIZE || (offset - HEADER_SIZE) % UNIT_SIZE != 0 {
        return Err(ArborError::InvalidPointer(format!(
            "heap offset {} is not unit aligned",
            offset
        )));
    }
    let unit = (offset - HEADER_SIZE) / UNIT_SIZE;
    if unit >= UNITS_PER_PAGE {
        return Err(ArborError::InvalidPointer(format!(
            "heap offset {} lies past the last unit",
            offset
        )));
    }
    Ok(unit)
}
