// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The 4 KiB direct-I/O block (spec.md §3 "Block").

use crate::{
    coding::{Decode, Encode},
    handle::{Handle, HANDLE_SIZE},
};

/// Size in bytes of a direct-I/O block, and the unit every segment file is
/// a whole multiple of.
pub const BLOCK_SIZE: usize = 4096;

/// Number of fixed-width Handle slots that fit in one block
/// (`K = floor(4096 / H)`). Trailing bytes of a block beyond
/// `SLOTS_PER_BLOCK * HANDLE_SIZE` are always zero.
pub const SLOTS_PER_BLOCK: usize = BLOCK_SIZE / HANDLE_SIZE;

const _: () = assert!(SLOTS_PER_BLOCK > 0, "HANDLE_SIZE must fit in a block");

/// A 4096-byte block holding `SLOTS_PER_BLOCK` Handle slots back-to-back,
/// with any remaining bytes zeroed.
#[derive(Clone)]
pub struct Block(Box<[u8; BLOCK_SIZE]>);

impl Default for Block {
    fn default() -> Self {
        Self(Box::new([0u8; BLOCK_SIZE]))
    }
}

impl Block {
    /// Wraps a raw 4096-byte buffer as a Block.
    #[must_use]
    pub fn from_bytes(bytes: [u8; BLOCK_SIZE]) -> Self {
        Self(Box::new(bytes))
    }

    /// Returns the raw bytes of this block.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; BLOCK_SIZE] {
        &self.0
    }

    /// Returns a mutable view of the raw bytes of this block.
    pub fn as_bytes_mut(&mut self) -> &mut [u8; BLOCK_SIZE] {
        &mut self.0
    }

    /// Reads the slot at `index` (`0..SLOTS_PER_BLOCK`) as a [`Handle`].
    ///
    /// # Panics
    ///
    /// Panics if `index >= SLOTS_PER_BLOCK`.
    pub fn read_slot(&self, index: usize) -> crate::Result<Handle> {
        assert!(index < SLOTS_PER_BLOCK, "slot index out of range");
        let start = index * HANDLE_SIZE;
        let mut cursor = std::io::Cursor::new(&self.0[start..start + HANDLE_SIZE]);
        Ok(Handle::decode_from(&mut cursor)?)
    }

    /// Writes `handle` into the slot at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index >= SLOTS_PER_BLOCK`.
    pub fn write_slot(&mut self, index: usize, handle: &Handle) -> crate::Result<()> {
        assert!(index < SLOTS_PER_BLOCK, "slot index out of range");
        let start = index * HANDLE_SIZE;
        let mut buf = handle.encode_into_vec()?;
        buf.resize(HANDLE_SIZE, 0);
        self.0[start..start + HANDLE_SIZE].copy_from_slice(&buf);
        Ok(())
    }

    /// Returns `true` if the slot at `index` is free (nil logical ID).
    pub fn slot_is_free(&self, index: usize) -> crate::Result<bool> {
        Ok(self.read_slot(index)?.is_free())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::Id;

    #[test]
    fn fresh_block_is_all_free() -> crate::Result<()> {
        let block = Block::default();
        for i in 0..SLOTS_PER_BLOCK {
            assert!(block.slot_is_free(i)?);
        }
        Ok(())
    }

    #[test]
    fn write_then_read_slot() -> crate::Result<()> {
        let mut block = Block::default();
        let handle = Handle {
            logical_id: Id::from_u128(123),
            version: 5,
            ..Default::default()
        };
        block.write_slot(3, &handle)?;

        assert!(!block.slot_is_free(3)?);
        assert_eq!(block.read_slot(3)?, handle);

        // Neighbors remain free
        assert!(block.slot_is_free(2)?);
        assert!(block.slot_is_free(4)?);
        Ok(())
    }

    #[test]
    fn trailing_bytes_are_zero() {
        let used = SLOTS_PER_BLOCK * HANDLE_SIZE;
        assert!(BLOCK_SIZE - used < HANDLE_SIZE);

        let block = Block::default();
        assert!(block.as_bytes()[used..].iter().all(|&b| b == 0));
    }
}
