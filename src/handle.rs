// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The fixed-width Handle record (spec.md §3 "Handle", §4.B "Handle codec").

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    id::{Id, ID_SIZE},
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};

/// Width in bytes of a physical [`Location`]'s on-disk representation.
pub const LOCATION_SIZE: usize = 8;

/// Physical location of a B-tree node payload: a segment and a block
/// index within it. The segment and block offset are resolved against the
/// segment's mod value by the caller (spec.md §4.C).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Location {
    /// Which segment file (1-based, as in `<table>-<n>.reg`)
    pub segment: u32,
    /// Block index within the segment
    pub block: u32,
}

impl Encode for Location {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u32::<BigEndian>(self.segment)?;
        writer.write_u32::<BigEndian>(self.block)?;
        Ok(())
    }
}

impl Decode for Location {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let segment = reader.read_u32::<BigEndian>()?;
        let block = reader.read_u32::<BigEndian>()?;
        Ok(Self { segment, block })
    }
}

/// Width in bytes of a serialized [`Handle`] (the compile-time constant
/// `H` from spec.md §3). Chosen so that `4096 % HANDLE_SIZE != 0`,
/// exercising the "trailing bytes are zero" block invariant.
pub const HANDLE_SIZE: usize = 80;

const FLAG_ACTIVE: u8 = 0b0000_0001;
const FLAG_DELETED: u8 = 0b0000_0010;

/// Fixed-size record mapping a logical [`Id`] to the physical location and
/// versioning metadata of a B-tree node payload.
///
/// A [`Handle`] whose `logical_id` is [`Id::NIL`] denotes a free slot on
/// disk. Handles are never partially written: a slot is either all-zero
/// (free) or a fully serialized Handle.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Handle {
    /// The logical object ID this handle describes
    pub logical_id: Id,
    /// Physical location of the currently active copy of the payload
    pub active_location: Location,
    /// Physical location of the inactive/shadow copy (used during rollover)
    pub shadow_location: Location,
    /// Monotonically increasing version counter, bumped on `Update`
    pub version: u64,
    /// Whether the active location currently holds live data
    pub active: bool,
    /// Tombstone marker for soft deletes
    pub deleted: bool,
    /// Last-modified timestamp, seconds since the Unix epoch
    pub timestamp: u64,
}

impl Handle {
    /// Returns `true` if this handle represents a free slot (nil logical ID).
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.logical_id.is_nil()
    }
}

impl Encode for Handle {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        let mut buf = Vec::with_capacity(HANDLE_SIZE);

        self.logical_id.encode_into(&mut buf)?;
        self.active_location.encode_into(&mut buf)?;
        self.shadow_location.encode_into(&mut buf)?;
        buf.write_u64::<BigEndian>(self.version)?;

        let mut flags = 0u8;
        if self.active {
            flags |= FLAG_ACTIVE;
        }
        if self.deleted {
            flags |= FLAG_DELETED;
        }
        buf.write_u8(flags)?;

        buf.write_u64::<BigEndian>(self.timestamp)?;

        debug_assert!(buf.len() <= HANDLE_SIZE, "Handle encoding overflowed H");
        buf.resize(HANDLE_SIZE, 0);

        writer.write_all(&buf)?;
        Ok(())
    }
}

impl Decode for Handle {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut buf = [0u8; HANDLE_SIZE];
        reader.read_exact(&mut buf)?;

        // A fully-zero slot unmarshals to the nil-ID free-slot sentinel,
        // regardless of what the trailing padding bytes happen to be.
        if buf.iter().all(|&b| b == 0) {
            return Ok(Self::default());
        }

        let mut cursor = std::io::Cursor::new(&buf[..]);

        let logical_id = Id::decode_from(&mut cursor)?;
        let active_location = Location::decode_from(&mut cursor)?;
        let shadow_location = Location::decode_from(&mut cursor)?;
        let version = cursor.read_u64::<BigEndian>()?;
        let flags = cursor.read_u8()?;
        let timestamp = cursor.read_u64::<BigEndian>()?;

        Ok(Self {
            logical_id,
            active_location,
            shadow_location,
            version,
            active: flags & FLAG_ACTIVE != 0,
            deleted: flags & FLAG_DELETED != 0,
            timestamp,
        })
    }
}

const _: () = assert!(HANDLE_SIZE >= ID_SIZE + 2 * LOCATION_SIZE + 8 + 1 + 8);

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Handle {
        Handle {
            logical_id: Id::from_u128(0xDEAD_BEEF),
            active_location: Location {
                segment: 1,
                block: 7,
            },
            shadow_location: Location {
                segment: 2,
                block: 9,
            },
            version: 3,
            active: true,
            deleted: false,
            timestamp: 1_700_000_000,
        }
    }

    #[test]
    fn roundtrip() -> crate::Result<()> {
        let h = sample();
        let bytes = h.encode_into_vec()?;
        assert_eq!(bytes.len(), HANDLE_SIZE);

        let mut cursor = std::io::Cursor::new(bytes);
        let decoded = Handle::decode_from(&mut cursor)?;
        assert_eq!(decoded, h);
        Ok(())
    }

    #[test]
    fn all_zero_slot_is_free() -> crate::Result<()> {
        let buf = vec![0u8; HANDLE_SIZE];
        let mut cursor = std::io::Cursor::new(buf);
        let decoded = Handle::decode_from(&mut cursor)?;
        assert!(decoded.is_free());
        assert_eq!(decoded.logical_id, Id::NIL);
        Ok(())
    }

    #[test]
    fn free_handle_encodes_to_all_zero() -> crate::Result<()> {
        let h = Handle::default();
        assert!(h.is_free());
        let bytes = h.encode_into_vec()?;
        assert!(bytes.iter().all(|&b| b == 0));
        Ok(())
    }

    #[test]
    fn flags_roundtrip_independently() -> crate::Result<()> {
        for (active, deleted) in [(true, true), (true, false), (false, true), (false, false)] {
            let mut h = sample();
            h.active = active;
            h.deleted = deleted;

            let bytes = h.encode_into_vec()?;
            let mut cursor = std::io::Cursor::new(bytes);
            let decoded = Handle::decode_from(&mut cursor)?;
            assert_eq!(decoded.active, active);
            assert_eq!(decoded.deleted, deleted);
        }
        Ok(())
    }
}
