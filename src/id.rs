// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The 128-bit logical object identifier (spec.md §3 "ID").

use crate::coding::{Decode, DecodeError, Encode, EncodeError};
use std::io::{Read, Write};

/// Width in bytes of [`Id`]'s on-disk representation.
pub const ID_SIZE: usize = 16;

/// An opaque 128-bit logical object identifier.
///
/// Carries a stable byte representation and a total order. The all-zero
/// value is the distinguished "nil" ID, used by the segment-file hashmap
/// to mark a slot as free (spec.md §3 "Handle" invariant).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Id(u128);

impl Id {
    /// The distinguished nil ID. A Handle slot whose logical ID equals
    /// this value denotes a free slot on disk.
    pub const NIL: Self = Self(0);

    /// Creates an ID from a big-endian byte representation.
    #[must_use]
    pub fn from_be_bytes(bytes: [u8; ID_SIZE]) -> Self {
        Self(u128::from_be_bytes(bytes))
    }

    /// Returns the big-endian byte representation of this ID.
    #[must_use]
    pub fn to_be_bytes(self) -> [u8; ID_SIZE] {
        self.0.to_be_bytes()
    }

    /// Creates a new ID from a raw `u128`.
    #[must_use]
    pub fn from_u128(value: u128) -> Self {
        Self(value)
    }

    /// Returns `true` if this is the nil ID (a free-slot sentinel).
    #[must_use]
    pub fn is_nil(self) -> bool {
        self == Self::NIL
    }

    /// Splits the ID into its high and low 64-bit halves.
    #[must_use]
    pub fn halves(self) -> (u64, u64) {
        let bytes = self.0.to_be_bytes();
        let mut hi = [0u8; 8];
        let mut lo = [0u8; 8];
        hi.copy_from_slice(&bytes[0..8]);
        lo.copy_from_slice(&bytes[8..16]);
        (u64::from_be_bytes(hi), u64::from_be_bytes(lo))
    }

    /// Renders the ID as a lowercase hex string.
    #[must_use]
    pub fn to_hex(self) -> String {
        let bytes = self.to_be_bytes();
        let mut out = String::with_capacity(ID_SIZE * 2);
        for byte in bytes {
            use std::fmt::Write as _;
            // Cannot fail: writing to a String never errors
            let _ = write!(out, "{byte:02x}");
        }
        out
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<u128> for Id {
    fn from(value: u128) -> Self {
        Self(value)
    }
}

impl Encode for Id {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_all(&self.to_be_bytes())?;
        Ok(())
    }
}

impl Decode for Id {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut buf = [0u8; ID_SIZE];
        reader.read_exact(&mut buf)?;
        Ok(Self::from_be_bytes(buf))
    }
}
