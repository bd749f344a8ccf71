// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::coding::{DecodeError, EncodeError};

/// Represents errors that can occur in the registry and replication tracker.
///
/// `IDNotFound` is deliberately absent: it is an internal sentinel used by
/// the segment-file hashmap's read path and never escapes `fetch`.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Serialization failed
    Encode(EncodeError),

    /// Deserialization failed
    Decode(DecodeError),

    /// A requested store does not exist
    NotFound,

    /// `StoreRepository::add` was asked to create a store whose name is
    /// already present in the store list
    AlreadyExists,

    /// An advisory lock (preallocation or per-block) could not be acquired
    /// within its timeout
    LockConflict,

    /// A block-sized read returned fewer bytes than expected without
    /// reaching EOF
    PartialRead,

    /// A metadata JSON file (`replstat.txt`, `storelist.txt`,
    /// `storeinfo.txt`) could not be parsed
    Corrupt(&'static str),

    /// A storage-level failure that qualifies the replication tracker to
    /// fail over to the passive side
    FailoverQualified,

    /// The operation was cancelled via its `CancellationToken`
    Cancelled,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RegistryError: {self:?}")
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Encode(e) => Some(e),
            Self::Decode(e) => Some(e),
            Self::NotFound
            | Self::AlreadyExists
            | Self::LockConflict
            | Self::PartialRead
            | Self::Corrupt(_)
            | Self::FailoverQualified
            | Self::Cancelled => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

impl Error {
    /// Returns `true` if this error should cause the replication tracker
    /// to fail over when no rollback has succeeded.
    ///
    /// Mirrors `HandleReplicationRelatedError`'s `err.Code ==
    /// FailoverQualifiedError` check.
    #[must_use]
    pub fn is_failover_qualified(&self) -> bool {
        matches!(self, Self::FailoverQualified)
    }
}

/// Registry result
pub type Result<T> = std::result::Result<T, Error>;
