// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! A fixed-layout, open-addressed registry mapping 128-bit object IDs to
//! physical locations, with active/passive replication for crash-consistent
//! failover between two base directories.
//!
//! The registry is split into page-aligned (4096-byte) segment files, each
//! holding a whole number of blocks. A [`Handle`] describes where the
//! current and shadow copies of an object's payload live, its version, and
//! its activity/deletion state. Handles are located by open-addressed
//! hashing within a single block — collisions probe forward with
//! wraparound, never spilling into a neighboring block. A full block
//! advances the search to the next segment file, which is created on
//! demand.
//!
//! Two independent components sit on top of the per-table hashmap:
//!
//! - [`ReplicationTracker`] keeps an active/passive pair of base
//!   directories in sync well enough that either can take over after a
//!   crash, using a durable status file compared by modification time.
//! - [`StoreRepository`] manages the metadata of a set of named stores —
//!   each with its own registry — as a single transactional unit.
//!
//! # Example usage
//!
//! ```
//! use btree_registry::{
//!     CancellationToken, Config, Handle, Id, OsDirectIo, SegmentHashMap,
//! };
//! # use btree_registry::l2::mock::MockL2Cache;
//!
//! # fn main() -> btree_registry::Result<()> {
//! # let folder = tempfile::tempdir()?;
//! let hashmap = SegmentHashMap::new(
//!     folder.path(),
//!     "widgets",
//!     Config::new().mod_value(64),
//!     OsDirectIo,
//!     MockL2Cache::new(),
//! );
//!
//! let id = Id::from_u128(42);
//! let cancel = CancellationToken::new();
//! hashmap.set(
//!     id,
//!     &Handle {
//!         logical_id: id,
//!         version: 1,
//!         ..Default::default()
//!     },
//!     &cancel,
//! )?;
//!
//! let found = hashmap.fetch(&[id], &cancel)?;
//! assert_eq!(found.len(), 1);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs, clippy::cargo)]
#![deny(clippy::unwrap_used)]
#![warn(clippy::indexing_slicing)]
#![warn(clippy::pedantic, clippy::nursery)]
#![warn(clippy::expect_used)]
#![allow(clippy::missing_const_for_fn)]
#![warn(clippy::multiple_crate_versions)]

mod atomic_file;
mod block;
pub mod cancellation;
mod coding;
pub mod config;
pub mod direct_io;
mod error;
mod handle;
mod hashmap;
mod id;
pub mod l2;
pub mod registry;
pub mod replication;
pub mod store;

pub use {
    block::{Block, BLOCK_SIZE, SLOTS_PER_BLOCK},
    cancellation::CancellationToken,
    config::Config,
    direct_io::{DirectIo, OpenFlags, OsDirectIo},
    error::{Error, Result},
    handle::{Handle, Location, HANDLE_SIZE, LOCATION_SIZE},
    hashmap::{FileRegion, SegmentHashMap},
    id::{Id, ID_SIZE},
    l2::{L2Cache, LockKey},
    registry::Registry,
    replication::{ReplicationStatus, ReplicationTracker},
    store::{StoreInfo, StoreRepository},
};

#[doc(hidden)]
pub use direct_io::sim::{SimDirectIo, SimMode};

#[doc(hidden)]
pub use l2::mock::MockL2Cache;
