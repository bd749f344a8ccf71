// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Per-store metadata record (spec.md §3 "Store info", §6 "Store-info
//! file").

use serde::{Deserialize, Serialize};

/// `<base>/<storeName>/storeinfo.txt`. One per named store.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreInfo {
    /// The store's name, matching its directory and its entry in the
    /// store list.
    pub name: String,
    /// Fixed slot length used by this store's B-tree nodes.
    pub slot_length: u32,
    /// Number of live items, advanced by `Update`'s `CountDelta`.
    pub count: u64,
    /// Opaque cache-policy identifier (e.g. `"lru"`, `"none"`).
    pub cache_policy: String,
    /// Name of the registry table backing this store (its segment-file
    /// directory).
    pub registry_table: String,
    /// Last-modified timestamp, seconds since the Unix epoch.
    pub timestamp: u64,
    /// How long cached pages for this store stay warm, in seconds.
    pub cache_duration_secs: u64,
}

impl StoreInfo {
    /// Relative path of this store's info file, joined onto a base
    /// folder.
    #[must_use]
    pub fn relative_path(name: &str) -> String {
        format!("{name}/storeinfo.txt")
    }

    /// Applies a signed delta to `count`, saturating at zero.
    pub fn apply_count_delta(&mut self, delta: i64) {
        self.count = self.count.saturating_add_signed(delta);
    }
}
