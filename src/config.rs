// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Registry configuration (spec.md §3 "Segment file", §4.C, §5).

use std::time::Duration;

/// The minimum enforced mod value (spec.md §3: "a minimum enforced value
/// exists"). Segment files smaller than this many blocks would make the
/// per-block scan degenerate too quickly on any real table.
pub const MIN_MOD_VALUE: u32 = 16;

/// Default mod value (`B`), chosen so a segment file is a few megabytes.
pub const DEFAULT_MOD_VALUE: u32 = 1024;

/// Configuration for a [`crate::hashmap::SegmentHashMap`] / [`crate::registry::Registry`].
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of 4096-byte blocks per segment file (`B`)
    pub(crate) mod_value: u32,

    /// How long a preallocation/per-block lock attempt may take before
    /// giving up (spec.md §4.C, §5)
    pub(crate) lock_timeout: Duration,

    /// Backoff interval between `IsLocked` spin-poll attempts
    /// (spec.md §9 "Advisory-lock spin")
    pub(crate) lock_retry_interval: Duration,

    /// Whether active/passive replication is enabled for this registry
    pub(crate) replication_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mod_value: DEFAULT_MOD_VALUE,
            lock_timeout: Duration::from_secs(5),
            lock_retry_interval: Duration::from_millis(10),
            replication_enabled: false,
        }
    }
}

impl Config {
    /// Creates a new configuration builder with defaults applied.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the mod value (`B`), the number of blocks per segment file.
    ///
    /// Values below [`MIN_MOD_VALUE`] are clamped up to it.
    #[must_use]
    pub fn mod_value(mut self, blocks: u32) -> Self {
        self.mod_value = blocks.max(MIN_MOD_VALUE);
        self
    }

    /// Sets the timeout for the preallocation lock and the per-block
    /// advisory lock spin.
    #[must_use]
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets the backoff interval between lock spin-poll attempts.
    #[must_use]
    pub fn lock_retry_interval(mut self, interval: Duration) -> Self {
        self.lock_retry_interval = interval;
        self
    }

    /// Enables or disables active/passive replication.
    #[must_use]
    pub fn replication_enabled(mut self, enabled: bool) -> Self {
        self.replication_enabled = enabled;
        self
    }

    /// Returns the configured mod value (`B`).
    #[must_use]
    pub fn mod_value_get(&self) -> u32 {
        self.mod_value
    }

    /// Returns the size in bytes of one fully preallocated segment file
    /// (`B * 4096`, spec.md §4.C `getSegmentFileSize`).
    #[must_use]
    pub fn segment_file_size(&self) -> u64 {
        u64::from(self.mod_value) * crate::block::BLOCK_SIZE as u64
    }
}
