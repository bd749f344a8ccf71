// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Replication-aware file I/O (spec.md §4.D): every logical path resolves
//! against the tracker's active base, with writes optionally mirrored to
//! the passive base.

use super::tracker::ReplicationTracker;

/// Wraps path formation against a [`ReplicationTracker`] so metadata
/// writes are mirrored to the passive side when replication is enabled.
pub struct ReplicationAwareIo<'a> {
    tracker: &'a ReplicationTracker,
}

impl<'a> ReplicationAwareIo<'a> {
    /// Wraps `tracker`.
    #[must_use]
    pub fn new(tracker: &'a ReplicationTracker) -> Self {
        Self { tracker }
    }

    /// Creates `<base>/<name>` on the active side, and on the passive side
    /// too if replication is enabled. A passive-side failure is not
    /// fatal; it marks the tracker instead.
    pub fn create_store(&self, name: &str) -> crate::Result<()> {
        std::fs::create_dir_all(self.tracker.format_active_folder_entity(name))?;

        if self.tracker.is_replication_enabled() {
            let passive = self.tracker.format_passive_folder_entity(name);
            if let Err(e) = std::fs::create_dir_all(&passive) {
                log::warn!("passive createStore failed for {name}: {e}");
                self.tracker.handle_failed_to_replicate()?;
            }
        }

        Ok(())
    }

    /// Atomically writes `bytes` to `relative_path` under the active
    /// base, mirroring to the passive base when replication is enabled.
    pub fn write(&self, relative_path: &str, bytes: &[u8]) -> crate::Result<()> {
        crate::atomic_file::rewrite_atomic(&self.tracker.format_active_folder_entity(relative_path), bytes)?;

        if self.tracker.is_replication_enabled() {
            let passive_path = self.tracker.format_passive_folder_entity(relative_path);
            if let Err(e) = crate::atomic_file::rewrite_atomic(&passive_path, bytes) {
                log::warn!("passive write failed for {relative_path}: {e}");
                self.tracker.handle_failed_to_replicate()?;
            }
        }

        Ok(())
    }

    /// Reads `relative_path` from the active base.
    pub fn read(&self, relative_path: &str) -> crate::Result<Vec<u8>> {
        Ok(std::fs::read(self.tracker.format_active_folder_entity(relative_path))?)
    }

    /// Removes `relative_path` from the active base, and the passive base
    /// too if replication is enabled.
    pub fn remove(&self, relative_path: &str) -> crate::Result<()> {
        let active_path = self.tracker.format_active_folder_entity(relative_path);
        if active_path.exists() {
            std::fs::remove_file(&active_path)?;
        }

        if self.tracker.is_replication_enabled() {
            let passive_path = self.tracker.format_passive_folder_entity(relative_path);
            if passive_path.exists() {
                if let Err(e) = std::fs::remove_file(&passive_path) {
                    log::warn!("passive remove failed for {relative_path}: {e}");
                    self.tracker.handle_failed_to_replicate()?;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_mirrors_to_passive_when_enabled() -> crate::Result<()> {
        let a = tempfile::tempdir()?;
        let b = tempfile::tempdir()?;
        let tracker = ReplicationTracker::open(a.path(), b.path(), true)?;
        let io = ReplicationAwareIo::new(&tracker);

        io.write("thing.txt", b"hello")?;

        assert_eq!(std::fs::read(a.path().join("thing.txt"))?, b"hello");
        assert_eq!(std::fs::read(b.path().join("thing.txt"))?, b"hello");
        Ok(())
    }

    #[test]
    fn write_does_not_mirror_when_disabled() -> crate::Result<()> {
        let a = tempfile::tempdir()?;
        let b = tempfile::tempdir()?;
        let tracker = ReplicationTracker::open(a.path(), b.path(), false)?;
        let io = ReplicationAwareIo::new(&tracker);

        io.write("thing.txt", b"hello")?;

        assert!(a.path().join("thing.txt").exists());
        assert!(!b.path().join("thing.txt").exists());
        Ok(())
    }

    #[test]
    fn create_store_makes_directory_on_active_side() -> crate::Result<()> {
        let a = tempfile::tempdir()?;
        let b = tempfile::tempdir()?;
        let tracker = ReplicationTracker::open(a.path(), b.path(), true)?;
        let io = ReplicationAwareIo::new(&tracker);

        io.create_store("mystore")?;

        assert!(a.path().join("mystore").is_dir());
        assert!(b.path().join("mystore").is_dir());
        Ok(())
    }
}
