// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Active/passive failover state machine (spec.md §4.E).

use super::status::ReplicationStatus;
use crate::{cancellation::CancellationToken, l2::L2Cache};
use std::{
    path::{Path, PathBuf},
    sync::{Arc, Mutex, RwLock},
};

/// Key used to probe the L2 cache for a peer's more recent replication
/// state during `failover`'s reconciliation pull (spec.md §4.E).
const GLOBAL_REPLICATION_KEY: &str = "global_replication_details";

/// Process-wide-shareable snapshot of which folder is active, read by path
/// formation helpers across subsystems (spec.md §3 "Ownership and
/// lifecycle", §9 "Process-wide singleton state").
///
/// Modeled as an `Arc<RwLock<_>>` handed out by [`ReplicationTracker::shared_global`]
/// rather than a literal process `static`: every consumer that needs to
/// observe transitions holds a clone of the same `Arc`, which gives the
/// same "one writer, many readers" semantics the spec calls for without
/// forcing a single global to be shared across independent test runs.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct GlobalReplicationDetails {
    /// `true` selects `folders[0]` as the active base.
    pub active_folder_toggler: bool,
    /// Whether any peer has already recorded a replication failure.
    pub failed_to_replicate: bool,
}

/// Owns the active/passive toggle for a pair of base folders and the
/// failover state machine that flips it.
pub struct ReplicationTracker {
    folders: [PathBuf; 2],
    replication_enabled: bool,
    local: Mutex<ReplicationStatus>,
    global: Arc<RwLock<GlobalReplicationDetails>>,
}

impl ReplicationTracker {
    /// Opens a tracker over `folder_a`/`folder_b`, reading whichever
    /// side's status file should win (spec.md §4.E
    /// `readStatusFromHomeFolder`).
    pub fn open(folder_a: impl Into<PathBuf>, folder_b: impl Into<PathBuf>, replication_enabled: bool) -> crate::Result<Self> {
        let folders = [folder_a.into(), folder_b.into()];
        let status = Self::read_status_from_home_folder(&folders)?;
        let global = Arc::new(RwLock::new(GlobalReplicationDetails {
            active_folder_toggler: status.active_folder_toggler,
            failed_to_replicate: status.failed_to_replicate,
        }));
        Ok(Self {
            folders,
            replication_enabled,
            local: Mutex::new(status),
            global,
        })
    }

    /// Returns whether active/passive replication is turned on for this
    /// tracker.
    #[must_use]
    pub fn is_replication_enabled(&self) -> bool {
        self.replication_enabled
    }

    /// A clone of the shared global snapshot handle, for peer components
    /// that must compute paths independently but stay consistent with
    /// this tracker's transitions.
    #[must_use]
    pub fn shared_global(&self) -> Arc<RwLock<GlobalReplicationDetails>> {
        self.global.clone()
    }

    /// Reads the current global snapshot.
    #[must_use]
    pub fn global_snapshot(&self) -> GlobalReplicationDetails {
        *self.global.read().expect("lock poisoned")
    }

    fn active_index(toggler: bool) -> usize {
        if toggler {
            0
        } else {
            1
        }
    }

    /// The currently active base folder.
    #[must_use]
    pub fn active_folder(&self) -> &Path {
        let idx = Self::active_index(self.global_snapshot().active_folder_toggler);
        &self.folders[idx]
    }

    /// The currently passive base folder.
    #[must_use]
    pub fn passive_folder(&self) -> &Path {
        let idx = Self::active_index(!self.global_snapshot().active_folder_toggler);
        &self.folders[idx]
    }

    /// Joins `name` onto the active base folder.
    #[must_use]
    pub fn format_active_folder_entity(&self, name: &str) -> PathBuf {
        self.active_folder().join(name)
    }

    /// Joins `name` onto the passive base folder.
    #[must_use]
    pub fn format_passive_folder_entity(&self, name: &str) -> PathBuf {
        self.passive_folder().join(name)
    }

    fn read_status_from_home_folder(folders: &[PathBuf; 2]) -> crate::Result<ReplicationStatus> {
        let active_raw = ReplicationStatus::load(&folders[0])?;
        let passive_raw = ReplicationStatus::load(&folders[1])?;

        match (active_raw, passive_raw) {
            (None, None) => Ok(ReplicationStatus::default_active()),
            (Some(a), None) => Ok(ReplicationStatus {
                active_folder_toggler: true,
                ..a
            }),
            (None, Some(p)) => Ok(ReplicationStatus {
                active_folder_toggler: false,
                ..p
            }),
            (Some(a), Some(p)) => {
                let active_mtime = std::fs::metadata(folders[0].join(super::status::STATUS_FILE_NAME))?.modified()?;
                let passive_mtime = std::fs::metadata(folders[1].join(super::status::STATUS_FILE_NAME))?.modified()?;

                // Ties prefer the active side (spec.md §9 Open Questions).
                if passive_mtime > active_mtime {
                    Ok(ReplicationStatus {
                        active_folder_toggler: false,
                        ..p
                    })
                } else {
                    Ok(ReplicationStatus {
                        active_folder_toggler: true,
                        ..a
                    })
                }
            }
        }
    }

    /// Marks a passive-side failure. Sets both the local and global
    /// `FailedToReplicate` flag; writes the status file to the active
    /// side only if no peer sharing the global snapshot has already done
    /// so (spec.md §4.E, invariant 9).
    pub fn handle_failed_to_replicate(&self) -> crate::Result<()> {
        let mut local = self.local.lock().expect("lock poisoned");
        local.failed_to_replicate = true;

        let already_failed = {
            let mut global = self.global.write().expect("lock poisoned");
            let was = global.failed_to_replicate;
            global.failed_to_replicate = true;
            was
        };

        if already_failed {
            return Ok(());
        }

        let active = &self.folders[Self::active_index(local.active_folder_toggler)];
        local.save(active)
    }

    /// Flips which side is active. Idempotent: a no-op if this instance
    /// already recorded a replication failure, or if the global snapshot
    /// shows someone else already flipped (spec.md §4.E `failover`).
    pub fn failover(&self, cancel: &CancellationToken, l2: &impl L2Cache) -> crate::Result<()> {
        cancel.check()?;
        let mut local = self.local.lock().expect("lock poisoned");

        let global_toggler = self.global.read().expect("lock poisoned").active_folder_toggler;
        if local.failed_to_replicate || global_toggler != local.active_folder_toggler {
            return Ok(());
        }

        if let Err(e) = l2.get_struct_ex(GLOBAL_REPLICATION_KEY) {
            log::warn!("L2 reconcile pull during failover failed (continuing anyway): {e}");
        }

        let new_toggler = !local.active_folder_toggler;
        let new_passive_folder = &self.folders[Self::active_index(!new_toggler)];
        let mut new_status = *local;
        new_status.active_folder_toggler = new_toggler;

        new_status.save(new_passive_folder)?;

        local.active_folder_toggler = new_toggler;
        self.global.write().expect("lock poisoned").active_folder_toggler = new_toggler;
        Ok(())
    }

    /// Temporarily flips which folder `active_folder`/`passive_folder`
    /// report, for `StoreRepository::copy_to_passive_folders`'s bulk sync,
    /// which needs the replication-aware writer to target the passive
    /// side without going through a real `failover`. Restores the
    /// original toggler when the guard drops (spec.md §4.G
    /// `CopyToPassiveFolders`).
    #[must_use]
    pub fn force_toggle_for_copy(&self) -> ForceToggleGuard<'_> {
        let mut global = self.global.write().expect("lock poisoned");
        let original = global.active_folder_toggler;
        global.active_folder_toggler = !original;
        drop(global);
        ForceToggleGuard {
            tracker: self,
            original,
        }
    }

    /// Routes a storage-level error to either `failover` (a qualifying
    /// error with no successful rollback) or `handle_failed_to_replicate`
    /// (spec.md §4.E `HandleReplicationRelatedError`).
    pub fn handle_replication_related_error(
        &self,
        err: &crate::Error,
        rollback_succeeded: bool,
        cancel: &CancellationToken,
        l2: &impl L2Cache,
    ) -> crate::Result<()> {
        if err.is_failover_qualified() && !rollback_succeeded {
            self.failover(cancel, l2)
        } else {
            self.handle_failed_to_replicate()
        }
    }
}

/// Restores the original active/passive mapping when dropped.
pub struct ForceToggleGuard<'a> {
    tracker: &'a ReplicationTracker,
    original: bool,
}

impl Drop for ForceToggleGuard<'_> {
    fn drop(&mut self) {
        self.tracker
            .global
            .write()
            .expect("lock poisoned")
            .active_folder_toggler = self.original;
    }
}
