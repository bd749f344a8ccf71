// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The public registry contract (spec.md §4.F): aggregates the
//! segment-file hashmap and the replication tracker behind
//! Add/Fetch/Update/`UpdateNoLocks`/Remove/Replicate/Close.

use crate::{
    cancellation::CancellationToken,
    config::Config,
    direct_io::DirectIo,
    error::{Error, Result},
    handle::Handle,
    hashmap::SegmentHashMap,
    id::Id,
    l2::L2Cache,
    replication::ReplicationTracker,
};
use std::sync::Arc;

/// A single id/handle pair, the unit `Add`/`Update`/`Replicate` operate on.
#[derive(Clone, Copy, Debug)]
pub struct Payload {
    /// The logical id of the affected slot
    pub id: Id,
    /// The handle to write
    pub handle: Handle,
}

/// Public operations over one table's hashmap, replication-aware.
///
/// `Registry` opens a fresh [`SegmentHashMap`] against whichever side the
/// tracker currently reports active for every call, rather than caching
/// one bound at construction time — so a `failover` between calls is
/// picked up on the next operation without re-opening the registry.
pub struct Registry<IO: DirectIo, L2: L2Cache> {
    table: String,
    config: Config,
    io: Arc<IO>,
    l2: Arc<L2>,
    tracker: Arc<ReplicationTracker>,
}

impl<IO: DirectIo, L2: L2Cache> Registry<IO, L2> {
    /// Opens a registry for `table`, sharing `tracker` with any sibling
    /// tables and the store repository.
    pub fn new(table: impl Into<String>, config: Config, io: IO, l2: L2, tracker: Arc<ReplicationTracker>) -> Self {
        Self {
            table: table.into(),
            config,
            io: Arc::new(io),
            l2: Arc::new(l2),
            tracker,
        }
    }

    fn active_map(&self) -> SegmentHashMap<Arc<IO>, Arc<L2>> {
        SegmentHashMap::new(
            self.tracker.active_folder(),
            self.table.clone(),
            self.config.clone(),
            self.io.clone(),
            self.l2.clone(),
        )
    }

    fn passive_map(&self) -> SegmentHashMap<Arc<IO>, Arc<L2>> {
        SegmentHashMap::new(
            self.tracker.passive_folder(),
            self.table.clone(),
            self.config.clone(),
            self.io.clone(),
            self.l2.clone(),
        )
    }

    /// Writes every payload on the active side. On any failure, rolls back
    /// the payloads already written in this call to the value that
    /// occupied their slot beforehand — not to the free-slot sentinel,
    /// since `Update` expects those slots to already hold data — then
    /// routes the original error through the tracker so a qualifying
    /// storage failure can trigger a failover to the passive side
    /// (spec.md §2, §4.F `Add`).
    pub fn add(&self, payloads: &[Payload], cancel: &CancellationToken) -> Result<()> {
        let map = self.active_map();
        let mut written: Vec<(Id, Handle)> = Vec::with_capacity(payloads.len());

        for payload in payloads {
            match map.set(payload.id, &payload.handle, cancel) {
                Ok(prior) => written.push((payload.id, prior)),
                Err(e) => {
                    let rollback_succeeded = Self::rollback(&map, &written, cancel);
                    let _ = map.close();
                    let _ = self
                        .tracker
                        .handle_replication_related_error(&e, rollback_succeeded, cancel, &self.l2);
                    return Err(e);
                }
            }
        }
        map.close()?;

        if self.tracker.is_replication_enabled() {
            self.mirror_to_passive(payloads, &[], cancel);
        }

        Ok(())
    }

    /// Restores every `(id, prior handle)` pair already written in this
    /// call, in reverse order. Returns whether every restore write itself
    /// succeeded — a failed rollback leaves the active side in a state a
    /// caller cannot trust, which is exactly what qualifies it for
    /// failover.
    fn rollback(map: &SegmentHashMap<Arc<IO>, Arc<L2>>, written: &[(Id, Handle)], cancel: &CancellationToken) -> bool {
        let mut ok = true;
        for (id, prior) in written.iter().rev() {
            if map.set(*id, prior, cancel).is_err() {
                ok = false;
            }
        }
        ok
    }

    /// Reads the handles for `ids` (spec.md §4.F `Fetch`).
    pub fn fetch(&self, ids: &[Id], cancel: &CancellationToken) -> Result<Vec<Handle>> {
        let map = self.active_map();
        let result = map.fetch(ids, cancel);
        map.close()?;
        result
    }

    /// Like [`Registry::add`] but for slots expected to already exist;
    /// callers are responsible for bumping `handle.version` before
    /// calling (spec.md §4.F `Update`).
    pub fn update(&self, payloads: &[Payload], cancel: &CancellationToken) -> Result<()> {
        self.add(payloads, cancel)
    }

    /// Bulk post-commit update that skips the per-block advisory lock
    /// spin, for callers that already hold a broader lock. If
    /// `all_or_nothing`, the first failure aborts immediately without
    /// attempting the remaining payloads. Otherwise every payload is
    /// attempted, but the first error is still surfaced to the caller once
    /// all of them have been tried — operations never swallow an error
    /// just because the caller asked for best-effort semantics (spec.md
    /// §4.F `UpdateNoLocks`, §7 "first error wins").
    pub fn update_no_locks(&self, all_or_nothing: bool, payloads: &[Payload], cancel: &CancellationToken) -> Result<()> {
        let map = self.active_map();
        let mut first_err: Option<Error> = None;

        for payload in payloads {
            if let Err(e) = map.set_no_lock(payload.id, &payload.handle, cancel) {
                log::warn!("update_no_locks failed for {}: {e}", payload.id);
                if all_or_nothing {
                    let _ = map.close();
                    return Err(e);
                }
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }

        let close_err = map.close().err();

        match first_err {
            Some(e) => Err(e),
            None => close_err.map_or(Ok(()), Err),
        }
    }

    /// Zeroes the slot of each referenced id. On any failure, already
    /// zeroed slots are restored to their prior value before the original
    /// error is routed through the tracker (spec.md §2, §4.F `Remove`).
    pub fn remove(&self, ids: &[Id], cancel: &CancellationToken) -> Result<()> {
        let map = self.active_map();
        let mut removed: Vec<(Id, Handle)> = Vec::with_capacity(ids.len());

        for &id in ids {
            match map.set(id, &Handle::default(), cancel) {
                Ok(prior) => removed.push((id, prior)),
                Err(e) => {
                    let rollback_succeeded = Self::rollback(&map, &removed, cancel);
                    let _ = map.close();
                    let _ = self
                        .tracker
                        .handle_replication_related_error(&e, rollback_succeeded, cancel, &self.l2);
                    return Err(e);
                }
            }
        }

        map.close()?;

        if self.tracker.is_replication_enabled() {
            let remove_payloads: Vec<Payload> = ids
                .iter()
                .map(|&id| Payload {
                    id,
                    handle: Handle::default(),
                })
                .collect();
            self.mirror_to_passive(&remove_payloads, &[], cancel);
        }

        Ok(())
    }

    /// Applies `added`/`updated`/`removed`/`re_added` against the passive
    /// side via a distinct hashmap instance, in order. Every error and
    /// the eventual close error are accumulated, with the first one
    /// taking precedence so a close-path error never masks a real
    /// operation error (spec.md §4.F `Replicate`).
    pub fn replicate(
        &self,
        added: &[Payload],
        updated: &[Payload],
        removed: &[Id],
        re_added: &[Payload],
        cancel: &CancellationToken,
    ) -> Result<()> {
        let map = self.passive_map();
        let mut first_err: Option<Error> = None;

        for payload in added.iter().chain(updated.iter()).chain(re_added.iter()) {
            if let Err(e) = map.set(payload.id, &payload.handle, cancel) {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }

        for &id in removed {
            if let Err(e) = map.set(id, &Handle::default(), cancel) {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }

        let close_err = map.close().err();

        match first_err {
            Some(e) => Err(e),
            None => close_err.map_or(Ok(()), Err),
        }
    }

    /// Best-effort passive mirror used internally by `Add`/`Remove`: a
    /// failure here never fails the caller's operation, it only marks
    /// the tracker (spec.md §4.D).
    fn mirror_to_passive(&self, writes: &[Payload], removed: &[Id], cancel: &CancellationToken) {
        let map = self.passive_map();

        for payload in writes {
            if let Err(e) = map.set(payload.id, &payload.handle, cancel) {
                log::warn!("passive mirror failed for {}: {e}", payload.id);
                let _ = self.tracker.handle_replication_related_error(&e, true, cancel, &self.l2);
            }
        }
        for &id in removed {
            if let Err(e) = map.set(id, &Handle::default(), cancel) {
                log::warn!("passive mirror removal failed for {id}: {e}");
                let _ = self.tracker.handle_replication_related_error(&e, true, cancel, &self.l2);
            }
        }

        let _ = map.close();
    }

    /// No underlying resources are held between calls, so this is
    /// currently a no-op kept for API parity with the hashmap's own
    /// `close` (spec.md §4.F `Close`).
    pub fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        block::SLOTS_PER_BLOCK,
        config::Config,
        direct_io::sim::{SimDirectIo, SimMode},
        l2::mock::MockL2Cache,
    };

    fn registry(base_a: &std::path::Path, base_b: &std::path::Path) -> Registry<SimDirectIo, MockL2Cache> {
        let tracker = Arc::new(ReplicationTracker::open(base_a, base_b, true).unwrap());
        Registry::new(
            "widgets",
            Config::new().mod_value(16),
            SimDirectIo::new(SimMode::Normal),
            MockL2Cache::new(),
            tracker,
        )
    }

    /// Ids that all hash to block 0 but spread across distinct ideal slots
    /// within it, one per multiple of `mod_value` — mirrors the hashmap's
    /// own collision fixture.
    fn same_block_ids(mod_value: u128, count: usize) -> Vec<Id> {
        (0..count as u128).map(|i| Id::from_u128(i * mod_value)).collect()
    }

    #[test]
    fn add_then_fetch_round_trips() -> Result<()> {
        let a = tempfile::tempdir()?;
        let b = tempfile::tempdir()?;
        let reg = registry(a.path(), b.path());
        let cancel = CancellationToken::new();

        let id = Id::from_u128(7);
        let handle = Handle {
            logical_id: id,
            version: 1,
            ..Default::default()
        };

        reg.add(&[Payload { id, handle }], &cancel)?;
        let fetched = reg.fetch(&[id], &cancel)?;
        assert_eq!(fetched, vec![handle]);
        Ok(())
    }

    #[test]
    fn add_failure_is_routed_through_the_tracker() -> Result<()> {
        let a = tempfile::tempdir()?;
        let b = tempfile::tempdir()?;
        let tracker = Arc::new(ReplicationTracker::open(a.path(), b.path(), false).unwrap());
        let reg = Registry::new(
            "widgets",
            Config::new().mod_value(16),
            SimDirectIo::new(SimMode::ErrorAlways),
            MockL2Cache::new(),
            tracker.clone(),
        );
        let cancel = CancellationToken::new();

        assert!(!tracker.global_snapshot().failed_to_replicate);

        let id = Id::from_u128(1);
        let handle = Handle {
            logical_id: id,
            ..Default::default()
        };
        let err = reg
            .add(&[Payload { id, handle }], &cancel)
            .expect_err("every block read/write fails under ErrorAlways");
        assert!(matches!(err, Error::FailoverQualified));

        assert!(
            tracker.global_snapshot().failed_to_replicate,
            "a qualifying storage failure must reach the tracker even when there was nothing to roll back"
        );
        Ok(())
    }

    #[test]
    fn remove_zeroes_the_slot() -> Result<()> {
        let a = tempfile::tempdir()?;
        let b = tempfile::tempdir()?;
        let reg = registry(a.path(), b.path());
        let cancel = CancellationToken::new();

        let id = Id::from_u128(9);
        reg.add(
            &[Payload {
                id,
                handle: Handle {
                    logical_id: id,
                    ..Default::default()
                },
            }],
            &cancel,
        )?;
        reg.remove(&[id], &cancel)?;

        assert!(reg.fetch(&[id], &cancel)?.is_empty());
        Ok(())
    }

    #[test]
    fn update_no_locks_all_or_nothing_aborts_on_first_failure() -> Result<()> {
        let a = tempfile::tempdir()?;
        let b = tempfile::tempdir()?;
        let l2 = MockL2Cache::new();
        let tracker = Arc::new(ReplicationTracker::open(a.path(), b.path(), false).unwrap());
        let reg = Registry::new("widgets", Config::new().mod_value(16), SimDirectIo::new(SimMode::Normal), l2.clone(), tracker);
        let cancel = CancellationToken::new();

        // Fill block 0 completely so the overflow id can only be placed
        // by opening a second segment file, which needs the preallocation
        // lock.
        let ids = same_block_ids(16, SLOTS_PER_BLOCK + 1);
        let fillers: Vec<Payload> = ids[..SLOTS_PER_BLOCK]
            .iter()
            .map(|&id| Payload {
                id,
                handle: Handle {
                    logical_id: id,
                    ..Default::default()
                },
            })
            .collect();
        reg.add(&fillers, &cancel)?;

        let overflow_id = ids[SLOTS_PER_BLOCK];
        let other_id = Id::from_u128(999_999);

        l2.set_deny_locks(true);
        let payloads = [
            Payload {
                id: overflow_id,
                handle: Handle {
                    logical_id: overflow_id,
                    ..Default::default()
                },
            },
            Payload {
                id: other_id,
                handle: Handle {
                    logical_id: other_id,
                    ..Default::default()
                },
            },
        ];

        let err = reg
            .update_no_locks(true, &payloads, &cancel)
            .expect_err("lock denial must surface immediately");
        assert!(matches!(err, Error::LockConflict));

        l2.set_deny_locks(false);
        assert!(
            reg.fetch(&[other_id], &cancel)?.is_empty(),
            "all_or_nothing must abort before attempting later payloads"
        );
        Ok(())
    }

    #[test]
    fn update_no_locks_best_effort_still_surfaces_the_first_error() -> Result<()> {
        let a = tempfile::tempdir()?;
        let b = tempfile::tempdir()?;
        let l2 = MockL2Cache::new();
        let tracker = Arc::new(ReplicationTracker::open(a.path(), b.path(), false).unwrap());
        let reg = Registry::new("widgets", Config::new().mod_value(16), SimDirectIo::new(SimMode::Normal), l2.clone(), tracker);
        let cancel = CancellationToken::new();

        let ids = same_block_ids(16, SLOTS_PER_BLOCK + 1);
        let fillers: Vec<Payload> = ids[..SLOTS_PER_BLOCK]
            .iter()
            .map(|&id| Payload {
                id,
                handle: Handle {
                    logical_id: id,
                    ..Default::default()
                },
            })
            .collect();
        reg.add(&fillers, &cancel)?;

        let overflow_id = ids[SLOTS_PER_BLOCK];
        let other_id = Id::from_u128(999_999);
        let other_handle = Handle {
            logical_id: other_id,
            version: 1,
            ..Default::default()
        };

        l2.set_deny_locks(true);
        let payloads = [
            Payload {
                id: overflow_id,
                handle: Handle {
                    logical_id: overflow_id,
                    ..Default::default()
                },
            },
            Payload {
                id: other_id,
                handle: other_handle,
            },
        ];

        let err = reg
            .update_no_locks(false, &payloads, &cancel)
            .expect_err("the overflow failure must still be surfaced even in best-effort mode");
        assert!(matches!(err, Error::LockConflict));

        l2.set_deny_locks(false);
        let fetched = reg.fetch(&[other_id], &cancel)?;
        assert_eq!(fetched, vec![other_handle], "best-effort mode must still attempt payloads after a failure");
        Ok(())
    }
}
