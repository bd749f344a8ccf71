// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Transactional multi-store metadata (spec.md §4.G).

use super::info::StoreInfo;
use crate::{
    atomic_file,
    cancellation::CancellationToken,
    config::Config,
    error::{Error, Result},
    l2::{L2Cache, STORE_LIST_LOCK_KEY},
    replication::{ReplicationAwareIo, ReplicationTracker},
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::Instant,
};

const STORE_LIST_FILE: &str = "storelist.txt";
const HASH_MOD_FILE: &str = "reghashmod.txt";

struct ListLockGuard<'a, L2: L2Cache> {
    l2: &'a L2,
}

impl<L2: L2Cache> Drop for ListLockGuard<'_, L2> {
    fn drop(&mut self) {
        let keys = self.l2.create_lock_keys(&[STORE_LIST_LOCK_KEY]);
        let _ = self.l2.unlock(&keys);
    }
}

/// Named-store metadata: the store list and the per-store info files
/// (spec.md §3 "Store info", "Store list", §4.G).
///
/// Caches both the store list and per-store info in memory, falling back
/// to disk on a cache miss. Mutations go through the store-list advisory
/// lock so concurrent repositories across processes do not interleave
/// list updates.
pub struct StoreRepository<L2: L2Cache> {
    tracker: Arc<ReplicationTracker>,
    l2: Arc<L2>,
    config: Config,
    list_cache: Mutex<Option<Vec<String>>>,
    info_cache: Mutex<HashMap<String, StoreInfo>>,
}

impl<L2: L2Cache> StoreRepository<L2> {
    /// Opens a repository sharing `tracker` with the tables it indexes.
    pub fn new(tracker: Arc<ReplicationTracker>, l2: L2, config: Config) -> Self {
        Self {
            tracker,
            l2: Arc::new(l2),
            config,
            list_cache: Mutex::new(None),
            info_cache: Mutex::new(HashMap::new()),
        }
    }

    fn lock_list(&self, cancel: &CancellationToken) -> Result<ListLockGuard<'_, L2>> {
        let deadline = Instant::now() + self.config.lock_timeout;
        loop {
            cancel.check()?;
            let keys = self.l2.create_lock_keys(&[STORE_LIST_LOCK_KEY]);
            let (ok, _owner) = self.l2.lock(&keys, self.config.lock_timeout)?;
            if ok {
                return Ok(ListLockGuard { l2: &self.l2 });
            }
            if Instant::now() >= deadline {
                return Err(Error::LockConflict);
            }
            std::thread::sleep(self.config.lock_retry_interval);
        }
    }

    fn list_path(&self) -> std::path::PathBuf {
        self.tracker.active_folder().join(STORE_LIST_FILE)
    }

    fn info_path(&self, name: &str) -> std::path::PathBuf {
        self.tracker.active_folder().join(StoreInfo::relative_path(name))
    }

    fn load_list_from_disk(&self) -> Result<Vec<String>> {
        Ok(atomic_file::read_json::<Vec<String>>(&self.list_path(), "storelist.txt")?.unwrap_or_default())
    }

    fn load_info_from_disk(&self, name: &str) -> Result<Option<StoreInfo>> {
        atomic_file::read_json(&self.info_path(name), "storeinfo.txt")
    }

    /// Creates each store's folder, writes its info file, and appends it
    /// to the store list. Refuses duplicates, whether against the
    /// existing list or within `stores` itself (spec.md §4.G `Add`).
    pub fn add(&self, stores: &[StoreInfo], cancel: &CancellationToken) -> Result<()> {
        let _guard = self.lock_list(cancel)?;
        let mut list = self.load_list_from_disk()?;

        for store in stores {
            if list.contains(&store.name) {
                return Err(Error::AlreadyExists);
            }
        }
        for (i, store) in stores.iter().enumerate() {
            if stores[..i].iter().any(|s| s.name == store.name) {
                return Err(Error::AlreadyExists);
            }
        }

        let io = ReplicationAwareIo::new(&self.tracker);
        for store in stores {
            io.create_store(&store.name)?;
            let bytes = serde_json::to_vec(store).map_err(|_| Error::Corrupt("storeinfo.txt"))?;
            io.write(&StoreInfo::relative_path(&store.name), &bytes)?;
            list.push(store.name.clone());
        }

        let list_bytes = serde_json::to_vec(&list).map_err(|_| Error::Corrupt("storelist.txt"))?;
        io.write(STORE_LIST_FILE, &list_bytes)?;

        *self.list_cache.lock().expect("lock poisoned") = Some(list);
        let mut info_cache = self.info_cache.lock().expect("lock poisoned");
        for store in stores {
            info_cache.insert(store.name.clone(), store.clone());
        }

        Ok(())
    }

    /// Removes `name` from the store list and deletes its info file
    /// (spec.md §4.G `Remove`). A no-op if `name` is already absent.
    pub fn remove(&self, name: &str, cancel: &CancellationToken) -> Result<()> {
        let _guard = self.lock_list(cancel)?;
        let mut list = self.load_list_from_disk()?;
        list.retain(|n| n != name);

        let io = ReplicationAwareIo::new(&self.tracker);
        io.remove(&StoreInfo::relative_path(name))?;

        let list_bytes = serde_json::to_vec(&list).map_err(|_| Error::Corrupt("storelist.txt"))?;
        io.write(STORE_LIST_FILE, &list_bytes)?;

        *self.list_cache.lock().expect("lock poisoned") = Some(list);
        self.info_cache.lock().expect("lock poisoned").remove(name);

        Ok(())
    }

    /// Reads `name`'s info, through the cache (spec.md §4.G `Get`).
    /// `Ok(None)` if the store does not exist.
    pub fn get(&self, name: &str) -> Result<Option<StoreInfo>> {
        if let Some(info) = self.info_cache.lock().expect("lock poisoned").get(name) {
            return Ok(Some(info.clone()));
        }

        let info = self.load_info_from_disk(name)?;
        if let Some(info) = &info {
            self.info_cache
                .lock()
                .expect("lock poisoned")
                .insert(name.to_string(), info.clone());
        }
        Ok(info)
    }

    /// Reads every store currently in the list (spec.md §4.G `GetAll`). An
    /// absent list file is an empty result, not an error.
    pub fn get_all(&self) -> Result<Vec<StoreInfo>> {
        let names = {
            let mut cache = self.list_cache.lock().expect("lock poisoned");
            if cache.is_none() {
                *cache = Some(self.load_list_from_disk()?);
            }
            cache.clone().unwrap_or_default()
        };

        let mut out = Vec::with_capacity(names.len());
        for name in &names {
            if let Some(info) = self.get(name)? {
                out.push(info);
            }
        }
        Ok(out)
    }

    /// Applies a signed `CountDelta` to each named store in order,
    /// returning the updated records. On the k-th failure, undoes stores
    /// `0..k` by writing their prior bytes back and surfaces the original
    /// error (spec.md §4.G `Update`, invariant 10). If the first missing
    /// store is encountered before any write, returns an empty result
    /// rather than an error.
    pub fn update(&self, deltas: &[(String, i64)]) -> Result<Vec<StoreInfo>> {
        let io = ReplicationAwareIo::new(&self.tracker);
        let mut applied: Vec<(String, Vec<u8>)> = Vec::with_capacity(deltas.len());
        let mut updated = Vec::with_capacity(deltas.len());

        for (name, delta) in deltas {
            let Some(mut info) = self.get(name)? else {
                self.undo(&io, &applied);
                return Ok(Vec::new());
            };

            let prior_bytes = serde_json::to_vec(&info).map_err(|_| Error::Corrupt("storeinfo.txt"))?;
            info.apply_count_delta(*delta);

            let new_bytes = serde_json::to_vec(&info).map_err(|_| Error::Corrupt("storeinfo.txt"))?;
            if let Err(e) = io.write(&StoreInfo::relative_path(name), &new_bytes) {
                self.undo(&io, &applied);
                return Err(e);
            }

            self.info_cache
                .lock()
                .expect("lock poisoned")
                .insert(name.clone(), info.clone());
            applied.push((name.clone(), prior_bytes));
            updated.push(info);
        }

        Ok(updated)
    }

    fn undo(&self, io: &ReplicationAwareIo<'_>, applied: &[(String, Vec<u8>)]) {
        for (name, prior_bytes) in applied {
            if let Err(e) = io.write(&StoreInfo::relative_path(name), prior_bytes) {
                log::warn!("undo write failed for store {name} (primary error still returned): {e}");
            } else if let Ok(info) = serde_json::from_slice::<StoreInfo>(prior_bytes) {
                self.info_cache.lock().expect("lock poisoned").insert(name.clone(), info);
            }
        }
    }

    /// Bulk-copies every store's metadata and each table's segment files
    /// from the active base to the passive base, regardless of whether
    /// replication is currently enabled (spec.md §4.G
    /// `CopyToPassiveFolders`).
    pub fn copy_to_passive_folders(&self) -> Result<()> {
        let original_active = self.tracker.active_folder().to_path_buf();
        let original_passive = self.tracker.passive_folder().to_path_buf();

        // Gather everything from the real active side before flipping:
        // once flipped, `active_folder()` points at `original_passive`,
        // which is exactly the side we are about to write to.
        let stores = self.get_all()?;
        let names = stores.iter().map(|s| s.name.clone()).collect::<Vec<_>>();

        {
            let _guard = self.tracker.force_toggle_for_copy();
            let io = ReplicationAwareIo::new(&self.tracker);

            let list_bytes = serde_json::to_vec(&names).map_err(|_| Error::Corrupt("storelist.txt"))?;
            io.write(STORE_LIST_FILE, &list_bytes)?;

            for store in &stores {
                let bytes = serde_json::to_vec(store).map_err(|_| Error::Corrupt("storeinfo.txt"))?;
                io.write(&StoreInfo::relative_path(&store.name), &bytes)?;
            }
        }

        for info in &stores {
            let src_dir = original_active.join(&info.registry_table);
            if !src_dir.is_dir() {
                continue;
            }
            let dst_dir = original_passive.join(&info.registry_table);
            std::fs::create_dir_all(&dst_dir)?;

            for entry in std::fs::read_dir(&src_dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.extension().and_then(std::ffi::OsStr::to_str) != Some("reg") {
                    continue;
                }
                std::fs::copy(&path, dst_dir.join(entry.file_name()))?;
            }
        }

        Ok(())
    }

    /// Reads and parses the registry hash mod value from `reghashmod.txt`
    /// on the active base (spec.md §4.G `GetRegistryHashModValue`).
    pub fn get_registry_hash_mod_value(&self) -> Result<u32> {
        let path = self.tracker.active_folder().join(HASH_MOD_FILE);
        let bytes = std::fs::read(&path)?;
        std::str::from_utf8(&bytes)
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok())
            .ok_or(Error::Corrupt("reghashmod.txt"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::l2::mock::MockL2Cache;

    fn repo(base_a: &std::path::Path, base_b: &std::path::Path) -> StoreRepository<MockL2Cache> {
        let tracker = Arc::new(ReplicationTracker::open(base_a, base_b, true).unwrap());
        StoreRepository::new(tracker, MockL2Cache::new(), Config::new())
    }

    fn info(name: &str) -> StoreInfo {
        StoreInfo {
            name: name.to_string(),
            slot_length: 64,
            count: 0,
            cache_policy: "lru".into(),
            registry_table: name.to_string(),
            timestamp: 0,
            cache_duration_secs: 60,
        }
    }

    #[test]
    fn add_then_get_round_trips() -> Result<()> {
        let a = tempfile::tempdir()?;
        let b = tempfile::tempdir()?;
        let repo = repo(a.path(), b.path());
        let cancel = CancellationToken::new();

        repo.add(&[info("widgets")], &cancel)?;
        assert_eq!(repo.get("widgets")?, Some(info("widgets")));
        assert_eq!(repo.get_all()?, vec![info("widgets")]);
        Ok(())
    }

    #[test]
    fn add_refuses_duplicate_against_existing_list() -> Result<()> {
        let a = tempfile::tempdir()?;
        let b = tempfile::tempdir()?;
        let repo = repo(a.path(), b.path());
        let cancel = CancellationToken::new();

        repo.add(&[info("widgets")], &cancel)?;
        let err = repo.add(&[info("widgets")], &cancel).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists));
        Ok(())
    }

    #[test]
    fn add_refuses_duplicate_within_same_call() -> Result<()> {
        let a = tempfile::tempdir()?;
        let b = tempfile::tempdir()?;
        let repo = repo(a.path(), b.path());
        let cancel = CancellationToken::new();

        let err = repo.add(&[info("widgets"), info("widgets")], &cancel).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists));
        Ok(())
    }

    #[test]
    fn get_all_is_empty_when_list_file_is_absent() -> Result<()> {
        let a = tempfile::tempdir()?;
        let b = tempfile::tempdir()?;
        let repo = repo(a.path(), b.path());
        assert!(repo.get_all()?.is_empty());
        Ok(())
    }

    #[test]
    fn remove_drops_the_store_from_the_list() -> Result<()> {
        let a = tempfile::tempdir()?;
        let b = tempfile::tempdir()?;
        let repo = repo(a.path(), b.path());
        let cancel = CancellationToken::new();

        repo.add(&[info("widgets")], &cancel)?;
        repo.remove("widgets", &cancel)?;

        assert!(repo.get("widgets")?.is_none());
        assert!(repo.get_all()?.is_empty());
        Ok(())
    }

    #[test]
    fn update_advances_count_and_returns_updated_records() -> Result<()> {
        let a = tempfile::tempdir()?;
        let b = tempfile::tempdir()?;
        let repo = repo(a.path(), b.path());
        let cancel = CancellationToken::new();

        repo.add(&[info("widgets")], &cancel)?;
        let updated = repo.update(&[("widgets".to_string(), 3)])?;

        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0].count, 3);
        assert_eq!(repo.get("widgets")?.unwrap().count, 3);
        Ok(())
    }

    #[test]
    fn update_returns_empty_when_a_store_is_missing() -> Result<()> {
        let a = tempfile::tempdir()?;
        let b = tempfile::tempdir()?;
        let repo = repo(a.path(), b.path());
        let cancel = CancellationToken::new();

        repo.add(&[info("widgets")], &cancel)?;
        let updated = repo.update(&[
            ("widgets".to_string(), 3),
            ("ghosts".to_string(), 1),
        ])?;

        assert!(updated.is_empty());
        // The first item's on-disk count must be restored, not left advanced.
        assert_eq!(repo.get("widgets")?.unwrap().count, 0);
        Ok(())
    }

    #[test]
    fn get_registry_hash_mod_value_parses_the_file() -> Result<()> {
        let a = tempfile::tempdir()?;
        let b = tempfile::tempdir()?;
        std::fs::write(a.path().join("reghashmod.txt"), b"1024")?;
        let repo = repo(a.path(), b.path());

        assert_eq!(repo.get_registry_hash_mod_value()?, 1024);
        Ok(())
    }

    #[test]
    fn copy_to_passive_folders_copies_only_registry_files() -> Result<()> {
        let a = tempfile::tempdir()?;
        let b = tempfile::tempdir()?;
        let repo = repo(a.path(), b.path());
        let cancel = CancellationToken::new();

        repo.add(&[info("widgets")], &cancel)?;
        let table_dir = a.path().join("widgets");
        std::fs::create_dir_all(&table_dir)?;
        std::fs::write(table_dir.join("widgets-1.reg"), [0u8; 16])?;
        std::fs::write(table_dir.join("notes.txt"), b"not a segment")?;

        repo.copy_to_passive_folders()?;

        assert!(b.path().join("widgets/storeinfo.txt").exists());
        assert!(b.path().join("widgets/widgets-1.reg").exists());
        assert!(!b.path().join("widgets/notes.txt").exists());
        Ok(())
    }
}
