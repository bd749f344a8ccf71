// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The segment-file hash map (spec.md §4.C "The hard part").
//!
//! Maps a 128-bit [`Id`] to a fixed-width [`Handle`] inside a table's
//! sequence of page-aligned segment files, using open addressing with
//! linear probing (wrapping within a block, never across blocks).

use crate::{
    block::{Block, SLOTS_PER_BLOCK},
    cancellation::CancellationToken,
    config::Config,
    direct_io::{DirectIo, OpenFlags},
    error::{Error, Result},
    handle::Handle,
    id::Id,
    l2::{L2Cache, PREALLOCATE_FILE_LOCK_KEY},
};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Mutex,
    time::Instant,
};

/// Where a Handle slot for a given [`Id`] lives, or would be written.
#[derive(Clone, Debug)]
pub struct FileRegion {
    /// 1-based segment file number
    pub segment: u32,
    /// Byte offset of the block within the segment file
    pub block_offset: u64,
    /// Slot index within the block (`0..SLOTS_PER_BLOCK`)
    pub slot_offset_in_block: usize,
    /// The handle currently occupying the slot (all-zero/free if vacant)
    pub handle: Handle,
}

/// Derives the block index and ideal slot for `id` under a given mod value
/// (spec.md §4.C placement function). The two 64-bit halves of the ID are
/// XORed together so the whole 128 bits participate in the hash.
#[must_use]
pub fn placement(id: Id, mod_value: u32) -> (u32, u64, usize) {
    let (hi, lo) = id.halves();
    let hash = hi ^ lo;
    let block_index = (hash % u64::from(mod_value)) as u32;
    let block_offset = block_index as u64 * crate::block::BLOCK_SIZE as u64;
    let ideal_slot = ((hash / u64::from(mod_value)) % SLOTS_PER_BLOCK as u64) as usize;
    (block_index, block_offset, ideal_slot)
}

enum ScanResult {
    /// `id` already occupies this slot
    Found(usize),
    /// This slot is free and is the first free slot found, starting at the
    /// ideal slot and wrapping
    Free(usize),
    /// Every slot holds some other id
    Full,
}

/// Classifies a failed direct I/O call against a segment file as
/// failover-qualified: a genuine read/write/open/truncate failure on the
/// active side is exactly the kind of storage fault the replication
/// tracker exists to react to (spec.md §2, §4.F), so it surfaces as
/// `Error::FailoverQualified` rather than an opaque `Error::Io`.
fn qualify_storage_error(e: std::io::Error) -> Error {
    log::warn!("segment file I/O failed, qualifying for failover: {e}");
    Error::FailoverQualified
}

fn scan_block(block: &Block, ideal_slot: usize, id: Id) -> Result<ScanResult> {
    let mut first_free = None;
    for k in 0..SLOTS_PER_BLOCK {
        let idx = (ideal_slot + k) % SLOTS_PER_BLOCK;
        let h = block.read_slot(idx)?;
        if h.is_free() {
            if first_free.is_none() {
                first_free = Some(idx);
            }
            continue;
        }
        if h.logical_id == id {
            return Ok(ScanResult::Found(idx));
        }
    }
    Ok(first_free.map_or(ScanResult::Full, ScanResult::Free))
}

struct BlockLockGuard<'a, L2: L2Cache> {
    l2: &'a L2,
    key: String,
}

impl<'a, L2: L2Cache> Drop for BlockLockGuard<'a, L2> {
    fn drop(&mut self) {
        let keys = self.l2.create_lock_keys(&[self.key.as_str()]);
        let _ = self.l2.unlock(&keys);
    }
}

/// A table's sequence of segment files, addressed by [`Id`].
///
/// Owns every segment file handle it opens; [`SegmentHashMap::close`]
/// closes them all. A second `close` is a no-op.
pub struct SegmentHashMap<IO: DirectIo, L2: L2Cache> {
    table: String,
    base_dir: PathBuf,
    config: Config,
    io: IO,
    l2: L2,
    open_files: Mutex<HashMap<u32, IO::File>>,
}

impl<IO: DirectIo, L2: L2Cache> SegmentHashMap<IO, L2> {
    /// Opens (without yet creating any segment file) the hashmap for
    /// `table` rooted at `base_dir`.
    pub fn new(base_dir: impl Into<PathBuf>, table: impl Into<String>, config: Config, io: IO, l2: L2) -> Self {
        Self {
            table: table.into(),
            base_dir: base_dir.into(),
            config,
            io,
            l2,
            open_files: Mutex::new(HashMap::new()),
        }
    }

    /// The table name this hashmap was opened for.
    #[must_use]
    pub fn table(&self) -> &str {
        &self.table
    }

    fn table_dir(&self) -> PathBuf {
        self.base_dir.join(&self.table)
    }

    fn segment_path(&self, segment: u32) -> PathBuf {
        self.table_dir().join(format!("{}-{segment}.reg", self.table))
    }

    /// Reads the handles for `ids`, skipping any id that has no Handle on
    /// disk (spec.md §4.C `fetch`). The internal "not found" sentinel never
    /// escapes this function: a missing id is simply absent from the
    /// result, every other error is propagated.
    pub fn fetch(&self, ids: &[Id], cancel: &CancellationToken) -> Result<Vec<Handle>> {
        let mut out = Vec::with_capacity(ids.len());
        for &id in ids {
            cancel.check()?;
            if let Some(region) = self.find_one_file_region(false, id, cancel)? {
                out.push(region.handle);
            }
        }
        Ok(out)
    }

    /// Writes `handle` for `id`, acquiring the per-block advisory lock
    /// around the read-modify-write (spec.md §4.C `set`). Returns the
    /// handle that occupied the slot beforehand (the free-slot sentinel if
    /// it was empty), so callers can roll back to the prior value rather
    /// than to a blanket default.
    pub fn set(&self, id: Id, handle: &Handle, cancel: &CancellationToken) -> Result<Handle> {
        self.set_impl(id, handle, cancel, true)
    }

    /// Like [`SegmentHashMap::set`] but skips the per-block advisory lock,
    /// for callers that already hold a broader lock (spec.md §7
    /// `UpdateNoLocks`).
    pub fn set_no_lock(&self, id: Id, handle: &Handle, cancel: &CancellationToken) -> Result<Handle> {
        self.set_impl(id, handle, cancel, false)
    }

    /// Closes every segment file this hashmap opened. Idempotent.
    pub fn close(&self) -> Result<()> {
        let mut open = self.open_files.lock().expect("lock poisoned");
        for (_, file) in open.drain() {
            self.io.close(file)?;
        }
        Ok(())
    }

    /// Locates the file region for `id`.
    ///
    /// `for_writing = false` is the read path: returns `Ok(None)` when no
    /// segment holds `id` (internal not-found sentinel, collapsed to
    /// `None` rather than propagated as an `Error`). `for_writing = true`
    /// always returns `Ok(Some(_))` or an error — it creates a new segment
    /// file if every existing one is full.
    pub fn find_one_file_region(
        &self,
        for_writing: bool,
        id: Id,
        cancel: &CancellationToken,
    ) -> Result<Option<FileRegion>> {
        let (_, block_offset, ideal_slot) = placement(id, self.config.mod_value_get());
        let full_size = self.config.segment_file_size();
        let mut segment = 1u32;

        loop {
            cancel.check()?;
            let path = self.segment_path(segment);
            let existing_len = self.io.stat(&path).map_err(qualify_storage_error)?;

            if for_writing && existing_len.map_or(true, |len| len < full_size) {
                let region = self.setup_new_file(segment, ideal_slot, block_offset, cancel)?;
                return Ok(Some(region));
            }

            if !for_writing && existing_len.is_none() {
                return Ok(None);
            }

            let flags = if for_writing {
                OpenFlags::read_write()
            } else {
                OpenFlags::read_only()
            };
            let block = self.read_block(segment, flags, block_offset)?;

            match scan_block(&block, ideal_slot, id)? {
                ScanResult::Found(idx) => {
                    let handle = block.read_slot(idx)?;
                    return Ok(Some(FileRegion {
                        segment,
                        block_offset,
                        slot_offset_in_block: idx,
                        handle,
                    }));
                }
                ScanResult::Free(idx) => {
                    if for_writing {
                        return Ok(Some(FileRegion {
                            segment,
                            block_offset,
                            slot_offset_in_block: idx,
                            handle: Handle::default(),
                        }));
                    }
                    return Ok(None);
                }
                ScanResult::Full => {
                    segment += 1;
                }
            }
        }
    }

    fn set_impl(&self, id: Id, handle: &Handle, cancel: &CancellationToken, use_lock: bool) -> Result<Handle> {
        let (_, block_offset, ideal_slot) = placement(id, self.config.mod_value_get());
        let full_size = self.config.segment_file_size();
        let mut segment = 1u32;

        loop {
            cancel.check()?;
            let path = self.segment_path(segment);
            let existing_len = self.io.stat(&path).map_err(qualify_storage_error)?;

            if existing_len.map_or(true, |len| len < full_size) {
                self.setup_new_file(segment, ideal_slot, block_offset, cancel)?;
                let _guard = self.lock_block(use_lock, segment, block_offset, cancel)?;
                let mut block = self.read_block(segment, OpenFlags::read_write(), block_offset)?;
                block.write_slot(ideal_slot, handle)?;
                self.write_block(segment, block_offset, &block)?;
                return Ok(Handle::default());
            }

            let _guard = self.lock_block(use_lock, segment, block_offset, cancel)?;
            let mut block = self.read_block(segment, OpenFlags::read_write(), block_offset)?;

            match scan_block(&block, ideal_slot, id)? {
                ScanResult::Found(idx) => {
                    let prior = block.read_slot(idx)?;
                    block.write_slot(idx, handle)?;
                    self.write_block(segment, block_offset, &block)?;
                    return Ok(prior);
                }
                ScanResult::Free(idx) => {
                    block.write_slot(idx, handle)?;
                    self.write_block(segment, block_offset, &block)?;
                    return Ok(Handle::default());
                }
                ScanResult::Full => {
                    drop(_guard);
                    segment += 1;
                }
            }
        }
    }

    fn lock_block(
        &self,
        use_lock: bool,
        segment: u32,
        block_offset: u64,
        cancel: &CancellationToken,
    ) -> Result<Option<BlockLockGuard<'_, L2>>> {
        if !use_lock {
            return Ok(None);
        }
        let key = format!("{}/{segment}/{block_offset}", self.table);
        let deadline = Instant::now() + self.config.lock_timeout;
        loop {
            cancel.check()?;
            let keys = self.l2.create_lock_keys(&[key.as_str()]);
            let (ok, _owner) = self.l2.lock(&keys, self.config.lock_timeout)?;
            if ok {
                return Ok(Some(BlockLockGuard { l2: &self.l2, key }));
            }
            if Instant::now() >= deadline {
                return Err(Error::LockConflict);
            }
            std::thread::sleep(self.config.lock_retry_interval);
        }
    }

    /// Preallocates segment file `segment` to the configured full size,
    /// guarded by the shared preallocation lock (spec.md §4.C
    /// `setupNewFile`). Creates no file and truncates nothing if the lock
    /// cannot be acquired.
    fn setup_new_file(
        &self,
        segment: u32,
        ideal_slot: usize,
        block_offset: u64,
        cancel: &CancellationToken,
    ) -> Result<FileRegion> {
        cancel.check()?;
        let keys = self.l2.create_lock_keys(&[PREALLOCATE_FILE_LOCK_KEY]);
        let (ok, _owner) = self.l2.lock(&keys, self.config.lock_timeout)?;
        if !ok {
            return Err(Error::LockConflict);
        }

        let result = (|| -> Result<FileRegion> {
            let path = self.segment_path(segment);
            std::fs::create_dir_all(self.table_dir())?;

            // A second caller may have lost the race but won the lock
            // afterwards; re-check under the lock before truncating.
            let existing_len = self.io.stat(&path).map_err(qualify_storage_error)?;
            let full_size = self.config.segment_file_size();
            if existing_len != Some(full_size) {
                let file = self.io.open(&path, OpenFlags::create_read_write()).map_err(qualify_storage_error)?;
                self.io.set_len(&file, full_size).map_err(qualify_storage_error)?;
                self.open_files.lock().expect("lock poisoned").insert(segment, file);
            }

            Ok(FileRegion {
                segment,
                block_offset,
                slot_offset_in_block: ideal_slot,
                handle: Handle::default(),
            })
        })();

        self.l2.unlock(&keys)?;
        result
    }

    fn open_segment(&self, segment: u32, flags: OpenFlags) -> Result<()> {
        let mut open = self.open_files.lock().expect("lock poisoned");
        if open.contains_key(&segment) {
            return Ok(());
        }
        let path = self.segment_path(segment);
        let file = self.io.open(&path, flags).map_err(qualify_storage_error)?;
        open.insert(segment, file);
        Ok(())
    }

    fn read_block(&self, segment: u32, flags: OpenFlags, block_offset: u64) -> Result<Block> {
        self.open_segment(segment, flags)?;
        let open = self.open_files.lock().expect("lock poisoned");
        let file = open.get(&segment).expect("segment just opened");

        let mut buf = [0u8; crate::block::BLOCK_SIZE];
        let n = self.io.read_at(file, &mut buf, block_offset).map_err(qualify_storage_error)?;
        if n != buf.len() {
            return Err(Error::PartialRead);
        }
        Ok(Block::from_bytes(buf))
    }

    fn write_block(&self, segment: u32, block_offset: u64, block: &Block) -> Result<()> {
        let open = self.open_files.lock().expect("lock poisoned");
        let file = open.get(&segment).expect("segment must be open before writing");
        let n = self.io.write_at(file, block.as_bytes(), block_offset).map_err(qualify_storage_error)?;
        if n != block.as_bytes().len() {
            return Err(Error::PartialRead);
        }
        Ok(())
    }
}

/// Resolves the directory a table's segment files live under, relative to
/// a registry's base folder.
#[must_use]
pub fn table_dir(base_dir: &Path, table: &str) -> PathBuf {
    base_dir.join(table)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{direct_io::sim::{SimDirectIo, SimMode}, l2::mock::MockL2Cache};

    fn map(config: Config) -> SegmentHashMap<SimDirectIo, MockL2Cache> {
        SegmentHashMap::new(
            PathBuf::from("/base"),
            "widgets",
            config,
            SimDirectIo::new(SimMode::Normal),
            MockL2Cache::new(),
        )
    }

    #[test]
    fn placement_consumes_both_halves() {
        let a = Id::from_u128(0x0000_0000_0000_0001_0000_0000_0000_0000);
        let b = Id::from_u128(0x0000_0000_0000_0000_0000_0000_0000_0001);
        assert_ne!(placement(a, 1024), placement(b, 1024));
    }

    #[test]
    fn add_then_fetch_round_trips() -> Result<()> {
        let hm = map(Config::new().mod_value(16));
        let cancel = CancellationToken::new();
        let id = Id::from_u128(42);
        let handle = Handle {
            logical_id: id,
            version: 1,
            ..Default::default()
        };

        hm.set(id, &handle, &cancel)?;
        let fetched = hm.fetch(&[id], &cancel)?;
        assert_eq!(fetched, vec![handle]);
        Ok(())
    }

    #[test]
    fn fetch_of_unknown_id_is_empty_not_error() -> Result<()> {
        let hm = map(Config::new().mod_value(16));
        let cancel = CancellationToken::new();
        hm.set(Id::from_u128(1), &Handle::default(), &cancel)?;

        let fetched = hm.fetch(&[Id::from_u128(999)], &cancel)?;
        assert!(fetched.is_empty());
        Ok(())
    }

    #[test]
    fn fetch_before_any_write_is_empty() -> Result<()> {
        let hm = map(Config::new().mod_value(16));
        let cancel = CancellationToken::new();
        let fetched = hm.fetch(&[Id::from_u128(7)], &cancel)?;
        assert!(fetched.is_empty());
        Ok(())
    }

    #[test]
    fn set_overwrites_existing_slot_in_place() -> Result<()> {
        let hm = map(Config::new().mod_value(16));
        let cancel = CancellationToken::new();
        let id = Id::from_u128(5);

        let v1 = Handle {
            logical_id: id,
            version: 1,
            ..Default::default()
        };
        let v2 = Handle {
            logical_id: id,
            version: 2,
            ..Default::default()
        };

        hm.set(id, &v1, &cancel)?;
        hm.set(id, &v2, &cancel)?;

        let fetched = hm.fetch(&[id], &cancel)?;
        assert_eq!(fetched, vec![v2]);
        Ok(())
    }

    #[test]
    fn preallocation_lock_denied_leaves_no_segment_file() {
        let l2 = MockL2Cache::new();
        l2.set_deny_locks(true);
        let hm = SegmentHashMap::new(
            PathBuf::from("/base"),
            "widgets",
            Config::new().mod_value(16),
            SimDirectIo::new(SimMode::Normal),
            l2,
        );
        let cancel = CancellationToken::new();

        let err = hm.set(Id::from_u128(1), &Handle::default(), &cancel).unwrap_err();
        assert!(matches!(err, Error::LockConflict));
        assert!(hm.io.stat(&hm.segment_path(1)).unwrap().is_none());
    }

    /// Ids that all hash to block 0 (`id % mod_value == 0`) but spread
    /// across distinct ideal slots within it, one per multiple of
    /// `mod_value`.
    fn same_block_ids(mod_value: u128, count: usize) -> Vec<Id> {
        (0..count as u128).map(|i| Id::from_u128(i * mod_value)).collect()
    }

    #[test]
    fn collision_within_a_block_probes_to_next_free_slot() -> Result<()> {
        let hm = map(Config::new().mod_value(16));
        let cancel = CancellationToken::new();

        let ids = same_block_ids(16, SLOTS_PER_BLOCK);
        for (i, &id) in ids.iter().enumerate() {
            let handle = Handle {
                logical_id: id,
                version: i as u64,
                ..Default::default()
            };
            hm.set(id, &handle, &cancel)?;
        }

        let fetched = hm.fetch(&ids, &cancel)?;
        assert_eq!(fetched.len(), ids.len());
        Ok(())
    }

    #[test]
    fn full_block_advances_to_next_segment() -> Result<()> {
        let hm = map(Config::new().mod_value(16));
        let cancel = CancellationToken::new();

        // One more id than SLOTS_PER_BLOCK, all landing on block 0: the
        // last one must overflow into segment 2.
        let ids = same_block_ids(16, SLOTS_PER_BLOCK + 1);
        for &id in &ids {
            hm.set(
                id,
                &Handle {
                    logical_id: id,
                    ..Default::default()
                },
                &cancel,
            )?;
        }

        let fetched = hm.fetch(&ids, &cancel)?;
        assert_eq!(fetched.len(), ids.len());

        assert!(hm.io.stat(&hm.segment_path(2))?.is_some());
        Ok(())
    }

    #[test]
    fn close_is_idempotent() -> Result<()> {
        let hm = map(Config::new().mod_value(16));
        let cancel = CancellationToken::new();
        hm.set(Id::from_u128(1), &Handle::default(), &cancel)?;
        hm.close()?;
        hm.close()?;
        Ok(())
    }
}
