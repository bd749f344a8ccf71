// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! The external L2 cache surface (spec.md §1 Out-of-scope, §6 "L2 cache
//! surface consumed", §9 "Cyclic references").
//!
//! This is an external collaborator: a distributed key-value store used
//! purely for advisory locking and cross-process coordination. Only the
//! interface is specified here; a real deployment plugs in its own client.

use std::{sync::Arc, time::Duration};

/// Opaque lock key, built via [`L2Cache::create_lock_keys`].
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct LockKey(pub String);

/// Lock key for segment-preallocation, shared by every table
/// (spec.md §6: `L<preallocateFileLockKey>`).
pub const PREALLOCATE_FILE_LOCK_KEY: &str = "preallocate_file_lock";

/// Lock key guarding store-list mutations (spec.md §6: `infs_sr`).
pub const STORE_LIST_LOCK_KEY: &str = "infs_sr";

/// Surface of the distributed L2 cache consumed by the core (spec.md §6).
pub trait L2Cache: Send + Sync {
    /// Attempts to acquire a lock on `keys` with the given owner and ttl.
    ///
    /// Returns `Ok((true, owner))` on success, `Ok((false, _))` on
    /// contention (not an error), or `Err` on a transport failure.
    fn lock(&self, keys: &[LockKey], ttl: Duration) -> std::io::Result<(bool, String)>;

    /// Releases a lock previously acquired with [`L2Cache::lock`].
    fn unlock(&self, keys: &[LockKey]) -> std::io::Result<()>;

    /// Returns whether `keys` are currently locked by anyone.
    fn is_locked(&self, keys: &[LockKey]) -> std::io::Result<bool>;

    /// Reads a struct stored under `key` if present and unexpired.
    fn get_struct_ex(&self, key: &str) -> std::io::Result<Option<Vec<u8>>>;

    /// Stores `value` under `key` with the given ttl.
    fn set(&self, key: &str, value: &[u8], ttl: Duration) -> std::io::Result<()>;

    /// Builds lock keys from plain names.
    fn create_lock_keys(&self, names: &[&str]) -> Vec<LockKey> {
        names.iter().map(|n| LockKey((*n).to_string())).collect()
    }
}

/// Lets a shared L2 client be cloned cheaply by sharing the `Arc` rather
/// than requiring `L2: Clone`.
impl<T: L2Cache> L2Cache for Arc<T> {
    fn lock(&self, keys: &[LockKey], ttl: Duration) -> std::io::Result<(bool, String)> {
        (**self).lock(keys, ttl)
    }

    fn unlock(&self, keys: &[LockKey]) -> std::io::Result<()> {
        (**self).unlock(keys)
    }

    fn is_locked(&self, keys: &[LockKey]) -> std::io::Result<bool> {
        (**self).is_locked(keys)
    }

    fn get_struct_ex(&self, key: &str) -> std::io::Result<Option<Vec<u8>>> {
        (**self).get_struct_ex(key)
    }

    fn set(&self, key: &str, value: &[u8], ttl: Duration) -> std::io::Result<()> {
        (**self).set(key, value, ttl)
    }
}

/// In-process [`L2Cache`] used for tests, grounded in the teacher's
/// `MockIndex`/`MockIndexWriter` pattern (`src/mock.rs`) for stubbing an
/// external collaborator.
#[doc(hidden)]
pub mod mock {
    use super::{L2Cache, LockKey};
    use std::{
        collections::HashMap,
        sync::{Arc, Mutex},
        time::{Duration, Instant},
    };

    struct Lease {
        owner: String,
        expires_at: Instant,
    }

    #[derive(Default)]
    struct Inner {
        locks: HashMap<String, Lease>,
        values: HashMap<String, (Vec<u8>, Instant)>,
    }

    /// In-memory, single-process [`L2Cache`].
    #[derive(Clone, Default)]
    pub struct MockL2Cache {
        inner: Arc<Mutex<Inner>>,
        /// When set, every `lock` call returns `Ok((false, _))` —
        /// simulates cross-process lock contention (spec.md S4).
        pub deny_locks: Arc<std::sync::atomic::AtomicBool>,
    }

    impl MockL2Cache {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Forces every subsequent `lock` call to report contention.
        pub fn set_deny_locks(&self, deny: bool) {
            self.deny_locks
                .store(deny, std::sync::atomic::Ordering::SeqCst);
        }

        fn key_str(keys: &[LockKey]) -> String {
            keys.iter()
                .map(|k| k.0.as_str())
                .collect::<Vec<_>>()
                .join("/")
        }
    }

    impl L2Cache for MockL2Cache {
        fn lock(&self, keys: &[LockKey], ttl: Duration) -> std::io::Result<(bool, String)> {
            if self.deny_locks.load(std::sync::atomic::Ordering::SeqCst) {
                return Ok((false, String::new()));
            }

            let mut inner = self.inner.lock().expect("lock poisoned");
            let key = Self::key_str(keys);
            let now = Instant::now();

            if let Some(existing) = inner.locks.get(&key) {
                if existing.expires_at > now {
                    return Ok((false, existing.owner.clone()));
                }
            }

            let owner = format!("owner-{}", now.elapsed().subsec_nanos());
            inner.locks.insert(
                key,
                Lease {
                    owner: owner.clone(),
                    expires_at: now + ttl,
                },
            );

            Ok((true, owner))
        }

        fn unlock(&self, keys: &[LockKey]) -> std::io::Result<()> {
            let mut inner = self.inner.lock().expect("lock poisoned");
            inner.locks.remove(&Self::key_str(keys));
            Ok(())
        }

        fn is_locked(&self, keys: &[LockKey]) -> std::io::Result<bool> {
            let inner = self.inner.lock().expect("lock poisoned");
            let key = Self::key_str(keys);
            Ok(inner
                .locks
                .get(&key)
                .is_some_and(|l| l.expires_at > Instant::now()))
        }

        fn get_struct_ex(&self, key: &str) -> std::io::Result<Option<Vec<u8>>> {
            let inner = self.inner.lock().expect("lock poisoned");
            Ok(inner.values.get(key).and_then(|(v, expires_at)| {
                (*expires_at > Instant::now()).then(|| v.clone())
            }))
        }

        fn set(&self, key: &str, value: &[u8], ttl: Duration) -> std::io::Result<()> {
            let mut inner = self.inner.lock().expect("lock poisoned");
            inner
                .values
                .insert(key.to_string(), (value.to_vec(), Instant::now() + ttl));
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn lock_then_contend() {
            let l2 = MockL2Cache::new();
            let keys = l2.create_lock_keys(&["a"]);

            let (ok, _) = l2.lock(&keys, Duration::from_secs(5)).unwrap();
            assert!(ok);

            let (ok, _) = l2.lock(&keys, Duration::from_secs(5)).unwrap();
            assert!(!ok, "second lock attempt should contend");

            l2.unlock(&keys).unwrap();
            let (ok, _) = l2.lock(&keys, Duration::from_secs(5)).unwrap();
            assert!(ok, "lock should be acquirable after unlock");
        }

        #[test]
        fn deny_locks_forces_contention() {
            let l2 = MockL2Cache::new();
            l2.set_deny_locks(true);
            let keys = l2.create_lock_keys(&["a"]);
            let (ok, _) = l2.lock(&keys, Duration::from_secs(5)).unwrap();
            assert!(!ok);
        }
    }
}
