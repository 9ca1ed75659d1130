//! A bounded pool of open file handles, keyed by `(torrent, file)`.
//!
//! Handles are shared and reference counted: eviction only drops the pool's
//! reference, so a worker in the middle of an IO keeps its handle alive.
//! Concurrent opens of the same file are coalesced onto one OS open; the
//! first caller performs it and every waiter receives the same result,
//! success or error. Evicted handles are dropped only after the pool's lock
//! is released, since closing a file can be expensive on some platforms.

use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, Condvar, Mutex},
    time::{Duration, Instant},
};

use lru::LruCache;

use crate::{
    disk::{
        error::{Operation, StorageError},
        file::{FileHandle, OpenMode},
    },
    FileIndex, TorrentIndex,
};

type FileKey = (TorrentIndex, FileIndex);

struct Entry {
    handle: Arc<FileHandle>,
    last_use: Instant,
}

/// The slot a pending open publishes its result through. All coalesced
/// waiters block on `cond` until `done` is filled in.
struct OpeningEntry {
    done: Mutex<Option<Result<Arc<FileHandle>, StorageError>>>,
    cond: Condvar,
}

struct Inner {
    files: LruCache<FileKey, Entry>,
    opening: HashMap<FileKey, Arc<OpeningEntry>>,
    capacity: usize,
}

pub(crate) struct FilePool {
    inner: Mutex<Inner>,
}

impl FilePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                files: LruCache::unbounded(),
                opening: HashMap::new(),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Returns a handle for the file, opening it if no cached entry
    /// satisfies the requested mode. A cached read-write handle satisfies a
    /// read request, but not the other way around.
    pub fn open(
        &self,
        torrent: TorrentIndex,
        file: FileIndex,
        path: &Path,
        mode: OpenMode,
    ) -> Result<Arc<FileHandle>, StorageError> {
        let key = (torrent, file);
        // handles evicted while we hold the lock are dropped here, after
        // it is released
        let mut deferred: Vec<Arc<FileHandle>> = Vec::new();

        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.files.get_mut(&key) {
            let cached_mode = entry.handle.mode();
            if !mode.contains(OpenMode::WRITE)
                || cached_mode.contains(OpenMode::WRITE)
            {
                entry.last_use = Instant::now();
                return Ok(Arc::clone(&entry.handle));
            }
            // the cached handle is read-only but a writable one is needed
            if let Some(entry) = inner.files.pop(&key) {
                deferred.push(entry.handle);
            }
        }

        if let Some(opening) = inner.opening.get(&key) {
            let opening = Arc::clone(opening);
            drop(inner);
            drop(deferred);
            let mut done = opening.done.lock().unwrap();
            while done.is_none() {
                done = opening.cond.wait(done).unwrap();
            }
            return done.clone().expect("opening result was just checked");
        }

        let opening = Arc::new(OpeningEntry {
            done: Mutex::new(None),
            cond: Condvar::new(),
        });
        inner.opening.insert(key, Arc::clone(&opening));
        drop(inner);

        log::trace!("Opening file {:?} for torrent {}", path, torrent);
        let result = FileHandle::open(path, mode)
            .map(Arc::new)
            .map_err(|e| StorageError::with_file(Operation::Open, file, e));

        let mut inner = self.inner.lock().unwrap();
        inner.opening.remove(&key);
        if let Ok(handle) = &result {
            while inner.files.len() >= inner.capacity {
                match inner.files.pop_lru() {
                    Some((_, entry)) => deferred.push(entry.handle),
                    None => break,
                }
            }
            inner.files.put(
                key,
                Entry { handle: Arc::clone(handle), last_use: Instant::now() },
            );
        }
        drop(inner);

        let mut done = opening.done.lock().unwrap();
        *done = Some(result.clone());
        opening.cond.notify_all();
        drop(done);

        result
    }

    /// Closes all cached handles of one torrent.
    pub fn release(&self, torrent: TorrentIndex) {
        let mut deferred = Vec::new();
        let mut inner = self.inner.lock().unwrap();
        let keys: Vec<FileKey> = inner
            .files
            .iter()
            .map(|(k, _)| *k)
            .filter(|k| k.0 == torrent)
            .collect();
        for key in keys {
            if let Some(entry) = inner.files.pop(&key) {
                deferred.push(entry.handle);
            }
        }
        drop(inner);
    }

    /// Closes the cached handle of one file, e.g. before renaming it.
    pub fn release_file(&self, torrent: TorrentIndex, file: FileIndex) {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.files.pop(&(torrent, file));
        drop(inner);
        drop(entry);
    }

    /// Closes every cached handle.
    pub fn release_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        let mut deferred = Vec::new();
        while let Some((_, entry)) = inner.files.pop_lru() {
            deferred.push(entry.handle);
        }
        drop(inner);
    }

    /// Shrinks (or grows) the pool, evicting least-recently-used entries
    /// until the population fits.
    pub fn resize(&self, capacity: usize) {
        let mut deferred = Vec::new();
        let mut inner = self.inner.lock().unwrap();
        inner.capacity = capacity.max(1);
        while inner.files.len() > inner.capacity {
            match inner.files.pop_lru() {
                Some((_, entry)) => deferred.push(entry.handle),
                None => break,
            }
        }
        drop(inner);
    }

    /// Closes the least-recently-used handle if it has been idle for longer
    /// than `max_idle`. Driven by the engine's periodic maintenance.
    pub fn close_oldest(&self, max_idle: Duration) {
        let mut inner = self.inner.lock().unwrap();
        let expired = match inner.files.peek_lru() {
            Some((_, entry)) => entry.last_use.elapsed() >= max_idle,
            None => false,
        };
        let entry = if expired { inner.files.pop_lru() } else { None };
        drop(inner);
        drop(entry);
    }

    /// Flushes handles of the torrent that have accumulated writes.
    pub fn flush_dirty(&self, torrent: TorrentIndex) {
        let handles: Vec<Arc<FileHandle>> = {
            let inner = self.inner.lock().unwrap();
            inner
                .files
                .iter()
                .filter(|(k, _)| k.0 == torrent)
                .map(|(_, e)| Arc::clone(&e.handle))
                .collect()
        };
        for handle in handles {
            if let Err(e) = handle.flush() {
                log::warn!("Failed to flush file of torrent {}: {}", torrent, e);
            }
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().files.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_dir() -> (FilePool, tempfile::TempDir) {
        (FilePool::new(2), tempfile::tempdir().unwrap())
    }

    fn rw() -> OpenMode {
        OpenMode::READ | OpenMode::WRITE
    }

    #[test]
    fn test_open_caches_and_reuses() {
        let (pool, dir) = pool_dir();
        let path = dir.path().join("f0");
        let first = pool.open(0, 0, &path, rw()).unwrap();
        let second = pool.open(0, 0, &path, rw()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_read_handle_upgraded_for_write() {
        let (pool, dir) = pool_dir();
        let path = dir.path().join("f0");
        // seed the file so a read-only open succeeds
        std::fs::write(&path, b"x").unwrap();

        let read = pool.open(0, 0, &path, OpenMode::READ).unwrap();
        let write = pool.open(0, 0, &path, rw()).unwrap();
        assert!(!Arc::ptr_eq(&read, &write));
        assert!(write.mode().contains(OpenMode::WRITE));
        // a read request is satisfied by the cached read-write handle
        let again = pool.open(0, 0, &path, OpenMode::READ).unwrap();
        assert!(Arc::ptr_eq(&write, &again));
    }

    #[test]
    fn test_lru_eviction_at_capacity() {
        let (pool, dir) = pool_dir();
        for i in 0..3 {
            let path = dir.path().join(format!("f{}", i));
            pool.open(0, i, &path, rw()).unwrap();
        }
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_release_per_torrent() {
        let (pool, dir) = pool_dir();
        pool.open(0, 0, &dir.path().join("a"), rw()).unwrap();
        pool.open(1, 0, &dir.path().join("b"), rw()).unwrap();

        pool.release(0);
        assert_eq!(pool.len(), 1);
        pool.release_all();
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn test_resize_evicts() {
        let (pool, dir) = pool_dir();
        pool.open(0, 0, &dir.path().join("a"), rw()).unwrap();
        pool.open(0, 1, &dir.path().join("b"), rw()).unwrap();
        pool.resize(1);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_open_error_is_propagated() {
        let (pool, dir) = pool_dir();
        let missing = dir.path().join("missing");
        let err = pool.open(0, 0, &missing, OpenMode::READ).unwrap_err();
        assert_eq!(err.operation, Operation::Open);
        assert_eq!(err.file, Some(0));
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn test_concurrent_opens_coalesce() {
        let (pool, dir) = pool_dir();
        let pool = Arc::new(pool);
        let path = dir.path().join("contended");

        let mut threads = Vec::new();
        for _ in 0..8 {
            let pool = Arc::clone(&pool);
            let path = path.clone();
            threads.push(std::thread::spawn(move || {
                pool.open(3, 7, &path, rw()).unwrap()
            }));
        }
        let handles: Vec<_> =
            threads.into_iter().map(|t| t.join().unwrap()).collect();
        // all callers end up with a handle to the same file; at most one
        // entry is cached
        assert_eq!(pool.len(), 1);
        assert!(handles.windows(2).all(|w| {
            w[0].mode().contains(OpenMode::WRITE)
                && w[1].mode().contains(OpenMode::WRITE)
        }));
    }
}
