//! The store buffer: pending write blocks, addressable by location.
//!
//! Between the moment a write job is queued and the moment its bytes are on
//! disk, the block lives here so reads and hashes of the same location can
//! be satisfied from memory instead of racing the write to disk. Keys are
//! always 16 KiB aligned; the engine rejects unaligned writes before
//! queuing, and the storage's fence parks a write whose location already
//! has one in flight, so each key holds at most one pending block.

use std::{collections::HashMap, sync::Mutex};

use bytes::Bytes;

use crate::{PieceIndex, TorrentIndex};

/// Uniquely identifies a block location: `(torrent, piece, offset)`. At most
/// one in-flight write exists per key at any time.
pub(crate) type StoreBufferKey = (TorrentIndex, PieceIndex, u32);

#[derive(Default)]
pub(crate) struct StoreBuffer {
    buffer: Mutex<HashMap<StoreBufferKey, Bytes>>,
}

impl StoreBuffer {
    /// Publishes a pending write. Called just before the write job is
    /// queued.
    pub fn insert(&self, key: StoreBufferKey, block: Bytes) {
        let mut buffer = self.buffer.lock().unwrap();
        let replaced = buffer.insert(key, block);
        // a write is only queued once its location's previous write has
        // completed and erased its entry
        debug_assert!(replaced.is_none());
    }

    /// Retires a completed write. Called after the block is on disk.
    pub fn erase(&self, key: &StoreBufferKey) {
        let mut buffer = self.buffer.lock().unwrap();
        let removed = buffer.remove(key);
        debug_assert!(removed.is_some());
    }

    /// If a pending write exists at `key`, invokes `f` with its bytes under
    /// the buffer lock and returns the result.
    pub fn get<R>(
        &self,
        key: &StoreBufferKey,
        f: impl FnOnce(&[u8]) -> R,
    ) -> Option<R> {
        let buffer = self.buffer.lock().unwrap();
        buffer.get(key).map(|block| f(block))
    }

    /// Looks up two keys at once, invoking `f` with whichever blocks are
    /// present. Returns a 2-bit presence mask, bit 0 for `a` and bit 1 for
    /// `b`. Used by reads that straddle two block-aligned entries.
    pub fn get2<R>(
        &self,
        a: &StoreBufferKey,
        b: &StoreBufferKey,
        f: impl FnOnce(Option<&[u8]>, Option<&[u8]>) -> R,
    ) -> (u8, R) {
        let buffer = self.buffer.lock().unwrap();
        let block_a = buffer.get(a).map(|b| &b[..]);
        let block_b = buffer.get(b).map(|b| &b[..]);
        let mask = (block_a.is_some() as u8) | ((block_b.is_some() as u8) << 1);
        (mask, f(block_a, block_b))
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_erase() {
        let store = StoreBuffer::default();
        let key = (0, 4, 16384);
        assert_eq!(store.get(&key, |b| b.len()), None);

        store.insert(key, Bytes::from(vec![0xaa; 16384]));
        assert_eq!(store.get(&key, |b| b.len()), Some(16384));
        assert_eq!(store.get(&key, |b| b[0]), Some(0xaa));

        store.erase(&key);
        assert_eq!(store.get(&key, |b| b.len()), None);
        assert_eq!(store.len(), 0);
    }

    #[test]
    fn test_get2_presence_mask() {
        let store = StoreBuffer::default();
        let a = (1, 0, 0);
        let b = (1, 0, 16384);

        let (mask, _) = store.get2(&a, &b, |x, y| {
            assert!(x.is_none());
            assert!(y.is_none());
        });
        assert_eq!(mask, 0b00);

        store.insert(a, Bytes::from_static(&[1; 4]));
        let (mask, first) =
            store.get2(&a, &b, |x, _| x.map(|s| s[0]));
        assert_eq!(mask, 0b01);
        assert_eq!(first, Some(1));

        store.insert(b, Bytes::from_static(&[2; 4]));
        let (mask, pair) = store.get2(&a, &b, |x, y| {
            (x.map(|s| s[0]), y.map(|s| s[0]))
        });
        assert_eq!(mask, 0b11);
        assert_eq!(pair, (Some(1), Some(2)));
    }
}
