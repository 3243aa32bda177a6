//! An LRU cache of whole, verified pieces (component K's read path), so a
//! block read for a piece that was recently written or read doesn't need
//! to go back to disk.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;

use crate::{PieceIndex, TorrentId};

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
struct CacheKey {
  torrent: TorrentId,
  piece: PieceIndex,
}

pub struct ReadCache {
  entries: LruCache<CacheKey, Arc<Vec<u8>>>,
}

impl ReadCache {
  pub fn new(capacity: usize) -> Self {
    let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
    Self {
      entries: LruCache::new(capacity),
    }
  }

  pub fn get(&mut self, torrent: TorrentId, piece: PieceIndex) -> Option<Arc<Vec<u8>>> {
    self.entries.get(&CacheKey { torrent, piece }).cloned()
  }

  pub fn insert(&mut self, torrent: TorrentId, piece: PieceIndex, bytes: Arc<Vec<u8>>) {
    self.entries.put(CacheKey { torrent, piece }, bytes);
  }

  /// Drops every cached piece belonging to `torrent`, e.g. on delete.
  pub fn clear_torrent(&mut self, torrent: TorrentId) {
    let stale: Vec<CacheKey> = self.entries.iter().map(|(k, _)| *k).filter(|k| k.torrent == torrent).collect();
    for key in stale {
      self.entries.pop(&key);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn insert_then_get_round_trips() {
    let mut cache = ReadCache::new(2);
    let id = TorrentId::default();
    cache.insert(id, 0, Arc::new(vec![1, 2, 3]));
    assert_eq!(cache.get(id, 0).as_deref(), Some(&vec![1, 2, 3]));
    assert!(cache.get(id, 1).is_none());
  }

  #[test]
  fn evicts_least_recently_used() {
    let mut cache = ReadCache::new(1);
    let id = TorrentId::default();
    cache.insert(id, 0, Arc::new(vec![0]));
    cache.insert(id, 1, Arc::new(vec![1]));
    assert!(cache.get(id, 0).is_none());
    assert!(cache.get(id, 1).is_some());
  }

  #[test]
  fn clear_torrent_drops_only_its_entries() {
    let mut cache = ReadCache::new(4);
    let a = TorrentId::default();
    let b = TorrentId::default();
    cache.insert(a, 0, Arc::new(vec![0]));
    cache.insert(b, 0, Arc::new(vec![1]));
    cache.clear_torrent(a);
    assert!(cache.get(a, 0).is_none());
    assert!(cache.get(b, 0).is_some());
  }
}
