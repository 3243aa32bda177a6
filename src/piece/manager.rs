//! Piece manager (component E), the central algorithmic core: owns the
//! piece map, selector, and pending-request tables, and turns peer bitfield
//! and block-receipt events into block requests and completed pieces.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use crate::blockinfo::{block_count, block_len, BlockInfo};
use crate::conf::PieceConf;
use crate::piece::availability::AvailabilityTracker;
use crate::piece::map::PieceMap;
use crate::piece::selector::Selector;
use crate::piece::verifier::verify_piece;
use crate::{Bitfield, PieceIndex};

/// A key uniquely identifying one in-flight request for a block.
///
/// Outside endgame, at most one entry exists per `(piece, offset)`; during
/// endgame, multiple peers may each hold their own entry for the same
/// block.
type RequestKey = (SocketAddr, PieceIndex, u32);

/// Events the piece manager reports back to its owning torrent session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PieceEvent {
  /// A piece hashed successfully; `bytes` is the whole piece, handed off
  /// for the caller to forward to disk for writing.
  PieceComplete { index: PieceIndex, bytes: Arc<Vec<u8>> },
  DownloadComplete,
  PieceFailed { index: PieceIndex, retry_count: usize },
  PieceGaveUp { index: PieceIndex },
  EndgameStarted { missing: usize },
}

struct PendingRequest {
  requested_at: Instant,
}

struct PieceBuffer {
  bytes: Vec<u8>,
  received: Vec<bool>,
}

impl PieceBuffer {
  fn new(piece_len: u32) -> Self {
    Self {
      bytes: vec![0; piece_len as usize],
      received: vec![false; block_count(piece_len)],
    }
  }

  fn is_complete(&self) -> bool {
    self.received.iter().all(|r| *r)
  }
}

pub struct PieceManager {
  conf: PieceConf,
  pieces: Vec<u8>,
  piece_lens: Vec<u32>,

  map: PieceMap,
  selector: Selector,
  availability: AvailabilityTracker,

  pending: HashMap<RequestKey, PendingRequest>,
  pending_by_piece: HashMap<PieceIndex, HashSet<RequestKey>>,
  pending_by_peer: HashMap<SocketAddr, HashSet<RequestKey>>,

  buffers: HashMap<PieceIndex, PieceBuffer>,
  in_progress: HashSet<PieceIndex>,
  retry_counts: HashMap<PieceIndex, usize>,
  bad_peers: HashMap<PieceIndex, HashSet<SocketAddr>>,

  endgame: bool,
}

impl PieceManager {
  /// `piece_lens` gives the length of each piece (the last entry may be
  /// shorter than the rest); `pieces` is the concatenated SHA-1 hash table.
  pub fn new(conf: PieceConf, pieces: Vec<u8>, piece_lens: Vec<u32>) -> Self {
    let piece_count = piece_lens.len();
    Self {
      conf,
      pieces,
      piece_lens,
      map: PieceMap::new(piece_count),
      selector: Selector::default(),
      availability: AvailabilityTracker::new(piece_count),
      pending: HashMap::new(),
      pending_by_piece: HashMap::new(),
      pending_by_peer: HashMap::new(),
      buffers: HashMap::new(),
      in_progress: HashSet::new(),
      retry_counts: HashMap::new(),
      bad_peers: HashMap::new(),
      endgame: false,
    }
  }

  /// Restores piece state from a bitfield already verified by the disk
  /// layer (resume path).
  pub fn seed_from_bitfield(&mut self, bitfield: Bitfield) {
    self.map = PieceMap::from_bitfield(bitfield);
  }

  pub fn own_bitfield(&self) -> &Bitfield {
    self.map.bitfield()
  }

  pub fn is_download_complete(&self) -> bool {
    self.map.is_download_complete()
  }

  pub fn progress(&self) -> f64 {
    self.map.progress()
  }

  pub fn register_peer(&mut self, addr: SocketAddr, bitfield: Bitfield) {
    self.availability.add_peer(addr, bitfield);
  }

  pub fn peer_have(&mut self, addr: SocketAddr, index: PieceIndex) {
    self.availability.have(addr, index);
  }

  fn pending_for(&self, peer: &SocketAddr) -> usize {
    self.pending_by_peer.get(peer).map_or(0, HashSet::len)
  }

  fn piece_len(&self, index: PieceIndex) -> u32 {
    self.piece_lens[index]
  }

  /// Generates the next block requests to issue to `peer`, given its
  /// current pipeline capacity `capacity` and bitfield. Also returns
  /// `Some(PieceEvent::EndgameStarted { .. })` the moment this call tips the
  /// manager into endgame, so the caller can surface it to the alert stream.
  pub fn next_requests(&mut self, peer: SocketAddr, peer_bitfield: &Bitfield, capacity: usize) -> (Vec<BlockInfo>, Option<PieceEvent>) {
    let needed = if self.endgame {
      (2 * capacity).min(512)
    } else {
      capacity.saturating_sub(self.pending_for(&peer))
    };

    let mut requests = Vec::with_capacity(needed);
    for _ in 0..needed {
      let Some(block) = self.next_block_for(peer, peer_bitfield) else {
        break;
      };
      self.mark_requested(peer, block);
      requests.push(block);
    }

    let event = self.reevaluate_endgame();
    (requests, event)
  }

  fn next_block_for(&mut self, peer: SocketAddr, peer_bitfield: &Bitfield) -> Option<BlockInfo> {
    // Prefer finishing a piece already in progress that the peer has.
    let in_progress: Vec<PieceIndex> = self.in_progress.iter().copied().collect();
    for index in in_progress {
      if !peer_bitfield[index] {
        continue;
      }
      if let Some(block) = self.first_missing_block(index, peer) {
        return Some(block);
      }
    }

    let own_bitfield = self.map.bitfield().clone();
    let index = self.selector.select(
      &own_bitfield,
      peer_bitfield,
      &self.in_progress,
      &mut self.availability,
    )?;
    self.map.set_in_progress(index);
    self.in_progress.insert(index);
    self.buffers.entry(index).or_insert_with(|| PieceBuffer::new(self.piece_lens[index]));
    self.first_missing_block(index, peer)
  }

  fn first_missing_block(&self, index: PieceIndex, peer: SocketAddr) -> Option<BlockInfo> {
    let buffer = self.buffers.get(&index)?;
    let piece_len = self.piece_len(index);
    // Outside endgame, a block already `Requested` by any peer is excluded
    // so no two peers hold a pending entry for the same (piece, block). In
    // endgame that invariant is deliberately suspended so the same block may
    // be handed to multiple peers at once and the first receipt wins — but
    // a peer that already has its own pending entry for a block isn't handed
    // the identical block again, since that would waste the slot rather than
    // widen coverage.
    let pending_offsets: HashSet<u32> = self
      .pending_by_piece
      .get(&index)
      .into_iter()
      .flatten()
      .filter(|(req_peer, _, _)| !self.endgame || *req_peer == peer)
      .map(|(_, _, offset)| *offset)
      .collect();

    buffer.received.iter().enumerate().find_map(|(block_index, received)| {
      let offset = block_index as u32 * crate::BLOCK_LEN;
      if *received || pending_offsets.contains(&offset) {
        None
      } else {
        Some(BlockInfo {
          piece_index: index,
          offset,
          len: block_len(piece_len, block_index),
        })
      }
    })
  }

  fn mark_requested(&mut self, peer: SocketAddr, block: BlockInfo) {
    let key = (peer, block.piece_index, block.offset);
    self.pending.insert(
      key,
      PendingRequest {
        requested_at: Instant::now(),
      },
    );
    self.pending_by_piece.entry(block.piece_index).or_default().insert(key);
    self.pending_by_peer.entry(peer).or_default().insert(key);
  }

  fn reevaluate_endgame(&mut self) -> Option<PieceEvent> {
    if self.endgame {
      return None;
    }
    let threshold = PieceConf::endgame_threshold(self.map.piece_count());
    if self.map.missing_count() <= threshold {
      self.endgame = true;
      return Some(PieceEvent::EndgameStarted { missing: self.map.missing_count() });
    }
    None
  }

  /// Handles a received block from `peer`. Returns any events the caller
  /// should surface (piece completion, verification failure, ...).
  pub fn handle_block(&mut self, peer: SocketAddr, block: BlockInfo, data: &[u8]) -> Vec<PieceEvent> {
    let key = (peer, block.piece_index, block.offset);
    let had_pending = self.pending.remove(&key).is_some();
    if had_pending {
      if let Some(set) = self.pending_by_piece.get_mut(&block.piece_index) {
        set.remove(&key);
      }
      if let Some(set) = self.pending_by_peer.get_mut(&peer) {
        set.remove(&key);
      }
    } else if !self.endgame {
      log::trace!("dropping unrequested block {block}");
      return Vec::new();
    }

    if self.endgame {
      // Purge any other peers' duplicate in-flight entries for this block.
      let duplicates: Vec<RequestKey> = self
        .pending_by_piece
        .get(&block.piece_index)
        .into_iter()
        .flatten()
        .filter(|(_, _, offset)| *offset == block.offset)
        .copied()
        .collect();
      for dup in duplicates {
        self.pending.remove(&dup);
        if let Some(set) = self.pending_by_piece.get_mut(&block.piece_index) {
          set.remove(&dup);
        }
        if let Some(set) = self.pending_by_peer.get_mut(&dup.0) {
          set.remove(&dup);
        }
      }
    }

    let Some(buffer) = self.buffers.get_mut(&block.piece_index) else {
      return Vec::new();
    };

    let block_index = (block.offset / crate::BLOCK_LEN) as usize;
    if block_index >= buffer.received.len() {
      log::trace!("dropping block with invalid offset {block}");
      return Vec::new();
    }
    if buffer.received[block_index] {
      // Already received, e.g. an endgame duplicate that lost the race.
      return Vec::new();
    }
    if block.len as usize != data.len() {
      log::trace!("dropping block with mismatched length {block}");
      return Vec::new();
    }

    let start = block.offset as usize;
    buffer.bytes[start..start + data.len()].copy_from_slice(data);
    buffer.received[block_index] = true;

    if !buffer.is_complete() {
      return Vec::new();
    }

    self.finish_piece(block.piece_index)
  }

  fn finish_piece(&mut self, index: PieceIndex) -> Vec<PieceEvent> {
    let mut events = Vec::new();
    let buffer = self.buffers.remove(&index).expect("piece buffer present");
    self.in_progress.remove(&index);

    let (valid, expected, actual) = match verify_piece(&self.pieces, index, &buffer.bytes) {
      Ok(result) => result,
      Err(error) => {
        log::error!("piece {index} failed to verify: {error}");
        return events;
      }
    };

    if valid {
      self.map.mark_complete(index);
      self.retry_counts.remove(&index);
      self.bad_peers.remove(&index);
      events.push(PieceEvent::PieceComplete { index, bytes: Arc::new(buffer.bytes) });
      if self.map.is_download_complete() {
        events.push(PieceEvent::DownloadComplete);
      }
    } else {
      log::warn!(
        "piece {index} failed verification: expected {:?}, got {:?}",
        expected,
        actual
      );
      self.map.mark_failed(index);
      let retry_count = self.retry_counts.entry(index).or_insert(0);
      *retry_count += 1;
      let retry_count = *retry_count;
      events.push(PieceEvent::PieceFailed { index, retry_count });
      if retry_count >= self.conf.max_piece_retries {
        events.push(PieceEvent::PieceGaveUp { index });
        self.retry_counts.remove(&index);
      }
    }
    events
  }

  /// Records that `peer` misbehaved with respect to `index` (e.g. it sent
  /// corrupt data), so the selector can be extended to avoid it in future.
  pub fn mark_peer_bad_for_piece(&mut self, peer: SocketAddr, index: PieceIndex) {
    self.bad_peers.entry(index).or_default().insert(peer);
  }

  /// Sweeps pending requests older than the configured stale timeout,
  /// resetting their blocks to missing. Returns the number swept.
  pub fn sweep_stale_requests(&mut self) -> usize {
    let now = Instant::now();
    let timeout = self.conf.stale_request_timeout;
    let stale: Vec<RequestKey> = self
      .pending
      .iter()
      .filter(|(_, req)| now.duration_since(req.requested_at) > timeout)
      .map(|(key, _)| *key)
      .collect();

    for key in &stale {
      self.release_block(*key);
    }
    stale.len()
  }

  /// Cancels all pending requests for `peer` (on disconnect), resetting
  /// each still-`Requested` block to missing.
  pub fn cancel_peer(&mut self, peer: &SocketAddr) {
    let keys: Vec<RequestKey> = self
      .pending_by_peer
      .get(peer)
      .into_iter()
      .flatten()
      .copied()
      .collect();
    for key in keys {
      self.release_block(key);
    }
    self.pending_by_peer.remove(peer);
    self.availability.remove_peer(peer);
  }

  fn release_block(&mut self, key: RequestKey) {
    self.pending.remove(&key);
    if let Some(set) = self.pending_by_piece.get_mut(&key.1) {
      set.remove(&key);
    }
    if let Some(set) = self.pending_by_peer.get_mut(&key.0) {
      set.remove(&key);
    }
    if let Some(buffer) = self.buffers.get_mut(&key.1) {
      let block_index = (key.2 / crate::BLOCK_LEN) as usize;
      if let Some(received) = buffer.received.get_mut(block_index) {
        *received = false;
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn full_bitfield(count: usize) -> Bitfield {
    Bitfield::repeat(true, count)
  }

  fn one_piece_manager(piece_len: u32) -> (PieceManager, Vec<u8>) {
    let data = vec![7u8; piece_len as usize];
    let mut hasher = sha1::Sha1::new();
    sha1::Digest::update(&mut hasher, &data);
    let hash: [u8; 20] = sha1::Digest::finalize(hasher).into();
    let manager = PieceManager::new(PieceConf::default(), hash.to_vec(), vec![piece_len]);
    (manager, data)
  }

  #[test]
  fn requests_and_completes_single_block_piece() {
    let (mut manager, data) = one_piece_manager(crate::BLOCK_LEN);
    let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
    let peer_bitfield = full_bitfield(1);
    manager.register_peer(peer, peer_bitfield.clone());

    let (requests, event) = manager.next_requests(peer, &peer_bitfield, 10);
    assert_eq!(requests.len(), 1);
    // A single-piece torrent is always within its own endgame threshold.
    assert_eq!(event, Some(PieceEvent::EndgameStarted { missing: 1 }));
    let block = requests[0];

    let events = manager.handle_block(peer, block, &data);
    assert_eq!(
      events,
      vec![
        PieceEvent::PieceComplete { index: 0, bytes: Arc::new(data.clone()) },
        PieceEvent::DownloadComplete
      ]
    );
    assert!(manager.is_download_complete());
  }

  #[test]
  fn unrequested_block_is_dropped_outside_endgame() {
    let (mut manager, data) = one_piece_manager(crate::BLOCK_LEN);
    let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
    let block = BlockInfo {
      piece_index: 0,
      offset: 0,
      len: crate::BLOCK_LEN,
    };
    let events = manager.handle_block(peer, block, &data);
    assert!(events.is_empty());
  }

  #[test]
  fn sweep_stale_requests_releases_blocks() {
    let (mut manager, _data) = one_piece_manager(crate::BLOCK_LEN);
    manager.conf.stale_request_timeout = std::time::Duration::from_secs(0);
    let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
    let peer_bitfield = full_bitfield(1);
    manager.register_peer(peer, peer_bitfield.clone());
    manager.next_requests(peer, &peer_bitfield, 10);

    std::thread::sleep(std::time::Duration::from_millis(5));
    let swept = manager.sweep_stale_requests();
    assert_eq!(swept, 1);
    assert!(manager.pending.is_empty());
  }

  #[test]
  fn cancel_peer_releases_its_pending_blocks() {
    let (mut manager, _data) = one_piece_manager(2 * crate::BLOCK_LEN);
    let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
    let peer_bitfield = full_bitfield(1);
    manager.register_peer(peer, peer_bitfield.clone());
    manager.next_requests(peer, &peer_bitfield, 10);
    assert!(!manager.pending.is_empty());

    manager.cancel_peer(&peer);
    assert!(manager.pending.is_empty());
    assert!(manager.pending_by_peer.get(&peer).is_none());
  }

  #[test]
  fn endgame_permits_duplicate_requests_for_the_same_block_across_peers() {
    let (mut manager, data) = one_piece_manager(crate::BLOCK_LEN);
    manager.endgame = true;
    let peer_a: SocketAddr = "127.0.0.1:1".parse().unwrap();
    let peer_b: SocketAddr = "127.0.0.1:2".parse().unwrap();
    let bitfield = full_bitfield(1);
    manager.register_peer(peer_a, bitfield.clone());
    manager.register_peer(peer_b, bitfield.clone());

    let (requests_a, _) = manager.next_requests(peer_a, &bitfield, 10);
    let (requests_b, _) = manager.next_requests(peer_b, &bitfield, 10);
    assert_eq!(requests_a, requests_b, "both peers are handed the same block");

    let block = requests_a[0];
    let events = manager.handle_block(peer_a, block, &data);
    assert_eq!(events, vec![PieceEvent::PieceComplete { index: 0, bytes: Arc::new(data.clone()) }, PieceEvent::DownloadComplete]);

    // peer_b's now-redundant duplicate entry was purged by the first receipt.
    assert!(manager.pending_by_peer.get(&peer_b).map_or(true, HashSet::is_empty));
  }

  #[test]
  fn next_requests_reports_the_transition_into_endgame() {
    let piece_lens = vec![crate::BLOCK_LEN; 20];
    let pieces = vec![0u8; 20 * crate::BLOCK_LEN as usize];
    let mut manager = PieceManager::new(PieceConf::default(), pieces, piece_lens);
    manager.endgame = false;
    // Fake 16 of 20 pieces already complete, leaving 4 missing (<= threshold 5
    // per `PieceConf::endgame_threshold(20)`).
    for index in 0..16 {
      manager.map.mark_complete(index);
    }
    let peer: SocketAddr = "127.0.0.1:1".parse().unwrap();
    let bitfield = full_bitfield(20);
    manager.register_peer(peer, bitfield.clone());

    let (_requests, event) = manager.next_requests(peer, &bitfield, 10);
    assert_eq!(event, Some(PieceEvent::EndgameStarted { missing: 4 }));
    assert!(manager.endgame);
  }
}
