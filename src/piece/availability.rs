//! Piece availability tracker (component D).

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::{Bitfield, PieceIndex};

/// Tracks per-peer bitfields and a per-piece availability count, exposing a
/// cached rarest-first ranking recomputed lazily after count changes.
#[derive(Debug, Default)]
pub struct AvailabilityTracker {
  peers: HashMap<SocketAddr, Bitfield>,
  counts: Vec<usize>,
  rarest_ranking: Option<Vec<PieceIndex>>,
}

impl AvailabilityTracker {
  pub fn new(piece_count: usize) -> Self {
    Self {
      peers: HashMap::new(),
      counts: vec![0; piece_count],
      rarest_ranking: None,
    }
  }

  /// Registers a peer's bitfield, incrementing the count for every piece it
  /// has.
  pub fn add_peer(&mut self, addr: SocketAddr, bitfield: Bitfield) {
    for index in bitfield.iter_ones() {
      self.counts[index] += 1;
    }
    self.peers.insert(addr, bitfield);
    self.rarest_ranking = None;
  }

  /// Removes a peer, decrementing the count for every piece it had.
  pub fn remove_peer(&mut self, addr: &SocketAddr) {
    if let Some(bitfield) = self.peers.remove(addr) {
      for index in bitfield.iter_ones() {
        self.counts[index] -= 1;
      }
      self.rarest_ranking = None;
    }
  }

  /// Records that a peer now has `index`. Idempotent: a second call for the
  /// same peer and piece has no effect.
  pub fn have(&mut self, addr: SocketAddr, index: PieceIndex) {
    let bitfield = self
      .peers
      .entry(addr)
      .or_insert_with(|| Bitfield::repeat(false, self.counts.len()));
    if !bitfield[index] {
      bitfield.set(index, true);
      self.counts[index] += 1;
      self.rarest_ranking = None;
    }
  }

  pub fn count(&self, index: PieceIndex) -> usize {
    self.counts[index]
  }

  pub fn peer_bitfield(&self, addr: &SocketAddr) -> Option<&Bitfield> {
    self.peers.get(addr)
  }

  /// Returns pieces sorted ascending by availability count, tied-broken by
  /// lower index, computing and caching the ranking on first access after
  /// invalidation.
  pub fn rarest_ranking(&mut self) -> &[PieceIndex] {
    if self.rarest_ranking.is_none() {
      let mut ranking: Vec<PieceIndex> = (0..self.counts.len()).collect();
      ranking.sort_by_key(|&index| (self.counts[index], index));
      self.rarest_ranking = Some(ranking);
    }
    self.rarest_ranking.as_deref().unwrap()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn addr(port: u16) -> SocketAddr {
    format!("127.0.0.1:{port}").parse().unwrap()
  }

  #[test]
  fn add_and_remove_peer_updates_counts() {
    let mut tracker = AvailabilityTracker::new(3);
    let mut bf = Bitfield::repeat(false, 3);
    bf.set(0, true);
    bf.set(2, true);
    tracker.add_peer(addr(1), bf);
    assert_eq!(tracker.count(0), 1);
    assert_eq!(tracker.count(1), 0);
    assert_eq!(tracker.count(2), 1);

    tracker.remove_peer(&addr(1));
    assert_eq!(tracker.count(0), 0);
    assert_eq!(tracker.count(2), 0);
  }

  #[test]
  fn have_is_idempotent() {
    let mut tracker = AvailabilityTracker::new(2);
    tracker.have(addr(1), 0);
    tracker.have(addr(1), 0);
    assert_eq!(tracker.count(0), 1);
  }

  #[test]
  fn rarest_ranking_orders_by_count_then_index() {
    let mut tracker = AvailabilityTracker::new(3);
    tracker.have(addr(1), 0);
    tracker.have(addr(2), 0);
    tracker.have(addr(1), 1);
    // piece 2 has count 0, piece 1 has count 1, piece 0 has count 2
    assert_eq!(tracker.rarest_ranking(), &[2, 1, 0]);
  }
}
