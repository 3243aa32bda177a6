//! Piece selection strategies (component D).

use std::collections::HashSet;

use rand::seq::SliceRandom;

use crate::piece::availability::AvailabilityTracker;
use crate::{Bitfield, PieceIndex};

/// A runtime-switchable piece selection strategy. The change takes effect on
/// the next [`Selector::select`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
  #[default]
  RarestFirst,
  Sequential,
  Random,
}

#[derive(Debug, Default)]
pub struct Selector {
  pub strategy: Strategy,
}

impl Selector {
  pub fn new(strategy: Strategy) -> Self {
    Self { strategy }
  }

  /// Picks a single candidate piece the peer has, we don't, and that isn't
  /// already in progress.
  pub fn select(
    &self,
    own_bitfield: &Bitfield,
    peer_bitfield: &Bitfield,
    in_progress: &HashSet<PieceIndex>,
    availability: &mut AvailabilityTracker,
  ) -> Option<PieceIndex> {
    let candidates = self.candidates(own_bitfield, peer_bitfield, in_progress);
    match self.strategy {
      Strategy::Sequential => candidates.into_iter().min(),
      Strategy::Random => candidates.choose(&mut rand::thread_rng()).copied(),
      Strategy::RarestFirst => {
        let candidates: HashSet<PieceIndex> = candidates.into_iter().collect();
        availability
          .rarest_ranking()
          .iter()
          .find(|index| candidates.contains(index))
          .copied()
      }
    }
  }

  /// Picks up to `count` distinct candidate pieces, in the same priority
  /// order as a single [`select`](Self::select) call would produce.
  pub fn select_batch(
    &self,
    own_bitfield: &Bitfield,
    peer_bitfield: &Bitfield,
    in_progress: &HashSet<PieceIndex>,
    availability: &mut AvailabilityTracker,
    count: usize,
  ) -> Vec<PieceIndex> {
    let candidates = self.candidates(own_bitfield, peer_bitfield, in_progress);
    match self.strategy {
      Strategy::Sequential => {
        let mut candidates = candidates;
        candidates.sort_unstable();
        candidates.into_iter().take(count).collect()
      }
      Strategy::Random => {
        let mut candidates = candidates;
        candidates.shuffle(&mut rand::thread_rng());
        candidates.into_iter().take(count).collect()
      }
      Strategy::RarestFirst => {
        let candidates: HashSet<PieceIndex> = candidates.into_iter().collect();
        availability
          .rarest_ranking()
          .iter()
          .filter(|index| candidates.contains(index))
          .take(count)
          .copied()
          .collect()
      }
    }
  }

  fn candidates(
    &self,
    own_bitfield: &Bitfield,
    peer_bitfield: &Bitfield,
    in_progress: &HashSet<PieceIndex>,
  ) -> Vec<PieceIndex> {
    peer_bitfield
      .iter_ones()
      .filter(|&index| !own_bitfield[index] && !in_progress.contains(&index))
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn bitfield(bits: &[bool]) -> Bitfield {
    let mut bf = Bitfield::repeat(false, bits.len());
    for (i, &b) in bits.iter().enumerate() {
      bf.set(i, b);
    }
    bf
  }

  #[test]
  fn sequential_picks_lowest_index() {
    let selector = Selector::new(Strategy::Sequential);
    let own = bitfield(&[false, false, false]);
    let peer = bitfield(&[true, true, true]);
    let in_progress = HashSet::new();
    let mut availability = AvailabilityTracker::new(3);
    assert_eq!(
      selector.select(&own, &peer, &in_progress, &mut availability),
      Some(0)
    );
  }

  #[test]
  fn excludes_owned_and_in_progress_pieces() {
    let selector = Selector::new(Strategy::Sequential);
    let own = bitfield(&[true, false, false]);
    let peer = bitfield(&[true, true, true]);
    let mut in_progress = HashSet::new();
    in_progress.insert(1);
    let mut availability = AvailabilityTracker::new(3);
    assert_eq!(
      selector.select(&own, &peer, &in_progress, &mut availability),
      Some(2)
    );
  }

  #[test]
  fn rarest_first_prefers_lowest_availability() {
    let selector = Selector::new(Strategy::RarestFirst);
    let own = bitfield(&[false, false, false]);
    let peer = bitfield(&[true, true, true]);
    let in_progress = HashSet::new();
    let mut availability = AvailabilityTracker::new(3);
    let addr1: std::net::SocketAddr = "127.0.0.1:1".parse().unwrap();
    let addr2: std::net::SocketAddr = "127.0.0.1:2".parse().unwrap();
    availability.have(addr1, 0);
    availability.have(addr1, 1);
    availability.have(addr2, 1);
    // piece 2 has count 0, piece 0 has count 1, piece 1 has count 2
    assert_eq!(
      selector.select(&own, &peer, &in_progress, &mut availability),
      Some(2)
    );
  }
}
