//! Piece verifier (component C).

use sha1::{Digest, Sha1};

use crate::error::piece::PieceError;
use crate::PieceIndex;

/// Verifies a single piece's bytes against the expected hash drawn from the
/// torrent's concatenated piece hash table.
///
/// Returns `(valid, expected_hash, actual_hash)`. Fails with `OutOfBounds` if
/// `index` is outside the piece count implied by `pieces.len() / 20`, or if
/// `pieces.len()` is not itself a multiple of 20.
pub fn verify_piece(
  pieces: &[u8],
  index: PieceIndex,
  bytes: &[u8],
) -> Result<(bool, [u8; 20], [u8; 20]), PieceError> {
  if pieces.len() % 20 != 0 {
    return Err(PieceError::OutOfBounds);
  }
  let start = index * 20;
  let expected: [u8; 20] = pieces
    .get(start..start + 20)
    .ok_or(PieceError::OutOfBounds)?
    .try_into()
    .expect("slice of length 20");

  let mut hasher = Sha1::new();
  hasher.update(bytes);
  let actual: [u8; 20] = hasher.finalize().into();

  Ok((actual == expected, expected, actual))
}

/// Hashes and verifies a batch of pieces already known to be fully present
/// on disk, yielding to the scheduler between pieces so a multi-gigabyte
/// resume scan doesn't starve other tasks.
///
/// `read_piece` fetches a piece's bytes (typically from the disk layer);
/// `on_result` is invoked with `(index, valid)` as each piece finishes.
pub async fn verify_all<F, Fut, R>(
  pieces: &[u8],
  piece_count: usize,
  mut read_piece: F,
  mut on_result: R,
) -> Result<(), PieceError>
where
  F: FnMut(PieceIndex) -> Fut,
  Fut: std::future::Future<Output = Option<Vec<u8>>>,
  R: FnMut(PieceIndex, bool),
{
  for index in 0..piece_count {
    if let Some(bytes) = read_piece(index).await {
      let (valid, _, _) = verify_piece(pieces, index, &bytes)?;
      on_result(index, valid);
    }
    // Yield between pieces so resume-time verification of a large torrent
    // doesn't monopolize the executor.
    tokio::task::yield_now().await;
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn hash_of(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
  }

  #[test]
  fn valid_piece_matches_hash() {
    let data = b"hello world";
    let pieces = hash_of(data).to_vec();
    let (valid, expected, actual) = verify_piece(&pieces, 0, data).unwrap();
    assert!(valid);
    assert_eq!(expected, actual);
  }

  #[test]
  fn invalid_piece_reports_mismatch() {
    let pieces = hash_of(b"hello world").to_vec();
    let (valid, ..) = verify_piece(&pieces, 0, b"goodbye world").unwrap();
    assert!(!valid);
  }

  #[test]
  fn out_of_bounds_index_errors() {
    let pieces = hash_of(b"one piece").to_vec();
    assert_eq!(verify_piece(&pieces, 1, b"x"), Err(PieceError::OutOfBounds));
  }

  #[test]
  fn malformed_hash_table_errors() {
    let pieces = vec![0u8; 19];
    assert_eq!(verify_piece(&pieces, 0, b"x"), Err(PieceError::OutOfBounds));
  }
}
