//! Resume-time verification (component K): hashes every piece whose byte
//! range is already present on disk, at a capped concurrency, and reports
//! per-piece results plus a final bitfield.

use std::sync::RwLock;

use futures::stream::{self, StreamExt};
use tokio::task;

use crate::disk::io::{file::TorrentFile, piece};
use crate::error::piece::PieceError;
use crate::{Bitfield, PieceIndex};

#[derive(Debug, Clone, Copy)]
pub struct VerifyOutcome {
  pub index: PieceIndex,
  pub valid: bool,
}

/// Verifies every piece of a torrent concurrently, bounded by
/// `concurrency`, reporting each outcome to `on_result` as it completes
/// (not necessarily in index order) and returning the resulting bitfield.
pub async fn verify_resume(
  pieces: std::sync::Arc<Vec<u8>>,
  piece_count: usize,
  piece_len: u32,
  last_piece_len: u32,
  files: std::sync::Arc<Vec<RwLock<TorrentFile>>>,
  file_ranges: std::sync::Arc<Vec<std::ops::Range<crate::FileIndex>>>,
  concurrency: usize,
  mut on_result: impl FnMut(VerifyOutcome),
) -> Result<Bitfield, PieceError> {
  if pieces.len() != piece_count * 20 {
    return Err(PieceError::OutOfBounds);
  }

  let results = stream::iter(0..piece_count)
    .map(|index| {
      let pieces = pieces.clone();
      let files = files.clone();
      let file_ranges = file_ranges.clone();
      async move {
        let len = if index == piece_count - 1 { last_piece_len } else { piece_len };
        let offset = index as u64 * piece_len as u64;
        let file_range = file_ranges[index].clone();

        let outcome = task::spawn_blocking(move || {
          let bytes = match piece::read(offset, file_range, &files, len) {
            Ok(bytes) => bytes,
            // Not fully present on disk yet; resume verification treats
            // this the same as a failed hash check.
            Err(_) => return false,
          };
          crate::piece::verifier::verify_piece(&pieces, index, &bytes).map(|(valid, ..)| valid).unwrap_or(false)
        })
        .await;

        let valid = outcome.unwrap_or(false);
        VerifyOutcome { index, valid }
      }
    })
    .buffer_unordered(concurrency.max(1))
    .collect::<Vec<_>>()
    .await;

  let mut bitfield = Bitfield::repeat(false, piece_count);
  for outcome in results {
    if outcome.valid {
      bitfield.set(outcome.index, true);
    }
    on_result(outcome);
  }
  Ok(bitfield)
}
