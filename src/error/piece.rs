//! Errors produced by the piece verifier (component C).

pub type Result<T, E = PieceError> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PieceError {
  #[error("piece index or hash table out of bounds")]
  /// Raised when the piece index is outside `[0, piece_count)` or the hash
  /// table's length isn't a multiple of 20 bytes.
  OutOfBounds,

  #[error("block length does not match the expected block length")]
  InvalidBlockLength,
}
