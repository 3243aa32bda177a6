pub type Result<T, E = crate::error::Error> = std::result::Result<T, E>;

/// Error type returned on failed torrent allocations.
///
/// This error is non-fatal, so it should not be grouped with the
/// global `Error` type as it may be recovered from.
#[derive(Debug, thiserror::Error)]
pub enum NewTorrentError {
  #[error("disk torrent entry already exists")]
  /// The torrent entry already exists in `Disk`'s hashmap of torrents.
  AlreadyExists,

  #[error("path segment is empty, absolute, or a parent reference")]
  /// One of the torrent's file paths failed the `..`/absolute/empty
  /// component check during allocation.
  InvalidPath,

  #[error("{0}")]
  /// IO error while allocating torrent.
  Io(std::io::Error),
}

impl From<std::io::Error> for NewTorrentError {
  fn from(value: std::io::Error) -> Self {
    Self::Io(value)
  }
}

/// Error type returned on failed block writes.
///
/// This error is non-fatal so it should not be grouped with the global
/// `Error` type as it may be recovered from.
#[derive(Debug, thiserror::Error)]
pub enum WriteError {
  #[error("piece length does not match the expected piece length")]
  /// Raised by `writePiece` when the byte count doesn't equal the piece
  /// length (or, for the last piece, the remainder length).
  InvalidPieceLength,

  #[error("{0}")]
  /// An IO error occurred.
  Io(std::io::Error),
}

impl From<std::io::Error> for WriteError {
  fn from(value: std::io::Error) -> Self {
    Self::Io(value)
  }
}

/// Error type returned on failed block reads.
///
/// This error is non-fatal so it should not be grouped with the global
/// `Error` type as it may be recovered from.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
  #[error("invalid block offset")]
  /// The block's offset in piece is invalid.
  InvalidBlockOffset,

  #[error("piece is not complete")]
  /// The piece is valid within the torrent but hasn't been fully downloaded
  /// yet, so it cannot be read back.
  PieceMissing,

  #[error("{0}")]
  /// An IO error occurred.
  Io(std::io::Error),
}

impl From<std::io::Error> for ReadError {
  fn from(value: std::io::Error) -> Self {
    Self::Io(value)
  }
}
