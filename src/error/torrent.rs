use tokio::io::Error as IoError;
use tokio::sync::mpsc::error::SendError;

pub type Result<T, E = TorrentError> = std::result::Result<T, E>;

/// Errors that cause a torrent session to transition to its `Error` state
/// (§7: "Disk-level errors propagate up to the session"). Per-peer and
/// per-tracker failures never appear here — those are handled entirely
/// within the peer connection manager and tracker coordinator.
#[derive(Debug, thiserror::Error)]
pub enum TorrentError {
  #[error("channel error")]
  /// The channel on which some component in engine was listening or sending
  /// died.
  Channel,

  #[error("{0}")]
  /// An IO error occurred.
  Io(std::io::Error),

  #[error("disk error: {0}")]
  Disk(crate::error::disk::WriteError),
}

impl From<IoError> for TorrentError {
  fn from(value: IoError) -> Self {
    Self::Io(value)
  }
}

impl<T> From<SendError<T>> for TorrentError {
  fn from(_: SendError<T>) -> Self {
    Self::Channel
  }
}

impl From<crate::error::disk::WriteError> for TorrentError {
  fn from(value: crate::error::disk::WriteError) -> Self {
    Self::Disk(value)
  }
}
