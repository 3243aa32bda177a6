//! Set of module errors, one per subsystem, composed into a top-level
//! `Error` for engine-level reporting (§7).
pub mod bencode;
pub mod disk;
pub mod metainfo;
pub mod peer;
pub mod piece;
pub mod rpc;
pub mod torrent;
pub mod tracker;

use std::net::SocketAddr;

pub use disk::{NewTorrentError, ReadError, Result as DiskResult, WriteError};
pub use peer::{ClientError, ConnectError, PeerError, Result as PeerResult};
pub use piece::PieceError;
pub use rpc::RpcError;
pub use tokio::{io::Error as IoError, sync::mpsc::error::SendError};
pub use torrent::{Result as TorrentResult, TorrentError};
pub use tracker::{Result as TrackerResult, TrackerError};

use crate::TorrentId;

pub type EngineResult<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
  #[error("channel error")]
  /// The channel on which some component in engine was listening or sending
  /// died.
  Channel,

  #[error("invalid download path")]
  /// The torrent download location is not valid.
  InvalidDownloadPath,

  #[error("invalid torrent id")]
  /// The torrent ID did not correspond to any entry.
  /// This is returned when the user specified a torrent that does not
  /// exist.
  InvalidTorrentId,

  #[error("{0}")]
  /// Holds global IO related errors.
  Io(IoError),

  #[error("torrent {id} error: {error}")]
  /// An error specific to a torrent.
  Torrent { id: TorrentId, error: TorrentError },

  #[error("torrent {id} tracker error: {error}")]
  /// An error that occurred while a torrent was announcing to a tracker.
  Tracker { id: TorrentId, error: TrackerError },

  #[error("torrent {id} peer {addr} error: {error}")]
  /// An error that occurred in a torrent's session with a peer.
  Peer {
    id: TorrentId,
    addr: SocketAddr,
    error: PeerError,
  },

  #[error("{0}")]
  /// The caller addressed a peer or torrent the engine doesn't track.
  Client(#[from] ClientError),
}

impl From<IoError> for Error {
  fn from(value: IoError) -> Self {
    Self::Io(value)
  }
}

impl<T> From<SendError<T>> for Error {
  fn from(_: SendError<T>) -> Self {
    Self::Channel
  }
}
