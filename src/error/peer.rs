use std::net::SocketAddr;

pub use tokio::{io::Error as IoError, sync::mpsc::error::SendError};

pub type Result<T, E = PeerError> = std::result::Result<T, E>;

/// Errors arising from an established peer session (wire protocol violations,
/// unexpected message ordering, IO failures on the socket). These are fatal
/// to the session they occur in but never to the torrent or engine.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
  #[error("received unexpected bitfield")]
  /// The bitfield message was not sent directly after the handshake.
  /// According to the protocol it should only be accepted at that point;
  /// received at any other time, the connection is severed.
  BitfieldNotAfterHandshake,

  #[error("channel error")]
  /// The channel on which some component in engine was listening or sending
  /// died.
  Channel,

  #[error("choked peer sent request")]
  /// Peers are not allowed to request blocks while they are choked. If they
  /// do so, their connection is severed.
  RequestWhileChoked,

  #[error("inactivity timeout")]
  /// A peer session timed out because neither side of the connection became
  /// interested in each other.
  InactivityTimeout,

  #[error("invalid block info")]
  /// The block information the peer sent is invalid.
  InvalidBlockInfo,

  #[error("invalid piece index")]
  /// The block's piece index is invalid.
  InvalidPieceIndex,

  #[error("invalid info hash")]
  /// Peer's torrent info hash did not match ours.
  InvalidInfoHash,

  #[error("protocol error: {0}")]
  /// The wire framing or a message's payload shape violated the protocol
  /// (oversized length prefix, a message id paired with the wrong payload
  /// length, a malformed extension handshake dictionary, ...).
  Protocol(String),

  #[error("{0}")]
  /// An IO error occurred.
  Io(std::io::Error),
}

impl From<IoError> for PeerError {
  fn from(value: IoError) -> Self {
    Self::Io(value)
  }
}

impl<T> From<SendError<T>> for PeerError {
  fn from(_: SendError<T>) -> Self {
    Self::Channel
  }
}

pub type ConnectResult<T, E = ConnectError> = std::result::Result<T, E>;

/// Errors arising from the dial-side of the peer connection manager (§4.G).
/// None of these tear anything down beyond the attempted connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
  #[error("total or per-torrent connection limit reached")]
  ConnectionLimit,

  #[error("peer {0} is banned")]
  PeerBanned(SocketAddr),

  #[error("already dialling or connected to {0}")]
  AlreadyConnecting(SocketAddr),

  #[error("connection attempt to {0} timed out")]
  Timeout(SocketAddr),

  #[error("{0}")]
  Session(#[from] PeerError),
}

/// Errors raised by misuse of the public client API (addressing a peer or
/// torrent that isn't tracked).
#[derive(Debug, Clone, Copy, thiserror::Error)]
pub enum ClientError {
  #[error("not connected to this peer")]
  NotConnected,

  #[error("no such peer")]
  PeerNotFound,
}
