//! This module defines the alerts the API user may receive from the torrent
//! engine.
//!
//! Communication of such alerts is performed via an unbounded
//! [`tokio::sync::mpsc`] channel. Thus, the application in which the engine
//! is integrated may be driven particularly or entirely by these alerts.
//!
//! # Optional information
//!
//! By default, only the most basic alerts are broadcast from the engine.
//! The reason for this is that the crate follows a philosophy similar to
//! the one behind Rust or C++: you don't pay for what you don't use.
//!
//! This is of course not fully possible with something as complex as a
//! torrent engine, but an effort is made to make more expensive alerts
//! optional, gated by [`crate::conf::TorrentAlertConf`].

use std::net::SocketAddr;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::torrent::stats::TorrentSnapshot;
use crate::{error::Error, PieceIndex, TorrentId};

/// The channel torrent sessions and the engine post alerts on.
pub type AlertSender = UnboundedSender<Alert>;
/// The channel on which the API consumer receives alerts.
pub type AlertReceiver = UnboundedReceiver<Alert>;

/// A torrent-scoped alert, raised by a torrent session or one of its
/// subsystems.
#[derive(Debug)]
pub enum Alert {
  /// The download has finished; all pieces are verified and written.
  TorrentComplete(TorrentId),
  /// A periodic, coalesced aggregate stats update for a torrent: progress,
  /// rates, and peer count, rather than a line per peer or piece.
  TorrentStats { id: TorrentId, snapshot: TorrentSnapshot },
  /// Fatal error in a torrent, tracker announce, or peer session.
  Error(Error),

  /// A piece finished downloading and passed verification.
  PieceComplete { id: TorrentId, index: PieceIndex },
  /// A piece failed verification; it will be re-downloaded until
  /// `max_piece_retries` is exceeded.
  PieceFailed {
    id: TorrentId,
    index: PieceIndex,
    retry_count: usize,
  },
  /// A piece exhausted its retry budget. Its retry record is cleared so a
  /// later attempt is still possible.
  PieceGaveUp { id: TorrentId, index: PieceIndex },
  /// The piece manager switched into endgame mode.
  EndgameStarted { id: TorrentId, missing: usize },

  /// A peer connection was established and handshaked.
  PeerConnected { id: TorrentId, addr: SocketAddr },
  /// A peer connection ended.
  PeerDisconnected { id: TorrentId, addr: SocketAddr },
  /// A peer was banned after too many consecutive connection failures.
  PeerBanned { id: TorrentId, addr: SocketAddr },

  /// A piece was written to disk.
  PieceWritten { id: TorrentId, index: PieceIndex },
  /// A piece was hashed during resume-time verification.
  PieceVerified { id: TorrentId, index: PieceIndex },
  /// A piece failed resume-time verification.
  ResumePieceFailed { id: TorrentId, index: PieceIndex },
  /// Resume-time verification finished scanning every piece.
  VerificationComplete { id: TorrentId },
}
