use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::blockinfo::{BlockData, BlockInfo};
use crate::counter::ThruputCounters;
use crate::error::disk::ReadError;
use crate::PieceIndex;

use self::session::SessionState;

pub mod codec;
pub mod extension;
pub mod id;
pub mod manager;
pub mod session;

/// The channel other components use to send commands to a peer session.
pub type Sender = UnboundedSender<Command>;
/// The channel a peer session listens on for commands.
pub type Receiver = UnboundedReceiver<Command>;

/// Commands a peer session receives from disk or its owning torrent.
#[derive(Debug)]
pub enum Command {
  /// A block this peer requested has been read from disk and is ready to
  /// be sent as a `piece` message.
  BlockReady { block_info: BlockInfo, data: BlockData },
  /// Disk failed to read a block this peer requested.
  ReadError { block_info: BlockInfo, error: ReadError },
  /// The torrent completed a piece; announce it to this peer with `have`.
  PieceCompleted { index: PieceIndex },
  /// Gracefully end this session.
  Shutdown,
}

/// The most essential information of a peer session that is sent to the
/// torrent with each session tick.
pub struct SessionTick {
  /// A snapshot of the session state.
  pub state: SessionState,
  /// Various transfer statistics.
  pub counters: ThruputCounters,
  /// The number of pieces the peer has available.
  pub piece_count: usize,
}
