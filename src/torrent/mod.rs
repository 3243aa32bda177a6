//! Torrent session (component L): binds a metainfo, piece manager, disk
//! layer, peer manager, and tracker coordinator together and orchestrates
//! their interaction for the lifetime of one torrent.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, Mutex};
use tokio::time::interval;
use url::Url;

use crate::alert::{Alert, AlertSender};
use crate::blockinfo::BlockInfo;
use crate::conf::{PeerConf, PieceConf, TorrentConf, TrackerConf};
use crate::disk;
use crate::error::disk::{ReadError, WriteError};
use crate::error::torrent::Result as TorrentResult;
use crate::peer::manager::{EventReceiver, ManagerEvent, PeerManager};
use crate::peer::session::SessionContext;
use crate::peer::SessionTick;
use crate::piece::manager::{PieceEvent, PieceManager};
use crate::storage_info::StorageInfo;
use crate::torrent::stats::{PeerSnapshot, TorrentSnapshot, TorrentState};
use crate::tracker::announce::Event as TrackerEvent;
use crate::tracker::coordinator::TrackerCoordinator;
use crate::{Bitfield, PeerId, PieceIndex, Sha1Hash, TorrentId};

pub mod stats;

/// The channel other components use to send commands to a torrent.
pub type Sender = UnboundedSender<Command>;
/// The channel a torrent listens on for commands.
type Receiver = UnboundedReceiver<Command>;

/// The types of messages a torrent can receive from other parts of the
/// engine.
pub enum Command {
  /// Disk finished (or failed) writing a completed piece.
  PieceCompletion(Result<PieceCompletion, WriteError>),

  /// There was an error reading a block a peer had requested.
  ReadError { block_info: BlockInfo, error: ReadError },

  /// Disk finished allocating and resume-verifying this torrent's files.
  Resumed { bitfield: Bitfield },

  /// Resume-time verification hashed one piece against its on-disk bytes.
  PieceVerified { index: PieceIndex, valid: bool },

  /// A peer session has a state change to report.
  PeerState { addr: SocketAddr, info: SessionTick },

  /// A piece failed verification, gave up retrying, or the piece manager
  /// entered endgame mode. `PieceComplete`/`DownloadComplete` are handled
  /// by the reporting session directly and never sent here.
  PieceOutcome(PieceEvent),

  /// Disconnects every peer and stops announcing/dialing until [`Resume`](Command::Resume).
  /// On-disk state and the piece map are untouched.
  Pause,

  /// Reverses a prior [`Pause`](Command::Pause): re-announces `started` and
  /// resumes dialing.
  Resume,

  /// Reports a serializable snapshot of the torrent's current state.
  GetSnapshot { name: String, reply: oneshot::Sender<TorrentSnapshot> },

  /// Reports a serializable snapshot of every connected peer.
  GetPeerSnapshots { reply: oneshot::Sender<Vec<PeerSnapshot>> },

  /// Gracefully shuts down the torrent: every peer session is disconnected,
  /// a final `stopped` announce is sent, and on-disk state is kept.
  Shutdown,
}

/// The outcome of writing a completed piece to disk.
#[derive(Debug)]
pub struct PieceCompletion {
  /// The index of the piece.
  pub index: PieceIndex,
  /// Whether the piece is valid. Pieces never reach here invalid (the piece
  /// manager already verified them), but the field is kept to mirror the
  /// disk write outcome plainly.
  pub is_valid: bool,
}

/// Parameters needed to start a new torrent.
pub struct Params {
  pub id: TorrentId,
  /// The torrent's display name, carried only for the periodic stats
  /// alert; per-call RPC snapshots still take their own `name` argument.
  pub name: String,
  pub disk_tx: disk::Sender,
  pub info_hash: Sha1Hash,
  pub storage_info: StorageInfo,
  pub own_pieces: Bitfield,
  pub piece_hashes: Vec<u8>,
  pub trackers: Vec<Url>,
  pub client_id: PeerId,
  pub listen_addr: SocketAddr,
  pub conf: TorrentConf,
  pub piece_conf: PieceConf,
  pub peer_conf: PeerConf,
  pub tracker_conf: TrackerConf,
  pub alert_tx: AlertSender,
  /// Shared cross-torrent connection counter; see [`PeerManager::new`].
  pub connection_count: Arc<std::sync::atomic::AtomicUsize>,
}

pub struct Torrent {
  id: TorrentId,
  name: String,
  info_hash: Sha1Hash,
  client_id: PeerId,
  listen_addr: SocketAddr,
  storage_info: StorageInfo,
  conf: TorrentConf,
  piece_conf: PieceConf,
  tracker_conf: TrackerConf,

  disk_tx: disk::Sender,
  alert_tx: AlertSender,
  cmd_tx: Sender,
  cmd_rx: Receiver,

  piece_manager: Arc<Mutex<PieceManager>>,
  peer_manager: PeerManager,
  peer_events: EventReceiver,
  /// Rebuilt in [`Self::start`] once the listener is bound and the real
  /// port is known; the coordinator built here announces on port 0 and is
  /// never used for an actual announce.
  tracker_coordinator: TrackerCoordinator,
  trackers: Vec<Url>,

  /// Cumulative payload totals, reconstructed from each peer's latest tick
  /// (their counters are already cumulative), used for tracker announces
  /// and stats snapshots.
  peer_totals: HashMap<SocketAddr, (u64, u64)>,
  downloaded: u64,
  uploaded: u64,

  last_tick: HashMap<SocketAddr, SessionTick>,

  complete: bool,
  /// Set by [`Command::Pause`]; suppresses dialing (seeds, tracker-supplied
  /// peers, and reconnects) and tracker announces until [`Command::Resume`].
  paused: bool,
}

impl Torrent {
  /// Creates a new torrent, returning it along with the channel other
  /// components use to send it commands.
  pub fn new(params: Params) -> (Self, Sender) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

    let piece_lens: Vec<u32> = (0..params.storage_info.piece_count)
      .map(|index| params.storage_info.piece_len(index).expect("piece index within bounds"))
      .collect();
    let mut piece_manager = PieceManager::new(params.piece_conf.clone(), params.piece_hashes, piece_lens);
    piece_manager.seed_from_bitfield(params.own_pieces);

    let (peer_manager, peer_events) = PeerManager::new(params.peer_conf, params.connection_count);
    let tracker_coordinator = TrackerCoordinator::new(Vec::new(), params.tracker_conf.clone(), params.info_hash, params.client_id, params.listen_addr.port());

    let torrent = Self {
      id: params.id,
      name: params.name,
      info_hash: params.info_hash,
      client_id: params.client_id,
      listen_addr: params.listen_addr,
      storage_info: params.storage_info,
      conf: params.conf,
      piece_conf: params.piece_conf,
      tracker_conf: params.tracker_conf,
      disk_tx: params.disk_tx,
      alert_tx: params.alert_tx,
      cmd_tx: cmd_tx.clone(),
      cmd_rx,
      piece_manager: Arc::new(Mutex::new(piece_manager)),
      peer_manager,
      peer_events,
      tracker_coordinator,
      trackers: params.trackers,
      peer_totals: HashMap::new(),
      downloaded: 0,
      uploaded: 0,
      last_tick: HashMap::new(),
      complete: false,
      paused: false,
    };
    (torrent, cmd_tx)
  }

  fn session_ctx(&self) -> Arc<SessionContext> {
    Arc::new(SessionContext {
      id: self.id,
      info_hash: self.info_hash,
      client_id: self.client_id,
      piece_conf: self.piece_conf.clone(),
      piece_manager: self.piece_manager.clone(),
      disk_tx: self.disk_tx.clone(),
      torrent_tx: self.cmd_tx.clone(),
    })
  }

  async fn piece_count(&self) -> usize {
    self.storage_info.piece_count
  }

  /// Binds the listener, dials the given seed addresses, announces
  /// `started` to every tracker, and runs the torrent's main loop until it
  /// is told to shut down.
  pub async fn start(&mut self, seeds: &[SocketAddr]) -> TorrentResult<()> {
    log::info!("starting torrent {}", self.id);

    let listener = TcpListener::bind(self.listen_addr).await?;
    self.listen_addr = listener.local_addr()?;
    self.tracker_coordinator = TrackerCoordinator::new(
      self.trackers.clone(),
      self.tracker_conf.clone(),
      self.info_hash,
      self.client_id,
      self.listen_addr.port(),
    );
    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
      loop {
        match listener.accept().await {
          Ok((socket, addr)) => {
            if inbound_tx.send((socket, addr)).is_err() {
              break;
            }
          }
          Err(e) => {
            log::warn!("listener accept error: {e}");
            break;
          }
        }
      }
    });

    let piece_count = self.piece_count().await;
    for &addr in seeds {
      let ctx = self.session_ctx();
      if let Err(e) = self.peer_manager.dial(addr, ctx, piece_count).await {
        log::debug!("failed to dial seed {addr}: {e}");
      }
    }

    self.announce(Some(TrackerEvent::Started)).await;

    let mut announce_tick = interval(self.conf.announce_interval);
    announce_tick.tick().await; // first tick fires immediately; skip it
    let mut sweep_tick = interval(Duration::from_secs(10));
    let mut stats_tick = interval(self.conf.stats_interval);

    loop {
      tokio::select! {
        cmd = self.cmd_rx.recv() => {
          match cmd {
            Some(Command::Shutdown) | None => break,
            Some(cmd) => self.handle_command(cmd).await?,
          }
        }
        event = self.peer_events.recv() => {
          if let Some(event) = event {
            self.handle_manager_event(event).await;
          }
        }
        inbound = inbound_rx.recv() => {
          if let Some((socket, addr)) = inbound {
            self.handle_inbound(socket, addr, piece_count).await;
          }
        }
        _ = announce_tick.tick() => {
          if !self.paused {
            self.announce(None).await;
          }
        }
        _ = sweep_tick.tick() => {
          let swept = self.piece_manager.lock().await.sweep_stale_requests();
          if swept > 0 {
            log::debug!("torrent {} swept {swept} stale requests", self.id);
          }
        }
        _ = stats_tick.tick() => {
          let snapshot = self.snapshot(self.name.clone()).await;
          let _ = self.alert_tx.send(Alert::TorrentStats { id: self.id, snapshot });
        }
      }
    }

    self.shutdown().await;
    Ok(())
  }

  async fn handle_inbound(&mut self, socket: TcpStream, addr: SocketAddr, piece_count: usize) {
    let ctx = self.session_ctx();
    if let Err(e) = self.peer_manager.adopt(socket, addr, ctx, piece_count).await {
      log::debug!("rejected inbound connection from {addr}: {e}");
    }
  }

  async fn handle_command(&mut self, cmd: Command) -> TorrentResult<()> {
    match cmd {
      Command::PieceCompletion(Ok(completion)) => {
        log::debug!("torrent {} wrote piece {}", self.id, completion.index);
        if self.conf.alerts.completed_pieces {
          let _ = self.alert_tx.send(Alert::PieceWritten {
            id: self.id,
            index: completion.index,
          });
        }
        self.broadcast_have(completion.index);
        if self.piece_manager.lock().await.is_download_complete() && !self.complete {
          self.complete = true;
          self.announce(Some(TrackerEvent::Completed)).await;
          let _ = self.alert_tx.send(Alert::TorrentComplete(self.id));
        }
      }
      Command::PieceCompletion(Err(error)) => {
        log::error!("torrent {} failed to write a piece: {error}", self.id);
        return Err(error.into());
      }
      Command::ReadError { block_info, error } => {
        log::warn!("torrent {} disk read error for {block_info}: {error}", self.id);
      }
      Command::Resumed { bitfield } => {
        log::info!("torrent {} resumed with {} pieces already present", self.id, bitfield.count_ones());
        let complete = {
          let mut manager = self.piece_manager.lock().await;
          manager.seed_from_bitfield(bitfield);
          manager.is_download_complete()
        };
        self.complete = complete;
        let _ = self.alert_tx.send(Alert::VerificationComplete { id: self.id });
      }
      Command::PieceVerified { index, valid } => {
        let alert = if valid {
          Alert::PieceVerified { id: self.id, index }
        } else {
          Alert::ResumePieceFailed { id: self.id, index }
        };
        let _ = self.alert_tx.send(alert);
      }
      Command::PeerState { addr, info } => {
        let (down, up) = (info.counters.payload_downloaded.total(), info.counters.payload_uploaded.total());
        let (prev_down, prev_up) = self.peer_totals.get(&addr).copied().unwrap_or((0, 0));
        self.downloaded += down.saturating_sub(prev_down);
        self.uploaded += up.saturating_sub(prev_up);
        self.peer_totals.insert(addr, (down, up));
        self.last_tick.insert(addr, info);
      }
      Command::PieceOutcome(event) => match event {
        PieceEvent::PieceFailed { index, retry_count } => {
          log::debug!("torrent {} piece {index} failed verification (retry {retry_count})", self.id);
          let _ = self.alert_tx.send(Alert::PieceFailed { id: self.id, index, retry_count });
        }
        PieceEvent::PieceGaveUp { index } => {
          log::warn!("torrent {} gave up on piece {index} after exhausting retries", self.id);
          let _ = self.alert_tx.send(Alert::PieceGaveUp { id: self.id, index });
        }
        PieceEvent::EndgameStarted { missing } => {
          log::info!("torrent {} entered endgame with {missing} pieces missing", self.id);
          let _ = self.alert_tx.send(Alert::EndgameStarted { id: self.id, missing });
        }
        PieceEvent::PieceComplete { .. } | PieceEvent::DownloadComplete => {
          // Handled by the reporting session directly; never forwarded here.
        }
      },
      Command::Pause => {
        log::info!("torrent {} pausing", self.id);
        self.paused = true;
        self.peer_manager.disconnect_all().await;
        self.announce(Some(TrackerEvent::Stopped)).await;
      }
      Command::Resume => {
        log::info!("torrent {} resuming", self.id);
        self.paused = false;
        self.announce(Some(TrackerEvent::Started)).await;
      }
      Command::GetSnapshot { name, reply } => {
        let _ = reply.send(self.snapshot(name).await);
      }
      Command::GetPeerSnapshots { reply } => {
        let _ = reply.send(self.peer_snapshots());
      }
      Command::Shutdown => unreachable!("handled by the caller"),
    }
    Ok(())
  }

  async fn handle_manager_event(&mut self, event: ManagerEvent) {
    match event {
      ManagerEvent::PeerConnected { addr, client_id: _ } => {
        log::debug!("torrent {} connected to {addr}", self.id);
        let _ = self.alert_tx.send(Alert::PeerConnected { id: self.id, addr });
      }
      ManagerEvent::PeerDisconnected { addr, reason } => {
        log::debug!("torrent {} disconnected from {addr}: {reason:?}");
        self.piece_manager.lock().await.cancel_peer(&addr);
        self.last_tick.remove(&addr);
        let _ = self.alert_tx.send(Alert::PeerDisconnected { id: self.id, addr });
      }
      ManagerEvent::PeerBanned { addr } => {
        let _ = self.alert_tx.send(Alert::PeerBanned { id: self.id, addr });
      }
      ManagerEvent::ReconnectDue { addr } => {
        if self.paused {
          return;
        }
        let ctx = self.session_ctx();
        let piece_count = self.piece_count().await;
        if let Err(e) = self.peer_manager.dial(addr, ctx, piece_count).await {
          log::debug!("reconnect to {addr} failed: {e}");
        }
      }
    }
  }

  /// Announces a completed piece to every connected peer via `have`.
  fn broadcast_have(&self, index: PieceIndex) {
    self.peer_manager.broadcast_have(index);
  }

  async fn announce(&mut self, event: Option<TrackerEvent>) {
    let left = self.storage_info.download_len.saturating_sub(self.downloaded);
    let outcome = self.tracker_coordinator.announce(event, &self.conf, self.downloaded, self.uploaded, left).await;

    if !outcome.errors.is_empty() {
      log::warn!("torrent {} had {} tracker announce error(s)", self.id, outcome.errors.len());
    }
    if self.tracker_coordinator.all_trackers_exhausted(&self.conf) {
      log::error!("torrent {}: every tracker has exceeded its error threshold", self.id);
    }

    if self.paused {
      return;
    }
    let piece_count = self.piece_count().await;
    for addr in outcome.peers {
      if self.peer_manager.is_connected(&addr) {
        continue;
      }
      let ctx = self.session_ctx();
      if let Err(e) = self.peer_manager.dial(addr, ctx, piece_count).await {
        log::trace!("failed to dial tracker-supplied peer {addr}: {e}");
      }
    }
  }

  /// Builds a serializable snapshot of this torrent's current state.
  pub async fn snapshot(&self, name: String) -> TorrentSnapshot {
    let manager = self.piece_manager.lock().await;
    let state = if self.paused {
      TorrentState::Paused
    } else if self.complete {
      TorrentState::Seeding
    } else {
      TorrentState::Downloading
    };
    TorrentSnapshot {
      info_hash: self.info_hash,
      name,
      state,
      progress: manager.progress(),
      downloaded: self.downloaded,
      uploaded: self.uploaded,
      download_rate: self.last_tick.values().map(|t| t.counters.download_rate()).sum(),
      upload_rate: self.last_tick.values().map(|t| t.counters.upload_rate()).sum(),
      peer_count: self.peer_manager.connected_count(),
      piece_count: self.storage_info.piece_count,
    }
  }

  /// Builds a serializable snapshot of every connected peer.
  pub fn peer_snapshots(&self) -> Vec<PeerSnapshot> {
    self
      .last_tick
      .values()
      .map(|tick| PeerSnapshot {
        addr: tick.state.addr,
        client: tick.state.client.as_ref().map(|c| format!("{} {}", c.name, c.version)),
        am_choking: tick.state.am_choking,
        am_interested: tick.state.am_interested,
        peer_choking: tick.state.peer_choking,
        peer_interested: tick.state.peer_interested,
        download_rate: tick.counters.download_rate(),
        upload_rate: tick.counters.upload_rate(),
        piece_count: tick.piece_count,
      })
      .collect()
  }

  async fn shutdown(&mut self) {
    log::info!("shutting down torrent {}", self.id);
    self.announce(Some(TrackerEvent::Stopped)).await;
    self.peer_manager.shutdown().await;
  }
}

#[cfg(test)]
mod tests {
  use std::path::PathBuf;

  use crate::counter::ThruputCounters;
  use crate::peer::id::ClientInfo;
  use crate::peer::session::SessionState;
  use crate::storage_info::{FileInfo, FsStructure};

  use super::*;

  fn test_torrent() -> Torrent {
    let storage_info = StorageInfo {
      piece_count: 4,
      piece_len: 16,
      last_piece_len: 16,
      download_len: 64,
      download_dir: PathBuf::from("/tmp"),
      structure: FsStructure::File(FileInfo {
        path: PathBuf::from("test.bin"),
        len: 64,
        torrent_offset: 0,
      }),
    };
    let (disk_tx, _disk_rx) = mpsc::unbounded_channel();
    let (alert_tx, _alert_rx) = mpsc::unbounded_channel();
    let (torrent, _cmd_tx) = Torrent::new(Params {
      id: TorrentId::new(),
      name: "test".to_string(),
      disk_tx,
      info_hash: [1u8; 20],
      storage_info,
      own_pieces: Bitfield::repeat(false, 4),
      piece_hashes: vec![0u8; 20 * 4],
      trackers: Vec::new(),
      client_id: *b"-FS0001-000000000000",
      listen_addr: "0.0.0.0:0".parse().unwrap(),
      conf: TorrentConf::default(),
      piece_conf: PieceConf::default(),
      peer_conf: PeerConf::default(),
      tracker_conf: TrackerConf::default(),
      alert_tx,
      connection_count: Arc::new(std::sync::atomic::AtomicUsize::new(0)),
    });
    torrent
  }

  #[tokio::test]
  async fn snapshot_reports_downloading_before_completion() {
    let torrent = test_torrent();
    let snapshot = torrent.snapshot("test".to_string()).await;
    assert_eq!(snapshot.state, TorrentState::Downloading);
    assert_eq!(snapshot.piece_count, 4);
  }

  #[tokio::test]
  async fn snapshot_reports_seeding_once_complete() {
    let mut torrent = test_torrent();
    torrent.complete = true;
    let snapshot = torrent.snapshot("test".to_string()).await;
    assert_eq!(snapshot.state, TorrentState::Seeding);
  }

  #[tokio::test]
  async fn pause_command_marks_torrent_paused_and_overrides_completion_state() {
    let mut torrent = test_torrent();
    torrent.complete = true;
    torrent.handle_command(Command::Pause).await.unwrap();
    assert!(torrent.paused);
    let snapshot = torrent.snapshot("test".to_string()).await;
    assert_eq!(snapshot.state, TorrentState::Paused);
  }

  #[tokio::test]
  async fn resume_command_clears_paused_flag() {
    let mut torrent = test_torrent();
    torrent.paused = true;
    torrent.handle_command(Command::Resume).await.unwrap();
    assert!(!torrent.paused);
  }

  #[tokio::test]
  async fn peer_state_accumulates_deltas_across_ticks() {
    let mut torrent = test_torrent();
    let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
    let state = SessionState {
      addr,
      am_choking: true,
      am_interested: false,
      peer_choking: true,
      peer_interested: false,
      extension_protocol: false,
      client: Some(ClientInfo { name: "Test", version: "1.0".to_string() }),
    };

    let mut counters = ThruputCounters::new(&PeerConf::default());
    counters.payload_downloaded.add(10);
    torrent
      .handle_command(Command::PeerState {
        addr,
        info: SessionTick { state: state.clone(), counters: counters.clone(), piece_count: 4 },
      })
      .await
      .unwrap();
    assert_eq!(torrent.downloaded, 10);

    counters.payload_downloaded.add(15);
    torrent
      .handle_command(Command::PeerState { addr, info: SessionTick { state, counters, piece_count: 4 } })
      .await
      .unwrap();
    assert_eq!(torrent.downloaded, 25);

    let peers = torrent.peer_snapshots();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].client.as_deref(), Some("Test 1.0"));
  }

  #[tokio::test]
  async fn get_snapshot_command_replies_on_its_oneshot_channel() {
    let mut torrent = test_torrent();
    let (reply_tx, reply_rx) = oneshot::channel();
    torrent.handle_command(Command::GetSnapshot { name: "demo".to_string(), reply: reply_tx }).await.unwrap();
    let snapshot = reply_rx.await.unwrap();
    assert_eq!(snapshot.name, "demo");
  }
}
