//! the engine is the top-level coordinator that runs and manages all entities
//! in the torrent engine. The user interacts with the engine via the
//! [`EngineHandle`] which exposes a restricted public API. The underlying
//! communication method is [tokio mpsc channel].
//!
//! The engine is spawned as a [tokio task] and runs in the background.
//! As with spawning other tokio tasks, it must be done within the context
//! of a tokio executor.
//!
//! The engine is run until an unrecoverable error occurs, or until the
//! user seeds a shutdown command.

use std::{
  collections::HashMap,
  net::{Ipv4Addr, SocketAddr},
  sync::atomic::AtomicUsize,
  sync::Arc,
  time::Instant,
};

use serde::Serialize;
use tokio::{
  sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
  sync::oneshot,
  task,
};

use crate::{
  alert::{AlertReceiver, AlertSender},
  conf::{Conf, TorrentConf},
  disk::{self, JoinHandle},
  error::{EngineResult, Error, NewTorrentError, TorrentResult},
  metainfo::Metainfo,
  storage_info::StorageInfo,
  torrent::stats::{PeerSnapshot, TorrentSnapshot},
  torrent::{self, Torrent},
  Bitfield, Sha1Hash, TorrentId,
};

/// The channel through which the user can send commands to the engine.
pub type Sender = UnboundedSender<Command>;
/// The channel on which the engine listens for commands from the user.
type Receiver = UnboundedReceiver<Command>;

/// The type of commands that the engine can receive.
pub enum Command {
  /// Contains the information for creating a new torrent.
  /// warning: the `TorrentParams` is too large, suggesting convert into Box<>
  CreateTorrent {
    id: TorrentId,
    params: Box<TorrentParams>,
  },
  /// Torrent allocation result. If successful, the id of the allocated
  /// torrent is returned for identification, if not, the reason of the
  /// error is included.
  TorrentAllocation {
    id: TorrentId,
    result: Result<(), NewTorrentError>,
  },
  /// Gracefully shuts down the engine and waits for all its torrents to do
  /// the same.
  Shutdown,

  /// Reports a snapshot of every running torrent.
  GetTorrents { reply: oneshot::Sender<Vec<TorrentSnapshot>> },
  /// Reports a snapshot of one torrent, if it's running.
  GetTorrent { info_hash: Sha1Hash, reply: oneshot::Sender<Option<TorrentSnapshot>> },
  /// Reports a snapshot of every peer of one torrent, if it's running.
  GetPeers { info_hash: Sha1Hash, reply: oneshot::Sender<Option<Vec<PeerSnapshot>>> },
  /// Removes a torrent, optionally deleting its on-disk files.
  RemoveTorrent { info_hash: Sha1Hash, delete_files: bool, reply: oneshot::Sender<Result<(), String>> },
  /// Pauses a running torrent.
  PauseTorrent { info_hash: Sha1Hash, reply: oneshot::Sender<Result<(), String>> },
  /// Resumes a paused torrent.
  ResumeTorrent { info_hash: Sha1Hash, reply: oneshot::Sender<Result<(), String>> },
  /// Reports the engine's aggregate status.
  GetStatus { reply: oneshot::Sender<EngineStatus> },
  /// Reports the engine's current configuration.
  GetConfig { reply: oneshot::Sender<Conf> },
  /// Replaces the engine's default configuration, applied to future
  /// torrents (running torrents keep whatever they were started with).
  UpdateConfig { conf: Box<Conf>, reply: oneshot::Sender<Conf> },
}

/// The engine's aggregate status, as reported by the `getStatus` and
/// `getStats` RPC calls.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
  pub running: bool,
  pub uptime_secs: u64,
  pub torrent_count: usize,
  pub download_rate: i64,
  pub upload_rate: i64,
}

/// Spawns the engine as a tokio task.
///
/// As with spawning other tokio tasks, it must be done within the context
/// of a tokio executor.
///
/// The return value is a tuple of an [`EngineHandle`], with may be used to
/// send the engine commands, and an [`AlertReceiver`], to which
/// various components in the engine will send alerts of events.
pub fn spawn(conf: Conf) -> EngineResult<(EngineHandle, AlertReceiver)> {
  log::info!("Spawning engine task");

  // crate alert channels and return alert port to user
  let (alert_tx, alert_rx) = mpsc::unbounded_channel();
  let (mut engine, tx) = Engine::new(conf, alert_tx)?;

  let join_handle = task::spawn(async move { engine.run().await });
  log::info!("Spawning engine task");

  Ok((
    EngineHandle {
      tx,
      join_handle: Some(join_handle),
    },
    alert_rx,
  ))
}

/// Information for creating a new torrent.
pub struct TorrentParams {
  /// Contains the torrent's metadata.
  pub metainfo: Metainfo,
  /// If set, overrides the default global config.
  pub conf: Option<TorrentConf>,
  /// Whether to download or seed the torrent.
  ///
  /// This is expected to be removed as this will become automatic once
  /// torrent resume data is supported.
  pub mode: Mode,
  /// The address on which the torrent should listen for new peers.
  pub listen_addr: Option<SocketAddr>,
}

/// The download mode.
///
/// TODO: remove in favor of automatic detection.
///
/// TODO: when seeding is specified, we need to verify that the files to be
/// seeded exist and are complete.
#[derive(Debug)]
pub enum Mode {
  Download { seeds: Vec<SocketAddr> },
  Seed,
}

impl Mode {
  fn own_pieces(&self, piece_count: usize) -> Bitfield {
    match self {
      Mode::Download { .. } => Bitfield::repeat(false, piece_count),
      Mode::Seed => Bitfield::repeat(true, piece_count),
    }
  }

  fn seeds(self) -> Vec<SocketAddr> {
    match self {
      Mode::Download { seeds } => seeds,
      _ => Vec::new(),
    }
  }
}

struct Engine {
  /// All currently running torrents in engine.
  torrents: HashMap<TorrentId, TorrentEntry>,

  /// The port on which other entities in the engine,
  /// or the API consumer sends the engine commands.
  cmd_rx: Receiver,

  /// the disk channel
  disk_tx: disk::Sender,
  disk_join_handle: Option<disk::JoinHandle>,

  /// The channel on which tasks in the engine post alerts to user.
  alert_tx: AlertSender,

  /// The global engine configuration that includes defaults for torrents
  /// whose config is not overridden.
  conf: Conf,

  /// When the engine was spawned, used to report uptime.
  started_at: Instant,

  /// Total peer connections across every running torrent, shared with
  /// each torrent's peer manager so `max_connections` is enforced as a
  /// true cross-torrent total.
  connection_count: Arc<AtomicUsize>,
}

/// A running torrent's entry in the engine.
struct TorrentEntry {
  /// The torrent's command channel on which engine sends commands to torrent.
  tx: torrent::Sender,
  /// The torrent task's join handle, used during shutdown.
  join_handle: Option<task::JoinHandle<TorrentResult<()>>>,
  info_hash: Sha1Hash,
  name: String,
  storage_info: StorageInfo,
}

impl Engine {
  /// Creates a new engine, spawning the disk task.
  fn new(conf: Conf, alert_tx: AlertSender) -> EngineResult<(Self, Sender)> {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (disk_join_handle, disk_tx) = disk::spawn(cmd_tx.clone())?;

    Ok((
      Engine {
        torrents: HashMap::new(),
        cmd_rx,
        disk_tx,
        disk_join_handle: Some(disk_join_handle),
        alert_tx,
        conf,
        started_at: Instant::now(),
        connection_count: Arc::new(AtomicUsize::new(0)),
      },
      cmd_tx,
    ))
  }

  async fn run(&mut self) -> EngineResult<()> {
    log::info!("Starting engine");

    while let Some(cmd) = self.cmd_rx.recv().await {
      match cmd {
        Command::CreateTorrent { id, params } => {
          self.create_torrent(id, params).await?
        }
        Command::TorrentAllocation { id, result } => match result {
          Ok(_) => {
            log::info!("Torrent {} allocated on disk", id);
          }
          Err(e) => {
            log::error!("Error allocating torrent {} on disk: {}", id, e);
          }
        },
        Command::Shutdown => {
          self.shutdown().await?;
          break;
        }
        Command::GetTorrents { reply } => {
          let _ = reply.send(self.torrent_snapshots().await);
        }
        Command::GetTorrent { info_hash, reply } => {
          let snapshot = match self.find_torrent(info_hash) {
            Some(entry) => {
              let (tx, rx) = oneshot::channel();
              if entry.tx.send(torrent::Command::GetSnapshot { name: entry.name.clone(), reply: tx }).is_ok() {
                rx.await.ok()
              } else {
                None
              }
            }
            None => None,
          };
          let _ = reply.send(snapshot);
        }
        Command::GetPeers { info_hash, reply } => {
          let peers = match self.find_torrent(info_hash) {
            Some(entry) => {
              let (tx, rx) = oneshot::channel();
              if entry.tx.send(torrent::Command::GetPeerSnapshots { reply: tx }).is_ok() {
                rx.await.ok()
              } else {
                None
              }
            }
            None => None,
          };
          let _ = reply.send(peers);
        }
        Command::RemoveTorrent { info_hash, delete_files, reply } => {
          let _ = reply.send(self.remove_torrent(info_hash, delete_files).await);
        }
        Command::PauseTorrent { info_hash, reply } => {
          let result = match self.find_torrent(info_hash) {
            Some(entry) => entry.tx.send(torrent::Command::Pause).map_err(|_| "torrent is no longer running".to_string()),
            None => Err("no such torrent".to_string()),
          };
          let _ = reply.send(result);
        }
        Command::ResumeTorrent { info_hash, reply } => {
          let result = match self.find_torrent(info_hash) {
            Some(entry) => entry.tx.send(torrent::Command::Resume).map_err(|_| "torrent is no longer running".to_string()),
            None => Err("no such torrent".to_string()),
          };
          let _ = reply.send(result);
        }
        Command::GetStatus { reply } => {
          let snapshots = self.torrent_snapshots().await;
          let _ = reply.send(EngineStatus {
            running: true,
            uptime_secs: self.started_at.elapsed().as_secs(),
            torrent_count: self.torrents.len(),
            download_rate: snapshots.iter().map(|s| s.download_rate).sum(),
            upload_rate: snapshots.iter().map(|s| s.upload_rate).sum(),
          });
        }
        Command::GetConfig { reply } => {
          let _ = reply.send(self.conf.clone());
        }
        Command::UpdateConfig { conf, reply } => {
          self.conf = *conf;
          let _ = reply.send(self.conf.clone());
        }
      }
    }

    Ok(())
  }

  fn find_torrent(&self, info_hash: Sha1Hash) -> Option<&TorrentEntry> {
    self.torrents.values().find(|entry| entry.info_hash == info_hash)
  }

  async fn torrent_snapshots(&self) -> Vec<TorrentSnapshot> {
    let mut snapshots = Vec::with_capacity(self.torrents.len());
    for entry in self.torrents.values() {
      let (tx, rx) = oneshot::channel();
      if entry.tx.send(torrent::Command::GetSnapshot { name: entry.name.clone(), reply: tx }).is_ok() {
        if let Ok(snapshot) = rx.await {
          snapshots.push(snapshot);
        }
      }
    }
    snapshots
  }

  async fn remove_torrent(&mut self, info_hash: Sha1Hash, delete_files: bool) -> Result<(), String> {
    let id = match self.torrents.iter().find(|(_, entry)| entry.info_hash == info_hash).map(|(id, _)| *id) {
      Some(id) => id,
      None => return Err("no such torrent".to_string()),
    };
    let mut entry = self.torrents.remove(&id).expect("torrent entry vanished");
    entry.tx.send(torrent::Command::Shutdown).ok();
    if let Some(join_handle) = entry.join_handle.take() {
      if let Ok(Err(e)) = join_handle.await {
        log::warn!("torrent {id} reported an error while shutting down for removal: {e}");
      }
    }
    if delete_files {
      if let Err(e) = entry.storage_info.delete_files() {
        return Err(format!("failed to delete files: {e}"));
      }
    }
    Ok(())
  }

  /// Creates and spawns a new torrent based on the parameters given.
  async fn create_torrent(
    &mut self,
    id: TorrentId,
    params: Box<TorrentParams>,
  ) -> EngineResult<()> {
    let conf = params.conf.unwrap_or_else(|| self.conf.torrent.clone());
    let storage_info =
      StorageInfo::new(&params.metainfo, self.conf.engine.download_dir.clone());

    let trackers = params.metainfo.trackers.clone();
    let piece_hashes = params.metainfo.pieces.clone();
    let own_pieces = params.mode.own_pieces(storage_info.piece_count);

    // crate and spawn torrent
    // TODO: For now we spawn automatically, but later we add torrent
    // pause/restart APIs, this will be separate step. There should be
    // a `start` flag in `params` that says whether to immediately spawn
    // a new torrent (or maybe in `TorrentConf`).
    let (mut torrent, torrent_tx) = Torrent::new(torrent::Params {
      id,
      name: params.metainfo.name.clone(),
      disk_tx: self.disk_tx.clone(),
      info_hash: params.metainfo.info_hash,
      storage_info: storage_info.clone(),
      own_pieces,
      piece_hashes,
      trackers,
      client_id: self.conf.engine.client_id,
      listen_addr: params
        .listen_addr
        .unwrap_or_else(|| SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0)),
      conf,
      piece_conf: self.conf.piece.clone(),
      peer_conf: self.conf.peer.clone(),
      tracker_conf: self.conf.tracker.clone(),
      alert_tx: self.alert_tx.clone(),
      connection_count: self.connection_count.clone(),
    });

    // Allocate torrent on disk. This is an asynchronous process and we can
    // start the torrent in the meantime.
    //
    // Technically we could have issues if the torrent connects to peers
    // that send data before we manage to allocate the (empty) files on
    // disk. However, this should be an extremely pathological case for
    // 2 reasons:
    // - Most torrents would be started without peers, so a torrent would
    //   have to wait for peers from its tracker(s). This should be a
    //   a sufficiently long time to allocate torrent on disk.
    // - Then, even if we manage to connect peers quickly, testing shows
    //   that they don't tend to unchoke use immediately.
    //
    // Thus there is little chance to receive data and thus cause a disk
    // write or disk read immediately.
    let storage_info_for_entry = storage_info.clone();
    self.disk_tx.send(disk::Command::NewTorrent {
      id,
      storage_info,
      piece_hashes: params.metainfo.pieces,
      torrent_tx: torrent_tx.clone(),
    })?;

    let seeds = params.mode.seeds();
    let join_handle = task::spawn(async move { torrent.start(&seeds).await });

    self.torrents.insert(
      id,
      TorrentEntry {
        tx: torrent_tx,
        join_handle: Some(join_handle),
        info_hash: params.metainfo.info_hash,
        name: params.metainfo.name.clone(),
        storage_info: storage_info_for_entry,
      },
    );

    Ok(())
  }

  async fn shutdown(&mut self) -> EngineResult<()> {
    log::info!("Shutting down engine");

    // tell all torrents to shut down and join their tasks
    for torrent in self.torrents.values_mut() {
      // the torrent task may no longer be running, so don't panic here
      torrent.tx.send(torrent::Command::Shutdown).ok();
    }

    for torrent in self.torrents.values_mut() {
      // TODO: if torrent task is not running, does this panic.
      if let Err(e) = torrent
        .join_handle
        .take()
        .expect("torrent join handle missing")
        .await
        .expect("task error")
      {
        log::error!("Torrent error: {}", e);
      }
    }

    // send a shutdown command to disk
    self.disk_tx.send(disk::Command::Shutdown)?;
    // and join on its handle
    self
      .disk_join_handle
      .take()
      .expect("disk join handle missing")
      .await
      .expect("disk task has panicked")
      .map_err(Error::from)?;

    Ok(())
  }
}

/// A handle to the currently running torrent engine.
pub struct EngineHandle {
  tx: Sender,
  join_handle: Option<JoinHandle>,
}

impl EngineHandle {
  /// Returns a cloned command sender, for components (such as the daemon
  /// RPC server) that need to issue commands from outside this handle's
  /// ownership of the engine task's join handle.
  pub fn sender(&self) -> Sender {
    self.tx.clone()
  }

  /// Creates and starts a torrent, if its metainfo is valid.
  ///
  /// If successful, it returns the id of the torrent.
  /// This id can be used to identify the torrent when
  /// issuing further commands to engine.
  pub fn create_torrent(
    &self,
    params: TorrentParams,
  ) -> EngineResult<TorrentId> {
    log::trace!("Creating torrent");
    let id = TorrentId::new();
    self.tx.send(Command::CreateTorrent {
      id,
      params: Box::new(params),
    })?;
    Ok(id)
  }

  /// Gracefully shuts down the engine and waits for all
  /// its torrents to do the same.
  ///
  /// # Panics
  ///
  /// This method panics if the engine has already been
  /// shut down.
  pub async fn shutdown(mut self) -> EngineResult<()> {
    log::trace!("Shutting down engine task");
    self.tx.send(Command::Shutdown)?;
    if let Err(e) = self
      .join_handle
      .take()
      .expect("engine already shut down")
      .await
      .expect("task error")
    {
      log::error!("Engine error: {}", e);
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use std::path::PathBuf;

  use crate::storage_info::{FileInfo, FsStructure};

  use super::*;

  fn test_engine() -> Engine {
    let (_cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (disk_tx, _disk_rx) = mpsc::unbounded_channel();
    let (alert_tx, _alert_rx) = mpsc::unbounded_channel();
    Engine {
      torrents: HashMap::new(),
      cmd_rx,
      disk_tx,
      disk_join_handle: None,
      alert_tx,
      conf: Conf::new(PathBuf::from("/tmp/fileswarm-test")),
      started_at: Instant::now(),
      connection_count: Arc::new(AtomicUsize::new(0)),
    }
  }

  fn test_storage_info() -> StorageInfo {
    StorageInfo {
      piece_count: 1,
      piece_len: 16,
      last_piece_len: 16,
      download_len: 16,
      download_dir: PathBuf::from("/tmp"),
      structure: FsStructure::File(FileInfo { path: PathBuf::from("test.bin"), len: 16, torrent_offset: 0 }),
    }
  }

  /// Answers every `GetSnapshot`/`GetPeerSnapshots`/`Shutdown` command a
  /// stand-in torrent entry receives, standing in for a real torrent task.
  async fn fake_torrent(mut rx: UnboundedReceiver<torrent::Command>, name: String) {
    while let Some(cmd) = rx.recv().await {
      match cmd {
        torrent::Command::GetSnapshot { name, reply } => {
          let _ = reply.send(TorrentSnapshot {
            info_hash: [0u8; 20],
            name: name.clone(),
            state: crate::torrent::stats::TorrentState::Downloading,
            progress: 0.0,
            downloaded: 0,
            uploaded: 0,
            download_rate: 7,
            upload_rate: 3,
            peer_count: 0,
            piece_count: 1,
          });
        }
        torrent::Command::GetPeerSnapshots { reply } => {
          let _ = reply.send(Vec::new());
        }
        torrent::Command::Shutdown => break,
        _ => {}
      }
    }
    let _ = name;
  }

  fn insert_fake_torrent(engine: &mut Engine, id: TorrentId, info_hash: Sha1Hash, name: &str) {
    let (tx, rx) = mpsc::unbounded_channel();
    let join_handle = task::spawn(fake_torrent(rx, name.to_string()));
    engine.torrents.insert(
      id,
      TorrentEntry {
        tx,
        join_handle: None,
        info_hash,
        name: name.to_string(),
        storage_info: test_storage_info(),
      },
    );
    drop(join_handle);
  }

  #[tokio::test]
  async fn find_torrent_locates_by_info_hash() {
    let mut engine = test_engine();
    let id = TorrentId::new();
    insert_fake_torrent(&mut engine, id, [9u8; 20], "demo");

    assert!(engine.find_torrent([9u8; 20]).is_some());
    assert!(engine.find_torrent([1u8; 20]).is_none());
  }

  #[tokio::test]
  async fn torrent_snapshots_collects_every_running_torrent() {
    let mut engine = test_engine();
    insert_fake_torrent(&mut engine, TorrentId::new(), [1u8; 20], "one");
    insert_fake_torrent(&mut engine, TorrentId::new(), [2u8; 20], "two");

    let snapshots = engine.torrent_snapshots().await;
    assert_eq!(snapshots.len(), 2);
    assert_eq!(snapshots.iter().map(|s| s.download_rate).sum::<i64>(), 14);
  }

  #[tokio::test]
  async fn remove_torrent_evicts_the_entry() {
    let mut engine = test_engine();
    let id = TorrentId::new();
    insert_fake_torrent(&mut engine, id, [5u8; 20], "demo");

    assert!(engine.remove_torrent([5u8; 20], false).await.is_ok());
    assert!(engine.find_torrent([5u8; 20]).is_none());
  }

  #[tokio::test]
  async fn remove_torrent_reports_an_error_for_an_unknown_info_hash() {
    let mut engine = test_engine();
    let result = engine.remove_torrent([42u8; 20], false).await;
    assert_eq!(result, Err("no such torrent".to_string()));
  }
}
