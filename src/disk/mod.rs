//! Disk IO task (component K): owns every torrent's open files, assembles
//! completed pieces into writes, serves block reads through a whole-piece
//! read cache, and resume-verifies a torrent's files against its hash
//! table before trusting them.
//!
//! Pieces are already hashed and found valid by the piece manager before
//! a [`Command::WritePiece`] is ever sent here, so this task's own
//! responsibility is narrower: sanity-check the byte count, perform the
//! (blocking) positioned write, and report back.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task;

use crate::blockinfo::{BlockData, BlockInfo};
use crate::conf::{AllocationStrategy, DiskConf};
use crate::engine;
use crate::error::disk::{NewTorrentError, ReadError, WriteError};
use crate::error::EngineResult;
use crate::peer;
use crate::storage_info::{FsStructure, StorageInfo};
use crate::torrent;
use crate::{Bitfield, FileIndex, PieceIndex, TorrentId};

pub mod cache;
pub mod io;
pub mod verify;

use cache::ReadCache;
use io::file::TorrentFile;

/// The channel other components use to send commands to the disk task.
pub type Sender = UnboundedSender<Command>;
/// The channel the disk task listens on.
type Receiver = UnboundedReceiver<Command>;
/// The disk task's join handle, awaited on engine shutdown.
pub type JoinHandle = task::JoinHandle<EngineResult<()>>;

/// Commands the disk task can receive from other parts of the engine.
pub enum Command {
  /// Allocates a new torrent's files and, if any data is already present,
  /// resume-verifies it before reporting back to the engine and torrent.
  NewTorrent {
    id: TorrentId,
    storage_info: StorageInfo,
    piece_hashes: Vec<u8>,
    torrent_tx: torrent::Sender,
  },
  /// A piece finished downloading and hashed successfully; write it out.
  WritePiece { id: TorrentId, index: PieceIndex, bytes: Arc<Vec<u8>> },
  /// A peer session wants a block read back off disk.
  ReadBlock { id: TorrentId, block_info: BlockInfo, result_tx: peer::Sender },
  /// Shuts down the disk task once its queue drains.
  Shutdown,
}

struct TorrentEntry {
  storage_info: StorageInfo,
  files: Arc<Vec<RwLock<TorrentFile>>>,
  file_ranges: Arc<Vec<Range<FileIndex>>>,
  torrent_tx: torrent::Sender,
}

impl TorrentEntry {
  fn piece_len(&self, index: PieceIndex) -> u32 {
    if index == self.storage_info.piece_count - 1 {
      self.storage_info.last_piece_len
    } else {
      self.storage_info.piece_len
    }
  }

  fn piece_offset(&self, index: PieceIndex) -> u64 {
    index as u64 * self.storage_info.piece_len as u64
  }
}

struct Disk {
  torrents: HashMap<TorrentId, TorrentEntry>,
  cache: ReadCache,
  conf: DiskConf,
  cmd_rx: Receiver,
  engine_tx: engine::Sender,
}

/// Spawns the disk task as a tokio task.
///
/// `engine_tx` is used to report the outcome of a torrent's file
/// allocation back to the engine; per-torrent progress (resume state,
/// piece completions, read errors) is reported directly to the torrent
/// via the channel it supplies with [`Command::NewTorrent`].
pub fn spawn(engine_tx: engine::Sender) -> EngineResult<(JoinHandle, Sender)> {
  let conf = DiskConf::default();
  let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
  let mut disk = Disk {
    torrents: HashMap::new(),
    cache: ReadCache::new(conf.read_cache_size),
    conf,
    cmd_rx,
    engine_tx,
  };
  let join_handle = task::spawn(async move { disk.run().await });
  Ok((join_handle, cmd_tx))
}

impl Disk {
  async fn run(&mut self) -> EngineResult<()> {
    log::info!("starting disk task");
    while let Some(cmd) = self.cmd_rx.recv().await {
      match cmd {
        Command::NewTorrent { id, storage_info, piece_hashes, torrent_tx } => {
          self.new_torrent(id, storage_info, piece_hashes, torrent_tx).await;
        }
        Command::WritePiece { id, index, bytes } => {
          self.write_piece(id, index, bytes).await;
        }
        Command::ReadBlock { id, block_info, result_tx } => {
          self.read_block(id, block_info, result_tx).await;
        }
        Command::Shutdown => {
          log::info!("disk task shutting down");
          break;
        }
      }
    }
    Ok(())
  }

  async fn new_torrent(&mut self, id: TorrentId, storage_info: StorageInfo, piece_hashes: Vec<u8>, torrent_tx: torrent::Sender) {
    if self.torrents.contains_key(&id) {
      let _ = self.engine_tx.send(engine::Command::TorrentAllocation { id, result: Err(NewTorrentError::AlreadyExists) });
      return;
    }

    let allocation = self.conf.allocation;
    let alloc_info = storage_info.clone();
    let result = task::spawn_blocking(move || allocate_files(&alloc_info, allocation))
      .await
      .expect("file allocation task panicked");

    let files = match result {
      Ok(files) => files,
      Err(e) => {
        let _ = self.engine_tx.send(engine::Command::TorrentAllocation { id, result: Err(e) });
        return;
      }
    };

    let file_ranges: Vec<Range<FileIndex>> = (0..storage_info.piece_count)
      .map(|index| storage_info.files_intersecting_piece(index).expect("piece index within bounds"))
      .collect();

    let files = Arc::new(files);
    let file_ranges = Arc::new(file_ranges);
    let piece_hashes = Arc::new(piece_hashes);

    let verify_torrent_tx = torrent_tx.clone();
    let bitfield = verify::verify_resume(
      piece_hashes,
      storage_info.piece_count,
      storage_info.piece_len,
      storage_info.last_piece_len,
      files.clone(),
      file_ranges.clone(),
      self.conf.verify_concurrency,
      move |outcome| {
        let _ = verify_torrent_tx.send(torrent::Command::PieceVerified { index: outcome.index, valid: outcome.valid });
      },
    )
    .await
    .unwrap_or_else(|e| {
      log::warn!("torrent {id} resume verification rejected the hash table ({e}), treating as empty");
      Bitfield::repeat(false, storage_info.piece_count)
    });

    self.torrents.insert(
      id,
      TorrentEntry {
        storage_info,
        files,
        file_ranges,
        torrent_tx: torrent_tx.clone(),
      },
    );

    let _ = self.engine_tx.send(engine::Command::TorrentAllocation { id, result: Ok(()) });
    let _ = torrent_tx.send(torrent::Command::Resumed { bitfield });
  }

  async fn write_piece(&mut self, id: TorrentId, index: PieceIndex, bytes: Arc<Vec<u8>>) {
    let Some(entry) = self.torrents.get(&id) else {
      log::warn!("write for untracked torrent {id}");
      return;
    };

    if bytes.len() as u32 != entry.piece_len(index) {
      let _ = entry.torrent_tx.send(torrent::Command::PieceCompletion(Err(WriteError::InvalidPieceLength)));
      return;
    }

    let offset = entry.piece_offset(index);
    let file_range = entry.file_ranges[index].clone();
    let files = entry.files.clone();
    let torrent_tx = entry.torrent_tx.clone();
    let write_bytes = bytes.clone();

    let result = task::spawn_blocking(move || io::piece::write(&write_bytes, offset, file_range, &files))
      .await
      .expect("disk write task panicked");

    match result {
      Ok(()) => {
        self.cache.insert(id, index, bytes);
        let _ = torrent_tx.send(torrent::Command::PieceCompletion(Ok(torrent::PieceCompletion { index, is_valid: true })));
      }
      Err(e) => {
        log::error!("failed to write piece {index} of torrent {id}: {e}");
        let _ = torrent_tx.send(torrent::Command::PieceCompletion(Err(e)));
      }
    }
  }

  async fn read_block(&mut self, id: TorrentId, block_info: BlockInfo, result_tx: peer::Sender) {
    let Some(entry) = self.torrents.get(&id) else {
      log::warn!("read for untracked torrent {id}");
      return;
    };

    let piece_len = entry.piece_len(block_info.piece_index);
    if block_info.offset.checked_add(block_info.len).map_or(true, |end| end > piece_len) {
      let _ = result_tx.send(peer::Command::ReadError { block_info, error: ReadError::InvalidBlockOffset });
      return;
    }

    if let Some(piece) = self.cache.get(id, block_info.piece_index) {
      let data = slice_block(&piece, block_info);
      let _ = result_tx.send(peer::Command::BlockReady { block_info, data: BlockData::from(data) });
      return;
    }

    let offset = entry.piece_offset(block_info.piece_index);
    let file_range = entry.file_ranges[block_info.piece_index].clone();
    let files = entry.files.clone();

    let result = task::spawn_blocking(move || io::piece::read(offset, file_range, &files, piece_len))
      .await
      .expect("disk read task panicked");

    match result {
      Ok(bytes) => {
        let piece = Arc::new(bytes);
        let data = slice_block(&piece, block_info);
        self.cache.insert(id, block_info.piece_index, piece);
        let _ = result_tx.send(peer::Command::BlockReady { block_info, data: BlockData::from(data) });
      }
      Err(e) => {
        let _ = result_tx.send(peer::Command::ReadError { block_info, error: e });
      }
    }
  }
}

fn slice_block(piece: &[u8], block_info: BlockInfo) -> Vec<u8> {
  let start = block_info.offset as usize;
  let end = start + block_info.len as usize;
  piece[start..end].to_vec()
}

/// Opens (and allocates, per `allocation`) every file in a torrent's
/// layout. Runs synchronously; the caller is expected to run it in
/// `spawn_blocking`.
fn allocate_files(storage_info: &StorageInfo, allocation: AllocationStrategy) -> Result<Vec<RwLock<TorrentFile>>, NewTorrentError> {
  let file_infos = match &storage_info.structure {
    FsStructure::File(info) => vec![info.clone()],
    FsStructure::Archive { files } => files.clone(),
  };

  file_infos
    .into_iter()
    .map(|info| TorrentFile::new(&storage_info.download_dir, info, allocation).map(RwLock::new))
    .collect()
}
