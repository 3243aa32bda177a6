//! This module defines types used to configure the engine and its parts.
//!
//! Every numeric default called out in the design (pipeline length, ban
//! duration, write queue bound, ...) lives here as a field of one of these
//! structs, constructed once at engine start and threaded down to the
//! subsystem that owns it — never as a free-floating constant that would
//! cross a subsystem boundary if mutated.

use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::PeerId;

pub const CLIENT_ID: &PeerId = b"cbt-0000000000000000";

/// The global configuration for the torrent engine and all its parts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conf {
  pub engine: EngineConf,
  pub torrent: TorrentConf,
  pub peer: PeerConf,
  pub piece: PieceConf,
  pub disk: DiskConf,
  pub tracker: TrackerConf,
  pub rpc: RpcConf,
}

impl Conf {
  /// Returns a configuration with reasonable defaults for everything except
  /// the download directory, as it is not sensible to guess that for the
  /// user. It uses the default client id [`CLIENT_ID`].
  pub fn new(download_dir: impl Into<PathBuf>) -> Self {
    Self {
      engine: EngineConf {
        client_id: *CLIENT_ID,
        download_dir: download_dir.into(),
      },
      torrent: TorrentConf::default(),
      peer: PeerConf::default(),
      piece: PieceConf::default(),
      disk: DiskConf::default(),
      tracker: TrackerConf::default(),
      rpc: RpcConf::default(),
    }
  }
}

/// Configuration related to the engine itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConf {
  /// The ID of the client to announce to trackers and other peers.
  pub client_id: PeerId,
  /// The directory in which a torrent's files are placed upon download and
  /// from which they are seeded.
  pub download_dir: PathBuf,
}

/// Configuration for a torrent.
///
/// The engine has a default instance of this applied to all torrents, but
/// individual torrents may override it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorrentConf {
  /// The minimum number of peers we want to keep in torrent at all times.
  pub min_requested_peer_count: usize,

  /// The max number of connected peers the torrent should have.
  pub max_connected_peer_count: usize,

  /// If the tracker doesn't provide a minimum announce interval, we default
  /// to announcing at this interval.
  pub announce_interval: Duration,

  /// After this many attempts, the torrent stops announcing to a tracker.
  pub tracker_error_threshold: usize,

  /// How often to emit a coalesced `TorrentStats` alert summarizing
  /// progress, rates, and peer count.
  pub stats_interval: Duration,

  /// Whether to re-hash existing pieces on start before trusting the resume
  /// bitfield (§6 "Persisted state").
  pub verify_on_start: bool,

  /// Specifies which optional alerts to send, besides the default periodic
  /// stats update.
  pub alerts: TorrentAlertConf,
}

/// Configuration of a torrent's optional alerts.
///
/// By default, all optional alerts are turned off, since some of them carry
/// overhead that shouldn't be paid unless they are actually used.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TorrentAlertConf {
  /// Receive the pieces that were completed each round.
  pub completed_pieces: bool,
  /// Receive aggregate statistics about the torrent's peers.
  pub peers: bool,
}

impl Default for TorrentConf {
  fn default() -> Self {
    TorrentConf {
      min_requested_peer_count: 10,
      max_connected_peer_count: 50,
      announce_interval: Duration::from_secs(60 * 60),
      tracker_error_threshold: 15,
      stats_interval: Duration::from_secs(5),
      verify_on_start: true,
      alerts: Default::default(),
    }
  }
}

/// How aggressively to pursue encrypted peer transports (§6, §9's "dynamic
/// dispatch over transport" note). No transport currently implements
/// encryption; this only governs whether a future MSE transport would be
/// attempted, preferred, or skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EncryptionMode {
  Prefer,
  Require,
  #[default]
  Disabled,
}

/// Configuration for the peer connection manager (component G).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConf {
  pub max_connections: usize,
  pub max_per_torrent: usize,
  pub connect_timeout: Duration,
  pub handshake_timeout: Duration,
  pub initial_reconnect_delay: Duration,
  pub reconnect_backoff_multiplier: f64,
  pub max_reconnect_attempts: usize,
  pub ban_duration: Option<Duration>,
  pub failures_before_ban: usize,
  pub encryption_mode: EncryptionMode,
  /// Size of the ring buffer used for 1 Hz throughput sampling.
  pub speed_sample_count: usize,
}

impl Default for PeerConf {
  fn default() -> Self {
    Self {
      max_connections: 50,
      max_per_torrent: 30,
      connect_timeout: Duration::from_secs(5),
      handshake_timeout: Duration::from_secs(10),
      initial_reconnect_delay: Duration::from_secs(2),
      reconnect_backoff_multiplier: 1.5,
      max_reconnect_attempts: 3,
      ban_duration: Some(Duration::from_secs(10 * 60)),
      failures_before_ban: 5,
      encryption_mode: EncryptionMode::Disabled,
      speed_sample_count: 10,
    }
  }
}

/// Configuration for the piece manager (component E).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PieceConf {
  /// Maximum number of outstanding block requests kept in flight per peer.
  pub pipeline_len: usize,
  /// Maximum number of retries for a piece that keeps failing verification.
  pub max_piece_retries: usize,
  /// A pending request older than this is swept and its block released.
  pub stale_request_timeout: Duration,
}

impl PieceConf {
  /// The number of missing pieces at or below which endgame mode starts,
  /// given the torrent's total piece count: `min(20, ceil(0.15 * count))`.
  pub fn endgame_threshold(piece_count: usize) -> usize {
    let scaled = ((piece_count as f64) * 0.15).ceil() as usize;
    scaled.min(20)
  }
}

impl Default for PieceConf {
  fn default() -> Self {
    Self {
      pipeline_len: 256,
      max_piece_retries: 3,
      stale_request_timeout: Duration::from_secs(30),
    }
  }
}

/// How a torrent's files are allocated on disk before any data is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AllocationStrategy {
  /// Create empty files; rely on the filesystem's sparse-file support.
  #[default]
  Sparse,
  /// Write zeros up to the declared length up front.
  Full,
}

/// Configuration for the disk IO layer (component K).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskConf {
  pub allocation: AllocationStrategy,
  /// Bound on the write queue; a completing piece that would overflow it
  /// must await queue space.
  pub write_queue_bound: usize,
  /// Number of whole pieces kept in the LRU read cache.
  pub read_cache_size: usize,
  /// Maximum number of pieces hashed concurrently during resume-time
  /// verification.
  pub verify_concurrency: usize,
}

impl Default for DiskConf {
  fn default() -> Self {
    Self {
      allocation: AllocationStrategy::Sparse,
      write_queue_bound: 64,
      read_cache_size: 16,
      verify_concurrency: 8,
    }
  }
}

/// Configuration for the tracker client and coordinator (components I, J).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerConf {
  pub udp_base_timeout: Duration,
  pub udp_max_retries: u32,
  /// Hard ceiling on how long the `stopped` announce event may take before
  /// shutdown proceeds anyway.
  pub stopped_timeout: Duration,
}

impl Default for TrackerConf {
  fn default() -> Self {
    Self {
      udp_base_timeout: Duration::from_secs(15),
      udp_max_retries: 4,
      stopped_timeout: Duration::from_secs(5),
    }
  }
}

/// Configuration for the daemon RPC bus (component N).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConf {
  pub socket_path: PathBuf,
  pub pid_file: PathBuf,
  pub log_file: PathBuf,
  pub data_dir: PathBuf,
  /// How long a client waits for a response to a request before surfacing a
  /// local `RequestTimeout` error.
  pub request_timeout: Duration,
}

impl Default for RpcConf {
  fn default() -> Self {
    let data_dir = dirs_home().join("fileswarm");
    Self {
      socket_path: PathBuf::from("/tmp/fileswarm.sock"),
      pid_file: data_dir.join("fileswarm.pid"),
      log_file: data_dir.join("fileswarm.log"),
      data_dir,
      request_timeout: Duration::from_secs(30),
    }
  }
}

fn dirs_home() -> PathBuf {
  std::env::var_os("HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|| PathBuf::from("."))
}
