//! CLI-facing snapshot DTOs (components L/M/N): serializable views of a
//! torrent's and a peer's state, assembled for the periodic `TorrentStats`
//! alert and for the daemon RPC's `getTorrent(s)`/`getPeers` responses.

use std::net::SocketAddr;

use serde::Serialize;

use crate::Sha1Hash;

/// A torrent's lifecycle state, as exposed to RPC clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TorrentState {
  Downloading,
  Seeding,
  Paused,
  Error,
}

/// A point-in-time snapshot of a torrent.
#[derive(Debug, Clone, Serialize)]
pub struct TorrentSnapshot {
  #[serde(serialize_with = "serialize_info_hash")]
  pub info_hash: Sha1Hash,
  pub name: String,
  pub state: TorrentState,
  pub progress: f64,
  pub downloaded: u64,
  pub uploaded: u64,
  pub download_rate: i64,
  pub upload_rate: i64,
  pub peer_count: usize,
  pub piece_count: usize,
}

/// A point-in-time snapshot of one connected peer.
#[derive(Debug, Clone, Serialize)]
pub struct PeerSnapshot {
  pub addr: SocketAddr,
  pub client: Option<String>,
  pub am_choking: bool,
  pub am_interested: bool,
  pub peer_choking: bool,
  pub peer_interested: bool,
  pub download_rate: i64,
  pub upload_rate: i64,
  pub piece_count: usize,
}

fn serialize_info_hash<S: serde::Serializer>(hash: &Sha1Hash, serializer: S) -> Result<S::Ok, S::Error> {
  serializer.serialize_str(&hex::encode(hash))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn snapshot_serializes_info_hash_as_hex() {
    let snapshot = TorrentSnapshot {
      info_hash: [0xab; 20],
      name: "test".into(),
      state: TorrentState::Downloading,
      progress: 0.5,
      downloaded: 1024,
      uploaded: 0,
      download_rate: 100,
      upload_rate: 0,
      peer_count: 1,
      piece_count: 10,
    };
    let json = serde_json::to_string(&snapshot).unwrap();
    assert!(json.contains("\"info_hash\":\"abababababababababababababababababababab\""));
    assert!(json.contains("\"state\":\"downloading\""));
  }
}
