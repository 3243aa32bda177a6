//! Wires together the engine, its alert stream, and the RPC server into a
//! single long-running daemon process (component N).

use std::path::Path;

use tokio::sync::broadcast;

use crate::alert::Alert;
use crate::conf::Conf;
use crate::error::EngineResult;
use crate::rpc::protocol::{Event, EventKind};
use crate::rpc::server::Server;
use crate::{engine, TorrentId};

/// How many events a lagging client may fall behind before old ones are
/// dropped from under it.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Runs the daemon until an RPC `shutdown` request is received.
///
/// Writes a PID file on start and removes it on a graceful exit; a stale
/// socket left behind by a prior, uncleanly terminated daemon is removed by
/// [`Server::run`] before binding.
pub async fn run(conf: Conf) -> EngineResult<()> {
  write_pid_file(&conf.rpc.pid_file)?;

  let (events_tx, _events_rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
  let _ = events_tx.send(Event::bare(EventKind::EngineStarted, unix_timestamp()));

  let (engine_handle, mut alert_rx) = engine::spawn(conf.clone())?;
  let engine_tx = engine_handle.sender();

  let alert_forwarder = {
    let events_tx = events_tx.clone();
    tokio::spawn(async move {
      while let Some(alert) = alert_rx.recv().await {
        forward_alert(&events_tx, alert);
      }
    })
  };

  let server = Server::new(conf.rpc.clone(), engine_tx, events_tx.clone());
  let result = server.run().await;

  alert_forwarder.abort();
  let _ = events_tx.send(Event::bare(EventKind::EngineStopped, unix_timestamp()));
  engine_handle.shutdown().await?;
  remove_pid_file(&conf.rpc.pid_file);

  result.map_err(crate::error::Error::from)
}

fn forward_alert(events_tx: &broadcast::Sender<Event>, alert: Alert) {
  let event = match alert {
    Alert::TorrentComplete(id) => Some(bare_torrent_event(EventKind::TorrentCompleted, id)),
    Alert::TorrentStats { snapshot, .. } => Some(Event::new(EventKind::TorrentProgress, unix_timestamp(), snapshot)),
    Alert::Error(e) => Some(Event::new(
      EventKind::TorrentError,
      unix_timestamp(),
      serde_json::json!({ "error": e.to_string() }),
    )),
    // Peer- and piece-level alerts are internal bookkeeping; a client polls
    // `getTorrent`/`getPeers` for that level of detail instead of being
    // flooded with a line per block.
    _ => None,
  };

  if let Some(event) = event {
    let _ = events_tx.send(event);
  }
}

fn bare_torrent_event(kind: EventKind, id: TorrentId) -> Event {
  Event::new(kind, unix_timestamp(), serde_json::json!({ "torrentId": id.to_string() }))
}

fn write_pid_file(path: &Path) -> EngineResult<()> {
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent)?;
  }
  std::fs::write(path, std::process::id().to_string())?;
  Ok(())
}

fn remove_pid_file(path: &Path) {
  if let Err(e) = std::fs::remove_file(path) {
    log::warn!("failed to remove pid file {}: {e}", path.display());
  }
}

fn unix_timestamp() -> u64 {
  use std::time::{SystemTime, UNIX_EPOCH};
  SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn recv_kind(events_tx: &broadcast::Sender<Event>) -> Option<EventKind> {
    let mut rx = events_tx.subscribe();
    rx.try_recv().ok().map(|e| e.kind)
  }

  #[test]
  fn torrent_complete_forwards_a_torrent_completed_event() {
    let (events_tx, _rx) = broadcast::channel(8);
    let mut rx = events_tx.subscribe();
    forward_alert(&events_tx, Alert::TorrentComplete(TorrentId::new()));
    let event = rx.try_recv().unwrap();
    assert_eq!(event.kind, EventKind::TorrentCompleted);
  }

  #[test]
  fn alert_error_forwards_a_torrent_error_event() {
    let (events_tx, _rx) = broadcast::channel(8);
    let mut rx = events_tx.subscribe();
    forward_alert(&events_tx, Alert::Error(crate::error::Error::Channel));
    let event = rx.try_recv().unwrap();
    assert_eq!(event.kind, EventKind::TorrentError);
  }

  #[test]
  fn torrent_stats_forwards_a_torrent_progress_event() {
    let (events_tx, _rx) = broadcast::channel(8);
    let mut rx = events_tx.subscribe();
    let snapshot = crate::torrent::stats::TorrentSnapshot {
      info_hash: [0u8; 20],
      name: "test".to_string(),
      state: crate::torrent::stats::TorrentState::Downloading,
      progress: 0.5,
      downloaded: 1024,
      uploaded: 0,
      download_rate: 0,
      upload_rate: 0,
      peer_count: 1,
      piece_count: 10,
    };
    forward_alert(&events_tx, Alert::TorrentStats { id: TorrentId::new(), snapshot });
    let event = rx.try_recv().unwrap();
    assert_eq!(event.kind, EventKind::TorrentProgress);
    assert!(event.data.is_some());
  }

  #[test]
  fn peer_level_alerts_are_not_forwarded() {
    let (events_tx, _rx) = broadcast::channel(8);
    forward_alert(
      &events_tx,
      Alert::PeerConnected { id: TorrentId::new(), addr: "127.0.0.1:6881".parse().unwrap() },
    );
    assert_eq!(recv_kind(&events_tx), None);
  }

  #[test]
  fn pid_file_is_written_and_removed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("fileswarm.pid");

    write_pid_file(&path).unwrap();
    let contents = std::fs::read_to_string(&path).unwrap();
    assert_eq!(contents, std::process::id().to_string());

    remove_pid_file(&path);
    assert!(!path.exists());
  }
}
