//! The daemon side of the RPC bus (component N): binds a Unix domain
//! socket, accepts one long-lived connection per client, and dispatches
//! each request to the engine, replying with exactly one response per
//! request while interleaving broadcast events.

use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use crate::conf::{Conf, RpcConf};
use crate::engine;
use crate::metainfo::Metainfo;
use crate::rpc::protocol::{Event, EventKind, Frame, Request, RequestBody, Response};
use crate::Sha1Hash;

/// Runs the RPC server until a `shutdown` request is received or the
/// listener itself fails.
pub struct Server {
  conf: RpcConf,
  engine_tx: engine::Sender,
  events: broadcast::Sender<Event>,
}

impl Server {
  pub fn new(conf: RpcConf, engine_tx: engine::Sender, events: broadcast::Sender<Event>) -> Self {
    Self { conf, engine_tx, events }
  }

  /// Binds the socket (removing a stale one first) and serves connections
  /// until a `shutdown` request arrives.
  pub async fn run(self) -> std::io::Result<()> {
    remove_stale_socket(&self.conf.socket_path);
    let listener = UnixListener::bind(&self.conf.socket_path)?;
    log::info!("rpc server listening on {}", self.conf.socket_path.display());

    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel();

    loop {
      tokio::select! {
        accepted = listener.accept() => {
          let (stream, _addr) = accepted?;
          let engine_tx = self.engine_tx.clone();
          let events_tx = self.events.clone();
          let events_rx = self.events.subscribe();
          let shutdown_tx = shutdown_tx.clone();
          tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, engine_tx, events_tx, events_rx, shutdown_tx).await {
              log::debug!("rpc connection ended: {e}");
            }
          });
        }
        _ = shutdown_rx.recv() => {
          log::info!("rpc server received a shutdown request, no longer accepting connections");
          break;
        }
      }
    }

    let _ = std::fs::remove_file(&self.conf.socket_path);
    Ok(())
  }
}

fn remove_stale_socket(path: &Path) {
  if path.exists() {
    log::warn!("removing stale rpc socket at {}", path.display());
    let _ = std::fs::remove_file(path);
  }
}

async fn handle_connection(
  stream: UnixStream,
  engine_tx: engine::Sender,
  events_tx: broadcast::Sender<Event>,
  mut events_rx: broadcast::Receiver<Event>,
  shutdown_tx: mpsc::UnboundedSender<()>,
) -> std::io::Result<()> {
  let (reader, writer) = stream.into_split();
  let mut lines = FramedRead::new(reader, LinesCodec::new());
  let writer = Arc::new(Mutex::new(FramedWrite::new(writer, LinesCodec::new())));

  let event_writer = writer.clone();
  let event_task = tokio::spawn(async move {
    loop {
      match events_rx.recv().await {
        Ok(event) => {
          if let Ok(line) = serde_json::to_string(&Frame::Event(event)) {
            if event_writer.lock().await.send(line).await.is_err() {
              break;
            }
          }
        }
        Err(broadcast::error::RecvError::Lagged(_)) => continue,
        Err(broadcast::error::RecvError::Closed) => break,
      }
    }
  });

  while let Some(line) = lines.next().await {
    let line = match line {
      Ok(line) => line,
      Err(e) => {
        log::debug!("rpc connection read error: {e}");
        break;
      }
    };
    let request = match serde_json::from_str::<Frame>(&line) {
      Ok(Frame::Request(request)) => request,
      Ok(_) => {
        log::debug!("rpc client sent a non-request frame, ignoring");
        continue;
      }
      Err(e) => {
        log::debug!("malformed rpc request: {e}");
        continue;
      }
    };

    let response = dispatch(&engine_tx, request, &events_tx, &shutdown_tx).await;
    let line = serde_json::to_string(&Frame::Response(response)).expect("Response always serializes");
    if writer.lock().await.send(line).await.is_err() {
      break;
    }
  }

  event_task.abort();
  Ok(())
}

/// Broadcasts an event to every connected client; dropped silently if no
/// client is currently subscribed.
fn emit(events_tx: &broadcast::Sender<Event>, kind: EventKind, data: impl serde::Serialize) {
  let _ = events_tx.send(Event::new(kind, unix_timestamp(), data));
}

/// Sends a command built from a fresh reply channel and awaits the reply.
async fn round_trip<T>(
  tx: &engine::Sender,
  build: impl FnOnce(oneshot::Sender<T>) -> engine::Command,
) -> Option<T> {
  let (reply_tx, reply_rx) = oneshot::channel();
  tx.send(build(reply_tx)).ok()?;
  reply_rx.await.ok()
}

async fn dispatch(
  tx: &engine::Sender,
  request: Request,
  events_tx: &broadcast::Sender<Event>,
  shutdown_tx: &mpsc::UnboundedSender<()>,
) -> Response {
  let id = request.id;
  let kind = request.body.type_name();

  match request.body {
    RequestBody::Ping => Response::ok(id, kind, serde_json::json!({ "timestamp": unix_timestamp() })),

    RequestBody::GetStatus | RequestBody::GetStats => {
      match round_trip(tx, |reply| engine::Command::GetStatus { reply }).await {
        Some(status) => Response::ok(id, kind, status),
        None => Response::err(id, kind, "engine is unreachable"),
      }
    }

    RequestBody::GetTorrents => {
      let snapshots = round_trip(tx, |reply| engine::Command::GetTorrents { reply }).await.unwrap_or_default();
      Response::ok(id, kind, snapshots)
    }

    RequestBody::GetTorrent { info_hash } => match parse_info_hash(&info_hash) {
      Ok(info_hash) => {
        let snapshot = round_trip(tx, |reply| engine::Command::GetTorrent { info_hash, reply }).await.flatten();
        Response::ok(id, kind, snapshot)
      }
      Err(e) => Response::err(id, kind, e),
    },

    RequestBody::GetPeers { info_hash } => match parse_info_hash(&info_hash) {
      Ok(info_hash) => {
        let peers = round_trip(tx, |reply| engine::Command::GetPeers { info_hash, reply }).await.flatten();
        Response::ok(id, kind, peers.unwrap_or_default())
      }
      Err(e) => Response::err(id, kind, e),
    },

    RequestBody::AddTorrent { source, download_path, start_immediately } => {
      match add_torrent(tx, &source, download_path, start_immediately).await {
        Ok(snapshot) => {
          emit(events_tx, EventKind::TorrentAdded, serde_json::json!({ "infoHash": hex::encode(snapshot.info_hash) }));
          Response::ok(id, kind, snapshot)
        }
        Err(e) => Response::err(id, kind, e),
      }
    }

    RequestBody::RemoveTorrent { info_hash, delete_files } => match parse_info_hash(&info_hash) {
      Ok(parsed_hash) => match round_trip(tx, |reply| engine::Command::RemoveTorrent { info_hash: parsed_hash, delete_files, reply }).await {
        Some(Ok(())) => {
          emit(events_tx, EventKind::TorrentRemoved, serde_json::json!({ "infoHash": info_hash }));
          Response::empty(id, kind)
        }
        Some(Err(e)) => Response::err(id, kind, e),
        None => Response::err(id, kind, "engine is unreachable"),
      },
      Err(e) => Response::err(id, kind, e),
    },

    RequestBody::PauseTorrent { info_hash } => match parse_info_hash(&info_hash) {
      Ok(info_hash) => match round_trip(tx, |reply| engine::Command::PauseTorrent { info_hash, reply }).await {
        Some(Ok(())) => Response::empty(id, kind),
        Some(Err(e)) => Response::err(id, kind, e),
        None => Response::err(id, kind, "engine is unreachable"),
      },
      Err(e) => Response::err(id, kind, e),
    },

    RequestBody::ResumeTorrent { info_hash } => match parse_info_hash(&info_hash) {
      Ok(info_hash) => match round_trip(tx, |reply| engine::Command::ResumeTorrent { info_hash, reply }).await {
        Some(Ok(())) => Response::empty(id, kind),
        Some(Err(e)) => Response::err(id, kind, e),
        None => Response::err(id, kind, "engine is unreachable"),
      },
      Err(e) => Response::err(id, kind, e),
    },

    RequestBody::GetConfig => match round_trip(tx, |reply| engine::Command::GetConfig { reply }).await {
      Some(conf) => Response::ok(id, kind, conf),
      None => Response::err(id, kind, "engine is unreachable"),
    },

    RequestBody::UpdateConfig { config } => match serde_json::from_value::<Conf>(config) {
      Ok(conf) => match round_trip(tx, |reply| engine::Command::UpdateConfig { conf: Box::new(conf), reply }).await {
        Some(conf) => Response::ok(id, kind, conf),
        None => Response::err(id, kind, "engine is unreachable"),
      },
      Err(e) => Response::err(id, kind, format!("invalid config: {e}")),
    },

    RequestBody::Shutdown => {
      let response = Response::empty(id, kind);
      let _ = shutdown_tx.send(());
      response
    }
  }
}

async fn add_torrent(
  tx: &engine::Sender,
  source: &str,
  download_path: Option<std::path::PathBuf>,
  start_immediately: bool,
) -> Result<crate::torrent::stats::TorrentSnapshot, String> {
  if download_path.is_some() {
    // the engine always downloads into its configured `download_dir`; a
    // per-torrent override isn't wired up (see DESIGN.md).
    return Err("per-torrent download paths are not supported".to_string());
  }

  let metainfo = load_metainfo(source)?;
  let info_hash = metainfo.info_hash;

  let mode = engine::Mode::Download { seeds: Vec::new() };
  let params = engine::TorrentParams {
    metainfo,
    conf: None,
    mode,
    listen_addr: None,
  };
  let id = crate::TorrentId::new();
  tx.send(engine::Command::CreateTorrent { id, params: Box::new(params) })
    .map_err(|_| "engine is unreachable".to_string())?;

  if !start_immediately {
    let _ = round_trip(tx, |reply| engine::Command::PauseTorrent { info_hash, reply }).await;
  }

  round_trip(tx, |reply| engine::Command::GetTorrent { info_hash, reply })
    .await
    .flatten()
    .ok_or_else(|| "torrent was created but its snapshot is not yet available".to_string())
}

fn load_metainfo(source: &str) -> Result<Metainfo, String> {
  if source.starts_with("magnet:") {
    return Err("magnet sources require BEP 9 metadata exchange, which is not supported".to_string());
  }
  let bytes = std::fs::read(source).map_err(|e| format!("failed to read {source}: {e}"))?;
  Metainfo::from_bytes(&bytes).map_err(|e| e.to_string())
}

fn parse_info_hash(hex_str: &str) -> Result<Sha1Hash, String> {
  let bytes = hex::decode(hex_str).map_err(|_| "info hash is not valid hex".to_string())?;
  bytes.try_into().map_err(|_| "info hash must be 20 bytes".to_string())
}

fn unix_timestamp() -> u64 {
  SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
  use tokio::sync::mpsc;

  use super::*;

  fn unreachable_engine_tx() -> engine::Sender {
    let (tx, rx) = mpsc::unbounded_channel();
    drop(rx);
    tx
  }

  #[tokio::test]
  async fn ping_succeeds_without_touching_the_engine() {
    let tx = unreachable_engine_tx();
    let (events_tx, _events_rx) = broadcast::channel(8);
    let (shutdown_tx, _shutdown_rx) = mpsc::unbounded_channel();
    let request = Request { id: "1".to_string(), body: RequestBody::Ping };

    let response = dispatch(&tx, request, &events_tx, &shutdown_tx).await;
    assert!(response.success);
  }

  #[tokio::test]
  async fn get_status_reports_engine_unreachable_when_the_engine_is_gone() {
    let tx = unreachable_engine_tx();
    let (events_tx, _events_rx) = broadcast::channel(8);
    let (shutdown_tx, _shutdown_rx) = mpsc::unbounded_channel();
    let request = Request { id: "2".to_string(), body: RequestBody::GetStatus };

    let response = dispatch(&tx, request, &events_tx, &shutdown_tx).await;
    assert!(!response.success);
    assert_eq!(response.error.as_deref(), Some("engine is unreachable"));
  }

  #[tokio::test]
  async fn shutdown_responds_before_signalling_the_accept_loop() {
    let tx = unreachable_engine_tx();
    let (events_tx, _events_rx) = broadcast::channel(8);
    let (shutdown_tx, mut shutdown_rx) = mpsc::unbounded_channel();
    let request = Request { id: "3".to_string(), body: RequestBody::Shutdown };

    let response = dispatch(&tx, request, &events_tx, &shutdown_tx).await;
    assert!(response.success);
    assert!(shutdown_rx.try_recv().is_ok());
  }

  #[test]
  fn parse_info_hash_rejects_non_hex_and_wrong_length() {
    assert!(parse_info_hash(&"ab".repeat(20)).is_ok());
    assert!(parse_info_hash("not-hex").is_err());
    assert!(parse_info_hash("aabb").is_err());
  }

  #[test]
  fn load_metainfo_rejects_magnet_sources() {
    let result = load_metainfo("magnet:?xt=urn:btih:aabbccddeeff00112233445566778899aabbccdd");
    assert_eq!(result.unwrap_err(), "magnet sources require BEP 9 metadata exchange, which is not supported");
  }

  #[tokio::test]
  async fn add_torrent_rejects_a_per_torrent_download_path() {
    let tx = unreachable_engine_tx();
    let result = add_torrent(&tx, "whatever.torrent", Some(std::path::PathBuf::from("/tmp/elsewhere")), true).await;
    assert_eq!(result.unwrap_err(), "per-torrent download paths are not supported");
  }
}
