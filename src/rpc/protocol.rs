//! The daemon RPC wire format (component N): one UTF-8 JSON object per
//! line, each tagged with a `kind` of `request`, `response`, or `event`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One line of the wire protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Frame {
  Request(Request),
  Response(Response),
  Event(Event),
}

/// A client-initiated request, matched to its [`Response`] by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
  pub id: String,
  #[serde(flatten)]
  pub body: RequestBody,
}

/// The request types of §4.N's contract table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RequestBody {
  Ping,
  GetStatus,
  GetTorrents,
  GetTorrent {
    info_hash: String,
  },
  GetPeers {
    info_hash: String,
  },
  AddTorrent {
    source: String,
    download_path: Option<PathBuf>,
    #[serde(default)]
    start_immediately: bool,
  },
  RemoveTorrent {
    info_hash: String,
    #[serde(default)]
    delete_files: bool,
  },
  PauseTorrent {
    info_hash: String,
  },
  ResumeTorrent {
    info_hash: String,
  },
  GetConfig,
  UpdateConfig {
    config: Value,
  },
  GetStats,
  Shutdown,
}

impl RequestBody {
  /// The request's `type`, used to stamp the matching response.
  pub fn type_name(&self) -> &'static str {
    match self {
      Self::Ping => "ping",
      Self::GetStatus => "getStatus",
      Self::GetTorrents => "getTorrents",
      Self::GetTorrent { .. } => "getTorrent",
      Self::GetPeers { .. } => "getPeers",
      Self::AddTorrent { .. } => "addTorrent",
      Self::RemoveTorrent { .. } => "removeTorrent",
      Self::PauseTorrent { .. } => "pauseTorrent",
      Self::ResumeTorrent { .. } => "resumeTorrent",
      Self::GetConfig => "getConfig",
      Self::UpdateConfig { .. } => "updateConfig",
      Self::GetStats => "getStats",
      Self::Shutdown => "shutdown",
    }
  }
}

/// The server's reply to exactly one request, matched by `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
  pub id: String,
  pub success: bool,
  #[serde(rename = "type")]
  pub kind: String,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub data: Option<Value>,
}

impl Response {
  pub fn ok(id: impl Into<String>, kind: &'static str, data: impl Serialize) -> Self {
    Self {
      id: id.into(),
      success: true,
      kind: kind.into(),
      error: None,
      data: serde_json::to_value(data).ok(),
    }
  }

  pub fn empty(id: impl Into<String>, kind: &'static str) -> Self {
    Self { id: id.into(), success: true, kind: kind.into(), error: None, data: None }
  }

  pub fn err(id: impl Into<String>, kind: &'static str, error: impl std::fmt::Display) -> Self {
    Self { id: id.into(), success: false, kind: kind.into(), error: Some(error.to_string()), data: None }
  }
}

/// An unsolicited, server-initiated notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
  #[serde(rename = "type")]
  pub kind: EventKind,
  pub timestamp: u64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub data: Option<Value>,
}

impl Event {
  pub fn new(kind: EventKind, timestamp: u64, data: impl Serialize) -> Self {
    Self { kind, timestamp, data: serde_json::to_value(data).ok() }
  }

  pub fn bare(kind: EventKind, timestamp: u64) -> Self {
    Self { kind, timestamp, data: None }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
  #[serde(rename = "torrent:added")]
  TorrentAdded,
  #[serde(rename = "torrent:removed")]
  TorrentRemoved,
  #[serde(rename = "torrent:progress")]
  TorrentProgress,
  #[serde(rename = "torrent:completed")]
  TorrentCompleted,
  #[serde(rename = "torrent:error")]
  TorrentError,
  #[serde(rename = "engine:started")]
  EngineStarted,
  #[serde(rename = "engine:stopped")]
  EngineStopped,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn request_frame_round_trips_through_json() {
    let line = r#"{"kind":"request","id":"1","type":"getTorrent","infoHash":"ab"}"#;
    let frame: Frame = serde_json::from_str(line).unwrap();
    match frame {
      Frame::Request(Request { id, body: RequestBody::GetTorrent { info_hash } }) => {
        assert_eq!(id, "1");
        assert_eq!(info_hash, "ab");
      }
      _ => panic!("expected a getTorrent request"),
    }
  }

  #[test]
  fn response_omits_absent_fields() {
    let response = Response::empty("1", "pauseTorrent");
    let json = serde_json::to_string(&response).unwrap();
    assert!(!json.contains("\"error\""));
    assert!(!json.contains("\"data\""));
  }

  #[test]
  fn event_serializes_colon_qualified_type() {
    let event = Event::bare(EventKind::EngineStarted, 0);
    let json = serde_json::to_string(&event).unwrap();
    assert!(json.contains("\"type\":\"engine:started\""));
  }
}
