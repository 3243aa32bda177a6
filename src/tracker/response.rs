//! Tracker announce and scrape response parsing (component I), built on
//! [`crate::bencode`] rather than a serde shim so the same decoder used for
//! metainfo files also reads wire responses.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use bytes::Buf;

use crate::bencode::{self, Value};
use crate::error::tracker::TrackerError;

use super::Result;

/// A parsed announce response (§4.I).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub tracker_id: Option<String>,
  pub interval: Duration,
  pub min_interval: Option<Duration>,
  pub seeder_count: Option<usize>,
  pub leecher_count: Option<usize>,
  pub peers: Vec<SocketAddr>,
}

impl Response {
  pub fn parse(bytes: &[u8]) -> Result<Self> {
    let value = bencode::decode(bytes).map_err(TrackerError::Bencode)?;

    if let Some(reason) = value.get("failure reason").and_then(Value::as_str) {
      return Err(TrackerError::TrackerFailure(reason.to_string()));
    }

    let interval = value
      .get("interval")
      .and_then(Value::as_int)
      .ok_or(TrackerError::MalformedResponse)?;
    let interval = Duration::from_secs(interval.max(0) as u64);

    let min_interval = value
      .get("min interval")
      .and_then(Value::as_int)
      .map(|secs| Duration::from_secs(secs.max(0) as u64));

    let tracker_id = value.get("tracker id").and_then(Value::as_str).map(String::from);
    let seeder_count = value.get("complete").and_then(Value::as_int).map(|n| n as usize);
    let leecher_count = value.get("incomplete").and_then(Value::as_int).map(|n| n as usize);

    let peers = match value.get("peers") {
      Some(Value::Bytes(compact)) => parse_compact_peers(compact)?,
      Some(Value::List(list)) => parse_dict_peers(list)?,
      _ => Vec::new(),
    };

    Ok(Self {
      tracker_id,
      interval,
      min_interval,
      seeder_count,
      leecher_count,
      peers,
    })
  }
}

/// Each entry is 4 bytes of big-endian IPv4 address followed by a 2-byte
/// big-endian port.
pub(super) fn parse_compact_peers(bytes: &[u8]) -> Result<Vec<SocketAddr>> {
  const ENTRY_LEN: usize = 6;
  if bytes.len() % ENTRY_LEN != 0 {
    return Err(TrackerError::MalformedResponse);
  }

  let mut peers = Vec::with_capacity(bytes.len() / ENTRY_LEN);
  let mut rest = bytes;
  while rest.has_remaining() {
    let addr = Ipv4Addr::from(rest.get_u32());
    let port = rest.get_u16();
    peers.push(SocketAddr::new(IpAddr::V4(addr), port));
  }
  Ok(peers)
}

fn parse_dict_peers(list: &[Value]) -> Result<Vec<SocketAddr>> {
  let mut peers = Vec::with_capacity(list.len());
  for entry in list {
    let Some(ip) = entry.get("ip").and_then(Value::as_str) else {
      continue;
    };
    let Some(port) = entry.get("port").and_then(Value::as_int) else {
      continue;
    };
    let Ok(ip) = ip.parse::<IpAddr>() else {
      continue;
    };
    peers.push(SocketAddr::new(ip, port as u16));
  }
  Ok(peers)
}

/// A scrape response: per-torrent seed/download/leech counts keyed by the
/// 20-byte info hash (§4.I "Scrape").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeEntry {
  pub complete: usize,
  pub downloaded: usize,
  pub incomplete: usize,
}

pub fn parse_scrape(bytes: &[u8]) -> Result<HashMap<[u8; 20], ScrapeEntry>> {
  let value = bencode::decode(bytes).map_err(TrackerError::Bencode)?;
  let Some(Value::Dict(files)) = value.get("files") else {
    return Err(TrackerError::MalformedResponse);
  };

  let mut out = HashMap::with_capacity(files.len());
  for (hash_bytes, entry) in files {
    if hash_bytes.len() != 20 {
      continue;
    }
    let mut hash = [0u8; 20];
    hash.copy_from_slice(hash_bytes);

    let complete = entry.get("complete").and_then(Value::as_int).unwrap_or(0) as usize;
    let downloaded = entry.get("downloaded").and_then(Value::as_int).unwrap_or(0) as usize;
    let incomplete = entry.get("incomplete").and_then(Value::as_int).unwrap_or(0) as usize;
    out.insert(
      hash,
      ScrapeEntry {
        complete,
        downloaded,
        incomplete,
      },
    );
  }
  Ok(out)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn compact_peer(ip: Ipv4Addr, port: u16) -> Vec<u8> {
    let mut out = ip.octets().to_vec();
    out.extend_from_slice(&port.to_be_bytes());
    out
  }

  #[test]
  fn parses_compact_peer_list() {
    let peer_bytes = compact_peer(Ipv4Addr::new(192, 168, 0, 1), 8989);
    let mut encoded = format!("d8:completei5e10:incompletei3e8:intervali15e5:peers{}:", peer_bytes.len())
      .into_bytes();
    encoded.extend_from_slice(&peer_bytes);
    encoded.push(b'e');

    let resp = Response::parse(&encoded).unwrap();
    assert_eq!(resp.interval, Duration::from_secs(15));
    assert_eq!(resp.seeder_count, Some(5));
    assert_eq!(resp.leecher_count, Some(3));
    assert_eq!(
      resp.peers,
      vec![SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 168, 0, 1)), 8989)]
    );
  }

  #[test]
  fn failure_reason_short_circuits_parsing() {
    let encoded = b"d14:failure reason11:bad requeste";
    let err = Response::parse(encoded).unwrap_err();
    assert!(matches!(err, TrackerError::TrackerFailure(msg) if msg == "bad request"));
  }

  #[test]
  fn rejects_compact_peers_not_multiple_of_6() {
    let encoded = b"d8:intervali15e5:peers5:aaaaae";
    let err = Response::parse(encoded).unwrap_err();
    assert!(matches!(err, TrackerError::MalformedResponse));
  }
}
