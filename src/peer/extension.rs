//! BEP 10 extension protocol and ut_pex peer exchange (component H).
//!
//! Extension ids are negotiated per-connection via the `m` dictionary of
//! the extension handshake (sub-id 0), but this engine only ever offers
//! two extensions, so it simply advertises them at fixed local ids.

use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::time::{Duration, Instant};

use crate::bencode::{self, Value};
use crate::error::peer::PeerError;

pub const UT_PEX_ID: u8 = 1;
pub const UT_METADATA_ID: u8 = 2;

const PEX_MAX_PEERS_PER_MESSAGE: usize = 50;
const PEX_MIN_INTERVAL: Duration = Duration::from_secs(60);

/// The decoded payload of a BEP 10 extension handshake (sub-id 0).
#[derive(Debug, Clone, Default)]
pub struct ExtensionHandshake {
  /// Remote's advertised extension name -> id table.
  pub name_to_id: HashMap<String, u8>,
  pub client: Option<String>,
  pub metadata_size: Option<i64>,
}

impl ExtensionHandshake {
  pub fn supports(&self, name: &str) -> Option<u8> {
    self.name_to_id.get(name).copied()
  }
}

/// Builds the outgoing extension handshake payload (not including the
/// `<len><id=20><ext_id=0>` framing, which the codec adds).
pub fn build_handshake(client_version: &str) -> Vec<u8> {
  let m = bencode::dict([
    ("ut_pex", Value::Int(UT_PEX_ID as i64)),
    ("ut_metadata", Value::Int(UT_METADATA_ID as i64)),
  ]);
  let value = bencode::dict([("m", m), ("v", bencode::bytes(client_version))]);
  bencode::encode(&value)
}

pub fn parse_handshake(payload: &[u8]) -> Result<ExtensionHandshake, PeerError> {
  let value = bencode::decode(payload).map_err(|e| PeerError::Protocol(format!("invalid extension handshake: {e}")))?;
  let dict = value
    .as_dict()
    .ok_or_else(|| PeerError::Protocol("extension handshake is not a dict".into()))?;

  let mut handshake = ExtensionHandshake::default();

  if let Some(m) = dict.get(b"m".as_slice()).and_then(Value::as_dict) {
    for (name, id) in m {
      let Some(id) = id.as_int() else { continue };
      let Ok(name) = String::from_utf8(name.clone()) else { continue };
      handshake.name_to_id.insert(name, id as u8);
    }
  }
  if let Some(v) = dict.get(b"v".as_slice()).and_then(Value::as_str) {
    handshake.client = Some(v.to_owned());
  }
  if let Some(size) = dict.get(b"metadata_size".as_slice()).and_then(Value::as_int) {
    handshake.metadata_size = Some(size);
  }

  Ok(handshake)
}

/// One peer-exchange compact entry and its advertised flags, as carried in
/// a `ut_pex` message's `added`/`added.f` (or the IPv6 equivalents).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PexEntry {
  pub addr: SocketAddr,
  pub flags: u8,
}

/// A decoded `ut_pex` message.
#[derive(Debug, Clone, Default)]
pub struct PexMessage {
  pub added: Vec<PexEntry>,
  pub dropped: Vec<SocketAddr>,
}

pub fn encode_pex_message(msg: &PexMessage) -> Vec<u8> {
  let (added_v4, added_v6): (Vec<_>, Vec<_>) = msg.added.iter().partition(|e| e.addr.is_ipv4());
  let (dropped_v4, dropped_v6): (Vec<_>, Vec<_>) = msg.dropped.iter().partition(|a| a.is_ipv4());

  let mut entries = vec![
    ("added", bencode::bytes(encode_compact_v4(added_v4.iter().map(|e| e.addr)))),
    ("added.f", bencode::bytes(added_v4.iter().map(|e| e.flags).collect::<Vec<_>>())),
    ("dropped", bencode::bytes(encode_compact_v4(dropped_v4.into_iter().copied()))),
  ];
  if !added_v6.is_empty() {
    entries.push(("added6", bencode::bytes(encode_compact_v6(added_v6.iter().map(|e| e.addr)))));
    entries.push(("added6.f", bencode::bytes(added_v6.iter().map(|e| e.flags).collect::<Vec<_>>())));
  }
  if !dropped_v6.is_empty() {
    entries.push(("dropped6", bencode::bytes(encode_compact_v6(dropped_v6.into_iter().copied()))));
  }

  bencode::encode(&bencode::dict(entries))
}

pub fn parse_pex_message(payload: &[u8]) -> Result<PexMessage, PeerError> {
  let value = bencode::decode(payload).map_err(|e| PeerError::Protocol(format!("invalid pex message: {e}")))?;
  let dict = value.as_dict().ok_or_else(|| PeerError::Protocol("pex message is not a dict".into()))?;

  let added4 = dict.get(b"added".as_slice()).and_then(Value::as_bytes).map(decode_compact_v4).unwrap_or_default();
  let flags4 = dict.get(b"added.f".as_slice()).and_then(Value::as_bytes).map(<[u8]>::to_vec).unwrap_or_default();
  let dropped4 = dict.get(b"dropped".as_slice()).and_then(Value::as_bytes).map(decode_compact_v4).unwrap_or_default();

  let added6 = dict.get(b"added6".as_slice()).and_then(Value::as_bytes).map(decode_compact_v6).unwrap_or_default();
  let flags6 = dict.get(b"added6.f".as_slice()).and_then(Value::as_bytes).map(<[u8]>::to_vec).unwrap_or_default();
  let dropped6 = dict.get(b"dropped6".as_slice()).and_then(Value::as_bytes).map(decode_compact_v6).unwrap_or_default();

  let mut added: Vec<PexEntry> = added4
    .into_iter()
    .enumerate()
    .map(|(i, addr)| PexEntry {
      addr: SocketAddr::V4(addr),
      flags: flags4.get(i).copied().unwrap_or(0),
    })
    .collect();
  added.extend(added6.into_iter().enumerate().map(|(i, addr)| PexEntry {
    addr: SocketAddr::V6(addr),
    flags: flags6.get(i).copied().unwrap_or(0),
  }));

  let mut dropped: Vec<SocketAddr> = dropped4.into_iter().map(SocketAddr::V4).collect();
  dropped.extend(dropped6.into_iter().map(SocketAddr::V6));

  Ok(PexMessage { added, dropped })
}

fn encode_compact_v4(addrs: impl Iterator<Item = SocketAddr>) -> Vec<u8> {
  let mut out = Vec::new();
  for addr in addrs {
    if let SocketAddr::V4(addr) = addr {
      out.extend_from_slice(&addr.ip().octets());
      out.extend_from_slice(&addr.port().to_be_bytes());
    }
  }
  out
}

fn decode_compact_v4(bytes: &[u8]) -> Vec<SocketAddrV4> {
  bytes
    .chunks_exact(6)
    .map(|c| {
      let ip = Ipv4Addr::new(c[0], c[1], c[2], c[3]);
      let port = u16::from_be_bytes([c[4], c[5]]);
      SocketAddrV4::new(ip, port)
    })
    .collect()
}

fn encode_compact_v6(addrs: impl Iterator<Item = SocketAddr>) -> Vec<u8> {
  let mut out = Vec::new();
  for addr in addrs {
    if let SocketAddr::V6(addr) = addr {
      out.extend_from_slice(&addr.ip().octets());
      out.extend_from_slice(&addr.port().to_be_bytes());
    }
  }
  out
}

fn decode_compact_v6(bytes: &[u8]) -> Vec<SocketAddrV6> {
  bytes
    .chunks_exact(18)
    .map(|c| {
      let mut octets = [0u8; 16];
      octets.copy_from_slice(&c[0..16]);
      let ip = Ipv6Addr::from(octets);
      let port = u16::from_be_bytes([c[16], c[17]]);
      SocketAddrV6::new(ip, port, 0, 0)
    })
    .collect()
}

/// Tracks the known-peer set for one torrent's ut_pex and turns it into
/// rate-limited, size-capped `added`/`dropped` deltas.
///
/// Adding a peer cancels a pending drop of the same address and vice
/// versa, since a peer that reconnects within one PEX interval shouldn't
/// be reported as both added and dropped.
pub struct PexTracker {
  known: HashMap<SocketAddr, u8>,
  pending_added: HashMap<SocketAddr, u8>,
  pending_dropped: Vec<SocketAddr>,
  last_emit: Option<Instant>,
}

impl Default for PexTracker {
  fn default() -> Self {
    Self {
      known: HashMap::new(),
      pending_added: HashMap::new(),
      pending_dropped: Vec::new(),
      last_emit: None,
    }
  }
}

impl PexTracker {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add(&mut self, addr: SocketAddr, flags: u8) {
    if self.known.insert(addr, flags).is_some() {
      return;
    }
    self.pending_dropped.retain(|&a| a != addr);
    self.pending_added.insert(addr, flags);
  }

  pub fn drop(&mut self, addr: SocketAddr) {
    if self.known.remove(&addr).is_none() {
      return;
    }
    self.pending_added.remove(&addr);
    self.pending_dropped.push(addr);
  }

  /// Returns the next PEX message to send, capped at 50 peers and rate
  /// limited to once per 60s. Clears the delta buffers only when a
  /// message is actually produced.
  pub fn snapshot(&mut self, now: Instant) -> Option<PexMessage> {
    if let Some(last) = self.last_emit {
      if now.duration_since(last) < PEX_MIN_INTERVAL {
        return None;
      }
    }
    if self.pending_added.is_empty() && self.pending_dropped.is_empty() {
      return None;
    }

    let added: Vec<PexEntry> = self
      .pending_added
      .iter()
      .take(PEX_MAX_PEERS_PER_MESSAGE)
      .map(|(&addr, &flags)| PexEntry { addr, flags })
      .collect();
    let remaining_budget = PEX_MAX_PEERS_PER_MESSAGE.saturating_sub(added.len());
    let dropped: Vec<SocketAddr> = self.pending_dropped.iter().take(remaining_budget).copied().collect();

    for entry in &added {
      self.pending_added.remove(&entry.addr);
    }
    self.pending_dropped.retain(|a| !dropped.contains(a));

    self.last_emit = Some(now);
    Some(PexMessage { added, dropped })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn handshake_round_trip() {
    let encoded = build_handshake("fileswarm/0.1");
    let decoded = parse_handshake(&encoded).unwrap();
    assert_eq!(decoded.supports("ut_pex"), Some(UT_PEX_ID));
    assert_eq!(decoded.supports("ut_metadata"), Some(UT_METADATA_ID));
    assert_eq!(decoded.client.as_deref(), Some("fileswarm/0.1"));
  }

  #[test]
  fn pex_message_round_trip() {
    let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
    let msg = PexMessage {
      added: vec![PexEntry { addr, flags: 0x02 }],
      dropped: vec!["127.0.0.1:6882".parse().unwrap()],
    };
    let encoded = encode_pex_message(&msg);
    let decoded = parse_pex_message(&encoded).unwrap();
    assert_eq!(decoded.added, msg.added);
    assert_eq!(decoded.dropped, msg.dropped);
  }

  #[test]
  fn add_cancels_pending_drop() {
    let mut tracker = PexTracker::new();
    let addr: SocketAddr = "10.0.0.1:6881".parse().unwrap();
    tracker.add(addr, 0);
    let t0 = Instant::now();
    tracker.snapshot(t0);
    tracker.drop(addr);
    tracker.add(addr, 0);
    assert!(tracker.pending_dropped.is_empty());
    assert!(tracker.pending_added.is_empty());
  }

  #[test]
  fn snapshot_caps_peers_and_rate_limits() {
    let mut tracker = PexTracker::new();
    for i in 0..60u16 {
      tracker.add(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 7000 + i)), 0);
    }
    let t0 = Instant::now();
    let first = tracker.snapshot(t0).unwrap();
    assert_eq!(first.added.len(), PEX_MAX_PEERS_PER_MESSAGE);
    assert!(tracker.snapshot(t0).is_none());
  }
}
