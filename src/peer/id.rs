//! Decodes a remote peer-id into a human-readable client name (§4.G),
//! following the Azureus-style `-XX1234-...` convention most clients use.

use crate::PeerId;

/// A decoded peer-id, or `None` if it doesn't follow a recognized scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
  pub name: &'static str,
  pub version: String,
}

/// Two-letter Azureus vendor codes for common clients.
const VENDOR_CODES: &[(&str, &str)] = &[
  ("AZ", "Azureus/Vuze"),
  ("BC", "BitComet"),
  ("BT", "BitTorrent"),
  ("DE", "Deluge"),
  ("LT", "libtorrent"),
  ("qB", "qBittorrent"),
  ("TR", "Transmission"),
  ("UT", "µTorrent"),
  ("WW", "WebTorrent"),
  ("FS", "fileswarm"),
];

/// Parses a peer-id of the form `-XX1234-......` into a vendor name and a
/// version string, decoding each version digit where `0-9` are literal and
/// `A-Z` represent `10-35`.
pub fn decode(peer_id: &PeerId) -> Option<ClientInfo> {
  if peer_id[0] != b'-' || peer_id[7] != b'-' {
    return None;
  }
  let code = std::str::from_utf8(&peer_id[1..3]).ok()?;
  let name = VENDOR_CODES
    .iter()
    .find(|(c, _)| *c == code)
    .map(|(_, name)| *name)
    .unwrap_or("unknown");

  let version: String = peer_id[3..7]
    .iter()
    .map(|&b| match b {
      b'0'..=b'9' => (b - b'0').to_string(),
      b'A'..=b'Z' => (10 + (b - b'A')).to_string(),
      _ => "0".to_string(),
    })
    .collect::<Vec<_>>()
    .join(".");

  Some(ClientInfo { name, version })
}

#[cfg(test)]
mod tests {
  use super::*;

  fn peer_id(s: &str) -> PeerId {
    let mut id = [0u8; 20];
    id[..s.len().min(20)].copy_from_slice(&s.as_bytes()[..s.len().min(20)]);
    id
  }

  #[test]
  fn decodes_known_vendor() {
    let id = peer_id("-UT1230-abcdefghijk1");
    let info = decode(&id).unwrap();
    assert_eq!(info.name, "µTorrent");
    assert_eq!(info.version, "1.2.3.0");
  }

  #[test]
  fn decodes_letter_version_digits() {
    let id = peer_id("-DEAB12-abcdefghijk1");
    let info = decode(&id).unwrap();
    assert_eq!(info.name, "Deluge");
    assert_eq!(info.version, "10.11.1.2");
  }

  #[test]
  fn unknown_vendor_code_is_still_parsed() {
    let id = peer_id("-ZZ0001-abcdefghijk1");
    let info = decode(&id).unwrap();
    assert_eq!(info.name, "unknown");
  }

  #[test]
  fn non_conforming_id_returns_none() {
    let id = peer_id("this-is-not-an-id123");
    assert!(decode(&id).is_none());
  }
}
