//! Magnet URI parsing: `magnet:?xt=urn:btih:<info-hash>&dn=...&tr=...&xl=...`.
//!
//! This is boundary glue for the daemon's `addTorrent` call, not a general
//! torrent source: a magnet link carries only the info hash and a handful of
//! hints, so a [`MagnetLink`] has no pieces or file list until peers and
//! trackers supply the actual metadata (unimplemented metadata exchange,
//! BEP 9, is the extension point this stops short of).

use url::Url;

use crate::error::metainfo::MetainfoError;
use crate::Sha1Hash;

type Result<T> = std::result::Result<T, MetainfoError>;

/// The parsed contents of a magnet URI.
#[derive(Debug, Clone)]
pub struct MagnetLink {
  /// The torrent's info hash, decoded from the `xt` parameter.
  pub info_hash: Sha1Hash,
  /// The display name hint from `dn`, if present.
  pub name: Option<String>,
  /// Tracker URLs from one or more `tr` parameters.
  pub trackers: Vec<Url>,
  /// The exact content length hint from `xl`, if present.
  pub exact_len: Option<u64>,
}

impl MagnetLink {
  /// Parses a magnet URI of the form
  /// `magnet:?xt=urn:btih:<hex-or-base32>&dn=<name>&tr=<tracker>&xl=<len>`.
  pub fn parse(uri: &str) -> Result<Self> {
    let url = Url::parse(uri).map_err(|_| MetainfoError::MalformedMagnet)?;
    if url.scheme() != "magnet" {
      return Err(MetainfoError::MalformedMagnet);
    }

    let mut info_hash = None;
    let mut name = None;
    let mut trackers = Vec::new();
    let mut exact_len = None;

    for (key, value) in url.query_pairs() {
      match key.as_ref() {
        "xt" => {
          let hash = value
            .strip_prefix("urn:btih:")
            .ok_or(MetainfoError::MalformedMagnet)?;
          info_hash = Some(decode_info_hash(hash)?);
        }
        "dn" => name = Some(value.into_owned()),
        "tr" => {
          if let Ok(url) = Url::parse(&value) {
            trackers.push(url);
          }
        }
        "xl" => {
          exact_len = value.parse::<u64>().ok();
        }
        _ => {}
      }
    }

    let info_hash = info_hash.ok_or(MetainfoError::MalformedMagnet)?;

    Ok(Self {
      info_hash,
      name,
      trackers,
      exact_len,
    })
  }
}

/// Decodes a 40-char hex or 32-char base32 info hash, per BEP 9's `xt`
/// parameter grammar.
fn decode_info_hash(raw: &str) -> Result<Sha1Hash> {
  let bytes = if raw.len() == 40 {
    hex::decode(raw).map_err(|_| MetainfoError::MalformedMagnet)?
  } else if raw.len() == 32 {
    decode_base32(raw).ok_or(MetainfoError::MalformedMagnet)?
  } else {
    return Err(MetainfoError::MalformedMagnet);
  };

  bytes.try_into().map_err(|_| MetainfoError::MalformedMagnet)
}

/// Minimal RFC 4648 base32 decoder (no padding), sufficient for 32-char
/// info hash encodings; magnet links never use any other base32 field.
fn decode_base32(input: &str) -> Option<Vec<u8>> {
  const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";

  let mut bits: u64 = 0;
  let mut bit_count: u32 = 0;
  let mut out = Vec::with_capacity(input.len() * 5 / 8);

  for c in input.to_ascii_uppercase().bytes() {
    let value = ALPHABET.iter().position(|&b| b == c)? as u64;
    bits = (bits << 5) | value;
    bit_count += 5;
    if bit_count >= 8 {
      bit_count -= 8;
      out.push((bits >> bit_count) as u8);
    }
  }
  Some(out)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_hex_info_hash_with_hints() {
    let uri = "magnet:?xt=urn:btih:c12fe1c06bba254a9dc9f519b335aa7c1367a88a\
               &dn=Example&tr=http%3A%2F%2Ftracker.example%2Fannounce&xl=1024";
    let link = MagnetLink::parse(uri).unwrap();
    assert_eq!(link.name.as_deref(), Some("Example"));
    assert_eq!(link.trackers.len(), 1);
    assert_eq!(link.exact_len, Some(1024));
    assert_eq!(link.info_hash.len(), 20);
  }

  #[test]
  fn parses_base32_info_hash() {
    let hex = "c12fe1c06bba254a9dc9f519b335aa7c1367a88a";
    let bytes = hex::decode(hex).unwrap();
    let base32 = encode_base32_for_test(&bytes);
    let uri = format!("magnet:?xt=urn:btih:{base32}");
    let link = MagnetLink::parse(&uri).unwrap();
    assert_eq!(link.info_hash.to_vec(), bytes);
  }

  fn encode_base32_for_test(bytes: &[u8]) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ234567";
    let mut bits: u64 = 0;
    let mut bit_count = 0;
    let mut out = String::new();
    for &b in bytes {
      bits = (bits << 8) | b as u64;
      bit_count += 8;
      while bit_count >= 5 {
        bit_count -= 5;
        out.push(ALPHABET[((bits >> bit_count) & 0x1f) as usize] as char);
      }
    }
    if bit_count > 0 {
      out.push(ALPHABET[((bits << (5 - bit_count)) & 0x1f) as usize] as char);
    }
    out
  }

  #[test]
  fn rejects_missing_xt() {
    assert!(MagnetLink::parse("magnet:?dn=Example").is_err());
  }

  #[test]
  fn rejects_non_magnet_scheme() {
    assert!(MagnetLink::parse("http://example.com").is_err());
  }
}
