//! Parsing of `.torrent` metainfo files (component K's input boundary).
//!
//! The wire format is bencode (see [`crate::bencode`]); this module only
//! knows how to interpret the dictionary shape a torrent file uses and to
//! compute the info hash from it.

use std::path::{Path, PathBuf};

use sha1::Digest;
use url::Url;

use crate::bencode::{self, Value};
use crate::error::metainfo::MetainfoError;
use crate::storage_info::{FileInfo, FsStructure};
use crate::Sha1Hash;

pub(crate) type Result<T> = std::result::Result<T, MetainfoError>;

/// The parsed metainfo of a torrent file.
#[derive(Clone)]
pub struct Metainfo {
  /// The torrent's name, used as the download directory name for archives.
  pub name: String,
  /// The SHA-1 of the bencoded `info` dictionary, uniquely identifying the
  /// torrent's content.
  pub info_hash: Sha1Hash,
  /// A concatenation of each piece's SHA-1 hash, a multiple of 20 bytes.
  pub pieces: Vec<u8>,
  /// The nominal length of a piece, in bytes.
  pub piece_len: u32,
  /// The file layout of the torrent's content.
  pub structure: FsStructure,
  /// The trackers to announce to.
  pub trackers: Vec<Url>,
}

impl std::fmt::Debug for Metainfo {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Metainfo")
      .field("name", &self.name)
      .field("info_hash", &self.info_hash)
      .field("pieces", &"<pieces...>")
      .field("piece_len", &self.piece_len)
      .field("structure", &self.structure)
      .finish()
  }
}

impl Metainfo {
  /// Parses a `.torrent` file's raw bytes.
  ///
  /// Validation rules:
  /// - must be well-formed bencode, with a top-level dictionary;
  /// - `info.pieces` must be a multiple of 20 bytes;
  /// - `info` must contain exactly one of `length` (single file) or `files`
  ///   (archive), and declared lengths and paths must be non-empty and
  ///   relative.
  pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
    let root = bencode::decode(bytes)?;
    if root.as_dict().is_none() {
      return Err(MetainfoError::MalformedTorrent);
    }

    let info_value = root.get("info").ok_or(MetainfoError::MalformedTorrent)?;
    if info_value.as_dict().is_none() {
      return Err(MetainfoError::MalformedTorrent);
    }

    let name = info_value
      .get("name")
      .and_then(Value::as_str)
      .ok_or(MetainfoError::MalformedTorrent)?
      .to_owned();

    let pieces = info_value
      .get("pieces")
      .and_then(Value::as_bytes)
      .ok_or(MetainfoError::MalformedTorrent)?
      .to_vec();
    if pieces.len() % 20 != 0 {
      return Err(MetainfoError::MalformedTorrent);
    }

    let piece_len = info_value
      .get("piece length")
      .and_then(Value::as_int)
      .ok_or(MetainfoError::MalformedTorrent)?;
    if piece_len <= 0 {
      return Err(MetainfoError::MalformedTorrent);
    }
    let piece_len = piece_len as u32;

    let single_len = info_value.get("length").and_then(Value::as_int);
    let files_value = info_value.get("files");

    let structure = match (single_len, files_value) {
      (Some(_), Some(_)) => {
        log::warn!("metainfo contains both `length` and `files`");
        return Err(MetainfoError::MalformedTorrent);
      }
      (Some(len), None) => {
        if len <= 0 {
          return Err(MetainfoError::MalformedTorrent);
        }
        FsStructure::File(FileInfo {
          path: PathBuf::from(&name),
          len: len as u64,
          torrent_offset: 0,
        })
      }
      (None, Some(raw_files)) => {
        let raw_files = raw_files.as_list().ok_or(MetainfoError::MalformedTorrent)?;
        if raw_files.is_empty() {
          return Err(MetainfoError::MalformedTorrent);
        }

        let mut files = Vec::with_capacity(raw_files.len());
        let mut torrent_offset = 0u64;
        for raw_file in raw_files {
          if raw_file.as_dict().is_none() {
            return Err(MetainfoError::MalformedTorrent);
          }

          let len = raw_file
            .get("length")
            .and_then(Value::as_int)
            .ok_or(MetainfoError::MalformedTorrent)?;
          if len <= 0 {
            return Err(MetainfoError::MalformedTorrent);
          }

          let path_segments = raw_file
            .get("path")
            .and_then(Value::as_list)
            .ok_or(MetainfoError::MalformedTorrent)?;
          let mut path = PathBuf::new();
          for segment in path_segments {
            let segment = segment.as_str().ok_or(MetainfoError::MalformedTorrent)?;
            path.push(segment);
          }

          if path.as_os_str().is_empty() || path.is_absolute() || path == Path::new("/") {
            log::warn!("invalid file path {:?} in metainfo", path);
            return Err(MetainfoError::MalformedTorrent);
          }

          files.push(FileInfo {
            path,
            len: len as u64,
            torrent_offset,
          });
          torrent_offset += len as u64;
        }

        FsStructure::Archive { files }
      }
      (None, None) => {
        log::warn!("no `length` or `files` key in metainfo");
        return Err(MetainfoError::MalformedTorrent);
      }
    };

    let mut trackers = Vec::new();
    if let Some(tier_list) = root.get("announce-list").and_then(Value::as_list) {
      for tier in tier_list {
        if let Some(tier) = tier.as_list() {
          for tracker in tier {
            if let Some(tracker) = tracker.as_str() {
              push_tracker(&mut trackers, tracker);
            }
          }
        }
      }
    } else if let Some(tracker) = root.get("announce").and_then(Value::as_str) {
      push_tracker(&mut trackers, tracker);
    }

    if trackers.is_empty() {
      log::warn!("no usable trackers in metainfo");
    }

    let info_hash = {
      let encoded = bencode::encode(info_value);
      let digest = sha1::Sha1::digest(&encoded);
      let mut hash = [0u8; 20];
      hash.copy_from_slice(&digest);
      hash
    };

    Ok(Metainfo {
      name,
      info_hash,
      pieces,
      piece_len,
      structure,
      trackers,
    })
  }

  /// The number of pieces in the torrent, derived from the pieces hash list.
  pub fn piece_count(&self) -> usize {
    self.pieces.len() / 20
  }

  /// Returns the expected SHA-1 hash of the piece at the given index.
  pub fn piece_hash(&self, index: crate::PieceIndex) -> Option<&[u8]> {
    let start = index * 20;
    self.pieces.get(start..start + 20)
  }

  pub fn is_archive(&self) -> bool {
    self.structure.is_archive()
  }
}

fn push_tracker(trackers: &mut Vec<Url>, raw: &str) {
  match Url::parse(raw) {
    Ok(url) if url.scheme() == "http" || url.scheme() == "https" || url.scheme() == "udp" => {
      trackers.push(url)
    }
    Ok(url) => log::warn!("ignoring tracker with unsupported scheme: {}", url),
    Err(error) => log::warn!("ignoring unparseable tracker url {:?}: {}", raw, error),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn single_file_torrent() -> Vec<u8> {
    let mut info = std::collections::BTreeMap::new();
    info.insert(b"name".to_vec(), bencode::bytes(b"file.bin"));
    info.insert(b"length".to_vec(), Value::Int(1024));
    info.insert(b"piece length".to_vec(), Value::Int(512));
    info.insert(b"pieces".to_vec(), Value::Bytes(vec![0u8; 40]));

    let mut root = std::collections::BTreeMap::new();
    root.insert(b"announce".to_vec(), bencode::bytes(b"http://tracker.example/announce"));
    root.insert(b"info".to_vec(), Value::Dict(info));

    bencode::encode(&Value::Dict(root))
  }

  #[test]
  fn parses_single_file_torrent() {
    let bytes = single_file_torrent();
    let metainfo = Metainfo::from_bytes(&bytes).unwrap();
    assert_eq!(metainfo.name, "file.bin");
    assert_eq!(metainfo.piece_count(), 2);
    assert_eq!(metainfo.piece_len, 512);
    assert!(!metainfo.is_archive());
    assert_eq!(metainfo.trackers.len(), 1);
  }

  #[test]
  fn rejects_pieces_not_multiple_of_20() {
    let mut info = std::collections::BTreeMap::new();
    info.insert(b"name".to_vec(), bencode::bytes(b"file.bin"));
    info.insert(b"length".to_vec(), Value::Int(1024));
    info.insert(b"piece length".to_vec(), Value::Int(512));
    info.insert(b"pieces".to_vec(), Value::Bytes(vec![0u8; 39]));
    let mut root = std::collections::BTreeMap::new();
    root.insert(b"info".to_vec(), Value::Dict(info));
    let bytes = bencode::encode(&Value::Dict(root));
    assert_eq!(
      Metainfo::from_bytes(&bytes).unwrap_err(),
      MetainfoError::MalformedTorrent
    );
  }

  #[test]
  fn rejects_both_length_and_files() {
    let mut info = std::collections::BTreeMap::new();
    info.insert(b"name".to_vec(), bencode::bytes(b"dir"));
    info.insert(b"length".to_vec(), Value::Int(1));
    info.insert(b"files".to_vec(), Value::List(vec![]));
    info.insert(b"piece length".to_vec(), Value::Int(512));
    info.insert(b"pieces".to_vec(), Value::Bytes(vec![0u8; 20]));
    let mut root = std::collections::BTreeMap::new();
    root.insert(b"info".to_vec(), Value::Dict(info));
    let bytes = bencode::encode(&Value::Dict(root));
    assert_eq!(
      Metainfo::from_bytes(&bytes).unwrap_err(),
      MetainfoError::MalformedTorrent
    );
  }
}
