use std::io::{IoSlice, IoSliceMut};
use std::ops::Range;
use std::sync;

use crate::error::disk::{ReadError, WriteError};
use crate::FileIndex;

use super::{file::TorrentFile, unix};

/// Writes a complete, already-verified piece to the files it overlaps with.
///
/// This performs synchronous, potentially blocking IO and must be run off
/// the async executor.
pub fn write(bytes: &[u8], torrent_piece_offset: u64, file_range: Range<FileIndex>, files: &[sync::RwLock<TorrentFile>]) -> Result<(), WriteError> {
  let files = &files[file_range];
  debug_assert!(!files.is_empty());

  let mut torrent_write_offset = torrent_piece_offset;
  let mut piece_offset = 0u64;

  for file in files.iter() {
    let file = file.write().unwrap();

    let remaining = bytes.len() as u64 - piece_offset;
    let file_slice = file.info.get_slice(torrent_write_offset, remaining);
    debug_assert!(file_slice.len > 0);

    let start = piece_offset as usize;
    let end = start + file_slice.len as usize;
    let mut iovecs = [IoSlice::new(&bytes[start..end])];
    unix::pwritev_all(&file.handle, &mut iovecs, file_slice.offset)?;

    torrent_write_offset += file_slice.len;
    piece_offset += file_slice.len;
  }

  debug_assert_eq!(piece_offset, bytes.len() as u64);
  Ok(())
}

/// Reads a whole piece back from the files it overlaps with.
pub fn read(torrent_piece_offset: u64, file_range: Range<FileIndex>, files: &[sync::RwLock<TorrentFile>], len: u32) -> Result<Vec<u8>, ReadError> {
  let mut bytes = vec![0u8; len as usize];

  let files = &files[file_range];
  debug_assert!(!files.is_empty());
  let len = len as u64;

  let mut torrent_read_offset = torrent_piece_offset;
  let mut piece_offset = 0u64;

  for file in files.iter() {
    let file = file.read().unwrap();

    let remaining = len - piece_offset;
    let file_slice = file.info.get_slice(torrent_read_offset, remaining);
    debug_assert!(file_slice.len > 0);

    let start = piece_offset as usize;
    let end = start + file_slice.len as usize;
    let mut iovecs = [IoSliceMut::new(&mut bytes[start..end])];
    let n_read = unix::preadv_all(&file.handle, &mut iovecs, file_slice.offset)?;
    if n_read < file_slice.len {
      return Err(ReadError::Io(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "piece data missing from disk")));
    }

    torrent_read_offset += file_slice.len;
    piece_offset += file_slice.len;
  }

  debug_assert_eq!(piece_offset, len);
  Ok(bytes)
}

#[cfg(test)]
mod tests {
  use std::fs::OpenOptions;

  use tempfile::tempdir;

  use super::*;
  use crate::storage_info::FileInfo;

  fn open(path: &std::path::Path, len: u64) -> sync::RwLock<TorrentFile> {
    let handle = OpenOptions::new().create(true).write(true).read(true).open(path).unwrap();
    handle.set_len(len).unwrap();
    sync::RwLock::new(TorrentFile {
      info: FileInfo {
        path: path.to_path_buf(),
        len,
        torrent_offset: 0,
      },
      handle,
    })
  }

  #[test]
  fn write_then_read_round_trips_within_one_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("a");
    let files = vec![open(&path, 32)];

    let data = vec![7u8; 16];
    write(&data, 0, 0..1, &files).unwrap();
    let read_back = read(0, 0..1, &files, 16).unwrap();
    assert_eq!(read_back, data);
  }

  #[test]
  fn write_splits_across_a_file_boundary() {
    let dir = tempdir().unwrap();
    let a = sync::RwLock::new(TorrentFile {
      info: FileInfo {
        path: dir.path().join("a"),
        len: 10,
        torrent_offset: 0,
      },
      handle: OpenOptions::new().create(true).write(true).read(true).open(dir.path().join("a")).unwrap(),
    });
    a.write().unwrap().handle.set_len(10).unwrap();
    let b = sync::RwLock::new(TorrentFile {
      info: FileInfo {
        path: dir.path().join("b"),
        len: 10,
        torrent_offset: 10,
      },
      handle: OpenOptions::new().create(true).write(true).read(true).open(dir.path().join("b")).unwrap(),
    });
    b.write().unwrap().handle.set_len(10).unwrap();
    let files = vec![a, b];

    let data: Vec<u8> = (0..20).collect();
    write(&data, 0, 0..2, &files).unwrap();
    let read_back = read(0, 0..2, &files, 20).unwrap();
    assert_eq!(read_back, data);
  }
}
