//! Storage-related metadata derived from a torrent's metainfo: the piece
//! grid and the file layout it maps onto (component K).

use std::{ops::Range, path::PathBuf};

use crate::{error::piece::PieceError, metainfo::Metainfo, FileIndex, PieceIndex};

/// Information about a torrent's file.
#[derive(Debug, Clone)]
pub struct FileInfo {
  /// The file's relative path from the download directory.
  pub path: PathBuf,
  /// The file's length, in bytes.
  pub len: u64,
  /// The byte offset of the file within the torrent, when all files in
  /// torrent are viewed as a single contiguous byte array. Always 0 for
  /// a single file torrent.
  pub torrent_offset: u64,
}

impl FileInfo {
  /// One past the last byte offset of the file within the torrent.
  pub fn torrent_end_offset(&self) -> u64 {
    self.torrent_offset + self.len
  }

  /// The range of torrent-relative byte offsets this file occupies.
  pub fn byte_range(&self) -> Range<u64> {
    self.torrent_offset..self.torrent_end_offset()
  }

  /// Returns the slice of this file that overlaps the given torrent-relative
  /// byte range.
  ///
  /// # Panics
  ///
  /// Panics if `torrent_offset` falls outside the file's byte range.
  pub fn get_slice(&self, torrent_offset: u64, len: u64) -> FileSlice {
    assert!(
      torrent_offset >= self.torrent_offset,
      "torrent offset must be larger than file offset"
    );
    let end = self.torrent_end_offset();
    assert!(
      torrent_offset < end,
      "torrent offset must be smaller than file end offset"
    );
    FileSlice {
      offset: torrent_offset - self.torrent_offset,
      len: len.min(end - torrent_offset),
    }
  }
}

/// A byte range within a single file, relative to that file's start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileSlice {
  pub offset: u64,
  pub len: u64,
}

/// Defines the file system structure of the download.
#[derive(Debug, Clone)]
pub enum FsStructure {
  /// A single file download.
  File(FileInfo),
  /// Multiple files, possibly with nested directories.
  Archive { files: Vec<FileInfo> },
}

impl FsStructure {
  pub fn is_archive(&self) -> bool {
    matches!(self, Self::Archive { .. })
  }

  /// The total download size in bytes. O(n) for archives, caller should
  /// cache this where it's used repeatedly.
  pub fn download_len(&self) -> u64 {
    match self {
      Self::File(file) => file.len,
      Self::Archive { files } => files.iter().map(|f| f.len).sum(),
    }
  }

  /// Returns the indices of the files overlapping the given left-inclusive
  /// byte range.
  pub fn files_intersecting_bytes(&self, byte_range: Range<u64>) -> Range<FileIndex> {
    match self {
      Self::File(_) => 0..1,
      Self::Archive { files } => {
        let first = match files
          .iter()
          .enumerate()
          .find(|(_, file)| file.byte_range().contains(&byte_range.start))
          .map(|(index, _)| index)
        {
          Some(index) => index,
          None => return 0..0,
        };

        let mut range = first..first + 1;
        for (index, file) in files.iter().enumerate().skip(first + 1) {
          if !byte_range.contains(&file.torrent_offset) {
            break;
          }
          range.end = index + 1;
        }
        range
      }
    }
  }
}

/// Information about a torrent's storage details: piece count and length,
/// total download length, and the file layout it's split across.
#[derive(Debug, Clone)]
pub struct StorageInfo {
  /// The number of pieces in the torrent.
  pub piece_count: usize,
  /// The nominal length of a piece.
  pub piece_len: u32,
  /// The length of the last piece, which may be shorter than `piece_len`.
  pub last_piece_len: u32,
  /// The sum of the length of all files in the torrent.
  pub download_len: u64,
  /// The download destination directory. For archive torrents this is
  /// `download_dir` joined with the torrent's name, to avoid scattering an
  /// archive's top-level entries across the shared download directory.
  pub download_dir: PathBuf,
  /// The file layout of the torrent.
  pub structure: FsStructure,
}

impl StorageInfo {
  /// Extracts storage-related information from a torrent's metainfo.
  pub fn new(metainfo: &Metainfo, download_dir: PathBuf) -> Self {
    let piece_count = metainfo.piece_count();
    let download_len = metainfo.structure.download_len();
    let piece_len = metainfo.piece_len;
    let last_piece_len = download_len - piece_len as u64 * (piece_count - 1) as u64;
    let last_piece_len = last_piece_len as u32;

    let download_dir = if metainfo.structure.is_archive() {
      download_dir.join(&metainfo.name)
    } else {
      download_dir
    };

    Self {
      piece_count,
      piece_len,
      last_piece_len,
      download_len,
      download_dir,
      structure: metainfo.structure.clone(),
    }
  }

  /// Returns the length of the piece at the given index.
  pub fn piece_len(&self, index: PieceIndex) -> Result<u32, PieceError> {
    if index < self.piece_count.saturating_sub(1) {
      Ok(self.piece_len)
    } else if index == self.piece_count - 1 {
      Ok(self.last_piece_len)
    } else {
      Err(PieceError::OutOfBounds)
    }
  }

  /// Returns the indices of the files that intersect the given piece.
  pub fn files_intersecting_piece(&self, index: PieceIndex) -> Result<Range<FileIndex>, PieceError> {
    let piece_offset = index as u64 * self.piece_len as u64;
    let piece_end = piece_offset + self.piece_len(index)? as u64;
    Ok(self.structure.files_intersecting_bytes(piece_offset..piece_end))
  }

  /// Deletes this torrent's on-disk files, used by the `removeTorrent`
  /// RPC's `deleteFiles` option. An archive's files all live under
  /// `download_dir`, so removing that single directory is enough; a single
  /// file download removes just that file.
  pub fn delete_files(&self) -> std::io::Result<()> {
    match &self.structure {
      FsStructure::File(file) => std::fs::remove_file(self.download_dir.join(&file.path)),
      FsStructure::Archive { .. } => std::fs::remove_dir_all(&self.download_dir),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn file_get_slice_clamps_to_file_and_range_length() {
    let file = FileInfo {
      path: PathBuf::from("/tmp/does/not/exist"),
      len: 500,
      torrent_offset: 200,
    };
    assert_eq!(
      file.get_slice(300, 1000),
      FileSlice { offset: 100, len: 400 }
    );
    assert_eq!(file.get_slice(300, 10), FileSlice { offset: 100, len: 10 });
    assert_eq!(file.get_slice(200, 500), FileSlice { offset: 0, len: 500 });
  }

  #[test]
  #[should_panic(expected = "torrent offset must be larger than file offset")]
  fn file_get_slice_panics_before_file_start() {
    let file = FileInfo {
      path: PathBuf::from("/tmp/does/not/exist"),
      len: 500,
      torrent_offset: 200,
    };
    file.get_slice(100, 400);
  }

  #[test]
  fn piece_len_reports_shorter_last_piece() {
    let info = StorageInfo {
      piece_count: 4,
      piece_len: 16,
      last_piece_len: 4,
      download_len: 3 * 16 + 4,
      download_dir: PathBuf::from("/"),
      structure: FsStructure::File(FileInfo {
        path: PathBuf::from("/bogus"),
        torrent_offset: 0,
        len: 3 * 16 + 4,
      }),
    };
    assert_eq!(info.piece_len(0).unwrap(), 16);
    assert_eq!(info.piece_len(3).unwrap(), 4);
    assert!(info.piece_len(4).is_err());
  }

  #[test]
  fn files_intersecting_piece_spans_multiple_files() {
    let files = vec![
      FileInfo { path: PathBuf::from("/0"), torrent_offset: 0, len: 9 },
      FileInfo { path: PathBuf::from("/1"), torrent_offset: 9, len: 11 },
      FileInfo { path: PathBuf::from("/2"), torrent_offset: 20, len: 7 },
      FileInfo { path: PathBuf::from("/3"), torrent_offset: 27, len: 9 },
      FileInfo { path: PathBuf::from("/4"), torrent_offset: 36, len: 12 },
      FileInfo { path: PathBuf::from("/5"), torrent_offset: 48, len: 16 },
      FileInfo { path: PathBuf::from("/6"), torrent_offset: 64, len: 8 },
    ];
    let download_len: u64 = files.iter().map(|f| f.len).sum();
    let info = StorageInfo {
      piece_count: 5,
      piece_len: 16,
      last_piece_len: 8,
      download_len,
      download_dir: PathBuf::from("/"),
      structure: FsStructure::Archive { files },
    };
    assert_eq!(info.files_intersecting_piece(0).unwrap(), 0..2);
    assert_eq!(info.files_intersecting_piece(1).unwrap(), 1..4);
    assert_eq!(info.files_intersecting_piece(2).unwrap(), 3..5);
    assert_eq!(info.files_intersecting_piece(3).unwrap(), 5..6);
    assert_eq!(info.files_intersecting_piece(4).unwrap(), 6..7);
    assert!(info.files_intersecting_piece(5).is_err());
  }
}
