use std::{
  fmt,
  sync::atomic::{AtomicUsize, Ordering},
};

/// A SHA-1 hash digest, 20 bytes long.
pub type Sha1Hash = [u8; 20];

/// The peer ID is an arbitrary 20 byte string.
///
/// [`Guidelines for choosing a peer ID`](http://bittorrent.org/beps/bep_0020.html).
pub type PeerId = [u8; 20];

/// The bitfield represents the piece availability of a peer.
///
/// It is a compact bool vector of most significant bits to least
/// significant bits, that is, where the highest bit represents the first
/// piece, the second highest element represents the second piece, and so on.
///
/// A truthy boolean value of a piece's position in this vector means that
/// peer has the piece, while a falsy value means that peer doesn't have the
/// piece.
pub type Bitfield = bitvec::prelude::BitVec<u8, bitvec::prelude::Msb0>;

/// This is the only block length we're dealing with (except for possibly the
/// last block). It is the widely used and accepted 16 KiB.
pub const BLOCK_LEN: u32 = 0x4000;

/// The type of a piece's index.
///
/// On the wire all integers are sent as 4-byte big endian integers, but in
/// the source code we use `usize` to be consistent with other index types in
/// Rust.
pub type PieceIndex = usize;

/// The index of a file within a torrent's ordered file list.
pub type FileIndex = usize;

/// Identifies a torrent session within a running engine.
///
/// This is distinct from the torrent's info hash: the info hash is the
/// protocol identity of the torrent's content, while a `TorrentId` is a
/// lightweight, process-local handle the engine and its clients use to
/// address a running session. It is assigned when a torrent is added and
/// never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TorrentId(usize);

impl TorrentId {
  /// Allocates the next unique torrent id.
  pub fn new() -> Self {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    Self(NEXT.fetch_add(1, Ordering::Relaxed))
  }
}

impl Default for TorrentId {
  fn default() -> Self {
    Self::new()
  }
}

impl fmt::Display for TorrentId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}
