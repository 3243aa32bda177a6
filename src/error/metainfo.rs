pub use crate::bencode::BencodeError;

pub type Result<T, E = MetainfoError> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MetainfoError {
  #[error("{0}")]
  Bencode(BencodeError),

  #[error("malformed torrent metainfo")]
  MalformedTorrent,

  #[error("malformed magnet uri")]
  MalformedMagnet,
}

impl From<BencodeError> for MetainfoError {
  fn from(error: BencodeError) -> Self {
    Self::Bencode(error)
  }
}

impl From<url::ParseError> for MetainfoError {
  fn from(_: url::ParseError) -> Self {
    Self::MalformedTorrent
  }
}
