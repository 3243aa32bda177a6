use crate::error::metainfo::BencodeError;
use reqwest::Error as HttpError;

pub type Result<T, E = TrackerError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
  #[error("{0}")]
  Bencode(BencodeError),

  #[error("{0}")]
  Http(HttpError),

  #[error("tracker reported failure: {0}")]
  /// The tracker's response carried a `failure reason` key.
  TrackerFailure(String),

  #[error("tracker returned HTTP status {0}")]
  TrackerHttp(u16),

  #[error("tracker request timed out")]
  Timeout,

  #[error("tracker uses an unrecognized protocol")]
  UnknownProtocol,

  #[error("scrape is not supported by this tracker url")]
  ScrapeUnsupported,

  #[error("malformed announce response")]
  MalformedResponse,
}

impl From<BencodeError> for TrackerError {
  fn from(value: BencodeError) -> Self {
    Self::Bencode(value)
  }
}

impl From<HttpError> for TrackerError {
  fn from(value: HttpError) -> Self {
    Self::Http(value)
  }
}
