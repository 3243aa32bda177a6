//! Errors produced by the bencode codec (component A).

pub type Result<T, E = BencodeError> = std::result::Result<T, E>;

/// Every way a byte stream can fail to be valid bencode.
///
/// The grammar rejects, rather than tolerates, anything not canonical:
/// leading zeros, unsorted dictionary keys, and truncated frames are all
/// `MalformedBencode` per the spec, not best-effort parses.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BencodeError {
  #[error("unexpected end of input")]
  UnexpectedEof,

  #[error("invalid integer literal")]
  InvalidInteger,

  #[error("integer has a leading zero")]
  LeadingZero,

  #[error("integer is negative zero")]
  NegativeZero,

  #[error("invalid or negative string length")]
  InvalidLength,

  #[error("dictionary keys are not in strict lexicographic order")]
  KeysNotSorted,

  #[error("dictionary has a duplicate key")]
  DuplicateKey,

  #[error("unknown value token {0:#04x}")]
  UnknownToken(u8),

  #[error("trailing bytes after a complete value")]
  TrailingData,

  #[error("dictionary key is not a byte string")]
  NonStringKey,
}
