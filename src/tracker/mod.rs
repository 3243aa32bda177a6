//! Tracker announce, scrape, and multi-tier coordination (components I, J).

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC};

pub use crate::error::tracker::Result;

pub mod announce;
pub mod coordinator;
pub mod http;
pub mod record;
pub mod response;
#[allow(clippy::module_inception)]
pub mod tracker;
pub mod udp;

pub mod prelude {
  pub use super::announce::*;
  pub use super::coordinator::*;
  pub use super::response::*;
  pub use super::tracker::*;
  pub use crate::error::tracker::Result;
}

/// Characters that pass through percent-encoding unescaped in a tracker
/// query string: `A-Z a-z 0-9 - . _ ~`.
pub const URL_ENCODE_RESERVED: &AsciiSet = &NON_ALPHANUMERIC.remove(b'-').remove(b'_').remove(b'~').remove(b'.');
