//! A single tracker, dispatching to the HTTP or UDP transport by URL
//! scheme (§4.I).

use url::Url;

use crate::conf::TrackerConf;
use crate::error::tracker::TrackerError;

use super::announce::Announce;
use super::http::HttpTracker;
use super::response::Response;
use super::udp::UdpTracker;
use super::Result;

pub enum Tracker {
  Http(HttpTracker),
  Udp(UdpTracker),
}

impl Tracker {
  /// Builds a tracker transport for `url`. `url` is assumed to have
  /// already been validated to carry an `http`, `https`, or `udp` scheme
  /// (see [`crate::metainfo::Metainfo::from_bytes`]).
  pub fn new(url: Url, conf: TrackerConf) -> Result<Self> {
    match url.scheme() {
      "http" | "https" => Ok(Self::Http(HttpTracker::new(url))),
      "udp" => {
        let host = url.host_str().ok_or(TrackerError::UnknownProtocol)?.to_string();
        let port = url.port().ok_or(TrackerError::UnknownProtocol)?;
        Ok(Self::Udp(UdpTracker::new(host, port, conf)))
      }
      _ => Err(TrackerError::UnknownProtocol),
    }
  }

  pub async fn announce(&self, params: &Announce) -> Result<Response> {
    match self {
      Self::Http(t) => t.announce(params).await,
      Self::Udp(t) => t.announce(params).await,
    }
  }
}
