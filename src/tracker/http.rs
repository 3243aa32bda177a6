//! HTTP tracker announce and scrape (§4.I).

use reqwest::{Client, Url};

use crate::error::tracker::TrackerError;

use super::announce::Announce;
use super::response::{self, Response, ScrapeEntry};
use super::{Result, URL_ENCODE_RESERVED};

/// An HTTP tracker client bound to a single announce URL.
pub struct HttpTracker {
  client: Client,
  url: Url,
}

impl HttpTracker {
  pub fn new(url: Url) -> Self {
    Self {
      client: Client::new(),
      url,
    }
  }

  pub async fn announce(&self, params: &Announce) -> Result<Response> {
    debug_assert_eq!(params.info_hash.len(), 20);
    debug_assert_eq!(params.peer_id.len(), 20);

    let mut query = vec![
      ("port".to_string(), params.port.to_string()),
      ("downloaded".to_string(), params.downloaded.to_string()),
      ("uploaded".to_string(), params.uploaded.to_string()),
      ("left".to_string(), params.left.to_string()),
      ("compact".to_string(), "1".to_string()),
    ];
    if let Some(peer_count) = params.peer_count {
      query.push(("numwant".to_string(), peer_count.to_string()));
    }
    if let Some(ip) = &params.ip {
      query.push(("ip".to_string(), ip.to_string()));
    }
    if let Some(tracker_id) = &params.tracker_id {
      query.push(("trackerid".to_string(), tracker_id.clone()));
    }
    if let Some(event) = &params.event {
      query.push(("event".to_string(), event.to_string()));
    }

    let url = format!(
      "{url}?info_hash={info_hash}&peer_id={peer_id}",
      url = self.url,
      info_hash = percent_encoding::percent_encode(&params.info_hash, URL_ENCODE_RESERVED),
      peer_id = percent_encoding::percent_encode(&params.peer_id, URL_ENCODE_RESERVED),
    );

    let resp = self.client.get(&url).query(&query).send().await?;
    let status = resp.status();
    if !status.is_success() {
      return Err(TrackerError::TrackerHttp(status.as_u16()));
    }
    let body = resp.bytes().await?;
    Response::parse(&body)
  }

  /// Derives the scrape URL by replacing the last path segment's
  /// `announce` prefix with `scrape`, per the unofficial scrape
  /// convention. Returns `None` if the announce URL doesn't follow it.
  pub fn scrape_url(&self) -> Option<Url> {
    let mut url = self.url.clone();
    let last_segment = url.path_segments()?.next_back()?.to_string();
    if !last_segment.starts_with("announce") {
      return None;
    }
    let new_segment = format!("scrape{}", &last_segment["announce".len()..]);
    {
      let mut segments = url.path_segments_mut().ok()?;
      segments.pop();
      segments.push(&new_segment);
    }
    Some(url)
  }

  pub async fn scrape(&self, info_hashes: &[[u8; 20]]) -> Result<std::collections::HashMap<[u8; 20], ScrapeEntry>> {
    let Some(mut url) = self.scrape_url() else {
      return Err(TrackerError::ScrapeUnsupported);
    };

    {
      let mut pairs = url.query_pairs_mut();
      for hash in info_hashes {
        pairs.append_pair(
          "info_hash",
          &percent_encoding::percent_encode(hash, URL_ENCODE_RESERVED).to_string(),
        );
      }
    }

    let resp = self.client.get(url).send().await?;
    let status = resp.status();
    if !status.is_success() {
      return Err(TrackerError::TrackerHttp(status.as_u16()));
    }
    let body = resp.bytes().await?;
    response::parse_scrape(&body)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn scrape_url_replaces_announce_segment() {
    let tracker = HttpTracker::new("http://tracker.example/x/announce".parse().unwrap());
    assert_eq!(
      tracker.scrape_url().unwrap().as_str(),
      "http://tracker.example/x/scrape"
    );
  }

  #[test]
  fn scrape_url_none_without_announce_segment() {
    let tracker = HttpTracker::new("http://tracker.example/x/foo".parse().unwrap());
    assert!(tracker.scrape_url().is_none());
  }

  #[tokio::test]
  async fn announce_parses_mock_response() {
    let mut server = mockito::Server::new_async().await;
    let _m = server
      .mock("GET", mockito::Matcher::Any)
      .with_status(200)
      .with_body(b"d8:intervali1800e5:peers0:e".to_vec())
      .create_async()
      .await;

    let tracker = HttpTracker::new(server.url().parse().unwrap());
    let announce = Announce {
      info_hash: *b"aaaaaaaaaaaaaaaaaaaa",
      peer_id: *b"bbbbbbbbbbbbbbbbbbbb",
      port: 6881,
      ip: None,
      downloaded: 0,
      uploaded: 0,
      left: 100,
      peer_count: Some(50),
      tracker_id: None,
      event: Some(super::super::announce::Event::Started),
    };

    let resp = tracker.announce(&announce).await.unwrap();
    assert_eq!(resp.interval, std::time::Duration::from_secs(1800));
    assert!(resp.peers.is_empty());
  }

  #[tokio::test]
  async fn announce_surfaces_non_2xx_status() {
    let mut server = mockito::Server::new_async().await;
    let _m = server.mock("GET", mockito::Matcher::Any).with_status(500).create_async().await;

    let tracker = HttpTracker::new(server.url().parse().unwrap());
    let announce = Announce {
      info_hash: *b"aaaaaaaaaaaaaaaaaaaa",
      peer_id: *b"bbbbbbbbbbbbbbbbbbbb",
      port: 6881,
      ip: None,
      downloaded: 0,
      uploaded: 0,
      left: 100,
      peer_count: None,
      tracker_id: None,
      event: None,
    };

    let err = tracker.announce(&announce).await.unwrap_err();
    assert!(matches!(err, TrackerError::TrackerHttp(500)));
  }
}
