//! Per-tracker announce state, owned by the coordinator (§4.J).

use std::time::{Duration, Instant};

use url::Url;

use crate::conf::TorrentConf;

use super::tracker::Tracker;

/// The outcome of the tracker's most recent announce.
#[derive(Debug, Clone, PartialEq)]
pub enum Status {
  Idle,
  Working,
  Error(String),
}

/// One tracker's announce state within a tier.
pub struct TrackerRecord {
  pub tracker: Tracker,
  pub url: Url,
  pub status: Status,
  pub tracker_id: Option<String>,
  pub seeder_count: Option<usize>,
  pub leecher_count: Option<usize>,
  pub next_announce_at: Instant,
  consecutive_failures: u32,
}

impl TrackerRecord {
  pub fn new(tracker: Tracker, url: Url) -> Self {
    Self {
      tracker,
      url,
      status: Status::Idle,
      tracker_id: None,
      seeder_count: None,
      leecher_count: None,
      next_announce_at: Instant::now(),
      consecutive_failures: 0,
    }
  }

  pub fn is_due(&self) -> bool {
    Instant::now() >= self.next_announce_at
  }

  /// Records a successful announce: refreshes status, seeds/leeches, the
  /// tracker id if present, and schedules the next announce at
  /// `max(min_interval, interval)`, unless this was a `stopped` event.
  pub fn record_success(
    &mut self,
    conf: &TorrentConf,
    interval: Duration,
    min_interval: Option<Duration>,
    seeder_count: Option<usize>,
    leecher_count: Option<usize>,
    tracker_id: Option<String>,
    is_stopped: bool,
  ) {
    self.status = Status::Working;
    self.consecutive_failures = 0;
    self.seeder_count = seeder_count;
    self.leecher_count = leecher_count;
    if tracker_id.is_some() {
      self.tracker_id = tracker_id;
    }

    if is_stopped {
      return;
    }

    let effective = min_interval.map_or(interval, |min| interval.max(min));
    let effective = effective.max(Duration::from_secs(1)).min(conf.announce_interval * 4);
    self.next_announce_at = Instant::now() + effective;
  }

  /// Records a failed announce and schedules a retry with exponential
  /// backoff, doubling per consecutive failure up to the configured error
  /// threshold.
  pub fn record_failure(&mut self, conf: &TorrentConf, message: String) {
    self.status = Status::Error(message);
    self.consecutive_failures = (self.consecutive_failures + 1).min(conf.tracker_error_threshold as u32);
    let backoff = Duration::from_secs(30) * 2u32.pow(self.consecutive_failures.min(6));
    self.next_announce_at = Instant::now() + backoff.min(conf.announce_interval);
  }

  pub fn has_exceeded_error_threshold(&self, conf: &TorrentConf) -> bool {
    self.consecutive_failures as usize >= conf.tracker_error_threshold
  }
}
