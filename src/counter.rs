//! Per-peer throughput accounting: running totals plus a sliding-window
//! rate estimate, sampled periodically by the peer session and reported
//! to the torrent in each [`crate::peer::SessionTick`].

use crate::avg::SlidingAvg;
use crate::conf::PeerConf;

/// Tracks bytes transferred in one direction (payload only, protocol
/// overhead excluded) plus a smoothed rate estimate.
#[derive(Debug, Clone)]
pub struct ThruputCounter {
    total: u64,
    round_sum: u64,
    rate: SlidingAvg,
}

impl ThruputCounter {
    fn new(sample_count: usize) -> Self {
        Self {
            total: 0,
            round_sum: 0,
            rate: SlidingAvg::new(sample_count),
        }
    }

    /// Records `n` bytes transferred since the last call to [`Self::tick`].
    pub fn add(&mut self, n: u32) {
        self.total += n as u64;
        self.round_sum += n as u64;
    }

    /// Folds the bytes accumulated since the last tick into the rate
    /// average. Called once per sampling interval.
    pub fn tick(&mut self) {
        self.rate.update(self.round_sum as i64);
        self.round_sum = 0;
    }

    /// Total bytes ever recorded.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// The smoothed transfer rate, in bytes per sampling interval.
    pub fn rate(&self) -> i64 {
        self.rate.mean()
    }
}

/// The throughput counters for a single peer session: one pair of payload
/// counters for data blocks and one pair for protocol messages (handshake,
/// have, bitfield, requests, ...), split so callers can tell payload
/// efficiency from protocol chatter.
#[derive(Debug, Clone)]
pub struct ThruputCounters {
    pub payload_downloaded: ThruputCounter,
    pub payload_uploaded: ThruputCounter,
    pub protocol_downloaded: ThruputCounter,
    pub protocol_uploaded: ThruputCounter,
}

impl ThruputCounters {
    pub fn new(conf: &PeerConf) -> Self {
        Self {
            payload_downloaded: ThruputCounter::new(conf.speed_sample_count),
            payload_uploaded: ThruputCounter::new(conf.speed_sample_count),
            protocol_downloaded: ThruputCounter::new(conf.speed_sample_count),
            protocol_uploaded: ThruputCounter::new(conf.speed_sample_count),
        }
    }

    /// Folds this tick's byte counts into every counter's rate average.
    /// Called once per sampling interval by the peer session's tick loop.
    pub fn tick(&mut self) {
        self.payload_downloaded.tick();
        self.payload_uploaded.tick();
        self.protocol_downloaded.tick();
        self.protocol_uploaded.tick();
    }

    /// Download rate of payload bytes, in bytes per sampling interval.
    pub fn download_rate(&self) -> i64 {
        self.payload_downloaded.rate()
    }

    /// Upload rate of payload bytes, in bytes per sampling interval.
    pub fn upload_rate(&self) -> i64 {
        self.payload_uploaded.rate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_accumulates_across_ticks() {
        let mut c = ThruputCounter::new(5);
        c.add(100);
        c.tick();
        c.add(50);
        c.tick();
        assert_eq!(c.total(), 150);
    }

    #[test]
    fn rate_is_zero_before_any_tick() {
        let c = ThruputCounter::new(5);
        assert_eq!(c.rate(), 0);
    }

    #[test]
    fn rate_tracks_recent_round_sum() {
        let mut c = ThruputCounter::new(5);
        c.add(1000);
        c.tick();
        assert_eq!(c.rate(), 1000);
    }

    #[test]
    fn counters_tick_independently() {
        let conf = PeerConf::default();
        let mut counters = ThruputCounters::new(&conf);
        counters.payload_downloaded.add(500);
        counters.tick();
        assert_eq!(counters.download_rate(), 500);
        assert_eq!(counters.upload_rate(), 0);
    }
}
