//! UDP tracker announce per BEP 15: a `connect` handshake followed by an
//! `announce` request, both retried with exponential backoff against the
//! configured base timeout (§4.I "UDP announce").

use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use tokio::net::{self, UdpSocket};
use tokio::time::timeout;

use crate::conf::TrackerConf;
use crate::error::tracker::TrackerError;

use super::announce::{Announce, Event};
use super::Result;

const PROTOCOL_ID: u64 = 0x41727101980;
const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

pub struct UdpTracker {
  host: String,
  port: u16,
  conf: TrackerConf,
}

impl UdpTracker {
  pub fn new(host: String, port: u16, conf: TrackerConf) -> Self {
    Self { host, port, conf }
  }

  pub async fn announce(&self, params: &Announce) -> Result<super::response::Response> {
    let addr = net::lookup_host((self.host.as_str(), self.port))
      .await
      .map_err(|_| TrackerError::UnknownProtocol)?
      .next()
      .ok_or(TrackerError::UnknownProtocol)?;

    // A bind failure (no local ports available) is exceedingly rare; treat
    // it the same as a network-level timeout rather than growing a new
    // error variant for an unreachable case.
    let socket = UdpSocket::bind("0.0.0.0:0").await.map_err(|_| TrackerError::Timeout)?;
    socket.connect(addr).await.map_err(|_| TrackerError::Timeout)?;

    let transaction_id: u32 = rand::random();
    let connection_id = self.connect(&socket, transaction_id).await?;
    self.do_announce(&socket, connection_id, transaction_id, params).await
  }

  async fn connect(&self, socket: &UdpSocket, transaction_id: u32) -> Result<u64> {
    let mut request = BytesMut::with_capacity(16);
    request.put_u64(PROTOCOL_ID);
    request.put_u32(ACTION_CONNECT);
    request.put_u32(transaction_id);

    let mut response = [0u8; 16];
    let n = self.send_and_retry(socket, &request, &mut response).await?;
    if n < 16 {
      return Err(TrackerError::MalformedResponse);
    }

    let mut buf = &response[..n];
    let action = buf.get_u32();
    let resp_transaction_id = buf.get_u32();
    if resp_transaction_id != transaction_id {
      return Err(TrackerError::MalformedResponse);
    }
    if action == ACTION_ERROR {
      return Err(TrackerError::TrackerFailure("connect rejected".into()));
    }
    if action != ACTION_CONNECT {
      return Err(TrackerError::MalformedResponse);
    }
    Ok(buf.get_u64())
  }

  async fn do_announce(
    &self,
    socket: &UdpSocket,
    connection_id: u64,
    transaction_id: u32,
    params: &Announce,
  ) -> Result<super::response::Response> {
    let mut request = BytesMut::with_capacity(98);
    request.put_u64(connection_id);
    request.put_u32(ACTION_ANNOUNCE);
    request.put_u32(transaction_id);
    request.extend_from_slice(&params.info_hash);
    request.extend_from_slice(&params.peer_id);
    request.put_u64(params.downloaded);
    request.put_u64(params.left);
    request.put_u64(params.uploaded);
    request.put_u32(event_code(params.event));
    request.put_u32(0); // IP address: 0 = tracker infers from the packet.
    request.put_u32(rand::random()); // key, used by the tracker to identify us across IP changes.
    request.put_i32(params.peer_count.map(|n| n as i32).unwrap_or(-1));
    request.put_u16(params.port);

    let mut response = vec![0u8; 20 + 6 * 200];
    let n = self.send_and_retry(socket, &request, &mut response).await?;
    if n < 20 {
      return Err(TrackerError::MalformedResponse);
    }

    let mut buf = &response[..n];
    let action = buf.get_u32();
    let resp_transaction_id = buf.get_u32();
    if resp_transaction_id != transaction_id {
      return Err(TrackerError::MalformedResponse);
    }
    if action == ACTION_ERROR {
      let msg = String::from_utf8_lossy(buf.chunk()).to_string();
      return Err(TrackerError::TrackerFailure(msg));
    }
    if action != ACTION_ANNOUNCE {
      return Err(TrackerError::MalformedResponse);
    }

    let interval = Duration::from_secs(buf.get_u32() as u64);
    let leecher_count = buf.get_u32() as usize;
    let seeder_count = buf.get_u32() as usize;
    let peers = super::response::parse_compact_peers(buf.chunk())?;

    Ok(super::response::Response {
      tracker_id: None,
      interval,
      min_interval: None,
      seeder_count: Some(seeder_count),
      leecher_count: Some(leecher_count),
      peers,
    })
  }

  /// Sends `request` and awaits a response, retrying with exponential
  /// backoff against the base timeout up to `udp_max_retries` times.
  async fn send_and_retry(&self, socket: &UdpSocket, request: &[u8], response: &mut [u8]) -> Result<usize> {
    let mut last_err = TrackerError::Timeout;
    for attempt in 0..=self.conf.udp_max_retries {
      socket.send(request).await.map_err(|_| TrackerError::Timeout)?;
      let wait = self.conf.udp_base_timeout * 2u32.pow(attempt);
      match timeout(wait, socket.recv(response)).await {
        Ok(Ok(n)) => return Ok(n),
        Ok(Err(_)) => last_err = TrackerError::Timeout,
        Err(_) => last_err = TrackerError::Timeout,
      }
    }
    Err(last_err)
  }
}

fn event_code(event: Option<Event>) -> u32 {
  match event {
    None => 0,
    Some(Event::Completed) => 1,
    Some(Event::Started) => 2,
    Some(Event::Stopped) => 3,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn event_codes_match_bep_15() {
    assert_eq!(event_code(None), 0);
    assert_eq!(event_code(Some(Event::Completed)), 1);
    assert_eq!(event_code(Some(Event::Started)), 2);
    assert_eq!(event_code(Some(Event::Stopped)), 3);
  }
}
