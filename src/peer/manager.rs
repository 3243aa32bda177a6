//! Peer connection manager (component G): dials new peers, classifies
//! disconnects into a reconnect-or-not decision, bans repeat offenders, and
//! tracks per-peer throughput.
//!
//! Owned exclusively by its torrent's task, so its maps are plain (no
//! internal locking) even though dialling involves `.await` points.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::timeout;
use tokio_util::codec::{Decoder, Encoder};

use crate::conf::PeerConf;
use crate::error::peer::{ConnectError, ConnectResult, PeerError};
use crate::peer::codec::handshake::{Handshake, HandshakeCodec};
use crate::peer::session::{Session, SessionContext};
use crate::peer::{self, SessionTick};
use crate::{PeerId, Sha1Hash};

/// Bit 0x10 of reserved byte 5 (from the high end), the de facto standard
/// BEP 10 extension-protocol flag.
const EXTENSION_PROTOCOL_BIT: u8 = 0x10;
const EXTENSION_PROTOCOL_BYTE: usize = 5;

/// Why a peer session ended, driving the reconnection decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
  Normal,
  Timeout,
  Rejected,
  ProtocolError,
  NetworkError,
  ClientDisconnect,
  ManagerStopped,
  TorrentRemoved,
}

impl DisconnectReason {
  /// Classifies a session error into a disconnect reason.
  pub fn from_error(err: &PeerError) -> Self {
    match err {
      PeerError::Io(e) if e.kind() == std::io::ErrorKind::TimedOut => Self::Timeout,
      PeerError::Io(_) => Self::NetworkError,
      PeerError::Protocol(_) | PeerError::BitfieldNotAfterHandshake | PeerError::InvalidBlockInfo | PeerError::InvalidPieceIndex => Self::ProtocolError,
      PeerError::RequestWhileChoked => Self::Rejected,
      PeerError::Channel => Self::ManagerStopped,
      PeerError::InactivityTimeout => Self::Timeout,
      PeerError::InvalidInfoHash => Self::Rejected,
    }
  }

  fn reconnects(self) -> bool {
    !matches!(self, Self::Rejected | Self::ClientDisconnect | Self::ManagerStopped | Self::TorrentRemoved)
  }
}

/// Events the manager surfaces to its owning torrent.
#[derive(Debug)]
pub enum ManagerEvent {
  PeerConnected { addr: SocketAddr, client_id: PeerId },
  PeerDisconnected { addr: SocketAddr, reason: DisconnectReason },
  PeerBanned { addr: SocketAddr },
  ReconnectDue { addr: SocketAddr },
}

pub type EventSender = UnboundedSender<ManagerEvent>;
pub type EventReceiver = UnboundedReceiver<ManagerEvent>;

struct Connection {
  cmd_tx: peer::Sender,
  join_handle: tokio::task::JoinHandle<()>,
  last_tick: Option<SessionTick>,
}

struct DisconnectedPeer {
  attempts: usize,
}

struct PeerHealth {
  consecutive_failures: usize,
  banned_until: Option<Instant>,
  /// `None` together with a past `banned_until` of `None` after reaching
  /// the threshold means a permanent ban (no `ban_duration` configured).
  permanent: bool,
}

impl Default for PeerHealth {
  fn default() -> Self {
    Self {
      consecutive_failures: 0,
      banned_until: None,
      permanent: false,
    }
  }
}

pub struct PeerManager {
  conf: PeerConf,
  pending: HashSet<SocketAddr>,
  connections: HashMap<SocketAddr, Connection>,
  disconnected: HashMap<SocketAddr, DisconnectedPeer>,
  health: HashMap<SocketAddr, PeerHealth>,
  events: EventSender,
  stopped: bool,
  /// Total connected peers across every torrent in the engine, shared so
  /// `max_connections` is enforced as a true cross-torrent total rather
  /// than a per-manager count.
  global_connections: Arc<AtomicUsize>,
}

impl PeerManager {
  pub fn new(conf: PeerConf, global_connections: Arc<AtomicUsize>) -> (Self, EventReceiver) {
    let (events, rx) = mpsc::unbounded_channel();
    (
      Self {
        conf,
        pending: HashSet::new(),
        connections: HashMap::new(),
        disconnected: HashMap::new(),
        health: HashMap::new(),
        events,
        stopped: false,
        global_connections,
      },
      rx,
    )
  }

  pub fn connected_count(&self) -> usize {
    self.connections.len()
  }

  pub fn is_connected(&self, addr: &SocketAddr) -> bool {
    self.connections.contains_key(addr)
  }

  /// Auto-unbans an expired temporary ban as a side effect of checking.
  pub fn is_banned(&mut self, addr: &SocketAddr) -> bool {
    let Some(health) = self.health.get_mut(addr) else {
      return false;
    };
    if health.permanent {
      return true;
    }
    match health.banned_until {
      Some(until) if until > Instant::now() => true,
      Some(_) => {
        health.banned_until = None;
        false
      }
      None => false,
    }
  }

  fn record_failure(&mut self, addr: SocketAddr) {
    let health = self.health.entry(addr).or_default();
    health.consecutive_failures += 1;
    if health.consecutive_failures >= self.conf.failures_before_ban {
      match self.conf.ban_duration {
        Some(d) => health.banned_until = Some(Instant::now() + d),
        None => health.permanent = true,
      }
      let _ = self.events.send(ManagerEvent::PeerBanned { addr });
    }
  }

  fn record_success(&mut self, addr: SocketAddr) {
    self.health.entry(addr).or_default().consecutive_failures = 0;
  }

  /// Dials `addr`, performs the handshake, and on success spawns the
  /// session task. Rejects per the connection-limit/ban/in-flight rules
  /// before doing any IO.
  pub async fn dial(&mut self, addr: SocketAddr, ctx: std::sync::Arc<SessionContext>, piece_count: usize) -> ConnectResult<()> {
    if self.stopped {
      return Err(ConnectError::AlreadyConnecting(addr));
    }
    if self.pending.contains(&addr) || self.connections.contains_key(&addr) {
      return Err(ConnectError::AlreadyConnecting(addr));
    }
    if self.is_banned(&addr) {
      return Err(ConnectError::PeerBanned(addr));
    }
    if self.global_connections.load(Ordering::SeqCst) >= self.conf.max_connections || self.connections.len() >= self.conf.max_per_torrent {
      return Err(ConnectError::ConnectionLimit);
    }

    self.pending.insert(addr);
    let result = self.connect_and_handshake(addr, &ctx, piece_count).await;
    self.pending.remove(&addr);

    match result {
      Ok((session, client_id, cmd_tx)) => {
        let join_handle = tokio::spawn(async move {
          if let Err(e) = session.run().await {
            log::debug!("session with {addr} ended: {e}");
          }
        });
        self.connections.insert(
          addr,
          Connection {
            cmd_tx,
            join_handle,
            last_tick: None,
          },
        );
        self.global_connections.fetch_add(1, Ordering::SeqCst);
        self.record_success(addr);
        let _ = self.events.send(ManagerEvent::PeerConnected { addr, client_id });
        Ok(())
      }
      Err(e) => {
        self.record_failure(addr);
        Err(e)
      }
    }
  }

  async fn connect_and_handshake(
    &self,
    addr: SocketAddr,
    ctx: &std::sync::Arc<SessionContext>,
    piece_count: usize,
  ) -> ConnectResult<(Session, PeerId, peer::Sender)> {
    let socket = timeout(self.conf.connect_timeout, TcpStream::connect(addr))
      .await
      .map_err(|_| ConnectError::Timeout(addr))?
      .map_err(PeerError::from)?;

    let (socket, remote_peer_id, extension_protocol) =
      timeout(self.conf.handshake_timeout, perform_handshake(socket, ctx.info_hash, ctx.client_id))
        .await
        .map_err(|_| ConnectError::Timeout(addr))??;

    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let session = Session::new(ctx.clone(), socket, addr, remote_peer_id, extension_protocol, piece_count, cmd_rx, cmd_tx.clone());
    Ok((session, remote_peer_id, cmd_tx))
  }

  /// Registers an already-accepted inbound connection, performing the
  /// handshake side of it here (the listener only accepts the TCP stream).
  /// Subject to the same ban/limit rejection rules as [`Self::dial`], minus
  /// the in-flight-dial bookkeeping, which doesn't apply to an inbound
  /// connection that is already established.
  pub async fn adopt(&mut self, socket: TcpStream, addr: SocketAddr, ctx: std::sync::Arc<SessionContext>, piece_count: usize) -> ConnectResult<()> {
    if self.stopped {
      return Err(ConnectError::AlreadyConnecting(addr));
    }
    if self.connections.contains_key(&addr) {
      return Err(ConnectError::AlreadyConnecting(addr));
    }
    if self.is_banned(&addr) {
      return Err(ConnectError::PeerBanned(addr));
    }
    if self.global_connections.load(Ordering::SeqCst) >= self.conf.max_connections || self.connections.len() >= self.conf.max_per_torrent {
      return Err(ConnectError::ConnectionLimit);
    }

    let result = timeout(self.conf.handshake_timeout, perform_handshake(socket, ctx.info_hash, ctx.client_id))
      .await
      .map_err(|_| ConnectError::Timeout(addr))?;

    match result {
      Ok((socket, client_id, extension_protocol)) => {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let session = Session::new(ctx.clone(), socket, addr, client_id, extension_protocol, piece_count, cmd_rx, cmd_tx.clone());
        let join_handle = tokio::spawn(async move {
          if let Err(e) = session.run().await {
            log::debug!("session with {addr} ended: {e}");
          }
        });
        self.connections.insert(
          addr,
          Connection {
            cmd_tx,
            join_handle,
            last_tick: None,
          },
        );
        self.global_connections.fetch_add(1, Ordering::SeqCst);
        self.record_success(addr);
        let _ = self.events.send(ManagerEvent::PeerConnected { addr, client_id });
        Ok(())
      }
      Err(e) => {
        self.record_failure(addr);
        Err(e.into())
      }
    }
  }

  /// Records a session ending and decides whether to schedule a
  /// reconnect, returning the reason for the caller to log or surface.
  pub fn handle_disconnect(&mut self, addr: SocketAddr, reason: DisconnectReason) {
    if self.connections.remove(&addr).is_some() {
      self.global_connections.fetch_sub(1, Ordering::SeqCst);
    }
    let _ = self.events.send(ManagerEvent::PeerDisconnected { addr, reason });

    if !reason.reconnects() || self.stopped {
      return;
    }

    let attempts = self.disconnected.entry(addr).or_insert(DisconnectedPeer { attempts: 0 });
    if attempts.attempts >= self.conf.max_reconnect_attempts {
      self.disconnected.remove(&addr);
      self.record_failure(addr);
      return;
    }
    attempts.attempts += 1;
    let attempt_count = attempts.attempts;

    let delay = self.conf.initial_reconnect_delay.mul_f64(self.conf.reconnect_backoff_multiplier.powi(attempt_count as i32 - 1));
    let events = self.events.clone();
    tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      let _ = events.send(ManagerEvent::ReconnectDue { addr });
    });
  }

  /// Folds in a periodic state report from a live session.
  pub fn record_tick(&mut self, addr: SocketAddr, tick: SessionTick) {
    if let Some(conn) = self.connections.get_mut(&addr) {
      conn.last_tick = Some(tick);
    }
  }

  /// Announces a newly completed piece to every connected peer.
  pub fn broadcast_have(&self, index: crate::PieceIndex) {
    for conn in self.connections.values() {
      let _ = conn.cmd_tx.send(peer::Command::PieceCompleted { index });
    }
  }

  pub fn download_rate(&self, addr: &SocketAddr) -> i64 {
    self.connections.get(addr).and_then(|c| c.last_tick.as_ref()).map_or(0, |t| t.counters.download_rate())
  }

  pub fn upload_rate(&self, addr: &SocketAddr) -> i64 {
    self.connections.get(addr).and_then(|c| c.last_tick.as_ref()).map_or(0, |t| t.counters.upload_rate())
  }

  /// Tears down every connection without stopping the manager itself, so a
  /// later [`Self::dial`]/[`Self::adopt`] still succeeds (used when a
  /// torrent pauses rather than shuts down).
  pub async fn disconnect_all(&mut self) {
    for (addr, conn) in self.connections.drain() {
      self.global_connections.fetch_sub(1, Ordering::SeqCst);
      let _ = conn.cmd_tx.send(peer::Command::Shutdown);
      conn.join_handle.abort();
      let _ = self.events.send(ManagerEvent::PeerDisconnected {
        addr,
        reason: DisconnectReason::ManagerStopped,
      });
    }
    self.pending.clear();
  }

  /// Tears down every connection, clears all maps, and stops accepting
  /// new dials or reconnects.
  pub async fn shutdown(&mut self) {
    self.stopped = true;
    for (addr, conn) in self.connections.drain() {
      self.global_connections.fetch_sub(1, Ordering::SeqCst);
      let _ = conn.cmd_tx.send(peer::Command::Shutdown);
      conn.join_handle.abort();
      let _ = self.events.send(ManagerEvent::PeerDisconnected {
        addr,
        reason: DisconnectReason::ManagerStopped,
      });
    }
    self.pending.clear();
    self.disconnected.clear();
  }
}

async fn perform_handshake(mut socket: TcpStream, info_hash: Sha1Hash, client_id: PeerId) -> Result<(TcpStream, PeerId, bool), PeerError> {
  let mut our_handshake = Handshake::new(info_hash, client_id);
  our_handshake.reserved[EXTENSION_PROTOCOL_BYTE] |= EXTENSION_PROTOCOL_BIT;

  let mut buf = bytes::BytesMut::with_capacity(68);
  HandshakeCodec.encode(our_handshake, &mut buf).map_err(PeerError::Io)?;
  socket.write_all(&buf).await?;

  let mut read_buf = bytes::BytesMut::with_capacity(68);
  loop {
    let mut chunk = [0u8; 68];
    let n = socket.read(&mut chunk).await?;
    if n == 0 {
      return Err(PeerError::Protocol("connection closed during handshake".into()));
    }
    read_buf.extend_from_slice(&chunk[..n]);
    if let Some(handshake) = HandshakeCodec.decode(&mut read_buf).map_err(PeerError::Io)? {
      if handshake.info_hash != info_hash {
        return Err(PeerError::InvalidInfoHash);
      }
      let extension_protocol = handshake.reserved[EXTENSION_PROTOCOL_BYTE] & EXTENSION_PROTOCOL_BIT != 0;
      return Ok((socket, handshake.peer_id, extension_protocol));
    }
    if read_buf.len() >= 68 {
      return Err(PeerError::Protocol("malformed handshake".into()));
    }
  }
}
