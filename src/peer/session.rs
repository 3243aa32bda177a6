//! A single established peer connection (component F/G): drives the wire
//! protocol codec, keeps per-peer choke/interest state, and turns incoming
//! messages into piece manager events.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::interval;
use tokio_util::codec::Framed;

use crate::blockinfo::BlockInfo;
use crate::conf::PieceConf;
use crate::counter::ThruputCounters;
use crate::disk;
use crate::error::peer::{PeerError, Result};
use crate::peer::codec::message::Message;
use crate::peer::codec::peercodec::PeerCodec;
use crate::peer::id::{self, ClientInfo};
use crate::peer::{Command, Receiver, SessionTick};
use crate::piece::manager::{PieceEvent, PieceManager};
use crate::torrent;
use crate::{Bitfield, PeerId, Sha1Hash, TorrentId};

/// A point-in-time snapshot of the choke/interest state and peer identity
/// of an established session, handed to the torrent with each tick.
#[derive(Debug, Clone)]
pub struct SessionState {
  pub addr: SocketAddr,
  pub am_choking: bool,
  pub am_interested: bool,
  pub peer_choking: bool,
  pub peer_interested: bool,
  /// Whether the remote set the BEP 10 extension-protocol reserved bit.
  pub extension_protocol: bool,
  pub client: Option<ClientInfo>,
}

impl SessionState {
  fn new(addr: SocketAddr, extension_protocol: bool, peer_id: &PeerId) -> Self {
    Self {
      addr,
      am_choking: true,
      am_interested: false,
      peer_choking: true,
      peer_interested: false,
      extension_protocol,
      client: id::decode(peer_id),
    }
  }
}

/// Context shared by every peer session of one torrent.
pub struct SessionContext {
  pub id: TorrentId,
  pub info_hash: Sha1Hash,
  pub client_id: PeerId,
  pub piece_conf: PieceConf,
  pub piece_manager: Arc<Mutex<PieceManager>>,
  pub disk_tx: disk::Sender,
  pub torrent_tx: torrent::Sender,
}

pub struct Session {
  ctx: Arc<SessionContext>,
  socket: Framed<TcpStream, PeerCodec>,
  state: SessionState,
  /// What the remote peer has, as reported via `bitfield`/`have` messages.
  /// Kept here rather than in the piece manager's availability tracker
  /// because `next_requests` wants a borrow of exactly this peer's view.
  peer_bitfield: Bitfield,
  counters: ThruputCounters,
  cmd_rx: Receiver,
  self_tx: crate::peer::Sender,
}

impl Session {
  pub fn new(
    ctx: Arc<SessionContext>,
    socket: TcpStream,
    addr: SocketAddr,
    remote_peer_id: PeerId,
    extension_protocol: bool,
    piece_count: usize,
    cmd_rx: Receiver,
    self_tx: crate::peer::Sender,
  ) -> Self {
    Self {
      state: SessionState::new(addr, extension_protocol, &remote_peer_id),
      socket: Framed::new(socket, PeerCodec),
      peer_bitfield: Bitfield::repeat(false, piece_count),
      counters: ThruputCounters::new(&crate::conf::PeerConf::default()),
      cmd_rx,
      self_tx,
      ctx,
    }
  }

  /// Runs the session until the connection ends or it is told to shut
  /// down. Errors are session-local: the caller is expected to tear down
  /// this session and decide on reconnection, not propagate the error
  /// further.
  pub async fn run(mut self) -> Result<()> {
    {
      let own_bitfield = self.ctx.piece_manager.lock().await.own_bitfield().clone();
      self.socket.send(Message::Bitfield(own_bitfield)).await?;
    }

    let mut keep_alive = interval(Duration::from_secs(90));
    let mut tick = interval(Duration::from_secs(1));

    loop {
      tokio::select! {
        msg = self.socket.next() => {
          match msg {
            Some(Ok(msg)) => self.handle_message(msg).await?,
            Some(Err(e)) => return Err(e),
            None => return Ok(()),
          }
        }
        cmd = self.cmd_rx.recv() => {
          match cmd {
            Some(cmd) => if !self.handle_command(cmd).await? { return Ok(()) },
            None => return Ok(()),
          }
        }
        _ = keep_alive.tick() => {
          self.socket.send(Message::KeepAlive).await?;
        }
        _ = tick.tick() => {
          self.report_tick().await?;
        }
      }
    }
  }

  async fn handle_message(&mut self, msg: Message) -> Result<()> {
    match msg {
      Message::KeepAlive => {}
      Message::Choke => self.state.peer_choking = true,
      Message::Unchoke => {
        self.state.peer_choking = false;
        self.fill_pipeline().await?;
      }
      Message::Interested => self.state.peer_interested = true,
      Message::NotInterested => self.state.peer_interested = false,
      Message::Have { piece_index } => {
        if let Some(mut bit) = self.peer_bitfield.get_mut(piece_index) {
          *bit = true;
        }
        self.ctx.piece_manager.lock().await.peer_have(self.state.addr, piece_index);
        self.fill_pipeline().await?;
      }
      Message::Bitfield(bitfield) => {
        self.peer_bitfield = bitfield.clone();
        self.ctx.piece_manager.lock().await.register_peer(self.state.addr, bitfield);
        self.fill_pipeline().await?;
      }
      Message::Request(block_info) => {
        if self.state.am_choking {
          return Err(PeerError::RequestWhileChoked);
        }
        self
          .ctx
          .disk_tx
          .send(disk::Command::ReadBlock {
            id: self.ctx.id,
            block_info,
            result_tx: self.self_tx.clone(),
          })
          .map_err(|_| PeerError::Channel)?;
      }
      Message::Block { piece_index, offset, data } => {
        let block_info = BlockInfo {
          piece_index,
          offset,
          len: data.len() as u32,
        };
        let events = self
          .ctx
          .piece_manager
          .lock()
          .await
          .handle_block(self.state.addr, block_info, &data);
        self.forward_piece_events(events);
        self.fill_pipeline().await?;
      }
      Message::Cancel(_) => {
        // We don't keep a disk-read queue deep enough for a cancel to
        // usefully preempt; the block is simply sent once ready.
      }
      Message::Extended { extended_id, payload } => {
        log::trace!("extended message {extended_id} from {}, {} bytes", self.state.addr, payload.len());
      }
    }
    Ok(())
  }

  async fn handle_command(&mut self, cmd: Command) -> Result<bool> {
    match cmd {
      Command::BlockReady { block_info, data } => {
        self
          .socket
          .send(Message::Block {
            piece_index: block_info.piece_index,
            offset: block_info.offset,
            data,
          })
          .await?;
        self.counters.payload_uploaded.add(block_info.len);
      }
      Command::ReadError { block_info, error } => {
        log::warn!("disk read error for {block_info}: {error}");
      }
      Command::PieceCompleted { index } => {
        self.socket.send(Message::Have { piece_index: index }).await?;
      }
      Command::Shutdown => return Ok(false),
    }
    Ok(true)
  }

  async fn fill_pipeline(&mut self) -> Result<()> {
    if self.state.peer_choking {
      return Ok(());
    }
    let (requests, endgame_event) = {
      let mut manager = self.ctx.piece_manager.lock().await;
      manager.next_requests(self.state.addr, &self.peer_bitfield, self.ctx.piece_conf.pipeline_len)
    };
    if let Some(event) = endgame_event {
      let _ = self.ctx.torrent_tx.send(torrent::Command::PieceOutcome(event));
    }
    self.state.am_interested = !requests.is_empty();
    for block_info in requests {
      self.socket.send(Message::Request(block_info)).await?;
    }
    Ok(())
  }

  fn forward_piece_events(&self, events: Vec<PieceEvent>) {
    for event in events {
      match event {
        PieceEvent::PieceComplete { index, bytes } => {
          let _ = self.ctx.disk_tx.send(disk::Command::WritePiece {
            id: self.ctx.id,
            index,
            bytes,
          });
        }
        PieceEvent::PieceFailed { .. } | PieceEvent::PieceGaveUp { .. } | PieceEvent::EndgameStarted { .. } => {
          let _ = self.ctx.torrent_tx.send(torrent::Command::PieceOutcome(event));
        }
        PieceEvent::DownloadComplete => {
          // The torrent session learns this independently, by checking
          // `is_download_complete` once its completed-piece write lands.
        }
      }
    }
  }

  async fn report_tick(&mut self) -> Result<()> {
    self.counters.tick();
    let piece_count = self.peer_bitfield.count_ones();
    let tick = SessionTick {
      state: self.state.clone(),
      counters: self.counters.clone(),
      piece_count,
    };
    let _ = self.ctx.torrent_tx.send(torrent::Command::PeerState { addr: self.state.addr, info: tick });
    Ok(())
  }
}
