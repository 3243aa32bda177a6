//! Post-handshake wire framing: `<len:4><id:1?><payload>`, `len=0` being a
//! keep-alive (component F).

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::blockinfo::{BlockData, BlockInfo};
use crate::error::peer::PeerError;
use crate::Bitfield;

use super::message::{Message, MessageId};

/// An upper bound on a single message's payload length. Real torrent
/// messages never approach this; anything beyond it is either a corrupt
/// stream or a hostile peer and is rejected outright rather than causing an
/// unbounded allocation.
const MAX_PAYLOAD_LEN: u32 = 1 << 20; // 1 MiB, comfortably above a 16 KiB block message.

pub struct PeerCodec;

impl Encoder<Message> for PeerCodec {
  type Error = PeerError;

  fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<(), Self::Error> {
    match msg {
      Message::KeepAlive => {
        buf.put_u32(0);
      }
      Message::Choke => encode_empty(buf, MessageId::Choke),
      Message::Unchoke => encode_empty(buf, MessageId::Unchoke),
      Message::Interested => encode_empty(buf, MessageId::Interested),
      Message::NotInterested => encode_empty(buf, MessageId::NotInterested),
      Message::Have { piece_index } => {
        buf.put_u32(5);
        buf.put_u8(MessageId::Have as u8);
        buf.put_u32(piece_index as u32);
      }
      Message::Bitfield(bitfield) => {
        let bytes = bitfield.as_raw_slice();
        buf.put_u32(1 + bytes.len() as u32);
        buf.put_u8(MessageId::Bitfield as u8);
        buf.extend_from_slice(bytes);
      }
      Message::Request(block) => encode_block_info(buf, MessageId::Request, block),
      Message::Cancel(block) => encode_block_info(buf, MessageId::Cancel, block),
      Message::Block {
        piece_index,
        offset,
        data,
      } => {
        buf.put_u32(1 + 4 + 4 + data.len() as u32);
        buf.put_u8(MessageId::Block as u8);
        buf.put_u32(piece_index as u32);
        buf.put_u32(offset);
        buf.extend_from_slice(&data);
      }
      Message::Extended {
        extended_id,
        payload,
      } => {
        buf.put_u32(1 + 1 + payload.len() as u32);
        buf.put_u8(MessageId::Extended as u8);
        buf.put_u8(extended_id);
        buf.extend_from_slice(&payload);
      }
    }
    Ok(())
  }
}

fn encode_empty(buf: &mut BytesMut, id: MessageId) {
  buf.put_u32(1);
  buf.put_u8(id as u8);
}

fn encode_block_info(buf: &mut BytesMut, id: MessageId, block: BlockInfo) {
  buf.put_u32(1 + 4 + 4 + 4);
  buf.put_u8(id as u8);
  buf.put_u32(block.piece_index as u32);
  buf.put_u32(block.offset);
  buf.put_u32(block.len);
}

impl Decoder for PeerCodec {
  type Item = Message;
  type Error = PeerError;

  fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, Self::Error> {
    if buf.len() < 4 {
      return Ok(None);
    }

    let mut len_buf = [0u8; 4];
    len_buf.copy_from_slice(&buf[0..4]);
    let len = u32::from_be_bytes(len_buf);

    if len == 0 {
      buf.advance(4);
      return Ok(Some(Message::KeepAlive));
    }

    if len > MAX_PAYLOAD_LEN {
      return Err(PeerError::Protocol(format!(
        "message length {len} exceeds maximum {MAX_PAYLOAD_LEN}"
      )));
    }

    if buf.len() < 4 + len as usize {
      return Ok(None);
    }

    buf.advance(4);
    let id_byte = buf.get_u8();
    let id = MessageId::try_from(id_byte)
      .map_err(|id| PeerError::Protocol(format!("unknown message id {id}")))?;
    let payload_len = len as usize - 1;

    let msg = match id {
      MessageId::Choke => {
        require_empty(payload_len, "choke")?;
        Message::Choke
      }
      MessageId::Unchoke => {
        require_empty(payload_len, "unchoke")?;
        Message::Unchoke
      }
      MessageId::Interested => {
        require_empty(payload_len, "interested")?;
        Message::Interested
      }
      MessageId::NotInterested => {
        require_empty(payload_len, "not interested")?;
        Message::NotInterested
      }
      MessageId::Have => {
        if payload_len != 4 {
          return Err(PeerError::Protocol("have payload must be 4 bytes".into()));
        }
        let piece_index = buf.get_u32() as usize;
        Message::Have { piece_index }
      }
      MessageId::Bitfield => {
        let mut bytes = vec![0u8; payload_len];
        buf.copy_to_slice(&mut bytes);
        Message::Bitfield(Bitfield::from_vec(bytes))
      }
      MessageId::Request | MessageId::Cancel => {
        if payload_len != 12 {
          return Err(PeerError::Protocol(
            "request/cancel payload must be 12 bytes".into(),
          ));
        }
        let piece_index = buf.get_u32() as usize;
        let offset = buf.get_u32();
        let len = buf.get_u32();
        let block = BlockInfo {
          piece_index,
          offset,
          len,
        };
        if id == MessageId::Request {
          Message::Request(block)
        } else {
          Message::Cancel(block)
        }
      }
      MessageId::Block => {
        if payload_len < 8 {
          return Err(PeerError::Protocol("block payload too short".into()));
        }
        let piece_index = buf.get_u32() as usize;
        let offset = buf.get_u32();
        let mut data = vec![0u8; payload_len - 8];
        buf.copy_to_slice(&mut data);
        Message::Block {
          piece_index,
          offset,
          data: BlockData::Owned(data),
        }
      }
      MessageId::Extended => {
        if payload_len < 1 {
          return Err(PeerError::Protocol("extended payload too short".into()));
        }
        let extended_id = buf.get_u8();
        let mut payload = vec![0u8; payload_len - 1];
        buf.copy_to_slice(&mut payload);
        Message::Extended {
          extended_id,
          payload,
        }
      }
    };

    Ok(Some(msg))
  }
}

fn require_empty(payload_len: usize, name: &str) -> Result<(), PeerError> {
  if payload_len != 0 {
    return Err(PeerError::Protocol(format!(
      "{name} message must carry no payload"
    )));
  }
  Ok(())
}
