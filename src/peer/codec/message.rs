use crate::{
    blockinfo::{BlockData, BlockInfo},
    Bitfield,
};

/// The actual message exchanged by peer, after the handshake.
#[derive(Debug, PartialEq)]
#[cfg_attr(test, derive(Clone))]
pub enum Message {
    /// `len=0`, no id or payload. Keeps the TCP connection alive.
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: usize,
    },
    Bitfield(Bitfield),
    Request(BlockInfo),
    Block {
        piece_index: usize,
        offset: u32,
        data: BlockData,
    },
    Cancel(BlockInfo),
    /// A BEP 10 extended message: a sub-id byte followed by a bencoded
    /// payload (or raw metadata piece bytes for `ut_metadata`).
    Extended {
        extended_id: u8,
        payload: Vec<u8>,
    },
}

/// The byte that identifies a message's kind on the wire, following its
/// 4-byte length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::Choke,
            1 => Self::Unchoke,
            2 => Self::Interested,
            3 => Self::NotInterested,
            4 => Self::Have,
            5 => Self::Bitfield,
            6 => Self::Request,
            7 => Self::Block,
            8 => Self::Cancel,
            20 => Self::Extended,
            other => return Err(other),
        })
    }
}
