//! The BitTorrent peer wire message set (spec §4.3).

use crate::{Bitfield, PieceIndex};

/// Message ids as they appear on the wire, right after the 4-byte length
/// prefix.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Port = 9,
    Extended = 20,
}

impl MessageId {
    pub fn from_u8(id: u8) -> Option<Self> {
        Some(match id {
            0 => Self::Choke,
            1 => Self::Unchoke,
            2 => Self::Interested,
            3 => Self::NotInterested,
            4 => Self::Have,
            5 => Self::Bitfield,
            6 => Self::Request,
            7 => Self::Piece,
            8 => Self::Cancel,
            9 => Self::Port,
            20 => Self::Extended,
            _ => return None,
        })
    }
}

/// A single peer wire protocol message, after length-prefix framing has
/// been stripped (spec §4.3).
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    /// Zero-length keep-alive: no id, no payload.
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(PieceIndex),
    Bitfield(Bitfield),
    Request {
        piece_index: PieceIndex,
        begin: u32,
        length: u32,
    },
    Piece {
        piece_index: PieceIndex,
        begin: u32,
        block: Vec<u8>,
    },
    Cancel {
        piece_index: PieceIndex,
        begin: u32,
        length: u32,
    },
    Port(u16),
    /// BEP 10 extended message: an opaque subtype id plus its payload.
    Extended { id: u8, payload: Vec<u8> },
}

impl Message {
    pub fn id(&self) -> Option<MessageId> {
        match self {
            Self::KeepAlive => None,
            Self::Choke => Some(MessageId::Choke),
            Self::Unchoke => Some(MessageId::Unchoke),
            Self::Interested => Some(MessageId::Interested),
            Self::NotInterested => Some(MessageId::NotInterested),
            Self::Have(_) => Some(MessageId::Have),
            Self::Bitfield(_) => Some(MessageId::Bitfield),
            Self::Request { .. } => Some(MessageId::Request),
            Self::Piece { .. } => Some(MessageId::Piece),
            Self::Cancel { .. } => Some(MessageId::Cancel),
            Self::Port(_) => Some(MessageId::Port),
            Self::Extended { .. } => Some(MessageId::Extended),
        }
    }
}
