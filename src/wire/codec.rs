//! Length-prefixed framing for peer wire messages (spec §4.3).
//!
//! Grounded in the `tokio_util::codec::{Decoder, Encoder}` framing pattern
//! (see the reference message framer in the example pack); adapted to this
//! crate's full [`Message`] set and its own size limit and error type.

use bitvec::prelude::{BitVec, Msb0};
use bytes::{Buf, BufMut, BytesMut};
use std::convert::TryInto;
use std::fmt;
use tokio_util::codec::{Decoder, Encoder};

use super::message::{Message, MessageId};

/// Largest length-prefix value the codec accepts: a `Piece` message's
/// worst case (id + piece index + begin + a 16 KiB block) plus headroom
/// (spec §4.3: "reject any length > 17 KiB + overhead").
pub const MAX_MESSAGE_LEN: usize = 17 * 1024 + 13;

/// Codec errors (spec §7, category 2: protocol errors).
#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    MessageTooLarge(usize),
    UnknownMessageId(u8),
    Truncated { id: MessageId, len: usize },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "i/o error: {}", e),
            Self::MessageTooLarge(len) => {
                write!(f, "message length {} exceeds the {} byte limit", len, MAX_MESSAGE_LEN)
            }
            Self::UnknownMessageId(id) => write!(f, "unknown message id {}", id),
            Self::Truncated { id, len } => {
                write!(f, "message {:?} payload too short ({} bytes)", id, len)
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Frames the post-handshake peer wire stream.
///
/// The codec never interprets payload semantics beyond what's needed to
/// split fields out of fixed-layout messages; it only frames (spec §4.3).
#[derive(Default)]
pub struct PeerCodec;

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&src[..4]);
        let len = u32::from_be_bytes(len_bytes) as usize;

        if len == 0 {
            src.advance(4);
            return Ok(Some(Message::KeepAlive));
        }

        if len > MAX_MESSAGE_LEN {
            return Err(Error::MessageTooLarge(len));
        }

        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }

        let id_byte = src[4];
        let id = MessageId::from_u8(id_byte).ok_or(Error::UnknownMessageId(id_byte))?;
        let payload = &src[5..4 + len];
        let message = parse_payload(id, payload)?;
        src.advance(4 + len);
        Ok(Some(message))
    }
}

fn parse_payload(id: MessageId, payload: &[u8]) -> Result<Message, Error> {
    let need = |n: usize| -> Result<(), Error> {
        if payload.len() < n {
            Err(Error::Truncated { id, len: payload.len() })
        } else {
            Ok(())
        }
    };
    Ok(match id {
        MessageId::Choke => Message::Choke,
        MessageId::Unchoke => Message::Unchoke,
        MessageId::Interested => Message::Interested,
        MessageId::NotInterested => Message::NotInterested,
        MessageId::Have => {
            need(4)?;
            Message::Have(u32::from_be_bytes(payload[..4].try_into().unwrap()) as usize)
        }
        MessageId::Bitfield => {
            let bits = BitVec::<Msb0, u8>::from_vec(payload.to_vec());
            Message::Bitfield(bits)
        }
        MessageId::Request => {
            need(12)?;
            Message::Request {
                piece_index: be_u32(payload, 0) as usize,
                begin: be_u32(payload, 4),
                length: be_u32(payload, 8),
            }
        }
        MessageId::Piece => {
            need(8)?;
            Message::Piece {
                piece_index: be_u32(payload, 0) as usize,
                begin: be_u32(payload, 4),
                block: payload[8..].to_vec(),
            }
        }
        MessageId::Cancel => {
            need(12)?;
            Message::Cancel {
                piece_index: be_u32(payload, 0) as usize,
                begin: be_u32(payload, 4),
                length: be_u32(payload, 8),
            }
        }
        MessageId::Port => {
            need(2)?;
            Message::Port(u16::from_be_bytes(payload[..2].try_into().unwrap()))
        }
        MessageId::Extended => {
            need(1)?;
            Message::Extended {
                id: payload[0],
                payload: payload[1..].to_vec(),
            }
        }
    })
}

fn be_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes(buf[offset..offset + 4].try_into().unwrap())
}

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Message::KeepAlive => {
                dst.reserve(4);
                dst.put_u32(0);
            }
            Message::Choke => write_fixed(dst, MessageId::Choke, 0, |_| {}),
            Message::Unchoke => write_fixed(dst, MessageId::Unchoke, 0, |_| {}),
            Message::Interested => write_fixed(dst, MessageId::Interested, 0, |_| {}),
            Message::NotInterested => write_fixed(dst, MessageId::NotInterested, 0, |_| {}),
            Message::Have(index) => {
                write_fixed(dst, MessageId::Have, 4, |dst| dst.put_u32(index as u32))
            }
            Message::Bitfield(bits) => {
                let bytes = bits.into_vec();
                let len = 1 + bytes.len();
                if len > MAX_MESSAGE_LEN {
                    return Err(Error::MessageTooLarge(len));
                }
                dst.reserve(4 + len);
                dst.put_u32(len as u32);
                dst.put_u8(MessageId::Bitfield as u8);
                dst.extend_from_slice(&bytes);
            }
            Message::Request { piece_index, begin, length } => {
                write_fixed(dst, MessageId::Request, 12, |dst| {
                    dst.put_u32(piece_index as u32);
                    dst.put_u32(begin);
                    dst.put_u32(length);
                })
            }
            Message::Piece { piece_index, begin, block } => {
                let len = 1 + 8 + block.len();
                if len > MAX_MESSAGE_LEN {
                    return Err(Error::MessageTooLarge(len));
                }
                dst.reserve(4 + len);
                dst.put_u32(len as u32);
                dst.put_u8(MessageId::Piece as u8);
                dst.put_u32(piece_index as u32);
                dst.put_u32(begin);
                dst.extend_from_slice(&block);
            }
            Message::Cancel { piece_index, begin, length } => {
                write_fixed(dst, MessageId::Cancel, 12, |dst| {
                    dst.put_u32(piece_index as u32);
                    dst.put_u32(begin);
                    dst.put_u32(length);
                })
            }
            Message::Port(port) => {
                write_fixed(dst, MessageId::Port, 2, |dst| dst.put_u16(port))
            }
            Message::Extended { id, payload } => {
                let len = 1 + 1 + payload.len();
                if len > MAX_MESSAGE_LEN {
                    return Err(Error::MessageTooLarge(len));
                }
                dst.reserve(4 + len);
                dst.put_u32(len as u32);
                dst.put_u8(MessageId::Extended as u8);
                dst.put_u8(id);
                dst.extend_from_slice(&payload);
            }
        }
        Ok(())
    }
}

fn write_fixed(
    dst: &mut BytesMut,
    id: MessageId,
    payload_len: usize,
    write_payload: impl FnOnce(&mut BytesMut),
) {
    let len = 1 + payload_len;
    dst.reserve(4 + len);
    dst.put_u32(len as u32);
    dst.put_u8(id as u8);
    write_payload(dst);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) -> Message {
        let mut codec = PeerCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(msg, &mut buf).unwrap();
        codec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn test_keep_alive_roundtrip() {
        assert_eq!(roundtrip(Message::KeepAlive), Message::KeepAlive);
    }

    #[test]
    fn test_choke_roundtrip() {
        assert_eq!(roundtrip(Message::Choke), Message::Choke);
    }

    #[test]
    fn test_have_roundtrip() {
        assert_eq!(roundtrip(Message::Have(7)), Message::Have(7));
    }

    #[test]
    fn test_request_roundtrip() {
        let msg = Message::Request {
            piece_index: 3,
            begin: 16384,
            length: 16384,
        };
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_piece_roundtrip() {
        let msg = Message::Piece {
            piece_index: 2,
            begin: 0,
            block: vec![1, 2, 3, 4, 5],
        };
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_bitfield_roundtrip() {
        let bits = BitVec::<Msb0, u8>::from_vec(vec![0b1100_0001]);
        let msg = Message::Bitfield(bits);
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn test_oversized_message_rejected() {
        let mut codec = PeerCodec::default();
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_MESSAGE_LEN + 1) as u32);
        buf.extend_from_slice(&[0u8; 5]);
        assert!(matches!(codec.decode(&mut buf), Err(Error::MessageTooLarge(_))));
    }

    #[test]
    fn test_partial_frame_returns_none() {
        let mut codec = PeerCodec::default();
        let mut buf = BytesMut::new();
        buf.put_u32(6);
        buf.put_u8(MessageId::Have as u8);
        // only 2 of the 4 needed payload bytes present
        buf.extend_from_slice(&[0, 0]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_unknown_message_id_errors() {
        let mut codec = PeerCodec::default();
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(250);
        assert!(matches!(codec.decode(&mut buf), Err(Error::UnknownMessageId(250))));
    }
}
