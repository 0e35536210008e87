//! The peer wire protocol: message framing (spec §4.3).

pub mod codec;
pub mod message;

pub use codec::PeerCodec;
pub use message::{Message, MessageId};
