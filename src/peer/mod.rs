//! Peer wire protocol: handshake, framing, message codec, and the
//! extension-layer codecs carried inside it.

pub mod bitfield;
pub mod error;
pub mod extension;
pub mod message;
pub mod metadata;
pub mod peer_id;
pub mod transport;

pub use bitfield::Bitfield;
pub use error::PeerError;
pub use extension::{ExtendedHandshake, OurHandshake};
pub use message::{Handshake, Message, Reserved};
pub use metadata::{MetadataMessage, MetadataMsgType};
pub use peer_id::PeerId;
pub use transport::{BoxStream, MessageReader, PeerStream, RateLimiter};
