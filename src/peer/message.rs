//! The peer wire protocol codec ([BEP-3], [BEP-6], [BEP-10]).
//!
//! A session starts with a fixed 68-byte [`Handshake`]; every subsequent
//! frame is `<u32 length><u8 id><payload>`, with a zero length meaning
//! keep-alive. [`Message`] covers the core message set, the fast-extension
//! additions, and the extended-message envelope.
//!
//! [BEP-3]: http://bittorrent.org/beps/bep_0003.html
//! [BEP-6]: http://bittorrent.org/beps/bep_0006.html
//! [BEP-10]: http://bittorrent.org/beps/bep_0010.html

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::PeerError;

/// The 20-byte handshake prefix: length byte plus protocol name.
pub const PROTOCOL_HEADER: &[u8; 20] = b"\x13BitTorrent protocol";
/// Total handshake length on the wire.
pub const HANDSHAKE_LEN: usize = 68;
/// Extended-message envelope ID.
pub const EXTENDED_ID: u8 = 20;

/// The reserved bytes of the handshake, carrying capability bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reserved(pub [u8; 8]);

impl Reserved {
    /// Our default advertisement: extension protocol and fast extension,
    /// with DHT flagged only when a DHT is running.
    pub fn ours(dht: bool) -> Self {
        let mut bits = [0u8; 8];
        bits[5] |= 0x10; // BEP-10 extension protocol
        bits[7] |= 0x04; // BEP-6 fast extension
        if dht {
            bits[7] |= 0x01; // BEP-5 DHT port messages
        }
        Self(bits)
    }

    pub fn supports_extended(&self) -> bool {
        self.0[5] & 0x10 != 0
    }

    pub fn supports_fast(&self) -> bool {
        self.0[7] & 0x04 != 0
    }

    pub fn supports_dht(&self) -> bool {
        self.0[7] & 0x01 != 0
    }
}

/// The fixed-size BitTorrent handshake.
#[derive(Debug, Clone)]
pub struct Handshake {
    pub reserved: Reserved,
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HANDSHAKE_LEN);
        buf.put_slice(PROTOCOL_HEADER);
        buf.put_slice(&self.reserved.0);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.freeze()
    }

    /// Decodes the 48 bytes that follow the protocol header.
    pub fn decode_tail(reserved_onward: &[u8]) -> Result<(Reserved, [u8; 20], [u8; 20]), PeerError> {
        if reserved_onward.len() < 48 {
            return Err(PeerError::InvalidHandshake);
        }
        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&reserved_onward[..8]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&reserved_onward[8..28]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&reserved_onward[28..48]);
        Ok((Reserved(reserved), info_hash, peer_id))
    }
}

/// One frame of the peer wire protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Bytes),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, data: Bytes },
    Cancel { index: u32, begin: u32, length: u32 },
    Port(u16),
    // Fast extension (BEP-6).
    HaveAll,
    HaveNone,
    Reject { index: u32, begin: u32, length: u32 },
    // Extension protocol (BEP-10).
    Extended { id: u8, payload: Bytes },
}

impl Message {
    /// Encodes the message including its length prefix.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Message::KeepAlive => buf.put_u32(0),
            Message::Choke => Self::put_bare(&mut buf, 0),
            Message::Unchoke => Self::put_bare(&mut buf, 1),
            Message::Interested => Self::put_bare(&mut buf, 2),
            Message::NotInterested => Self::put_bare(&mut buf, 3),
            Message::Have(piece) => {
                buf.put_u32(5);
                buf.put_u8(4);
                buf.put_u32(*piece);
            }
            Message::Bitfield(bits) => {
                buf.put_u32(1 + bits.len() as u32);
                buf.put_u8(5);
                buf.put_slice(bits);
            }
            Message::Request {
                index,
                begin,
                length,
            } => Self::put_triple(&mut buf, 6, *index, *begin, *length),
            Message::Piece { index, begin, data } => {
                buf.put_u32(9 + data.len() as u32);
                buf.put_u8(7);
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(data);
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => Self::put_triple(&mut buf, 8, *index, *begin, *length),
            Message::Port(port) => {
                buf.put_u32(3);
                buf.put_u8(9);
                buf.put_u16(*port);
            }
            Message::HaveAll => Self::put_bare(&mut buf, 14),
            Message::HaveNone => Self::put_bare(&mut buf, 15),
            Message::Reject {
                index,
                begin,
                length,
            } => Self::put_triple(&mut buf, 16, *index, *begin, *length),
            Message::Extended { id, payload } => {
                buf.put_u32(2 + payload.len() as u32);
                buf.put_u8(EXTENDED_ID);
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
        }
        buf.freeze()
    }

    fn put_bare(buf: &mut BytesMut, id: u8) {
        buf.put_u32(1);
        buf.put_u8(id);
    }

    fn put_triple(buf: &mut BytesMut, id: u8, index: u32, begin: u32, length: u32) {
        buf.put_u32(13);
        buf.put_u8(id);
        buf.put_u32(index);
        buf.put_u32(begin);
        buf.put_u32(length);
    }

    /// Decodes a frame body (everything after the length prefix). An empty
    /// body is a keep-alive.
    pub fn decode_body(mut body: Bytes) -> Result<Self, PeerError> {
        if body.is_empty() {
            return Ok(Message::KeepAlive);
        }
        let id = body.get_u8();
        let msg = match id {
            0 => Message::Choke,
            1 => Message::Unchoke,
            2 => Message::Interested,
            3 => Message::NotInterested,
            4 => Message::Have(Self::take_u32(&mut body, "have")?),
            5 => Message::Bitfield(body.split_to(body.len())),
            6 => {
                let (index, begin, length) = Self::take_triple(&mut body, "request")?;
                Message::Request {
                    index,
                    begin,
                    length,
                }
            }
            7 => {
                if body.remaining() < 8 {
                    return Err(PeerError::InvalidMessage("piece header truncated"));
                }
                let index = body.get_u32();
                let begin = body.get_u32();
                Message::Piece {
                    index,
                    begin,
                    data: body.split_to(body.len()),
                }
            }
            8 => {
                let (index, begin, length) = Self::take_triple(&mut body, "cancel")?;
                Message::Cancel {
                    index,
                    begin,
                    length,
                }
            }
            9 => {
                if body.remaining() < 2 {
                    return Err(PeerError::InvalidMessage("port truncated"));
                }
                Message::Port(body.get_u16())
            }
            14 => Message::HaveAll,
            15 => Message::HaveNone,
            16 => {
                let (index, begin, length) = Self::take_triple(&mut body, "reject")?;
                Message::Reject {
                    index,
                    begin,
                    length,
                }
            }
            EXTENDED_ID => {
                if body.is_empty() {
                    return Err(PeerError::InvalidMessage("extended truncated"));
                }
                let ext = body.get_u8();
                Message::Extended {
                    id: ext,
                    payload: body.split_to(body.len()),
                }
            }
            other => return Err(PeerError::UnknownMessageId(other)),
        };
        Ok(msg)
    }

    fn take_u32(body: &mut Bytes, what: &'static str) -> Result<u32, PeerError> {
        if body.remaining() < 4 {
            return Err(PeerError::InvalidMessage(what));
        }
        Ok(body.get_u32())
    }

    fn take_triple(body: &mut Bytes, what: &'static str) -> Result<(u32, u32, u32), PeerError> {
        if body.remaining() < 12 {
            return Err(PeerError::InvalidMessage(what));
        }
        Ok((body.get_u32(), body.get_u32(), body.get_u32()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: Message) -> Message {
        let encoded = msg.encode();
        let body = Bytes::copy_from_slice(&encoded[4..]);
        Message::decode_body(body).unwrap()
    }

    #[test]
    fn control_messages_round_trip() {
        for msg in [
            Message::KeepAlive,
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have(42),
            Message::Port(6881),
            Message::HaveAll,
            Message::HaveNone,
        ] {
            assert_eq!(round_trip(msg.clone()), msg);
        }
    }

    #[test]
    fn request_family_round_trips() {
        for msg in [
            Message::Request {
                index: 3,
                begin: 16384,
                length: 16384,
            },
            Message::Cancel {
                index: 3,
                begin: 16384,
                length: 16384,
            },
            Message::Reject {
                index: 1,
                begin: 0,
                length: 16384,
            },
        ] {
            assert_eq!(round_trip(msg.clone()), msg);
        }
    }

    #[test]
    fn piece_carries_payload() {
        let msg = Message::Piece {
            index: 1,
            begin: 32768,
            data: Bytes::from_static(b"block data"),
        };
        let encoded = msg.encode();
        assert_eq!(
            u32::from_be_bytes(encoded[..4].try_into().unwrap()),
            9 + 10
        );
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn extended_envelope() {
        let msg = Message::Extended {
            id: 3,
            payload: Bytes::from_static(b"d1:ai1ee"),
        };
        assert_eq!(round_trip(msg.clone()), msg);
    }

    #[test]
    fn unknown_id_is_an_error() {
        let body = Bytes::from_static(&[11]);
        assert!(matches!(
            Message::decode_body(body),
            Err(PeerError::UnknownMessageId(11))
        ));
    }

    #[test]
    fn handshake_encodes_68_bytes() {
        let hs = Handshake {
            reserved: Reserved::ours(true),
            info_hash: [7; 20],
            peer_id: [9; 20],
        };
        let bytes = hs.encode();
        assert_eq!(bytes.len(), HANDSHAKE_LEN);
        assert_eq!(&bytes[..20], PROTOCOL_HEADER);

        let (reserved, ih, pid) = Handshake::decode_tail(&bytes[20..]).unwrap();
        assert!(reserved.supports_extended());
        assert!(reserved.supports_fast());
        assert!(reserved.supports_dht());
        assert_eq!(ih, [7; 20]);
        assert_eq!(pid, [9; 20]);
    }
}
