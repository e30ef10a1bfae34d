//! Peer Exchange messages ([BEP-11]).
//!
//! `ut_pex` messages gossip peer addresses in-band: `added` carries compact
//! IPv4 endpoints, `added.f` one flag byte per added peer, and `dropped`
//! endpoints that went away.
//!
//! [BEP-11]: http://bittorrent.org/beps/bep_0011.html

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{BufMut, Bytes, BytesMut};

use crate::bencode::{self, Value};
use crate::peer::PeerError;

/// Flag bits from `added.f`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PexFlags {
    /// Peer prefers protocol encryption.
    pub encryption: bool,
    /// Peer is a seed.
    pub seed: bool,
}

impl PexFlags {
    pub fn from_byte(b: u8) -> Self {
        Self {
            encryption: b & 0x01 != 0,
            seed: b & 0x02 != 0,
        }
    }

    pub fn to_byte(self) -> u8 {
        u8::from(self.encryption) | (u8::from(self.seed) << 1)
    }
}

/// A decoded `ut_pex` message.
#[derive(Debug, Clone, Default)]
pub struct PexMessage {
    pub added: Vec<(SocketAddrV4, PexFlags)>,
    pub dropped: Vec<SocketAddrV4>,
}

impl PexMessage {
    pub fn decode(payload: &[u8]) -> Result<Self, PeerError> {
        let value = bencode::decode(payload)?;
        let dict = value
            .as_dict()
            .ok_or_else(|| PeerError::protocol("pex message is not a dict"))?;

        let added_raw = dict
            .get(b"added".as_slice())
            .and_then(|v| v.as_bytes())
            .map(|b| b.as_ref())
            .unwrap_or_default();
        let flags_raw = dict
            .get(b"added.f".as_slice())
            .and_then(|v| v.as_bytes())
            .map(|b| b.as_ref())
            .unwrap_or_default();
        let dropped_raw = dict
            .get(b"dropped".as_slice())
            .and_then(|v| v.as_bytes())
            .map(|b| b.as_ref())
            .unwrap_or_default();

        let added = decode_compact(added_raw)
            .into_iter()
            .enumerate()
            .map(|(i, addr)| {
                let flags = flags_raw
                    .get(i)
                    .map(|&b| PexFlags::from_byte(b))
                    .unwrap_or_default();
                (addr, flags)
            })
            .collect();

        Ok(Self {
            added,
            dropped: decode_compact(dropped_raw),
        })
    }

    pub fn encode(&self) -> Result<Bytes, PeerError> {
        let mut added = BytesMut::with_capacity(self.added.len() * 6);
        let mut flags = BytesMut::with_capacity(self.added.len());
        for (addr, f) in &self.added {
            put_compact(&mut added, *addr);
            flags.put_u8(f.to_byte());
        }
        let mut dropped = BytesMut::with_capacity(self.dropped.len() * 6);
        for addr in &self.dropped {
            put_compact(&mut dropped, *addr);
        }

        let mut dict = BTreeMap::new();
        dict.insert(Bytes::from_static(b"added"), Value::Bytes(added.freeze()));
        dict.insert(Bytes::from_static(b"added.f"), Value::Bytes(flags.freeze()));
        dict.insert(
            Bytes::from_static(b"dropped"),
            Value::Bytes(dropped.freeze()),
        );
        Ok(Bytes::from(bencode::encode(&Value::Dict(dict))?))
    }
}

fn put_compact(buf: &mut BytesMut, addr: SocketAddrV4) {
    buf.put_slice(&addr.ip().octets());
    buf.put_u16(addr.port());
}

fn decode_compact(data: &[u8]) -> Vec<SocketAddrV4> {
    data.chunks_exact(6)
        .map(|c| {
            let ip = Ipv4Addr::new(c[0], c[1], c[2], c[3]);
            let port = u16::from_be_bytes([c[4], c[5]]);
            SocketAddrV4::new(ip, port)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_round_trip() {
        let f = PexFlags {
            encryption: true,
            seed: false,
        };
        assert_eq!(PexFlags::from_byte(f.to_byte()), f);
        assert!(PexFlags::from_byte(0x03).seed);
    }

    #[test]
    fn message_round_trip() {
        let msg = PexMessage {
            added: vec![
                (
                    SocketAddrV4::new(Ipv4Addr::new(10, 1, 2, 3), 6881),
                    PexFlags {
                        encryption: true,
                        seed: false,
                    },
                ),
                (
                    SocketAddrV4::new(Ipv4Addr::new(192, 168, 0, 9), 51413),
                    PexFlags::default(),
                ),
            ],
            dropped: vec![SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 1)],
        };
        let decoded = PexMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.added, msg.added);
        assert_eq!(decoded.dropped, msg.dropped);
    }

    #[test]
    fn missing_flags_default_to_zero() {
        // A message with two peers but no added.f bytes.
        let mut dict = BTreeMap::new();
        let mut added = BytesMut::new();
        put_compact(&mut added, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1000));
        put_compact(&mut added, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1001));
        dict.insert(Bytes::from_static(b"added"), Value::Bytes(added.freeze()));
        let raw = bencode::encode(&Value::Dict(dict)).unwrap();

        let msg = PexMessage::decode(&raw).unwrap();
        assert_eq!(msg.added.len(), 2);
        assert_eq!(msg.added[0].1, PexFlags::default());
    }

    #[test]
    fn truncated_compact_entries_are_ignored() {
        let mut dict = BTreeMap::new();
        dict.insert(
            Bytes::from_static(b"added"),
            Value::Bytes(Bytes::from_static(&[1, 2, 3, 4, 5])),
        );
        let raw = bencode::encode(&Value::Dict(dict)).unwrap();
        assert!(PexMessage::decode(&raw).unwrap().added.is_empty());
    }

    #[test]
    fn non_dict_is_a_violation() {
        assert!(PexMessage::decode(b"i1e").is_err());
    }
}
