//! `ut_metadata` messages ([BEP-9]): fetching the info dictionary from
//! peers, 16 KiB at a time.
//!
//! [BEP-9]: http://bittorrent.org/beps/bep_0009.html

use std::collections::BTreeMap;

use bytes::Bytes;

use super::error::PeerError;
use crate::bencode::{self, Value};

/// Metadata transfer piece size.
pub const METADATA_PIECE_SIZE: usize = 16384;

/// Upper bound on an announced metadata size. Anything larger is refused at
/// the extended handshake.
pub const MAX_METADATA_SIZE: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataMsgType {
    Request = 0,
    Data = 1,
    Reject = 2,
}

impl MetadataMsgType {
    fn from_i64(v: i64) -> Option<Self> {
        match v {
            0 => Some(Self::Request),
            1 => Some(Self::Data),
            2 => Some(Self::Reject),
            _ => None,
        }
    }
}

/// One `ut_metadata` message. Data messages carry the raw piece bytes after
/// the bencoded header.
#[derive(Debug, Clone)]
pub struct MetadataMessage {
    pub msg_type: MetadataMsgType,
    pub piece: u32,
    pub total_size: Option<u64>,
    pub data: Bytes,
}

impl MetadataMessage {
    pub fn request(piece: u32) -> Self {
        Self {
            msg_type: MetadataMsgType::Request,
            piece,
            total_size: None,
            data: Bytes::new(),
        }
    }

    pub fn data(piece: u32, total_size: u64, data: Bytes) -> Self {
        Self {
            msg_type: MetadataMsgType::Data,
            piece,
            total_size: Some(total_size),
            data,
        }
    }

    pub fn reject(piece: u32) -> Self {
        Self {
            msg_type: MetadataMsgType::Reject,
            piece,
            total_size: None,
            data: Bytes::new(),
        }
    }

    pub fn encode(&self) -> Result<Bytes, PeerError> {
        let mut dict = BTreeMap::new();
        dict.insert(
            Bytes::from_static(b"msg_type"),
            Value::Integer(self.msg_type as i64),
        );
        dict.insert(
            Bytes::from_static(b"piece"),
            Value::Integer(self.piece as i64),
        );
        if let Some(total) = self.total_size {
            dict.insert(
                Bytes::from_static(b"total_size"),
                Value::Integer(total as i64),
            );
        }
        let mut out = bencode::encode(&Value::Dict(dict))?;
        out.extend_from_slice(&self.data);
        Ok(Bytes::from(out))
    }

    /// Decodes the bencoded header and, for data messages, keeps whatever
    /// follows it as the piece payload.
    pub fn decode(payload: &[u8]) -> Result<Self, PeerError> {
        let (header, used) = bencode::decode_prefix(payload)?;
        let dict = header
            .as_dict()
            .ok_or_else(|| PeerError::protocol("ut_metadata header is not a dict"))?;

        let msg_type = dict
            .get(b"msg_type".as_slice())
            .and_then(|v| v.as_integer())
            .and_then(MetadataMsgType::from_i64)
            .ok_or_else(|| PeerError::protocol("ut_metadata bad msg_type"))?;
        let piece = dict
            .get(b"piece".as_slice())
            .and_then(|v| v.as_integer())
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| PeerError::protocol("ut_metadata bad piece"))?;
        let total_size = dict
            .get(b"total_size".as_slice())
            .and_then(|v| v.as_integer())
            .and_then(|n| u64::try_from(n).ok());

        let data = if msg_type == MetadataMsgType::Data {
            Bytes::copy_from_slice(&payload[used..])
        } else {
            Bytes::new()
        };

        Ok(Self {
            msg_type,
            piece,
            total_size,
            data,
        })
    }
}

/// Number of metadata pieces for a metadata blob of `total` bytes.
pub fn metadata_num_pieces(total: u64) -> usize {
    (total as usize).div_ceil(METADATA_PIECE_SIZE)
}

/// Size of metadata piece `piece` for a blob of `total` bytes.
pub fn metadata_piece_size(total: u64, piece: u32) -> usize {
    let offset = piece as usize * METADATA_PIECE_SIZE;
    (total as usize).saturating_sub(offset).min(METADATA_PIECE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let msg = MetadataMessage::request(5);
        let decoded = MetadataMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.msg_type, MetadataMsgType::Request);
        assert_eq!(decoded.piece, 5);
        assert!(decoded.data.is_empty());
    }

    #[test]
    fn data_round_trip_keeps_payload() {
        let payload = Bytes::from_static(b"info dict bytes");
        let msg = MetadataMessage::data(0, 15, payload.clone());
        let decoded = MetadataMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.msg_type, MetadataMsgType::Data);
        assert_eq!(decoded.total_size, Some(15));
        assert_eq!(decoded.data, payload);
    }

    #[test]
    fn reject_round_trip() {
        let msg = MetadataMessage::reject(2);
        let decoded = MetadataMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.msg_type, MetadataMsgType::Reject);
        assert_eq!(decoded.piece, 2);
    }

    #[test]
    fn bad_msg_type_is_a_violation() {
        let raw = b"d8:msg_typei9e5:piecei0ee";
        assert!(MetadataMessage::decode(raw).is_err());
    }

    #[test]
    fn piece_arithmetic() {
        assert_eq!(metadata_num_pieces(0), 0);
        assert_eq!(metadata_num_pieces(16384), 1);
        assert_eq!(metadata_num_pieces(16385), 2);
        assert_eq!(metadata_piece_size(20000, 0), 16384);
        assert_eq!(metadata_piece_size(20000, 1), 20000 - 16384);
        assert_eq!(metadata_piece_size(20000, 2), 0);
    }
}
