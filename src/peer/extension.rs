//! The BEP-10 extended handshake dictionary.
//!
//! Sub-message 0 of the extended envelope carries a bencoded dictionary
//! mapping extension names to the IDs the sender will accept them under,
//! plus a grab bag of optional session hints (`v`, `reqq`, `metadata_size`,
//! `p`, `yourip`, `e`).

use std::collections::BTreeMap;

use bytes::Bytes;

use super::error::PeerError;
use crate::bencode::{self, Value};

/// Sub-ID of the extended handshake within the extended envelope.
pub const HANDSHAKE_SUB_ID: u8 = 0;

/// Extension names we expose, with the IDs we assign them.
pub const UT_METADATA: &str = "ut_metadata";
pub const UT_PEX: &str = "ut_pex";
pub const UT_METADATA_ID: u8 = 1;
pub const UT_PEX_ID: u8 = 2;

/// The decoded extended handshake.
#[derive(Debug, Clone, Default)]
pub struct ExtendedHandshake {
    /// Extension name to the ID the peer wants it sent under. A zero ID
    /// disables the extension and is never stored here.
    pub extensions: BTreeMap<String, u8>,
    pub client_version: Option<String>,
    /// The peer's advertised request queue depth.
    pub reqq: Option<u32>,
    pub metadata_size: Option<u64>,
    /// The peer's listening port.
    pub port: Option<u16>,
    /// Our address as the peer sees it, in compact form.
    pub yourip: Option<Bytes>,
    /// Peer prefers encrypted connections.
    pub encryption: bool,
}

impl ExtendedHandshake {
    pub fn decode(payload: &[u8]) -> Result<Self, PeerError> {
        let value = bencode::decode(payload)?;
        let dict = value
            .as_dict()
            .ok_or_else(|| PeerError::protocol("extended handshake is not a dict"))?;

        let mut hs = Self::default();
        if let Some(m) = dict.get(b"m".as_slice()).and_then(|v| v.as_dict()) {
            for (name, id) in m {
                let (Ok(name), Some(id)) = (std::str::from_utf8(name), id.as_integer()) else {
                    continue;
                };
                if (1..=255).contains(&id) {
                    hs.extensions.insert(name.to_string(), id as u8);
                }
            }
        } else {
            return Err(PeerError::protocol("extended handshake missing m dict"));
        }

        hs.client_version = dict
            .get(b"v".as_slice())
            .and_then(|v| v.as_str())
            .map(String::from);
        hs.reqq = dict
            .get(b"reqq".as_slice())
            .and_then(|v| v.as_integer())
            .and_then(|n| u32::try_from(n).ok());
        hs.metadata_size = dict
            .get(b"metadata_size".as_slice())
            .and_then(|v| v.as_integer())
            .and_then(|n| u64::try_from(n).ok());
        hs.port = dict
            .get(b"p".as_slice())
            .and_then(|v| v.as_integer())
            .and_then(|n| u16::try_from(n).ok());
        hs.yourip = dict
            .get(b"yourip".as_slice())
            .and_then(|v| v.as_bytes())
            .cloned();
        hs.encryption = dict
            .get(b"e".as_slice())
            .and_then(|v| v.as_integer())
            .is_some_and(|e| e == 1);
        Ok(hs)
    }

    pub fn extension_id(&self, name: &str) -> Option<u8> {
        self.extensions.get(name).copied()
    }
}

/// Builds the handshake dictionary we send.
pub struct OurHandshake {
    pub client_version: String,
    pub reqq: u32,
    pub pex: bool,
    pub encryption: bool,
    pub metadata_size: Option<u64>,
    pub port: Option<u16>,
    pub yourip: Option<Bytes>,
}

impl OurHandshake {
    pub fn encode(&self) -> Result<Bytes, PeerError> {
        let mut m = BTreeMap::new();
        m.insert(
            Bytes::from_static(UT_METADATA.as_bytes()),
            Value::Integer(UT_METADATA_ID as i64),
        );
        if self.pex {
            m.insert(
                Bytes::from_static(UT_PEX.as_bytes()),
                Value::Integer(UT_PEX_ID as i64),
            );
        }

        let mut dict = BTreeMap::new();
        dict.insert(Bytes::from_static(b"m"), Value::Dict(m));
        dict.insert(Bytes::from_static(b"v"), Value::string(&self.client_version));
        dict.insert(Bytes::from_static(b"reqq"), Value::Integer(self.reqq as i64));
        if self.encryption {
            dict.insert(Bytes::from_static(b"e"), Value::Integer(1));
        }
        if let Some(size) = self.metadata_size {
            dict.insert(
                Bytes::from_static(b"metadata_size"),
                Value::Integer(size as i64),
            );
        }
        if let Some(port) = self.port {
            dict.insert(Bytes::from_static(b"p"), Value::Integer(port as i64));
        }
        if let Some(ref ip) = self.yourip {
            dict.insert(Bytes::from_static(b"yourip"), Value::Bytes(ip.clone()));
        }
        Ok(Bytes::from(bencode::encode(&Value::Dict(dict))?))
    }
}
