//! Torrent metainfo: `.torrent` files, info dictionaries, and magnet links.
//!
//! The SHA-1 of the bencoded info dictionary is the [`InfoHash`] that
//! identifies a swarm. [`Metainfo::from_bytes`] keeps the raw info bytes
//! around so the hash survives a decode/re-encode round trip, and
//! [`Info::to_bytes`] produces canonical bytes for torrents we build
//! ourselves.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::bencode::{self, Value};

#[derive(Debug, Error)]
pub enum MetainfoError {
    #[error("bencode error: {0}")]
    Bencode(#[from] bencode::BencodeError),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid field: {0}")]
    InvalidField(&'static str),

    #[error("info hash must be 40 hex characters")]
    InvalidInfoHash,

    #[error("not a magnet URI")]
    NotMagnet,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// A 20-byte swarm identifier: SHA-1 of the bencoded info dictionary.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    /// Hashes raw bencoded info-dictionary bytes.
    pub fn from_info_bytes(info: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(info);
        Self(hasher.finalize().into())
    }

    pub fn from_hex(s: &str) -> Result<Self, MetainfoError> {
        if s.len() != 40 || !s.is_ascii() {
            return Err(MetainfoError::InvalidInfoHash);
        }
        let mut out = [0u8; 20];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| MetainfoError::InvalidInfoHash)?;
        }
        Ok(Self(out))
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({self})")
    }
}

/// A file within a torrent, positioned in the torrent's flat byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the torrent root.
    pub path: PathBuf,
    pub length: u64,
    /// Byte offset of this file within the concatenated piece data.
    pub offset: u64,
}

/// The info dictionary: the content-defining core of a torrent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    pub name: String,
    pub piece_length: u64,
    /// SHA-1 digest per piece.
    pub pieces: Vec<[u8; 20]>,
    pub files: Vec<FileEntry>,
    pub total_length: u64,
    pub private: bool,
}

impl Info {
    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    /// Length of piece `index`; the last piece is usually shorter.
    pub fn piece_len(&self, index: usize) -> u64 {
        let start = index as u64 * self.piece_length;
        (self.total_length - start).min(self.piece_length)
    }

    /// Byte offset of piece `index` in the torrent's flat stream.
    pub fn piece_offset(&self, index: usize) -> u64 {
        index as u64 * self.piece_length
    }

    pub fn parse(value: &Value) -> Result<Self, MetainfoError> {
        let dict = value.as_dict().ok_or(MetainfoError::InvalidField("info"))?;

        let name = dict
            .get(b"name".as_slice())
            .and_then(|v| v.as_str())
            .ok_or(MetainfoError::MissingField("name"))?
            .to_string();

        let piece_length = dict
            .get(b"piece length".as_slice())
            .and_then(|v| v.as_integer())
            .filter(|&n| n > 0)
            .ok_or(MetainfoError::InvalidField("piece length"))? as u64;

        let pieces_bytes = dict
            .get(b"pieces".as_slice())
            .and_then(|v| v.as_bytes())
            .ok_or(MetainfoError::MissingField("pieces"))?;
        if pieces_bytes.len() % 20 != 0 {
            return Err(MetainfoError::InvalidField("pieces"));
        }
        let pieces = pieces_bytes
            .chunks_exact(20)
            .map(|c| {
                let mut h = [0u8; 20];
                h.copy_from_slice(c);
                h
            })
            .collect();

        let private = dict
            .get(b"private".as_slice())
            .and_then(|v| v.as_integer())
            .is_some_and(|v| v == 1);

        let (files, total_length) = if let Some(length) =
            dict.get(b"length".as_slice()).and_then(|v| v.as_integer())
        {
            let length = length as u64;
            let file = FileEntry {
                path: PathBuf::from(&name),
                length,
                offset: 0,
            };
            (vec![file], length)
        } else {
            let list = dict
                .get(b"files".as_slice())
                .and_then(|v| v.as_list())
                .ok_or(MetainfoError::MissingField("length or files"))?;
            let mut files = Vec::new();
            let mut offset = 0u64;
            for entry in list {
                let fd = entry.as_dict().ok_or(MetainfoError::InvalidField("files"))?;
                let length = fd
                    .get(b"length".as_slice())
                    .and_then(|v| v.as_integer())
                    .ok_or(MetainfoError::MissingField("file length"))? as u64;
                let parts = fd
                    .get(b"path".as_slice())
                    .and_then(|v| v.as_list())
                    .ok_or(MetainfoError::MissingField("file path"))?;
                let path: PathBuf = std::iter::once(name.clone())
                    .chain(parts.iter().filter_map(|p| p.as_str().map(String::from)))
                    .collect();
                files.push(FileEntry {
                    path,
                    length,
                    offset,
                });
                offset += length;
            }
            (files, offset)
        };

        Ok(Self {
            name,
            piece_length,
            pieces,
            files,
            total_length,
            private,
        })
    }

    pub fn to_value(&self) -> Value {
        let mut dict = BTreeMap::new();
        dict.insert(
            Bytes::from_static(b"name"),
            Value::string(&self.name),
        );
        dict.insert(
            Bytes::from_static(b"piece length"),
            Value::Integer(self.piece_length as i64),
        );
        let mut pieces = Vec::with_capacity(self.pieces.len() * 20);
        for h in &self.pieces {
            pieces.extend_from_slice(h);
        }
        dict.insert(Bytes::from_static(b"pieces"), Value::Bytes(pieces.into()));
        if self.private {
            dict.insert(Bytes::from_static(b"private"), Value::Integer(1));
        }
        if self.files.len() == 1 && self.files[0].path == Path::new(&self.name) {
            dict.insert(
                Bytes::from_static(b"length"),
                Value::Integer(self.total_length as i64),
            );
        } else {
            let files = self
                .files
                .iter()
                .map(|f| {
                    let mut fd = BTreeMap::new();
                    fd.insert(
                        Bytes::from_static(b"length"),
                        Value::Integer(f.length as i64),
                    );
                    let parts = f
                        .path
                        .iter()
                        .skip(1) // torrent root directory
                        .map(|p| Value::string(&p.to_string_lossy()))
                        .collect();
                    fd.insert(Bytes::from_static(b"path"), Value::List(parts));
                    Value::Dict(fd)
                })
                .collect();
            dict.insert(Bytes::from_static(b"files"), Value::List(files));
        }
        Value::Dict(dict)
    }

    /// Canonical bencoded bytes of this info dictionary.
    pub fn to_bytes(&self) -> Result<Bytes, MetainfoError> {
        Ok(Bytes::from(bencode::encode(&self.to_value())?))
    }

    /// The info hash of this dictionary's canonical encoding.
    pub fn info_hash(&self) -> Result<InfoHash, MetainfoError> {
        Ok(InfoHash::from_info_bytes(&self.to_bytes()?))
    }

    /// Builds a single-file info dictionary by reading and hashing `path`.
    ///
    /// Any I/O failure, including the initial metadata lookup, is returned to
    /// the caller; pieces are never generated over a file of unknown size.
    pub fn build_from_path(path: &Path, piece_length: u64) -> Result<Self, MetainfoError> {
        if piece_length == 0 {
            return Err(MetainfoError::InvalidField("piece length"));
        }
        let meta = std::fs::metadata(path)?;
        let total_length = meta.len();
        let data = std::fs::read(path)?;
        let pieces = data
            .chunks(piece_length as usize)
            .map(|chunk| {
                let mut hasher = Sha1::new();
                hasher.update(chunk);
                hasher.finalize().into()
            })
            .collect();
        let name = path
            .file_name()
            .ok_or(MetainfoError::InvalidField("path"))?
            .to_string_lossy()
            .into_owned();
        Ok(Self {
            files: vec![FileEntry {
                path: PathBuf::from(&name),
                length: total_length,
                offset: 0,
            }],
            name,
            piece_length,
            pieces,
            total_length,
            private: false,
        })
    }
}

/// A parsed `.torrent` file.
#[derive(Debug, Clone)]
pub struct Metainfo {
    pub info: Info,
    pub info_hash: InfoHash,
    pub announce: Option<String>,
    /// Tracker tiers per [BEP-12](http://bittorrent.org/beps/bep_0012.html).
    pub announce_list: Vec<Vec<String>>,
    raw_info: Bytes,
}

impl Metainfo {
    pub fn from_bytes(data: &[u8]) -> Result<Self, MetainfoError> {
        let value = bencode::decode(data)?;
        let dict = value.as_dict().ok_or(MetainfoError::InvalidField("root"))?;

        let info_value = dict
            .get(b"info".as_slice())
            .ok_or(MetainfoError::MissingField("info"))?;
        let raw_info = Bytes::from(bencode::encode(info_value)?);
        let info_hash = InfoHash::from_info_bytes(&raw_info);
        let info = Info::parse(info_value)?;

        let announce = dict
            .get(b"announce".as_slice())
            .and_then(|v| v.as_str())
            .map(String::from);
        let announce_list = dict
            .get(b"announce-list".as_slice())
            .and_then(|v| v.as_list())
            .map(|tiers| {
                tiers
                    .iter()
                    .filter_map(|tier| {
                        tier.as_list().map(|urls| {
                            urls.iter()
                                .filter_map(|u| u.as_str().map(String::from))
                                .collect()
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            info,
            info_hash,
            announce,
            announce_list,
            raw_info,
        })
    }

    pub fn load(path: &Path) -> Result<Self, MetainfoError> {
        Self::from_bytes(&std::fs::read(path)?)
    }

    /// Raw bencoded info-dictionary bytes, as found in the file.
    pub fn raw_info(&self) -> &Bytes {
        &self.raw_info
    }

    /// Tracker tiers, with a bare `announce` promoted to a single tier.
    pub fn tracker_tiers(&self) -> Vec<Vec<String>> {
        if !self.announce_list.is_empty() {
            return self.announce_list.clone();
        }
        match &self.announce {
            Some(url) => vec![vec![url.clone()]],
            None => Vec::new(),
        }
    }
}

/// A parsed `magnet:` link.
#[derive(Debug, Clone)]
pub struct MagnetLink {
    pub info_hash: InfoHash,
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
}

impl MagnetLink {
    pub fn parse(uri: &str) -> Result<Self, MetainfoError> {
        let query = uri
            .strip_prefix("magnet:?")
            .ok_or(MetainfoError::NotMagnet)?;
        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers = Vec::new();
        for pair in query.split('&') {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match key {
                "xt" => {
                    let hex = value
                        .strip_prefix("urn:btih:")
                        .ok_or(MetainfoError::InvalidInfoHash)?;
                    info_hash = Some(InfoHash::from_hex(hex)?);
                }
                "dn" => display_name = Some(percent_decode(value)),
                "tr" => trackers.push(percent_decode(value)),
                _ => {}
            }
        }
        Ok(Self {
            info_hash: info_hash.ok_or(MetainfoError::MissingField("xt"))?,
            display_name,
            trackers,
        })
    }
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(b) => {
                        out.push(b);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_info() -> Info {
        Info {
            name: "sample.bin".into(),
            piece_length: 32768,
            pieces: vec![[0xaa; 20], [0xbb; 20]],
            files: vec![FileEntry {
                path: PathBuf::from("sample.bin"),
                length: 40000,
                offset: 0,
            }],
            total_length: 40000,
            private: false,
        }
    }

    #[test]
    fn info_round_trip_preserves_hash() {
        let info = sample_info();
        let bytes = info.to_bytes().unwrap();
        let reparsed = Info::parse(&bencode::decode(&bytes).unwrap()).unwrap();
        assert_eq!(info, reparsed);
        assert_eq!(
            InfoHash::from_info_bytes(&bytes),
            InfoHash::from_info_bytes(&reparsed.to_bytes().unwrap())
        );
    }

    #[test]
    fn metainfo_round_trip_preserves_hash() {
        let info = sample_info();
        let mut root = BTreeMap::new();
        root.insert(Bytes::from_static(b"announce"), Value::string("http://t/a"));
        root.insert(Bytes::from_static(b"info"), info.to_value());
        let encoded = bencode::encode(&Value::Dict(root)).unwrap();

        let mi = Metainfo::from_bytes(&encoded).unwrap();
        assert_eq!(mi.info_hash, info.info_hash().unwrap());
        assert_eq!(mi.tracker_tiers(), vec![vec!["http://t/a".to_string()]]);

        // Re-encode from the parsed structure and parse again.
        let reencoded = mi.info.to_bytes().unwrap();
        assert_eq!(InfoHash::from_info_bytes(&reencoded), mi.info_hash);
    }

    #[test]
    fn piece_len_handles_short_tail() {
        let info = sample_info();
        assert_eq!(info.piece_len(0), 32768);
        assert_eq!(info.piece_len(1), 40000 - 32768);
    }

    #[test]
    fn build_from_missing_path_is_an_error() {
        let err = Info::build_from_path(Path::new("/no/such/file/here"), 16384);
        assert!(matches!(err, Err(MetainfoError::Io(_))));
    }

    #[test]
    fn build_from_path_hashes_pieces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        let data: Vec<u8> = (0..40000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let info = Info::build_from_path(&path, 16384).unwrap();
        assert_eq!(info.total_length, 40000);
        assert_eq!(info.num_pieces(), 3);

        let mut hasher = Sha1::new();
        hasher.update(&data[..16384]);
        let first: [u8; 20] = hasher.finalize().into();
        assert_eq!(info.pieces[0], first);
    }

    #[test]
    fn magnet_parsing() {
        let uri = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567\
                   &dn=My%20File&tr=http%3A%2F%2Ftracker%2Fannounce";
        let m = MagnetLink::parse(uri).unwrap();
        assert_eq!(
            m.info_hash.to_string(),
            "0123456789abcdef0123456789abcdef01234567"
        );
        assert_eq!(m.display_name.as_deref(), Some("My File"));
        assert_eq!(m.trackers, vec!["http://tracker/announce".to_string()]);
    }

    #[test]
    fn magnet_rejects_bad_hash() {
        assert!(MagnetLink::parse("magnet:?xt=urn:btih:tooshort").is_err());
        assert!(MagnetLink::parse("http://example.com").is_err());
    }
}
