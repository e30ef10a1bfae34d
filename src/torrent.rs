//! Per-swarm state: one [`Torrent`] per info-hash.
//!
//! A torrent aggregates everything the engine knows about one swarm: the
//! (possibly still unknown) info dictionary, piece download state, candidate
//! peers, in-flight dials, live connections, and the metadata accumulation
//! buffer used while the info dictionary is being fetched from peers. All of
//! it is owned by the client's state map and mutated only under the client
//! lock.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::conn::{Conn, ConnId, ConnStats};
use crate::event::Event;
use crate::metainfo::{Info, InfoHash, MetainfoError};
use crate::peer::extension::UT_METADATA;
use crate::peer::metadata::{metadata_num_pieces, metadata_piece_size, MAX_METADATA_SIZE, METADATA_PIECE_SIZE};
use crate::piece::{self, Piece, Request, DEFAULT_CHUNK_SIZE};
use crate::storage::{StorageClient, StorageError, TorrentStorage};

/// Hard cap on simultaneous connections per torrent.
pub const PER_TORRENT_CONN_LIMIT: usize = 80;

/// Hard cap on in-flight outbound dials per torrent.
pub const HALF_OPEN_LIMIT: usize = 80;

/// Stop collecting candidate peers past this point.
pub const PEERS_HIGH_WATER: usize = 200;

/// Start hunting for more candidates below this point.
pub const PEERS_LOW_WATER: usize = 50;

#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("metainfo error: {0}")]
    Metainfo(#[from] MetainfoError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("bencode error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("info bytes do not match the torrent's info hash")]
    InfoHashMismatch,

    #[error("metadata size {0} exceeds the sanity cap")]
    MetadataTooLarge(u64),

    #[error("no such torrent")]
    NotFound,
}

/// Where a candidate peer address came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSource {
    Tracker,
    Dht,
    Pex,
    Incoming,
    Lsd,
}

/// A candidate peer address waiting to be dialed.
#[derive(Debug, Clone)]
pub struct Peer {
    pub addr: SocketAddr,
    pub source: PeerSource,
    pub supports_encryption: bool,
}

/// A torrent to add: an info-hash plus whatever else is already known.
#[derive(Default)]
pub struct TorrentSpec {
    pub info_hash: Option<InfoHash>,
    /// Raw bencoded info dictionary, when already available.
    pub info_bytes: Option<Bytes>,
    /// Tiered tracker URLs.
    pub trackers: Vec<Vec<String>>,
    pub display_name: Option<String>,
    /// Chunk size for outbound requests; 16 KiB when unset.
    pub chunk_size: Option<u32>,
    /// Storage for this torrent, overriding the client default.
    pub storage: Option<Arc<dyn StorageClient>>,
}

/// Accumulates `ut_metadata` pieces until the info dictionary checks out.
pub(crate) struct MetadataBuf {
    bytes: Vec<u8>,
    have: Vec<bool>,
}

impl MetadataBuf {
    fn new(size: usize) -> Self {
        Self {
            bytes: vec![0; size],
            have: vec![false; metadata_num_pieces(size as u64)],
        }
    }
}

pub(crate) struct Torrent {
    pub info_hash: InfoHash,
    pub info: Option<Info>,
    /// Canonical bencoded info bytes, kept to serve `ut_metadata` requests.
    pub info_bytes: Option<Bytes>,
    pub display_name: Option<String>,
    pub chunk_size: u32,
    pub pieces: Vec<Piece>,
    pub peers: HashMap<SocketAddr, Peer>,
    pub half_open: HashSet<SocketAddr>,
    pub conns: HashMap<ConnId, Conn>,
    pub metadata: Option<MetadataBuf>,
    pub storage: Option<Arc<dyn TorrentStorage>>,
    pub trackers: Vec<Vec<String>>,
    pub closed: Event,
    /// Stats carried over from connections that have since dropped.
    pub retired_stats: ConnStats,
}

impl Torrent {
    pub fn new(info_hash: InfoHash) -> Self {
        Self {
            info_hash,
            info: None,
            info_bytes: None,
            display_name: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            pieces: Vec::new(),
            peers: HashMap::new(),
            half_open: HashSet::new(),
            conns: HashMap::new(),
            metadata: None,
            storage: None,
            trackers: Vec::new(),
            closed: Event::new(),
            retired_stats: ConnStats::default(),
        }
    }

    pub fn name(&self) -> Option<String> {
        self.info
            .as_ref()
            .map(|i| i.name.clone())
            .or_else(|| self.display_name.clone())
    }

    pub fn have_info(&self) -> bool {
        self.info.is_some()
    }

    pub fn num_pieces(&self) -> usize {
        self.pieces.len()
    }

    /// Installs a verified info dictionary and opens storage for it.
    ///
    /// Idempotent: once the info is set, later calls are no-ops.
    pub fn set_info_bytes(
        &mut self,
        bytes: Bytes,
        opener: &dyn StorageClient,
    ) -> Result<(), TorrentError> {
        if self.have_info() {
            return Ok(());
        }
        if InfoHash::from_info_bytes(&bytes) != self.info_hash {
            return Err(TorrentError::InfoHashMismatch);
        }
        let info = Info::parse(&crate::bencode::decode(&bytes)?)?;
        self.pieces = info
            .pieces
            .iter()
            .enumerate()
            .map(|(i, &hash)| Piece::new(hash, info.piece_len(i), self.chunk_size))
            .collect();
        self.storage = Some(opener.open_torrent(&info, self.info_hash)?);
        self.info = Some(info);
        self.info_bytes = Some(bytes);
        self.metadata = None;
        Ok(())
    }

    /// Merges tracker tiers, ignoring URLs already present anywhere.
    pub fn add_trackers(&mut self, tiers: &[Vec<String>]) {
        for (i, tier) in tiers.iter().enumerate() {
            for url in tier {
                if self.trackers.iter().any(|t| t.contains(url)) {
                    continue;
                }
                while self.trackers.len() <= i {
                    self.trackers.push(Vec::new());
                }
                self.trackers[i].push(url.clone());
            }
        }
    }

    /// Admits a candidate peer. Zero ports and duplicates are dropped, and
    /// the pool stops growing at the high-water mark.
    pub fn add_peer(&mut self, peer: Peer) -> bool {
        if peer.addr.port() == 0
            || self.peers.len() >= PEERS_HIGH_WATER
            || self.peers.contains_key(&peer.addr)
        {
            return false;
        }
        self.peers.insert(peer.addr, peer);
        true
    }

    /// Takes an arbitrary candidate for dialing.
    pub fn pop_peer(&mut self) -> Option<Peer> {
        let addr = *self.peers.keys().next()?;
        self.peers.remove(&addr)
    }

    pub fn wants_peers(&self) -> bool {
        !self.closed.is_set() && self.peers.len() < PEERS_LOW_WATER
    }

    /// True while a dial to `addr` is in flight or a session is up.
    pub fn addr_active(&self, addr: SocketAddr) -> bool {
        self.half_open.contains(&addr) || self.conns.values().any(|c| c.remote == addr)
    }

    pub fn piece_complete(&self, index: usize) -> bool {
        self.storage
            .as_ref()
            .is_some_and(|s| s.is_complete(index))
    }

    pub fn have_piece(&self, index: usize) -> bool {
        self.have_info() && self.piece_complete(index)
    }

    pub fn have_any_pieces(&self) -> bool {
        (0..self.pieces.len()).any(|i| self.piece_complete(i))
    }

    pub fn num_pieces_completed(&self) -> usize {
        (0..self.pieces.len())
            .filter(|&i| self.piece_complete(i))
            .count()
    }

    /// All pieces verified and present.
    pub fn seeding(&self) -> bool {
        self.have_info() && self.num_pieces_completed() == self.num_pieces()
    }

    pub fn needs_data(&self) -> bool {
        !self.have_info() || self.num_pieces_completed() < self.num_pieces()
    }

    pub fn bytes_left(&self) -> u64 {
        let Some(info) = &self.info else { return 0 };
        (0..self.pieces.len())
            .filter(|&i| !self.piece_complete(i))
            .map(|i| info.piece_len(i))
            .sum()
    }

    /// Whether piece `index` should still be fetched.
    pub fn want_piece_index(&self, index: usize) -> bool {
        let Some(p) = self.pieces.get(index) else {
            return false;
        };
        !self.piece_complete(index) && !p.hashing && !p.queued_for_hash
    }

    /// Whether the chunk named by `r` is still worth having.
    pub fn want_chunk(&self, r: Request) -> bool {
        if !self.want_piece_index(r.index as usize) {
            return false;
        }
        self.pieces[r.index as usize].chunk_dirty(piece::chunk_index(r.begin, self.chunk_size))
    }

    /// Our complete-piece bitmap for the initial Bitfield message.
    pub fn bitfield(&self) -> crate::peer::Bitfield {
        let mut bf = crate::peer::Bitfield::new(self.num_pieces());
        for i in 0..self.num_pieces() {
            if self.piece_complete(i) {
                bf.set(i);
            }
        }
        bf
    }

    /// Whether `c` has any piece we still want.
    pub fn conn_has_wanted_pieces(&self, c: &Conn) -> bool {
        (0..self.pieces.len()).any(|i| c.peer_has_piece(i) && self.want_piece_index(i))
    }

    /// A connection worth keeping: fetching metadata pre-info, reciprocating
    /// while seeding, or holding pieces we want.
    pub fn useful_conn(&self, c: &Conn) -> bool {
        if c.closed.is_set() {
            return false;
        }
        if !self.have_info() {
            return c.supports_extension(UT_METADATA);
        }
        if self.seeding() {
            return c.peer_interested;
        }
        self.conn_has_wanted_pieces(c)
    }

    /// The connection to evict when the cap is hit, if any deserves it.
    pub fn worst_bad_conn(&self) -> Option<ConnId> {
        self.conns
            .values()
            .filter(|c| {
                !self.useful_conn(c)
                    || c.stats.bad_pieces_dirtied > c.stats.good_pieces_dirtied
            })
            .max_by_key(|c| c.badness(self.useful_conn(c)))
            .map(|c| c.id)
    }

    /// Removes a connection, retiring its counters. The caller broadcasts.
    pub fn drop_connection(&mut self, cid: ConnId) -> Option<Conn> {
        let conn = self.conns.remove(&cid)?;
        conn.closed.set();
        let s = &conn.stats;
        self.retired_stats.useful_chunks_received += s.useful_chunks_received;
        self.retired_stats.unwanted_chunks_received += s.unwanted_chunks_received;
        self.retired_stats.unexpected_chunks_received += s.unexpected_chunks_received;
        self.retired_stats.unexpected_cancels += s.unexpected_cancels;
        self.retired_stats.chunks_sent += s.chunks_sent;
        self.retired_stats.good_pieces_dirtied += s.good_pieces_dirtied;
        self.retired_stats.bad_pieces_dirtied += s.bad_pieces_dirtied;
        Some(conn)
    }

    /// Lifetime counters: live connections plus everything retired.
    pub fn total_stats(&self) -> ConnStats {
        let mut total = self.retired_stats;
        for c in self.conns.values() {
            total.useful_chunks_received += c.stats.useful_chunks_received;
            total.unwanted_chunks_received += c.stats.unwanted_chunks_received;
            total.unexpected_chunks_received += c.stats.unexpected_chunks_received;
            total.unexpected_cancels += c.stats.unexpected_cancels;
            total.chunks_sent += c.stats.chunks_sent;
            total.good_pieces_dirtied += c.stats.good_pieces_dirtied;
            total.bad_pieces_dirtied += c.stats.bad_pieces_dirtied;
        }
        total
    }

    /// Regenerates interest and outstanding requests for one connection.
    ///
    /// Runs after an unchoke, a possession change, or anything that may have
    /// changed which chunks this peer can give us. Requests are filled to
    /// the peer's advertised queue depth, preferring pieces already begun.
    pub fn update_requests(&mut self, cid: ConnId) {
        let piece_count = self.pieces.len();
        let storage = self.storage.clone();
        let pieces = &self.pieces;
        let chunk_size = self.chunk_size;
        let Some(info) = self.info.as_ref() else {
            return;
        };
        let Some(conn) = self.conns.get_mut(&cid) else {
            return;
        };

        let want_piece = |i: usize| -> bool {
            let p = &pieces[i];
            let complete = storage.as_ref().is_some_and(|s| s.is_complete(i));
            !complete && !p.hashing && !p.queued_for_hash
        };

        let interesting =
            (0..piece_count).any(|i| conn.peer_has_piece(i) && want_piece(i));
        conn.set_interested(interesting);
        if !interesting || conn.peer_choking {
            return;
        }

        // Pieces already begun first, then the rest by index.
        let mut order: Vec<usize> = (0..piece_count)
            .filter(|&i| conn.peer_has_piece(i) && want_piece(i))
            .collect();
        order.sort_by_key(|&i| (!pieces[i].partially_downloaded(), i));

        let cap = conn.peer_reqq;
        'fill: for i in order {
            for chunk in pieces[i].dirty_chunk_indices() {
                if conn.requests.len() >= cap {
                    break 'fill;
                }
                let (begin, length) = piece::chunk_range(info.piece_len(i), chunk_size, chunk);
                let r = Request::new(i as u32, begin, length);
                if conn.requests.insert(r) {
                    conn.post(crate::peer::Message::Request {
                        index: r.index,
                        begin: r.begin,
                        length: r.length,
                    });
                }
            }
        }
    }

    // --- metadata accumulation (`ut_metadata`) ---

    /// Records a metadata size learned from an extended handshake.
    pub fn set_metadata_size(&mut self, size: u64) -> Result<(), TorrentError> {
        if self.have_info() {
            return Ok(());
        }
        if size == 0 || size > MAX_METADATA_SIZE {
            return Err(TorrentError::MetadataTooLarge(size));
        }
        match &self.metadata {
            Some(buf) if buf.bytes.len() == size as usize => {}
            _ => self.metadata = Some(MetadataBuf::new(size as usize)),
        }
        Ok(())
    }

    pub fn metadata_size(&self) -> Option<u64> {
        if let Some(bytes) = &self.info_bytes {
            return Some(bytes.len() as u64);
        }
        self.metadata.as_ref().map(|m| m.bytes.len() as u64)
    }

    pub fn have_metadata_piece(&self, piece: usize) -> bool {
        if self.have_info() {
            let total = self.info_bytes.as_ref().map_or(0, |b| b.len() as u64);
            return metadata_piece_size(total, piece as u32) > 0;
        }
        self.metadata
            .as_ref()
            .and_then(|m| m.have.get(piece))
            .copied()
            .unwrap_or(false)
    }

    /// Serves a metadata piece, preferring the canonical info bytes and
    /// falling back to verified-so-far accumulation state.
    pub fn metadata_piece_data(&self, piece: usize) -> Option<Bytes> {
        let start = piece * METADATA_PIECE_SIZE;
        if let Some(bytes) = &self.info_bytes {
            let size = metadata_piece_size(bytes.len() as u64, piece as u32);
            if size == 0 {
                return None;
            }
            return Some(bytes.slice(start..start + size));
        }
        let buf = self.metadata.as_ref()?;
        if !buf.have.get(piece).copied().unwrap_or(false) {
            return None;
        }
        let size = metadata_piece_size(buf.bytes.len() as u64, piece as u32);
        Some(Bytes::copy_from_slice(&buf.bytes[start..start + size]))
    }

    /// Stores an arriving metadata piece. Silently ignores pieces of the
    /// wrong size or pieces arriving before the size is known.
    pub fn save_metadata_piece(&mut self, piece: usize, data: &[u8]) {
        if self.have_info() {
            return;
        }
        let Some(buf) = self.metadata.as_mut() else {
            return;
        };
        let expected = metadata_piece_size(buf.bytes.len() as u64, piece as u32);
        if expected == 0 || data.len() != expected {
            return;
        }
        let start = piece * METADATA_PIECE_SIZE;
        buf.bytes[start..start + data.len()].copy_from_slice(data);
        buf.have[piece] = true;
    }

    pub fn missing_metadata_pieces(&self) -> Vec<usize> {
        match &self.metadata {
            Some(buf) => buf
                .have
                .iter()
                .enumerate()
                .filter_map(|(i, h)| (!h).then_some(i))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Checks a fully assembled metadata buffer against the info hash.
    ///
    /// Returns the verified bytes for `set_info_bytes`, or `None` when
    /// pieces are still missing. A hash mismatch discards all accumulated
    /// pieces so the fetch starts over.
    pub fn maybe_metadata_completed(&mut self) -> Option<Bytes> {
        let buf = self.metadata.as_ref()?;
        if !buf.have.iter().all(|&h| h) {
            return None;
        }
        let mut hasher = Sha1::new();
        hasher.update(&buf.bytes);
        let digest: [u8; 20] = hasher.finalize().into();
        if digest == self.info_hash.0 {
            Some(Bytes::copy_from_slice(&buf.bytes))
        } else {
            tracing::warn!(info_hash = %self.info_hash, "assembled metadata failed hash check");
            // Start the fetch over, on every connection.
            if let Some(buf) = self.metadata.as_mut() {
                buf.have.fill(false);
            }
            for c in self.conns.values_mut() {
                c.metadata_requests.clear();
            }
            None
        }
    }

    /// Shuts the torrent down: every connection is released and candidate
    /// state cleared. Storage stays for a possible re-add.
    pub fn close(&mut self) {
        self.closed.set();
        let ids: Vec<ConnId> = self.conns.keys().copied().collect();
        for cid in ids {
            self.drop_connection(cid);
        }
        self.peers.clear();
        self.half_open.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::FileEntry;
    use crate::storage::MemoryStorage;

    fn make_info(total: u64, piece_length: u64) -> (Info, Bytes, InfoHash) {
        let data: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
        let pieces = data
            .chunks(piece_length as usize)
            .map(|c| {
                let mut h = Sha1::new();
                h.update(c);
                h.finalize().into()
            })
            .collect();
        let info = Info {
            name: "t".into(),
            piece_length,
            pieces,
            files: vec![FileEntry {
                path: "t".into(),
                length: total,
                offset: 0,
            }],
            total_length: total,
            private: false,
        };
        let bytes = info.to_bytes().unwrap();
        let hash = InfoHash::from_info_bytes(&bytes);
        (info, bytes, hash)
    }

    #[test]
    fn set_info_bytes_builds_pieces_once() {
        let (_, bytes, hash) = make_info(100_000, 32768);
        let mut t = Torrent::new(hash);
        assert!(!t.have_info());

        t.set_info_bytes(bytes.clone(), &MemoryStorage).unwrap();
        assert!(t.have_info());
        assert_eq!(t.num_pieces(), 4);
        assert!(t.storage.is_some());

        // Idempotent on re-add.
        t.set_info_bytes(bytes, &MemoryStorage).unwrap();
        assert_eq!(t.num_pieces(), 4);
    }

    #[test]
    fn set_info_bytes_rejects_wrong_hash() {
        let (_, bytes, _) = make_info(1000, 512);
        let mut t = Torrent::new(InfoHash([9; 20]));
        assert!(matches!(
            t.set_info_bytes(bytes, &MemoryStorage),
            Err(TorrentError::InfoHashMismatch)
        ));
    }

    #[test]
    fn tracker_merge_deduplicates() {
        let mut t = Torrent::new(InfoHash([0; 20]));
        t.add_trackers(&[vec!["http://a".into()], vec!["http://b".into()]]);
        t.add_trackers(&[vec!["http://a".into(), "http://c".into()]]);
        assert_eq!(t.trackers.len(), 2);
        assert_eq!(t.trackers[0], vec!["http://a", "http://c"]);
        assert_eq!(t.trackers[1], vec!["http://b"]);
    }

    #[test]
    fn add_peer_filters_zero_port_and_duplicates() {
        let mut t = Torrent::new(InfoHash([0; 20]));
        let addr: SocketAddr = "10.0.0.1:6881".parse().unwrap();
        let peer = Peer {
            addr,
            source: PeerSource::Tracker,
            supports_encryption: false,
        };
        assert!(t.add_peer(peer.clone()));
        assert!(!t.add_peer(peer));
        let zero = Peer {
            addr: "10.0.0.2:0".parse().unwrap(),
            source: PeerSource::Pex,
            supports_encryption: false,
        };
        assert!(!t.add_peer(zero));
        assert_eq!(t.peers.len(), 1);
    }

    #[test]
    fn metadata_accumulation_round_trip() {
        let (_, bytes, hash) = make_info(100_000, 16384);
        let mut t = Torrent::new(hash);

        t.set_metadata_size(bytes.len() as u64).unwrap();
        assert_eq!(t.missing_metadata_pieces(), vec![0]);
        assert!(t.maybe_metadata_completed().is_none());

        t.save_metadata_piece(0, &bytes);
        let assembled = t.maybe_metadata_completed().unwrap();
        assert_eq!(assembled, bytes);
    }

    #[test]
    fn metadata_mismatch_restarts_accumulation() {
        let mut t = Torrent::new(InfoHash([7; 20]));
        t.set_metadata_size(100).unwrap();
        t.save_metadata_piece(0, &[1u8; 100]);
        assert!(t.maybe_metadata_completed().is_none());
        // The buffer was reset; the piece must be fetched again.
        assert_eq!(t.missing_metadata_pieces(), vec![0]);
    }

    #[test]
    fn metadata_size_sanity_cap() {
        let mut t = Torrent::new(InfoHash([0; 20]));
        assert!(t.set_metadata_size(MAX_METADATA_SIZE + 1).is_err());
        assert!(t.set_metadata_size(0).is_err());
        assert!(t.set_metadata_size(1000).is_ok());
    }

    #[test]
    fn serves_metadata_from_info_bytes() {
        let (_, bytes, hash) = make_info(500_000, 16384);
        let mut t = Torrent::new(hash);
        t.set_info_bytes(bytes.clone(), &MemoryStorage).unwrap();

        assert!(t.have_metadata_piece(0));
        let piece0 = t.metadata_piece_data(0).unwrap();
        assert_eq!(&piece0[..], &bytes[..piece0.len()]);
        assert_eq!(t.metadata_size(), Some(bytes.len() as u64));
    }
}
