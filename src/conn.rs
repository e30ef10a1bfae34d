//! Per-connection state.
//!
//! A [`Conn`] is the record a torrent keeps for one live peer session. The
//! reader and writer tasks never hold a reference to it: they carry the
//! `(InfoHash, ConnId)` pair and re-look the record up under the client lock,
//! so eviction can never leave a task pointing at freed state.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;

use tokio::sync::mpsc;

use crate::event::Event;
use crate::peer::message::{Message, Reserved};
use crate::peer::PeerId;
use crate::piece::Request;
use crate::torrent::PeerSource;

/// Outbound post queue depth. Sized for the largest burst a dispatch can
/// produce: a full request regeneration at the peer's advertised queue depth
/// plus control traffic. Posting asserts instead of waiting because posters
/// hold the client lock and the writer drains without it.
pub const POST_QUEUE_CAPACITY: usize = 512;

/// Request queue depth assumed for peers that never advertise `reqq`.
pub const DEFAULT_PEER_REQQ: usize = 250;

/// Opaque connection identifier, unique per client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub u64);

/// Counters a connection accumulates over its life.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnStats {
    pub useful_chunks_received: u64,
    pub unwanted_chunks_received: u64,
    pub unexpected_chunks_received: u64,
    pub unexpected_cancels: u64,
    pub chunks_sent: u64,
    pub good_pieces_dirtied: u64,
    pub bad_pieces_dirtied: u64,
}

/// One live peer session.
pub struct Conn {
    pub id: ConnId,
    pub remote: SocketAddr,
    pub peer_id: PeerId,
    pub peer_reserved: Reserved,
    pub discovery: PeerSource,
    pub utp: bool,
    pub encrypted: bool,

    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,

    /// Peer possession; `peer_has_all` short-circuits the bitmap.
    pub peer_has_all: bool,
    pub peer_pieces: Vec<bool>,

    /// Our outstanding chunk requests to this peer.
    pub requests: HashSet<Request>,
    /// The peer's queued requests to us, in arrival order.
    pub peer_requests: Vec<Request>,

    pub peer_extension_ids: HashMap<String, u8>,
    pub peer_reqq: usize,
    pub peer_client_name: Option<String>,

    /// Metadata pieces we have asked this peer for.
    pub metadata_requests: Vec<bool>,

    /// Pieces this peer contributed chunks to since the last verification.
    pub touched_pieces: HashSet<u32>,

    pub stats: ConnStats,
    pub completed_handshake: Instant,
    pub last_message_received: Instant,
    pub last_useful_chunk_received: Option<Instant>,

    post_tx: mpsc::Sender<Message>,
    pub closed: Event,
}

impl Conn {
    pub fn new(
        id: ConnId,
        remote: SocketAddr,
        peer_id: PeerId,
        peer_reserved: Reserved,
        discovery: PeerSource,
        utp: bool,
        encrypted: bool,
        post_tx: mpsc::Sender<Message>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            remote,
            peer_id,
            peer_reserved,
            discovery,
            utp,
            encrypted,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            peer_has_all: false,
            peer_pieces: Vec::new(),
            requests: HashSet::new(),
            peer_requests: Vec::new(),
            peer_extension_ids: HashMap::new(),
            peer_reqq: DEFAULT_PEER_REQQ,
            peer_client_name: None,
            metadata_requests: Vec::new(),
            touched_pieces: HashSet::new(),
            stats: ConnStats::default(),
            completed_handshake: now,
            last_message_received: now,
            last_useful_chunk_received: None,
            post_tx,
            closed: Event::new(),
        }
    }

    /// Queues a message for the writer task. Must not be able to block; a
    /// full queue means the capacity reasoning above is wrong.
    pub fn post(&self, msg: Message) {
        use mpsc::error::TrySendError;
        match self.post_tx.try_send(msg) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(_)) => panic!("connection post queue full"),
        }
    }

    pub fn choke(&mut self) {
        if self.am_choking {
            return;
        }
        self.am_choking = true;
        // A choked peer's queue is void.
        self.peer_requests.clear();
        self.post(Message::Choke);
    }

    pub fn unchoke(&mut self) {
        if !self.am_choking {
            return;
        }
        self.am_choking = false;
        self.post(Message::Unchoke);
    }

    pub fn set_interested(&mut self, interested: bool) {
        if self.am_interested == interested {
            return;
        }
        self.am_interested = interested;
        self.post(if interested {
            Message::Interested
        } else {
            Message::NotInterested
        });
    }

    pub fn peer_has_piece(&self, index: usize) -> bool {
        self.peer_has_all || self.peer_pieces.get(index).copied().unwrap_or(false)
    }

    pub fn record_peer_has(&mut self, index: usize) {
        if self.peer_pieces.len() <= index {
            self.peer_pieces.resize(index + 1, false);
        }
        self.peer_pieces[index] = true;
    }

    /// Replaces the possession map from a raw bitfield.
    pub fn set_peer_bitfield(&mut self, bits: &[u8]) {
        self.peer_has_all = false;
        self.peer_pieces = bits
            .iter()
            .flat_map(|b| (0..8).map(move |i| b >> (7 - i) & 1 == 1))
            .collect();
    }

    pub fn set_peer_has_all(&mut self) {
        self.peer_has_all = true;
        self.peer_pieces.clear();
    }

    pub fn set_peer_has_none(&mut self) {
        self.peer_has_all = false;
        self.peer_pieces.clear();
    }

    /// Removes a matching outstanding request without posting anything.
    pub fn delete_request(&mut self, r: Request) -> bool {
        self.requests.remove(&r)
    }

    /// Cancels a matching outstanding request on the wire.
    pub fn cancel_request(&mut self, r: Request) -> bool {
        if !self.requests.remove(&r) {
            return false;
        }
        self.post(Message::Cancel {
            index: r.index,
            begin: r.begin,
            length: r.length,
        });
        true
    }

    /// Forgets all outstanding requests, e.g. when the peer chokes us and is
    /// thereby permitted to discard them.
    pub fn clear_requests(&mut self) {
        self.requests.clear();
    }

    pub fn supports_extension(&self, name: &str) -> bool {
        self.peer_extension_ids.contains_key(name)
    }

    pub fn extension_id(&self, name: &str) -> Option<u8> {
        self.peer_extension_ids.get(name).copied()
    }

    pub fn requested_metadata_piece(&self, piece: usize) -> bool {
        self.metadata_requests.get(piece).copied().unwrap_or(false)
    }

    pub fn mark_metadata_requested(&mut self, piece: usize) {
        if self.metadata_requests.len() <= piece {
            self.metadata_requests.resize(piece + 1, false);
        }
        self.metadata_requests[piece] = true;
    }

    /// Eviction key: worst first. Bad dirtiers sort before merely useless
    /// connections, and older connections lose ties.
    pub fn badness(&self, useful: bool) -> (bool, bool, std::time::Duration) {
        (
            self.stats.bad_pieces_dirtied > self.stats.good_pieces_dirtied,
            !useful,
            self.completed_handshake.elapsed(),
        )
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.id)
            .field("remote", &self.remote)
            .field("peer_id", &self.peer_id)
            .field("requests", &self.requests.len())
            .field("peer_requests", &self.peer_requests.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn() -> (Conn, mpsc::Receiver<Message>) {
        let (tx, rx) = mpsc::channel(POST_QUEUE_CAPACITY);
        let conn = Conn::new(
            ConnId(1),
            "127.0.0.1:6881".parse().unwrap(),
            PeerId([1; 20]),
            Reserved::ours(false),
            PeerSource::Incoming,
            false,
            false,
            tx,
        );
        (conn, rx)
    }

    #[test]
    fn choke_clears_peer_requests_and_posts_once() {
        let (mut conn, mut rx) = test_conn();
        conn.am_choking = false;
        conn.peer_requests.push(Request::new(0, 0, 16384));

        conn.choke();
        assert!(conn.peer_requests.is_empty());
        assert_eq!(rx.try_recv().unwrap(), Message::Choke);

        // Idempotent: a second choke posts nothing.
        conn.choke();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn possession_tracking() {
        let (mut conn, _rx) = test_conn();
        assert!(!conn.peer_has_piece(3));
        conn.record_peer_has(3);
        assert!(conn.peer_has_piece(3));

        conn.set_peer_bitfield(&[0b1010_0000]);
        assert!(conn.peer_has_piece(0));
        assert!(!conn.peer_has_piece(1));
        assert!(conn.peer_has_piece(2));

        conn.set_peer_has_all();
        assert!(conn.peer_has_piece(1000));

        conn.set_peer_has_none();
        assert!(!conn.peer_has_piece(0));
    }

    #[test]
    fn cancel_posts_only_for_pending_requests() {
        let (mut conn, mut rx) = test_conn();
        let r = Request::new(1, 0, 16384);
        assert!(!conn.cancel_request(r));
        assert!(rx.try_recv().is_err());

        conn.requests.insert(r);
        assert!(conn.cancel_request(r));
        assert!(matches!(rx.try_recv().unwrap(), Message::Cancel { .. }));
    }
}
