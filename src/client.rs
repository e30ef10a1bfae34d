//! The client supervisor.
//!
//! One [`Client`] owns the listening sockets, the torrent map, the peer
//! identity, and the IP reputation tables. Every mutation of swarm state
//! happens under one coarse read-write lock; a single [`Notify`] doubles as
//! the condition broadcast that wakes waiters (accept loops, verifiers,
//! `wait_all`). The lock is explicitly released around blocking work:
//! message decodes, storage reads and writes, hashing, and dials.
//!
//! Tasks that run on behalf of a connection never hold references into the
//! state. They carry `(InfoHash, ConnId)` and re-look both up after every
//! lock acquisition, so a connection evicted mid-flight simply stops finding
//! itself and unwinds.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::time::timeout;
use tracing::{debug, trace, warn};

use crate::blocklist::{lookup_any, IpRange, Ranger};
use crate::config::Config;
use crate::conn::{Conn, ConnId, ConnStats, POST_QUEUE_CAPACITY};
use crate::event::Event;
use crate::metainfo::{InfoHash, Metainfo, MetainfoError};
use crate::mse::{probe_inbound, InboundProbe, MseError};
use crate::peer::extension::{
    ExtendedHandshake, OurHandshake, HANDSHAKE_SUB_ID, UT_METADATA, UT_METADATA_ID, UT_PEX_ID,
};
use crate::peer::message::{Message, Reserved};
use crate::peer::metadata::{metadata_piece_size, MetadataMessage, MetadataMsgType};
use crate::peer::transport::{self, BoxStream, MessageReader};
use crate::peer::{Bitfield, PeerError, PeerId};
use crate::pex::PexMessage;
use crate::piece::{self, Request};
use crate::storage::{FileStorage, StorageClient, StorageError};
use crate::torrent::{
    Peer, PeerSource, Torrent, TorrentError, TorrentSpec, HALF_OPEN_LIMIT, PEERS_HIGH_WATER,
    PER_TORRENT_CONN_LIMIT,
};
use crate::tracker::{AnnounceEvent, AnnounceRequest};

/// Baseline outbound dial timeout, scaled down under half-open pressure.
const NOMINAL_DIAL_TIMEOUT: Duration = Duration::from_secs(30);
const MIN_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Both handshakes (encryption and BitTorrent) must finish within this.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(20);

/// Request queue depth we advertise in the extended handshake.
const OUR_REQQ: u32 = 64;

const CLIENT_VERSION: &str = concat!("undertow ", env!("CARGO_PKG_VERSION"));

/// Fallback announce interval when a tracker round yields nothing.
const ANNOUNCE_RETRY: Duration = Duration::from_secs(300);
const MIN_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to listen: {0}")]
    Listen(io::Error),

    #[error("torrent spec has neither an info hash nor info bytes")]
    EmptySpec,

    #[error(transparent)]
    Torrent(#[from] TorrentError),

    #[error(transparent)]
    Metainfo(#[from] MetainfoError),
}

/// Everything guarded by the coarse lock.
struct ClientState {
    torrents: HashMap<InfoHash, Torrent>,
    /// Addresses that presented our own peer id when we dialed them.
    doppelganger_addrs: HashSet<SocketAddr>,
    /// Peers that produced data failing verification.
    bad_peer_ips: HashSet<IpAddr>,
    blocklist: Option<Arc<dyn Ranger>>,
}

struct Inner {
    cfg: Config,
    peer_id: PeerId,
    reserved: Reserved,
    listen_port: u16,
    default_storage: Arc<dyn StorageClient>,
    rate: Option<Arc<transport::RateLimiter>>,
    state: RwLock<ClientState>,
    /// Condition broadcast: notified on every observable state change.
    event: Notify,
    closed: Event,
    rng: parking_lot::Mutex<StdRng>,
    next_conn_id: AtomicU64,
    duplicate_clients: AtomicU64,
}

/// A BitTorrent swarm client.
///
/// Cheap to clone; all clones share one supervisor.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

/// What a dispatched message asks the connection loop to do next.
enum Dispatch {
    Continue,
    RunUpload,
    /// The torrent or connection no longer exists; unwind quietly.
    ConnGone,
}

impl Client {
    /// Binds listeners and starts the accept loops. Listener failure is
    /// fatal to construction.
    pub async fn new(cfg: Config) -> Result<Self, ClientError> {
        let mut rng = match cfg.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };
        let peer_id = match cfg.peer_id {
            Some(bytes) => PeerId::from_bytes(bytes),
            None => PeerId::generate(&mut rng),
        };

        let tcp = if cfg.disable_tcp {
            None
        } else {
            let addr = resolve_listen_addr(cfg.listen_addr_or_default());
            Some(
                TcpListener::bind(addr.as_str())
                    .await
                    .map_err(ClientError::Listen)?,
            )
        };
        let listen_port = tcp
            .as_ref()
            .and_then(|l| l.local_addr().ok())
            .map(|a| a.port())
            .unwrap_or(0);

        let default_storage: Arc<dyn StorageClient> = match &cfg.default_storage {
            Some(s) => s.clone(),
            None => Arc::new(FileStorage::new(cfg.data_dir.clone())),
        };

        let dht_active = cfg.dht.is_some() && !cfg.no_dht;
        let rate = cfg
            .upload_rate_kib
            .map(|kib| Arc::new(transport::RateLimiter::new(kib * 1024)));
        let blocklist = cfg.ip_blocklist.clone();
        let inner = Arc::new(Inner {
            peer_id,
            reserved: Reserved::ours(dht_active),
            listen_port,
            default_storage,
            rate,
            state: RwLock::new(ClientState {
                torrents: HashMap::new(),
                doppelganger_addrs: HashSet::new(),
                bad_peer_ips: HashSet::new(),
                blocklist,
            }),
            event: Notify::new(),
            closed: Event::new(),
            rng: parking_lot::Mutex::new(rng),
            next_conn_id: AtomicU64::new(1),
            duplicate_clients: AtomicU64::new(0),
            cfg,
        });
        let client = Client { inner };

        if let Some(listener) = tcp {
            let cl = client.clone();
            tokio::spawn(async move { cl.accept_loop_tcp(listener).await });
        }
        if !client.inner.cfg.disable_utp {
            if let Some(utp) = client.inner.cfg.utp.clone() {
                let cl = client.clone();
                tokio::spawn(async move { cl.accept_loop_utp(utp).await });
            }
        }
        Ok(client)
    }

    /// The identity advertised in every handshake for this client's life.
    pub fn peer_id(&self) -> PeerId {
        self.inner.peer_id
    }

    /// TCP listen port, or zero when not listening.
    pub fn listen_port(&self) -> u16 {
        self.inner.listen_port
    }

    /// Inbound handshakes rejected for reusing a live peer id.
    pub fn duplicate_client_conns(&self) -> u64 {
        self.inner.duplicate_clients.load(Ordering::Relaxed)
    }

    /// Stops the client: all torrents close and every task unwinds.
    pub async fn close(&self) {
        self.inner.closed.set();
        let mut state = self.inner.state.write().await;
        for t in state.torrents.values_mut() {
            t.close();
        }
        drop(state);
        self.broadcast();
    }

    fn broadcast(&self) {
        self.inner.event.notify_waiters();
    }

    // --- torrent lifecycle -------------------------------------------------

    /// Adds a torrent knowing only its info hash; the info dictionary will
    /// be fetched from peers. Returns the handle and whether it was new.
    pub async fn add_torrent_info_hash(&self, info_hash: InfoHash) -> (TorrentHandle, bool) {
        let spec = TorrentSpec {
            info_hash: Some(info_hash),
            ..Default::default()
        };
        // An info-hash-only spec cannot fail.
        self.add_torrent_spec(spec).await.expect("bare spec")
    }

    /// Adds or merges a torrent spec. Present torrents have their trackers
    /// merged and info set once; the display name is replaced if given.
    pub async fn add_torrent_spec(
        &self,
        spec: TorrentSpec,
    ) -> Result<(TorrentHandle, bool), ClientError> {
        let info_hash = match spec.info_hash {
            Some(ih) => ih,
            None => match &spec.info_bytes {
                Some(bytes) => InfoHash::from_info_bytes(bytes),
                None => return Err(ClientError::EmptySpec),
            },
        };

        let mut state = self.inner.state.write().await;
        let is_new = !state.torrents.contains_key(&info_hash);
        let t = state
            .torrents
            .entry(info_hash)
            .or_insert_with(|| Torrent::new(info_hash));

        if let Some(name) = spec.display_name {
            t.display_name = Some(name);
        }
        if is_new {
            if let Some(size) = spec.chunk_size {
                t.chunk_size = size;
            }
        }
        if let Some(bytes) = spec.info_bytes {
            let opener: Arc<dyn StorageClient> = spec
                .storage
                .unwrap_or_else(|| self.inner.default_storage.clone());
            t.set_info_bytes(bytes, opener.as_ref())?;
            self.on_info_set(info_hash, t);
        }
        t.add_trackers(&spec.trackers);
        drop(state);
        self.broadcast();

        if is_new {
            if self.inner.cfg.dht.is_some() && !self.inner.cfg.no_dht {
                let cl = self.clone();
                tokio::spawn(async move { cl.dht_announcer(info_hash).await });
            }
            if self.inner.cfg.tracker.is_some() && !self.inner.cfg.disable_trackers {
                let cl = self.clone();
                tokio::spawn(async move { cl.tracker_announcer(info_hash).await });
            }
        }

        Ok((
            TorrentHandle {
                client: self.clone(),
                info_hash,
            },
            is_new,
        ))
    }

    /// Adds a torrent from parsed metainfo.
    pub async fn add_torrent(&self, mi: &Metainfo) -> Result<TorrentHandle, ClientError> {
        let spec = TorrentSpec {
            info_hash: Some(mi.info_hash),
            info_bytes: Some(mi.raw_info().clone()),
            trackers: mi.tracker_tiers(),
            display_name: Some(mi.info.name.clone()),
            ..Default::default()
        };
        Ok(self.add_torrent_spec(spec).await?.0)
    }

    /// Adds a torrent from a magnet link.
    pub async fn add_magnet(&self, uri: &str) -> Result<TorrentHandle, ClientError> {
        let m = crate::metainfo::MagnetLink::parse(uri)?;
        let spec = TorrentSpec {
            info_hash: Some(m.info_hash),
            trackers: if m.trackers.is_empty() {
                Vec::new()
            } else {
                vec![m.trackers]
            },
            display_name: m.display_name,
            ..Default::default()
        };
        Ok(self.add_torrent_spec(spec).await?.0)
    }

    /// Adds a torrent from a `.torrent` file on disk.
    pub async fn add_torrent_file(&self, path: &Path) -> Result<TorrentHandle, ClientError> {
        let mi = Metainfo::load(path)?;
        self.add_torrent(&mi).await
    }

    /// Closes and removes one torrent.
    pub async fn drop_torrent(&self, info_hash: InfoHash) -> Result<(), ClientError> {
        let mut state = self.inner.state.write().await;
        let mut t = state
            .torrents
            .remove(&info_hash)
            .ok_or(TorrentError::NotFound)?;
        t.close();
        drop(state);
        self.broadcast();
        Ok(())
    }

    /// Closes and removes every torrent.
    pub async fn drop_all_torrents(&self) {
        let hashes: Vec<InfoHash> = {
            let state = self.inner.state.read().await;
            state.torrents.keys().copied().collect()
        };
        for ih in hashes {
            let _ = self.drop_torrent(ih).await;
        }
    }

    pub async fn has_torrent(&self, info_hash: InfoHash) -> bool {
        self.inner
            .state
            .read()
            .await
            .torrents
            .contains_key(&info_hash)
    }

    /// Blocks until every torrent has its info and all pieces complete.
    /// Returns `false` if the client closes first.
    pub async fn wait_all(&self) -> bool {
        loop {
            let notified = self.inner.event.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.inner.state.read().await;
                let done = state
                    .torrents
                    .values()
                    .all(|t| t.have_info() && t.num_pieces_completed() == t.num_pieces());
                if done {
                    return true;
                }
                if self.inner.closed.is_set() {
                    return false;
                }
            }
            notified.await;
        }
    }

    /// Installs (or clears) the IP blocklist, propagating it to the DHT.
    pub async fn set_ip_blocklist(&self, ranger: Option<Arc<dyn Ranger>>) {
        let mut state = self.inner.state.write().await;
        state.blocklist = ranger.clone();
        drop(state);
        if let Some(dht) = &self.inner.cfg.dht {
            dht.set_blocklist(ranger);
        }
    }

    pub async fn ip_blocklist(&self) -> Option<Arc<dyn Ranger>> {
        self.inner.state.read().await.blocklist.clone()
    }

    /// Feeds bootstrap nodes to the DHT, if one is configured.
    pub fn add_dht_nodes(&self, nodes: &[SocketAddr]) {
        let Some(dht) = &self.inner.cfg.dht else {
            return;
        };
        for addr in nodes {
            dht.add_node(*addr);
        }
    }

    /// Writes a human-readable status summary.
    pub async fn write_status<W: fmt::Write>(&self, w: &mut W) -> fmt::Result {
        let state = self.inner.state.read().await;
        if self.inner.listen_port != 0 {
            writeln!(w, "Listening on port {}", self.inner.listen_port)?;
        } else {
            writeln!(w, "Not listening!")?;
        }
        writeln!(w, "Peer ID: {}", self.inner.peer_id)?;
        writeln!(w, "Banned IPs: {}", state.bad_peer_ips.len())?;
        if let Some(dht) = &self.inner.cfg.dht {
            let s = dht.stats();
            writeln!(
                w,
                "DHT nodes: {} ({} good, {} banned)",
                s.nodes, s.good_nodes, s.banned_nodes
            )?;
            writeln!(w, "DHT announces: {}", s.confirmed_announces)?;
        }
        writeln!(w, "# Torrents: {}", state.torrents.len())?;
        let mut hashes: Vec<&InfoHash> = state.torrents.keys().collect();
        hashes.sort();
        for ih in hashes {
            let t = &state.torrents[ih];
            writeln!(w)?;
            writeln!(w, "{}", t.name().as_deref().unwrap_or("<unknown name>"))?;
            writeln!(w, "  info hash: {ih}")?;
            if t.have_info() {
                let total = t.info.as_ref().map_or(0, |i| i.total_length);
                let left = t.bytes_left();
                let pct = if total == 0 {
                    100.0
                } else {
                    100.0 * (1.0 - left as f64 / total as f64)
                };
                writeln!(w, "  {pct:.1}% of {total} bytes")?;
            } else {
                writeln!(w, "  <missing metainfo>")?;
            }
            writeln!(
                w,
                "  peers: {} candidates, {} half-open, {} connected",
                t.peers.len(),
                t.half_open.len(),
                t.conns.len()
            )?;
        }
        Ok(())
    }

    // --- address reputation ------------------------------------------------

    fn ip_block_range(state: &ClientState, ip: IpAddr) -> Option<IpRange> {
        let list = state.blocklist.as_ref()?;
        lookup_any(list.as_ref(), ip)
    }

    /// Zero port, doppelganger, banned, or blocklisted.
    fn addr_rejected(state: &ClientState, addr: SocketAddr) -> bool {
        addr.port() == 0
            || state.doppelganger_addrs.contains(&addr)
            || state.bad_peer_ips.contains(&addr.ip())
            || Self::ip_block_range(state, addr.ip()).is_some()
    }

    // --- peer admission and dialing ---------------------------------------

    /// Admits candidate peers and kicks the dialer.
    pub(crate) async fn add_peers(&self, info_hash: InfoHash, peers: Vec<Peer>) {
        let mut state = self.inner.state.write().await;
        let accepted: Vec<Peer> = peers
            .into_iter()
            .filter(|p| !Self::addr_rejected(&state, p.addr))
            .collect();
        match state.torrents.get_mut(&info_hash) {
            Some(t) => {
                for p in accepted {
                    t.add_peer(p);
                }
            }
            None => return,
        }
        self.open_new_conns_locked(&mut state, info_hash);
        drop(state);
        self.broadcast();
    }

    fn wants_conns(&self, t: &Torrent) -> bool {
        if t.closed.is_set() {
            return false;
        }
        if !t.needs_data() && !(self.inner.cfg.seed && t.seeding()) {
            return false;
        }
        t.conns.len() < PER_TORRENT_CONN_LIMIT || t.worst_bad_conn().is_some()
    }

    /// Dispatches dials for queued candidates up to the half-open cap.
    fn open_new_conns_locked(&self, state: &mut ClientState, info_hash: InfoHash) {
        loop {
            let peer = {
                let Some(t) = state.torrents.get_mut(&info_hash) else {
                    return;
                };
                if t.peers.is_empty()
                    || !self.wants_conns(t)
                    || t.half_open.len() >= HALF_OPEN_LIMIT
                {
                    return;
                }
                match t.pop_peer() {
                    Some(peer) => peer,
                    None => return,
                }
            };
            if state.doppelganger_addrs.contains(&peer.addr)
                || state.bad_peer_ips.contains(&peer.addr.ip())
            {
                continue;
            }
            let Some(t) = state.torrents.get_mut(&info_hash) else {
                return;
            };
            if t.addr_active(peer.addr) {
                continue;
            }
            t.half_open.insert(peer.addr);
            let cl = self.clone();
            tokio::spawn(async move {
                cl.outgoing_connection(info_hash, peer.addr, peer.source)
                    .await;
            });
        }
    }

    /// Dial timeout shrinks as the candidate queue grows.
    fn dial_timeout(pending_peers: usize) -> Duration {
        let scale = (pending_peers + HALF_OPEN_LIMIT) / HALF_OPEN_LIMIT;
        (NOMINAL_DIAL_TIMEOUT / scale as u32).max(MIN_DIAL_TIMEOUT)
    }

    /// Races TCP and uTP dials; first success wins, losers are drained and
    /// dropped in the background.
    async fn dial_first(&self, addr: SocketAddr, per_dial: Duration) -> Option<(BoxStream, bool)> {
        let (tx, mut rx) = mpsc::channel::<(Option<BoxStream>, bool)>(2);
        let mut left = 0usize;

        if !self.inner.cfg.disable_tcp {
            left += 1;
            let tx = tx.clone();
            tokio::spawn(async move {
                let res = timeout(per_dial, TcpStream::connect(addr)).await;
                let stream: Option<BoxStream> = match res {
                    Ok(Ok(s)) => Some(Box::new(s)),
                    _ => None,
                };
                let _ = tx.send((stream, false)).await;
            });
        }
        if !self.inner.cfg.disable_utp {
            if let Some(utp) = self.inner.cfg.utp.clone() {
                left += 1;
                let tx = tx.clone();
                tokio::spawn(async move {
                    let res = timeout(per_dial, utp.dial(addr)).await;
                    let stream = match res {
                        Ok(Ok(s)) => Some(s),
                        _ => None,
                    };
                    let _ = tx.send((stream, true)).await;
                });
            }
        }
        drop(tx);

        while left > 0 {
            let (stream, utp) = rx.recv().await?;
            left -= 1;
            if let Some(stream) = stream {
                if left > 0 {
                    // Losing dials are closed as they complete.
                    tokio::spawn(async move { while rx.recv().await.is_some() {} });
                }
                return Some((stream, utp));
            }
        }
        None
    }

    /// Runs one outbound connection from dial to loop exit. The address is
    /// already in the torrent's half-open set.
    async fn outgoing_connection(&self, info_hash: InfoHash, addr: SocketAddr, source: PeerSource) {
        let result = self.establish_outgoing(info_hash, addr).await;

        {
            let mut state = self.inner.state.write().await;
            if let Some(t) = state.torrents.get_mut(&info_hash) {
                let was_half_open = t.half_open.remove(&addr);
                debug_assert!(
                    was_half_open || t.closed.is_set(),
                    "dialed address missing from half-open set"
                );
            }
            self.open_new_conns_locked(&mut state, info_hash);
        }
        self.broadcast();

        match result {
            Err(e) => {
                if self.inner.cfg.debug {
                    debug!(%addr, error = %e, "outgoing connection failed");
                }
            }
            Ok(None) => {}
            Ok(Some((outcome, stream, utp, encrypted))) => {
                self.run_handshook_conn(
                    info_hash, outcome, stream, addr, source, utp, encrypted, true,
                )
                .await;
            }
        }
    }

    /// Dials and handshakes. Encrypted first unless disabled; on an MSE
    /// failure other than a secret mismatch, retried in plaintext over the
    /// transport that won the race.
    async fn establish_outgoing(
        &self,
        info_hash: InfoHash,
        addr: SocketAddr,
    ) -> Result<Option<(transport::HandshakeOutcome, BoxStream, bool, bool)>, PeerError> {
        let pending = {
            let state = self.inner.state.read().await;
            state
                .torrents
                .get(&info_hash)
                .map(|t| t.peers.len())
                .unwrap_or(0)
        };
        let per_dial = Self::dial_timeout(pending);
        let Some((stream, utp)) = self.dial_first(addr, per_dial).await else {
            return Ok(None);
        };

        let mse = if self.inner.cfg.disable_encryption {
            None
        } else {
            self.inner.cfg.mse.clone()
        };
        let Some(mse) = mse else {
            let hs = self.initiator_handshake(info_hash, stream).await?;
            return Ok(hs.map(|(o, s)| (o, s, utp, false)));
        };

        match timeout(HANDSHAKE_TIMEOUT, mse.initiate(stream, info_hash.0)).await {
            Ok(Ok(enc_stream)) => {
                let hs = self.initiator_handshake(info_hash, enc_stream).await?;
                Ok(hs.map(|(o, s)| (o, s, utp, true)))
            }
            Ok(Err(MseError::NoSecretMatch)) => Ok(None),
            Ok(Err(_)) | Err(_) => {
                // Plaintext retry on whichever transport connected before.
                let retry: Option<BoxStream> = if utp {
                    match self.inner.cfg.utp.clone() {
                        Some(socket) => timeout(per_dial, socket.dial(addr))
                            .await
                            .ok()
                            .and_then(|r| r.ok()),
                        None => None,
                    }
                } else {
                    timeout(per_dial, TcpStream::connect(addr))
                        .await
                        .ok()
                        .and_then(|r| r.ok())
                        .map(|s| Box::new(s) as BoxStream)
                };
                let Some(stream) = retry else { return Ok(None) };
                let hs = self.initiator_handshake(info_hash, stream).await?;
                Ok(hs.map(|(o, s)| (o, s, utp, false)))
            }
        }
    }

    async fn initiator_handshake(
        &self,
        info_hash: InfoHash,
        stream: BoxStream,
    ) -> Result<Option<(transport::HandshakeOutcome, BoxStream)>, PeerError> {
        let result = timeout(
            HANDSHAKE_TIMEOUT,
            transport::wire_handshake(
                stream,
                Some(info_hash.0),
                self.inner.peer_id.0,
                self.inner.reserved,
            ),
        )
        .await
        .map_err(|_| PeerError::Timeout)??;
        // A peer answering for a different torrent is not kept.
        Ok(result.filter(|(outcome, _)| outcome.info_hash == info_hash.0))
    }

    /// Drives an outbound session on an already-connected stream. Used by
    /// tests with loopback transports.
    #[cfg_attr(not(test), allow(dead_code))]
    pub(crate) async fn initiate_on_stream(
        &self,
        info_hash: InfoHash,
        stream: BoxStream,
        addr: SocketAddr,
        source: PeerSource,
    ) {
        match self.initiator_handshake(info_hash, stream).await {
            Err(e) => {
                if self.inner.cfg.debug {
                    debug!(%addr, error = %e, "handshake failed");
                }
            }
            Ok(None) => {}
            Ok(Some((outcome, stream))) => {
                self.run_handshook_conn(
                    info_hash, outcome, stream, addr, source, false, false, true,
                )
                .await;
            }
        }
    }

    // --- accepting ---------------------------------------------------------

    async fn accept_loop_tcp(&self, listener: TcpListener) {
        loop {
            if !self.wait_accept().await {
                return;
            }
            let accepted = tokio::select! {
                res = listener.accept() => res,
                _ = self.inner.closed.wait() => return,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let cl = self.clone();
                    tokio::spawn(async move {
                        cl.handle_incoming(Box::new(stream), addr, false).await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "tcp accept failed");
                    return;
                }
            }
        }
    }

    async fn accept_loop_utp(&self, utp: Arc<dyn crate::utp::UtpSocket>) {
        loop {
            if !self.wait_accept().await {
                return;
            }
            let accepted = tokio::select! {
                res = utp.accept() => res,
                _ = self.inner.closed.wait() => return,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let cl = self.clone();
                    tokio::spawn(async move {
                        cl.handle_incoming(stream, addr, true).await;
                    });
                }
                Err(e) => {
                    warn!(error = %e, "utp accept failed");
                    return;
                }
            }
        }
    }

    /// Blocks until some torrent wants connections; `false` when closing.
    async fn wait_accept(&self) -> bool {
        loop {
            let notified = self.inner.event.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                if self.inner.closed.is_set() {
                    return false;
                }
                let state = self.inner.state.read().await;
                if state.torrents.values().any(|t| self.wants_conns(t)) {
                    return true;
                }
            }
            notified.await;
        }
    }

    /// Receiver path: the peer tells us which torrent it wants.
    pub(crate) async fn handle_incoming(&self, stream: BoxStream, addr: SocketAddr, utp: bool) {
        {
            let state = self.inner.state.read().await;
            if Self::addr_rejected(&state, addr) {
                trace!(%addr, "rejected inbound connection");
                return;
            }
        }
        match timeout(HANDSHAKE_TIMEOUT, self.receive_handshakes(stream)).await {
            Err(_) | Ok(Err(_)) | Ok(Ok(None)) => {}
            Ok(Ok(Some((info_hash, outcome, stream, encrypted)))) => {
                if outcome.peer_id == self.inner.peer_id.0 {
                    // A connect-back to ourselves; the initiator records the
                    // doppelganger, not us.
                    return;
                }
                self.run_handshook_conn(
                    info_hash,
                    outcome,
                    stream,
                    addr,
                    PeerSource::Incoming,
                    utp,
                    encrypted,
                    false,
                )
                .await;
            }
        }
    }

    /// Optional MSE receive, then the BitTorrent handshake, then torrent
    /// lookup by the peer's declared info hash.
    async fn receive_handshakes(
        &self,
        stream: BoxStream,
    ) -> Result<Option<(InfoHash, transport::HandshakeOutcome, BoxStream, bool)>, PeerError> {
        let mse = if self.inner.cfg.disable_encryption {
            None
        } else {
            self.inner.cfg.mse.clone()
        };

        let (stream, encrypted) = match mse {
            None => (stream, false),
            Some(mse) => match probe_inbound(stream).await? {
                InboundProbe::Plaintext(s) => (s, false),
                InboundProbe::Encrypted(s) => {
                    let skeys: Vec<[u8; 20]> = {
                        let state = self.inner.state.read().await;
                        state.torrents.keys().map(|ih| ih.0).collect()
                    };
                    match mse.receive(s, skeys).await {
                        Ok((s, _matched)) => (s, true),
                        // No matching torrent is a valid quiet ending.
                        Err(MseError::NoSecretMatch) => return Ok(None),
                        Err(MseError::Io(e)) => return Err(e.into()),
                        Err(e) => {
                            debug!(error = %e, "inbound encryption handshake failed");
                            return Ok(None);
                        }
                    }
                }
            },
        };

        let Some((outcome, stream)) = transport::wire_handshake(
            stream,
            None,
            self.inner.peer_id.0,
            self.inner.reserved,
        )
        .await?
        else {
            return Ok(None);
        };

        let info_hash = InfoHash(outcome.info_hash);
        let known = self
            .inner
            .state
            .read()
            .await
            .torrents
            .contains_key(&info_hash);
        if !known {
            return Ok(None);
        }
        Ok(Some((info_hash, outcome, stream, encrypted)))
    }

    // --- running a session -------------------------------------------------

    /// Registers the connection, spawns its writer, sends the opening
    /// message volley, and runs the read loop to completion.
    #[allow(clippy::too_many_arguments)]
    async fn run_handshook_conn(
        &self,
        info_hash: InfoHash,
        outcome: transport::HandshakeOutcome,
        stream: BoxStream,
        addr: SocketAddr,
        source: PeerSource,
        utp: bool,
        encrypted: bool,
        initiated: bool,
    ) {
        if outcome.peer_id == self.inner.peer_id.0 {
            if initiated {
                let mut state = self.inner.state.write().await;
                state.doppelganger_addrs.insert(addr);
            }
            return;
        }
        let peer_id = PeerId::from_bytes(outcome.peer_id);
        let cid = ConnId(self.inner.next_conn_id.fetch_add(1, Ordering::Relaxed));
        let (read_half, write_half) = tokio::io::split(stream);
        let (post_tx, post_rx) = mpsc::channel(POST_QUEUE_CAPACITY);
        let conn = Conn::new(
            cid,
            addr,
            peer_id,
            outcome.reserved,
            source,
            utp,
            encrypted,
            post_tx,
        );
        let conn_closed = conn.closed.clone();

        {
            let mut state = self.inner.state.write().await;
            if self.inner.closed.is_set() {
                return;
            }
            let Some(t) = state.torrents.get_mut(&info_hash) else {
                return;
            };
            if t.closed.is_set() || !self.wants_conns(t) {
                return;
            }
            if t.conns.values().any(|c| c.peer_id == peer_id) {
                self.inner.duplicate_clients.fetch_add(1, Ordering::Relaxed);
                return;
            }
            if t.conns.len() >= PER_TORRENT_CONN_LIMIT {
                match t.worst_bad_conn() {
                    Some(worst) => {
                        debug!(?worst, "evicting connection to make room");
                        t.drop_connection(worst);
                    }
                    None => return,
                }
            }
            t.conns.insert(cid, conn);
            self.send_initial_messages(t, cid);
        }
        self.broadcast();

        let rate = self.inner.rate.clone();
        let writer = tokio::spawn(transport::run_writer(write_half, post_rx, rate));

        if self.inner.cfg.debug {
            debug!(%addr, ?peer_id, "running connection");
        }
        let result = self
            .connection_loop(info_hash, cid, MessageReader::new(read_half), conn_closed)
            .await;
        if let Err(e) = result {
            if self.inner.cfg.debug {
                debug!(%addr, error = %e, "connection loop ended");
            }
        }

        {
            let mut state = self.inner.state.write().await;
            if let Some(t) = state.torrents.get_mut(&info_hash) {
                t.drop_connection(cid);
                self.open_new_conns_locked(&mut state, info_hash);
            }
        }
        self.broadcast();
        // The post queue is gone with the conn; the writer drains and exits.
        let _ = writer.await;
    }

    /// The opening volley: extended handshake, then possession, then our
    /// DHT port. Caller holds the write lock.
    fn send_initial_messages(&self, t: &mut Torrent, cid: ConnId) {
        let metadata_size = t.metadata_size();
        let have_any = t.have_any_pieces();
        let bitfield = if have_any {
            Some(t.bitfield().to_wire())
        } else {
            None
        };
        let Some(c) = t.conns.get_mut(&cid) else {
            return;
        };

        if c.peer_reserved.supports_extended() && self.inner.reserved.supports_extended() {
            let ours = OurHandshake {
                client_version: CLIENT_VERSION.to_string(),
                reqq: OUR_REQQ,
                pex: !self.inner.cfg.disable_pex,
                encryption: !self.inner.cfg.disable_encryption,
                metadata_size,
                port: (self.inner.listen_port != 0).then_some(self.inner.listen_port),
                yourip: Some(compact_ip(c.remote.ip())),
            };
            match ours.encode() {
                Ok(payload) => c.post(Message::Extended {
                    id: HANDSHAKE_SUB_ID,
                    payload,
                }),
                Err(e) => warn!(error = %e, "failed to encode extended handshake"),
            }
        }
        if let Some(bits) = bitfield {
            c.post(Message::Bitfield(bits));
        } else if self.inner.reserved.supports_fast() && c.peer_reserved.supports_fast() {
            c.post(Message::HaveNone);
        }
        if self.inner.reserved.supports_dht() && c.peer_reserved.supports_dht() {
            if let Some(dht) = &self.inner.cfg.dht {
                if !self.inner.cfg.no_dht {
                    c.post(Message::Port(dht.port()));
                }
            }
        }
    }

    /// Decodes and dispatches messages until the connection dies. The lock
    /// is released across every decode and reacquired for dispatch.
    async fn connection_loop<R: tokio::io::AsyncRead + Unpin>(
        &self,
        info_hash: InfoHash,
        cid: ConnId,
        mut reader: MessageReader<R>,
        conn_closed: Event,
    ) -> Result<(), PeerError> {
        loop {
            let msg = tokio::select! {
                msg = reader.next_message() => match msg {
                    Ok(msg) => msg,
                    Err(PeerError::Closed) => return Ok(()),
                    Err(e) => return Err(e),
                },
                _ = conn_closed.wait() => return Ok(()),
            };
            if self.inner.closed.is_set() {
                return Ok(());
            }
            match self.dispatch(info_hash, cid, msg).await? {
                Dispatch::Continue => {}
                Dispatch::RunUpload => self.upload(info_hash, cid).await?,
                Dispatch::ConnGone => return Ok(()),
            }
        }
    }

    /// Handles one decoded message under the lock.
    async fn dispatch(
        &self,
        info_hash: InfoHash,
        cid: ConnId,
        msg: Message,
    ) -> Result<Dispatch, PeerError> {
        // The chunk-arrival path manages its own locking.
        let msg = match msg {
            Message::Piece { index, begin, data } => {
                return self
                    .downloaded_chunk(info_hash, cid, index, begin, data)
                    .await;
            }
            other => other,
        };

        let quirky_sender = matches!(msg, Message::Extended { .. });
        let mut run_upload = false;

        let mut state = self.inner.state.write().await;
        let quirky = {
            let Some(t) = state.torrents.get_mut(&info_hash) else {
                return Ok(Dispatch::ConnGone);
            };
            if t.closed.is_set() {
                return Ok(Dispatch::ConnGone);
            }
            let Some(c) = t.conns.get_mut(&cid) else {
                return Ok(Dispatch::ConnGone);
            };
            c.last_message_received = Instant::now();
            quirky_sender && c.peer_id.uses_own_extension_ids()
        };

        let result = self.dispatch_locked(&mut state, info_hash, cid, msg, &mut run_upload);
        drop(state);
        self.broadcast();

        match result {
            Ok(()) => Ok(if run_upload {
                Dispatch::RunUpload
            } else {
                Dispatch::Continue
            }),
            Err(e) if quirky => {
                // Two client families misnumber their outbound extension
                // messages; their garbage is a clean goodbye, not a
                // violation.
                debug!(error = %e, "closing on malformed extended message from known-buggy client");
                Ok(Dispatch::ConnGone)
            }
            Err(e) => Err(e),
        }
    }

    /// The dispatch table proper. Caller verified torrent and connection
    /// exist; every arm re-borrows what it needs.
    fn dispatch_locked(
        &self,
        state: &mut ClientState,
        info_hash: InfoHash,
        cid: ConnId,
        msg: Message,
        run_upload: &mut bool,
    ) -> Result<(), PeerError> {
        let Some(t) = state.torrents.get_mut(&info_hash) else {
            return Ok(());
        };
        match msg {
            Message::KeepAlive | Message::Piece { .. } => {}
            Message::Choke => {
                if let Some(c) = t.conns.get_mut(&cid) {
                    c.peer_choking = true;
                    // The peer may discard anything we had in flight.
                    c.clear_requests();
                }
                t.update_requests(cid);
            }
            Message::Unchoke => {
                if let Some(c) = t.conns.get_mut(&cid) {
                    c.peer_choking = false;
                }
                t.update_requests(cid);
            }
            Message::Interested => {
                if let Some(c) = t.conns.get_mut(&cid) {
                    c.peer_interested = true;
                }
                *run_upload = true;
            }
            Message::NotInterested => {
                if let Some(c) = t.conns.get_mut(&cid) {
                    c.peer_interested = false;
                    c.choke();
                }
            }
            Message::Have(index) => {
                if t.have_info() && index as usize >= t.num_pieces() {
                    return Err(PeerError::protocol(format!(
                        "have for invalid piece {index}"
                    )));
                }
                if let Some(c) = t.conns.get_mut(&cid) {
                    c.record_peer_has(index as usize);
                }
                t.update_requests(cid);
            }
            Message::Bitfield(bits) => {
                if t.have_info() && Bitfield::from_wire(&bits, t.num_pieces()).is_none() {
                    return Err(PeerError::protocol("bitfield length mismatch"));
                }
                if let Some(c) = t.conns.get_mut(&cid) {
                    c.set_peer_bitfield(&bits);
                }
                t.update_requests(cid);
            }
            Message::HaveAll => {
                if let Some(c) = t.conns.get_mut(&cid) {
                    c.set_peer_has_all();
                }
                t.update_requests(cid);
            }
            Message::HaveNone => {
                if let Some(c) = t.conns.get_mut(&cid) {
                    c.set_peer_has_none();
                }
                t.update_requests(cid);
            }
            Message::Request {
                index,
                begin,
                length,
            } => {
                if length == 0 {
                    return Err(PeerError::protocol("zero-length request"));
                }
                let (am_choking, peer_interested) = match t.conns.get(&cid) {
                    Some(c) => (c.am_choking, c.peer_interested),
                    None => return Ok(()),
                };
                if am_choking {
                    return Err(PeerError::protocol("request while choked"));
                }
                if !peer_interested {
                    return Err(PeerError::protocol("request without interest"));
                }
                let valid_range = t.info.as_ref().is_some_and(|i| {
                    (index as usize) < i.num_pieces()
                        && begin as u64 + length as u64 <= i.piece_len(index as usize)
                });
                if !valid_range {
                    return Err(PeerError::protocol("request outside piece bounds"));
                }
                if !t.have_piece(index as usize) {
                    // We may have dropped the piece; not the peer's fault.
                    return Ok(());
                }
                let r = Request::new(index, begin, length);
                if let Some(c) = t.conns.get_mut(&cid) {
                    if !c.peer_requests.contains(&r) {
                        c.peer_requests.push(r);
                    }
                }
                *run_upload = true;
            }
            Message::Cancel {
                index,
                begin,
                length,
            } => {
                let r = Request::new(index, begin, length);
                if let Some(c) = t.conns.get_mut(&cid) {
                    match c.peer_requests.iter().position(|&q| q == r) {
                        Some(pos) => {
                            c.peer_requests.remove(pos);
                        }
                        None => c.stats.unexpected_cancels += 1,
                    }
                }
            }
            Message::Reject {
                index,
                begin,
                length,
            } => {
                if let Some(c) = t.conns.get_mut(&cid) {
                    c.delete_request(Request::new(index, begin, length));
                }
                t.update_requests(cid);
            }
            Message::Port(port) => {
                let remote_ip = match t.conns.get(&cid) {
                    Some(c) => c.remote.ip(),
                    None => return Ok(()),
                };
                if let Some(dht) = &self.inner.cfg.dht {
                    if !self.inner.cfg.no_dht && port != 0 {
                        dht.ping(SocketAddr::new(remote_ip, port));
                    }
                }
            }
            Message::Extended { id, payload } => {
                self.handle_extended(t, cid, id, &payload, run_upload)?;
            }
        }
        Ok(())
    }

    /// Extended-message dispatch: sub-handshake, `ut_metadata`, `ut_pex`.
    fn handle_extended(
        &self,
        t: &mut Torrent,
        cid: ConnId,
        id: u8,
        payload: &[u8],
        run_upload: &mut bool,
    ) -> Result<(), PeerError> {
        match id {
            HANDSHAKE_SUB_ID => {
                let hs = ExtendedHandshake::decode(payload)?;
                if let Some(size) = hs.metadata_size {
                    t.set_metadata_size(size)
                        .map_err(|e| PeerError::protocol(e.to_string()))?;
                }
                let supports_metadata = {
                    let Some(c) = t.conns.get_mut(&cid) else {
                        return Ok(());
                    };
                    c.peer_extension_ids.extend(hs.extensions);
                    if let Some(reqq) = hs.reqq {
                        // Clamped so a regeneration burst always fits the
                        // post queue.
                        c.peer_reqq = (reqq as usize).clamp(1, 500);
                    }
                    if let Some(v) = hs.client_version {
                        c.peer_client_name = Some(v);
                    }
                    c.supports_extension(UT_METADATA)
                };
                if supports_metadata {
                    self.request_pending_metadata(t, cid)?;
                }
                Ok(())
            }
            UT_METADATA_ID => self.handle_metadata_msg(t, cid, payload, run_upload),
            UT_PEX_ID => {
                if self.inner.cfg.disable_pex {
                    return Ok(());
                }
                let pex = PexMessage::decode(payload)?;
                let peers: Vec<Peer> = pex
                    .added
                    .into_iter()
                    .map(|(addr, flags)| Peer {
                        addr: SocketAddr::V4(addr),
                        source: PeerSource::Pex,
                        supports_encryption: flags.encryption,
                    })
                    .collect();
                let info_hash = t.info_hash;
                let cl = self.clone();
                // The lock is held here; admit the batch from a fresh task.
                tokio::spawn(async move { cl.add_peers(info_hash, peers).await });
                Ok(())
            }
            other => Err(PeerError::protocol(format!(
                "unexpected extended message id {other}"
            ))),
        }
    }

    /// `ut_metadata` request/data/reject handling.
    fn handle_metadata_msg(
        &self,
        t: &mut Torrent,
        cid: ConnId,
        payload: &[u8],
        run_upload: &mut bool,
    ) -> Result<(), PeerError> {
        let msg = MetadataMessage::decode(payload)?;
        match msg.msg_type {
            MetadataMsgType::Request => {
                let piece = msg.piece as usize;
                let reply = if t.have_metadata_piece(piece) {
                    let data = t
                        .metadata_piece_data(piece)
                        .ok_or_else(|| PeerError::protocol("metadata piece vanished"))?;
                    let total = t.metadata_size().unwrap_or(0);
                    MetadataMessage::data(msg.piece, total, data)
                } else {
                    MetadataMessage::reject(msg.piece)
                };
                let payload = reply.encode()?;
                if let Some(c) = t.conns.get_mut(&cid) {
                    // Outbound metadata messages use the ID the peer
                    // advertised for the extension.
                    if let Some(ext_id) = c.extension_id(UT_METADATA) {
                        c.post(Message::Extended {
                            id: ext_id,
                            payload,
                        });
                    }
                }
                Ok(())
            }
            MetadataMsgType::Data => {
                let piece = msg.piece as usize;
                {
                    let Some(c) = t.conns.get(&cid) else {
                        return Ok(());
                    };
                    if !c.requested_metadata_piece(piece) {
                        return Err(PeerError::protocol(format!(
                            "unrequested metadata piece {piece}"
                        )));
                    }
                }
                if let Some(total) = msg.total_size {
                    t.set_metadata_size(total)
                        .map_err(|e| PeerError::protocol(e.to_string()))?;
                }
                let total = t
                    .metadata_size()
                    .ok_or_else(|| PeerError::protocol("metadata data before size"))?;
                let expected = metadata_piece_size(total, msg.piece);
                // The data offset inside the payload is implied by its
                // size; anything else is out of range.
                if expected == 0 || msg.data.len() != expected {
                    return Err(PeerError::protocol("metadata piece has bad offset"));
                }
                t.save_metadata_piece(piece, &msg.data);
                if let Some(c) = t.conns.get_mut(&cid) {
                    c.stats.useful_chunks_received += 1;
                    c.last_useful_chunk_received = Some(Instant::now());
                }
                match t.maybe_metadata_completed() {
                    Some(bytes) => {
                        let opener = self.inner.default_storage.clone();
                        t.set_info_bytes(bytes, opener.as_ref())
                            .map_err(|e| PeerError::protocol(e.to_string()))?;
                        let info_hash = t.info_hash;
                        self.on_info_set(info_hash, t);
                        *run_upload = true;
                    }
                    None => {
                        // A hash mismatch resets the accumulation entirely;
                        // kick the fetch off again on this connection.
                        if t.missing_metadata_pieces().len()
                            == crate::peer::metadata::metadata_num_pieces(total)
                        {
                            self.request_pending_metadata(t, cid)?;
                        }
                    }
                }
                Ok(())
            }
            MetadataMsgType::Reject => Ok(()),
        }
    }

    /// Asks a metadata-capable peer for every piece we are missing.
    fn request_pending_metadata(&self, t: &mut Torrent, cid: ConnId) -> Result<(), PeerError> {
        if t.have_info() {
            return Ok(());
        }
        let missing = t.missing_metadata_pieces();
        let Some(c) = t.conns.get_mut(&cid) else {
            return Ok(());
        };
        let Some(ext_id) = c.extension_id(UT_METADATA) else {
            return Ok(());
        };
        for piece in missing {
            if c.requested_metadata_piece(piece) {
                continue;
            }
            c.mark_metadata_requested(piece);
            c.post(Message::Extended {
                id: ext_id,
                payload: MetadataMessage::request(piece as u32).encode()?,
            });
        }
        Ok(())
    }

    /// Triggered when a torrent's info dictionary becomes known: start the
    /// integrity scan and regenerate every connection's requests.
    fn on_info_set(&self, info_hash: InfoHash, t: &mut Torrent) {
        for index in 0..t.num_pieces() {
            self.queue_first_hash(info_hash, t, index);
        }
        let ids: Vec<ConnId> = t.conns.keys().copied().collect();
        for cid in ids {
            t.update_requests(cid);
        }
    }

    // --- chunk arrival (the download path) ---------------------------------

    /// Handles a Piece message: request bookkeeping, the reciprocal upload
    /// pass, duplicate-request cancellation, then the storage write with
    /// the lock released, then completion checks.
    async fn downloaded_chunk(
        &self,
        info_hash: InfoHash,
        cid: ConnId,
        index: u32,
        begin: u32,
        data: Bytes,
    ) -> Result<Dispatch, PeerError> {
        let r = Request::new(index, begin, data.len() as u32);

        // Request bookkeeping and want-check.
        {
            let mut state = self.inner.state.write().await;
            let Some(t) = state.torrents.get_mut(&info_hash) else {
                return Ok(Dispatch::ConnGone);
            };
            if t.closed.is_set() {
                return Ok(Dispatch::ConnGone);
            }
            {
                let Some(c) = t.conns.get_mut(&cid) else {
                    return Ok(Dispatch::ConnGone);
                };
                c.last_message_received = Instant::now();
            }

            let valid = t.info.as_ref().is_some_and(|i| {
                (index as usize) < i.num_pieces()
                    && begin as u64 + data.len() as u64 <= i.piece_len(index as usize)
            });
            if !valid {
                return Err(PeerError::protocol("piece outside bounds"));
            }

            {
                let c = t.conns.get_mut(&cid).expect("present above");
                if !c.delete_request(r) {
                    c.stats.unexpected_chunks_received += 1;
                }
            }

            if !t.want_chunk(r) {
                if let Some(c) = t.conns.get_mut(&cid) {
                    c.stats.unwanted_chunks_received += 1;
                }
                // Keep the pipeline moving even for discarded data.
                t.update_requests(cid);
                drop(state);
                self.broadcast();
                return Ok(Dispatch::Continue);
            }

            let c = t.conns.get_mut(&cid).expect("present above");
            c.stats.useful_chunks_received += 1;
            c.last_useful_chunk_received = Some(Instant::now());
        }

        // Reciprocity: the peer just fed us, consider feeding it.
        self.upload(info_hash, cid).await?;

        // Mark the chunk in flight and cancel duplicates elsewhere.
        let (storage, offset, chunk) = {
            let mut state = self.inner.state.write().await;
            let Some(t) = state.torrents.get_mut(&info_hash) else {
                return Ok(Dispatch::ConnGone);
            };
            if t.closed.is_set() || index as usize >= t.pieces.len() {
                return Ok(Dispatch::ConnGone);
            }

            let chunk = piece::chunk_index(begin, t.chunk_size);
            {
                let p = &mut t.pieces[index as usize];
                p.pending_writes += 1;
                p.clear_dirty(chunk);
            }

            let others: Vec<ConnId> = t
                .conns
                .keys()
                .copied()
                .filter(|&other| other != cid)
                .collect();
            for other in others {
                let cancelled = t
                    .conns
                    .get_mut(&other)
                    .map(|c| c.cancel_request(r))
                    .unwrap_or(false);
                if cancelled {
                    t.update_requests(other);
                }
            }
            t.update_requests(cid);

            let Some(storage) = t.storage.clone() else {
                return Ok(Dispatch::ConnGone);
            };
            let offset = t
                .info
                .as_ref()
                .map(|i| i.piece_offset(index as usize) + begin as u64)
                .unwrap_or(0);
            (storage, offset, chunk)
        };

        // The write happens with the lock released.
        let write_result = storage.write_at(&data, offset);

        {
            let mut state = self.inner.state.write().await;
            let Some(t) = state.torrents.get_mut(&info_hash) else {
                return Ok(Dispatch::ConnGone);
            };
            if index as usize >= t.pieces.len() {
                return Ok(Dispatch::ConnGone);
            }
            {
                let p = &mut t.pieces[index as usize];
                p.pending_writes = p.pending_writes.saturating_sub(1);
            }

            if let Err(e) = write_result {
                warn!(piece = index, error = %e, "chunk write failed; re-pending");
                t.pieces[index as usize].set_dirty(chunk);
                let ids: Vec<ConnId> = t.conns.keys().copied().collect();
                for other in ids {
                    t.update_requests(other);
                }
            } else {
                if t.pieces[index as usize].all_chunks_clean() {
                    self.queue_piece_check(info_hash, t, index as usize);
                }
                if let Some(c) = t.conns.get_mut(&cid) {
                    c.touched_pieces.insert(index);
                }
            }
        }
        self.broadcast();
        Ok(Dispatch::Continue)
    }

    // --- uploading ---------------------------------------------------------

    /// The upload pass: serve queued peer requests while the reciprocation
    /// window (or seeding) allows, choke when it closes.
    pub(crate) async fn upload(&self, info_hash: InfoHash, cid: ConnId) -> Result<(), PeerError> {
        if self.inner.cfg.no_upload {
            return Ok(());
        }
        loop {
            // Select the next request to serve under the lock.
            let (r, storage, offset) = {
                let mut state = self.inner.state.write().await;
                let Some(t) = state.torrents.get_mut(&info_hash) else {
                    return Ok(());
                };
                let window_open = {
                    let Some(c) = t.conns.get(&cid) else {
                        return Ok(());
                    };
                    if !c.peer_interested {
                        return Ok(());
                    }
                    let seeding = t.seeding();
                    if !seeding && !t.conn_has_wanted_pieces(c) {
                        return Ok(());
                    }
                    seeding || c.stats.chunks_sent < c.stats.useful_chunks_received + 6
                };
                let Some(c) = t.conns.get_mut(&cid) else {
                    return Ok(());
                };
                if !window_open {
                    // The reciprocation surplus is spent.
                    c.choke();
                    return Ok(());
                }
                c.unchoke();
                let Some(&r) = c.peer_requests.first() else {
                    return Ok(());
                };
                let Some(storage) = t.storage.clone() else {
                    return Ok(());
                };
                let offset = t
                    .info
                    .as_ref()
                    .map(|i| i.piece_offset(r.index as usize) + r.begin as u64)
                    .unwrap_or(0);
                (r, storage, offset)
            };

            // Read the chunk with the lock released.
            let mut buf = vec![0u8; r.length as usize];
            let read_result = storage.read_at(&mut buf, offset);

            let mut state = self.inner.state.write().await;
            let Some(t) = state.torrents.get_mut(&info_hash) else {
                return Ok(());
            };
            match read_result {
                Err(e) => {
                    let transitioned = !t.piece_complete(r.index as usize);
                    let unexpected_eof = matches!(
                        &e,
                        StorageError::Io(io) if io.kind() == io::ErrorKind::UnexpectedEof
                    );
                    if transitioned && unexpected_eof {
                        // We had the piece, but not anymore. Choke so the
                        // peer flushes its queue and re-asks later.
                        debug!(request = ?r, "piece vanished under an upload; choking");
                        if let Some(c) = t.conns.get_mut(&cid) {
                            c.choke();
                        }
                        return Ok(());
                    }
                    warn!(request = ?r, error = %e, "chunk read failed");
                    return Err(PeerError::protocol(format!(
                        "failed reading chunk for upload: {e}"
                    )));
                }
                Ok(()) => {
                    let Some(c) = t.conns.get_mut(&cid) else {
                        return Ok(());
                    };
                    // The request may have been cancelled while we read.
                    if let Some(pos) = c.peer_requests.iter().position(|&q| q == r) {
                        c.peer_requests.remove(pos);
                        c.post(Message::Piece {
                            index: r.index,
                            begin: r.begin,
                            data: buf.into(),
                        });
                        c.stats.chunks_sent += 1;
                    }
                }
            }
        }
    }

    // --- verification ------------------------------------------------------

    /// Queues a verification task for a piece unless one is queued already.
    fn queue_piece_check(&self, info_hash: InfoHash, t: &mut Torrent, index: usize) {
        let p = &mut t.pieces[index];
        if p.queued_for_hash {
            return;
        }
        p.queued_for_hash = true;
        let cl = self.clone();
        tokio::spawn(async move { cl.verify_piece(info_hash, index).await });
    }

    /// Queues the startup integrity check for a piece that has never been
    /// hashed.
    fn queue_first_hash(&self, info_hash: InfoHash, t: &mut Torrent, index: usize) {
        let p = &t.pieces[index];
        if p.ever_hashed || p.hashing || p.queued_for_hash || t.piece_complete(index) {
            return;
        }
        self.queue_piece_check(info_hash, t, index);
    }

    /// The verifier task: waits for its preconditions, hashes the piece off
    /// the lock, then scores and publishes the outcome.
    async fn verify_piece(&self, info_hash: InfoHash, index: usize) {
        // Wait until the piece isn't mid-hash and storage exists.
        let (storage, offset, length, expected) = loop {
            let notified = self.inner.event.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let ready = {
                let mut state = self.inner.state.write().await;
                let Some(t) = state.torrents.get_mut(&info_hash) else {
                    return;
                };
                // The torrent may have been dropped and re-added without
                // info while this task was queued.
                if index >= t.pieces.len() {
                    return;
                }
                if t.pieces[index].hashing || t.storage.is_none() {
                    None
                } else {
                    t.pieces[index].queued_for_hash = false;
                    if t.closed.is_set() || self.inner.closed.is_set() || t.piece_complete(index)
                    {
                        Some(None)
                    } else {
                        t.pieces[index].hashing = true;
                        let info = t.info.as_ref().expect("info precedes hashing");
                        Some(Some((
                            t.storage.clone().expect("checked above"),
                            info.piece_offset(index),
                            info.piece_len(index) as usize,
                            t.pieces[index].hash,
                        )))
                    }
                }
            };
            match ready {
                Some(None) => {
                    self.broadcast();
                    return;
                }
                Some(Some(params)) => {
                    self.broadcast();
                    break params;
                }
                None => notified.await,
            }
        };

        // Hash with the lock released; the read serializes against storage.
        let mut buf = vec![0u8; length];
        let read_result = storage.read_at(&mut buf, offset);
        let verdict = match read_result {
            Ok(()) => {
                let mut hasher = Sha1::new();
                hasher.update(&buf);
                let digest: [u8; 20] = hasher.finalize().into();
                Some(digest == expected)
            }
            Err(e) => {
                trace!(piece = index, error = %e, "piece read failed during verification");
                None
            }
        };

        let upload_after: Vec<ConnId> = {
            let mut state = self.inner.state.write().await;
            {
                let Some(t) = state.torrents.get_mut(&info_hash) else {
                    return;
                };
                if index >= t.pieces.len() {
                    return;
                }
                t.pieces[index].hashing = false;
            }
            match verdict {
                Some(correct) => Self::piece_hashed(&mut state, info_hash, index, correct),
                None => {
                    // Storage failed underneath us; put the piece back in
                    // the pending pool without scoring anyone.
                    if let Some(t) = state.torrents.get_mut(&info_hash) {
                        t.pieces[index].set_all_dirty();
                    }
                    Vec::new()
                }
            }
        };
        self.broadcast();

        for cid in upload_after {
            let _ = self.upload(info_hash, cid).await;
        }
    }

    /// Applies a verification verdict: completion and reciprocation on
    /// success; banning, dropping, and re-pending on failure. The very
    /// first hash of a piece scores nobody, since it may be a startup scan
    /// over data we never downloaded.
    fn piece_hashed(
        state: &mut ClientState,
        info_hash: InfoHash,
        index: usize,
        correct: bool,
    ) -> Vec<ConnId> {
        let Some(t) = state.torrents.get_mut(&info_hash) else {
            return Vec::new();
        };
        if index >= t.pieces.len() {
            return Vec::new();
        }
        let scored = t.pieces[index].ever_hashed;
        t.pieces[index].ever_hashed = true;

        // Reap the connections that contributed chunks to this piece.
        let touchers: Vec<ConnId> = t
            .conns
            .values_mut()
            .filter_map(|c| c.touched_pieces.remove(&(index as u32)).then_some(c.id))
            .collect();

        if correct {
            if scored {
                for &cid in &touchers {
                    if let Some(c) = t.conns.get_mut(&cid) {
                        c.stats.good_pieces_dirtied += 1;
                    }
                }
            }
            if let Some(storage) = &t.storage {
                if let Err(e) = storage.mark_complete(index) {
                    warn!(piece = index, error = %e, "failed to mark piece complete");
                }
            }
            // Chunks go back to pending so a lost piece is re-requestable.
            t.pieces[index].set_all_dirty();

            let ids: Vec<ConnId> = t.conns.keys().copied().collect();
            for cid in &ids {
                let Some(c) = t.conns.get_mut(cid) else {
                    continue;
                };
                c.post(Message::Have(index as u32));
                let stale: Vec<Request> = c
                    .requests
                    .iter()
                    .copied()
                    .filter(|r| r.index as usize == index)
                    .collect();
                for r in stale {
                    c.cancel_request(r);
                }
            }
            // Interest may lapse now that one more piece is ours.
            for cid in &ids {
                t.update_requests(*cid);
            }
            ids
        } else {
            if scored && !touchers.is_empty() {
                warn!(
                    piece = index,
                    touchers = touchers.len(),
                    "piece failed verification; banning contributors"
                );
                let mut banned: Vec<IpAddr> = Vec::new();
                for &cid in &touchers {
                    if let Some(c) = t.conns.get(&cid) {
                        banned.push(c.remote.ip());
                    }
                    if let Some(c) = t.conns.get_mut(&cid) {
                        c.stats.bad_pieces_dirtied += 1;
                    }
                    t.drop_connection(cid);
                }
                for ip in banned {
                    state.bad_peer_ips.insert(ip);
                }
            }
            let t = state.torrents.get_mut(&info_hash).expect("still present");
            // Back to the pending pool.
            t.pieces[index].set_all_dirty();
            let ids: Vec<ConnId> = t.conns.keys().copied().collect();
            for cid in ids {
                let has = t
                    .conns
                    .get(&cid)
                    .map(|c| c.peer_has_piece(index))
                    .unwrap_or(false);
                if has {
                    t.update_requests(cid);
                }
            }
            Vec::new()
        }
    }

    // --- announcers --------------------------------------------------------

    /// Per-torrent DHT announcer: waits until the torrent is hungry for
    /// peers, announces, and drains the resulting peer stream.
    async fn dht_announcer(&self, info_hash: InfoHash) {
        let Some(dht) = self.inner.cfg.dht.clone() else {
            return;
        };
        loop {
            // Wait for hunger or shutdown.
            loop {
                let notified = self.inner.event.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                {
                    let state = self.inner.state.read().await;
                    let Some(t) = state.torrents.get(&info_hash) else {
                        return;
                    };
                    if t.closed.is_set() || self.inner.closed.is_set() {
                        return;
                    }
                    if t.wants_peers() {
                        break;
                    }
                }
                notified.await;
            }

            let mut rx = match dht.announce(info_hash, self.inner.listen_port, true).await {
                Ok(rx) => rx,
                Err(e) => {
                    debug!(error = %e, "dht announce failed");
                    return;
                }
            };
            loop {
                let batch = tokio::select! {
                    batch = rx.recv() => batch,
                    _ = self.inner.closed.wait() => return,
                };
                let Some(batch) = batch else { break };
                let peers: Vec<Peer> = batch
                    .peers
                    .into_iter()
                    .filter(|a| a.port() != 0)
                    .map(|addr| Peer {
                        addr,
                        source: PeerSource::Dht,
                        supports_encryption: false,
                    })
                    .collect();
                self.add_peers(info_hash, peers).await;

                let enough = {
                    let state = self.inner.state.read().await;
                    match state.torrents.get(&info_hash) {
                        Some(t) => t.peers.len() >= PEERS_HIGH_WATER,
                        None => return,
                    }
                };
                if enough {
                    break;
                }
            }
        }
    }

    /// Per-torrent tracker announcer. Each round walks the tiers in order,
    /// shuffling within a tier, and sleeps on the first success.
    async fn tracker_announcer(&self, info_hash: InfoHash) {
        let Some(tracker) = self.inner.cfg.tracker.clone() else {
            return;
        };
        let mut event = AnnounceEvent::Started;
        loop {
            let (tiers, left) = {
                let state = self.inner.state.read().await;
                let Some(t) = state.torrents.get(&info_hash) else {
                    return;
                };
                if t.closed.is_set() || self.inner.closed.is_set() {
                    break;
                }
                (t.trackers.clone(), t.bytes_left())
            };

            let mut sleep_for = ANNOUNCE_RETRY;
            'tiers: for mut tier in tiers {
                tier.shuffle(&mut *self.inner.rng.lock());
                for url in tier {
                    let req = AnnounceRequest {
                        url,
                        info_hash,
                        peer_id: self.inner.peer_id,
                        port: self.inner.listen_port,
                        uploaded: 0,
                        downloaded: 0,
                        left,
                        event,
                    };
                    match tracker.announce(req).await {
                        Ok(resp) => {
                            let peers = resp
                                .peers
                                .into_iter()
                                .map(|addr| Peer {
                                    addr,
                                    source: PeerSource::Tracker,
                                    supports_encryption: false,
                                })
                                .collect();
                            self.add_peers(info_hash, peers).await;
                            sleep_for = resp.interval.max(MIN_ANNOUNCE_INTERVAL);
                            event = AnnounceEvent::None;
                            break 'tiers;
                        }
                        Err(e) => {
                            debug!(error = %e, "tracker announce failed");
                        }
                    }
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                _ = self.inner.closed.wait() => break,
            }
            let gone = {
                let state = self.inner.state.read().await;
                match state.torrents.get(&info_hash) {
                    Some(t) => t.closed.is_set(),
                    None => true,
                }
            };
            if gone {
                break;
            }
        }

        // Best-effort goodbye.
        let req = AnnounceRequest {
            url: String::new(),
            info_hash,
            peer_id: self.inner.peer_id,
            port: self.inner.listen_port,
            uploaded: 0,
            downloaded: 0,
            left: 0,
            event: AnnounceEvent::Stopped,
        };
        let _ = tracker.announce(req).await;
    }
}

/// A handle to one torrent in a client.
#[derive(Clone)]
pub struct TorrentHandle {
    client: Client,
    info_hash: InfoHash,
}

impl TorrentHandle {
    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    async fn with_torrent<T>(&self, f: impl FnOnce(&Torrent) -> T) -> Option<T> {
        let state = self.client.inner.state.read().await;
        state.torrents.get(&self.info_hash).map(f)
    }

    pub async fn name(&self) -> Option<String> {
        self.with_torrent(|t| t.name()).await.flatten()
    }

    pub async fn have_info(&self) -> bool {
        self.with_torrent(|t| t.have_info()).await.unwrap_or(false)
    }

    /// Blocks until the info dictionary is known; `false` if the torrent or
    /// client goes away first.
    pub async fn wait_info(&self) -> bool {
        loop {
            let notified = self.client.inner.event.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self
                .with_torrent(|t| (t.have_info(), t.closed.is_set()))
                .await
            {
                None => return false,
                Some((true, _)) => return true,
                Some((_, true)) => return false,
                Some((false, false)) => {
                    if self.client.inner.closed.is_set() {
                        return false;
                    }
                }
            }
            notified.await;
        }
    }

    /// Blocks until every piece is verified complete; `false` if the
    /// torrent or client goes away first.
    pub async fn wait_complete(&self) -> bool {
        loop {
            let notified = self.client.inner.event.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            match self
                .with_torrent(|t| {
                    (
                        t.have_info() && t.num_pieces_completed() == t.num_pieces(),
                        t.closed.is_set(),
                    )
                })
                .await
            {
                None => return false,
                Some((true, _)) => return true,
                Some((_, true)) => return false,
                Some((false, false)) => {
                    if self.client.inner.closed.is_set() {
                        return false;
                    }
                }
            }
            notified.await;
        }
    }

    /// `(complete pieces, total pieces)`; `(0, 0)` before the info is known.
    pub async fn progress(&self) -> (usize, usize) {
        self.with_torrent(|t| (t.num_pieces_completed(), t.num_pieces()))
            .await
            .unwrap_or((0, 0))
    }

    pub async fn is_complete(&self) -> bool {
        self.with_torrent(|t| t.have_info() && t.num_pieces_completed() == t.num_pieces())
            .await
            .unwrap_or(false)
    }

    /// Lifetime transfer counters, live and retired connections combined.
    pub async fn stats(&self) -> ConnStats {
        self.with_torrent(|t| t.total_stats())
            .await
            .unwrap_or_default()
    }

    pub async fn num_conns(&self) -> usize {
        self.with_torrent(|t| t.conns.len()).await.unwrap_or(0)
    }

    /// Offers a peer address, as a tracker or user would.
    pub async fn add_peer(&self, addr: SocketAddr) {
        self.client
            .add_peers(
                self.info_hash,
                vec![Peer {
                    addr,
                    source: PeerSource::Tracker,
                    supports_encryption: false,
                }],
            )
            .await;
    }
}

/// Expands `HOST:PORT` with an empty host into a bindable address.
fn resolve_listen_addr(addr: &str) -> String {
    match addr.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => addr.to_string(),
    }
}

/// Compact representation of an IP for the `yourip` handshake field.
fn compact_ip(ip: IpAddr) -> Bytes {
    match ip {
        IpAddr::V4(v4) => Bytes::copy_from_slice(&v4.octets()),
        IpAddr::V6(v6) => Bytes::copy_from_slice(&v6.octets()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::{FileEntry, Info};
    use crate::peer::message::PROTOCOL_HEADER;
    use crate::storage::{MemoryStorage, MemoryTorrent, StorageError, TorrentStorage};
    use crate::utp::UtpSocket;
    use tokio::io::duplex;

    const CHUNK: u64 = 16384;

    /// Builds a deterministic single-file torrent fixture.
    fn fixture(total: u64, piece_length: u64) -> (Info, Bytes, InfoHash, Vec<u8>) {
        let data: Vec<u8> = (0..total).map(|i| (i * 31 % 251) as u8).collect();
        let pieces = data
            .chunks(piece_length as usize)
            .map(|c| {
                let mut h = Sha1::new();
                h.update(c);
                h.finalize().into()
            })
            .collect();
        let info = Info {
            name: "fixture.bin".into(),
            piece_length,
            pieces,
            files: vec![FileEntry {
                path: "fixture.bin".into(),
                length: total,
                offset: 0,
            }],
            total_length: total,
            private: false,
        };
        let bytes = info.to_bytes().unwrap();
        let hash = InfoHash::from_info_bytes(&bytes);
        (info, bytes, hash, data)
    }

    /// Storage client that hands every torrent the same prebuilt handle.
    struct FixedStorage(Arc<MemoryTorrent>);

    impl StorageClient for FixedStorage {
        fn open_torrent(
            &self,
            _info: &Info,
            _ih: InfoHash,
        ) -> Result<Arc<dyn TorrentStorage>, StorageError> {
            Ok(self.0.clone())
        }
    }

    fn loopback_config(rng_seed: u64) -> Config {
        Config {
            disable_tcp: true,
            disable_encryption: true,
            seed: true,
            rng_seed: Some(rng_seed),
            default_storage: Some(Arc::new(MemoryStorage)),
            ..Default::default()
        }
    }

    async fn seed_client(info_bytes: &Bytes, data: &[u8], num_pieces: usize) -> Client {
        let storage = Arc::new(MemoryTorrent::seeded(data.to_vec(), num_pieces));
        let cfg = Config {
            default_storage: Some(Arc::new(FixedStorage(storage))),
            ..loopback_config(1)
        };
        let client = Client::new(cfg).await.unwrap();
        client
            .add_torrent_spec(TorrentSpec {
                info_bytes: Some(info_bytes.clone()),
                ..Default::default()
            })
            .await
            .unwrap();
        client
    }

    /// Wires two clients together over an in-memory stream; `a` initiates.
    fn connect(a: &Client, b: &Client, ih: InfoHash, a_addr: SocketAddr, b_addr: SocketAddr) {
        let (sa, sb) = duplex(1 << 20);
        let a = a.clone();
        let b = b.clone();
        tokio::spawn(async move {
            a.initiate_on_stream(ih, Box::new(sa), b_addr, PeerSource::Tracker)
                .await;
        });
        tokio::spawn(async move {
            b.handle_incoming(Box::new(sb), a_addr, false).await;
        });
    }

    /// Polls `$cond` (an await-able boolean expression) until it holds.
    macro_rules! eventually {
        ($cond:expr, $what:expr) => {{
            let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
            loop {
                if $cond {
                    break;
                }
                if tokio::time::Instant::now() > deadline {
                    panic!("timed out waiting for {}", $what);
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }};
    }

    fn addr(a: &str) -> SocketAddr {
        a.parse().unwrap()
    }

    #[tokio::test]
    async fn seed_and_leech_one_mib() {
        let (info, info_bytes, ih, data) = fixture(1 << 20, 256 * 1024);
        assert_eq!(info.num_pieces(), 4);

        let seed = seed_client(&info_bytes, &data, 4).await;

        let leech_storage = Arc::new(MemoryTorrent::empty(data.len() as u64, 4));
        let leech = Client::new(Config {
            default_storage: Some(Arc::new(FixedStorage(leech_storage.clone()))),
            ..loopback_config(2)
        })
        .await
        .unwrap();
        let (handle, _) = leech
            .add_torrent_spec(TorrentSpec {
                info_bytes: Some(info_bytes.clone()),
                ..Default::default()
            })
            .await
            .unwrap();

        connect(&leech, &seed, ih, addr("10.0.0.2:2000"), addr("10.0.0.1:1000"));

        assert!(
            timeout(Duration::from_secs(30), handle.wait_complete())
                .await
                .expect("download stalled")
        );
        assert_eq!(handle.progress().await, (4, 4));

        let stats = handle.stats().await;
        assert_eq!(stats.useful_chunks_received, 64);
        assert_eq!(stats.bad_pieces_dirtied, 0);
        assert_eq!(stats.good_pieces_dirtied, 4);

        // The downloaded bytes match the fixture exactly.
        let mut out = vec![0u8; data.len()];
        leech_storage.read_at(&mut out, 0).unwrap();
        assert_eq!(out, data);

        seed.close().await;
        leech.close().await;
    }

    #[tokio::test]
    async fn bad_peer_poisons_one_piece() {
        let (info, info_bytes, ih, data) = fixture(1 << 20, 256 * 1024);
        let piece_len = info.piece_length as usize;

        // The seed's storage holds one flipped byte inside piece 2, while
        // still reporting every piece complete.
        let mut poisoned = data.clone();
        poisoned[2 * piece_len + 100] ^= 0xff;
        let seed = seed_client(&info_bytes, &poisoned, 4).await;

        let leech = Client::new(loopback_config(3)).await.unwrap();
        let (handle, _) = leech
            .add_torrent_spec(TorrentSpec {
                info_bytes: Some(info_bytes.clone()),
                ..Default::default()
            })
            .await
            .unwrap();

        let seed_addr = addr("10.9.9.9:4000");
        connect(&leech, &seed, ih, addr("10.0.0.2:2000"), seed_addr);

        // Piece 2 fails verification: the contributor is banned and dropped.
        eventually!(handle.num_conns().await == 0, "poisoning peer dropped");
        eventually!(
            handle.stats().await.bad_pieces_dirtied == 1,
            "bad piece scored against the contributor"
        );
        assert!(!handle.is_complete().await);

        // The banned address cannot reconnect.
        connect(&leech, &seed, ih, addr("10.0.0.2:2001"), seed_addr);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(handle.num_conns().await, 0);
        assert!(!handle.is_complete().await);

        seed.close().await;
        leech.close().await;
    }

    #[tokio::test]
    async fn magnet_only_start() {
        let (info, info_bytes, ih, data) = fixture(128 * 1024, 128 * 1024);
        assert_eq!(info.num_pieces(), 1);

        let seed = seed_client(&info_bytes, &data, 1).await;

        // The leech knows nothing but the info hash.
        let leech = Client::new(loopback_config(4)).await.unwrap();
        let (handle, is_new) = leech.add_torrent_info_hash(ih).await;
        assert!(is_new);
        assert!(!handle.have_info().await);

        connect(&leech, &seed, ih, addr("10.0.0.2:2000"), addr("10.0.0.1:1000"));

        assert!(
            timeout(Duration::from_secs(30), handle.wait_info())
                .await
                .expect("metadata exchange stalled")
        );
        assert_eq!(handle.name().await.as_deref(), Some("fixture.bin"));

        assert!(
            timeout(Duration::from_secs(30), handle.wait_complete())
                .await
                .expect("download stalled")
        );
        assert_eq!(handle.progress().await, (1, 1));

        seed.close().await;
        leech.close().await;
    }

    /// A scripted wire-level peer for choke and duplicate-id scenarios.
    struct ScriptedPeer {
        reader: MessageReader<tokio::io::ReadHalf<BoxStream>>,
        write: tokio::io::WriteHalf<BoxStream>,
    }

    impl ScriptedPeer {
        /// Handshakes against `client` over a fresh loopback stream.
        async fn handshake(
            client: &Client,
            ih: InfoHash,
            peer_id: [u8; 20],
            from: SocketAddr,
        ) -> Self {
            let (ours, theirs) = duplex(1 << 20);
            let cl = client.clone();
            tokio::spawn(async move {
                cl.handle_incoming(Box::new(theirs), from, false).await;
            });
            let (outcome, stream) = transport::wire_handshake(
                Box::new(ours) as BoxStream,
                Some(ih.0),
                peer_id,
                Reserved::ours(false),
            )
            .await
            .unwrap()
            .expect("handshake refused");
            assert_eq!(outcome.info_hash, ih.0);
            let (read, write) = tokio::io::split(stream);
            Self {
                reader: MessageReader::new(read),
                write,
            }
        }

        async fn send(&mut self, msg: Message) {
            use tokio::io::AsyncWriteExt;
            self.write.write_all(&msg.encode()).await.unwrap();
            self.write.flush().await.unwrap();
        }

        async fn recv(&mut self) -> Message {
            timeout(Duration::from_secs(10), self.reader.next_message())
                .await
                .expect("peer went silent")
                .unwrap()
        }
    }

    #[tokio::test]
    async fn choke_reciprocation_window() {
        let (info, info_bytes, ih, data) = fixture(1 << 20, 256 * 1024);
        let piece_len = info.piece_length;

        // The server holds pieces 0 and 1 only; 2 and 3 are zeroed so the
        // startup scan leaves them incomplete and the server stays a
        // non-seed with wanted pieces.
        let mut partial = data.clone();
        partial[2 * piece_len as usize..].fill(0);
        let storage = Arc::new(MemoryTorrent::seeded(partial, 4));
        storage.clear_complete(2);
        storage.clear_complete(3);

        let server = Client::new(Config {
            default_storage: Some(Arc::new(FixedStorage(storage))),
            ..loopback_config(5)
        })
        .await
        .unwrap();
        server
            .add_torrent_spec(TorrentSpec {
                info_bytes: Some(info_bytes.clone()),
                ..Default::default()
            })
            .await
            .unwrap();

        let mut peer = ScriptedPeer::handshake(&server, ih, *b"-TS0001-aaaaaaaaaaaa", addr("10.0.0.7:7000")).await;

        // Claim everything so the server sees wanted pieces in us.
        peer.send(Message::HaveAll).await;
        peer.send(Message::Interested).await;

        // Wait for the unchoke, skipping the opening volley.
        loop {
            if peer.recv().await == Message::Unchoke {
                break;
            }
        }

        // Ask for ten chunks of piece 0; only six are owed.
        for i in 0..10u32 {
            peer.send(Message::Request {
                index: 0,
                begin: i * CHUNK as u32,
                length: CHUNK as u32,
            })
            .await;
        }

        let mut pieces_received = 0;
        loop {
            match peer.recv().await {
                Message::Piece { index: 0, .. } => pieces_received += 1,
                Message::Choke => break,
                Message::Piece { index, .. } => panic!("unexpected piece {index}"),
                _ => {}
            }
        }
        assert_eq!(pieces_received, 6);

        // Nothing more arrives after the choke without reciprocation.
        let quiet = timeout(Duration::from_millis(300), peer.reader.next_message()).await;
        match quiet {
            Err(_) => {}
            Ok(Ok(Message::Piece { .. })) => panic!("piece sent after choke"),
            Ok(_) => {}
        }

        server.close().await;
    }

    #[tokio::test]
    async fn duplicate_peer_id_rejected() {
        let (_, info_bytes, ih, _) = fixture(256 * 1024, 128 * 1024);

        let server = Client::new(loopback_config(6)).await.unwrap();
        server
            .add_torrent_spec(TorrentSpec {
                info_bytes: Some(info_bytes.clone()),
                ..Default::default()
            })
            .await
            .unwrap();
        let handle = server.add_torrent_info_hash(ih).await.0;

        let twin = *b"-TW0001-bbbbbbbbbbbb";
        let _first = ScriptedPeer::handshake(&server, ih, twin, addr("10.0.1.1:1001")).await;
        eventually!(handle.num_conns().await == 1, "first twin admitted");

        // The second handshake with the same id completes on the wire but
        // the session is refused.
        let _second = ScriptedPeer::handshake(&server, ih, twin, addr("10.0.1.2:1002")).await;
        eventually!(server.duplicate_client_conns() == 1, "duplicate counted");
        assert_eq!(handle.num_conns().await, 1);

        server.close().await;
    }

    /// In-memory uTP fabric: dialing an address delivers the other end of
    /// a fresh pipe to the acceptor registered under that address.
    struct TestUtpNet {
        acceptors:
            parking_lot::Mutex<HashMap<SocketAddr, mpsc::Sender<(BoxStream, SocketAddr)>>>,
    }

    struct TestUtp {
        net: Arc<TestUtpNet>,
        local: SocketAddr,
        accept_rx: tokio::sync::Mutex<mpsc::Receiver<(BoxStream, SocketAddr)>>,
    }

    impl TestUtp {
        fn new(net: Arc<TestUtpNet>, local: SocketAddr) -> Arc<Self> {
            let (tx, rx) = mpsc::channel(8);
            net.acceptors.lock().insert(local, tx);
            Arc::new(Self {
                net,
                local,
                accept_rx: tokio::sync::Mutex::new(rx),
            })
        }
    }

    impl UtpSocket for TestUtp {
        fn dial(&self, addr: SocketAddr) -> crate::BoxFuture<'_, io::Result<BoxStream>> {
            Box::pin(async move {
                let tx = self
                    .net
                    .acceptors
                    .lock()
                    .get(&addr)
                    .cloned()
                    .ok_or_else(|| io::Error::from(io::ErrorKind::ConnectionRefused))?;
                let (ours, theirs) = duplex(1 << 20);
                tx.send((Box::new(theirs) as BoxStream, self.local))
                    .await
                    .map_err(|_| io::Error::from(io::ErrorKind::ConnectionReset))?;
                Ok(Box::new(ours) as BoxStream)
            })
        }

        fn accept(&self) -> crate::BoxFuture<'_, io::Result<(BoxStream, SocketAddr)>> {
            Box::pin(async move {
                self.accept_rx
                    .lock()
                    .await
                    .recv()
                    .await
                    .ok_or_else(|| io::Error::from(io::ErrorKind::BrokenPipe))
            })
        }
    }

    #[tokio::test]
    async fn race_dial_yields_one_connection() {
        let (info, info_bytes, _ih, data) = fixture(256 * 1024, 128 * 1024);
        let net = Arc::new(TestUtpNet {
            acceptors: parking_lot::Mutex::new(HashMap::new()),
        });

        // The seed listens on real TCP; its uTP endpoint registers under
        // the same address once the port is known.
        let seed_storage = Arc::new(MemoryTorrent::seeded(data.clone(), info.num_pieces()));
        let mut seed_cfg = Config {
            listen_addr: "127.0.0.1:0".into(),
            disable_encryption: true,
            seed: true,
            rng_seed: Some(7),
            default_storage: Some(Arc::new(FixedStorage(seed_storage))),
            ..Default::default()
        };
        // Bind a throwaway client first to learn the port we can register
        // the uTP endpoint under, then start the real seed on it.
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let seed_addr = probe.local_addr().unwrap();
        drop(probe);
        seed_cfg.listen_addr = seed_addr.to_string();
        seed_cfg.utp = Some(TestUtp::new(net.clone(), seed_addr) as Arc<dyn UtpSocket>);
        let seed = Client::new(seed_cfg).await.unwrap();
        let seed_handle = seed
            .add_torrent_spec(TorrentSpec {
                info_bytes: Some(info_bytes.clone()),
                ..Default::default()
            })
            .await
            .unwrap()
            .0;

        let leech_utp_addr = addr("127.0.0.1:1");
        let leech = Client::new(Config {
            listen_addr: "127.0.0.1:0".into(),
            disable_encryption: true,
            rng_seed: Some(8),
            default_storage: Some(Arc::new(MemoryStorage)),
            utp: Some(TestUtp::new(net.clone(), leech_utp_addr) as Arc<dyn UtpSocket>),
            ..Default::default()
        })
        .await
        .unwrap();
        let handle = leech
            .add_torrent_spec(TorrentSpec {
                info_bytes: Some(info_bytes.clone()),
                ..Default::default()
            })
            .await
            .unwrap()
            .0;

        // Both transports reach the seed; exactly one session survives.
        handle.add_peer(seed_addr).await;

        assert!(
            timeout(Duration::from_secs(30), handle.wait_complete())
                .await
                .expect("download stalled")
        );
        assert_eq!(handle.num_conns().await, 1);
        eventually!(
            seed_handle.num_conns().await <= 1,
            "losing transport closed"
        );

        seed.close().await;
        leech.close().await;
    }

    #[tokio::test]
    async fn add_torrent_spec_is_idempotent() {
        let (_, info_bytes, ih, _) = fixture(64 * 1024, 64 * 1024);
        let client = Client::new(loopback_config(9)).await.unwrap();

        let (_, new1) = client
            .add_torrent_spec(TorrentSpec {
                info_hash: Some(ih),
                trackers: vec![vec!["http://one/announce".into()]],
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(new1);

        // Second add merges trackers and sets the info once.
        let (handle, new2) = client
            .add_torrent_spec(TorrentSpec {
                info_hash: Some(ih),
                info_bytes: Some(info_bytes.clone()),
                trackers: vec![vec![
                    "http://one/announce".into(),
                    "http://two/announce".into(),
                ]],
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(!new2);
        assert!(handle.have_info().await);

        let (_, new3) = client
            .add_torrent_spec(TorrentSpec {
                info_hash: Some(ih),
                info_bytes: Some(info_bytes),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(!new3);

        let mut status = String::new();
        client.write_status(&mut status).await.unwrap();
        assert!(status.contains("# Torrents: 1"));

        client.close().await;
    }

    #[tokio::test]
    async fn protocol_boundary_violations_fail_the_connection() {
        let (_, info_bytes, ih, _) = fixture(1 << 20, 256 * 1024);
        let server = Client::new(loopback_config(12)).await.unwrap();
        let handle = server
            .add_torrent_spec(TorrentSpec {
                info_bytes: Some(info_bytes),
                ..Default::default()
            })
            .await
            .unwrap()
            .0;

        // A request with length zero.
        let mut peer =
            ScriptedPeer::handshake(&server, ih, *b"-BA0001-aaaaaaaaaaaa", addr("10.4.4.1:4001"))
                .await;
        eventually!(handle.num_conns().await == 1, "first violator admitted");
        peer.send(Message::Request {
            index: 0,
            begin: 0,
            length: 0,
        })
        .await;
        eventually!(
            handle.num_conns().await == 0,
            "zero-length request to be fatal"
        );

        // A piece body overrunning the piece boundary.
        let mut peer =
            ScriptedPeer::handshake(&server, ih, *b"-BA0002-aaaaaaaaaaaa", addr("10.4.4.2:4002"))
                .await;
        eventually!(handle.num_conns().await == 1, "second violator admitted");
        peer.send(Message::Piece {
            index: 3,
            begin: 256 * 1024 - 8,
            data: Bytes::from(vec![0u8; 64]),
        })
        .await;
        eventually!(
            handle.num_conns().await == 0,
            "out-of-bounds piece to be fatal"
        );

        // A bitfield of the wrong length (4 pieces need one byte).
        let mut peer =
            ScriptedPeer::handshake(&server, ih, *b"-BA0003-aaaaaaaaaaaa", addr("10.4.4.3:4003"))
                .await;
        eventually!(handle.num_conns().await == 1, "third violator admitted");
        peer.send(Message::Bitfield(Bytes::from_static(&[0xf0, 0x00])))
            .await;
        eventually!(
            handle.num_conns().await == 0,
            "mismatched bitfield to be fatal"
        );

        server.close().await;
    }

    #[tokio::test]
    async fn wait_all_returns_false_on_close() {
        let client = Client::new(loopback_config(10)).await.unwrap();
        let (_, _, ih, _) = fixture(64 * 1024, 64 * 1024);
        client.add_torrent_info_hash(ih).await;

        let waiter = {
            let cl = client.clone();
            tokio::spawn(async move { cl.wait_all().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.close().await;
        assert!(!waiter.await.unwrap());
    }

    #[tokio::test]
    async fn wrong_protocol_header_closes_silently() {
        let (_, info_bytes, _ih, _) = fixture(64 * 1024, 64 * 1024);
        let server = Client::new(loopback_config(11)).await.unwrap();
        let handle = server
            .add_torrent_spec(TorrentSpec {
                info_bytes: Some(info_bytes),
                ..Default::default()
            })
            .await
            .unwrap()
            .0;

        let (ours, theirs) = duplex(4096);
        let cl = server.clone();
        tokio::spawn(async move {
            cl.handle_incoming(Box::new(theirs), addr("10.3.3.3:3000"), false)
                .await;
        });
        use tokio::io::AsyncWriteExt;
        let mut ours = ours;
        let mut junk = [0u8; 68];
        junk[..20].copy_from_slice(&PROTOCOL_HEADER.map(|b| b.wrapping_add(1)));
        ours.write_all(&junk).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(handle.num_conns().await, 0);
        server.close().await;
    }
}
