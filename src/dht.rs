//! The DHT server contract.
//!
//! The distributed hash table runs as its own server; the swarm engine only
//! announces into it, pings advertised ports, and feeds it bootstrap nodes.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::blocklist::Ranger;
use crate::metainfo::InfoHash;
use crate::BoxFuture;

/// A batch of peers surfaced by an ongoing DHT announce.
#[derive(Debug, Clone)]
pub struct DhtPeersEvent {
    pub peers: Vec<SocketAddr>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DhtStats {
    pub nodes: usize,
    pub good_nodes: usize,
    pub banned_nodes: usize,
    pub confirmed_announces: usize,
}

/// The narrow DHT interface the swarm engine depends on.
pub trait Dht: Send + Sync {
    /// Starts an announce for `info_hash`, streaming discovered peers until
    /// the receiver is dropped.
    fn announce(
        &self,
        info_hash: InfoHash,
        port: u16,
        implied_port: bool,
    ) -> BoxFuture<'_, io::Result<mpsc::Receiver<DhtPeersEvent>>>;

    /// Fire-and-forget liveness probe of a peer's advertised DHT port.
    fn ping(&self, addr: SocketAddr);

    fn add_node(&self, addr: SocketAddr);

    fn stats(&self) -> DhtStats;

    fn set_blocklist(&self, ranger: Option<Arc<dyn Ranger>>);

    /// The UDP port the server listens on, advertised in Port messages.
    fn port(&self) -> u16;
}
