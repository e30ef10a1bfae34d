//! The tracker announce contract.
//!
//! The engine does not speak HTTP or UDP tracker protocols itself; a
//! [`TrackerClient`] implementation is injected through the config and the
//! per-tier announcer tasks in the client drive it.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::metainfo::InfoHash;
use crate::peer::PeerId;
use crate::BoxFuture;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("announce failed: {0}")]
    Announce(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The event slot of an announce request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    None,
    Started,
    Stopped,
    Completed,
}

/// One announce to one tracker URL.
#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub url: String,
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: AnnounceEvent,
}

#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    /// How long to wait before the next regular announce.
    pub interval: Duration,
    pub peers: Vec<SocketAddr>,
}

/// The narrow announce interface the swarm engine depends on.
pub trait TrackerClient: Send + Sync {
    fn announce(
        &self,
        req: AnnounceRequest,
    ) -> BoxFuture<'_, Result<AnnounceResponse, TrackerError>>;
}
