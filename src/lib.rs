//! undertow - a BitTorrent swarm engine
//!
//! This crate implements the core of a BitTorrent peer client: swarm
//! lifecycle, the peer wire protocol state machine, chunk scheduling with
//! backpressure and cancellation, piece verification, and upload
//! reciprocation, all coordinated by a single [`Client`] supervisor.
//!
//! # Modules
//!
//! - [`bencode`] - BEP-3 bencode encoding/decoding
//! - [`metainfo`] - BEP-3/9 torrent metainfo, info hashes, magnet links
//! - [`peer`] - BEP-3/6/10 peer wire protocol, fast extension, extension protocol
//! - [`pex`] - BEP-11 peer exchange messages
//! - [`piece`] - piece records and chunk geometry
//! - [`client`] - the supervisor: dialing, accepting, dispatch, verification
//! - [`torrent`] - per-swarm state and the request scheduler
//! - [`storage`] - storage contracts, file and memory backends
//! - [`tracker`] / [`dht`] / [`blocklist`] / [`mse`] / [`utp`] - contracts
//!   for the external collaborators the engine drives
//!
//! # Example
//!
//! ```no_run
//! use undertow::{Client, Config};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::new(Config {
//!     data_dir: "/tmp/undertow".into(),
//!     ..Default::default()
//! })
//! .await?;
//! let torrent = client.add_torrent_file("example.torrent".as_ref()).await?;
//! torrent.wait_complete().await;
//! client.close().await;
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::pin::Pin;

pub mod bencode;
pub mod blocklist;
pub mod client;
pub mod config;
mod conn;
pub mod dht;
mod event;
pub mod metainfo;
pub mod mse;
pub mod peer;
pub mod pex;
pub mod piece;
pub mod storage;
mod torrent;
pub mod tracker;
pub mod utp;

pub use client::{Client, ClientError, TorrentHandle};
pub use config::Config;
pub use conn::ConnStats;
pub use metainfo::{InfoHash, MagnetLink, Metainfo};
pub use peer::{Bitfield, PeerError, PeerId};
pub use torrent::{Peer, PeerSource, TorrentError, TorrentSpec};

/// Boxed future alias used by the external-collaborator contracts.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
