//! Client configuration.

use std::path::PathBuf;
use std::sync::Arc;

use crate::blocklist::Ranger;
use crate::dht::Dht;
use crate::mse::MseHandshake;
use crate::storage::StorageClient;
use crate::tracker::TrackerClient;
use crate::utp::UtpSocket;

/// Overrides for client defaults. `Config::default()` is a working
/// configuration that stores data in the current directory.
#[derive(Default)]
pub struct Config {
    /// Directory for downloaded data unless `default_storage` is set.
    pub data_dir: PathBuf,
    /// `HOST:PORT` to listen on; empty means `:50007`.
    pub listen_addr: String,
    /// Don't announce to trackers; peer discovery is left to the DHT.
    pub disable_trackers: bool,
    pub disable_pex: bool,
    /// Don't use the configured DHT even if one is present.
    pub no_dht: bool,
    /// Never send chunks to peers.
    pub no_upload: bool,
    /// Upload even after there's nothing in it for us.
    pub seed: bool,
    /// Fixed 20-byte peer id; generated when absent.
    pub peer_id: Option<[u8; 20]>,
    pub disable_utp: bool,
    pub disable_tcp: bool,
    pub disable_ipv6: bool,
    pub disable_encryption: bool,
    /// Storage opener used for torrents that don't bring their own. The
    /// file backend rooted at `data_dir` is used when unset.
    pub default_storage: Option<Arc<dyn StorageClient>>,
    pub ip_blocklist: Option<Arc<dyn Ranger>>,
    /// Outbound piece-payload budget in KiB per second; unshaped when unset.
    pub upload_rate_kib: Option<u64>,
    /// Extra logging and any other behaviour that helps debugging.
    pub debug: bool,
    /// Seed for the client's RNG, for reproducible tier shuffles and peer
    /// ids in tests.
    pub rng_seed: Option<u64>,

    // External collaborators.
    pub dht: Option<Arc<dyn Dht>>,
    pub tracker: Option<Arc<dyn TrackerClient>>,
    pub utp: Option<Arc<dyn UtpSocket>>,
    pub mse: Option<Arc<dyn MseHandshake>>,
}

impl Config {
    /// The effective listen address string.
    pub(crate) fn listen_addr_or_default(&self) -> &str {
        if self.listen_addr.is_empty() {
            ":50007"
        } else {
            &self.listen_addr
        }
    }
}
