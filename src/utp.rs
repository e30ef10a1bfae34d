//! The uTP transport contract.
//!
//! uTP sessions run over a congestion-controlled UDP socket that is an
//! external collaborator; the dialer races it against TCP and the acceptor
//! drains it alongside the TCP listener.

use std::io;
use std::net::SocketAddr;

use crate::peer::transport::BoxStream;
use crate::BoxFuture;

pub trait UtpSocket: Send + Sync {
    fn dial(&self, addr: SocketAddr) -> BoxFuture<'_, io::Result<BoxStream>>;

    fn accept(&self) -> BoxFuture<'_, io::Result<(BoxStream, SocketAddr)>>;
}
