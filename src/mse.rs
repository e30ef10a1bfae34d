//! Message-stream-encryption contract and the plaintext detection path.
//!
//! The MSE key exchange itself is an external collaborator; this module
//! defines the interface the dialer and acceptor use, plus the peek logic
//! that lets the acceptor serve plaintext and encrypted peers on one port.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use crate::peer::message::PROTOCOL_HEADER;
use crate::peer::transport::BoxStream;
use crate::BoxFuture;

#[derive(Debug, Error)]
pub enum MseError {
    /// The responder found no known torrent matching the peer's secret.
    /// A valid terminal, not a protocol failure.
    #[error("no matching secret key")]
    NoSecretMatch,

    #[error("handshake failed: {0}")]
    Failed(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// The encrypted-handshake contract.
pub trait MseHandshake: Send + Sync {
    /// Initiator side: the known info-hash is the shared secret.
    fn initiate(
        &self,
        stream: BoxStream,
        secret: [u8; 20],
    ) -> BoxFuture<'_, Result<BoxStream, MseError>>;

    /// Responder side: tries every known info-hash, reporting which one
    /// matched alongside the plaintext-equivalent stream.
    fn receive(
        &self,
        stream: BoxStream,
        secrets: Vec<[u8; 20]>,
    ) -> BoxFuture<'_, Result<(BoxStream, [u8; 20]), MseError>>;
}

/// What the acceptor saw in the first bytes of an inbound stream.
pub enum InboundProbe {
    /// The peer opened with the BitTorrent protocol header; `stream` replays
    /// those bytes.
    Plaintext(BoxStream),
    /// Anything else; `stream` replays the consumed bytes for an MSE
    /// responder to continue with.
    Encrypted(BoxStream),
}

/// Reads the first 20 bytes of an inbound stream to distinguish plaintext
/// peers from encrypted ones. The consumed bytes are pushed back so either
/// path sees the stream from the start.
pub async fn probe_inbound(mut stream: BoxStream) -> io::Result<InboundProbe> {
    let mut head = [0u8; PROTOCOL_HEADER.len()];
    stream.read_exact(&mut head).await?;
    let replayed: BoxStream = Box::new(PrefixedStream::new(
        Bytes::copy_from_slice(&head),
        stream,
    ));
    if &head == PROTOCOL_HEADER {
        Ok(InboundProbe::Plaintext(replayed))
    } else {
        Ok(InboundProbe::Encrypted(replayed))
    }
}

/// A stream that replays buffered bytes before reading the inner stream.
pub struct PrefixedStream<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix.split_to(n));
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn probe_detects_plaintext() {
        let (a, mut b) = tokio::io::duplex(256);
        b.write_all(PROTOCOL_HEADER).await.unwrap();
        b.write_all(b"rest").await.unwrap();

        match probe_inbound(Box::new(a)).await.unwrap() {
            InboundProbe::Plaintext(mut s) => {
                // The header is replayed intact.
                let mut head = [0u8; 20];
                s.read_exact(&mut head).await.unwrap();
                assert_eq!(&head, PROTOCOL_HEADER);
                let mut rest = [0u8; 4];
                s.read_exact(&mut rest).await.unwrap();
                assert_eq!(&rest, b"rest");
            }
            InboundProbe::Encrypted(_) => panic!("expected plaintext"),
        }
    }

    #[tokio::test]
    async fn probe_detects_encrypted() {
        let (a, mut b) = tokio::io::duplex(256);
        b.write_all(&[0xaa; 24]).await.unwrap();

        match probe_inbound(Box::new(a)).await.unwrap() {
            InboundProbe::Encrypted(mut s) => {
                let mut head = [0u8; 24];
                s.read_exact(&mut head).await.unwrap();
                assert_eq!(head, [0xaa; 24]);
            }
            InboundProbe::Plaintext(_) => panic!("expected encrypted"),
        }
    }

    #[tokio::test]
    async fn prefixed_stream_writes_pass_through() {
        let (a, mut b) = tokio::io::duplex(256);
        let mut s = PrefixedStream::new(Bytes::new(), a);
        s.write_all(b"hello").await.unwrap();
        s.flush().await.unwrap();
        let mut out = [0u8; 5];
        b.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"hello");
    }
}
