//! Framed message I/O over an established peer stream.
//!
//! The reader decodes one length-prefixed frame at a time, enforcing the
//! single-message cap and the liveness deadline. The writer runs as its own
//! task, draining a bounded post queue and emitting keep-alives when the
//! queue stays quiet. The handshake exchange also lives here, with its own
//! short-lived writer task so posting the four handshake segments can never
//! block the read of the peer's reply.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::error::PeerError;
use super::message::{Handshake, Message, Reserved, HANDSHAKE_LEN, PROTOCOL_HEADER};

/// Cap on a single wire message. Piece messages top out well below this.
pub const MAX_MESSAGE_LEN: usize = 256 * 1024;

/// A peer that stays silent this long is presumed gone.
pub const READ_DEADLINE: Duration = Duration::from_secs(150);

/// Keep-alive cadence on an otherwise idle writer.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Any async byte stream a peer session can run over: TCP, uTP, or an
/// in-memory pipe in tests.
pub trait PeerStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> PeerStream for T {}

pub type BoxStream = Box<dyn PeerStream>;

/// Decodes frames from the read half of a peer stream.
pub struct MessageReader<R> {
    inner: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: BytesMut::with_capacity(32 * 1024),
        }
    }

    /// Reads one frame, keep-alives included.
    pub async fn next_message(&mut self) -> Result<Message, PeerError> {
        self.fill_to(4).await?;
        let len = u32::from_be_bytes(self.buf[..4].try_into().unwrap()) as usize;
        if len > MAX_MESSAGE_LEN {
            return Err(PeerError::MessageTooLong(len));
        }
        self.fill_to(4 + len).await?;
        let mut frame = self.buf.split_to(4 + len).freeze();
        let _ = frame.split_to(4);
        Message::decode_body(frame)
    }

    async fn fill_to(&mut self, target: usize) -> Result<(), PeerError> {
        while self.buf.len() < target {
            let n = timeout(READ_DEADLINE, self.inner.read_buf(&mut self.buf))
                .await
                .map_err(|_| PeerError::Timeout)??;
            if n == 0 {
                return Err(PeerError::Closed);
            }
        }
        Ok(())
    }
}

/// Token bucket shaping outbound piece payloads, in bytes per second.
pub struct RateLimiter {
    bytes_per_sec: f64,
    state: parking_lot::Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    refilled: Instant,
}

impl RateLimiter {
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            bytes_per_sec: bytes_per_sec as f64,
            state: parking_lot::Mutex::new(BucketState {
                tokens: bytes_per_sec as f64,
                refilled: Instant::now(),
            }),
        }
    }

    /// Waits until `n` bytes of budget are available, then spends them.
    pub async fn acquire(&self, n: usize) {
        let need = n as f64;
        loop {
            let wait = {
                let mut s = self.state.lock();
                let now = Instant::now();
                let elapsed = now.duration_since(s.refilled).as_secs_f64();
                s.tokens = (s.tokens + elapsed * self.bytes_per_sec).min(self.bytes_per_sec);
                s.refilled = now;
                if s.tokens >= need {
                    s.tokens -= need;
                    return;
                }
                Duration::from_secs_f64((need - s.tokens) / self.bytes_per_sec)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

/// Drains the connection's post queue onto the write half.
///
/// Exits when the queue closes. The queue is bounded (see
/// [`crate::conn::POST_QUEUE_CAPACITY`]); senders assert rather than wait,
/// so this task is the only place writes can be slow.
pub async fn run_writer<W: AsyncWrite + Unpin>(
    mut w: W,
    mut rx: mpsc::Receiver<Message>,
    rate: Option<Arc<RateLimiter>>,
) -> io::Result<()> {
    loop {
        let msg = match timeout(KEEPALIVE_INTERVAL, rx.recv()).await {
            Err(_) => {
                w.write_all(&Message::KeepAlive.encode()).await?;
                w.flush().await?;
                continue;
            }
            Ok(None) => {
                w.flush().await?;
                return Ok(());
            }
            Ok(Some(msg)) => msg,
        };
        write_shaped(&mut w, msg, &rate).await?;
        // Batch whatever else is already queued before flushing.
        while let Ok(next) = rx.try_recv() {
            write_shaped(&mut w, next, &rate).await?;
        }
        w.flush().await?;
    }
}

async fn write_shaped<W: AsyncWrite + Unpin>(
    w: &mut W,
    msg: Message,
    rate: &Option<Arc<RateLimiter>>,
) -> io::Result<()> {
    if let (Some(limiter), Message::Piece { data, .. }) = (rate, &msg) {
        limiter.acquire(data.len()).await;
    }
    w.write_all(&msg.encode()).await
}

/// Outcome of a successful wire handshake.
#[derive(Debug, Clone, Copy)]
pub struct HandshakeOutcome {
    pub reserved: Reserved,
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

/// Runs the 68-byte handshake exchange over `stream`.
///
/// With `info_hash` set we are the initiator and send everything up front;
/// with `None` we wait for the peer to declare the torrent and echo it. A
/// peer that hangs up early or speaks a different protocol yields
/// `Ok(None)`: a silent close, not a violation.
pub async fn wire_handshake(
    stream: BoxStream,
    info_hash: Option<[u8; 20]>,
    our_id: [u8; 20],
    reserved: Reserved,
) -> Result<Option<(HandshakeOutcome, BoxStream)>, PeerError> {
    let (mut read_half, mut write_half) = tokio::io::split(stream);

    // Posting must never block: four segments, capacity four.
    let (tx, mut rx) = mpsc::channel::<Bytes>(4);
    let writer = tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            write_half.write_all(&chunk).await?;
        }
        write_half.flush().await?;
        Ok::<_, io::Error>(write_half)
    });
    let post = |chunk: Bytes| {
        tx.try_send(chunk)
            .unwrap_or_else(|_| panic!("handshake post queue full"));
    };

    post(Bytes::from_static(PROTOCOL_HEADER));
    post(Bytes::copy_from_slice(&reserved.0));
    if let Some(ih) = info_hash {
        post(Bytes::copy_from_slice(&ih));
        post(Bytes::copy_from_slice(&our_id));
    }

    let mut incoming = [0u8; HANDSHAKE_LEN];
    let outcome = match read_half.read_exact(&mut incoming).await {
        Ok(_) if incoming[..20] == PROTOCOL_HEADER[..] => {
            let (peer_reserved, peer_ih, peer_id) = Handshake::decode_tail(&incoming[20..])?;
            if info_hash.is_none() {
                // The peer told us what they want; now we can commit.
                post(Bytes::copy_from_slice(&peer_ih));
                post(Bytes::copy_from_slice(&our_id));
            }
            Some(HandshakeOutcome {
                reserved: peer_reserved,
                info_hash: peer_ih,
                peer_id,
            })
        }
        // Early hangup and foreign protocols are quiet failures.
        Ok(_) => None,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => None,
        Err(e) => return Err(e.into()),
    };

    drop(post);
    drop(tx);
    let write_result = writer.await.map_err(|_| PeerError::Closed)?;
    // On a quiet failure the stream is abandoned; writer errors only matter
    // for a handshake we are keeping.
    let Some(outcome) = outcome else {
        return Ok(None);
    };
    let write_half = write_result.map_err(PeerError::Io)?;
    let stream = read_half.unsplit(write_half);
    Ok(Some((outcome, stream)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reader_decodes_frames() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut reader = MessageReader::new(client);

        server.write_all(&Message::Have(3).encode()).await.unwrap();
        server
            .write_all(&Message::KeepAlive.encode())
            .await
            .unwrap();
        server.flush().await.unwrap();

        assert_eq!(reader.next_message().await.unwrap(), Message::Have(3));
        assert_eq!(reader.next_message().await.unwrap(), Message::KeepAlive);
    }

    #[tokio::test]
    async fn reader_rejects_oversized_frames() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut reader = MessageReader::new(client);

        let len = (MAX_MESSAGE_LEN as u32 + 1).to_be_bytes();
        server.write_all(&len).await.unwrap();
        server.flush().await.unwrap();

        assert!(matches!(
            reader.next_message().await,
            Err(PeerError::MessageTooLong(_))
        ));
    }

    #[tokio::test]
    async fn reader_reports_closed_stream() {
        let (client, server) = tokio::io::duplex(1024);
        drop(server);
        let mut reader = MessageReader::new(client);
        assert!(matches!(
            reader.next_message().await,
            Err(PeerError::Closed)
        ));
    }

    #[tokio::test]
    async fn handshake_exchange_both_sides() {
        let (a, b) = tokio::io::duplex(4096);
        let ih = [1u8; 20];

        let initiator = tokio::spawn(wire_handshake(
            Box::new(a) as BoxStream,
            Some(ih),
            [2u8; 20],
            Reserved::ours(false),
        ));
        let receiver = tokio::spawn(wire_handshake(
            Box::new(b) as BoxStream,
            None,
            [3u8; 20],
            Reserved::ours(true),
        ));

        let (init_res, _) = initiator.await.unwrap().unwrap().unwrap();
        let (recv_res, _) = receiver.await.unwrap().unwrap().unwrap();

        assert_eq!(init_res.info_hash, ih);
        assert_eq!(recv_res.info_hash, ih);
        assert_eq!(init_res.peer_id, [3u8; 20]);
        assert_eq!(recv_res.peer_id, [2u8; 20]);
        assert!(init_res.reserved.supports_dht());
    }

    #[tokio::test]
    async fn foreign_protocol_closes_silently() {
        let (a, mut b) = tokio::io::duplex(4096);
        b.write_all(&[0u8; HANDSHAKE_LEN]).await.unwrap();

        let outcome = wire_handshake(
            Box::new(a) as BoxStream,
            Some([1u8; 20]),
            [2u8; 20],
            Reserved::ours(false),
        )
        .await
        .unwrap();
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn early_hangup_closes_silently() {
        let (a, b) = tokio::io::duplex(4096);
        drop(b);

        let outcome = wire_handshake(
            Box::new(a) as BoxStream,
            Some([1u8; 20]),
            [2u8; 20],
            Reserved::ours(false),
        )
        .await
        .unwrap();
        assert!(outcome.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_spreads_bursts() {
        let limiter = RateLimiter::new(1000);
        limiter.acquire(1000).await; // drains the bucket
        let before = tokio::time::Instant::now();
        limiter.acquire(500).await;
        assert!(before.elapsed() >= Duration::from_millis(490));
    }
}
