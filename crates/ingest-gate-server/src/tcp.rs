//! TCP transport.
//!
//! Frames are length-prefixed CBOR (see [`ingest_gate_core::codec`]).
//! Clients send [`ClientFrame`]s; a `HalfClose` frame ends the request
//! side gracefully, while a socket that closes without one is treated as a
//! client disconnect and cancels the stream.
//!
//! Frame bodies being decoded hold permits from a byte semaphore shared by
//! all connections, bounding transport memory by the configured quota.
//!
//! Both halves watch the stream's cancellation token, so cancelling a
//! stream interrupts a read or write blocked on a slow or silent peer.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use ingest_gate_core::{
    decode_frame_body, encode_frame, frame_body_len, ClientFrame, Request, ServerFrame, Status,
    DEFAULT_MAX_RECEIVE_MESSAGE_SIZE, FRAME_HEADER_LEN,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::transport::{Listener, ServerStream, StreamReader, StreamWriter};

/// Default transport memory quota (20 MiB).
pub const DEFAULT_MEMORY_QUOTA: usize = 20 * 1024 * 1024;

/// Configuration for [`TcpIngestListener`].
#[derive(Debug, Clone)]
pub struct TcpTransportConfig {
    /// Largest accepted frame body.
    pub max_receive_message_size: usize,

    /// Bytes of frame bodies that may be in flight across all connections.
    /// Raised to twice `max_receive_message_size` when smaller.
    pub memory_quota: usize,
}

impl TcpTransportConfig {
    /// The quota actually enforced.
    pub fn effective_memory_quota(&self) -> usize {
        self.memory_quota
            .max(self.max_receive_message_size.saturating_mul(2))
    }
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self {
            max_receive_message_size: DEFAULT_MAX_RECEIVE_MESSAGE_SIZE,
            memory_quota: DEFAULT_MEMORY_QUOTA,
        }
    }
}

/// Listener accepting ingestion streams over TCP.
pub struct TcpIngestListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    max_receive_message_size: usize,
    quota: Arc<Semaphore>,
    closed: CancellationToken,
}

impl TcpIngestListener {
    /// Bind to `addr`.
    pub async fn bind(addr: &str, config: TcpTransportConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let permits = config
            .effective_memory_quota()
            .min(Semaphore::MAX_PERMITS)
            .min(u32::MAX as usize);
        debug!(%local_addr, quota = permits, "tcp listener bound");
        Ok(Self {
            listener,
            local_addr,
            max_receive_message_size: config.max_receive_message_size,
            quota: Arc::new(Semaphore::new(permits)),
            closed: CancellationToken::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn open(&self, socket: TcpStream, peer: SocketAddr) -> Result<ServerStream> {
        socket.set_nodelay(true)?;
        let (read, write) = socket.into_split();
        let cancel = CancellationToken::new();
        Ok(ServerStream {
            peer: peer.to_string(),
            reader: Box::new(TcpStreamReader {
                socket: BufReader::new(read),
                max_receive_message_size: self.max_receive_message_size,
                quota: Arc::clone(&self.quota),
                cancel: cancel.clone(),
                half_closed: false,
            }),
            writer: Box::new(TcpStreamWriter {
                socket: write,
                cancel: cancel.clone(),
            }),
            cancel,
        })
    }
}

#[async_trait]
impl Listener for TcpIngestListener {
    async fn accept(&self) -> Result<Option<ServerStream>> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Ok(None),
            accepted = self.listener.accept() => {
                let (socket, peer) = accepted?;
                self.open(socket, peer).map(Some)
            }
        }
    }

    async fn shutdown(&self) {
        self.closed.cancel();
    }
}

struct TcpStreamReader {
    socket: BufReader<OwnedReadHalf>,
    max_receive_message_size: usize,
    quota: Arc<Semaphore>,
    cancel: CancellationToken,
    half_closed: bool,
}

impl TcpStreamReader {
    async fn fill(&mut self, buf: &mut [u8]) -> Result<()> {
        let read = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(TransportError::Cancelled),
            read = self.socket.read_exact(buf) => read,
        };
        match read {
            Ok(_) => Ok(()),
            Err(err) => {
                self.cancel.cancel();
                if err.kind() == io::ErrorKind::UnexpectedEof {
                    Err(TransportError::Disconnected)
                } else {
                    Err(TransportError::Io(err))
                }
            }
        }
    }
}

#[async_trait]
impl StreamReader for TcpStreamReader {
    async fn read(&mut self) -> Result<Option<Request>> {
        if self.half_closed {
            return Ok(None);
        }

        let mut header = [0u8; FRAME_HEADER_LEN];
        self.fill(&mut header).await?;
        let size = frame_body_len(header, self.max_receive_message_size)?;

        let permits = u32::try_from(size).map_err(|_| TransportError::FrameTooLarge {
            size,
            max: self.max_receive_message_size,
        })?;
        let _permit = Arc::clone(&self.quota)
            .acquire_many_owned(permits)
            .await
            .map_err(|_| TransportError::Closed)?;

        let mut body = vec![0u8; size];
        self.fill(&mut body).await?;
        match decode_frame_body::<ClientFrame>(&body)? {
            ClientFrame::Request(request) => Ok(Some(request)),
            ClientFrame::HalfClose => {
                self.half_closed = true;
                Ok(None)
            }
        }
    }
}

struct TcpStreamWriter {
    socket: OwnedWriteHalf,
    cancel: CancellationToken,
}

impl TcpStreamWriter {
    /// Write `bytes` unless the stream is cancelled first. I/O is polled
    /// first so frames that fit the socket buffer still go out.
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        tokio::select! {
            biased;
            written = self.socket.write_all(bytes) => Ok(written?),
            _ = self.cancel.cancelled() => Err(TransportError::Cancelled),
        }
    }
}

#[async_trait]
impl StreamWriter for TcpStreamWriter {
    async fn write(&mut self, frame: ServerFrame) -> Result<()> {
        let bytes = encode_frame(&frame)?;
        self.send(&bytes).await
    }

    async fn finish(&mut self, status: Status) -> Result<()> {
        let bytes = encode_frame(&ServerFrame::Status(status))?;
        self.send(&bytes).await?;
        tokio::select! {
            biased;
            closed = self.socket.shutdown() => Ok(closed?),
            _ = self.cancel.cancelled() => Err(TransportError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_gate_core::{Initialize, Response};
    use std::time::Duration;

    async fn pair(config: TcpTransportConfig) -> (TcpIngestListener, TcpStream, ServerStream) {
        let listener = TcpIngestListener::bind("127.0.0.1:0", config).await.unwrap();
        let client = TcpStream::connect(listener.local_addr()).await.unwrap();
        let stream = listener.accept().await.unwrap().unwrap();
        (listener, client, stream)
    }

    async fn read_server_frame(client: &mut TcpStream) -> ServerFrame {
        let mut header = [0u8; FRAME_HEADER_LEN];
        client.read_exact(&mut header).await.unwrap();
        let size = frame_body_len(header, usize::MAX).unwrap();
        let mut body = vec![0u8; size];
        client.read_exact(&mut body).await.unwrap();
        decode_frame_body(&body).unwrap()
    }

    #[test]
    fn test_effective_quota() {
        let config = TcpTransportConfig {
            max_receive_message_size: 16 * 1024 * 1024,
            memory_quota: DEFAULT_MEMORY_QUOTA,
        };
        assert_eq!(config.effective_memory_quota(), 32 * 1024 * 1024);
        assert_eq!(
            TcpTransportConfig::default().effective_memory_quota(),
            DEFAULT_MEMORY_QUOTA
        );
    }

    #[tokio::test]
    async fn test_request_and_half_close() {
        let (_listener, mut client, mut stream) = pair(TcpTransportConfig::default()).await;

        let request = Request::Initialize(Initialize::default());
        let frame = encode_frame(&ClientFrame::Request(request.clone())).unwrap();
        client.write_all(&frame).await.unwrap();
        client
            .write_all(&encode_frame(&ClientFrame::HalfClose).unwrap())
            .await
            .unwrap();

        assert_eq!(stream.reader.read().await.unwrap(), Some(request));
        assert_eq!(stream.reader.read().await.unwrap(), None);
        assert!(!stream.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_close_without_half_close_is_disconnect() {
        let (_listener, client, mut stream) = pair(TcpTransportConfig::default()).await;
        drop(client);

        assert!(matches!(
            stream.reader.read().await,
            Err(TransportError::Disconnected)
        ));
        assert!(stream.cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_oversized_frame() {
        let config = TcpTransportConfig {
            max_receive_message_size: 8,
            memory_quota: 1024,
        };
        let (_listener, mut client, mut stream) = pair(config).await;
        client.write_all(&64u32.to_be_bytes()).await.unwrap();

        assert!(matches!(
            stream.reader.read().await,
            Err(TransportError::FrameTooLarge { size: 64, max: 8 })
        ));
    }

    #[tokio::test]
    async fn test_writes_and_finish() {
        let (_listener, mut client, mut stream) = pair(TcpTransportConfig::default()).await;

        let ack = ServerFrame::Response(Response::Ack { seq_no: 9 });
        stream.writer.write(ack.clone()).await.unwrap();
        stream.writer.finish(Status::ok()).await.unwrap();

        assert_eq!(read_server_frame(&mut client).await, ack);
        assert_eq!(
            read_server_frame(&mut client).await,
            ServerFrame::Status(Status::ok())
        );
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_cancel_interrupts_blocked_write() {
        let (_listener, _client, mut stream) = pair(TcpTransportConfig::default()).await;

        // Far more than the socket buffers hold; the client never reads.
        let big = ServerFrame::Response(Response::Initialized {
            session_id: "x".repeat(32 * 1024 * 1024),
            last_seq_no: 0,
        });
        let cancel = stream.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let written = tokio::time::timeout(Duration::from_secs(5), stream.writer.write(big))
            .await
            .expect("write was not interrupted");
        assert!(matches!(written, Err(TransportError::Cancelled)));
        assert!(matches!(
            stream.writer.finish(Status::cancelled("")).await,
            Err(TransportError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_pending_read() {
        let (_listener, _client, mut stream) = pair(TcpTransportConfig::default()).await;
        let cancel = stream.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let read = tokio::time::timeout(Duration::from_secs(5), stream.reader.read())
            .await
            .expect("read was not interrupted");
        assert!(matches!(read, Err(TransportError::Cancelled)));
    }

    #[tokio::test]
    async fn test_shutdown_ends_accept() {
        let listener = TcpIngestListener::bind("127.0.0.1:0", TcpTransportConfig::default())
            .await
            .unwrap();
        listener.shutdown().await;
        assert!(listener.accept().await.unwrap().is_none());
    }
}
