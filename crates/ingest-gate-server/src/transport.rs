//! Transport abstraction for ingestion streams.
//!
//! A transport hands the server bidirectional streams. Each stream has a
//! reader for client requests, a writer for server frames, and a
//! cancellation token that fires when the stream is torn down by either
//! side. Implementations may use TCP, in-process channels, or anything
//! that can carry [`Request`]s and [`ServerFrame`]s.

use async_trait::async_trait;
use ingest_gate_core::{Request, ServerFrame, Status};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Source of inbound streams.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Wait for the next stream.
    ///
    /// Returns `Ok(None)` once the listener has been shut down.
    async fn accept(&self) -> Result<Option<ServerStream>>;

    /// Stop accepting. Pending and later `accept` calls return `Ok(None)`.
    async fn shutdown(&self);
}

/// Read half of a stream.
#[async_trait]
pub trait StreamReader: Send {
    /// Read the next request.
    ///
    /// Returns `Ok(None)` when the client half-closed its side. A client
    /// that goes away without half-closing yields an error and fires the
    /// stream's cancellation token.
    async fn read(&mut self) -> Result<Option<Request>>;
}

/// Write half of a stream.
#[async_trait]
pub trait StreamWriter: Send {
    /// Write one frame. Never called concurrently.
    async fn write(&mut self, frame: ServerFrame) -> Result<()>;

    /// Send the terminal status and close the write side.
    async fn finish(&mut self, status: Status) -> Result<()>;
}

/// An accepted stream.
pub struct ServerStream {
    /// Peer description for logs.
    pub peer: String,
    pub reader: Box<dyn StreamReader>,
    pub writer: Box<dyn StreamWriter>,
    /// Fires when the stream is cancelled by either side.
    pub cancel: CancellationToken,
}

/// A simple in-memory transport for testing.
///
/// Uses channels to simulate a network: a [`MemoryConnector`] opens
/// streams that a [`MemoryListener`] accepts.
pub mod memory {
    use super::*;
    use crate::error::TransportError;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use tokio::sync::{mpsc, Mutex};

    /// Create a connected listener/connector pair.
    pub fn channel() -> (MemoryListener, MemoryConnector) {
        let (tx, rx) = mpsc::channel(64);
        let closed = CancellationToken::new();
        (
            MemoryListener {
                incoming: Mutex::new(rx),
                closed: closed.clone(),
            },
            MemoryConnector {
                incoming: tx,
                closed,
                next_peer: Arc::new(AtomicU64::new(0)),
            },
        )
    }

    /// Server side of the in-memory network.
    pub struct MemoryListener {
        incoming: Mutex<mpsc::Receiver<ServerStream>>,
        closed: CancellationToken,
    }

    #[async_trait]
    impl Listener for MemoryListener {
        async fn accept(&self) -> Result<Option<ServerStream>> {
            let mut incoming = self.incoming.lock().await;
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => Ok(None),
                stream = incoming.recv() => Ok(stream),
            }
        }

        async fn shutdown(&self) {
            self.closed.cancel();
        }
    }

    /// Client side of the in-memory network.
    #[derive(Clone)]
    pub struct MemoryConnector {
        incoming: mpsc::Sender<ServerStream>,
        closed: CancellationToken,
        next_peer: Arc<AtomicU64>,
    }

    impl MemoryConnector {
        /// Open a new stream to the listener.
        pub async fn connect(&self) -> Result<MemoryClientStream> {
            if self.closed.is_cancelled() {
                return Err(TransportError::Closed);
            }
            let (request_tx, request_rx) = mpsc::unbounded_channel();
            let (frame_tx, frame_rx) = mpsc::unbounded_channel();
            let cancel = CancellationToken::new();
            let peer = format!("memory:{}", self.next_peer.fetch_add(1, Ordering::Relaxed));

            let stream = ServerStream {
                peer,
                reader: Box::new(MemoryStreamReader {
                    requests: request_rx,
                    cancel: cancel.clone(),
                }),
                writer: Box::new(MemoryStreamWriter {
                    frames: Some(frame_tx),
                    cancel: cancel.clone(),
                }),
                cancel: cancel.clone(),
            };
            self.incoming
                .send(stream)
                .await
                .map_err(|_| TransportError::Closed)?;

            Ok(MemoryClientStream {
                requests: Some(request_tx),
                frames: frame_rx,
                cancel,
            })
        }
    }

    /// Client end of an in-memory stream.
    ///
    /// Dropping it without [`half_close`](Self::half_close) cancels the
    /// stream, like a client process going away.
    pub struct MemoryClientStream {
        requests: Option<mpsc::UnboundedSender<Request>>,
        frames: mpsc::UnboundedReceiver<ServerFrame>,
        cancel: CancellationToken,
    }

    impl MemoryClientStream {
        pub fn send(&self, request: Request) -> Result<()> {
            let requests = self.requests.as_ref().ok_or(TransportError::Closed)?;
            if self.cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            requests
                .send(request)
                .map_err(|_| TransportError::Disconnected)
        }

        /// No more requests will follow.
        pub fn half_close(&mut self) {
            self.requests = None;
        }

        /// Tear the stream down without a graceful close.
        pub fn disconnect(&self) {
            self.cancel.cancel();
        }

        /// Next frame from the server; `None` once the server dropped the
        /// stream.
        pub async fn recv(&mut self) -> Option<ServerFrame> {
            self.frames.recv().await
        }
    }

    impl Drop for MemoryClientStream {
        fn drop(&mut self) {
            if self.requests.is_some() {
                self.cancel.cancel();
            }
        }
    }

    struct MemoryStreamReader {
        requests: mpsc::UnboundedReceiver<Request>,
        cancel: CancellationToken,
    }

    #[async_trait]
    impl StreamReader for MemoryStreamReader {
        async fn read(&mut self) -> Result<Option<Request>> {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Err(TransportError::Cancelled),
                request = self.requests.recv() => Ok(request),
            }
        }
    }

    struct MemoryStreamWriter {
        frames: Option<mpsc::UnboundedSender<ServerFrame>>,
        cancel: CancellationToken,
    }

    #[async_trait]
    impl StreamWriter for MemoryStreamWriter {
        async fn write(&mut self, frame: ServerFrame) -> Result<()> {
            if self.cancel.is_cancelled() {
                return Err(TransportError::Cancelled);
            }
            let frames = self.frames.as_ref().ok_or(TransportError::Closed)?;
            frames
                .send(frame)
                .map_err(|_| TransportError::Disconnected)
        }

        async fn finish(&mut self, status: Status) -> Result<()> {
            let frames = self.frames.take().ok_or(TransportError::Closed)?;
            frames
                .send(ServerFrame::Status(status))
                .map_err(|_| TransportError::Disconnected)
        }
    }
}
