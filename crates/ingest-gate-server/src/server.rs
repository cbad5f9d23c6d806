//! The ingest server: accept loop, active session set, shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use ingest_gate_core::{Headers, HEADER_MAX_RECEIVE_MESSAGE_SIZE, HEADER_REUSE_SESSIONS};
use ingest_gate_router::SessionRouter;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::pool::SessionIdsPool;
use crate::session::{Session, SessionHandle};
use crate::transport::Listener;

/// Pause before retrying a failed accept.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Point-in-time view of the server counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerCounters {
    /// Unexpected transport errors (accept, read, write, finish).
    pub transport_errors: u64,
    /// Data batches that passed validation.
    pub batches: u64,
    /// Payload bytes of those batches.
    pub batch_bytes: u64,
}

#[derive(Default)]
pub(crate) struct Counters {
    transport_errors: AtomicU64,
    batches: AtomicU64,
    batch_bytes: AtomicU64,
}

impl Counters {
    pub(crate) fn transport_error(&self) {
        self.transport_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_batch(&self, bytes: usize) {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.batch_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> ServerCounters {
        ServerCounters {
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            batch_bytes: self.batch_bytes.load(Ordering::Relaxed),
        }
    }
}

/// State shared by the server, its sessions, and their ingest tasks.
pub(crate) struct ServerShared {
    pub(crate) config: ServerConfig,
    pub(crate) router: Arc<dyn SessionRouter>,
    pub(crate) pool: SessionIdsPool,
    pub(crate) counters: Counters,
    stopping: AtomicBool,
    sessions: Mutex<HashMap<u64, SessionHandle>>,
    next_label: AtomicU64,
}

impl ServerShared {
    pub(crate) fn new(config: ServerConfig, router: Arc<dyn SessionRouter>) -> Self {
        let pool = SessionIdsPool::new(config.reuse.clone());
        Self {
            config,
            router,
            pool,
            counters: Counters::default(),
            stopping: AtomicBool::new(false),
            sessions: Mutex::new(HashMap::new()),
            next_label: AtomicU64::new(0),
        }
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub(crate) fn next_label(&self) -> u64 {
        self.next_label.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn register(&self, label: u64, handle: SessionHandle) {
        lock(&self.sessions).insert(label, handle);
    }

    pub(crate) fn unregister(&self, label: u64) {
        lock(&self.sessions).remove(&label);
    }

    pub(crate) fn active_sessions(&self) -> usize {
        lock(&self.sessions).len()
    }

    /// Capability headers sent at the start of every stream.
    pub(crate) fn initial_headers(&self) -> Headers {
        let mut headers = Headers::new();
        if self.pool.enabled() {
            headers.insert(HEADER_REUSE_SESSIONS.to_string(), "true".to_string());
        }
        headers.insert(
            HEADER_MAX_RECEIVE_MESSAGE_SIZE.to_string(),
            self.config.max_receive_message_size.to_string(),
        );
        headers
    }

    fn cancel_all(&self) {
        let handles: Vec<SessionHandle> = lock(&self.sessions).values().cloned().collect();
        for handle in handles {
            handle.try_cancel();
        }
    }
}

/// A running ingest server.
///
/// Exactly one accept is outstanding while the server runs. Every accepted
/// stream gets its own session, registered in the active set until both its
/// read and finish paths have completed.
pub struct IngestServer {
    shared: Arc<ServerShared>,
    listener: Arc<dyn Listener>,
    tracker: TaskTracker,
}

impl IngestServer {
    /// Start accepting streams from `listener`.
    pub fn start(
        config: ServerConfig,
        listener: Arc<dyn Listener>,
        router: Arc<dyn SessionRouter>,
    ) -> Self {
        let shared = Arc::new(ServerShared::new(config, router));
        let tracker = TaskTracker::new();
        tracker.spawn(accept_loop(
            Arc::clone(&shared),
            Arc::clone(&listener),
            tracker.clone(),
        ));
        info!(
            reuse = shared.pool.enabled(),
            max_receive_message_size = shared.config.max_receive_message_size,
            "ingest server started"
        );
        Self {
            shared,
            listener,
            tracker,
        }
    }

    /// Stop the server.
    ///
    /// Cancels every active session, shuts the listener down, and waits up
    /// to the configured grace period for all sessions to unregister.
    /// Calling it again returns immediately.
    pub async fn stop(&self) {
        if self.shared.stopping.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(active = self.shared.active_sessions(), "stopping");
        self.shared.cancel_all();
        self.listener.shutdown().await;
        self.tracker.close();

        let grace = self.shared.config.shutdown_grace;
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            warn!(
                active = self.shared.active_sessions(),
                "sessions still active after shutdown grace period"
            );
        }
        info!("stopped");
    }

    pub fn counters(&self) -> ServerCounters {
        self.shared.counters.snapshot()
    }

    /// Sessions registered right now, including the one waiting on accept.
    pub fn active_sessions(&self) -> usize {
        self.shared.active_sessions()
    }

    pub fn pool(&self) -> &SessionIdsPool {
        &self.shared.pool
    }

    pub fn is_stopping(&self) -> bool {
        self.shared.is_stopping()
    }
}

async fn accept_loop(shared: Arc<ServerShared>, listener: Arc<dyn Listener>, tracker: TaskTracker) {
    loop {
        let (session, handle) = Session::new(Arc::clone(&shared));
        shared.register(session.label(), handle.clone());

        match listener.accept().await {
            Ok(Some(stream)) => {
                tracker.spawn(session.run(stream));
                if shared.is_stopping() {
                    handle.try_cancel();
                }
            }
            Ok(None) => {
                session.discard(None);
                break;
            }
            Err(err) => {
                session.discard(Some(&err));
                if shared.is_stopping() {
                    break;
                }
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
    info!("accept loop exited");
}

impl std::fmt::Debug for IngestServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestServer")
            .field("active_sessions", &self.active_sessions())
            .field("stopping", &self.is_stopping())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::{self, MemoryClientStream};
    use bytes::Bytes;
    use ingest_gate_core::{
        DataBatch, Initialize, MetaPair, Request, Response, SeqNo, ServerFrame, SessionId,
        Status, StatusCode,
    };
    use crate::error::TransportError;
    use ingest_gate_router::{MemoryRouter, MemoryRouterConfig};

    struct Fixture {
        server: IngestServer,
        connector: memory::MemoryConnector,
        router: MemoryRouter,
    }

    fn fixture_with(config: ServerConfig, router: MemoryRouter) -> Fixture {
        crate::init_test_tracing();
        let (listener, connector) = memory::channel();
        let server = IngestServer::start(config, Arc::new(listener), Arc::new(router.clone()));
        Fixture {
            server,
            connector,
            router,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(ServerConfig::default(), MemoryRouter::new())
    }

    fn init(session_id: &str, meta: &[(&str, &str)]) -> Request {
        Request::Initialize(Initialize {
            session_id: session_id.into(),
            shared_secret_key: String::new(),
            meta: meta.iter().map(|(k, v)| MetaPair::new(*k, *v)).collect(),
        })
    }

    fn batch(seq_nos: &[u64]) -> Request {
        Request::DataBatch(DataBatch {
            seq_no: seq_nos.to_vec(),
            timestamp: seq_nos.to_vec(),
            payload: seq_nos.iter().map(|_| Bytes::from_static(b"x")).collect(),
            meta: vec![],
        })
    }

    async fn recv(client: &mut MemoryClientStream) -> ServerFrame {
        tokio::time::timeout(Duration::from_secs(5), client.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("stream closed")
    }

    async fn recv_status(client: &mut MemoryClientStream) -> Status {
        loop {
            if let ServerFrame::Status(status) = recv(client).await {
                return status;
            }
        }
    }

    /// Fails the first accept, then serves the in-memory transport.
    struct FailingOnceListener {
        inner: memory::MemoryListener,
        failed: AtomicBool,
    }

    #[async_trait::async_trait]
    impl Listener for FailingOnceListener {
        async fn accept(&self) -> crate::error::Result<Option<crate::transport::ServerStream>> {
            if !self.failed.swap(true, Ordering::AcqRel) {
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionAborted,
                    "accept failed",
                )));
            }
            self.inner.accept().await
        }

        async fn shutdown(&self) {
            self.inner.shutdown().await;
        }
    }

    async fn wait_idle(server: &IngestServer) {
        // Only the session waiting on accept remains.
        for _ in 0..200 {
            if server.active_sessions() == 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("sessions did not unregister");
    }

    #[tokio::test]
    async fn test_headers_then_initialized_then_ack() {
        let f = fixture();
        let mut client = f.connector.connect().await.unwrap();
        client.send(init("", &[])).unwrap();
        client.send(batch(&[1, 2])).unwrap();

        match recv(&mut client).await {
            ServerFrame::Headers(headers) => {
                assert_eq!(headers.get(HEADER_REUSE_SESSIONS).map(String::as_str), Some("true"));
                assert_eq!(
                    headers.get(HEADER_MAX_RECEIVE_MESSAGE_SIZE).map(String::as_str),
                    Some("4194304")
                );
            }
            other => panic!("expected headers, got {:?}", other),
        }
        match recv(&mut client).await {
            ServerFrame::Response(Response::Initialized {
                session_id,
                last_seq_no,
            }) => {
                assert!(!session_id.is_empty());
                assert_eq!(last_seq_no, 0);
            }
            other => panic!("expected initialized, got {:?}", other),
        }
        assert_eq!(
            recv(&mut client).await,
            ServerFrame::Response(Response::Ack { seq_no: 2 })
        );

        client.half_close();
        assert_eq!(recv_status(&mut client).await, Status::ok());
        wait_idle(&f.server).await;
        assert_eq!(f.server.counters().batches, 1);
        f.server.stop().await;
    }

    #[tokio::test]
    async fn test_failed_accept_is_retried() {
        crate::init_test_tracing();
        let (inner, connector) = memory::channel();
        let listener = Arc::new(FailingOnceListener {
            inner,
            failed: AtomicBool::new(false),
        });
        let router = MemoryRouter::new();
        let server = IngestServer::start(
            ServerConfig::default(),
            listener.clone(),
            Arc::new(router.clone()),
        );

        let mut client = connector.connect().await.unwrap();
        client.send(init("after-retry", &[])).unwrap();
        assert!(matches!(recv(&mut client).await, ServerFrame::Headers(_)));
        assert!(matches!(
            recv(&mut client).await,
            ServerFrame::Response(Response::Initialized { .. })
        ));

        assert!(listener.failed.load(Ordering::Acquire));
        assert_eq!(server.counters().transport_errors, 1);
        // The failed session is gone: one streaming, one waiting on accept.
        assert_eq!(server.active_sessions(), 2);
        assert_eq!(router.active_count(), 1);

        client.half_close();
        assert_eq!(recv_status(&mut client).await, Status::ok());
        wait_idle(&server).await;
        server.stop().await;
        assert_eq!(server.active_sessions(), 0);
    }

    #[tokio::test]
    async fn test_reuse_header_absent_when_disabled() {
        let mut config = ServerConfig::default();
        config.reuse.enabled = false;
        let f = fixture_with(config, MemoryRouter::new());
        let mut client = f.connector.connect().await.unwrap();
        match recv(&mut client).await {
            ServerFrame::Headers(headers) => assert!(!headers.contains_key(HEADER_REUSE_SESSIONS)),
            other => panic!("expected headers, got {:?}", other),
        }
        f.server.stop().await;
    }

    #[tokio::test]
    async fn test_protocol_violation_finishes_once() {
        let f = fixture();
        let mut client = f.connector.connect().await.unwrap();
        client.send(batch(&[1])).unwrap();

        let status = recv_status(&mut client).await;
        assert_eq!(status.code, StatusCode::InvalidArgument);
        assert_eq!(status.message, "expected Initialize");
        // The stream ends after the single terminal status.
        let rest = tokio::time::timeout(Duration::from_secs(5), client.recv())
            .await
            .unwrap();
        assert!(rest.is_none());
        f.server.stop().await;
    }

    #[tokio::test]
    async fn test_downstream_stopped_with_force_on_error() {
        let f = fixture();
        let mut client = f.connector.connect().await.unwrap();
        client.send(init("fixed", &[])).unwrap();
        client.send(batch(&[2, 1])).unwrap();

        let status = recv_status(&mut client).await;
        assert_eq!(status.code, StatusCode::FailedPrecondition);
        wait_idle(&f.server).await;
        let stops = f.router.stops();
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].session_id, SessionId::from("fixed"));
        assert!(stops[0].force);
        f.server.stop().await;
    }

    #[tokio::test]
    async fn test_disconnect_stashes_reusable_id() {
        let f = fixture();
        let mut client = f.connector.connect().await.unwrap();
        client
            .send(init("", &[("_reusable", "true"), ("k", "v")]))
            .unwrap();
        let id = loop {
            if let ServerFrame::Response(Response::Initialized { session_id, .. }) =
                recv(&mut client).await
            {
                break session_id;
            }
        };
        drop(client);

        wait_idle(&f.server).await;
        assert_eq!(f.server.pool().len(), 1);
        assert_eq!(
            f.server.pool().try_reuse(&ingest_gate_core::ReuseKey::from("k=v")),
            Some(SessionId::from(id))
        );
        f.server.stop().await;
    }

    #[tokio::test]
    async fn test_out_of_order_ack_finishes_with_internal() {
        let router = MemoryRouter::with_config(MemoryRouterConfig {
            auto_ack: false,
            ..MemoryRouterConfig::default()
        });
        let f = fixture_with(ServerConfig::default(), router);
        let mut client = f.connector.connect().await.unwrap();
        client.send(init("acks", &[])).unwrap();
        client.send(batch(&[1, 2, 3])).unwrap();

        let id = SessionId::from("acks");
        for _ in 0..200 {
            if f.router.messages(&id).len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(f.router.ack(&id, SeqNo(3)));
        assert!(f.router.ack(&id, SeqNo(2)));

        let status = recv_status(&mut client).await;
        assert_eq!(status.code, StatusCode::Internal);
        f.server.stop().await;
    }

    #[tokio::test]
    async fn test_stop_cancels_sessions_and_is_idempotent() {
        let f = fixture();
        let mut client = f.connector.connect().await.unwrap();
        client.send(init("", &[])).unwrap();
        assert!(matches!(recv(&mut client).await, ServerFrame::Headers(_)));

        f.server.stop().await;
        assert_eq!(f.server.active_sessions(), 0);
        assert!(f.server.is_stopping());
        f.server.stop().await;

        // Cancelled streams may or may not get their status out.
        let rest = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(frame) = client.recv().await {
                if let ServerFrame::Status(status) = frame {
                    assert!(!status.is_ok());
                }
            }
        })
        .await;
        assert!(rest.is_ok());
        assert!(f.router.stops().iter().all(|stop| stop.force));
    }
}
