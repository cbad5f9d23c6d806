//! Test fixtures and helpers.
//!
//! A [`TestHarness`] runs an [`IngestServer`] over the in-memory transport
//! against a [`MemoryRouter`]; [`TestClient`] speaks the protocol from the
//! client side.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ingest_gate::{AgentConfig, EnvOverrides, IngestAgent};
use ingest_gate_core::{
    DataBatch, Headers, Initialize, MetaPair, Request, Response, SeqNo, ServerFrame, SessionId,
    Status,
};
use ingest_gate_router::{MemoryRouter, MemoryRouterConfig};
use ingest_gate_server::transport::memory::{self, MemoryClientStream, MemoryConnector};
use ingest_gate_server::{IngestServer, ServerConfig};
use tracing_subscriber::filter::LevelFilter;

/// How long helpers wait for the server before failing the test.
pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Send logs to the test writer so failing tests show them. Safe to call
/// from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(LevelFilter::DEBUG)
        .try_init();
}

/// Build an `Initialize` request.
pub fn init_request(session_id: &str, meta: &[(&str, &str)]) -> Request {
    Request::Initialize(Initialize {
        session_id: session_id.to_string(),
        shared_secret_key: String::new(),
        meta: meta.iter().map(|(k, v)| MetaPair::new(*k, *v)).collect(),
    })
}

/// Build a `DataBatch` with one small payload per sequence number.
pub fn batch_request(seq_nos: &[u64]) -> Request {
    Request::DataBatch(DataBatch {
        seq_no: seq_nos.to_vec(),
        timestamp: seq_nos.iter().map(|s| 1_000_000 + s).collect(),
        payload: seq_nos
            .iter()
            .map(|s| Bytes::from(format!("message {}", s)))
            .collect(),
        meta: vec![],
    })
}

enum Backend {
    Server(IngestServer),
    Agent(IngestAgent),
}

/// A server on the in-memory transport.
pub struct TestHarness {
    backend: Backend,
    connector: MemoryConnector,
    pub router: MemoryRouter,
}

impl TestHarness {
    /// Default server config, auto-acking router.
    pub fn new() -> Self {
        Self::with_config(ServerConfig::default(), MemoryRouterConfig::default())
    }

    pub fn with_config(config: ServerConfig, router_config: MemoryRouterConfig) -> Self {
        init_tracing();
        let router = MemoryRouter::with_config(router_config);
        let (listener, connector) = memory::channel();
        let server = IngestServer::start(config, Arc::new(listener), Arc::new(router.clone()));
        Self {
            backend: Backend::Server(server),
            connector,
            router,
        }
    }

    /// Build the server the way the agent does, from file-level config.
    pub fn from_agent_config(config: AgentConfig, env: EnvOverrides) -> Self {
        init_tracing();
        let router = MemoryRouter::new();
        let (listener, connector) = memory::channel();
        let agent =
            IngestAgent::with_listener(config, env, Arc::new(listener), Arc::new(router.clone()))
                .expect("agent config");
        Self {
            backend: Backend::Agent(agent),
            connector,
            router,
        }
    }

    pub fn server(&self) -> &IngestServer {
        match &self.backend {
            Backend::Server(server) => server,
            Backend::Agent(agent) => agent.server(),
        }
    }

    /// Open a new stream.
    pub async fn connect(&self) -> TestClient {
        let stream = self.connector.connect().await.expect("connect");
        TestClient {
            stream,
            headers: None,
        }
    }

    /// Wait until every stream's session has unregistered.
    pub async fn wait_idle(&self) {
        // The session waiting on accept stays registered.
        let server = self.server();
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        while server.active_sessions() > 1 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "sessions did not unregister"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Wait until the router holds `count` messages for `id`.
    pub async fn wait_messages(&self, id: &SessionId, count: usize) {
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        while self.router.messages(id).len() < count {
            assert!(
                tokio::time::Instant::now() < deadline,
                "router did not receive {} messages",
                count
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn stop(&self) {
        match &self.backend {
            Backend::Server(server) => server.stop().await,
            Backend::Agent(agent) => agent.stop().await,
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Client end of one stream.
pub struct TestClient {
    stream: MemoryClientStream,
    headers: Option<Headers>,
}

impl TestClient {
    pub fn send(&self, request: Request) {
        self.stream.send(request).expect("send");
    }

    pub fn initialize(&self, session_id: &str, meta: &[(&str, &str)]) {
        self.send(init_request(session_id, meta));
    }

    pub fn send_batch(&self, seq_nos: &[u64]) {
        self.send(batch_request(seq_nos));
    }

    pub fn half_close(&mut self) {
        self.stream.half_close();
    }

    /// Go away without closing gracefully.
    pub fn disconnect(self) {
        self.stream.disconnect();
    }

    /// Capability headers, once received.
    pub fn headers(&self) -> Option<&Headers> {
        self.headers.as_ref()
    }

    /// Next frame; `None` when the server closed the stream.
    pub async fn next_frame(&mut self) -> Option<ServerFrame> {
        let frame = tokio::time::timeout(TIMEOUT, self.stream.recv())
            .await
            .expect("timed out waiting for server frame");
        if let Some(ServerFrame::Headers(headers)) = &frame {
            self.headers = Some(headers.clone());
        }
        frame
    }

    /// Next response, skipping headers. Panics on a status.
    pub async fn next_response(&mut self) -> Response {
        loop {
            match self.next_frame().await {
                Some(ServerFrame::Headers(_)) => continue,
                Some(ServerFrame::Response(response)) => return response,
                Some(ServerFrame::Status(status)) => {
                    panic!("expected a response, stream finished with {}", status)
                }
                None => panic!("expected a response, stream closed"),
            }
        }
    }

    pub async fn expect_initialized(&mut self) -> (SessionId, SeqNo) {
        match self.next_response().await {
            Response::Initialized {
                session_id,
                last_seq_no,
            } => (SessionId::from(session_id), SeqNo(last_seq_no)),
            other => panic!("expected Initialized, got {:?}", other),
        }
    }

    pub async fn expect_ack(&mut self) -> SeqNo {
        match self.next_response().await {
            Response::Ack { seq_no } => SeqNo(seq_no),
            other => panic!("expected Ack, got {:?}", other),
        }
    }

    /// Read until the terminal status, returning the responses seen on the
    /// way. Panics if the stream closes without a status.
    pub async fn finish(&mut self) -> (Vec<Response>, Status) {
        let mut responses = Vec::new();
        loop {
            match self.next_frame().await {
                Some(ServerFrame::Headers(_)) => {}
                Some(ServerFrame::Response(response)) => responses.push(response),
                Some(ServerFrame::Status(status)) => return (responses, status),
                None => panic!("stream closed without a status"),
            }
        }
    }

    /// Terminal status, ignoring responses.
    pub async fn expect_status(&mut self) -> Status {
        self.finish().await.1
    }

    /// Whether the stream is closed after its status.
    pub async fn is_closed(&mut self) -> bool {
        self.next_frame().await.is_none()
    }
}
