//! The ingest agent: config in, listening server out.

use std::net::SocketAddr;
use std::sync::Arc;

use ingest_gate_router::SessionRouter;
use ingest_gate_server::{IngestServer, Listener, ServerCounters, TcpIngestListener};
use tracing::info;

use crate::config::{AgentConfig, EnvOverrides};
use crate::error::{GateError, Result};

/// A running gateway.
///
/// Owns an [`IngestServer`] and, when started over TCP, its listening
/// socket address.
pub struct IngestAgent {
    server: IngestServer,
    local_addr: Option<SocketAddr>,
}

impl IngestAgent {
    /// Validate `config`, resolve its secret, bind TCP, and start serving.
    ///
    /// Environment overrides are read from the process environment.
    pub async fn start(config: AgentConfig, router: Arc<dyn SessionRouter>) -> Result<Self> {
        Self::start_with_env(config, EnvOverrides::from_env(), router).await
    }

    /// Like [`start`](Self::start) with explicit environment overrides.
    pub async fn start_with_env(
        config: AgentConfig,
        env: EnvOverrides,
        router: Arc<dyn SessionRouter>,
    ) -> Result<Self> {
        config.validate()?;
        let secret = config.resolve_secret()?;
        let addr = config.listen_addr()?;

        let listener = TcpIngestListener::bind(addr, config.transport_config())
            .await
            .map_err(|source| GateError::Bind {
                uri: config.uri.clone(),
                source,
            })?;
        let local_addr = listener.local_addr();

        let server = IngestServer::start(
            config.server_config(secret, &env),
            Arc::new(listener),
            router,
        );
        info!(%local_addr, "listening");
        Ok(Self {
            server,
            local_addr: Some(local_addr),
        })
    }

    /// Serve streams from an arbitrary listener (e.g. the in-memory
    /// transport). The config is validated as for TCP, but its `uri` and
    /// transport settings are not used.
    pub fn with_listener(
        config: AgentConfig,
        env: EnvOverrides,
        listener: Arc<dyn Listener>,
        router: Arc<dyn SessionRouter>,
    ) -> Result<Self> {
        config.validate()?;
        let secret = config.resolve_secret()?;
        let server = IngestServer::start(config.server_config(secret, &env), listener, router);
        Ok(Self {
            server,
            local_addr: None,
        })
    }

    /// Bound TCP address, if any.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn server(&self) -> &IngestServer {
        &self.server
    }

    pub fn counters(&self) -> ServerCounters {
        self.server.counters()
    }

    /// Stop serving. See [`IngestServer::stop`].
    pub async fn stop(&self) {
        self.server.stop().await;
    }
}
