//! In-memory implementation of the SessionRouter trait.
//!
//! This is primarily for testing and embedding. Submitted messages are kept
//! per session, acknowledged sequence numbers survive a session stop so a
//! resuming client picks up where it left off, and start results can be
//! scripted to exercise the gateway's error paths.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use ingest_gate_core::{SeqItem, SeqNo, SessionId, SessionMeta};
use tracing::{debug, warn};

use crate::traits::{
    MessageConsumer, SessionHandler, SessionRouter, StartOptions, StartSessionResult,
};

/// Configuration for [`MemoryRouter`].
#[derive(Debug, Clone)]
pub struct MemoryRouterConfig {
    /// Acknowledge each submitted batch immediately.
    pub auto_ack: bool,

    /// How many sessions may start without `ignore_rate_limit` before
    /// further starts are throttled. `None` means unlimited.
    pub new_session_budget: Option<usize>,
}

impl Default for MemoryRouterConfig {
    fn default() -> Self {
        Self {
            auto_ack: true,
            new_session_budget: None,
        }
    }
}

/// A recorded `stop_session` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopRecord {
    pub session_id: SessionId,
    pub force: bool,
}

/// In-memory router.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MemoryRouter {
    shared: Arc<Shared>,
}

struct Shared {
    config: MemoryRouterConfig,
    inner: Mutex<MemoryRouterInner>,
}

struct MemoryRouterInner {
    /// Running sessions.
    active: HashMap<SessionId, Arc<dyn SessionHandler>>,

    /// Highest acknowledged sequence number per session, kept across stops.
    acked: HashMap<SessionId, SeqNo>,

    /// Every message ever submitted, per session.
    messages: HashMap<SessionId, Vec<SeqItem>>,

    /// Options of every successful start, in order.
    starts: Vec<(SessionId, SessionMeta, StartOptions)>,

    stops: Vec<StopRecord>,

    /// Remaining rate-limited starts.
    budget: Option<usize>,

    /// Scripted result for the next start.
    fail_next: Option<StartSessionResult>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, MemoryRouterInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MemoryRouter {
    /// Create a router with default configuration.
    pub fn new() -> Self {
        Self::with_config(MemoryRouterConfig::default())
    }

    pub fn with_config(config: MemoryRouterConfig) -> Self {
        let budget = config.new_session_budget;
        Self {
            shared: Arc::new(Shared {
                config,
                inner: Mutex::new(MemoryRouterInner {
                    active: HashMap::new(),
                    acked: HashMap::new(),
                    messages: HashMap::new(),
                    starts: Vec::new(),
                    stops: Vec::new(),
                    budget,
                    fail_next: None,
                }),
            }),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Scripting
    // ─────────────────────────────────────────────────────────────────────

    /// Make the next `start_session` return `result` without starting.
    pub fn fail_next_start(&self, result: StartSessionResult) {
        self.shared.lock().fail_next = Some(result);
    }

    /// Pretend `seq_no` was already acknowledged for `id`.
    pub fn set_last_seq_no(&self, id: &SessionId, seq_no: SeqNo) {
        self.shared.lock().acked.insert(id.clone(), seq_no);
    }

    /// Acknowledge `seq_no` on a running session (for `auto_ack = false`).
    ///
    /// Returns false if the session is not running.
    pub fn ack(&self, id: &SessionId, seq_no: SeqNo) -> bool {
        let handler = {
            let mut inner = self.shared.lock();
            let Some(handler) = inner.active.get(id).cloned() else {
                return false;
            };
            record_ack(&mut inner, id, seq_no);
            handler
        };
        handler.ack(seq_no);
        true
    }

    // ─────────────────────────────────────────────────────────────────────
    // Inspection
    // ─────────────────────────────────────────────────────────────────────

    pub fn is_active(&self, id: &SessionId) -> bool {
        self.shared.lock().active.contains_key(id)
    }

    pub fn active_count(&self) -> usize {
        self.shared.lock().active.len()
    }

    /// All messages submitted for `id`, in submission order.
    pub fn messages(&self, id: &SessionId) -> Vec<SeqItem> {
        self.shared
            .lock()
            .messages
            .get(id)
            .cloned()
            .unwrap_or_default()
    }

    /// Highest acknowledged sequence number for `id`.
    pub fn last_acked(&self, id: &SessionId) -> SeqNo {
        self.shared
            .lock()
            .acked
            .get(id)
            .copied()
            .unwrap_or(SeqNo::ZERO)
    }

    /// Every successful start as `(id, meta, options)`.
    pub fn starts(&self) -> Vec<(SessionId, SessionMeta, StartOptions)> {
        self.shared.lock().starts.clone()
    }

    pub fn stops(&self) -> Vec<StopRecord> {
        self.shared.lock().stops.clone()
    }
}

impl Default for MemoryRouter {
    fn default() -> Self {
        Self::new()
    }
}

fn record_ack(inner: &mut MemoryRouterInner, id: &SessionId, seq_no: SeqNo) {
    let acked = inner.acked.entry(id.clone()).or_insert(SeqNo::ZERO);
    if seq_no > *acked {
        *acked = seq_no;
    }
}

#[async_trait]
impl SessionRouter for MemoryRouter {
    fn start_session(
        &self,
        id: &SessionId,
        meta: SessionMeta,
        handler: Arc<dyn SessionHandler>,
        options: StartOptions,
    ) -> StartSessionResult {
        let last_seq_no = {
            let mut inner = self.shared.lock();

            if let Some(result) = inner.fail_next.take() {
                debug!(session_id = %id, ?result, "scripted start result");
                return result;
            }
            if inner.active.contains_key(id) {
                return StartSessionResult::AlreadyStarted;
            }
            if !options.ignore_rate_limit {
                match inner.budget.as_mut() {
                    Some(0) => return StartSessionResult::Throttled,
                    Some(remaining) => *remaining -= 1,
                    None => {}
                }
            }

            inner.active.insert(id.clone(), Arc::clone(&handler));
            inner.starts.push((id.clone(), meta, options));
            inner.acked.get(id).copied().unwrap_or(SeqNo::ZERO)
        };

        debug!(session_id = %id, %last_seq_no, "router session started");
        let consumer = Arc::new(MemoryConsumer {
            shared: Arc::clone(&self.shared),
            session_id: id.clone(),
            handler: Arc::clone(&handler),
        });
        handler.start(last_seq_no, consumer);
        StartSessionResult::Ok
    }

    async fn stop_session(&self, id: &SessionId, force: bool) {
        let mut inner = self.shared.lock();
        if inner.active.remove(id).is_none() {
            warn!(session_id = %id, "stop for unknown router session");
        }
        inner.stops.push(StopRecord {
            session_id: id.clone(),
            force,
        });
        debug!(session_id = %id, force, "router session stopped");
    }
}

/// Consumer handed to handlers started by [`MemoryRouter`].
pub struct MemoryConsumer {
    shared: Arc<Shared>,
    session_id: SessionId,
    handler: Arc<dyn SessionHandler>,
}

impl MessageConsumer for MemoryConsumer {
    fn submit(&self, batch: Vec<SeqItem>) {
        let Some(last) = batch.last().map(|item| item.seq_no) else {
            return;
        };

        let ack = {
            let mut inner = self.shared.lock();
            inner
                .messages
                .entry(self.session_id.clone())
                .or_default()
                .extend(batch);
            if self.shared.config.auto_ack && inner.active.contains_key(&self.session_id) {
                record_ack(&mut inner, &self.session_id, last);
                true
            } else {
                false
            }
        };

        if ack {
            self.handler.ack(last);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_gate_core::Message;

    #[derive(Default)]
    struct RecordingHandler {
        started: Mutex<Option<(SeqNo, Arc<dyn MessageConsumer>)>>,
        acks: Mutex<Vec<SeqNo>>,
    }

    impl RecordingHandler {
        fn consumer(&self) -> Arc<dyn MessageConsumer> {
            let started = self.started.lock().unwrap();
            Arc::clone(&started.as_ref().unwrap().1)
        }

        fn last_seq_no(&self) -> SeqNo {
            self.started.lock().unwrap().as_ref().unwrap().0
        }
    }

    impl SessionHandler for RecordingHandler {
        fn start(&self, last_seq_no: SeqNo, consumer: Arc<dyn MessageConsumer>) {
            *self.started.lock().unwrap() = Some((last_seq_no, consumer));
        }

        fn ack(&self, seq_no: SeqNo) {
            self.acks.lock().unwrap().push(seq_no);
        }
    }

    fn item(seq: u64) -> SeqItem {
        SeqItem {
            seq_no: SeqNo(seq),
            message: Message::new(format!("m{}", seq), seq * 10),
        }
    }

    #[tokio::test]
    async fn test_start_submit_ack() {
        let router = MemoryRouter::new();
        let id = SessionId::from("s1");
        let handler = Arc::new(RecordingHandler::default());

        let result = router.start_session(
            &id,
            SessionMeta::new(),
            handler.clone(),
            StartOptions::default(),
        );
        assert_eq!(result, StartSessionResult::Ok);
        assert_eq!(handler.last_seq_no(), SeqNo::ZERO);

        handler.consumer().submit(vec![item(1), item(2)]);
        assert_eq!(router.messages(&id).len(), 2);
        assert_eq!(*handler.acks.lock().unwrap(), vec![SeqNo(2)]);
        assert_eq!(router.last_acked(&id), SeqNo(2));
    }

    #[tokio::test]
    async fn test_duplicate_start_rejected() {
        let router = MemoryRouter::new();
        let id = SessionId::from("s1");
        let handler = Arc::new(RecordingHandler::default());
        router.start_session(&id, SessionMeta::new(), handler.clone(), StartOptions::default());

        let again = router.start_session(&id, SessionMeta::new(), handler, StartOptions::default());
        assert_eq!(again, StartSessionResult::AlreadyStarted);
    }

    #[tokio::test]
    async fn test_resume_reports_last_acked() {
        let router = MemoryRouter::new();
        let id = SessionId::from("s1");
        let first = Arc::new(RecordingHandler::default());
        router.start_session(&id, SessionMeta::new(), first.clone(), StartOptions::default());
        first.consumer().submit(vec![item(1), item(2), item(3)]);
        router.stop_session(&id, false).await;

        let second = Arc::new(RecordingHandler::default());
        router.start_session(&id, SessionMeta::new(), second.clone(), StartOptions::default());
        assert_eq!(second.last_seq_no(), SeqNo(3));
        assert_eq!(
            router.stops(),
            vec![StopRecord {
                session_id: id,
                force: false
            }]
        );
    }

    #[tokio::test]
    async fn test_budget_throttles_unless_ignored() {
        let router = MemoryRouter::with_config(MemoryRouterConfig {
            new_session_budget: Some(1),
            ..MemoryRouterConfig::default()
        });
        let handler = Arc::new(RecordingHandler::default());
        let options = StartOptions::default();

        let a = router.start_session(&"a".into(), SessionMeta::new(), handler.clone(), options.clone());
        let b = router.start_session(&"b".into(), SessionMeta::new(), handler.clone(), options);
        assert_eq!(a, StartSessionResult::Ok);
        assert_eq!(b, StartSessionResult::Throttled);

        let bypass = StartOptions {
            ignore_rate_limit: true,
            ..StartOptions::default()
        };
        let c = router.start_session(&"c".into(), SessionMeta::new(), handler, bypass);
        assert_eq!(c, StartSessionResult::Ok);
    }

    #[tokio::test]
    async fn test_manual_ack() {
        let router = MemoryRouter::with_config(MemoryRouterConfig {
            auto_ack: false,
            ..MemoryRouterConfig::default()
        });
        let id = SessionId::from("s1");
        let handler = Arc::new(RecordingHandler::default());
        router.start_session(&id, SessionMeta::new(), handler.clone(), StartOptions::default());

        handler.consumer().submit(vec![item(1)]);
        assert!(handler.acks.lock().unwrap().is_empty());

        assert!(router.ack(&id, SeqNo(1)));
        assert_eq!(*handler.acks.lock().unwrap(), vec![SeqNo(1)]);
        assert!(!router.ack(&SessionId::from("missing"), SeqNo(1)));
    }

    #[tokio::test]
    async fn test_scripted_failure_is_one_shot() {
        let router = MemoryRouter::new();
        router.fail_next_start(StartSessionResult::Error("downstream down".into()));
        let handler = Arc::new(RecordingHandler::default());

        let first = router.start_session(&"s".into(), SessionMeta::new(), handler.clone(), StartOptions::default());
        assert_eq!(first, StartSessionResult::Error("downstream down".into()));
        assert!(handler.started.lock().unwrap().is_none());

        let second = router.start_session(&"s".into(), SessionMeta::new(), handler, StartOptions::default());
        assert_eq!(second, StartSessionResult::Ok);
    }
}
