//! Per-session ingest pipeline.
//!
//! Requests read from a stream are queued here and processed by a single
//! worker task per session, so decoding, validation, sequencing, and
//! downstream submission for one session never run concurrently. Enqueuing
//! into an empty queue pulses the worker; the worker takes the whole queue
//! as a snapshot and drives it through
//!
//! ```text
//! Initialize -> PrepareBatch <-> SubmitBatch
//!                     |
//!                   Error
//! ```
//!
//! yielding to the scheduler after each submitted chunk. A protocol
//! violation or the poison pill moves the pipeline to `Error`, asks the
//! session to finish, and discards whatever is still queued.

use std::collections::{BTreeMap, VecDeque};
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};

use ingest_gate_core::{
    decode_meta, DataBatch, DecodeError, Message, Request, ReuseKey, SeqItem, SeqNo, SessionId,
    SessionMeta, RECEIPT_TIMESTAMP_META_KEY,
};
use ingest_gate_router::{
    FaultTolerance, InflightAction, MessageConsumer, SessionHandler, StartOptions,
    StartSessionResult,
};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, Instrument};

use crate::error::IngestError;
use crate::server::ServerShared;
use crate::session::SessionHandle;

/// Most messages handed to the consumer in one `submit` call.
pub const MAX_SUBMIT_BATCH: usize = 1000;

/// Wall-clock microseconds since the Unix epoch.
pub(crate) fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// A decoded request and the time it was read.
pub(crate) struct ReceivedRequest {
    pub request: Request,
    pub received_at_us: u64,
}

impl ReceivedRequest {
    pub(crate) fn new(request: Request) -> Self {
        Self {
            request,
            received_at_us: now_micros(),
        }
    }
}

/// Handle to a session's ingest pipeline.
#[derive(Clone)]
pub(crate) struct IngestTask {
    shared: Arc<TaskShared>,
}

struct TaskShared {
    server: Arc<ServerShared>,
    session: SessionHandle,
    queue: Mutex<RequestQueue>,
    pulse: Notify,
    state: Mutex<TaskState>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Default)]
struct RequestQueue {
    requests: Vec<ReceivedRequest>,
    stopping: bool,
    force: bool,
}

/// State shared with the downstream handler and the session driver.
#[derive(Default)]
struct TaskState {
    /// Set by the downstream on start, taken by the worker.
    started: Option<(Arc<dyn MessageConsumer>, SeqNo)>,
    session_id: Option<SessionId>,
    reuse_key: Option<ReuseKey>,
    client_cancelled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Initialize,
    PrepareBatch,
    SubmitBatch,
    Error,
}

/// Worker-owned pipeline state.
struct TaskData {
    phase: Phase,
    requests: VecDeque<ReceivedRequest>,
    consumer: Option<Arc<dyn MessageConsumer>>,
    last_seq_no: SeqNo,
    reuse_key: Option<ReuseKey>,
    /// Prepared messages not yet submitted.
    batch: VecDeque<SeqItem>,
}

enum Snapshot {
    Requests(Vec<ReceivedRequest>),
    Idle,
    Stopped,
}

enum Activation {
    /// Queue snapshot exhausted.
    Idle,
    /// A chunk was submitted; let other tasks run.
    Yield,
    /// The pipeline failed.
    Halt,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl IngestTask {
    /// Create the pipeline and start its worker.
    pub(crate) fn spawn(server: Arc<ServerShared>, session: SessionHandle) -> Self {
        let task = Self {
            shared: Arc::new(TaskShared {
                server,
                session,
                queue: Mutex::new(RequestQueue::default()),
                pulse: Notify::new(),
                state: Mutex::new(TaskState::default()),
                worker: Mutex::new(None),
            }),
        };
        let worker = tokio::spawn(task.clone().run().in_current_span());
        *lock(&task.shared.worker) = Some(worker);
        info!("ingest task started");
        task
    }

    /// Queue a request. Returns false once the task is stopping.
    pub(crate) fn enqueue(&self, request: ReceivedRequest) -> bool {
        let pulse = {
            let mut queue = lock(&self.shared.queue);
            if queue.stopping {
                return false;
            }
            let pulse = queue.requests.is_empty();
            queue.requests.push(request);
            pulse
        };
        if pulse {
            self.shared.pulse.notify_one();
        }
        true
    }

    /// The client went away; the session id may be stashed for reuse.
    pub(crate) fn on_client_cancelled(&self) {
        lock(&self.shared.state).client_cancelled = true;
    }

    /// Stop processing and stop the downstream session.
    ///
    /// With `force`, queued requests are discarded and an in-progress
    /// snapshot is abandoned at the next chunk boundary; otherwise
    /// everything already queued is processed first.
    pub(crate) async fn stop(&self, force: bool) {
        {
            let mut queue = lock(&self.shared.queue);
            queue.stopping = true;
            if force {
                queue.force = true;
                queue.requests.clear();
            }
        }
        self.shared.pulse.notify_one();

        let worker = lock(&self.shared.worker).take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                if err.is_panic() {
                    error!("ingest task panicked");
                }
            }
        }
        info!("task unregistered");

        let session_id = lock(&self.shared.state).session_id.clone();
        if let Some(session_id) = session_id {
            info!(force, "stop session started");
            self.shared
                .server
                .router
                .stop_session(&session_id, force)
                .await;
            info!("stop session completed");
        }
        info!("ingest task stopped");
    }

    /// Stash the session id if the session was client-cancelled and
    /// reusable. Called once the session is gone.
    pub(crate) fn release(&self) {
        let stash = {
            let state = lock(&self.shared.state);
            match (&state.session_id, &state.reuse_key) {
                (Some(id), Some(key)) if state.client_cancelled => Some((id.clone(), key.clone())),
                _ => None,
            }
        };
        if let Some((id, key)) = stash {
            self.shared.server.pool.stash(id, key);
        }
    }

    #[cfg(test)]
    pub(crate) fn session_id(&self) -> Option<SessionId> {
        lock(&self.shared.state).session_id.clone()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Worker
    // ─────────────────────────────────────────────────────────────────────

    async fn run(self) {
        let mut data = TaskData {
            phase: Phase::Initialize,
            requests: VecDeque::new(),
            consumer: None,
            last_seq_no: SeqNo::ZERO,
            reuse_key: None,
            batch: VecDeque::new(),
        };

        loop {
            if data.requests.is_empty() && data.batch.is_empty() {
                match self.snapshot() {
                    Snapshot::Requests(requests) => {
                        debug!(count = requests.len(), "queue snapshot");
                        data.requests = requests.into();
                    }
                    Snapshot::Idle => {
                        self.shared.pulse.notified().await;
                        continue;
                    }
                    Snapshot::Stopped => break,
                }
            }

            match self.activate(&mut data) {
                Activation::Idle => {}
                Activation::Yield => tokio::task::yield_now().await,
                Activation::Halt => break,
            }
            if lock(&self.shared.queue).force {
                break;
            }
        }
        debug!(phase = ?data.phase, "ingest worker exited");
    }

    fn snapshot(&self) -> Snapshot {
        let mut queue = lock(&self.shared.queue);
        if queue.force {
            Snapshot::Stopped
        } else if !queue.requests.is_empty() {
            Snapshot::Requests(mem::take(&mut queue.requests))
        } else if queue.stopping {
            Snapshot::Stopped
        } else {
            Snapshot::Idle
        }
    }

    /// Run the state machine until the snapshot is exhausted, a chunk has
    /// been submitted, or processing fails.
    fn activate(&self, data: &mut TaskData) -> Activation {
        loop {
            let step = match data.phase {
                Phase::Initialize => match data.requests.pop_front() {
                    Some(request) => self.start_session(data, request).map(|_| Phase::PrepareBatch),
                    None => return Activation::Idle,
                },
                Phase::PrepareBatch => match data.requests.pop_front() {
                    Some(request) => self.prepare_batch(data, request).map(|_| Phase::SubmitBatch),
                    None => return Activation::Idle,
                },
                Phase::SubmitBatch => {
                    if data.batch.is_empty() {
                        Ok(Phase::PrepareBatch)
                    } else {
                        self.submit_batch(data);
                        return Activation::Yield;
                    }
                }
                Phase::Error => return Activation::Halt,
            };

            match step {
                Ok(phase) => data.phase = phase,
                Err(err) => {
                    data.phase = Phase::Error;
                    data.requests.clear();
                    data.batch.clear();
                    match err {
                        IngestError::Poisoned => self.shared.session.poison(),
                        other => self.shared.session.send_error(other.status()),
                    }
                }
            }
        }
    }

    fn start_session(
        &self,
        data: &mut TaskData,
        received: ReceivedRequest,
    ) -> Result<(), IngestError> {
        let Request::Initialize(init) = received.request else {
            return Err(IngestError::InvalidArgument("expected Initialize".into()));
        };

        let server = &self.shared.server;
        if let Some(secret) = server.config.shared_secret_key.as_deref() {
            if !secret.is_empty() && init.shared_secret_key != secret {
                return Err(IngestError::PermissionDenied(
                    "invalid shared_secret_key".into(),
                ));
            }
        }

        let mut meta: SessionMeta = init
            .meta
            .into_iter()
            .map(|pair| (pair.name, pair.value))
            .collect();
        let reuse_key = server.pool.try_extract_reuse_key(&mut meta);

        let mut session_id = SessionId::new(init.session_id);
        let mut ignore_rate_limit = false;
        if session_id.is_empty() {
            if let Some(reused) = reuse_key.as_ref().and_then(|key| server.pool.try_reuse(key)) {
                session_id = reused;
                ignore_rate_limit = true;
            }
        }
        if session_id.is_empty() {
            session_id = SessionId::generate();
        }
        info!(session_id = %session_id, "init");

        let handler = Arc::new(StreamHandler {
            session_id: session_id.clone(),
            task: self.clone(),
        });
        let options = StartOptions {
            fault_tolerance: FaultTolerance::ResendOnFailure,
            ignore_rate_limit,
            inflight_action: InflightAction::Drop,
        };
        match server
            .router
            .start_session(&session_id, meta, handler, options)
        {
            StartSessionResult::Ok => {}
            StartSessionResult::AlreadyStarted => {
                return Err(IngestError::AlreadyExists(format!(
                    "session [{}] already started",
                    session_id
                )));
            }
            StartSessionResult::Throttled => {
                return Err(IngestError::ResourceExhausted(
                    "new sessions per second limit reached".into(),
                ));
            }
            StartSessionResult::Error(message) => {
                return Err(IngestError::FailedPrecondition(message));
            }
        }

        {
            let mut state = lock(&self.shared.state);
            state.session_id = Some(session_id);
            state.reuse_key = reuse_key.clone();
        }
        data.reuse_key = reuse_key;
        info!("agent session started");
        Ok(())
    }

    fn prepare_batch(
        &self,
        data: &mut TaskData,
        received: ReceivedRequest,
    ) -> Result<(), IngestError> {
        let Request::DataBatch(batch) = received.request else {
            return Err(IngestError::InvalidArgument("expected DataBatch".into()));
        };

        if data.consumer.is_none() {
            if let Some((consumer, last_seq_no)) = lock(&self.shared.state).started.take() {
                data.consumer = Some(consumer);
                data.last_seq_no = last_seq_no;
            }
        }
        if data.consumer.is_none() {
            return Err(IngestError::FailedPrecondition(
                "session is not started yet".into(),
            ));
        }

        let DataBatch {
            seq_no,
            timestamp,
            payload,
            meta,
        } = batch;
        let count = seq_no.len();
        if count == 0 || timestamp.len() != count || payload.len() != count {
            return Err(IngestError::InvalidArgument(format!(
                "invalid batch, seq_no [{}], timestamp [{}], payload [{}]",
                count,
                timestamp.len(),
                payload.len()
            )));
        }

        let config = &self.shared.server.config;
        let receipt_timestamp_us = config
            .set_receipt_timestamp
            .then_some(received.received_at_us);

        let mut items = Vec::with_capacity(count);
        let mut batch_bytes = 0;
        for ((seq_no, timestamp_us), payload) in seq_no.into_iter().zip(timestamp).zip(payload) {
            let seq_no = SeqNo(seq_no);
            if data.reuse_key.is_some() && seq_no.is_poison_pill() {
                info!("poison pill received");
                return Err(IngestError::Poisoned);
            }
            if seq_no <= data.last_seq_no {
                return Err(IngestError::FailedPrecondition(format!(
                    "seqNo [{}] is not greater than last seqNo [{}]",
                    seq_no, data.last_seq_no
                )));
            }
            data.last_seq_no = seq_no;
            batch_bytes += payload.len();
            items.push(SeqItem {
                seq_no,
                message: Message {
                    payload,
                    timestamp_us,
                    receipt_timestamp_us,
                    meta: BTreeMap::new(),
                },
            });
        }
        self.shared.server.counters.record_batch(batch_bytes);

        let rows = decode_meta(&meta, count)?;
        for (item, row) in items.iter_mut().zip(rows) {
            item.message.meta = row;
        }

        if config.parse_receipt_timestamp_from_meta {
            for item in &mut items {
                if let Some(value) = item.message.meta.remove(RECEIPT_TIMESTAMP_META_KEY) {
                    let parsed = value
                        .parse::<u64>()
                        .map_err(|_| DecodeError::InvalidReceiptTimestamp(value))?;
                    item.message.receipt_timestamp_us = Some(parsed);
                }
            }
        }

        data.batch = items.into();
        Ok(())
    }

    fn submit_batch(&self, data: &mut TaskData) {
        let size = data.batch.len().min(MAX_SUBMIT_BATCH);
        let chunk: Vec<SeqItem> = data.batch.drain(..size).collect();
        let (Some(first), Some(last)) = (chunk.first(), chunk.last()) else {
            return;
        };
        let (first, last) = (first.seq_no, last.seq_no);
        if let Some(consumer) = &data.consumer {
            consumer.submit(chunk);
        }
        debug!(%first, %last, "batch submitted");
    }
}

/// Downstream callbacks for one session.
struct StreamHandler {
    session_id: SessionId,
    task: IngestTask,
}

impl SessionHandler for StreamHandler {
    fn start(&self, last_seq_no: SeqNo, consumer: Arc<dyn MessageConsumer>) {
        lock(&self.task.shared.state).started = Some((consumer, last_seq_no));
        self.task
            .shared
            .session
            .send_initialized(self.session_id.clone(), last_seq_no);
    }

    fn ack(&self, seq_no: SeqNo) {
        self.task.shared.session.send_ack(seq_no);
    }
}
