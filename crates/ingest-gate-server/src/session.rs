//! Per-stream session driver.
//!
//! A single task owns all mutable state of a session and reacts to events:
//! read completions, write completions, responses produced by the ingest
//! task and the downstream, finish completion, and stream cancellation.
//! Everything that can end a session funnels into one `schedule_finish`,
//! so exactly one terminal status is ever sent.
//!
//! ## Lifecycle
//!
//! ```text
//! Accepting -> Active -> Finishing -> Done
//! ```
//!
//! - **Accepting**: registered with the server, waiting for the listener.
//! - **Active**: a read is always outstanding; responses are written one
//!   at a time.
//! - **Finishing**: the ingest task is stopping; pending writes drain, then
//!   the terminal status is written.
//! - **Done**: the finish completed, the stream is done, and no read is
//!   outstanding. The session unregisters.

use std::future::Future;
use std::sync::Arc;

use ingest_gate_core::{Headers, Response, SeqNo, ServerFrame, SessionId, Status, StatusCode};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument, Level, Span};

use crate::error::{IngestError, Result, TransportError};
use crate::server::ServerShared;
use crate::task::{IngestTask, ReceivedRequest};
use crate::transport::{ServerStream, StreamReader, StreamWriter};

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    Accepting,
    Active,
    Finishing,
    Done,
}

/// Input to the session driver.
pub(crate) enum SessionEvent {
    /// The downstream started; tell the client.
    Initialized {
        session_id: SessionId,
        last_seq_no: SeqNo,
    },
    /// The downstream acknowledged up to this sequence number.
    Ack(SeqNo),
    /// Finish with this status.
    Error(Status),
    /// The client reset a reusable session.
    Poison,
    /// Cancel the stream.
    Cancel,
    ReadEnded(ReadEnd),
    WriteDone {
        writer: Box<dyn StreamWriter>,
        result: Result<()>,
    },
    IngestStopped,
    FinishDone(Result<()>),
}

/// Why the read loop ended.
pub(crate) enum ReadEnd {
    HalfClosed,
    /// A request arrived after finish started.
    Dropped,
    Failed(TransportError),
}

/// Cheap handle for posting events to a session.
#[derive(Clone)]
pub(crate) struct SessionHandle {
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionHandle {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { events }, rx)
    }

    pub(crate) fn send_initialized(&self, session_id: SessionId, last_seq_no: SeqNo) {
        self.post(SessionEvent::Initialized {
            session_id,
            last_seq_no,
        });
    }

    pub(crate) fn send_ack(&self, seq_no: SeqNo) {
        self.post(SessionEvent::Ack(seq_no));
    }

    pub(crate) fn send_error(&self, status: Status) {
        self.post(SessionEvent::Error(status));
    }

    pub(crate) fn poison(&self) {
        self.post(SessionEvent::Poison);
    }

    pub(crate) fn try_cancel(&self) {
        self.post(SessionEvent::Cancel);
    }

    fn post(&self, event: SessionEvent) {
        // The session may already be gone.
        let _ = self.events.send(event);
    }
}

enum Wake {
    Event(SessionEvent),
    Cancelled,
    Closed,
}

/// The driver of one stream.
pub(crate) struct Session {
    label: u64,
    span: Span,
    server: Arc<ServerShared>,
    state: SessionState,
    handle: SessionHandle,
    events: mpsc::UnboundedReceiver<SessionEvent>,
    cancel: CancellationToken,
    ingest: Option<IngestTask>,
    writer: Option<Box<dyn StreamWriter>>,
    reader: Option<JoinHandle<()>>,

    pending_headers: Option<Headers>,
    pending_init: Option<Response>,
    /// Only the newest unsent ack is kept.
    pending_ack: Option<SeqNo>,
    last_sent_ack: Option<SeqNo>,
    finish_status: Option<Status>,

    write_pending: bool,
    write_error: bool,
    read_pending: bool,
    finish_started: bool,
    ingest_stopped: bool,
    finish_issued: bool,
    done: bool,
    finished: bool,
    poisoned: bool,
}

impl Session {
    /// Create a session in the accepting state.
    pub(crate) fn new(server: Arc<ServerShared>) -> (Self, SessionHandle) {
        let label = server.next_label();
        let span = info_span!("session", label);
        let (handle, events) = SessionHandle::channel();
        span.in_scope(|| info!("created"));
        let session = Self {
            label,
            span,
            server,
            state: SessionState::Accepting,
            handle: handle.clone(),
            events,
            cancel: CancellationToken::new(),
            ingest: None,
            writer: None,
            reader: None,
            pending_headers: None,
            pending_init: None,
            pending_ack: None,
            last_sent_ack: None,
            finish_status: None,
            write_pending: false,
            write_error: false,
            read_pending: false,
            finish_started: false,
            ingest_stopped: false,
            finish_issued: false,
            done: false,
            finished: false,
            poisoned: false,
        };
        (session, handle)
    }

    pub(crate) fn label(&self) -> u64 {
        self.label
    }

    /// The listener produced no stream for this session.
    pub(crate) fn discard(self, error: Option<&TransportError>) {
        let _entered = self.span.enter();
        match error {
            Some(err) => log_transport(&self.server, err, "accept", false),
            None => info!("accept ended, listener shut down"),
        }
        self.server.unregister(self.label);
    }

    /// Drive an accepted stream to completion.
    pub(crate) fn run(self, stream: ServerStream) -> impl Future<Output = ()> + Send {
        let span = self.span.clone();
        self.drive(stream).instrument(span)
    }

    async fn drive(mut self, stream: ServerStream) {
        let ServerStream {
            peer,
            reader,
            writer,
            cancel,
        } = stream;
        self.state = SessionState::Active;
        self.cancel = cancel.clone();
        info!(%peer, "accepted");

        let ingest = IngestTask::spawn(Arc::clone(&self.server), self.handle.clone());
        self.reader = Some(tokio::spawn(
            read_loop(reader, ingest.clone(), self.handle.clone()).in_current_span(),
        ));
        self.read_pending = true;
        self.ingest = Some(ingest);
        self.writer = Some(writer);
        self.pending_headers = Some(self.server.initial_headers());
        self.begin_write();

        while !(self.done && self.finished && !self.read_pending) {
            let watch_cancel = !self.done;
            let wake = tokio::select! {
                biased;
                event = self.events.recv() => match event {
                    Some(event) => Wake::Event(event),
                    None => Wake::Closed,
                },
                _ = cancel.cancelled(), if watch_cancel => Wake::Cancelled,
            };
            match wake {
                Wake::Event(event) => self.on_event(event),
                Wake::Cancelled => self.on_done(true),
                Wake::Closed => break,
            }
        }

        self.state = SessionState::Done;
        if let Some(ingest) = &self.ingest {
            ingest.release();
        }
        self.server.unregister(self.label);
        info!(state = ?self.state, "destroyed");
    }

    fn on_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Initialized {
                session_id,
                last_seq_no,
            } => self.on_initialized(session_id, last_seq_no),
            SessionEvent::Ack(seq_no) => self.on_ack(seq_no),
            SessionEvent::Error(status) => self.schedule_finish(status),
            SessionEvent::Poison => {
                self.poisoned = true;
                self.schedule_finish(IngestError::Poisoned.status());
            }
            SessionEvent::Cancel => self.try_cancel(),
            SessionEvent::ReadEnded(end) => self.on_read_end(end),
            SessionEvent::WriteDone { writer, result } => self.on_write_done(writer, result),
            SessionEvent::IngestStopped => {
                self.ingest_stopped = true;
                self.try_finish();
            }
            SessionEvent::FinishDone(result) => self.on_finish_done(result),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Writes
    // ─────────────────────────────────────────────────────────────────────

    fn on_initialized(&mut self, session_id: SessionId, last_seq_no: SeqNo) {
        if self.write_error || self.finish_issued {
            info!("initialized dropped, stream closing");
            return;
        }
        self.pending_init = Some(Response::Initialized {
            session_id: session_id.as_str().to_owned(),
            last_seq_no: last_seq_no.value(),
        });
        self.begin_write();
    }

    fn on_ack(&mut self, seq_no: SeqNo) {
        debug!(%seq_no, "send ack");
        if self.write_error || self.finish_issued {
            info!(%seq_no, "ack dropped, stream closing");
            return;
        }
        if let Some(last) = self.last_sent_ack {
            if seq_no <= last {
                error!(%seq_no, %last, "ack must increase");
                self.schedule_finish(Status::new(
                    StatusCode::Internal,
                    format!("ack [{}] is not greater than last ack [{}]", seq_no, last),
                ));
                return;
            }
        }
        self.last_sent_ack = Some(seq_no);
        self.pending_ack = Some(seq_no);
        self.begin_write();
    }

    /// Start the next write if none is in flight.
    ///
    /// Headers go first, then `Initialized`, then the newest ack.
    fn begin_write(&mut self) {
        if self.write_pending || self.finish_issued {
            return;
        }
        let Some(mut writer) = self.writer.take() else {
            return;
        };
        let frame = if let Some(headers) = self.pending_headers.take() {
            ServerFrame::Headers(headers)
        } else if let Some(init) = self.pending_init.take() {
            ServerFrame::Response(init)
        } else if let Some(seq_no) = self.pending_ack.take() {
            ServerFrame::Response(Response::Ack {
                seq_no: seq_no.value(),
            })
        } else {
            self.writer = Some(writer);
            return;
        };

        debug!(frame = %describe(&frame), "write started");
        self.write_pending = true;
        let events = self.handle.clone();
        tokio::spawn(
            async move {
                let result = writer.write(frame).await;
                events.post(SessionEvent::WriteDone { writer, result });
            }
            .in_current_span(),
        );
    }

    fn on_write_done(&mut self, writer: Box<dyn StreamWriter>, result: Result<()>) {
        self.write_pending = false;
        self.writer = Some(writer);
        match result {
            Ok(()) => {
                debug!("write done");
                self.begin_write();
            }
            Err(err) => {
                log_transport(&self.server, &err, "write", self.done);
                self.write_error = true;
                self.schedule_finish(Status::new(StatusCode::Unavailable, "write failed"));
            }
        }
        self.try_finish();
    }

    // ─────────────────────────────────────────────────────────────────────
    // Reads, cancellation, finish
    // ─────────────────────────────────────────────────────────────────────

    fn on_read_end(&mut self, end: ReadEnd) {
        self.read_pending = false;
        self.reader = None;
        match end {
            ReadEnd::HalfClosed => {
                info!("client half-closed");
                self.schedule_finish(Status::ok());
            }
            ReadEnd::Dropped => info!("request dropped, finish started"),
            ReadEnd::Failed(err) => {
                log_transport(&self.server, &err, "read", true);
                match err {
                    TransportError::FrameTooLarge { .. } => self.schedule_finish(Status::new(
                        StatusCode::ResourceExhausted,
                        err.to_string(),
                    )),
                    TransportError::Malformed(_) => self.schedule_finish(Status::new(
                        StatusCode::InvalidArgument,
                        err.to_string(),
                    )),
                    ref other if other.is_disconnect() => self.on_done(true),
                    _ => self.schedule_finish(Status::ok()),
                }
            }
        }
    }

    fn try_cancel(&mut self) {
        if self.state == SessionState::Accepting {
            return;
        }
        info!("cancel requested");
        self.cancel.cancel();
        self.on_done(true);
    }

    /// The stream is done: finished, cancelled, or the client went away.
    fn on_done(&mut self, cancelled: bool) {
        if self.done {
            return;
        }
        info!(cancelled, "stream done");
        if !self.server.is_stopping() && (cancelled || self.poisoned) {
            if let Some(ingest) = &self.ingest {
                ingest.on_client_cancelled();
            }
        }
        self.done = true;
        self.schedule_finish(Status::cancelled(""));
    }

    /// Begin finishing with `status`. Only the first call has an effect.
    fn schedule_finish(&mut self, status: Status) {
        if self.finish_started {
            return;
        }
        if status.is_ok() || self.poisoned {
            info!(code = %status.code, message = %status.message, "finish scheduled");
        } else {
            error!(code = %status.code, message = %status.message, "finish scheduled");
        }
        self.finish_started = true;
        self.state = SessionState::Finishing;

        let force = !status.is_ok() || self.server.is_stopping();
        self.finish_status = Some(status);
        match self.ingest.clone() {
            Some(ingest) => {
                let events = self.handle.clone();
                tokio::spawn(
                    async move {
                        ingest.stop(force).await;
                        events.post(SessionEvent::IngestStopped);
                    }
                    .in_current_span(),
                );
            }
            None => self.ingest_stopped = true,
        }
        self.try_finish();
    }

    /// Write the terminal status once the ingest task has stopped and no
    /// write is in flight. Reads are never waited for.
    fn try_finish(&mut self) {
        if !self.ingest_stopped || self.write_pending || self.finish_issued {
            return;
        }
        let Some(status) = self.finish_status.take() else {
            return;
        };
        let Some(mut writer) = self.writer.take() else {
            warn!("no writer to finish with");
            self.finished = true;
            return;
        };
        self.finish_issued = true;
        info!("finish started");
        let events = self.handle.clone();
        tokio::spawn(
            async move {
                let result = writer.finish(status).await;
                events.post(SessionEvent::FinishDone(result));
            }
            .in_current_span(),
        );
    }

    fn on_finish_done(&mut self, result: Result<()>) {
        match result {
            Ok(()) => info!("finish done"),
            // The peer may be gone already.
            Err(err) => log_transport(&self.server, &err, "finish", self.done),
        }
        self.finished = true;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        self.read_pending = false;
        self.on_done(false);
    }
}

async fn read_loop(mut reader: Box<dyn StreamReader>, ingest: IngestTask, events: SessionHandle) {
    let end = loop {
        match reader.read().await {
            Ok(Some(request)) => {
                debug!(kind = request.kind(), "read done");
                if !ingest.enqueue(ReceivedRequest::new(request)) {
                    break ReadEnd::Dropped;
                }
            }
            Ok(None) => break ReadEnd::HalfClosed,
            Err(err) => break ReadEnd::Failed(err),
        }
    };
    events.post(SessionEvent::ReadEnded(end));
}

fn describe(frame: &ServerFrame) -> String {
    match frame {
        ServerFrame::Headers(_) => "headers".to_string(),
        ServerFrame::Response(Response::Initialized { .. }) => "init".to_string(),
        ServerFrame::Response(Response::Ack { seq_no }) => format!("ack [{}]", seq_no),
        ServerFrame::Status(_) => "status".to_string(),
    }
}

/// Log a transport error at the configured level, unless it was expected
/// or the server is stopping.
fn log_transport(server: &ServerShared, err: &TransportError, op: &str, expected: bool) {
    if expected || server.is_stopping() {
        debug!(op, error = %err, "transport operation ended");
        return;
    }
    server.counters.transport_error();
    let level = server.config.transport_error_log_level;
    if level == Level::ERROR {
        error!(op, error = %err, "transport error");
    } else if level == Level::WARN {
        warn!(op, error = %err, "transport error");
    } else if level == Level::INFO {
        info!(op, error = %err, "transport error");
    } else if level == Level::DEBUG {
        debug!(op, error = %err, "transport error");
    } else {
        trace!(op, error = %err, "transport error");
    }
}
