//! Concurrent task runner: a generic dispatcher between the packet stream
//! and one vendor client.
//!
//! Each ASR connection and each synthesis dispatcher runs behind one runner.
//! The runner owns a bounded inbound queue, forwards session events to the
//! handler, and executes vendor work either sequentially (at most one
//! in-flight call) or concurrently (overlapping calls), depending on whether
//! the vendor client tolerates concurrent writes.
//!
//! Requests carry an interrupt flag: a request marked interruptible may be
//! superseded by any newer request while still executing. This is the
//! mechanism behind ASR barge-in and TTS segment replacement.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::errors::{PipelineError, PipelineResult};
use super::packet::{MediaPacket, SessionEvent};
use super::session::SessionHandle;

/// How long a producer may wait on the runner's bounded queue. A timeout is
/// surfaced as an error rather than dropping the packet.
pub const FEED_TIMEOUT: Duration = Duration::from_millis(200);

/// Classification carried on every handler error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Provider noise (e.g. "no audio sent" codes). Ignored entirely.
    Benign,
    /// Recoverable transport failure. Triggers [`TaskHandler::recover`]
    /// without aborting the session.
    Transport,
    /// Unrecoverable. Propagated to the session, which ends the call.
    Fatal,
}

/// Trait implemented by handler error types so the runner can classify
/// failures without inspecting strings.
pub trait TaskFailure: std::error::Error + Send + Sync + 'static {
    fn severity(&self) -> Severity;
}

/// One unit of vendor work built from a media packet.
#[derive(Debug)]
pub struct PacketRequest<R> {
    pub payload: R,
    /// When set, any newer request may supersede this one while it is still
    /// being processed.
    pub interrupt: bool,
}

/// Dispatch mode of a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerMode {
    /// At most one in-flight call to the backend.
    Sequential,
    /// Overlapping calls permitted.
    Concurrent,
}

/// Execution context handed to [`TaskHandler::execute`]. Long-running
/// executions poll [`TaskContext::is_superseded`] between vendor sends.
pub struct TaskContext {
    token: CancellationToken,
}

impl TaskContext {
    /// Wraps a cancellation token, usually a child of the session token.
    pub fn from_token(token: CancellationToken) -> Self {
        Self { token }
    }

    /// True once a newer request has superseded this execution or the
    /// session is shutting down.
    pub fn is_superseded(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves when this execution is superseded.
    pub async fn superseded(&self) {
        self.token.cancelled().await
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Lifecycle and work hooks of one vendor-facing worker.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    type Request: Send + 'static;
    type Error: TaskFailure + Into<PipelineError>;

    /// Sender name used in logs and events, e.g. `asr.mock`.
    fn name(&self) -> String;

    fn mode(&self) -> RunnerMode {
        RunnerMode::Sequential
    }

    /// Establish the vendor connection. Configuration errors surface here,
    /// synchronously, before any packet is accepted.
    async fn init(&self, session: &Arc<SessionHandle>) -> Result<(), Self::Error>;

    /// Tear the vendor connection down.
    async fn terminate(&self, session: &Arc<SessionHandle>);

    /// React to session-level events (hangup, interruption, voice activity).
    async fn on_event(&self, _session: &Arc<SessionHandle>, _event: &SessionEvent) {}

    /// Map a packet to a vendor request, or `None` when the packet was
    /// handled as a pass-through.
    async fn build_request(
        &self,
        session: &Arc<SessionHandle>,
        packet: MediaPacket,
    ) -> Result<Option<PacketRequest<Self::Request>>, Self::Error>;

    /// Perform one unit of work against the vendor.
    async fn execute(
        &self,
        ctx: &TaskContext,
        session: &Arc<SessionHandle>,
        request: PacketRequest<Self::Request>,
    ) -> Result<(), Self::Error>;

    /// Reconnect the vendor client after a transport failure.
    async fn recover(&self, _session: &Arc<SessionHandle>) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Producer-side handle of a spawned runner.
pub struct RunnerHandle {
    tx: mpsc::Sender<MediaPacket>,
    cancel: CancellationToken,
}

impl RunnerHandle {
    /// Hands a packet to the runner's bounded queue, waiting at most
    /// [`FEED_TIMEOUT`].
    pub async fn feed(&self, packet: MediaPacket) -> PipelineResult<()> {
        self.tx
            .send_timeout(packet, FEED_TIMEOUT)
            .await
            .map_err(|e| PipelineError::Output(format!("runner queue: {e}")))
    }

    /// Stops the worker. The handler's `terminate` hook runs before the
    /// worker exits.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Spawns a runner around a handler. Returns once the handler's `init`
/// succeeded; init failures are returned synchronously.
pub struct TaskRunner;

impl TaskRunner {
    pub async fn spawn<H: TaskHandler>(
        handler: Arc<H>,
        session: Arc<SessionHandle>,
        queue_size: usize,
    ) -> PipelineResult<RunnerHandle> {
        handler.init(&session).await.map_err(Into::into)?;

        let (tx, rx) = mpsc::channel::<MediaPacket>(queue_size);
        let (event_tx, event_rx) = mpsc::channel::<SessionEvent>(64);
        let cancel = session.cancellation().child_token();

        // Forward session events into the worker loop so the handler reacts
        // on its own task, never on the emitter's.
        session.on_any({
            let event_tx = event_tx.clone();
            Arc::new(move |event| {
                let event_tx = event_tx.clone();
                Box::pin(async move {
                    let _ = event_tx.send(event).await;
                })
            })
        });

        let worker_cancel = cancel.clone();
        tokio::spawn(run_worker(handler, session, rx, event_rx, worker_cancel));

        Ok(RunnerHandle { tx, cancel })
    }
}

struct InFlight {
    token: CancellationToken,
    supersedable: bool,
    handle: JoinHandle<()>,
}

async fn run_worker<H: TaskHandler>(
    handler: Arc<H>,
    session: Arc<SessionHandle>,
    mut rx: mpsc::Receiver<MediaPacket>,
    mut event_rx: mpsc::Receiver<SessionEvent>,
    cancel: CancellationToken,
) {
    let name = handler.name();
    let mut in_flight: Vec<InFlight> = Vec::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                for entry in in_flight.drain(..) {
                    entry.token.cancel();
                }
                handler.terminate(&session).await;
                debug!(session_id = %session.id(), worker = %name, "task runner stopped");
                return;
            }
            Some(event) = event_rx.recv() => {
                handler.on_event(&session, &event).await;
            }
            packet = rx.recv() => {
                let Some(packet) = packet else {
                    handler.terminate(&session).await;
                    return;
                };
                let request = match handler.build_request(&session, packet).await {
                    Ok(Some(request)) => request,
                    Ok(None) => continue,
                    Err(err) => {
                        handle_failure(&handler, &session, &name, err).await;
                        continue;
                    }
                };

                match handler.mode() {
                    RunnerMode::Sequential => {
                        let ctx = TaskContext::from_token(cancel.child_token());
                        if let Err(err) = handler.execute(&ctx, &session, request).await {
                            handle_failure(&handler, &session, &name, err).await;
                        }
                    }
                    RunnerMode::Concurrent => {
                        in_flight.retain(|entry| !entry.handle.is_finished());
                        // A newer request supersedes every in-flight request
                        // that was marked interruptible.
                        for entry in &in_flight {
                            if entry.supersedable {
                                entry.token.cancel();
                            }
                        }

                        let token = cancel.child_token();
                        let supersedable = request.interrupt;
                        let task_handler = handler.clone();
                        let task_session = session.clone();
                        let task_name = name.clone();
                        let task_token = token.clone();
                        let handle = tokio::spawn(async move {
                            let ctx = TaskContext::from_token(task_token);
                            if let Err(err) =
                                task_handler.execute(&ctx, &task_session, request).await
                            {
                                if ctx.is_superseded() {
                                    debug!(
                                        session_id = %task_session.id(),
                                        worker = %task_name,
                                        error = %err,
                                        "ignoring error from superseded execution"
                                    );
                                    return;
                                }
                                handle_failure(&task_handler, &task_session, &task_name, err)
                                    .await;
                            }
                        });
                        in_flight.push(InFlight {
                            token,
                            supersedable,
                            handle,
                        });
                    }
                }
            }
        }
    }
}

async fn handle_failure<H: TaskHandler>(
    handler: &Arc<H>,
    session: &Arc<SessionHandle>,
    name: &str,
    err: H::Error,
) {
    match err.severity() {
        Severity::Benign => {
            debug!(session_id = %session.id(), worker = name, error = %err, "benign provider error");
        }
        Severity::Transport => {
            warn!(
                session_id = %session.id(),
                worker = name,
                error = %err,
                "transport error, reconnecting vendor client"
            );
            if let Err(recover_err) = handler.recover(session).await {
                session.cause_error(name, recover_err.into()).await;
            }
        }
        Severity::Fatal => {
            session.cause_error(name, err.into()).await;
        }
    }
}
