//! Session handle shared by every pipeline component of one call.
//!
//! The handle owns the call-scoped cancellation token, the typed event bus,
//! the error fan-out, and the output queue that paced audio is written to.
//! It is injected explicitly into each component at construction; there is
//! no process-wide session state.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use super::errors::{PipelineError, PipelineResult};
use super::packet::{EventKind, MediaPacket, SessionEvent};

/// How long a producer may wait on the bounded output queue before the send
/// is reported as an error. Audio is never silently dropped.
pub const OUTPUT_SEND_TIMEOUT: Duration = Duration::from_millis(200);

/// Callback type for session events
pub type EventCallback =
    Arc<dyn Fn(SessionEvent) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Callback type for fatal errors, invoked with the sender name and the error
pub type ErrorCallback =
    Arc<dyn Fn(String, Arc<PipelineError>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Per-call coordination handle.
pub struct SessionHandle {
    id: String,
    sample_rate: u32,
    cancel: CancellationToken,
    handlers: RwLock<HashMap<EventKind, Vec<EventCallback>>>,
    wildcard_handlers: RwLock<Vec<EventCallback>>,
    error_handlers: RwLock<Vec<ErrorCallback>>,
    output_tx: mpsc::Sender<MediaPacket>,
    /// Whether the agent side of the call is live. Gated ASR filters refuse
    /// to open provider connections while this is false.
    active: AtomicBool,
}

impl SessionHandle {
    /// Creates a session handle together with the receiving end of its
    /// output queue. The owner of the call drains the receiver.
    pub fn new(id: impl Into<String>, sample_rate: u32) -> (Arc<Self>, mpsc::Receiver<MediaPacket>) {
        Self::with_queue_size(id, sample_rate, 128)
    }

    /// Same as [`SessionHandle::new`] with an explicit output queue bound.
    pub fn with_queue_size(
        id: impl Into<String>,
        sample_rate: u32,
        queue_size: usize,
    ) -> (Arc<Self>, mpsc::Receiver<MediaPacket>) {
        let (output_tx, output_rx) = mpsc::channel(queue_size);
        let handle = Arc::new(Self {
            id: id.into(),
            sample_rate,
            cancel: CancellationToken::new(),
            handlers: RwLock::new(HashMap::new()),
            wildcard_handlers: RwLock::new(Vec::new()),
            error_handlers: RwLock::new(Vec::new()),
            output_tx,
            active: AtomicBool::new(true),
        });
        (handle, output_rx)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// The call-scoped cancellation token. Components derive child tokens
    /// from it so that session teardown stops every worker.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// Registers a handler for one event kind.
    pub fn on(&self, kind: EventKind, callback: EventCallback) {
        self.handlers.write().entry(kind).or_default().push(callback);
    }

    /// Registers a handler invoked for every event.
    pub fn on_any(&self, callback: EventCallback) {
        self.wildcard_handlers.write().push(callback);
    }

    /// Registers a fatal-error handler.
    pub fn on_error(&self, callback: ErrorCallback) {
        self.error_handlers.write().push(callback);
    }

    /// Emits an event to every registered handler.
    pub async fn emit(&self, sender: &str, event: SessionEvent) {
        debug!(
            session_id = %self.id,
            sender,
            event = ?event.kind(),
            "emit session event"
        );

        let mut callbacks: Vec<EventCallback> = Vec::new();
        if let Some(registered) = self.handlers.read().get(&event.kind()) {
            callbacks.extend(registered.iter().cloned());
        }
        callbacks.extend(self.wildcard_handlers.read().iter().cloned());

        for callback in callbacks {
            callback(event.clone()).await;
        }
    }

    /// Reports a fatal error to the session owner. The owner is expected to
    /// terminate the call.
    pub async fn cause_error(&self, sender: &str, err: PipelineError) {
        error!(session_id = %self.id, sender, error = %err, "fatal pipeline error");

        let err = Arc::new(err);
        let callbacks: Vec<ErrorCallback> = self.error_handlers.read().iter().cloned().collect();
        for callback in callbacks {
            callback(sender.to_string(), err.clone()).await;
        }
    }

    /// Hands a packet to the session output queue, waiting at most
    /// [`OUTPUT_SEND_TIMEOUT`] before reporting a queue error.
    pub async fn send_output(&self, packet: MediaPacket) -> PipelineResult<()> {
        self.output_tx
            .send_timeout(packet, OUTPUT_SEND_TIMEOUT)
            .await
            .map_err(|e| PipelineError::Output(e.to_string()))
    }

    /// Tears the session down: emits `Hangup` and cancels every worker.
    pub async fn shutdown(&self) {
        self.emit(&self.id.clone(), SessionEvent::Hangup).await;
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("sample_rate", &self.sample_rate)
            .finish()
    }
}
