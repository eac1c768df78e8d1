//! Transcript filters between capture audio and the session.
//!
//! Two strategies exist for feeding a provider stream:
//!
//! * [`ContinuousAsrFilter`] keeps one stream open for the whole call and
//!   writes every capture packet to it. Suited to providers with built-in
//!   endpointing.
//! * [`GatedAsrFilter`] opens a stream only while the caller is speaking.
//!   While closed it keeps recent audio in a lookback ring and replays it as
//!   pre-roll on the voice-activity transition, so utterance onsets are not
//!   clipped.
//!
//! Both share the transcript bridge: partial results become `Transcribing`
//! events, finals pass through the phonetic corrector and become `Completed`
//! events, and a pending partial is flushed as a final before any transport
//! error is acted on, so the last utterance of a dying stream is not lost.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

use super::base::{AsrError, AsrErrorKind, AsrResult, AsrStream};
use super::correction::Corrector;
use crate::core::packet::{
    CompletedEvent, DialogId, Direction, MediaPacket, SessionEvent, StreamFormat,
    TranscribingEvent,
};
use crate::core::ring_buffer::RingBuffer;
use crate::core::runner::{PacketRequest, RunnerMode, TaskHandler};
use crate::core::session::SessionHandle;

struct Pending {
    text: String,
    duration: Duration,
}

/// Shared transcript path from a provider stream to the session.
struct TranscriptBridge {
    sender: String,
    session: Arc<SessionHandle>,
    stream: Arc<dyn AsrStream>,
    corrector: Corrector,
    dialog: Mutex<Option<DialogId>>,
    pending: Mutex<Option<Pending>>,
}

impl TranscriptBridge {
    fn new(
        sender: String,
        session: Arc<SessionHandle>,
        stream: Arc<dyn AsrStream>,
        corrector: Corrector,
    ) -> Arc<Self> {
        Arc::new(Self {
            sender,
            session,
            stream,
            corrector,
            dialog: Mutex::new(None),
            pending: Mutex::new(None),
        })
    }

    /// The dialog key of the open utterance, adopting the provider's hint or
    /// minting one on the first partial.
    fn current_dialog(&self, hint: Option<DialogId>) -> DialogId {
        let mut dialog = self.dialog.lock();
        if let Some(hint) = hint {
            *dialog = Some(hint.clone());
            return hint;
        }
        dialog.get_or_insert_with(DialogId::generate).clone()
    }

    fn set_dialog(&self, dialog_id: DialogId) {
        *self.dialog.lock() = Some(dialog_id);
    }

    async fn on_result(&self, result: AsrResult) {
        if result.is_final {
            self.pending.lock().take();
            let dialog_id = self.dialog.lock().take().or(result.dialog_id);
            let corrected = self.corrector.correct(&result.text);
            self.session
                .emit(
                    &self.sender,
                    SessionEvent::Completed(CompletedEvent {
                        sender: self.sender.clone(),
                        result: corrected,
                        duration: result.duration,
                        dialog_id,
                    }),
                )
                .await;
            return;
        }

        if result.text.is_empty() {
            return;
        }
        let dialog_id = self.current_dialog(result.dialog_id);
        *self.pending.lock() = Some(Pending {
            text: result.text.clone(),
            duration: result.duration,
        });
        self.session
            .emit(
                &self.sender,
                SessionEvent::Transcribing(TranscribingEvent {
                    sender: self.sender.clone(),
                    text: result.text,
                    duration: result.duration,
                    dialog_id,
                    direction: Direction::Input,
                }),
            )
            .await;
    }

    /// Promotes an unconfirmed partial to a final before the stream is torn
    /// down, so the caller's last words survive a dropped connection.
    async fn flush_pending(&self) {
        let Some(pending) = self.pending.lock().take() else {
            return;
        };
        let dialog_id = self.dialog.lock().take();
        let corrected = self.corrector.correct(&pending.text);
        self.session
            .emit(
                &self.sender,
                SessionEvent::Completed(CompletedEvent {
                    sender: self.sender.clone(),
                    result: corrected,
                    duration: pending.duration,
                    dialog_id,
                }),
            )
            .await;
    }

    async fn on_stream_error(&self, err: AsrError) {
        match err.kind() {
            AsrErrorKind::Benign => {
                debug!(sender = %self.sender, error = %err, "benign provider error");
            }
            AsrErrorKind::Transport => {
                self.flush_pending().await;
                warn!(sender = %self.sender, error = %err, "recognition stream lost, restarting");
                if let Err(restart_err) = self.stream.restart().await {
                    self.session
                        .cause_error(&self.sender, restart_err.into())
                        .await;
                }
            }
            AsrErrorKind::Configuration => {
                self.flush_pending().await;
                self.session.cause_error(&self.sender, err.into()).await;
            }
        }
    }

    /// Wires this bridge into the stream's callbacks.
    async fn install(self: &Arc<Self>) -> Result<(), AsrError> {
        let result_bridge = self.clone();
        let error_bridge = self.clone();
        self.stream
            .init(
                Arc::new(move |result| {
                    let bridge = result_bridge.clone();
                    Box::pin(async move {
                        bridge.on_result(result).await;
                    })
                }),
                Arc::new(move |err| {
                    let bridge = error_bridge.clone();
                    Box::pin(async move {
                        bridge.on_stream_error(err).await;
                    })
                }),
            )
            .await
    }
}

/// Filter that streams every capture packet over one long-lived stream.
pub struct ContinuousAsrFilter {
    stream: Arc<dyn AsrStream>,
    corrector: Corrector,
    bridge: Mutex<Option<Arc<TranscriptBridge>>>,
}

impl ContinuousAsrFilter {
    pub fn new(stream: Arc<dyn AsrStream>, corrector: Corrector) -> Arc<Self> {
        Arc::new(Self {
            stream,
            corrector,
            bridge: Mutex::new(None),
        })
    }
}

#[async_trait]
impl TaskHandler for ContinuousAsrFilter {
    type Request = Bytes;
    type Error = AsrError;

    fn name(&self) -> String {
        format!("asr.{}", self.stream.provider())
    }

    fn mode(&self) -> RunnerMode {
        // Audio writes must stay ordered.
        RunnerMode::Sequential
    }

    async fn init(&self, session: &Arc<SessionHandle>) -> Result<(), AsrError> {
        let bridge = TranscriptBridge::new(
            self.name(),
            session.clone(),
            self.stream.clone(),
            self.corrector.clone(),
        );
        bridge.install().await?;
        *self.bridge.lock() = Some(bridge);
        self.stream.connect(DialogId::generate()).await
    }

    async fn terminate(&self, _session: &Arc<SessionHandle>) {
        // Clone out of the lock; the guard must not live across the await.
        let bridge = self.bridge.lock().clone();
        if let Some(bridge) = bridge {
            bridge.flush_pending().await;
        }
        if let Err(err) = self.stream.stop().await {
            debug!(error = %err, "error stopping recognition stream");
        }
    }

    async fn build_request(
        &self,
        _session: &Arc<SessionHandle>,
        packet: MediaPacket,
    ) -> Result<Option<PacketRequest<Bytes>>, AsrError> {
        match packet {
            MediaPacket::Audio(audio) if !audio.is_synthesized => Ok(Some(PacketRequest {
                payload: audio.payload,
                interrupt: true,
            })),
            MediaPacket::Close { .. } => {
                self.stream.send_end().await?;
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    async fn execute(
        &self,
        _ctx: &crate::core::runner::TaskContext,
        _session: &Arc<SessionHandle>,
        request: PacketRequest<Bytes>,
    ) -> Result<(), AsrError> {
        self.stream.send_audio(request.payload).await
    }

    async fn recover(&self, _session: &Arc<SessionHandle>) -> Result<(), AsrError> {
        // A failed write may strand a partial transcript; promote it before
        // the restart discards the dialog.
        let bridge = self.bridge.lock().clone();
        if let Some(bridge) = bridge {
            bridge.flush_pending().await;
        }
        self.stream.restart().await
    }
}

/// Filter that opens a provider stream only for the duration of an
/// utterance, replaying ring-buffered lookback audio as pre-roll.
pub struct GatedAsrFilter {
    stream: Arc<dyn AsrStream>,
    corrector: Corrector,
    ring: RingBuffer,
    speaking: AtomicBool,
    bridge: Mutex<Option<Arc<TranscriptBridge>>>,
}

impl GatedAsrFilter {
    /// `lookback_ms` controls how much pre-utterance audio is replayed when
    /// a stream opens.
    pub fn new(
        stream: Arc<dyn AsrStream>,
        corrector: Corrector,
        format: &StreamFormat,
        lookback_ms: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            stream,
            corrector,
            ring: RingBuffer::for_lookback(format, lookback_ms),
            speaking: AtomicBool::new(false),
            bridge: Mutex::new(None),
        })
    }

    async fn open_utterance(&self, session: &Arc<SessionHandle>, dialog_id: Option<DialogId>) {
        if !session.is_active() {
            debug!(session_id = %session.id(), "session inactive, not opening recognition stream");
            return;
        }
        if self.speaking.swap(true, Ordering::AcqRel) {
            return;
        }

        let dialog_id = dialog_id.unwrap_or_else(DialogId::generate);
        if let Some(bridge) = self.bridge.lock().clone() {
            bridge.set_dialog(dialog_id.clone());
        }
        if let Err(err) = self.stream.connect(dialog_id).await {
            self.speaking.store(false, Ordering::Release);
            self.report(session, err).await;
            return;
        }

        // Pre-roll: the audio from just before the voice-activity edge.
        let lookback = self.ring.drain();
        if !lookback.is_empty() {
            if let Err(err) = self.stream.send_audio(Bytes::from(lookback)).await {
                self.report(session, err).await;
            }
        }
    }

    async fn close_utterance(&self, session: &Arc<SessionHandle>) {
        if !self.speaking.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Err(err) = self.stream.send_end().await {
            self.report(session, err).await;
        }
    }

    async fn report(&self, session: &Arc<SessionHandle>, err: AsrError) {
        match err.kind() {
            AsrErrorKind::Benign => {
                debug!(error = %err, "benign provider error");
            }
            AsrErrorKind::Transport => {
                warn!(error = %err, "recognition transport error");
            }
            AsrErrorKind::Configuration => {
                session.cause_error(&self.name(), err.into()).await;
            }
        }
    }
}

#[async_trait]
impl TaskHandler for GatedAsrFilter {
    type Request = Bytes;
    type Error = AsrError;

    fn name(&self) -> String {
        format!("asr.{}", self.stream.provider())
    }

    fn mode(&self) -> RunnerMode {
        RunnerMode::Sequential
    }

    async fn init(&self, session: &Arc<SessionHandle>) -> Result<(), AsrError> {
        let bridge = TranscriptBridge::new(
            self.name(),
            session.clone(),
            self.stream.clone(),
            self.corrector.clone(),
        );
        bridge.install().await?;
        *self.bridge.lock() = Some(bridge);
        Ok(())
    }

    async fn terminate(&self, _session: &Arc<SessionHandle>) {
        // Clone out of the lock; the guard must not live across the await.
        let bridge = self.bridge.lock().clone();
        if let Some(bridge) = bridge {
            bridge.flush_pending().await;
        }
        if let Err(err) = self.stream.stop().await {
            debug!(error = %err, "error stopping recognition stream");
        }
    }

    async fn on_event(&self, session: &Arc<SessionHandle>, event: &SessionEvent) {
        match event {
            SessionEvent::StartSpeaking { dialog_id } => {
                self.open_utterance(session, dialog_id.clone()).await;
            }
            SessionEvent::StartSilence => {
                self.close_utterance(session).await;
            }
            _ => {}
        }
    }

    async fn build_request(
        &self,
        _session: &Arc<SessionHandle>,
        packet: MediaPacket,
    ) -> Result<Option<PacketRequest<Bytes>>, AsrError> {
        match packet {
            MediaPacket::Audio(audio) if !audio.is_synthesized => {
                if self.speaking.load(Ordering::Acquire) {
                    Ok(Some(PacketRequest {
                        payload: audio.payload,
                        interrupt: true,
                    }))
                } else {
                    // Not speaking: keep the audio as lookback only.
                    self.ring.write(&audio.payload);
                    Ok(None)
                }
            }
            _ => Ok(None),
        }
    }

    async fn execute(
        &self,
        _ctx: &crate::core::runner::TaskContext,
        _session: &Arc<SessionHandle>,
        request: PacketRequest<Bytes>,
    ) -> Result<(), AsrError> {
        self.stream.send_audio(request.payload).await
    }

    async fn recover(&self, _session: &Arc<SessionHandle>) -> Result<(), AsrError> {
        let bridge = self.bridge.lock().clone();
        if let Some(bridge) = bridge {
            bridge.flush_pending().await;
        }
        self.speaking.store(false, Ordering::Release);
        self.stream.stop().await
    }
}
