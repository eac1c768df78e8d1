//! Reply-to-speech dispatcher.
//!
//! Consumes reply text packets, resolves audio from the synthesis cache or
//! the vendor, and streams the result into the session's playback worker.
//! Runs in concurrent mode: segment requests overlap, and a reply's first
//! segment (sequence 0) supersedes whatever is still playing.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::base::{SynthesisService, SynthesisSink, TtsError, TtsProviderId};
use super::player::{StopReason, SynthesisPlayer};
use crate::core::cache::SynthesisCache;
use crate::core::packet::{
    AudioPacket, CompletedEvent, MediaPacket, PlayId, SessionEvent, TextPacket,
};
use crate::core::runner::{PacketRequest, RunnerMode, TaskContext, TaskHandler};
use crate::core::session::SessionHandle;

// Emoji and variation selectors; providers read them aloud or reject them.
static EMOJI_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        "[\\x{00A9}\\x{00AE}\\x{203C}\\x{2049}\\x{2122}\\x{2139}\\x{2194}-\\x{2199}",
        "\\x{21A9}-\\x{21AA}\\x{231A}-\\x{231B}\\x{2328}\\x{23CF}\\x{23E9}-\\x{23F3}",
        "\\x{23F8}-\\x{23FA}\\x{24C2}\\x{25AA}-\\x{25AB}\\x{25B6}\\x{25C0}\\x{25FB}-\\x{25FE}",
        "\\x{2600}-\\x{26FF}\\x{2700}-\\x{27BF}\\x{2B05}-\\x{2B07}\\x{2B1B}-\\x{2B1C}",
        "\\x{2B50}\\x{2B55}\\x{3030}\\x{303D}\\x{3297}\\x{3299}\\x{1F004}\\x{1F0CF}",
        "\\x{1F170}-\\x{1F251}\\x{1F300}-\\x{1F5FF}\\x{1F600}-\\x{1F64F}\\x{1F680}-\\x{1F6FF}",
        "\\x{1F910}-\\x{1F93E}\\x{1F940}-\\x{1F94C}\\x{1F950}-\\x{1F96B}\\x{1F980}-\\x{1F997}",
        "\\x{1F9C0}-\\x{1F9E6}\\x{1FA70}-\\x{1FA74}\\x{1FA78}-\\x{1FA7A}\\x{1FA80}-\\x{1FA86}",
        "\\x{1FA90}-\\x{1FAA8}\\x{1FAB0}-\\x{1FAB6}\\x{1FAC0}-\\x{1FAC2}\\x{1FAD0}-\\x{1FAD6}",
        "\\x{1F1E6}-\\x{1F1FF}\\x{200D}\\x{FE0F}]",
    ))
    .expect("emoji pattern")
});

/// Removes emoji before text reaches a synthesis vendor.
pub fn strip_emoji(text: &str) -> String {
    EMOJI_RE.replace_all(text, "").into_owned()
}

/// Synthesis dispatcher behind one task runner.
pub struct Synthesizer {
    service: Arc<dyn SynthesisService>,
    cache: Option<SynthesisCache>,
    player: Mutex<Option<Arc<SynthesisPlayer>>>,
}

impl Synthesizer {
    pub fn new(service: Arc<dyn SynthesisService>, cache: Option<SynthesisCache>) -> Arc<Self> {
        Arc::new(Self {
            service,
            cache,
            player: Mutex::new(None),
        })
    }

    fn player(&self) -> Result<Arc<SynthesisPlayer>, TtsError> {
        self.player
            .lock()
            .clone()
            .ok_or_else(|| TtsError::Configuration("synthesizer not initialized".into()))
    }
}

#[async_trait]
impl TaskHandler for Synthesizer {
    type Request = TextPacket;
    type Error = TtsError;

    fn name(&self) -> String {
        format!("tts.{}", self.service.provider())
    }

    fn mode(&self) -> RunnerMode {
        RunnerMode::Concurrent
    }

    async fn init(&self, session: &Arc<SessionHandle>) -> Result<(), TtsError> {
        // The playback worker must produce audio at the session rate.
        let mut format = self.service.format();
        format.sample_rate = session.sample_rate();
        let player = SynthesisPlayer::spawn(self.name(), session.clone(), format);
        *self.player.lock() = Some(player);
        Ok(())
    }

    async fn terminate(&self, _session: &Arc<SessionHandle>) {
        if let Some(player) = self.player.lock().clone() {
            player.close();
        }
        self.service.close().await;
    }

    async fn on_event(&self, _session: &Arc<SessionHandle>, event: &SessionEvent) {
        if let SessionEvent::Interruption = event {
            if let Ok(player) = self.player() {
                info!(sender = %self.name(), "interrupting current playback");
                if let Err(err) = player.interrupt(StopReason::Interrupted).await {
                    warn!(error = %err, "failed to deliver interrupt");
                }
            }
        }
    }

    async fn build_request(
        &self,
        session: &Arc<SessionHandle>,
        packet: MediaPacket,
    ) -> Result<Option<PacketRequest<TextPacket>>, TtsError> {
        match packet {
            MediaPacket::Text(text) => Ok(Some(PacketRequest {
                payload: text,
                interrupt: true,
            })),
            other => {
                // Non-text packets pass through untouched.
                session
                    .send_output(other)
                    .await
                    .map_err(|e| TtsError::Synthesis(e.to_string()))?;
                Ok(None)
            }
        }
    }

    async fn execute(
        &self,
        ctx: &TaskContext,
        session: &Arc<SessionHandle>,
        request: PacketRequest<TextPacket>,
    ) -> Result<(), TtsError> {
        let packet = request.payload;
        let player = self.player()?;
        let play_id = packet.play_id.clone().unwrap_or_else(PlayId::generate);
        let requested_at = Instant::now();

        if packet.sequence == 0 {
            // A new reply begins: whatever is still queued belongs to the
            // previous reply.
            info!(
                sender = %self.name(),
                play_id = %play_id,
                "new reply, superseding queued playback"
            );
            player
                .interrupt(StopReason::Superseded)
                .await
                .map_err(|e| TtsError::Synthesis(e.to_string()))?;
        }

        let sink = RequestSink {
            player: player.clone(),
            play_id: play_id.clone(),
            sequence: packet.sequence,
            source_text: packet.text.clone(),
            provider: self.service.provider(),
            session_id: session.id().to_string(),
            dialog_started: packet.started_at,
            requested_at,
            first: AtomicBool::new(true),
            collected: Mutex::new(BytesMut::new()),
        };

        let text = strip_emoji(&packet.text);
        if text.trim().is_empty() {
            warn!(
                sender = %self.name(),
                play_id = %play_id,
                source = %packet.text,
                "nothing to synthesize after stripping"
            );
            sink.on_audio(Bytes::new()).await;
        } else {
            let cache_key = self.service.cache_key(&packet.text);
            let cached = match &self.cache {
                Some(cache) => cache.get(&cache_key).await,
                None => None,
            };
            match cached {
                Some(audio) => {
                    info!(
                        sender = %self.name(),
                        play_id = %play_id,
                        key = %cache_key,
                        "synthesis cache hit"
                    );
                    sink.on_audio(audio).await;
                }
                None => {
                    session
                        .emit(&self.name(), SessionEvent::Synthesizing { text: text.clone() })
                        .await;
                    self.service.synthesize(ctx, &sink, &text).await?;
                    if let Some(cache) = &self.cache {
                        let audio = sink.collected();
                        if !audio.is_empty() && !ctx.is_superseded() {
                            cache.put(cache_key, audio).await;
                        }
                    }
                }
            }
        }

        player
            .play(AudioPacket::end_marker(
                play_id,
                packet.sequence,
                packet.text.clone(),
            ))
            .await
            .map_err(|e| TtsError::Synthesis(e.to_string()))?;

        // The reply is complete on its last segment (or only segment).
        if (packet.is_partial && packet.is_end) || !packet.is_partial {
            session
                .emit(
                    &self.name(),
                    SessionEvent::Completed(CompletedEvent {
                        sender: self.name(),
                        result: packet.text,
                        duration: requested_at.elapsed(),
                        dialog_id: packet.dialog_id,
                    }),
                )
                .await;
        }
        Ok(())
    }
}

/// Sink for one synthesis call: forwards chunks to the playback worker and
/// keeps a copy for the cache.
struct RequestSink {
    player: Arc<SynthesisPlayer>,
    play_id: PlayId,
    sequence: u32,
    source_text: String,
    provider: TtsProviderId,
    session_id: String,
    dialog_started: Option<Instant>,
    requested_at: Instant,
    first: AtomicBool,
    collected: Mutex<BytesMut>,
}

impl RequestSink {
    fn collected(&self) -> Bytes {
        Bytes::copy_from_slice(&self.collected.lock())
    }
}

#[async_trait]
impl SynthesisSink for RequestSink {
    async fn on_audio(&self, chunk: Bytes) {
        let first = self.first.swap(false, Ordering::AcqRel);
        if first {
            info!(
                session_id = %self.session_id,
                provider = %self.provider,
                ttfb_ms = self.requested_at.elapsed().as_millis() as u64,
                "synthesis first byte"
            );
            if let Some(dialog_started) = self.dialog_started {
                let since_dialog = dialog_started.elapsed();
                // Stale dialog timestamps produce nonsense latencies.
                if since_dialog < Duration::from_secs(30) {
                    info!(
                        session_id = %self.session_id,
                        play_id = %self.play_id,
                        ttfb_ms = since_dialog.as_millis() as u64,
                        "dialog first byte"
                    );
                }
            }
        }

        self.collected.lock().extend_from_slice(&chunk);
        let packet = AudioPacket {
            payload: chunk,
            is_synthesized: true,
            is_first: first && self.sequence == 0,
            is_end: false,
            play_id: Some(self.play_id.clone()),
            sequence: self.sequence,
            source_text: self.source_text.clone(),
        };
        if let Err(err) = self.player.play(packet).await {
            warn!(error = %err, "dropping synthesized audio");
        }
    }
}
