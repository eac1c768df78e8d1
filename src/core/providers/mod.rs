//! Provider registries and the in-process mock vendors.
//!
//! Real vendor clients implement [`AsrStream`] or [`SynthesisService`] and
//! register a factory under their provider ID. The mocks registered by
//! default are full implementations of the contracts and are what the test
//! suite runs against: deterministic audio, scriptable results and errors,
//! and cooperative cancellation.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::config::{AsrConfig, TtsConfig};
use crate::core::asr::{
    AsrConnectionState, AsrError, AsrErrorCallback, AsrProviderId, AsrResult, AsrResultCallback,
    AsrStream,
};
use crate::core::cache::synthesis_cache_key;
use crate::core::errors::{PipelineError, PipelineResult};
use crate::core::packet::{DialogId, StreamFormat};
use crate::core::runner::TaskContext;
use crate::core::tts::{
    SentenceTimestamp, SynthesisService, SynthesisSink, TtsError, TtsProviderId, Word,
};

pub type AsrStreamFactory =
    Arc<dyn Fn(&AsrConfig) -> PipelineResult<Arc<dyn AsrStream>> + Send + Sync>;
pub type SynthesisServiceFactory =
    Arc<dyn Fn(&TtsConfig) -> PipelineResult<Arc<dyn SynthesisService>> + Send + Sync>;

/// Maps recognition provider IDs to constructors.
pub struct AsrProviderRegistry {
    factories: HashMap<AsrProviderId, AsrStreamFactory>,
}

impl AsrProviderRegistry {
    /// Registry with the built-in mock provider.
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register(
            AsrProviderId::new("mock"),
            Arc::new(|_config| Ok(MockAsrStream::new() as Arc<dyn AsrStream>)),
        );
        registry
    }

    pub fn register(&mut self, id: AsrProviderId, factory: AsrStreamFactory) {
        self.factories.insert(id, factory);
    }

    pub fn create(&self, config: &AsrConfig) -> PipelineResult<Arc<dyn AsrStream>> {
        match self.factories.get(&config.provider) {
            Some(factory) => factory(config),
            None => Err(PipelineError::Initialization(format!(
                "unknown recognition provider: {}",
                config.provider
            ))),
        }
    }
}

impl Default for AsrProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps synthesis provider IDs to constructors.
pub struct TtsProviderRegistry {
    factories: HashMap<TtsProviderId, SynthesisServiceFactory>,
}

impl TtsProviderRegistry {
    /// Registry with the built-in mock provider.
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register(
            TtsProviderId::new("mock"),
            Arc::new(|config| {
                Ok(Arc::new(MockTtsService::from_config(config)) as Arc<dyn SynthesisService>)
            }),
        );
        registry
    }

    pub fn register(&mut self, id: TtsProviderId, factory: SynthesisServiceFactory) {
        self.factories.insert(id, factory);
    }

    pub fn create(&self, config: &TtsConfig) -> PipelineResult<Arc<dyn SynthesisService>> {
        match self.factories.get(&config.provider) {
            Some(factory) => factory(config),
            None => Err(PipelineError::Initialization(format!(
                "unknown synthesis provider: {}",
                config.provider
            ))),
        }
    }
}

impl Default for TtsProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

struct MockAsrCallbacks {
    on_result: AsrResultCallback,
    on_error: AsrErrorCallback,
}

/// Scriptable in-process recognition stream.
pub struct MockAsrStream {
    state: Mutex<AsrConnectionState>,
    callbacks: Mutex<Option<MockAsrCallbacks>>,
    dialog: Mutex<Option<DialogId>>,
    received: Mutex<Vec<Bytes>>,
    connects: AtomicUsize,
    ends: AtomicUsize,
    fail_connect: AtomicBool,
}

impl MockAsrStream {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(AsrConnectionState::Idle),
            callbacks: Mutex::new(None),
            dialog: Mutex::new(None),
            received: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            ends: AtomicUsize::new(0),
            fail_connect: AtomicBool::new(false),
        })
    }

    /// Makes the next `connect` fail with a configuration error.
    pub fn fail_next_connect(&self) {
        self.fail_connect.store(true, Ordering::Release);
    }

    /// Delivers a transcript through the registered result callback.
    pub async fn push_result(&self, mut result: AsrResult) {
        if result.dialog_id.is_none() {
            result.dialog_id = self.dialog.lock().clone();
        }
        let callback = self
            .callbacks
            .lock()
            .as_ref()
            .map(|callbacks| callbacks.on_result.clone());
        if let Some(callback) = callback {
            callback(result).await;
        }
    }

    /// Delivers an error through the registered error callback.
    pub async fn push_error(&self, err: AsrError) {
        let callback = self
            .callbacks
            .lock()
            .as_ref()
            .map(|callbacks| callbacks.on_error.clone());
        if let Some(callback) = callback {
            callback(err).await;
        }
    }

    /// Every audio chunk written to the stream, in order.
    pub fn sent_audio(&self) -> Vec<Bytes> {
        self.received.lock().clone()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::Acquire)
    }

    pub fn end_count(&self) -> usize {
        self.ends.load(Ordering::Acquire)
    }
}

#[async_trait]
impl AsrStream for MockAsrStream {
    fn provider(&self) -> AsrProviderId {
        AsrProviderId::new("mock")
    }

    fn state(&self) -> AsrConnectionState {
        *self.state.lock()
    }

    async fn init(
        &self,
        on_result: AsrResultCallback,
        on_error: AsrErrorCallback,
    ) -> Result<(), AsrError> {
        *self.callbacks.lock() = Some(MockAsrCallbacks {
            on_result,
            on_error,
        });
        Ok(())
    }

    async fn connect(&self, dialog_id: DialogId) -> Result<(), AsrError> {
        if self.fail_connect.swap(false, Ordering::AcqRel) {
            return Err(AsrError::Configuration("mock connect refused".into()));
        }
        *self.dialog.lock() = Some(dialog_id);
        *self.state.lock() = AsrConnectionState::Connected;
        self.connects.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn send_audio(&self, audio: Bytes) -> Result<(), AsrError> {
        if !self.is_active() {
            return Err(AsrError::StreamWrite("mock stream not connected".into()));
        }
        self.received.lock().push(audio);
        Ok(())
    }

    async fn send_end(&self) -> Result<(), AsrError> {
        self.ends.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn stop(&self) -> Result<(), AsrError> {
        *self.state.lock() = AsrConnectionState::Closed;
        Ok(())
    }

    fn is_active(&self) -> bool {
        *self.state.lock() == AsrConnectionState::Connected
    }
}

/// Deterministic in-process synthesis service.
///
/// Audio is a pure function of the input text, so cache behavior is
/// observable: the same text always renders the same bytes.
pub struct MockTtsService {
    voice: String,
    model: String,
    speech_rate: f32,
    format: StreamFormat,
    /// Chunk size the audio is streamed in.
    chunk_size: usize,
    /// Pause between streamed chunks, giving cancellation a window.
    chunk_delay: Duration,
    synth_calls: AtomicUsize,
    fail_next: AtomicBool,
}

impl MockTtsService {
    pub fn from_config(config: &TtsConfig) -> Self {
        Self {
            voice: config.voice.clone(),
            model: config.model.clone(),
            speech_rate: config.speech_rate,
            format: config.format,
            chunk_size: 64,
            chunk_delay: Duration::ZERO,
            synth_calls: AtomicUsize::new(0),
            fail_next: AtomicBool::new(false),
        }
    }

    pub fn new() -> Self {
        Self::from_config(&TtsConfig::default())
    }

    pub fn with_chunking(mut self, chunk_size: usize, chunk_delay: Duration) -> Self {
        self.chunk_size = chunk_size;
        self.chunk_delay = chunk_delay;
        self
    }

    /// Makes the next `synthesize` fail.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::Release);
    }

    /// Number of provider calls that actually synthesized.
    pub fn synth_calls(&self) -> usize {
        self.synth_calls.load(Ordering::Acquire)
    }

    /// The exact bytes `synthesize` streams for `text`.
    pub fn rendered_audio(text: &str) -> Bytes {
        // Four PCM bytes per input byte keeps payloads comfortably larger
        // than the text while staying deterministic.
        let mut pcm = Vec::with_capacity(text.len() * 4);
        for &byte in text.as_bytes() {
            pcm.extend_from_slice(&[byte, byte ^ 0x55, byte ^ 0xaa, byte]);
        }
        Bytes::from(pcm)
    }
}

impl Default for MockTtsService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SynthesisService for MockTtsService {
    fn provider(&self) -> TtsProviderId {
        TtsProviderId::new("mock")
    }

    fn format(&self) -> StreamFormat {
        self.format
    }

    fn cache_key(&self, text: &str) -> String {
        // The sample rate changes the rendered PCM, so it is part of the
        // key preimage alongside voice, model, and rate.
        synthesis_cache_key(&format!(
            "mock:{}:{}:{}:{}:{}",
            self.voice, self.model, self.speech_rate, self.format.sample_rate, text
        ))
    }

    async fn synthesize(
        &self,
        ctx: &TaskContext,
        sink: &dyn SynthesisSink,
        text: &str,
    ) -> Result<(), TtsError> {
        if self.fail_next.swap(false, Ordering::AcqRel) {
            return Err(TtsError::Synthesis("mock synthesis refused".into()));
        }
        self.synth_calls.fetch_add(1, Ordering::AcqRel);

        let audio = Self::rendered_audio(text);
        let mut offset = 0;
        while offset < audio.len() {
            if ctx.is_superseded() {
                debug!("mock synthesis superseded mid-stream");
                return Ok(());
            }
            let end = (offset + self.chunk_size).min(audio.len());
            sink.on_audio(audio.slice(offset..end)).await;
            offset = end;
            if self.chunk_delay > Duration::ZERO {
                tokio::time::sleep(self.chunk_delay).await;
            }
        }

        // One sentence spanning the whole clip, timed off the PCM length.
        let total = Duration::from_millis(audio.len() as u64 / self.format.bytes_per_millisecond().max(1) as u64);
        sink.on_timestamp(SentenceTimestamp {
            text: text.to_string(),
            start_time: Duration::ZERO,
            end_time: total,
            words: vec![Word {
                word: text.to_string(),
                start_time: Duration::ZERO,
                end_time: total,
                confidence: 1.0,
            }],
        })
        .await;
        Ok(())
    }

    async fn close(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::tts::SynthesisBuffer;
    use tokio_util::sync::CancellationToken;

    fn context() -> TaskContext {
        TaskContext::from_token(CancellationToken::new())
    }

    #[test]
    fn test_registry_rejects_unknown_provider() {
        let registry = AsrProviderRegistry::new();
        let config = AsrConfig {
            provider: AsrProviderId::new("nonexistent"),
            ..Default::default()
        };
        assert!(matches!(
            registry.create(&config),
            Err(PipelineError::Initialization(_))
        ));
    }

    #[test]
    fn test_registry_builds_mock_providers() {
        let asr = AsrProviderRegistry::new().create(&AsrConfig::default()).unwrap();
        assert_eq!(asr.provider().as_str(), "mock");
        let tts = TtsProviderRegistry::new().create(&TtsConfig::default()).unwrap();
        assert_eq!(tts.provider().as_str(), "mock");
    }

    #[tokio::test]
    async fn test_mock_tts_is_deterministic() {
        let service = MockTtsService::new();
        let buffer_a = SynthesisBuffer::new();
        let buffer_b = SynthesisBuffer::new();
        service.synthesize(&context(), &buffer_a, "你好").await.unwrap();
        service.synthesize(&context(), &buffer_b, "你好").await.unwrap();
        assert_eq!(buffer_a.audio(), buffer_b.audio());
        assert_eq!(buffer_a.audio(), MockTtsService::rendered_audio("你好"));
        assert_eq!(buffer_a.timestamps().len(), 1);
        assert_eq!(buffer_a.timestamps()[0].words[0].word, "你好");
    }

    #[tokio::test]
    async fn test_mock_tts_cache_key_covers_parameters() {
        let default_voice = MockTtsService::new();
        let other_voice = MockTtsService::from_config(&TtsConfig {
            voice: "other".to_string(),
            ..Default::default()
        });
        let narrowband = MockTtsService::from_config(&TtsConfig {
            format: StreamFormat {
                sample_rate: 8000,
                ..Default::default()
            },
            ..Default::default()
        });
        assert_ne!(default_voice.cache_key("hi"), other_voice.cache_key("hi"));
        assert_ne!(default_voice.cache_key("hi"), narrowband.cache_key("hi"));
        assert_eq!(default_voice.cache_key("hi"), MockTtsService::new().cache_key("hi"));
    }

    #[tokio::test]
    async fn test_mock_tts_stops_when_superseded() {
        let service = MockTtsService::new().with_chunking(4, Duration::from_millis(5));
        let token = CancellationToken::new();
        let ctx = TaskContext::from_token(token.clone());
        token.cancel();

        let buffer = SynthesisBuffer::new();
        service.synthesize(&ctx, &buffer, "long text").await.unwrap();
        assert!(buffer.is_empty());
    }

    #[tokio::test]
    async fn test_mock_asr_requires_connection_for_audio() {
        let stream = MockAsrStream::new();
        assert!(stream.send_audio(Bytes::from_static(&[1])).await.is_err());
        stream.connect(DialogId::generate()).await.unwrap();
        assert!(stream.send_audio(Bytes::from_static(&[1])).await.is_ok());
        assert_eq!(stream.sent_audio().len(), 1);
    }
}
