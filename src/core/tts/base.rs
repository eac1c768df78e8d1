//! Vendor-agnostic streaming synthesis contract.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::time::Duration;

use crate::core::packet::StreamFormat;
use crate::core::runner::{Severity, TaskContext, TaskFailure};

/// Identifies one synthesis vendor, e.g. `mock` or `edge`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
#[serde(transparent)]
pub struct TtsProviderId(String);

impl TtsProviderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TtsProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TtsProviderId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Classification of a [`TtsError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtsErrorKind {
    Benign,
    Transport,
    Configuration,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TtsError {
    #[error("synthesis configuration: {0}")]
    Configuration(String),
    #[error("synthesis connection: {0}")]
    Connection(String),
    #[error("synthesis failed: {0}")]
    Synthesis(String),
    #[error("synthesis superseded")]
    Superseded,
}

impl TtsError {
    pub fn kind(&self) -> TtsErrorKind {
        match self {
            TtsError::Configuration(_) => TtsErrorKind::Configuration,
            TtsError::Connection(_) | TtsError::Synthesis(_) => TtsErrorKind::Transport,
            TtsError::Superseded => TtsErrorKind::Benign,
        }
    }
}

impl TaskFailure for TtsError {
    fn severity(&self) -> Severity {
        match self.kind() {
            TtsErrorKind::Benign => Severity::Benign,
            TtsErrorKind::Transport => Severity::Transport,
            TtsErrorKind::Configuration => Severity::Fatal,
        }
    }
}

/// Word-level timing reported by providers that support it.
#[derive(Debug, Clone)]
pub struct Word {
    pub word: String,
    pub start_time: Duration,
    pub end_time: Duration,
    pub confidence: f32,
}

/// Sentence-level timing for one stretch of synthesized audio.
#[derive(Debug, Clone)]
pub struct SentenceTimestamp {
    pub text: String,
    pub start_time: Duration,
    pub end_time: Duration,
    pub words: Vec<Word>,
}

/// Receiver of streamed synthesis output.
#[async_trait]
pub trait SynthesisSink: Send + Sync {
    /// One chunk of PCM audio, in synthesis order.
    async fn on_audio(&self, chunk: Bytes);

    /// Timing metadata, when the provider reports it.
    async fn on_timestamp(&self, _timestamp: SentenceTimestamp) {}
}

/// Vendor-facing streaming synthesis client.
#[async_trait]
pub trait SynthesisService: Send + Sync {
    fn provider(&self) -> TtsProviderId;

    /// PCM format of the produced audio.
    fn format(&self) -> StreamFormat;

    /// Content-addressable key for `text` under this service's full
    /// parameter set. Two calls return the same key only when they would
    /// produce the same audio.
    fn cache_key(&self, text: &str) -> String;

    /// Streams synthesis of `text` into `sink`. Implementations poll
    /// `ctx.is_superseded()` between chunks and return early once the
    /// request has been superseded.
    async fn synthesize(
        &self,
        ctx: &TaskContext,
        sink: &dyn SynthesisSink,
        text: &str,
    ) -> Result<(), TtsError>;

    /// Releases provider resources.
    async fn close(&self);
}

/// Sink that collects all audio into one contiguous buffer.
#[derive(Default)]
pub struct SynthesisBuffer {
    audio: Mutex<BytesMut>,
    timestamps: Mutex<Vec<SentenceTimestamp>>,
}

impl SynthesisBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The audio collected so far.
    pub fn audio(&self) -> Bytes {
        Bytes::copy_from_slice(&self.audio.lock())
    }

    pub fn timestamps(&self) -> Vec<SentenceTimestamp> {
        self.timestamps.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.audio.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.audio.lock().is_empty()
    }
}

#[async_trait]
impl SynthesisSink for SynthesisBuffer {
    async fn on_audio(&self, chunk: Bytes) {
        self.audio.lock().extend_from_slice(&chunk);
    }

    async fn on_timestamp(&self, timestamp: SentenceTimestamp) {
        self.timestamps.lock().push(timestamp);
    }
}
