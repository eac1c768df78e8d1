//! Vendor-agnostic streaming recognition contract.
//!
//! A provider implements [`AsrStream`] around its websocket or gRPC client.
//! The pipeline only ever talks to the trait: callbacks deliver results, and
//! every error carries a kind so callers never classify by message text.

use async_trait::async_trait;
use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use crate::core::packet::DialogId;
use crate::core::runner::{Severity, TaskFailure};

/// Identifies one recognition vendor, e.g. `mock` or `deepgram`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
#[serde(transparent)]
pub struct AsrProviderId(String);

impl AsrProviderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AsrProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AsrProviderId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Provider-independent transcription parameters.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TranscribeOptions {
    pub language: String,
    pub model: String,
    pub sample_rate: u32,
    /// Ask the provider for punctuated output.
    pub punctuation: bool,
    /// Ask the provider for partial results while the utterance is open.
    pub interim_results: bool,
}

impl Default for TranscribeOptions {
    fn default() -> Self {
        Self {
            language: "zh-CN".to_string(),
            model: "default".to_string(),
            sample_rate: 16000,
            punctuation: true,
            interim_results: true,
        }
    }
}

/// Lifecycle of one provider stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsrConnectionState {
    Idle,
    Connecting,
    Connected,
    Closed,
}

/// Classification of an [`AsrError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsrErrorKind {
    /// Provider noise, e.g. a close code for "no audio sent". Ignored.
    Benign,
    /// Lost or refused connection. The stream is restarted.
    Transport,
    /// Bad credentials or parameters. Fatal for the session.
    Configuration,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum AsrError {
    #[error("recognition configuration: {0}")]
    Configuration(String),
    #[error("recognition connection: {0}")]
    Connection(String),
    #[error("recognition stream write: {0}")]
    StreamWrite(String),
    #[error("provider closed the stream: {0}")]
    RemoteClosed(String),
    #[error("provider received no audio")]
    NoAudio,
}

impl AsrError {
    pub fn kind(&self) -> AsrErrorKind {
        match self {
            AsrError::Configuration(_) => AsrErrorKind::Configuration,
            AsrError::Connection(_)
            | AsrError::StreamWrite(_)
            | AsrError::RemoteClosed(_) => AsrErrorKind::Transport,
            AsrError::NoAudio => AsrErrorKind::Benign,
        }
    }
}

impl TaskFailure for AsrError {
    fn severity(&self) -> Severity {
        match self.kind() {
            AsrErrorKind::Benign => Severity::Benign,
            AsrErrorKind::Transport => Severity::Transport,
            AsrErrorKind::Configuration => Severity::Fatal,
        }
    }
}

/// One transcript delivered by a provider.
#[derive(Debug, Clone)]
pub struct AsrResult {
    pub text: String,
    /// False while the provider may still revise the text.
    pub is_final: bool,
    /// Audio duration covered by this transcript.
    pub duration: Duration,
    /// Utterance this transcript belongs to, when the provider tracks it.
    pub dialog_id: Option<DialogId>,
}

/// Async callback delivering transcripts.
pub type AsrResultCallback =
    Arc<dyn Fn(AsrResult) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Async callback delivering stream errors.
pub type AsrErrorCallback =
    Arc<dyn Fn(AsrError) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Vendor-facing streaming recognition client.
#[async_trait]
pub trait AsrStream: Send + Sync {
    fn provider(&self) -> AsrProviderId;

    fn state(&self) -> AsrConnectionState;

    /// Registers the result and error callbacks. Called once, before
    /// [`AsrStream::connect`].
    async fn init(
        &self,
        on_result: AsrResultCallback,
        on_error: AsrErrorCallback,
    ) -> Result<(), AsrError>;

    /// Opens a provider stream for one utterance.
    async fn connect(&self, dialog_id: DialogId) -> Result<(), AsrError>;

    /// Writes one chunk of capture audio to the open stream.
    async fn send_audio(&self, audio: Bytes) -> Result<(), AsrError>;

    /// Signals end of utterance so the provider flushes its final result.
    async fn send_end(&self) -> Result<(), AsrError>;

    /// Closes the provider stream.
    async fn stop(&self) -> Result<(), AsrError>;

    /// True while the stream accepts audio.
    fn is_active(&self) -> bool;

    /// Replaces a failed stream with a fresh one under a new utterance key.
    async fn restart(&self) -> Result<(), AsrError> {
        self.stop().await?;
        self.connect(DialogId::generate()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            AsrError::Configuration("bad key".into()).kind(),
            AsrErrorKind::Configuration
        );
        assert_eq!(
            AsrError::Connection("refused".into()).kind(),
            AsrErrorKind::Transport
        );
        assert_eq!(AsrError::NoAudio.kind(), AsrErrorKind::Benign);
    }

    #[test]
    fn test_severity_mapping() {
        assert_eq!(AsrError::NoAudio.severity(), Severity::Benign);
        assert_eq!(
            AsrError::RemoteClosed("1011".into()).severity(),
            Severity::Transport
        );
        assert_eq!(
            AsrError::Configuration("bad key".into()).severity(),
            Severity::Fatal
        );
    }
}
