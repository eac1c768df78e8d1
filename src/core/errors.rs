//! Top-level error type for pipeline operations.

use crate::core::{asr::AsrError, tts::TtsError};

/// Error surfaced to the owning session. Anything reaching an error handler
/// through [`crate::core::session::SessionHandle::cause_error`] is fatal for
/// the call; transport-level failures are absorbed by reconnect logic before
/// they get here.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("ASR error: {0}")]
    Asr(#[from] AsrError),
    #[error("TTS error: {0}")]
    Tts(#[from] TtsError),
    #[error("initialization error: {0}")]
    Initialization(String),
    #[error("output queue error: {0}")]
    Output(String),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type for pipeline operations.
pub type PipelineResult<T> = Result<T, PipelineError>;
