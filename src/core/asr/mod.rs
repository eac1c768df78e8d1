//! Streaming speech recognition: the vendor contract, the transcript
//! filters that sit between capture audio and the session, and the phonetic
//! correction pass applied to final transcripts.

pub mod base;
pub mod correction;
pub mod filter;

pub use base::{
    AsrConnectionState, AsrError, AsrErrorCallback, AsrErrorKind, AsrProviderId, AsrResult,
    AsrResultCallback, AsrStream, TranscribeOptions,
};
pub use correction::Corrector;
pub use filter::{ContinuousAsrFilter, GatedAsrFilter};
