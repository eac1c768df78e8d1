//! Streaming speech synthesis: the vendor contract, the frame-paced player
//! that feeds the session output queue, and the dispatcher that turns reply
//! text into audio.

pub mod base;
pub mod player;
pub mod synthesizer;

pub use base::{
    SentenceTimestamp, SynthesisBuffer, SynthesisService, SynthesisSink, TtsError, TtsErrorKind,
    TtsProviderId, Word,
};
pub use player::{StopReason, SynthesisPlayer};
pub use synthesizer::Synthesizer;
