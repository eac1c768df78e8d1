pub mod asr;
pub mod cache;
pub mod errors;
pub mod packet;
pub mod providers;
pub mod ring_buffer;
pub mod runner;
pub mod session;
pub mod tts;

// Re-export commonly used types for convenience
pub use asr::{
    AsrConnectionState, AsrError, AsrErrorCallback, AsrProviderId, AsrResult, AsrResultCallback,
    AsrStream, ContinuousAsrFilter, Corrector, GatedAsrFilter, TranscribeOptions,
};

pub use tts::{
    SentenceTimestamp, StopReason, SynthesisBuffer, SynthesisPlayer, SynthesisService,
    SynthesisSink, Synthesizer, TtsError, TtsProviderId, Word,
};

pub use cache::{CacheMetrics, SynthesisCache, synthesis_cache_key};
pub use providers::{AsrProviderRegistry, MockAsrStream, MockTtsService, TtsProviderRegistry};
pub use errors::{PipelineError, PipelineResult};
pub use packet::{
    AudioPacket, CompletedEvent, DialogId, Direction, EventKind, MediaPacket, PlayId, SessionEvent,
    StartPlayEvent, StopPlayEvent, StreamFormat, TextPacket, TranscribingEvent,
};
pub use ring_buffer::RingBuffer;
pub use runner::{
    PacketRequest, RunnerHandle, RunnerMode, Severity, TaskContext, TaskFailure, TaskHandler,
    TaskRunner,
};
pub use session::{ErrorCallback, EventCallback, SessionHandle};
