//! Media packets and session events exchanged across the pipeline.
//!
//! Every component speaks [`MediaPacket`] on the data path and
//! [`SessionEvent`] on the control path. Events are typed variants rather
//! than string-tagged tuples so that consumers never have to downcast
//! positional parameters.

use bytes::Bytes;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Correlation key for one ASR utterance.
///
/// Generated on the first voice-activity transition of a dialog and cleared
/// when the final transcript is emitted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DialogId(String);

impl DialogId {
    /// Generates a fresh random dialog ID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DialogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DialogId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Correlation key for one TTS reply. Segments of the reply share the play
/// ID and are ordered by their sequence number; sequence 0 marks the first
/// segment and is the interruption boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlayId(String);

impl PlayId {
    /// Generates a fresh random play ID.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PlayId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlayId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Negotiated audio stream parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamFormat {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Bits per sample (16 for linear PCM)
    pub bit_depth: u16,
    /// Number of audio channels (1 for mono)
    pub channels: u16,
    /// Duration of one paced output frame in milliseconds. Zero disables
    /// pacing and passes audio straight through.
    pub frame_duration_ms: u64,
}

impl StreamFormat {
    /// Number of PCM bytes covering one millisecond of audio.
    pub fn bytes_per_millisecond(&self) -> usize {
        self.sample_rate as usize / 1000 * (self.bit_depth as usize / 8) * self.channels as usize
    }

    /// Number of PCM bytes in one paced frame.
    pub fn frame_size(&self) -> usize {
        self.bytes_per_millisecond() * self.frame_duration_ms as usize
    }

    /// The frame pacing interval, or `None` when pacing is disabled.
    pub fn frame_duration(&self) -> Option<Duration> {
        (self.frame_duration_ms > 0).then(|| Duration::from_millis(self.frame_duration_ms))
    }
}

impl Default for StreamFormat {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            bit_depth: 16,
            channels: 1,
            frame_duration_ms: 20,
        }
    }
}

/// Direction of an audio stream relative to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Audio arriving from the caller
    Input,
    /// Audio produced by the agent
    Output,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Input => write!(f, "input"),
            Direction::Output => write!(f, "output"),
        }
    }
}

/// One chunk of raw PCM audio flowing through the pipeline.
#[derive(Debug, Clone)]
pub struct AudioPacket {
    /// Raw PCM payload. Empty for terminal markers.
    pub payload: Bytes,
    /// True when the bytes came out of a synthesis provider
    pub is_synthesized: bool,
    /// First packet of a play segment
    pub is_first: bool,
    /// Terminal marker closing a play segment
    pub is_end: bool,
    /// Play correlation key, empty string for plain capture audio
    pub play_id: Option<PlayId>,
    /// Segment index within the reply
    pub sequence: u32,
    /// Text the audio was synthesized from
    pub source_text: String,
}

impl AudioPacket {
    /// Plain captured audio with no play affiliation.
    pub fn capture(payload: Bytes) -> Self {
        Self {
            payload,
            is_synthesized: false,
            is_first: false,
            is_end: false,
            play_id: None,
            sequence: 0,
            source_text: String::new(),
        }
    }

    /// Terminal marker closing the given play segment.
    pub fn end_marker(play_id: PlayId, sequence: u32, source_text: String) -> Self {
        Self {
            payload: Bytes::new(),
            is_synthesized: true,
            is_first: false,
            is_end: true,
            play_id: Some(play_id),
            sequence,
            source_text,
        }
    }
}

/// One text segment flowing through the pipeline, either a transcript or a
/// reply segment awaiting synthesis.
#[derive(Debug, Clone)]
pub struct TextPacket {
    pub text: String,
    /// True while more segments of the same reply are expected
    pub is_partial: bool,
    /// Terminal segment of the reply
    pub is_end: bool,
    /// True when the text came out of an ASR provider
    pub is_transcribed: bool,
    /// Segment index within the reply
    pub sequence: u32,
    pub play_id: Option<PlayId>,
    pub dialog_id: Option<DialogId>,
    /// When the dialog that produced this reply started, for TTFB accounting
    pub started_at: Option<Instant>,
}

impl TextPacket {
    /// A single-segment reply: sequence 0, final.
    pub fn reply(text: impl Into<String>, play_id: PlayId) -> Self {
        Self {
            text: text.into(),
            is_partial: false,
            is_end: false,
            is_transcribed: false,
            sequence: 0,
            play_id: Some(play_id),
            dialog_id: None,
            started_at: None,
        }
    }

    /// One segment of a multi-segment reply.
    pub fn segment(text: impl Into<String>, play_id: PlayId, sequence: u32, is_end: bool) -> Self {
        Self {
            text: text.into(),
            is_partial: true,
            is_end,
            is_transcribed: false,
            sequence,
            play_id: Some(play_id),
            dialog_id: None,
            started_at: None,
        }
    }
}

/// Tagged media packet moving along the data path.
#[derive(Debug, Clone)]
pub enum MediaPacket {
    Audio(AudioPacket),
    Text(TextPacket),
    Close { reason: String },
}

/// Partial ASR result payload.
#[derive(Debug, Clone)]
pub struct TranscribingEvent {
    pub sender: String,
    pub text: String,
    pub duration: Duration,
    pub dialog_id: DialogId,
    pub direction: Direction,
}

/// Final ASR result, or end of one TTS reply.
#[derive(Debug, Clone)]
pub struct CompletedEvent {
    pub sender: String,
    pub result: String,
    pub duration: Duration,
    pub dialog_id: Option<DialogId>,
}

/// Playback started for a segment.
#[derive(Debug, Clone)]
pub struct StartPlayEvent {
    pub sender: String,
    pub play_id: PlayId,
    pub sequence: u32,
    pub source_text: String,
}

/// Playback stopped for a segment, either finished or cut.
#[derive(Debug, Clone)]
pub struct StopPlayEvent {
    pub sender: String,
    pub duration: Duration,
    pub play_id: PlayId,
    pub sequence: u32,
    pub reason: super::tts::StopReason,
    pub source_text: String,
}

/// Control-path event exchanged between the pipeline and the owning session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Session or connection opened
    Begin,
    /// Voice activity detected
    StartSpeaking { dialog_id: Option<DialogId> },
    /// Voice activity ended
    StartSilence,
    /// Partial ASR result
    Transcribing(TranscribingEvent),
    /// Final ASR result, or end of one TTS reply
    Completed(CompletedEvent),
    /// A synthesis call is about to start
    Synthesizing { text: String },
    StartPlay(StartPlayEvent),
    StopPlay(StopPlayEvent),
    /// Caller-requested barge-in
    Interruption,
    /// Call teardown
    Hangup,
}

impl SessionEvent {
    /// Discriminant used for handler registration.
    pub fn kind(&self) -> EventKind {
        match self {
            SessionEvent::Begin => EventKind::Begin,
            SessionEvent::StartSpeaking { .. } => EventKind::StartSpeaking,
            SessionEvent::StartSilence => EventKind::StartSilence,
            SessionEvent::Transcribing(_) => EventKind::Transcribing,
            SessionEvent::Completed(_) => EventKind::Completed,
            SessionEvent::Synthesizing { .. } => EventKind::Synthesizing,
            SessionEvent::StartPlay(_) => EventKind::StartPlay,
            SessionEvent::StopPlay(_) => EventKind::StopPlay,
            SessionEvent::Interruption => EventKind::Interruption,
            SessionEvent::Hangup => EventKind::Hangup,
        }
    }
}

/// Discriminant of [`SessionEvent`] for subscription routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Begin,
    StartSpeaking,
    StartSilence,
    Transcribing,
    Completed,
    Synthesizing,
    StartPlay,
    StopPlay,
    Interruption,
    Hangup,
}
