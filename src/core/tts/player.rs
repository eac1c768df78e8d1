//! Frame-paced playback of synthesized audio.
//!
//! Providers deliver audio in bursts; the player re-times it into fixed
//! frames on a wall-clock interval so downstream transports see a steady
//! stream. All queue and play-record state lives on the worker task and is
//! reached only through the command channel.
//!
//! Play lifecycle events are exact: `StartPlay` fires when the first frame
//! of a reply leaves the queue, and `StopPlay` fires exactly once per
//! (play, sequence), whether the segment finished or was cut.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use bytes::BytesMut;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::errors::{PipelineError, PipelineResult};
use crate::core::packet::{
    AudioPacket, MediaPacket, PlayId, SessionEvent, StartPlayEvent, StopPlayEvent, StreamFormat,
};
use crate::core::session::SessionHandle;

const COMMAND_QUEUE_SIZE: usize = 32;
const COMMAND_SEND_TIMEOUT: Duration = Duration::from_millis(200);

/// Why a play segment stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The segment played to its end marker.
    Finished,
    /// The caller barged in.
    Interrupted,
    /// A newer reply replaced this one before it finished.
    Superseded,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Finished => write!(f, "finished"),
            StopReason::Interrupted => write!(f, "interrupted"),
            StopReason::Superseded => write!(f, "superseded"),
        }
    }
}

enum PlayerCommand {
    Play(AudioPacket),
    Interrupt(StopReason),
}

/// Handle to the playback worker of one session.
///
/// With pacing disabled (`frame_duration_ms == 0`) packets pass straight
/// through to the session output and no worker runs.
pub struct SynthesisPlayer {
    sender: String,
    session: Arc<SessionHandle>,
    tx: Option<mpsc::Sender<PlayerCommand>>,
    cancel: CancellationToken,
}

impl SynthesisPlayer {
    pub fn spawn(
        sender: impl Into<String>,
        session: Arc<SessionHandle>,
        format: StreamFormat,
    ) -> Arc<Self> {
        let sender = sender.into();
        let cancel = session.cancellation().child_token();

        let tx = format.frame_duration().map(|frame_duration| {
            let (tx, rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
            let worker = PlayerWorker {
                sender: sender.clone(),
                session: session.clone(),
                frame_size: format.frame_size(),
                queue: VecDeque::new(),
                records: HashMap::new(),
                play_started: Instant::now(),
            };
            tokio::spawn(worker.run(rx, frame_duration, cancel.clone()));
            tx
        });

        Arc::new(Self {
            sender,
            session,
            tx,
            cancel,
        })
    }

    /// Queues one packet for paced playback, or forwards it directly when
    /// pacing is disabled.
    pub async fn play(&self, packet: AudioPacket) -> PipelineResult<()> {
        match &self.tx {
            Some(tx) => tx
                .send_timeout(PlayerCommand::Play(packet), COMMAND_SEND_TIMEOUT)
                .await
                .map_err(|e| PipelineError::Output(format!("player queue: {e}"))),
            None => self.session.send_output(MediaPacket::Audio(packet)).await,
        }
    }

    /// Discards everything queued and reports each unfinished segment as
    /// stopped with `reason`.
    pub async fn interrupt(&self, reason: StopReason) -> PipelineResult<()> {
        let Some(tx) = &self.tx else {
            return Ok(());
        };
        tx.send_timeout(PlayerCommand::Interrupt(reason), COMMAND_SEND_TIMEOUT)
            .await
            .map_err(|e| PipelineError::Output(format!("player queue: {e}")))
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

struct QueuedPacket {
    packet: AudioPacket,
    sent: usize,
}

struct PlayRecord {
    reason: StopReason,
    stopped_sequences: HashSet<u32>,
}

struct AssembledFrame {
    packet: AudioPacket,
    is_first: bool,
}

struct PlayerWorker {
    sender: String,
    session: Arc<SessionHandle>,
    frame_size: usize,
    queue: VecDeque<QueuedPacket>,
    records: HashMap<String, PlayRecord>,
    play_started: Instant,
}

impl PlayerWorker {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<PlayerCommand>,
        frame_duration: Duration,
        cancel: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(frame_duration);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(sender = %self.sender, "playback worker stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
                command = rx.recv() => {
                    let Some(command) = command else { return };
                    match command {
                        PlayerCommand::Play(packet) => self.enqueue(packet).await,
                        PlayerCommand::Interrupt(reason) => self.interrupt(reason).await,
                    }
                }
            }
        }
    }

    async fn tick(&mut self) {
        let Some(frame) = self.assemble_frame() else {
            return;
        };
        if frame.is_first {
            self.play_started = Instant::now();
            if let Some(play_id) = frame.packet.play_id.clone() {
                self.session
                    .emit(
                        &self.sender,
                        SessionEvent::StartPlay(StartPlayEvent {
                            sender: self.sender.clone(),
                            play_id,
                            sequence: frame.packet.sequence,
                            source_text: frame.packet.source_text.clone(),
                        }),
                    )
                    .await;
            }
        }

        let is_end = frame.packet.is_end;
        let play_id = frame.packet.play_id.clone();
        let sequence = frame.packet.sequence;
        let source_text = frame.packet.source_text.clone();

        if !frame.packet.payload.is_empty() {
            if let Err(err) = self
                .session
                .send_output(MediaPacket::Audio(frame.packet))
                .await
            {
                self.session.cause_error(&self.sender, err).await;
                return;
            }
        }
        if is_end {
            if let Some(play_id) = play_id {
                let duration = self.play_started.elapsed();
                self.stop_play(&play_id, sequence, StopReason::Finished, &source_text, duration)
                    .await;
            }
        }
    }

    /// Builds the next paced frame, merging as many queued packets as fit.
    /// A short tail frame is sent at its natural size rather than padded.
    fn assemble_frame(&mut self) -> Option<AssembledFrame> {
        let front = self.queue.front()?;
        let is_first = front.packet.is_first && front.sent == 0;

        // Bare end marker at the head: nothing to play, close the segment.
        if front.packet.is_end && front.packet.payload.is_empty() {
            let queued = self.queue.pop_front()?;
            let mut packet = queued.packet;
            packet.is_first = is_first;
            return Some(AssembledFrame { packet, is_first });
        }

        let play_id = front.packet.play_id.clone();
        let sequence = front.packet.sequence;
        let source_text = front.packet.source_text.clone();
        let mut is_end = front.packet.is_end;

        let mut buf = BytesMut::with_capacity(self.frame_size);
        while let Some(front) = self.queue.front_mut() {
            if buf.len() >= self.frame_size {
                break;
            }
            is_end = front.packet.is_end;
            if front.packet.payload.is_empty() {
                self.queue.pop_front();
                break;
            }
            let available = front.packet.payload.len() - front.sent;
            let take = available.min(self.frame_size - buf.len());
            buf.extend_from_slice(&front.packet.payload[front.sent..front.sent + take]);
            front.sent += take;
            if front.sent >= front.packet.payload.len() {
                self.queue.pop_front();
            }
        }

        Some(AssembledFrame {
            packet: AudioPacket {
                payload: buf.freeze(),
                is_synthesized: true,
                is_first,
                is_end,
                play_id,
                sequence,
                source_text,
            },
            is_first,
        })
    }

    async fn enqueue(&mut self, packet: AudioPacket) {
        if let Some(play_id) = packet.play_id.clone() {
            // A play that was interrupted stays dead; late chunks for it are
            // reported stopped instead of queued.
            let interrupted = self
                .records
                .get(play_id.as_str())
                .is_some_and(|r| r.reason == StopReason::Interrupted);
            if interrupted {
                let duration = self.play_started.elapsed();
                self.stop_play(
                    &play_id,
                    packet.sequence,
                    StopReason::Interrupted,
                    &packet.source_text,
                    duration,
                )
                .await;
                return;
            }
        }
        self.queue.push_back(QueuedPacket { packet, sent: 0 });
    }

    async fn interrupt(&mut self, reason: StopReason) {
        if self.queue.is_empty() {
            return;
        }
        info!(
            sender = %self.sender,
            discarded = self.queue.len(),
            %reason,
            "discarding queued playback"
        );
        let duration = self.play_started.elapsed();
        let discarded: Vec<QueuedPacket> = self.queue.drain(..).collect();
        for queued in discarded {
            if queued.packet.is_end {
                continue;
            }
            if let Some(play_id) = queued.packet.play_id {
                self.stop_play(
                    &play_id,
                    queued.packet.sequence,
                    reason,
                    &queued.packet.source_text,
                    duration,
                )
                .await;
            }
        }
    }

    /// Emits `StopPlay` for (play, sequence) exactly once.
    async fn stop_play(
        &mut self,
        play_id: &PlayId,
        sequence: u32,
        reason: StopReason,
        source_text: &str,
        duration: Duration,
    ) {
        let record = self
            .records
            .entry(play_id.as_str().to_string())
            .or_insert_with(|| PlayRecord {
                reason,
                stopped_sequences: HashSet::new(),
            });
        if !record.stopped_sequences.insert(sequence) {
            return;
        }
        self.session
            .emit(
                &self.sender,
                SessionEvent::StopPlay(StopPlayEvent {
                    sender: self.sender.clone(),
                    duration,
                    play_id: play_id.clone(),
                    sequence,
                    reason,
                    source_text: source_text.to_string(),
                }),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::packet::EventKind;
    use bytes::Bytes;
    use parking_lot::Mutex;

    fn test_format() -> StreamFormat {
        // 2 bytes per ms, 20-byte frames every 10 ms.
        StreamFormat {
            sample_rate: 1000,
            bit_depth: 16,
            channels: 1,
            frame_duration_ms: 10,
        }
    }

    fn chunk(play_id: &PlayId, payload: &'static [u8], is_first: bool) -> AudioPacket {
        AudioPacket {
            payload: Bytes::from_static(payload),
            is_synthesized: true,
            is_first,
            is_end: false,
            play_id: Some(play_id.clone()),
            sequence: 0,
            source_text: "hi".to_string(),
        }
    }

    fn collect_stops(session: &SessionHandle) -> Arc<Mutex<Vec<StopPlayEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        session.on(
            EventKind::StopPlay,
            Arc::new(move |event| {
                let sink = sink.clone();
                Box::pin(async move {
                    if let SessionEvent::StopPlay(stop) = event {
                        sink.lock().push(stop);
                    }
                })
            }),
        );
        seen
    }

    async fn drain_audio(rx: &mut tokio::sync::mpsc::Receiver<MediaPacket>) -> Vec<AudioPacket> {
        let mut out = Vec::new();
        while let Ok(packet) = rx.try_recv() {
            if let MediaPacket::Audio(audio) = packet {
                out.push(audio);
            }
        }
        out
    }

    #[tokio::test]
    async fn test_paced_frames_merge_and_truncate() {
        let (session, mut rx) = SessionHandle::new("s1", 1000);
        let stops = collect_stops(&session);
        let player = SynthesisPlayer::spawn("tts.mock", session.clone(), test_format());
        let play_id = PlayId::generate();

        // 30 bytes across two chunks: one full 20-byte frame, one 10-byte
        // tail.
        player.play(chunk(&play_id, &[1u8; 12], true)).await.unwrap();
        player.play(chunk(&play_id, &[2u8; 18], false)).await.unwrap();
        player
            .play(AudioPacket::end_marker(play_id.clone(), 0, "hi".to_string()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let frames = drain_audio(&mut rx).await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].payload.len(), 20);
        assert!(frames[0].is_first);
        assert_eq!(frames[1].payload.len(), 10);

        let stops = stops.lock();
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].reason, StopReason::Finished);
        player.close();
    }

    #[tokio::test]
    async fn test_stop_play_fires_exactly_once_per_segment() {
        let (session, _rx) = SessionHandle::new("s1", 1000);
        let stops = collect_stops(&session);
        let player = SynthesisPlayer::spawn("tts.mock", session.clone(), test_format());
        let play_id = PlayId::generate();

        player.play(chunk(&play_id, &[1u8; 100], true)).await.unwrap();
        player.interrupt(StopReason::Interrupted).await.unwrap();
        // Late chunk for the interrupted play is dropped, not replayed, and
        // produces no second StopPlay.
        player.play(chunk(&play_id, &[2u8; 4], false)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let stops = stops.lock();
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].reason, StopReason::Interrupted);
        assert_eq!(stops[0].sequence, 0);
        player.close();
    }

    #[tokio::test]
    async fn test_superseded_play_may_be_requeued() {
        let (session, mut rx) = SessionHandle::new("s1", 1000);
        let player = SynthesisPlayer::spawn("tts.mock", session.clone(), test_format());
        let play_id = PlayId::generate();

        player.play(chunk(&play_id, &[1u8; 8], true)).await.unwrap();
        player.interrupt(StopReason::Superseded).await.unwrap();
        // Superseded is not a barge-in; a retried chunk for the same play
        // is accepted again.
        player.play(chunk(&play_id, &[2u8; 8], false)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let frames = drain_audio(&mut rx).await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload.len(), 8);
        player.close();
    }

    #[tokio::test]
    async fn test_passthrough_when_pacing_disabled() {
        let (session, mut rx) = SessionHandle::new("s1", 1000);
        let format = StreamFormat {
            frame_duration_ms: 0,
            ..test_format()
        };
        let player = SynthesisPlayer::spawn("tts.mock", session.clone(), format);
        let play_id = PlayId::generate();

        player.play(chunk(&play_id, &[7u8; 100], true)).await.unwrap();
        let frames = drain_audio(&mut rx).await;
        assert_eq!(frames.len(), 1);
        // No re-timing: the burst passes through unchanged.
        assert_eq!(frames[0].payload.len(), 100);
        player.close();
    }

    #[tokio::test]
    async fn test_empty_segment_still_closes() {
        let (session, _rx) = SessionHandle::new("s1", 1000);
        let stops = collect_stops(&session);
        let player = SynthesisPlayer::spawn("tts.mock", session.clone(), test_format());
        let play_id = PlayId::generate();

        // Empty synthesis result: a zero-byte chunk followed by the end
        // marker. The segment must still report StopPlay(Finished).
        player.play(chunk(&play_id, &[], true)).await.unwrap();
        player
            .play(AudioPacket::end_marker(play_id.clone(), 0, "hi".to_string()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let stops = stops.lock();
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].reason, StopReason::Finished);
        player.close();
    }
}
