//! End-to-end pipeline tests: capture audio in, transcripts out, reply text
//! in, paced synthesized audio out, with barge-in and reply replacement in
//! between. Everything runs against the in-process mock vendors.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use cadenza::config::{CacheConfig, PipelineConfig};
use cadenza::core::asr::{AsrResult, Corrector, GatedAsrFilter};
use cadenza::core::packet::{
    AudioPacket, MediaPacket, PlayId, SessionEvent, StreamFormat, TextPacket,
};
use cadenza::core::providers::{AsrProviderRegistry, MockAsrStream, MockTtsService};
use cadenza::core::runner::{RunnerHandle, TaskRunner};
use cadenza::core::session::SessionHandle;
use cadenza::core::tts::{StopReason, Synthesizer};
use cadenza::core::SynthesisCache;

/// 2 bytes per millisecond, 20-byte frames every 10 ms. Keeps paced tests
/// fast while exercising real frame assembly.
fn test_format() -> StreamFormat {
    StreamFormat {
        sample_rate: 1000,
        bit_depth: 16,
        channels: 1,
        frame_duration_ms: 10,
    }
}

struct TestPipeline {
    session: Arc<SessionHandle>,
    output: mpsc::Receiver<MediaPacket>,
    asr: RunnerHandle,
    tts: RunnerHandle,
    asr_stream: Arc<MockAsrStream>,
    tts_service: Arc<MockTtsService>,
    events: Arc<Mutex<Vec<SessionEvent>>>,
}

/// `RUST_LOG=cadenza=debug cargo test` shows the pipeline's own tracing.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn spawn_pipeline(corrector: Corrector) -> TestPipeline {
    init_tracing();
    let (session, output) = SessionHandle::new("it-session", 1000);

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    session.on_any(Arc::new(move |event| {
        let sink = sink.clone();
        Box::pin(async move {
            sink.lock().push(event);
        })
    }));

    let asr_stream = MockAsrStream::new();
    let filter = GatedAsrFilter::new(asr_stream.clone(), corrector, &test_format(), 500);
    let asr = TaskRunner::spawn(filter, session.clone(), 32).await.unwrap();

    let tts_service = Arc::new(MockTtsService::from_config(&cadenza::config::TtsConfig {
        format: test_format(),
        ..Default::default()
    }));
    let cache = SynthesisCache::from_config(&CacheConfig::default());
    let synthesizer = Synthesizer::new(tts_service.clone(), cache);
    let tts = TaskRunner::spawn(synthesizer, session.clone(), 32).await.unwrap();

    TestPipeline {
        session,
        output,
        asr,
        tts,
        asr_stream,
        tts_service,
        events,
    }
}

fn completed_texts(events: &[SessionEvent], sender_prefix: &str) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::Completed(completed) if completed.sender.starts_with(sender_prefix) => {
                Some(completed.result.clone())
            }
            _ => None,
        })
        .collect()
}

fn stop_reasons(events: &[SessionEvent]) -> Vec<StopReason> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::StopPlay(stop) => Some(stop.reason),
            _ => None,
        })
        .collect()
}

fn drain_audio(rx: &mut mpsc::Receiver<MediaPacket>) -> Vec<AudioPacket> {
    let mut out = Vec::new();
    while let Ok(packet) = rx.try_recv() {
        if let MediaPacket::Audio(audio) = packet {
            out.push(audio);
        }
    }
    out
}

#[tokio::test]
async fn test_capture_to_corrected_transcript() {
    let corrector = Corrector::new(
        [("令克".to_string(), "灵刻".to_string())].into(),
        Vec::new(),
    );
    let mut pipeline = spawn_pipeline(corrector).await;

    // Silence first: audio only reaches the lookback ring.
    pipeline
        .asr
        .feed(MediaPacket::Audio(AudioPacket::capture(Bytes::from_static(
            &[1, 2, 3, 4],
        ))))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(pipeline.asr_stream.connect_count(), 0);

    pipeline
        .session
        .emit("vad", SessionEvent::StartSpeaking { dialog_id: None })
        .await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    // The stream opened and replayed the ring as pre-roll.
    assert_eq!(pipeline.asr_stream.connect_count(), 1);
    assert_eq!(pipeline.asr_stream.sent_audio(), vec![vec![1u8, 2, 3, 4]]);

    pipeline
        .asr_stream
        .push_result(AsrResult {
            text: "打开令克助手".to_string(),
            is_final: false,
            duration: Duration::from_millis(400),
            dialog_id: None,
        })
        .await;
    pipeline
        .asr_stream
        .push_result(AsrResult {
            text: "打开令克助手".to_string(),
            is_final: true,
            duration: Duration::from_millis(800),
            dialog_id: None,
        })
        .await;
    pipeline.session.emit("vad", SessionEvent::StartSilence).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    let events = pipeline.events.lock().clone();
    assert_eq!(completed_texts(&events, "asr."), vec!["打开灵刻助手"]);
    assert_eq!(pipeline.asr_stream.end_count(), 1);

    pipeline.asr.close();
    pipeline.tts.close();
}

#[tokio::test]
async fn test_reply_synthesis_plays_paced_frames() {
    let mut pipeline = spawn_pipeline(Corrector::default()).await;
    let play_id = PlayId::generate();

    pipeline
        .tts
        .feed(MediaPacket::Text(TextPacket::reply("好的", play_id.clone())))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;

    let frames = drain_audio(&mut pipeline.output);
    assert!(!frames.is_empty());
    // Paced frames reassemble to exactly the provider's audio.
    let total: Vec<u8> = frames.iter().flat_map(|f| f.payload.to_vec()).collect();
    assert_eq!(Bytes::from(total), MockTtsService::rendered_audio("好的"));
    assert!(frames[0].is_first);
    assert!(frames.iter().all(|f| f.payload.len() <= test_format().frame_size()));

    let events = pipeline.events.lock().clone();
    assert_eq!(stop_reasons(&events), vec![StopReason::Finished]);
    assert_eq!(completed_texts(&events, "tts."), vec!["好的"]);

    pipeline.asr.close();
    pipeline.tts.close();
}

#[tokio::test]
async fn test_barge_in_cuts_playback() {
    let mut pipeline = spawn_pipeline(Corrector::default()).await;
    let play_id = PlayId::generate();

    // Long reply: hundreds of bytes of audio, many frames of playback.
    pipeline
        .tts
        .feed(MediaPacket::Text(TextPacket::reply(
            "这是一段需要较长时间播放的回复内容",
            play_id.clone(),
        )))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    pipeline.session.emit("caller", SessionEvent::Interruption).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    let frames_at_cut = drain_audio(&mut pipeline.output).len();

    // Playback stays cut: no new frames after the barge-in settled.
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(drain_audio(&mut pipeline.output).len(), 0);
    assert!(frames_at_cut > 0);

    let events = pipeline.events.lock().clone();
    assert!(stop_reasons(&events).contains(&StopReason::Interrupted));

    pipeline.asr.close();
    pipeline.tts.close();
}

#[tokio::test]
async fn test_new_reply_supersedes_queued_playback() {
    let mut pipeline = spawn_pipeline(Corrector::default()).await;

    pipeline
        .tts
        .feed(MediaPacket::Text(TextPacket::reply(
            "第一条很长很长的回复内容还没有播放完毕",
            PlayId::generate(),
        )))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    pipeline
        .tts
        .feed(MediaPacket::Text(TextPacket::reply("第二条", PlayId::generate())))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    let events = pipeline.events.lock().clone();
    let reasons = stop_reasons(&events);
    assert!(reasons.contains(&StopReason::Superseded), "reasons: {reasons:?}");
    assert!(reasons.contains(&StopReason::Finished), "reasons: {reasons:?}");

    // The replacement reply played to the end.
    let frames = drain_audio(&mut pipeline.output);
    let second_total: usize = frames
        .iter()
        .filter(|f| f.source_text == "第二条")
        .map(|f| f.payload.len())
        .sum();
    assert_eq!(
        second_total,
        MockTtsService::rendered_audio("第二条").len()
    );

    pipeline.asr.close();
    pipeline.tts.close();
}

#[tokio::test]
async fn test_segmented_reply_completes_once() {
    let mut pipeline = spawn_pipeline(Corrector::default()).await;
    let play_id = PlayId::generate();

    let segments = vec![
        TextPacket::segment("今天", play_id.clone(), 0, false),
        TextPacket::segment("天气", play_id.clone(), 1, false),
        TextPacket::segment("不错", play_id.clone(), 2, true),
    ];
    for segment in segments {
        pipeline.tts.feed(MediaPacket::Text(segment)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    let events = pipeline.events.lock().clone();
    // Only the terminal segment reports the reply as complete.
    assert_eq!(completed_texts(&events, "tts."), vec!["不错"]);
    let finished = stop_reasons(&events)
        .iter()
        .filter(|r| **r == StopReason::Finished)
        .count();
    assert_eq!(finished, 3);

    let _ = drain_audio(&mut pipeline.output);
    pipeline.asr.close();
    pipeline.tts.close();
}

#[tokio::test]
async fn test_concurrent_replies_all_complete() {
    let pipeline = spawn_pipeline(Corrector::default()).await;

    let feeds = (0..3).map(|i| {
        let handle = &pipeline.tts;
        let text = format!("回复{i}");
        async move {
            handle
                .feed(MediaPacket::Text(TextPacket::reply(text, PlayId::generate())))
                .await
        }
    });
    for result in join_all(feeds).await {
        result.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(150)).await;

    let events = pipeline.events.lock().clone();
    // Every reply synthesized to completion even though later ones
    // superseded earlier playback.
    assert_eq!(completed_texts(&events, "tts.").len(), 3);
    assert_eq!(pipeline.tts_service.synth_calls(), 3);

    pipeline.asr.close();
    pipeline.tts.close();
}

#[tokio::test]
async fn test_config_driven_pipeline_construction() {
    let config = PipelineConfig::from_json(
        r#"{
            "asr": {"provider": "mock", "gated": true, "lookbackMs": 200},
            "tts": {"provider": "mock", "voice": "alloy"},
            "corrector": {"replaceWords": {"令克": "灵刻"}},
            "cache": {"maxCapacityBytes": 1048576}
        }"#,
    )
    .unwrap();

    let stream = AsrProviderRegistry::new().create(&config.asr).unwrap();
    assert_eq!(stream.provider().as_str(), "mock");

    let corrector = Corrector::from_config(&config.corrector);
    assert_eq!(corrector.correct("令克"), "灵刻");
    assert_eq!(config.cache.max_capacity_bytes, 1048576);
    assert!(config.cache.enabled);
}
