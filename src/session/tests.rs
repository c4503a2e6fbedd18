use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::*;
use crate::audio::decoder::AudioClip;
use crate::audio::encoder::encode_frame;
use crate::error::Result;
use crate::net::OUTBOUND_CAPACITY;

const FRAME: usize = 4096;
// 4096 samples at 16 kHz.
const FRAME_PERIOD: Duration = Duration::from_millis(256);

fn lock<T>(shared: &Arc<Mutex<T>>) -> MutexGuard<'_, T> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Default)]
struct Wire {
    opens: Vec<u64>,
    inbox: Option<Inbox>,
    outbound: Option<mpsc::Receiver<ClientMessage>>,
    refuse: bool,
}

struct FakeConnector(Arc<Mutex<Wire>>);

impl Connector for FakeConnector {
    fn open(&mut self, _learner: &LearnerConfig, link_id: u64, inbox: &Inbox) -> Result<Link> {
        let mut wire = lock(&self.0);
        if wire.refuse {
            return Err(TokiError::Transport("connection refused".to_string()));
        }
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        wire.opens.push(link_id);
        wire.inbox = Some(inbox.clone());
        wire.outbound = Some(rx);
        Ok(Link::new(link_id, tx, None))
    }
}

#[derive(Default)]
struct Mic {
    running: bool,
    starts: usize,
    fail: bool,
    inbox: Option<Inbox>,
}

struct FakeCapture(Arc<Mutex<Mic>>);

impl CaptureDevice for FakeCapture {
    fn start(&mut self, inbox: &Inbox) -> Result<()> {
        let mut mic = lock(&self.0);
        if mic.fail {
            return Err(TokiError::Device("microphone permission denied".to_string()));
        }
        if !mic.running {
            mic.running = true;
            mic.starts += 1;
            mic.inbox = Some(inbox.clone());
        }
        Ok(())
    }

    fn stop(&mut self) {
        lock(&self.0).running = false;
    }
}

#[derive(Default)]
struct Speaker {
    open: bool,
    auto_finish: bool,
    played: Vec<(u64, usize)>,
    halts: usize,
    inbox: Option<Inbox>,
}

struct FakeRender(Arc<Mutex<Speaker>>);

impl RenderDevice for FakeRender {
    fn open(&mut self, inbox: &Inbox) -> Result<()> {
        let mut speaker = lock(&self.0);
        speaker.open = true;
        speaker.inbox = Some(inbox.clone());
        Ok(())
    }

    fn play(&mut self, clip_id: u64, clip: AudioClip) -> Result<()> {
        let mut speaker = lock(&self.0);
        speaker.played.push((clip_id, clip.samples.len()));
        if speaker.auto_finish
            && let Some(inbox) = speaker.inbox.as_ref()
        {
            inbox.playback_finished(clip_id);
        }
        Ok(())
    }

    fn halt(&mut self) {
        lock(&self.0).halts += 1;
    }

    fn close(&mut self) {
        lock(&self.0).open = false;
    }
}

#[derive(Default)]
struct Voice {
    spoken: Vec<String>,
    current: Option<u64>,
    cancels: usize,
    inbox: Option<Inbox>,
}

struct FakeSynthesizer(Arc<Mutex<Voice>>);

impl SpeechSynthesizer for FakeSynthesizer {
    fn speak(&mut self, utterance: u64, text: &str, inbox: &Inbox) -> Result<()> {
        let mut voice = lock(&self.0);
        voice.spoken.push(text.to_string());
        voice.current = Some(utterance);
        voice.inbox = Some(inbox.clone());
        inbox.synthesis_started(utterance);
        Ok(())
    }

    fn cancel(&mut self) {
        let mut voice = lock(&self.0);
        voice.current = None;
        voice.cancels += 1;
    }
}

#[derive(Default)]
struct Log {
    transcripts: Vec<(String, bool)>,
    errors: Vec<String>,
}

struct Recorder(Arc<Mutex<Log>>);

impl SessionObserver for Recorder {
    fn on_transcript(&mut self, text: &str, is_user: bool) {
        lock(&self.0).transcripts.push((text.to_string(), is_user));
    }

    fn on_error(&mut self, message: &str) {
        lock(&self.0).errors.push(message.to_string());
    }
}

struct Harness {
    handle: SessionHandle,
    wire: Arc<Mutex<Wire>>,
    mic: Arc<Mutex<Mic>>,
    speaker: Arc<Mutex<Speaker>>,
    voice: Arc<Mutex<Voice>>,
    log: Arc<Mutex<Log>>,
    task: JoinHandle<()>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(&Config::default())
    }

    fn with_config(config: &Config) -> Self {
        let wire = Arc::new(Mutex::new(Wire::default()));
        let mic = Arc::new(Mutex::new(Mic::default()));
        let speaker = Arc::new(Mutex::new(Speaker::default()));
        let voice = Arc::new(Mutex::new(Voice::default()));
        let log = Arc::new(Mutex::new(Log::default()));

        let devices = Devices {
            connector: Box::new(FakeConnector(Arc::clone(&wire))),
            capture: Box::new(FakeCapture(Arc::clone(&mic))),
            render: Box::new(FakeRender(Arc::clone(&speaker))),
            synthesizer: Box::new(FakeSynthesizer(Arc::clone(&voice))),
        };
        let (session, handle) = Session::new(config, devices, Box::new(Recorder(Arc::clone(&log))));
        let task = tokio::spawn(session.run());

        Self {
            handle,
            wire,
            mic,
            speaker,
            voice,
            log,
            task,
        }
    }

    /// Connect and acknowledge setup.
    async fn active() -> Self {
        let harness = Self::new();
        harness.handle.connect().unwrap_or_else(|e| panic!("{e}"));
        settle().await;
        harness.server(ServerMessage::SetupComplete).await;
        assert!(harness.status().is_connected());
        harness
    }

    fn status(&self) -> SessionStatus {
        self.handle.status()
    }

    fn link(&self) -> (Inbox, u64) {
        let wire = lock(&self.wire);
        let inbox = wire.inbox.clone().unwrap_or_else(|| panic!("never connected"));
        let id = *wire.opens.last().unwrap_or_else(|| panic!("never connected"));
        (inbox, id)
    }

    async fn server(&self, message: ServerMessage) {
        let (inbox, id) = self.link();
        inbox.server_message(id, message);
        settle().await;
    }

    async fn server_audio(&self, samples: usize) {
        self.server(ServerMessage::Audio {
            data: encode_frame(&vec![0.2; samples]),
        })
        .await;
    }

    async fn tutor_says(&self, text: &str) {
        self.server(ServerMessage::Text {
            data: text.to_string(),
            is_user: false,
        })
        .await;
    }

    async fn close_link(&self, error: Option<&str>) {
        let (inbox, id) = self.link();
        inbox.link_closed(id, error.map(str::to_string));
        settle().await;
    }

    async fn frame(&self, level: f32) {
        let inbox = lock(&self.mic)
            .inbox
            .clone()
            .unwrap_or_else(|| panic!("capture never started"));
        let mut frame = vec![0.0; FRAME];
        frame[FRAME / 2] = level;
        inbox.push_frame(frame);
        settle().await;
    }

    /// Drain everything queued for the server so far.
    fn sent(&self) -> Vec<ClientMessage> {
        let mut wire = lock(&self.wire);
        let mut sent = Vec::new();
        if let Some(rx) = wire.outbound.as_mut() {
            while let Ok(message) = rx.try_recv() {
                sent.push(message);
            }
        }
        sent
    }

    fn played(&self) -> Vec<usize> {
        lock(&self.speaker)
            .played
            .iter()
            .map(|&(_, len)| len)
            .collect()
    }

    async fn finish_clip(&self) {
        let (inbox, clip) = {
            let speaker = lock(&self.speaker);
            let clip = speaker.played.last().map(|&(id, _)| id);
            (speaker.inbox.clone(), clip)
        };
        if let (Some(inbox), Some(clip)) = (inbox, clip) {
            inbox.playback_finished(clip);
        }
        settle().await;
    }

    async fn finish_speech(&self) {
        let (inbox, utterance) = {
            let voice = lock(&self.voice);
            (voice.inbox.clone(), voice.current)
        };
        if let (Some(inbox), Some(utterance)) = (inbox, utterance) {
            inbox.synthesis_finished(utterance);
        }
        settle().await;
    }
}

fn end_turns(sent: &[ClientMessage]) -> usize {
    sent.iter()
        .filter(|m| matches!(m, ClientMessage::EndTurn))
        .count()
}

/// Let the session drain its inbox.
async fn settle() {
    for _ in 0..32 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn connect_waits_for_setup_before_capturing() {
    let harness = Harness::new();
    harness.handle.connect().unwrap_or_else(|e| panic!("{e}"));
    settle().await;

    let status = harness.status();
    assert_eq!(status.phase, Phase::Connecting);
    assert!(status.is_processing());
    assert!(!status.is_listening());
    assert!(!lock(&harness.mic).running);

    harness.server(ServerMessage::SetupComplete).await;
    let status = harness.status();
    assert_eq!(status.phase, Phase::Active);
    assert!(status.is_listening());
    assert!(!status.is_processing());
    assert!(lock(&harness.mic).running);
    assert!(lock(&harness.speaker).open);
}

#[tokio::test(start_paused = true)]
async fn connect_and_disconnect_are_idempotent() {
    let harness = Harness::new();
    harness.handle.disconnect().unwrap_or_else(|e| panic!("{e}"));
    settle().await;
    assert_eq!(harness.status(), SessionStatus::default());

    harness.handle.connect().unwrap_or_else(|e| panic!("{e}"));
    harness.handle.connect().unwrap_or_else(|e| panic!("{e}"));
    settle().await;
    harness.server(ServerMessage::SetupComplete).await;
    harness.handle.connect().unwrap_or_else(|e| panic!("{e}"));
    settle().await;

    assert_eq!(lock(&harness.wire).opens, vec![1]);
    assert_eq!(lock(&harness.mic).starts, 1);

    harness.handle.disconnect().unwrap_or_else(|e| panic!("{e}"));
    harness.handle.disconnect().unwrap_or_else(|e| panic!("{e}"));
    settle().await;
    assert_eq!(harness.status(), SessionStatus::default());
}

#[tokio::test(start_paused = true)]
async fn toggle_connects_then_disconnects() {
    let harness = Harness::new();
    harness.handle.toggle().unwrap_or_else(|e| panic!("{e}"));
    settle().await;
    assert_eq!(harness.status().phase, Phase::Connecting);

    harness.server(ServerMessage::SetupComplete).await;
    harness.handle.toggle().unwrap_or_else(|e| panic!("{e}"));
    settle().await;
    assert_eq!(harness.status().phase, Phase::Idle);
    assert!(!lock(&harness.mic).running);
}

#[tokio::test(start_paused = true)]
async fn frames_stream_while_listening() {
    let harness = Harness::active().await;
    harness.frame(0.0).await;
    harness.frame(0.5).await;

    let sent = harness.sent();
    assert_eq!(sent.len(), 2);
    let ClientMessage::Audio { data } = &sent[1] else {
        panic!("expected audio, got {:?}", sent[1]);
    };
    assert_eq!(data, &encode_frame(&{
        let mut frame = vec![0.0; FRAME];
        frame[FRAME / 2] = 0.5;
        frame
    }));

    harness.handle.disconnect().unwrap_or_else(|e| panic!("{e}"));
    settle().await;
    // Frames still in flight from the capture thread are discarded.
    harness.frame(0.5).await;
    assert!(harness.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn end_to_end_quiet_then_speech_then_silence() {
    let harness = Harness::active().await;

    for _ in 0..3 {
        harness.frame(0.001).await;
        tokio::time::sleep(FRAME_PERIOD).await;
    }
    let sent = harness.sent();
    assert_eq!(sent.len(), 3);
    assert_eq!(end_turns(&sent), 0);

    harness.frame(0.6).await;
    let spoke_at = tokio::time::Instant::now();
    let mut sent = Vec::new();
    let mut end_turn_at = None;
    for _ in 0..16 {
        tokio::time::sleep(FRAME_PERIOD).await;
        harness.frame(0.001).await;
        let batch = harness.sent();
        if end_turns(&batch) > 0 && end_turn_at.is_none() {
            end_turn_at = Some(tokio::time::Instant::now());
        }
        sent.extend(batch);
    }

    assert_eq!(end_turns(&sent), 1);
    let elapsed = end_turn_at.unwrap_or_else(|| panic!("no end_turn")) - spoke_at;
    assert!(elapsed >= Duration::from_millis(1500), "end_turn after {elapsed:?}");
    assert!(harness.status().is_processing());
}

#[tokio::test(start_paused = true)]
async fn no_end_turn_while_processing() {
    let harness = Harness::active().await;
    harness
        .handle
        .send_text("what is a fraction?")
        .unwrap_or_else(|e| panic!("{e}"));
    settle().await;

    harness.frame(0.6).await;
    for _ in 0..10 {
        tokio::time::sleep(FRAME_PERIOD).await;
        harness.frame(0.0).await;
    }
    assert_eq!(end_turns(&harness.sent()), 0);

    // Once the tutor is done, the next utterance ends a turn again.
    harness.server(ServerMessage::TurnComplete).await;
    harness.frame(0.6).await;
    for _ in 0..10 {
        tokio::time::sleep(FRAME_PERIOD).await;
        harness.frame(0.0).await;
    }
    assert_eq!(end_turns(&harness.sent()), 1);
}

#[tokio::test(start_paused = true)]
async fn speech_resets_silence_window() {
    let harness = Harness::active().await;
    harness.frame(0.6).await;
    tokio::time::sleep(FRAME_PERIOD).await;
    harness.frame(0.0).await;
    tokio::time::sleep(Duration::from_millis(1000)).await;
    harness.frame(0.6).await;
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(end_turns(&harness.sent()), 0);
}

#[tokio::test(start_paused = true)]
async fn audio_renders_in_arrival_order() {
    let harness = Harness::active().await;
    lock(&harness.speaker).auto_finish = true;

    for samples in [480, 120, 960, 240, 720] {
        harness.server_audio(samples).await;
    }

    assert_eq!(harness.played(), vec![480, 120, 960, 240, 720]);
    assert!(!harness.status().is_speaking());
}

#[tokio::test(start_paused = true)]
async fn speaking_tracks_playback() {
    let harness = Harness::active().await;
    harness.server_audio(100).await;
    harness.server_audio(200).await;
    assert!(harness.status().is_speaking());
    assert_eq!(harness.played(), vec![100]);

    harness.finish_clip().await;
    assert_eq!(harness.played(), vec![100, 200]);
    assert!(harness.status().is_speaking());

    harness.finish_clip().await;
    assert!(!harness.status().is_speaking());
}

#[tokio::test(start_paused = true)]
async fn malformed_audio_is_skipped_quietly() {
    let harness = Harness::active().await;
    lock(&harness.speaker).auto_finish = true;

    harness
        .server(ServerMessage::Audio {
            data: "%%% not base64 %%%".to_string(),
        })
        .await;
    harness
        .server(ServerMessage::Audio {
            // "RIFF" followed by garbage
            data: "UklGRnRydW5jYXRlZA==".to_string(),
        })
        .await;
    harness.server_audio(64).await;

    assert_eq!(harness.played(), vec![64]);
    assert!(lock(&harness.log).errors.is_empty());
    assert!(harness.status().is_connected());
}

#[tokio::test(start_paused = true)]
async fn interruption_flushes_playback_and_keeps_listening() {
    let harness = Harness::active().await;
    harness.server_audio(100).await;
    harness.server_audio(200).await;
    harness.server_audio(300).await;

    harness.server(ServerMessage::Interrupted).await;
    assert_eq!(lock(&harness.speaker).halts, 1);
    assert!(!harness.status().is_speaking());

    // The halted clip's completion must not start the rest of the queue.
    harness.finish_clip().await;
    assert_eq!(harness.played(), vec![100]);

    let status = harness.status();
    assert!(status.is_connected());
    assert!(status.is_listening());
    assert!(lock(&harness.mic).running);
}

#[tokio::test(start_paused = true)]
async fn late_audio_falls_back_to_local_speech() {
    let harness = Harness::active().await;
    harness.tutor_says("A fraction is part of a whole.").await;

    tokio::time::sleep(Duration::from_millis(1999)).await;
    settle().await;
    assert!(lock(&harness.voice).spoken.is_empty());

    tokio::time::sleep(Duration::from_millis(2)).await;
    settle().await;
    assert_eq!(
        lock(&harness.voice).spoken,
        vec!["A fraction is part of a whole.".to_string()]
    );
    assert!(harness.status().is_speaking());

    // Server audio for the same turn is never layered on top.
    harness.server_audio(100).await;
    assert!(harness.played().is_empty());

    harness.finish_speech().await;
    assert!(!harness.status().is_speaking());
}

#[tokio::test(start_paused = true)]
async fn server_audio_beats_the_fallback_timer() {
    let harness = Harness::active().await;
    harness.tutor_says("Hello there!").await;
    tokio::time::sleep(Duration::from_millis(1900)).await;
    harness.server_audio(100).await;

    tokio::time::sleep(Duration::from_secs(10)).await;
    settle().await;
    assert!(lock(&harness.voice).spoken.is_empty());
    assert_eq!(harness.played(), vec![100]);
}

#[tokio::test(start_paused = true)]
async fn server_error_ends_the_audio_turn() {
    let harness = Harness::active().await;
    lock(&harness.speaker).auto_finish = true;
    harness.server_audio(100).await;
    harness
        .server(ServerMessage::Error {
            message: "model overloaded".to_string(),
        })
        .await;

    harness.tutor_says("Let's try again.").await;
    tokio::time::sleep(Duration::from_millis(2100)).await;
    settle().await;
    assert_eq!(lock(&harness.voice).spoken, vec!["Let's try again.".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn at_most_one_voice_per_turn() {
    for audio_after_ms in [0, 500, 1999, 2001, 2500, 5000] {
        let harness = Harness::active().await;
        lock(&harness.speaker).auto_finish = true;
        harness.tutor_says("Let's count to ten.").await;
        tokio::time::sleep(Duration::from_millis(audio_after_ms)).await;
        settle().await;
        harness.server_audio(100).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;

        let spoke_locally = !lock(&harness.voice).spoken.is_empty();
        let played_audio = !harness.played().is_empty();
        assert!(
            spoke_locally != played_audio,
            "audio after {audio_after_ms}ms: local={spoke_locally} server={played_audio}"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn next_turn_audio_cuts_off_previous_fallback() {
    let harness = Harness::active().await;
    harness.tutor_says("first answer").await;
    tokio::time::sleep(Duration::from_millis(2001)).await;
    settle().await;
    assert_eq!(lock(&harness.voice).spoken.len(), 1);

    harness.server(ServerMessage::TurnComplete).await;
    harness.server_audio(100).await;

    assert_eq!(lock(&harness.voice).cancels, 1);
    assert_eq!(harness.played(), vec![100]);
}

#[tokio::test(start_paused = true)]
async fn fallback_waits_for_the_speaker() {
    let harness = Harness::active().await;
    harness.server_audio(100).await;
    harness.server(ServerMessage::TurnComplete).await;

    harness.tutor_says("second answer").await;
    tokio::time::sleep(Duration::from_millis(2001)).await;
    settle().await;
    assert!(lock(&harness.voice).spoken.is_empty());

    harness.finish_clip().await;
    assert_eq!(
        lock(&harness.voice).spoken,
        vec!["second answer".to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn interruption_cancels_local_speech() {
    let harness = Harness::active().await;
    harness.tutor_says("a long explanation").await;
    tokio::time::sleep(Duration::from_millis(2001)).await;
    settle().await;
    assert!(harness.status().is_speaking());

    harness.server(ServerMessage::Interrupted).await;
    assert_eq!(lock(&harness.voice).cancels, 1);
    assert!(!harness.status().is_speaking());

    // A pending fallback is dropped too.
    harness.tutor_says("never spoken").await;
    harness.server(ServerMessage::Interrupted).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    settle().await;
    assert_eq!(lock(&harness.voice).spoken.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn fallback_can_be_disabled() {
    let mut config = Config::default();
    config.fallback.enabled = false;
    let harness = Harness::with_config(&config);
    harness.handle.connect().unwrap_or_else(|e| panic!("{e}"));
    settle().await;
    harness.server(ServerMessage::SetupComplete).await;

    harness.tutor_says("hello").await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    settle().await;
    assert!(lock(&harness.voice).spoken.is_empty());
}

#[tokio::test(start_paused = true)]
async fn abnormal_closure_tears_down_like_disconnect() {
    let harness = Harness::active().await;
    harness.server_audio(100).await;
    harness.tutor_says("pending").await;
    harness.frame(0.6).await;
    assert!(harness.status().is_listening());

    harness.close_link(Some("connection reset by peer")).await;

    let status = harness.status();
    assert_eq!(status.phase, Phase::Closed);
    assert!(!status.is_listening());
    assert!(!status.is_speaking());
    assert!(!status.is_processing());
    assert!(!lock(&harness.mic).running);
    assert!(!lock(&harness.speaker).open);
    assert_eq!(lock(&harness.speaker).halts, 1);
    assert!(
        lock(&harness.log)
            .errors
            .iter()
            .any(|e| e.contains("connection reset by peer"))
    );

    tokio::time::sleep(Duration::from_secs(5)).await;
    settle().await;
    assert!(lock(&harness.voice).spoken.is_empty());
    assert_eq!(end_turns(&harness.sent()), 0);
}

/// Queue more audio than the connection can hold, with nothing draining it.
async fn stall(harness: &Harness) {
    for _ in 0..OUTBOUND_CAPACITY + 4 {
        harness.frame(0.6).await;
    }
}

#[tokio::test(start_paused = true)]
async fn stalled_connection_is_torn_down_at_end_of_turn() {
    let harness = Harness::active().await;
    stall(&harness).await;
    harness.frame(0.0).await;
    tokio::time::sleep(Duration::from_millis(1600)).await;
    settle().await;

    let status = harness.status();
    assert_eq!(status.phase, Phase::Closed);
    assert!(!status.is_listening());
    assert!(!lock(&harness.mic).running);
    assert!(lock(&harness.log).errors.iter().any(|e| e.contains("stalled")));

    // The session is still responsive.
    harness.handle.connect().unwrap_or_else(|e| panic!("{e}"));
    settle().await;
    assert_eq!(harness.status().phase, Phase::Connecting);
    harness.handle.disconnect().unwrap_or_else(|e| panic!("{e}"));
    settle().await;
    assert_eq!(harness.status().phase, Phase::Idle);
}

#[tokio::test(start_paused = true)]
async fn typed_turn_on_stalled_connection_does_not_block_shutdown() {
    let harness = Harness::active().await;
    stall(&harness).await;
    harness
        .handle
        .send_text("are you there?")
        .unwrap_or_else(|e| panic!("{e}"));
    settle().await;

    assert_eq!(harness.status().phase, Phase::Closed);
    assert!(!lock(&harness.mic).running);
    assert!(
        !lock(&harness.log)
            .transcripts
            .iter()
            .any(|(text, _)| text == "are you there?")
    );

    harness.handle.shutdown().unwrap_or_else(|e| panic!("{e}"));
    tokio::time::timeout(Duration::from_secs(1), harness.task)
        .await
        .unwrap_or_else(|e| panic!("{e}"))
        .unwrap_or_else(|e| panic!("{e}"));
}

#[tokio::test(start_paused = true)]
async fn clean_server_close_is_not_an_error() {
    let harness = Harness::active().await;
    harness.close_link(None).await;
    assert_eq!(harness.status().phase, Phase::Closed);
    assert!(!lock(&harness.mic).running);
    assert!(lock(&harness.log).errors.is_empty());
}

#[tokio::test(start_paused = true)]
async fn reconnect_ignores_the_old_link() {
    let harness = Harness::active().await;
    let (old_inbox, old_link) = harness.link();
    harness.close_link(Some("network unreachable")).await;

    harness.handle.toggle().unwrap_or_else(|e| panic!("{e}"));
    settle().await;
    assert_eq!(lock(&harness.wire).opens, vec![1, 2]);

    old_inbox.server_message(old_link, ServerMessage::SetupComplete);
    old_inbox.link_closed(old_link, Some("late".to_string()));
    settle().await;
    assert_eq!(harness.status().phase, Phase::Connecting);

    harness.server(ServerMessage::SetupComplete).await;
    assert!(harness.status().is_connected());
}

#[tokio::test(start_paused = true)]
async fn microphone_failure_leaves_session_idle() {
    let harness = Harness::new();
    lock(&harness.mic).fail = true;
    harness.handle.connect().unwrap_or_else(|e| panic!("{e}"));
    settle().await;
    harness.server(ServerMessage::SetupComplete).await;

    assert_eq!(harness.status(), SessionStatus::default());
    assert!(!lock(&harness.speaker).open);
    assert!(
        lock(&harness.log)
            .errors
            .iter()
            .any(|e| e.contains("permission denied"))
    );
}

#[tokio::test(start_paused = true)]
async fn lost_device_ends_the_session() {
    let harness = Harness::active().await;
    let inbox = lock(&harness.mic)
        .inbox
        .clone()
        .unwrap_or_else(|| panic!("capture never started"));
    inbox.device_lost("input device is no longer available".to_string());
    settle().await;

    assert_eq!(harness.status().phase, Phase::Idle);
    assert!(!lock(&harness.mic).running);
    assert_eq!(lock(&harness.log).errors.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn refused_connection_is_reported() {
    let harness = Harness::new();
    lock(&harness.wire).refuse = true;
    harness.handle.connect().unwrap_or_else(|e| panic!("{e}"));
    settle().await;

    assert_eq!(harness.status().phase, Phase::Idle);
    assert!(
        lock(&harness.log)
            .errors
            .iter()
            .any(|e| e.contains("connection refused"))
    );
}

#[tokio::test(start_paused = true)]
async fn typed_turn_is_sent_and_echoed() {
    let harness = Harness::active().await;
    harness
        .handle
        .send_text("Why is the sky blue?")
        .unwrap_or_else(|e| panic!("{e}"));
    settle().await;

    assert_eq!(
        harness.sent(),
        vec![ClientMessage::Text {
            data: "Why is the sky blue?".to_string()
        }]
    );
    assert!(harness.status().is_processing());
    assert_eq!(
        lock(&harness.log).transcripts,
        vec![("Why is the sky blue?".to_string(), true)]
    );
}

#[tokio::test(start_paused = true)]
async fn typed_turn_requires_connection() {
    let harness = Harness::new();
    assert!(matches!(
        harness.handle.send_text("hello"),
        Err(TokiError::NotConnected)
    ));
}

#[tokio::test(start_paused = true)]
async fn transcripts_and_errors_reach_the_observer() {
    let harness = Harness::active().await;
    harness
        .server(ServerMessage::Text {
            data: "I said this".to_string(),
            is_user: true,
        })
        .await;
    harness
        .server(ServerMessage::UserText {
            data: "and this".to_string(),
        })
        .await;
    harness.tutor_says("Great question!").await;
    harness
        .server(ServerMessage::Error {
            message: "Invalid JSON".to_string(),
        })
        .await;

    let log = lock(&harness.log);
    assert_eq!(
        log.transcripts,
        vec![
            ("I said this".to_string(), true),
            ("and this".to_string(), true),
            ("Great question!".to_string(), false),
        ]
    );
    assert_eq!(log.errors, vec!["Invalid JSON".to_string()]);
    drop(log);

    // Server errors are not fatal.
    assert!(harness.status().is_connected());
    assert!(!harness.status().is_processing());
}

#[tokio::test(start_paused = true)]
async fn user_text_never_arms_fallback() {
    let harness = Harness::active().await;
    harness
        .server(ServerMessage::Text {
            data: "my own words".to_string(),
            is_user: true,
        })
        .await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    settle().await;
    assert!(lock(&harness.voice).spoken.is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutdown_releases_everything() {
    let harness = Harness::active().await;
    harness.server_audio(100).await;
    harness.handle.shutdown().unwrap_or_else(|e| panic!("{e}"));
    harness.task.await.unwrap_or_else(|e| panic!("{e}"));

    assert!(!lock(&harness.mic).running);
    assert!(!lock(&harness.speaker).open);
    assert!(matches!(
        harness.handle.connect(),
        Err(TokiError::SessionClosed)
    ));
}
