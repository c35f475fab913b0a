//! End-to-end rehearsal sessions against mock synthesis, playback and
//! capture, on paused tokio time.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use scene_partner::capture::DisabledCapture;
use scene_partner::error::Result;
use scene_partner::orchestrator::{Mode, RehearsalEvent, RehearsalSettings, TurnOrchestrator};
use scene_partner::{
    AudioHandle, AudioPlayer, CaptureBackend, CaptureEvent, CaptureSession, CueListener,
    ListenOutcome, PlaybackEnd, RehearsalError, ScriptModel, SynthesisRequest, Synthesizer,
};

// --- Mocks ---

struct MockSynth {
    calls: Mutex<Vec<String>>,
    latency: Duration,
    fail: bool,
}

impl MockSynth {
    fn new(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            latency,
            fail: false,
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            latency: Duration::from_millis(50),
            fail: true,
        })
    }

    fn calls_for(&self, text: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|t| *t == text).count()
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl Synthesizer for MockSynth {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<Vec<u8>> {
        self.calls.lock().unwrap().push(request.text.clone());
        tokio::time::sleep(self.latency).await;
        if self.fail {
            return Err(RehearsalError::SynthesisFailure("voice service down".into()));
        }
        Ok(request.text.as_bytes().to_vec())
    }
}

/// "Plays" each line for a fixed duration.
struct MockPlayer {
    played: Mutex<Vec<usize>>,
    length: Duration,
}

impl MockPlayer {
    fn new(length: Duration) -> Arc<Self> {
        Arc::new(Self {
            played: Mutex::new(Vec::new()),
            length,
        })
    }

    fn played(&self) -> Vec<usize> {
        self.played.lock().unwrap().clone()
    }
}

#[async_trait]
impl AudioPlayer for MockPlayer {
    async fn play(&self, audio: &AudioHandle, cancel: &CancellationToken) -> Result<PlaybackEnd> {
        self.played.lock().unwrap().push(audio.line_index());
        tokio::select! {
            _ = cancel.cancelled() => Ok(PlaybackEnd::Cancelled),
            _ = tokio::time::sleep(self.length) => Ok(PlaybackEnd::Completed),
        }
    }
}

/// Microphone that hears one phrase some time after each start, or nothing.
struct MockCapture {
    reply: Option<(Duration, &'static str)>,
    starts: AtomicUsize,
    stops: Arc<AtomicUsize>,
}

impl MockCapture {
    fn hearing(after: Duration, phrase: &'static str) -> Arc<Self> {
        Arc::new(Self {
            reply: Some((after, phrase)),
            starts: AtomicUsize::new(0),
            stops: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn silent() -> Arc<Self> {
        Arc::new(Self {
            reply: None,
            starts: AtomicUsize::new(0),
            stops: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

struct MockSession {
    task: tokio::task::JoinHandle<()>,
    stops: Arc<AtomicUsize>,
}

impl CaptureSession for MockSession {
    fn stop(&mut self) {
        self.task.abort();
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CaptureBackend for MockCapture {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn start(
        &self,
        events: mpsc::UnboundedSender<CaptureEvent>,
    ) -> Result<Box<dyn CaptureSession>> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let reply = self.reply;
        let task = tokio::spawn(async move {
            if let Some((after, phrase)) = reply {
                tokio::time::sleep(after).await;
                let _ = events.send(CaptureEvent::Transcript {
                    text: phrase.to_string(),
                    is_final: true,
                });
            }
            std::future::pending::<()>().await;
        });
        Ok(Box::new(MockSession {
            task,
            stops: Arc::clone(&self.stops),
        }))
    }
}

// --- Helpers ---

const COUNTDOWN: Duration = Duration::from_millis(3 * 800 + 600);

fn script(json: &str) -> Arc<ScriptModel> {
    Arc::new(ScriptModel::from_json(json).unwrap())
}

fn rehearsal(
    synth: Arc<dyn Synthesizer>,
    player: Arc<dyn AudioPlayer>,
    capture: Arc<dyn CaptureBackend>,
) -> (TurnOrchestrator, mpsc::UnboundedReceiver<RehearsalEvent>) {
    TurnOrchestrator::new(
        synth,
        player,
        CueListener::new(capture, Duration::from_secs(15)),
        RehearsalSettings::default(),
    )
}

fn drain(events: &mut mpsc::UnboundedReceiver<RehearsalEvent>) -> Vec<RehearsalEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

fn lines_started(events: &[RehearsalEvent]) -> Vec<usize> {
    events
        .iter()
        .filter_map(|e| match e {
            RehearsalEvent::LineStarted { index, .. } => Some(*index),
            _ => None,
        })
        .collect()
}

async fn wait_for_mode(orch: &TurnOrchestrator, mode: Mode) {
    orch.subscribe()
        .wait_for(|s| s.mode == mode)
        .await
        .unwrap();
}

// --- Scenarios ---

#[tokio::test(start_paused = true)]
async fn two_line_scene_plays_then_hears_cue() {
    let synth = MockSynth::new(Duration::from_millis(200));
    let player = MockPlayer::new(Duration::from_secs(2));
    let capture = MockCapture::hearing(Duration::from_millis(500), "Hi there");
    let (orch, mut events) = rehearsal(synth.clone(), player.clone(), capture.clone());

    let scene = script(
        r#"[{"character": "A", "dialog": "Hello.", "cue": "hello"},
            {"character": "B", "dialog": "Hi there.", "cue": "there"}]"#,
    );
    orch.start(scene, "B").await.unwrap();

    let state = orch.state();
    assert_eq!(state.mode, Mode::Finished);
    assert_eq!(state.current_index, 1);
    assert_eq!(state.active_character.as_deref(), Some("B"));
    assert_eq!(player.played(), vec![0]);
    assert_eq!(synth.calls_for("Hello."), 1);
    assert_eq!(capture.starts(), 1);
    assert_eq!(capture.stops(), 1);

    let events = drain(&mut events);
    assert_eq!(lines_started(&events), vec![0, 1]);
    assert!(events.contains(&RehearsalEvent::CueResolved {
        index: 1,
        outcome: ListenOutcome::CueMatched
    }));
    assert_eq!(events.last(), Some(&RehearsalEvent::Finished));
}

#[tokio::test(start_paused = true)]
async fn visits_every_line_once_in_order() {
    let synth = MockSynth::new(Duration::from_millis(100));
    let player = MockPlayer::new(Duration::from_millis(700));
    let (orch, mut events) = rehearsal(
        synth.clone(),
        player.clone(),
        Arc::new(DisabledCapture::new("no microphone")),
    );

    let scene = script(
        r#"{"lines": [
            {"character": "ROMEO", "dialog": "But soft!", "cue": "soft"},
            {"character": "JULIET", "dialog": "Ay me.", "cue": "me"},
            {"character": "ROMEO", "dialog": "She speaks.", "cue": "speaks"},
            {"character": "ROMEO", "dialog": "O, speak again.", "cue": "again"},
            {"character": "JULIET", "dialog": "O Romeo, Romeo!", "cue": "Romeo (sighs)"},
            {"character": "ROMEO", "dialog": "Shall I hear more?", "cue": "more"}
        ]}"#,
    );
    orch.start(scene, "JULIET").await.unwrap();

    let events = drain(&mut events);
    assert_eq!(lines_started(&events), vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(player.played(), vec![0, 2, 3, 5]);
    assert_eq!(orch.state().current_index, 5);
    assert_eq!(orch.state().mode, Mode::Finished);
}

#[tokio::test(start_paused = true)]
async fn prefetch_and_playback_share_one_generation_per_line() {
    let synth = MockSynth::new(Duration::from_millis(400));
    let player = MockPlayer::new(Duration::from_millis(300));
    let (orch, _events) = rehearsal(
        synth.clone(),
        player.clone(),
        Arc::new(DisabledCapture::new("no microphone")),
    );

    let scene = script(
        r#"[{"character": "A", "dialog": "One.", "cue": "one"},
            {"character": "A", "dialog": "Two.", "cue": "two"},
            {"character": "A", "dialog": "Three.", "cue": "three"},
            {"character": "B", "dialog": "Four.", "cue": "four"},
            {"character": "A", "dialog": "Five.", "cue": "five"},
            {"character": "A", "dialog": "Six.", "cue": "six"},
            {"character": "A", "dialog": "Seven.", "cue": "seven"},
            {"character": "A", "dialog": "Eight.", "cue": "eight"}]"#,
    );
    orch.start(scene, "B").await.unwrap();

    for text in ["One.", "Two.", "Three.", "Five.", "Six.", "Seven.", "Eight."] {
        assert_eq!(synth.calls_for(text), 1, "{text}");
    }
    assert_eq!(synth.calls_for("Four."), 0);
    assert_eq!(player.played(), vec![0, 1, 2, 4, 5, 6, 7]);
}

#[tokio::test(start_paused = true)]
async fn failing_synthesis_still_finishes() {
    let synth = MockSynth::failing();
    let player = MockPlayer::new(Duration::from_secs(1));
    let (orch, mut events) = rehearsal(
        synth.clone(),
        player.clone(),
        Arc::new(DisabledCapture::new("no microphone")),
    );

    let scene = script(
        r#"[{"character": "A", "dialog": "Hello.", "cue": "hello"},
            {"character": "B", "dialog": "Hi.", "cue": "hi"}]"#,
    );
    orch.start(scene, "B").await.unwrap();

    assert_eq!(orch.state().mode, Mode::Finished);
    assert!(player.played().is_empty());
    assert_eq!(synth.calls_for("Hello."), 1);
    assert!(drain(&mut events).contains(&RehearsalEvent::PlaybackSkipped { index: 0 }));
}

#[tokio::test(start_paused = true)]
async fn missing_capture_advances_without_waiting_for_timeout() {
    let (orch, mut events) = rehearsal(
        MockSynth::new(Duration::from_millis(100)),
        MockPlayer::new(Duration::from_secs(1)),
        Arc::new(DisabledCapture::new("no microphone")),
    );

    let scene = script(r#"[{"character": "B", "dialog": "To be.", "cue": "be"}]"#);
    let started = Instant::now();
    orch.start(scene, "B").await.unwrap();

    assert_eq!(started.elapsed(), COUNTDOWN);
    assert_eq!(orch.state().mode, Mode::Finished);
    assert!(drain(&mut events).contains(&RehearsalEvent::CueResolved {
        index: 0,
        outcome: ListenOutcome::Unavailable
    }));
}

#[tokio::test(start_paused = true)]
async fn silent_performer_times_out_at_fifteen_seconds() {
    let capture = MockCapture::silent();
    let (orch, _events) = rehearsal(
        MockSynth::new(Duration::from_millis(100)),
        MockPlayer::new(Duration::from_secs(1)),
        capture.clone(),
    );

    let scene = script(r#"[{"character": "B", "dialog": "To be.", "cue": "be"}]"#);
    let session = orch.spawn(scene, "B").unwrap();
    wait_for_mode(&orch, Mode::ListeningForCue).await;
    let listening = Instant::now();

    session.await.unwrap();

    assert_eq!(listening.elapsed(), Duration::from_secs(15));
    assert_eq!(orch.state().mode, Mode::Finished);
    assert_eq!(capture.stops(), 1);
}

#[tokio::test(start_paused = true)]
async fn manual_next_ends_the_listen_immediately() {
    let capture = MockCapture::silent();
    let (orch, mut events) = rehearsal(
        MockSynth::new(Duration::from_millis(100)),
        MockPlayer::new(Duration::from_secs(1)),
        capture.clone(),
    );

    let scene = script(
        r#"[{"character": "B", "dialog": "To be.", "cue": "be"},
            {"character": "A", "dialog": "Or not.", "cue": "not"}]"#,
    );
    let session = orch.spawn(scene, "B").unwrap();
    wait_for_mode(&orch, Mode::ListeningForCue).await;
    tokio::time::sleep(Duration::from_secs(4)).await;

    let pressed = Instant::now();
    assert!(orch.manual_next());
    wait_for_mode(&orch, Mode::PlayingAudio).await;
    assert!(pressed.elapsed() < Duration::from_millis(100));

    session.await.unwrap();
    assert!(drain(&mut events).contains(&RehearsalEvent::CueResolved {
        index: 0,
        outcome: ListenOutcome::ManualOverride
    }));
    assert_eq!(capture.stops(), 1);
    assert!(!orch.manual_next());
}

#[tokio::test(start_paused = true)]
async fn restart_resets_and_regenerates() {
    let synth = MockSynth::new(Duration::from_millis(100));
    let capture = MockCapture::silent();
    let (orch, mut events) = rehearsal(
        synth.clone(),
        MockPlayer::new(Duration::from_millis(500)),
        capture.clone(),
    );

    let scene = script(
        r#"[{"character": "A", "dialog": "One.", "cue": "one"},
            {"character": "B", "dialog": "Two.", "cue": "two"},
            {"character": "A", "dialog": "Three.", "cue": "three"},
            {"character": "B", "dialog": "Four.", "cue": "four"}]"#,
    );
    let session = orch.spawn(Arc::clone(&scene), "B").unwrap();
    wait_for_mode(&orch, Mode::ListeningForCue).await;
    assert_eq!(orch.state().current_index, 1);

    orch.restart();
    session.await.unwrap();

    let state = orch.state();
    assert_eq!(state.current_index, 0);
    assert_eq!(state.mode, Mode::Idle);
    assert_eq!(orch.cache_len(), 0);
    assert!(!orch.is_running());
    assert_eq!(capture.starts(), capture.stops());
    assert_eq!(synth.calls_for("One."), 1);
    assert!(drain(&mut events).contains(&RehearsalEvent::Restarted));

    let again = orch.spawn(scene, "B").unwrap();
    wait_for_mode(&orch, Mode::ListeningForCue).await;
    assert_eq!(synth.calls_for("One."), 2);
    assert_eq!(lines_started(&drain(&mut events)), vec![0, 1]);

    orch.restart();
    again.await.unwrap();
    assert_eq!(capture.starts(), capture.stops());
}

#[tokio::test(start_paused = true)]
async fn restart_during_playback_stops_the_voice() {
    let synth = MockSynth::new(Duration::from_millis(100));
    let player = MockPlayer::new(Duration::from_secs(30));
    let (orch, _events) = rehearsal(
        synth.clone(),
        player.clone(),
        Arc::new(DisabledCapture::new("no microphone")),
    );

    let scene = script(
        r#"[{"character": "A", "dialog": "A very long speech.", "cue": "speech"},
            {"character": "B", "dialog": "Finally.", "cue": "finally"}]"#,
    );
    let session = orch.spawn(scene, "B").unwrap();
    wait_for_mode(&orch, Mode::PlayingAudio).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let restarted = Instant::now();
    orch.restart();
    session.await.unwrap();

    assert!(restarted.elapsed() < Duration::from_millis(100));
    assert_eq!(orch.state().mode, Mode::Idle);
    assert_eq!(player.played(), vec![0]);
}

#[tokio::test(start_paused = true)]
async fn finished_session_needs_restart_before_replay() {
    let synth = MockSynth::new(Duration::from_millis(100));
    let (orch, _events) = rehearsal(
        synth.clone(),
        MockPlayer::new(Duration::from_millis(200)),
        Arc::new(DisabledCapture::new("no microphone")),
    );
    let scene = script(
        r#"[{"character": "A", "dialog": "Hello.", "cue": "hello"},
            {"character": "B", "dialog": "Hi.", "cue": "hi"}]"#,
    );

    orch.start(Arc::clone(&scene), "B").await.unwrap();
    let err = orch.start(Arc::clone(&scene), "B").await.unwrap_err();
    assert!(matches!(err, RehearsalError::SessionFinished));

    orch.restart();
    orch.start(scene, "B").await.unwrap();
    assert_eq!(orch.state().mode, Mode::Finished);
    assert_eq!(synth.total_calls(), 2);
}
