//! Turn-taking state machine.
//!
//! IDLE → COUNTDOWN → {PLAYING ⇄ LISTENING} → FINISHED, and back to IDLE
//! only through `restart`.
//!
//! One play session runs as a single sequential loop over the script. Every
//! state write from the loop is tagged with the session generation; once a
//! restart bumps the generation, a still-unwinding loop can no longer touch
//! the published state or the cache.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cache::AudioCache;
use crate::config::RehearsalConfig;
use crate::cue::{CueListener, ListenOutcome};
use crate::error::{RehearsalError, Result};
use crate::playback::{AudioPlayer, PlaybackEnd};
use crate::script::ScriptModel;
use crate::synth::Synthesizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Idle,
    Countdown,
    PlayingAudio,
    ListeningForCue,
    Finished,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "IDLE"),
            Self::Countdown => write!(f, "COUNTDOWN"),
            Self::PlayingAudio => write!(f, "PLAYING"),
            Self::ListeningForCue => write!(f, "LISTENING"),
            Self::Finished => write!(f, "FINISHED"),
        }
    }
}

/// Snapshot published to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TurnState {
    pub active_character: Option<String>,
    pub current_index: usize,
    pub mode: Mode,
}

impl Default for TurnState {
    fn default() -> Self {
        Self {
            active_character: None,
            current_index: 0,
            mode: Mode::Idle,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CountdownStep {
    Count(u8),
    Go,
}

impl std::fmt::Display for CountdownStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Count(n) => write!(f, "{n}"),
            Self::Go => write!(f, "Go!"),
        }
    }
}

/// Progress notifications for whatever is driving the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RehearsalEvent {
    Countdown {
        step: CountdownStep,
    },
    LineStarted {
        index: usize,
        character: String,
        is_user: bool,
    },
    PlaybackSkipped {
        index: usize,
    },
    CueResolved {
        index: usize,
        outcome: ListenOutcome,
    },
    StateChanged {
        mode: Mode,
    },
    Finished,
    Restarted,
}

/// Pacing for a play session.
#[derive(Debug, Clone)]
pub struct RehearsalSettings {
    pub countdown_step: Duration,
    pub go_pause: Duration,
    pub lookahead: usize,
}

impl Default for RehearsalSettings {
    fn default() -> Self {
        Self::from(&RehearsalConfig::default())
    }
}

impl From<&RehearsalConfig> for RehearsalSettings {
    fn from(config: &RehearsalConfig) -> Self {
        Self {
            countdown_step: config.countdown_step(),
            go_pause: config.go_pause(),
            lookahead: config.lookahead,
        }
    }
}

/// Script, character and cache of the most recent play session.
struct Prepared {
    script: Arc<ScriptModel>,
    active_character: String,
    cache: Arc<AudioCache>,
}

#[derive(Default)]
struct Session {
    prepared: Option<Prepared>,
    running: Option<CancellationToken>,
    generation: u64,
}

struct Inner {
    synth: Arc<dyn Synthesizer>,
    player: Arc<dyn AudioPlayer>,
    listener: CueListener,
    settings: RehearsalSettings,
    state: watch::Sender<TurnState>,
    next: watch::Sender<bool>,
    events: mpsc::UnboundedSender<RehearsalEvent>,
    session: Mutex<Session>,
}

/// Drives a rehearsal. Cheap to clone; clones control the same session.
#[derive(Clone)]
pub struct TurnOrchestrator {
    inner: Arc<Inner>,
}

impl TurnOrchestrator {
    pub fn new(
        synth: Arc<dyn Synthesizer>,
        player: Arc<dyn AudioPlayer>,
        listener: CueListener,
        settings: RehearsalSettings,
    ) -> (Self, mpsc::UnboundedReceiver<RehearsalEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(TurnState::default());
        let (next, _) = watch::channel(false);
        let inner = Inner {
            synth,
            player,
            listener,
            settings,
            state,
            next,
            events,
            session: Mutex::new(Session::default()),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            events_rx,
        )
    }

    /// Play `script` as `active_character`, from the current index to the
    /// end. Resolves when the session finishes or is restarted.
    ///
    /// Only setup problems are reported; nothing that happens on an
    /// individual line fails the session.
    pub async fn start(&self, script: Arc<ScriptModel>, active_character: &str) -> Result<()> {
        self.begin(script, active_character)?.run().await;
        Ok(())
    }

    /// Like [`start`](Self::start), but runs the session on its own task.
    /// Setup problems are still reported before anything is spawned.
    pub fn spawn(
        &self,
        script: Arc<ScriptModel>,
        active_character: &str,
    ) -> Result<JoinHandle<()>> {
        let run = self.begin(script, active_character)?;
        Ok(tokio::spawn(run.run()))
    }

    fn begin(&self, script: Arc<ScriptModel>, active_character: &str) -> Result<PlayRun> {
        if script.is_empty() {
            return Err(RehearsalError::EmptyScript);
        }
        if !script.has_character(active_character) {
            return Err(RehearsalError::UnknownCharacter(active_character.to_string()));
        }

        let mut session = self.inner.session();
        if session.running.is_some() {
            return Err(RehearsalError::AlreadyRunning);
        }
        if self.inner.state.borrow().mode == Mode::Finished {
            return Err(RehearsalError::SessionFinished);
        }

        let reusable = session
            .prepared
            .as_ref()
            .filter(|p| Arc::ptr_eq(&p.script, &script) && p.active_character == active_character)
            .map(|p| Arc::clone(&p.cache));
        let cache = match reusable {
            Some(cache) => cache,
            None => {
                if let Some(previous) = session.prepared.take() {
                    previous.cache.release_all();
                }
                let cache = Arc::new(AudioCache::new(
                    Arc::clone(&script),
                    active_character,
                    Arc::clone(&self.inner.synth),
                    self.inner.settings.lookahead,
                ));
                session.prepared = Some(Prepared {
                    script: Arc::clone(&script),
                    active_character: active_character.to_string(),
                    cache: Arc::clone(&cache),
                });
                self.inner.apply(|s| s.current_index = 0);
                cache
            }
        };

        let cancel = CancellationToken::new();
        session.running = Some(cancel.clone());
        session.generation += 1;
        self.inner
            .apply(|s| s.active_character = Some(active_character.to_string()));

        Ok(PlayRun {
            script,
            active_character: active_character.to_string(),
            cache,
            guard: RunGuard {
                inner: Arc::clone(&self.inner),
                generation: session.generation,
                cancel,
            },
        })
    }

    /// Force the current cue listen to resolve. Returns whether a listen was
    /// active to receive it.
    pub fn manual_next(&self) -> bool {
        let _session = self.inner.session();
        if self.inner.state.borrow().mode != Mode::ListeningForCue {
            debug!("Next ignored outside of a cue listen");
            return false;
        }
        self.inner.next.send_replace(true);
        info!("Manual next");
        true
    }

    /// Stop whatever is running, drop all cached audio and rewind to line 0.
    pub fn restart(&self) {
        let mut session = self.inner.session();
        session.generation += 1;
        if let Some(cancel) = session.running.take() {
            cancel.cancel();
        }
        if let Some(prepared) = &session.prepared {
            prepared.cache.release_all();
        }
        self.inner.next.send_replace(false);
        self.inner.apply(|s| {
            s.current_index = 0;
            s.mode = Mode::Idle;
        });
        self.inner.emit(RehearsalEvent::Restarted);
        info!("Rehearsal restarted");
    }

    pub fn state(&self) -> TurnState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<TurnState> {
        self.inner.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.inner.session().running.is_some()
    }

    /// Cached audio entries currently held for the session.
    pub fn cache_len(&self) -> usize {
        self.inner
            .session()
            .prepared
            .as_ref()
            .map_or(0, |p| p.cache.len())
    }
}

impl Inner {
    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: RehearsalEvent) {
        let _ = self.events.send(event);
    }

    /// Publish a state change. Callers hold the session lock.
    fn apply(&self, f: impl FnOnce(&mut TurnState)) {
        let mut transition = None;
        self.state.send_modify(|state| {
            let before = state.mode;
            f(state);
            if state.mode != before {
                transition = Some((before, state.mode));
            }
        });
        if let Some((before, after)) = transition {
            info!("State: {before} → {after}");
            self.emit(RehearsalEvent::StateChanged { mode: after });
        }
    }

    /// Run `f` under the session lock if `generation` is still current.
    fn with_current<T>(&self, generation: u64, f: impl FnOnce(&Self) -> T) -> Option<T> {
        let session = self.session();
        (session.generation == generation).then(|| f(self))
    }

    async fn pause(&self, duration: Duration, cancel: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    async fn countdown(&self, generation: u64, cancel: &CancellationToken) -> bool {
        let steps = [
            (CountdownStep::Count(3), self.settings.countdown_step),
            (CountdownStep::Count(2), self.settings.countdown_step),
            (CountdownStep::Count(1), self.settings.countdown_step),
            (CountdownStep::Go, self.settings.go_pause),
        ];
        for (step, hold) in steps {
            let shown = self.with_current(generation, |inner| {
                inner.apply(|s| s.mode = Mode::Countdown);
                inner.emit(RehearsalEvent::Countdown { step });
            });
            if shown.is_none() || !self.pause(hold, cancel).await {
                return false;
            }
        }
        true
    }

    async fn run(
        &self,
        script: &ScriptModel,
        active_character: &str,
        cache: &Arc<AudioCache>,
        cancel: &CancellationToken,
        generation: u64,
    ) {
        let from = self.state.borrow().current_index;
        if self
            .with_current(generation, |_| cache.prefetch(from))
            .is_none()
        {
            return;
        }
        if !self.countdown(generation, cancel).await {
            return;
        }

        for line in script.lines().iter().skip(from) {
            let index = line.index;
            let is_user = line.character == active_character;

            let began = self.with_current(generation, |inner| {
                cache.prefetch(index);
                inner.apply(|s| {
                    s.current_index = index;
                    s.mode = if is_user {
                        Mode::ListeningForCue
                    } else {
                        Mode::PlayingAudio
                    };
                });
                if is_user {
                    inner.next.send_replace(false);
                }
                inner.emit(RehearsalEvent::LineStarted {
                    index,
                    character: line.character.clone(),
                    is_user,
                });
            });
            if began.is_none() {
                return;
            }

            if is_user {
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return,
                    outcome = self.listener.listen(&line.cue_phrase, self.next.subscribe()) => outcome,
                };
                info!("Line {index}: {outcome}");
                self.with_current(generation, |inner| {
                    inner.emit(RehearsalEvent::CueResolved { index, outcome });
                });
            } else if !self.play_line(index, cache, cancel, generation).await {
                return;
            }
        }

        self.with_current(generation, |inner| {
            inner.apply(|s| s.mode = Mode::Finished);
            inner.emit(RehearsalEvent::Finished);
        });
        info!("Rehearsal finished");
    }

    /// Play one non-user line. Returns false if the session was cancelled.
    async fn play_line(
        &self,
        index: usize,
        cache: &AudioCache,
        cancel: &CancellationToken,
        generation: u64,
    ) -> bool {
        let audio = tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            audio = cache.ensure(index) => audio,
        };

        let handle = match audio {
            Ok(Some(handle)) => handle,
            Ok(None) => {
                info!("Line {index}: no audio, skipping");
                self.with_current(generation, |inner| {
                    inner.emit(RehearsalEvent::PlaybackSkipped { index });
                });
                return true;
            }
            Err(e) => {
                warn!("Line {index}: {e}");
                return true;
            }
        };

        let played = tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            played = self.player.play(&handle, cancel) => played,
        };
        match played {
            Ok(PlaybackEnd::Completed) => true,
            Ok(PlaybackEnd::Cancelled) => false,
            Err(e) => {
                warn!("Line {index}: {e}");
                self.with_current(generation, |inner| {
                    inner.emit(RehearsalEvent::PlaybackSkipped { index });
                });
                true
            }
        }
    }
}

/// A validated play session, ready to run.
struct PlayRun {
    script: Arc<ScriptModel>,
    active_character: String,
    cache: Arc<AudioCache>,
    guard: RunGuard,
}

impl PlayRun {
    async fn run(self) {
        let Self {
            script,
            active_character,
            cache,
            guard,
        } = self;
        let inner = &guard.inner;
        info!(
            "Rehearsing {} lines as {active_character} (cue capture: {})",
            script.len(),
            inner.listener.backend_name()
        );
        inner
            .run(&script, &active_character, &cache, &guard.cancel, guard.generation)
            .await;
    }
}

/// Marks the session stopped when the run ends or is dropped.
struct RunGuard {
    inner: Arc<Inner>,
    generation: u64,
    cancel: CancellationToken,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.cancel.cancel();
        let mut session = self.inner.session();
        if session.generation != self.generation {
            return;
        }
        session.running = None;
        let finished = self.inner.state.borrow().mode == Mode::Finished;
        if !finished {
            self.inner.apply(|s| s.mode = Mode::Idle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::DisabledCapture;
    use crate::playback::NullPlayer;
    use crate::script::ScriptLine;
    use crate::synth::SynthesisRequest;
    use async_trait::async_trait;

    struct SilentSynth;

    #[async_trait]
    impl Synthesizer for SilentSynth {
        async fn synthesize(&self, _request: &SynthesisRequest) -> Result<Vec<u8>> {
            Ok(vec![0; 16])
        }
    }

    fn line(character: &str, dialog: &str, cue: &str) -> ScriptLine {
        ScriptLine {
            index: 0,
            character: character.into(),
            dialog: dialog.into(),
            cue_phrase: cue.into(),
            action: None,
            emotion: None,
        }
    }

    fn orchestrator() -> (TurnOrchestrator, mpsc::UnboundedReceiver<RehearsalEvent>) {
        TurnOrchestrator::new(
            Arc::new(SilentSynth),
            Arc::new(NullPlayer),
            CueListener::new(
                Arc::new(DisabledCapture::new("test")),
                Duration::from_secs(15),
            ),
            RehearsalSettings::default(),
        )
    }

    #[test]
    fn countdown_steps_display() {
        assert_eq!(CountdownStep::Count(3).to_string(), "3");
        assert_eq!(CountdownStep::Go.to_string(), "Go!");
        assert_eq!(Mode::ListeningForCue.to_string(), "LISTENING");
    }

    #[test]
    fn settings_follow_config() {
        let settings = RehearsalSettings::default();
        assert_eq!(settings.countdown_step, Duration::from_millis(800));
        assert_eq!(settings.go_pause, Duration::from_millis(600));
        assert_eq!(settings.lookahead, 5);
    }

    #[tokio::test]
    async fn rejects_empty_script() {
        let (orch, _events) = orchestrator();
        let err = orch
            .start(Arc::new(ScriptModel::new(Vec::new())), "A")
            .await
            .unwrap_err();
        assert!(matches!(err, RehearsalError::EmptyScript));
    }

    #[tokio::test]
    async fn rejects_unknown_character() {
        let (orch, _events) = orchestrator();
        let script = Arc::new(ScriptModel::new(vec![line("A", "Hello.", "hello")]));
        let err = orch.start(script, "Z").await.unwrap_err();
        assert!(matches!(err, RehearsalError::UnknownCharacter(name) if name == "Z"));
        assert_eq!(orch.state().mode, Mode::Idle);
    }

    #[tokio::test]
    async fn next_outside_listening_has_no_effect() {
        let (orch, _events) = orchestrator();
        assert!(!orch.manual_next());
    }

    #[tokio::test(start_paused = true)]
    async fn second_start_while_running_is_refused() {
        let (orch, _events) = orchestrator();
        let script = Arc::new(ScriptModel::new(vec![
            line("A", "Hello.", "hello"),
            line("B", "Hi.", "hi"),
        ]));

        let running = tokio::spawn({
            let orch = orch.clone();
            let script = Arc::clone(&script);
            async move { orch.start(script, "B").await }
        });
        orch.subscribe()
            .wait_for(|s| s.mode == Mode::Countdown)
            .await
            .unwrap();
        assert!(orch.is_running());

        let err = orch.start(Arc::clone(&script), "B").await.unwrap_err();
        assert!(matches!(err, RehearsalError::AlreadyRunning));

        running.await.unwrap().unwrap();
        assert_eq!(orch.state().mode, Mode::Finished);
        let err = orch.start(script, "B").await.unwrap_err();
        assert!(matches!(err, RehearsalError::SessionFinished));
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_start_returns_to_idle() {
        let (orch, _events) = orchestrator();
        let script = Arc::new(ScriptModel::new(vec![
            line("A", "Hello.", "hello"),
            line("B", "Hi.", "hi"),
        ]));

        // Still counting down when the caller gives up.
        let outcome =
            tokio::time::timeout(Duration::from_millis(1000), orch.start(script, "B")).await;

        assert!(outcome.is_err());
        assert!(!orch.is_running());
        assert_eq!(orch.state().mode, Mode::Idle);
    }
}
