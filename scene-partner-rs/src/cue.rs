//! Spoken-cue detection for the performer's own lines.
//!
//! A listen is a race between three sources: the transcript containing the
//! cue, the manual override, and the timeout. The first one to fire wins; the
//! capture session is stopped exactly once on every exit path, including the
//! listen future being dropped by a restart.
//!
//! Matching is lower-cased substring containment against everything heard
//! so far, interim results included.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::capture::{CaptureBackend, CaptureEvent, CaptureSession};
use crate::error::RehearsalError;
use crate::script::normalize_cue;

/// Why a listen ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenOutcome {
    CueMatched,
    ManualOverride,
    TimedOut,
    /// No capture mechanism; the turn auto-advances.
    Unavailable,
}

impl std::fmt::Display for ListenOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CueMatched => write!(f, "cue heard"),
            Self::ManualOverride => write!(f, "manual next"),
            Self::TimedOut => write!(f, "timed out"),
            Self::Unavailable => write!(f, "capture unavailable"),
        }
    }
}

/// Whether `heard` contains an already-normalized cue.
///
/// An empty cue matches any speech at all.
pub fn cue_matches(heard: &str, normalized_cue: &str) -> bool {
    let heard = heard.to_lowercase();
    if normalized_cue.is_empty() {
        return !heard.trim().is_empty();
    }
    heard.contains(normalized_cue)
}

/// Transcript accumulated over one listen: final pieces plus the latest
/// interim guess, which each new interim replaces.
#[derive(Debug, Default)]
struct Heard {
    finals: String,
    interim: String,
}

impl Heard {
    fn push(&mut self, text: &str, is_final: bool) -> String {
        let text = text.trim();
        if text.is_empty() {
            return self.so_far();
        }
        if is_final {
            if !self.finals.is_empty() {
                self.finals.push(' ');
            }
            self.finals.push_str(text);
            self.interim.clear();
        } else {
            self.interim = text.to_string();
        }
        self.so_far()
    }

    fn so_far(&self) -> String {
        match (self.finals.is_empty(), self.interim.is_empty()) {
            (_, true) => self.finals.clone(),
            (true, false) => self.interim.clone(),
            (false, false) => format!("{} {}", self.finals, self.interim),
        }
    }
}

/// Stops the wrapped session once, on `stop` or on drop.
struct CaptureGuard(Option<Box<dyn CaptureSession>>);

impl CaptureGuard {
    fn stop(&mut self) {
        if let Some(mut session) = self.0.take() {
            session.stop();
        }
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn override_fired(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|pressed| *pressed).await.is_err() {
        // Nobody can press Next any more; leave it to the other branches.
        std::future::pending::<()>().await;
    }
}

async fn cue_heard(rx: &mut mpsc::UnboundedReceiver<CaptureEvent>, cue: &str) {
    let mut heard = Heard::default();
    while let Some(event) = rx.recv().await {
        match event {
            CaptureEvent::Transcript { text, is_final } => {
                let so_far = heard.push(&text, is_final);
                debug!("Heard so far: \"{so_far}\"");
                if cue_matches(&so_far, cue) {
                    return;
                }
            }
            CaptureEvent::Error(e) => warn!("Capture error while listening: {e}"),
        }
    }
    // Capture ended without the cue; override or timeout will decide.
    std::future::pending::<()>().await;
}

/// Listens for the performer's cue phrase.
pub struct CueListener {
    backend: Arc<dyn CaptureBackend>,
    timeout: Duration,
}

impl CueListener {
    pub fn new(backend: Arc<dyn CaptureBackend>, timeout: Duration) -> Self {
        Self { backend, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Wait until the cue is spoken, the override is set, or the timeout
    /// elapses, whichever comes first.
    pub async fn listen(
        &self,
        cue_phrase: &str,
        mut override_rx: watch::Receiver<bool>,
    ) -> ListenOutcome {
        let cue = normalize_cue(cue_phrase);
        let timeout = tokio::time::sleep(self.timeout);
        tokio::pin!(timeout);
        let overridden = override_fired(&mut override_rx);
        tokio::pin!(overridden);

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let session = tokio::select! {
            biased;
            _ = &mut overridden => return ListenOutcome::ManualOverride,
            _ = &mut timeout => return ListenOutcome::TimedOut,
            started = self.backend.start(events_tx) => match started {
                Ok(session) => Some(session),
                Err(RehearsalError::CaptureUnavailable(reason)) => {
                    info!("Speech capture unavailable ({reason}), advancing");
                    return ListenOutcome::Unavailable;
                }
                Err(e) => {
                    warn!("{e}, waiting for Next or timeout");
                    None
                }
            },
        };
        let mut guard = CaptureGuard(session);
        debug!("Listening for cue \"{cue}\" ({})", self.backend.name());

        let outcome = tokio::select! {
            biased;
            _ = &mut overridden => ListenOutcome::ManualOverride,
            _ = &mut timeout => ListenOutcome::TimedOut,
            _ = cue_heard(&mut events_rx, &cue) => ListenOutcome::CueMatched,
        };
        guard.stop();
        outcome
    }
}
