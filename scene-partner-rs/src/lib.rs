//! scene-partner-rs: rehearse a dialogue script opposite synthesized voices.
//!
//! The other characters' lines are spoken from prefetched audio; the
//! performer's own lines end when their cue phrase is heard, when they press
//! Next, or after a timeout.

pub mod api;
pub mod cache;
pub mod capture;
pub mod config;
pub mod cue;
pub mod error;
pub mod orchestrator;
pub mod playback;
pub mod script;
pub mod synth;

pub use cache::{AudioCache, AudioHandle, CacheStatus};
pub use capture::{CaptureBackend, CaptureEvent, CaptureSession};
pub use config::Config;
pub use cue::{cue_matches, CueListener, ListenOutcome};
pub use error::{RehearsalError, Result};
pub use orchestrator::{Mode, RehearsalEvent, RehearsalSettings, TurnOrchestrator, TurnState};
pub use playback::{AudioPlayer, PlaybackEnd};
pub use script::{normalize_cue, strip_parentheticals, ScriptLine, ScriptModel};
pub use synth::{HttpSynthesizer, SynthesisRequest, Synthesizer};
