//! Rehearsal error types.

use std::path::PathBuf;

/// Errors that can occur while loading or rehearsing a script.
///
/// Only the pre-loop variants ever reach the caller of
/// [`TurnOrchestrator::start`](crate::orchestrator::TurnOrchestrator::start);
/// failures inside the per-line loop are absorbed into skip / auto-advance.
#[derive(Debug, thiserror::Error)]
pub enum RehearsalError {
    /// Audio generation failed for a line.
    #[error("Speech synthesis failed: {0}")]
    SynthesisFailure(String),

    /// No speech-capture backend on this platform or configuration.
    #[error("Speech capture unavailable: {0}")]
    CaptureUnavailable(String),

    /// Capture fault (microphone, recognizer or transcription socket).
    #[error("Speech capture failed: {0}")]
    CaptureError(String),

    /// A line index outside the script was requested.
    #[error("Line index {index} out of range (script has {len} lines)")]
    OutOfRange { index: usize, len: usize },

    /// Audio output failed.
    #[error("Audio playback failed: {0}")]
    Playback(String),

    /// The script JSON could not be understood.
    #[error("Invalid script: {0}")]
    ScriptFormat(String),

    /// Script file could not be read.
    #[error("Failed to read script {path}: {source}")]
    ScriptRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The script has no lines to rehearse.
    #[error("Script has no lines")]
    EmptyScript,

    /// The chosen character never speaks in the script.
    #[error("Character '{0}' does not appear in the script")]
    UnknownCharacter(String),

    /// A play session is already running.
    #[error("A rehearsal is already running")]
    AlreadyRunning,

    /// The session reached the end; restart before playing again.
    #[error("Rehearsal finished, restart to play again")]
    SessionFinished,
}

pub type Result<T> = std::result::Result<T, RehearsalError>;
