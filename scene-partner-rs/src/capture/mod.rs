//! Speech capture backends for cue detection.
//!
//! Both real backends satisfy the same contract: `start` begins capturing and
//! pushes [`CaptureEvent`]s into the given channel until the returned session
//! is stopped (or dropped). Which backend runs is decided once, from config.
//!
//! - `local`: on-device whisper.cpp recognition over a rolling mic window
//! - `streaming`: 16 kHz PCM frames to a realtime transcription socket
//! - `none`: always unavailable, user lines auto-advance

pub mod local;
#[cfg(feature = "audio")]
pub mod mic;
pub mod streaming;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::{CaptureBackendKind, Config};
use crate::error::{RehearsalError, Result};

/// Something heard (or gone wrong) while a capture session is open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    Transcript { text: String, is_final: bool },
    Error(String),
}

/// An open capture. Stopping releases the microphone and any connection.
pub trait CaptureSession: Send {
    fn stop(&mut self);
}

#[async_trait]
pub trait CaptureBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Begin capturing. Fails with `CaptureUnavailable` when this backend
    /// cannot run here at all.
    async fn start(
        &self,
        events: mpsc::UnboundedSender<CaptureEvent>,
    ) -> Result<Box<dyn CaptureSession>>;
}

/// Backend used when speech capture is switched off or unsupported.
pub struct DisabledCapture {
    reason: String,
}

impl DisabledCapture {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl CaptureBackend for DisabledCapture {
    fn name(&self) -> &'static str {
        "none"
    }

    async fn start(
        &self,
        _events: mpsc::UnboundedSender<CaptureEvent>,
    ) -> Result<Box<dyn CaptureSession>> {
        Err(RehearsalError::CaptureUnavailable(self.reason.clone()))
    }
}

/// Build the configured backend, degrading to [`DisabledCapture`] when it
/// cannot be set up.
pub async fn build_backend(config: &Config) -> Arc<dyn CaptureBackend> {
    let kind = config.capture.backend;
    let backend: Result<Arc<dyn CaptureBackend>> = match kind {
        CaptureBackendKind::Local => local::load_backend(config).await,
        CaptureBackendKind::Streaming => streaming::StreamingTranscriber::new(
            config.streaming.clone(),
            config.audio.clone(),
        )
        .map(|b| Arc::new(b) as Arc<dyn CaptureBackend>),
        CaptureBackendKind::None => Ok(Arc::new(DisabledCapture::new("capture disabled in config"))),
    };

    match backend {
        Ok(backend) => {
            info!("Cue capture backend: {}", backend.name());
            backend
        }
        Err(e) => {
            warn!("{kind} capture backend unavailable: {e}");
            Arc::new(DisabledCapture::new(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_backend_reports_unavailable() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = DisabledCapture::new("no mic").start(tx).await.err().unwrap();
        assert!(matches!(err, RehearsalError::CaptureUnavailable(reason) if reason == "no mic"));
    }

    #[tokio::test]
    async fn none_kind_builds_disabled_backend() {
        let mut config = Config::default();
        config.capture.backend = CaptureBackendKind::None;
        let backend = build_backend(&config).await;
        assert_eq!(backend.name(), "none");
    }
}
