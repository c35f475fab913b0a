//! Audio output for the other characters' lines.
//!
//! The rodio player decodes synthesized bytes and blocks a worker thread until
//! the sink drains, polling for cancellation so a restart stops the voice
//! mid-sentence.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::cache::AudioHandle;
use crate::error::Result;

/// How a playback ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEnd {
    Completed,
    Cancelled,
}

/// Plays a synthesized line to completion.
#[async_trait]
pub trait AudioPlayer: Send + Sync {
    /// Resolve once playback reaches its end, or early when `cancel` fires.
    async fn play(&self, audio: &AudioHandle, cancel: &CancellationToken) -> Result<PlaybackEnd>;
}

/// Player used when no audio output is compiled in. Lines play as silence.
pub struct NullPlayer;

#[async_trait]
impl AudioPlayer for NullPlayer {
    async fn play(&self, audio: &AudioHandle, _cancel: &CancellationToken) -> Result<PlaybackEnd> {
        warn!(
            "No audio output available, skipping {} bytes for line {}",
            audio.len(),
            audio.line_index()
        );
        Ok(PlaybackEnd::Completed)
    }
}

#[cfg(feature = "audio")]
pub use self::rodio_player::RodioPlayer;

#[cfg(feature = "audio")]
mod rodio_player {
    use std::io::Cursor;
    use std::time::Duration;

    use async_trait::async_trait;
    use rodio::{Decoder, OutputStreamBuilder, Sink};
    use tokio_util::sync::CancellationToken;
    use tracing::debug;

    use super::{AudioPlayer, PlaybackEnd};
    use crate::cache::AudioHandle;
    use crate::error::{RehearsalError, Result};

    const POLL_INTERVAL: Duration = Duration::from_millis(50);

    /// Default output device via rodio.
    ///
    /// The output stream is opened per line on the worker thread, since the
    /// underlying device handle is not `Send` on every platform.
    #[derive(Default)]
    pub struct RodioPlayer;

    impl RodioPlayer {
        pub fn new() -> Self {
            Self
        }
    }

    #[async_trait]
    impl AudioPlayer for RodioPlayer {
        async fn play(&self, audio: &AudioHandle, cancel: &CancellationToken) -> Result<PlaybackEnd> {
            let bytes = audio.bytes().to_vec();
            let line = audio.line_index();
            let cancel = cancel.clone();

            tokio::task::spawn_blocking(move || {
                let mut stream = OutputStreamBuilder::open_default_stream()
                    .map_err(|e| RehearsalError::Playback(format!("Failed to open audio output: {e}")))?;
                stream.log_on_drop(false);

                let source = Decoder::new(Cursor::new(bytes))
                    .map_err(|e| RehearsalError::Playback(format!("Failed to decode audio: {e}")))?;

                let sink = Sink::connect_new(stream.mixer());
                sink.append(source);
                debug!("Playing line {line}");

                loop {
                    if sink.empty() {
                        return Ok(PlaybackEnd::Completed);
                    }
                    if cancel.is_cancelled() {
                        sink.stop();
                        debug!("Playback of line {line} cancelled");
                        return Ok(PlaybackEnd::Cancelled);
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
            })
            .await
            .map_err(|e| RehearsalError::Playback(format!("playback worker: {e}")))?
        }
    }
}

/// Build the player for this build.
#[cfg(feature = "audio")]
pub fn default_player() -> std::sync::Arc<dyn AudioPlayer> {
    std::sync::Arc::new(RodioPlayer::new())
}

/// Build the player for this build.
#[cfg(not(feature = "audio"))]
pub fn default_player() -> std::sync::Arc<dyn AudioPlayer> {
    warn!("Built without the `audio` feature, other characters' lines will be silent");
    std::sync::Arc::new(NullPlayer)
}
