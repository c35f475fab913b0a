//! On-device continuous recognition using whisper-rs (whisper.cpp bindings).
//!
//! The microphone fills a rolling window of the last few seconds; every
//! `interval_ms` the window is transcribed and emitted as an interim
//! transcript. The GGML model is loaded once per backend; each listen gets
//! its own capture and recognition task.

use std::sync::Arc;

use crate::capture::CaptureBackend;
use crate::config::Config;
use crate::error::{RehearsalError, Result};

#[cfg(feature = "whisper")]
pub use self::recognizer::{LocalRecognizer, WhisperTranscriber};

/// Load the whisper model off the async runtime and wrap it as a backend.
#[cfg(feature = "whisper")]
pub async fn load_backend(config: &Config) -> Result<Arc<dyn CaptureBackend>> {
    let whisper = config.whisper.clone();
    let audio = config.audio.clone();
    let transcriber = tokio::task::spawn_blocking(move || WhisperTranscriber::load(&whisper))
        .await
        .map_err(|e| RehearsalError::CaptureUnavailable(format!("model loader: {e}")))??;
    Ok(Arc::new(LocalRecognizer::new(
        transcriber,
        audio,
        config.whisper.clone(),
    )))
}

#[cfg(not(feature = "whisper"))]
pub async fn load_backend(_config: &Config) -> Result<Arc<dyn CaptureBackend>> {
    Err(RehearsalError::CaptureUnavailable(
        "built without the `whisper` feature".into(),
    ))
}

#[cfg(feature = "whisper")]
mod recognizer {
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::{Duration, Instant};

    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tracing::{debug, info, warn};
    use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

    use crate::capture::mic::{rms_energy, MicrophoneStream};
    use crate::capture::{CaptureBackend, CaptureEvent, CaptureSession};
    use crate::config::{AudioConfig, WhisperConfig};
    use crate::error::{RehearsalError, Result};

    /// Below this RMS the window is treated as silence and not transcribed.
    const SILENCE_THRESHOLD: f32 = 0.01;

    /// Shareable whisper model.
    #[derive(Clone)]
    pub struct WhisperTranscriber {
        ctx: Arc<WhisperContext>,
        language: String,
    }

    impl WhisperTranscriber {
        /// Load the Whisper GGML model.
        pub fn load(config: &WhisperConfig) -> Result<Self> {
            let model_path = find_model(&config.model)?;

            info!("Loading Whisper model from {}", model_path.display());
            let t0 = Instant::now();

            let path = model_path.to_str().ok_or_else(|| {
                RehearsalError::CaptureUnavailable(format!(
                    "model path is not UTF-8: {}",
                    model_path.display()
                ))
            })?;
            let ctx = WhisperContext::new_with_params(path, WhisperContextParameters::default())
                .map_err(|e| {
                    RehearsalError::CaptureUnavailable(format!("Failed to load Whisper model: {e}"))
                })?;

            info!("Whisper model loaded in {}ms", t0.elapsed().as_millis());

            Ok(Self {
                ctx: Arc::new(ctx),
                language: config.language.clone(),
            })
        }

        /// Transcribe audio samples (f32, 16kHz, mono) to text.
        pub fn transcribe(&self, samples: &[f32]) -> Result<String> {
            let mut state = self.ctx.create_state().map_err(|e| {
                RehearsalError::CaptureError(format!("Failed to create whisper state: {e}"))
            })?;

            let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
            params.set_language(Some(self.language.as_str()));
            params.set_print_special(false);
            params.set_print_progress(false);
            params.set_print_realtime(false);
            params.set_print_timestamps(false);
            params.set_single_segment(true);
            params.set_token_timestamps(false);

            state
                .full(params, samples)
                .map_err(|e| RehearsalError::CaptureError(format!("Whisper inference failed: {e}")))?;

            let mut text = String::new();
            for i in 0..state.full_n_segments() {
                if let Some(segment) = state.get_segment(i) {
                    if let Ok(segment_text) = segment.to_str_lossy() {
                        let trimmed = segment_text.trim();
                        if !trimmed.is_empty() {
                            if !text.is_empty() {
                                text.push(' ');
                            }
                            text.push_str(trimmed);
                        }
                    }
                }
            }
            Ok(text)
        }
    }

    /// Find the GGML model file.
    fn find_model(model_name: &str) -> Result<PathBuf> {
        let direct = PathBuf::from(model_name);
        if direct.exists() && direct.extension().is_some() {
            return Ok(direct);
        }

        let filenames = [
            format!("ggml-{}.bin", model_name.replace('/', "-")),
            "ggml-base.en.bin".to_string(),
            "ggml-base.bin".to_string(),
            "ggml-small.en.bin".to_string(),
        ];

        let search_dirs: Vec<PathBuf> = [
            std::env::current_dir().ok(),
            dirs::home_dir().map(|h| h.join(".cache/whisper")),
            dirs::home_dir().map(|h| h.join(".cache/scene-partner")),
        ]
        .into_iter()
        .flatten()
        .collect();

        for dir in &search_dirs {
            for filename in &filenames {
                let path = dir.join(filename);
                if path.exists() {
                    return Ok(path);
                }
            }
        }

        Err(RehearsalError::CaptureUnavailable(format!(
            "Whisper GGML model '{model_name}' not found in {search_dirs:?}"
        )))
    }

    /// Continuous on-device recognizer.
    pub struct LocalRecognizer {
        transcriber: WhisperTranscriber,
        audio: AudioConfig,
        whisper: WhisperConfig,
    }

    impl LocalRecognizer {
        pub fn new(transcriber: WhisperTranscriber, audio: AudioConfig, whisper: WhisperConfig) -> Self {
            Self {
                transcriber,
                audio,
                whisper,
            }
        }
    }

    struct LocalSession {
        mic: MicrophoneStream,
        cancel: CancellationToken,
    }

    impl CaptureSession for LocalSession {
        fn stop(&mut self) {
            self.cancel.cancel();
            self.mic.stop();
        }
    }

    impl Drop for LocalSession {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }

    #[async_trait]
    impl CaptureBackend for LocalRecognizer {
        fn name(&self) -> &'static str {
            "local"
        }

        async fn start(
            &self,
            events: mpsc::UnboundedSender<CaptureEvent>,
        ) -> Result<Box<dyn CaptureSession>> {
            let window_len = (self.whisper.window_secs * f64::from(self.audio.sample_rate)) as usize;
            let min_len = (self.audio.sample_rate / 2) as usize;
            let window: Arc<Mutex<Vec<f32>>> = Arc::new(Mutex::new(Vec::with_capacity(window_len)));

            let sink = Arc::clone(&window);
            let mic = MicrophoneStream::open(
                &self.audio,
                move |data| {
                    let mut buf = sink.lock().unwrap_or_else(PoisonError::into_inner);
                    buf.extend_from_slice(data);
                    if buf.len() > window_len {
                        let excess = buf.len() - window_len;
                        buf.drain(..excess);
                    }
                },
                events.clone(),
            )
            .await?;

            let cancel = CancellationToken::new();
            let task_cancel = cancel.clone();
            let transcriber = self.transcriber.clone();
            let interval = Duration::from_millis(self.whisper.interval_ms.max(100));

            tokio::spawn(async move {
                let mut last = String::new();
                loop {
                    tokio::select! {
                        _ = task_cancel.cancelled() => break,
                        _ = tokio::time::sleep(interval) => {}
                    }

                    let samples = window.lock().unwrap_or_else(PoisonError::into_inner).clone();
                    if samples.len() < min_len || rms_energy(&samples) < SILENCE_THRESHOLD {
                        continue;
                    }

                    let transcriber = transcriber.clone();
                    let result =
                        tokio::task::spawn_blocking(move || transcriber.transcribe(&samples)).await;
                    if task_cancel.is_cancelled() {
                        break;
                    }
                    match result {
                        Ok(Ok(text)) if !text.is_empty() && text != last => {
                            debug!("Heard: \"{text}\"");
                            last.clone_from(&text);
                            let _ = events.send(CaptureEvent::Transcript {
                                text,
                                is_final: false,
                            });
                        }
                        Ok(Ok(_)) => {}
                        Ok(Err(e)) => {
                            warn!("{e}");
                            let _ = events.send(CaptureEvent::Error(e.to_string()));
                        }
                        Err(e) => {
                            warn!("Recognition worker failed: {e}");
                            let _ = events.send(CaptureEvent::Error(e.to_string()));
                        }
                    }
                }
                debug!("Local recognition stopped");
            });

            Ok(Box::new(LocalSession { mic, cancel }))
        }
    }
}
