//! Microphone capture with cpal.
//!
//! The cpal stream lives on its own thread for the whole capture session,
//! since the stream handle cannot cross threads on every host. Samples are
//! 16kHz mono f32, handed to the caller's sink from the audio callback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::Thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, Stream, StreamConfig};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::CaptureEvent;
use crate::config::AudioConfig;
use crate::error::{RehearsalError, Result};

/// Open microphone. Dropping it releases the device.
pub struct MicrophoneStream {
    stop: Arc<AtomicBool>,
    thread: Option<Thread>,
}

impl MicrophoneStream {
    /// Open the default input device and start delivering samples.
    pub async fn open<F>(
        config: &AudioConfig,
        on_samples: F,
        events: mpsc::UnboundedSender<CaptureEvent>,
    ) -> Result<Self>
    where
        F: FnMut(&[f32]) + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();

        let thread_stop = Arc::clone(&stop);
        let config = config.clone();
        let handle = std::thread::Builder::new()
            .name("mic-capture".into())
            .spawn(move || {
                let stream = match build_input_stream(&config, on_samples, events) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));

                while !thread_stop.load(Ordering::Relaxed) {
                    std::thread::park_timeout(Duration::from_millis(100));
                }
                drop(stream);
                debug!("Microphone released");
            })
            .map_err(|e| RehearsalError::CaptureError(format!("Failed to spawn capture thread: {e}")))?;

        // Constructed before awaiting so a cancelled open still stops the thread.
        let mic = Self {
            stop,
            thread: Some(handle.thread().clone()),
        };

        ready_rx
            .await
            .map_err(|_| RehearsalError::CaptureError("capture thread exited".into()))??;
        Ok(mic)
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            thread.unpark();
        }
    }
}

impl Drop for MicrophoneStream {
    fn drop(&mut self) {
        self.stop();
    }
}

fn build_input_stream<F>(
    config: &AudioConfig,
    mut on_samples: F,
    events: mpsc::UnboundedSender<CaptureEvent>,
) -> Result<Stream>
where
    F: FnMut(&[f32]) + Send + 'static,
{
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| RehearsalError::CaptureUnavailable("No input audio device available".into()))?;

    info!(
        "Using audio device: {}",
        device.name().unwrap_or("unknown".into())
    );

    let stream_config = StreamConfig {
        channels: config.channels,
        sample_rate: SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Fixed(config.chunk_size),
    };
    let channels = usize::from(config.channels.max(1));

    let stream = device
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                if channels == 1 {
                    on_samples(data);
                } else {
                    let mono: Vec<f32> = data
                        .chunks(channels)
                        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                        .collect();
                    on_samples(&mono);
                }
            },
            move |err| {
                warn!("Audio stream error: {err}");
                let _ = events.send(CaptureEvent::Error(err.to_string()));
            },
            None,
        )
        .map_err(|e| RehearsalError::CaptureError(format!("Failed to build input stream: {e}")))?;

    stream
        .play()
        .map_err(|e| RehearsalError::CaptureError(format!("Failed to start audio stream: {e}")))?;
    debug!("Audio stream opened");
    Ok(stream)
}

/// RMS energy of audio samples.
pub fn rms_energy(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    (sum_sq / samples.len() as f32).sqrt()
}
