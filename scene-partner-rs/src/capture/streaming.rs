//! Streaming transcription over a persistent WebSocket.
//!
//! Fetches a short-lived realtime token with the account key, connects with
//! `sample_rate=16000`, forwards microphone audio as 16-bit little-endian PCM
//! frames and turns `{ "text": ... }` messages into transcript events.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::mpsc;

use super::{CaptureBackend, CaptureEvent, CaptureSession};
use crate::config::{AudioConfig, StreamingConfig};
use crate::error::{RehearsalError, Result};

/// Sent before closing so the service flushes and ends the session.
pub const TERMINATE_MESSAGE: &str = r#"{"terminate_session":true}"#;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: String,
}

/// Message received from the transcription service.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RealtimeMessage {
    pub message_type: Option<String>,
    pub text: Option<String>,
    pub error: Option<String>,
}

impl RealtimeMessage {
    /// Map a socket text frame to the event the listener cares about.
    pub fn into_event(self) -> Option<CaptureEvent> {
        if let Some(error) = self.error {
            return Some(CaptureEvent::Error(error));
        }
        let text = self.text.filter(|t| !t.trim().is_empty())?;
        let is_final = self.message_type.as_deref() == Some("FinalTranscript");
        Some(CaptureEvent::Transcript { text, is_final })
    }
}

/// Convert f32 samples in [-1, 1] to 16-bit little-endian PCM bytes.
pub fn pcm16_le(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let value = (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16;
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Remote realtime transcription backend.
pub struct StreamingTranscriber {
    config: StreamingConfig,
    audio: AudioConfig,
    api_key: Option<String>,
    client: Client,
}

impl StreamingTranscriber {
    pub fn new(config: StreamingConfig, audio: AudioConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.is_empty());
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| RehearsalError::CaptureError(format!("HTTP client: {e}")))?;
        Ok(Self {
            config,
            audio,
            api_key,
            client,
        })
    }

    fn socket_url(&self, token: &str) -> String {
        format!(
            "{}?sample_rate={}&token={token}",
            self.config.ws_url, self.audio.sample_rate
        )
    }

    async fn fetch_token(&self, api_key: &str) -> Result<String> {
        let resp = self
            .client
            .post(&self.config.token_url)
            .header("authorization", api_key)
            .json(&json!({ "expires_in": self.config.token_expires_in }))
            .send()
            .await
            .map_err(|e| RehearsalError::CaptureError(format!("realtime token request: {e}")))?;

        if !resp.status().is_success() {
            return Err(RehearsalError::CaptureError(format!(
                "realtime token request returned {}",
                resp.status()
            )));
        }

        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| RehearsalError::CaptureError(format!("realtime token response: {e}")))?;
        Ok(body.token)
    }
}

#[async_trait]
impl CaptureBackend for StreamingTranscriber {
    fn name(&self) -> &'static str {
        "streaming"
    }

    async fn start(
        &self,
        events: mpsc::UnboundedSender<CaptureEvent>,
    ) -> Result<Box<dyn CaptureSession>> {
        let Some(api_key) = self.api_key.as_deref() else {
            return Err(RehearsalError::CaptureUnavailable(format!(
                "{} is not set",
                self.config.api_key_env
            )));
        };
        self.open_session(api_key, events).await
    }
}

#[cfg(not(feature = "audio"))]
impl StreamingTranscriber {
    async fn open_session(
        &self,
        _api_key: &str,
        _events: mpsc::UnboundedSender<CaptureEvent>,
    ) -> Result<Box<dyn CaptureSession>> {
        Err(RehearsalError::CaptureUnavailable(
            "built without microphone support (`audio` feature)".into(),
        ))
    }
}

#[cfg(feature = "audio")]
impl StreamingTranscriber {
    async fn open_session(
        &self,
        api_key: &str,
        events: mpsc::UnboundedSender<CaptureEvent>,
    ) -> Result<Box<dyn CaptureSession>> {
        use super::mic::MicrophoneStream;

        let token = self.fetch_token(api_key).await?;
        let (frames_tx, frames_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let socket =
            TranscriptionSocket::connect(&self.socket_url(&token), frames_rx, events.clone())
                .await?;
        let mic = MicrophoneStream::open(
            &self.audio,
            move |samples| {
                let _ = frames_tx.send(pcm16_le(samples));
            },
            events,
        )
        .await?;

        Ok(Box::new(StreamingSession { mic, socket }))
    }
}

/// Open transcription socket: one task forwards PCM frames, another turns
/// server messages into capture events.
#[cfg(feature = "audio")]
pub(crate) struct TranscriptionSocket {
    cancel: tokio_util::sync::CancellationToken,
}

#[cfg(feature = "audio")]
impl TranscriptionSocket {
    pub(crate) async fn connect(
        url: &str,
        mut frames_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        events: mpsc::UnboundedSender<CaptureEvent>,
    ) -> Result<Self> {
        use futures_util::{SinkExt, StreamExt};
        use tokio_tungstenite::connect_async;
        use tokio_tungstenite::tungstenite::Message;
        use tokio_util::sync::CancellationToken;
        use tracing::{debug, info, warn};

        let (socket, _) = connect_async(url)
            .await
            .map_err(|e| RehearsalError::CaptureError(format!("transcription socket: {e}")))?;
        info!("Connected to realtime transcription");
        let (mut writer, mut reader) = socket.split();

        let cancel = CancellationToken::new();

        let writer_cancel = cancel.clone();
        let writer_events = events.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => break,
                    frame = frames_rx.recv() => {
                        let Some(frame) = frame else { break };
                        if let Err(e) = writer.send(Message::binary(frame)).await {
                            warn!("Transcription socket send failed: {e}");
                            let _ = writer_events.send(CaptureEvent::Error(e.to_string()));
                            break;
                        }
                    }
                }
            }
            let _ = writer.send(Message::text(TERMINATE_MESSAGE.to_string())).await;
            let _ = writer.send(Message::Close(None)).await;
            debug!("Transcription socket closed");
        });

        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    msg = reader.next() => msg,
                };
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<RealtimeMessage>(&text) {
                            Ok(message) => {
                                if let Some(event) = message.into_event() {
                                    let _ = events.send(event);
                                }
                            }
                            Err(e) => debug!("Ignoring transcription message: {e}"),
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        debug!("Transcription socket closed by server: {frame:?}");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Transcription socket error: {e}");
                        let _ = events.send(CaptureEvent::Error(e.to_string()));
                        break;
                    }
                    None => break,
                }
            }
        });

        Ok(Self { cancel })
    }

    /// Ask the service to end the session, then close the socket.
    pub(crate) fn stop(&self) {
        self.cancel.cancel();
    }
}

#[cfg(feature = "audio")]
impl Drop for TranscriptionSocket {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(feature = "audio")]
struct StreamingSession {
    mic: super::mic::MicrophoneStream,
    socket: TranscriptionSocket,
}

#[cfg(feature = "audio")]
impl CaptureSession for StreamingSession {
    fn stop(&mut self) {
        self.mic.stop();
        self.socket.stop();
    }
}
