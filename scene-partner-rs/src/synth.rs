//! Text-to-speech collaborator.
//!
//! The synthesis service resolves a character to a voice on its own; we only
//! send `{text, character}` and consume the audio bytes it returns.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::SynthesisConfig;
use crate::error::{RehearsalError, Result};

/// Body sent to the synthesis service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SynthesisRequest {
    pub text: String,
    pub character: String,
}

/// Turns a line of dialog into playable audio bytes.
#[async_trait]
pub trait Synthesizer: Send + Sync {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<Vec<u8>>;
}

/// Synthesizer backed by an HTTP endpoint that answers with `audio/mpeg`.
pub struct HttpSynthesizer {
    endpoint: String,
    api_key: Option<String>,
    client: Client,
}

impl HttpSynthesizer {
    pub fn new(config: &SynthesisConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| RehearsalError::SynthesisFailure(format!("HTTP client: {e}")))?;

        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.is_empty());
        if api_key.is_none() {
            debug!("{} not set, calling synthesis endpoint without a key", config.api_key_env);
        }

        Ok(Self {
            endpoint: config.endpoint.clone(),
            api_key,
            client,
        })
    }
}

#[async_trait]
impl Synthesizer for HttpSynthesizer {
    async fn synthesize(&self, request: &SynthesisRequest) -> Result<Vec<u8>> {
        if request.text.trim().is_empty() {
            return Err(RehearsalError::SynthesisFailure("nothing to say".into()));
        }
        debug!("Synthesizing {} chars for {}", request.text.len(), request.character);

        let mut builder = self.client.post(&self.endpoint).json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let resp = builder.send().await.map_err(|e| {
            if e.is_connect() {
                warn!("Cannot connect to synthesis service at {}", self.endpoint);
            } else if e.is_timeout() {
                warn!("Synthesis request timed out");
            }
            RehearsalError::SynthesisFailure(e.to_string())
        })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RehearsalError::SynthesisFailure(format!(
                "service returned {status}: {}",
                body.trim()
            )));
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| RehearsalError::SynthesisFailure(format!("reading audio: {e}")))?;
        if bytes.is_empty() {
            return Err(RehearsalError::SynthesisFailure("empty audio body".into()));
        }
        Ok(bytes.to_vec())
    }
}
