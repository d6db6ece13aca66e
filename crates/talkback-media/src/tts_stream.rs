//! Streaming TTS: yields audio chunks as they arrive from the provider.
//!
//! All providers are asked for raw 16-bit 24kHz mono PCM so chunks can go
//! straight to the speaker.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tracing::debug;

const OPENAI_BASE_URL: &str = "https://api.openai.com";
const ELEVENLABS_BASE_URL: &str = "https://api.elevenlabs.io";

/// Audio chunks for one utterance, in playback order.
pub type AudioChunkStream = Pin<Box<dyn Stream<Item = anyhow::Result<Bytes>> + Send>>;

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Provider identifier (e.g., "openai", "elevenlabs").
    fn id(&self) -> &str;

    /// Start synthesizing `text`. Each call opens a fresh stream.
    async fn synthesize(&self, text: &str) -> anyhow::Result<AudioChunkStream>;
}

async fn chunk_stream(response: reqwest::Response) -> anyhow::Result<AudioChunkStream> {
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        anyhow::bail!("TTS API error {status}: {body}");
    }

    let chunks = response
        .bytes_stream()
        .map(|chunk| chunk.map_err(|e| anyhow::anyhow!("TTS stream error: {e}")));
    Ok(Box::pin(chunks))
}

/// OpenAI `/v1/audio/speech`.
pub struct OpenAiSpeech {
    base_url: String,
    api_key: String,
    model: String,
    voice: String,
    client: reqwest::Client,
}

impl OpenAiSpeech {
    pub fn new(api_key: impl Into<String>, model: Option<&str>, voice: Option<&str>) -> Self {
        Self {
            base_url: OPENAI_BASE_URL.to_string(),
            api_key: api_key.into(),
            model: model.unwrap_or("tts-1").to_string(),
            voice: voice.unwrap_or("nova").to_string(),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    pub fn request_body(&self, text: &str) -> serde_json::Value {
        serde_json::json!({
            "model": self.model,
            "voice": self.voice,
            "input": text,
            "response_format": "pcm",
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAiSpeech {
    fn id(&self) -> &str {
        "openai"
    }

    async fn synthesize(&self, text: &str) -> anyhow::Result<AudioChunkStream> {
        debug!(model = %self.model, voice = %self.voice, text_len = text.len(), "Starting TTS stream");

        let response = self
            .client
            .post(format!("{}/v1/audio/speech", self.base_url))
            .header("authorization", format!("Bearer {}", self.api_key))
            .json(&self.request_body(text))
            .send()
            .await?;

        chunk_stream(response).await
    }
}

/// ElevenLabs streaming text-to-speech.
pub struct ElevenLabsSpeech {
    api_key: String,
    model: String,
    voice: String,
    client: reqwest::Client,
}

impl ElevenLabsSpeech {
    pub fn new(api_key: impl Into<String>, model: Option<&str>, voice: Option<&str>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.unwrap_or("eleven_turbo_v2").to_string(),
            voice: voice.unwrap_or("Rachel").to_string(),
            client: reqwest::Client::new(),
        }
    }
}

/// Build the ElevenLabs streaming TTS request URL for a given voice.
pub fn build_elevenlabs_url(voice: &str) -> String {
    format!("{ELEVENLABS_BASE_URL}/v1/text-to-speech/{voice}/stream?output_format=pcm_24000")
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsSpeech {
    fn id(&self) -> &str {
        "elevenlabs"
    }

    async fn synthesize(&self, text: &str) -> anyhow::Result<AudioChunkStream> {
        debug!(voice = %self.voice, model = %self.model, text_len = text.len(), "Starting TTS stream");

        let response = self
            .client
            .post(build_elevenlabs_url(&self.voice))
            .header("xi-api-key", &self.api_key)
            .json(&serde_json::json!({
                "text": text,
                "model_id": self.model,
            }))
            .send()
            .await?;

        chunk_stream(response).await
    }
}
