//! OpenAI Chat Completions reply generator.
//!
//! Streams `/v1/chat/completions` and concatenates the content deltas into a
//! single reply. Works against any OpenAI-compatible base URL.

use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::StreamExt;
use tracing::{debug, trace};

use talkback_core::types::ConversationTurn;

use crate::ReplyGenerator;
use crate::sse::parse_sse_stream;

const OPENAI_BASE_URL: &str = "https://api.openai.com";

pub struct OpenAiChat {
    pub base_url: String,
    api_key: String,
    model: String,
    system_prompt: Option<String>,
    max_tokens: u32,
    temperature: Option<f64>,
    client: reqwest::Client,
}

impl OpenAiChat {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: OPENAI_BASE_URL.to_string(),
            api_key: api_key.into(),
            model: model.into(),
            system_prompt: None,
            max_tokens: 256,
            temperature: None,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_base_url(mut self, base_url: Option<&str>) -> Self {
        if let Some(url) = base_url {
            self.base_url = url.trim_end_matches('/').to_string();
        }
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        let prompt = prompt.into();
        self.system_prompt = (!prompt.trim().is_empty()).then_some(prompt);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_temperature(mut self, temperature: Option<f64>) -> Self {
        self.temperature = temperature;
        self
    }

    /// Build the `messages` array: system prompt first, then turns in order.
    pub fn format_messages(&self, turns: &[ConversationTurn]) -> Vec<serde_json::Value> {
        let mut messages = Vec::with_capacity(turns.len() + 1);
        if let Some(system) = &self.system_prompt {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.extend(
            turns
                .iter()
                .map(|t| json!({ "role": t.role().as_str(), "content": t.content() })),
        );
        messages
    }
}

// --- OpenAI request/response types ---

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<serde_json::Value>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
struct ChunkDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Extract the content delta from one SSE `data:` payload.
///
/// Returns `Ok(None)` for the `[DONE]` terminator.
fn parse_delta(data: &str) -> anyhow::Result<Option<String>> {
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(None);
    }
    let chunk: ChatCompletionChunk = serde_json::from_str(data)?;
    let delta = chunk
        .choices
        .into_iter()
        .filter_map(|c| c.delta.content)
        .collect::<String>();
    Ok(Some(delta))
}

#[async_trait]
impl ReplyGenerator for OpenAiChat {
    fn id(&self) -> &str {
        "openai"
    }

    async fn reply(&self, turns: &[ConversationTurn]) -> anyhow::Result<String> {
        let body = OpenAiRequest {
            model: self.model.clone(),
            messages: self.format_messages(turns),
            max_tokens: self.max_tokens,
            stream: true,
            temperature: self.temperature,
        };

        debug!(model = %body.model, turns = turns.len(), "Requesting reply");
        let started = Instant::now();

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("OpenAI API error {status}: {body}");
        }

        let events = parse_sse_stream(response);
        tokio::pin!(events);

        let mut reply = String::new();
        let mut first_token = true;
        while let Some(event) = events.next().await {
            let event = event?;
            match parse_delta(&event.data) {
                Ok(Some(delta)) => {
                    if first_token && !delta.is_empty() {
                        first_token = false;
                        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "First reply token");
                    }
                    reply.push_str(&delta);
                }
                Ok(None) => break,
                Err(e) => trace!(%e, data = %event.data, "Failed to parse OpenAI chunk"),
            }
        }

        Ok(reply.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_messages_orders_system_then_turns() {
        let chat = OpenAiChat::new("sk-test", "gpt-4o-mini").with_system_prompt("Be brief");
        let turns = vec![
            ConversationTurn::user("hello"),
            ConversationTurn::assistant("hi"),
            ConversationTurn::user("how are you"),
        ];
        let messages = chat.format_messages(&turns);
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[0]["content"], "Be brief");
        assert_eq!(messages[1]["role"], "user");
        assert_eq!(messages[2]["role"], "assistant");
        assert_eq!(messages[3]["content"], "how are you");
    }

    #[test]
    fn test_blank_system_prompt_is_omitted() {
        let chat = OpenAiChat::new("sk-test", "gpt-4o-mini").with_system_prompt("  ");
        let messages = chat.format_messages(&[ConversationTurn::user("x")]);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
    }

    #[test]
    fn test_parse_delta() {
        let data = r#"{"choices":[{"index":0,"delta":{"content":"Hel"},"finish_reason":null}]}"#;
        assert_eq!(parse_delta(data).unwrap(), Some("Hel".into()));

        let role_only = r#"{"choices":[{"index":0,"delta":{"role":"assistant"}}]}"#;
        assert_eq!(parse_delta(role_only).unwrap(), Some(String::new()));

        assert_eq!(parse_delta(" [DONE] ").unwrap(), None);
        assert!(parse_delta("{broken").is_err());
    }

    #[test]
    fn test_base_url_override_trims_slash() {
        let chat = OpenAiChat::new("k", "m").with_base_url(Some("http://localhost:8080/"));
        assert_eq!(chat.base_url, "http://localhost:8080");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_an_error() {
        let chat = OpenAiChat::new("k", "m").with_base_url(Some("http://127.0.0.1:9"));
        let result = chat.reply(&[ConversationTurn::user("hello")]).await;
        assert!(result.is_err());
    }
}
