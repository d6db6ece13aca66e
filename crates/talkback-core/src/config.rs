//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level Talkback configuration.
///
/// Every section is optional; accessors fall back to the defaults the voice
/// loop was tuned with.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stt: Option<SttConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm: Option<LlmConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts: Option<TtsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation: Option<ConversationConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// Speech-to-text (streaming transcription) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttConfig {
    /// Provider (only "deepgram" is supported).
    #[serde(default = "default_stt_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Override of the full listen URL, query string included.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Model name (default: "general").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

fn default_stt_provider() -> String {
    "deepgram".into()
}

impl SttConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

/// Reply generation (chat completion) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider (default: "openai").
    #[serde(default = "default_llm_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// System prompt prepended to every request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

fn default_llm_provider() -> String {
    "openai".into()
}

impl LlmConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

/// Text-to-speech configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    /// TTS provider: "openai" (default) or "elevenlabs".
    #[serde(default = "default_tts_provider")]
    pub provider: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Voice name or ID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

fn default_tts_provider() -> String {
    "openai".into()
}

impl TtsConfig {
    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

/// Audio device parameters. Capture and playback are 16-bit mono PCM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    #[serde(default = "default_input_sample_rate")]
    pub input_sample_rate: u32,

    #[serde(default = "default_output_sample_rate")]
    pub output_sample_rate: u32,

    /// Frames per capture read; each read returns twice this many bytes.
    #[serde(default = "default_frames_per_read")]
    pub frames_per_read: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: default_input_sample_rate(),
            output_sample_rate: default_output_sample_rate(),
            frames_per_read: default_frames_per_read(),
        }
    }
}

fn default_input_sample_rate() -> u32 {
    16_000
}

fn default_output_sample_rate() -> u32 {
    24_000
}

fn default_frames_per_read() -> usize {
    8_000
}

/// Turn loop tuning.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// Case-insensitive phrase that ends the session (default: "goodbye").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_keyword: Option<String>,

    /// Upper bound on a single reply request.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_timeout_secs: Option<u64>,

    /// Upper bound on opening the speech stream and on each chunk wait.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub synthesis_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "talkback_agent=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("static pattern");
    re.replace_all(input, |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_default()
    })
    .into_owned()
}

pub const DEFAULT_EXIT_KEYWORD: &str = "goodbye";
pub const DEFAULT_SYSTEM_PROMPT: &str = "Answer in less then 15 words";
pub const DEFAULT_LLM_MODEL: &str = "gpt-4o-mini-2024-07-18";

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    ///
    /// A missing file is not an error; the defaults are returned instead.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)?;
        let substituted = substitute_env_vars(&raw);

        json5::from_str(&substituted)
            .map_err(|e| crate::error::TalkbackError::Config(e.to_string()))
    }

    /// Default config file location: `~/.talkback/config.json`.
    pub fn default_path() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn exit_keyword(&self) -> String {
        self.conversation
            .as_ref()
            .and_then(|c| c.exit_keyword.clone())
            .unwrap_or_else(|| DEFAULT_EXIT_KEYWORD.to_string())
    }

    pub fn reply_timeout(&self) -> Duration {
        let secs = self
            .conversation
            .as_ref()
            .and_then(|c| c.reply_timeout_secs)
            .unwrap_or(30);
        Duration::from_secs(secs)
    }

    pub fn synthesis_timeout(&self) -> Duration {
        let secs = self
            .conversation
            .as_ref()
            .and_then(|c| c.synthesis_timeout_secs)
            .unwrap_or(15);
        Duration::from_secs(secs)
    }

    pub fn system_prompt(&self) -> String {
        self.llm
            .as_ref()
            .and_then(|l| l.system_prompt.clone())
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string())
    }

    pub fn llm_model(&self) -> String {
        self.llm
            .as_ref()
            .and_then(|l| l.model.clone())
            .unwrap_or_else(|| DEFAULT_LLM_MODEL.to_string())
    }

    pub fn max_tokens(&self) -> u32 {
        self.llm.as_ref().and_then(|l| l.max_tokens).unwrap_or(256)
    }

    pub fn temperature(&self) -> Option<f64> {
        self.llm.as_ref().and_then(|l| l.temperature)
    }

    pub fn tts_provider(&self) -> String {
        self.tts
            .as_ref()
            .map(|t| t.provider.clone())
            .unwrap_or_else(default_tts_provider)
    }

    pub fn audio(&self) -> AudioConfig {
        self.audio.clone().unwrap_or_default()
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        if self.exit_keyword().trim().is_empty() {
            errors.push("conversation.exit_keyword cannot be empty".to_string());
        }

        if let Some(conv) = &self.conversation {
            if conv.reply_timeout_secs == Some(0) {
                errors.push("conversation.reply_timeout_secs must be positive".to_string());
            }
            if conv.synthesis_timeout_secs == Some(0) {
                errors.push("conversation.synthesis_timeout_secs must be positive".to_string());
            }
        }

        let audio = self.audio();
        if audio.input_sample_rate == 0 || audio.output_sample_rate == 0 {
            errors.push("audio sample rates must be non-zero".to_string());
        }
        if audio.frames_per_read == 0 {
            errors.push("audio.frames_per_read must be non-zero".to_string());
        }

        if let Some(stt) = &self.stt {
            if stt.provider != "deepgram" {
                errors.push(format!("Unsupported STT provider '{}'", stt.provider));
            }
            if stt.api_key_env.is_some() && stt.resolve_api_key().is_none() {
                warnings.push(format!(
                    "STT key env var '{}' is unset",
                    stt.api_key_env.as_deref().unwrap_or_default()
                ));
            }
        }

        if let Some(llm) = &self.llm {
            if llm.provider != "openai" {
                errors.push(format!("Unsupported LLM provider '{}'", llm.provider));
            }
            if llm.api_key_env.is_some() && llm.resolve_api_key().is_none() {
                warnings.push(format!(
                    "LLM key env var '{}' is unset",
                    llm.api_key_env.as_deref().unwrap_or_default()
                ));
            }
        }

        if let Some(tts) = &self.tts {
            if !matches!(tts.provider.as_str(), "openai" | "elevenlabs") {
                errors.push(format!("Unsupported TTS provider '{}'", tts.provider));
            }
            if tts.provider == "elevenlabs" && tts.resolve_api_key().is_none() {
                errors.push("tts.api_key is required for the ElevenLabs provider".to_string());
            }
        }

        (warnings, errors)
    }
}

/// Base directory for Talkback data: `~/.talkback/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".talkback")
}
