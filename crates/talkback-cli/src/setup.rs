//! Builds the collaborators for one session from config and credentials.

use std::sync::Arc;

use tracing::info;

use talkback_core::config::Config;
use talkback_core::error::{Result, TalkbackError};
use talkback_media::stt::{DeepgramTranscriber, build_listen_url};
use talkback_media::tts_stream::{ElevenLabsSpeech, OpenAiSpeech};
use talkback_media::{AudioSink, AudioSource, CaptureGate, SpeechSynthesizer};
use talkback_providers::OpenAiChat;

const DEFAULT_STT_MODEL: &str = "general";

/// API keys supplied on the command line.
#[derive(Clone)]
pub struct Credentials {
    pub deepgram: String,
    pub openai: String,
}

impl Credentials {
    pub fn new(deepgram: &str, openai: &str) -> Result<Self> {
        let deepgram = deepgram.trim();
        let openai = openai.trim();
        if deepgram.is_empty() {
            return Err(TalkbackError::MissingCredential("--dp-key".into()));
        }
        if openai.is_empty() {
            return Err(TalkbackError::MissingCredential("--ooi-key".into()));
        }
        Ok(Self {
            deepgram: deepgram.to_string(),
            openai: openai.to_string(),
        })
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("deepgram", &"***")
            .field("openai", &"***")
            .finish()
    }
}

/// Full Deepgram listen URL, honouring a configured override.
pub fn listen_url(config: &Config) -> String {
    let stt = config.stt.as_ref();
    if let Some(url) = stt.and_then(|s| s.url.clone()) {
        return url;
    }
    let model = stt
        .and_then(|s| s.model.as_deref())
        .unwrap_or(DEFAULT_STT_MODEL);
    build_listen_url(model, config.audio().input_sample_rate)
}

pub fn transcriber(config: &Config, credentials: &Credentials) -> DeepgramTranscriber {
    let audio = config.audio();
    DeepgramTranscriber::new(credentials.deepgram.clone(), listen_url(config))
        .with_read_size(audio.frames_per_read * 2)
}

pub fn reply_generator(
    config: &Config,
    credentials: &Credentials,
    system_prompt: Option<&str>,
) -> OpenAiChat {
    let llm = config.llm.as_ref();
    let prompt = system_prompt
        .map(String::from)
        .unwrap_or_else(|| config.system_prompt());
    OpenAiChat::new(credentials.openai.clone(), config.llm_model())
        .with_base_url(llm.and_then(|l| l.base_url.as_deref()))
        .with_system_prompt(prompt)
        .with_max_tokens(config.max_tokens())
        .with_temperature(config.temperature())
}

/// Pick the speech provider named by `tts.provider`.
pub fn speech_synthesizer(
    config: &Config,
    credentials: &Credentials,
) -> Result<Arc<dyn SpeechSynthesizer>> {
    let tts = config.tts.as_ref();
    let model = tts.and_then(|t| t.model.as_deref());
    let voice = tts.and_then(|t| t.voice.as_deref());

    match config.tts_provider().as_str() {
        "openai" => Ok(Arc::new(OpenAiSpeech::new(
            credentials.openai.clone(),
            model,
            voice,
        ))),
        "elevenlabs" => {
            let key = tts
                .and_then(|t| t.resolve_api_key())
                .ok_or_else(|| TalkbackError::MissingCredential("tts.api_key".into()))?;
            Ok(Arc::new(ElevenLabsSpeech::new(key, model, voice)))
        }
        other => Err(TalkbackError::Config(format!(
            "Unsupported TTS provider '{other}'"
        ))),
    }
}

/// Keeps the capture device running while held.
pub struct CaptureHandle {
    #[cfg(feature = "device")]
    _microphone: talkback_media::device::Microphone,
}

pub type Devices = (Box<dyn AudioSource>, Box<dyn AudioSink>, CaptureHandle);

/// Open the default microphone and speaker. The microphone waits on `gate`.
#[cfg(feature = "device")]
pub fn open_devices(config: &Config, gate: CaptureGate) -> Result<Devices> {
    use talkback_media::device::{Microphone, Speaker};

    let audio = config.audio();
    let (microphone, source) = Microphone::open(&audio, gate)?;
    let speaker = Speaker::open(&audio)?;
    info!(
        input_rate = audio.input_sample_rate,
        output_rate = audio.output_sample_rate,
        "Audio devices ready"
    );
    Ok((
        Box::new(source),
        Box::new(speaker),
        CaptureHandle {
            _microphone: microphone,
        },
    ))
}

#[cfg(not(feature = "device"))]
pub fn open_devices(_config: &Config, _gate: CaptureGate) -> Result<Devices> {
    info!("Audio device support not compiled in");
    Err(TalkbackError::AudioDevice(
        "built without the `device` feature; rebuild with `--features device`".into(),
    ))
}
