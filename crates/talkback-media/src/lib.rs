//! Media pipeline: capture gating, streaming transcription, streaming TTS,
//! and (with the `device` feature) microphone/speaker adapters.

pub mod audio;
#[cfg(feature = "device")]
pub mod device;
pub mod gate;
pub mod stt;
pub mod tts_stream;

pub use audio::{AudioSink, AudioSource, ChannelSource};
pub use gate::{CaptureGate, MuteGuard};
pub use stt::{Transcriber, TranscriptSender, TranscriptStream};
pub use tts_stream::{AudioChunkStream, SpeechSynthesizer};
