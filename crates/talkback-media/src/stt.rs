//! Streaming speech-to-text.
//!
//! A [`Transcriber`] takes ownership of an [`AudioSource`] and returns a
//! [`TranscriptStream`] of finalized transcripts. The network send side runs
//! as a background task; closing the stream cancels it.

use std::fmt::Display;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use talkback_core::types::TranscriptEvent;

use crate::audio::AudioSource;

pub const DEEPGRAM_LISTEN_URL: &str = "wss://api.deepgram.com/v1/listen";

/// Bytes per capture read sent to Deepgram (8000 frames of 16-bit mono).
pub const DEFAULT_READ_SIZE: usize = 16_000;

/// How often a keep-alive frame is sent while capture is muted. Deepgram
/// drops sockets that carry no audio for about ten seconds.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(5);

const CLOSE_STREAM: &str = r#"{"type":"CloseStream"}"#;
const KEEP_ALIVE: &str = r#"{"type":"KeepAlive"}"#;

type EventResult = anyhow::Result<TranscriptEvent>;

/// Producer half of a [`TranscriptStream`].
#[derive(Clone)]
pub struct TranscriptSender {
    tx: mpsc::UnboundedSender<EventResult>,
    cancel: CancellationToken,
}

impl TranscriptSender {
    /// Deliver a finalized transcript. Returns `false` once the stream is closed.
    pub fn send(&self, text: impl Into<String>) -> bool {
        !self.cancel.is_cancelled() && self.tx.send(Ok(TranscriptEvent::new(text))).is_ok()
    }

    /// Deliver a terminal error.
    pub fn fail(&self, err: anyhow::Error) -> bool {
        self.tx.send(Err(err)).is_ok()
    }

    /// Token that fires when the consumer closes the stream.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Finite, single-consumer sequence of finalized transcripts.
pub struct TranscriptStream {
    events: mpsc::UnboundedReceiver<EventResult>,
    cancel: CancellationToken,
}

impl TranscriptStream {
    pub fn channel() -> (TranscriptSender, Self) {
        let (tx, events) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        (
            TranscriptSender {
                tx,
                cancel: cancel.clone(),
            },
            Self { events, cancel },
        )
    }

    /// A stream that yields the given transcripts in order and then ends.
    pub fn scripted<I, S>(transcripts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (sender, stream) = Self::channel();
        for text in transcripts {
            sender.send(text);
        }
        stream
    }

    /// Next transcript, or `None` when the stream has ended or been closed.
    pub async fn next(&mut self) -> Option<EventResult> {
        if self.cancel.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            event = self.events.recv() => event,
        }
    }

    /// Stop the producer tasks. Further calls to `next` return `None`.
    pub fn close(&mut self) {
        self.cancel.cancel();
        self.events.close();
    }
}

impl Drop for TranscriptStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Turns captured audio into finalized transcripts.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Provider identifier (e.g., "deepgram").
    fn id(&self) -> &str;

    /// Start transcribing. Consumes the source; a new stream needs a new source.
    async fn start(&self, source: Box<dyn AudioSource>) -> anyhow::Result<TranscriptStream>;
}

/// Build the Deepgram live-listen URL for 16-bit linear PCM.
pub fn build_listen_url(model: &str, sample_rate: u32) -> String {
    format!(
        "{DEEPGRAM_LISTEN_URL}?punctuate=true&encoding=linear16&sample_rate={sample_rate}&model={model}"
    )
}

#[derive(Debug, Deserialize)]
struct DeepgramMessage {
    #[serde(default)]
    is_final: bool,
    #[serde(default)]
    channel: Option<DeepgramChannel>,
}

#[derive(Debug, Deserialize)]
struct DeepgramChannel {
    #[serde(default)]
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(Debug, Deserialize)]
struct DeepgramAlternative {
    #[serde(default)]
    transcript: String,
}

/// Extract the transcript from a Deepgram message if it is final.
///
/// Interim results and metadata messages yield `None`. A final result with
/// no alternatives yields an empty transcript.
pub fn parse_final_transcript(raw: &str) -> anyhow::Result<Option<String>> {
    let message: DeepgramMessage = serde_json::from_str(raw)?;
    if !message.is_final {
        return Ok(None);
    }
    let transcript = message
        .channel
        .and_then(|c| c.alternatives.into_iter().next())
        .map(|a| a.transcript)
        .unwrap_or_default();
    Ok(Some(transcript))
}

/// Send captured audio to `ws_tx` until cancelled or the source ends, then
/// send `CloseStream`.
///
/// While the source's gate is muted no audio flows, so a keep-alive frame
/// goes out every `keep_alive` instead.
async fn pump_audio<S>(
    mut source: Box<dyn AudioSource>,
    mut ws_tx: S,
    read_size: usize,
    keep_alive: Duration,
    cancel: CancellationToken,
) where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let gate = source.gate();
    let mut ticker = tokio::time::interval(keep_alive);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.reset();

    loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if gate.is_muted() {
                    trace!("Sending Deepgram keep-alive");
                    if let Err(e) = ws_tx.send(Message::text(KEEP_ALIVE.to_string())).await {
                        warn!(%e, "Failed to send keep-alive to Deepgram");
                        return;
                    }
                }
                continue;
            }
            chunk = source.read(read_size) => chunk,
        };
        match chunk {
            Ok(chunk) if chunk.is_empty() => {
                debug!("Audio source ended");
                break;
            }
            Ok(chunk) => {
                if let Err(e) = ws_tx.send(Message::binary(chunk)).await {
                    warn!(%e, "Failed to send audio to Deepgram");
                    return;
                }
            }
            Err(e) => {
                warn!(%e, "Audio capture read failed");
                break;
            }
        }
    }
    if let Err(e) = ws_tx.send(Message::text(CLOSE_STREAM.to_string())).await {
        debug!(%e, "CloseStream not delivered");
    }
    debug!("Deepgram send side finished");
}

/// Deepgram live transcription over WebSocket.
pub struct DeepgramTranscriber {
    api_key: String,
    url: String,
    read_size: usize,
}

impl DeepgramTranscriber {
    pub fn new(api_key: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            url: url.into(),
            read_size: DEFAULT_READ_SIZE,
        }
    }

    pub fn with_read_size(mut self, read_size: usize) -> Self {
        self.read_size = read_size;
        self
    }
}

#[async_trait]
impl Transcriber for DeepgramTranscriber {
    fn id(&self) -> &str {
        "deepgram"
    }

    async fn start(&self, source: Box<dyn AudioSource>) -> anyhow::Result<TranscriptStream> {
        let mut request = self.url.as_str().into_client_request()?;
        request.headers_mut().insert(
            "Authorization",
            HeaderValue::from_str(&format!("Token {}", self.api_key))?,
        );

        let (ws, _response) = connect_async(request)
            .await
            .map_err(|e| anyhow::anyhow!("Deepgram connect failed: {e}"))?;
        info!(url = %self.url, "Connected to Deepgram");

        let (mut ws_tx, mut ws_rx) = ws.split();
        let (sender, stream) = TranscriptStream::channel();

        tokio::spawn(pump_audio(
            source,
            ws_tx,
            self.read_size,
            KEEP_ALIVE_INTERVAL,
            sender.cancellation(),
        ));

        let cancel = sender.cancellation();
        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = ws_rx.next() => message,
                };
                match message {
                    Some(Ok(Message::Text(text))) => match parse_final_transcript(text.as_str()) {
                        Ok(Some(transcript)) => {
                            trace!(%transcript, "Final transcript");
                            if !sender.send(transcript) {
                                break;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => trace!(%e, "Ignoring unparseable Deepgram message"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        debug!(?frame, "Deepgram closed the stream");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        sender.fail(anyhow::anyhow!("Deepgram stream error: {e}"));
                        break;
                    }
                    None => break,
                }
            }
            debug!("Deepgram receive side finished");
        });

        Ok(stream)
    }
}
