//! Turn loop: transcript in, reply out, audio played.
//!
//! One accepted utterance runs strictly to completion before the next
//! transcript is read. Capture is muted from the moment the user turn is
//! appended until playback has drained, using a [`MuteGuard`] so every
//! return path resumes it.
//!
//! [`MuteGuard`]: talkback_media::MuteGuard

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

use talkback_core::config::{Config, DEFAULT_EXIT_KEYWORD};
use talkback_core::metrics::MetricsRecorder;
use talkback_core::types::TranscriptEvent;
use talkback_media::{AudioSink, CaptureGate, SpeechSynthesizer, TranscriptStream};
use talkback_providers::ReplyGenerator;

use crate::session::ConversationSession;
use crate::{SessionEnd, TurnError, TurnOutcome, TurnState};

/// Interval around the reply call, recorded only when it succeeds.
pub const REPLY_LATENCY: &str = "reply_latency";
/// Transcript receipt to first buffer handed to the sink.
pub const FIRST_AUDIO_LATENCY: &str = "first_audio_latency";
/// Count of turns that produced a reply.
pub const TURNS_COMPLETED: &str = "turns_completed";

#[derive(Debug, Clone)]
pub struct ConversationOptions {
    /// Case-insensitive substring that ends the session.
    pub exit_keyword: String,
    pub reply_timeout: Duration,
    /// Applies to opening the speech stream and to each buffer wait.
    pub synthesis_timeout: Duration,
}

impl Default for ConversationOptions {
    fn default() -> Self {
        Self {
            exit_keyword: DEFAULT_EXIT_KEYWORD.to_string(),
            reply_timeout: Duration::from_secs(30),
            synthesis_timeout: Duration::from_secs(15),
        }
    }
}

impl ConversationOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            exit_keyword: config.exit_keyword(),
            reply_timeout: config.reply_timeout(),
            synthesis_timeout: config.synthesis_timeout(),
        }
    }
}

/// What a finalized transcript means to the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptKind {
    Blank,
    Exit,
    Utterance,
}

/// Classify a transcript. Blank wins over the exit scan.
pub fn classify(event: &TranscriptEvent, exit_keyword: &str) -> TranscriptKind {
    if event.is_blank() {
        TranscriptKind::Blank
    } else if event
        .text
        .to_lowercase()
        .contains(&exit_keyword.to_lowercase())
    {
        TranscriptKind::Exit
    } else {
        TranscriptKind::Utterance
    }
}

pub struct ConversationOrchestrator {
    session: ConversationSession,
    replies: Arc<dyn ReplyGenerator>,
    speech: Arc<dyn SpeechSynthesizer>,
    sink: Box<dyn AudioSink>,
    recorder: Arc<dyn MetricsRecorder>,
    options: ConversationOptions,
}

impl ConversationOrchestrator {
    /// `gate` must be the same gate the capture source waits on.
    pub fn new(
        gate: CaptureGate,
        replies: Arc<dyn ReplyGenerator>,
        speech: Arc<dyn SpeechSynthesizer>,
        sink: Box<dyn AudioSink>,
        recorder: Arc<dyn MetricsRecorder>,
        options: ConversationOptions,
    ) -> Self {
        Self {
            session: ConversationSession::new(gate),
            replies,
            speech,
            sink,
            recorder,
            options,
        }
    }

    pub fn session(&self) -> &ConversationSession {
        &self.session
    }

    /// Consume transcripts until the exit keyword or the end of the stream.
    ///
    /// Per-turn failures are logged and the loop keeps listening. The stream
    /// is closed before returning, which stops the transcription tasks.
    pub async fn run(&mut self, mut transcripts: TranscriptStream) -> SessionEnd {
        info!(
            replies = self.replies.id(),
            speech = self.speech.id(),
            exit_keyword = %self.options.exit_keyword,
            "Starting conversation stream. Speak into your microphone."
        );
        self.session.set_state(TurnState::Listening);

        let end = loop {
            let event = match transcripts.next().await {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    error!(error = %e, "Transcription stream failed");
                    break SessionEnd::StreamFailed;
                }
                None => {
                    info!("Transcription stream ended");
                    break SessionEnd::StreamEnded;
                }
            };

            match classify(&event, &self.options.exit_keyword) {
                TranscriptKind::Blank => trace!("Ignoring blank transcript"),
                TranscriptKind::Exit => {
                    info!(transcript = %event.text, "Exit keyword detected. Ending conversation.");
                    break SessionEnd::ExitKeyword;
                }
                TranscriptKind::Utterance => {
                    self.handle_utterance(&event.text, event.received_at).await;
                }
            }
        };

        transcripts.close();
        self.session.set_state(TurnState::Ended);

        info!(
            end = ?end,
            turns = self.session.completed_turns(),
            "Conversation ended"
        );
        let report = self.recorder.report();
        if !report.is_empty() {
            info!("\n{report}");
        }
        end
    }

    /// Run one turn for an accepted utterance.
    ///
    /// `received_at` is when the transcript arrived and anchors the
    /// first-audio latency.
    pub async fn handle_utterance(&mut self, text: &str, received_at: Instant) -> TurnOutcome {
        info!(transcript = %text, "Human");
        self.session.push_user(text);
        let muted = self.session.gate().hold();
        self.session.set_state(TurnState::ProcessingReply);

        let reply = match self.request_reply().await {
            Ok(reply) => reply,
            Err(e) => {
                error!(kind = e.kind(), error = %e, "Reply failed; dropping turn");
                self.session.discard_pending_user();
                drop(muted);
                self.session.set_state(TurnState::Listening);
                return TurnOutcome::ReplyFailed(e);
            }
        };

        info!(reply = %reply, "AI");
        self.session.push_assistant(reply.as_str());
        self.session.set_state(TurnState::Speaking);

        let outcome = if reply.trim().is_empty() {
            warn!("Reply was blank; nothing to speak");
            TurnOutcome::Completed { chunks: 0 }
        } else {
            match self.speak(&reply, received_at).await {
                (chunks, Ok(())) => TurnOutcome::Completed { chunks },
                (chunks, Err(error)) => {
                    warn!(kind = error.kind(), error = %error, chunks, "Speech aborted");
                    TurnOutcome::SpeechFailed { chunks, error }
                }
            }
        };

        drop(muted);
        self.session.set_state(TurnState::Listening);
        self.recorder
            .log(TURNS_COMPLETED, self.session.completed_turns() as f64);
        outcome
    }

    async fn request_reply(&self) -> Result<String, TurnError> {
        let limit = self.options.reply_timeout;
        let started = Instant::now();

        match timeout(limit, self.replies.reply(self.session.turns())).await {
            Ok(Ok(reply)) => {
                self.recorder
                    .record_interval(REPLY_LATENCY, started, Instant::now());
                debug!("{}", self.recorder.report_metric(REPLY_LATENCY));
                Ok(reply)
            }
            Ok(Err(e)) => Err(TurnError::Reply(e)),
            Err(_) => Err(TurnError::ReplyTimeout(limit)),
        }
    }

    /// Stream `text` to the sink and wait for it to drain.
    ///
    /// Returns the number of buffers written alongside the result. The sink
    /// is flushed on every path, so queued audio finishes before capture
    /// reopens.
    async fn speak(&mut self, text: &str, received_at: Instant) -> (usize, Result<(), TurnError>) {
        let (written, streamed) = self.stream_speech(text, received_at).await;
        let flushed = self.sink.flush().await.map_err(TurnError::Playback);
        trace!(written, "Playback drained");
        (written, streamed.and(flushed))
    }

    async fn stream_speech(
        &mut self,
        text: &str,
        received_at: Instant,
    ) -> (usize, Result<(), TurnError>) {
        let limit = self.options.synthesis_timeout;

        let mut chunks = match timeout(limit, self.speech.synthesize(text)).await {
            Ok(Ok(chunks)) => chunks,
            Ok(Err(e)) => return (0, Err(TurnError::Synthesis(e))),
            Err(_) => return (0, Err(TurnError::SynthesisTimeout(limit))),
        };

        let mut written = 0;
        loop {
            match timeout(limit, chunks.next()).await {
                Ok(Some(Ok(chunk))) => {
                    if let Err(e) = self.sink.write(chunk).await {
                        return (written, Err(TurnError::Playback(e)));
                    }
                    if written == 0 {
                        self.recorder
                            .record_interval(FIRST_AUDIO_LATENCY, received_at, Instant::now());
                    }
                    written += 1;
                }
                Ok(Some(Err(e))) => return (written, Err(TurnError::Synthesis(e))),
                Ok(None) => return (written, Ok(())),
                Err(_) => return (written, Err(TurnError::SynthesisTimeout(limit))),
            }
        }
    }
}
