//! Turn loop behaviour against scripted collaborators.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;

use talkback_agent::{
    ConversationOptions, ConversationOrchestrator, SessionEnd, TurnError, TurnOutcome, TurnState,
};
use talkback_core::metrics::{InMemoryRecorder, MetricsRecorder};
use talkback_core::types::{ConversationTurn, Role};
use talkback_media::{AudioChunkStream, AudioSink, CaptureGate, SpeechSynthesizer, TranscriptStream};
use talkback_providers::ReplyGenerator;

enum ScriptedReply {
    Text(&'static str),
    Fail(&'static str),
    Hang,
}

/// Replies from a script and records what it was asked.
struct FakeReplies {
    gate: CaptureGate,
    script: Mutex<VecDeque<ScriptedReply>>,
    calls: Mutex<Vec<(Vec<ConversationTurn>, bool)>>,
}

impl FakeReplies {
    fn new(gate: &CaptureGate, script: Vec<ScriptedReply>) -> Arc<Self> {
        Arc::new(Self {
            gate: gate.clone(),
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<(Vec<ConversationTurn>, bool)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ReplyGenerator for FakeReplies {
    fn id(&self) -> &str {
        "fake"
    }

    async fn reply(&self, turns: &[ConversationTurn]) -> anyhow::Result<String> {
        self.calls
            .lock()
            .unwrap()
            .push((turns.to_vec(), self.gate.is_muted()));
        let next = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ScriptedReply::Text("ok"));
        match next {
            ScriptedReply::Text(text) => Ok(text.to_string()),
            ScriptedReply::Fail(msg) => Err(anyhow::anyhow!(msg)),
            ScriptedReply::Hang => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok("too late".into())
            }
        }
    }
}

/// What the fake synthesizer does after its buffers run out.
#[derive(Clone, Copy)]
enum Tail {
    End,
    Fail,
    /// Never yields again.
    Stall,
    /// `synthesize` itself fails; no buffers are produced.
    Refuse,
}

/// Yields fixed buffers per call, then follows its [`Tail`].
struct FakeSpeech {
    gate: CaptureGate,
    chunks: Vec<&'static str>,
    tail: Tail,
    calls: Mutex<Vec<(String, bool)>>,
}

impl FakeSpeech {
    fn new(gate: &CaptureGate, chunks: Vec<&'static str>, tail: Tail) -> Arc<Self> {
        Arc::new(Self {
            gate: gate.clone(),
            chunks,
            tail,
            calls: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> Vec<(String, bool)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechSynthesizer for FakeSpeech {
    fn id(&self) -> &str {
        "fake"
    }

    async fn synthesize(&self, text: &str) -> anyhow::Result<AudioChunkStream> {
        self.calls
            .lock()
            .unwrap()
            .push((text.to_string(), self.gate.is_muted()));
        let items: Vec<anyhow::Result<Bytes>> = self
            .chunks
            .iter()
            .map(|c| Ok(Bytes::from_static(c.as_bytes())))
            .collect();
        let head = futures::stream::iter(items);
        match self.tail {
            Tail::End => Ok(Box::pin(head)),
            Tail::Fail => Ok(Box::pin(head.chain(futures::stream::once(async {
                Err(anyhow::anyhow!("synthesis dropped"))
            })))),
            Tail::Stall => Ok(Box::pin(head.chain(futures::stream::pending()))),
            Tail::Refuse => Err(anyhow::anyhow!("voice not found")),
        }
    }
}

#[derive(Default)]
struct SinkLog {
    writes: Vec<(Bytes, bool)>,
    flushes: usize,
}

/// Records writes along with the gate state at each one.
struct RecordingSink {
    gate: CaptureGate,
    log: Arc<Mutex<SinkLog>>,
    fail_writes: bool,
}

#[async_trait]
impl AudioSink for RecordingSink {
    async fn write(&mut self, chunk: Bytes) -> anyhow::Result<()> {
        if self.fail_writes {
            anyhow::bail!("device unplugged");
        }
        let muted = self.gate.is_muted();
        self.log.lock().unwrap().writes.push((chunk, muted));
        Ok(())
    }

    async fn flush(&mut self) -> anyhow::Result<()> {
        self.log.lock().unwrap().flushes += 1;
        Ok(())
    }
}

struct Harness {
    gate: CaptureGate,
    replies: Arc<FakeReplies>,
    speech: Arc<FakeSpeech>,
    sink: Arc<Mutex<SinkLog>>,
    recorder: Arc<InMemoryRecorder>,
    orchestrator: ConversationOrchestrator,
}

fn harness(
    replies: Vec<ScriptedReply>,
    chunks: Vec<&'static str>,
    fail_after: bool,
    options: ConversationOptions,
) -> Harness {
    let tail = if fail_after { Tail::Fail } else { Tail::End };
    build(replies, chunks, tail, false, options)
}

fn build(
    replies: Vec<ScriptedReply>,
    chunks: Vec<&'static str>,
    tail: Tail,
    fail_writes: bool,
    options: ConversationOptions,
) -> Harness {
    let gate = CaptureGate::new();
    let replies = FakeReplies::new(&gate, replies);
    let speech = FakeSpeech::new(&gate, chunks, tail);
    let sink = Arc::new(Mutex::new(SinkLog::default()));
    let recorder = Arc::new(InMemoryRecorder::new());
    let orchestrator = ConversationOrchestrator::new(
        gate.clone(),
        replies.clone(),
        speech.clone(),
        Box::new(RecordingSink {
            gate: gate.clone(),
            log: sink.clone(),
            fail_writes,
        }),
        recorder.clone(),
        options,
    );
    Harness {
        gate,
        replies,
        speech,
        sink,
        recorder,
        orchestrator,
    }
}

fn roles(turns: &[ConversationTurn]) -> Vec<Role> {
    turns.iter().map(|t| t.role()).collect()
}

#[tokio::test]
async fn test_hello_then_goodbye() {
    let mut h = harness(
        vec![ScriptedReply::Text("Hi there")],
        vec!["b1"],
        false,
        ConversationOptions::default(),
    );

    let end = h
        .orchestrator
        .run(TranscriptStream::scripted(["hello", "goodbye"]))
        .await;

    assert_eq!(end, SessionEnd::ExitKeyword);
    let turns = h.orchestrator.session().turns();
    assert_eq!(roles(turns), vec![Role::User, Role::Assistant]);
    assert_eq!(turns[0].content(), "hello");
    assert_eq!(turns[1].content(), "Hi there");
    assert_eq!(h.replies.calls().len(), 1);
    assert_eq!(h.speech.calls().len(), 1);
    assert_eq!(h.speech.calls()[0].0, "Hi there");
    assert_eq!(h.sink.lock().unwrap().writes.len(), 1);
    assert_eq!(h.sink.lock().unwrap().flushes, 1);
    assert_eq!(h.orchestrator.session().state(), TurnState::Ended);
    assert!(!h.gate.is_muted());
}

#[tokio::test]
async fn test_exit_keyword_variants() {
    for text in ["Goodbye", "ok GOODBYE now", "goodbye"] {
        let mut h = harness(vec![], vec![], false, ConversationOptions::default());
        let end = h
            .orchestrator
            .run(TranscriptStream::scripted([text, "never reached"]))
            .await;
        assert_eq!(end, SessionEnd::ExitKeyword, "{text}");
        assert!(h.orchestrator.session().turns().is_empty(), "{text}");
        assert!(h.replies.calls().is_empty(), "{text}");
    }

    let mut h = harness(vec![], vec!["x"], false, ConversationOptions::default());
    let end = h
        .orchestrator
        .run(TranscriptStream::scripted(["good bye"]))
        .await;
    assert_eq!(end, SessionEnd::StreamEnded);
    assert_eq!(h.orchestrator.session().turns().len(), 2);
}

#[tokio::test]
async fn test_blank_transcripts_are_ignored() {
    let mut h = harness(vec![], vec!["x"], false, ConversationOptions::default());
    let end = h
        .orchestrator
        .run(TranscriptStream::scripted(["", "   ", "\t"]))
        .await;

    assert_eq!(end, SessionEnd::StreamEnded);
    assert!(h.orchestrator.session().turns().is_empty());
    assert!(h.replies.calls().is_empty());
    assert!(h.speech.calls().is_empty());
    assert!(h.recorder.get("turns_completed").is_none());
}

#[tokio::test]
async fn test_reply_failure_then_next_transcript_is_processed() {
    let mut h = harness(
        vec![ScriptedReply::Fail("503"), ScriptedReply::Text("Fine, thanks")],
        vec!["b1"],
        false,
        ConversationOptions::default(),
    );

    let end = h
        .orchestrator
        .run(TranscriptStream::scripted(["hello", "how are you", "goodbye"]))
        .await;

    assert_eq!(end, SessionEnd::ExitKeyword);
    let turns = h.orchestrator.session().turns();
    assert_eq!(roles(turns), vec![Role::User, Role::Assistant]);
    assert_eq!(turns[0].content(), "how are you");

    // The failed utterance is not resent with the next request.
    let calls = h.replies.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[1].0.len(), 1);
    assert_eq!(calls[1].0[0].content(), "how are you");

    assert_eq!(h.speech.calls().len(), 1);
    assert!(!h.gate.is_muted());
}

#[tokio::test]
async fn test_synthesis_failure_keeps_written_buffers() {
    let mut h = harness(
        vec![ScriptedReply::Text("Sure")],
        vec!["b1", "b2"],
        true,
        ConversationOptions::default(),
    );

    let outcome = h.orchestrator.handle_utterance("hello", Instant::now()).await;

    match outcome {
        TurnOutcome::SpeechFailed { chunks, error } => {
            assert_eq!(chunks, 2);
            assert!(matches!(error, TurnError::Synthesis(_)));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    let sink = h.sink.lock().unwrap();
    let written: Vec<Bytes> = sink.writes.iter().map(|(b, _)| b.clone()).collect();
    assert_eq!(written, vec![Bytes::from("b1"), Bytes::from("b2")]);
    assert_eq!(sink.flushes, 1);
    drop(sink);

    assert!(!h.gate.is_muted());
    assert_eq!(h.orchestrator.session().state(), TurnState::Listening);
    assert_eq!(
        roles(h.orchestrator.session().turns()),
        vec![Role::User, Role::Assistant]
    );
}

#[tokio::test]
async fn test_capture_is_muted_only_while_replying_and_speaking() {
    let mut h = harness(
        vec![ScriptedReply::Text("one"), ScriptedReply::Fail("down")],
        vec!["a", "b"],
        false,
        ConversationOptions::default(),
    );
    assert!(!h.gate.is_muted());

    let outcome = h.orchestrator.handle_utterance("first", Instant::now()).await;
    assert!(outcome.is_completed());
    assert!(!h.gate.is_muted());

    let outcome = h.orchestrator.handle_utterance("second", Instant::now()).await;
    assert!(matches!(outcome, TurnOutcome::ReplyFailed(TurnError::Reply(_))));
    assert!(!h.gate.is_muted());

    assert!(h.replies.calls().iter().all(|(_, muted)| *muted));
    assert!(h.speech.calls().iter().all(|(_, muted)| *muted));
    assert!(h.sink.lock().unwrap().writes.iter().all(|(_, muted)| *muted));
}

#[tokio::test]
async fn test_reply_timeout_is_a_reply_failure() {
    let options = ConversationOptions {
        reply_timeout: Duration::from_millis(50),
        ..ConversationOptions::default()
    };
    let mut h = harness(vec![ScriptedReply::Hang], vec!["x"], false, options);

    let outcome = h.orchestrator.handle_utterance("hello", Instant::now()).await;

    assert!(matches!(
        outcome,
        TurnOutcome::ReplyFailed(TurnError::ReplyTimeout(_))
    ));
    assert!(h.orchestrator.session().turns().is_empty());
    assert!(h.speech.calls().is_empty());
    assert!(!h.gate.is_muted());
    assert!(h.recorder.get("reply_latency").is_none());
}

#[tokio::test]
async fn test_metrics_recorded_on_success_only() {
    let mut h = harness(
        vec![ScriptedReply::Fail("nope"), ScriptedReply::Text("yes")],
        vec!["x"],
        false,
        ConversationOptions::default(),
    );

    h.orchestrator.handle_utterance("one", Instant::now()).await;
    assert!(h.recorder.get("reply_latency").is_none());
    assert!(h.recorder.get("first_audio_latency").is_none());

    h.orchestrator.handle_utterance("two", Instant::now()).await;
    let latency = h.recorder.get("reply_latency").expect("reply_latency");
    assert!(latency.duration().is_some_and(|d| d >= Duration::ZERO));
    assert!(
        h.recorder
            .get("first_audio_latency")
            .and_then(|m| m.duration())
            .is_some()
    );
    assert!(h.recorder.report().contains("turns_completed"));
}

#[tokio::test]
async fn test_blank_reply_is_appended_but_not_spoken() {
    let mut h = harness(
        vec![ScriptedReply::Text("")],
        vec!["x"],
        false,
        ConversationOptions::default(),
    );

    let outcome = h.orchestrator.handle_utterance("hmm", Instant::now()).await;

    assert!(matches!(outcome, TurnOutcome::Completed { chunks: 0 }));
    assert_eq!(h.orchestrator.session().turns().len(), 2);
    assert!(h.speech.calls().is_empty());
    assert!(!h.gate.is_muted());
}

#[tokio::test]
async fn test_stream_error_ends_session() {
    let (sender, stream) = TranscriptStream::channel();
    sender.send("hello");
    sender.fail(anyhow::anyhow!("socket closed"));
    drop(sender);

    let mut h = harness(vec![], vec!["x"], false, ConversationOptions::default());
    let end = h.orchestrator.run(stream).await;

    assert_eq!(end, SessionEnd::StreamFailed);
    assert_eq!(h.orchestrator.session().turns().len(), 2);
    assert!(!h.gate.is_muted());
}

#[tokio::test]
async fn test_exit_closes_transcript_stream() {
    let (sender, stream) = TranscriptStream::channel();
    let cancelled = sender.cancellation();
    sender.send("goodbye");

    let mut h = harness(vec![], vec![], false, ConversationOptions::default());
    h.orchestrator.run(stream).await;

    assert!(cancelled.is_cancelled());
    assert!(!sender.send("late"));
}

#[tokio::test]
async fn test_history_alternates_across_mixed_sequence() {
    let mut h = harness(
        vec![
            ScriptedReply::Text("a1"),
            ScriptedReply::Fail("x"),
            ScriptedReply::Text("a3"),
            ScriptedReply::Text("a4"),
        ],
        vec!["x"],
        false,
        ConversationOptions::default(),
    );

    h.orchestrator
        .run(TranscriptStream::scripted([
            "u1", "", "u2", "  ", "u3", "u4", "Goodbye!",
        ]))
        .await;

    let turns = h.orchestrator.session().turns();
    assert_eq!(turns.len(), 6);
    for (i, turn) in turns.iter().enumerate() {
        let expected = if i % 2 == 0 { Role::User } else { Role::Assistant };
        assert_eq!(turn.role(), expected);
    }
    let users: Vec<&str> = turns
        .iter()
        .filter(|t| t.role() == Role::User)
        .map(|t| t.content())
        .collect();
    assert_eq!(users, vec!["u1", "u3", "u4"]);
}

/// Capture open, state back to listening, and the sink drained.
fn assert_recovered(h: &Harness) {
    assert!(!h.gate.is_muted());
    assert_eq!(h.orchestrator.session().state(), TurnState::Listening);
    assert_eq!(h.sink.lock().unwrap().flushes, 1);
}

#[tokio::test]
async fn test_sink_write_failure_is_playback_error() {
    let mut h = build(
        vec![ScriptedReply::Text("Sure")],
        vec!["b1", "b2"],
        Tail::End,
        true,
        ConversationOptions::default(),
    );

    let outcome = h.orchestrator.handle_utterance("hello", Instant::now()).await;

    assert!(matches!(
        outcome,
        TurnOutcome::SpeechFailed {
            chunks: 0,
            error: TurnError::Playback(_)
        }
    ));
    assert_recovered(&h);
    assert!(h.recorder.get("first_audio_latency").is_none());
}

#[tokio::test]
async fn test_synthesis_refused_before_any_audio() {
    let mut h = build(
        vec![ScriptedReply::Text("Sure")],
        vec!["b1"],
        Tail::Refuse,
        false,
        ConversationOptions::default(),
    );

    let outcome = h.orchestrator.handle_utterance("hello", Instant::now()).await;

    assert!(matches!(
        outcome,
        TurnOutcome::SpeechFailed {
            chunks: 0,
            error: TurnError::Synthesis(_)
        }
    ));
    assert_recovered(&h);
    assert!(h.sink.lock().unwrap().writes.is_empty());
    assert_eq!(
        roles(h.orchestrator.session().turns()),
        vec![Role::User, Role::Assistant]
    );
}

#[tokio::test]
async fn test_stalled_chunk_times_out() {
    let options = ConversationOptions {
        synthesis_timeout: Duration::from_millis(50),
        ..ConversationOptions::default()
    };
    let mut h = build(
        vec![ScriptedReply::Text("Sure")],
        vec!["b1"],
        Tail::Stall,
        false,
        options,
    );

    let outcome = h.orchestrator.handle_utterance("hello", Instant::now()).await;

    assert!(matches!(
        outcome,
        TurnOutcome::SpeechFailed {
            chunks: 1,
            error: TurnError::SynthesisTimeout(_)
        }
    ));
    assert_recovered(&h);
    assert_eq!(h.sink.lock().unwrap().writes.len(), 1);
}
