//! Generic SSE (Server-Sent Events) line parser.
//!
//! Converts a byte stream (usually a `reqwest` response body) into a
//! `Stream<Item = SseEvent>`.

use std::fmt::Display;
use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use futures::Stream;
use tokio_stream::StreamExt;

/// A parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

type ByteStream<E> = Pin<Box<dyn Stream<Item = Result<Bytes, E>> + Send>>;

struct SseState<E> {
    bytes: ByteStream<E>,
    /// Raw bytes not yet terminated by a newline. Decoding waits for a full
    /// line so multi-byte characters split across chunks survive.
    buffer: BytesMut,
    event: Option<String>,
    data: Vec<String>,
    done: bool,
}

impl<E> SseState<E> {
    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            self.event = None;
            return None;
        }
        let event = SseEvent {
            event: self.event.take(),
            data: self.data.join("\n"),
        };
        self.data.clear();
        Some(event)
    }

    /// Consume one complete line from the buffer. Returns an event when the
    /// line was the blank separator that ends one.
    fn take_line(&mut self) -> Option<Option<SseEvent>> {
        let newline = self.buffer.iter().position(|&b| b == b'\n')?;
        let raw = self.buffer.split_to(newline + 1);
        let line = String::from_utf8_lossy(&raw);
        let line = line.trim_end_matches(['\n', '\r']);

        if line.is_empty() {
            return Some(self.dispatch());
        }
        if let Some(value) = line.strip_prefix("data:") {
            self.data.push(value.trim_start().to_string());
        } else if let Some(value) = line.strip_prefix("event:") {
            self.event = Some(value.trim_start().to_string());
        }
        // Comments (":") and unknown fields are ignored.
        Some(None)
    }
}

/// Parse a byte stream as SSE.
pub fn parse_sse<S, E>(bytes: S) -> impl Stream<Item = anyhow::Result<SseEvent>>
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    futures::stream::unfold(
        SseState {
            bytes: Box::pin(bytes) as ByteStream<E>,
            buffer: BytesMut::new(),
            event: None,
            data: Vec::new(),
            done: false,
        },
        |mut state| async move {
            loop {
                match state.take_line() {
                    Some(Some(event)) => return Some((Ok(event), state)),
                    Some(None) => continue,
                    None => {}
                }

                if state.done {
                    return state.dispatch().map(|event| (Ok(event), state));
                }

                match state.bytes.next().await {
                    Some(Ok(chunk)) => state.buffer.extend_from_slice(&chunk),
                    Some(Err(e)) => {
                        state.done = true;
                        return Some((Err(anyhow::anyhow!("SSE stream error: {e}")), state));
                    }
                    None => {
                        state.done = true;
                        // Terminate a final line that had no newline.
                        if !state.buffer.is_empty() {
                            state.buffer.extend_from_slice(b"\n");
                        }
                    }
                }
            }
        },
    )
}

/// Parse a `reqwest` response body as SSE.
pub fn parse_sse_stream(
    response: reqwest::Response,
) -> impl Stream<Item = anyhow::Result<SseEvent>> {
    parse_sse(response.bytes_stream())
}
