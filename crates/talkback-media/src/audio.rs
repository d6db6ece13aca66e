//! Audio source and sink abstractions.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;

use crate::gate::CaptureGate;

/// A pausable capture source that yields raw 16-bit PCM.
#[async_trait]
pub trait AudioSource: Send {
    /// The gate this source waits on before every read.
    fn gate(&self) -> CaptureGate;

    fn pause(&self) {
        self.gate().mute();
    }

    fn resume(&self) {
        self.gate().resume();
    }

    /// Read up to `size` bytes, waiting first while the gate is muted.
    ///
    /// An empty buffer means the source has ended.
    async fn read(&mut self, size: usize) -> anyhow::Result<Bytes>;
}

/// A playback target for raw 16-bit PCM.
#[async_trait]
pub trait AudioSink: Send {
    /// Queue a buffer for playback. Buffers play in call order.
    async fn write(&mut self, chunk: Bytes) -> anyhow::Result<()>;

    /// Wait until everything written so far has been played.
    async fn flush(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Gated source backed by a channel of captured buffers.
///
/// Producers (a device callback, a file reader, a test) push arbitrary-sized
/// buffers; reads re-slice them into the requested size. Dropping every
/// sender ends the source once the backlog is drained.
pub struct ChannelSource {
    gate: CaptureGate,
    rx: mpsc::UnboundedReceiver<Bytes>,
    pending: BytesMut,
    closed: bool,
}

impl ChannelSource {
    pub fn new(gate: CaptureGate, rx: mpsc::UnboundedReceiver<Bytes>) -> Self {
        Self {
            gate,
            rx,
            pending: BytesMut::new(),
            closed: false,
        }
    }

    /// Create a source together with the sender that feeds it.
    pub fn channel(gate: CaptureGate) -> (mpsc::UnboundedSender<Bytes>, Self) {
        let (tx, rx) = mpsc::unbounded_channel();
        (tx, Self::new(gate, rx))
    }
}

#[async_trait]
impl AudioSource for ChannelSource {
    fn gate(&self) -> CaptureGate {
        self.gate.clone()
    }

    async fn read(&mut self, size: usize) -> anyhow::Result<Bytes> {
        self.gate.wait_open().await;

        while self.pending.len() < size && !self.closed {
            match self.rx.recv().await {
                Some(buf) => self.pending.extend_from_slice(&buf),
                None => self.closed = true,
            }
        }

        let take = size.min(self.pending.len());
        Ok(self.pending.split_to(take).freeze())
    }
}
