//! Microphone and speaker adapters using CPAL.
//!
//! CPAL streams are not `Send`, so each one lives on a dedicated thread that
//! parks until its owner is dropped. Both sides run 16-bit mono PCM at the
//! rates from [`AudioConfig`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, mpsc as std_mpsc};
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use tracing::{info, warn};

use talkback_core::config::AudioConfig;
use talkback_core::error::{Result, TalkbackError};

use crate::audio::{AudioSink, ChannelSource};
use crate::gate::CaptureGate;

const DRAIN_POLL: Duration = Duration::from_millis(20);
const DRAIN_SLACK: Duration = Duration::from_secs(1);

fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / i16::MAX as f32
}

fn mono_config(sample_rate: u32) -> StreamConfig {
    StreamConfig {
        channels: 1,
        sample_rate: SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    }
}

/// Keeps a CPAL stream alive on its own thread.
struct StreamThread {
    stop_tx: Option<std_mpsc::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl StreamThread {
    /// Spawn `build` on a new thread, play the stream, and wait for it to start.
    fn spawn<F>(name: &str, build: F) -> Result<Self>
    where
        F: FnOnce() -> std::result::Result<cpal::Stream, String> + Send + 'static,
    {
        let (ready_tx, ready_rx) = std_mpsc::channel::<std::result::Result<(), String>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build() {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(e.to_string()));
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                // Park until the owner goes away.
                let _ = stop_rx.recv();
                drop(stream);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                stop_tx: Some(stop_tx),
                handle: Some(handle),
            }),
            Ok(Err(e)) => Err(TalkbackError::AudioDevice(e)),
            Err(_) => Err(TalkbackError::AudioDevice(format!(
                "{name} thread exited during startup"
            ))),
        }
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Default input device. Drop it to stop capturing.
pub struct Microphone {
    _thread: StreamThread,
}

impl Microphone {
    /// Open the default input device and return it with a gated source.
    ///
    /// While the gate is muted the callback drops captured frames, so
    /// nothing recorded during playback reaches the source.
    pub fn open(config: &AudioConfig, gate: CaptureGate) -> Result<(Self, ChannelSource)> {
        let (audio_tx, source) = ChannelSource::channel(gate.clone());
        let sample_rate = config.input_sample_rate;

        let thread = StreamThread::spawn("talkback-mic", move || {
            let device = cpal::default_host()
                .default_input_device()
                .ok_or_else(|| "No input device available".to_string())?;
            info!(
                device = %device.name().unwrap_or_else(|_| "unknown".into()),
                sample_rate,
                "Opening input device"
            );
            device
                .build_input_stream(
                    &mono_config(sample_rate),
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        if gate.is_muted() {
                            return;
                        }
                        let mut buf = BytesMut::with_capacity(data.len() * 2);
                        for &sample in data {
                            buf.put_i16_le(f32_to_i16(sample));
                        }
                        let _ = audio_tx.send(buf.freeze());
                    },
                    |err| warn!(%err, "Audio input stream error"),
                    None,
                )
                .map_err(|e| e.to_string())
        })?;

        Ok((Self { _thread: thread }, source))
    }
}

/// Default output device, fed through a shared sample queue.
pub struct Speaker {
    queue: Arc<Mutex<VecDeque<i16>>>,
    /// Odd trailing byte from the previous chunk.
    carry: Option<u8>,
    sample_rate: u32,
    _thread: StreamThread,
}

impl Speaker {
    pub fn open(config: &AudioConfig) -> Result<Self> {
        let queue: Arc<Mutex<VecDeque<i16>>> = Arc::new(Mutex::new(VecDeque::new()));
        let playback = Arc::clone(&queue);
        let sample_rate = config.output_sample_rate;

        let thread = StreamThread::spawn("talkback-speaker", move || {
            let device = cpal::default_host()
                .default_output_device()
                .ok_or_else(|| "No output device available".to_string())?;
            info!(
                device = %device.name().unwrap_or_else(|_| "unknown".into()),
                sample_rate,
                "Opening output device"
            );
            device
                .build_output_stream(
                    &mono_config(sample_rate),
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let mut queue = playback.lock().unwrap_or_else(|p| p.into_inner());
                        for out in data.iter_mut() {
                            *out = queue.pop_front().map(i16_to_f32).unwrap_or(0.0);
                        }
                    },
                    |err| warn!(%err, "Audio output stream error"),
                    None,
                )
                .map_err(|e| e.to_string())
        })?;

        Ok(Self {
            queue,
            carry: None,
            sample_rate,
            _thread: thread,
        })
    }

    fn queued(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }
}

#[async_trait]
impl AudioSink for Speaker {
    async fn write(&mut self, chunk: Bytes) -> anyhow::Result<()> {
        let mut bytes: Vec<u8> = Vec::with_capacity(chunk.len() + 1);
        bytes.extend(self.carry.take());
        bytes.extend_from_slice(&chunk);

        let mut pairs = bytes.chunks_exact(2);
        let samples: Vec<i16> = pairs
            .by_ref()
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        self.carry = pairs.remainder().first().copied();

        self.queue
            .lock()
            .map_err(|_| anyhow::anyhow!("Speaker queue poisoned"))?
            .extend(samples);
        Ok(())
    }

    async fn flush(&mut self) -> anyhow::Result<()> {
        self.carry = None;
        let backlog = self.queued() as f64 / self.sample_rate.max(1) as f64;
        let deadline = tokio::time::Instant::now() + Duration::from_secs_f64(backlog) + DRAIN_SLACK;

        while self.queued() > 0 {
            if tokio::time::Instant::now() >= deadline {
                if let Ok(mut queue) = self.queue.lock() {
                    queue.clear();
                }
                anyhow::bail!("Output device stopped draining");
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
        Ok(())
    }
}
