//! Half-duplex capture gate.
//!
//! One `CaptureGate` is created per session and cloned into the capture
//! source at construction. Reads wait on the gate; the orchestrator mutes it
//! while the assistant is thinking and speaking so the microphone never
//! hears playback.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::trace;

/// Shared mute flag. Clones observe the same state.
#[derive(Debug, Clone)]
pub struct CaptureGate {
    muted: Arc<watch::Sender<bool>>,
}

impl Default for CaptureGate {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureGate {
    /// Create an open (unmuted) gate.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { muted: Arc::new(tx) }
    }

    /// Close the gate. Returns `false` if it was already muted.
    pub fn mute(&self) -> bool {
        let changed = self.muted.send_if_modified(|muted| {
            let was = *muted;
            *muted = true;
            !was
        });
        if changed {
            trace!("Capture muted");
        }
        changed
    }

    /// Open the gate. Returns `false` if it was already open.
    pub fn resume(&self) -> bool {
        let changed = self.muted.send_if_modified(|muted| {
            let was = *muted;
            *muted = false;
            was
        });
        if changed {
            trace!("Capture resumed");
        }
        changed
    }

    pub fn is_muted(&self) -> bool {
        *self.muted.borrow()
    }

    /// Wait until the gate is open. Returns immediately if it already is.
    pub async fn wait_open(&self) {
        let mut rx = self.muted.subscribe();
        // The sender lives as long as `self`, so this cannot observe a close.
        let _ = rx.wait_for(|muted| !*muted).await;
    }

    /// Mute now and resume when the returned guard is dropped.
    pub fn hold(&self) -> MuteGuard {
        self.mute();
        MuteGuard { gate: self.clone() }
    }
}

/// Keeps capture muted for its lifetime.
#[must_use = "capture resumes as soon as the guard is dropped"]
#[derive(Debug)]
pub struct MuteGuard {
    gate: CaptureGate,
}

impl Drop for MuteGuard {
    fn drop(&mut self) {
        self.gate.resume();
    }
}
