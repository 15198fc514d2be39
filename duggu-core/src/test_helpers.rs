//! Test helpers shared by the workspace crates
//!
//! In-memory transports so dispatcher, broadcast and SFU tests run without
//! sockets.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::connection::{Connection, FrameSink};
use crate::models::Envelope;
use crate::{Error, Result};

/// Frame sink that records everything written to it
#[derive(Clone, Default)]
pub struct MemorySink {
    frames: Arc<Mutex<Vec<String>>>,
    failing: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following write fail like a dropped socket.
    pub fn fail_writes(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn recover(&self) {
        self.failing.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn frames(&self) -> Vec<String> {
        self.frames.lock().clone()
    }

    /// Frames that decode as envelopes, in write order
    #[must_use]
    pub fn envelopes(&self) -> Vec<Envelope> {
        self.frames
            .lock()
            .iter()
            .filter_map(|f| Envelope::decode(f).ok())
            .collect()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_frame(&mut self, frame: String) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) || self.is_closed() {
            return Err(Error::Transport("broken pipe".to_string()));
        }
        self.frames.lock().push(frame);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// A connection over a fresh [`MemorySink`], plus the sink to inspect it
#[must_use]
pub fn memory_connection() -> (Connection, MemorySink) {
    let sink = MemorySink::new();
    (Connection::new(sink.clone()), sink)
}
