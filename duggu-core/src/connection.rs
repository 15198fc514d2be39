//! Serialized write handle over one client transport
//!
//! Any number of tasks may hold a [`Connection`]; every frame is written while
//! holding the sink mutex, so frames never interleave. The first failed write
//! marks the connection closed and later writes fail fast.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::models::ErrorMessage;
use crate::{Error, Result};

/// Write half of a duplex message transport
#[async_trait]
pub trait FrameSink: Send {
    async fn send_frame(&mut self, frame: String) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

struct ConnectionInner {
    id: String,
    sink: Mutex<Box<dyn FrameSink>>,
    closed: AtomicBool,
}

/// Cloneable handle to one client's transport
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    pub fn new(sink: impl FrameSink + 'static) -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                id: uuid::Uuid::new_v4().to_string(),
                sink: Mutex::new(Box::new(sink)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Process-local identity of the transport, stable for its lifetime
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Write one complete frame.
    pub async fn write_frame(&self, frame: &str) -> Result<()> {
        if self.is_closed() {
            return Err(Error::Transport("connection closed".to_string()));
        }

        let mut sink = self.inner.sink.lock().await;
        // may have flipped while we waited on the lock
        if self.is_closed() {
            return Err(Error::Transport("connection closed".to_string()));
        }

        match sink.send_frame(frame.to_owned()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.inner.closed.store(true, Ordering::Release);
                debug!(connection_id = %self.inner.id, error = %e, "Frame write failed, marking connection closed");
                Err(match e {
                    Error::Transport(_) => e,
                    other => Error::Transport(other.to_string()),
                })
            }
        }
    }

    pub async fn write_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let frame = serde_json::to_string(value)?;
        self.write_frame(&frame).await
    }

    /// Reply to this connection only with `{"error": message}`.
    pub async fn send_error(&self, message: impl Into<String>) -> Result<()> {
        self.write_json(&ErrorMessage::new(message)).await
    }

    /// Close the underlying transport. Safe to call more than once.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let mut sink = self.inner.sink.lock().await;
        if let Err(e) = sink.close().await {
            debug!(connection_id = %self.inner.id, error = %e, "Transport close failed");
        }
    }

    #[must_use]
    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            id: self.inner.id.clone(),
            inner: Arc::downgrade(&self.inner),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Non-owning reference used where the holder must not keep a socket alive
#[derive(Clone, Debug)]
pub struct WeakConnection {
    id: String,
    inner: Weak<ConnectionInner>,
}

impl WeakConnection {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn upgrade(&self) -> Option<Connection> {
        self.inner.upgrade().map(|inner| Connection { inner })
    }
}
