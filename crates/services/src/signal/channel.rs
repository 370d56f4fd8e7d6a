use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::envelope::Envelope;
use super::messages::ServerNotification;

/// How long a room-initiated request (e.g. `newConsumer`) waits for the
/// client acknowledgement before giving up.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Frames handed to the socket writer task.
#[derive(Debug)]
pub enum Outbound {
    Frame(String),
    Close,
}

#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    #[error("signaling channel closed")]
    Closed,
    #[error("request timed out")]
    Timeout,
    #[error("peer rejected request ({code}): {reason}")]
    Rejected { code: u16, reason: String },
}

/// Handle to one peer's signaling channel. Cloneable; the socket itself is
/// owned by the transport task, which drains the `Outbound` receiver and
/// feeds responses back through `handle_response`.
#[derive(Clone)]
pub struct PeerChannel {
    inner: Arc<Inner>,
}

struct Inner {
    tx: mpsc::UnboundedSender<Outbound>,
    pending: DashMap<u32, oneshot::Sender<Result<Value, ChannelError>>>,
    next_id: AtomicU32,
    closed: AtomicBool,
}

impl PeerChannel {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Self {
            inner: Arc::new(Inner {
                tx,
                pending: DashMap::new(),
                next_id: AtomicU32::new(1),
                closed: AtomicBool::new(false),
            }),
        };
        (channel, rx)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Sends an already-framed envelope. Errors are logged only; no failure
    /// on this path is ever surfaced to the peer.
    pub fn send(&self, envelope: &Envelope) {
        if self.is_closed() {
            return;
        }
        match serde_json::to_string(envelope) {
            Ok(text) => {
                let _ = self.inner.tx.send(Outbound::Frame(text));
            }
            Err(err) => warn!(%err, "failed to serialize envelope"),
        }
    }

    pub fn notify(&self, notification: &ServerNotification) {
        if self.is_closed() {
            return;
        }
        match serde_json::to_value(notification) {
            Ok(mut value) => {
                value["notification"] = Value::Bool(true);
                let _ = self.inner.tx.send(Outbound::Frame(value.to_string()));
            }
            Err(err) => warn!(%err, "failed to serialize notification"),
        }
    }

    /// Issues a request to the peer and waits for its acknowledgement.
    pub async fn request(&self, method: &str, data: Value) -> Result<Value, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(id, tx);

        let envelope = Envelope::request(id, method, data);
        let text = serde_json::to_string(&envelope).expect("envelope serialization");
        if self.inner.tx.send(Outbound::Frame(text)).is_err() {
            self.inner.pending.remove(&id);
            return Err(ChannelError::Closed);
        }

        match tokio::time::timeout(REQUEST_TIMEOUT, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => {
                self.inner.pending.remove(&id);
                Err(ChannelError::Timeout)
            }
        }
    }

    /// Routes a response frame to the request that is waiting on it.
    pub fn handle_response(
        &self,
        id: u32,
        ok: bool,
        data: Option<Value>,
        error_code: Option<u16>,
        error_reason: Option<String>,
    ) {
        let Some((_, tx)) = self.inner.pending.remove(&id) else {
            debug!(id, "response for unknown request id");
            return;
        };
        let result = if ok {
            Ok(data.unwrap_or(Value::Null))
        } else {
            Err(ChannelError::Rejected {
                code: error_code.unwrap_or(500),
                reason: error_reason.unwrap_or_else(|| "unknown".into()),
            })
        };
        let _ = tx.send(result);
    }

    /// Closes the channel: pending requests fail, the writer task is told to
    /// send a close frame and hang up.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.pending.clear();
        let _ = self.inner.tx.send(Outbound::Close);
    }
}
