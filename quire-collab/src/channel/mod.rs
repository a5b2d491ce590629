//! Remote update channels.
//!
//! An update channel is an append-only, eventually consistent remote log of
//! CRDT deltas, one log per document. Subscribing first delivers a bounded
//! replay window (the most recent N entries in ascending sequence order),
//! then a [`SubscriptionEvent::ReplayComplete`] marker, then live entries.
//!
//! Channels never retry internally. A dropped connection surfaces as the
//! subscription stream ending; append failures surface as
//! [`TransportError`]. Reconnection and dedup are the caller's job.
//!
//! ## Implementations
//!
//! - [`MemoryLog`] — in-process log with fault injection, used by tests
//! - [`WsUpdateChannel`] — client for the WebSocket relay ([`WsPresence`] carries presence over it)

pub mod memory;
pub mod ws;

pub use memory::{MemoryLog, MemoryLogConfig};
pub use ws::{WsPresence, WsUpdateChannel};

use crate::protocol::{AppendReceipt, DeltaKind, ProtocolError, RemoteDelta};
use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Default number of entries replayed to a new subscriber.
pub const DEFAULT_REPLAY_WINDOW: usize = 100;

/// Item yielded by an [`UpdateSubscription`].
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    Delta(RemoteDelta),
    /// The replay window has been fully delivered.
    ReplayComplete { head_seq: u64 },
}

/// Transport errors.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    /// Remote log not reachable.
    Unavailable(String),
    /// Remote log refused the request.
    Rejected(String),
    /// Connection went away mid-request.
    Closed,
    Protocol(ProtocolError),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(e) => write!(f, "Remote log unavailable: {e}"),
            Self::Rejected(e) => write!(f, "Remote log rejected request: {e}"),
            Self::Closed => write!(f, "Connection closed"),
            Self::Protocol(e) => write!(f, "Protocol error: {e}"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<ProtocolError> for TransportError {
    fn from(e: ProtocolError) -> Self {
        TransportError::Protocol(e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        use tokio_tungstenite::tungstenite::Error as WsError;
        match e {
            WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::Closed,
            other => TransportError::Unavailable(other.to_string()),
        }
    }
}

/// Abstract append-only remote log.
#[async_trait]
pub trait RemoteUpdateChannel: Send + Sync {
    /// Append one entry. Resolves once the log has assigned it a sequence
    /// number. Retrying with the same bytes after an error is always safe.
    async fn append(
        &self,
        doc_id: Uuid,
        participant_id: Uuid,
        kind: DeltaKind,
        payload: &[u8],
    ) -> Result<AppendReceipt, TransportError>;

    /// Open a replay-then-stream subscription.
    async fn subscribe(&self, doc_id: Uuid) -> Result<UpdateSubscription, TransportError>;

    /// Number of entries replayed to a new subscriber.
    fn replay_window(&self) -> usize;
}

/// Live stream of log entries for one document.
///
/// Dropping the subscription releases it as well.
#[derive(Debug)]
pub struct UpdateSubscription {
    doc_id: Uuid,
    rx: Option<mpsc::Receiver<SubscriptionEvent>>,
}

impl UpdateSubscription {
    pub fn new(doc_id: Uuid, rx: mpsc::Receiver<SubscriptionEvent>) -> Self {
        Self { doc_id, rx: Some(rx) }
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    /// Next event, or `None` once the stream closed or was released.
    pub async fn next(&mut self) -> Option<SubscriptionEvent> {
        match self.rx.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    /// Release the stream. Calling it again is a no-op.
    pub fn unsubscribe(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            log::debug!("Unsubscribed from {}", self.doc_id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.rx.is_some()
    }
}

impl Drop for UpdateSubscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
