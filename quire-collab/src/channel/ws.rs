//! WebSocket client for the relay (see [`crate::relay`]).
//!
//! Appends share one lazily opened connection and wait for the matching
//! `AppendAck`. Each subscription opens its own connection; a reader task
//! forwards entries into the subscription until either side goes away.
//! Nothing here reconnects on its own: a failed append drops the shared
//! connection so the next call dials again, and a lost subscription
//! connection ends the stream.

use super::{RemoteUpdateChannel, SubscriptionEvent, TransportError, UpdateSubscription};
use crate::awareness::{PresenceTransport, PresenceUpdate};
use crate::protocol::{AppendReceipt, DeltaKind, ProtocolError, RelayMessage};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SUBSCRIPTION_BUFFER: usize = 256;

async fn dial(url: &str) -> Result<WsStream, TransportError> {
    let (ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| TransportError::Unavailable(e.to_string()))?;
    Ok(ws)
}

async fn send_message(ws: &mut WsStream, msg: &RelayMessage) -> Result<(), TransportError> {
    let encoded = msg.encode()?;
    ws.send(Message::Binary(encoded.into())).await?;
    Ok(())
}

/// Next relay message, skipping control frames. `None` once closed.
async fn read_message(ws: &mut WsStream) -> Option<Result<RelayMessage, TransportError>> {
    while let Some(frame) = ws.next().await {
        match frame {
            Ok(Message::Binary(data)) => return Some(RelayMessage::decode(&data).map_err(Into::into)),
            Ok(Message::Close(_)) => return None,
            Ok(_) => continue,
            Err(e) => return Some(Err(e.into())),
        }
    }
    None
}

/// [`RemoteUpdateChannel`] backed by a relay.
pub struct WsUpdateChannel {
    url: String,
    replay_window: usize,
    request_timeout: Duration,
    append_conn: Mutex<Option<WsStream>>,
    next_request: AtomicU64,
}

impl WsUpdateChannel {
    /// `url` like `ws://127.0.0.1:9100`; `replay_window` must match the
    /// relay's configuration.
    pub fn new(url: impl Into<String>, replay_window: usize) -> Self {
        Self {
            url: url.into(),
            replay_window,
            request_timeout: Duration::from_secs(5),
            append_conn: Mutex::new(None),
            next_request: AtomicU64::new(1),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn await_ack(ws: &mut WsStream, request_id: u64) -> Result<AppendReceipt, TransportError> {
        loop {
            match read_message(ws).await {
                Some(Ok(RelayMessage::AppendAck { request_id: id, receipt })) if id == request_id => {
                    return Ok(receipt);
                }
                Some(Ok(RelayMessage::AppendRejected { request_id: id, reason })) if id == request_id => {
                    return Err(TransportError::Rejected(reason));
                }
                Some(Ok(other)) => {
                    log::trace!("Ignoring {other:?} on append connection");
                }
                Some(Err(e)) => return Err(e),
                None => return Err(TransportError::Closed),
            }
        }
    }
}

#[async_trait]
impl RemoteUpdateChannel for WsUpdateChannel {
    async fn append(
        &self,
        doc_id: Uuid,
        participant_id: Uuid,
        kind: DeltaKind,
        payload: &[u8],
    ) -> Result<AppendReceipt, TransportError> {
        let mut conn = self.append_conn.lock().await;
        if conn.is_none() {
            *conn = Some(dial(&self.url).await?);
        }
        let ws = conn.as_mut().ok_or(TransportError::Closed)?;

        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let msg = RelayMessage::Append {
            request_id,
            doc_id,
            participant_id,
            kind,
            payload: payload.to_vec(),
        };

        let exchange = async {
            send_message(ws, &msg).await?;
            Self::await_ack(ws, request_id).await
        };
        let result = match tokio::time::timeout(self.request_timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Unavailable("append timed out".into())),
        };

        if matches!(&result, Err(e) if !matches!(e, TransportError::Rejected(_))) {
            // Connection state unknown; dial fresh next time
            *conn = None;
        }
        result
    }

    async fn subscribe(&self, doc_id: Uuid) -> Result<UpdateSubscription, TransportError> {
        let mut ws = dial(&self.url).await?;
        send_message(&mut ws, &RelayMessage::Subscribe { doc_id }).await?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    incoming = read_message(&mut ws) => {
                        let event = match incoming {
                            Some(Ok(RelayMessage::Entry { delta, .. })) => SubscriptionEvent::Delta(delta),
                            Some(Ok(RelayMessage::ReplayComplete { head_seq, .. })) => {
                                SubscriptionEvent::ReplayComplete { head_seq }
                            }
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => {
                                log::debug!("Subscription to {doc_id} failed: {e}");
                                break;
                            }
                            None => break,
                        };
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    _ = tx.closed() => break,
                }
            }
            let _ = ws.close(None).await;
        });

        Ok(UpdateSubscription::new(doc_id, rx))
    }

    fn replay_window(&self) -> usize {
        self.replay_window
    }
}

/// [`PresenceTransport`] backed by a relay.
pub struct WsPresence {
    url: String,
    publish_conn: Mutex<Option<WsStream>>,
}

impl WsPresence {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            publish_conn: Mutex::new(None),
        }
    }
}

#[async_trait]
impl PresenceTransport for WsPresence {
    async fn publish(&self, doc_id: Uuid, update: PresenceUpdate) -> Result<(), TransportError> {
        let mut conn = self.publish_conn.lock().await;
        if conn.is_none() {
            *conn = Some(dial(&self.url).await?);
        }
        let ws = conn.as_mut().ok_or(TransportError::Closed)?;

        let result = send_message(ws, &RelayMessage::Publish { doc_id, update }).await;
        if result.is_err() {
            *conn = None;
        }
        result
    }

    async fn subscribe_all(
        &self,
        doc_id: Uuid,
    ) -> Result<mpsc::Receiver<PresenceUpdate>, TransportError> {
        let mut ws = dial(&self.url).await?;
        send_message(&mut ws, &RelayMessage::WatchPresence { doc_id }).await?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    incoming = read_message(&mut ws) => match incoming {
                        Some(Ok(RelayMessage::Presence { update, .. })) => {
                            if tx.send(update).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(_)) => {}
                        Some(Err(TransportError::Protocol(ProtocolError::DeserializationError(e)))) => {
                            log::warn!("Dropping undecodable presence frame: {e}");
                        }
                        Some(Err(_)) | None => break,
                    },
                    _ = tx.closed() => break,
                }
            }
            let _ = ws.close(None).await;
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_to_unreachable_relay_fails() {
        // Port 9 (discard) is essentially never a WebSocket server
        let channel = WsUpdateChannel::new("ws://127.0.0.1:9", 100)
            .with_request_timeout(Duration::from_millis(500));
        let result = channel
            .append(Uuid::new_v4(), Uuid::new_v4(), DeltaKind::Update, b"x")
            .await;
        assert!(matches!(result, Err(TransportError::Unavailable(_))));
        assert!(channel.subscribe(Uuid::new_v4()).await.is_err());
        assert_eq!(channel.replay_window(), 100);
    }
}
