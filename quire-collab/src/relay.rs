//! WebSocket relay hosting the shared update log and presence fan-out.
//!
//! Architecture:
//! ```text
//! WsUpdateChannel A ──┐                    ┌── MemoryLog (per-doc rooms)
//!                     ├── LogRelay ────────┤      │ seq, replay window
//! WsUpdateChannel B ──┘   (select loop     │      └── DocumentStore (RocksDB, CF "log")
//!                          per connection) │
//!                                          └── MemoryPresenceHub
//! ```
//!
//! The relay never merges documents; it orders opaque payloads. Each
//! connection may append, hold one update subscription and one presence
//! watch. When a connection goes away, every participant it published
//! presence for is announced as gone.

use crate::awareness::{MemoryPresenceHub, PresenceTransport, PresenceUpdate};
use crate::channel::{
    MemoryLog, MemoryLogConfig, SubscriptionEvent, TransportError, UpdateSubscription,
    DEFAULT_REPLAY_WINDOW,
};
use crate::protocol::RelayMessage;
use crate::storage::{DocumentStore, StoreConfig, StoreError};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Entries replayed to a new subscriber
    pub replay_window: usize,
    /// Entries kept per document (memory and disk)
    pub retention: usize,
    /// Live entries buffered per subscriber
    pub broadcast_capacity: usize,
    /// Log persistence path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Prune the persisted log every this many sequence numbers
    pub prune_interval: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9100".to_string(),
            replay_window: DEFAULT_REPLAY_WINDOW,
            retention: 1000,
            broadcast_capacity: 1024,
            storage_path: None,
            prune_interval: 64,
        }
    }
}

impl RelayConfig {
    /// Ephemeral port, small retention.
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            retention: 200,
            broadcast_capacity: 256,
            ..Self::default()
        }
    }
}

/// Relay statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub appends: u64,
    pub appends_rejected: u64,
    pub persisted_entries: u64,
    pub pruned_entries: u64,
}

/// State shared by every connection task.
#[derive(Clone)]
struct RelayContext {
    log: Arc<MemoryLog>,
    presence: Arc<MemoryPresenceHub>,
    store: Option<Arc<DocumentStore>>,
    stats: Arc<RwLock<RelayStats>>,
    retention: u64,
    prune_interval: u64,
}

/// Per-connection state.
#[derive(Default)]
struct Connection {
    entries: Option<UpdateSubscription>,
    presence: Option<(Uuid, mpsc::Receiver<PresenceUpdate>)>,
    /// (doc, participant) pairs this connection published presence for.
    published: HashSet<(Uuid, Uuid)>,
}

/// The relay server.
pub struct LogRelay {
    config: RelayConfig,
    ctx: RelayContext,
}

impl LogRelay {
    /// Create a relay; opens the log store when `storage_path` is set.
    pub fn new(config: RelayConfig) -> Result<Self, StoreError> {
        let store = match &config.storage_path {
            Some(path) => Some(Arc::new(DocumentStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?)),
            None => None,
        };
        let log = Arc::new(MemoryLog::new(MemoryLogConfig {
            replay_window: config.replay_window,
            retention: config.retention,
            broadcast_capacity: config.broadcast_capacity,
        }));

        let ctx = RelayContext {
            log,
            presence: Arc::new(MemoryPresenceHub::new(config.broadcast_capacity)),
            store,
            stats: Arc::new(RwLock::new(RelayStats::default())),
            retention: config.retention as u64,
            prune_interval: config.prune_interval.max(1),
        };
        Ok(Self { config, ctx })
    }

    /// Create with persistence enabled at the given path.
    pub fn with_storage(bind_addr: impl Into<String>, path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::new(RelayConfig {
            bind_addr: bind_addr.into(),
            storage_path: Some(path.into()),
            ..RelayConfig::default()
        })
    }

    /// Reload persisted log entries so sequence numbers continue where
    /// they left off. Returns the number of documents restored.
    pub async fn recover(&self) -> Result<usize, StoreError> {
        let store = match &self.ctx.store {
            Some(s) => s,
            None => return Ok(0),
        };

        let doc_ids = store.log_documents()?;
        for doc_id in &doc_ids {
            let entries = store.load_log(*doc_id, 0)?;
            let count = entries.len();
            self.ctx.log.restore(*doc_id, entries);
            log::info!(
                "Recovered {count} log entries for {doc_id} (head {})",
                self.ctx.log.head_seq(*doc_id)
            );
        }
        Ok(doc_ids.len())
    }

    /// Recover, bind `bind_addr` and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let recovered = self.recover().await?;
        if recovered > 0 {
            log::info!("Recovered {recovered} documents from persistent storage");
        }

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Relay listening on {}", listener.local_addr()?);
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let ctx = self.ctx.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, ctx).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    pub async fn stats(&self) -> RelayStats {
        self.ctx.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn log(&self) -> &Arc<MemoryLog> {
        &self.ctx.log
    }

    pub fn presence(&self) -> &Arc<MemoryPresenceHub> {
        &self.ctx.presence
    }

    /// Get the persistent store (if configured).
    pub fn store(&self) -> Option<&Arc<DocumentStore>> {
        self.ctx.store.as_ref()
    }
}

// ───────────────────────────────────────────────────────────────────
// Connection handling
// ───────────────────────────────────────────────────────────────────

async fn send(sink: &mut WsSink, msg: &RelayMessage) -> Result<(), BoxError> {
    let encoded = msg.encode()?;
    sink.send(Message::Binary(encoded.into())).await?;
    Ok(())
}

async fn next_entry(entries: &mut Option<UpdateSubscription>) -> Option<(Uuid, SubscriptionEvent)> {
    match entries {
        Some(sub) => {
            let doc_id = sub.doc_id();
            sub.next().await.map(|event| (doc_id, event))
        }
        None => std::future::pending().await,
    }
}

async fn next_presence(
    presence: &mut Option<(Uuid, mpsc::Receiver<PresenceUpdate>)>,
) -> Option<(Uuid, PresenceUpdate)> {
    match presence {
        Some((doc_id, rx)) => rx.recv().await.map(|update| (*doc_id, update)),
        None => std::future::pending().await,
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, ctx: RelayContext) -> Result<(), BoxError> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    log::info!("WebSocket connection established from {addr}");

    {
        let mut s = ctx.stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let mut conn = Connection::default();
    let result = async {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Binary(data))) => {
                        {
                            let mut s = ctx.stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += data.len() as u64;
                        }
                        match RelayMessage::decode(&data) {
                            Ok(request) => {
                                if let Some(reply) = ctx.handle_request(request, &mut conn).await? {
                                    send(&mut ws_sender, &reply).await?;
                                }
                            }
                            Err(e) => log::warn!("Failed to decode message from {addr}: {e}"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection closed from {addr}");
                        break;
                    }
                    Some(Err(e)) => {
                        log::warn!("WebSocket error from {addr}: {e}");
                        break;
                    }
                    _ => {}
                },

                event = next_entry(&mut conn.entries) => match event {
                    Some((doc_id, SubscriptionEvent::Delta(delta))) => {
                        send(&mut ws_sender, &RelayMessage::Entry { doc_id, delta }).await?;
                    }
                    Some((doc_id, SubscriptionEvent::ReplayComplete { head_seq })) => {
                        send(&mut ws_sender, &RelayMessage::ReplayComplete { doc_id, head_seq }).await?;
                    }
                    None => {
                        // Subscriber lagged out; closing makes the client resubscribe
                        log::info!("Update stream for {addr} ended, closing connection");
                        break;
                    }
                },

                update = next_presence(&mut conn.presence) => match update {
                    Some((doc_id, update)) => {
                        send(&mut ws_sender, &RelayMessage::Presence { doc_id, update }).await?;
                    }
                    None => conn.presence = None,
                },
            }
        }
        Ok::<(), BoxError>(())
    }
    .await;

    // Cleanup: announce departures the client never sent
    for (doc_id, participant_id) in conn.published.drain() {
        if ctx.presence.remove_participant(doc_id, participant_id) {
            log::info!("Presence: {participant_id} dropped from {doc_id} (connection closed)");
        }
    }
    if let Some(mut sub) = conn.entries.take() {
        sub.unsubscribe();
    }
    let _ = ws_sender.close().await;

    {
        let mut s = ctx.stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
    }
    result
}

impl RelayContext {
    async fn handle_request(
        &self,
        request: RelayMessage,
        conn: &mut Connection,
    ) -> Result<Option<RelayMessage>, TransportError> {
        match request {
            RelayMessage::Append {
                request_id,
                doc_id,
                participant_id,
                kind,
                payload,
            } => match self.log.append_entry(doc_id, participant_id, kind, &payload) {
                Ok(delta) => {
                    self.stats.write().await.appends += 1;
                    self.persist(doc_id, &delta).await;
                    Ok(Some(RelayMessage::AppendAck {
                        request_id,
                        receipt: crate::protocol::AppendReceipt {
                            seq: delta.seq,
                            timestamp_ms: delta.timestamp_ms,
                        },
                    }))
                }
                Err(e) => {
                    self.stats.write().await.appends_rejected += 1;
                    log::warn!("Rejected append to {doc_id}: {e}");
                    Ok(Some(RelayMessage::AppendRejected {
                        request_id,
                        reason: e.to_string(),
                    }))
                }
            },

            RelayMessage::Subscribe { doc_id } => {
                if let Some(mut previous) = conn.entries.take() {
                    previous.unsubscribe();
                }
                conn.entries = Some(self.log.open_subscription(doc_id)?);
                log::debug!("Subscription opened for {doc_id}");
                Ok(None)
            }

            RelayMessage::Publish { doc_id, update } => {
                let key = (doc_id, update.participant_id);
                match &update.state {
                    Some(state) => {
                        if conn.published.insert(key) {
                            log::info!("Presence: {} joined {doc_id}", state.display_name);
                        } else {
                            log::trace!("Presence: update from {} in {doc_id}", update.participant_id);
                        }
                    }
                    None => {
                        conn.published.remove(&key);
                        log::info!("Presence: {} left {doc_id}", update.participant_id);
                    }
                }
                self.presence.publish(doc_id, update).await?;
                Ok(None)
            }

            RelayMessage::WatchPresence { doc_id } => {
                let rx = self.presence.subscribe_all(doc_id).await?;
                conn.presence = Some((doc_id, rx));
                Ok(None)
            }

            RelayMessage::Ping => Ok(Some(RelayMessage::Pong)),

            other => {
                log::debug!("Unhandled message from client: {other:?}");
                Ok(None)
            }
        }
    }

    /// Write an appended entry through to disk and prune behind retention.
    async fn persist(&self, doc_id: Uuid, delta: &crate::protocol::RemoteDelta) {
        let Some(store) = &self.store else {
            return;
        };
        if let Err(e) = store.append_log_entry(doc_id, delta) {
            log::error!("Failed to persist seq {} for {doc_id}: {e}", delta.seq);
            return;
        }
        let mut pruned = 0;
        if delta.seq % self.prune_interval == 0 && delta.seq > self.retention {
            match store.prune_log(doc_id, delta.seq - self.retention + 1) {
                Ok(n) => pruned = n,
                Err(e) => log::warn!("Failed to prune log of {doc_id}: {e}"),
            }
        }

        let mut s = self.stats.write().await;
        s.persisted_entries += 1;
        s.pruned_entries += pruned;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::DeltaKind;

    #[test]
    fn test_relay_config_default() {
        let config = RelayConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9100");
        assert_eq!(config.replay_window, 100);
        assert_eq!(config.retention, 1000);
        assert!(config.storage_path.is_none());
    }

    #[tokio::test]
    async fn test_relay_stats_initial() {
        let relay = LogRelay::new(RelayConfig::for_testing()).unwrap();
        assert_eq!(relay.stats().await, RelayStats::default());
        assert!(relay.store().is_none());
        assert_eq!(relay.recover().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_append_request_is_acked_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let relay = LogRelay::with_storage("127.0.0.1:0", dir.path().join("db")).unwrap();
        let doc = Uuid::new_v4();
        let mut conn = Connection::default();

        let reply = relay
            .ctx
            .handle_request(
                RelayMessage::Append {
                    request_id: 7,
                    doc_id: doc,
                    participant_id: Uuid::new_v4(),
                    kind: DeltaKind::Update,
                    payload: vec![1, 2, 3],
                },
                &mut conn,
            )
            .await
            .unwrap();

        match reply {
            Some(RelayMessage::AppendAck { request_id, receipt }) => {
                assert_eq!(request_id, 7);
                assert_eq!(receipt.seq, 1);
            }
            other => panic!("unexpected reply {other:?}"),
        }
        let stored = relay.store().unwrap().load_log(doc, 0).unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].payload, vec![1, 2, 3]);
        assert_eq!(relay.stats().await.persisted_entries, 1);
    }

    #[tokio::test]
    async fn test_persisted_log_is_pruned_behind_retention() {
        let dir = tempfile::tempdir().unwrap();
        let relay = LogRelay::new(RelayConfig {
            storage_path: Some(dir.path().join("db")),
            retention: 10,
            prune_interval: 8,
            ..RelayConfig::for_testing()
        })
        .unwrap();
        let doc = Uuid::new_v4();
        let mut conn = Connection::default();

        for i in 0..32u64 {
            relay
                .ctx
                .handle_request(
                    RelayMessage::Append {
                        request_id: i,
                        doc_id: doc,
                        participant_id: Uuid::nil(),
                        kind: DeltaKind::Update,
                        payload: vec![i as u8],
                    },
                    &mut conn,
                )
                .await
                .unwrap();
        }

        // Last prune at seq 32 keeps 23..=32
        let stored = relay.store().unwrap().load_log(doc, 0).unwrap();
        assert_eq!(stored.first().map(|d| d.seq), Some(23));
        assert_eq!(stored.len(), 10);
    }

    #[tokio::test]
    async fn test_recovery_continues_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("db");
        let doc = Uuid::new_v4();

        {
            let relay = LogRelay::with_storage("127.0.0.1:0", &db_path).unwrap();
            let mut conn = Connection::default();
            for i in 0..3u8 {
                relay
                    .ctx
                    .handle_request(
                        RelayMessage::Append {
                            request_id: u64::from(i),
                            doc_id: doc,
                            participant_id: Uuid::nil(),
                            kind: DeltaKind::Update,
                            payload: vec![i],
                        },
                        &mut conn,
                    )
                    .await
                    .unwrap();
            }
        }

        let relay = LogRelay::with_storage("127.0.0.1:0", &db_path).unwrap();
        assert_eq!(relay.recover().await.unwrap(), 1);
        assert_eq!(relay.log().head_seq(doc), 3);
        let entries = relay.log().entries(doc);
        assert_eq!(entries.iter().map(|d| d.payload[0]).collect::<Vec<_>>(), vec![0, 1, 2]);

        let delta = relay
            .log()
            .append_entry(doc, Uuid::nil(), DeltaKind::Update, &[9])
            .unwrap();
        assert_eq!(delta.seq, 4);
    }

    #[tokio::test]
    async fn test_ping_pong() {
        let relay = LogRelay::new(RelayConfig::for_testing()).unwrap();
        let mut conn = Connection::default();
        let reply = relay.ctx.handle_request(RelayMessage::Ping, &mut conn).await.unwrap();
        assert_eq!(reply, Some(RelayMessage::Pong));
    }
}
