//! In-process remote log.
//!
//! One room per document. Appends take the room lock, assign the next
//! sequence number, push onto a bounded ring of entries and fan out through a
//! tokio broadcast channel. Subscribers snapshot the replay window and
//! subscribe to the broadcast under the same lock, so no entry is ever both
//! replayed and streamed, or missed between the two.
//!
//! ```text
//! append ──► Mutex<LogRoom> ──┬──► entries (VecDeque, last `retention`)
//!                             └──► broadcast::Sender<Arc<RemoteDelta>>
//!                                         │
//! subscribe ──► forward task: replay window → ReplayComplete → live
//! ```
//!
//! Fault injection (`set_available`, `fail_next_appends`, `disconnect_all`)
//! lets tests drive the sync controller through offline and reconnect paths.

use super::{RemoteUpdateChannel, SubscriptionEvent, TransportError, UpdateSubscription};
use crate::protocol::{now_ms, AppendReceipt, DeltaKind, RemoteDelta};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use uuid::Uuid;

/// Memory log configuration.
#[derive(Debug, Clone)]
pub struct MemoryLogConfig {
    /// Entries replayed to a new subscriber.
    pub replay_window: usize,
    /// Entries kept per document.
    pub retention: usize,
    /// Live entries buffered per subscriber before it lags out.
    pub broadcast_capacity: usize,
}

impl Default for MemoryLogConfig {
    fn default() -> Self {
        Self {
            replay_window: super::DEFAULT_REPLAY_WINDOW,
            retention: 1000,
            broadcast_capacity: 1024,
        }
    }
}

impl MemoryLogConfig {
    /// Small retention so pruning is exercised.
    pub fn for_testing() -> Self {
        Self {
            replay_window: super::DEFAULT_REPLAY_WINDOW,
            retention: 200,
            broadcast_capacity: 256,
        }
    }
}

/// Log statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryLogStats {
    pub entries_appended: u64,
    pub appends_failed: u64,
    pub subscriptions_opened: u64,
    pub documents: usize,
}

struct LogRoom {
    entries: VecDeque<RemoteDelta>,
    next_seq: u64,
    sender: broadcast::Sender<Arc<RemoteDelta>>,
}

impl LogRoom {
    fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            entries: VecDeque::new(),
            next_seq: 1,
            sender,
        }
    }

    fn head_seq(&self) -> u64 {
        self.next_seq - 1
    }

    fn recent(&self, window: usize) -> Vec<RemoteDelta> {
        let skip = self.entries.len().saturating_sub(window);
        self.entries.iter().skip(skip).cloned().collect()
    }
}

/// Shared in-process append-only log.
pub struct MemoryLog {
    config: MemoryLogConfig,
    rooms: Mutex<HashMap<Uuid, LogRoom>>,
    available: AtomicBool,
    fail_appends: AtomicUsize,
    /// Bumped to sever every open subscription.
    generation: watch::Sender<u64>,
    appended: AtomicU64,
    failed: AtomicU64,
    subscriptions: AtomicU64,
}

impl MemoryLog {
    pub fn new(config: MemoryLogConfig) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            config,
            rooms: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            fail_appends: AtomicUsize::new(0),
            generation,
            appended: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            subscriptions: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &MemoryLogConfig {
        &self.config
    }

    // ─── Fault injection ──────────────────────────────────────────────

    /// Take the log offline (appends and subscribes fail, open streams are
    /// closed) or bring it back.
    pub fn set_available(&self, available: bool) {
        let was = self.available.swap(available, Ordering::SeqCst);
        if was && !available {
            self.disconnect_all();
        }
        log::info!("Memory log {}", if available { "available" } else { "unavailable" });
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Fail the next `n` appends with a transient error.
    pub fn fail_next_appends(&self, n: usize) {
        self.fail_appends.store(n, Ordering::SeqCst);
    }

    /// Close every open subscription stream.
    pub fn disconnect_all(&self) {
        self.generation.send_modify(|g| *g += 1);
    }

    // ─── Log operations ───────────────────────────────────────────────

    /// Append an entry and return it as stored.
    pub fn append_entry(
        &self,
        doc_id: Uuid,
        participant_id: Uuid,
        kind: DeltaKind,
        payload: &[u8],
    ) -> Result<RemoteDelta, TransportError> {
        if !self.is_available() {
            self.failed.fetch_add(1, Ordering::Relaxed);
            return Err(TransportError::Unavailable("memory log offline".into()));
        }
        let injected = self
            .fail_appends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            self.failed.fetch_add(1, Ordering::Relaxed);
            return Err(TransportError::Unavailable("injected append failure".into()));
        }

        let mut rooms = self.rooms.lock();
        let room = rooms
            .entry(doc_id)
            .or_insert_with(|| LogRoom::new(self.config.broadcast_capacity));

        let delta = RemoteDelta {
            seq: room.next_seq,
            timestamp_ms: now_ms(),
            participant_id,
            kind,
            payload: payload.to_vec(),
        };
        room.next_seq += 1;
        room.entries.push_back(delta.clone());
        while room.entries.len() > self.config.retention {
            room.entries.pop_front();
        }
        // No live subscribers is fine
        let _ = room.sender.send(Arc::new(delta.clone()));
        self.appended.fetch_add(1, Ordering::Relaxed);

        log::trace!("Appended seq {} to {doc_id} ({} bytes)", delta.seq, delta.payload.len());
        Ok(delta)
    }

    /// Seed a document's log, e.g. from durable storage on relay startup.
    /// Entries must be in ascending sequence order.
    pub fn restore(&self, doc_id: Uuid, entries: Vec<RemoteDelta>) {
        let mut rooms = self.rooms.lock();
        let room = rooms
            .entry(doc_id)
            .or_insert_with(|| LogRoom::new(self.config.broadcast_capacity));
        for delta in entries {
            if delta.seq < room.next_seq {
                continue;
            }
            room.next_seq = delta.seq + 1;
            room.entries.push_back(delta);
        }
        while room.entries.len() > self.config.retention {
            room.entries.pop_front();
        }
    }

    /// All retained entries of a document.
    pub fn entries(&self, doc_id: Uuid) -> Vec<RemoteDelta> {
        self.rooms
            .lock()
            .get(&doc_id)
            .map(|room| room.entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Highest sequence number assigned for a document (0 if none).
    pub fn head_seq(&self, doc_id: Uuid) -> u64 {
        self.rooms.lock().get(&doc_id).map(LogRoom::head_seq).unwrap_or(0)
    }

    pub fn documents(&self) -> Vec<Uuid> {
        self.rooms.lock().keys().copied().collect()
    }

    pub fn stats(&self) -> MemoryLogStats {
        MemoryLogStats {
            entries_appended: self.appended.load(Ordering::Relaxed),
            appends_failed: self.failed.load(Ordering::Relaxed),
            subscriptions_opened: self.subscriptions.load(Ordering::Relaxed),
            documents: self.rooms.lock().len(),
        }
    }

    /// Open a subscription without going through the trait object.
    pub fn open_subscription(&self, doc_id: Uuid) -> Result<UpdateSubscription, TransportError> {
        if !self.is_available() {
            return Err(TransportError::Unavailable("memory log offline".into()));
        }

        let (replay, mut live, head_seq) = {
            let mut rooms = self.rooms.lock();
            let room = rooms
                .entry(doc_id)
                .or_insert_with(|| LogRoom::new(self.config.broadcast_capacity));
            (
                room.recent(self.config.replay_window),
                room.sender.subscribe(),
                room.head_seq(),
            )
        };
        let mut generation = self.generation.subscribe();
        let (tx, rx) = mpsc::channel(self.config.broadcast_capacity.max(1));
        self.subscriptions.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(async move {
            for delta in replay {
                if tx.send(SubscriptionEvent::Delta(delta)).await.is_err() {
                    return;
                }
            }
            if tx
                .send(SubscriptionEvent::ReplayComplete { head_seq })
                .await
                .is_err()
            {
                return;
            }

            loop {
                tokio::select! {
                    received = live.recv() => match received {
                        Ok(delta) => {
                            let event = SubscriptionEvent::Delta(delta.as_ref().clone());
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Subscriber to {doc_id} lagged by {n} entries, closing stream");
                            return;
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                    _ = generation.changed() => {
                        log::debug!("Subscription to {doc_id} severed");
                        return;
                    }
                    _ = tx.closed() => return,
                }
            }
        });

        Ok(UpdateSubscription::new(doc_id, rx))
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new(MemoryLogConfig::default())
    }
}

#[async_trait]
impl RemoteUpdateChannel for MemoryLog {
    async fn append(
        &self,
        doc_id: Uuid,
        participant_id: Uuid,
        kind: DeltaKind,
        payload: &[u8],
    ) -> Result<AppendReceipt, TransportError> {
        let delta = self.append_entry(doc_id, participant_id, kind, payload)?;
        Ok(AppendReceipt {
            seq: delta.seq,
            timestamp_ms: delta.timestamp_ms,
        })
    }

    async fn subscribe(&self, doc_id: Uuid) -> Result<UpdateSubscription, TransportError> {
        self.open_subscription(doc_id)
    }

    fn replay_window(&self) -> usize {
        self.config.replay_window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn next_event(sub: &mut UpdateSubscription) -> SubscriptionEvent {
        timeout(Duration::from_secs(2), sub.next())
            .await
            .expect("timed out waiting for event")
            .expect("stream closed")
    }

    #[tokio::test]
    async fn test_sequence_numbers_increase() {
        let log = MemoryLog::default();
        let doc = Uuid::new_v4();
        let p = Uuid::new_v4();

        let a = log.append(doc, p, DeltaKind::Update, b"a").await.unwrap();
        let b = log.append(doc, p, DeltaKind::Update, b"b").await.unwrap();
        assert_eq!(a.seq, 1);
        assert_eq!(b.seq, 2);
        assert_eq!(log.head_seq(doc), 2);
        // Other documents have independent sequences
        let other = log.append(Uuid::new_v4(), p, DeltaKind::Update, b"c").await.unwrap();
        assert_eq!(other.seq, 1);
    }

    #[tokio::test]
    async fn test_replay_window_then_live() {
        let log = MemoryLog::new(MemoryLogConfig {
            replay_window: 3,
            ..MemoryLogConfig::default()
        });
        let doc = Uuid::new_v4();
        let p = Uuid::new_v4();
        for i in 0..5u8 {
            log.append_entry(doc, p, DeltaKind::Update, &[i]).unwrap();
        }

        let mut sub = log.subscribe(doc).await.unwrap();
        let mut replayed = Vec::new();
        loop {
            match next_event(&mut sub).await {
                SubscriptionEvent::Delta(d) => replayed.push(d.seq),
                SubscriptionEvent::ReplayComplete { head_seq } => {
                    assert_eq!(head_seq, 5);
                    break;
                }
            }
        }
        assert_eq!(replayed, vec![3, 4, 5]);

        log.append_entry(doc, p, DeltaKind::Update, &[9]).unwrap();
        match next_event(&mut sub).await {
            SubscriptionEvent::Delta(d) => {
                assert_eq!(d.seq, 6);
                assert_eq!(d.payload, vec![9]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_retention_prunes_oldest() {
        let log = MemoryLog::new(MemoryLogConfig {
            retention: 10,
            ..MemoryLogConfig::default()
        });
        let doc = Uuid::new_v4();
        for i in 0..25u8 {
            log.append_entry(doc, Uuid::nil(), DeltaKind::Update, &[i]).unwrap();
        }
        let entries = log.entries(doc);
        assert_eq!(entries.len(), 10);
        assert_eq!(entries[0].seq, 16);
        assert_eq!(entries[9].seq, 25);
    }

    #[tokio::test]
    async fn test_unavailable_rejects_and_closes_streams() {
        let log = MemoryLog::default();
        let doc = Uuid::new_v4();
        let mut sub = log.subscribe(doc).await.unwrap();
        assert!(matches!(
            next_event(&mut sub).await,
            SubscriptionEvent::ReplayComplete { head_seq: 0 }
        ));

        log.set_available(false);
        let closed = timeout(Duration::from_secs(2), sub.next()).await.unwrap();
        assert_eq!(closed, None);

        assert!(matches!(
            log.append(doc, Uuid::nil(), DeltaKind::Update, b"x").await,
            Err(TransportError::Unavailable(_))
        ));
        assert!(log.subscribe(doc).await.is_err());

        log.set_available(true);
        assert!(log.append(doc, Uuid::nil(), DeltaKind::Update, b"x").await.is_ok());
        assert_eq!(log.stats().appends_failed, 1);
    }

    #[tokio::test]
    async fn test_injected_append_failures() {
        let log = MemoryLog::default();
        let doc = Uuid::new_v4();
        log.fail_next_appends(2);

        assert!(log.append_entry(doc, Uuid::nil(), DeltaKind::Update, b"x").is_err());
        assert!(log.append_entry(doc, Uuid::nil(), DeltaKind::Update, b"x").is_err());
        assert!(log.append_entry(doc, Uuid::nil(), DeltaKind::Update, b"x").is_ok());
        assert_eq!(log.entries(doc).len(), 1);
    }

    #[tokio::test]
    async fn test_restore_continues_sequence() {
        let log = MemoryLog::default();
        let doc = Uuid::new_v4();
        let restored: Vec<RemoteDelta> = (10..13)
            .map(|seq| RemoteDelta {
                seq,
                timestamp_ms: 0,
                participant_id: Uuid::nil(),
                kind: DeltaKind::Update,
                payload: vec![seq as u8],
            })
            .collect();
        log.restore(doc, restored);

        assert_eq!(log.head_seq(doc), 12);
        let next = log.append_entry(doc, Uuid::nil(), DeltaKind::Update, b"n").unwrap();
        assert_eq!(next.seq, 13);
    }

    #[tokio::test]
    async fn test_disconnect_all_then_resubscribe() {
        let log = MemoryLog::default();
        let doc = Uuid::new_v4();
        log.append_entry(doc, Uuid::nil(), DeltaKind::Update, b"a").unwrap();

        let mut sub = log.subscribe(doc).await.unwrap();
        assert!(matches!(next_event(&mut sub).await, SubscriptionEvent::Delta(_)));
        assert!(matches!(next_event(&mut sub).await, SubscriptionEvent::ReplayComplete { .. }));

        log.disconnect_all();
        assert_eq!(timeout(Duration::from_secs(2), sub.next()).await.unwrap(), None);

        // A fresh subscription replays the window again
        let mut again = log.subscribe(doc).await.unwrap();
        assert!(matches!(next_event(&mut again).await, SubscriptionEvent::Delta(d) if d.seq == 1));
        assert_eq!(log.stats().subscriptions_opened, 2);
    }
}
