//! Ephemeral presence: who is in the document, where their cursor is, what
//! they have selected.
//!
//! ## Architecture
//!
//! ```text
//! set_local_state / set_cursor / set_selection
//!       │  clock += 1
//!       ▼
//! PresenceUpdate ──► outbound mpsc ──► PresenceTransport::publish
//!                                             │
//!                                             ▼  (hub / relay fan-out)
//! PresenceTransport::subscribe_all ──► AwarenessChannel::apply_remote
//!                                             │  LWW per participant clock
//!                                             ▼
//!                                    on_remote_change listeners
//! ```
//!
//! State is never persisted. A participant disappears on an explicit leave
//! (`state: None`) or when nothing has been heard from it for the TTL; live
//! participants re-publish on a heartbeat so the TTL only fires for
//! vanished ones.
//!
//! ## Conflict policy
//!
//! Last writer wins per participant, ordered by the sender's own monotonic
//! clock. Updates with a clock not greater than the last one seen from that
//! participant are dropped, including after removal (a tombstone keeps the
//! removal clock for one TTL).

use crate::channel::TransportError;
use crate::controller::SessionError;
use async_trait::async_trait;
use parking_lot::Mutex;
use quire_core::{Participant, ParticipantColor};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

// ───────────────────────────────────────────────────────────────────
// Wire types
// ───────────────────────────────────────────────────────────────────

/// Selection as anchor/head byte offsets; head may precede anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TextRange {
    pub anchor: u32,
    pub head: u32,
}

impl TextRange {
    pub fn new(anchor: u32, head: u32) -> Self {
        Self { anchor, head }
    }

    pub fn is_collapsed(&self) -> bool {
        self.anchor == self.head
    }
}

/// Published presence fields of one participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantState {
    pub user_id: String,
    pub display_name: String,
    pub color: ParticipantColor,
    pub cursor: Option<u32>,
    pub selection: Option<TextRange>,
}

impl ParticipantState {
    pub fn from_participant(participant: &Participant) -> Self {
        Self {
            user_id: participant.user_id.clone(),
            display_name: participant.display_name.clone(),
            color: participant.color,
            cursor: None,
            selection: None,
        }
    }

    pub fn with_cursor(mut self, cursor: u32) -> Self {
        self.cursor = Some(cursor);
        self
    }

    pub fn with_selection(mut self, selection: TextRange) -> Self {
        self.selection = Some(selection);
        self
    }
}

/// One presence message. `state: None` means the participant left.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUpdate {
    /// Session id of the publishing participant.
    pub participant_id: Uuid,
    /// Sender-local monotonic clock.
    pub clock: u64,
    pub state: Option<ParticipantState>,
}

// ───────────────────────────────────────────────────────────────────
// Transport
// ───────────────────────────────────────────────────────────────────

/// Fan-out of presence updates between the sessions of one document.
#[async_trait]
pub trait PresenceTransport: Send + Sync {
    async fn publish(&self, doc_id: Uuid, update: PresenceUpdate) -> Result<(), TransportError>;

    /// Stream of every participant's updates, starting with the last known
    /// state of each participant currently present.
    async fn subscribe_all(
        &self,
        doc_id: Uuid,
    ) -> Result<mpsc::Receiver<PresenceUpdate>, TransportError>;
}

struct HubRoom {
    sender: broadcast::Sender<PresenceUpdate>,
    last: HashMap<Uuid, PresenceUpdate>,
}

/// In-process presence fan-out.
///
/// Remembers the last update of each present participant so late
/// subscribers see everyone immediately.
pub struct MemoryPresenceHub {
    rooms: Mutex<HashMap<Uuid, HubRoom>>,
    capacity: usize,
}

impl MemoryPresenceHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            capacity,
        }
    }

    fn publish_now(&self, doc_id: Uuid, update: PresenceUpdate) {
        let mut rooms = self.rooms.lock();
        let room = rooms.entry(doc_id).or_insert_with(|| HubRoom {
            sender: broadcast::channel(self.capacity).0,
            last: HashMap::new(),
        });
        if update.state.is_some() {
            room.last.insert(update.participant_id, update.clone());
        } else {
            room.last.remove(&update.participant_id);
        }
        let _ = room.sender.send(update);
    }

    /// Broadcast a removal for a participant whose publisher went away
    /// without leaving.
    pub fn remove_participant(&self, doc_id: Uuid, participant_id: Uuid) -> bool {
        let clock = {
            let rooms = self.rooms.lock();
            match rooms.get(&doc_id).and_then(|r| r.last.get(&participant_id)) {
                Some(last) => last.clock + 1,
                None => return false,
            }
        };
        self.publish_now(
            doc_id,
            PresenceUpdate {
                participant_id,
                clock,
                state: None,
            },
        );
        true
    }

    /// Participants currently present in a document.
    pub fn present(&self, doc_id: Uuid) -> Vec<Uuid> {
        self.rooms
            .lock()
            .get(&doc_id)
            .map(|r| r.last.keys().copied().collect())
            .unwrap_or_default()
    }
}

impl Default for MemoryPresenceHub {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait]
impl PresenceTransport for MemoryPresenceHub {
    async fn publish(&self, doc_id: Uuid, update: PresenceUpdate) -> Result<(), TransportError> {
        self.publish_now(doc_id, update);
        Ok(())
    }

    async fn subscribe_all(
        &self,
        doc_id: Uuid,
    ) -> Result<mpsc::Receiver<PresenceUpdate>, TransportError> {
        let (known, mut live) = {
            let mut rooms = self.rooms.lock();
            let room = rooms.entry(doc_id).or_insert_with(|| HubRoom {
                sender: broadcast::channel(self.capacity).0,
                last: HashMap::new(),
            });
            (room.last.values().cloned().collect::<Vec<_>>(), room.sender.subscribe())
        };
        let (tx, rx) = mpsc::channel(self.capacity.max(known.len() + 1));

        tokio::spawn(async move {
            for update in known {
                if tx.send(update).await.is_err() {
                    return;
                }
            }
            loop {
                tokio::select! {
                    received = live.recv() => match received {
                        Ok(update) => {
                            if tx.send(update).await.is_err() {
                                return;
                            }
                        }
                        // Presence is lossy; the next heartbeat repairs it
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::debug!("Presence subscriber for {doc_id} skipped {n} updates");
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                    _ = tx.closed() => return,
                }
            }
        });

        Ok(rx)
    }
}

// ───────────────────────────────────────────────────────────────────
// Awareness channel
// ───────────────────────────────────────────────────────────────────

/// Handle returned by [`AwarenessChannel::on_remote_change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AwarenessListenerId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Updated,
    Removed,
}

/// Remote participant change delivered to listeners.
#[derive(Debug, Clone, PartialEq)]
pub struct AwarenessChange {
    pub participant_id: Uuid,
    pub kind: ChangeKind,
    /// New state; for removals, the last known state.
    pub state: ParticipantState,
}

type AwarenessListener = Arc<dyn Fn(&AwarenessChange) + Send + Sync>;

struct RemotePeer {
    state: ParticipantState,
    clock: u64,
    last_seen: Instant,
}

struct AwarenessInner {
    clock: u64,
    local_state: ParticipantState,
    peers: HashMap<Uuid, RemotePeer>,
    /// Clock at which a participant was removed, and when.
    tombstones: HashMap<Uuid, (u64, Instant)>,
}

/// Presence state of one session: the local participant's published fields
/// plus the merged view of every remote participant.
pub struct AwarenessChannel {
    local: Participant,
    ttl: Duration,
    inner: Mutex<AwarenessInner>,
    listeners: Mutex<Vec<(AwarenessListenerId, AwarenessListener)>>,
    next_listener: Mutex<u64>,
    outbound: mpsc::UnboundedSender<PresenceUpdate>,
    closed: AtomicBool,
}

impl AwarenessChannel {
    /// Create the channel and queue the initial publish of the local state.
    ///
    /// The returned receiver yields every update that should be published;
    /// the sync controller drains it into a [`PresenceTransport`].
    pub fn new(local: Participant, ttl: Duration) -> (Self, mpsc::UnboundedReceiver<PresenceUpdate>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let local_state = ParticipantState::from_participant(&local);
        let channel = Self {
            local,
            ttl,
            inner: Mutex::new(AwarenessInner {
                clock: 0,
                local_state,
                peers: HashMap::new(),
                tombstones: HashMap::new(),
            }),
            listeners: Mutex::new(Vec::new()),
            next_listener: Mutex::new(0),
            outbound,
            closed: AtomicBool::new(false),
        };
        channel.publish_local();
        (channel, rx)
    }

    pub fn local_participant(&self) -> &Participant {
        &self.local
    }

    pub fn local_state(&self) -> ParticipantState {
        self.inner.lock().local_state.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    // ─── Local state ──────────────────────────────────────────────────

    /// Replace the published local fields. Last call wins.
    pub fn set_local_state(&self, state: ParticipantState) -> Result<(), SessionError> {
        self.update_local(|local| *local = state)
    }

    pub fn set_cursor(&self, cursor: Option<u32>) -> Result<(), SessionError> {
        self.update_local(|local| local.cursor = cursor)
    }

    pub fn set_selection(&self, selection: Option<TextRange>) -> Result<(), SessionError> {
        self.update_local(|local| local.selection = selection)
    }

    fn update_local<F>(&self, edit: F) -> Result<(), SessionError>
    where
        F: FnOnce(&mut ParticipantState),
    {
        if self.is_closed() {
            return Err(SessionError::Destroyed);
        }
        edit(&mut self.inner.lock().local_state);
        self.publish_local();
        Ok(())
    }

    fn publish_local(&self) {
        let update = {
            let mut inner = self.inner.lock();
            inner.clock += 1;
            PresenceUpdate {
                participant_id: self.local.session_id,
                clock: inner.clock,
                state: Some(inner.local_state.clone()),
            }
        };
        let _ = self.outbound.send(update);
    }

    /// Current local state with a fresh clock, for periodic re-publishing.
    pub fn heartbeat_update(&self) -> Option<PresenceUpdate> {
        if self.is_closed() {
            return None;
        }
        let mut inner = self.inner.lock();
        inner.clock += 1;
        Some(PresenceUpdate {
            participant_id: self.local.session_id,
            clock: inner.clock,
            state: Some(inner.local_state.clone()),
        })
    }

    /// Explicit removal of the local participant.
    pub fn leave_update(&self) -> PresenceUpdate {
        let mut inner = self.inner.lock();
        inner.clock += 1;
        PresenceUpdate {
            participant_id: self.local.session_id,
            clock: inner.clock,
            state: None,
        }
    }

    /// Stop accepting local changes and forget remote participants.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut inner = self.inner.lock();
        inner.peers.clear();
        inner.tombstones.clear();
        drop(inner);
        self.listeners.lock().clear();
    }

    // ─── Remote state ─────────────────────────────────────────────────

    /// Register a callback for remote add/update/remove.
    pub fn on_remote_change<F>(&self, callback: F) -> AwarenessListenerId
    where
        F: Fn(&AwarenessChange) + Send + Sync + 'static,
    {
        let mut next = self.next_listener.lock();
        let id = AwarenessListenerId(*next);
        *next += 1;
        self.listeners.lock().push((id, Arc::new(callback)));
        id
    }

    pub fn remove_listener(&self, id: AwarenessListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Merge one update from the transport.
    ///
    /// Returns the resulting change, if the update was accepted and changed
    /// anything visible.
    pub fn apply_remote(&self, update: PresenceUpdate) -> Option<AwarenessChange> {
        if update.participant_id == self.local.session_id || self.is_closed() {
            return None;
        }

        let change = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let last_clock = inner
                .peers
                .get(&update.participant_id)
                .map(|p| p.clock)
                .or_else(|| inner.tombstones.get(&update.participant_id).map(|(clock, _)| *clock));
            if matches!(last_clock, Some(c) if update.clock <= c) {
                log::trace!(
                    "Stale presence from {} (clock {} <= {:?})",
                    update.participant_id,
                    update.clock,
                    last_clock
                );
                return None;
            }

            match update.state {
                Some(state) => {
                    inner.tombstones.remove(&update.participant_id);
                    let now = Instant::now();
                    match inner.peers.get_mut(&update.participant_id) {
                        Some(peer) => {
                            peer.clock = update.clock;
                            peer.last_seen = now;
                            if peer.state == state {
                                None
                            } else {
                                peer.state = state.clone();
                                Some(AwarenessChange {
                                    participant_id: update.participant_id,
                                    kind: ChangeKind::Updated,
                                    state,
                                })
                            }
                        }
                        None => {
                            inner.peers.insert(
                                update.participant_id,
                                RemotePeer {
                                    state: state.clone(),
                                    clock: update.clock,
                                    last_seen: now,
                                },
                            );
                            Some(AwarenessChange {
                                participant_id: update.participant_id,
                                kind: ChangeKind::Added,
                                state,
                            })
                        }
                    }
                }
                None => {
                    inner
                        .tombstones
                        .insert(update.participant_id, (update.clock, Instant::now()));
                    inner
                        .peers
                        .remove(&update.participant_id)
                        .map(|peer| AwarenessChange {
                            participant_id: update.participant_id,
                            kind: ChangeKind::Removed,
                            state: peer.state,
                        })
                }
            }
        };

        if let Some(change) = &change {
            self.notify(std::slice::from_ref(change));
        }
        change
    }

    /// Remove participants not heard from within the TTL, and forget
    /// tombstones older than the TTL.
    pub fn expire_idle(&self) -> Vec<Uuid> {
        let expired: Vec<AwarenessChange> = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let ttl = self.ttl;
            inner.tombstones.retain(|_, (_, removed)| removed.elapsed() <= ttl);
            let stale: Vec<Uuid> = inner
                .peers
                .iter()
                .filter(|(_, p)| p.last_seen.elapsed() > ttl)
                .map(|(id, _)| *id)
                .collect();
            stale
                .into_iter()
                .filter_map(|id| {
                    let peer = inner.peers.remove(&id)?;
                    inner.tombstones.insert(id, (peer.clock, Instant::now()));
                    Some(AwarenessChange {
                        participant_id: id,
                        kind: ChangeKind::Removed,
                        state: peer.state,
                    })
                })
                .collect()
        };

        if !expired.is_empty() {
            log::debug!("Expired {} idle participants", expired.len());
            self.notify(&expired);
        }
        expired.into_iter().map(|c| c.participant_id).collect()
    }

    fn notify(&self, changes: &[AwarenessChange]) {
        let listeners: Vec<AwarenessListener> =
            self.listeners.lock().iter().map(|(_, l)| l.clone()).collect();
        for change in changes {
            for listener in &listeners {
                listener(change);
            }
        }
    }

    /// Remote participants currently present.
    pub fn participants(&self) -> Vec<(Uuid, ParticipantState)> {
        self.inner
            .lock()
            .peers
            .iter()
            .map(|(id, p)| (*id, p.state.clone()))
            .collect()
    }

    pub fn participant(&self, participant_id: Uuid) -> Option<ParticipantState> {
        self.inner
            .lock()
            .peers
            .get(&participant_id)
            .map(|p| p.state.clone())
    }

    pub fn participant_count(&self) -> usize {
        self.inner.lock().peers.len()
    }

    /// Removed participants whose removal clock is still remembered.
    pub fn tombstone_count(&self) -> usize {
        self.inner.lock().tombstones.len()
    }
}
