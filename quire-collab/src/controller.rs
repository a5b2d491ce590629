//! Sync controller: one session per open document.
//!
//! Owns the [`DocumentModel`] of the session and wires it to the shared
//! infrastructure (remote update channel, persistence cache, presence
//! transport) through four background tasks:
//!
//! ```text
//!                   ┌──────────────────────────────┐
//!   local edit ───► │ DocumentModel (Mutex)        │ ◄─── inbound: apply(Remote)
//!                   └──────┬───────────────────────┘          ▲
//!                          │ DocumentChange                   │ filter echo / seen
//!                          ▼                                  │
//!          ┌───────── listener ─────────┐            ┌────────┴─────────┐
//!          │ Local → outbound FIFO      │            │ inbound task     │
//!          │ any   → dirty (Notify)     │            │ subscribe/replay │
//!          └──────┬──────────────┬──────┘            │ reconnect+backoff│
//!                 ▼              ▼                   └────────▲─────────┘
//!         outbound task    writer task                        │
//!         append + retry   coalesced save            RemoteUpdateChannel
//! ```
//!
//! ## States
//!
//! `Disconnected → Connecting → Syncing → Live`, `Live → Reconnecting →
//! Syncing → Live`, and `Destroyed` from anywhere on teardown. The state is
//! published on a `watch` channel and is the only place transport errors
//! surface; editing is possible in every state but `Destroyed`.
//!
//! ## Convergence under a bounded replay window
//!
//! A fresh subscriber only sees the last N log entries. Sessions therefore
//! append a checkpoint entry (their full merged state) once every
//! `checkpoint_interval` log entries while they are live and have authored
//! updates since the last checkpoint, and once after coming live on top of
//! a cached snapshot. Any window of N entries then contains a full state.

use crate::awareness::{AwarenessChannel, PresenceTransport, PresenceUpdate};
use crate::backoff::Backoff;
use crate::channel::{RemoteUpdateChannel, SubscriptionEvent};
use crate::persistence::PersistenceCache;
use crate::protocol::{DeltaKind, RemoteDelta};
use parking_lot::Mutex;
use quire_core::{
    DeltaId, DocumentChange, DocumentModel, FormattedRun, ListenerId, ModelError, Origin,
    Participant,
};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

// ───────────────────────────────────────────────────────────────────
// Public types
// ───────────────────────────────────────────────────────────────────

/// Connection state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    Disconnected,
    Connecting,
    /// Subscribed, draining the replay window.
    Syncing,
    /// Replay drained; streaming live entries.
    Live,
    /// Stream lost; resubscribing with backoff.
    Reconnecting,
    Destroyed,
}

impl SyncState {
    pub fn is_online(&self) -> bool {
        matches!(self, SyncState::Syncing | SyncState::Live)
    }
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// First resubscribe / append retry delay.
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub backoff_factor: u32,
    /// Log entries between checkpoints; `None` disables checkpointing.
    /// Must stay below the channel's replay window.
    pub checkpoint_interval: Option<usize>,
    /// Local presence re-publish period.
    pub heartbeat_interval: Duration,
    /// Remote participants silent for longer are dropped.
    pub presence_ttl: Duration,
    /// Upper bound on each teardown step (writer drain, final save, leave).
    pub shutdown_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backoff_initial: Duration::from_millis(250),
            backoff_max: Duration::from_secs(30),
            backoff_factor: 2,
            checkpoint_interval: Some(50),
            heartbeat_interval: Duration::from_secs(15),
            presence_ttl: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl SyncConfig {
    /// Fast timers for tests.
    pub fn for_testing() -> Self {
        Self {
            backoff_initial: Duration::from_millis(10),
            backoff_max: Duration::from_millis(100),
            backoff_factor: 2,
            checkpoint_interval: Some(50),
            heartbeat_interval: Duration::from_millis(50),
            presence_ttl: Duration::from_millis(500),
            shutdown_timeout: Duration::from_secs(1),
        }
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(self.backoff_initial, self.backoff_max, self.backoff_factor)
    }
}

/// Shared infrastructure a session plugs into.
#[derive(Clone)]
pub struct SessionDeps {
    pub channel: Arc<dyn RemoteUpdateChannel>,
    pub cache: Arc<dyn PersistenceCache>,
    pub presence: Arc<dyn PresenceTransport>,
}

/// Session errors.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    /// The session (or its awareness channel) was torn down.
    Destroyed,
    Model(ModelError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Destroyed => write!(f, "Session destroyed"),
            Self::Model(e) => write!(f, "Model error: {e}"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<ModelError> for SessionError {
    fn from(e: ModelError) -> Self {
        SessionError::Model(e)
    }
}

/// Counters for one session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub deltas_applied: u64,
    pub duplicates_skipped: u64,
    pub echoes_skipped: u64,
    pub corrupt_deltas: u64,
    pub deltas_appended: u64,
    pub checkpoints_appended: u64,
    pub append_retries: u64,
    pub reconnects: u64,
    pub persistence_writes: u64,
    pub persistence_failures: u64,
}

#[derive(Default)]
struct AtomicSessionStats {
    deltas_applied: AtomicU64,
    duplicates_skipped: AtomicU64,
    echoes_skipped: AtomicU64,
    corrupt_deltas: AtomicU64,
    deltas_appended: AtomicU64,
    checkpoints_appended: AtomicU64,
    append_retries: AtomicU64,
    reconnects: AtomicU64,
    persistence_writes: AtomicU64,
    persistence_failures: AtomicU64,
}

impl AtomicSessionStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SessionStats {
        SessionStats {
            deltas_applied: self.deltas_applied.load(Ordering::Relaxed),
            duplicates_skipped: self.duplicates_skipped.load(Ordering::Relaxed),
            echoes_skipped: self.echoes_skipped.load(Ordering::Relaxed),
            corrupt_deltas: self.corrupt_deltas.load(Ordering::Relaxed),
            deltas_appended: self.deltas_appended.load(Ordering::Relaxed),
            checkpoints_appended: self.checkpoints_appended.load(Ordering::Relaxed),
            append_retries: self.append_retries.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            persistence_writes: self.persistence_writes.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Session internals
// ───────────────────────────────────────────────────────────────────

enum Outbound {
    Delta(Vec<u8>),
    /// Full state, encoded when it is actually sent.
    Checkpoint,
}

/// Ids of the most recent deltas taken from the log or authored here.
///
/// Replay after a resubscribe only covers the last `replay_window` entries,
/// so ids older than a few windows are evicted oldest first. Re-applying an
/// evicted delta is still a no-op in the model.
struct SeenDeltas {
    ids: HashSet<DeltaId>,
    order: VecDeque<DeltaId>,
    capacity: usize,
}

impl SeenDeltas {
    /// Windows of history kept per session.
    const WINDOWS: usize = 2;

    fn for_replay_window(replay_window: usize) -> Self {
        let capacity = replay_window.max(1) * Self::WINDOWS;
        Self {
            ids: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns false if `id` is already tracked.
    fn insert(&mut self, id: DeltaId) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

struct SessionShared {
    document_id: Uuid,
    participant: Participant,
    config: SyncConfig,
    model: Arc<Mutex<DocumentModel>>,
    state: watch::Sender<SyncState>,
    destroyed: AtomicBool,
    seen: Mutex<SeenDeltas>,
    cursor: AtomicU64,
    outbound: mpsc::UnboundedSender<Outbound>,
    pending_appends: AtomicU64,
    authored_since_checkpoint: AtomicBool,
    persistence_enabled: bool,
    dirty: Notify,
    /// Model version captured by the last successful save.
    saved_version: AtomicU64,
    stats: AtomicSessionStats,
}

impl SessionShared {
    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn set_state(&self, next: SyncState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == SyncState::Destroyed || *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            log::info!("Session {} on {}: {next:?}", self.participant.session_id, self.document_id);
        }
    }

    /// Model listener; runs with the model lock held.
    fn on_model_change(&self, change: &DocumentChange) {
        if self.is_destroyed() {
            return;
        }
        if self.persistence_enabled {
            self.dirty.notify_one();
        }
        if change.origin == Origin::Local {
            self.seen.lock().insert(change.id);
            self.authored_since_checkpoint.store(true, Ordering::SeqCst);
            self.enqueue(Outbound::Delta(change.delta.clone()));
        }
    }

    fn enqueue(&self, item: Outbound) {
        self.pending_appends.fetch_add(1, Ordering::SeqCst);
        if self.outbound.send(item).is_err() {
            self.pending_appends.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Filter and merge one log entry.
    fn ingest(&self, delta: &RemoteDelta) {
        self.cursor.fetch_max(delta.seq, Ordering::SeqCst);

        if delta.participant_id == self.participant.session_id {
            AtomicSessionStats::bump(&self.stats.echoes_skipped);
            log::trace!("Skipping own entry seq {}", delta.seq);
            return;
        }
        let id = delta.id();
        if !self.seen.lock().insert(id) {
            AtomicSessionStats::bump(&self.stats.duplicates_skipped);
            log::trace!("Skipping already seen delta {id} (seq {})", delta.seq);
            return;
        }

        let result = self.model.lock().apply_delta(&delta.payload, Origin::Remote);
        match result {
            Ok(true) => AtomicSessionStats::bump(&self.stats.deltas_applied),
            Ok(false) => {
                AtomicSessionStats::bump(&self.stats.duplicates_skipped);
                log::debug!("Delta {id} (seq {}) already integrated", delta.seq);
            }
            Err(e) => {
                AtomicSessionStats::bump(&self.stats.corrupt_deltas);
                log::warn!(
                    "Skipping corrupt delta seq {} from {} on {}: {e}",
                    delta.seq,
                    delta.participant_id,
                    self.document_id
                );
            }
        }
    }
}

fn attach_listener(shared: &Arc<SessionShared>) -> ListenerId {
    let weak: Weak<SessionShared> = Arc::downgrade(shared);
    shared.model.lock().observe(move |change| {
        if let Some(shared) = weak.upgrade() {
            shared.on_model_change(change);
        }
    })
}

// ───────────────────────────────────────────────────────────────────
// Background tasks
// ───────────────────────────────────────────────────────────────────

async fn run_inbound(shared: Arc<SessionShared>, channel: Arc<dyn RemoteUpdateChannel>, restored: bool) {
    let mut backoff = shared.config.backoff();
    let mut pending_restore_checkpoint = restored;
    let mut since_checkpoint = 0usize;

    loop {
        if shared.is_destroyed() {
            return;
        }

        match channel.subscribe(shared.document_id).await {
            Ok(mut subscription) => {
                shared.set_state(SyncState::Syncing);
                while let Some(event) = subscription.next().await {
                    match event {
                        SubscriptionEvent::Delta(delta) => {
                            if delta.kind == DeltaKind::Checkpoint {
                                since_checkpoint = 0;
                            } else {
                                since_checkpoint += 1;
                            }
                            shared.ingest(&delta);
                        }
                        SubscriptionEvent::ReplayComplete { head_seq } => {
                            shared.cursor.fetch_max(head_seq, Ordering::SeqCst);
                            shared.set_state(SyncState::Live);
                            backoff.reset();
                            if pending_restore_checkpoint {
                                pending_restore_checkpoint = false;
                                shared.authored_since_checkpoint.store(false, Ordering::SeqCst);
                                shared.enqueue(Outbound::Checkpoint);
                            }
                        }
                    }

                    let due = shared
                        .config
                        .checkpoint_interval
                        .is_some_and(|interval| since_checkpoint >= interval);
                    if due
                        && *shared.state.borrow() == SyncState::Live
                        && shared.authored_since_checkpoint.swap(false, Ordering::SeqCst)
                    {
                        since_checkpoint = 0;
                        shared.enqueue(Outbound::Checkpoint);
                    }
                }
                subscription.unsubscribe();
                if shared.is_destroyed() {
                    return;
                }
                log::info!("Update stream for {} closed", shared.document_id);
            }
            Err(e) => {
                log::warn!("Subscribe to {} failed: {e}", shared.document_id);
            }
        }

        shared.set_state(SyncState::Reconnecting);
        AtomicSessionStats::bump(&shared.stats.reconnects);
        tokio::time::sleep(backoff.next_delay()).await;
    }
}

async fn run_outbound(
    shared: Arc<SessionShared>,
    channel: Arc<dyn RemoteUpdateChannel>,
    mut queue: mpsc::UnboundedReceiver<Outbound>,
) {
    let mut backoff = shared.config.backoff();

    while let Some(item) = queue.recv().await {
        let (kind, payload) = match item {
            Outbound::Delta(bytes) => (DeltaKind::Update, bytes),
            Outbound::Checkpoint => (DeltaKind::Checkpoint, shared.model.lock().encode_full_state()),
        };
        if kind == DeltaKind::Checkpoint {
            shared.seen.lock().insert(DeltaId::of(&payload));
        }

        loop {
            if shared.is_destroyed() {
                return;
            }
            match channel
                .append(shared.document_id, shared.participant.session_id, kind, &payload)
                .await
            {
                Ok(receipt) => {
                    backoff.reset();
                    let counter = match kind {
                        DeltaKind::Update => &shared.stats.deltas_appended,
                        DeltaKind::Checkpoint => &shared.stats.checkpoints_appended,
                    };
                    AtomicSessionStats::bump(counter);
                    shared.pending_appends.fetch_sub(1, Ordering::SeqCst);
                    log::trace!("Appended {kind:?} as seq {}", receipt.seq);
                    break;
                }
                Err(e) => {
                    AtomicSessionStats::bump(&shared.stats.append_retries);
                    let delay = backoff.next_delay();
                    log::debug!("Append to {} failed ({e}), retrying in {delay:?}", shared.document_id);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

async fn save_snapshot(shared: &SessionShared, cache: &dyn PersistenceCache) {
    let (version, snapshot) = {
        let model = shared.model.lock();
        (model.version(), model.encode_full_state())
    };
    match cache.save(shared.document_id, &snapshot).await {
        Ok(()) => {
            shared.saved_version.store(version, Ordering::SeqCst);
            AtomicSessionStats::bump(&shared.stats.persistence_writes);
        }
        Err(e) => {
            // Still dirty; the next change triggers another attempt
            AtomicSessionStats::bump(&shared.stats.persistence_failures);
            log::warn!("Saving {} failed: {e}", shared.document_id);
        }
    }
}

async fn run_writer(shared: Arc<SessionShared>, cache: Arc<dyn PersistenceCache>) {
    loop {
        shared.dirty.notified().await;
        if shared.is_destroyed() {
            return;
        }
        save_snapshot(&shared, cache.as_ref()).await;
    }
}

async fn recv_remote(remote: &mut Option<mpsc::Receiver<PresenceUpdate>>) -> Option<PresenceUpdate> {
    match remote {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn run_presence(
    shared: Arc<SessionShared>,
    awareness: Arc<AwarenessChannel>,
    transport: Arc<dyn PresenceTransport>,
    mut publish: mpsc::UnboundedReceiver<PresenceUpdate>,
) {
    let doc_id = shared.document_id;
    let mut backoff = shared.config.backoff();
    let mut heartbeat = tokio::time::interval(shared.config.heartbeat_interval);
    heartbeat.tick().await;
    let mut remote: Option<mpsc::Receiver<PresenceUpdate>> = None;
    let mut retry_at = Instant::now();

    loop {
        if remote.is_none() && Instant::now() >= retry_at {
            match transport.subscribe_all(doc_id).await {
                Ok(rx) => {
                    remote = Some(rx);
                    backoff.reset();
                }
                Err(e) => {
                    log::debug!("Presence subscribe for {doc_id} failed: {e}");
                    retry_at = Instant::now() + backoff.next_delay();
                }
            }
        }

        tokio::select! {
            Some(update) = publish.recv() => {
                if let Err(e) = transport.publish(doc_id, update).await {
                    log::debug!("Presence publish for {doc_id} failed: {e}");
                }
            }
            received = recv_remote(&mut remote) => match received {
                Some(update) => {
                    awareness.apply_remote(update);
                }
                None => {
                    remote = None;
                    retry_at = Instant::now() + backoff.next_delay();
                }
            },
            _ = heartbeat.tick() => {
                if let Some(update) = awareness.heartbeat_update() {
                    if let Err(e) = transport.publish(doc_id, update).await {
                        log::debug!("Presence heartbeat for {doc_id} failed: {e}");
                    }
                }
                awareness.expire_idle();
            }
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Session handle
// ───────────────────────────────────────────────────────────────────

/// Open a document: restore from the cache, attach to the remote log and
/// presence, and start syncing.
///
/// Never fails. An unreadable cache leaves the session in memory-only mode;
/// an unreachable log leaves it `Reconnecting` with edits queued.
pub async fn open_session(
    document_id: Uuid,
    participant: Participant,
    deps: SessionDeps,
    config: SyncConfig,
) -> SessionHandle {
    let mut model = DocumentModel::new();
    let mut persistence_enabled = true;
    let mut restored = false;

    match deps.cache.load(document_id).await {
        Ok(Some(snapshot)) => match model.apply_snapshot(&snapshot) {
            Ok(changed) => {
                restored = changed;
                log::info!("Restored {document_id} from cache ({} bytes)", snapshot.len());
            }
            Err(e) => log::warn!("Cached snapshot of {document_id} is unreadable, ignoring: {e}"),
        },
        Ok(None) => log::debug!("No cached state for {document_id}"),
        Err(e) => {
            persistence_enabled = false;
            log::warn!("Cache unavailable for {document_id}, continuing in memory only: {e}");
        }
    }

    let (state, _) = watch::channel(SyncState::Disconnected);
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let saved_version = model.version();
    let shared = Arc::new(SessionShared {
        document_id,
        participant: participant.clone(),
        config: config.clone(),
        model: Arc::new(Mutex::new(model)),
        state,
        destroyed: AtomicBool::new(false),
        seen: Mutex::new(SeenDeltas::for_replay_window(deps.channel.replay_window())),
        cursor: AtomicU64::new(0),
        outbound,
        pending_appends: AtomicU64::new(0),
        authored_since_checkpoint: AtomicBool::new(false),
        persistence_enabled,
        dirty: Notify::new(),
        saved_version: AtomicU64::new(saved_version),
        stats: AtomicSessionStats::default(),
    });
    let listener = attach_listener(&shared);
    shared.set_state(SyncState::Connecting);

    let (awareness, publish_rx) = AwarenessChannel::new(participant, config.presence_ttl);
    let awareness = Arc::new(awareness);

    let tasks = vec![
        tokio::spawn(run_inbound(shared.clone(), deps.channel.clone(), restored)),
        tokio::spawn(run_outbound(shared.clone(), deps.channel.clone(), outbound_rx)),
        tokio::spawn(run_presence(
            shared.clone(),
            awareness.clone(),
            deps.presence.clone(),
            publish_rx,
        )),
    ];
    let writer = persistence_enabled.then(|| tokio::spawn(run_writer(shared.clone(), deps.cache.clone())));

    SessionHandle {
        shared,
        awareness,
        deps,
        listener,
        tasks,
        writer,
    }
}

/// A live session on one document.
///
/// Edits go through the handle (or the model it exposes); sync happens in
/// the background. [`SessionHandle::destroy`] is the orderly way out;
/// dropping the handle aborts the background tasks without a final save.
pub struct SessionHandle {
    shared: Arc<SessionShared>,
    awareness: Arc<AwarenessChannel>,
    deps: SessionDeps,
    listener: ListenerId,
    tasks: Vec<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn document_id(&self) -> Uuid {
        self.shared.document_id
    }

    pub fn participant(&self) -> &Participant {
        &self.shared.participant
    }

    /// The session's document model. Keep lock scopes short and never hold
    /// the guard across an `.await`.
    pub fn model(&self) -> Arc<Mutex<DocumentModel>> {
        self.shared.model.clone()
    }

    pub fn awareness(&self) -> Arc<AwarenessChannel> {
        self.awareness.clone()
    }

    pub fn sync_state(&self) -> SyncState {
        *self.shared.state.borrow()
    }

    /// Receiver for state changes (the offline indicator).
    pub fn watch_state(&self) -> watch::Receiver<SyncState> {
        self.shared.state.subscribe()
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.stats.snapshot()
    }

    /// Highest log sequence consumed in this session.
    pub fn subscription_cursor(&self) -> u64 {
        self.shared.cursor.load(Ordering::SeqCst)
    }

    /// Local deltas and checkpoints not yet acknowledged by the log.
    pub fn pending_appends(&self) -> u64 {
        self.shared.pending_appends.load(Ordering::SeqCst)
    }

    /// False once the cache failed to load; the session then never writes.
    pub fn persistence_enabled(&self) -> bool {
        self.shared.persistence_enabled
    }

    // ─── Editing ──────────────────────────────────────────────────────

    pub fn insert(&self, index: u32, text: &str) -> Result<(), SessionError> {
        self.shared.model.lock().insert(index, text)?;
        Ok(())
    }

    pub fn delete(&self, index: u32, len: u32) -> Result<(), SessionError> {
        self.shared.model.lock().delete(index, len)?;
        Ok(())
    }

    pub fn format(&self, index: u32, len: u32, attribute: &str) -> Result<(), SessionError> {
        self.shared.model.lock().format(index, len, attribute)?;
        Ok(())
    }

    pub fn clear_format(&self, index: u32, len: u32, attribute: &str) -> Result<(), SessionError> {
        self.shared.model.lock().clear_format(index, len, attribute)?;
        Ok(())
    }

    pub fn text(&self) -> String {
        self.shared.model.lock().text()
    }

    pub fn formatted_runs(&self) -> Vec<FormattedRun> {
        self.shared.model.lock().formatted_runs()
    }

    // ─── Teardown ─────────────────────────────────────────────────────

    /// Release subscriptions, flush the last state to the cache and
    /// announce the leave. Results of appends still in flight are dropped.
    pub async fn destroy(mut self) {
        let shared = self.shared.clone();
        if shared.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        shared.model.lock().unobserve(self.listener);
        shared.state.send_replace(SyncState::Destroyed);
        log::info!("Session {} on {}: Destroyed", shared.participant.session_id, shared.document_id);

        for task in self.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }

        let timeout = shared.config.shutdown_timeout;
        if let Some(mut writer) = self.writer.take() {
            shared.dirty.notify_one();
            if tokio::time::timeout(timeout, &mut writer).await.is_err() {
                writer.abort();
            }
            let version = shared.model.lock().version();
            if version != shared.saved_version.load(Ordering::SeqCst) {
                let flush = save_snapshot(&shared, self.deps.cache.as_ref());
                if tokio::time::timeout(timeout, flush).await.is_err() {
                    log::warn!("Final save of {} timed out", shared.document_id);
                }
            }
        }

        let leave = self.awareness.leave_update();
        self.awareness.close();
        let publish = self.deps.presence.publish(shared.document_id, leave);
        match tokio::time::timeout(timeout, publish).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::debug!("Leave announcement failed: {e}"),
            Err(_) => log::debug!("Leave announcement timed out"),
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if !self.shared.destroyed.swap(true, Ordering::SeqCst) {
            self.shared.model.lock().unobserve(self.listener);
            self.shared.state.send_replace(SyncState::Destroyed);
            self.awareness.close();
        }
        for task in &self.tasks {
            task.abort();
        }
        if let Some(writer) = &self.writer {
            writer.abort();
        }
    }
}
