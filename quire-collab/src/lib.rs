//! # quire-collab — Sync layer for Quire
//!
//! Keeps each open document converged with every other replica through a
//! shared append-only update log, a local persistence cache and an
//! ephemeral presence channel.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────┐  append / subscribe  ┌──────────────────────┐
//! │ SessionHandle │ ◄──────────────────► │ RemoteUpdateChannel  │
//! │ (per doc)     │                      │  MemoryLog | relay   │
//! └──┬─────────┬──┘                      └──────────┬───────────┘
//!    │         │ publish / subscribe_all            │ (WebSocket)
//!    │         ▼                                    ▼
//!    │   ┌──────────────────┐             ┌────────────────────┐
//!    │   │ AwarenessChannel │ ◄─────────► │ LogRelay           │
//!    │   └──────────────────┘  presence   │ MemoryLog + Hub    │
//!    ▼                                    │ DocumentStore (log)│
//! ┌──────────────────┐                    └────────────────────┘
//! │ PersistenceCache │  snapshots (RocksDB, LZ4)
//! └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`controller`] — Session lifecycle, inbound/outbound sync, state machine
//! - [`channel`] — Remote update log abstraction and its implementations
//! - [`awareness`] — Presence state, last-writer-wins merge, idle expiry
//! - [`persistence`] — Snapshot cache over RocksDB or memory
//! - [`protocol`] — Binary wire protocol (bincode-encoded RelayMessage)
//! - [`relay`] — WebSocket relay hosting the log and presence fan-out
//! - [`storage`] — RocksDB document and log store
//! - [`backoff`] — Exponential retry delays

pub mod awareness;
pub mod backoff;
pub mod channel;
pub mod controller;
pub mod persistence;
pub mod protocol;
pub mod relay;
pub mod storage;

// Re-exports for convenience
pub use awareness::{
    AwarenessChange, AwarenessChannel, AwarenessListenerId, ChangeKind, MemoryPresenceHub,
    ParticipantState, PresenceTransport, PresenceUpdate, TextRange,
};
pub use backoff::Backoff;
pub use channel::{
    MemoryLog, MemoryLogConfig, RemoteUpdateChannel, SubscriptionEvent, TransportError,
    UpdateSubscription, WsPresence, WsUpdateChannel,
};
pub use controller::{
    open_session, SessionDeps, SessionError, SessionHandle, SessionStats, SyncConfig, SyncState,
};
pub use persistence::{MemoryCache, PersistenceCache, PersistenceError, RocksCache};
pub use protocol::{AppendReceipt, DeltaKind, ProtocolError, RelayMessage, RemoteDelta};
pub use relay::{LogRelay, RelayConfig, RelayStats};
pub use storage::{DocumentMetadata, DocumentStore, StoreConfig, StoreError};
