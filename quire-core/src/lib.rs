//! # quire-core — Replicated document model for Quire
//!
//! Holds the merged CRDT state of one rich-text document and the identity
//! types shared by every participant. Performs no I/O; the sync layer in
//! `quire-collab` feeds it deltas and listens for changes.
//!
//! ## Architecture
//!
//! ```text
//!   local edit                       remote delta / snapshot
//!       │                                      │
//!       ▼                                      ▼
//! ┌──────────────────────────────────────────────────┐
//! │ DocumentModel (Yrs Doc, one Text root)           │
//! │   transact_mut → encode_update_v1                │
//! └────────────────────────┬─────────────────────────┘
//!                          │ DocumentChange { delta, origin, id }
//!                          ▼
//!                     listeners
//! ```
//!
//! ## Modules
//!
//! - [`model`] — CRDT document, merge primitives, change notification
//! - [`identity`] — Participants and their display colors

pub mod identity;
pub mod model;

pub use identity::{Participant, ParticipantColor};
pub use model::{
    DeltaId, DocumentChange, DocumentModel, FormattedRun, ListenerId, ModelError, Origin,
    TEXT_ROOT,
};
pub use yrs::StateVector;
