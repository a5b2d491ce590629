//! Binary protocol spoken between update channels and the relay.
//!
//! Every WebSocket binary frame carries one bincode-encoded [`RelayMessage`].
//! The relay is the only party that assigns sequence numbers and timestamps;
//! delta payloads are opaque CRDT update bytes.
//!
//! ```text
//! client                                   relay
//!   │ ── Append { request_id, payload } ──► │  seq := next_seq++
//!   │ ◄── AppendAck { request_id, seq } ─── │
//!   │                                       │
//!   │ ── Subscribe { doc_id } ────────────► │
//!   │ ◄── Entry × (last N, ascending seq) ─ │
//!   │ ◄── ReplayComplete { head_seq } ───── │
//!   │ ◄── Entry … (live)  ───────────────── │
//! ```
//!
//! Performance target: encoding < 500ns for a typical 64-byte delta.

use crate::awareness::PresenceUpdate;
use quire_core::DeltaId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What an entry in the remote log carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeltaKind {
    /// An incremental update produced by one local edit.
    Update,
    /// The author's full merged state. Lets subscribers that only see the
    /// bounded replay window still reach the full document.
    Checkpoint,
}

/// One entry of the remote append-only log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDelta {
    /// Server-assigned, strictly increasing per document.
    pub seq: u64,
    /// Server clock at append, milliseconds since the UNIX epoch.
    pub timestamp_ms: u64,
    /// Session id of the producing participant.
    pub participant_id: Uuid,
    pub kind: DeltaKind,
    pub payload: Vec<u8>,
}

impl RemoteDelta {
    /// Content identity used for dedup.
    pub fn id(&self) -> DeltaId {
        DeltaId::of(&self.payload)
    }
}

/// Acknowledgement of an append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendReceipt {
    pub seq: u64,
    pub timestamp_ms: u64,
}

/// Top-level relay message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RelayMessage {
    Append {
        request_id: u64,
        doc_id: Uuid,
        participant_id: Uuid,
        kind: DeltaKind,
        payload: Vec<u8>,
    },
    AppendAck {
        request_id: u64,
        receipt: AppendReceipt,
    },
    AppendRejected {
        request_id: u64,
        reason: String,
    },
    Subscribe {
        doc_id: Uuid,
    },
    Entry {
        doc_id: Uuid,
        delta: RemoteDelta,
    },
    ReplayComplete {
        doc_id: Uuid,
        head_seq: u64,
    },
    /// Client → relay presence publish.
    Publish {
        doc_id: Uuid,
        update: PresenceUpdate,
    },
    WatchPresence {
        doc_id: Uuid,
    },
    /// Relay → client presence fan-out.
    Presence {
        doc_id: Uuid,
        update: PresenceUpdate,
    },
    Ping,
    Pong,
}

impl RelayMessage {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    /// Document this message concerns, if any.
    pub fn doc_id(&self) -> Option<Uuid> {
        match self {
            Self::Append { doc_id, .. }
            | Self::Subscribe { doc_id }
            | Self::Entry { doc_id, .. }
            | Self::ReplayComplete { doc_id, .. }
            | Self::Publish { doc_id, .. }
            | Self::WatchPresence { doc_id }
            | Self::Presence { doc_id, .. } => Some(*doc_id),
            _ => None,
        }
    }
}

/// Milliseconds since the UNIX epoch.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    UnexpectedMessage(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::UnexpectedMessage(m) => write!(f, "Unexpected message: {m}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::awareness::ParticipantState;
    use quire_core::Participant;

    #[test]
    fn test_append_roundtrip() {
        let doc = Uuid::new_v4();
        let participant = Uuid::new_v4();
        let msg = RelayMessage::Append {
            request_id: 7,
            doc_id: doc,
            participant_id: participant,
            kind: DeltaKind::Update,
            payload: vec![1, 2, 3],
        };

        let decoded = RelayMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.doc_id(), Some(doc));
    }

    #[test]
    fn test_entry_carries_identity() {
        let delta = RemoteDelta {
            seq: 42,
            timestamp_ms: now_ms(),
            participant_id: Uuid::new_v4(),
            kind: DeltaKind::Checkpoint,
            payload: vec![9; 32],
        };
        let msg = RelayMessage::Entry {
            doc_id: Uuid::new_v4(),
            delta: delta.clone(),
        };

        match RelayMessage::decode(&msg.encode().unwrap()).unwrap() {
            RelayMessage::Entry { delta: d, .. } => {
                assert_eq!(d.seq, 42);
                assert_eq!(d.kind, DeltaKind::Checkpoint);
                assert_eq!(d.id(), delta.id());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_presence_roundtrip() {
        let p = Participant::new("alice", "Alice");
        let update = PresenceUpdate {
            participant_id: p.session_id,
            clock: 3,
            state: Some(ParticipantState::from_participant(&p).with_cursor(5)),
        };
        let msg = RelayMessage::Presence {
            doc_id: Uuid::new_v4(),
            update,
        };
        assert_eq!(RelayMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_delta_envelope_is_small() {
        let msg = RelayMessage::Append {
            request_id: 1,
            doc_id: Uuid::new_v4(),
            participant_id: Uuid::new_v4(),
            kind: DeltaKind::Update,
            payload: vec![0u8; 50],
        };
        let encoded = msg.encode().unwrap();
        assert!(
            encoded.len() < 150,
            "Encoded size {} too large for 50-byte delta",
            encoded.len()
        );
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(RelayMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
        assert_eq!(RelayMessage::Ping.doc_id(), None);
    }
}
