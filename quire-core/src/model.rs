//! In-memory CRDT document model.
//!
//! Wraps a single Yrs `Doc` holding one rich-text root. Every mutation,
//! local or remote, runs inside one transaction and is followed by a
//! synchronous change notification carrying the produced update bytes and
//! an [`Origin`] tag:
//!
//! ```text
//! insert / delete / format ──► transact_mut ──► encode_update_v1 ──► listeners (Origin::Local)
//! apply_delta(bytes)       ──► decode + apply ──► encode_update_v1 ──► listeners (Origin::Remote)
//! ```
//!
//! Merge is delegated to Yrs, which is commutative, associative and
//! idempotent: re-applying an already integrated update produces an empty
//! transaction and no notification.
//!
//! Incoming bytes are untrusted. They are decoded through `CheckedDecoder`,
//! which validates every string before Yrs sees it, and a panic inside
//! decode or integrate is reported as [`ModelError::CorruptDelta`].
//!
//! Text indexes are UTF-8 byte offsets (the Yrs default offset kind).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use yrs::block::ClientID;
use yrs::encoding::read::{self, Read};
use yrs::types::text::YChange;
use yrs::types::Attrs;
use yrs::updates::decoder::{Decode, Decoder, DecoderV1};
use yrs::{Any, Doc, GetString, ReadTxn, StateVector, Text, TextRef, Transact, TransactionMut, Update, ID};

/// Name of the shared text root inside the Yrs document.
pub const TEXT_ROOT: &str = "content";

/// Encoding of an update that carries neither blocks nor deletions.
const EMPTY_UPDATE: [u8; 2] = [0, 0];

/// Where a mutation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Origin {
    /// Authored in this session; eligible for outbound propagation.
    Local,
    /// Merged from another participant or a snapshot; never re-broadcast.
    Remote,
}

/// Content identity of a delta: BLAKE3 of its encoded bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeltaId(blake3::Hash);

impl DeltaId {
    pub fn of(bytes: &[u8]) -> Self {
        Self(blake3::hash(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

impl fmt::Display for DeltaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.0.to_hex();
        write!(f, "{}", &hex.as_str()[..12])
    }
}

/// Notification emitted after every successful mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    /// Update bytes produced by the transaction.
    pub delta: Vec<u8>,
    pub origin: Origin,
    pub id: DeltaId,
}

impl DocumentChange {
    fn new(delta: Vec<u8>, origin: Origin) -> Self {
        let id = DeltaId::of(&delta);
        Self { delta, origin, id }
    }
}

/// Handle returned by [`DocumentModel::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Box<dyn Fn(&DocumentChange) + Send + Sync>;

/// A run of text sharing the same formatting attributes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormattedRun {
    pub text: String,
    /// Attribute names set on the run, sorted.
    pub attributes: Vec<String>,
}

/// Document model errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelError {
    /// Bytes could not be decoded or integrated as an update.
    CorruptDelta(String),
    /// Local edit addressed a range outside the text.
    OutOfBounds { index: u32, len: u32, text_len: u32 },
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::CorruptDelta(e) => write!(f, "Corrupt delta: {e}"),
            ModelError::OutOfBounds { index, len, text_len } => write!(
                f,
                "Range {index}..{} out of bounds for text of length {text_len}",
                index + len
            ),
        }
    }
}

impl std::error::Error for ModelError {}

impl From<read::Error> for ModelError {
    fn from(e: read::Error) -> Self {
        ModelError::CorruptDelta(e.to_string())
    }
}

// ─── Checked decoding ─────────────────────────────────────────────────

/// V1 update reader that refuses string content which is not UTF-8.
///
/// Yrs reads strings with `from_utf8_unchecked`, so a single flipped byte in
/// text content would otherwise build an invalid `str`. Every string path
/// (text chunks, format keys, JSON and `Any` values, root names) goes
/// through `read_string` below.
struct CheckedDecoder<'a> {
    inner: DecoderV1<'a>,
}

impl<'a> CheckedDecoder<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { inner: DecoderV1::from(bytes) }
    }
}

impl Read for CheckedDecoder<'_> {
    fn read_exact(&mut self, len: usize) -> Result<&[u8], read::Error> {
        self.inner.read_exact(len)
    }

    fn read_u8(&mut self) -> Result<u8, read::Error> {
        self.inner.read_u8()
    }

    fn read_string(&mut self) -> Result<&str, read::Error> {
        let buf = self.inner.read_buf()?;
        std::str::from_utf8(buf).map_err(|e| read::Error::Custom(format!("invalid UTF-8 in string: {e}")))
    }
}

impl Decoder for CheckedDecoder<'_> {
    fn reset_ds_cur_val(&mut self) {
        self.inner.reset_ds_cur_val()
    }

    fn read_ds_clock(&mut self) -> Result<u32, read::Error> {
        self.inner.read_ds_clock()
    }

    fn read_ds_len(&mut self) -> Result<u32, read::Error> {
        self.inner.read_ds_len()
    }

    fn read_left_id(&mut self) -> Result<ID, read::Error> {
        self.inner.read_left_id()
    }

    fn read_right_id(&mut self) -> Result<ID, read::Error> {
        self.inner.read_right_id()
    }

    fn read_client(&mut self) -> Result<ClientID, read::Error> {
        self.inner.read_client()
    }

    fn read_info(&mut self) -> Result<u8, read::Error> {
        self.inner.read_info()
    }

    fn read_parent_info(&mut self) -> Result<bool, read::Error> {
        self.inner.read_parent_info()
    }

    fn read_type_ref(&mut self) -> Result<u8, read::Error> {
        self.inner.read_type_ref()
    }

    fn read_len(&mut self) -> Result<u32, read::Error> {
        self.inner.read_len()
    }

    fn read_any(&mut self) -> Result<Any, read::Error> {
        Any::decode(self)
    }

    fn read_json(&mut self) -> Result<Any, read::Error> {
        let src = self.read_string()?;
        Any::from_json(src)
    }

    fn read_key(&mut self) -> Result<Arc<str>, read::Error> {
        Ok(self.read_string()?.into())
    }

    fn read_to_end(&mut self) -> Result<&[u8], read::Error> {
        self.inner.read_to_end()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic while integrating update".to_string()
    }
}

/// The merged CRDT state of one collaborative document.
///
/// Performs no I/O. Callers serialize access (the sync controller keeps it
/// behind a mutex) so merges never interleave.
pub struct DocumentModel {
    doc: Doc,
    text: TextRef,
    listeners: Vec<(ListenerId, Listener)>,
    next_listener: u64,
    /// Number of mutations that changed the document.
    version: u64,
}

impl DocumentModel {
    pub fn new() -> Self {
        Self::from_doc(Doc::new())
    }

    /// Create with a fixed Yrs client id (deterministic tests and benches).
    pub fn with_replica_id(replica_id: u64) -> Self {
        Self::from_doc(Doc::with_client_id(replica_id))
    }

    fn from_doc(doc: Doc) -> Self {
        let text = doc.get_or_insert_text(TEXT_ROOT);
        Self {
            doc,
            text,
            listeners: Vec::new(),
            next_listener: 0,
            version: 0,
        }
    }

    pub fn replica_id(&self) -> u64 {
        self.doc.client_id()
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    // ─── Change notification ──────────────────────────────────────────

    /// Register a listener, called synchronously after every mutation.
    pub fn observe<F>(&mut self, listener: F) -> ListenerId
    where
        F: Fn(&DocumentChange) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    /// Detach a listener. Returns false if it was already gone.
    pub fn unobserve(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(lid, _)| *lid != id);
        self.listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn emit(&mut self, delta: Vec<u8>, origin: Origin) -> Option<DocumentChange> {
        if delta == EMPTY_UPDATE {
            return None;
        }
        self.version += 1;
        let change = DocumentChange::new(delta, origin);
        for (_, listener) in &self.listeners {
            listener(&change);
        }
        Some(change)
    }

    // ─── Merge primitives ─────────────────────────────────────────────

    /// Merge an encoded update.
    ///
    /// Returns `Ok(true)` if the document changed, `Ok(false)` if every
    /// block was already integrated.
    pub fn apply_delta(&mut self, bytes: &[u8], origin: Origin) -> Result<bool, ModelError> {
        let doc = &self.doc;
        let merged = panic::catch_unwind(AssertUnwindSafe(|| -> Result<Vec<u8>, ModelError> {
            let update = Update::decode(&mut CheckedDecoder::new(bytes))?;
            let mut txn = doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| ModelError::CorruptDelta(e.to_string()))?;
            Ok(txn.encode_update_v1())
        }))
        .unwrap_or_else(|payload| Err(ModelError::CorruptDelta(panic_message(payload.as_ref()))));

        match merged {
            Ok(produced) => Ok(self.emit(produced, origin).is_some()),
            Err(e) => {
                log::debug!("Rejected {} byte delta: {}", bytes.len(), e);
                Err(e)
            }
        }
    }

    /// Import a full-state snapshot. Snapshots are merged like any other
    /// update, so loading one over existing state never loses edits.
    pub fn apply_snapshot(&mut self, bytes: &[u8]) -> Result<bool, ModelError> {
        self.apply_delta(bytes, Origin::Remote)
    }

    /// Export the complete document state as a single update.
    pub fn encode_full_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode everything this replica has that `remote` has not seen.
    pub fn encode_diff(&self, remote: &StateVector) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(remote)
    }

    pub fn state_vector(&self) -> StateVector {
        self.doc.transact().state_vector()
    }

    // ─── Local edits ──────────────────────────────────────────────────

    /// Insert `chunk` at byte offset `index`.
    pub fn insert(&mut self, index: u32, chunk: &str) -> Result<Option<DocumentChange>, ModelError> {
        self.check_range(index, 0)?;
        let text = self.text.clone();
        Ok(self.local_edit(|txn| text.insert(txn, index, chunk)))
    }

    /// Append `chunk` at the end of the text.
    pub fn push(&mut self, chunk: &str) -> Option<DocumentChange> {
        let text = self.text.clone();
        self.local_edit(|txn| text.push(txn, chunk))
    }

    pub fn delete(&mut self, index: u32, len: u32) -> Result<Option<DocumentChange>, ModelError> {
        self.check_range(index, len)?;
        let text = self.text.clone();
        Ok(self.local_edit(|txn| text.remove_range(txn, index, len)))
    }

    /// Set a boolean formatting attribute (e.g. `bold`) over a range.
    pub fn format(
        &mut self,
        index: u32,
        len: u32,
        attribute: &str,
    ) -> Result<Option<DocumentChange>, ModelError> {
        self.set_attribute(index, len, attribute, Any::Bool(true))
    }

    /// Remove a formatting attribute from a range.
    pub fn clear_format(
        &mut self,
        index: u32,
        len: u32,
        attribute: &str,
    ) -> Result<Option<DocumentChange>, ModelError> {
        self.set_attribute(index, len, attribute, Any::Null)
    }

    fn set_attribute(
        &mut self,
        index: u32,
        len: u32,
        attribute: &str,
        value: Any,
    ) -> Result<Option<DocumentChange>, ModelError> {
        self.check_range(index, len)?;
        let attrs = Attrs::from([(Arc::<str>::from(attribute), value)]);
        let text = self.text.clone();
        Ok(self.local_edit(|txn| text.format(txn, index, len, attrs)))
    }

    fn local_edit<F>(&mut self, edit: F) -> Option<DocumentChange>
    where
        F: FnOnce(&mut TransactionMut),
    {
        let produced = {
            let mut txn = self.doc.transact_mut();
            edit(&mut txn);
            txn.encode_update_v1()
        };
        self.emit(produced, Origin::Local)
    }

    fn check_range(&self, index: u32, len: u32) -> Result<(), ModelError> {
        let text_len = self.len();
        match index.checked_add(len) {
            Some(end) if end <= text_len => Ok(()),
            _ => Err(ModelError::OutOfBounds { index, len, text_len }),
        }
    }

    // ─── Reads ────────────────────────────────────────────────────────

    pub fn text(&self) -> String {
        let txn = self.doc.transact();
        self.text.get_string(&txn)
    }

    pub fn len(&self) -> u32 {
        let txn = self.doc.transact();
        self.text.len(&txn)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Text split into runs of identical formatting.
    pub fn formatted_runs(&self) -> Vec<FormattedRun> {
        let txn = self.doc.transact();
        self.text
            .diff(&txn, YChange::identity)
            .into_iter()
            .map(|chunk| {
                let mut attributes: Vec<String> = chunk
                    .attributes
                    .map(|attrs| {
                        attrs
                            .iter()
                            .filter(|(_, value)| !matches!(value, Any::Null))
                            .map(|(name, _)| name.to_string())
                            .collect()
                    })
                    .unwrap_or_default();
                attributes.sort();
                FormattedRun {
                    text: chunk.insert.to_string(&txn),
                    attributes,
                }
            })
            .collect()
    }
}

impl Default for DocumentModel {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for DocumentModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentModel")
            .field("replica_id", &self.replica_id())
            .field("version", &self.version)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
