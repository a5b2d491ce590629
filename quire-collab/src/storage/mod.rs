//! Durable storage for document snapshots and relay log entries.
//!
//! ```text
//! ┌──────────────┐  save/load   ┌───────────────────────────────────┐
//! │ RocksCache   │ ───────────► │ DocumentStore (RocksDB)           │
//! │ (sessions)   │              │  CF "documents" — LZ4 snapshots   │
//! └──────────────┘              │  CF "metadata"  — bookkeeping     │
//! ┌──────────────┐  append/load │  CF "log"       — relay entries   │
//! │ LogRelay     │ ───────────► │                                   │
//! └──────────────┘              └───────────────────────────────────┘
//! ```
//!
//! ## Performance Targets
//!
//! | Metric               | Target  |
//! |----------------------|---------|
//! | Snapshot load (1MB)  | <1ms    |
//! | Log append (1KB)     | <50μs   |
//! | Compression ratio    | 5:1     |

pub mod rocks;

pub use rocks::{DocumentMetadata, DocumentStore, StoreConfig, StoreError};
