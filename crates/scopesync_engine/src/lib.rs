//! # scopesync engine
//!
//! Client session state machine and server-side peer for scope-versioned,
//! batched, resumable bidirectional sync.
//!
//! This crate provides:
//! - Scope negotiation with setup conflict handling
//! - Change selection in dependency order over a pluggable [`DataProvider`]
//! - Batch planning, spooling and reassembly
//! - Sequential upload and bounded parallel download
//! - Watermark commit with per-row apply failure accounting
//! - In-process and HTTP transports
//!
//! ## Session flow
//!
//! 1. Negotiate: load the local scope, ensure the remote scope and reconcile
//!    their setups
//! 2. Upload local changes since the last local watermark, in parts
//! 3. Download the peer's outbound batch, up to `max_parallel_downloads`
//!    parts at a time
//! 4. Apply the batch once every part has arrived
//! 5. Commit the new watermark
//!
//! ## Key Invariants
//!
//! - The stored watermark only moves on a completed session
//! - Rows are never skipped: watermarks stop short of any failed row
//! - Upload parts are strictly ordered and idempotent per digest
//! - Parents are applied before children, children deleted before parents

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod http;
mod listener;
mod negotiator;
mod peer;
mod planner;
mod provider;
mod selector;
mod session;
mod spool;
mod transport;

pub use config::{
    ApplyErrorPolicy, PeerConfig, RetryConfig, SetupConflictPolicy, SpoolMode, SyncConfig,
    SyncType, DEFAULT_MAX_PARALLEL_DOWNLOADS, DEFAULT_MAX_ROWS_PER_BATCH_PART,
};
pub use error::{SessionError, SyncError, SyncResult};
pub use http::{
    HttpClient, HttpReply, HttpTransport, LoopbackClient, LoopbackServer, ReqwestClient,
    SYNC_PATH,
};
pub use listener::{ListenerRegistry, SessionListener};
pub use negotiator::{
    check_naming, Comparison, ConflictAction, Reconciliation, ScopeNegotiator, SetupConflict,
};
pub use peer::SyncPeer;
pub use planner::{BatchPlanner, PlannedParts};
pub use provider::{
    ApplyOutcome, ChangeQuery, DataProvider, MemoryProvider, ProviderError, ProviderResult,
};
pub use selector::{ChangeSelector, SelectionWindow};
pub use session::{SessionReport, SessionState, SyncSession, SyncStats};
pub use spool::{part_digest, BatchAssembler, BatchSpool};
pub use transport::{LocalTransport, SyncTransport};
