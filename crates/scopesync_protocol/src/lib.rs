//! # scopesync protocol
//!
//! Data model and wire messages for scope-versioned batch synchronization.
//!
//! This crate provides:
//! - `ScopeDefinition`, `SyncSetup` and `SyncSchema` for named sync agreements
//! - `ClientWatermark` and `SyncParameters` for per-client progress tracking
//! - `RowChange`, `BatchPart` and `BatchSummary` for batched change transfer
//! - Request/response frames for the five protocol steps
//!
//! This is a pure protocol crate with no I/O operations. Frames serialize with
//! `serde`; the transports in `scopesync_engine` use JSON on the wire.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod batch;
mod error;
mod messages;
mod scope;
mod watermark;

pub use batch::{BatchPart, BatchPartInfo, BatchSummary, ChangeKind, RowChange, TableChanges};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    DownloadPartRequest, EndSessionRequest, EndSessionResponse, EnsureScopeRequest,
    EnsureScopeResponse, ErrorBody, GetSummaryRequest, PartAck, RequestFrame, RequestPayload,
    ResponseFrame, ResponsePayload, RowFailure, SessionHeader, SessionOutcome, Step,
    UploadPartRequest, UploadPartResponse,
};
pub use scope::{
    ColumnSchema, ScopeDefinition, SetupTable, SyncSchema, SyncSetup, TableSchema,
    DEFAULT_TRACKING_SUFFIX, SCOPE_VERSION,
};
pub use watermark::{ClientWatermark, SyncParameters, WatermarkKey};

/// Origin id used for rows that were applied from the server side.
///
/// Clients tag rows downloaded from their server with this id so that
/// change selection for the next upload can exclude them.
pub const SERVER_ORIGIN: uuid::Uuid = uuid::Uuid::nil();
