//! Error types for the sync engine.

use crate::provider::ProviderError;
use crate::session::SessionState;
use scopesync_protocol::{ErrorBody, ProtocolError, RowFailure, SyncSetup};
use scopesync_store::StoreError;
use thiserror::Error;
use uuid::Uuid;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Scope setups disagree and the conflict was not resolved.
    #[error("setup conflict on scope `{scope}`: local tables {:?}, remote tables {:?}", .local.table_names(), .remote.table_names())]
    SetupConflict {
        /// Scope name.
        scope: String,
        /// Local candidate setup.
        local: Box<SyncSetup>,
        /// Remote candidate setup.
        remote: Box<SyncSetup>,
    },

    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// A transport call did not complete in time.
    #[error("operation timed out")]
    Timeout,

    /// Malformed or out-of-sequence message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Rows failed to apply and the session policy fails the session.
    #[error("{} row(s) failed to apply", .0.len())]
    Apply(Vec<RowFailure>),

    /// The scope store failed.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    /// The peer reported an application error.
    #[error("remote error: {0}")]
    Remote(ErrorBody),

    /// The data provider failed.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// The session was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Tracking metadata the client needs has been purged.
    #[error("client is out of date on scope `{scope}`: last sync at {since}, metadata cleaned up to {cleanup}")]
    OutOfDate {
        /// Scope name.
        scope: String,
        /// Watermark the client holds.
        since: u64,
        /// Watermark up to which metadata was purged.
        cleanup: u64,
    },

    /// A new scope uses a tracking naming convention different from existing scopes.
    #[error("scope `{scope}` uses tracking naming `{requested}` but existing scope `{existing_scope}` uses `{existing}`")]
    TrackingNamingMismatch {
        /// New scope.
        scope: String,
        /// Already provisioned scope.
        existing_scope: String,
        /// Naming of the existing scope.
        existing: String,
        /// Naming of the new scope.
        requested: String,
    },

    /// Invalid state transition.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            SyncError::Remote(body) => body.retryable,
            _ => false,
        }
    }

    /// Stable snake_case code used on the wire.
    pub fn code(&self) -> &str {
        match self {
            SyncError::SetupConflict { .. } => "setup_conflict",
            SyncError::Transport { .. } => "transport_error",
            SyncError::Timeout => "timeout",
            SyncError::Protocol(_) => "protocol_error",
            SyncError::Apply(_) => "apply_error",
            SyncError::Storage(_) => "storage_error",
            SyncError::Remote(body) => &body.code,
            SyncError::Provider(_) => "provider_error",
            SyncError::Cancelled => "cancelled",
            SyncError::OutOfDate { .. } => "out_of_date",
            SyncError::TrackingNamingMismatch { .. } => "tracking_naming_mismatch",
            SyncError::InvalidStateTransition { .. } => "invalid_state_transition",
            SyncError::Config(_) => "config_error",
        }
    }

    /// HTTP status a server reports for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            SyncError::SetupConflict { .. } => 409,
            SyncError::OutOfDate { .. } => 410,
            SyncError::Protocol(_)
            | SyncError::Config(_)
            | SyncError::TrackingNamingMismatch { .. }
            | SyncError::InvalidStateTransition { .. } => 400,
            SyncError::Transport { .. } | SyncError::Timeout | SyncError::Cancelled => 503,
            SyncError::Remote(body) if body.retryable => 503,
            _ => 500,
        }
    }

    /// Converts the error to its wire representation.
    pub fn to_error_body(&self) -> ErrorBody {
        match self {
            SyncError::Remote(body) => body.clone(),
            other => ErrorBody::new(other.code(), other.to_string(), other.is_retryable()),
        }
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

/// A failed session, tagged with the scope, session and phase it failed in.
#[derive(Error, Debug)]
#[error("session {session_id} on scope `{scope_name}` failed while {phase}: {source}")]
pub struct SessionError {
    /// Scope name.
    pub scope_name: String,
    /// Session identifier.
    pub session_id: Uuid,
    /// State the session was in when it failed.
    pub phase: SessionState,
    /// Innermost cause.
    #[source]
    pub source: SyncError,
}

impl SessionError {
    /// Returns true if the session was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.source, SyncError::Cancelled)
    }
}
