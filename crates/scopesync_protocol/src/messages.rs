//! Protocol messages for the five session steps.

use crate::batch::{BatchPart, BatchSummary};
use crate::error::ProtocolResult;
use crate::scope::{ScopeDefinition, SyncSetup};
use crate::watermark::SyncParameters;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Protocol step carried by a request frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Resolve the scope definition on the peer.
    EnsureScope,
    /// Send one part of the outbound batch.
    UploadPart,
    /// Ask for the peer's outbound batch without uploading.
    GetSummary,
    /// Fetch one part of the peer's outbound batch.
    DownloadPart,
    /// Close the session on the peer.
    EndSession,
}

impl Step {
    /// Returns the numeric step code.
    pub fn code(self) -> u8 {
        match self {
            Step::EnsureScope => 1,
            Step::UploadPart => 2,
            Step::GetSummary => 3,
            Step::DownloadPart => 4,
            Step::EndSession => 5,
        }
    }

    /// Parses a numeric step code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Step::EnsureScope),
            2 => Some(Step::UploadPart),
            3 => Some(Step::GetSummary),
            4 => Some(Step::DownloadPart),
            5 => Some(Step::EndSession),
            _ => None,
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Step::EnsureScope => "EnsureScope",
            Step::UploadPart => "UploadPart",
            Step::GetSummary => "GetSummary",
            Step::DownloadPart => "DownloadPart",
            Step::EndSession => "EndSession",
        };
        f.write_str(name)
    }
}

/// Identifies the session a frame belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHeader {
    /// Session identifier, generated by the client per session.
    pub session_id: Uuid,
    /// Persistent client identifier.
    pub client_id: Uuid,
    /// Scope being synchronized.
    pub scope_name: String,
}

impl SessionHeader {
    /// Creates a header.
    pub fn new(session_id: Uuid, client_id: Uuid, scope_name: impl Into<String>) -> Self {
        Self {
            session_id,
            client_id,
            scope_name: scope_name.into(),
        }
    }
}

/// Request for [`Step::EnsureScope`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnsureScopeRequest {
    /// Filter parameters of the session.
    #[serde(default)]
    pub parameters: SyncParameters,
    /// Setup the client asks for. `None` accepts whatever the peer publishes.
    #[serde(default)]
    pub setup: Option<SyncSetup>,
}

/// Response to [`Step::EnsureScope`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnsureScopeResponse {
    /// The peer's resolved definition.
    pub scope: ScopeDefinition,
}

/// Request for [`Step::UploadPart`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadPartRequest {
    /// Filter parameters of the session.
    #[serde(default)]
    pub parameters: SyncParameters,
    /// The part being uploaded.
    pub part: BatchPart,
    /// Peer position the client already holds. `None` requests a snapshot.
    #[serde(default)]
    pub since: Option<u64>,
}

/// A row the receiving side could not apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowFailure {
    /// Table of the row.
    pub table: String,
    /// Primary key of the row.
    pub key: String,
    /// Change timestamp of the row on the sending side.
    pub timestamp: u64,
    /// Reason reported by the data provider.
    pub message: String,
}

/// Acknowledgement of an uploaded part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartAck {
    /// Index of the acknowledged part.
    pub index: u32,
    /// Rows applied by the peer.
    pub applied_rows: u64,
    /// Rows the peer failed to apply.
    #[serde(default)]
    pub failures: Vec<RowFailure>,
}

/// Response to [`Step::UploadPart`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadPartResponse {
    /// Acknowledgement for the part.
    pub ack: PartAck,
    /// Peer's outbound batch, present once the last part was acknowledged.
    #[serde(default)]
    pub summary: Option<BatchSummary>,
}

/// Request for [`Step::GetSummary`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetSummaryRequest {
    /// Filter parameters of the session.
    #[serde(default)]
    pub parameters: SyncParameters,
    /// Peer position the client already holds. `None` requests a snapshot.
    #[serde(default)]
    pub since: Option<u64>,
}

/// Request for [`Step::DownloadPart`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadPartRequest {
    /// Index into the announced summary.
    pub index: u32,
}

/// How a session ended on the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    /// Watermarks were committed.
    Success,
    /// The session failed.
    Failed,
    /// The session was cancelled or aborted.
    Cancelled,
}

/// Request for [`Step::EndSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndSessionRequest {
    /// Client-side outcome.
    pub outcome: SessionOutcome,
    /// Client's committed local position, reported on success.
    #[serde(default)]
    pub client_watermark: Option<u64>,
    /// Peer position the client committed, reported on success.
    #[serde(default)]
    pub delivered_watermark: Option<u64>,
}

impl EndSessionRequest {
    /// An end-of-session signal without watermarks.
    pub fn closing(outcome: SessionOutcome) -> Self {
        Self {
            outcome,
            client_watermark: None,
            delivered_watermark: None,
        }
    }
}

/// Response to [`Step::EndSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndSessionResponse {
    /// True if the peer held state for the session and released it.
    pub released: bool,
}

/// Step-specific request body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", content = "payload", rename_all = "snake_case")]
pub enum RequestPayload {
    /// See [`Step::EnsureScope`].
    EnsureScope(EnsureScopeRequest),
    /// See [`Step::UploadPart`].
    UploadPart(UploadPartRequest),
    /// See [`Step::GetSummary`].
    GetSummary(GetSummaryRequest),
    /// See [`Step::DownloadPart`].
    DownloadPart(DownloadPartRequest),
    /// See [`Step::EndSession`].
    EndSession(EndSessionRequest),
}

impl RequestPayload {
    /// Returns the step of this payload.
    pub fn step(&self) -> Step {
        match self {
            RequestPayload::EnsureScope(_) => Step::EnsureScope,
            RequestPayload::UploadPart(_) => Step::UploadPart,
            RequestPayload::GetSummary(_) => Step::GetSummary,
            RequestPayload::DownloadPart(_) => Step::DownloadPart,
            RequestPayload::EndSession(_) => Step::EndSession,
        }
    }
}

/// A framed request as sent by the remote transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestFrame {
    /// Session identification.
    pub header: SessionHeader,
    /// Step and payload.
    pub body: RequestPayload,
}

impl RequestFrame {
    /// Creates a frame.
    pub fn new(header: SessionHeader, body: RequestPayload) -> Self {
        Self { header, body }
    }

    /// Returns the step of this frame.
    pub fn step(&self) -> Step {
        self.body.step()
    }

    /// Encodes the frame as JSON.
    pub fn to_json(&self) -> ProtocolResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a frame from JSON.
    pub fn from_json(bytes: &[u8]) -> ProtocolResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Step-specific response body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum ResponsePayload {
    /// Reply to [`Step::EnsureScope`].
    Scope(EnsureScopeResponse),
    /// Reply to [`Step::UploadPart`].
    UploadAck(UploadPartResponse),
    /// Reply to [`Step::GetSummary`].
    Summary(BatchSummary),
    /// Reply to [`Step::DownloadPart`].
    Part(BatchPart),
    /// Reply to [`Step::EndSession`].
    Ended(EndSessionResponse),
}

/// A framed response. Errors travel separately as [`ErrorBody`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFrame {
    /// Session the response belongs to.
    pub session_id: Uuid,
    /// Step-specific body.
    pub body: ResponsePayload,
}

impl ResponseFrame {
    /// Creates a frame.
    pub fn new(session_id: Uuid, body: ResponsePayload) -> Self {
        Self { session_id, body }
    }

    /// Encodes the frame as JSON.
    pub fn to_json(&self) -> ProtocolResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decodes a frame from JSON.
    pub fn from_json(bytes: &[u8]) -> ProtocolResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Application error reported by a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable snake_case error code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Whether the client may retry the same request.
    #[serde(default)]
    pub retryable: bool,
}

impl ErrorBody {
    /// Creates an error body.
    pub fn new(code: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable,
        }
    }
}

impl std::fmt::Display for ErrorBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::RowChange;

    #[test]
    fn step_codes() {
        for step in [
            Step::EnsureScope,
            Step::UploadPart,
            Step::GetSummary,
            Step::DownloadPart,
            Step::EndSession,
        ] {
            assert_eq!(Step::from_code(step.code()), Some(step));
        }
        assert_eq!(Step::EnsureScope.code(), 1);
        assert_eq!(Step::EndSession.code(), 5);
        assert_eq!(Step::from_code(0), None);
        assert_eq!(Step::from_code(6), None);
    }

    #[test]
    fn request_frame_carries_step_tag() {
        let header = SessionHeader::new(Uuid::new_v4(), Uuid::new_v4(), "main");
        let frame = RequestFrame::new(
            header,
            RequestPayload::DownloadPart(DownloadPartRequest { index: 2 }),
        );
        assert_eq!(frame.step(), Step::DownloadPart);

        let json: serde_json::Value = serde_json::from_slice(&frame.to_json().unwrap()).unwrap();
        assert_eq!(json["body"]["step"], "download_part");
        assert_eq!(json["body"]["payload"]["index"], 2);
        assert_eq!(json["header"]["scope_name"], "main");
    }

    #[test]
    fn upload_frame_decodes() {
        let header = SessionHeader::new(Uuid::new_v4(), Uuid::new_v4(), "main");
        let part = BatchPart {
            index: 0,
            is_last_part: true,
            table: Some("Product".into()),
            rows: vec![RowChange::delete("p1", 12)],
        };
        let frame = RequestFrame::new(
            header,
            RequestPayload::UploadPart(UploadPartRequest {
                parameters: SyncParameters::new().with("region", "eu"),
                part,
                since: Some(100),
            }),
        );
        let decoded = RequestFrame::from_json(&frame.to_json().unwrap()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn malformed_frame_is_codec_error() {
        let err = RequestFrame::from_json(br#"{"header":{}}"#).unwrap_err();
        assert!(matches!(err, crate::ProtocolError::Codec(_)));
    }

    #[test]
    fn error_body_display() {
        let body = ErrorBody::new("out_of_date", "client is out of date", false);
        assert_eq!(body.to_string(), "out_of_date: client is out of date");
    }
}
