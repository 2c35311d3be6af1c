//! HTTP transport implementation.
//!
//! Every protocol step is a JSON [`RequestFrame`] posted to `{base_url}/sync`.
//! A 2xx reply carries a [`ResponseFrame`]; any other status carries an
//! [`ErrorBody`], surfaced as [`SyncError::Remote`] so that peer-reported
//! application errors stay distinct from transport failures.
//!
//! The actual HTTP client is abstracted via a trait to allow different
//! implementations ([`ReqwestClient`] over the network, [`LoopbackClient`]
//! straight into an in-process peer).

use crate::error::{SyncError, SyncResult};
use crate::peer::SyncPeer;
use crate::transport::SyncTransport;
use async_trait::async_trait;
use scopesync_protocol::{
    BatchPart, BatchSummary, DownloadPartRequest, EndSessionRequest, EndSessionResponse,
    EnsureScopeRequest, EnsureScopeResponse, ErrorBody, GetSummaryRequest, RequestFrame,
    RequestPayload, ResponseFrame, ResponsePayload, SessionHeader, UploadPartRequest,
    UploadPartResponse,
};
use std::sync::Arc;

/// Path of the single sync endpoint.
pub const SYNC_PATH: &str = "/sync";

/// Status and body of an HTTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpReply {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: Vec<u8>,
}

impl HttpReply {
    /// Creates a reply.
    pub fn new(status: u16, body: Vec<u8>) -> Self {
        Self { status, body }
    }

    /// Creates a reply carrying an error body.
    pub fn error(status: u16, body: &ErrorBody) -> Self {
        let bytes = serde_json::to_vec(body).unwrap_or_else(|_| body.message.clone().into_bytes());
        Self::new(status, bytes)
    }

    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP transport. An `Err` means
/// no reply was received at all and is treated as retryable.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a POST request with a JSON body.
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<HttpReply, String>;
}

/// HTTP-based sync transport.
pub struct HttpTransport<C: HttpClient> {
    /// Base URL of the sync server (e.g., "https://sync.example.com").
    base_url: String,
    client: C,
}

impl<C: HttpClient> std::fmt::Debug for HttpTransport<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a new HTTP transport.
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self {
            base_url: base_url.into(),
            client,
        }
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn exchange(
        &self,
        header: &SessionHeader,
        body: RequestPayload,
    ) -> SyncResult<ResponsePayload> {
        let step = body.step();
        let frame = RequestFrame::new(header.clone(), body);
        let bytes = frame.to_json()?;

        let url = format!("{}{}", self.base_url.trim_end_matches('/'), SYNC_PATH);
        let reply = self
            .client
            .post(&url, bytes)
            .await
            .map_err(SyncError::transport_retryable)?;

        if !reply.is_success() {
            return Err(match serde_json::from_slice::<ErrorBody>(&reply.body) {
                Ok(body) => SyncError::Remote(body),
                Err(_) if reply.status >= 500 => {
                    SyncError::transport_retryable(format!("{step} failed with HTTP {}", reply.status))
                }
                Err(_) => {
                    SyncError::transport_fatal(format!("{step} failed with HTTP {}", reply.status))
                }
            });
        }

        let response = ResponseFrame::from_json(&reply.body)?;
        if response.session_id != header.session_id {
            return Err(SyncError::Protocol(format!(
                "{step} response belongs to session {}",
                response.session_id
            )));
        }
        Ok(response.body)
    }
}

fn unexpected(step: &str, body: &ResponsePayload) -> SyncError {
    let kind = match body {
        ResponsePayload::Scope(_) => "scope",
        ResponsePayload::UploadAck(_) => "upload_ack",
        ResponsePayload::Summary(_) => "summary",
        ResponsePayload::Part(_) => "part",
        ResponsePayload::Ended(_) => "ended",
    };
    SyncError::Protocol(format!("unexpected `{kind}` response to {step}"))
}

#[async_trait]
impl<C: HttpClient> SyncTransport for HttpTransport<C> {
    async fn ensure_scope(
        &self,
        header: &SessionHeader,
        request: &EnsureScopeRequest,
    ) -> SyncResult<EnsureScopeResponse> {
        match self
            .exchange(header, RequestPayload::EnsureScope(request.clone()))
            .await?
        {
            ResponsePayload::Scope(response) => Ok(response),
            other => Err(unexpected("EnsureScope", &other)),
        }
    }

    async fn upload_part(
        &self,
        header: &SessionHeader,
        request: &UploadPartRequest,
    ) -> SyncResult<UploadPartResponse> {
        match self
            .exchange(header, RequestPayload::UploadPart(request.clone()))
            .await?
        {
            ResponsePayload::UploadAck(response) => Ok(response),
            other => Err(unexpected("UploadPart", &other)),
        }
    }

    async fn get_summary(
        &self,
        header: &SessionHeader,
        request: &GetSummaryRequest,
    ) -> SyncResult<BatchSummary> {
        match self
            .exchange(header, RequestPayload::GetSummary(request.clone()))
            .await?
        {
            ResponsePayload::Summary(summary) => Ok(summary),
            other => Err(unexpected("GetSummary", &other)),
        }
    }

    async fn download_part(
        &self,
        header: &SessionHeader,
        request: &DownloadPartRequest,
    ) -> SyncResult<BatchPart> {
        match self
            .exchange(header, RequestPayload::DownloadPart(*request))
            .await?
        {
            ResponsePayload::Part(part) => Ok(part),
            other => Err(unexpected("DownloadPart", &other)),
        }
    }

    async fn end_session(
        &self,
        header: &SessionHeader,
        request: &EndSessionRequest,
    ) -> SyncResult<EndSessionResponse> {
        match self
            .exchange(header, RequestPayload::EndSession(*request))
            .await?
        {
            ResponsePayload::Ended(response) => Ok(response),
            other => Err(unexpected("EndSession", &other)),
        }
    }
}

/// Trait for servers that can handle loopback requests.
#[async_trait]
pub trait LoopbackServer: Send + Sync {
    /// Handles a POST request and returns the reply.
    async fn handle_post(&self, path: &str, body: &[u8]) -> HttpReply;
}

#[async_trait]
impl<S: LoopbackServer + ?Sized> LoopbackServer for Arc<S> {
    async fn handle_post(&self, path: &str, body: &[u8]) -> HttpReply {
        (**self).handle_post(path, body).await
    }
}

#[async_trait]
impl LoopbackServer for SyncPeer {
    async fn handle_post(&self, path: &str, body: &[u8]) -> HttpReply {
        if path.trim_end_matches('/') != SYNC_PATH {
            return HttpReply::error(404, &ErrorBody::new("not_found", path, false));
        }
        let frame = match RequestFrame::from_json(body) {
            Ok(frame) => frame,
            Err(err) => {
                let err = SyncError::from(err);
                return HttpReply::error(err.http_status(), &err.to_error_body());
            }
        };
        let reply = self
            .handle_frame(frame)
            .await
            .and_then(|response| response.to_json().map_err(SyncError::from));
        match reply {
            Ok(bytes) => HttpReply::new(200, bytes),
            Err(err) => {
                tracing::debug!(error = %err, "request failed");
                HttpReply::error(err.http_status(), &err.to_error_body())
            }
        }
    }
}

/// A loopback HTTP client that routes requests directly to a server.
///
/// Useful for testing without actual network overhead while still going
/// through the JSON framing.
#[derive(Debug, Clone)]
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self { server }
    }
}

#[async_trait]
impl<S: LoopbackServer> HttpClient for LoopbackClient<S> {
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<HttpReply, String> {
        // Strip scheme and authority.
        let path = url
            .find("://")
            .and_then(|scheme| url[scheme + 3..].find('/').map(|i| &url[scheme + 3 + i..]))
            .unwrap_or(url);
        Ok(self.server.handle_post(path, &body).await)
    }
}

/// [`HttpClient`] over `reqwest`.
#[derive(Debug, Clone, Default)]
pub struct ReqwestClient {
    http: reqwest::Client,
}

impl ReqwestClient {
    /// Creates a client with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps a configured `reqwest` client.
    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<HttpReply, String> {
        let response = self
            .http
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|e| e.to_string())?;
        Ok(HttpReply::new(status, body.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerConfig;
    use crate::provider::MemoryProvider;
    use scopesync_protocol::{ColumnSchema, SyncParameters, SyncSetup, TableSchema};
    use scopesync_store::MemoryScopeStore;
    use uuid::Uuid;

    fn peer() -> Arc<SyncPeer> {
        let provider = Arc::new(MemoryProvider::new());
        provider.create_table(TableSchema::new(
            "Product",
            vec![ColumnSchema::new("id", "text").primary_key()],
        ));
        let config = PeerConfig::new().with_setup("main", SyncSetup::new(["Product"]));
        Arc::new(SyncPeer::new(config, Arc::new(MemoryScopeStore::new()), provider).unwrap())
    }

    struct Status(u16, &'static [u8]);

    #[async_trait]
    impl HttpClient for Status {
        async fn post(&self, _url: &str, _body: Vec<u8>) -> Result<HttpReply, String> {
            Ok(HttpReply::new(self.0, self.1.to_vec()))
        }
    }

    struct Unreachable;

    #[async_trait]
    impl HttpClient for Unreachable {
        async fn post(&self, _url: &str, _body: Vec<u8>) -> Result<HttpReply, String> {
            Err("connection refused".into())
        }
    }

    fn header() -> SessionHeader {
        SessionHeader::new(Uuid::new_v4(), Uuid::new_v4(), "main")
    }

    fn ensure_request() -> EnsureScopeRequest {
        EnsureScopeRequest {
            parameters: SyncParameters::new(),
            setup: None,
        }
    }

    #[tokio::test]
    async fn loopback_round_trip() {
        let transport = HttpTransport::new("http://sync.local/", LoopbackClient::new(peer()));
        let response = transport
            .ensure_scope(&header(), &ensure_request())
            .await
            .unwrap();
        assert!(response.scope.is_provisioned());
    }

    #[tokio::test]
    async fn peer_errors_arrive_as_remote() {
        let transport = HttpTransport::new("http://sync.local", LoopbackClient::new(peer()));
        let h = header();
        transport.ensure_scope(&h, &ensure_request()).await.unwrap();
        let err = transport
            .download_part(&h, &DownloadPartRequest { index: 0 })
            .await
            .unwrap_err();
        match err {
            SyncError::Remote(body) => {
                assert_eq!(body.code, "protocol_error");
                assert!(!body.retryable);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unknown_paths_are_not_found() {
        let reply = peer().handle_post("/other", b"{}").await;
        assert_eq!(reply.status, 404);
        let reply = peer().handle_post("/sync", b"not json").await;
        assert_eq!(reply.status, 400);
    }

    #[tokio::test]
    async fn transport_failures_are_classified() {
        let transport = HttpTransport::new("http://sync.local", Unreachable);
        let err = transport.ensure_scope(&header(), &ensure_request()).await.unwrap_err();
        assert!(err.is_retryable());

        let transport = HttpTransport::new("http://sync.local", Status(502, b"bad gateway"));
        let err = transport.ensure_scope(&header(), &ensure_request()).await.unwrap_err();
        assert!(matches!(err, SyncError::Transport { retryable: true, .. }));

        let transport = HttpTransport::new("http://sync.local", Status(403, b"forbidden"));
        let err = transport.ensure_scope(&header(), &ensure_request()).await.unwrap_err();
        assert!(matches!(err, SyncError::Transport { retryable: false, .. }));
    }

    #[tokio::test]
    async fn mismatched_response_kind_is_a_protocol_error() {
        let h = header();
        let frame = ResponseFrame::new(
            h.session_id,
            ResponsePayload::Ended(EndSessionResponse { released: true }),
        );
        let body: &'static [u8] = Box::leak(frame.to_json().unwrap().into_boxed_slice());
        let transport = HttpTransport::new("http://sync.local", Status(200, body));
        let err = transport.ensure_scope(&h, &ensure_request()).await.unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }
}
