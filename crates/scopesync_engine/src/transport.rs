//! Transport layer abstraction for sync sessions.

use crate::error::SyncResult;
use crate::peer::SyncPeer;
use async_trait::async_trait;
use scopesync_protocol::{
    BatchPart, BatchSummary, DownloadPartRequest, EndSessionRequest, EndSessionResponse,
    EnsureScopeRequest, EnsureScopeResponse, GetSummaryRequest, SessionHeader, UploadPartRequest,
    UploadPartResponse,
};
use std::sync::Arc;

/// A sync transport carries the five protocol steps to a peer.
///
/// This trait abstracts the channel, allowing for different implementations
/// (in-process, HTTP, wrappers for testing). Implementations make a single
/// attempt per call; retries and timeouts are applied by the session.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Resolves the peer's definition of the scope.
    async fn ensure_scope(
        &self,
        header: &SessionHeader,
        request: &EnsureScopeRequest,
    ) -> SyncResult<EnsureScopeResponse>;

    /// Uploads one part. The response to the last part carries the peer's batch summary.
    async fn upload_part(
        &self,
        header: &SessionHeader,
        request: &UploadPartRequest,
    ) -> SyncResult<UploadPartResponse>;

    /// Fetches the peer's batch summary without uploading.
    async fn get_summary(
        &self,
        header: &SessionHeader,
        request: &GetSummaryRequest,
    ) -> SyncResult<BatchSummary>;

    /// Fetches one part of the peer's batch.
    async fn download_part(
        &self,
        header: &SessionHeader,
        request: &DownloadPartRequest,
    ) -> SyncResult<BatchPart>;

    /// Ends the session so the peer can release its temporary storage.
    async fn end_session(
        &self,
        header: &SessionHeader,
        request: &EndSessionRequest,
    ) -> SyncResult<EndSessionResponse>;
}

/// In-process transport that calls a peer directly, without serialization.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    peer: Arc<SyncPeer>,
}

impl LocalTransport {
    /// Creates a transport over a peer.
    pub fn new(peer: Arc<SyncPeer>) -> Self {
        Self { peer }
    }

    /// Returns the peer.
    pub fn peer(&self) -> &Arc<SyncPeer> {
        &self.peer
    }
}

#[async_trait]
impl SyncTransport for LocalTransport {
    async fn ensure_scope(
        &self,
        header: &SessionHeader,
        request: &EnsureScopeRequest,
    ) -> SyncResult<EnsureScopeResponse> {
        self.peer.ensure_scope(header, request).await
    }

    async fn upload_part(
        &self,
        header: &SessionHeader,
        request: &UploadPartRequest,
    ) -> SyncResult<UploadPartResponse> {
        self.peer.upload_part(header, request).await
    }

    async fn get_summary(
        &self,
        header: &SessionHeader,
        request: &GetSummaryRequest,
    ) -> SyncResult<BatchSummary> {
        self.peer.get_summary(header, request).await
    }

    async fn download_part(
        &self,
        header: &SessionHeader,
        request: &DownloadPartRequest,
    ) -> SyncResult<BatchPart> {
        self.peer.download_part(header, request).await
    }

    async fn end_session(
        &self,
        header: &SessionHeader,
        request: &EndSessionRequest,
    ) -> SyncResult<EndSessionResponse> {
        self.peer.end_session(header, request).await
    }
}
