//! The responding side of the protocol.
//!
//! A [`SyncPeer`] answers the five protocol steps on behalf of a server store.
//! It keeps a small amount of state per session: the upload sequence with a
//! digest and acknowledgement per part, and the outbound batch prepared once
//! the client finished uploading. That state lives until the client ends the
//! session or the session idles past its time to live.

use crate::config::PeerConfig;
use crate::error::{SyncError, SyncResult};
use crate::listener::ListenerRegistry;
use crate::negotiator::{self, Comparison, ScopeNegotiator};
use crate::planner::BatchPlanner;
use crate::provider::DataProvider;
use crate::selector::{ChangeSelector, SelectionWindow};
use crate::session::now_millis;
use crate::spool::{part_digest, BatchSpool};
use parking_lot::Mutex;
use scopesync_protocol::{
    BatchPart, BatchSummary, ClientWatermark, DownloadPartRequest, EndSessionRequest,
    EndSessionResponse, EnsureScopeRequest, EnsureScopeResponse, GetSummaryRequest, PartAck,
    RequestFrame, RequestPayload, ResponseFrame, ResponsePayload, ScopeDefinition, SessionHeader,
    SessionOutcome, SyncParameters, SyncSetup, UploadPartRequest, UploadPartResponse,
    WatermarkKey,
};
use scopesync_store::{MigrationRegistry, ScopeStore};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// An outbound batch, immutable once prepared.
struct OutboundBatch {
    summary: BatchSummary,
    spool: BatchSpool,
}

struct PeerSession {
    client_id: Uuid,
    scope_name: String,
    parameters: SyncParameters,
    next_upload: u32,
    uploaded: BTreeMap<u32, ([u8; 32], PartAck)>,
    upload_done: bool,
    outbound: Option<Arc<OutboundBatch>>,
    created: Instant,
    last_seen: Instant,
}

impl PeerSession {
    fn new(header: &SessionHeader, parameters: SyncParameters) -> Self {
        let now = Instant::now();
        Self {
            client_id: header.client_id,
            scope_name: header.scope_name.clone(),
            parameters,
            next_upload: 0,
            uploaded: BTreeMap::new(),
            upload_done: false,
            outbound: None,
            created: now,
            last_seen: now,
        }
    }
}

/// Server side of the sync protocol.
pub struct SyncPeer {
    config: PeerConfig,
    store: Arc<dyn ScopeStore>,
    provider: Arc<dyn DataProvider>,
    sessions: Mutex<HashMap<Uuid, PeerSession>>,
    listeners: ListenerRegistry,
    migrations: Option<Arc<MigrationRegistry>>,
}

impl std::fmt::Debug for SyncPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncPeer")
            .field("config", &self.config)
            .field("sessions", &self.session_count())
            .finish()
    }
}

impl SyncPeer {
    /// Creates a peer.
    pub fn new(
        config: PeerConfig,
        store: Arc<dyn ScopeStore>,
        provider: Arc<dyn DataProvider>,
    ) -> SyncResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            store,
            provider,
            sessions: Mutex::new(HashMap::new()),
            listeners: ListenerRegistry::new(),
            migrations: None,
        })
    }

    /// Attaches listeners.
    pub fn with_listeners(mut self, listeners: ListenerRegistry) -> Self {
        self.listeners = listeners;
        self
    }

    /// Upgrades stored definitions with this registry when they are loaded.
    pub fn with_migrations(mut self, migrations: Arc<MigrationRegistry>) -> Self {
        self.migrations = Some(migrations);
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    /// Returns the scope store.
    pub fn store(&self) -> &Arc<dyn ScopeStore> {
        &self.store
    }

    /// Number of open sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Runs `f` against the session.
    ///
    /// Steps that carry parameters open the session on first contact; the
    /// others require it to be open already. A session is bound to one
    /// client, scope and parameter set.
    fn with_session<T>(
        &self,
        header: &SessionHeader,
        parameters: Option<&SyncParameters>,
        f: impl FnOnce(&mut PeerSession) -> SyncResult<T>,
    ) -> SyncResult<T> {
        let mut sessions = self.sessions.lock();
        let session = match (sessions.entry(header.session_id), parameters) {
            (Entry::Occupied(entry), _) => entry.into_mut(),
            (Entry::Vacant(entry), Some(parameters)) => {
                tracing::debug!(
                    session_id = %header.session_id,
                    client_id = %header.client_id,
                    scope = %header.scope_name,
                    "opening peer session"
                );
                entry.insert(PeerSession::new(header, parameters.clone()))
            }
            (Entry::Vacant(_), None) => {
                return Err(SyncError::Protocol(format!(
                    "session {} is not open",
                    header.session_id
                )))
            }
        };

        if session.client_id != header.client_id || session.scope_name != header.scope_name {
            return Err(SyncError::Protocol(format!(
                "session {} belongs to client {} on scope `{}`",
                header.session_id, session.client_id, session.scope_name
            )));
        }
        if let Some(parameters) = parameters {
            if &session.parameters != parameters {
                return Err(SyncError::Protocol(format!(
                    "session {} was opened with different parameters",
                    header.session_id
                )));
            }
        }
        session.last_seen = Instant::now();
        f(session)
    }

    async fn provisioned_scope(&self, scope_name: &str) -> SyncResult<(ScopeDefinition, SyncSetup)> {
        let scope =
            negotiator::load_scope(self.store.as_ref(), self.migrations.as_deref(), scope_name)
                .await?;
        match scope.setup.clone().filter(|_| scope.is_provisioned()) {
            Some(setup) => Ok((scope, setup)),
            None => Err(SyncError::Protocol(format!(
                "scope `{scope_name}` is not provisioned"
            ))),
        }
    }

    fn check_out_of_date(scope: &ScopeDefinition, since: Option<u64>) -> SyncResult<()> {
        match (since, scope.last_cleanup_watermark) {
            (Some(since), Some(cleanup)) if since < cleanup => Err(SyncError::OutOfDate {
                scope: scope.name.clone(),
                since,
                cleanup,
            }),
            _ => Ok(()),
        }
    }

    /// Resolves the server's definition of a scope.
    ///
    /// An unprovisioned scope is provisioned with the published setup, or the
    /// client's requested setup when none is published. A provisioned scope is
    /// compared against the published setup under the configured policy.
    pub async fn ensure_scope(
        &self,
        header: &SessionHeader,
        request: &EnsureScopeRequest,
    ) -> SyncResult<EnsureScopeResponse> {
        self.with_session(header, Some(&request.parameters), |_| Ok(()))?;

        let scope_name = &header.scope_name;
        let scope =
            negotiator::load_scope(self.store.as_ref(), self.migrations.as_deref(), scope_name)
                .await?;
        let published = self.config.setups.get(scope_name);

        let scope = match (scope.is_provisioned(), scope.setup.clone(), published) {
            (false, _, _) => {
                let setup = published.or(request.setup.as_ref()).cloned().ok_or_else(|| {
                    SyncError::Config(format!("no setup is published or requested for `{scope_name}`"))
                })?;
                negotiator::provision_scope(self.store.as_ref(), self.provider.as_ref(), scope, setup)
                    .await?
            }
            (true, Some(current), Some(published)) => {
                let negotiator =
                    ScopeNegotiator::new(self.config.setup_conflict_policy, &self.listeners);
                match negotiator.compare(scope_name, &current, published)? {
                    Comparison::Matched(_) => scope,
                    Comparison::Reconciled(setup) => {
                        negotiator::provision_scope(
                            self.store.as_ref(),
                            self.provider.as_ref(),
                            scope,
                            setup,
                        )
                        .await?
                    }
                    Comparison::Aborted => {
                        tracing::warn!(scope = %scope_name, "keeping stored setup over published setup");
                        scope
                    }
                }
            }
            _ => scope,
        };

        tracing::debug!(session_id = %header.session_id, scope = %scope_name, "ensured scope");
        Ok(EnsureScopeResponse { scope })
    }

    /// Applies one uploaded part.
    ///
    /// Parts must arrive in index order. A repeated part with identical
    /// content returns the recorded acknowledgement.
    pub async fn upload_part(
        &self,
        header: &SessionHeader,
        request: &UploadPartRequest,
    ) -> SyncResult<UploadPartResponse> {
        let part = &request.part;
        let digest = part_digest(part)?;

        let cached = self.with_session(header, Some(&request.parameters), |session| {
            if let Some((recorded, ack)) = session.uploaded.get(&part.index) {
                if recorded != &digest {
                    return Err(SyncError::Protocol(format!(
                        "part {} was uploaded twice with different content",
                        part.index
                    )));
                }
                let summary = session
                    .outbound
                    .as_ref()
                    .filter(|_| part.is_last_part)
                    .map(|o| o.summary.clone());
                return Ok(Some(UploadPartResponse {
                    ack: ack.clone(),
                    summary,
                }));
            }
            if session.upload_done {
                return Err(SyncError::Protocol(format!(
                    "part {} arrived after the last part",
                    part.index
                )));
            }
            if part.index != session.next_upload {
                return Err(SyncError::Protocol(format!(
                    "part {} is out of sequence, expected {}",
                    part.index, session.next_upload
                )));
            }
            Ok(None)
        })?;
        if let Some(response) = cached {
            tracing::debug!(session_id = %header.session_id, index = part.index, "repeated upload");
            if !part.is_last_part || response.summary.is_some() {
                return Ok(response);
            }
            // The previous attempt failed before its summary was prepared.
            let outbound = self
                .prepare_outbound(header, &request.parameters, request.since, Some(header.client_id))
                .await?;
            return Ok(UploadPartResponse {
                ack: response.ack,
                summary: Some(outbound.summary.clone()),
            });
        }

        let (scope, setup) = self.provisioned_scope(&header.scope_name).await?;
        if part.index == 0 {
            Self::check_out_of_date(&scope, request.since)?;
        }

        let ack = match &part.table {
            Some(table) => {
                if setup.table(table).is_none() {
                    return Err(SyncError::Protocol(format!(
                        "table `{table}` is not part of scope `{}`",
                        header.scope_name
                    )));
                }
                let outcome = self
                    .provider
                    .apply_changes(table, &part.rows, header.client_id)
                    .await?;
                PartAck {
                    index: part.index,
                    applied_rows: outcome.applied,
                    failures: outcome.failures,
                }
            }
            None if part.rows.is_empty() => PartAck {
                index: part.index,
                applied_rows: 0,
                failures: Vec::new(),
            },
            None => {
                return Err(SyncError::Protocol(format!(
                    "part {} carries rows but no table",
                    part.index
                )))
            }
        };
        for failure in &ack.failures {
            self.listeners.apply_failed(header.session_id, failure);
        }

        self.with_session(header, None, |session| {
            session.uploaded.insert(part.index, (digest, ack.clone()));
            session.next_upload = part.index + 1;
            session.upload_done = part.is_last_part;
            Ok(())
        })?;
        tracing::debug!(
            session_id = %header.session_id,
            index = part.index,
            applied = ack.applied_rows,
            failed = ack.failures.len(),
            last = part.is_last_part,
            "applied uploaded part"
        );

        let summary = if part.is_last_part {
            let outbound = self
                .prepare_outbound(header, &request.parameters, request.since, Some(header.client_id))
                .await?;
            Some(outbound.summary.clone())
        } else {
            None
        };
        Ok(UploadPartResponse { ack, summary })
    }

    /// Returns the outbound batch summary without an upload.
    pub async fn get_summary(
        &self,
        header: &SessionHeader,
        request: &GetSummaryRequest,
    ) -> SyncResult<BatchSummary> {
        let outbound = self
            .prepare_outbound(header, &request.parameters, request.since, None)
            .await?;
        Ok(outbound.summary.clone())
    }

    /// Selects, plans and spools the session's outbound batch, once.
    async fn prepare_outbound(
        &self,
        header: &SessionHeader,
        parameters: &SyncParameters,
        since: Option<u64>,
        exclude_origin: Option<Uuid>,
    ) -> SyncResult<Arc<OutboundBatch>> {
        if let Some(outbound) = self.with_session(header, Some(parameters), |s| Ok(s.outbound.clone()))? {
            return Ok(outbound);
        }

        let (scope, setup) = self.provisioned_scope(&header.scope_name).await?;
        Self::check_out_of_date(&scope, since)?;

        let snapshot = self.provider.tracking_watermark().await?;
        let window = SelectionWindow {
            since,
            until: snapshot,
            exclude_origin,
        };
        let changes = ChangeSelector::new(self.provider.as_ref())
            .select(&setup, parameters, window)
            .await?;

        let mut spool = BatchSpool::new(&self.config.spool)?;
        for part in BatchPlanner::new(self.config.max_rows_per_batch_part).plan(changes) {
            spool.put(&part)?;
        }
        let summary = BatchSummary::new(snapshot, spool.infos());
        tracing::debug!(
            session_id = %header.session_id,
            snapshot,
            parts = summary.part_count(),
            rows = summary.total_rows,
            "prepared outbound batch"
        );

        let outbound = Arc::new(OutboundBatch { summary, spool });
        self.with_session(header, None, |session| {
            Ok(session.outbound.get_or_insert_with(|| outbound.clone()).clone())
        })
    }

    /// Returns one part of the outbound batch. Safe to repeat.
    pub async fn download_part(
        &self,
        header: &SessionHeader,
        request: &DownloadPartRequest,
    ) -> SyncResult<BatchPart> {
        let outbound = self
            .with_session(header, None, |s| Ok(s.outbound.clone()))?
            .ok_or_else(|| {
                SyncError::Protocol(format!(
                    "session {} has no prepared batch",
                    header.session_id
                ))
            })?;
        outbound.spool.get(request.index)?.ok_or_else(|| {
            SyncError::Protocol(format!(
                "part {} is not in the batch of session {}",
                request.index, header.session_id
            ))
        })
    }

    /// Ends a session and releases its temporary storage.
    ///
    /// On success the peer records its own watermark for the client.
    pub async fn end_session(
        &self,
        header: &SessionHeader,
        request: &EndSessionRequest,
    ) -> SyncResult<EndSessionResponse> {
        let Some(session) = self.sessions.lock().remove(&header.session_id) else {
            return Ok(EndSessionResponse { released: false });
        };
        tracing::debug!(
            session_id = %header.session_id,
            outcome = ?request.outcome,
            "releasing peer session"
        );

        if request.outcome != SessionOutcome::Success {
            return Ok(EndSessionResponse { released: true });
        }
        if session.next_upload > 0 && !session.upload_done {
            return Err(SyncError::Protocol(format!(
                "session {} ended before its last part was uploaded",
                header.session_id
            )));
        }

        let key = WatermarkKey::new(
            header.client_id,
            &header.scope_name,
            session.parameters.hash(),
        );
        let mut watermark = ClientWatermark::new(key);
        watermark.last_local_watermark = request
            .delivered_watermark
            .or(session.outbound.as_ref().map(|o| o.summary.remote_watermark));
        watermark.last_remote_watermark = request.client_watermark;
        watermark.last_sync_time = Some(now_millis());
        watermark.last_sync_duration_ms = session.created.elapsed().as_millis() as u64;
        // Concurrent ends for the same key merge instead of overwriting.
        self.store.merge_watermark(&watermark).await?;

        Ok(EndSessionResponse { released: true })
    }

    /// Dispatches a framed request.
    pub async fn handle_frame(&self, frame: RequestFrame) -> SyncResult<ResponseFrame> {
        let header = &frame.header;
        tracing::debug!(
            session_id = %header.session_id,
            step = %frame.step(),
            "handling request"
        );
        let body = match &frame.body {
            RequestPayload::EnsureScope(request) => {
                ResponsePayload::Scope(self.ensure_scope(header, request).await?)
            }
            RequestPayload::UploadPart(request) => {
                ResponsePayload::UploadAck(self.upload_part(header, request).await?)
            }
            RequestPayload::GetSummary(request) => {
                ResponsePayload::Summary(self.get_summary(header, request).await?)
            }
            RequestPayload::DownloadPart(request) => {
                ResponsePayload::Part(self.download_part(header, request).await?)
            }
            RequestPayload::EndSession(request) => {
                ResponsePayload::Ended(self.end_session(header, request).await?)
            }
        };
        Ok(ResponseFrame::new(header.session_id, body))
    }

    /// Purges change-tracking metadata every client of the scope has received.
    ///
    /// Records the purge point as the scope's cleanup watermark. Clients
    /// behind it must reinitialize. Returns the number of entries purged.
    pub async fn cleanup_metadata(&self, scope_name: &str) -> SyncResult<u64> {
        let (mut scope, setup) = self.provisioned_scope(scope_name).await?;
        let watermarks = self.store.get_scope_watermarks(scope_name).await?;
        let Some(up_to) = watermarks.iter().filter_map(|w| w.last_local_watermark).min() else {
            return Ok(0);
        };

        let purged = self.provider.purge_tracking(&setup, up_to).await?;
        scope.last_cleanup_watermark = scope.last_cleanup_watermark.max(Some(up_to));
        self.store.upsert_scope(&scope).await?;

        tracing::info!(scope = %scope_name, up_to, purged, "cleaned up tracking metadata");
        Ok(purged)
    }

    /// Drops a scope: tracking infrastructure, definition, watermarks and open sessions.
    ///
    /// Returns false if the scope did not exist.
    pub async fn drop_scope(&self, scope_name: &str) -> SyncResult<bool> {
        let Some(scope) = self.store.get_scope(scope_name).await? else {
            return Ok(false);
        };
        if let Some(setup) = &scope.setup {
            self.provider.deprovision(setup).await?;
        }
        for watermark in self.store.get_scope_watermarks(scope_name).await? {
            self.store.delete_watermark(&watermark.key()).await?;
        }
        self.sessions.lock().retain(|_, s| s.scope_name != scope_name);
        let deleted = self.store.delete_scope(scope_name).await?;
        tracing::info!(scope = %scope_name, "dropped scope");
        Ok(deleted)
    }

    /// Drops sessions idle for longer than the configured time to live.
    pub fn purge_expired(&self) -> usize {
        let ttl = self.config.session_ttl;
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|id, session| {
            let keep = session.last_seen.elapsed() <= ttl;
            if !keep {
                tracing::debug!(session_id = %id, "reaping idle peer session");
            }
            keep
        });
        before - sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MemoryProvider;
    use scopesync_protocol::{ColumnSchema, RowChange, TableSchema};
    use scopesync_store::MemoryScopeStore;
    use std::time::Duration;

    struct Fixture {
        peer: SyncPeer,
        provider: Arc<MemoryProvider>,
        store: Arc<MemoryScopeStore>,
    }

    fn fixture(config: PeerConfig) -> Fixture {
        let provider = Arc::new(MemoryProvider::with_clock(100));
        provider.create_table(TableSchema::new(
            "Product",
            vec![ColumnSchema::new("id", "text").primary_key()],
        ));
        let store = Arc::new(MemoryScopeStore::new());
        let peer = SyncPeer::new(
            config.with_setup("main", SyncSetup::new(["Product"])),
            store.clone(),
            provider.clone(),
        )
        .unwrap();
        Fixture {
            peer,
            provider,
            store,
        }
    }

    fn header() -> SessionHeader {
        SessionHeader::new(Uuid::new_v4(), Uuid::new_v4(), "main")
    }

    fn upload(index: u32, last: bool, keys: &[&str]) -> UploadPartRequest {
        let rows: Vec<RowChange> = keys
            .iter()
            .map(|k| RowChange::upsert(*k, BTreeMap::new(), 1))
            .collect();
        UploadPartRequest {
            parameters: SyncParameters::new(),
            part: BatchPart {
                index,
                is_last_part: last,
                table: (!rows.is_empty()).then(|| "Product".to_string()),
                rows,
            },
            since: None,
        }
    }

    async fn ensure(peer: &SyncPeer, header: &SessionHeader) -> ScopeDefinition {
        peer.ensure_scope(
            header,
            &EnsureScopeRequest {
                parameters: SyncParameters::new(),
                setup: None,
            },
        )
        .await
        .unwrap()
        .scope
    }

    #[tokio::test]
    async fn ensure_scope_provisions_published_setup() {
        let f = fixture(PeerConfig::new());
        let scope = ensure(&f.peer, &header()).await;
        assert!(scope.is_provisioned());
        assert!(f.provider.is_provisioned("Product"));
        assert_eq!(f.store.scope_count(), 1);
    }

    #[tokio::test]
    async fn upload_sequence_is_enforced() {
        let f = fixture(PeerConfig::new());
        let h = header();
        ensure(&f.peer, &h).await;

        let err = f.peer.upload_part(&h, &upload(1, false, &["a"])).await.unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));

        let first = f.peer.upload_part(&h, &upload(0, false, &["a"])).await.unwrap();
        assert_eq!(first.ack.applied_rows, 1);
        assert!(first.summary.is_none());

        // Same content again: cached ack, nothing re-applied.
        let clock = f.provider.clock();
        let again = f.peer.upload_part(&h, &upload(0, false, &["a"])).await.unwrap();
        assert_eq!(again.ack, first.ack);
        assert_eq!(f.provider.clock(), clock);

        let err = f.peer.upload_part(&h, &upload(0, false, &["b"])).await.unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }

    #[tokio::test]
    async fn last_part_returns_summary_without_echo() {
        let f = fixture(PeerConfig::new().with_max_rows_per_batch_part(2));
        f.provider.upsert_row("Product", "s1", BTreeMap::new()).unwrap();
        f.provider.upsert_row("Product", "s2", BTreeMap::new()).unwrap();
        f.provider.upsert_row("Product", "s3", BTreeMap::new()).unwrap();

        let h = header();
        ensure(&f.peer, &h).await;
        let response = f.peer.upload_part(&h, &upload(0, true, &["c1"])).await.unwrap();
        let summary = response.summary.unwrap();

        // The uploaded row is not sent back.
        assert_eq!(summary.total_rows, 3);
        assert_eq!(summary.part_count(), 2);
        assert_eq!(summary.remote_watermark, f.provider.clock());

        let part = f
            .peer
            .download_part(&h, &DownloadPartRequest { index: 1 })
            .await
            .unwrap();
        assert!(part.is_last_part);
        assert_eq!(part.row_count(), 1);

        assert!(f
            .peer
            .download_part(&h, &DownloadPartRequest { index: 2 })
            .await
            .is_err());
    }

    #[tokio::test]
    async fn end_session_records_server_watermark() {
        let f = fixture(PeerConfig::new());
        let h = header();
        ensure(&f.peer, &h).await;
        f.peer.upload_part(&h, &upload(0, true, &[])).await.unwrap();

        let ended = f
            .peer
            .end_session(
                &h,
                &EndSessionRequest {
                    outcome: SessionOutcome::Success,
                    client_watermark: Some(42),
                    delivered_watermark: None,
                },
            )
            .await
            .unwrap();
        assert!(ended.released);
        assert_eq!(f.peer.session_count(), 0);

        let key = WatermarkKey::new(h.client_id, "main", SyncParameters::new().hash());
        let watermark = f.store.get_watermark(&key).await.unwrap().unwrap();
        assert_eq!(watermark.last_remote_watermark, Some(42));
        assert_eq!(watermark.last_local_watermark, Some(100));
        assert!(!watermark.is_new());

        let again = f
            .peer
            .end_session(&h, &EndSessionRequest::closing(SessionOutcome::Success))
            .await
            .unwrap();
        assert!(!again.released);
    }

    #[tokio::test]
    async fn concurrent_ends_never_lower_the_server_watermark() {
        let f = Arc::new(fixture(PeerConfig::new()));
        let client_id = Uuid::new_v4();
        let headers: Vec<SessionHeader> = (0..6)
            .map(|_| SessionHeader::new(Uuid::new_v4(), client_id, "main"))
            .collect();
        for h in &headers {
            ensure(&f.peer, h).await;
            f.peer.upload_part(h, &upload(0, true, &[])).await.unwrap();
        }

        let mut handles = Vec::new();
        for (i, h) in headers.into_iter().enumerate() {
            let f = Arc::clone(&f);
            handles.push(tokio::spawn(async move {
                let request = EndSessionRequest {
                    outcome: SessionOutcome::Success,
                    client_watermark: Some(10 + i as u64),
                    delivered_watermark: Some(200 - i as u64),
                };
                f.peer.end_session(&h, &request).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let key = WatermarkKey::new(client_id, "main", SyncParameters::new().hash());
        let watermark = f.store.get_watermark(&key).await.unwrap().unwrap();
        assert_eq!(watermark.last_remote_watermark, Some(15));
        assert_eq!(watermark.last_local_watermark, Some(200));
        assert_eq!(f.store.watermark_count(), 1);
    }

    #[tokio::test]
    async fn unknown_sessions_are_not_opened_by_downloads() {
        let f = fixture(PeerConfig::new());
        let h = header();
        let err = f
            .peer
            .download_part(&h, &DownloadPartRequest { index: 0 })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Protocol(ref message) if message.contains("not open")));
        assert_eq!(f.peer.session_count(), 0);

        let ended = f
            .peer
            .end_session(&h, &EndSessionRequest::closing(SessionOutcome::Failed))
            .await
            .unwrap();
        assert!(!ended.released);
        assert_eq!(f.peer.session_count(), 0);
    }

    #[tokio::test]
    async fn early_success_is_a_protocol_error() {
        let f = fixture(PeerConfig::new());
        let h = header();
        ensure(&f.peer, &h).await;
        f.peer.upload_part(&h, &upload(0, false, &["a"])).await.unwrap();
        let err = f
            .peer
            .end_session(&h, &EndSessionRequest::closing(SessionOutcome::Success))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }

    #[tokio::test]
    async fn cleanup_marks_old_clients_out_of_date() {
        let f = fixture(PeerConfig::new());
        let h = header();
        ensure(&f.peer, &h).await;
        f.provider.upsert_row("Product", "p1", BTreeMap::new()).unwrap();
        f.provider.delete_row("Product", "p1").unwrap();

        f.peer.upload_part(&h, &upload(0, true, &[])).await.unwrap();
        f.peer
            .end_session(&h, &EndSessionRequest::closing(SessionOutcome::Success))
            .await
            .unwrap();

        assert_eq!(f.peer.cleanup_metadata("main").await.unwrap(), 1);
        let scope = f.store.get_scope("main").await.unwrap().unwrap();
        assert_eq!(scope.last_cleanup_watermark, Some(102));

        let late = header();
        let mut request = upload(0, true, &[]);
        request.since = Some(50);
        let err = f.peer.upload_part(&late, &request).await.unwrap_err();
        assert!(matches!(err, SyncError::OutOfDate { cleanup: 102, .. }));
    }

    #[tokio::test]
    async fn idle_sessions_are_reaped() {
        let f = fixture(PeerConfig::new().with_session_ttl(Duration::ZERO));
        ensure(&f.peer, &header()).await;
        assert_eq!(f.peer.session_count(), 1);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(f.peer.purge_expired(), 1);
    }

    #[tokio::test]
    async fn drop_scope_removes_everything() {
        let f = fixture(PeerConfig::new());
        let h = header();
        ensure(&f.peer, &h).await;
        f.peer.upload_part(&h, &upload(0, true, &[])).await.unwrap();
        f.peer
            .end_session(&h, &EndSessionRequest::closing(SessionOutcome::Success))
            .await
            .unwrap();

        assert!(f.peer.drop_scope("main").await.unwrap());
        assert_eq!(f.store.scope_count(), 0);
        assert_eq!(f.store.watermark_count(), 0);
        assert!(!f.provider.is_provisioned("Product"));
        assert!(!f.peer.drop_scope("main").await.unwrap());
    }

    #[tokio::test]
    async fn frames_dispatch_to_steps() {
        let f = fixture(PeerConfig::new());
        let h = header();
        let frame = RequestFrame::new(
            h.clone(),
            RequestPayload::EnsureScope(EnsureScopeRequest {
                parameters: SyncParameters::new(),
                setup: None,
            }),
        );
        let response = f.peer.handle_frame(frame).await.unwrap();
        assert_eq!(response.session_id, h.session_id);
        assert!(matches!(response.body, ResponsePayload::Scope(_)));
    }
}
