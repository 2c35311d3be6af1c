//! Client sync session state machine.
//!
//! A [`SyncSession`] drives one exchange at a time:
//!
//! ```text
//! Idle -> Negotiating -> Uploading -> Downloading -> Applying -> Committing -> Completed
//!                  \_______________________^   (reinitialize: download only)
//! any active state -> Failed
//! ```
//!
//! Upload is strictly sequential. Download of the remote batch is the only
//! parallel region, bounded by `max_parallel_downloads`; apply starts only
//! after every part has arrived. The stored watermark is written once, in
//! `Committing`, so a failed or cancelled session leaves it untouched.

use crate::config::{ApplyErrorPolicy, SyncConfig, SyncType};
use crate::error::{SessionError, SyncError, SyncResult};
use crate::listener::ListenerRegistry;
use crate::negotiator::{self, ScopeNegotiator};
use crate::planner::BatchPlanner;
use crate::provider::DataProvider;
use crate::selector::{ChangeSelector, SelectionWindow};
use crate::spool::{BatchAssembler, BatchSpool};
use crate::transport::SyncTransport;
use futures::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use scopesync_protocol::{
    BatchSummary, ClientWatermark, DownloadPartRequest, EndSessionRequest, EnsureScopeRequest,
    GetSummaryRequest, RowFailure, ScopeDefinition, SessionHeader, SessionOutcome, Step,
    SyncParameters, SyncSetup, UploadPartRequest, WatermarkKey, SERVER_ORIGIN,
};
use scopesync_store::{MigrationRegistry, ScopeStore};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The state of a sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No session has run yet.
    Idle,
    /// Loading definitions and reconciling setups.
    Negotiating,
    /// Sending local changes.
    Uploading,
    /// Retrieving remote changes.
    Downloading,
    /// Writing remote changes to the local store.
    Applying,
    /// Persisting the new watermark.
    Committing,
    /// The last session completed.
    Completed,
    /// The last session failed.
    Failed,
}

impl SessionState {
    /// Returns true while a session is running.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SessionState::Negotiating
                | SessionState::Uploading
                | SessionState::Downloading
                | SessionState::Applying
                | SessionState::Committing
        )
    }

    /// Returns true if a new session can start.
    pub fn can_start(&self) -> bool {
        matches!(
            self,
            SessionState::Idle | SessionState::Completed | SessionState::Failed
        )
    }

    /// Returns true if `next` may follow this state.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (from, Negotiating) => from.can_start(),
            (Negotiating, Uploading | Downloading | Completed) => true,
            (Uploading, Downloading) => true,
            (Downloading, Applying) => true,
            (Applying, Committing) => true,
            (Committing, Completed) => true,
            (from, Failed) => from.is_active(),
            _ => false,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Statistics about sessions run by one [`SyncSession`].
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Sessions that completed.
    pub sessions_completed: u64,
    /// Sessions that failed or were cancelled.
    pub sessions_failed: u64,
    /// Rows the peer applied from uploads.
    pub rows_uploaded: u64,
    /// Rows applied locally from downloads.
    pub rows_downloaded: u64,
    /// Batch parts downloaded.
    pub parts_downloaded: u64,
    /// Rows that failed to apply on either side.
    pub apply_failures: u64,
    /// Setup conflicts raised during negotiation.
    pub setup_conflicts: u64,
    /// Transport calls retried.
    pub retries: u64,
    /// Time of the last completed session.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// Result of a completed session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    /// Session identifier.
    pub session_id: Uuid,
    /// Client identity used for the session.
    pub client_id: Uuid,
    /// Scope name.
    pub scope_name: String,
    /// Kind of session.
    pub sync_type: SyncType,
    /// True if a setup conflict was raised.
    pub conflict: bool,
    /// True if the session ended on a setup conflict without transferring data.
    pub aborted: bool,
    /// Parts sent.
    pub parts_uploaded: u64,
    /// Rows the peer applied.
    pub rows_uploaded: u64,
    /// Parts received.
    pub parts_downloaded: u64,
    /// Rows applied locally.
    pub rows_downloaded: u64,
    /// Uploaded rows the peer could not apply.
    pub upload_failures: Vec<RowFailure>,
    /// Downloaded rows that could not be applied locally.
    pub apply_failures: Vec<RowFailure>,
    /// Watermark after the session.
    pub watermark: ClientWatermark,
    /// Wall time of the session.
    pub duration: Duration,
}

impl SessionReport {
    fn new(header: &SessionHeader, sync_type: SyncType, watermark: ClientWatermark) -> Self {
        Self {
            session_id: header.session_id,
            client_id: header.client_id,
            scope_name: header.scope_name.clone(),
            sync_type,
            conflict: false,
            aborted: false,
            parts_uploaded: 0,
            rows_uploaded: 0,
            parts_downloaded: 0,
            rows_downloaded: 0,
            upload_failures: Vec::new(),
            apply_failures: Vec::new(),
            watermark,
            duration: Duration::ZERO,
        }
    }

    /// Returns true if any row failed on either side.
    pub fn has_failures(&self) -> bool {
        !self.upload_failures.is_empty() || !self.apply_failures.is_empty()
    }
}

/// Highest watermark that does not skip any failed row, never below `previous`.
fn clamp_watermark(target: u64, failures: &[RowFailure], previous: Option<u64>) -> u64 {
    let capped = failures
        .iter()
        .map(|f| f.timestamp.saturating_sub(1))
        .min()
        .map_or(target, |limit| limit.min(target));
    previous.map_or(capped, |previous| capped.max(previous))
}

/// Client side of the sync protocol.
pub struct SyncSession {
    config: SyncConfig,
    store: Arc<dyn ScopeStore>,
    provider: Arc<dyn DataProvider>,
    transport: Arc<dyn SyncTransport>,
    listeners: ListenerRegistry,
    migrations: Option<Arc<MigrationRegistry>>,
    state: RwLock<SessionState>,
    stats: RwLock<SyncStats>,
    client_id: Mutex<Option<Uuid>>,
}

impl std::fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncSession")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl SyncSession {
    /// Creates a session driver.
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn ScopeStore>,
        provider: Arc<dyn DataProvider>,
        transport: Arc<dyn SyncTransport>,
    ) -> SyncResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            store,
            provider,
            transport,
            listeners: ListenerRegistry::new(),
            migrations: None,
            state: RwLock::new(SessionState::Idle),
            stats: RwLock::new(SyncStats::default()),
            client_id: Mutex::new(None),
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
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns the current state.
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Returns the statistics.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    fn transition(&self, session_id: Uuid, to: SessionState) -> SyncResult<()> {
        let from = {
            let mut state = self.state.write();
            let from = *state;
            if !from.can_transition_to(to) {
                return Err(SyncError::InvalidStateTransition {
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
            *state = to;
            from
        };
        tracing::debug!(session_id = %session_id, %from, %to, "session state change");
        self.listeners.state_changed(session_id, from, to);
        Ok(())
    }

    /// Returns the client identity, resolving it on first use.
    ///
    /// The configured id wins. Otherwise the id of any stored watermark is
    /// reused, and a fresh id is generated only for a store without one.
    pub async fn client_id(&self) -> SyncResult<Uuid> {
        if let Some(id) = self.config.client_id {
            return Ok(id);
        }
        if let Some(id) = *self.client_id.lock() {
            return Ok(id);
        }
        let id = match self.store.get_all_watermarks().await?.first() {
            Some(watermark) => watermark.client_id,
            None => Uuid::new_v4(),
        };
        Ok(*self.client_id.lock().get_or_insert(id))
    }

    /// Runs a normal session that cannot be cancelled.
    pub async fn sync(
        &self,
        scope_name: &str,
        parameters: &SyncParameters,
    ) -> Result<SessionReport, SessionError> {
        self.run(scope_name, parameters, SyncType::Normal, CancellationToken::new())
            .await
    }

    /// Runs one session.
    ///
    /// Cancelling `cancel` aborts outstanding transfers and fails the session
    /// without touching the stored watermark.
    pub async fn run(
        &self,
        scope_name: &str,
        parameters: &SyncParameters,
        sync_type: SyncType,
        cancel: CancellationToken,
    ) -> Result<SessionReport, SessionError> {
        let session_id = Uuid::new_v4();
        let started = Instant::now();
        let fail = |phase: SessionState, source: SyncError| SessionError {
            scope_name: scope_name.to_string(),
            session_id,
            phase,
            source,
        };

        self.transition(session_id, SessionState::Negotiating)
            .map_err(|e| fail(self.state(), e))?;
        tracing::info!(session_id = %session_id, scope = %scope_name, ?sync_type, "starting sync session");

        let header = match self.client_id().await {
            Ok(client_id) => SessionHeader::new(session_id, client_id, scope_name),
            Err(source) => {
                let _ = self.transition(session_id, SessionState::Failed);
                self.record_failure(&source);
                return Err(fail(SessionState::Negotiating, source));
            }
        };

        match self
            .execute(&header, parameters, sync_type, &cancel, started)
            .await
        {
            Ok(report) => {
                {
                    let mut stats = self.stats.write();
                    stats.sessions_completed += 1;
                    stats.rows_uploaded += report.rows_uploaded;
                    stats.rows_downloaded += report.rows_downloaded;
                    stats.parts_downloaded += report.parts_downloaded;
                    stats.apply_failures +=
                        (report.upload_failures.len() + report.apply_failures.len()) as u64;
                    stats.last_sync_time = Some(Instant::now());
                    stats.last_error = None;
                }
                tracing::info!(
                    session_id = %session_id,
                    scope = %scope_name,
                    uploaded = report.rows_uploaded,
                    downloaded = report.rows_downloaded,
                    failures = report.upload_failures.len() + report.apply_failures.len(),
                    aborted = report.aborted,
                    duration_ms = report.duration.as_millis() as u64,
                    "sync session completed"
                );
                Ok(report)
            }
            Err(source) => {
                let phase = self.state();
                let _ = self.transition(session_id, SessionState::Failed);
                let outcome = if matches!(source, SyncError::Cancelled) {
                    SessionOutcome::Cancelled
                } else {
                    SessionOutcome::Failed
                };
                self.end_best_effort(&header, EndSessionRequest::closing(outcome))
                    .await;
                self.record_failure(&source);
                tracing::warn!(
                    session_id = %session_id,
                    scope = %scope_name,
                    %phase,
                    error = %source,
                    "sync session failed"
                );
                Err(fail(phase, source))
            }
        }
    }

    fn record_failure(&self, error: &SyncError) {
        let mut stats = self.stats.write();
        stats.sessions_failed += 1;
        stats.last_error = Some(error.to_string());
    }

    /// Calls the transport with a per-call timeout, retrying retryable failures.
    async fn call<T, F, Fut>(&self, cancel: &CancellationToken, step: Step, mut op: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let retry = &self.config.retry;
        let attempts = retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            let delay = retry.delay_for_attempt(attempt);
            if !delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                result = tokio::time::timeout(self.config.request_timeout, op()) => {
                    result.unwrap_or_else(|_| Err(SyncError::Timeout))
                }
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt + 1 < attempts => {
                    attempt += 1;
                    self.stats.write().retries += 1;
                    tracing::warn!(%step, attempt, error = %err, "retrying transport call");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Sends an end-of-session signal once, logging instead of failing.
    async fn end_best_effort(&self, header: &SessionHeader, request: EndSessionRequest) {
        let call = self.transport.end_session(header, &request);
        match tokio::time::timeout(self.config.request_timeout, call).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => {
                tracing::warn!(session_id = %header.session_id, error = %err, "end of session signal failed");
            }
            Err(_) => {
                tracing::warn!(session_id = %header.session_id, "end of session signal timed out");
            }
        }
    }

    async fn execute(
        &self,
        header: &SessionHeader,
        parameters: &SyncParameters,
        sync_type: SyncType,
        cancel: &CancellationToken,
        started: Instant,
    ) -> SyncResult<SessionReport> {
        let session_id = header.session_id;

        // Negotiating
        let (setup, previous, conflict) = match self.negotiate(header, parameters, sync_type, cancel).await? {
            Negotiation::Agreed {
                setup,
                watermark,
                conflict,
            } => (setup, watermark, conflict),
            Negotiation::Aborted { watermark } => {
                self.end_best_effort(header, EndSessionRequest::closing(SessionOutcome::Cancelled))
                    .await;
                self.transition(session_id, SessionState::Completed)?;
                let mut report = SessionReport::new(header, sync_type, watermark);
                report.conflict = true;
                report.aborted = true;
                report.duration = started.elapsed();
                return Ok(report);
            }
        };
        let mut report = SessionReport::new(header, sync_type, previous.clone());
        report.conflict = conflict;

        // Uploading
        let (summary, local_target) = match sync_type {
            SyncType::Normal => {
                self.transition(session_id, SessionState::Uploading)?;
                let t0 = self.provider.tracking_watermark().await?;
                let summary = self
                    .upload(header, parameters, &setup, &previous, t0, cancel, &mut report)
                    .await?;
                (summary, Some(t0))
            }
            SyncType::Reinitialize => {
                self.transition(session_id, SessionState::Downloading)?;
                let request = GetSummaryRequest {
                    parameters: parameters.clone(),
                    since: None,
                };
                let summary = self
                    .call(cancel, Step::GetSummary, || {
                        self.transport.get_summary(header, &request)
                    })
                    .await?;
                (summary, None)
            }
        };

        // Downloading
        if self.state() != SessionState::Downloading {
            self.transition(session_id, SessionState::Downloading)?;
        }
        let assembler = self.download(header, &setup, summary, cancel, &mut report).await?;
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        // Applying
        self.transition(session_id, SessionState::Applying)?;
        let mut applied = 0;
        let mut failures = Vec::new();
        for part in assembler.parts()? {
            let Some(table) = &part.table else {
                continue;
            };
            let outcome = self
                .provider
                .apply_changes(table, &part.rows, SERVER_ORIGIN)
                .await?;
            applied += outcome.applied;
            failures.extend(outcome.failures);
        }
        for failure in &failures {
            self.listeners.apply_failed(session_id, failure);
        }
        if !failures.is_empty() && self.config.apply_error_policy == ApplyErrorPolicy::FailSession {
            return Err(SyncError::Apply(failures));
        }
        report.rows_downloaded = applied;
        report.apply_failures = failures;

        // Committing
        self.transition(session_id, SessionState::Committing)?;
        let mut watermark = previous.clone();
        if let Some(t0) = local_target {
            let target = self.settled_local_watermark(&setup, parameters, t0).await?;
            watermark.last_local_watermark = Some(clamp_watermark(
                target,
                &report.upload_failures,
                previous.last_local_watermark,
            ));
        }
        watermark.last_remote_watermark = Some(clamp_watermark(
            assembler.summary().remote_watermark,
            &report.apply_failures,
            previous.last_remote_watermark,
        ));
        watermark.last_sync_time = Some(now_millis());
        watermark.last_sync_duration_ms = started.elapsed().as_millis() as u64;
        let watermark = self.store.upsert_watermark(&watermark).await?;

        self.end_best_effort(
            header,
            EndSessionRequest {
                outcome: SessionOutcome::Success,
                client_watermark: watermark.last_local_watermark,
                delivered_watermark: watermark.last_remote_watermark,
            },
        )
        .await;

        self.transition(session_id, SessionState::Completed)?;
        report.watermark = watermark;
        report.duration = started.elapsed();
        Ok(report)
    }

    /// Local position to commit after apply.
    ///
    /// Applying the download advances the local clock past `t0`. When every
    /// change in `(t0, now]` came from the server, `now` is committed so the
    /// next idle session does not move the watermark again. A local write in
    /// that window keeps `t0` so it is uploaded next time.
    async fn settled_local_watermark(
        &self,
        setup: &SyncSetup,
        parameters: &SyncParameters,
        t0: u64,
    ) -> SyncResult<u64> {
        let t1 = self.provider.tracking_watermark().await?;
        if t1 <= t0 {
            return Ok(t0);
        }
        let window = SelectionWindow {
            since: Some(t0),
            until: t1,
            exclude_origin: Some(SERVER_ORIGIN),
        };
        let pending = ChangeSelector::new(self.provider.as_ref())
            .select(setup, parameters, window)
            .await?;
        Ok(if pending.is_empty() { t1 } else { t0 })
    }

    async fn negotiate(
        &self,
        header: &SessionHeader,
        parameters: &SyncParameters,
        sync_type: SyncType,
        cancel: &CancellationToken,
    ) -> SyncResult<Negotiation> {
        let scope_name = &header.scope_name;
        let local =
            negotiator::load_scope(self.store.as_ref(), self.migrations.as_deref(), scope_name)
                .await?;

        let key = WatermarkKey::new(header.client_id, scope_name, parameters.hash());
        let watermark = match self.store.get_watermark(&key).await? {
            Some(watermark) => watermark,
            None => self.store.upsert_watermark(&ClientWatermark::new(key)).await?,
        };

        let request = EnsureScopeRequest {
            parameters: parameters.clone(),
            setup: self.config.setup.clone(),
        };
        let remote = self
            .call(cancel, Step::EnsureScope, || {
                self.transport.ensure_scope(header, &request)
            })
            .await?
            .scope;

        let reconciliation = ScopeNegotiator::new(self.config.setup_conflict_policy, &self.listeners)
            .reconcile(&local, &remote, self.config.setup.as_ref())?;
        if reconciliation.conflict {
            self.stats.write().setup_conflicts += 1;
        }
        let Some(setup) = reconciliation.setup else {
            tracing::info!(session_id = %header.session_id, scope = %scope_name, "session aborted on setup conflict");
            return Ok(Negotiation::Aborted { watermark });
        };

        let in_place = local
            .setup
            .as_ref()
            .is_some_and(|current| local.is_provisioned() && current.matches(&setup));
        if !in_place {
            negotiator::provision_scope(
                self.store.as_ref(),
                self.provider.as_ref(),
                local,
                setup.clone(),
            )
            .await?;
        }

        if sync_type == SyncType::Normal {
            check_out_of_date(&remote, &watermark)?;
        }

        Ok(Negotiation::Agreed {
            setup,
            watermark,
            conflict: reconciliation.conflict,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn upload(
        &self,
        header: &SessionHeader,
        parameters: &SyncParameters,
        setup: &SyncSetup,
        previous: &ClientWatermark,
        t0: u64,
        cancel: &CancellationToken,
        report: &mut SessionReport,
    ) -> SyncResult<BatchSummary> {
        let window = SelectionWindow {
            since: previous.last_local_watermark,
            until: t0,
            exclude_origin: Some(SERVER_ORIGIN),
        };
        let changes = ChangeSelector::new(self.provider.as_ref())
            .select(setup, parameters, window)
            .await?;

        let mut summary = None;
        for part in BatchPlanner::new(self.config.max_rows_per_batch_part).plan(changes) {
            if cancel.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            let index = part.index;
            let is_last_part = part.is_last_part;
            let request = UploadPartRequest {
                parameters: parameters.clone(),
                part,
                since: previous.last_remote_watermark,
            };
            let response = self
                .call(cancel, Step::UploadPart, || {
                    self.transport.upload_part(header, &request)
                })
                .await?;
            if response.ack.index != index {
                return Err(SyncError::Protocol(format!(
                    "part {index} was acknowledged as part {}",
                    response.ack.index
                )));
            }

            self.listeners.part_uploaded(header.session_id, &response.ack);
            report.parts_uploaded += 1;
            report.rows_uploaded += response.ack.applied_rows;
            report.upload_failures.extend(response.ack.failures);
            if is_last_part {
                summary = response.summary;
            }
        }

        summary.ok_or_else(|| {
            SyncError::Protocol("last part was acknowledged without a batch summary".into())
        })
    }

    async fn download(
        &self,
        header: &SessionHeader,
        setup: &SyncSetup,
        summary: BatchSummary,
        cancel: &CancellationToken,
        report: &mut SessionReport,
    ) -> SyncResult<BatchAssembler> {
        summary.validate()?;
        if let Some(table) = summary
            .parts
            .iter()
            .filter_map(|p| p.table.as_deref())
            .find(|table| setup.table(table).is_none())
        {
            return Err(SyncError::Protocol(format!(
                "batch contains table `{table}` outside the scope"
            )));
        }

        let concurrency = self.config.download_concurrency(summary.part_count());
        let indices: Vec<u32> = summary.parts.iter().map(|p| p.index).collect();
        let mut assembler = BatchAssembler::new(summary, BatchSpool::new(&self.config.spool)?);

        let mut downloads = stream::iter(indices.into_iter().map(move |index| async move {
            let request = DownloadPartRequest { index };
            self.call(cancel, Step::DownloadPart, || {
                self.transport.download_part(header, &request)
            })
            .await
        }))
        .buffer_unordered(concurrency);

        while let Some(result) = downloads.next().await {
            let part = result?;
            let info = part.info();
            if assembler.accept(part)? {
                self.listeners.part_downloaded(header.session_id, &info);
                report.parts_downloaded += 1;
            }
        }

        if !assembler.is_complete() {
            return Err(SyncError::Protocol(format!(
                "parts {:?} are missing after download",
                assembler.missing()
            )));
        }
        tracing::debug!(
            session_id = %header.session_id,
            parts = report.parts_downloaded,
            concurrency,
            "downloaded remote batch"
        );
        Ok(assembler)
    }

    /// Drops a scope locally: tracking infrastructure, definition and watermarks.
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
        let deleted = self.store.delete_scope(scope_name).await?;
        tracing::info!(scope = %scope_name, "dropped scope");
        Ok(deleted)
    }
}

enum Negotiation {
    Agreed {
        setup: SyncSetup,
        watermark: ClientWatermark,
        conflict: bool,
    },
    Aborted {
        watermark: ClientWatermark,
    },
}

fn check_out_of_date(remote: &ScopeDefinition, watermark: &ClientWatermark) -> SyncResult<()> {
    match (watermark.last_remote_watermark, remote.last_cleanup_watermark) {
        (Some(since), Some(cleanup)) if since < cleanup => Err(SyncError::OutOfDate {
            scope: remote.name.clone(),
            since,
            cleanup,
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(timestamp: u64) -> RowFailure {
        RowFailure {
            table: "Product".into(),
            key: format!("k{timestamp}"),
            timestamp,
            message: "rejected".into(),
        }
    }

    #[test]
    fn state_checks() {
        assert!(SessionState::Idle.can_start());
        assert!(SessionState::Failed.can_start());
        assert!(!SessionState::Uploading.can_start());
        assert!(SessionState::Downloading.is_active());
        assert!(!SessionState::Completed.is_active());
    }

    #[test]
    fn transitions_follow_the_session_order() {
        use SessionState::*;
        let path = [Idle, Negotiating, Uploading, Downloading, Applying, Committing, Completed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{} -> {}", pair[0], pair[1]);
        }
        assert!(Negotiating.can_transition_to(Downloading));
        assert!(Negotiating.can_transition_to(Completed));
        assert!(Applying.can_transition_to(Failed));
        assert!(!Idle.can_transition_to(Failed));
        assert!(!Uploading.can_transition_to(Applying));
        assert!(!Downloading.can_transition_to(Uploading));
        assert!(!Completed.can_transition_to(Completed));
    }

    #[test]
    fn clamp_holds_back_failed_rows() {
        assert_eq!(clamp_watermark(110, &[], Some(100)), 110);
        assert_eq!(clamp_watermark(110, &[failure(105), failure(107)], Some(100)), 104);
        assert_eq!(clamp_watermark(110, &[failure(101)], Some(103)), 103);
        assert_eq!(clamp_watermark(110, &[failure(3)], None), 2);
        assert_eq!(clamp_watermark(110, &[failure(200)], None), 110);
    }

    #[test]
    fn state_display_names() {
        assert_eq!(SessionState::Downloading.to_string(), "Downloading");
    }
}
