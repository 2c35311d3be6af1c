//! The scope store trait.

use crate::error::StoreResult;
use async_trait::async_trait;
use scopesync_protocol::{ClientWatermark, ScopeDefinition, WatermarkKey};

/// Persistence for scope definitions and client watermarks.
///
/// Each side of a sync relationship owns one store. Every operation is atomic
/// with respect to concurrent callers: two upserts of the same key serialize.
/// Implementations create their backing tables on first access, so callers
/// never need to provision a store before using it.
#[async_trait]
pub trait ScopeStore: Send + Sync {
    /// Creates the backing tables if they do not exist. Idempotent.
    async fn ensure_tables(&self) -> StoreResult<()>;

    /// Loads a scope definition by name.
    async fn get_scope(&self, name: &str) -> StoreResult<Option<ScopeDefinition>>;

    /// Loads every scope definition, ordered by name.
    async fn get_all_scopes(&self) -> StoreResult<Vec<ScopeDefinition>>;

    /// Inserts or replaces a scope definition and returns the stored row.
    ///
    /// The definition is validated before it is written.
    async fn upsert_scope(&self, scope: &ScopeDefinition) -> StoreResult<ScopeDefinition>;

    /// Deletes a scope definition. Returns true if a row was removed.
    async fn delete_scope(&self, name: &str) -> StoreResult<bool>;

    /// Loads a client watermark by its natural key.
    async fn get_watermark(&self, key: &WatermarkKey) -> StoreResult<Option<ClientWatermark>>;

    /// Loads every client watermark, ordered by scope name then client id.
    async fn get_all_watermarks(&self) -> StoreResult<Vec<ClientWatermark>>;

    /// Inserts or replaces a client watermark and returns the stored row.
    async fn upsert_watermark(&self, watermark: &ClientWatermark) -> StoreResult<ClientWatermark>;

    /// Atomically folds `watermark` into the stored row for its key.
    ///
    /// Both positions keep the larger of the stored and incoming value, so
    /// concurrent callers can never move a position backwards. Sync time and
    /// duration take the incoming values. Returns the stored row.
    async fn merge_watermark(&self, watermark: &ClientWatermark) -> StoreResult<ClientWatermark>;

    /// Deletes a client watermark. Returns true if a row was removed.
    async fn delete_watermark(&self, key: &WatermarkKey) -> StoreResult<bool>;

    /// Loads every watermark recorded for one scope.
    async fn get_scope_watermarks(&self, scope_name: &str) -> StoreResult<Vec<ClientWatermark>> {
        Ok(self
            .get_all_watermarks()
            .await?
            .into_iter()
            .filter(|w| w.scope_name == scope_name)
            .collect())
    }
}
