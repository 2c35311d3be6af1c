//! In-memory scope store for tests and ephemeral peers.

use crate::error::StoreResult;
use crate::store::ScopeStore;
use async_trait::async_trait;
use parking_lot::Mutex;
use scopesync_protocol::{ClientWatermark, ScopeDefinition, WatermarkKey};
use std::collections::BTreeMap;

#[derive(Debug, Default)]
struct Tables {
    scopes: BTreeMap<String, ScopeDefinition>,
    watermarks: BTreeMap<WatermarkKey, ClientWatermark>,
}

/// A scope store that keeps everything in memory.
///
/// All operations take a single lock, so writes to the same key serialize.
#[derive(Debug, Default)]
pub struct MemoryScopeStore {
    tables: Mutex<Tables>,
}

impl MemoryScopeStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored scope definitions.
    pub fn scope_count(&self) -> usize {
        self.tables.lock().scopes.len()
    }

    /// Number of stored client watermarks.
    pub fn watermark_count(&self) -> usize {
        self.tables.lock().watermarks.len()
    }
}

#[async_trait]
impl ScopeStore for MemoryScopeStore {
    async fn ensure_tables(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn get_scope(&self, name: &str) -> StoreResult<Option<ScopeDefinition>> {
        Ok(self.tables.lock().scopes.get(name).cloned())
    }

    async fn get_all_scopes(&self) -> StoreResult<Vec<ScopeDefinition>> {
        Ok(self.tables.lock().scopes.values().cloned().collect())
    }

    async fn upsert_scope(&self, scope: &ScopeDefinition) -> StoreResult<ScopeDefinition> {
        scope.validate()?;
        let mut tables = self.tables.lock();
        tables.scopes.insert(scope.name.clone(), scope.clone());
        Ok(scope.clone())
    }

    async fn delete_scope(&self, name: &str) -> StoreResult<bool> {
        Ok(self.tables.lock().scopes.remove(name).is_some())
    }

    async fn get_watermark(&self, key: &WatermarkKey) -> StoreResult<Option<ClientWatermark>> {
        Ok(self.tables.lock().watermarks.get(key).cloned())
    }

    async fn get_all_watermarks(&self) -> StoreResult<Vec<ClientWatermark>> {
        let tables = self.tables.lock();
        let mut all: Vec<ClientWatermark> = tables.watermarks.values().cloned().collect();
        all.sort_by(|a, b| {
            a.scope_name
                .cmp(&b.scope_name)
                .then_with(|| a.client_id.cmp(&b.client_id))
        });
        Ok(all)
    }

    async fn upsert_watermark(&self, watermark: &ClientWatermark) -> StoreResult<ClientWatermark> {
        let mut tables = self.tables.lock();
        tables.watermarks.insert(watermark.key(), watermark.clone());
        Ok(watermark.clone())
    }

    async fn merge_watermark(&self, watermark: &ClientWatermark) -> StoreResult<ClientWatermark> {
        let mut tables = self.tables.lock();
        let stored = tables
            .watermarks
            .entry(watermark.key())
            .or_insert_with(|| watermark.clone());
        stored.last_local_watermark = stored.last_local_watermark.max(watermark.last_local_watermark);
        stored.last_remote_watermark =
            stored.last_remote_watermark.max(watermark.last_remote_watermark);
        stored.last_sync_time = watermark.last_sync_time;
        stored.last_sync_duration_ms = watermark.last_sync_duration_ms;
        Ok(stored.clone())
    }

    async fn delete_watermark(&self, key: &WatermarkKey) -> StoreResult<bool> {
        Ok(self.tables.lock().watermarks.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scopesync_protocol::{SyncParameters, SyncSchema, SyncSetup};
    use uuid::Uuid;

    #[tokio::test]
    async fn scope_round_trip_and_delete() {
        let store = MemoryScopeStore::new();
        assert!(store.get_scope("main").await.unwrap().is_none());

        let stored = store.upsert_scope(&ScopeDefinition::new("main")).await.unwrap();
        assert_eq!(stored.name, "main");
        assert_eq!(store.scope_count(), 1);

        assert!(store.delete_scope("main").await.unwrap());
        assert!(!store.delete_scope("main").await.unwrap());
    }

    #[tokio::test]
    async fn rejects_inconsistent_scope() {
        let store = MemoryScopeStore::new();
        let bad = ScopeDefinition::new("main")
            .provisioned(SyncSetup::new(["Product"]), SyncSchema::default());
        assert!(store.upsert_scope(&bad).await.is_err());
        assert_eq!(store.scope_count(), 0);
    }

    #[tokio::test]
    async fn one_watermark_per_triple() {
        let store = MemoryScopeStore::new();
        let client = Uuid::new_v4();
        let eu = SyncParameters::new().with("region", "eu").hash();
        let us = SyncParameters::new().with("region", "us").hash();

        let mut first = ClientWatermark::new(WatermarkKey::new(client, "main", &eu));
        store.upsert_watermark(&first).await.unwrap();
        first.last_remote_watermark = Some(10);
        store.upsert_watermark(&first).await.unwrap();
        store
            .upsert_watermark(&ClientWatermark::new(WatermarkKey::new(client, "main", &us)))
            .await
            .unwrap();

        assert_eq!(store.watermark_count(), 2);
        let loaded = store.get_watermark(&first.key()).await.unwrap().unwrap();
        assert_eq!(loaded.last_remote_watermark, Some(10));
        assert_eq!(store.get_scope_watermarks("main").await.unwrap().len(), 2);
        assert!(store.get_scope_watermarks("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn merge_never_moves_positions_back() {
        let store = MemoryScopeStore::new();
        let key = WatermarkKey::new(Uuid::new_v4(), "main", "h");

        let mut ahead = ClientWatermark::new(key.clone());
        ahead.last_local_watermark = Some(20);
        ahead.last_remote_watermark = Some(5);
        store.merge_watermark(&ahead).await.unwrap();

        let mut behind = ClientWatermark::new(key.clone());
        behind.last_local_watermark = Some(10);
        behind.last_remote_watermark = Some(7);
        behind.last_sync_time = Some(99);
        let merged = store.merge_watermark(&behind).await.unwrap();

        assert_eq!(merged.last_local_watermark, Some(20));
        assert_eq!(merged.last_remote_watermark, Some(7));
        assert_eq!(merged.last_sync_time, Some(99));
        assert_eq!(store.get_watermark(&key).await.unwrap(), Some(merged));
    }
}
