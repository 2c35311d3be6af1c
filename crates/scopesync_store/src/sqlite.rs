//! SQLite-backed scope store.

use crate::error::{StoreError, StoreResult};
use crate::store::ScopeStore;
use async_trait::async_trait;
use scopesync_protocol::{ClientWatermark, ScopeDefinition, SyncSchema, SyncSetup, WatermarkKey};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use uuid::Uuid;

const CREATE_SCOPE_INFO: &str = "CREATE TABLE IF NOT EXISTS scope_info (
    scope_name TEXT PRIMARY KEY NOT NULL,
    scope_setup TEXT NULL,
    scope_schema TEXT NULL,
    scope_version TEXT NOT NULL,
    scope_last_cleanup_watermark INTEGER NULL,
    scope_properties TEXT NULL
)";

const CREATE_SCOPE_INFO_CLIENT: &str = "CREATE TABLE IF NOT EXISTS scope_info_client (
    client_id TEXT NOT NULL,
    scope_name TEXT NOT NULL,
    parameters_hash TEXT NOT NULL,
    last_local_watermark INTEGER NULL,
    last_remote_watermark INTEGER NULL,
    last_sync_time INTEGER NULL,
    last_sync_duration_ms INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (client_id, scope_name, parameters_hash)
)";

const SELECT_SCOPE: &str = "SELECT scope_name, scope_setup, scope_schema, scope_version, \
     scope_last_cleanup_watermark, scope_properties FROM scope_info";

const SELECT_WATERMARK: &str = "SELECT client_id, scope_name, parameters_hash, \
     last_local_watermark, last_remote_watermark, last_sync_time, last_sync_duration_ms \
     FROM scope_info_client";

const REPLACE_WATERMARK: &str = "last_local_watermark = excluded.last_local_watermark, \
     last_remote_watermark = excluded.last_remote_watermark, \
     last_sync_time = excluded.last_sync_time, \
     last_sync_duration_ms = excluded.last_sync_duration_ms";

// Scalar MAX yields NULL if either side is NULL, hence the COALESCE pairs.
const MERGE_WATERMARK: &str = "last_local_watermark = MAX(\
     COALESCE(last_local_watermark, excluded.last_local_watermark), \
     COALESCE(excluded.last_local_watermark, last_local_watermark)), \
     last_remote_watermark = MAX(\
     COALESCE(last_remote_watermark, excluded.last_remote_watermark), \
     COALESCE(excluded.last_remote_watermark, last_remote_watermark)), \
     last_sync_time = excluded.last_sync_time, \
     last_sync_duration_ms = excluded.last_sync_duration_ms";

#[derive(Debug, FromRow)]
struct ScopeRow {
    scope_name: String,
    scope_setup: Option<String>,
    scope_schema: Option<String>,
    scope_version: String,
    scope_last_cleanup_watermark: Option<i64>,
    scope_properties: Option<String>,
}

impl ScopeRow {
    fn into_definition(self) -> StoreResult<ScopeDefinition> {
        let setup: Option<SyncSetup> = self
            .scope_setup
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        let schema: Option<SyncSchema> = self
            .scope_schema
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        Ok(ScopeDefinition {
            name: self.scope_name,
            setup,
            schema,
            version: self.scope_version,
            last_cleanup_watermark: from_db(self.scope_last_cleanup_watermark)?,
            properties: self.scope_properties,
        })
    }
}

#[derive(Debug, FromRow)]
struct WatermarkRow {
    client_id: String,
    scope_name: String,
    parameters_hash: String,
    last_local_watermark: Option<i64>,
    last_remote_watermark: Option<i64>,
    last_sync_time: Option<i64>,
    last_sync_duration_ms: i64,
}

impl WatermarkRow {
    fn into_watermark(self) -> StoreResult<ClientWatermark> {
        let client_id = Uuid::parse_str(&self.client_id)
            .map_err(|e| StoreError::Corrupted(format!("client id `{}`: {e}", self.client_id)))?;
        Ok(ClientWatermark {
            client_id,
            scope_name: self.scope_name,
            parameters_hash: self.parameters_hash,
            last_local_watermark: from_db(self.last_local_watermark)?,
            last_remote_watermark: from_db(self.last_remote_watermark)?,
            last_sync_time: from_db(self.last_sync_time)?,
            last_sync_duration_ms: from_db(Some(self.last_sync_duration_ms))?.unwrap_or(0),
        })
    }
}

fn from_db(value: Option<i64>) -> StoreResult<Option<u64>> {
    value
        .map(|v| {
            u64::try_from(v).map_err(|_| StoreError::Corrupted(format!("negative watermark {v}")))
        })
        .transpose()
}

fn to_db(column: &'static str, value: Option<u64>) -> StoreResult<Option<i64>> {
    value
        .map(|v| i64::try_from(v).map_err(|_| StoreError::OutOfRange { column, value: v }))
        .transpose()
}

/// Scope store persisted in SQLite.
///
/// Uses two tables: `scope_info` keyed by scope name and `scope_info_client`
/// keyed by (client id, scope name, parameter hash). Both are created on first
/// access. Upserts run in a transaction and return the row read back from the
/// database.
pub struct SqliteScopeStore {
    pool: SqlitePool,
    tables_ready: AtomicBool,
}

impl SqliteScopeStore {
    /// Opens (or creates) a database file.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        // A single connection serializes writers and avoids "database is locked".
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        Ok(Self::from_pool(pool))
    }

    /// Opens a private in-memory database.
    pub async fn in_memory() -> StoreResult<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?;
        // The database lives as long as its only connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;
        Ok(Self::from_pool(pool))
    }

    /// Wraps an existing pool.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            tables_ready: AtomicBool::new(false),
        }
    }

    /// Returns the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Inserts a watermark row, resolving a key conflict with `on_conflict`,
    /// and reads the stored row back in the same transaction.
    async fn write_watermark(
        &self,
        watermark: &ClientWatermark,
        on_conflict: &str,
    ) -> StoreResult<ClientWatermark> {
        self.ensure_tables().await?;

        let local = to_db("last_local_watermark", watermark.last_local_watermark)?;
        let remote = to_db("last_remote_watermark", watermark.last_remote_watermark)?;
        let sync_time = to_db("last_sync_time", watermark.last_sync_time)?;
        let duration = to_db("last_sync_duration_ms", Some(watermark.last_sync_duration_ms))?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            "INSERT INTO scope_info_client (client_id, scope_name, parameters_hash, \
             last_local_watermark, last_remote_watermark, last_sync_time, last_sync_duration_ms) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(client_id, scope_name, parameters_hash) DO UPDATE SET {on_conflict}"
        ))
        .bind(watermark.client_id.to_string())
        .bind(&watermark.scope_name)
        .bind(&watermark.parameters_hash)
        .bind(local)
        .bind(remote)
        .bind(sync_time)
        .bind(duration)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, WatermarkRow>(&format!(
            "{SELECT_WATERMARK} WHERE client_id = ? AND scope_name = ? AND parameters_hash = ?"
        ))
        .bind(watermark.client_id.to_string())
        .bind(&watermark.scope_name)
        .bind(&watermark.parameters_hash)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        row.into_watermark()
    }
}

#[async_trait]
impl ScopeStore for SqliteScopeStore {
    async fn ensure_tables(&self) -> StoreResult<()> {
        if self.tables_ready.load(Ordering::Acquire) {
            return Ok(());
        }
        sqlx::query(CREATE_SCOPE_INFO).execute(&self.pool).await?;
        sqlx::query(CREATE_SCOPE_INFO_CLIENT)
            .execute(&self.pool)
            .await?;
        self.tables_ready.store(true, Ordering::Release);
        tracing::debug!("scope_info and scope_info_client tables ready");
        Ok(())
    }

    async fn get_scope(&self, name: &str) -> StoreResult<Option<ScopeDefinition>> {
        self.ensure_tables().await?;
        let row = sqlx::query_as::<_, ScopeRow>(&format!("{SELECT_SCOPE} WHERE scope_name = ?"))
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        row.map(ScopeRow::into_definition).transpose()
    }

    async fn get_all_scopes(&self) -> StoreResult<Vec<ScopeDefinition>> {
        self.ensure_tables().await?;
        let rows = sqlx::query_as::<_, ScopeRow>(&format!("{SELECT_SCOPE} ORDER BY scope_name"))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(ScopeRow::into_definition).collect()
    }

    async fn upsert_scope(&self, scope: &ScopeDefinition) -> StoreResult<ScopeDefinition> {
        scope.validate()?;
        self.ensure_tables().await?;

        let setup = scope.setup.as_ref().map(serde_json::to_string).transpose()?;
        let schema = scope.schema.as_ref().map(serde_json::to_string).transpose()?;
        let cleanup = to_db("scope_last_cleanup_watermark", scope.last_cleanup_watermark)?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO scope_info (scope_name, scope_setup, scope_schema, scope_version, \
             scope_last_cleanup_watermark, scope_properties) VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(scope_name) DO UPDATE SET \
             scope_setup = excluded.scope_setup, \
             scope_schema = excluded.scope_schema, \
             scope_version = excluded.scope_version, \
             scope_last_cleanup_watermark = excluded.scope_last_cleanup_watermark, \
             scope_properties = excluded.scope_properties",
        )
        .bind(&scope.name)
        .bind(setup)
        .bind(schema)
        .bind(&scope.version)
        .bind(cleanup)
        .bind(&scope.properties)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, ScopeRow>(&format!("{SELECT_SCOPE} WHERE scope_name = ?"))
            .bind(&scope.name)
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        row.into_definition()
    }

    async fn delete_scope(&self, name: &str) -> StoreResult<bool> {
        self.ensure_tables().await?;
        let result = sqlx::query("DELETE FROM scope_info WHERE scope_name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_watermark(&self, key: &WatermarkKey) -> StoreResult<Option<ClientWatermark>> {
        self.ensure_tables().await?;
        let row = sqlx::query_as::<_, WatermarkRow>(&format!(
            "{SELECT_WATERMARK} WHERE client_id = ? AND scope_name = ? AND parameters_hash = ?"
        ))
        .bind(key.client_id.to_string())
        .bind(&key.scope_name)
        .bind(&key.parameters_hash)
        .fetch_optional(&self.pool)
        .await?;
        row.map(WatermarkRow::into_watermark).transpose()
    }

    async fn get_all_watermarks(&self) -> StoreResult<Vec<ClientWatermark>> {
        self.ensure_tables().await?;
        let rows = sqlx::query_as::<_, WatermarkRow>(&format!(
            "{SELECT_WATERMARK} ORDER BY scope_name, client_id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(WatermarkRow::into_watermark).collect()
    }

    async fn upsert_watermark(&self, watermark: &ClientWatermark) -> StoreResult<ClientWatermark> {
        self.write_watermark(watermark, REPLACE_WATERMARK).await
    }

    async fn merge_watermark(&self, watermark: &ClientWatermark) -> StoreResult<ClientWatermark> {
        self.write_watermark(watermark, MERGE_WATERMARK).await
    }

    async fn delete_watermark(&self, key: &WatermarkKey) -> StoreResult<bool> {
        self.ensure_tables().await?;
        let result = sqlx::query(
            "DELETE FROM scope_info_client \
             WHERE client_id = ? AND scope_name = ? AND parameters_hash = ?",
        )
        .bind(key.client_id.to_string())
        .bind(&key.scope_name)
        .bind(&key.parameters_hash)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}
