//! Data provider capability interface and an in-memory implementation.
//!
//! A [`DataProvider`] is the only part of the engine that touches user
//! tables. It owns change tracking (a monotonically increasing watermark per
//! store), selects changed rows inside a watermark window and applies rows
//! received from a peer. The engine itself has no knowledge of any SQL
//! dialect.

use async_trait::async_trait;
use parking_lot::Mutex;
use scopesync_protocol::{
    ChangeKind, RowChange, RowFailure, SetupTable, SyncParameters, SyncSchema, SyncSetup,
    TableSchema,
};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use uuid::Uuid;

/// Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;

/// Errors raised by a data provider.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// The table does not exist in the underlying store.
    #[error("unknown table `{0}`")]
    UnknownTable(String),

    /// Change tracking is not set up for the table.
    #[error("table `{0}` is not provisioned")]
    NotProvisioned(String),

    /// The underlying store failed.
    #[error("backend error: {0}")]
    Backend(String),
}

/// A change selection request for one table.
#[derive(Debug, Clone)]
pub struct ChangeQuery {
    /// Table entry of the setup, including its column list and filter.
    pub table: SetupTable,
    /// Filter parameter values of the session.
    pub parameters: SyncParameters,
    /// Exclusive lower bound. `None` selects a snapshot of live rows without tombstones.
    pub since: Option<u64>,
    /// Inclusive upper bound.
    pub until: u64,
    /// Rows last written on behalf of this origin are skipped.
    pub exclude_origin: Option<Uuid>,
}

/// Result of applying a set of rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Rows written.
    pub applied: u64,
    /// Rows rejected by the store.
    pub failures: Vec<RowFailure>,
}

/// Capability interface over a tracked tabular store.
#[async_trait]
pub trait DataProvider: Send + Sync {
    /// Sets up change tracking for the setup's tables and returns their schema.
    async fn provision(&self, setup: &SyncSetup) -> ProviderResult<SyncSchema>;

    /// Removes change tracking for the setup's tables.
    async fn deprovision(&self, setup: &SyncSetup) -> ProviderResult<()>;

    /// Current change-tracking position.
    async fn tracking_watermark(&self) -> ProviderResult<u64>;

    /// Selects rows changed inside the query window.
    async fn select_changes(&self, query: &ChangeQuery) -> ProviderResult<Vec<RowChange>>;

    /// Applies rows received from a peer, tagging them with `origin`.
    ///
    /// Row-level failures are reported in the outcome, not as an error.
    async fn apply_changes(
        &self,
        table: &str,
        rows: &[RowChange],
        origin: Uuid,
    ) -> ProviderResult<ApplyOutcome>;

    /// Purges tombstones at or below `up_to`. Returns the number removed.
    async fn purge_tracking(&self, setup: &SyncSetup, up_to: u64) -> ProviderResult<u64>;
}

#[derive(Debug, Clone)]
struct TrackedRow {
    /// `None` marks a tombstone.
    values: Option<BTreeMap<String, serde_json::Value>>,
    timestamp: u64,
    origin: Option<Uuid>,
}

#[derive(Debug)]
struct MemoryTable {
    schema: TableSchema,
    rows: BTreeMap<String, TrackedRow>,
}

#[derive(Debug, Default)]
struct MemoryData {
    clock: u64,
    tables: BTreeMap<String, MemoryTable>,
    provisioned: BTreeSet<String>,
    rejected: BTreeSet<(String, String)>,
}

impl MemoryData {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn table(&self, name: &str) -> ProviderResult<&MemoryTable> {
        self.tables
            .get(name)
            .ok_or_else(|| ProviderError::UnknownTable(name.to_string()))
    }

    fn is_live(&self, table: &str, key: &str) -> bool {
        self.tables
            .get(table)
            .and_then(|t| t.rows.get(key))
            .is_some_and(|r| r.values.is_some())
    }

    /// Checks every reference column of an upserted row.
    fn check_references(
        &self,
        schema: &TableSchema,
        values: &BTreeMap<String, serde_json::Value>,
    ) -> Result<(), String> {
        for column in &schema.columns {
            let (Some(target), Some(value)) = (&column.references, values.get(&column.name)) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            let key = key_text(value);
            if !self.is_live(target, &key) {
                return Err(format!(
                    "foreign key violation: `{}`.`{}` = {} has no row in `{}`",
                    schema.name, column.name, key, target
                ));
            }
        }
        Ok(())
    }

    /// Finds a live row in another table that still references `key`.
    fn find_referrer(&self, table: &str, key: &str) -> Option<String> {
        self.tables.values().find_map(|other| {
            let columns: Vec<&str> = other
                .schema
                .columns
                .iter()
                .filter(|c| c.references.as_deref() == Some(table))
                .map(|c| c.name.as_str())
                .collect();
            if columns.is_empty() {
                return None;
            }
            other.rows.iter().find_map(|(other_key, row)| {
                let values = row.values.as_ref()?;
                let referencing = columns
                    .iter()
                    .any(|c| values.get(*c).is_some_and(|v| key_text(v) == key));
                referencing.then(|| format!("{}:{}", other.schema.name, other_key))
            })
        })
    }
}

fn key_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn matches_filter(
    table: &SetupTable,
    parameters: &SyncParameters,
    values: Option<&BTreeMap<String, serde_json::Value>>,
) -> bool {
    let Some(column) = &table.filter else {
        return true;
    };
    let Some(expected) = parameters.get(column) else {
        return true;
    };
    // Tombstones carry no values and always pass.
    values.map_or(true, |v| v.get(column) == Some(expected))
}

/// A [`DataProvider`] over in-memory tables.
///
/// Change tracking is a counter: every local write and every applied row
/// advances it by one and stamps the row. Deleted rows leave tombstones until
/// purged. Columns declared with [`ColumnSchema::references`] are enforced as
/// foreign keys on upsert and on delete.
///
/// A table filter names a column; when the session parameters contain a value
/// under the same name, only rows whose column equals that value are selected.
///
/// [`ColumnSchema::references`]: scopesync_protocol::ColumnSchema::references
#[derive(Debug, Default)]
pub struct MemoryProvider {
    data: Mutex<MemoryData>,
}

impl MemoryProvider {
    /// Creates an empty provider with the clock at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty provider with the clock at `start`.
    #[must_use]
    pub fn with_clock(start: u64) -> Self {
        let provider = Self::new();
        provider.data.lock().clock = start;
        provider
    }

    /// Creates a table.
    pub fn create_table(&self, schema: TableSchema) {
        let name = schema.name.clone();
        self.data.lock().tables.insert(
            name,
            MemoryTable {
                schema,
                rows: BTreeMap::new(),
            },
        );
    }

    /// Writes a row locally. Returns its change timestamp.
    pub fn upsert_row(
        &self,
        table: &str,
        key: &str,
        values: BTreeMap<String, serde_json::Value>,
    ) -> ProviderResult<u64> {
        let mut data = self.data.lock();
        data.table(table)?;
        let timestamp = data.tick();
        if let Some(t) = data.tables.get_mut(table) {
            t.rows.insert(
                key.to_string(),
                TrackedRow {
                    values: Some(values),
                    timestamp,
                    origin: None,
                },
            );
        }
        Ok(timestamp)
    }

    /// Deletes a row locally, leaving a tombstone. Returns false if the row did not exist.
    pub fn delete_row(&self, table: &str, key: &str) -> ProviderResult<bool> {
        let mut data = self.data.lock();
        data.table(table)?;
        if !data.is_live(table, key) {
            return Ok(false);
        }
        let timestamp = data.tick();
        if let Some(t) = data.tables.get_mut(table) {
            t.rows.insert(
                key.to_string(),
                TrackedRow {
                    values: None,
                    timestamp,
                    origin: None,
                },
            );
        }
        Ok(true)
    }

    /// Returns the values of a live row.
    pub fn row(&self, table: &str, key: &str) -> Option<BTreeMap<String, serde_json::Value>> {
        self.data
            .lock()
            .tables
            .get(table)
            .and_then(|t| t.rows.get(key))
            .and_then(|r| r.values.clone())
    }

    /// Number of live rows in a table.
    pub fn row_count(&self, table: &str) -> usize {
        self.data
            .lock()
            .tables
            .get(table)
            .map_or(0, |t| t.rows.values().filter(|r| r.values.is_some()).count())
    }

    /// Number of tombstones in a table.
    pub fn tombstone_count(&self, table: &str) -> usize {
        self.data
            .lock()
            .tables
            .get(table)
            .map_or(0, |t| t.rows.values().filter(|r| r.values.is_none()).count())
    }

    /// Live rows of a table keyed by primary key.
    pub fn rows(&self, table: &str) -> BTreeMap<String, BTreeMap<String, serde_json::Value>> {
        self.data
            .lock()
            .tables
            .get(table)
            .map(|t| {
                t.rows
                    .iter()
                    .filter_map(|(k, r)| r.values.clone().map(|v| (k.clone(), v)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Makes every future apply of this row fail.
    pub fn reject_key(&self, table: &str, key: &str) {
        self.data
            .lock()
            .rejected
            .insert((table.to_string(), key.to_string()));
    }

    /// Lets a previously rejected row apply again.
    pub fn accept_key(&self, table: &str, key: &str) {
        self.data
            .lock()
            .rejected
            .remove(&(table.to_string(), key.to_string()));
    }

    /// Current clock value.
    pub fn clock(&self) -> u64 {
        self.data.lock().clock
    }

    /// Returns true if the table is under change tracking.
    pub fn is_provisioned(&self, table: &str) -> bool {
        self.data.lock().provisioned.contains(table)
    }
}

#[async_trait]
impl DataProvider for MemoryProvider {
    async fn provision(&self, setup: &SyncSetup) -> ProviderResult<SyncSchema> {
        let mut data = self.data.lock();
        let mut tables = Vec::with_capacity(setup.tables.len());
        for entry in &setup.tables {
            tables.push(data.table(&entry.name)?.schema.clone());
        }
        for entry in &setup.tables {
            data.provisioned.insert(entry.name.clone());
        }
        Ok(SyncSchema::new(tables))
    }

    async fn deprovision(&self, setup: &SyncSetup) -> ProviderResult<()> {
        let mut data = self.data.lock();
        for entry in &setup.tables {
            data.provisioned.remove(&entry.name);
            if let Some(table) = data.tables.get_mut(&entry.name) {
                table.rows.retain(|_, r| r.values.is_some());
            }
        }
        Ok(())
    }

    async fn tracking_watermark(&self) -> ProviderResult<u64> {
        Ok(self.data.lock().clock)
    }

    async fn select_changes(&self, query: &ChangeQuery) -> ProviderResult<Vec<RowChange>> {
        let data = self.data.lock();
        let name = &query.table.name;
        if !data.provisioned.contains(name) {
            return Err(ProviderError::NotProvisioned(name.clone()));
        }
        let table = data.table(name)?;

        let mut changes: Vec<RowChange> = table
            .rows
            .iter()
            .filter(|(_, row)| row.timestamp <= query.until)
            .filter(|(_, row)| match query.since {
                Some(since) => row.timestamp > since,
                None => row.values.is_some(),
            })
            .filter(|(_, row)| query.exclude_origin.is_none() || row.origin != query.exclude_origin)
            .filter(|(_, row)| matches_filter(&query.table, &query.parameters, row.values.as_ref()))
            .map(|(key, row)| match &row.values {
                Some(values) => {
                    let values = if query.table.columns.is_empty() {
                        values.clone()
                    } else {
                        values
                            .iter()
                            .filter(|(c, _)| query.table.columns.contains(c))
                            .map(|(c, v)| (c.clone(), v.clone()))
                            .collect()
                    };
                    RowChange::upsert(key.clone(), values, row.timestamp)
                }
                None => RowChange::delete(key.clone(), row.timestamp),
            })
            .collect();

        changes.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.key.cmp(&b.key)));
        Ok(changes)
    }

    async fn apply_changes(
        &self,
        table: &str,
        rows: &[RowChange],
        origin: Uuid,
    ) -> ProviderResult<ApplyOutcome> {
        let mut data = self.data.lock();
        let schema = data.table(table)?.schema.clone();
        let mut outcome = ApplyOutcome::default();

        for row in rows {
            let check = if data.rejected.contains(&(table.to_string(), row.key.clone())) {
                Err("row rejected by store".to_string())
            } else {
                match row.kind {
                    ChangeKind::Upsert => data.check_references(&schema, &row.values),
                    ChangeKind::Delete => match data.find_referrer(table, &row.key) {
                        Some(referrer) => Err(format!(
                            "foreign key violation: row `{referrer}` still references `{table}`.`{}`",
                            row.key
                        )),
                        None => Ok(()),
                    },
                }
            };

            if let Err(message) = check {
                outcome.failures.push(RowFailure {
                    table: table.to_string(),
                    key: row.key.clone(),
                    timestamp: row.timestamp,
                    message,
                });
                continue;
            }

            let timestamp = data.tick();
            let values = match row.kind {
                ChangeKind::Upsert => Some(row.values.clone()),
                ChangeKind::Delete => None,
            };
            if let Some(t) = data.tables.get_mut(table) {
                t.rows.insert(
                    row.key.clone(),
                    TrackedRow {
                        values,
                        timestamp,
                        origin: Some(origin),
                    },
                );
            }
            outcome.applied += 1;
        }

        Ok(outcome)
    }

    async fn purge_tracking(&self, setup: &SyncSetup, up_to: u64) -> ProviderResult<u64> {
        let mut data = self.data.lock();
        let mut purged = 0u64;
        for entry in &setup.tables {
            if let Some(table) = data.tables.get_mut(&entry.name) {
                let before = table.rows.len();
                table
                    .rows
                    .retain(|_, r| r.values.is_some() || r.timestamp > up_to);
                purged += (before - table.rows.len()) as u64;
            }
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scopesync_protocol::ColumnSchema;
    use serde_json::json;

    fn values(pairs: &[(&str, serde_json::Value)]) -> BTreeMap<String, serde_json::Value> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    fn provider() -> MemoryProvider {
        let provider = MemoryProvider::with_clock(100);
        provider.create_table(TableSchema::new(
            "Customer",
            vec![ColumnSchema::new("id", "text").primary_key()],
        ));
        provider.create_table(TableSchema::new(
            "Order",
            vec![
                ColumnSchema::new("id", "text").primary_key(),
                ColumnSchema::new("customer", "text").references("Customer"),
                ColumnSchema::new("region", "text"),
            ],
        ));
        provider
    }

    fn query(table: SetupTable, since: Option<u64>, until: u64) -> ChangeQuery {
        ChangeQuery {
            table,
            parameters: SyncParameters::new(),
            since,
            until,
            exclude_origin: None,
        }
    }

    #[tokio::test]
    async fn local_writes_advance_the_clock() {
        let provider = provider();
        let setup = SyncSetup::new(["Customer", "Order"]);
        let schema = provider.provision(&setup).await.unwrap();
        assert!(schema.covers(&setup).is_ok());

        assert_eq!(provider.upsert_row("Customer", "c1", values(&[])).unwrap(), 101);
        assert_eq!(provider.upsert_row("Customer", "c2", values(&[])).unwrap(), 102);
        assert_eq!(provider.tracking_watermark().await.unwrap(), 102);
    }

    #[tokio::test]
    async fn selection_window_and_tombstones() {
        let provider = provider();
        provider.provision(&SyncSetup::new(["Customer"])).await.unwrap();
        provider.upsert_row("Customer", "c1", values(&[])).unwrap();
        provider.upsert_row("Customer", "c2", values(&[])).unwrap();
        provider.delete_row("Customer", "c1").unwrap();

        let table = SetupTable::new("Customer");
        let snapshot = provider.select_changes(&query(table.clone(), None, 103)).await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].key, "c2");

        let delta = provider
            .select_changes(&query(table.clone(), Some(101), 103))
            .await
            .unwrap();
        assert_eq!(delta.len(), 2);
        assert_eq!(delta[0].key, "c2");
        assert!(delta[1].is_delete());

        let bounded = provider.select_changes(&query(table, Some(100), 102)).await.unwrap();
        assert_eq!(bounded.len(), 1);
    }

    #[tokio::test]
    async fn unprovisioned_tables_cannot_be_selected() {
        let provider = provider();
        let err = provider
            .select_changes(&query(SetupTable::new("Customer"), None, 0))
            .await
            .unwrap_err();
        assert_eq!(err, ProviderError::NotProvisioned("Customer".into()));
        assert!(provider.provision(&SyncSetup::new(["Missing"])).await.is_err());
    }

    #[tokio::test]
    async fn applied_rows_carry_origin() {
        let provider = provider();
        provider.provision(&SyncSetup::new(["Customer"])).await.unwrap();
        let origin = Uuid::new_v4();
        let outcome = provider
            .apply_changes("Customer", &[RowChange::upsert("c1", values(&[]), 7)], origin)
            .await
            .unwrap();
        assert_eq!(outcome.applied, 1);

        let mut q = query(SetupTable::new("Customer"), Some(100), 200);
        q.exclude_origin = Some(origin);
        assert!(provider.select_changes(&q).await.unwrap().is_empty());
        q.exclude_origin = Some(Uuid::new_v4());
        assert_eq!(provider.select_changes(&q).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn foreign_keys_are_enforced() {
        let provider = provider();
        let origin = Uuid::new_v4();
        let order = RowChange::upsert("o1", values(&[("customer", json!("c1"))]), 3);

        let outcome = provider
            .apply_changes("Order", std::slice::from_ref(&order), origin)
            .await
            .unwrap();
        assert_eq!(outcome.applied, 0);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].timestamp, 3);

        provider.upsert_row("Customer", "c1", values(&[])).unwrap();
        let outcome = provider.apply_changes("Order", &[order], origin).await.unwrap();
        assert_eq!(outcome.applied, 1);

        let outcome = provider
            .apply_changes("Customer", &[RowChange::delete("c1", 9)], origin)
            .await
            .unwrap();
        assert_eq!(outcome.failures.len(), 1);
        assert!(outcome.failures[0].message.contains("Order:o1"));
    }

    #[tokio::test]
    async fn rejected_keys_fail() {
        let provider = provider();
        provider.reject_key("Customer", "bad");
        let outcome = provider
            .apply_changes(
                "Customer",
                &[
                    RowChange::upsert("good", values(&[]), 1),
                    RowChange::upsert("bad", values(&[]), 2),
                ],
                Uuid::new_v4(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.applied, 1);
        assert_eq!(outcome.failures[0].key, "bad");

        provider.accept_key("Customer", "bad");
        assert_eq!(provider.row_count("Customer"), 1);
    }

    #[tokio::test]
    async fn filter_uses_parameters() {
        let provider = provider();
        provider.provision(&SyncSetup::new(["Customer", "Order"])).await.unwrap();
        provider.upsert_row("Customer", "c1", values(&[])).unwrap();
        provider
            .upsert_row("Order", "o1", values(&[("customer", json!("c1")), ("region", json!("eu"))]))
            .unwrap();
        provider
            .upsert_row("Order", "o2", values(&[("customer", json!("c1")), ("region", json!("us"))]))
            .unwrap();

        let mut q = query(SetupTable::new("Order").with_filter("region"), None, 1000);
        assert_eq!(provider.select_changes(&q).await.unwrap().len(), 2);
        q.parameters = SyncParameters::new().with("region", "eu");
        let rows = provider.select_changes(&q).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].key, "o1");
    }

    #[tokio::test]
    async fn purge_removes_old_tombstones() {
        let provider = provider();
        let setup = SyncSetup::new(["Customer"]);
        provider.provision(&setup).await.unwrap();
        provider.upsert_row("Customer", "c1", values(&[])).unwrap();
        provider.upsert_row("Customer", "c2", values(&[])).unwrap();
        provider.delete_row("Customer", "c1").unwrap(); // 103
        provider.delete_row("Customer", "c2").unwrap(); // 104

        assert_eq!(provider.purge_tracking(&setup, 103).await.unwrap(), 1);
        assert_eq!(provider.tombstone_count("Customer"), 1);

        provider.deprovision(&setup).await.unwrap();
        assert_eq!(provider.tombstone_count("Customer"), 0);
        assert!(!provider.is_provisioned("Customer"));
    }
}
