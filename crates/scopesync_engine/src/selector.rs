//! Change selection across the tables of a setup.

use crate::error::SyncResult;
use crate::provider::{ChangeQuery, DataProvider};
use scopesync_protocol::{RowChange, SyncParameters, SyncSetup, TableChanges};
use uuid::Uuid;

/// Watermark window and origin filter for one selection pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionWindow {
    /// Exclusive lower bound, `None` for an initial snapshot.
    pub since: Option<u64>,
    /// Inclusive upper bound.
    pub until: u64,
    /// Origin whose rows are skipped.
    pub exclude_origin: Option<Uuid>,
}

/// Selects the changes of every table in a setup and orders them for apply.
///
/// Upserts come first, table by table in dependency order, so referenced rows
/// exist before their referrers. Deletes follow in reverse dependency order.
/// Parts planned from the result can therefore be applied in index order.
pub struct ChangeSelector<'a> {
    provider: &'a dyn DataProvider,
}

impl<'a> ChangeSelector<'a> {
    /// Creates a selector over a provider.
    pub fn new(provider: &'a dyn DataProvider) -> Self {
        Self { provider }
    }

    /// Selects changes inside `window` for all tables of `setup`.
    pub async fn select(
        &self,
        setup: &SyncSetup,
        parameters: &SyncParameters,
        window: SelectionWindow,
    ) -> SyncResult<Vec<TableChanges>> {
        let ordered = setup.ordered_tables()?;
        let mut upserts = Vec::with_capacity(ordered.len());
        let mut deletes = Vec::new();

        for table in ordered {
            let query = ChangeQuery {
                table: table.clone(),
                parameters: parameters.clone(),
                since: window.since,
                until: window.until,
                exclude_origin: window.exclude_origin,
            };
            let rows = self.provider.select_changes(&query).await?;
            let (removed, written): (Vec<RowChange>, Vec<RowChange>) =
                rows.into_iter().partition(RowChange::is_delete);

            tracing::trace!(
                table = %table.name,
                upserts = written.len(),
                deletes = removed.len(),
                "selected table changes"
            );

            if !written.is_empty() {
                upserts.push(TableChanges::new(&table.name, written));
            }
            if !removed.is_empty() {
                deletes.push(TableChanges::new(&table.name, removed));
            }
        }

        deletes.reverse();
        upserts.extend(deletes);
        Ok(upserts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MemoryProvider;
    use scopesync_protocol::{ColumnSchema, SetupTable, TableSchema};
    use std::collections::BTreeMap;

    fn provider() -> MemoryProvider {
        let provider = MemoryProvider::new();
        for name in ["Customer", "Order"] {
            provider.create_table(TableSchema::new(
                name,
                vec![ColumnSchema::new("id", "text").primary_key()],
            ));
        }
        provider
    }

    fn setup() -> SyncSetup {
        // Declared out of dependency order on purpose.
        SyncSetup::new(Vec::<String>::new())
            .with_table(SetupTable::new("Order").depends_on("Customer"))
            .with_table(SetupTable::new("Customer"))
    }

    #[tokio::test]
    async fn upserts_follow_dependencies_and_deletes_reverse_them() {
        let provider = provider();
        let setup = setup();
        provider.provision(&setup).await.unwrap();

        provider.upsert_row("Order", "o1", BTreeMap::new()).unwrap();
        provider.upsert_row("Customer", "c1", BTreeMap::new()).unwrap();
        provider.upsert_row("Customer", "c2", BTreeMap::new()).unwrap();
        provider.upsert_row("Order", "o2", BTreeMap::new()).unwrap();
        provider.delete_row("Order", "o1").unwrap();
        provider.delete_row("Customer", "c2").unwrap();

        let window = SelectionWindow {
            since: Some(0),
            until: provider.clock(),
            exclude_origin: None,
        };
        let changes = ChangeSelector::new(&provider)
            .select(&setup, &SyncParameters::new(), window)
            .await
            .unwrap();

        let shape: Vec<(&str, bool)> = changes
            .iter()
            .map(|t| (t.table.as_str(), t.rows[0].is_delete()))
            .collect();
        assert_eq!(
            shape,
            vec![
                ("Customer", false),
                ("Order", false),
                ("Order", true),
                ("Customer", true)
            ]
        );
    }

    #[tokio::test]
    async fn tables_without_changes_are_omitted() {
        let provider = provider();
        let setup = setup();
        provider.provision(&setup).await.unwrap();
        let window = SelectionWindow {
            since: None,
            until: provider.clock(),
            exclude_origin: None,
        };
        let changes = ChangeSelector::new(&provider)
            .select(&setup, &SyncParameters::new(), window)
            .await
            .unwrap();
        assert!(changes.is_empty());
    }

    #[tokio::test]
    async fn dependency_cycles_are_rejected() {
        let provider = provider();
        let setup = SyncSetup::new(Vec::<String>::new())
            .with_table(SetupTable::new("Order").depends_on("Customer"))
            .with_table(SetupTable::new("Customer").depends_on("Order"));
        let window = SelectionWindow {
            since: None,
            until: 0,
            exclude_origin: None,
        };
        let err = ChangeSelector::new(&provider)
            .select(&setup, &SyncParameters::new(), window)
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::SyncError::Protocol(_)));
    }
}
