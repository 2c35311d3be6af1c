//! Scope definitions: the named table/column/filter agreement and its schema.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};

/// Version stamped on scope definitions written by this release.
pub const SCOPE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default suffix appended to tracking table names.
pub const DEFAULT_TRACKING_SUFFIX: &str = "_tracking";

/// One table taking part in a sync setup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupTable {
    /// Table name.
    pub name: String,
    /// Synchronized columns. Empty means every column.
    #[serde(default)]
    pub columns: Vec<String>,
    /// Tables whose rows this table references. They are applied first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Optional row filter expression, interpreted by the data provider.
    #[serde(default)]
    pub filter: Option<String>,
}

impl SetupTable {
    /// Creates a table entry synchronizing every column.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            depends_on: Vec::new(),
            filter: None,
        }
    }

    /// Restricts the synchronized columns.
    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Declares that this table references `table`.
    pub fn depends_on(mut self, table: impl Into<String>) -> Self {
        self.depends_on.push(table.into());
        self
    }

    /// Sets a row filter.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    fn normalized(&self) -> SetupTable {
        let mut table = self.clone();
        table.columns.sort();
        table.depends_on.sort();
        table
    }
}

/// The table/column/filter agreement of a scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSetup {
    /// Tables in declaration order.
    pub tables: Vec<SetupTable>,
    /// Prefix of tracking table names.
    #[serde(default)]
    pub tracking_prefix: String,
    /// Suffix of tracking table names.
    #[serde(default = "default_suffix")]
    pub tracking_suffix: String,
}

fn default_suffix() -> String {
    DEFAULT_TRACKING_SUFFIX.to_string()
}

impl SyncSetup {
    /// Creates a setup over the given tables with the default naming convention.
    pub fn new<I, S>(tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tables: tables
                .into_iter()
                .map(|name| SetupTable::new(name))
                .collect(),
            tracking_prefix: String::new(),
            tracking_suffix: default_suffix(),
        }
    }

    /// Adds a table entry.
    pub fn with_table(mut self, table: SetupTable) -> Self {
        self.tables.push(table);
        self
    }

    /// Sets the tracking table naming convention.
    pub fn with_tracking_naming(
        mut self,
        prefix: impl Into<String>,
        suffix: impl Into<String>,
    ) -> Self {
        self.tracking_prefix = prefix.into();
        self.tracking_suffix = suffix.into();
        self
    }

    /// Looks up a table entry by name.
    pub fn table(&self, name: &str) -> Option<&SetupTable> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Returns table names in declaration order.
    pub fn table_names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }

    /// Returns the tracking table name for `table`.
    pub fn tracking_table_name(&self, table: &str) -> String {
        format!("{}{}{}", self.tracking_prefix, table, self.tracking_suffix)
    }

    /// Returns true if both setups use the same tracking naming convention.
    pub fn same_naming(&self, other: &SyncSetup) -> bool {
        self.tracking_prefix == other.tracking_prefix
            && self.tracking_suffix == other.tracking_suffix
    }

    /// Structural equality, ignoring declaration order of tables and columns.
    pub fn matches(&self, other: &SyncSetup) -> bool {
        if !self.same_naming(other) || self.tables.len() != other.tables.len() {
            return false;
        }
        let mut left: Vec<SetupTable> = self.tables.iter().map(SetupTable::normalized).collect();
        let mut right: Vec<SetupTable> =
            other.tables.iter().map(SetupTable::normalized).collect();
        left.sort_by(|a, b| a.name.cmp(&b.name));
        right.sort_by(|a, b| a.name.cmp(&b.name));
        left == right
    }

    /// Returns tables so that every table follows the tables it depends on.
    ///
    /// Tables without a mutual constraint keep their declaration order.
    pub fn ordered_tables(&self) -> ProtocolResult<Vec<&SetupTable>> {
        for table in &self.tables {
            if let Some(missing) = table
                .depends_on
                .iter()
                .find(|dep| *dep != &table.name && self.table(dep).is_none())
            {
                return Err(ProtocolError::InvalidSetup(format!(
                    "table `{}` depends on `{}` which is not part of the setup",
                    table.name, missing
                )));
            }
        }

        let mut ordered: Vec<&SetupTable> = Vec::with_capacity(self.tables.len());
        let mut remaining: Vec<&SetupTable> = self.tables.iter().collect();

        while !remaining.is_empty() {
            let ready = remaining.iter().position(|table| {
                table
                    .depends_on
                    .iter()
                    .filter(|dep| *dep != &table.name)
                    .all(|dep| ordered.iter().any(|t| &t.name == dep))
            });

            match ready {
                Some(pos) => ordered.push(remaining.remove(pos)),
                None => {
                    let names: Vec<&str> = remaining.iter().map(|t| t.name.as_str()).collect();
                    return Err(ProtocolError::InvalidSetup(format!(
                        "dependency cycle between tables {names:?}"
                    )));
                }
            }
        }

        Ok(ordered)
    }
}

/// Resolved column description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    /// Column name.
    pub name: String,
    /// Provider-specific type name.
    pub data_type: String,
    /// Whether the column accepts nulls.
    #[serde(default)]
    pub nullable: bool,
    /// Whether the column is part of the primary key.
    #[serde(default)]
    pub primary_key: bool,
    /// Table referenced by this column, if it is a foreign key.
    #[serde(default)]
    pub references: Option<String>,
}

impl ColumnSchema {
    /// Creates a non-null column.
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: false,
            primary_key: false,
            references: None,
        }
    }

    /// Marks the column as part of the primary key.
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    /// Marks the column as nullable.
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Marks the column as a reference to `table`.
    pub fn references(mut self, table: impl Into<String>) -> Self {
        self.references = Some(table.into());
        self
    }
}

/// Resolved table description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table name.
    pub name: String,
    /// Columns in table order.
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    /// Creates a table schema.
    pub fn new(name: impl Into<String>, columns: Vec<ColumnSchema>) -> Self {
        Self {
            name: name.into(),
            columns,
        }
    }

    /// Looks up a column by name.
    pub fn column(&self, name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// Schema snapshot matching a setup at provisioning time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSchema {
    /// Tables in setup order.
    pub tables: Vec<TableSchema>,
}

impl SyncSchema {
    /// Creates a schema snapshot.
    pub fn new(tables: Vec<TableSchema>) -> Self {
        Self { tables }
    }

    /// Looks up a table by name.
    pub fn table(&self, name: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Checks that every table and listed column of `setup` is described.
    pub fn covers(&self, setup: &SyncSetup) -> Result<(), String> {
        for entry in &setup.tables {
            let table = self
                .table(&entry.name)
                .ok_or_else(|| format!("schema has no entry for table `{}`", entry.name))?;
            if let Some(column) = entry.columns.iter().find(|c| table.column(c).is_none()) {
                return Err(format!(
                    "schema for table `{}` has no column `{}`",
                    entry.name, column
                ));
            }
        }
        Ok(())
    }
}

/// One named synchronization agreement, stored on both sides.
///
/// `setup` and `schema` are either both unset (the scope has been seen but not
/// provisioned) or both set and consistent. Definitions are only ever replaced
/// as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeDefinition {
    /// Scope name, unique per store.
    pub name: String,
    /// Table/column/filter agreement.
    pub setup: Option<SyncSetup>,
    /// Schema snapshot for `setup`.
    pub schema: Option<SyncSchema>,
    /// Version of the release that wrote this definition.
    pub version: String,
    /// Watermark up to which tracking metadata has been purged.
    pub last_cleanup_watermark: Option<u64>,
    /// Opaque extension data.
    pub properties: Option<String>,
}

impl ScopeDefinition {
    /// Creates an empty, unprovisioned definition.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            setup: None,
            schema: None,
            version: SCOPE_VERSION.to_string(),
            last_cleanup_watermark: None,
            properties: None,
        }
    }

    /// Returns true once a schema has been committed.
    pub fn is_provisioned(&self) -> bool {
        self.schema.is_some()
    }

    /// Returns a copy provisioned with `setup` and `schema`.
    pub fn provisioned(mut self, setup: SyncSetup, schema: SyncSchema) -> Self {
        self.setup = Some(setup);
        self.schema = Some(schema);
        self.version = SCOPE_VERSION.to_string();
        self
    }

    /// Checks the setup/schema invariant.
    pub fn validate(&self) -> ProtocolResult<()> {
        match (&self.setup, &self.schema) {
            (None, None) => Ok(()),
            (Some(setup), Some(schema)) => {
                schema
                    .covers(setup)
                    .map_err(|message| ProtocolError::invalid_scope(&self.name, message))?;
                setup
                    .ordered_tables()
                    .map(|_| ())
                    .map_err(|e| ProtocolError::invalid_scope(&self.name, e.to_string()))
            }
            (Some(_), None) => Err(ProtocolError::invalid_scope(
                &self.name,
                "setup is set but schema is missing",
            )),
            (None, Some(_)) => Err(ProtocolError::invalid_scope(
                &self.name,
                "schema is set but setup is missing",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product_schema() -> SyncSchema {
        SyncSchema::new(vec![TableSchema::new(
            "Product",
            vec![
                ColumnSchema::new("id", "text").primary_key(),
                ColumnSchema::new("name", "text"),
            ],
        )])
    }

    #[test]
    fn setup_matching_ignores_order() {
        let a = SyncSetup::new(["A", "B"]);
        let b = SyncSetup::new(["B", "A"]);
        assert!(a.matches(&b));

        let c = SyncSetup::new(["A", "C"]);
        assert!(!a.matches(&c));

        let renamed = SyncSetup::new(["A", "B"]).with_tracking_naming("trk_", "");
        assert!(!a.matches(&renamed));
    }

    #[test]
    fn ordered_tables_follow_dependencies() {
        let setup = SyncSetup::new(Vec::<String>::new())
            .with_table(SetupTable::new("OrderLine").depends_on("Order").depends_on("Product"))
            .with_table(SetupTable::new("Order").depends_on("Customer"))
            .with_table(SetupTable::new("Product"))
            .with_table(SetupTable::new("Customer"));

        let names: Vec<&str> = setup
            .ordered_tables()
            .unwrap()
            .into_iter()
            .map(|t| t.name.as_str())
            .collect();
        assert_eq!(names, vec!["Product", "Customer", "Order", "OrderLine"]);
    }

    #[test]
    fn ordered_tables_rejects_cycles_and_unknown_tables() {
        let cycle = SyncSetup::new(Vec::<String>::new())
            .with_table(SetupTable::new("A").depends_on("B"))
            .with_table(SetupTable::new("B").depends_on("A"));
        assert!(matches!(
            cycle.ordered_tables(),
            Err(ProtocolError::InvalidSetup(_))
        ));

        let unknown = SyncSetup::new(Vec::<String>::new())
            .with_table(SetupTable::new("A").depends_on("Missing"));
        assert!(unknown.ordered_tables().is_err());
    }

    #[test]
    fn self_reference_is_not_a_cycle() {
        let setup = SyncSetup::new(Vec::<String>::new())
            .with_table(SetupTable::new("Employee").depends_on("Employee"));
        assert_eq!(setup.ordered_tables().unwrap().len(), 1);
    }

    #[test]
    fn scope_definition_invariant() {
        let empty = ScopeDefinition::new("main");
        assert!(!empty.is_provisioned());
        assert!(empty.validate().is_ok());

        let ok = ScopeDefinition::new("main")
            .provisioned(SyncSetup::new(["Product"]), product_schema());
        assert!(ok.validate().is_ok());

        let missing_table = ScopeDefinition::new("main")
            .provisioned(SyncSetup::new(["Product", "Customer"]), product_schema());
        assert!(missing_table.validate().is_err());

        let mut half = ScopeDefinition::new("main");
        half.setup = Some(SyncSetup::new(["Product"]));
        assert!(half.validate().is_err());
    }

    #[test]
    fn schema_covers_listed_columns() {
        let setup = SyncSetup::new(Vec::<String>::new())
            .with_table(SetupTable::new("Product").with_columns(["id", "price"]));
        let err = product_schema().covers(&setup).unwrap_err();
        assert!(err.contains("price"));
    }

    #[test]
    fn tracking_table_names() {
        let setup = SyncSetup::new(["Product"]);
        assert_eq!(setup.tracking_table_name("Product"), "Product_tracking");

        let setup = setup.with_tracking_naming("ss_", "_ct");
        assert_eq!(setup.tracking_table_name("Product"), "ss_Product_ct");
    }
}
