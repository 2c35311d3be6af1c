//! Upgrades of stored scope definitions written by older releases.
//!
//! Stored definitions carry the semantic version of the release that wrote
//! them. A [`MigrationRegistry`] holds a table of steps, each keyed by the
//! range of versions it accepts and the version it produces, and folds a
//! definition forward one step at a time until no step applies.
//!
//! ## Usage
//!
//! ```ignore
//! let mut registry = MigrationRegistry::new(Version::new(0, 4, 0));
//! registry.register("rename_tracking_suffix", "<0.3.0", "0.3.0", |mut scope| {
//!     if let Some(setup) = scope.setup.as_mut() {
//!         setup.tracking_suffix = "_tracking".into();
//!     }
//!     Ok(scope)
//! })?;
//! let outcome = registry.upgrade(stored)?;
//! ```

use crate::error::{StoreError, StoreResult};
use crate::store::ScopeStore;
use scopesync_protocol::ScopeDefinition;
use semver::{Version, VersionReq};

/// A single upgrade step.
pub type MigrationStep = Box<dyn Fn(ScopeDefinition) -> StoreResult<ScopeDefinition> + Send + Sync>;

struct ScopeMigration {
    name: String,
    applies_to: VersionReq,
    target: Version,
    step: MigrationStep,
}

/// Description of a registered step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationInfo {
    /// Step name.
    pub name: String,
    /// Versions the step accepts.
    pub applies_to: VersionReq,
    /// Version the step produces.
    pub target: Version,
}

/// Result of upgrading one definition.
#[derive(Debug, Clone)]
pub struct MigrationOutcome {
    /// The upgraded definition.
    pub scope: ScopeDefinition,
    /// Names of the steps that ran, in order.
    pub applied: Vec<String>,
    /// Version the definition had before the upgrade.
    pub from_version: Version,
}

impl MigrationOutcome {
    /// True if the definition changed and needs to be written back.
    pub fn changed(&self) -> bool {
        self.scope.version != self.from_version.to_string()
    }
}

/// Table of `(accepted versions) -> step -> target version` entries.
pub struct MigrationRegistry {
    running: Version,
    migrations: Vec<ScopeMigration>,
}

impl std::fmt::Debug for MigrationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationRegistry")
            .field("running", &self.running)
            .field("migrations", &self.list())
            .finish()
    }
}

impl MigrationRegistry {
    /// Creates an empty registry for the given running version.
    #[must_use]
    pub fn new(running: Version) -> Self {
        Self {
            running,
            migrations: Vec::new(),
        }
    }

    /// Creates an empty registry for the version stamped by this release.
    pub fn for_current_release() -> StoreResult<Self> {
        let running = Version::parse(scopesync_protocol::SCOPE_VERSION)
            .map_err(|e| StoreError::Migration(format!("release version: {e}")))?;
        Ok(Self::new(running))
    }

    /// Returns the running version.
    pub fn running_version(&self) -> &Version {
        &self.running
    }

    /// Registers a step.
    ///
    /// Fails if the name is already taken, if either version fails to parse,
    /// or if `target` is newer than the running version.
    pub fn register<F>(
        &mut self,
        name: impl Into<String>,
        applies_to: &str,
        target: &str,
        step: F,
    ) -> StoreResult<()>
    where
        F: Fn(ScopeDefinition) -> StoreResult<ScopeDefinition> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.migrations.iter().any(|m| m.name == name) {
            return Err(StoreError::Migration(format!(
                "migration `{name}` already registered"
            )));
        }
        let applies_to = VersionReq::parse(applies_to)
            .map_err(|e| StoreError::Migration(format!("`{name}` version range: {e}")))?;
        let target = Version::parse(target)
            .map_err(|e| StoreError::Migration(format!("`{name}` target version: {e}")))?;
        if target > self.running {
            return Err(StoreError::Migration(format!(
                "`{name}` targets {target}, newer than running version {}",
                self.running
            )));
        }
        self.migrations.push(ScopeMigration {
            name,
            applies_to,
            target,
            step: Box::new(step),
        });
        Ok(())
    }

    /// Lists registered steps in registration order.
    #[must_use]
    pub fn list(&self) -> Vec<MigrationInfo> {
        self.migrations
            .iter()
            .map(|m| MigrationInfo {
                name: m.name.clone(),
                applies_to: m.applies_to.clone(),
                target: m.target.clone(),
            })
            .collect()
    }

    /// Upgrades a definition to the running version.
    ///
    /// Steps are applied while one accepts the current version and moves it
    /// forward. The result is stamped with the running version and validated.
    pub fn upgrade(&self, scope: ScopeDefinition) -> StoreResult<MigrationOutcome> {
        let from_version = Version::parse(&scope.version).map_err(|e| {
            StoreError::Corrupted(format!("scope `{}` version `{}`: {e}", scope.name, scope.version))
        })?;
        if from_version > self.running {
            return Err(StoreError::UnsupportedVersion {
                scope: scope.name,
                found: from_version.to_string(),
                running: self.running.to_string(),
            });
        }

        let mut current = from_version.clone();
        let mut scope = scope;
        let mut applied = Vec::new();

        // Targets strictly increase and are bounded by `running`, so this terminates.
        while let Some(migration) = self
            .migrations
            .iter()
            .find(|m| m.applies_to.matches(&current) && m.target > current)
        {
            tracing::debug!(
                scope = %scope.name,
                migration = %migration.name,
                from = %current,
                to = %migration.target,
                "applying scope migration"
            );
            scope = (migration.step)(scope)?;
            current = migration.target.clone();
            scope.version = current.to_string();
            applied.push(migration.name.clone());
        }

        scope.version = self.running.to_string();
        scope.validate()?;

        Ok(MigrationOutcome {
            scope,
            applied,
            from_version,
        })
    }

    /// Upgrades every stored definition that is older than the running version.
    ///
    /// Returns the names of the scopes that were rewritten.
    pub async fn upgrade_store(&self, store: &dyn ScopeStore) -> StoreResult<Vec<String>> {
        let mut rewritten = Vec::new();
        for scope in store.get_all_scopes().await? {
            let outcome = self.upgrade(scope)?;
            if outcome.changed() {
                store.upsert_scope(&outcome.scope).await?;
                rewritten.push(outcome.scope.name);
            }
        }
        Ok(rewritten)
    }
}
