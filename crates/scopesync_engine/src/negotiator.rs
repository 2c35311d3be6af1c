//! Reconciliation of scope setups between a requested agreement, the local
//! definition and the remote definition.

use crate::config::SetupConflictPolicy;
use crate::error::{SyncError, SyncResult};
use crate::listener::ListenerRegistry;
use crate::provider::DataProvider;
use scopesync_protocol::{ScopeDefinition, SyncSetup};
use scopesync_store::{MigrationRegistry, ScopeStore};

/// What to do about a setup conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictAction {
    /// Continue with the reconciled setups, which are compared once more.
    Continue,
    /// End the session cleanly without transferring data.
    Abort,
    /// Fail the session with a setup conflict error.
    Rollback,
}

impl From<SetupConflictPolicy> for ConflictAction {
    fn from(policy: SetupConflictPolicy) -> Self {
        match policy {
            SetupConflictPolicy::Abort => ConflictAction::Abort,
            SetupConflictPolicy::Rollback => ConflictAction::Rollback,
            SetupConflictPolicy::AutoReconcile => ConflictAction::Continue,
        }
    }
}

/// A disagreement between two setups, handed to listeners for resolution.
#[derive(Debug, Clone)]
pub struct SetupConflict {
    /// Scope name.
    pub scope_name: String,
    /// Setup already in place.
    pub local: SyncSetup,
    /// Setup it is compared against.
    pub remote: SyncSetup,
    /// Chosen action. Starts from the configured policy.
    pub action: ConflictAction,
    /// Replacement for `local` when continuing.
    pub resolved_local: Option<SyncSetup>,
    /// Replacement for `remote` when continuing.
    pub resolved_remote: Option<SyncSetup>,
}

/// Result of comparing two setups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Comparison {
    /// The setups were equal.
    Matched(SyncSetup),
    /// The setups differed and were reconciled to this value.
    Reconciled(SyncSetup),
    /// The setups differed and the session is to end without transferring data.
    Aborted,
}

/// Outcome of reconciling a scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// True if any setup conflict was raised.
    pub conflict: bool,
    /// Agreed setup, `None` if the session was aborted.
    pub setup: Option<SyncSetup>,
}

impl Reconciliation {
    /// Returns true if the session should end without transferring data.
    pub fn aborted(&self) -> bool {
        self.setup.is_none()
    }
}

/// Compares setups and escalates conflicts according to a policy.
pub struct ScopeNegotiator<'a> {
    policy: SetupConflictPolicy,
    listeners: &'a ListenerRegistry,
}

impl<'a> ScopeNegotiator<'a> {
    /// Creates a negotiator.
    pub fn new(policy: SetupConflictPolicy, listeners: &'a ListenerRegistry) -> Self {
        Self { policy, listeners }
    }

    /// Compares `current` against `incoming`.
    ///
    /// On mismatch a [`SetupConflict`] goes to the listeners. `Rollback` fails,
    /// `Abort` returns [`Comparison::Aborted`] and `Continue` compares the
    /// resolved setups exactly once more; a second mismatch always fails.
    pub fn compare(
        &self,
        scope_name: &str,
        current: &SyncSetup,
        incoming: &SyncSetup,
    ) -> SyncResult<Comparison> {
        if current.matches(incoming) {
            return Ok(Comparison::Matched(incoming.clone()));
        }

        let mut conflict = SetupConflict {
            scope_name: scope_name.to_string(),
            local: current.clone(),
            remote: incoming.clone(),
            action: self.policy.into(),
            resolved_local: None,
            resolved_remote: None,
        };
        if self.policy == SetupConflictPolicy::AutoReconcile {
            conflict.resolved_local = Some(incoming.clone());
            conflict.resolved_remote = Some(incoming.clone());
        }
        self.listeners.setup_conflict(&mut conflict);

        tracing::warn!(
            scope = %scope_name,
            local = ?current.table_names(),
            remote = ?incoming.table_names(),
            action = ?conflict.action,
            "setup conflict"
        );

        match conflict.action {
            ConflictAction::Rollback => Err(SyncError::SetupConflict {
                scope: scope_name.to_string(),
                local: Box::new(conflict.local),
                remote: Box::new(conflict.remote),
            }),
            ConflictAction::Abort => Ok(Comparison::Aborted),
            ConflictAction::Continue => {
                let local = conflict.resolved_local.unwrap_or(conflict.local);
                let remote = conflict.resolved_remote.unwrap_or(conflict.remote);
                if local.matches(&remote) {
                    Ok(Comparison::Reconciled(remote))
                } else {
                    Err(SyncError::SetupConflict {
                        scope: scope_name.to_string(),
                        local: Box::new(local),
                        remote: Box::new(remote),
                    })
                }
            }
        }
    }

    /// Reconciles the requested setup with the local and remote definitions.
    ///
    /// Without an explicit request the remote setup is requested, then the
    /// local one. The request is compared against the local setup if the local
    /// scope is provisioned, and the result against the remote setup if the
    /// remote scope is provisioned.
    pub fn reconcile(
        &self,
        local: &ScopeDefinition,
        remote: &ScopeDefinition,
        requested: Option<&SyncSetup>,
    ) -> SyncResult<Reconciliation> {
        let mut setup = requested
            .or(remote.setup.as_ref())
            .or(local.setup.as_ref())
            .cloned()
            .ok_or_else(|| {
                SyncError::Config(format!(
                    "scope `{}` has no setup on either side and none was requested",
                    local.name
                ))
            })?;
        let mut conflict = false;

        let provisioned = [
            (local.is_provisioned(), local.setup.as_ref(), true),
            (remote.is_provisioned(), remote.setup.as_ref(), false),
        ];
        for (is_provisioned, existing, is_local) in provisioned {
            let Some(existing) = existing.filter(|_| is_provisioned) else {
                continue;
            };
            // The local setup is the one in place; against the remote side the
            // agreed setup so far is the one in place.
            let comparison = if is_local {
                self.compare(&local.name, existing, &setup)?
            } else {
                self.compare(&local.name, &setup, existing)?
            };
            match comparison {
                Comparison::Matched(agreed) => setup = agreed,
                Comparison::Reconciled(agreed) => {
                    conflict = true;
                    setup = agreed;
                }
                Comparison::Aborted => {
                    return Ok(Reconciliation {
                        conflict: true,
                        setup: None,
                    })
                }
            }
        }

        Ok(Reconciliation {
            conflict,
            setup: Some(setup),
        })
    }
}

/// Checks that a newly provisioned scope uses the tracking naming convention
/// of every other provisioned scope on the same store.
pub fn check_naming(
    scope_name: &str,
    setup: &SyncSetup,
    existing: &[ScopeDefinition],
) -> SyncResult<()> {
    let clash = existing
        .iter()
        .filter(|scope| scope.name != scope_name && scope.is_provisioned())
        .find_map(|scope| {
            scope
                .setup
                .as_ref()
                .filter(|other| !other.same_naming(setup))
                .map(|other| (scope, other))
        });

    match clash {
        Some((scope, other)) => Err(SyncError::TrackingNamingMismatch {
            scope: scope_name.to_string(),
            existing_scope: scope.name.clone(),
            existing: other.tracking_table_name("*"),
            requested: setup.tracking_table_name("*"),
        }),
        None => Ok(()),
    }
}

/// Loads a scope definition, creating an empty one on first contact and
/// upgrading definitions written by older releases.
pub(crate) async fn load_scope(
    store: &dyn ScopeStore,
    migrations: Option<&MigrationRegistry>,
    scope_name: &str,
) -> SyncResult<ScopeDefinition> {
    let Some(scope) = store.get_scope(scope_name).await? else {
        tracing::debug!(scope = %scope_name, "creating scope definition");
        return Ok(store.upsert_scope(&ScopeDefinition::new(scope_name)).await?);
    };
    let Some(migrations) = migrations else {
        return Ok(scope);
    };
    let outcome = migrations.upgrade(scope)?;
    if !outcome.changed() {
        return Ok(outcome.scope);
    }
    tracing::info!(
        scope = %scope_name,
        from = %outcome.from_version,
        steps = ?outcome.applied,
        "upgraded scope definition"
    );
    Ok(store.upsert_scope(&outcome.scope).await?)
}

/// Provisions tracking for `setup` and commits it to the scope definition.
pub(crate) async fn provision_scope(
    store: &dyn ScopeStore,
    provider: &dyn DataProvider,
    scope: ScopeDefinition,
    setup: SyncSetup,
) -> SyncResult<ScopeDefinition> {
    let existing = store.get_all_scopes().await?;
    check_naming(&scope.name, &setup, &existing)?;

    // Tables the new setup no longer carries lose their tracking, unless
    // another provisioned scope still syncs them.
    if let Some(previous) = scope.setup.as_ref().filter(|_| scope.is_provisioned()) {
        let shared = |table: &str| {
            existing.iter().any(|other| {
                other.name != scope.name
                    && other.is_provisioned()
                    && other.setup.as_ref().is_some_and(|s| s.table(table).is_some())
            })
        };
        let mut retired = previous.clone();
        retired
            .tables
            .retain(|t| setup.table(&t.name).is_none() && !shared(&t.name));
        if !retired.tables.is_empty() {
            tracing::info!(
                scope = %scope.name,
                tables = ?retired.table_names(),
                "deprovisioning tables dropped from scope"
            );
            provider.deprovision(&retired).await?;
        }
    }

    let schema = provider.provision(&setup).await?;
    let scope = scope.provisioned(setup, schema);
    scope.validate()?;

    tracing::info!(
        scope = %scope.name,
        tables = ?scope.setup.as_ref().map(SyncSetup::table_names),
        "provisioned scope"
    );
    Ok(store.upsert_scope(&scope).await?)
}
