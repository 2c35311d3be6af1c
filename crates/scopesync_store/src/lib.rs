//! # scopesync store
//!
//! Persistence for scope definitions and per-client watermarks.
//!
//! Both sides of a sync relationship own a [`ScopeStore`]. It holds one
//! [`ScopeDefinition`](scopesync_protocol::ScopeDefinition) per scope name and one
//! [`ClientWatermark`](scopesync_protocol::ClientWatermark) per
//! (client id, scope name, parameter hash).
//!
//! ## Available Stores
//!
//! - [`MemoryScopeStore`] - For tests and ephemeral peers
//! - [`SqliteScopeStore`] - Persistent store on SQLite (`scope_info`, `scope_info_client`)
//!
//! Definitions written by older releases are brought forward with a
//! [`MigrationRegistry`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod memory;
mod migration;
mod sqlite;
mod store;

pub use error::{StoreError, StoreResult};
pub use memory::MemoryScopeStore;
pub use migration::{MigrationInfo, MigrationOutcome, MigrationRegistry, MigrationStep};
pub use sqlite::SqliteScopeStore;
pub use store::ScopeStore;
