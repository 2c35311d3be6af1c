//! Per-client progress watermarks and sync parameters.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Filter parameter values for a parameterized scope.
///
/// Different parameter values are different sync streams and never share a
/// watermark. Parameters are kept sorted by name so that hashing is stable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncParameters(BTreeMap<String, serde_json::Value>);

impl SyncParameters {
    /// Creates an empty parameter set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a parameter value.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Returns a parameter value.
    pub fn get(&self, name: &str) -> Option<&serde_json::Value> {
        self.0.get(name)
    }

    /// Returns true if no parameter is set.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over parameters in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.0.iter()
    }

    /// Lowercase hex SHA-256 of the canonical parameter encoding.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        for (name, value) in &self.0 {
            hasher.update((name.len() as u64).to_le_bytes());
            hasher.update(name.as_bytes());
            let encoded = value.to_string();
            hasher.update((encoded.len() as u64).to_le_bytes());
            hasher.update(encoded.as_bytes());
        }
        hasher
            .finalize()
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

/// Natural key of a [`ClientWatermark`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WatermarkKey {
    /// Synchronizing client instance.
    pub client_id: Uuid,
    /// Scope name.
    pub scope_name: String,
    /// Hash of the filter parameters.
    pub parameters_hash: String,
}

impl WatermarkKey {
    /// Creates a key.
    pub fn new(
        client_id: Uuid,
        scope_name: impl Into<String>,
        parameters_hash: impl Into<String>,
    ) -> Self {
        Self {
            client_id,
            scope_name: scope_name.into(),
            parameters_hash: parameters_hash.into(),
        }
    }
}

/// Progress of one client on one parameterized scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientWatermark {
    /// Synchronizing client instance.
    pub client_id: Uuid,
    /// Scope name.
    pub scope_name: String,
    /// Hash of the filter parameters.
    pub parameters_hash: String,
    /// Local change-tracking position as of the last successful upload.
    pub last_local_watermark: Option<u64>,
    /// Remote change-tracking position as of the last successful download.
    pub last_remote_watermark: Option<u64>,
    /// Completion time of the last successful session, in milliseconds since the Unix epoch.
    pub last_sync_time: Option<u64>,
    /// Duration of the last successful session in milliseconds.
    pub last_sync_duration_ms: u64,
}

impl ClientWatermark {
    /// Creates a fresh watermark with no progress.
    pub fn new(key: WatermarkKey) -> Self {
        Self {
            client_id: key.client_id,
            scope_name: key.scope_name,
            parameters_hash: key.parameters_hash,
            last_local_watermark: None,
            last_remote_watermark: None,
            last_sync_time: None,
            last_sync_duration_ms: 0,
        }
    }

    /// True until the first successful session.
    pub fn is_new(&self) -> bool {
        self.last_sync_time.is_none()
    }

    /// Returns the natural key.
    pub fn key(&self) -> WatermarkKey {
        WatermarkKey::new(self.client_id, &self.scope_name, &self.parameters_hash)
    }
}
