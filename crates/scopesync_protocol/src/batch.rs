//! Row changes and the batch parts that carry them.

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Kind of row change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Row was inserted or updated.
    Upsert,
    /// Row was deleted.
    Delete,
}

/// A single changed row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    /// Primary key, rendered as text.
    pub key: String,
    /// Kind of change.
    pub kind: ChangeKind,
    /// Column values. Empty for deletes.
    #[serde(default)]
    pub values: BTreeMap<String, serde_json::Value>,
    /// Change-tracking timestamp of the row on the side that produced it.
    pub timestamp: u64,
}

impl RowChange {
    /// Creates an upsert change.
    pub fn upsert(
        key: impl Into<String>,
        values: BTreeMap<String, serde_json::Value>,
        timestamp: u64,
    ) -> Self {
        Self {
            key: key.into(),
            kind: ChangeKind::Upsert,
            values,
            timestamp,
        }
    }

    /// Creates a delete change.
    pub fn delete(key: impl Into<String>, timestamp: u64) -> Self {
        Self {
            key: key.into(),
            kind: ChangeKind::Delete,
            values: BTreeMap::new(),
            timestamp,
        }
    }

    /// Returns true for deletes.
    pub fn is_delete(&self) -> bool {
        self.kind == ChangeKind::Delete
    }
}

/// All selected changes of one table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableChanges {
    /// Table name.
    pub table: String,
    /// Changed rows in selection order.
    pub rows: Vec<RowChange>,
}

impl TableChanges {
    /// Creates a table change set.
    pub fn new(table: impl Into<String>, rows: Vec<RowChange>) -> Self {
        Self {
            table: table.into(),
            rows,
        }
    }
}

/// One bounded, independently transferable slice of a change batch.
///
/// A part holds rows of exactly one table. The empty terminal part of an
/// empty batch has no table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchPart {
    /// Position in the batch, starting at zero.
    pub index: u32,
    /// Marks the final part of the batch.
    pub is_last_part: bool,
    /// Table the rows belong to.
    pub table: Option<String>,
    /// Rows carried by this part.
    pub rows: Vec<RowChange>,
}

impl BatchPart {
    /// Creates the empty terminal part of an empty batch.
    pub fn empty_last(index: u32) -> Self {
        Self {
            index,
            is_last_part: true,
            table: None,
            rows: Vec::new(),
        }
    }

    /// Number of rows in the part.
    pub fn row_count(&self) -> u64 {
        self.rows.len() as u64
    }

    /// Returns the descriptor of this part.
    pub fn info(&self) -> BatchPartInfo {
        BatchPartInfo {
            index: self.index,
            table: self.table.clone(),
            row_count: self.row_count(),
            is_last_part: self.is_last_part,
        }
    }
}

/// Descriptor of a batch part, as listed in a [`BatchSummary`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchPartInfo {
    /// Position in the batch.
    pub index: u32,
    /// Table the rows belong to.
    pub table: Option<String>,
    /// Number of rows in the part.
    pub row_count: u64,
    /// Marks the final part of the batch.
    pub is_last_part: bool,
}

/// Outbound batch announced by a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    /// Peer change-tracking position at summary time.
    pub remote_watermark: u64,
    /// Rows across all parts.
    pub total_rows: u64,
    /// Part descriptors in index order.
    pub parts: Vec<BatchPartInfo>,
}

impl BatchSummary {
    /// Creates a summary, computing the row total.
    pub fn new(remote_watermark: u64, parts: Vec<BatchPartInfo>) -> Self {
        let total_rows = parts.iter().map(|p| p.row_count).sum();
        Self {
            remote_watermark,
            total_rows,
            parts,
        }
    }

    /// Number of parts.
    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    /// Looks up a part descriptor.
    pub fn part(&self, index: u32) -> Option<&BatchPartInfo> {
        self.parts.get(index as usize).filter(|p| p.index == index)
    }

    /// Checks that parts are numbered `0..n` and only the final one is last.
    pub fn validate(&self) -> ProtocolResult<()> {
        if self.parts.is_empty() {
            return Err(ProtocolError::InvalidSummary("summary lists no parts".into()));
        }
        for (position, part) in self.parts.iter().enumerate() {
            if part.index as usize != position {
                return Err(ProtocolError::InvalidSummary(format!(
                    "part at position {position} has index {}",
                    part.index
                )));
            }
            let should_be_last = position + 1 == self.parts.len();
            if part.is_last_part != should_be_last {
                return Err(ProtocolError::InvalidSummary(format!(
                    "part {} has is_last_part={} but {} parts are listed",
                    part.index,
                    part.is_last_part,
                    self.parts.len()
                )));
            }
        }
        let sum: u64 = self.parts.iter().map(|p| p.row_count).sum();
        if sum != self.total_rows {
            return Err(ProtocolError::InvalidSummary(format!(
                "total_rows is {} but parts hold {sum}",
                self.total_rows
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(index: u32, rows: u64, last: bool) -> BatchPartInfo {
        BatchPartInfo {
            index,
            table: Some("Product".into()),
            row_count: rows,
            is_last_part: last,
        }
    }

    #[test]
    fn summary_totals_rows() {
        let summary = BatchSummary::new(103, vec![info(0, 2, false), info(1, 2, false), info(2, 1, true)]);
        assert_eq!(summary.total_rows, 5);
        assert_eq!(summary.part_count(), 3);
        assert!(summary.validate().is_ok());
        assert_eq!(summary.part(2).map(|p| p.row_count), Some(1));
        assert!(summary.part(3).is_none());
    }

    #[test]
    fn summary_rejects_misplaced_last_marker() {
        let summary = BatchSummary::new(1, vec![info(0, 1, true), info(1, 1, true)]);
        assert!(summary.validate().is_err());

        let summary = BatchSummary::new(1, vec![info(0, 1, false)]);
        assert!(summary.validate().is_err());
    }

    #[test]
    fn summary_rejects_gaps_and_empty_lists() {
        let summary = BatchSummary::new(1, vec![info(0, 1, false), info(2, 1, true)]);
        assert!(summary.validate().is_err());

        let summary = BatchSummary::new(1, Vec::new());
        assert!(summary.validate().is_err());
    }

    #[test]
    fn empty_last_part() {
        let part = BatchPart::empty_last(0);
        assert!(part.is_last_part);
        assert_eq!(part.row_count(), 0);
        assert_eq!(part.info().table, None);
    }
}
