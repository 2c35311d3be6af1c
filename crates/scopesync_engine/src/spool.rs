//! Session-scoped storage for batch parts.
//!
//! A [`BatchSpool`] holds the parts of one batch, either in memory or as CBOR
//! files inside a private temporary directory. The directory is removed when
//! the spool is dropped, so temporary storage never outlives its session.
//!
//! A [`BatchAssembler`] receives downloaded parts in any order, checks each one
//! against the batch summary and reports completion once every index is present.

use crate::config::SpoolMode;
use crate::error::{SyncError, SyncResult};
use scopesync_protocol::{BatchPart, BatchPartInfo, BatchSummary};
use scopesync_store::StoreError;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// SHA-256 digest of a part's canonical JSON encoding.
pub fn part_digest(part: &BatchPart) -> SyncResult<[u8; 32]> {
    let bytes = serde_json::to_vec(part)
        .map_err(|e| SyncError::Protocol(format!("cannot encode part {}: {e}", part.index)))?;
    Ok(Sha256::digest(&bytes).into())
}

enum SpoolStorage {
    Memory(BTreeMap<u32, BatchPart>),
    Disk(TempDir),
}

/// Storage for the parts of one batch.
pub struct BatchSpool {
    storage: SpoolStorage,
    infos: BTreeMap<u32, BatchPartInfo>,
}

impl std::fmt::Debug for BatchSpool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchSpool")
            .field("path", &self.path())
            .field("parts", &self.infos.len())
            .finish()
    }
}

fn spool_io(err: std::io::Error) -> SyncError {
    SyncError::Storage(StoreError::Io(err))
}

impl BatchSpool {
    /// Creates an empty spool.
    pub fn new(mode: &SpoolMode) -> SyncResult<Self> {
        let storage = match mode {
            SpoolMode::Memory => SpoolStorage::Memory(BTreeMap::new()),
            SpoolMode::Disk(root) => {
                let mut builder = tempfile::Builder::new();
                builder.prefix("scopesync-batch-");
                let dir = match root {
                    Some(root) => {
                        std::fs::create_dir_all(root).map_err(spool_io)?;
                        builder.tempdir_in(root)
                    }
                    None => builder.tempdir(),
                }
                .map_err(spool_io)?;
                SpoolStorage::Disk(dir)
            }
        };
        Ok(Self {
            storage,
            infos: BTreeMap::new(),
        })
    }

    fn part_path(dir: &TempDir, index: u32) -> PathBuf {
        dir.path().join(format!("part-{index}.cbor"))
    }

    /// Stores a part, replacing any part with the same index.
    pub fn put(&mut self, part: &BatchPart) -> SyncResult<()> {
        match &mut self.storage {
            SpoolStorage::Memory(parts) => {
                parts.insert(part.index, part.clone());
            }
            SpoolStorage::Disk(dir) => {
                let file = File::create(Self::part_path(dir, part.index)).map_err(spool_io)?;
                ciborium::ser::into_writer(part, BufWriter::new(file)).map_err(|e| {
                    SyncError::Storage(StoreError::Corrupted(format!(
                        "cannot spool part {}: {e}",
                        part.index
                    )))
                })?;
            }
        }
        self.infos.insert(part.index, part.info());
        Ok(())
    }

    /// Loads a part.
    pub fn get(&self, index: u32) -> SyncResult<Option<BatchPart>> {
        if !self.infos.contains_key(&index) {
            return Ok(None);
        }
        match &self.storage {
            SpoolStorage::Memory(parts) => Ok(parts.get(&index).cloned()),
            SpoolStorage::Disk(dir) => {
                let file = File::open(Self::part_path(dir, index)).map_err(spool_io)?;
                let part = ciborium::de::from_reader(BufReader::new(file)).map_err(|e| {
                    SyncError::Storage(StoreError::Corrupted(format!(
                        "cannot read spooled part {index}: {e}"
                    )))
                })?;
                Ok(Some(part))
            }
        }
    }

    /// Returns true if a part with this index is stored.
    pub fn contains(&self, index: u32) -> bool {
        self.infos.contains_key(&index)
    }

    /// Descriptions of stored parts in index order.
    pub fn infos(&self) -> Vec<BatchPartInfo> {
        self.infos.values().cloned().collect()
    }

    /// Number of stored parts.
    pub fn len(&self) -> usize {
        self.infos.len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Directory of a disk spool.
    pub fn path(&self) -> Option<&Path> {
        match &self.storage {
            SpoolStorage::Memory(_) => None,
            SpoolStorage::Disk(dir) => Some(dir.path()),
        }
    }
}

/// Collects the parts of a downloaded batch.
#[derive(Debug)]
pub struct BatchAssembler {
    summary: BatchSummary,
    spool: BatchSpool,
    digests: BTreeMap<u32, [u8; 32]>,
}

impl BatchAssembler {
    /// Creates an assembler for a validated summary.
    pub fn new(summary: BatchSummary, spool: BatchSpool) -> Self {
        Self {
            summary,
            spool,
            digests: BTreeMap::new(),
        }
    }

    /// The summary being assembled.
    pub fn summary(&self) -> &BatchSummary {
        &self.summary
    }

    /// Accepts a part. Returns false if the same part had already arrived.
    ///
    /// A part not listed in the summary, disagreeing with its listing, or
    /// arriving twice with different content is a protocol error.
    pub fn accept(&mut self, part: BatchPart) -> SyncResult<bool> {
        let expected = self.summary.part(part.index).ok_or_else(|| {
            SyncError::Protocol(format!("part {} is not listed in the summary", part.index))
        })?;
        if expected != &part.info() {
            return Err(SyncError::Protocol(format!(
                "part {} does not match its summary entry",
                part.index
            )));
        }

        let digest = part_digest(&part)?;
        if let Some(previous) = self.digests.get(&part.index) {
            if previous == &digest {
                return Ok(false);
            }
            return Err(SyncError::Protocol(format!(
                "part {} arrived twice with different content",
                part.index
            )));
        }

        self.spool.put(&part)?;
        self.digests.insert(part.index, digest);
        Ok(true)
    }

    /// Returns true once every listed part has arrived.
    pub fn is_complete(&self) -> bool {
        self.missing().is_empty()
    }

    /// Indices still missing.
    pub fn missing(&self) -> Vec<u32> {
        self.summary
            .parts
            .iter()
            .map(|p| p.index)
            .filter(|index| !self.spool.contains(*index))
            .collect()
    }

    /// Loads every part in index order.
    pub fn parts(&self) -> SyncResult<Vec<BatchPart>> {
        let mut parts = Vec::with_capacity(self.summary.part_count());
        for info in &self.summary.parts {
            let part = self.spool.get(info.index)?.ok_or_else(|| {
                SyncError::Protocol(format!("part {} has not been downloaded", info.index))
            })?;
            parts.push(part);
        }
        Ok(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scopesync_protocol::RowChange;
    use std::collections::BTreeMap as Map;

    fn part(index: u32, rows: usize, last: bool) -> BatchPart {
        BatchPart {
            index,
            is_last_part: last,
            table: Some("Product".into()),
            rows: (0..rows)
                .map(|i| RowChange::upsert(format!("p{index}-{i}"), Map::new(), i as u64))
                .collect(),
        }
    }

    fn summary(parts: &[BatchPart]) -> BatchSummary {
        BatchSummary::new(10, parts.iter().map(BatchPart::info).collect())
    }

    #[test]
    fn memory_spool_round_trip() {
        let mut spool = BatchSpool::new(&SpoolMode::Memory).unwrap();
        assert!(spool.path().is_none());
        spool.put(&part(0, 2, true)).unwrap();
        assert_eq!(spool.get(0).unwrap(), Some(part(0, 2, true)));
        assert_eq!(spool.get(1).unwrap(), None);
    }

    #[test]
    fn disk_spool_is_removed_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let mut spool = BatchSpool::new(&SpoolMode::Disk(Some(root.path().to_path_buf()))).unwrap();
        spool.put(&part(0, 3, false)).unwrap();
        spool.put(&part(1, 1, true)).unwrap();

        let dir = spool.path().unwrap().to_path_buf();
        assert!(dir.join("part-1.cbor").exists());
        assert_eq!(spool.get(0).unwrap(), Some(part(0, 3, false)));
        assert_eq!(spool.infos().len(), 2);

        drop(spool);
        assert!(!dir.exists());
    }

    #[test]
    fn assembler_accepts_out_of_order_parts() {
        let parts = vec![part(0, 2, false), part(1, 2, false), part(2, 1, true)];
        let mut assembler =
            BatchAssembler::new(summary(&parts), BatchSpool::new(&SpoolMode::Memory).unwrap());

        assert!(assembler.accept(parts[2].clone()).unwrap());
        assert!(assembler.accept(parts[0].clone()).unwrap());
        assert_eq!(assembler.missing(), vec![1]);
        assert!(!assembler.is_complete());

        assert!(assembler.accept(parts[1].clone()).unwrap());
        assert!(!assembler.accept(parts[1].clone()).unwrap());
        assert!(assembler.is_complete());

        let indices: Vec<u32> = assembler.parts().unwrap().iter().map(|p| p.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[test]
    fn assembler_rejects_mismatches() {
        let parts = vec![part(0, 2, true)];
        let mut assembler =
            BatchAssembler::new(summary(&parts), BatchSpool::new(&SpoolMode::Memory).unwrap());

        assert!(assembler.accept(part(1, 2, true)).is_err());
        assert!(assembler.accept(part(0, 3, true)).is_err());

        assembler.accept(parts[0].clone()).unwrap();
        let mut altered = parts[0].clone();
        altered.rows[0].key = "other".into();
        assert!(matches!(
            assembler.accept(altered),
            Err(SyncError::Protocol(_))
        ));
    }

    #[test]
    fn digests_depend_on_content() {
        let a = part(0, 2, true);
        let mut b = a.clone();
        assert_eq!(part_digest(&a).unwrap(), part_digest(&b).unwrap());
        b.rows[1].timestamp = 99;
        assert_ne!(part_digest(&a).unwrap(), part_digest(&b).unwrap());
    }
}
