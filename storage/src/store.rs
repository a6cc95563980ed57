//! The versioned key-value store

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;

use crate::error::{StorageError, StorageResult};

/// Current key → value state
const DATA: TableDefinition<&[u8], &[u8]> = TableDefinition::new("data");

/// Version tag → undo record (bincode list of `(key, prior value)`)
const UNDO: TableDefinition<&[u8], &[u8]> = TableDefinition::new("undo");

/// Commit sequence number → version tag
const VERSIONS: TableDefinition<u64, &[u8]> = TableDefinition::new("versions");

/// Opaque version tag a batch was committed under
pub type VersionTag = Vec<u8>;

/// Undo record: the value each touched key held before the batch,
/// `None` for keys that did not exist.
type UndoRecord = Vec<(Vec<u8>, Option<Vec<u8>>)>;

/// Versioned key-value store
pub struct VersionedStore {
    db: Arc<Database>,
}

impl VersionedStore {
    /// Open or create a store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(DATA)?;
            let _ = write_txn.open_table(UNDO)?;
            let _ = write_txn.open_table(VERSIONS)?;
        }
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Get the current value of a key
    pub fn get(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(DATA)?;
        let result = table.get(key)?.map(|guard| guard.value().to_vec());
        Ok(result)
    }

    /// Apply a batch of insertions and removals atomically under a new
    /// version tag. The tag must not have been committed before. After a
    /// successful call `last_version_id()` returns the tag and the tag is
    /// reachable from `rollback_versions()` until evicted by [`clean`].
    ///
    /// [`clean`]: VersionedStore::clean
    pub fn bulk_insert(
        &self,
        version: &[u8],
        to_insert: &[(Vec<u8>, Vec<u8>)],
        to_remove: &[Vec<u8>],
    ) -> StorageResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut data = write_txn.open_table(DATA)?;
            let mut undo = write_txn.open_table(UNDO)?;
            let mut versions = write_txn.open_table(VERSIONS)?;

            if undo.get(version)?.is_some() {
                return Err(StorageError::VersionExists(hex_prefix(version)));
            }

            // Record the prior value of every touched key, once.
            let mut record: UndoRecord = Vec::with_capacity(to_insert.len() + to_remove.len());
            let mut seen: HashSet<&[u8]> = HashSet::new();
            for key in to_insert
                .iter()
                .map(|(key, _)| key.as_slice())
                .chain(to_remove.iter().map(Vec::as_slice))
            {
                if seen.insert(key) {
                    let prior = data.get(key)?.map(|guard| guard.value().to_vec());
                    record.push((key.to_vec(), prior));
                }
            }

            for (key, value) in to_insert {
                data.insert(key.as_slice(), value.as_slice())?;
            }
            for key in to_remove {
                data.remove(key.as_slice())?;
            }

            let next_seq = versions
                .iter()?
                .next_back()
                .transpose()?
                .map(|(seq, _)| seq.value() + 1)
                .unwrap_or(0);
            versions.insert(next_seq, version)?;
            undo.insert(version, bincode::serialize(&record)?.as_slice())?;
        }
        write_txn.commit()?;

        debug!(
            version = %hex_prefix(version),
            inserted = to_insert.len(),
            removed = to_remove.len(),
            "Committed version"
        );
        Ok(())
    }

    /// Tag of the most recent committed version
    pub fn last_version_id(&self) -> StorageResult<Option<VersionTag>> {
        let read_txn = self.db.begin_read()?;
        let versions = read_txn.open_table(VERSIONS)?;
        let result = versions
            .iter()?
            .next_back()
            .transpose()?
            .map(|(_, tag)| tag.value().to_vec());
        Ok(result)
    }

    /// Version tags reachable for rollback, newest first
    pub fn rollback_versions(&self) -> StorageResult<Vec<VersionTag>> {
        let read_txn = self.db.begin_read()?;
        let versions = read_txn.open_table(VERSIONS)?;
        let mut tags = Vec::new();
        for entry in versions.iter()?.rev() {
            let (_, tag) = entry?;
            tags.push(tag.value().to_vec());
        }
        Ok(tags)
    }

    /// Whether a version tag is still reachable for rollback
    pub fn contains_version(&self, version: &[u8]) -> StorageResult<bool> {
        let read_txn = self.db.begin_read()?;
        let undo = read_txn.open_table(UNDO)?;
        let result = undo.get(version)?.is_some();
        Ok(result)
    }

    /// Roll the store back to the state right after `version` was
    /// committed, undoing every newer version newest-first. The undone
    /// versions are discarded.
    pub fn rollback(&self, version: &[u8]) -> StorageResult<()> {
        let write_txn = self.db.begin_write()?;
        let mut undone = 0usize;
        {
            let mut data = write_txn.open_table(DATA)?;
            let mut undo = write_txn.open_table(UNDO)?;
            let mut versions = write_txn.open_table(VERSIONS)?;

            // Locate the target among the committed versions.
            let mut target_seq = None;
            for entry in versions.iter()? {
                let (seq, tag) = entry?;
                if tag.value() == version {
                    target_seq = Some(seq.value());
                    break;
                }
            }
            let target_seq =
                target_seq.ok_or_else(|| StorageError::UnknownVersion(hex_prefix(version)))?;

            // Collect the newer versions, newest first.
            let mut newer: Vec<(u64, Vec<u8>)> = Vec::new();
            for entry in versions.range(target_seq + 1..)? {
                let (seq, tag) = entry?;
                newer.push((seq.value(), tag.value().to_vec()));
            }
            newer.reverse();

            for (seq, tag) in newer {
                let record_bytes = undo
                    .remove(tag.as_slice())?
                    .map(|guard| guard.value().to_vec())
                    .ok_or_else(|| {
                        StorageError::Corruption(format!(
                            "missing undo record for version {}",
                            hex_prefix(&tag)
                        ))
                    })?;
                let record: UndoRecord = bincode::deserialize(&record_bytes)?;
                for (key, prior) in record.into_iter().rev() {
                    match prior {
                        Some(value) => {
                            data.insert(key.as_slice(), value.as_slice())?;
                        }
                        None => {
                            data.remove(key.as_slice())?;
                        }
                    }
                }
                versions.remove(seq)?;
                undone += 1;
            }
        }
        write_txn.commit()?;

        debug!(version = %hex_prefix(version), undone, "Rolled back store");
        Ok(())
    }

    /// Evict the oldest versions beyond the retention window, keeping at
    /// most `keep_versions` reachable for rollback. Returns the number of
    /// versions evicted. Current data is untouched.
    pub fn clean(&self, keep_versions: usize) -> StorageResult<usize> {
        let write_txn = self.db.begin_write()?;
        let mut evicted = 0usize;
        {
            let mut undo = write_txn.open_table(UNDO)?;
            let mut versions = write_txn.open_table(VERSIONS)?;

            let mut all: Vec<(u64, Vec<u8>)> = Vec::new();
            for entry in versions.iter()? {
                let (seq, tag) = entry?;
                all.push((seq.value(), tag.value().to_vec()));
            }
            if all.len() <= keep_versions {
                return Ok(0);
            }

            let excess = all.len() - keep_versions;
            for (seq, tag) in all.into_iter().take(excess) {
                versions.remove(seq)?;
                undo.remove(tag.as_slice())?;
                evicted += 1;
            }
        }
        write_txn.commit()?;

        debug!(evicted, "Cleaned version history");
        Ok(evicted)
    }
}

fn hex_prefix(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    bytes
        .iter()
        .take(8)
        .flat_map(|b| [HEX[(b >> 4) as usize] as char, HEX[(b & 0xF) as usize] as char])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_store() -> (VersionedStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = VersionedStore::open(dir.path().join("test.db")).unwrap();
        (store, dir)
    }

    fn kv(key: &[u8], value: &[u8]) -> (Vec<u8>, Vec<u8>) {
        (key.to_vec(), value.to_vec())
    }

    #[test]
    fn test_bulk_insert_and_get() {
        let (store, _dir) = open_store();
        store
            .bulk_insert(b"v1", &[kv(b"a", b"1"), kv(b"b", b"2")], &[])
            .unwrap();

        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get(b"b").unwrap(), Some(b"2".to_vec()));
        assert_eq!(store.get(b"c").unwrap(), None);
        assert_eq!(store.last_version_id().unwrap(), Some(b"v1".to_vec()));
    }

    #[test]
    fn test_duplicate_version_rejected() {
        let (store, _dir) = open_store();
        store.bulk_insert(b"v1", &[kv(b"a", b"1")], &[]).unwrap();
        let result = store.bulk_insert(b"v1", &[kv(b"b", b"2")], &[]);
        assert!(matches!(result, Err(StorageError::VersionExists(_))));
        // The rejected batch must not have leaked.
        assert_eq!(store.get(b"b").unwrap(), None);
    }

    #[test]
    fn test_rollback_restores_prior_values() {
        let (store, _dir) = open_store();
        store.bulk_insert(b"v1", &[kv(b"a", b"1")], &[]).unwrap();
        store
            .bulk_insert(b"v2", &[kv(b"a", b"2"), kv(b"b", b"9")], &[])
            .unwrap();
        store
            .bulk_insert(b"v3", &[], &[b"a".to_vec()])
            .unwrap();

        assert_eq!(store.get(b"a").unwrap(), None);

        store.rollback(b"v1").unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get(b"b").unwrap(), None);
        assert_eq!(store.last_version_id().unwrap(), Some(b"v1".to_vec()));
        assert_eq!(store.rollback_versions().unwrap(), vec![b"v1".to_vec()]);
    }

    #[test]
    fn test_rollback_unknown_version() {
        let (store, _dir) = open_store();
        store.bulk_insert(b"v1", &[kv(b"a", b"1")], &[]).unwrap();
        assert!(matches!(
            store.rollback(b"nope"),
            Err(StorageError::UnknownVersion(_))
        ));
    }

    #[test]
    fn test_rollback_versions_newest_first() {
        let (store, _dir) = open_store();
        for tag in [b"v1", b"v2", b"v3"] {
            store.bulk_insert(tag, &[kv(tag, b"x")], &[]).unwrap();
        }
        assert_eq!(
            store.rollback_versions().unwrap(),
            vec![b"v3".to_vec(), b"v2".to_vec(), b"v1".to_vec()]
        );
    }

    #[test]
    fn test_clean_bounds_history() {
        let (store, _dir) = open_store();
        for i in 0u8..5 {
            store.bulk_insert(&[i], &[kv(&[i], b"x")], &[]).unwrap();
        }
        assert_eq!(store.clean(2).unwrap(), 3);
        assert_eq!(store.rollback_versions().unwrap().len(), 2);
        // Evicted versions are no longer rollback targets.
        assert!(matches!(
            store.rollback(&[0u8]),
            Err(StorageError::UnknownVersion(_))
        ));
        // Data is untouched by cleaning.
        assert_eq!(store.get(&[0u8]).unwrap(), Some(b"x".to_vec()));
        // Rollback to the oldest surviving version still works.
        store.rollback(&[3u8]).unwrap();
        assert_eq!(store.get(&[4u8]).unwrap(), None);
    }

    #[test]
    fn test_reopen_preserves_versions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("test.db");
        {
            let store = VersionedStore::open(&path).unwrap();
            store.bulk_insert(b"v1", &[kv(b"a", b"1")], &[]).unwrap();
        }
        let store = VersionedStore::open(&path).unwrap();
        assert_eq!(store.get(b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.last_version_id().unwrap(), Some(b"v1".to_vec()));
    }
}
