//! The post cache: a single redb table acting as a delete-triggered
//! lookaside, not a durable archive.
//!
//! # Keys
//! `rkey + "_" + did` as raw bytes.  The rkey is a TID, so keys sort by post
//! creation time and the retention trim is a plain range delete.
//!
//! # Durability
//! Hot-path writes commit without fsync (`Durability::None`); the periodic
//! trim commits with `Durability::Immediate` so reclaimed space survives a
//! crash.  Every key has a single logical writer (the sharded event worker,
//! or the trim task for expired ranges), so get-then-delete takes need no
//! extra coordination beyond one write transaction.

use std::path::Path;

use redb::{Database, Durability, ReadableTable, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};

const POSTS_TABLE: TableDefinition<&[u8], &[u8]> = TableDefinition::new("posts");

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to open cache: {0}")]
    Open(#[from] redb::DatabaseError),
    #[error("cache transaction failed: {0}")]
    Transaction(#[from] redb::TransactionError),
    #[error("cache table failed: {0}")]
    Table(#[from] redb::TableError),
    #[error("cache storage failed: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("cache commit failed: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("failed to decode cached post: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Whether a post was a reply or a quote of another record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostTarget {
    Reply,
    Quote,
}

impl PostTarget {
    pub fn label(target: Option<PostTarget>) -> &'static str {
        match target {
            Some(PostTarget::Reply) => "reply",
            Some(PostTarget::Quote) => "quote",
            None => "none",
        }
    }
}

/// The cached body of a live post.
///
/// `time_us` is the authoritative creation time; updates rewrite the body
/// but carry the original creation time forward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedPost {
    pub time_us: i64,
    pub text: String,
    pub langs: Vec<String>,
    pub target: Option<PostTarget>,
}

/// Cache key for a post: `rkey + "_" + did`.
pub fn post_key(rkey: &str, did: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(rkey.len() + 1 + did.len());
    key.extend_from_slice(rkey.as_bytes());
    key.push(b'_');
    key.extend_from_slice(did.as_bytes());
    key
}

pub struct PostStore {
    db: Database,
}

impl PostStore {
    /// Open (or create) the cache at `path` and ensure the table exists.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let db = Database::create(path)?;
        let txn = db.begin_write()?;
        txn.open_table(POSTS_TABLE)?;
        txn.commit()?;
        Ok(PostStore { db })
    }

    /// Persist a post body at `key`, replacing any prior entry.  No fsync.
    pub fn put(&self, key: &[u8], post: &PersistedPost) -> Result<(), StoreError> {
        let value = serde_json::to_vec(post)?;
        let mut txn = self.db.begin_write()?;
        txn.set_durability(Durability::None);
        {
            let mut table = txn.open_table(POSTS_TABLE)?;
            table.insert(key, value.as_slice())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Read and remove the entry at `key` in one transaction.
    pub fn take(&self, key: &[u8]) -> Result<Option<PersistedPost>, StoreError> {
        let mut txn = self.db.begin_write()?;
        txn.set_durability(Durability::None);
        let removed = {
            let mut table = txn.open_table(POSTS_TABLE)?;
            table.remove(key)?.map(|guard| guard.value().to_vec())
        };
        txn.commit()?;
        match removed {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// The entry with the lexicographically smallest key (the oldest post).
    pub fn first(&self) -> Result<Option<(Vec<u8>, PersistedPost)>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(POSTS_TABLE)?;
        match table.first()? {
            Some((key, value)) => Ok(Some((
                key.value().to_vec(),
                serde_json::from_slice(value.value())?,
            ))),
            None => Ok(None),
        }
    }

    /// The entry with the lexicographically largest key (the newest post).
    pub fn last(&self) -> Result<Option<(Vec<u8>, PersistedPost)>, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(POSTS_TABLE)?;
        match table.last()? {
            Some((key, value)) => Ok(Some((
                key.value().to_vec(),
                serde_json::from_slice(value.value())?,
            ))),
            None => Ok(None),
        }
    }

    /// Delete every entry with `from <= key < until`, fsynced.
    ///
    /// Returns the number of removed entries.
    pub fn delete_range(&self, from: &[u8], until: &[u8]) -> Result<u64, StoreError> {
        let expired: Vec<Vec<u8>> = {
            let txn = self.db.begin_read()?;
            let table = txn.open_table(POSTS_TABLE)?;
            let mut keys = Vec::new();
            for entry in table.range(from..until)? {
                let (key, _) = entry?;
                keys.push(key.value().to_vec());
            }
            keys
        };
        if expired.is_empty() {
            return Ok(0);
        }

        let mut txn = self.db.begin_write()?;
        txn.set_durability(Durability::Immediate);
        {
            let mut table = txn.open_table(POSTS_TABLE)?;
            for key in &expired {
                table.remove(key.as_slice())?;
            }
        }
        txn.commit()?;
        Ok(expired.len() as u64)
    }

    pub fn len(&self) -> Result<u64, StoreError> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(POSTS_TABLE)?;
        Ok(table.len()?)
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tid;

    fn scratch_store() -> (tempfile::TempDir, PostStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = PostStore::open(&dir.path().join("posts.redb")).unwrap();
        (dir, store)
    }

    fn post(time_us: i64, text: &str) -> PersistedPost {
        PersistedPost {
            time_us,
            text: text.to_owned(),
            langs: vec!["en".to_owned()],
            target: None,
        }
    }

    #[test]
    fn take_returns_then_forgets() {
        let (_dir, store) = scratch_store();
        let key = post_key(&tid::encode(1_000, 0), "did:plc:alice");

        store.put(&key, &post(1_000, "hello")).unwrap();
        let taken = store.take(&key).unwrap().unwrap();
        assert_eq!(taken.text, "hello");
        assert!(store.take(&key).unwrap().is_none());
    }

    #[test]
    fn put_replaces_in_place() {
        let (_dir, store) = scratch_store();
        let key = post_key(&tid::encode(1_000, 0), "did:plc:alice");

        store.put(&key, &post(1_000, "first")).unwrap();
        store.put(&key, &post(1_000, "second")).unwrap();
        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(store.take(&key).unwrap().unwrap().text, "second");
    }

    #[test]
    fn first_and_last_follow_tid_order() {
        let (_dir, store) = scratch_store();
        for (us, did) in [(3_000, "c"), (1_000, "a"), (2_000, "b")] {
            let key = post_key(&tid::encode(us, 0), did);
            store.put(&key, &post(us, "x")).unwrap();
        }
        assert_eq!(store.first().unwrap().unwrap().1.time_us, 1_000);
        assert_eq!(store.last().unwrap().unwrap().1.time_us, 3_000);
    }

    #[test]
    fn delete_range_removes_older_keys_only() {
        let (_dir, store) = scratch_store();
        for us in [1_000i64, 2_000, 3_000, 4_000] {
            let key = post_key(&tid::encode(us, 0), "did:plc:a");
            store.put(&key, &post(us, "x")).unwrap();
        }
        let cutoff = tid::encode(3_000, 0);
        let removed = store.delete_range(b"0", cutoff.as_bytes()).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(store.first().unwrap().unwrap().1.time_us, 3_000);
    }

    #[test]
    fn empty_store_has_no_ends() {
        let (_dir, store) = scratch_store();
        assert!(store.first().unwrap().is_none());
        assert!(store.last().unwrap().is_none());
        assert!(store.is_empty().unwrap());
    }
}
