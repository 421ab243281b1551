use redb::{Database, ReadableTable, TableDefinition};
use std::collections::BTreeMap;
use std::path::Path;

use super::{CacheEntry, CacheError};

const ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("cache_entries");

fn storage<E: Into<redb::Error>>(err: E) -> CacheError {
    CacheError::Storage(err.into())
}

/// redb-backed write-through storage for cache entries.
pub(super) struct CacheBackend {
    db: Database,
}

impl CacheBackend {
    pub(super) fn open(path: &Path) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(storage)?;

        let txn = db.begin_write().map_err(storage)?;
        txn.open_table(ENTRIES).map_err(storage)?;
        txn.commit().map_err(storage)?;

        Ok(Self { db })
    }

    pub(super) fn load(&self) -> Result<BTreeMap<String, CacheEntry>, CacheError> {
        let txn = self.db.begin_read().map_err(storage)?;
        let table = txn.open_table(ENTRIES).map_err(storage)?;
        let mut entries = BTreeMap::new();
        for row in table.iter().map_err(storage)? {
            let (key, value) = row.map_err(storage)?;
            match serde_json::from_slice::<CacheEntry>(value.value()) {
                Ok(entry) => {
                    entries.insert(key.value().to_string(), entry);
                }
                Err(err) => log::warn!("skipping unreadable cache entry {}: {}", key.value(), err),
            }
        }
        Ok(entries)
    }

    pub(super) fn save(&self, entry: &CacheEntry) -> Result<(), CacheError> {
        let encoded = serde_json::to_vec(entry)?;
        let txn = self.db.begin_write().map_err(storage)?;
        {
            let mut table = txn.open_table(ENTRIES).map_err(storage)?;
            table
                .insert(entry.key.as_str(), encoded.as_slice())
                .map_err(storage)?;
        }
        txn.commit().map_err(storage)?;
        Ok(())
    }

    pub(super) fn remove(&self, key: &str) -> Result<(), CacheError> {
        let txn = self.db.begin_write().map_err(storage)?;
        {
            let mut table = txn.open_table(ENTRIES).map_err(storage)?;
            table.remove(key).map_err(storage)?;
        }
        txn.commit().map_err(storage)?;
        Ok(())
    }
}
