use chrono::{DateTime, TimeDelta, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use super::StoredCookie;
use crate::modules::spoofing::BrowserFingerprint;

const SESSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("stealth_sessions");

/// How long a record that passed a challenge outranks later records that did not.
pub const PASSED_RECORD_TTL: TimeDelta = TimeDelta::hours(24);

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("session vault storage error: {0}")]
    Storage(#[from] redb::Error),
    #[error("session record encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("session vault directory unavailable: {0}")]
    Io(#[from] std::io::Error),
}

fn storage<E: Into<redb::Error>>(err: E) -> VaultError {
    VaultError::Storage(err.into())
}

/// Persisted state of one browser identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub identity: String,
    pub fingerprint: BrowserFingerprint,
    pub cookies: Vec<StoredCookie>,
    pub challenge_passed: bool,
    pub updated_at: DateTime<Utc>,
}

/// redb-backed store of session records keyed by identity.
#[derive(Clone)]
pub struct SessionVault {
    db: Arc<Database>,
}

impl std::fmt::Debug for SessionVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionVault").finish_non_exhaustive()
    }
}

impl SessionVault {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, VaultError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::create(path).map_err(storage)?;

        let txn = db.begin_write().map_err(storage)?;
        txn.open_table(SESSIONS).map_err(storage)?;
        txn.commit().map_err(storage)?;

        Ok(Self { db: Arc::new(db) })
    }

    pub fn load(&self, identity: &str) -> Result<Option<SessionRecord>, VaultError> {
        let txn = self.db.begin_read().map_err(storage)?;
        let table = txn.open_table(SESSIONS).map_err(storage)?;
        match table.get(identity).map_err(storage)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Store `record` unless the identity already holds a record that passed
    /// a challenge within [`PASSED_RECORD_TTL`] and `record` did not. The
    /// check and the write share one write transaction, so concurrent
    /// sessions closing in any order cannot demote a passed record. Returns
    /// whether `record` was written.
    pub fn save(&self, record: &SessionRecord) -> Result<bool, VaultError> {
        let encoded = serde_json::to_vec(record)?;
        let txn = self.db.begin_write().map_err(storage)?;
        let written = {
            let mut table = txn.open_table(SESSIONS).map_err(storage)?;
            let stored: Option<SessionRecord> = match table.get(record.identity.as_str()).map_err(storage)? {
                Some(value) => serde_json::from_slice(value.value()).ok(),
                None => None,
            };
            if stored.is_some_and(|stored| outranks(&stored, record)) {
                false
            } else {
                table
                    .insert(record.identity.as_str(), encoded.as_slice())
                    .map_err(storage)?;
                true
            }
        };
        txn.commit().map_err(storage)?;
        Ok(written)
    }

    pub fn forget(&self, identity: &str) -> Result<bool, VaultError> {
        let txn = self.db.begin_write().map_err(storage)?;
        let removed = {
            let mut table = txn.open_table(SESSIONS).map_err(storage)?;
            table.remove(identity).map_err(storage)?.is_some()
        };
        txn.commit().map_err(storage)?;
        Ok(removed)
    }
}

fn outranks(stored: &SessionRecord, incoming: &SessionRecord) -> bool {
    stored.challenge_passed
        && !incoming.challenge_passed
        && incoming.updated_at.signed_duration_since(stored.updated_at) < PASSED_RECORD_TTL
}
