//! SQLite implementation of the TrustStore trait.
//!
//! The primary persistent backend. Uses rusqlite with bundled SQLite,
//! wrapped in async via tokio::spawn_blocking.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use envseal_core::{AccountId, KeyableId, TrustedPubkey, TrustedPubkeys};

use crate::error::{Result, StoreError};
use crate::migration::{self, now_millis};
use crate::traits::{insert_decision, InsertResult, TrustStore};

/// SQLite-backed trust store.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
pub struct SqliteTrustStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteTrustStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().map_err(|e| {
                StoreError::Database(rusqlite::Error::SqliteFailure(
                    rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_LOCKED),
                    Some(format!("mutex poisoned: {}", e)),
                ))
            })?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

fn encode_record(trusted: &TrustedPubkey) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(trusted, &mut buf).map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(buf)
}

fn decode_record(bytes: &[u8]) -> Result<TrustedPubkey> {
    ciborium::from_reader(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn get_record(conn: &Connection, account_id: &str, pubkey_id: &str) -> Result<Option<TrustedPubkey>> {
    let bytes: Option<Vec<u8>> = conn
        .query_row(
            "SELECT record FROM trusted_root WHERE account_id = ?1 AND pubkey_id = ?2",
            params![account_id, pubkey_id],
            |row| row.get(0),
        )
        .optional()?;
    bytes.map(|b| decode_record(&b)).transpose()
}

#[async_trait]
impl TrustStore for SqliteTrustStore {
    async fn load_root(&self, account_id: &AccountId) -> Result<TrustedPubkeys> {
        let account_id = account_id.clone();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT pubkey_id, record FROM trusted_root WHERE account_id = ?1 ORDER BY pubkey_id",
            )?;
            let rows = stmt.query_map(params![account_id.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
            })?;

            let mut root = TrustedPubkeys::new();
            for row in rows {
                let (pubkey_id, record) = row?;
                root.insert(KeyableId::new(pubkey_id), decode_record(&record)?);
            }
            Ok(root)
        })
        .await
    }

    async fn insert_root_if_absent(
        &self,
        account_id: &AccountId,
        pubkey_id: &KeyableId,
        trusted: &TrustedPubkey,
    ) -> Result<InsertResult> {
        let account_id = account_id.clone();
        let pubkey_id = pubkey_id.clone();
        let trusted = trusted.clone();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let existing = get_record(&tx, account_id.as_str(), pubkey_id.as_str())?;
            if let Some(result) = insert_decision(existing, &trusted) {
                return Ok(result);
            }
            tx.execute(
                "INSERT INTO trusted_root (account_id, pubkey_id, record, trusted_at) VALUES (?1, ?2, ?3, ?4)",
                params![account_id.as_str(), pubkey_id.as_str(), encode_record(&trusted)?, now_millis()],
            )?;
            tx.commit()?;
            debug!(account = %account_id, pubkey_id = %pubkey_id, "root pubkey trusted");
            Ok(InsertResult::Inserted)
        })
        .await
    }

    async fn replace_root(
        &self,
        account_id: &AccountId,
        replacing_id: &KeyableId,
        replacement_id: &KeyableId,
        replacement: &TrustedPubkey,
    ) -> Result<()> {
        let account_id = account_id.clone();
        let replacing_id = replacing_id.clone();
        let replacement_id = replacement_id.clone();
        let replacement = replacement.clone();
        self.blocking(move |conn| {
            let tx = conn.transaction()?;
            let removed = tx.execute(
                "DELETE FROM trusted_root WHERE account_id = ?1 AND pubkey_id = ?2",
                params![account_id.as_str(), replacing_id.as_str()],
            )?;
            if removed == 0 {
                return Err(StoreError::NotFound(replacing_id.to_string()));
            }
            let now = now_millis();
            tx.execute(
                "INSERT OR REPLACE INTO trusted_root (account_id, pubkey_id, record, trusted_at) VALUES (?1, ?2, ?3, ?4)",
                params![account_id.as_str(), replacement_id.as_str(), encode_record(&replacement)?, now],
            )?;
            tx.execute(
                "INSERT INTO root_replacements (account_id, replacing_pubkey_id, replacement_pubkey_id, replaced_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![account_id.as_str(), replacing_id.as_str(), replacement_id.as_str(), now],
            )?;
            tx.commit()?;
            info!(account = %account_id, from = %replacing_id, to = %replacement_id, "root pubkey replaced");
            Ok(())
        })
        .await
    }

    async fn clear(&self, account_id: &AccountId) -> Result<()> {
        let account_id = account_id.clone();
        self.blocking(move |conn| {
            conn.execute(
                "DELETE FROM trusted_root WHERE account_id = ?1",
                params![account_id.as_str()],
            )?;
            Ok(())
        })
        .await
    }
}
