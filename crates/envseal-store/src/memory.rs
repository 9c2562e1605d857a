//! In-memory implementation of the TrustStore trait.
//!
//! Same semantics as SQLite, no persistence. Used by tests and by
//! ephemeral sessions.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use envseal_core::{AccountId, KeyableId, TrustedPubkey, TrustedPubkeys};

use crate::error::{Result, StoreError};
use crate::traits::{insert_decision, InsertResult, TrustStore};

/// In-memory trust store. Thread-safe via RwLock.
#[derive(Default)]
pub struct MemoryTrustStore {
    inner: RwLock<HashMap<AccountId, TrustedPubkeys>>,
}

impl MemoryTrustStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<E: std::fmt::Display>(e: E) -> StoreError {
    StoreError::Task(format!("lock poisoned: {}", e))
}

#[async_trait]
impl TrustStore for MemoryTrustStore {
    async fn load_root(&self, account_id: &AccountId) -> Result<TrustedPubkeys> {
        let inner = self.inner.read().map_err(poisoned)?;
        Ok(inner.get(account_id).cloned().unwrap_or_default())
    }

    async fn insert_root_if_absent(
        &self,
        account_id: &AccountId,
        pubkey_id: &KeyableId,
        trusted: &TrustedPubkey,
    ) -> Result<InsertResult> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        let root = inner.entry(account_id.clone()).or_default();
        if let Some(result) = insert_decision(root.get(pubkey_id).cloned(), trusted) {
            return Ok(result);
        }
        root.insert(pubkey_id.clone(), trusted.clone());
        Ok(InsertResult::Inserted)
    }

    async fn replace_root(
        &self,
        account_id: &AccountId,
        replacing_id: &KeyableId,
        replacement_id: &KeyableId,
        replacement: &TrustedPubkey,
    ) -> Result<()> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        let root = inner
            .get_mut(account_id)
            .filter(|root| root.contains_key(replacing_id))
            .ok_or_else(|| StoreError::NotFound(replacing_id.to_string()))?;
        root.remove(replacing_id);
        root.insert(replacement_id.clone(), replacement.clone());
        Ok(())
    }

    async fn clear(&self, account_id: &AccountId) -> Result<()> {
        self.inner.write().map_err(poisoned)?.remove(account_id);
        Ok(())
    }
}
