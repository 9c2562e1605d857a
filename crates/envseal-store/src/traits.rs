//! TrustStore trait: persistence for root trust.
//!
//! Root trust is the only trust state that survives a restart. Session
//! trust is rebuilt by walking signature chains back to these entries.

use async_trait::async_trait;

use envseal_core::{AccountId, KeyableId, TrustedPubkey, TrustedPubkeys};

use crate::error::Result;

/// Result of inserting a root entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertResult {
    /// Entry was inserted.
    Inserted,
    /// An identical entry already exists (idempotent - not an error).
    AlreadyExists,
    /// A different entry exists for this id and was left untouched.
    Conflict {
        /// The entry that stays.
        existing: TrustedPubkey,
    },
}

/// Async interface for root trust persistence, one registry per account.
///
/// Entries are write-once per pubkey id: [`TrustStore::insert_root_if_absent`]
/// never overwrites. The only way to change an entry is
/// [`TrustStore::replace_root`], which callers use after verifying a root
/// replacement.
#[async_trait]
pub trait TrustStore: Send + Sync {
    /// Load every root entry for an account.
    async fn load_root(&self, account_id: &AccountId) -> Result<TrustedPubkeys>;

    /// Insert a root entry unless one already exists for `pubkey_id`.
    async fn insert_root_if_absent(
        &self,
        account_id: &AccountId,
        pubkey_id: &KeyableId,
        trusted: &TrustedPubkey,
    ) -> Result<InsertResult>;

    /// Swap `replacing_id` for `replacement_id` in one step.
    ///
    /// Fails with `NotFound` if `replacing_id` is not a root.
    async fn replace_root(
        &self,
        account_id: &AccountId,
        replacing_id: &KeyableId,
        replacement_id: &KeyableId,
        replacement: &TrustedPubkey,
    ) -> Result<()>;

    /// Remove all root entries for an account.
    async fn clear(&self, account_id: &AccountId) -> Result<()>;
}

/// Shared insert decision for both backends.
pub(crate) fn insert_decision(existing: Option<TrustedPubkey>, new: &TrustedPubkey) -> Option<InsertResult> {
    match existing {
        None => None,
        Some(existing) if &existing == new => Some(InsertResult::AlreadyExists),
        Some(existing) => Some(InsertResult::Conflict { existing }),
    }
}
