//! # envseal store
//!
//! Persistence for root trust.
//!
//! Root trust is device-local and write-once per pubkey id: the server can
//! never overwrite it. The [`TrustStore`] trait keeps the client
//! storage-agnostic; [`SqliteTrustStore`] is the persistent backend and
//! [`MemoryTrustStore`] serves tests and ephemeral sessions.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use envseal_store::{SqliteTrustStore, TrustStore};
//! use envseal_core::AccountId;
//!
//! async fn example() {
//!     let store = SqliteTrustStore::open("trust.db").unwrap();
//!     let root = store.load_root(&AccountId::new("acct")).await.unwrap();
//!     println!("{} root pubkeys", root.len());
//! }
//! ```

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryTrustStore;
pub use sqlite::SqliteTrustStore;
pub use traits::{InsertResult, TrustStore};
