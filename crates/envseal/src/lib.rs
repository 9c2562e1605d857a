//! # envseal
//!
//! Client core for an end-to-end encrypted secrets manager.
//!
//! ## Overview
//!
//! Every environment is sealed under symmetric keys, and each key is
//! encrypted separately for every device, CLI key, pending invite and
//! server credential entitled to it. The server stores ciphertext only. This
//! crate is the part of the client that decides who gets which keys and
//! whether their pubkeys can be trusted:
//!
//! - **Trust chains**: every pubkey is checked back to a device-local root
//!   before anything is encrypted to it or decrypted from it
//! - **Key sets**: the graph says who should hold which keys; diffs of
//!   proposed graph changes say which grants to add
//! - **Encryption**: edits are committed under fresh keys, grants reuse the
//!   keys this device holds
//! - **Re-encryption**: after a revocation, queued environments are rotated
//!   in small randomized batches
//! - **Pending edits**: uncommitted edits are forward/reverse patch pairs
//!   that collapse when they cancel out
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::collections::BTreeSet;
//! use std::sync::Arc;
//! use envseal::{Client, ClientConfig, ClientContext, EnvEdit, Services};
//! use envseal::core::{EnvironmentId, EnvParentId};
//! use envseal::graph::EnvEntry;
//! use envseal::store::SqliteTrustStore;
//!
//! async fn example(ctx: ClientContext, transport: Arc<dyn envseal::sync::Transport>) -> envseal::Result<()> {
//!     let store = Arc::new(SqliteTrustStore::open("trust.db")?);
//!     let client = Client::open(ctx, ClientConfig::default(), Services::new(transport, store)).await?;
//!
//!     let app: BTreeSet<EnvParentId> = [EnvParentId::new("app-1")].into_iter().collect();
//!     client.fetch_envs(&app, false).await?;
//!
//!     client
//!         .update_env(
//!             &EnvironmentId::new("app-1-dev"),
//!             EnvEdit::Set {
//!                 key: "DATABASE_URL".into(),
//!                 entry: EnvEntry::value("postgres://localhost/dev"),
//!             },
//!         )
//!         .await?;
//!     client.commit_envs().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! The component crates are re-exported:
//!
//! - `envseal::core` - ids, key material, the crypto oracle
//! - `envseal::graph` - the org graph, permissions and key sets
//! - `envseal::store` - root trust persistence
//! - `envseal::sync` - wire types, transports and the in-memory server

pub mod client;
pub mod config;
pub mod context;
pub mod decrypt;
pub mod encrypt;
pub mod error;
pub mod onboarding;
pub mod patch;
pub mod pending;
pub mod reencrypt;
pub mod revocation;
pub mod state;
pub mod trust;

pub use envseal_core as core;
pub use envseal_graph as graph;
pub use envseal_store as store;
pub use envseal_sync as sync;

pub use client::{Client, Services};
pub use config::{ClientConfig, ReencryptionConfig};
pub use context::ClientContext;
pub use decrypt::{DecryptOutput, Decryptor};
pub use encrypt::{EncryptOptions, EncryptedEnvs, Encryptor, KeyJob};
pub use error::{ClientError, Result};
pub use onboarding::{LoadedOnboarding, OnboardingRequest, OnboardingToken};
pub use pending::{Changeset, EnvEdit, PendingEnvUpdate};
pub use reencrypt::ReencryptReport;
pub use state::{ClientState, StateAction};
