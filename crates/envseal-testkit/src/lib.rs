//! # envseal testkit
//!
//! Testing utilities for envseal.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: a sample org with real, correctly chained key material,
//!   served by an in-memory server, and clients for any of its devices
//! - **Generators**: proptest strategies for env edits and key material
//!
//! ## Test Fixtures
//!
//! ```rust,no_run
//! use envseal_testkit::fixtures::{OrgFixture, OWNER, DEV};
//!
//! async fn example() {
//!     let org = OrgFixture::new();
//!     let owner = org.client(OWNER).await.unwrap();
//!     let dev = org.client(DEV).await.unwrap();
//! }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use envseal_testkit::generators::env_edits;
//!
//! proptest! {
//!     #[test]
//!     fn edits_never_panic(edits in env_edits(10)) {
//!         // ...
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;

pub use fixtures::{env, parents, seed, test_config, Member, OrgFixture, ADMIN, CLI, DEV, DEV_SECOND, OWNER};
pub use generators::{env_edit, env_edits, env_entry, env_key, keypair};
