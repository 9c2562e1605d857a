//! # envseal core
//!
//! Pure primitives for envseal: identifiers, key material, envelopes and
//! signatures.
//!
//! This crate contains no I/O, no storage, no networking.
//!
//! ## Key Types
//!
//! - [`Keypair`], [`Pubkey`], [`Privkey`] - a keyable's key material
//! - [`EncryptedData`] - a signed asymmetric envelope for one recipient
//! - [`EncryptedBlob`] - a payload sealed with a [`SymmetricKey`]
//! - [`CryptoProvider`] - the crypto oracle the client engine consumes
//! - [`TrustedPubkey`] - a pubkey plus the attributes it was trusted under

pub mod canonical;
pub mod crypto;
pub mod error;
pub mod keyable;
pub mod provider;
pub mod types;

pub use canonical::{canonical_json, identity_hash};
pub use crypto::{
    Blake3Hash, EncryptedBlob, EncryptedData, Ed25519PublicKey, Ed25519Signature, Keypair,
    Privkey, Pubkey, PubkeyKeys, SymmetricKey, X25519PublicKey,
};
pub use error::{CoreError, Result};
pub use keyable::{KeyableType, TrustedPubkey, TrustedPubkeys};
pub use provider::{verify_keypair, CryptoProvider, DalekCrypto};
pub use types::{AccountId, EnvParentId, EnvironmentId, KeyableId, OrgId, RequestId, RoleId, UserId};
