//! # envseal sync
//!
//! The boundary between the client engine and the server.
//!
//! ## Overview
//!
//! Every request the client makes, authenticated or not, goes through
//! [`Transport::dispatch`] as an [`ApiRequest`] with a [`RequestContext`].
//! Encrypted keys travel in [`KeysParams`], a nested map keyed by recipient
//! and addressed with [`KeyPath`]:
//!
//! ```text
//! users[userId][deviceId][envParentId].environments[environmentId]
//!     .{env, meta, inherits, changesets, inheritanceOverrides[sourceId]}
//! keyableParents[keyableParentId][generatedEnvkeyId].{env, subEnv, locals, ...}
//! blockKeyableParents[blockId][keyableParentId][generatedEnvkeyId].{...}
//! ```
//!
//! ## Testing
//!
//! [`MemoryServer`] implements the server side in process. It enforces key
//! entitlement against its graph, rejects stale graph versions, and can be
//! configured to throttle. [`FlakyTransport`] injects transport failures.

pub mod error;
pub mod messages;
pub mod server;
pub mod transport;

pub use error::{Result, SyncError};
pub use messages::{
    AcceptOnboardingParams, ApiRequest, ApiResponse, ChangesetParams, CreateOnboardingParams,
    EncryptedChangesetBlob, EncryptedKey, EnvParams, EnvParentKeyParams, EnvTarget,
    EnvironmentKeyParams, EnvironmentSlot, FetchEnvsParams, FetchEnvsResponse, FlatKey, KeyPath,
    KeyableParentKeyParams, KeyableParentSlot, KeysParams, OnboardingBundle, ReencryptEnvsParams,
    RequestContext, SignedTrustedRoot, UpdateEnvsParams,
};
pub use server::{MemoryServer, MemoryServerConfig};
pub use transport::{FlakyTransport, Transport};
