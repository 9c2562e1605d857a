//! # envseal graph
//!
//! The org permission graph and key distribution planning.
//!
//! ## Overview
//!
//! Access to a secret is never stored as a flag. It is the set of encrypted
//! symmetric keys a recipient holds. This crate answers the question "who
//! should hold which keys" for any graph snapshot:
//!
//! - [`OrgGraph`] - users, devices, onboardings, apps, blocks, environments,
//!   roles and pending requests
//! - [`PermissionOracle`] - permission evaluation, with [`RolePermissions`]
//!   as the default
//! - [`KeySet`] - recipients mapped to the parts of each environment they
//!   hold keys for
//! - [`key_set_for_graph_proposal`] - the grants a hypothetical mutation
//!   adds and removes
//!
//! ## Content Model
//!
//! Each environment is split into `env`, `meta`, `inherits` and
//! `changesets` parts, plus one override part per inheriting environment.
//! A [`Composite`] names one part's key and blob.

pub mod differ;
pub mod env;
pub mod error;
pub mod keyset;
pub mod model;
pub mod permissions;

#[cfg(test)]
pub(crate) mod test_support;

pub use differ::{current_key_set, key_set_for_graph_proposal, required_envs_for_key_set, KeySetScope, RequiredEnvs};
pub use env::{Composite, EnvEntry, EnvMetaEntry, EnvPart, EnvWithMeta};
pub use error::{GraphError, Result};
pub use keyset::{DeviceKeys, EnvParentKeys, EnvironmentKeys, KeySet, KeySetDiff, KeyableParentKeys, KeyableParentTargets};
pub use model::{
    AppBlock, AppRole, AppUserGrant, ApprovedBy, CliKey, EnvParent, EnvParentKind, Environment,
    EnvironmentRole, GeneratedEnvkey, KeyableParent, KeyableParentKind, KeyableRef, Onboarding,
    OnboardingKind, Org, OrgGraph, OrgRole, OrgUser, OrgUserDevice, PubkeyRevocationRequest,
    RootPubkeyReplacement, UserKind,
};
pub use permissions::{AppPermission, EnvironmentPermission, OrgPermission, PermissionOracle, RolePermissions};
