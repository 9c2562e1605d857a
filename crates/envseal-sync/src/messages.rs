//! Wire types exchanged with the server.
//!
//! Encrypted keys travel in a nested map that mirrors [`KeySet`]:
//! `users[userId][deviceId][envParentId].environments[environmentId].{env, meta,
//! inherits, changesets, inheritanceOverrides[sourceId]}`, with parallel
//! `keyableParents` and `blockKeyableParents` trees for generated envkeys.
//!
//! [`KeySet`]: envseal_graph::KeySet

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use envseal_core::{
    AccountId, EncryptedBlob, EncryptedData, Ed25519Signature, EnvParentId, EnvironmentId,
    KeyableId, OrgId, RequestId, TrustedPubkeys, UserId,
};
use envseal_graph::{
    AppUserGrant, Composite, KeyableParentTargets, Onboarding, OrgGraph, OrgUser, OrgUserDevice,
};

use crate::error::{Result, SyncError};

/// Who is making a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    pub account_id: AccountId,
    pub org_id: OrgId,
    pub user_id: UserId,
    /// The device or CLI key signing requests.
    pub device_id: KeyableId,
}

/// An encrypted symmetric key as the server returns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedKey {
    pub data: EncryptedData,
    /// Device or CLI user whose privkey signed the envelope.
    pub encrypted_by_id: KeyableId,
    pub env_parent_id: EnvParentId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentKeyParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<EncryptedData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<EncryptedData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inherits: Option<EncryptedData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changesets: Option<EncryptedData>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inheritance_overrides: BTreeMap<EnvironmentId, EncryptedData>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvParentKeyParams {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub environments: BTreeMap<EnvironmentId, EnvironmentKeyParams>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub locals: BTreeMap<UserId, EnvironmentKeyParams>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyableParentKeyParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<EncryptedData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_env: Option<EncryptedData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locals: Option<EncryptedData>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inheritance_overrides: BTreeMap<EnvironmentId, EncryptedData>,
}

/// A slot for one environment part in a user device's key tree.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum EnvironmentSlot {
    Env,
    Meta,
    Inherits,
    Changesets,
    InheritanceOverride(EnvironmentId),
}

/// A slot in a generated envkey's key tree.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum KeyableParentSlot {
    Env,
    SubEnv,
    Locals,
    InheritanceOverride(EnvironmentId),
}

/// Base/sub environment or someone's locals inside an env parent.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum EnvTarget {
    Environment(EnvironmentId),
    Locals(UserId),
}

/// Where an encrypted key goes in [`KeysParams`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum KeyPath {
    User {
        user_id: UserId,
        device_id: KeyableId,
        env_parent_id: EnvParentId,
        target: EnvTarget,
        slot: EnvironmentSlot,
    },
    KeyableParent {
        keyable_parent_id: KeyableId,
        generated_envkey_id: KeyableId,
        slot: KeyableParentSlot,
    },
    BlockKeyableParent {
        block_id: EnvParentId,
        keyable_parent_id: KeyableId,
        generated_envkey_id: KeyableId,
        slot: KeyableParentSlot,
    },
}

impl KeyPath {
    /// Keyable the key is encrypted to.
    pub fn recipient_id(&self) -> &KeyableId {
        match self {
            KeyPath::User { device_id, .. } => device_id,
            KeyPath::KeyableParent {
                generated_envkey_id,
                ..
            }
            | KeyPath::BlockKeyableParent {
                generated_envkey_id,
                ..
            } => generated_envkey_id,
        }
    }
}

fn set_environment_slot(params: &mut EnvironmentKeyParams, slot: &EnvironmentSlot, data: EncryptedData) {
    match slot {
        EnvironmentSlot::Env => params.env = Some(data),
        EnvironmentSlot::Meta => params.meta = Some(data),
        EnvironmentSlot::Inherits => params.inherits = Some(data),
        EnvironmentSlot::Changesets => params.changesets = Some(data),
        EnvironmentSlot::InheritanceOverride(source) => {
            params.inheritance_overrides.insert(source.clone(), data);
        }
    }
}

fn set_keyable_parent_slot(params: &mut KeyableParentKeyParams, slot: &KeyableParentSlot, data: EncryptedData) {
    match slot {
        KeyableParentSlot::Env => params.env = Some(data),
        KeyableParentSlot::SubEnv => params.sub_env = Some(data),
        KeyableParentSlot::Locals => params.locals = Some(data),
        KeyableParentSlot::InheritanceOverride(source) => {
            params.inheritance_overrides.insert(source.clone(), data);
        }
    }
}

/// Encrypted keys, nested by recipient.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeysParams {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub users: BTreeMap<UserId, BTreeMap<KeyableId, BTreeMap<EnvParentId, EnvParentKeyParams>>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub keyable_parents: BTreeMap<KeyableId, BTreeMap<KeyableId, KeyableParentKeyParams>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub block_keyable_parents:
        BTreeMap<EnvParentId, BTreeMap<KeyableId, BTreeMap<KeyableId, KeyableParentKeyParams>>>,
}

impl KeysParams {
    pub fn is_empty(&self) -> bool {
        self.users.is_empty() && self.keyable_parents.is_empty() && self.block_keyable_parents.is_empty()
    }

    /// Write `data` at `path`, creating intermediate maps as needed.
    pub fn insert(&mut self, path: &KeyPath, data: EncryptedData) {
        match path {
            KeyPath::User {
                user_id,
                device_id,
                env_parent_id,
                target,
                slot,
            } => {
                let parent = self
                    .users
                    .entry(user_id.clone())
                    .or_default()
                    .entry(device_id.clone())
                    .or_default()
                    .entry(env_parent_id.clone())
                    .or_default();
                let params = match target {
                    EnvTarget::Environment(id) => parent.environments.entry(id.clone()).or_default(),
                    EnvTarget::Locals(user_id) => parent.locals.entry(user_id.clone()).or_default(),
                };
                set_environment_slot(params, slot, data);
            }
            KeyPath::KeyableParent {
                keyable_parent_id,
                generated_envkey_id,
                slot,
            } => {
                let params = self
                    .keyable_parents
                    .entry(keyable_parent_id.clone())
                    .or_default()
                    .entry(generated_envkey_id.clone())
                    .or_default();
                set_keyable_parent_slot(params, slot, data);
            }
            KeyPath::BlockKeyableParent {
                block_id,
                keyable_parent_id,
                generated_envkey_id,
                slot,
            } => {
                let params = self
                    .block_keyable_parents
                    .entry(block_id.clone())
                    .or_default()
                    .entry(keyable_parent_id.clone())
                    .or_default()
                    .entry(generated_envkey_id.clone())
                    .or_default();
                set_keyable_parent_slot(params, slot, data);
            }
        }
    }

    /// Flatten to `(recipient, composite, env parent, data)`, resolving
    /// generated envkey slots against `graph`.
    pub fn flatten(&self, graph: &OrgGraph) -> Result<Vec<FlatKey>> {
        let mut out = Vec::new();

        for devices in self.users.values() {
            for (device_id, env_parents) in devices {
                for (env_parent_id, parent) in env_parents {
                    let targets = parent
                        .environments
                        .iter()
                        .map(|(id, p)| (id.clone(), p))
                        .chain(
                            parent
                                .locals
                                .iter()
                                .map(|(user_id, p)| (EnvironmentId::locals(env_parent_id, user_id), p)),
                        );
                    for (environment_id, params) in targets {
                        let mut push = |composite: Composite, data: &EncryptedData| {
                            out.push(FlatKey {
                                recipient_id: device_id.clone(),
                                composite,
                                env_parent_id: env_parent_id.clone(),
                                data: data.clone(),
                            })
                        };
                        if let Some(d) = &params.env {
                            push(Composite::env(&environment_id), d);
                        }
                        if let Some(d) = &params.meta {
                            push(Composite::meta(&environment_id), d);
                        }
                        if let Some(d) = &params.inherits {
                            push(Composite::inherits(&environment_id), d);
                        }
                        if let Some(d) = &params.changesets {
                            push(Composite::changesets(&environment_id), d);
                        }
                        for (source, d) in &params.inheritance_overrides {
                            push(Composite::inheritance_override(&environment_id, source), d);
                        }
                    }
                }
            }
        }

        for (parent_id, envkeys) in &self.keyable_parents {
            let targets = KeyableParentTargets::resolve(graph, parent_id, None)?;
            let env_parent_id = graph
                .keyable_parents
                .get(parent_id)
                .map(|p| p.env_parent_id.clone())
                .ok_or_else(|| SyncError::NotFound(parent_id.to_string()))?;
            for (envkey_id, params) in envkeys {
                flatten_keyable_parent(&mut out, envkey_id, &env_parent_id, &targets, params)?;
            }
        }

        for (block_id, parents) in &self.block_keyable_parents {
            for (parent_id, envkeys) in parents {
                let targets = KeyableParentTargets::resolve(graph, parent_id, Some(block_id))?;
                for (envkey_id, params) in envkeys {
                    flatten_keyable_parent(&mut out, envkey_id, block_id, &targets, params)?;
                }
            }
        }

        Ok(out)
    }
}

fn flatten_keyable_parent(
    out: &mut Vec<FlatKey>,
    envkey_id: &KeyableId,
    env_parent_id: &EnvParentId,
    targets: &KeyableParentTargets,
    params: &KeyableParentKeyParams,
) -> Result<()> {
    let mut push = |composite: Composite, data: &EncryptedData| {
        out.push(FlatKey {
            recipient_id: envkey_id.clone(),
            composite,
            env_parent_id: env_parent_id.clone(),
            data: data.clone(),
        })
    };
    if let Some(d) = &params.env {
        push(Composite::env(&targets.env), d);
    }
    if let Some(d) = &params.sub_env {
        let sub = targets
            .sub_env
            .as_ref()
            .ok_or_else(|| SyncError::InvalidRequest(format!("{} has no sub environment", envkey_id)))?;
        push(Composite::env(sub), d);
    }
    if let Some(d) = &params.locals {
        let locals = targets
            .locals
            .as_ref()
            .ok_or_else(|| SyncError::InvalidRequest(format!("{} has no locals", envkey_id)))?;
        push(Composite::env(locals), d);
    }
    for (source, d) in &params.inheritance_overrides {
        push(Composite::inheritance_override(targets.override_target(), source), d);
    }
    Ok(())
}

/// One flattened encrypted key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlatKey {
    pub recipient_id: KeyableId,
    pub composite: Composite,
    pub env_parent_id: EnvParentId,
    pub data: EncryptedData,
}

/// One committed changeset, sealed with the environment's changesets key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedChangesetBlob {
    pub id: String,
    pub created_at: u64,
    pub created_by_id: UserId,
    pub blob: EncryptedBlob,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangesetParams {
    pub blobs: Vec<EncryptedChangesetBlob>,
    /// Replace the stored list instead of appending (after key rotation).
    #[serde(default)]
    pub replace: bool,
}

/// Keys plus the blobs they open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvParams {
    pub encrypted_by_id: KeyableId,
    #[serde(default)]
    pub keys: KeysParams,
    #[serde(default)]
    pub blobs: BTreeMap<Composite, EncryptedBlob>,
    #[serde(default)]
    pub changesets: BTreeMap<EnvironmentId, ChangesetParams>,
}

impl EnvParams {
    pub fn new(encrypted_by_id: KeyableId) -> Self {
        Self {
            encrypted_by_id,
            keys: KeysParams::default(),
            blobs: BTreeMap::new(),
            changesets: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty() && self.blobs.is_empty() && self.changesets.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchEnvsParams {
    pub env_parent_ids: BTreeSet<EnvParentId>,
    #[serde(default)]
    pub include_changesets: bool,
}

/// Everything a recipient can decrypt for the requested env parents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchEnvsResponse {
    pub env_parent_ids: BTreeSet<EnvParentId>,
    pub include_changesets: bool,
    pub keys: BTreeMap<Composite, EncryptedKey>,
    pub blobs: BTreeMap<Composite, EncryptedBlob>,
    pub changesets: BTreeMap<Composite, Vec<EncryptedChangesetBlob>>,
    /// Server time the snapshot was taken.
    pub fetched_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEnvsParams {
    pub graph_updated_at: u64,
    pub env_params: EnvParams,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReencryptEnvsParams {
    pub graph_updated_at: u64,
    pub environment_ids: BTreeSet<EnvironmentId>,
    pub env_params: EnvParams,
}

/// A root snapshot signed by the device that created an onboarding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedTrustedRoot {
    pub root: TrustedPubkeys,
    pub signature: Ed25519Signature,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOnboardingParams {
    pub graph_updated_at: u64,
    pub onboarding: Onboarding,
    /// Set for invites: the user being invited.
    #[serde(default)]
    pub new_user: Option<OrgUser>,
    #[serde(default)]
    pub app_user_grants: Vec<AppUserGrant>,
    pub encrypted_privkey: EncryptedBlob,
    pub signed_trusted_root: SignedTrustedRoot,
    pub env_params: EnvParams,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnboardingBundle {
    pub graph: OrgGraph,
    pub onboarding: Onboarding,
    pub encrypted_privkey: EncryptedBlob,
    pub signed_trusted_root: SignedTrustedRoot,
    pub envs: FetchEnvsResponse,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptOnboardingParams {
    pub onboarding_id: KeyableId,
    pub device: OrgUserDevice,
}

/// Requests the client sends through a [`Transport`](crate::Transport).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "params", rename_all = "camelCase")]
pub enum ApiRequest {
    GetGraph,
    FetchEnvs(FetchEnvsParams),
    UpdateEnvs(UpdateEnvsParams),
    ReencryptEnvs(ReencryptEnvsParams),
    /// Add keys for new recipients without touching blobs.
    GrantKeys(UpdateEnvsParams),
    CreateOnboarding(Box<CreateOnboardingParams>),
    LoadOnboarding { onboarding_id: KeyableId },
    AcceptOnboarding(AcceptOnboardingParams),
    RevokeDevice { device_id: KeyableId },
    /// Hide processed revocation requests and root replacements from this device.
    AckRequests { request_ids: BTreeSet<RequestId> },
}

impl ApiRequest {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ApiRequest::GetGraph => "get_graph",
            ApiRequest::FetchEnvs(_) => "fetch_envs",
            ApiRequest::UpdateEnvs(_) => "update_envs",
            ApiRequest::ReencryptEnvs(_) => "reencrypt_envs",
            ApiRequest::GrantKeys(_) => "grant_keys",
            ApiRequest::CreateOnboarding(_) => "create_onboarding",
            ApiRequest::LoadOnboarding { .. } => "load_onboarding",
            ApiRequest::AcceptOnboarding(_) => "accept_onboarding",
            ApiRequest::RevokeDevice { .. } => "revoke_device",
            ApiRequest::AckRequests { .. } => "ack_requests",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "camelCase")]
pub enum ApiResponse {
    Graph(Box<OrgGraph>),
    Envs(FetchEnvsResponse),
    Onboarding(Box<OnboardingBundle>),
    Ok { graph_updated_at: u64 },
}
