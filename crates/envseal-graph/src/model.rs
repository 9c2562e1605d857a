//! The org graph.
//!
//! A snapshot of everything the server knows about an org that matters for
//! trust and key distribution: who the users are, which keys they hold,
//! which apps and blocks exist, and how roles connect them. Snapshots are
//! plain values; hypothetical mutations are applied to a clone.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use envseal_core::{Blake3Hash, EnvParentId, EnvironmentId, KeyableId, KeyableType, OrgId, Pubkey, RequestId, RoleId, TrustedPubkeys, UserId};

use crate::permissions::{AppPermission, EnvironmentPermission, OrgPermission};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Org {
    pub id: OrgId,
    pub name: String,
}

/// A CLI identity's key, held directly on the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CliKey {
    pub pubkey: Pubkey,
    pub signed_by_id: KeyableId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum UserKind {
    /// A person; keys live on their devices.
    Person,
    /// A CLI user; the user id doubles as its keyable id.
    Cli(CliKey),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrgUser {
    pub id: UserId,
    pub name: String,
    pub kind: UserKind,
    pub org_role_id: RoleId,
    #[serde(default)]
    pub deactivated_at: Option<u64>,
}

impl OrgUser {
    pub fn is_active(&self) -> bool {
        self.deactivated_at.is_none()
    }
}

/// The onboarding object a non-root device was approved through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "camelCase")]
pub enum ApprovedBy {
    Invite(KeyableId),
    DeviceGrant(KeyableId),
    RecoveryKey(KeyableId),
}

impl ApprovedBy {
    pub fn onboarding_id(&self) -> &KeyableId {
        match self {
            ApprovedBy::Invite(id) | ApprovedBy::DeviceGrant(id) | ApprovedBy::RecoveryKey(id) => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrgUserDevice {
    pub id: KeyableId,
    pub user_id: UserId,
    pub name: String,
    #[serde(default)]
    pub pubkey: Option<Pubkey>,
    #[serde(default)]
    pub is_root: bool,
    #[serde(default)]
    pub approved_by: Option<ApprovedBy>,
    pub created_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OnboardingKind {
    Invite,
    DeviceGrant,
    RecoveryKey,
}

impl OnboardingKind {
    pub fn keyable_type(self) -> KeyableType {
        match self {
            OnboardingKind::Invite => KeyableType::Invite,
            OnboardingKind::DeviceGrant => KeyableType::DeviceGrant,
            OnboardingKind::RecoveryKey => KeyableType::RecoveryKey,
        }
    }

    pub fn approved_by(self, id: KeyableId) -> ApprovedBy {
        match self {
            OnboardingKind::Invite => ApprovedBy::Invite(id),
            OnboardingKind::DeviceGrant => ApprovedBy::DeviceGrant(id),
            OnboardingKind::RecoveryKey => ApprovedBy::RecoveryKey(id),
        }
    }
}

/// An invite, device grant, or recovery key.
///
/// All three hold a short-lived keypair whose privkey travels out of band,
/// encrypted with a token. The device that redeems it is signed by this
/// pubkey.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Onboarding {
    pub id: KeyableId,
    pub kind: OnboardingKind,
    pub target_user_id: UserId,
    pub pubkey: Pubkey,
    pub signed_by_id: KeyableId,
    pub identity_hash: Blake3Hash,
    pub created_at: u64,
    #[serde(default)]
    pub expires_at: Option<u64>,
    #[serde(default)]
    pub accepted_at: Option<u64>,
}

impl Onboarding {
    /// Still waiting to be redeemed, and so still a key recipient.
    pub fn is_pending(&self, now: u64) -> bool {
        self.accepted_at.is_none() && self.expires_at.map_or(true, |at| now < at)
    }
}

/// A deployed runtime credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeneratedEnvkey {
    pub id: KeyableId,
    pub keyable_parent_id: KeyableId,
    pub pubkey: Pubkey,
    pub signed_by_id: KeyableId,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum KeyableParentKind {
    Server,
    LocalKey { user_id: UserId },
}

/// A server or local key: the owner of generated envkeys for one environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyableParent {
    pub id: KeyableId,
    pub name: String,
    pub kind: KeyableParentKind,
    pub env_parent_id: EnvParentId,
    pub environment_id: EnvironmentId,
    #[serde(default)]
    pub generated_envkey_id: Option<KeyableId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EnvParentKind {
    App,
    Block,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvParent {
    pub id: EnvParentId,
    pub name: String,
    pub kind: EnvParentKind,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppBlock {
    pub app_id: EnvParentId,
    pub block_id: EnvParentId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    pub id: EnvironmentId,
    pub env_parent_id: EnvParentId,
    pub environment_role_id: RoleId,
    #[serde(default)]
    pub is_sub: bool,
    #[serde(default)]
    pub parent_environment_id: Option<EnvironmentId>,
    #[serde(default)]
    pub sub_name: Option<String>,
    /// Source environments this one inherits values from.
    #[serde(default)]
    pub inheriting_from: BTreeSet<EnvironmentId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrgRole {
    pub id: RoleId,
    pub name: String,
    /// When set, members get this app role on every app.
    #[serde(default)]
    pub auto_app_role_id: Option<RoleId>,
    #[serde(default)]
    pub org_permissions: BTreeSet<OrgPermission>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppRole {
    pub id: RoleId,
    pub name: String,
    #[serde(default)]
    pub app_permissions: BTreeSet<AppPermission>,
    /// Permissions per environment role.
    #[serde(default)]
    pub environment_permissions: BTreeMap<RoleId, BTreeSet<EnvironmentPermission>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvironmentRole {
    pub id: RoleId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppUserGrant {
    pub app_id: EnvParentId,
    pub user_id: UserId,
    pub app_role_id: RoleId,
}

/// A request to swap a trusted root for a new one.
///
/// `trust_chain` lets devices that have never seen the signer verify the
/// replacement against their own root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RootPubkeyReplacement {
    pub id: RequestId,
    pub replacing_pubkey_id: KeyableId,
    pub replacing_pubkey: Pubkey,
    pub replacement_pubkey_id: KeyableId,
    pub replacement_pubkey: Pubkey,
    pub signed_by_id: KeyableId,
    pub trust_chain: TrustedPubkeys,
    pub created_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PubkeyRevocationRequest {
    pub id: RequestId,
    pub target_id: KeyableId,
    pub creator_id: UserId,
    pub created_at: u64,
}

/// A borrowed view of any keyable in the graph.
#[derive(Debug, Clone, Copy)]
pub enum KeyableRef<'a> {
    Device(&'a OrgUserDevice),
    CliUser(&'a OrgUser, &'a CliKey),
    Invite(&'a Onboarding),
    DeviceGrant(&'a Onboarding),
    RecoveryKey(&'a Onboarding),
    GeneratedEnvkey(&'a GeneratedEnvkey),
    /// A server or local key, standing in for its active generated envkey.
    KeyableParent(&'a KeyableParent),
}

/// A snapshot of an org's graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrgGraph {
    pub org: Org,
    pub updated_at: u64,
    #[serde(default)]
    pub users: BTreeMap<UserId, OrgUser>,
    #[serde(default)]
    pub devices: BTreeMap<KeyableId, OrgUserDevice>,
    #[serde(default)]
    pub onboardings: BTreeMap<KeyableId, Onboarding>,
    #[serde(default)]
    pub generated_envkeys: BTreeMap<KeyableId, GeneratedEnvkey>,
    #[serde(default)]
    pub keyable_parents: BTreeMap<KeyableId, KeyableParent>,
    #[serde(default)]
    pub env_parents: BTreeMap<EnvParentId, EnvParent>,
    #[serde(default)]
    pub app_blocks: BTreeSet<AppBlock>,
    #[serde(default)]
    pub environments: BTreeMap<EnvironmentId, Environment>,
    #[serde(default)]
    pub org_roles: BTreeMap<RoleId, OrgRole>,
    #[serde(default)]
    pub app_roles: BTreeMap<RoleId, AppRole>,
    #[serde(default)]
    pub environment_roles: BTreeMap<RoleId, EnvironmentRole>,
    #[serde(default)]
    pub app_user_grants: BTreeSet<AppUserGrant>,
    /// Environments whose keys must be rotated, and the users asked to do it.
    #[serde(default)]
    pub reencryption_queue: BTreeMap<EnvironmentId, BTreeSet<UserId>>,
    #[serde(default)]
    pub root_pubkey_replacements: BTreeMap<RequestId, RootPubkeyReplacement>,
    #[serde(default)]
    pub pubkey_revocation_requests: BTreeMap<RequestId, PubkeyRevocationRequest>,
    /// Removed devices, kept so content they signed stays verifiable until
    /// it is re-encrypted. Never recipients, never signers of new trust.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub revoked_devices: BTreeMap<KeyableId, OrgUserDevice>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub revoked_onboardings: BTreeMap<KeyableId, Onboarding>,
}

impl OrgGraph {
    /// An empty graph for `org`.
    pub fn new(org: Org) -> Self {
        Self {
            org,
            updated_at: 0,
            users: BTreeMap::new(),
            devices: BTreeMap::new(),
            onboardings: BTreeMap::new(),
            generated_envkeys: BTreeMap::new(),
            keyable_parents: BTreeMap::new(),
            env_parents: BTreeMap::new(),
            app_blocks: BTreeSet::new(),
            environments: BTreeMap::new(),
            org_roles: BTreeMap::new(),
            app_roles: BTreeMap::new(),
            environment_roles: BTreeMap::new(),
            app_user_grants: BTreeSet::new(),
            reencryption_queue: BTreeMap::new(),
            root_pubkey_replacements: BTreeMap::new(),
            pubkey_revocation_requests: BTreeMap::new(),
            revoked_devices: BTreeMap::new(),
            revoked_onboardings: BTreeMap::new(),
        }
    }

    /// Look up any keyable by id.
    pub fn keyable(&self, id: &KeyableId) -> Option<KeyableRef<'_>> {
        if let Some(device) = self.devices.get(id) {
            return Some(KeyableRef::Device(device));
        }
        if let Some(onboarding) = self.onboardings.get(id) {
            return Some(match onboarding.kind {
                OnboardingKind::Invite => KeyableRef::Invite(onboarding),
                OnboardingKind::DeviceGrant => KeyableRef::DeviceGrant(onboarding),
                OnboardingKind::RecoveryKey => KeyableRef::RecoveryKey(onboarding),
            });
        }
        if let Some(envkey) = self.generated_envkeys.get(id) {
            return Some(KeyableRef::GeneratedEnvkey(envkey));
        }
        if let Some(parent) = self.keyable_parents.get(id) {
            return Some(KeyableRef::KeyableParent(parent));
        }
        let user = self.users.get(id.as_str())?;
        match &user.kind {
            UserKind::Cli(cli) => Some(KeyableRef::CliUser(user, cli)),
            UserKind::Person => None,
        }
    }

    /// Devices (or the CLI key) a user decrypts with, plus onboardings
    /// still pending for them.
    pub fn recipient_keyable_ids(&self, user_id: &UserId, now: u64) -> Vec<KeyableId> {
        let Some(user) = self.users.get(user_id) else {
            return Vec::new();
        };
        let mut ids = Vec::new();
        match &user.kind {
            UserKind::Cli(_) => ids.push(user_id.as_keyable()),
            UserKind::Person => ids.extend(
                self.devices
                    .values()
                    .filter(|d| &d.user_id == user_id && d.pubkey.is_some())
                    .map(|d| d.id.clone()),
            ),
        }
        ids.extend(
            self.onboardings
                .values()
                .filter(|o| &o.target_user_id == user_id && o.is_pending(now))
                .map(|o| o.id.clone()),
        );
        ids
    }

    /// Pubkey a keyable currently encrypts and signs with.
    pub fn keyable_pubkey(&self, id: &KeyableId) -> Option<&Pubkey> {
        match self.keyable(id)? {
            KeyableRef::Device(device) => device.pubkey.as_ref(),
            KeyableRef::CliUser(_, cli) => Some(&cli.pubkey),
            KeyableRef::Invite(o) | KeyableRef::DeviceGrant(o) | KeyableRef::RecoveryKey(o) => {
                Some(&o.pubkey)
            }
            KeyableRef::GeneratedEnvkey(envkey) => Some(&envkey.pubkey),
            KeyableRef::KeyableParent(parent) => {
                let envkey_id = parent.generated_envkey_id.as_ref()?;
                self.generated_envkeys.get(envkey_id).map(|e| &e.pubkey)
            }
        }
    }

    /// User that owns a keyable, for keyables that belong to a user.
    pub fn keyable_user_id(&self, id: &KeyableId) -> Option<UserId> {
        match self.keyable(id)? {
            KeyableRef::Device(device) => Some(device.user_id.clone()),
            KeyableRef::CliUser(user, _) => Some(user.id.clone()),
            KeyableRef::Invite(o) | KeyableRef::DeviceGrant(o) | KeyableRef::RecoveryKey(o) => {
                Some(o.target_user_id.clone())
            }
            KeyableRef::GeneratedEnvkey(_) | KeyableRef::KeyableParent(_) => None,
        }
    }

    /// Environments (base and sub) belonging to an env parent.
    pub fn environments_for(&self, env_parent_id: &EnvParentId) -> impl Iterator<Item = &Environment> {
        let env_parent_id = env_parent_id.clone();
        self.environments
            .values()
            .filter(move |e| e.env_parent_id == env_parent_id)
    }

    /// Blocks connected to an app.
    pub fn connected_blocks(&self, app_id: &EnvParentId) -> Vec<EnvParentId> {
        self.app_blocks
            .iter()
            .filter(|ab| &ab.app_id == app_id)
            .map(|ab| ab.block_id.clone())
            .collect()
    }

    /// Apps connected to a block.
    pub fn connected_apps(&self, block_id: &EnvParentId) -> Vec<EnvParentId> {
        self.app_blocks
            .iter()
            .filter(|ab| &ab.block_id == block_id)
            .map(|ab| ab.app_id.clone())
            .collect()
    }

    /// Env parent an environment id belongs to, including locals ids.
    pub fn env_parent_of(&self, environment_id: &EnvironmentId) -> Option<EnvParentId> {
        if let Some((env_parent_id, _)) = environment_id.parse_locals() {
            return Some(env_parent_id);
        }
        self.environments
            .get(environment_id)
            .map(|e| e.env_parent_id.clone())
    }

    /// Environments that inherit from `source_id`.
    pub fn inheriting_environments(&self, source_id: &EnvironmentId) -> Vec<EnvironmentId> {
        self.environments
            .values()
            .filter(|e| e.inheriting_from.contains(source_id))
            .map(|e| e.id.clone())
            .collect()
    }

    /// The environment in `block_id` a keyable parent's environment maps to.
    ///
    /// Matched by environment role, and by sub-environment name for subs.
    pub fn block_environment_for(
        &self,
        block_id: &EnvParentId,
        environment_id: &EnvironmentId,
    ) -> Option<(EnvironmentId, Option<EnvironmentId>)> {
        let environment = self.environments.get(environment_id)?;
        let base = match (&environment.parent_environment_id, environment.is_sub) {
            (Some(parent_id), true) => self.environments.get(parent_id)?,
            _ => environment,
        };
        let block_base = self.environments_for(block_id).find(|e| {
            !e.is_sub && e.environment_role_id == base.environment_role_id
        })?;
        let block_sub = if environment.is_sub {
            self.environments_for(block_id)
                .find(|e| {
                    e.is_sub
                        && e.parent_environment_id.as_ref() == Some(&block_base.id)
                        && e.sub_name.is_some()
                        && e.sub_name == environment.sub_name
                })
                .map(|e| e.id.clone())
        } else {
            None
        };
        Some((block_base.id.clone(), block_sub))
    }

    /// Remove a device, the onboarding that approved it and every
    /// onboarding it signed that is still unaccepted, moving them to the
    /// revoked maps.
    pub fn remove_device(&mut self, device_id: &KeyableId) -> Option<OrgUserDevice> {
        let device = self.devices.remove(device_id)?;
        let mut onboarding_ids: Vec<KeyableId> = self
            .onboardings
            .values()
            .filter(|o| &o.signed_by_id == device_id && o.accepted_at.is_none())
            .map(|o| o.id.clone())
            .collect();
        if let Some(approved_by) = &device.approved_by {
            onboarding_ids.push(approved_by.onboarding_id().clone());
        }
        for id in onboarding_ids {
            if let Some(onboarding) = self.onboardings.remove(&id) {
                self.revoked_onboardings.insert(id, onboarding);
            }
        }
        self.revoked_devices.insert(device.id.clone(), device.clone());
        Some(device)
    }

    /// A copy with revoked devices and onboardings restored, for verifying
    /// signatures they made before removal.
    pub fn with_revoked(&self) -> OrgGraph {
        let mut graph = self.clone();
        for (id, device) in &self.revoked_devices {
            graph.devices.entry(id.clone()).or_insert_with(|| device.clone());
        }
        for (id, onboarding) in &self.revoked_onboardings {
            graph.onboardings.entry(id.clone()).or_insert_with(|| onboarding.clone());
        }
        graph
    }
}
