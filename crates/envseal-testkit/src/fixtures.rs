//! Test fixtures and helpers.
//!
//! [`OrgFixture`] builds a small org whose every pubkey is really signed by
//! the one it claims, served by a [`MemoryServer`]:
//!
//! - `u-owner` (org owner) with root device `d-owner`
//! - `u-admin` (org owner) with `d-admin`, invited by `d-owner`
//! - `u-dev` (basic, developer on `app`) with `d-dev`, invited by
//!   `d-owner`, and `d-dev-2`, granted by `d-dev`
//! - `u-ci`, a CLI user signed by `d-owner`, developer on `app`
//! - app `app` connected to block `block`, each with dev, staging and prod
//!   environments; `app-prod-sub` inherits from `app-staging`
//! - server `server-dev` on `app-dev`

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use envseal::onboarding::onboarding_identity_hash;
use envseal::trust::trust_attributes;
use envseal::{Client, ClientConfig, ClientContext, ReencryptionConfig, Services};
use envseal_core::crypto::sign_public_key;
use envseal_core::{
    AccountId, Blake3Hash, EnvParentId, EnvironmentId, KeyableId, Keypair, OrgId, RoleId, TrustedPubkeys, UserId,
};
use envseal_graph::{
    AppBlock, AppPermission, AppRole, AppUserGrant, CliKey, EnvParent, EnvParentKind, Environment,
    EnvironmentPermission, EnvironmentRole, GeneratedEnvkey, KeyableParent, KeyableParentKind,
    Onboarding, OnboardingKind, Org, OrgGraph, OrgPermission, OrgRole, OrgUser, OrgUserDevice,
    UserKind,
};
use envseal_store::{MemoryTrustStore, TrustStore};
use envseal_sync::{MemoryServer, MemoryServerConfig, Transport};

/// A user and the key it acts with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Member {
    pub user: &'static str,
    pub device: &'static str,
}

impl Member {
    pub fn user_id(&self) -> UserId {
        UserId::new(self.user)
    }

    pub fn device_id(&self) -> KeyableId {
        KeyableId::new(self.device)
    }
}

pub const OWNER: Member = Member { user: "u-owner", device: "d-owner" };
pub const ADMIN: Member = Member { user: "u-admin", device: "d-admin" };
pub const DEV: Member = Member { user: "u-dev", device: "d-dev" };
pub const DEV_SECOND: Member = Member { user: "u-dev", device: "d-dev-2" };
pub const CLI: Member = Member { user: "u-ci", device: "u-ci" };

/// Deterministic 32-byte seed for a label.
pub fn seed(label: &str) -> [u8; 32] {
    *Blake3Hash::hash(label.as_bytes()).as_bytes()
}

/// Client config without pacing delays and with batches of two.
pub fn test_config() -> ClientConfig {
    ClientConfig {
        reencryption: ReencryptionConfig::immediate(2),
        ..ClientConfig::default()
    }
}

/// Environment ids by short name.
pub fn env(id: &str) -> EnvironmentId {
    EnvironmentId::new(id)
}

pub fn parents(ids: &[&str]) -> BTreeSet<EnvParentId> {
    ids.iter().map(|id| EnvParentId::new(*id)).collect()
}

struct Builder {
    graph: OrgGraph,
    keypairs: BTreeMap<KeyableId, Keypair>,
}

impl Builder {
    fn new() -> Self {
        Self {
            graph: OrgGraph::new(Org {
                id: OrgId::new("org"),
                name: "Org".into(),
            }),
            keypairs: BTreeMap::new(),
        }
    }

    fn keypair(&mut self, id: &str) -> Keypair {
        let kp = Keypair::from_seed(&seed(id));
        self.keypairs.insert(KeyableId::new(id), kp.clone());
        kp
    }

    fn signer(&self, id: &str) -> Keypair {
        self.keypairs
            .get(&KeyableId::new(id))
            .cloned()
            .unwrap_or_else(|| panic!("no keypair for signer {}", id))
    }

    fn roles(&mut self) {
        use EnvironmentPermission::*;

        self.graph.org_roles.insert(
            RoleId::new("owner"),
            org_role(
                "owner",
                Some("admin"),
                &[OrgPermission::InviteUsers, OrgPermission::ManageDevices, OrgPermission::ManageRecoveryKeys],
            ),
        );
        self.graph
            .org_roles
            .insert(RoleId::new("basic"), org_role("basic", None, &[]));

        let full = [Read, ReadHistory, Write];
        self.graph.app_roles.insert(
            RoleId::new("admin"),
            app_role(
                "admin",
                &[AppPermission::AppReadOwnLocals, AppPermission::AppReadUserLocals],
                &[("development", &full), ("staging", &full), ("production", &full)],
            ),
        );
        self.graph.app_roles.insert(
            RoleId::new("developer"),
            app_role(
                "developer",
                &[AppPermission::AppReadOwnLocals],
                &[("development", &full), ("staging", &[Read]), ("production", &[ReadMeta])],
            ),
        );
        for role in ["development", "staging", "production"] {
            self.graph.environment_roles.insert(
                RoleId::new(role),
                EnvironmentRole {
                    id: RoleId::new(role),
                    name: role.into(),
                },
            );
        }
    }

    fn env_parents(&mut self) {
        for (id, kind) in [("app", EnvParentKind::App), ("block", EnvParentKind::Block)] {
            self.graph.env_parents.insert(
                EnvParentId::new(id),
                EnvParent {
                    id: EnvParentId::new(id),
                    name: id.into(),
                    kind,
                },
            );
            for (short, role) in [("dev", "development"), ("staging", "staging"), ("prod", "production")] {
                let environment_id = EnvironmentId::new(format!("{}-{}", id, short));
                self.graph.environments.insert(
                    environment_id.clone(),
                    Environment {
                        id: environment_id,
                        env_parent_id: EnvParentId::new(id),
                        environment_role_id: RoleId::new(role),
                        is_sub: false,
                        parent_environment_id: None,
                        sub_name: None,
                        inheriting_from: BTreeSet::new(),
                    },
                );
            }
        }
        self.graph.app_blocks.insert(AppBlock {
            app_id: EnvParentId::new("app"),
            block_id: EnvParentId::new("block"),
        });
        self.graph.environments.insert(
            env("app-prod-sub"),
            Environment {
                id: env("app-prod-sub"),
                env_parent_id: EnvParentId::new("app"),
                environment_role_id: RoleId::new("production"),
                is_sub: true,
                parent_environment_id: Some(env("app-prod")),
                sub_name: Some("eu".into()),
                inheriting_from: [env("app-staging")].into_iter().collect(),
            },
        );
    }

    fn user(&mut self, id: &str, org_role: &str, kind: UserKind) {
        self.graph.users.insert(
            UserId::new(id),
            OrgUser {
                id: UserId::new(id),
                name: id.into(),
                kind,
                org_role_id: RoleId::new(org_role),
                deactivated_at: None,
            },
        );
    }

    fn app_grant(&mut self, user: &str, role: &str) {
        self.graph.app_user_grants.insert(AppUserGrant {
            app_id: EnvParentId::new("app"),
            user_id: UserId::new(user),
            app_role_id: RoleId::new(role),
        });
    }

    fn root_device(&mut self, member: Member) {
        let kp = self.keypair(member.device);
        self.graph.devices.insert(
            member.device_id(),
            OrgUserDevice {
                id: member.device_id(),
                user_id: member.user_id(),
                name: member.device.into(),
                pubkey: Some(kp.pubkey),
                is_root: true,
                approved_by: None,
                created_at: 1,
            },
        );
    }

    /// Add a device approved through an accepted onboarding signed by
    /// `signer`.
    fn onboarded_device(&mut self, member: Member, kind: OnboardingKind, signer: &str) {
        let onboarding_id = KeyableId::new(format!("onb-{}", member.device));
        let onboarding_kp = self.keypair(onboarding_id.as_str());
        let signer_kp = self.signer(signer);
        let onboarding_pubkey = sign_public_key(&onboarding_kp.pubkey, &signer_kp.privkey);
        let signer_pubkey = self
            .graph
            .keyable_pubkey(&KeyableId::new(signer))
            .cloned()
            .unwrap_or_else(|| panic!("signer {} has no pubkey", signer));
        let identity_hash = onboarding_identity_hash(
            &onboarding_id,
            &member.user_id(),
            &onboarding_pubkey,
            &KeyableId::new(signer),
            &signer_pubkey,
        )
        .unwrap_or_else(|e| panic!("identity hash: {}", e));
        self.graph.onboardings.insert(
            onboarding_id.clone(),
            Onboarding {
                id: onboarding_id.clone(),
                kind,
                target_user_id: member.user_id(),
                pubkey: onboarding_pubkey,
                signed_by_id: KeyableId::new(signer),
                identity_hash,
                created_at: 1,
                expires_at: None,
                accepted_at: Some(2),
            },
        );

        let device_kp = self.keypair(member.device);
        self.graph.devices.insert(
            member.device_id(),
            OrgUserDevice {
                id: member.device_id(),
                user_id: member.user_id(),
                name: member.device.into(),
                pubkey: Some(sign_public_key(&device_kp.pubkey, &onboarding_kp.privkey)),
                is_root: false,
                approved_by: Some(kind.approved_by(onboarding_id)),
                created_at: 2,
            },
        );
    }

    fn cli_user(&mut self, member: Member, signer: &str) {
        let kp = self.keypair(member.device);
        let signer_kp = self.signer(signer);
        self.user(
            member.user,
            "basic",
            UserKind::Cli(CliKey {
                pubkey: sign_public_key(&kp.pubkey, &signer_kp.privkey),
                signed_by_id: KeyableId::new(signer),
            }),
        );
    }

    fn server(&mut self, id: &str, environment: &str, signer: &str) {
        let envkey_id = format!("ge-{}", id);
        let kp = self.keypair(&envkey_id);
        let signer_kp = self.signer(signer);
        self.graph.generated_envkeys.insert(
            KeyableId::new(&envkey_id),
            GeneratedEnvkey {
                id: KeyableId::new(&envkey_id),
                keyable_parent_id: KeyableId::new(id),
                pubkey: sign_public_key(&kp.pubkey, &signer_kp.privkey),
                signed_by_id: KeyableId::new(signer),
                created_at: 3,
            },
        );
        self.graph.keyable_parents.insert(
            KeyableId::new(id),
            KeyableParent {
                id: KeyableId::new(id),
                name: id.into(),
                kind: KeyableParentKind::Server,
                env_parent_id: EnvParentId::new("app"),
                environment_id: env(environment),
                generated_envkey_id: Some(KeyableId::new(envkey_id)),
            },
        );
    }

    fn sample() -> Self {
        let mut b = Self::new();
        b.roles();
        b.env_parents();

        b.user(OWNER.user, "owner", UserKind::Person);
        b.root_device(OWNER);
        b.user(ADMIN.user, "owner", UserKind::Person);
        b.onboarded_device(ADMIN, OnboardingKind::Invite, OWNER.device);
        b.user(DEV.user, "basic", UserKind::Person);
        b.app_grant(DEV.user, "developer");
        b.onboarded_device(DEV, OnboardingKind::Invite, OWNER.device);
        b.onboarded_device(DEV_SECOND, OnboardingKind::DeviceGrant, DEV.device);
        b.cli_user(CLI, OWNER.device);
        b.app_grant(CLI.user, "developer");
        b.server("server-dev", "app-dev", OWNER.device);
        b
    }
}

fn org_role(id: &str, auto_app_role: Option<&str>, perms: &[OrgPermission]) -> OrgRole {
    OrgRole {
        id: RoleId::new(id),
        name: id.into(),
        auto_app_role_id: auto_app_role.map(RoleId::new),
        org_permissions: perms.iter().copied().collect(),
    }
}

fn app_role(id: &str, app: &[AppPermission], envs: &[(&str, &[EnvironmentPermission])]) -> AppRole {
    AppRole {
        id: RoleId::new(id),
        name: id.into(),
        app_permissions: app.iter().copied().collect(),
        environment_permissions: envs
            .iter()
            .map(|(role, perms)| (RoleId::new(*role), perms.iter().copied().collect()))
            .collect(),
    }
}

/// The sample org and its server.
pub struct OrgFixture {
    pub server: Arc<MemoryServer>,
    keypairs: BTreeMap<KeyableId, Keypair>,
    root: TrustedPubkeys,
}

impl OrgFixture {
    pub fn new() -> Self {
        Self::with_config(MemoryServerConfig::default())
    }

    pub fn with_config(config: MemoryServerConfig) -> Self {
        let b = Builder::sample();
        let root_entry = trust_attributes(&b.graph, &OWNER.device_id())
            .unwrap_or_else(|e| panic!("root attributes: {}", e))
            .to_trusted();
        Self {
            server: Arc::new(MemoryServer::with_config(b.graph, config)),
            keypairs: b.keypairs,
            root: [(OWNER.device_id(), root_entry)].into_iter().collect(),
        }
    }

    /// The sample graph before the server stamps it.
    pub fn sample_graph() -> OrgGraph {
        Builder::sample().graph
    }

    pub fn keypair(&self, id: &str) -> &Keypair {
        self.keypairs
            .get(&KeyableId::new(id))
            .unwrap_or_else(|| panic!("no keypair for {}", id))
    }

    /// Root registry every non-root member starts with.
    pub fn root(&self) -> &TrustedPubkeys {
        &self.root
    }

    pub fn account_id(member: Member) -> AccountId {
        AccountId::new(format!("acct-{}", member.device))
    }

    pub fn context(&self, member: Member) -> ClientContext {
        ClientContext {
            account_id: Self::account_id(member),
            org_id: OrgId::new("org"),
            user_id: member.user_id(),
            device_id: member.device_id(),
            privkey: self.keypair(member.device).privkey.clone(),
        }
    }

    /// Services over `transport` and a store that already trusts the root,
    /// unless `member` is the root device itself.
    pub async fn services(&self, member: Member, transport: Arc<dyn Transport>) -> Services {
        let store = Arc::new(MemoryTrustStore::new());
        if member != OWNER {
            let account_id = Self::account_id(member);
            for (id, trusted) in &self.root {
                store
                    .insert_root_if_absent(&account_id, id, trusted)
                    .await
                    .unwrap_or_else(|e| panic!("seeding root: {}", e));
            }
        }
        Services::new(transport, store)
    }

    pub async fn client(&self, member: Member) -> envseal::Result<Client> {
        self.client_with(member, self.server.clone(), test_config()).await
    }

    pub async fn client_with(
        &self,
        member: Member,
        transport: Arc<dyn Transport>,
        config: ClientConfig,
    ) -> envseal::Result<Client> {
        let services = self.services(member, transport).await;
        Client::open(self.context(member), config, services).await
    }
}

impl Default for OrgFixture {
    fn default() -> Self {
        Self::new()
    }
}
