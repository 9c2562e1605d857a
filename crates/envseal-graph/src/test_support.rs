//! Graph builders shared by unit tests.

use std::collections::{BTreeMap, BTreeSet};

use envseal_core::{Blake3Hash, EnvParentId, EnvironmentId, KeyableId, Keypair, OrgId, RoleId, UserId};

use crate::model::*;
use crate::permissions::{AppPermission, EnvironmentPermission, OrgPermission};

pub(crate) struct GraphBuilder {
    graph: OrgGraph,
}

fn seed(label: &str) -> [u8; 32] {
    *Blake3Hash::hash(label.as_bytes()).as_bytes()
}

impl GraphBuilder {
    pub(crate) fn new() -> Self {
        Self {
            graph: OrgGraph::new(Org {
                id: OrgId::new("org"),
                name: "Org".into(),
            }),
        }
    }

    /// Owner with a root device, a developer, one app with a connected block,
    /// and a server on the app's development environment.
    pub(crate) fn sample() -> Self {
        use EnvironmentPermission::*;

        let mut b = Self::new();
        b.org_role(
            "owner",
            Some("admin"),
            &[OrgPermission::InviteUsers, OrgPermission::ManageDevices, OrgPermission::ManageRecoveryKeys],
        );
        b.org_role("basic", None, &[]);
        b.app_role(
            "admin",
            &[AppPermission::AppReadOwnLocals, AppPermission::AppReadUserLocals],
            &[
                ("development", &[Read, ReadHistory, Write][..]),
                ("staging", &[Read, ReadHistory, Write][..]),
                ("production", &[Read, ReadHistory, Write][..]),
            ],
        );
        b.app_role(
            "developer",
            &[AppPermission::AppReadOwnLocals],
            &[
                ("development", &[Read, ReadHistory, Write][..]),
                ("staging", &[Read][..]),
                ("production", &[ReadMeta][..]),
            ],
        );
        b.env_parent("app", EnvParentKind::App);
        b.env_parent("block", EnvParentKind::Block);
        b.graph.app_blocks.insert(AppBlock {
            app_id: EnvParentId::new("app"),
            block_id: EnvParentId::new("block"),
        });
        for parent in ["app", "block"] {
            for role in ["development", "staging", "production"] {
                b.environment(&format!("{}-{}", parent, short(role)), parent, role);
            }
        }
        b.sub_environment("app-prod-sub", "app-prod", "eu");
        b.inherit("app-prod-sub", "app-staging");

        b.user("u-owner", "owner", UserKind::Person);
        b.device("d-owner", "u-owner", true);
        b.user("u-dev", "basic", UserKind::Person);
        b.device("d-dev", "u-dev", false);
        b.app_grant("app", "u-dev", "developer");

        b.server("server-dev", "app", "app-dev");
        b
    }

    pub(crate) fn org_role(&mut self, id: &str, auto_app_role: Option<&str>, permissions: &[OrgPermission]) {
        self.graph.org_roles.insert(
            RoleId::new(id),
            OrgRole {
                id: RoleId::new(id),
                name: id.into(),
                auto_app_role_id: auto_app_role.map(RoleId::new),
                org_permissions: permissions.iter().copied().collect(),
            },
        );
    }

    pub(crate) fn app_role(
        &mut self,
        id: &str,
        app_permissions: &[AppPermission],
        environment_permissions: &[(&str, &[EnvironmentPermission])],
    ) {
        self.graph.app_roles.insert(
            RoleId::new(id),
            AppRole {
                id: RoleId::new(id),
                name: id.into(),
                app_permissions: app_permissions.iter().copied().collect(),
                environment_permissions: environment_permissions
                    .iter()
                    .map(|(role, perms)| (RoleId::new(*role), perms.iter().copied().collect::<BTreeSet<_>>()))
                    .collect::<BTreeMap<_, _>>(),
            },
        );
        for (role, _) in environment_permissions {
            self.graph.environment_roles.insert(
                RoleId::new(*role),
                EnvironmentRole {
                    id: RoleId::new(*role),
                    name: (*role).into(),
                },
            );
        }
    }

    pub(crate) fn env_parent(&mut self, id: &str, kind: EnvParentKind) {
        self.graph.env_parents.insert(
            EnvParentId::new(id),
            EnvParent {
                id: EnvParentId::new(id),
                name: id.into(),
                kind,
            },
        );
    }

    pub(crate) fn environment(&mut self, id: &str, env_parent: &str, role: &str) {
        self.graph.environments.insert(
            EnvironmentId::new(id),
            Environment {
                id: EnvironmentId::new(id),
                env_parent_id: EnvParentId::new(env_parent),
                environment_role_id: RoleId::new(role),
                is_sub: false,
                parent_environment_id: None,
                sub_name: None,
                inheriting_from: BTreeSet::new(),
            },
        );
    }

    pub(crate) fn sub_environment(&mut self, id: &str, parent: &str, name: &str) {
        let Some(base) = self.graph.environments.get(&EnvironmentId::new(parent)).cloned() else {
            return;
        };
        self.graph.environments.insert(
            EnvironmentId::new(id),
            Environment {
                id: EnvironmentId::new(id),
                env_parent_id: base.env_parent_id,
                environment_role_id: base.environment_role_id,
                is_sub: true,
                parent_environment_id: Some(base.id),
                sub_name: Some(name.into()),
                inheriting_from: BTreeSet::new(),
            },
        );
    }

    pub(crate) fn inherit(&mut self, inheriting: &str, source: &str) {
        if let Some(env) = self.graph.environments.get_mut(&EnvironmentId::new(inheriting)) {
            env.inheriting_from.insert(EnvironmentId::new(source));
        }
    }

    pub(crate) fn user(&mut self, id: &str, org_role: &str, kind: UserKind) {
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

    pub(crate) fn device(&mut self, id: &str, user: &str, is_root: bool) {
        self.graph.devices.insert(
            KeyableId::new(id),
            OrgUserDevice {
                id: KeyableId::new(id),
                user_id: UserId::new(user),
                name: id.into(),
                pubkey: Some(Keypair::from_seed(&seed(id)).pubkey),
                is_root,
                approved_by: None,
                created_at: 1,
            },
        );
    }

    pub(crate) fn app_grant(&mut self, app: &str, user: &str, role: &str) {
        self.graph.app_user_grants.insert(AppUserGrant {
            app_id: EnvParentId::new(app),
            user_id: UserId::new(user),
            app_role_id: RoleId::new(role),
        });
    }

    pub(crate) fn server(&mut self, id: &str, app: &str, environment: &str) {
        let envkey_id = KeyableId::new(format!("ge-{}", id));
        self.graph.generated_envkeys.insert(
            envkey_id.clone(),
            GeneratedEnvkey {
                id: envkey_id.clone(),
                keyable_parent_id: KeyableId::new(id),
                pubkey: Keypair::from_seed(&seed(envkey_id.as_str())).pubkey,
                signed_by_id: KeyableId::new("d-owner"),
                created_at: 1,
            },
        );
        self.graph.keyable_parents.insert(
            KeyableId::new(id),
            KeyableParent {
                id: KeyableId::new(id),
                name: id.into(),
                kind: KeyableParentKind::Server,
                env_parent_id: EnvParentId::new(app),
                environment_id: EnvironmentId::new(environment),
                generated_envkey_id: Some(envkey_id),
            },
        );
    }

    /// Add user `n` with one of the sample roles, some devices, or a CLI key.
    pub(crate) fn add_generated_user(&mut self, n: usize, role: u8, devices: u8, cli: bool) {
        let user_id = format!("gen-{}", n);
        let kind = if cli {
            UserKind::Cli(CliKey {
                pubkey: Keypair::from_seed(&seed(&user_id)).pubkey,
                signed_by_id: KeyableId::new("d-owner"),
            })
        } else {
            UserKind::Person
        };
        match role {
            0 => self.user(&user_id, "owner", kind),
            1 => {
                self.user(&user_id, "basic", kind);
                self.app_grant("app", &user_id, "developer");
            }
            _ => self.user(&user_id, "basic", kind),
        }
        if !cli {
            for d in 0..devices {
                self.device(&format!("{}-d{}", user_id, d), &user_id, false);
            }
        }
    }

    pub(crate) fn build(self) -> OrgGraph {
        self.graph
    }
}

fn short(role: &str) -> &str {
    match role {
        "development" => "dev",
        "production" => "prod",
        other => other,
    }
}

pub(crate) fn sample_graph() -> OrgGraph {
    GraphBuilder::sample().build()
}
