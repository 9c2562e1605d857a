//! The permission oracle.
//!
//! Evaluation rules are pluggable behind [`PermissionOracle`]; the key set
//! differ only ever asks "what may this user do to this thing in this
//! graph". [`RolePermissions`] is the default, role-based implementation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use envseal_core::{EnvParentId, EnvironmentId, RoleId, UserId};

use crate::model::{EnvParentKind, OrgGraph};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrgPermission {
    InviteUsers,
    ManageDevices,
    ManageRecoveryKeys,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppPermission {
    AppReadOwnLocals,
    AppReadUserLocals,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentPermission {
    Read,
    ReadMeta,
    ReadInherits,
    ReadHistory,
    Write,
}

/// Answers permission questions against a graph snapshot, real or proposed.
pub trait PermissionOracle: Send + Sync {
    fn org_permissions(&self, graph: &OrgGraph, user_id: &UserId) -> BTreeSet<OrgPermission>;

    /// Whether the user can see the app or block at all.
    fn can_access_env_parent(
        &self,
        graph: &OrgGraph,
        user_id: &UserId,
        env_parent_id: &EnvParentId,
    ) -> bool;

    fn app_permissions(
        &self,
        graph: &OrgGraph,
        user_id: &UserId,
        env_parent_id: &EnvParentId,
    ) -> BTreeSet<AppPermission>;

    /// Permissions on a base, sub, or locals environment.
    fn environment_permissions(
        &self,
        graph: &OrgGraph,
        user_id: &UserId,
        environment_id: &EnvironmentId,
    ) -> BTreeSet<EnvironmentPermission>;
}

/// Role-based permissions.
///
/// - deactivated users have none
/// - an org role's `auto_app_role_id` applies on every app, otherwise the
///   user's app grant does
/// - blocks take the union over connected apps
/// - sub-environments use their parent's permissions
/// - locals are governed by the app permissions
#[derive(Debug, Clone, Copy, Default)]
pub struct RolePermissions;

impl RolePermissions {
    fn app_role_id(graph: &OrgGraph, user_id: &UserId, app_id: &EnvParentId) -> Option<RoleId> {
        let user = graph.users.get(user_id).filter(|u| u.is_active())?;
        let org_role = graph.org_roles.get(&user.org_role_id)?;
        if let Some(auto) = &org_role.auto_app_role_id {
            return Some(auto.clone());
        }
        graph
            .app_user_grants
            .iter()
            .find(|g| &g.user_id == user_id && &g.app_id == app_id)
            .map(|g| g.app_role_id.clone())
    }

    /// App role ids that apply to the user on an app, or on each app a
    /// block is connected to.
    fn role_ids_for(graph: &OrgGraph, user_id: &UserId, env_parent_id: &EnvParentId) -> Vec<RoleId> {
        let Some(env_parent) = graph.env_parents.get(env_parent_id) else {
            return Vec::new();
        };
        match env_parent.kind {
            EnvParentKind::App => Self::app_role_id(graph, user_id, env_parent_id)
                .into_iter()
                .collect(),
            EnvParentKind::Block => graph
                .connected_apps(env_parent_id)
                .iter()
                .filter_map(|app_id| Self::app_role_id(graph, user_id, app_id))
                .collect(),
        }
    }
}

impl PermissionOracle for RolePermissions {
    fn org_permissions(&self, graph: &OrgGraph, user_id: &UserId) -> BTreeSet<OrgPermission> {
        graph
            .users
            .get(user_id)
            .filter(|u| u.is_active())
            .and_then(|u| graph.org_roles.get(&u.org_role_id))
            .map(|r| r.org_permissions.clone())
            .unwrap_or_default()
    }

    fn can_access_env_parent(
        &self,
        graph: &OrgGraph,
        user_id: &UserId,
        env_parent_id: &EnvParentId,
    ) -> bool {
        !Self::role_ids_for(graph, user_id, env_parent_id).is_empty()
    }

    fn app_permissions(
        &self,
        graph: &OrgGraph,
        user_id: &UserId,
        env_parent_id: &EnvParentId,
    ) -> BTreeSet<AppPermission> {
        Self::role_ids_for(graph, user_id, env_parent_id)
            .iter()
            .filter_map(|role_id| graph.app_roles.get(role_id))
            .flat_map(|role| role.app_permissions.iter().copied())
            .collect()
    }

    fn environment_permissions(
        &self,
        graph: &OrgGraph,
        user_id: &UserId,
        environment_id: &EnvironmentId,
    ) -> BTreeSet<EnvironmentPermission> {
        use EnvironmentPermission::*;

        if let Some((env_parent_id, owner_id)) = environment_id.parse_locals() {
            if !self.can_access_env_parent(graph, &owner_id, &env_parent_id) {
                return BTreeSet::new();
            }
            let app_permissions = self.app_permissions(graph, user_id, &env_parent_id);
            let own = &owner_id == user_id;
            let readable = (own && app_permissions.contains(&AppPermission::AppReadOwnLocals))
                || app_permissions.contains(&AppPermission::AppReadUserLocals);
            if !readable {
                return BTreeSet::new();
            }
            let mut permissions: BTreeSet<_> = [Read, ReadMeta, ReadHistory].into_iter().collect();
            if own {
                permissions.insert(Write);
            }
            return permissions;
        }

        let Some(mut environment) = graph.environments.get(environment_id) else {
            return BTreeSet::new();
        };
        if environment.is_sub {
            let parent = environment
                .parent_environment_id
                .as_ref()
                .and_then(|id| graph.environments.get(id));
            match parent {
                Some(parent) => environment = parent,
                None => return BTreeSet::new(),
            }
        }

        let mut permissions: BTreeSet<EnvironmentPermission> =
            Self::role_ids_for(graph, user_id, &environment.env_parent_id)
                .iter()
                .filter_map(|role_id| graph.app_roles.get(role_id))
                .filter_map(|role| role.environment_permissions.get(&environment.environment_role_id))
                .flat_map(|set| set.iter().copied())
                .collect();

        if permissions.contains(&Read) {
            permissions.insert(ReadMeta);
            permissions.insert(ReadInherits);
        }
        permissions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AppBlock, AppRole, AppUserGrant, EnvParent, Environment, Org, OrgRole, OrgUser, UserKind};
    use envseal_core::OrgId;
    use std::collections::BTreeMap;

    fn env(id: &str, parent: &str, role: &str) -> Environment {
        Environment {
            id: EnvironmentId::new(id),
            env_parent_id: EnvParentId::new(parent),
            environment_role_id: RoleId::new(role),
            is_sub: false,
            parent_environment_id: None,
            sub_name: None,
            inheriting_from: BTreeSet::new(),
        }
    }

    fn graph() -> OrgGraph {
        let mut g = OrgGraph::new(Org {
            id: OrgId::new("org"),
            name: "Org".into(),
        });
        g.org_roles.insert(
            RoleId::new("basic"),
            OrgRole {
                id: RoleId::new("basic"),
                name: "Basic".into(),
                auto_app_role_id: None,
                org_permissions: BTreeSet::new(),
            },
        );
        g.app_roles.insert(
            RoleId::new("dev"),
            AppRole {
                id: RoleId::new("dev"),
                name: "Developer".into(),
                app_permissions: [AppPermission::AppReadOwnLocals].into_iter().collect(),
                environment_permissions: BTreeMap::from([
                    (RoleId::new("development"), [EnvironmentPermission::Read, EnvironmentPermission::Write].into_iter().collect()),
                    (RoleId::new("production"), [EnvironmentPermission::ReadMeta].into_iter().collect()),
                ]),
            },
        );
        for (id, kind) in [("app", crate::model::EnvParentKind::App), ("block", crate::model::EnvParentKind::Block)] {
            g.env_parents.insert(
                EnvParentId::new(id),
                EnvParent {
                    id: EnvParentId::new(id),
                    name: id.into(),
                    kind,
                },
            );
        }
        g.app_blocks.insert(AppBlock {
            app_id: EnvParentId::new("app"),
            block_id: EnvParentId::new("block"),
        });
        for e in [
            env("app-dev", "app", "development"),
            env("app-prod", "app", "production"),
            env("block-dev", "block", "development"),
        ] {
            g.environments.insert(e.id.clone(), e);
        }
        let mut sub = env("app-dev-sub", "app", "development");
        sub.is_sub = true;
        sub.parent_environment_id = Some(EnvironmentId::new("app-dev"));
        g.environments.insert(sub.id.clone(), sub);

        for uid in ["u1", "u2"] {
            g.users.insert(
                UserId::new(uid),
                OrgUser {
                    id: UserId::new(uid),
                    name: uid.into(),
                    kind: UserKind::Person,
                    org_role_id: RoleId::new("basic"),
                    deactivated_at: None,
                },
            );
            g.app_user_grants.insert(AppUserGrant {
                app_id: EnvParentId::new("app"),
                user_id: UserId::new(uid),
                app_role_id: RoleId::new("dev"),
            });
        }
        g
    }

    #[test]
    fn test_read_implies_meta_and_inherits() {
        let g = graph();
        let perms = RolePermissions.environment_permissions(&g, &UserId::new("u1"), &EnvironmentId::new("app-dev"));
        assert!(perms.contains(&EnvironmentPermission::Read));
        assert!(perms.contains(&EnvironmentPermission::ReadMeta));
        assert!(perms.contains(&EnvironmentPermission::ReadInherits));
    }

    #[test]
    fn test_sub_environment_uses_parent() {
        let g = graph();
        let perms = RolePermissions.environment_permissions(&g, &UserId::new("u1"), &EnvironmentId::new("app-dev-sub"));
        assert!(perms.contains(&EnvironmentPermission::Read));
    }

    #[test]
    fn test_block_permissions_through_connected_app() {
        let g = graph();
        let perms = RolePermissions.environment_permissions(&g, &UserId::new("u1"), &EnvironmentId::new("block-dev"));
        assert!(perms.contains(&EnvironmentPermission::Write));
    }

    #[test]
    fn test_locals_own_only() {
        let g = graph();
        let app = EnvParentId::new("app");
        let own = EnvironmentId::locals(&app, &UserId::new("u1"));
        let other = EnvironmentId::locals(&app, &UserId::new("u2"));

        assert!(RolePermissions
            .environment_permissions(&g, &UserId::new("u1"), &own)
            .contains(&EnvironmentPermission::Read));
        assert!(RolePermissions
            .environment_permissions(&g, &UserId::new("u1"), &other)
            .is_empty());
    }

    #[test]
    fn test_deactivated_user_has_nothing() {
        let mut g = graph();
        g.users.get_mut(&UserId::new("u1")).unwrap().deactivated_at = Some(5);
        assert!(RolePermissions
            .environment_permissions(&g, &UserId::new("u1"), &EnvironmentId::new("app-dev"))
            .is_empty());
        assert!(!RolePermissions.can_access_env_parent(&g, &UserId::new("u1"), &EnvParentId::new("app")));
    }
}
