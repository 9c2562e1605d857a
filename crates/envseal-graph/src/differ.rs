//! Key set derivation and diffing.
//!
//! The differ never reasons about individual permission rules. It computes
//! the complete "who should hold what" snapshot for a graph, does the same
//! for a proposed copy of the graph, and subtracts. Anything a rule change
//! could affect shows up in the difference.

use std::collections::BTreeSet;

use tracing::debug;

use envseal_core::{EnvParentId, EnvironmentId, UserId};

use crate::keyset::{DeviceKeys, EnvParentKeys, EnvironmentKeys, KeySet, KeySetDiff, KeyableParentKeys};
use crate::model::{KeyableParentKind, OrgGraph};
use crate::permissions::{EnvironmentPermission, PermissionOracle};

/// Restricts which part of the graph a key set covers.
///
/// When `user_ids` is set, keyable parents are left out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySetScope {
    pub env_parent_ids: Option<BTreeSet<EnvParentId>>,
    pub user_ids: Option<BTreeSet<UserId>>,
}

impl KeySetScope {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn env_parents(ids: impl IntoIterator<Item = EnvParentId>) -> Self {
        Self {
            env_parent_ids: Some(ids.into_iter().collect()),
            user_ids: None,
        }
    }

    pub fn users(ids: impl IntoIterator<Item = UserId>) -> Self {
        Self {
            env_parent_ids: None,
            user_ids: Some(ids.into_iter().collect()),
        }
    }

    fn includes_env_parent(&self, id: &EnvParentId) -> bool {
        self.env_parent_ids.as_ref().map_or(true, |ids| ids.contains(id))
    }

    fn includes_user(&self, id: &UserId) -> bool {
        self.user_ids.as_ref().map_or(true, |ids| ids.contains(id))
    }
}

/// Env parents whose plaintext must be in memory before a key set can be
/// encrypted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequiredEnvs {
    pub envs: BTreeSet<EnvParentId>,
    pub changesets: BTreeSet<EnvParentId>,
}

impl RequiredEnvs {
    pub fn is_empty(&self) -> bool {
        self.envs.is_empty() && self.changesets.is_empty()
    }
}

fn environment_keys(
    permissions: &BTreeSet<EnvironmentPermission>,
    inheriting_from: Option<&BTreeSet<EnvironmentId>>,
) -> EnvironmentKeys {
    let read = permissions.contains(&EnvironmentPermission::Read);
    EnvironmentKeys {
        env: read,
        meta: permissions.contains(&EnvironmentPermission::ReadMeta),
        inherits: inheriting_from.is_some() && permissions.contains(&EnvironmentPermission::ReadInherits),
        changesets: permissions.contains(&EnvironmentPermission::ReadHistory),
        inheritance_overrides: match (read, inheriting_from) {
            (true, Some(sources)) => sources.clone(),
            _ => BTreeSet::new(),
        },
    }
}

fn is_empty_keys(keys: &EnvironmentKeys) -> bool {
    *keys == EnvironmentKeys::default()
}

fn env_parent_keys(
    graph: &OrgGraph,
    oracle: &dyn PermissionOracle,
    user_id: &UserId,
    env_parent_id: &EnvParentId,
) -> EnvParentKeys {
    let mut out = EnvParentKeys::default();

    for environment in graph.environments_for(env_parent_id) {
        let permissions = oracle.environment_permissions(graph, user_id, &environment.id);
        let keys = environment_keys(&permissions, Some(&environment.inheriting_from));
        if !is_empty_keys(&keys) {
            out.environments.insert(environment.id.clone(), keys);
        }
    }

    for owner in graph.users.values().filter(|u| u.is_active()) {
        if !oracle.can_access_env_parent(graph, &owner.id, env_parent_id) {
            continue;
        }
        let locals_id = EnvironmentId::locals(env_parent_id, &owner.id);
        let permissions = oracle.environment_permissions(graph, user_id, &locals_id);
        let keys = environment_keys(&permissions, None);
        if !is_empty_keys(&keys) {
            out.locals.insert(owner.id.clone(), keys);
        }
    }

    out
}

/// The key set the graph currently implies.
pub fn current_key_set(
    graph: &OrgGraph,
    oracle: &dyn PermissionOracle,
    now: u64,
    scope: &KeySetScope,
) -> KeySet {
    let mut set = KeySet::default();

    for user in graph.users.values().filter(|u| u.is_active()) {
        if !scope.includes_user(&user.id) {
            continue;
        }
        let recipients = graph.recipient_keyable_ids(&user.id, now);
        if recipients.is_empty() {
            continue;
        }

        let mut device_keys = DeviceKeys::new();
        for env_parent_id in graph.env_parents.keys() {
            if !scope.includes_env_parent(env_parent_id) {
                continue;
            }
            let keys = env_parent_keys(graph, oracle, &user.id, env_parent_id);
            if !keys.environments.is_empty() || !keys.locals.is_empty() {
                device_keys.insert(env_parent_id.clone(), keys);
            }
        }
        if device_keys.is_empty() {
            continue;
        }

        let by_device = set.users.entry(user.id.clone()).or_default();
        for recipient_id in recipients {
            by_device.insert(recipient_id, device_keys.clone());
        }
    }

    if scope.user_ids.is_some() {
        return set;
    }

    for parent in graph.keyable_parents.values() {
        let Some(envkey_id) = parent
            .generated_envkey_id
            .as_ref()
            .filter(|id| graph.generated_envkeys.contains_key(*id))
        else {
            continue;
        };
        let Some(environment) = graph.environments.get(&parent.environment_id) else {
            continue;
        };
        let is_local_key = match &parent.kind {
            KeyableParentKind::Server => false,
            KeyableParentKind::LocalKey { user_id } => {
                if !oracle.can_access_env_parent(graph, user_id, &parent.env_parent_id) {
                    continue;
                }
                true
            }
        };

        if scope.includes_env_parent(&parent.env_parent_id) {
            set.keyable_parents.entry(parent.id.clone()).or_default().insert(
                envkey_id.clone(),
                KeyableParentKeys {
                    env: true,
                    sub_env: environment.is_sub,
                    locals: is_local_key,
                    inheritance_overrides: environment.inheriting_from.clone(),
                },
            );
        }

        for block_id in graph.connected_blocks(&parent.env_parent_id) {
            if !scope.includes_env_parent(&block_id) {
                continue;
            }
            let Some((block_base, block_sub)) = graph.block_environment_for(&block_id, &parent.environment_id) else {
                continue;
            };
            let target = block_sub.as_ref().unwrap_or(&block_base);
            let overrides = graph
                .environments
                .get(target)
                .map(|e| e.inheriting_from.clone())
                .unwrap_or_default();
            set.block_keyable_parents
                .entry(block_id.clone())
                .or_default()
                .entry(parent.id.clone())
                .or_default()
                .insert(
                    envkey_id.clone(),
                    KeyableParentKeys {
                        env: true,
                        sub_env: block_sub.is_some(),
                        locals: is_local_key,
                        inheritance_overrides: overrides,
                    },
                );
        }
    }

    set
}

/// Diff the key set of `graph` against the key set of `graph` after
/// `producer` is applied to a copy of it.
pub fn key_set_for_graph_proposal<F>(
    graph: &OrgGraph,
    oracle: &dyn PermissionOracle,
    now: u64,
    producer: F,
    scope: &KeySetScope,
) -> KeySetDiff
where
    F: FnOnce(&mut OrgGraph),
{
    let current = current_key_set(graph, oracle, now, scope);

    let mut proposed_graph = graph.clone();
    producer(&mut proposed_graph);
    let proposed = current_key_set(&proposed_graph, oracle, now, scope);

    let diff = KeySetDiff {
        to_add: proposed.difference(&current),
        to_remove: current.difference(&proposed),
    };
    debug!(
        to_add = diff.to_add.entry_count(),
        to_remove = diff.to_remove.entry_count(),
        "computed key set diff"
    );
    diff
}

/// Which env parents' envs and changesets must be decrypted locally before
/// `key_set` can be encrypted.
pub fn required_envs_for_key_set(graph: &OrgGraph, key_set: &KeySet) -> RequiredEnvs {
    let mut required = RequiredEnvs::default();

    for env_parents in key_set.users.values().flat_map(|devices| devices.values()) {
        for (env_parent_id, keys) in env_parents {
            let all = keys.environments.values().chain(keys.locals.values());
            for k in all {
                if k.env || k.meta || k.inherits || !k.inheritance_overrides.is_empty() {
                    required.envs.insert(env_parent_id.clone());
                }
                if k.changesets {
                    required.changesets.insert(env_parent_id.clone());
                }
            }
        }
    }

    for parent_id in key_set.keyable_parents.keys() {
        if let Some(parent) = graph.keyable_parents.get(parent_id) {
            required.envs.insert(parent.env_parent_id.clone());
        }
    }
    required
        .envs
        .extend(key_set.block_keyable_parents.keys().cloned());

    required
}
