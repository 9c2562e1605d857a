//! Key sets: who should hold which symmetric keys.

use std::collections::{BTreeMap, BTreeSet};

use envseal_core::{EnvParentId, EnvironmentId, KeyableId, UserId};

use crate::env::Composite;
use crate::error::{GraphError, Result};
use crate::model::{KeyableParentKind, OrgGraph};

/// Parts of one environment's content a recipient holds keys for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentKeys {
    pub env: bool,
    pub meta: bool,
    pub inherits: bool,
    pub changesets: bool,
    /// Source environments whose overrides for this environment are held.
    pub inheritance_overrides: BTreeSet<EnvironmentId>,
}

impl EnvironmentKeys {
    /// Composites these flags grant for `environment_id`.
    pub fn composites(&self, environment_id: &EnvironmentId) -> Vec<Composite> {
        let mut out = Vec::new();
        if self.env {
            out.push(Composite::env(environment_id));
        }
        if self.meta {
            out.push(Composite::meta(environment_id));
        }
        if self.inherits {
            out.push(Composite::inherits(environment_id));
        }
        if self.changesets {
            out.push(Composite::changesets(environment_id));
        }
        for source in &self.inheritance_overrides {
            out.push(Composite::inheritance_override(environment_id, source));
        }
        out
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvParentKeys {
    pub environments: BTreeMap<EnvironmentId, EnvironmentKeys>,
    /// Locals keyed by the user whose locals they are.
    pub locals: BTreeMap<UserId, EnvironmentKeys>,
}

/// Keys held by a generated envkey.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyableParentKeys {
    /// The base environment.
    pub env: bool,
    /// The sub-environment, when the keyable parent targets one.
    pub sub_env: bool,
    /// The owning user's locals, for local keys.
    pub locals: bool,
    pub inheritance_overrides: BTreeSet<EnvironmentId>,
}

/// The environments a generated envkey's key slots resolve to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyableParentTargets {
    pub env: EnvironmentId,
    pub sub_env: Option<EnvironmentId>,
    pub locals: Option<EnvironmentId>,
}

impl KeyableParentTargets {
    /// Resolve a keyable parent's environments, mapped into `block_id` when set.
    pub fn resolve(
        graph: &OrgGraph,
        keyable_parent_id: &KeyableId,
        block_id: Option<&EnvParentId>,
    ) -> Result<Self> {
        let parent = graph
            .keyable_parents
            .get(keyable_parent_id)
            .ok_or_else(|| GraphError::UnknownKeyable(keyable_parent_id.clone()))?;
        let environment = graph
            .environments
            .get(&parent.environment_id)
            .ok_or_else(|| GraphError::UnknownEnvironment(parent.environment_id.clone()))?;

        let (env, sub_env, env_parent_id) = match block_id {
            Some(block_id) => {
                let (base, sub) = graph
                    .block_environment_for(block_id, &parent.environment_id)
                    .ok_or_else(|| GraphError::UnknownEnvParent(block_id.clone()))?;
                (base, sub, block_id.clone())
            }
            None if environment.is_sub => {
                let base = environment
                    .parent_environment_id
                    .clone()
                    .ok_or_else(|| GraphError::UnknownEnvironment(environment.id.clone()))?;
                (base, Some(environment.id.clone()), parent.env_parent_id.clone())
            }
            None => (environment.id.clone(), None, parent.env_parent_id.clone()),
        };

        let locals = match &parent.kind {
            KeyableParentKind::LocalKey { user_id } => {
                Some(EnvironmentId::locals(&env_parent_id, user_id))
            }
            KeyableParentKind::Server => None,
        };

        Ok(Self {
            env,
            sub_env,
            locals,
        })
    }

    /// Overrides are keyed on the most specific environment.
    pub fn override_target(&self) -> &EnvironmentId {
        self.sub_env.as_ref().unwrap_or(&self.env)
    }
}

impl KeyableParentKeys {
    /// Resolve these flags to composites.
    pub fn composites(&self, targets: &KeyableParentTargets) -> Vec<Composite> {
        let mut out = Vec::new();
        if self.env {
            out.push(Composite::env(&targets.env));
        }
        if let (true, Some(sub_id)) = (self.sub_env, &targets.sub_env) {
            out.push(Composite::env(sub_id));
        }
        if let (true, Some(locals_id)) = (self.locals, &targets.locals) {
            out.push(Composite::env(locals_id));
        }
        for source in &self.inheritance_overrides {
            out.push(Composite::inheritance_override(targets.override_target(), source));
        }
        out
    }
}

/// Per-device keys for each env parent.
pub type DeviceKeys = BTreeMap<EnvParentId, EnvParentKeys>;

/// The complete mapping of recipients to the keys they should hold.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySet {
    /// user -> device (or CLI key, or pending onboarding) -> env parent
    pub users: BTreeMap<UserId, BTreeMap<KeyableId, DeviceKeys>>,
    /// keyable parent -> generated envkey
    pub keyable_parents: BTreeMap<KeyableId, BTreeMap<KeyableId, KeyableParentKeys>>,
    /// block -> keyable parent -> generated envkey
    pub block_keyable_parents:
        BTreeMap<EnvParentId, BTreeMap<KeyableId, BTreeMap<KeyableId, KeyableParentKeys>>>,
}

/// Grants to add and grants to remove for a proposed graph change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeySetDiff {
    pub to_add: KeySet,
    pub to_remove: KeySet,
}

impl KeySetDiff {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Structural set difference over nested key maps.
trait Subtract: Sized {
    fn subtract(&self, other: &Self) -> Self;
    fn is_none(&self) -> bool;
}

impl Subtract for bool {
    fn subtract(&self, other: &Self) -> Self {
        *self && !*other
    }

    fn is_none(&self) -> bool {
        !*self
    }
}

impl<T: Ord + Clone> Subtract for BTreeSet<T> {
    fn subtract(&self, other: &Self) -> Self {
        self.difference(other).cloned().collect()
    }

    fn is_none(&self) -> bool {
        self.is_empty()
    }
}

impl<K: Ord + Clone, V: Subtract + Clone> Subtract for BTreeMap<K, V> {
    fn subtract(&self, other: &Self) -> Self {
        let mut out = BTreeMap::new();
        for (k, v) in self {
            let rest = match other.get(k) {
                Some(o) => v.subtract(o),
                None => v.clone(),
            };
            if !rest.is_none() {
                out.insert(k.clone(), rest);
            }
        }
        out
    }

    fn is_none(&self) -> bool {
        self.values().all(Subtract::is_none)
    }
}

impl Subtract for EnvironmentKeys {
    fn subtract(&self, other: &Self) -> Self {
        Self {
            env: self.env.subtract(&other.env),
            meta: self.meta.subtract(&other.meta),
            inherits: self.inherits.subtract(&other.inherits),
            changesets: self.changesets.subtract(&other.changesets),
            inheritance_overrides: self.inheritance_overrides.subtract(&other.inheritance_overrides),
        }
    }

    fn is_none(&self) -> bool {
        !self.env
            && !self.meta
            && !self.inherits
            && !self.changesets
            && self.inheritance_overrides.is_empty()
    }
}

impl Subtract for EnvParentKeys {
    fn subtract(&self, other: &Self) -> Self {
        Self {
            environments: self.environments.subtract(&other.environments),
            locals: self.locals.subtract(&other.locals),
        }
    }

    fn is_none(&self) -> bool {
        self.environments.is_none() && self.locals.is_none()
    }
}

impl Subtract for KeyableParentKeys {
    fn subtract(&self, other: &Self) -> Self {
        Self {
            env: self.env.subtract(&other.env),
            sub_env: self.sub_env.subtract(&other.sub_env),
            locals: self.locals.subtract(&other.locals),
            inheritance_overrides: self.inheritance_overrides.subtract(&other.inheritance_overrides),
        }
    }

    fn is_none(&self) -> bool {
        !self.env && !self.sub_env && !self.locals && self.inheritance_overrides.is_empty()
    }
}

impl KeySet {
    /// Entries in `self` that are absent from `other`.
    pub fn difference(&self, other: &KeySet) -> KeySet {
        KeySet {
            users: self.users.subtract(&other.users),
            keyable_parents: self.keyable_parents.subtract(&other.keyable_parents),
            block_keyable_parents: self.block_keyable_parents.subtract(&other.block_keyable_parents),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_none() && self.keyable_parents.is_none() && self.block_keyable_parents.is_none()
    }

    /// Every env parent the set touches.
    pub fn env_parent_ids(&self) -> BTreeSet<EnvParentId> {
        let mut ids = BTreeSet::new();
        for devices in self.users.values() {
            for env_parents in devices.values() {
                ids.extend(env_parents.keys().cloned());
            }
        }
        ids.extend(self.block_keyable_parents.keys().cloned());
        ids
    }

    /// Every `(recipient, composite)` pair the set grants.
    pub fn recipient_composites(&self, graph: &OrgGraph) -> Result<BTreeSet<(KeyableId, Composite)>> {
        let mut out = BTreeSet::new();

        for devices in self.users.values() {
            for (device_id, env_parents) in devices {
                for (env_parent_id, keys) in env_parents {
                    for (environment_id, k) in &keys.environments {
                        for composite in k.composites(environment_id) {
                            out.insert((device_id.clone(), composite));
                        }
                    }
                    for (user_id, k) in &keys.locals {
                        let locals_id = EnvironmentId::locals(env_parent_id, user_id);
                        for composite in k.composites(&locals_id) {
                            out.insert((device_id.clone(), composite));
                        }
                    }
                }
            }
        }

        for (parent_id, envkeys) in &self.keyable_parents {
            let targets = KeyableParentTargets::resolve(graph, parent_id, None)?;
            for (envkey_id, k) in envkeys {
                for composite in k.composites(&targets) {
                    out.insert((envkey_id.clone(), composite));
                }
            }
        }

        for (block_id, parents) in &self.block_keyable_parents {
            for (parent_id, envkeys) in parents {
                let targets = KeyableParentTargets::resolve(graph, parent_id, Some(block_id))?;
                for (envkey_id, k) in envkeys {
                    for composite in k.composites(&targets) {
                        out.insert((envkey_id.clone(), composite));
                    }
                }
            }
        }

        Ok(out)
    }

    /// Number of (recipient, environment) entries, for logging.
    pub fn entry_count(&self) -> usize {
        let users: usize = self
            .users
            .values()
            .flat_map(|devices| devices.values())
            .flat_map(|env_parents| env_parents.values())
            .map(|keys| keys.environments.len() + keys.locals.len())
            .sum();
        let keyable_parents: usize = self.keyable_parents.values().map(BTreeMap::len).sum();
        let blocks: usize = self
            .block_keyable_parents
            .values()
            .flat_map(|parents| parents.values())
            .map(BTreeMap::len)
            .sum();
        users + keyable_parents + blocks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(env: bool, meta: bool) -> EnvironmentKeys {
        EnvironmentKeys {
            env,
            meta,
            ..Default::default()
        }
    }

    fn single(user: &str, device: &str, app: &str, environment: &str, k: EnvironmentKeys) -> KeySet {
        let mut parent = EnvParentKeys::default();
        parent.environments.insert(EnvironmentId::new(environment), k);
        let mut set = KeySet::default();
        set.users
            .entry(UserId::new(user))
            .or_default()
            .entry(KeyableId::new(device))
            .or_default()
            .insert(EnvParentId::new(app), parent);
        set
    }

    #[test]
    fn test_difference_with_self_is_empty() {
        let set = single("u", "d", "app", "dev", keys(true, true));
        assert!(set.difference(&set).is_empty());
    }

    #[test]
    fn test_difference_keeps_only_missing_parts() {
        let full = single("u", "d", "app", "dev", keys(true, true));
        let meta_only = single("u", "d", "app", "dev", keys(false, true));

        let diff = full.difference(&meta_only);
        let expected = single("u", "d", "app", "dev", keys(true, false));
        assert_eq!(diff, expected);

        assert!(meta_only.difference(&full).is_empty());
    }

    #[test]
    fn test_difference_drops_empty_branches() {
        let a = single("u", "d", "app", "dev", keys(true, false));
        let b = single("u", "d", "app", "dev", keys(true, false));
        let diff = a.difference(&b);
        assert!(diff.users.is_empty());
    }

    #[test]
    fn test_environment_keys_composites() {
        let mut k = keys(true, true);
        k.inheritance_overrides.insert(EnvironmentId::new("staging"));
        let composites = k.composites(&EnvironmentId::new("prod"));
        assert_eq!(
            composites,
            vec![
                Composite::env(&EnvironmentId::new("prod")),
                Composite::meta(&EnvironmentId::new("prod")),
                Composite::inheritance_override(&EnvironmentId::new("prod"), &EnvironmentId::new("staging")),
            ]
        );
    }
}
