//! Uncommitted env edits.
//!
//! Each edit becomes a [`PendingEnvUpdate`] holding a forward patch (from
//! the state before the edit to the state after it) and a reverse patch.
//! A new edit supersedes earlier non-create edits of the same environment
//! whose keys it fully covers, and an environment whose pending edits cancel
//! out is dropped from the list altogether.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use envseal_core::{EnvironmentId, UserId};
use envseal_graph::{EnvEntry, EnvWithMeta};

use crate::error::{ClientError, Result};
use crate::patch::{self, Patch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PendingKind {
    CreateEntry,
    UpdateEntry,
    RemoveEntry,
    UpdateOverride,
}

/// A variable, or an inheriting environment's override of it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryKey {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inheriting_environment_id: Option<EnvironmentId>,
}

impl EntryKey {
    pub fn variable(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            inheriting_environment_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMeta {
    pub environment_id: EnvironmentId,
    pub entry_keys: BTreeSet<EntryKey>,
    pub pending_at: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingEnvUpdate {
    pub kind: PendingKind,
    pub forward: Patch,
    pub reverse: Patch,
    pub meta: PendingMeta,
}

/// One edit to an environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvEdit {
    /// Create or update a variable.
    Set { key: String, entry: EnvEntry },
    Remove { key: String },
    /// Set (`Some`) or clear (`None`) the value an inheriting environment
    /// sees for `key`.
    SetOverride {
        inheriting_environment_id: EnvironmentId,
        key: String,
        entry: Option<EnvEntry>,
    },
}

impl EnvEdit {
    fn entry_key(&self) -> EntryKey {
        match self {
            EnvEdit::Set { key, .. } | EnvEdit::Remove { key } => EntryKey::variable(key.clone()),
            EnvEdit::SetOverride {
                inheriting_environment_id,
                key,
                ..
            } => EntryKey {
                key: key.clone(),
                inheriting_environment_id: Some(inheriting_environment_id.clone()),
            },
        }
    }

    fn apply(&self, env: &mut EnvWithMeta) -> Result<()> {
        match self {
            EnvEdit::Set { key, entry } => {
                env.variables.insert(key.clone(), entry.clone());
            }
            EnvEdit::Remove { key } => {
                if env.variables.remove(key).is_none() {
                    return Err(ClientError::InvalidOperation(format!("{} is not set", key)));
                }
                for overrides in env.inheritance_overrides.values_mut() {
                    overrides.remove(key);
                }
                env.inheritance_overrides.retain(|_, o| !o.is_empty());
            }
            EnvEdit::SetOverride {
                inheriting_environment_id,
                key,
                entry,
            } => match entry {
                Some(entry) => {
                    env.inheritance_overrides
                        .entry(inheriting_environment_id.clone())
                        .or_default()
                        .insert(key.clone(), entry.clone());
                }
                None => {
                    if let Some(overrides) = env.inheritance_overrides.get_mut(inheriting_environment_id) {
                        overrides.remove(key);
                        if overrides.is_empty() {
                            env.inheritance_overrides.remove(inheriting_environment_id);
                        }
                    }
                }
            },
        }
        Ok(())
    }
}

/// A committed changeset: the pending updates of one commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Changeset {
    pub id: String,
    pub created_at: u64,
    pub created_by_id: UserId,
    pub actions: Vec<PendingEnvUpdate>,
}

fn to_doc(env: &EnvWithMeta) -> Result<Value> {
    Ok(serde_json::to_value(env)?)
}

fn from_doc(doc: Value) -> Result<EnvWithMeta> {
    Ok(serde_json::from_value(doc)?)
}

/// Apply the forward patches of every pending update for `environment_id`.
pub fn apply_pending(
    committed: &EnvWithMeta,
    environment_id: &EnvironmentId,
    pending: &[PendingEnvUpdate],
) -> Result<EnvWithMeta> {
    let mut doc = to_doc(committed)?;
    for update in pending.iter().filter(|u| &u.meta.environment_id == environment_id) {
        doc = patch::apply(&doc, &update.forward)?;
    }
    from_doc(doc)
}

/// Environments with pending updates.
pub fn pending_environment_ids(pending: &[PendingEnvUpdate]) -> BTreeSet<EnvironmentId> {
    pending.iter().map(|u| u.meta.environment_id.clone()).collect()
}

fn entry_value(env: &EnvWithMeta, key: &EntryKey) -> Option<EnvEntry> {
    match &key.inheriting_environment_id {
        None => env.variables.get(&key.key).cloned(),
        Some(inheriting) => env
            .inheritance_overrides
            .get(inheriting)
            .and_then(|overrides| overrides.get(&key.key))
            .cloned(),
    }
}

fn set_entry_value(env: &mut EnvWithMeta, key: &EntryKey, entry: Option<EnvEntry>) {
    match (&key.inheriting_environment_id, entry) {
        (None, Some(entry)) => {
            env.variables.insert(key.key.clone(), entry);
        }
        (None, None) => {
            env.variables.remove(&key.key);
        }
        (Some(inheriting), Some(entry)) => {
            env.inheritance_overrides
                .entry(inheriting.clone())
                .or_default()
                .insert(key.key.clone(), entry);
        }
        (Some(inheriting), None) => {
            if let Some(overrides) = env.inheritance_overrides.get_mut(inheriting) {
                overrides.remove(&key.key);
                if overrides.is_empty() {
                    env.inheritance_overrides.remove(inheriting);
                }
            }
        }
    }
}

/// Every variable and override that differs between `before` and `after`,
/// with its value in `after`.
fn entry_changes(before: &EnvWithMeta, after: &EnvWithMeta) -> Vec<(EntryKey, Option<EnvEntry>)> {
    let mut keys: BTreeSet<EntryKey> = before
        .variables
        .keys()
        .chain(after.variables.keys())
        .map(|k| EntryKey::variable(k.clone()))
        .collect();
    for env in [before, after] {
        for (inheriting, overrides) in &env.inheritance_overrides {
            keys.extend(overrides.keys().map(|k| EntryKey {
                key: k.clone(),
                inheriting_environment_id: Some(inheriting.clone()),
            }));
        }
    }
    keys.into_iter()
        .filter_map(|key| {
            let value = entry_value(after, &key);
            (entry_value(before, &key) != value).then_some((key, value))
        })
        .collect()
}

/// Add `edit` of `environment_id` to `pending`, returning the new list.
///
/// `committed` maps each environment with pending updates (including
/// `environment_id`) to its last committed content.
///
/// Superseded updates are dropped, and the forward patch of every update
/// kept for `environment_id` is rebuilt against the state the updates
/// before it now produce.
pub fn add_pending(
    pending: &[PendingEnvUpdate],
    committed: &BTreeMap<EnvironmentId, EnvWithMeta>,
    environment_id: &EnvironmentId,
    edit: EnvEdit,
    now: u64,
) -> Result<Vec<PendingEnvUpdate>> {
    let base = committed.get(environment_id).cloned().unwrap_or_default();
    let new_keys: BTreeSet<EntryKey> = [edit.entry_key()].into_iter().collect();

    let mut current = base.clone();
    let mut effects = Vec::with_capacity(pending.len());
    for update in pending {
        if &update.meta.environment_id != environment_id {
            effects.push(Vec::new());
            continue;
        }
        let next = from_doc(patch::apply(&to_doc(&current)?, &update.forward)?)?;
        effects.push(entry_changes(&current, &next));
        current = next;
    }
    let mut proposed = current.clone();
    edit.apply(&mut proposed)?;

    let mut kept: Vec<PendingEnvUpdate> = Vec::with_capacity(pending.len() + 1);
    let mut remaining = base;
    for (update, changes) in pending.iter().zip(effects) {
        if &update.meta.environment_id != environment_id {
            kept.push(update.clone());
            continue;
        }
        if update.kind != PendingKind::CreateEntry && update.meta.entry_keys.is_subset(&new_keys) {
            continue;
        }
        let mut next = remaining.clone();
        for (key, value) in changes {
            set_entry_value(&mut next, &key, value);
        }
        let forward = patch::diff(&to_doc(&remaining)?, &to_doc(&next)?);
        if forward.is_empty() {
            continue;
        }
        kept.push(PendingEnvUpdate {
            forward,
            ..update.clone()
        });
        remaining = next;
    }

    let kind = match &edit {
        EnvEdit::SetOverride { .. } => PendingKind::UpdateOverride,
        EnvEdit::Remove { .. } => PendingKind::RemoveEntry,
        EnvEdit::Set { key, .. } if remaining.variables.contains_key(key) => PendingKind::UpdateEntry,
        EnvEdit::Set { .. } => PendingKind::CreateEntry,
    };

    let forward = patch::diff(&to_doc(&remaining)?, &to_doc(&proposed)?);
    if !forward.is_empty() {
        kept.push(PendingEnvUpdate {
            kind,
            forward,
            reverse: Vec::new(),
            meta: PendingMeta {
                environment_id: environment_id.clone(),
                entry_keys: new_keys,
                pending_at: now,
            },
        });
    }

    normalize(kept, committed)
}

/// Drop environments whose pending updates cancel out, then recompute every
/// reverse patch by replaying forward patches from the committed state.
pub fn normalize(
    pending: Vec<PendingEnvUpdate>,
    committed: &BTreeMap<EnvironmentId, EnvWithMeta>,
) -> Result<Vec<PendingEnvUpdate>> {
    let mut docs: BTreeMap<EnvironmentId, Value> = BTreeMap::new();
    for environment_id in pending_environment_ids(&pending) {
        let base = committed.get(&environment_id).cloned().unwrap_or_default();
        docs.insert(environment_id, to_doc(&base)?);
    }

    let mut noop: BTreeSet<EnvironmentId> = BTreeSet::new();
    for (environment_id, base) in &docs {
        let mut doc = base.clone();
        for update in pending.iter().filter(|u| &u.meta.environment_id == environment_id) {
            doc = patch::apply(&doc, &update.forward)?;
        }
        if &doc == base {
            noop.insert(environment_id.clone());
        }
    }

    let mut out = Vec::with_capacity(pending.len());
    for mut update in pending {
        if noop.contains(&update.meta.environment_id) {
            continue;
        }
        let Some(before) = docs.get_mut(&update.meta.environment_id) else {
            continue;
        };
        let after = patch::apply(before, &update.forward)?;
        update.reverse = patch::diff(&after, before);
        *before = after;
        out.push(update);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn env_id() -> EnvironmentId {
        EnvironmentId::new("dev")
    }

    fn committed(vars: &[(&str, &str)]) -> BTreeMap<EnvironmentId, EnvWithMeta> {
        let mut env = EnvWithMeta::default();
        for (k, v) in vars {
            env.variables.insert(k.to_string(), EnvEntry::value(*v));
        }
        [(env_id(), env)].into_iter().collect()
    }

    fn set(key: &str, val: &str) -> EnvEdit {
        EnvEdit::Set {
            key: key.into(),
            entry: EnvEntry::value(val),
        }
    }

    fn view(pending: &[PendingEnvUpdate], base: &BTreeMap<EnvironmentId, EnvWithMeta>) -> EnvWithMeta {
        apply_pending(&base[&env_id()], &env_id(), pending).unwrap()
    }

    #[test]
    fn test_create_then_update_keeps_create() {
        let base = committed(&[]);
        let p = add_pending(&[], &base, &env_id(), set("A", "1"), 1).unwrap();
        let p = add_pending(&p, &base, &env_id(), set("A", "2"), 2).unwrap();

        assert_eq!(p.len(), 2);
        assert_eq!(p[0].kind, PendingKind::CreateEntry);
        assert_eq!(p[1].kind, PendingKind::UpdateEntry);
        assert_eq!(view(&p, &base).variables["A"].val.as_deref(), Some("2"));
    }

    #[test]
    fn test_update_supersedes_earlier_update() {
        let base = committed(&[("A", "0")]);
        let p = add_pending(&[], &base, &env_id(), set("A", "1"), 1).unwrap();
        let p = add_pending(&p, &base, &env_id(), set("A", "2"), 2).unwrap();

        assert_eq!(p.len(), 1);
        assert_eq!(p[0].kind, PendingKind::UpdateEntry);
        assert_eq!(view(&p, &base).variables["A"].val.as_deref(), Some("2"));

        let expected = committed(&[("A", "2")]);
        assert_eq!(
            p[0].forward,
            patch::diff(
                &serde_json::to_value(&base[&env_id()]).unwrap(),
                &serde_json::to_value(&expected[&env_id()]).unwrap()
            )
        );
    }

    fn set_override(inheriting: &str, key: &str, val: Option<&str>) -> EnvEdit {
        EnvEdit::SetOverride {
            inheriting_environment_id: EnvironmentId::new(inheriting),
            key: key.into(),
            entry: val.map(EnvEntry::value),
        }
    }

    #[test]
    fn test_clearing_first_override_keeps_later_override() {
        let base = committed(&[("A", "0"), ("B", "0")]);
        let p = add_pending(&[], &base, &env_id(), set_override("x", "A", Some("o")), 1).unwrap();
        let p = add_pending(&p, &base, &env_id(), set_override("x", "B", Some("q")), 2).unwrap();
        let p = add_pending(&p, &base, &env_id(), set_override("x", "A", None), 3).unwrap();

        let x = EnvironmentId::new("x");
        let env = view(&p, &base);
        assert_eq!(env.inheritance_overrides[&x].len(), 1);
        assert_eq!(env.inheritance_overrides[&x]["B"].val.as_deref(), Some("q"));
        assert!(p.iter().all(|u| !u.forward.is_empty()));

        let p = add_pending(&p, &base, &env_id(), set_override("x", "B", None), 4).unwrap();
        assert!(p.is_empty());
    }

    #[test]
    fn test_kept_updates_rebuild_their_patches() {
        let base = committed(&[("A", "0")]);
        let p = add_pending(&[], &base, &env_id(), set_override("x", "A", Some("o")), 1).unwrap();
        let p = add_pending(&p, &base, &env_id(), set("B", "1"), 2).unwrap();
        let p = add_pending(&p, &base, &env_id(), set_override("x", "A", Some("p")), 3).unwrap();

        assert_eq!(p.len(), 2);
        assert_eq!(p[0].kind, PendingKind::CreateEntry);
        // Replaying from the committed state must not depend on the dropped update.
        let mut doc = serde_json::to_value(&base[&env_id()]).unwrap();
        for update in &p {
            doc = patch::apply(&doc, &update.forward).unwrap();
        }
        let env: EnvWithMeta = serde_json::from_value(doc).unwrap();
        assert_eq!(env.inheritance_overrides[&EnvironmentId::new("x")]["A"].val.as_deref(), Some("p"));
        assert_eq!(env.variables["B"].val.as_deref(), Some("1"));
    }

    #[test]
    fn test_reverting_to_committed_value_clears_pending() {
        let base = committed(&[("A", "0")]);
        let p = add_pending(&[], &base, &env_id(), set("A", "1"), 1).unwrap();
        let p = add_pending(&p, &base, &env_id(), set("A", "0"), 2).unwrap();
        assert!(p.is_empty());
    }

    #[test]
    fn test_create_then_remove_is_noop() {
        let base = committed(&[]);
        let p = add_pending(&[], &base, &env_id(), set("A", "1"), 1).unwrap();
        let p = add_pending(&p, &base, &env_id(), EnvEdit::Remove { key: "A".into() }, 2).unwrap();
        assert!(p.is_empty());
    }

    #[test]
    fn test_remove_missing_key_fails() {
        let base = committed(&[]);
        let err = add_pending(&[], &base, &env_id(), EnvEdit::Remove { key: "A".into() }, 1);
        assert!(matches!(err, Err(ClientError::InvalidOperation(_))));
    }

    #[test]
    fn test_override_is_tracked_separately() {
        let base = committed(&[("A", "0")]);
        let staging = EnvironmentId::new("staging");
        let p = add_pending(&[], &base, &env_id(), set("A", "1"), 1).unwrap();
        let p = add_pending(
            &p,
            &base,
            &env_id(),
            EnvEdit::SetOverride {
                inheriting_environment_id: staging.clone(),
                key: "A".into(),
                entry: Some(EnvEntry::value("o")),
            },
            2,
        )
        .unwrap();

        assert_eq!(p.len(), 2);
        assert_eq!(p[1].kind, PendingKind::UpdateOverride);
        let env = view(&p, &base);
        assert_eq!(env.inheritance_overrides[&staging]["A"].val.as_deref(), Some("o"));
    }

    #[test]
    fn test_reverse_patches_undo_in_order() {
        let base = committed(&[("A", "0")]);
        let p = add_pending(&[], &base, &env_id(), set("B", "1"), 1).unwrap();
        let p = add_pending(&p, &base, &env_id(), set("A", "2"), 2).unwrap();

        let mut doc = serde_json::to_value(view(&p, &base)).unwrap();
        for update in p.iter().rev() {
            doc = patch::apply(&doc, &update.reverse).unwrap();
        }
        assert_eq!(doc, serde_json::to_value(&base[&env_id()]).unwrap());
    }

    fn edit_strategy() -> impl Strategy<Value = EnvEdit> {
        let key = prop::sample::select(vec!["A", "B", "C"]);
        let val = prop::sample::select(vec!["0", "1", "2"]);
        let inheriting = prop::sample::select(vec!["x", "y"]);
        prop_oneof![
            (key.clone(), val.clone()).prop_map(|(k, v)| set(k, v)),
            key.clone().prop_map(|k| EnvEdit::Remove { key: k.into() }),
            (inheriting, key, proptest::option::of(val))
                .prop_map(|(i, k, v)| set_override(i, k, v)),
        ]
    }

    proptest! {
        #[test]
        fn prop_pending_view_matches_direct_application(edits in prop::collection::vec(edit_strategy(), 0..12)) {
            let base = committed(&[("A", "0")]);
            let mut expected = base[&env_id()].clone();
            let mut pending = Vec::new();

            for (i, edit) in edits.into_iter().enumerate() {
                let mut next = expected.clone();
                if edit.apply(&mut next).is_err() {
                    continue;
                }
                pending = add_pending(&pending, &base, &env_id(), edit, i as u64).unwrap();
                expected = next;
            }

            prop_assert_eq!(view(&pending, &base), expected.clone());
            if expected == base[&env_id()] {
                prop_assert!(pending.is_empty());
            }
            for update in &pending {
                prop_assert!(!update.forward.is_empty());
            }
        }
    }
}
