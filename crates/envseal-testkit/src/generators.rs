//! Proptest generators for property-based testing.

use proptest::prelude::*;

use envseal::EnvEdit;
use envseal_core::{EnvironmentId, Keypair};
use envseal_graph::EnvEntry;

/// Generate a random keypair.
pub fn keypair() -> impl Strategy<Value = Keypair> {
    any::<[u8; 32]>().prop_map(|seed| Keypair::from_seed(&seed))
}

/// Generate a variable name from a small pool, so edits collide.
pub fn env_key() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("API_KEY".to_string()),
        Just("DATABASE_URL".to_string()),
        Just("PORT".to_string()),
        "[A-Z][A-Z0-9_]{0,7}".prop_map(String::from),
    ]
}

/// Generate a literal value or an inheritance reference.
pub fn env_entry() -> impl Strategy<Value = EnvEntry> {
    prop_oneof![
        4 => "[ -~]{0,24}".prop_map(EnvEntry::value),
        1 => Just(EnvEntry::inherits(&EnvironmentId::new("app-staging"))),
    ]
}

/// Generate a single edit.
pub fn env_edit() -> impl Strategy<Value = EnvEdit> {
    prop_oneof![
        4 => (env_key(), env_entry()).prop_map(|(key, entry)| EnvEdit::Set { key, entry }),
        2 => env_key().prop_map(|key| EnvEdit::Remove { key }),
        1 => (env_key(), proptest::option::of(env_entry())).prop_map(|(key, entry)| {
            EnvEdit::SetOverride {
                inheriting_environment_id: EnvironmentId::new("app-prod-sub"),
                key,
                entry,
            }
        }),
    ]
}

/// Generate up to `max` edits.
pub fn env_edits(max: usize) -> impl Strategy<Value = Vec<EnvEdit>> {
    prop::collection::vec(env_edit(), 0..=max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use envseal::pending::{add_pending, apply_pending};
    use envseal_graph::EnvWithMeta;

    fn model_apply(env: &mut EnvWithMeta, edit: &EnvEdit) -> bool {
        match edit {
            EnvEdit::Set { key, entry } => {
                env.variables.insert(key.clone(), entry.clone());
            }
            EnvEdit::Remove { key } => {
                if env.variables.remove(key).is_none() {
                    return false;
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
                    }
                    env.inheritance_overrides.retain(|_, o| !o.is_empty());
                }
            },
        }
        true
    }

    proptest! {
        #[test]
        fn prop_pending_edits_match_direct_application(edits in env_edits(12)) {
            let environment_id = EnvironmentId::new("app-dev");
            let committed: BTreeMap<EnvironmentId, EnvWithMeta> =
                [(environment_id.clone(), EnvWithMeta::default())].into_iter().collect();

            let mut expected = EnvWithMeta::default();
            let mut pending = Vec::new();
            for (i, edit) in edits.into_iter().enumerate() {
                if !model_apply(&mut expected, &edit) {
                    prop_assert!(add_pending(&pending, &committed, &environment_id, edit, i as u64).is_err());
                    continue;
                }
                pending = add_pending(&pending, &committed, &environment_id, edit, i as u64).unwrap();
            }

            let actual = apply_pending(&EnvWithMeta::default(), &environment_id, &pending).unwrap();
            prop_assert_eq!(&actual, &expected);
            if expected == EnvWithMeta::default() {
                prop_assert!(pending.is_empty());
            }
        }

        #[test]
        fn prop_seeded_keypairs_are_stable(seed in any::<[u8; 32]>()) {
            let a = Keypair::from_seed(&seed);
            let b = Keypair::from_seed(&seed);
            prop_assert_eq!(a.pubkey, b.pubkey);
        }
    }
}
