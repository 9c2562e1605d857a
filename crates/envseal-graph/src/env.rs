//! Env content and the composite key scheme.
//!
//! Every environment's content is split into parts that are encrypted under
//! separate symmetric keys, so a user can be given the key list (`meta`)
//! without the values (`env`). A [`Composite`] names one such key and its
//! matching blob.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use envseal_core::EnvironmentId;

use crate::error::{GraphError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EnvPart {
    Env,
    Meta,
    Inherits,
    Changesets,
}

impl EnvPart {
    pub fn as_str(self) -> &'static str {
        match self {
            EnvPart::Env => "env",
            EnvPart::Meta => "meta",
            EnvPart::Inherits => "inherits",
            EnvPart::Changesets => "changesets",
        }
    }
}

/// Identifies one symmetric key and the blob it seals.
///
/// An inheritance override is `(inheriting environment, Env, Some(source))`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Composite {
    pub environment_id: EnvironmentId,
    pub part: EnvPart,
    pub inherits_environment_id: Option<EnvironmentId>,
}

impl Composite {
    pub fn new(environment_id: EnvironmentId, part: EnvPart) -> Self {
        Self {
            environment_id,
            part,
            inherits_environment_id: None,
        }
    }

    pub fn env(environment_id: &EnvironmentId) -> Self {
        Self::new(environment_id.clone(), EnvPart::Env)
    }

    pub fn meta(environment_id: &EnvironmentId) -> Self {
        Self::new(environment_id.clone(), EnvPart::Meta)
    }

    pub fn inherits(environment_id: &EnvironmentId) -> Self {
        Self::new(environment_id.clone(), EnvPart::Inherits)
    }

    pub fn changesets(environment_id: &EnvironmentId) -> Self {
        Self::new(environment_id.clone(), EnvPart::Changesets)
    }

    /// Override values `inheriting_id` sees for keys inherited from `source_id`.
    pub fn inheritance_override(inheriting_id: &EnvironmentId, source_id: &EnvironmentId) -> Self {
        Self {
            environment_id: inheriting_id.clone(),
            part: EnvPart::Env,
            inherits_environment_id: Some(source_id.clone()),
        }
    }

    /// The environment whose content this composite seals.
    ///
    /// For overrides that is the source environment.
    pub fn owner_environment_id(&self) -> &EnvironmentId {
        self.inherits_environment_id
            .as_ref()
            .unwrap_or(&self.environment_id)
    }
}

impl fmt::Display for Composite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.part.as_str(), self.environment_id)?;
        if let Some(source) = &self.inherits_environment_id {
            write!(f, ":{}", source)?;
        }
        Ok(())
    }
}

impl FromStr for Composite {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, ':');
        let part = match parts.next() {
            Some("env") => EnvPart::Env,
            Some("meta") => EnvPart::Meta,
            Some("inherits") => EnvPart::Inherits,
            Some("changesets") => EnvPart::Changesets,
            _ => return Err(GraphError::MalformedComposite(s.to_string())),
        };
        let environment_id = match parts.next() {
            Some(id) if !id.is_empty() => EnvironmentId::new(id),
            _ => return Err(GraphError::MalformedComposite(s.to_string())),
        };
        let inherits_environment_id = parts.next().map(EnvironmentId::new);
        if inherits_environment_id.is_some() && part != EnvPart::Env {
            return Err(GraphError::MalformedComposite(s.to_string()));
        }
        Ok(Self {
            environment_id,
            part,
            inherits_environment_id,
        })
    }
}

impl Serialize for Composite {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Composite {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// One variable in an environment.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub val: Option<String>,
    /// Take the value from this environment instead.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inherits_environment_id: Option<EnvironmentId>,
}

impl EnvEntry {
    pub fn value(val: impl Into<String>) -> Self {
        Self {
            val: Some(val.into()),
            inherits_environment_id: None,
        }
    }

    pub fn inherits(source: &EnvironmentId) -> Self {
        Self {
            val: None,
            inherits_environment_id: Some(source.clone()),
        }
    }
}

/// Key list without values.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvMetaEntry {
    pub is_set: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inherits_environment_id: Option<EnvironmentId>,
}

/// The full decrypted working form of one environment.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvWithMeta {
    #[serde(default)]
    pub variables: BTreeMap<String, EnvEntry>,
    /// Values inheriting environments see for keys they take from this one.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inheritance_overrides: BTreeMap<EnvironmentId, BTreeMap<String, EnvEntry>>,
}

impl EnvWithMeta {
    /// Plaintext of the `env` part.
    pub fn env_part(&self) -> Result<Value> {
        Ok(serde_json::to_value(&self.variables)?)
    }

    /// Plaintext of the `meta` part.
    pub fn meta_part(&self) -> Result<Value> {
        let meta: BTreeMap<&String, EnvMetaEntry> = self
            .variables
            .iter()
            .map(|(k, entry)| {
                (
                    k,
                    EnvMetaEntry {
                        is_set: entry.val.is_some() || entry.inherits_environment_id.is_some(),
                        inherits_environment_id: entry.inherits_environment_id.clone(),
                    },
                )
            })
            .collect();
        Ok(serde_json::to_value(meta)?)
    }

    /// Plaintext of the `inherits` part: source environment to inherited keys.
    pub fn inherits_part(&self) -> Result<Value> {
        let mut inherits: BTreeMap<&EnvironmentId, BTreeSet<&String>> = BTreeMap::new();
        for (k, entry) in &self.variables {
            if let Some(source) = &entry.inherits_environment_id {
                inherits.entry(source).or_default().insert(k);
            }
        }
        Ok(serde_json::to_value(inherits)?)
    }

    /// Plaintext of the override part for `inheriting_id`.
    pub fn override_part(&self, inheriting_id: &EnvironmentId) -> Result<Value> {
        let overrides = self
            .inheritance_overrides
            .get(inheriting_id)
            .cloned()
            .unwrap_or_default();
        Ok(serde_json::to_value(overrides)?)
    }

    /// Rebuild from decrypted parts. Prefers `env`; falls back to `meta`
    /// for users who only hold the key list.
    pub fn from_parts(
        env: Option<&Value>,
        meta: Option<&Value>,
        overrides: impl IntoIterator<Item = (EnvironmentId, Value)>,
    ) -> Result<Self> {
        let variables = match (env, meta) {
            (Some(env), _) => serde_json::from_value(env.clone())?,
            (None, Some(meta)) => {
                let meta: BTreeMap<String, EnvMetaEntry> = serde_json::from_value(meta.clone())?;
                meta.into_iter()
                    .map(|(k, m)| {
                        (
                            k,
                            EnvEntry {
                                val: None,
                                inherits_environment_id: m.inherits_environment_id,
                            },
                        )
                    })
                    .collect()
            }
            (None, None) => BTreeMap::new(),
        };
        let mut inheritance_overrides = BTreeMap::new();
        for (inheriting_id, value) in overrides {
            let entries: BTreeMap<String, EnvEntry> = serde_json::from_value(value)?;
            if !entries.is_empty() {
                inheritance_overrides.insert(inheriting_id, entries);
            }
        }
        Ok(Self {
            variables,
            inheritance_overrides,
        })
    }

    /// Keys touched anywhere in this environment.
    pub fn entry_keys(&self) -> BTreeSet<String> {
        let mut keys: BTreeSet<String> = self.variables.keys().cloned().collect();
        for overrides in self.inheritance_overrides.values() {
            keys.extend(overrides.keys().cloned());
        }
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composite_string_forms() {
        let e = EnvironmentId::new("prod");
        let s = EnvironmentId::new("staging");

        assert_eq!(Composite::env(&e).to_string(), "env:prod");
        assert_eq!(Composite::changesets(&e).to_string(), "changesets:prod");
        assert_eq!(Composite::inheritance_override(&e, &s).to_string(), "env:prod:staging");

        let parsed: Composite = "env:prod:staging".parse().unwrap();
        assert_eq!(parsed, Composite::inheritance_override(&e, &s));
        assert_eq!(parsed.owner_environment_id(), &s);
    }

    #[test]
    fn test_composite_rejects_garbage() {
        assert!("blob:prod".parse::<Composite>().is_err());
        assert!("env:".parse::<Composite>().is_err());
        assert!("meta:prod:staging".parse::<Composite>().is_err());
    }

    #[test]
    fn test_locals_composite_roundtrip() {
        let id = EnvironmentId::new("app|user");
        let c = Composite::meta(&id);
        assert_eq!(c.to_string().parse::<Composite>().unwrap(), c);
    }

    #[test]
    fn test_composite_as_json_map_key() {
        let mut map = BTreeMap::new();
        map.insert(Composite::env(&EnvironmentId::new("dev")), 1);
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"env:dev":1}"#);
        let back: BTreeMap<Composite, i32> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn test_meta_hides_values() {
        let mut env = EnvWithMeta::default();
        env.variables.insert("API_KEY".into(), EnvEntry::value("secret"));
        env.variables
            .insert("SHARED".into(), EnvEntry::inherits(&EnvironmentId::new("staging")));

        let meta = env.meta_part().unwrap();
        assert!(!meta.to_string().contains("secret"));

        let rebuilt = EnvWithMeta::from_parts(None, Some(&meta), std::iter::empty()).unwrap();
        assert_eq!(rebuilt.variables["API_KEY"].val, None);
        assert_eq!(
            rebuilt.variables["SHARED"].inherits_environment_id,
            Some(EnvironmentId::new("staging"))
        );
    }

    #[test]
    fn test_inherits_part_groups_by_source() {
        let staging = EnvironmentId::new("staging");
        let mut env = EnvWithMeta::default();
        env.variables.insert("A".into(), EnvEntry::inherits(&staging));
        env.variables.insert("B".into(), EnvEntry::inherits(&staging));
        env.variables.insert("C".into(), EnvEntry::value("c"));

        let inherits = env.inherits_part().unwrap();
        assert_eq!(inherits, serde_json::json!({"staging": ["A", "B"]}));
    }
}
