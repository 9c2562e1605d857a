//! Client state and its transitions.
//!
//! All mutation goes through [`ClientState::apply`]. The client holds the
//! state behind a single `RwLock`; readers clone what they need and work on
//! that snapshot, so long-running crypto never blocks other readers.

use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use envseal_core::{
    EnvParentId, EnvironmentId, KeyableId, SymmetricKey, TrustedPubkey, TrustedPubkeys,
};
use envseal_graph::{Composite, EnvPart, EnvWithMeta, OrgGraph};

use crate::error::Result;
use crate::pending::{self, Changeset, PendingEnvUpdate};

/// A decrypted blob and the key it was sealed with.
#[derive(Debug, Clone)]
pub struct CachedEnv {
    pub env_parent_id: EnvParentId,
    pub key: SymmetricKey,
    pub value: Value,
}

/// A decrypted changeset list and its key.
#[derive(Debug, Clone)]
pub struct CachedChangesets {
    pub env_parent_id: EnvParentId,
    pub key: SymmetricKey,
    pub changesets: Vec<Changeset>,
}

/// Decrypted envs (and optionally changesets) for a set of env parents, as
/// of one server fetch.
#[derive(Debug, Clone, Default)]
pub struct DecryptedEnvs {
    pub env_parent_ids: BTreeSet<EnvParentId>,
    pub fetched_at: u64,
    pub envs: BTreeMap<Composite, CachedEnv>,
    /// `None` when changesets were not requested.
    pub changesets: Option<BTreeMap<Composite, CachedChangesets>>,
}

#[derive(Debug, Clone, Default)]
pub struct ClientState {
    pub graph: Option<OrgGraph>,
    /// Persisted root trust, mirrored in memory.
    pub trusted_root: TrustedPubkeys,
    /// Pubkeys verified this session.
    pub trusted_session_pubkeys: TrustedPubkeys,
    pub envs: BTreeMap<Composite, CachedEnv>,
    pub changesets: BTreeMap<Composite, CachedChangesets>,
    pub envs_fetched_at: BTreeMap<EnvParentId, u64>,
    pub changesets_fetched_at: BTreeMap<EnvParentId, u64>,
    pub pending: Vec<PendingEnvUpdate>,
    /// Fetches and updates currently running, per env parent.
    pub in_flight: BTreeMap<EnvParentId, usize>,
    pub throttle_error: Option<String>,
}

/// A state transition.
#[derive(Debug, Clone)]
pub enum StateAction {
    SetGraph(Box<OrgGraph>),
    /// Forget the graph, session trust and every decrypted env.
    ResetToBaseline,
    SetTrustedRoot(TrustedPubkeys),
    ReplaceRoot {
        replacing_id: KeyableId,
        replacement_id: KeyableId,
        replacement: TrustedPubkey,
    },
    /// Add verified pubkeys, in the order they were verified.
    TrustSessionPubkeys(Vec<(KeyableId, TrustedPubkey)>),
    RemoveSessionPubkeys(BTreeSet<KeyableId>),
    /// Merge a fetch, skipping env parents already newer locally.
    MergeEnvs(Box<DecryptedEnvs>),
    /// Replace cache entries after a successful write.
    StoreEnvs {
        envs: BTreeMap<Composite, CachedEnv>,
        changesets: BTreeMap<Composite, CachedChangesets>,
    },
    SetPending(Vec<PendingEnvUpdate>),
    InFlightStarted(BTreeSet<EnvParentId>),
    InFlightFinished(BTreeSet<EnvParentId>),
    SetThrottleError(String),
    ClearThrottleError,
}

impl StateAction {
    fn name(&self) -> &'static str {
        match self {
            StateAction::SetGraph(_) => "set_graph",
            StateAction::ResetToBaseline => "reset_to_baseline",
            StateAction::SetTrustedRoot(_) => "set_trusted_root",
            StateAction::ReplaceRoot { .. } => "replace_root",
            StateAction::TrustSessionPubkeys(_) => "trust_session_pubkeys",
            StateAction::RemoveSessionPubkeys(_) => "remove_session_pubkeys",
            StateAction::MergeEnvs(_) => "merge_envs",
            StateAction::StoreEnvs { .. } => "store_envs",
            StateAction::SetPending(_) => "set_pending",
            StateAction::InFlightStarted(_) => "in_flight_started",
            StateAction::InFlightFinished(_) => "in_flight_finished",
            StateAction::SetThrottleError(_) => "set_throttle_error",
            StateAction::ClearThrottleError => "clear_throttle_error",
        }
    }
}

impl ClientState {
    pub fn apply(&mut self, action: StateAction) {
        debug!(action = action.name(), "applying state action");
        match action {
            StateAction::SetGraph(graph) => self.graph = Some(*graph),
            StateAction::ResetToBaseline => {
                self.graph = None;
                self.trusted_session_pubkeys.clear();
                self.envs.clear();
                self.changesets.clear();
                self.envs_fetched_at.clear();
                self.changesets_fetched_at.clear();
            }
            StateAction::SetTrustedRoot(root) => self.trusted_root = root,
            StateAction::ReplaceRoot {
                replacing_id,
                replacement_id,
                replacement,
            } => {
                self.trusted_root.remove(&replacing_id);
                self.trusted_root.insert(replacement_id, replacement);
            }
            StateAction::TrustSessionPubkeys(entries) => {
                self.trusted_session_pubkeys.extend(entries);
            }
            StateAction::RemoveSessionPubkeys(ids) => {
                self.trusted_session_pubkeys.retain(|id, _| !ids.contains(id));
            }
            StateAction::MergeEnvs(decrypted) => self.merge_envs(*decrypted),
            StateAction::StoreEnvs { envs, changesets } => {
                self.envs.extend(envs);
                self.changesets.extend(changesets);
            }
            StateAction::SetPending(pending) => self.pending = pending,
            StateAction::InFlightStarted(ids) => {
                for id in ids {
                    *self.in_flight.entry(id).or_default() += 1;
                }
            }
            StateAction::InFlightFinished(ids) => {
                for id in ids {
                    if let Some(count) = self.in_flight.get_mut(&id) {
                        *count = count.saturating_sub(1);
                        if *count == 0 {
                            self.in_flight.remove(&id);
                        }
                    }
                }
            }
            StateAction::SetThrottleError(msg) => self.throttle_error = Some(msg),
            StateAction::ClearThrottleError => self.throttle_error = None,
        }
    }

    fn merge_envs(&mut self, decrypted: DecryptedEnvs) {
        let fetched_at = decrypted.fetched_at;
        let fresh: BTreeSet<EnvParentId> = decrypted
            .env_parent_ids
            .iter()
            .filter(|id| self.envs_fetched_at.get(*id).map_or(true, |at| *at < fetched_at))
            .cloned()
            .collect();

        self.envs.retain(|_, cached| !fresh.contains(&cached.env_parent_id));
        self.envs.extend(
            decrypted
                .envs
                .into_iter()
                .filter(|(_, cached)| fresh.contains(&cached.env_parent_id)),
        );
        for id in &fresh {
            self.envs_fetched_at.insert(id.clone(), fetched_at);
        }

        if let Some(changesets) = decrypted.changesets {
            let fresh: BTreeSet<EnvParentId> = decrypted
                .env_parent_ids
                .iter()
                .filter(|id| {
                    self.changesets_fetched_at
                        .get(*id)
                        .map_or(true, |at| *at < fetched_at)
                })
                .cloned()
                .collect();
            self.changesets
                .retain(|_, cached| !fresh.contains(&cached.env_parent_id));
            self.changesets.extend(
                changesets
                    .into_iter()
                    .filter(|(_, cached)| fresh.contains(&cached.env_parent_id)),
            );
            for id in fresh {
                self.changesets_fetched_at.insert(id, fetched_at);
            }
        }
    }

    /// Whether either registry holds `keyable_id` with exactly these
    /// attributes.
    pub fn is_trusted(&self, keyable_id: &KeyableId, trusted: &TrustedPubkey) -> bool {
        self.trusted_root.get(keyable_id) == Some(trusted)
            || self.trusted_session_pubkeys.get(keyable_id) == Some(trusted)
    }

    pub fn in_flight_count(&self, env_parent_ids: &BTreeSet<EnvParentId>) -> usize {
        env_parent_ids
            .iter()
            .filter_map(|id| self.in_flight.get(id))
            .sum()
    }

    /// The cached plaintext of one composite.
    pub fn cached_value(&self, composite: &Composite) -> Option<&Value> {
        self.envs.get(composite).map(|cached| &cached.value)
    }

    /// Committed content of `environment_id`, rebuilt from cached parts.
    pub fn committed_env(&self, environment_id: &EnvironmentId) -> Result<EnvWithMeta> {
        let overrides = self
            .envs
            .iter()
            .filter(|(c, _)| {
                c.part == EnvPart::Env && c.inherits_environment_id.as_ref() == Some(environment_id)
            })
            .map(|(c, cached)| (c.environment_id.clone(), cached.value.clone()));
        Ok(EnvWithMeta::from_parts(
            self.cached_value(&Composite::env(environment_id)),
            self.cached_value(&Composite::meta(environment_id)),
            overrides,
        )?)
    }

    /// Committed content with pending edits applied.
    pub fn env_with_pending(&self, environment_id: &EnvironmentId) -> Result<EnvWithMeta> {
        let committed = self.committed_env(environment_id)?;
        pending::apply_pending(&committed, environment_id, &self.pending)
    }

    /// Committed content of every environment with pending edits.
    pub fn committed_for_pending(&self) -> Result<BTreeMap<EnvironmentId, EnvWithMeta>> {
        let mut out = BTreeMap::new();
        for id in pending::pending_environment_ids(&self.pending) {
            let env = self.committed_env(&id)?;
            out.insert(id, env);
        }
        Ok(out)
    }

    /// Decrypted changesets of `environment_id`.
    pub fn changesets_for(&self, environment_id: &EnvironmentId) -> Vec<Changeset> {
        self.changesets
            .get(&Composite::changesets(environment_id))
            .map(|cached| cached.changesets.clone())
            .unwrap_or_default()
    }
}
