//! Encrypting symmetric keys for every recipient a key set names.
//!
//! Two flows share the machinery here:
//!
//! - [`Encryptor::encrypted_key_params_for_environments`] writes content.
//!   Every written composite gets a fresh key (unless `new_keys_only`
//!   leaves existing composites alone), a new blob, and that key encrypted
//!   for each entitled recipient.
//! - [`Encryptor::encrypted_key_params_for_key_set`] grants access. It
//!   encrypts keys this device already holds for the recipients in a key
//!   set and writes no blobs.
//!
//! Every recipient pubkey is verified before anything is encrypted to it.

use futures::future::try_join_all;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use envseal_core::{
    CryptoProvider, EnvParentId, EnvironmentId, KeyableId, SymmetricKey, TrustedPubkey,
};
use envseal_graph::{
    current_key_set, required_envs_for_key_set, Composite, EnvPart, EnvironmentKeys, GraphError,
    KeySet, KeySetScope, KeyableParentKeys, KeyableParentTargets, OrgGraph, PermissionOracle,
};
use envseal_sync::{
    ChangesetParams, EncryptedChangesetBlob, EnvParams, EnvTarget, EnvironmentSlot,
    KeyPath, KeyableParentSlot,
};

use crate::context::ClientContext;
use crate::error::{ClientError, Result};
use crate::pending::Changeset;
use crate::state::{CachedChangesets, CachedEnv, ClientState};
use crate::trust;

/// One key to encrypt: where it goes and which composite it opens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyJob {
    pub path: KeyPath,
    pub composite: Composite,
}

impl KeyJob {
    pub fn recipient_id(&self) -> &KeyableId {
        self.path.recipient_id()
    }
}

fn environment_slots(keys: &EnvironmentKeys, environment_id: &EnvironmentId) -> Vec<(EnvironmentSlot, Composite)> {
    let mut out = Vec::new();
    if keys.env {
        out.push((EnvironmentSlot::Env, Composite::env(environment_id)));
    }
    if keys.meta {
        out.push((EnvironmentSlot::Meta, Composite::meta(environment_id)));
    }
    if keys.inherits {
        out.push((EnvironmentSlot::Inherits, Composite::inherits(environment_id)));
    }
    if keys.changesets {
        out.push((EnvironmentSlot::Changesets, Composite::changesets(environment_id)));
    }
    for source in &keys.inheritance_overrides {
        out.push((
            EnvironmentSlot::InheritanceOverride(source.clone()),
            Composite::inheritance_override(environment_id, source),
        ));
    }
    out
}

fn keyable_parent_slots(
    keys: &KeyableParentKeys,
    targets: &KeyableParentTargets,
) -> Vec<(KeyableParentSlot, Composite)> {
    let mut out = Vec::new();
    if keys.env {
        out.push((KeyableParentSlot::Env, Composite::env(&targets.env)));
    }
    if let (true, Some(sub)) = (keys.sub_env, &targets.sub_env) {
        out.push((KeyableParentSlot::SubEnv, Composite::env(sub)));
    }
    if let (true, Some(locals)) = (keys.locals, &targets.locals) {
        out.push((KeyableParentSlot::Locals, Composite::env(locals)));
    }
    for source in &keys.inheritance_overrides {
        out.push((
            KeyableParentSlot::InheritanceOverride(source.clone()),
            Composite::inheritance_override(targets.override_target(), source),
        ));
    }
    out
}

/// Every key a key set calls for, with its wire path.
pub fn key_jobs(graph: &OrgGraph, key_set: &KeySet) -> Result<Vec<KeyJob>> {
    let mut jobs = Vec::new();

    for (user_id, devices) in &key_set.users {
        for (device_id, env_parents) in devices {
            for (env_parent_id, keys) in env_parents {
                let targets = keys
                    .environments
                    .iter()
                    .map(|(id, k)| (EnvTarget::Environment(id.clone()), id.clone(), k))
                    .chain(keys.locals.iter().map(|(owner, k)| {
                        (
                            EnvTarget::Locals(owner.clone()),
                            EnvironmentId::locals(env_parent_id, owner),
                            k,
                        )
                    }));
                for (target, environment_id, k) in targets {
                    for (slot, composite) in environment_slots(k, &environment_id) {
                        jobs.push(KeyJob {
                            path: KeyPath::User {
                                user_id: user_id.clone(),
                                device_id: device_id.clone(),
                                env_parent_id: env_parent_id.clone(),
                                target: target.clone(),
                                slot,
                            },
                            composite,
                        });
                    }
                }
            }
        }
    }

    for (keyable_parent_id, envkeys) in &key_set.keyable_parents {
        let targets = KeyableParentTargets::resolve(graph, keyable_parent_id, None)?;
        for (generated_envkey_id, k) in envkeys {
            for (slot, composite) in keyable_parent_slots(k, &targets) {
                jobs.push(KeyJob {
                    path: KeyPath::KeyableParent {
                        keyable_parent_id: keyable_parent_id.clone(),
                        generated_envkey_id: generated_envkey_id.clone(),
                        slot,
                    },
                    composite,
                });
            }
        }
    }

    for (block_id, parents) in &key_set.block_keyable_parents {
        for (keyable_parent_id, envkeys) in parents {
            let targets = KeyableParentTargets::resolve(graph, keyable_parent_id, Some(block_id))?;
            for (generated_envkey_id, k) in envkeys {
                for (slot, composite) in keyable_parent_slots(k, &targets) {
                    jobs.push(KeyJob {
                        path: KeyPath::BlockKeyableParent {
                            block_id: block_id.clone(),
                            keyable_parent_id: keyable_parent_id.clone(),
                            generated_envkey_id: generated_envkey_id.clone(),
                            slot,
                        },
                        composite,
                    });
                }
            }
        }
    }

    Ok(jobs)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncryptOptions {
    /// Encrypt committed content with pending edits applied.
    pub pending: bool,
    /// Only key composites that have no key yet.
    pub new_keys_only: bool,
    /// Rotate the changesets key and re-encrypt the changeset history.
    pub reencrypt_changesets: bool,
}

/// Params ready to send, plus what to cache once the server accepts them.
#[derive(Debug, Clone)]
pub struct EncryptedEnvs {
    pub env_params: EnvParams,
    pub envs: BTreeMap<Composite, CachedEnv>,
    pub changesets: BTreeMap<Composite, CachedChangesets>,
    /// Changesets key per environment, fresh or reused.
    pub changeset_keys: BTreeMap<EnvironmentId, SymmetricKey>,
    pub newly_trusted: Vec<(KeyableId, TrustedPubkey)>,
}

/// Encrypts on behalf of `ctx` against a state snapshot.
#[derive(Clone, Copy)]
pub struct Encryptor<'a> {
    pub state: &'a ClientState,
    pub graph: &'a OrgGraph,
    pub crypto: &'a dyn CryptoProvider,
    pub oracle: &'a dyn PermissionOracle,
    pub ctx: &'a ClientContext,
    pub now: u64,
}

impl<'a> Encryptor<'a> {
    fn env_parent_of(&self, environment_id: &EnvironmentId) -> Result<EnvParentId> {
        self.graph
            .env_parent_of(environment_id)
            .ok_or_else(|| GraphError::UnknownEnvironment(environment_id.clone()).into())
    }

    /// Composites this device is entitled to within `env_parent_ids`.
    fn own_composites(&self, jobs: &[KeyJob]) -> BTreeSet<Composite> {
        jobs.iter()
            .filter(|job| job.recipient_id() == &self.ctx.device_id)
            .map(|job| job.composite.clone())
            .collect()
    }

    fn require_fetched(&self, env_parent_ids: &BTreeSet<EnvParentId>, changesets: &BTreeSet<EnvParentId>) -> Result<()> {
        let missing: Vec<String> = env_parent_ids
            .iter()
            .filter(|id| !self.state.envs_fetched_at.contains_key(*id))
            .chain(
                changesets
                    .iter()
                    .filter(|id| !self.state.changesets_fetched_at.contains_key(*id)),
            )
            .map(ToString::to_string)
            .collect();
        if !missing.is_empty() {
            return Err(ClientError::TransientFetch(missing.join(", ")));
        }
        Ok(())
    }

    /// Verify every recipient, then encrypt each job's key to it.
    async fn encrypt_jobs(&self, keyed: &[(KeyJob, SymmetricKey)]) -> Result<(EnvParams, Vec<(KeyableId, TrustedPubkey)>)> {
        let recipients: BTreeSet<&KeyableId> = keyed.iter().map(|(job, _)| job.recipient_id()).collect();
        let newly_trusted = trust::verify_org_keyables(
            self.graph,
            &self.state.trusted_root,
            &self.state.trusted_session_pubkeys,
            self.crypto,
            recipients.iter().copied(),
        )
        .await?;

        let encrypted = try_join_all(keyed.iter().map(|(job, key)| async move {
            let pubkey = self.graph.keyable_pubkey(job.recipient_id()).ok_or_else(|| {
                ClientError::Integrity(format!("recipient {} has no pubkey", job.recipient_id()))
            })?;
            let data = self
                .crypto
                .encrypt(pubkey, &self.ctx.privkey, key.as_bytes())
                .await?;
            Ok::<_, ClientError>(data)
        }))
        .await?;

        let mut params = EnvParams::new(self.ctx.device_id.clone());
        for ((job, _), data) in keyed.iter().zip(encrypted) {
            params.keys.insert(&job.path, data);
        }
        debug!(
            keys = keyed.len(),
            recipients = recipients.len(),
            "encrypted keys"
        );
        Ok((params, newly_trusted))
    }

    async fn seal_changesets(
        &self,
        changesets: &[Changeset],
        key: &SymmetricKey,
    ) -> Result<Vec<EncryptedChangesetBlob>> {
        let mut out = Vec::with_capacity(changesets.len());
        for changeset in changesets {
            out.push(seal_changeset(self.crypto, changeset, key).await?);
        }
        Ok(out)
    }

    /// Re-key and re-encrypt content of `environment_ids`.
    pub async fn encrypted_key_params_for_environments(
        &self,
        environment_ids: &BTreeSet<EnvironmentId>,
        opts: EncryptOptions,
    ) -> Result<EncryptedEnvs> {
        let mut env_parent_ids = BTreeSet::new();
        for id in environment_ids {
            env_parent_ids.insert(self.env_parent_of(id)?);
        }
        let changesets_required = if opts.reencrypt_changesets {
            env_parent_ids.clone()
        } else {
            BTreeSet::new()
        };
        self.require_fetched(&env_parent_ids, &changesets_required)?;

        let key_set = current_key_set(
            self.graph,
            self.oracle,
            self.now,
            &KeySetScope::env_parents(env_parent_ids.iter().cloned()),
        );
        let jobs = key_jobs(self.graph, &key_set)?;
        let own = self.own_composites(&jobs);

        let mut fresh: BTreeMap<Composite, (SymmetricKey, Value)> = BTreeMap::new();
        let mut changeset_keys: BTreeMap<EnvironmentId, SymmetricKey> = BTreeMap::new();
        let mut fresh_changesets: BTreeSet<EnvironmentId> = BTreeSet::new();

        for environment_id in environment_ids {
            let doc = if opts.pending {
                self.state.env_with_pending(environment_id)?
            } else {
                self.state.committed_env(environment_id)?
            };

            let mut parts: Vec<(Composite, Value)> = Vec::new();
            if own.contains(&Composite::env(environment_id)) {
                parts.push((Composite::env(environment_id), doc.env_part()?));
                parts.push((Composite::meta(environment_id), doc.meta_part()?));
                if !environment_id.is_locals() {
                    parts.push((Composite::inherits(environment_id), doc.inherits_part()?));
                }
            }
            let is_sub = self
                .graph
                .environments
                .get(environment_id)
                .map_or(false, |e| e.is_sub);
            if !environment_id.is_locals() && !is_sub {
                for inheriting_id in self.graph.inheriting_environments(environment_id) {
                    let composite = Composite::inheritance_override(&inheriting_id, environment_id);
                    if own.contains(&composite) {
                        parts.push((composite, doc.override_part(&inheriting_id)?));
                    }
                }
            }

            for (composite, value) in parts {
                if opts.new_keys_only && self.state.envs.contains_key(&composite) {
                    continue;
                }
                let key = self.crypto.generate_symmetric_key().await?;
                fresh.insert(composite, (key, value));
            }

            let changesets_composite = Composite::changesets(environment_id);
            if own.contains(&changesets_composite) {
                match self.state.changesets.get(&changesets_composite) {
                    Some(cached) if !opts.reencrypt_changesets || opts.new_keys_only => {
                        changeset_keys.insert(environment_id.clone(), cached.key.clone());
                    }
                    _ => {
                        let env_parent_id = self.env_parent_of(environment_id)?;
                        if !self.state.changesets_fetched_at.contains_key(&env_parent_id) {
                            return Err(ClientError::TransientFetch(format!(
                                "changesets of {} not fetched",
                                env_parent_id
                            )));
                        }
                        let key = self.crypto.generate_symmetric_key().await?;
                        changeset_keys.insert(environment_id.clone(), key);
                        fresh_changesets.insert(environment_id.clone());
                    }
                }
            }
        }

        let keyed: Vec<(KeyJob, SymmetricKey)> = jobs
            .into_iter()
            .filter_map(|job| {
                let key = if job.composite.part == EnvPart::Changesets {
                    let id = &job.composite.environment_id;
                    fresh_changesets
                        .contains(id)
                        .then(|| changeset_keys.get(id).cloned())
                        .flatten()
                } else {
                    fresh.get(&job.composite).map(|(key, _)| key.clone())
                };
                key.map(|key| (job, key))
            })
            .collect();
        let (mut env_params, newly_trusted) = self.encrypt_jobs(&keyed).await?;

        let sealed = try_join_all(fresh.iter().map(|(composite, (key, value))| async move {
            let plain = serde_json::to_vec(value)?;
            let blob = self.crypto.encrypt_with_key(&plain, key).await?;
            Ok::<_, ClientError>((composite.clone(), blob))
        }))
        .await?;
        env_params.blobs = sealed.into_iter().collect();

        let mut envs = BTreeMap::new();
        for (composite, (key, value)) in fresh {
            envs.insert(
                composite.clone(),
                CachedEnv {
                    env_parent_id: self.env_parent_of(&composite.environment_id)?,
                    key,
                    value,
                },
            );
        }

        let mut changesets = BTreeMap::new();
        for environment_id in &fresh_changesets {
            let Some(key) = changeset_keys.get(environment_id) else {
                continue;
            };
            let history = self.state.changesets_for(environment_id);
            let blobs = self.seal_changesets(&history, key).await?;
            env_params.changesets.insert(
                environment_id.clone(),
                ChangesetParams {
                    blobs,
                    replace: true,
                },
            );
            changesets.insert(
                Composite::changesets(environment_id),
                CachedChangesets {
                    env_parent_id: self.env_parent_of(environment_id)?,
                    key: key.clone(),
                    changesets: history,
                },
            );
        }

        debug!(
            environments = environment_ids.len(),
            blobs = env_params.blobs.len(),
            rotated_changesets = fresh_changesets.len(),
            "encrypted environments"
        );
        Ok(EncryptedEnvs {
            env_params,
            envs,
            changesets,
            changeset_keys,
            newly_trusted,
        })
    }

    /// Encrypt held keys for every recipient in `key_set`.
    ///
    /// A composite this device is entitled to but has no key for has never
    /// been written and is skipped. Any other missing key means the grant
    /// asks for access this device does not have.
    pub async fn encrypted_key_params_for_key_set(&self, key_set: &KeySet) -> Result<EncryptedEnvs> {
        let required = required_envs_for_key_set(self.graph, key_set);
        self.require_fetched(&required.envs, &required.changesets)?;

        let own_set = current_key_set(
            self.graph,
            self.oracle,
            self.now,
            &KeySetScope::users([self.ctx.user_id.clone()]),
        );
        let own = self.own_composites(&key_jobs(self.graph, &own_set)?);

        let mut keyed = Vec::new();
        for job in key_jobs(self.graph, key_set)? {
            let held = if job.composite.part == EnvPart::Changesets {
                self.state.changesets.get(&job.composite).map(|c| c.key.clone())
            } else {
                self.state.envs.get(&job.composite).map(|c| c.key.clone())
            };
            match held {
                Some(key) => keyed.push((job, key)),
                None if own.contains(&job.composite) => {
                    debug!(composite = %job.composite, "skipping composite with no content yet");
                }
                None => {
                    return Err(ClientError::Integrity(format!(
                        "cannot grant {} to {}: key not held",
                        job.composite,
                        job.recipient_id()
                    )))
                }
            }
        }

        let (env_params, newly_trusted) = self.encrypt_jobs(&keyed).await?;
        Ok(EncryptedEnvs {
            env_params,
            envs: BTreeMap::new(),
            changesets: BTreeMap::new(),
            changeset_keys: BTreeMap::new(),
            newly_trusted,
        })
    }
}

/// Encrypt one changeset's actions under `key`.
pub async fn seal_changeset(
    crypto: &dyn CryptoProvider,
    changeset: &Changeset,
    key: &SymmetricKey,
) -> Result<EncryptedChangesetBlob> {
    let plain = serde_json::to_vec(&changeset.actions)?;
    Ok(EncryptedChangesetBlob {
        id: changeset.id.clone(),
        created_at: changeset.created_at,
        created_by_id: changeset.created_by_id.clone(),
        blob: crypto.encrypt_with_key(&plain, key).await?,
    })
}
