//! Decrypting fetched envs and changesets.

use futures::future::try_join_all;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

use envseal_core::{
    CryptoProvider, KeyableId, Privkey, Pubkey, SymmetricKey, TrustedPubkey, TrustedPubkeys,
};
use envseal_graph::{Composite, EnvPart, KeyableRef, OrgGraph};
use envseal_sync::{EncryptedChangesetBlob, EncryptedKey, FetchEnvsResponse};

use crate::error::{ClientError, Result};
use crate::pending::{Changeset, PendingEnvUpdate};
use crate::state::{CachedChangesets, CachedEnv, DecryptedEnvs};
use crate::trust;

/// Decrypted envs plus the pubkeys verified on the way.
#[derive(Debug, Clone, Default)]
pub struct DecryptOutput {
    pub envs: DecryptedEnvs,
    pub newly_trusted: Vec<(KeyableId, TrustedPubkey)>,
}

/// Decrypts with `privkey`, trusting signers through the given registries.
#[derive(Clone, Copy)]
pub struct Decryptor<'a> {
    pub graph: &'a OrgGraph,
    pub trusted_root: &'a TrustedPubkeys,
    pub session: &'a TrustedPubkeys,
    pub crypto: &'a dyn CryptoProvider,
    pub privkey: &'a Privkey,
}

fn pairing_error(what: &str, unpaired: &BTreeSet<Composite>) -> ClientError {
    let list: Vec<String> = unpaired.iter().map(ToString::to_string).collect();
    ClientError::Integrity(format!("{} without a match: {}", what, list.join(", ")))
}

/// Require the two composite sets to be identical.
fn check_pairing(keys: &BTreeSet<Composite>, blobs: &BTreeSet<Composite>) -> Result<()> {
    let keys_only: BTreeSet<Composite> = keys.difference(blobs).cloned().collect();
    if !keys_only.is_empty() {
        return Err(pairing_error("keys", &keys_only));
    }
    let blobs_only: BTreeSet<Composite> = blobs.difference(keys).cloned().collect();
    if !blobs_only.is_empty() {
        return Err(pairing_error("blobs", &blobs_only));
    }
    Ok(())
}

impl<'a> Decryptor<'a> {
    /// Verify every signer and return their pubkeys.
    ///
    /// Signers removed from the graph are checked against the revoked
    /// entries so content they wrote stays readable until it is rotated.
    /// Those hops are never added to session trust.
    async fn verify_signers(
        &self,
        keys: &BTreeMap<Composite, EncryptedKey>,
    ) -> Result<(BTreeMap<KeyableId, Pubkey>, Vec<(KeyableId, TrustedPubkey)>)> {
        let signer_ids: BTreeSet<&KeyableId> = keys.values().map(|k| &k.encrypted_by_id).collect();
        let (current, revoked): (Vec<&KeyableId>, Vec<&KeyableId>) = signer_ids
            .into_iter()
            .partition(|id| self.graph.keyable(id).is_some());

        let newly_trusted = trust::verify_org_keyables(
            self.graph,
            self.trusted_root,
            self.session,
            self.crypto,
            current.iter().copied(),
        )
        .await?;

        let mut pubkeys = BTreeMap::new();
        for id in &current {
            pubkeys.insert((*id).clone(), signer_pubkey(self.graph, id)?);
        }

        if !revoked.is_empty() {
            let with_revoked = self.graph.with_revoked();
            let mut overlay = self.session.clone();
            overlay.extend(newly_trusted.iter().cloned());
            for id in &revoked {
                if !self.graph.revoked_devices.contains_key(*id) {
                    return Err(ClientError::Integrity(format!("signer {} is not in the graph", id)));
                }
                warn!(signer = %id, "decrypting keys signed by a revoked device");
                trust::verify_org_keyable(&with_revoked, self.trusted_root, &overlay, self.crypto, id)
                    .await?;
                pubkeys.insert((*id).clone(), signer_pubkey(&with_revoked, id)?);
            }
        }

        Ok((pubkeys, newly_trusted))
    }

    async fn open_key(
        &self,
        pubkeys: &BTreeMap<KeyableId, Pubkey>,
        key: &EncryptedKey,
    ) -> Result<SymmetricKey> {
        let signer = pubkeys.get(&key.encrypted_by_id).ok_or_else(|| {
            ClientError::Integrity(format!("signer {} was not verified", key.encrypted_by_id))
        })?;
        let raw = self.crypto.decrypt(signer, self.privkey, &key.data).await?;
        Ok(SymmetricKey::from_slice(&raw)?)
    }

    /// Decrypt a fetch response. Changesets are decrypted only when the
    /// response includes them.
    pub async fn decrypt_envs(&self, response: &FetchEnvsResponse) -> Result<DecryptOutput> {
        let env_keys: BTreeMap<Composite, EncryptedKey> = response
            .keys
            .iter()
            .filter(|(c, _)| c.part != EnvPart::Changesets)
            .map(|(c, k)| (c.clone(), k.clone()))
            .collect();
        let changeset_keys: BTreeMap<Composite, EncryptedKey> = response
            .keys
            .iter()
            .filter(|(c, _)| c.part == EnvPart::Changesets)
            .map(|(c, k)| (c.clone(), k.clone()))
            .collect();

        check_pairing(
            &env_keys.keys().cloned().collect(),
            &response.blobs.keys().cloned().collect(),
        )?;
        if response.include_changesets {
            check_pairing(
                &changeset_keys.keys().cloned().collect(),
                &response.changesets.keys().cloned().collect(),
            )?;
        }

        let mut signing_keys = env_keys.clone();
        if response.include_changesets {
            signing_keys.extend(changeset_keys.clone());
        }
        let (pubkeys, newly_trusted) = self.verify_signers(&signing_keys).await?;

        let envs = try_join_all(env_keys.iter().map(|(composite, key)| {
            let pubkeys = &pubkeys;
            async move {
                let sym = self.open_key(pubkeys, key).await?;
                let blob = response
                    .blobs
                    .get(composite)
                    .ok_or_else(|| pairing_error("keys", &[composite.clone()].into_iter().collect()))?;
                let plain = self.crypto.decrypt_with_key(blob, &sym).await?;
                let value: Value = serde_json::from_slice(&plain)?;
                Ok::<_, ClientError>((
                    composite.clone(),
                    CachedEnv {
                        env_parent_id: key.env_parent_id.clone(),
                        key: sym,
                        value,
                    },
                ))
            }
        }))
        .await?;

        let changesets: Option<BTreeMap<Composite, CachedChangesets>> = if response.include_changesets {
            let decrypted = try_join_all(changeset_keys.iter().map(|(composite, key)| {
                let pubkeys = &pubkeys;
                async move {
                    let sym = self.open_key(pubkeys, key).await?;
                    let list = response.changesets.get(composite).map(Vec::as_slice).unwrap_or(&[]);
                    let changesets = self.decrypt_changesets(list, &sym).await?;
                    Ok::<_, ClientError>((
                        composite.clone(),
                        CachedChangesets {
                            env_parent_id: key.env_parent_id.clone(),
                            key: sym,
                            changesets,
                        },
                    ))
                }
            }))
            .await?;
            Some(decrypted.into_iter().collect())
        } else {
            None
        };

        debug!(
            envs = envs.len(),
            changesets = changesets.as_ref().map_or(0, BTreeMap::len),
            "decrypted envs"
        );
        Ok(DecryptOutput {
            envs: DecryptedEnvs {
                env_parent_ids: response.env_parent_ids.clone(),
                fetched_at: response.fetched_at,
                envs: envs.into_iter().collect(),
                changesets,
            },
            newly_trusted,
        })
    }

    /// Decrypt one environment's changeset list under `key`.
    pub async fn decrypt_changesets(
        &self,
        list: &[EncryptedChangesetBlob],
        key: &SymmetricKey,
    ) -> Result<Vec<Changeset>> {
        let mut out = Vec::with_capacity(list.len());
        for encrypted in list {
            let plain = self.crypto.decrypt_with_key(&encrypted.blob, key).await?;
            let actions: Vec<PendingEnvUpdate> = serde_json::from_slice(&plain)?;
            out.push(Changeset {
                id: encrypted.id.clone(),
                created_at: encrypted.created_at,
                created_by_id: encrypted.created_by_id.clone(),
                actions,
            });
        }
        Ok(out)
    }
}

/// Pubkey of a signing device or CLI user.
fn signer_pubkey(graph: &OrgGraph, signer_id: &KeyableId) -> Result<Pubkey> {
    match graph.keyable(signer_id) {
        Some(KeyableRef::Device(device)) => device
            .pubkey
            .clone()
            .ok_or_else(|| ClientError::Integrity(format!("signer {} has no pubkey", signer_id))),
        Some(KeyableRef::CliUser(_, cli)) => Ok(cli.pubkey.clone()),
        Some(_) => Err(ClientError::Integrity(format!(
            "{} cannot sign env keys",
            signer_id
        ))),
        None => Err(ClientError::Integrity(format!("signer {} is not in the graph", signer_id))),
    }
}
