//! Trust chain verification.
//!
//! A keyable is trusted when its pubkey is signed by a trusted keyable,
//! either directly or through the invite, device grant or recovery key that
//! approved it. Walking signers back from any keyable must end at an entry
//! of the device-local root registry; every hop on the way is added to the
//! session registry.
//!
//! Session entries record the attributes they were trusted under. When the
//! graph later reports different attributes, or the keyable disappears,
//! the entry is evicted together with everything it vouched for.

use std::collections::BTreeSet;
use tracing::{debug, warn};

use envseal_core::{
    CryptoProvider, KeyableId, KeyableType, Pubkey, TrustedPubkey, TrustedPubkeys,
};
use envseal_graph::{ApprovedBy, KeyableRef, OrgGraph, RootPubkeyReplacement};

use crate::error::{ClientError, Result};

/// Everything the trust walk needs to know about one keyable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustAttributes {
    /// Id the pubkey is registered under. For keyable parents this is the
    /// id of their active generated envkey.
    pub pubkey_id: KeyableId,
    pub keyable_type: KeyableType,
    pub pubkey: Pubkey,
    /// Pubkey of the onboarding that approved a device.
    pub invite_pubkey: Option<Pubkey>,
    pub signed_by_id: Option<KeyableId>,
    pub signed_by_pubkey_id: Option<KeyableId>,
    pub is_root: bool,
}

impl TrustAttributes {
    pub fn to_trusted(&self) -> TrustedPubkey {
        TrustedPubkey {
            keyable_type: self.keyable_type,
            pubkey: self.pubkey.clone(),
            invite_pubkey: self.invite_pubkey.clone(),
            signed_by_pubkey_id: self.signed_by_pubkey_id.clone(),
        }
    }
}

fn integrity(msg: impl Into<String>) -> ClientError {
    ClientError::Integrity(msg.into())
}

/// Id a signer's pubkey is registered under.
fn signer_pubkey_id(graph: &OrgGraph, signer_id: &KeyableId) -> KeyableId {
    match graph.keyable(signer_id) {
        Some(KeyableRef::KeyableParent(parent)) => parent
            .generated_envkey_id
            .clone()
            .unwrap_or_else(|| signer_id.clone()),
        _ => signer_id.clone(),
    }
}

/// Collect trust attributes for `keyable_id` from `graph`.
pub fn trust_attributes(graph: &OrgGraph, keyable_id: &KeyableId) -> Result<TrustAttributes> {
    let keyable = graph
        .keyable(keyable_id)
        .ok_or_else(|| integrity(format!("{} is not in the graph", keyable_id)))?;

    let signed = |pubkey_id: &KeyableId, keyable_type, pubkey: &Pubkey, signer: &KeyableId| {
        TrustAttributes {
            pubkey_id: pubkey_id.clone(),
            keyable_type,
            pubkey: pubkey.clone(),
            invite_pubkey: None,
            signed_by_id: Some(signer.clone()),
            signed_by_pubkey_id: Some(signer_pubkey_id(graph, signer)),
            is_root: false,
        }
    };

    let attrs = match keyable {
        KeyableRef::Device(device) => {
            let pubkey = device
                .pubkey
                .clone()
                .ok_or_else(|| integrity(format!("device {} has no pubkey", device.id)))?;
            let (invite_pubkey, signed_by_id) = match &device.approved_by {
                Some(approved_by) => {
                    let onboarding = graph
                        .onboardings
                        .get(approved_by.onboarding_id())
                        .ok_or_else(|| {
                            integrity(format!(
                                "onboarding {} approving {} is missing",
                                approved_by.onboarding_id(),
                                device.id
                            ))
                        })?;
                    (Some(onboarding.pubkey.clone()), Some(onboarding.signed_by_id.clone()))
                }
                None => (None, None),
            };
            TrustAttributes {
                pubkey_id: device.id.clone(),
                keyable_type: KeyableType::OrgUserDevice,
                pubkey,
                invite_pubkey,
                signed_by_pubkey_id: signed_by_id.as_ref().map(|id| signer_pubkey_id(graph, id)),
                signed_by_id,
                is_root: device.is_root,
            }
        }
        KeyableRef::CliUser(user, cli) => {
            signed(&user.id.as_keyable(), KeyableType::CliUser, &cli.pubkey, &cli.signed_by_id)
        }
        KeyableRef::Invite(o) | KeyableRef::DeviceGrant(o) | KeyableRef::RecoveryKey(o) => {
            signed(&o.id, o.kind.keyable_type(), &o.pubkey, &o.signed_by_id)
        }
        KeyableRef::GeneratedEnvkey(envkey) => signed(
            &envkey.id,
            KeyableType::GeneratedEnvkey,
            &envkey.pubkey,
            &envkey.signed_by_id,
        ),
        KeyableRef::KeyableParent(parent) => {
            let envkey_id = parent
                .generated_envkey_id
                .as_ref()
                .ok_or_else(|| integrity(format!("{} has no generated envkey", parent.id)))?;
            return trust_attributes(graph, envkey_id);
        }
    };
    Ok(attrs)
}

/// Whether `attrs` already matches a root entry, or a session entry when it
/// is not a root.
pub fn already_trusted(
    attrs: &TrustAttributes,
    trusted_root: &TrustedPubkeys,
    session: &TrustedPubkeys,
) -> bool {
    let trusted = attrs.to_trusted();
    if trusted_root.get(&attrs.pubkey_id) == Some(&trusted) {
        return true;
    }
    !attrs.is_root && session.get(&attrs.pubkey_id) == Some(&trusted)
}

async fn verify_signatures(
    crypto: &dyn CryptoProvider,
    attrs: &TrustAttributes,
    signer: &TrustAttributes,
) -> Result<()> {
    let bad = |what: &str| {
        integrity(format!(
            "{} signature on {} does not verify against {}",
            what, attrs.pubkey_id, signer.pubkey_id
        ))
    };
    match &attrs.invite_pubkey {
        Some(invite_pubkey) => {
            crypto
                .verify_public_key_signature(&attrs.pubkey, invite_pubkey)
                .await
                .map_err(|_| bad("approval"))?;
            crypto
                .verify_public_key_signature(invite_pubkey, &signer.pubkey)
                .await
                .map_err(|_| bad("invite"))?;
        }
        None => {
            crypto
                .verify_public_key_signature(&attrs.pubkey, &signer.pubkey)
                .await
                .map_err(|_| bad("pubkey"))?;
        }
    }
    Ok(())
}

/// Verify `keyable_id` back to the root registry.
///
/// Returns the newly verified entries, root-most first. An empty result
/// means the keyable was already trusted.
pub async fn verify_org_keyable(
    graph: &OrgGraph,
    trusted_root: &TrustedPubkeys,
    session: &TrustedPubkeys,
    crypto: &dyn CryptoProvider,
    keyable_id: &KeyableId,
) -> Result<Vec<(KeyableId, TrustedPubkey)>> {
    let mut chain: Vec<(KeyableId, TrustedPubkey)> = Vec::new();
    let mut seen: BTreeSet<KeyableId> = BTreeSet::new();
    let mut current = trust_attributes(graph, keyable_id)?;
    // Set once the walk continues through revoked entries. Those hops are
    // verified but never trusted.
    let mut revoked_view: Option<OrgGraph> = None;
    let mut current_revoked = false;

    loop {
        if already_trusted(&current, trusted_root, session) {
            break;
        }
        if !seen.insert(current.pubkey_id.clone()) {
            return Err(integrity(format!("signature cycle at {}", current.pubkey_id)));
        }
        if current.is_root {
            return Err(integrity(format!(
                "root {} is not in the local root registry",
                current.pubkey_id
            )));
        }
        let signer_id = current
            .signed_by_pubkey_id
            .clone()
            .ok_or_else(|| integrity(format!("{} is not signed by anyone", current.pubkey_id)))?;
        let signer = match &revoked_view {
            Some(view) => trust_attributes(view, &signer_id)?,
            None => match trust_attributes(graph, &signer_id) {
                Ok(signer) => signer,
                Err(_) if recovered_from(graph, &current.pubkey_id, &signer_id) => {
                    warn!(device = %current.pubkey_id, signer = %signer_id, "verifying recovery through its revoked signer");
                    trust_attributes(revoked_view.insert(graph.with_revoked()), &signer_id)?
                }
                Err(err) => return Err(err),
            },
        };
        verify_signatures(crypto, &current, &signer).await?;

        if !current_revoked {
            chain.push((current.pubkey_id.clone(), current.to_trusted()));
        }
        current_revoked = revoked_view.is_some();
        current = signer;
    }

    chain.reverse();
    if !chain.is_empty() {
        debug!(keyable = %keyable_id, hops = chain.len(), "verified trust chain");
    }
    Ok(chain)
}

/// Whether `device_id` redeemed a recovery key made by `signer_id`, which
/// the redemption then revoked.
fn recovered_from(graph: &OrgGraph, device_id: &KeyableId, signer_id: &KeyableId) -> bool {
    let Some(ApprovedBy::RecoveryKey(onboarding_id)) =
        graph.devices.get(device_id).and_then(|d| d.approved_by.as_ref())
    else {
        return false;
    };
    graph
        .onboardings
        .get(onboarding_id)
        .map_or(false, |o| &o.signed_by_id == signer_id)
        && graph.revoked_devices.contains_key(signer_id)
}

/// Verify several keyables, sharing hops between them.
pub async fn verify_org_keyables<'a>(
    graph: &OrgGraph,
    trusted_root: &TrustedPubkeys,
    session: &TrustedPubkeys,
    crypto: &dyn CryptoProvider,
    keyable_ids: impl IntoIterator<Item = &'a KeyableId>,
) -> Result<Vec<(KeyableId, TrustedPubkey)>> {
    let mut overlay = session.clone();
    let mut added = Vec::new();
    for keyable_id in keyable_ids {
        let verified = verify_org_keyable(graph, trusted_root, &overlay, crypto, keyable_id).await?;
        for (id, trusted) in verified {
            overlay.insert(id.clone(), trusted.clone());
            added.push((id, trusted));
        }
    }
    Ok(added)
}

/// Verify `candidate` using only `trusted_root` and a supplied chain of
/// already-signed entries.
pub async fn verify_pubkey_with_trust_chain(
    crypto: &dyn CryptoProvider,
    candidate_id: &KeyableId,
    candidate: &TrustedPubkey,
    trusted_root: &TrustedPubkeys,
    trust_chain: &TrustedPubkeys,
) -> Result<()> {
    let mut seen: BTreeSet<KeyableId> = BTreeSet::new();
    let mut current_id = candidate_id.clone();
    let mut current = candidate.clone();

    loop {
        if trusted_root.get(&current_id) == Some(&current) {
            return Ok(());
        }
        if !seen.insert(current_id.clone()) {
            return Err(integrity(format!("signature cycle at {}", current_id)));
        }
        let signer_id = current
            .signed_by_pubkey_id
            .clone()
            .ok_or_else(|| integrity(format!("{} is not signed by anyone", current_id)))?;
        let signer = trusted_root
            .get(&signer_id)
            .or_else(|| trust_chain.get(&signer_id))
            .cloned()
            .ok_or_else(|| integrity(format!("signer {} is not in the trust chain", signer_id)))?;

        let signer_attrs = TrustAttributes {
            pubkey_id: signer_id.clone(),
            keyable_type: signer.keyable_type,
            pubkey: signer.pubkey.clone(),
            invite_pubkey: signer.invite_pubkey.clone(),
            signed_by_id: signer.signed_by_pubkey_id.clone(),
            signed_by_pubkey_id: signer.signed_by_pubkey_id.clone(),
            is_root: false,
        };
        let current_attrs = TrustAttributes {
            pubkey_id: current_id.clone(),
            keyable_type: current.keyable_type,
            pubkey: current.pubkey.clone(),
            invite_pubkey: current.invite_pubkey.clone(),
            signed_by_id: Some(signer_id.clone()),
            signed_by_pubkey_id: Some(signer_id.clone()),
            is_root: false,
        };
        verify_signatures(crypto, &current_attrs, &signer_attrs).await?;

        current_id = signer_id;
        current = signer;
    }
}

/// Ids of `seeds` plus every session entry that depends on them, directly
/// or transitively, restricted to ids present in `session`.
pub fn revocation_cascade(
    session: &TrustedPubkeys,
    seeds: impl IntoIterator<Item = KeyableId>,
) -> BTreeSet<KeyableId> {
    let mut removed: BTreeSet<KeyableId> = BTreeSet::new();
    let mut removed_pubkeys: Vec<Pubkey> = Vec::new();
    let mut queue: Vec<KeyableId> = seeds.into_iter().collect();

    while let Some(id) = queue.pop() {
        if !removed.insert(id.clone()) {
            continue;
        }
        if let Some(entry) = session.get(&id) {
            removed_pubkeys.push(entry.pubkey.clone());
        }
        for (other_id, entry) in session {
            if removed.contains(other_id) {
                continue;
            }
            let signed_by_removed = entry.signed_by_pubkey_id.as_ref() == Some(&id);
            let approved_by_removed = entry
                .invite_pubkey
                .as_ref()
                .map_or(false, |invite| removed_pubkeys.contains(invite));
            if signed_by_removed || approved_by_removed {
                queue.push(other_id.clone());
            }
        }
    }

    removed.retain(|id| session.contains_key(id));
    removed
}

/// Session entries the graph no longer vouches for, plus their dependents.
pub fn revoked_or_outdated(graph: &OrgGraph, session: &TrustedPubkeys) -> BTreeSet<KeyableId> {
    let stale: Vec<KeyableId> = session
        .iter()
        .filter(|(id, trusted)| match trust_attributes(graph, id) {
            Ok(attrs) => &attrs.to_trusted() != *trusted,
            Err(_) => true,
        })
        .map(|(id, _)| id.clone())
        .collect();
    if stale.is_empty() {
        return BTreeSet::new();
    }
    let removed = revocation_cascade(session, stale);
    warn!(count = removed.len(), "evicting revoked or outdated session pubkeys");
    removed
}

/// A root replacement that verified against the local root registry.
#[derive(Debug, Clone)]
pub struct VerifiedRootReplacement {
    pub replacing_id: KeyableId,
    pub replacement_id: KeyableId,
    pub replacement: TrustedPubkey,
}

/// Check one replacement request. `Ok(None)` means it does not apply to
/// this device's root registry.
pub async fn verify_root_replacement(
    crypto: &dyn CryptoProvider,
    trusted_root: &TrustedPubkeys,
    replacement: &RootPubkeyReplacement,
) -> Result<Option<VerifiedRootReplacement>> {
    let applies = trusted_root
        .get(&replacement.replacing_pubkey_id)
        .map_or(false, |t| t.pubkey == replacement.replacing_pubkey);
    if !applies {
        return Ok(None);
    }

    let candidate = TrustedPubkey {
        keyable_type: KeyableType::OrgUserDevice,
        pubkey: replacement.replacement_pubkey.clone(),
        invite_pubkey: None,
        signed_by_pubkey_id: Some(replacement.signed_by_id.clone()),
    };
    verify_pubkey_with_trust_chain(
        crypto,
        &replacement.replacement_pubkey_id,
        &candidate,
        trusted_root,
        &replacement.trust_chain,
    )
    .await?;

    Ok(Some(VerifiedRootReplacement {
        replacing_id: replacement.replacing_pubkey_id.clone(),
        replacement_id: replacement.replacement_pubkey_id.clone(),
        replacement: TrustedPubkey {
            keyable_type: KeyableType::OrgUserDevice,
            pubkey: replacement.replacement_pubkey.clone(),
            invite_pubkey: None,
            signed_by_pubkey_id: None,
        },
    }))
}
