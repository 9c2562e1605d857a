//! Invites, device grants and recovery keys.
//!
//! All three work the same way. The creating device generates an
//! onboarding keypair, signs its pubkey, and encrypts every key the target
//! user is entitled to for it. The onboarding privkey goes to the server
//! sealed with a random token that only travels out of band. Whoever holds
//! the token loads the onboarding, checks it against the identity hash the
//! token carries, and accepts it with a new device signed by the
//! onboarding key:
//!
//! ```text
//! root ─▶ … ─▶ signer device ─▶ onboarding key ─▶ new device
//! ```

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info};

use envseal_core::{
    identity_hash, verify_keypair, AccountId, Blake3Hash, EnvParentId, KeyableId, OrgId,
    Privkey, Pubkey, RoleId, SymmetricKey, TrustedPubkey, TrustedPubkeys, UserId,
};
use envseal_graph::{
    key_set_for_graph_proposal, AppUserGrant, KeySetScope, Onboarding, OnboardingKind,
    OrgGraph, OrgUser, OrgUserDevice, UserKind,
};
use envseal_sync::{
    AcceptOnboardingParams, ApiRequest, ApiResponse, CreateOnboardingParams, OnboardingBundle,
    RequestContext, SignedTrustedRoot,
};

use crate::client::{now_millis, Client, Services};
use crate::config::ClientConfig;
use crate::context::ClientContext;
use crate::decrypt::Decryptor;
use crate::error::{ClientError, Result};
use crate::state::{ClientState, DecryptedEnvs};
use crate::trust;

/// What to onboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OnboardingRequest {
    /// Invite a new person with an org role and per-app roles.
    Invite {
        name: String,
        org_role_id: RoleId,
        app_roles: Vec<(EnvParentId, RoleId)>,
    },
    /// Add a device for an existing user.
    DeviceGrant { user_id: UserId },
    /// A recovery key for the acting user. Redeeming it replaces all of
    /// their devices.
    RecoveryKey,
}

impl OnboardingRequest {
    pub fn kind(&self) -> OnboardingKind {
        match self {
            OnboardingRequest::Invite { .. } => OnboardingKind::Invite,
            OnboardingRequest::DeviceGrant { .. } => OnboardingKind::DeviceGrant,
            OnboardingRequest::RecoveryKey => OnboardingKind::RecoveryKey,
        }
    }
}

/// Everything the recipient needs to redeem an onboarding. Travels out of
/// band, never through the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnboardingToken {
    pub org_id: OrgId,
    pub user_id: UserId,
    pub onboarding_id: KeyableId,
    pub identity_hash: Blake3Hash,
    /// Hex of the key that seals the onboarding privkey.
    pub encryption_token: String,
}

impl OnboardingToken {
    fn encryption_key(&self) -> Result<SymmetricKey> {
        let bytes = hex::decode(&self.encryption_token)
            .map_err(|e| ClientError::InvalidOperation(format!("malformed encryption token: {}", e)))?;
        Ok(SymmetricKey::from_slice(&bytes)?)
    }
}

/// Hash binding an onboarding to its pubkey and the pubkey that signed it.
pub fn onboarding_identity_hash(
    onboarding_id: &KeyableId,
    target_user_id: &UserId,
    pubkey: &Pubkey,
    signed_by_id: &KeyableId,
    signer_pubkey: &Pubkey,
) -> Result<Blake3Hash> {
    Ok(identity_hash(&json!({
        "id": onboarding_id,
        "targetUserId": target_user_id,
        "pubkey": pubkey,
        "signedById": signed_by_id,
        "signerPubkey": signer_pubkey,
    }))?)
}

fn signer_pubkey(graph: &OrgGraph, signer_id: &KeyableId) -> Result<Pubkey> {
    graph
        .keyable_pubkey(signer_id)
        .cloned()
        .ok_or_else(|| ClientError::Integrity(format!("signer {} has no pubkey in the graph", signer_id)))
}

/// Add an onboarding and the user and grants it brings to `graph`.
fn propose_onboarding(
    graph: &mut OrgGraph,
    onboarding: &Onboarding,
    new_user: Option<&OrgUser>,
    app_user_grants: &[AppUserGrant],
) {
    if let Some(user) = new_user {
        graph.users.insert(user.id.clone(), user.clone());
    }
    graph.app_user_grants.extend(app_user_grants.iter().cloned());
    graph.onboardings.insert(onboarding.id.clone(), onboarding.clone());
}

fn expires_at(now: u64, ttl: Option<Duration>) -> Option<u64> {
    ttl.map(|ttl| now + ttl.as_millis() as u64)
}

impl Client {
    /// Create an invite, device grant or recovery key and return the token
    /// that redeems it.
    pub async fn create_onboarding(&self, request: OnboardingRequest) -> Result<OnboardingToken> {
        let graph = self.graph().await?;
        let state = self.snapshot().await;
        if state.trusted_root.is_empty() {
            return Err(ClientError::Integrity("no trusted root to hand on".into()));
        }
        let crypto = self.services.crypto.as_ref();
        let now = now_millis();
        let kind = request.kind();

        let (target_user_id, new_user, app_user_grants) = match &request {
            OnboardingRequest::Invite {
                name,
                org_role_id,
                app_roles,
            } => {
                let user_id = UserId::generate();
                let user = OrgUser {
                    id: user_id.clone(),
                    name: name.clone(),
                    kind: UserKind::Person,
                    org_role_id: org_role_id.clone(),
                    deactivated_at: None,
                };
                let grants = app_roles
                    .iter()
                    .map(|(app_id, role_id)| AppUserGrant {
                        app_id: app_id.clone(),
                        user_id: user_id.clone(),
                        app_role_id: role_id.clone(),
                    })
                    .collect::<Vec<_>>();
                (user_id, Some(user), grants)
            }
            OnboardingRequest::DeviceGrant { user_id } => (user_id.clone(), None, Vec::new()),
            OnboardingRequest::RecoveryKey => (self.ctx.user_id.clone(), None, Vec::new()),
        };

        let keypair = crypto.generate_keypair().await?;
        let pubkey = crypto.sign_public_key(&keypair.pubkey, &self.ctx.privkey).await?;
        let onboarding_id = KeyableId::generate();
        let hash = onboarding_identity_hash(
            &onboarding_id,
            &target_user_id,
            &pubkey,
            &self.ctx.device_id,
            &signer_pubkey(&graph, &self.ctx.device_id)?,
        )?;
        let onboarding = Onboarding {
            id: onboarding_id.clone(),
            kind,
            target_user_id: target_user_id.clone(),
            pubkey,
            signed_by_id: self.ctx.device_id.clone(),
            identity_hash: hash,
            created_at: now,
            expires_at: expires_at(now, self.config.onboarding_ttl),
            accepted_at: None,
        };

        let token_key = crypto.generate_symmetric_key().await?;
        let encrypted_privkey = crypto
            .encrypt_with_key(&keypair.privkey.to_bytes(), &token_key)
            .await?;
        let root_value = serde_json::to_value(&state.trusted_root)?;
        let signed_trusted_root = SignedTrustedRoot {
            root: state.trusted_root.clone(),
            signature: crypto.sign_json(&root_value, &self.ctx.privkey).await?,
        };

        let mut proposed = graph.clone();
        propose_onboarding(&mut proposed, &onboarding, new_user.as_ref(), &app_user_grants);
        let mut key_set = key_set_for_graph_proposal(
            &graph,
            self.services.oracle.as_ref(),
            now,
            |g| propose_onboarding(g, &onboarding, new_user.as_ref(), &app_user_grants),
            &KeySetScope::users([target_user_id.clone()]),
        )
        .to_add;
        for devices in key_set.users.values_mut() {
            devices.retain(|id, _| id == &onboarding_id);
        }
        key_set.users.retain(|_, devices| !devices.is_empty());
        debug!(onboarding = %onboarding_id, keys = key_set.entry_count(), "planned onboarding keys");

        let env_parent_ids = key_set.env_parent_ids();
        let _guards = self.lock_env_parents(&env_parent_ids).await;
        let encrypted = self.encrypt_key_set_with_retries(&proposed, &key_set).await?;

        self.send_ok(ApiRequest::CreateOnboarding(Box::new(CreateOnboardingParams {
            graph_updated_at: graph.updated_at,
            onboarding,
            new_user,
            app_user_grants,
            encrypted_privkey,
            signed_trusted_root,
            env_params: encrypted.env_params,
        })))
        .await?;
        info!(onboarding = %onboarding_id, ?kind, user = %target_user_id, "created onboarding");

        self.trust_verified(encrypted.newly_trusted).await;
        self.refresh_graph().await?;

        Ok(OnboardingToken {
            org_id: self.ctx.org_id.clone(),
            user_id: target_user_id,
            onboarding_id,
            identity_hash: hash,
            encryption_token: hex::encode(token_key.as_bytes()),
        })
    }

    /// Load and verify the onboarding a token points at.
    pub async fn load_onboarding(
        account_id: AccountId,
        token: &OnboardingToken,
        config: ClientConfig,
        services: Services,
    ) -> Result<LoadedOnboarding> {
        let ctx = RequestContext {
            account_id: account_id.clone(),
            org_id: token.org_id.clone(),
            user_id: token.user_id.clone(),
            device_id: token.onboarding_id.clone(),
        };
        let response = services
            .transport
            .dispatch(
                &ctx,
                ApiRequest::LoadOnboarding {
                    onboarding_id: token.onboarding_id.clone(),
                },
            )
            .await?;
        let ApiResponse::Onboarding(bundle) = response else {
            return Err(ClientError::UnexpectedResponse("onboarding"));
        };
        let OnboardingBundle {
            graph,
            onboarding,
            encrypted_privkey,
            signed_trusted_root,
            envs,
        } = *bundle;

        if onboarding.id != token.onboarding_id || onboarding.target_user_id != token.user_id {
            return Err(ClientError::Integrity(format!(
                "server returned onboarding {} for {}",
                onboarding.id, onboarding.target_user_id
            )));
        }
        let signer = signer_pubkey(&graph, &onboarding.signed_by_id)?;
        let hash = onboarding_identity_hash(
            &onboarding.id,
            &onboarding.target_user_id,
            &onboarding.pubkey,
            &onboarding.signed_by_id,
            &signer,
        )?;
        if hash != token.identity_hash || hash != onboarding.identity_hash {
            return Err(ClientError::Integrity(format!(
                "identity hash mismatch for onboarding {}",
                onboarding.id
            )));
        }

        let crypto = services.crypto.as_ref();
        let raw = crypto
            .decrypt_with_key(&encrypted_privkey, &token.encryption_key()?)
            .await?;
        let privkey = Privkey::from_bytes(&raw)?;
        verify_keypair(crypto, &onboarding.pubkey, &privkey).await?;

        let root_value = serde_json::to_value(&signed_trusted_root.root)?;
        crypto
            .verify_json(&root_value, &signed_trusted_root.signature, &signer)
            .await
            .map_err(|_| ClientError::Integrity("trusted root signature does not verify".into()))?;
        let root = signed_trusted_root.root;
        if root.is_empty() {
            return Err(ClientError::Integrity("onboarding carries an empty root".into()));
        }

        let session = trust::verify_org_keyable(
            &graph,
            &root,
            &TrustedPubkeys::new(),
            crypto,
            &onboarding.id,
        )
        .await?;
        let session_map: TrustedPubkeys = session.iter().cloned().collect();
        let output = Decryptor {
            graph: &graph,
            trusted_root: &root,
            session: &session_map,
            crypto,
            privkey: &privkey,
        }
        .decrypt_envs(&envs)
        .await?;

        let mut session = session;
        session.extend(output.newly_trusted);
        info!(
            onboarding = %onboarding.id,
            envs = output.envs.envs.len(),
            "loaded onboarding"
        );
        Ok(LoadedOnboarding {
            account_id,
            config,
            services,
            graph,
            onboarding,
            privkey,
            root,
            session,
            envs: output.envs,
        })
    }
}

/// A verified onboarding, ready to be accepted.
pub struct LoadedOnboarding {
    account_id: AccountId,
    config: ClientConfig,
    services: Services,
    graph: OrgGraph,
    onboarding: Onboarding,
    privkey: Privkey,
    root: TrustedPubkeys,
    session: Vec<(KeyableId, TrustedPubkey)>,
    envs: DecryptedEnvs,
}

impl LoadedOnboarding {
    pub fn onboarding(&self) -> &Onboarding {
        &self.onboarding
    }

    pub fn graph(&self) -> &OrgGraph {
        &self.graph
    }

    /// Decrypted content readable through the onboarding key.
    pub fn envs(&self) -> &DecryptedEnvs {
        &self.envs
    }

    pub fn trusted_root(&self) -> &TrustedPubkeys {
        &self.root
    }

    /// Register a new device signed by the onboarding key and open a
    /// client for it.
    pub async fn accept(self, device_name: &str) -> Result<Client> {
        let crypto = self.services.crypto.as_ref();
        let keypair = crypto.generate_keypair().await?;
        let pubkey = crypto.sign_public_key(&keypair.pubkey, &self.privkey).await?;
        let device_id = KeyableId::generate();
        let device = OrgUserDevice {
            id: device_id.clone(),
            user_id: self.onboarding.target_user_id.clone(),
            name: device_name.to_string(),
            pubkey: Some(pubkey),
            is_root: false,
            approved_by: Some(self.onboarding.kind.approved_by(self.onboarding.id.clone())),
            created_at: now_millis(),
        };

        let ctx = ClientContext {
            account_id: self.account_id,
            org_id: self.graph.org.id.clone(),
            user_id: self.onboarding.target_user_id.clone(),
            device_id: device_id.clone(),
            privkey: keypair.privkey,
        };
        let client = Client::with_state(ctx, self.config, self.services, ClientState::default());
        client
            .send_ok(ApiRequest::AcceptOnboarding(AcceptOnboardingParams {
                onboarding_id: self.onboarding.id.clone(),
                device,
            }))
            .await?;
        info!(onboarding = %self.onboarding.id, device = %device_id, "accepted onboarding");

        for (pubkey_id, trusted) in &self.root {
            client.persist_root(pubkey_id, trusted).await?;
        }
        let stored = client.services.store.load_root(&client.ctx.account_id).await?;
        client.seed(stored, self.session, self.envs).await;

        client.refresh_graph().await?;
        client.grant_keys_to(&device_id).await?;
        Ok(client)
    }
}

impl std::fmt::Debug for LoadedOnboarding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedOnboarding")
            .field("account_id", &self.account_id)
            .field("onboarding", &self.onboarding.id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use envseal_core::Keypair;

    #[test]
    fn test_identity_hash_binds_signer_pubkey() {
        let onboarding = Keypair::from_seed(&[1; 32]).pubkey;
        let signer = Keypair::from_seed(&[2; 32]).pubkey;
        let other = Keypair::from_seed(&[3; 32]).pubkey;
        let id = KeyableId::new("inv-1");
        let user = UserId::new("u-2");
        let signer_id = KeyableId::new("dev-1");

        let a = onboarding_identity_hash(&id, &user, &onboarding, &signer_id, &signer).unwrap();
        let b = onboarding_identity_hash(&id, &user, &onboarding, &signer_id, &signer).unwrap();
        let c = onboarding_identity_hash(&id, &user, &onboarding, &signer_id, &other).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_token_key_round_trips_through_hex() {
        let key = SymmetricKey::from_bytes([9; 32]);
        let token = OnboardingToken {
            org_id: OrgId::new("org"),
            user_id: UserId::new("u"),
            onboarding_id: KeyableId::new("inv"),
            identity_hash: Blake3Hash::hash(b"x"),
            encryption_token: hex::encode(key.as_bytes()),
        };
        assert!(token.encryption_key().unwrap() == key);

        let bad = OnboardingToken {
            encryption_token: "zz".into(),
            ..token
        };
        assert!(matches!(bad.encryption_key(), Err(ClientError::InvalidOperation(_))));
    }

    #[test]
    fn test_expiry_follows_ttl() {
        assert_eq!(expires_at(1_000, Some(Duration::from_secs(2))), Some(3_000));
        assert_eq!(expires_at(1_000, None), None);
    }
}
