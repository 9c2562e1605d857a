//! An in-process server for tests and local development.
//!
//! [`MemoryServer`] holds one org: its graph, every encrypted key keyed by
//! `(recipient, composite)`, encrypted blobs, and changeset lists. Every
//! write is checked against the graph: keys may only go to recipients the
//! graph entitles to them, and blobs may only be written by users allowed
//! to write (or queued to re-encrypt) the owning environment. Any graph
//! change drops keys their holders are no longer entitled to.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use envseal_core::{EncryptedBlob, EncryptedData, EnvParentId, EnvironmentId, KeyableId, RequestId};
use envseal_graph::{
    current_key_set, Composite, EnvPart, EnvironmentPermission, KeySetScope, KeyableRef,
    OnboardingKind, OrgGraph, OrgPermission, PermissionOracle, PubkeyRevocationRequest,
    RolePermissions,
};

use crate::error::{Result, SyncError};
use crate::messages::{
    AcceptOnboardingParams, ApiRequest, ApiResponse, CreateOnboardingParams, EncryptedChangesetBlob,
    EncryptedKey, EnvParams, FetchEnvsParams, FetchEnvsResponse, OnboardingBundle, RequestContext,
    SignedTrustedRoot,
};
use crate::transport::Transport;

/// Configuration for [`MemoryServer`].
#[derive(Debug, Clone, Default)]
pub struct MemoryServerConfig {
    /// Accept this many env writes, then answer every write with `Throttled`.
    pub write_limit: Option<usize>,
}

#[derive(Debug, Clone)]
struct StoredKey {
    data: EncryptedData,
    encrypted_by_id: KeyableId,
    env_parent_id: EnvParentId,
}

#[derive(Debug, Clone)]
struct OnboardingPayload {
    encrypted_privkey: EncryptedBlob,
    signed_trusted_root: SignedTrustedRoot,
}

/// How a write request may touch blobs.
enum WriteMode<'a> {
    /// Regular edit: requires write permission on each owning environment.
    Update,
    /// Key rotation for queued environments.
    Reencrypt(&'a BTreeSet<EnvironmentId>),
    /// Keys only.
    Grant,
}

struct ServerState {
    config: MemoryServerConfig,
    graph: OrgGraph,
    clock: u64,
    keys: BTreeMap<KeyableId, BTreeMap<Composite, StoredKey>>,
    blobs: BTreeMap<Composite, EncryptedBlob>,
    changesets: BTreeMap<EnvironmentId, Vec<EncryptedChangesetBlob>>,
    onboarding_payloads: BTreeMap<KeyableId, OnboardingPayload>,
    acked: BTreeMap<KeyableId, BTreeSet<RequestId>>,
    writes: usize,
    throttled: bool,
    reencrypt_batches: Vec<BTreeSet<EnvironmentId>>,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn forbidden(msg: impl Into<String>) -> SyncError {
    SyncError::Forbidden(msg.into())
}

impl ServerState {
    /// Strictly increasing server time.
    fn tick(&mut self) -> u64 {
        self.clock = (self.clock + 1).max(now_millis());
        self.clock
    }

    fn entitlements(
        &self,
        oracle: &dyn PermissionOracle,
        now: u64,
    ) -> Result<BTreeSet<(KeyableId, Composite)>> {
        let set = current_key_set(&self.graph, oracle, now, &KeySetScope::all());
        Ok(set.recipient_composites(&self.graph)?)
    }

    /// Stamp a graph change and drop keys nobody is entitled to anymore.
    fn commit_graph(&mut self, oracle: &dyn PermissionOracle) -> Result<u64> {
        let now = self.tick();
        self.graph.updated_at = now;

        let entitled = self.entitlements(oracle, now)?;
        let mut dropped = 0usize;
        for (recipient, composites) in self.keys.iter_mut() {
            let before = composites.len();
            composites.retain(|composite, _| entitled.contains(&(recipient.clone(), composite.clone())));
            dropped += before - composites.len();
        }
        self.keys.retain(|_, composites| !composites.is_empty());
        if dropped > 0 {
            debug!(dropped, "dropped keys after graph change");
        }
        Ok(now)
    }

    fn authorize(&self, ctx: &RequestContext) -> Result<()> {
        if ctx.org_id != self.graph.org.id {
            return Err(forbidden(format!("not a member of org {}", ctx.org_id)));
        }
        let active = self
            .graph
            .users
            .get(&ctx.user_id)
            .map_or(false, |u| u.is_active());
        if !active {
            return Err(forbidden(format!("user {} is not active", ctx.user_id)));
        }
        let owns_key = match self.graph.keyable(&ctx.device_id) {
            Some(KeyableRef::Device(device)) => device.user_id == ctx.user_id && device.pubkey.is_some(),
            Some(KeyableRef::CliUser(user, _)) => user.id == ctx.user_id,
            _ => false,
        };
        if !owns_key {
            return Err(forbidden(format!("{} is not a key of {}", ctx.device_id, ctx.user_id)));
        }
        Ok(())
    }

    fn check_graph_version(&self, graph_updated_at: u64) -> Result<()> {
        if graph_updated_at != self.graph.updated_at {
            return Err(SyncError::GraphOutdated {
                server_updated_at: self.graph.updated_at,
            });
        }
        Ok(())
    }

    fn check_throttle(&mut self) -> Result<()> {
        if let Some(limit) = self.config.write_limit {
            if self.writes >= limit {
                self.throttled = true;
            }
        }
        if self.throttled {
            return Err(SyncError::Throttled(format!("write limit of {} reached", self.writes)));
        }
        self.writes += 1;
        Ok(())
    }

    fn has_environment_permission(
        &self,
        oracle: &dyn PermissionOracle,
        ctx: &RequestContext,
        environment_id: &EnvironmentId,
        permission: EnvironmentPermission,
    ) -> bool {
        oracle
            .environment_permissions(&self.graph, &ctx.user_id, environment_id)
            .contains(&permission)
    }

    fn authorize_blob_write(
        &self,
        oracle: &dyn PermissionOracle,
        ctx: &RequestContext,
        environment_id: &EnvironmentId,
        mode: &WriteMode<'_>,
    ) -> Result<()> {
        let can_write =
            self.has_environment_permission(oracle, ctx, environment_id, EnvironmentPermission::Write);
        let allowed = match mode {
            WriteMode::Update => can_write,
            WriteMode::Reencrypt(ids) => {
                ids.contains(environment_id)
                    && (can_write
                        || self
                            .graph
                            .reencryption_queue
                            .get(environment_id)
                            .map_or(false, |users| users.contains(&ctx.user_id)))
            }
            WriteMode::Grant => false,
        };
        if !allowed {
            return Err(forbidden(format!("{} may not write {}", ctx.user_id, environment_id)));
        }
        Ok(())
    }

    /// Validate and store keys, blobs and changesets.
    fn apply_env_params(
        &mut self,
        oracle: &dyn PermissionOracle,
        ctx: &RequestContext,
        params: EnvParams,
        mode: WriteMode<'_>,
        now: u64,
    ) -> Result<usize> {
        if params.encrypted_by_id != ctx.device_id {
            return Err(forbidden(format!(
                "keys signed by {} sent from {}",
                params.encrypted_by_id, ctx.device_id
            )));
        }

        let flat = params.keys.flatten(&self.graph)?;
        let entitled = self.entitlements(oracle, now)?;
        for key in &flat {
            if !entitled.contains(&(key.recipient_id.clone(), key.composite.clone())) {
                return Err(forbidden(format!(
                    "{} is not entitled to {}",
                    key.recipient_id, key.composite
                )));
            }
        }

        for composite in params.blobs.keys() {
            if composite.part == EnvPart::Changesets {
                return Err(SyncError::InvalidRequest(format!(
                    "changesets travel as changeset lists, not as blob {}",
                    composite
                )));
            }
            self.authorize_blob_write(oracle, ctx, composite.owner_environment_id(), &mode)?;
        }
        for environment_id in params.changesets.keys() {
            self.authorize_blob_write(oracle, ctx, environment_id, &mode)?;
        }

        // A new blob or a replaced changeset list invalidates every old key.
        let mut rotated: BTreeSet<Composite> = params.blobs.keys().cloned().collect();
        rotated.extend(
            params
                .changesets
                .iter()
                .filter(|(_, cs)| cs.replace)
                .map(|(id, _)| Composite::changesets(id)),
        );
        for composites in self.keys.values_mut() {
            composites.retain(|composite, _| !rotated.contains(composite));
        }

        let key_count = flat.len();
        for key in flat {
            self.keys.entry(key.recipient_id).or_default().insert(
                key.composite,
                StoredKey {
                    data: key.data,
                    encrypted_by_id: params.encrypted_by_id.clone(),
                    env_parent_id: key.env_parent_id,
                },
            );
        }
        self.keys.retain(|_, composites| !composites.is_empty());
        self.blobs.extend(params.blobs);
        for (environment_id, cs) in params.changesets {
            let list = self.changesets.entry(environment_id).or_default();
            if cs.replace {
                *list = cs.blobs;
            } else {
                list.extend(cs.blobs);
            }
        }
        Ok(key_count)
    }

    fn envs_for(&mut self, recipient_id: &KeyableId, params: &FetchEnvsParams) -> FetchEnvsResponse {
        let fetched_at = self.tick();
        let mut response = FetchEnvsResponse {
            env_parent_ids: params.env_parent_ids.clone(),
            include_changesets: params.include_changesets,
            fetched_at,
            ..Default::default()
        };
        let Some(keys) = self.keys.get(recipient_id) else {
            return response;
        };

        for (composite, key) in keys {
            if !params.env_parent_ids.contains(&key.env_parent_id) {
                continue;
            }
            if composite.part == EnvPart::Changesets {
                if !params.include_changesets {
                    continue;
                }
                let list = self
                    .changesets
                    .get(&composite.environment_id)
                    .cloned()
                    .unwrap_or_default();
                response.changesets.insert(composite.clone(), list);
            } else if let Some(blob) = self.blobs.get(composite) {
                response.blobs.insert(composite.clone(), blob.clone());
            }
            response.keys.insert(
                composite.clone(),
                EncryptedKey {
                    data: key.data.clone(),
                    encrypted_by_id: key.encrypted_by_id.clone(),
                    env_parent_id: key.env_parent_id.clone(),
                },
            );
        }
        response
    }

    fn graph_for(&self, device_id: &KeyableId) -> OrgGraph {
        let mut graph = self.graph.clone();
        if let Some(acked) = self.acked.get(device_id) {
            graph.pubkey_revocation_requests.retain(|id, _| !acked.contains(id));
            graph.root_pubkey_replacements.retain(|id, _| !acked.contains(id));
        }
        graph
    }

    fn write_envs(
        &mut self,
        oracle: &dyn PermissionOracle,
        ctx: &RequestContext,
        graph_updated_at: u64,
        params: EnvParams,
        mode: WriteMode<'_>,
    ) -> Result<ApiResponse> {
        self.check_graph_version(graph_updated_at)?;
        self.check_throttle()?;
        let now = self.tick();
        let reencrypted = match &mode {
            WriteMode::Reencrypt(ids) => Some((*ids).clone()),
            _ => None,
        };
        let key_count = self.apply_env_params(oracle, ctx, params, mode, now)?;

        if let Some(ids) = reencrypted {
            for id in &ids {
                self.graph.reencryption_queue.remove(id);
            }
            info!(environments = ids.len(), keys = key_count, "re-encrypted environments");
            self.reencrypt_batches.push(ids);
            let updated_at = self.commit_graph(oracle)?;
            return Ok(ApiResponse::Ok {
                graph_updated_at: updated_at,
            });
        }

        debug!(keys = key_count, "stored env params");
        Ok(ApiResponse::Ok {
            graph_updated_at: self.graph.updated_at,
        })
    }

    fn create_onboarding(
        &mut self,
        oracle: &dyn PermissionOracle,
        ctx: &RequestContext,
        params: CreateOnboardingParams,
    ) -> Result<ApiResponse> {
        self.check_graph_version(params.graph_updated_at)?;
        let onboarding = &params.onboarding;
        if onboarding.signed_by_id != ctx.device_id {
            return Err(forbidden("onboardings must be signed by the sending device"));
        }
        if self.graph.keyable(&onboarding.id).is_some() {
            return Err(SyncError::InvalidRequest(format!("{} already exists", onboarding.id)));
        }

        let org_permissions = oracle.org_permissions(&self.graph, &ctx.user_id);
        match onboarding.kind {
            OnboardingKind::Invite => {
                if !org_permissions.contains(&OrgPermission::InviteUsers) {
                    return Err(forbidden("inviting users requires invite permission"));
                }
                let new_user = params
                    .new_user
                    .as_ref()
                    .filter(|u| u.id == onboarding.target_user_id)
                    .ok_or_else(|| SyncError::InvalidRequest("invite needs the invited user".into()))?;
                if self.graph.users.contains_key(&new_user.id) {
                    return Err(SyncError::InvalidRequest(format!("user {} exists", new_user.id)));
                }
            }
            OnboardingKind::DeviceGrant => {
                if onboarding.target_user_id != ctx.user_id
                    && !org_permissions.contains(&OrgPermission::ManageDevices)
                {
                    return Err(forbidden("granting devices to others requires device permission"));
                }
                if !self.graph.users.contains_key(&onboarding.target_user_id) {
                    return Err(SyncError::NotFound(onboarding.target_user_id.to_string()));
                }
            }
            OnboardingKind::RecoveryKey => {
                if onboarding.target_user_id != ctx.user_id {
                    return Err(forbidden("recovery keys can only be created for yourself"));
                }
            }
        }

        let snapshot = self.graph.clone();
        let onboarding_id = onboarding.id.clone();
        let kind = onboarding.kind;
        if let Some(user) = params.new_user {
            self.graph.users.insert(user.id.clone(), user);
        }
        self.graph.app_user_grants.extend(params.app_user_grants);
        self.graph
            .onboardings
            .insert(onboarding_id.clone(), params.onboarding);

        let result = self.commit_graph(oracle).and_then(|updated_at| {
            self.apply_env_params(oracle, ctx, params.env_params, WriteMode::Grant, updated_at)
                .map(|keys| (updated_at, keys))
        });
        let (updated_at, keys) = match result {
            Ok(ok) => ok,
            Err(err) => {
                self.graph = snapshot;
                return Err(err);
            }
        };

        self.onboarding_payloads.insert(
            onboarding_id.clone(),
            OnboardingPayload {
                encrypted_privkey: params.encrypted_privkey,
                signed_trusted_root: params.signed_trusted_root,
            },
        );
        info!(onboarding = %onboarding_id, ?kind, keys, "created onboarding");
        Ok(ApiResponse::Ok {
            graph_updated_at: updated_at,
        })
    }

    fn load_onboarding(&mut self, onboarding_id: &KeyableId) -> Result<ApiResponse> {
        let now = self.tick();
        let onboarding = self
            .graph
            .onboardings
            .get(onboarding_id)
            .filter(|o| o.is_pending(now))
            .cloned()
            .ok_or_else(|| SyncError::NotFound(onboarding_id.to_string()))?;
        let payload = self
            .onboarding_payloads
            .get(onboarding_id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(onboarding_id.to_string()))?;

        let fetch = FetchEnvsParams {
            env_parent_ids: self.graph.env_parents.keys().cloned().collect(),
            include_changesets: true,
        };
        let envs = self.envs_for(onboarding_id, &fetch);
        Ok(ApiResponse::Onboarding(Box::new(OnboardingBundle {
            graph: self.graph.clone(),
            onboarding,
            encrypted_privkey: payload.encrypted_privkey,
            signed_trusted_root: payload.signed_trusted_root,
            envs,
        })))
    }

    fn accept_onboarding(
        &mut self,
        oracle: &dyn PermissionOracle,
        ctx: &RequestContext,
        params: AcceptOnboardingParams,
    ) -> Result<ApiResponse> {
        let now = self.tick();
        let onboarding = self
            .graph
            .onboardings
            .get(&params.onboarding_id)
            .filter(|o| o.is_pending(now))
            .ok_or_else(|| SyncError::NotFound(params.onboarding_id.to_string()))?;

        let device = &params.device;
        let expected_approval = onboarding.kind.approved_by(onboarding.id.clone());
        if onboarding.target_user_id != ctx.user_id
            || device.user_id != ctx.user_id
            || device.id != ctx.device_id
        {
            return Err(forbidden("onboarding belongs to another user"));
        }
        if device.approved_by.as_ref() != Some(&expected_approval) || device.pubkey.is_none() {
            return Err(SyncError::InvalidRequest("device must carry a pubkey and its approval".into()));
        }
        if self.graph.keyable(&device.id).is_some() {
            return Err(SyncError::InvalidRequest(format!("{} already exists", device.id)));
        }
        if !self.graph.users.get(&ctx.user_id).map_or(false, |u| u.is_active()) {
            return Err(forbidden(format!("user {} is not active", ctx.user_id)));
        }

        let kind = onboarding.kind;
        if let Some(o) = self.graph.onboardings.get_mut(&params.onboarding_id) {
            o.accepted_at = Some(now);
        }
        if kind == OnboardingKind::RecoveryKey {
            // Recovery replaces every other device of the user.
            let others: Vec<KeyableId> = self
                .graph
                .devices
                .values()
                .filter(|d| d.user_id == ctx.user_id)
                .map(|d| d.id.clone())
                .collect();
            for id in others {
                self.graph.remove_device(&id);
            }
        }
        self.graph.devices.insert(device.id.clone(), params.device);
        let updated_at = self.commit_graph(oracle)?;
        info!(onboarding = %params.onboarding_id, device = %ctx.device_id, "accepted onboarding");
        Ok(ApiResponse::Ok {
            graph_updated_at: updated_at,
        })
    }

    fn revoke_device(
        &mut self,
        oracle: &dyn PermissionOracle,
        ctx: &RequestContext,
        device_id: &KeyableId,
    ) -> Result<ApiResponse> {
        let device = self
            .graph
            .devices
            .get(device_id)
            .ok_or_else(|| SyncError::NotFound(device_id.to_string()))?;
        if device.user_id != ctx.user_id
            && !oracle
                .org_permissions(&self.graph, &ctx.user_id)
                .contains(&OrgPermission::ManageDevices)
        {
            return Err(forbidden(format!("{} may not revoke {}", ctx.user_id, device_id)));
        }

        let held: BTreeSet<EnvironmentId> = self
            .keys
            .get(device_id)
            .map(|composites| {
                composites
                    .keys()
                    .map(|c| c.owner_environment_id().clone())
                    .collect()
            })
            .unwrap_or_default();

        self.graph.remove_device(device_id);
        let now = self.tick();

        for environment_id in &held {
            let readers: BTreeSet<_> = self
                .graph
                .users
                .values()
                .filter(|u| u.is_active())
                .filter(|u| {
                    oracle
                        .environment_permissions(&self.graph, &u.id, environment_id)
                        .contains(&EnvironmentPermission::Read)
                })
                .map(|u| u.id.clone())
                .collect();
            if !readers.is_empty() {
                self.graph
                    .reencryption_queue
                    .entry(environment_id.clone())
                    .or_default()
                    .extend(readers);
            }
        }

        let request_id = RequestId::generate();
        self.graph.pubkey_revocation_requests.insert(
            request_id.clone(),
            PubkeyRevocationRequest {
                id: request_id,
                target_id: device_id.clone(),
                creator_id: ctx.user_id.clone(),
                created_at: now,
            },
        );
        let updated_at = self.commit_graph(oracle)?;
        info!(device = %device_id, queued = held.len(), "revoked device");
        Ok(ApiResponse::Ok {
            graph_updated_at: updated_at,
        })
    }

    fn handle(
        &mut self,
        oracle: &dyn PermissionOracle,
        ctx: &RequestContext,
        request: ApiRequest,
    ) -> Result<ApiResponse> {
        match request {
            ApiRequest::LoadOnboarding { onboarding_id } => return self.load_onboarding(&onboarding_id),
            ApiRequest::AcceptOnboarding(params) => return self.accept_onboarding(oracle, ctx, params),
            _ => {}
        }

        self.authorize(ctx)?;
        match request {
            ApiRequest::GetGraph => Ok(ApiResponse::Graph(Box::new(self.graph_for(&ctx.device_id)))),
            ApiRequest::FetchEnvs(params) => Ok(ApiResponse::Envs(self.envs_for(&ctx.device_id, &params))),
            ApiRequest::UpdateEnvs(params) => self.write_envs(
                oracle,
                ctx,
                params.graph_updated_at,
                params.env_params,
                WriteMode::Update,
            ),
            ApiRequest::ReencryptEnvs(params) => self.write_envs(
                oracle,
                ctx,
                params.graph_updated_at,
                params.env_params,
                WriteMode::Reencrypt(&params.environment_ids),
            ),
            ApiRequest::GrantKeys(params) => self.write_envs(
                oracle,
                ctx,
                params.graph_updated_at,
                params.env_params,
                WriteMode::Grant,
            ),
            ApiRequest::CreateOnboarding(params) => self.create_onboarding(oracle, ctx, *params),
            ApiRequest::RevokeDevice { device_id } => self.revoke_device(oracle, ctx, &device_id),
            ApiRequest::AckRequests { request_ids } => {
                self.acked
                    .entry(ctx.device_id.clone())
                    .or_default()
                    .extend(request_ids);
                Ok(ApiResponse::Ok {
                    graph_updated_at: self.graph.updated_at,
                })
            }
            ApiRequest::LoadOnboarding { .. } | ApiRequest::AcceptOnboarding(_) => {
                Err(SyncError::InvalidRequest("unreachable request routing".into()))
            }
        }
    }
}

/// A single-org server kept entirely in memory.
pub struct MemoryServer {
    state: Mutex<ServerState>,
    oracle: Arc<dyn PermissionOracle>,
}

impl MemoryServer {
    /// Serve `graph` with role-based permissions and default config.
    pub fn new(graph: OrgGraph) -> Self {
        Self::with_config(graph, MemoryServerConfig::default())
    }

    pub fn with_config(mut graph: OrgGraph, config: MemoryServerConfig) -> Self {
        let clock = now_millis().max(graph.updated_at + 1);
        graph.updated_at = clock;
        Self {
            state: Mutex::new(ServerState {
                config,
                graph,
                clock,
                keys: BTreeMap::new(),
                blobs: BTreeMap::new(),
                changesets: BTreeMap::new(),
                onboarding_payloads: BTreeMap::new(),
                acked: BTreeMap::new(),
                writes: 0,
                throttled: false,
                reencrypt_batches: Vec::new(),
            }),
            oracle: Arc::new(RolePermissions),
        }
    }

    /// Swap the permission rules.
    pub fn with_oracle(mut self, oracle: Arc<dyn PermissionOracle>) -> Self {
        self.oracle = oracle;
        self
    }

    /// Current graph, unfiltered.
    pub async fn graph(&self) -> OrgGraph {
        self.state.lock().await.graph.clone()
    }

    /// Apply an out-of-band graph change, as an admin action would.
    pub async fn update_graph<F>(&self, f: F) -> Result<u64>
    where
        F: FnOnce(&mut OrgGraph),
    {
        let mut state = self.state.lock().await;
        f(&mut state.graph);
        state.commit_graph(self.oracle.as_ref())
    }

    pub async fn set_throttled(&self, throttled: bool) {
        let mut state = self.state.lock().await;
        state.throttled = throttled;
        if !throttled {
            state.writes = 0;
            state.config.write_limit = None;
        }
    }

    /// Composites `recipient_id` holds keys for.
    pub async fn keys_held_by(&self, recipient_id: &KeyableId) -> BTreeSet<Composite> {
        self.state
            .lock()
            .await
            .keys
            .get(recipient_id)
            .map(|composites| composites.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn blob(&self, composite: &Composite) -> Option<EncryptedBlob> {
        self.state.lock().await.blobs.get(composite).cloned()
    }

    pub async fn changesets(&self, environment_id: &EnvironmentId) -> Vec<EncryptedChangesetBlob> {
        self.state
            .lock()
            .await
            .changesets
            .get(environment_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Environment ids of every accepted re-encryption request, in order.
    pub async fn reencrypt_batches(&self) -> Vec<BTreeSet<EnvironmentId>> {
        self.state.lock().await.reencrypt_batches.clone()
    }
}

#[async_trait]
impl Transport for MemoryServer {
    async fn dispatch(&self, ctx: &RequestContext, request: ApiRequest) -> Result<ApiResponse> {
        let name = request.name();
        let mut state = self.state.lock().await;
        let result = state.handle(self.oracle.as_ref(), ctx, request);
        match &result {
            Ok(_) => debug!(request = name, device = %ctx.device_id, "handled request"),
            Err(err) => warn!(request = name, device = %ctx.device_id, error = %err, "rejected request"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{KeyPath, EnvTarget, EnvironmentSlot, UpdateEnvsParams};
    use envseal_core::crypto::{encrypt, encrypt_with_key};
    use envseal_core::{AccountId, Blake3Hash, Keypair, OrgId, RoleId, SymmetricKey, UserId};
    use envseal_graph::{
        AppRole, EnvParent, EnvParentKind, Environment, Org, OrgRole, OrgUser, OrgUserDevice, UserKind,
    };

    struct Fixture {
        server: MemoryServer,
        owner: RequestContext,
        owner_keys: Keypair,
        dev: RequestContext,
    }

    fn ctx(user: &str, device: &str) -> RequestContext {
        RequestContext {
            account_id: AccountId::new(format!("acct-{}", user)),
            org_id: OrgId::new("org"),
            user_id: UserId::new(user),
            device_id: KeyableId::new(device),
        }
    }

    fn fixture() -> Fixture {
        let mut graph = OrgGraph::new(Org {
            id: OrgId::new("org"),
            name: "Org".into(),
        });
        graph.org_roles.insert(
            RoleId::new("owner"),
            OrgRole {
                id: RoleId::new("owner"),
                name: "Owner".into(),
                auto_app_role_id: Some(RoleId::new("admin")),
                org_permissions: [OrgPermission::InviteUsers, OrgPermission::ManageDevices]
                    .into_iter()
                    .collect(),
            },
        );
        graph.org_roles.insert(
            RoleId::new("basic"),
            OrgRole {
                id: RoleId::new("basic"),
                name: "Basic".into(),
                auto_app_role_id: None,
                org_permissions: BTreeSet::new(),
            },
        );
        let all: BTreeSet<_> = [EnvironmentPermission::Read, EnvironmentPermission::Write]
            .into_iter()
            .collect();
        graph.app_roles.insert(
            RoleId::new("admin"),
            AppRole {
                id: RoleId::new("admin"),
                name: "Admin".into(),
                app_permissions: BTreeSet::new(),
                environment_permissions: [(RoleId::new("development"), all)].into_iter().collect(),
            },
        );
        graph.env_parents.insert(
            EnvParentId::new("app"),
            EnvParent {
                id: EnvParentId::new("app"),
                name: "app".into(),
                kind: EnvParentKind::App,
            },
        );
        graph.environments.insert(
            EnvironmentId::new("app-dev"),
            Environment {
                id: EnvironmentId::new("app-dev"),
                env_parent_id: EnvParentId::new("app"),
                environment_role_id: RoleId::new("development"),
                is_sub: false,
                parent_environment_id: None,
                sub_name: None,
                inheriting_from: BTreeSet::new(),
            },
        );

        let owner_keys = Keypair::generate();
        for (user, role, device, keys) in [
            ("u-owner", "owner", "d-owner", owner_keys.pubkey.clone()),
            ("u-dev", "basic", "d-dev", Keypair::generate().pubkey),
        ] {
            graph.users.insert(
                UserId::new(user),
                OrgUser {
                    id: UserId::new(user),
                    name: user.into(),
                    kind: UserKind::Person,
                    org_role_id: RoleId::new(role),
                    deactivated_at: None,
                },
            );
            graph.devices.insert(
                KeyableId::new(device),
                OrgUserDevice {
                    id: KeyableId::new(device),
                    user_id: UserId::new(user),
                    name: device.into(),
                    pubkey: Some(keys),
                    is_root: user == "u-owner",
                    approved_by: None,
                    created_at: 1,
                },
            );
        }

        Fixture {
            server: MemoryServer::new(graph),
            owner: ctx("u-owner", "d-owner"),
            owner_keys,
            dev: ctx("u-dev", "d-dev"),
        }
    }

    fn dev_env_params(fx: &Fixture, recipient: &str) -> EnvParams {
        let key = SymmetricKey::generate();
        let env = EnvironmentId::new("app-dev");
        let mut params = EnvParams::new(fx.owner.device_id.clone());
        params.keys.insert(
            &KeyPath::User {
                user_id: UserId::new("u-owner"),
                device_id: KeyableId::new(recipient),
                env_parent_id: EnvParentId::new("app"),
                target: EnvTarget::Environment(env.clone()),
                slot: EnvironmentSlot::Env,
            },
            encrypt(&fx.owner_keys.pubkey, &fx.owner_keys.privkey, key.as_bytes()).unwrap(),
        );
        params
            .blobs
            .insert(Composite::env(&env), encrypt_with_key(b"{}", &key).unwrap());
        params
    }

    async fn updated_at(server: &MemoryServer) -> u64 {
        server.graph().await.updated_at
    }

    #[tokio::test]
    async fn test_update_and_fetch_envs() {
        let fx = fixture();
        let params = UpdateEnvsParams {
            graph_updated_at: updated_at(&fx.server).await,
            env_params: dev_env_params(&fx, "d-owner"),
        };
        fx.server
            .dispatch(&fx.owner, ApiRequest::UpdateEnvs(params))
            .await
            .unwrap();

        let response = fx
            .server
            .dispatch(
                &fx.owner,
                ApiRequest::FetchEnvs(FetchEnvsParams {
                    env_parent_ids: [EnvParentId::new("app")].into_iter().collect(),
                    include_changesets: false,
                }),
            )
            .await
            .unwrap();
        let ApiResponse::Envs(envs) = response else {
            panic!("expected envs");
        };
        let composite = Composite::env(&EnvironmentId::new("app-dev"));
        assert!(envs.keys.contains_key(&composite));
        assert!(envs.blobs.contains_key(&composite));
        assert_eq!(envs.keys[&composite].encrypted_by_id, KeyableId::new("d-owner"));
    }

    #[tokio::test]
    async fn test_stale_graph_is_rejected() {
        let fx = fixture();
        let params = UpdateEnvsParams {
            graph_updated_at: 1,
            env_params: dev_env_params(&fx, "d-owner"),
        };
        let err = fx
            .server
            .dispatch(&fx.owner, ApiRequest::UpdateEnvs(params))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::GraphOutdated { .. }));
    }

    #[tokio::test]
    async fn test_keys_for_unentitled_recipient_are_rejected() {
        let fx = fixture();
        let params = UpdateEnvsParams {
            graph_updated_at: updated_at(&fx.server).await,
            env_params: dev_env_params(&fx, "d-dev"),
        };
        let err = fx
            .server
            .dispatch(&fx.owner, ApiRequest::UpdateEnvs(params))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_unknown_device_is_forbidden() {
        let fx = fixture();
        let err = fx
            .server
            .dispatch(&ctx("u-owner", "d-stolen"), ApiRequest::GetGraph)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_write_limit_throttles() {
        let fx = fixture();
        fx.server
            .state
            .lock()
            .await
            .config
            .write_limit = Some(1);

        for expect_ok in [true, false] {
            let params = UpdateEnvsParams {
                graph_updated_at: updated_at(&fx.server).await,
                env_params: dev_env_params(&fx, "d-owner"),
            };
            let result = fx.server.dispatch(&fx.owner, ApiRequest::UpdateEnvs(params)).await;
            assert_eq!(result.is_ok(), expect_ok);
        }

        fx.server.set_throttled(false).await;
        let params = UpdateEnvsParams {
            graph_updated_at: updated_at(&fx.server).await,
            env_params: dev_env_params(&fx, "d-owner"),
        };
        assert!(fx.server.dispatch(&fx.owner, ApiRequest::UpdateEnvs(params)).await.is_ok());
    }

    #[tokio::test]
    async fn test_revoke_device_queues_reencryption_and_hides_acked_requests() {
        let fx = fixture();
        fx.server
            .update_graph(|g| {
                g.devices.insert(
                    KeyableId::new("d-owner-2"),
                    OrgUserDevice {
                        id: KeyableId::new("d-owner-2"),
                        user_id: UserId::new("u-owner"),
                        name: "phone".into(),
                        pubkey: Some(Keypair::generate().pubkey),
                        is_root: false,
                        approved_by: None,
                        created_at: 2,
                    },
                );
            })
            .await
            .unwrap();
        let params = UpdateEnvsParams {
            graph_updated_at: updated_at(&fx.server).await,
            env_params: dev_env_params(&fx, "d-owner-2"),
        };
        fx.server
            .dispatch(&fx.owner, ApiRequest::UpdateEnvs(params))
            .await
            .unwrap();

        fx.server
            .dispatch(
                &fx.owner,
                ApiRequest::RevokeDevice {
                    device_id: KeyableId::new("d-owner-2"),
                },
            )
            .await
            .unwrap();

        let graph = fx.server.graph().await;
        assert!(!graph.devices.contains_key(&KeyableId::new("d-owner-2")));
        assert!(graph.reencryption_queue[&EnvironmentId::new("app-dev")].contains(&UserId::new("u-owner")));
        assert!(fx.server.keys_held_by(&KeyableId::new("d-owner-2")).await.is_empty());
        let request_ids: BTreeSet<_> = graph.pubkey_revocation_requests.keys().cloned().collect();
        assert_eq!(request_ids.len(), 1);

        fx.server
            .dispatch(&fx.owner, ApiRequest::AckRequests { request_ids })
            .await
            .unwrap();
        let ApiResponse::Graph(seen) = fx.server.dispatch(&fx.owner, ApiRequest::GetGraph).await.unwrap() else {
            panic!("expected graph");
        };
        assert!(seen.pubkey_revocation_requests.is_empty());
    }

    #[tokio::test]
    async fn test_basic_user_cannot_revoke_others() {
        let fx = fixture();
        let err = fx
            .server
            .dispatch(
                &fx.dev,
                ApiRequest::RevokeDevice {
                    device_id: KeyableId::new("d-owner"),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Forbidden(_)));
    }

    #[tokio::test]
    async fn test_load_unknown_onboarding_is_not_found() {
        let fx = fixture();
        let err = fx
            .server
            .dispatch(
                &fx.dev,
                ApiRequest::LoadOnboarding {
                    onboarding_id: KeyableId::new(Blake3Hash::hash(b"x").to_hex()),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }
}
