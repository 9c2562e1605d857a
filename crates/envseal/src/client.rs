//! The client: one signed-in device's view of an org.
//!
//! The client brings together the trust registries, the decrypted env
//! cache, pending edits and the server transport behind one API.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

use envseal_core::{
    CryptoProvider, DalekCrypto, EnvParentId, EnvironmentId, KeyableId, TrustedPubkey,
    TrustedPubkeys,
};
use envseal_graph::{
    current_key_set, required_envs_for_key_set, Composite, EnvWithMeta, EnvironmentPermission,
    KeySet, KeySetScope, OrgGraph, PermissionOracle, RolePermissions,
};
use envseal_store::{InsertResult, TrustStore};
use envseal_sync::{
    ApiRequest, ApiResponse, ChangesetParams, FetchEnvsParams, FetchEnvsResponse, SyncError,
    Transport, UpdateEnvsParams,
};

use crate::config::ClientConfig;
use crate::context::ClientContext;
use crate::decrypt::Decryptor;
use crate::encrypt::{seal_changeset, EncryptOptions, EncryptedEnvs, Encryptor};
use crate::error::{ClientError, Result};
use crate::pending::{self, Changeset, EnvEdit, PendingEnvUpdate};
use crate::state::{CachedChangesets, ClientState, DecryptedEnvs, StateAction};
use crate::trust;

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The oracles and backends a client talks to.
#[derive(Clone)]
pub struct Services {
    pub crypto: Arc<dyn CryptoProvider>,
    pub oracle: Arc<dyn PermissionOracle>,
    pub transport: Arc<dyn Transport>,
    pub store: Arc<dyn TrustStore>,
}

impl Services {
    /// Default crypto and role-based permissions over the given backends.
    pub fn new(transport: Arc<dyn Transport>, store: Arc<dyn TrustStore>) -> Self {
        Self {
            crypto: Arc::new(DalekCrypto),
            oracle: Arc::new(RolePermissions),
            transport,
            store,
        }
    }
}

/// A signed-in device.
///
/// State changes go through [`StateAction`]s applied under a single write
/// lock. Operations that change who holds which keys also take a lock per
/// env parent they touch, always in id order.
pub struct Client {
    pub(crate) ctx: ClientContext,
    pub(crate) config: ClientConfig,
    pub(crate) services: Services,
    state: RwLock<ClientState>,
    env_parent_locks: Mutex<BTreeMap<EnvParentId, Arc<Mutex<()>>>>,
}

impl Client {
    /// Open a client for an existing device.
    ///
    /// Loads root trust from the store and the graph from the server. A
    /// root device with nothing stored yet trusts its own pubkey.
    pub async fn open(ctx: ClientContext, config: ClientConfig, services: Services) -> Result<Self> {
        let root = services.store.load_root(&ctx.account_id).await?;
        let client = Self::with_state(ctx, config, services, ClientState::default());
        client.apply(StateAction::SetTrustedRoot(root)).await;

        let graph = client.fetch_graph().await?;
        if client.snapshot().await.trusted_root.is_empty() {
            client.bootstrap_root(&graph).await?;
        }
        client.reconcile_trust().await?;
        info!(device = %client.ctx.device_id, "opened client");
        Ok(client)
    }

    pub(crate) fn with_state(
        ctx: ClientContext,
        config: ClientConfig,
        services: Services,
        state: ClientState,
    ) -> Self {
        Self {
            ctx,
            config,
            services,
            state: RwLock::new(state),
            env_parent_locks: Mutex::new(BTreeMap::new()),
        }
    }

    /// Trust this device's own pubkey when the graph marks it as root.
    async fn bootstrap_root(&self, graph: &OrgGraph) -> Result<()> {
        let Some(device) = graph.devices.get(&self.ctx.device_id).filter(|d| d.is_root) else {
            warn!(device = %self.ctx.device_id, "no trusted root stored for this device");
            return Ok(());
        };
        let matches = device
            .pubkey
            .as_ref()
            .map_or(false, |p| p.keys == self.ctx.pubkey().keys);
        if !matches {
            return Err(ClientError::Integrity(format!(
                "graph pubkey of root device {} does not match the local key",
                device.id
            )));
        }

        let trusted = trust::trust_attributes(graph, &self.ctx.device_id)?.to_trusted();
        self.persist_root(&self.ctx.device_id, &trusted).await?;
        let root: TrustedPubkeys = [(self.ctx.device_id.clone(), trusted)].into_iter().collect();
        self.apply(StateAction::SetTrustedRoot(root)).await;
        info!(device = %self.ctx.device_id, "bootstrapped root trust");
        Ok(())
    }

    pub(crate) async fn persist_root(&self, pubkey_id: &KeyableId, trusted: &TrustedPubkey) -> Result<()> {
        let result = self
            .services
            .store
            .insert_root_if_absent(&self.ctx.account_id, pubkey_id, trusted)
            .await?;
        if let InsertResult::Conflict { .. } = result {
            warn!(pubkey = %pubkey_id, "keeping existing root entry");
        }
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // State
    // ─────────────────────────────────────────────────────────────────────────

    pub(crate) async fn apply(&self, action: StateAction) {
        self.state.write().await.apply(action);
    }

    /// A copy of the current state.
    pub async fn snapshot(&self) -> ClientState {
        self.state.read().await.clone()
    }

    pub(crate) async fn graph(&self) -> Result<OrgGraph> {
        self.state
            .read()
            .await
            .graph
            .clone()
            .ok_or_else(|| ClientError::InvalidOperation("graph not loaded".into()))
    }

    pub fn context(&self) -> &ClientContext {
        &self.ctx
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn trusted_root(&self) -> TrustedPubkeys {
        self.state.read().await.trusted_root.clone()
    }

    pub async fn trusted_session_pubkeys(&self) -> TrustedPubkeys {
        self.state.read().await.trusted_session_pubkeys.clone()
    }

    /// Content of an environment with pending edits applied.
    pub async fn env(&self, environment_id: &EnvironmentId) -> Result<EnvWithMeta> {
        self.state.read().await.env_with_pending(environment_id)
    }

    /// Last committed content of an environment.
    pub async fn committed_env(&self, environment_id: &EnvironmentId) -> Result<EnvWithMeta> {
        self.state.read().await.committed_env(environment_id)
    }

    pub async fn changesets(&self, environment_id: &EnvironmentId) -> Vec<Changeset> {
        self.state.read().await.changesets_for(environment_id)
    }

    pub async fn pending(&self) -> Vec<PendingEnvUpdate> {
        self.state.read().await.pending.clone()
    }

    pub async fn throttle_error(&self) -> Option<String> {
        self.state.read().await.throttle_error.clone()
    }

    pub async fn clear_throttle_error(&self) {
        self.apply(StateAction::ClearThrottleError).await;
    }

    /// Drop cached graph, session trust and envs after a fatal error.
    pub(crate) async fn reset_on_fatal(&self, err: &ClientError) {
        if err.is_fatal() {
            warn!(error = %err, "resetting client state to baseline");
            self.apply(StateAction::ResetToBaseline).await;
        }
    }

    pub(crate) async fn trust_verified(&self, entries: Vec<(KeyableId, TrustedPubkey)>) {
        if !entries.is_empty() {
            self.apply(StateAction::TrustSessionPubkeys(entries)).await;
        }
    }

    /// Lock `env_parent_ids` in id order.
    ///
    /// Locks nobody holds or waits on are dropped from the map first.
    pub(crate) async fn lock_env_parents(
        &self,
        env_parent_ids: &BTreeSet<EnvParentId>,
    ) -> Vec<OwnedMutexGuard<()>> {
        let locks: Vec<Arc<Mutex<()>>> = {
            let mut map = self.env_parent_locks.lock().await;
            map.retain(|id, lock| Arc::strong_count(lock) > 1 || env_parent_ids.contains(id));
            env_parent_ids
                .iter()
                .map(|id| map.entry(id.clone()).or_default().clone())
                .collect()
        };
        let mut guards = Vec::with_capacity(locks.len());
        for lock in locks {
            guards.push(lock.lock_owned().await);
        }
        guards
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Server
    // ─────────────────────────────────────────────────────────────────────────

    pub(crate) async fn send(&self, request: ApiRequest) -> Result<ApiResponse> {
        let name = request.name();
        let response = self
            .services
            .transport
            .dispatch(&self.ctx.request_context(), request)
            .await;
        if let Err(err) = &response {
            debug!(request = name, error = %err, "request failed");
        }
        Ok(response?)
    }

    pub(crate) async fn send_ok(&self, request: ApiRequest) -> Result<u64> {
        match self.send(request).await? {
            ApiResponse::Ok { graph_updated_at } => Ok(graph_updated_at),
            _ => Err(ClientError::UnexpectedResponse("ok")),
        }
    }

    async fn fetch_graph(&self) -> Result<OrgGraph> {
        let ApiResponse::Graph(graph) = self.send(ApiRequest::GetGraph).await? else {
            return Err(ClientError::UnexpectedResponse("graph"));
        };
        let graph = *graph;
        self.apply(StateAction::SetGraph(Box::new(graph.clone()))).await;
        debug!(updated_at = graph.updated_at, "loaded graph");
        Ok(graph)
    }

    /// Load the latest graph, then process root replacements, outdated
    /// session trust and revocation requests it carries.
    pub async fn refresh_graph(&self) -> Result<u64> {
        let graph = self.fetch_graph().await?;
        self.reconcile_trust().await?;
        Ok(graph.updated_at)
    }

    /// Fetch and decrypt everything this device can read in
    /// `env_parent_ids`.
    pub async fn fetch_envs(
        &self,
        env_parent_ids: &BTreeSet<EnvParentId>,
        include_changesets: bool,
    ) -> Result<()> {
        self.apply(StateAction::InFlightStarted(env_parent_ids.clone())).await;
        let result = self.fetch_envs_inner(env_parent_ids, include_changesets).await;
        self.apply(StateAction::InFlightFinished(env_parent_ids.clone())).await;
        if let Err(err) = &result {
            self.reset_on_fatal(err).await;
        }
        result
    }

    async fn fetch_envs_inner(
        &self,
        env_parent_ids: &BTreeSet<EnvParentId>,
        include_changesets: bool,
    ) -> Result<()> {
        let response = self
            .send(ApiRequest::FetchEnvs(FetchEnvsParams {
                env_parent_ids: env_parent_ids.clone(),
                include_changesets,
            }))
            .await?;
        let ApiResponse::Envs(response) = response else {
            return Err(ClientError::UnexpectedResponse("envs"));
        };
        self.merge_fetched(&response).await
    }

    pub(crate) async fn merge_fetched(&self, response: &FetchEnvsResponse) -> Result<()> {
        let state = self.snapshot().await;
        let graph = state
            .graph
            .as_ref()
            .ok_or_else(|| ClientError::InvalidOperation("graph not loaded".into()))?;
        let decryptor = Decryptor {
            graph,
            trusted_root: &state.trusted_root,
            session: &state.trusted_session_pubkeys,
            crypto: self.services.crypto.as_ref(),
            privkey: &self.ctx.privkey,
        };
        let output = decryptor.decrypt_envs(response).await?;
        self.trust_verified(output.newly_trusted).await;
        self.apply(StateAction::MergeEnvs(Box::new(output.envs))).await;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Pending Edits
    // ─────────────────────────────────────────────────────────────────────────

    fn check_permission(
        &self,
        graph: &OrgGraph,
        environment_id: &EnvironmentId,
        permission: EnvironmentPermission,
    ) -> Result<()> {
        let permissions =
            self.services
                .oracle
                .environment_permissions(graph, &self.ctx.user_id, environment_id);
        if !permissions.contains(&permission) {
            return Err(ClientError::Authorization(format!(
                "{} lacks {:?} on {}",
                self.ctx.user_id, permission, environment_id
            )));
        }
        Ok(())
    }

    /// Queue an edit of `environment_id`.
    ///
    /// The environment's env parent must have been fetched.
    pub async fn update_env(&self, environment_id: &EnvironmentId, edit: EnvEdit) -> Result<()> {
        let mut state = self.state.write().await;
        let graph = state
            .graph
            .as_ref()
            .ok_or_else(|| ClientError::InvalidOperation("graph not loaded".into()))?;
        self.check_permission(graph, environment_id, EnvironmentPermission::Write)?;
        let env_parent_id = graph
            .env_parent_of(environment_id)
            .ok_or_else(|| ClientError::InvalidOperation(format!("unknown environment {}", environment_id)))?;
        if !state.envs_fetched_at.contains_key(&env_parent_id) {
            return Err(ClientError::TransientFetch(env_parent_id.to_string()));
        }

        let mut committed = state.committed_for_pending()?;
        committed.insert(environment_id.clone(), state.committed_env(environment_id)?);
        let updated = pending::add_pending(&state.pending, &committed, environment_id, edit, now_millis())?;
        debug!(environment = %environment_id, pending = updated.len(), "queued env edit");
        state.apply(StateAction::SetPending(updated));
        Ok(())
    }

    /// Discard pending edits of `environment_ids`, or of every environment.
    pub async fn reset_envs(&self, environment_ids: Option<&BTreeSet<EnvironmentId>>) {
        let mut state = self.state.write().await;
        let remaining: Vec<PendingEnvUpdate> = match environment_ids {
            Some(ids) => state
                .pending
                .iter()
                .filter(|u| !ids.contains(&u.meta.environment_id))
                .cloned()
                .collect(),
            None => Vec::new(),
        };
        state.apply(StateAction::SetPending(remaining));
    }

    /// Encrypt and send every pending edit, each environment under fresh
    /// keys, and record the edits as one changeset per environment.
    pub async fn commit_envs(&self) -> Result<()> {
        let (graph, environment_ids) = {
            let state = self.state.read().await;
            let graph = state
                .graph
                .clone()
                .ok_or_else(|| ClientError::InvalidOperation("graph not loaded".into()))?;
            (graph, pending::pending_environment_ids(&state.pending))
        };
        if environment_ids.is_empty() {
            return Ok(());
        }

        let mut env_parent_ids = BTreeSet::new();
        for id in &environment_ids {
            self.check_permission(&graph, id, EnvironmentPermission::Write)?;
            env_parent_ids.insert(
                graph
                    .env_parent_of(id)
                    .ok_or_else(|| ClientError::InvalidOperation(format!("unknown environment {}", id)))?,
            );
        }

        let _guards = self.lock_env_parents(&env_parent_ids).await;
        // A revocation may have refreshed the graph while we waited.
        let graph = self.graph().await?;
        let missing: BTreeSet<EnvParentId> = {
            let state = self.state.read().await;
            env_parent_ids
                .iter()
                .filter(|id| !state.changesets_fetched_at.contains_key(*id))
                .cloned()
                .collect()
        };
        if !missing.is_empty() {
            self.fetch_envs(&missing, true).await?;
        }

        self.apply(StateAction::InFlightStarted(env_parent_ids.clone())).await;
        let result = self.commit_locked(&graph, &environment_ids).await;
        self.apply(StateAction::InFlightFinished(env_parent_ids)).await;

        match &result {
            Err(ClientError::Throttled(msg)) => {
                self.apply(StateAction::SetThrottleError(msg.clone())).await;
            }
            Err(err) => self.reset_on_fatal(err).await,
            Ok(()) => {}
        }
        result
    }

    async fn commit_locked(&self, graph: &OrgGraph, environment_ids: &BTreeSet<EnvironmentId>) -> Result<()> {
        let state = self.snapshot().await;
        let now = now_millis();
        let encryptor = Encryptor {
            state: &state,
            graph,
            crypto: self.services.crypto.as_ref(),
            oracle: self.services.oracle.as_ref(),
            ctx: &self.ctx,
            now,
        };
        let opts = EncryptOptions {
            pending: true,
            ..Default::default()
        };
        let mut encrypted = encryptor
            .encrypted_key_params_for_environments(environment_ids, opts)
            .await?;

        for (environment_id, key) in &encrypted.changeset_keys {
            let actions: Vec<PendingEnvUpdate> = state
                .pending
                .iter()
                .filter(|u| &u.meta.environment_id == environment_id)
                .cloned()
                .collect();
            let changeset = Changeset {
                id: uuid::Uuid::new_v4().to_string(),
                created_at: now,
                created_by_id: self.ctx.user_id.clone(),
                actions,
            };
            let blob = seal_changeset(self.services.crypto.as_ref(), &changeset, key).await?;
            encrypted
                .env_params
                .changesets
                .entry(environment_id.clone())
                .or_insert_with(|| ChangesetParams {
                    blobs: Vec::new(),
                    replace: false,
                })
                .blobs
                .push(blob);

            let composite = Composite::changesets(environment_id);
            let mut history = match encrypted.changesets.remove(&composite) {
                Some(rotated) => rotated.changesets,
                None => state.changesets_for(environment_id),
            };
            history.push(changeset);
            encrypted.changesets.insert(
                composite,
                CachedChangesets {
                    env_parent_id: graph
                        .env_parent_of(environment_id)
                        .ok_or_else(|| ClientError::InvalidOperation(format!("unknown environment {}", environment_id)))?,
                    key: key.clone(),
                    changesets: history,
                },
            );
        }

        self.send_ok(ApiRequest::UpdateEnvs(UpdateEnvsParams {
            graph_updated_at: graph.updated_at,
            env_params: encrypted.env_params,
        }))
        .await?;

        info!(environments = environment_ids.len(), "committed env edits");
        self.trust_verified(encrypted.newly_trusted).await;
        self.apply(StateAction::StoreEnvs {
            envs: encrypted.envs,
            changesets: encrypted.changesets,
        })
        .await;

        let mut state = self.state.write().await;
        let remaining: Vec<PendingEnvUpdate> = state
            .pending
            .iter()
            .filter(|u| !environment_ids.contains(&u.meta.environment_id))
            .cloned()
            .collect();
        state.apply(StateAction::SetPending(remaining));
        Ok(())
    }

    /// Write empty content under fresh keys for environments nothing has
    /// been written to yet.
    pub async fn initialize_environments(&self, environment_ids: &BTreeSet<EnvironmentId>) -> Result<()> {
        let graph = self.graph().await?;
        let mut env_parent_ids = BTreeSet::new();
        for id in environment_ids {
            self.check_permission(&graph, id, EnvironmentPermission::Write)?;
            if let Some(parent) = graph.env_parent_of(id) {
                env_parent_ids.insert(parent);
            }
        }
        let _guards = self.lock_env_parents(&env_parent_ids).await;
        self.fetch_envs(&env_parent_ids, true).await?;

        let state = self.snapshot().await;
        let encryptor = Encryptor {
            state: &state,
            graph: &graph,
            crypto: self.services.crypto.as_ref(),
            oracle: self.services.oracle.as_ref(),
            ctx: &self.ctx,
            now: now_millis(),
        };
        let opts = EncryptOptions {
            new_keys_only: true,
            ..Default::default()
        };
        let encrypted = encryptor
            .encrypted_key_params_for_environments(environment_ids, opts)
            .await?;
        if encrypted.env_params.is_empty() {
            return Ok(());
        }
        self.send_ok(ApiRequest::UpdateEnvs(UpdateEnvsParams {
            graph_updated_at: graph.updated_at,
            env_params: encrypted.env_params,
        }))
        .await?;
        self.trust_verified(encrypted.newly_trusted).await;
        self.apply(StateAction::StoreEnvs {
            envs: encrypted.envs,
            changesets: encrypted.changesets,
        })
        .await;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Key Grants
    // ─────────────────────────────────────────────────────────────────────────

    /// Encrypt `key_set` against `graph`, fetching missing envs between
    /// attempts.
    pub(crate) async fn encrypt_key_set_with_retries(
        &self,
        graph: &OrgGraph,
        key_set: &KeySet,
    ) -> Result<EncryptedEnvs> {
        let attempts = self.config.fetch_retry_attempts;
        for attempt in 0..=attempts {
            let state = self.snapshot().await;
            let encryptor = Encryptor {
                state: &state,
                graph,
                crypto: self.services.crypto.as_ref(),
                oracle: self.services.oracle.as_ref(),
                ctx: &self.ctx,
                now: now_millis(),
            };
            match encryptor.encrypted_key_params_for_key_set(key_set).await {
                Err(ClientError::TransientFetch(missing)) => {
                    if attempt == attempts {
                        warn!(attempts, missing = %missing, "envs required by key set still missing");
                        break;
                    }
                    debug!(attempt, missing = %missing, "fetching envs required by key set");
                    let required = required_envs_for_key_set(graph, key_set);
                    let include_changesets = !required.changesets.is_empty();
                    let mut env_parent_ids = required.envs;
                    env_parent_ids.extend(required.changesets);
                    match self.fetch_envs(&env_parent_ids, include_changesets).await {
                        Ok(()) => {}
                        Err(ClientError::Sync(SyncError::Transport(msg))) => {
                            warn!(attempt, error = %msg, "fetch for key set failed");
                        }
                        Err(err) => return Err(err),
                    }
                }
                other => return other,
            }
        }
        Err(ClientError::Timeout(format!(
            "envs required by key set still missing after {} fetches",
            attempts
        )))
    }

    /// Give every recipient in `key_set` the keys this device holds for
    /// them.
    pub async fn grant_key_set(&self, key_set: &KeySet) -> Result<()> {
        let graph = self.graph().await?;
        let env_parent_ids = key_set.env_parent_ids();
        let _guards = self.lock_env_parents(&env_parent_ids).await;

        let result: Result<()> = async {
            let encrypted = self.encrypt_key_set_with_retries(&graph, key_set).await?;
            self.trust_verified(encrypted.newly_trusted).await;
            if encrypted.env_params.keys.is_empty() {
                debug!("nothing to grant");
                return Ok(());
            }
            self.send_ok(ApiRequest::GrantKeys(UpdateEnvsParams {
                graph_updated_at: graph.updated_at,
                env_params: encrypted.env_params,
            }))
            .await?;
            info!(env_parents = env_parent_ids.len(), "granted keys");
            Ok(())
        }
        .await;
        if let Err(err) = &result {
            self.reset_on_fatal(err).await;
        }
        result
    }

    /// Grant the keys the graph entitles `recipient_id` to.
    pub async fn grant_keys_to(&self, recipient_id: &KeyableId) -> Result<()> {
        let graph = self.graph().await?;
        let user_id = graph
            .keyable_user_id(recipient_id)
            .ok_or_else(|| ClientError::InvalidOperation(format!("{} is not a user key", recipient_id)))?;
        let mut key_set = current_key_set(
            &graph,
            self.services.oracle.as_ref(),
            now_millis(),
            &KeySetScope::users([user_id]),
        );
        for devices in key_set.users.values_mut() {
            devices.retain(|id, _| id == recipient_id);
        }
        key_set.users.retain(|_, devices| !devices.is_empty());
        self.grant_key_set(&key_set).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Devices
    // ─────────────────────────────────────────────────────────────────────────

    /// Env parents `device_id` holds keys in according to `graph`.
    fn device_env_parents(&self, graph: &OrgGraph, device_id: &KeyableId) -> BTreeSet<EnvParentId> {
        let Some(user_id) = graph.keyable_user_id(device_id) else {
            return BTreeSet::new();
        };
        let mut key_set = current_key_set(
            graph,
            self.services.oracle.as_ref(),
            now_millis(),
            &KeySetScope::users([user_id]),
        );
        for devices in key_set.users.values_mut() {
            devices.retain(|id, _| id == device_id);
        }
        key_set.env_parent_ids()
    }

    /// Revoke a device, then rotate every environment it could read.
    ///
    /// Commits and grants on the device's env parents wait until the
    /// revocation is reflected in the local graph.
    pub async fn revoke_device(&self, device_id: &KeyableId) -> Result<()> {
        let graph = self.graph().await?;
        let env_parent_ids = self.device_env_parents(&graph, device_id);
        {
            let _guards = self.lock_env_parents(&env_parent_ids).await;
            self.send_ok(ApiRequest::RevokeDevice {
                device_id: device_id.clone(),
            })
            .await?;
            info!(device = %device_id, env_parents = env_parent_ids.len(), "revoked device");
            self.refresh_graph().await?;
        }
        self.reencrypt_if_needed().await?;
        Ok(())
    }

    /// Seed a client with state decrypted before it had a device.
    pub(crate) async fn seed(
        &self,
        root: TrustedPubkeys,
        session: Vec<(KeyableId, TrustedPubkey)>,
        envs: DecryptedEnvs,
    ) {
        self.apply(StateAction::SetTrustedRoot(root)).await;
        self.trust_verified(session).await;
        self.apply(StateAction::MergeEnvs(Box::new(envs))).await;
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("ctx", &self.ctx)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
