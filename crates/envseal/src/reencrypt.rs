//! Rotating keys of environments queued for re-encryption.
//!
//! After a revocation the server queues the affected environments for every
//! user who can still read them. Whichever of their devices gets there
//! first rotates the keys and the queue entry disappears for everyone. The
//! loop waits a random delay before each batch so devices reacting to the
//! same event spread out, then rotates one randomly chosen window of the
//! queue.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

use envseal_core::{EnvParentId, EnvironmentId};
use envseal_graph::OrgGraph;
use envseal_sync::{ApiRequest, ReencryptEnvsParams};

use crate::client::{now_millis, Client};
use crate::config::ReencryptionConfig;
use crate::encrypt::{EncryptOptions, Encryptor};
use crate::error::{ClientError, Result};
use crate::state::StateAction;

/// What one run of the loop did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReencryptReport {
    /// Environment ids of each dispatched batch, in order.
    pub batches: Vec<BTreeSet<EnvironmentId>>,
}

impl ReencryptReport {
    pub fn environment_count(&self) -> usize {
        self.batches.iter().map(BTreeSet::len).sum()
    }
}

/// Environments queued for `user_id`, in id order.
pub fn queued_for(graph: &OrgGraph, user_id: &envseal_core::UserId) -> Vec<EnvironmentId> {
    graph
        .reencryption_queue
        .iter()
        .filter(|(_, users)| users.contains(user_id))
        .map(|(id, _)| id.clone())
        .collect()
}

/// Pick one window `[n * batch_size, (n + 1) * batch_size)` of `queue`.
pub fn select_batch(queue: &[EnvironmentId], batch_size: usize, rng: &mut StdRng) -> BTreeSet<EnvironmentId> {
    if queue.is_empty() {
        return BTreeSet::new();
    }
    let batch_size = batch_size.max(1);
    let windows = queue.len().div_ceil(batch_size);
    let n = rng.gen_range(0..windows);
    let start = n * batch_size;
    let end = ((n + 1) * batch_size).min(queue.len());
    queue[start..end].iter().cloned().collect()
}

fn jittered_delay(config: &ReencryptionConfig, rng: &mut StdRng) -> Duration {
    let jitter_ms = config.jitter.as_millis() as u64;
    let extra = if jitter_ms == 0 { 0 } else { rng.gen_range(0..=jitter_ms) };
    config.min_delay + Duration::from_millis(extra)
}

impl Client {
    /// Re-encrypt everything queued for this user, seeding randomness from
    /// the OS.
    pub async fn reencrypt_if_needed(&self) -> Result<ReencryptReport> {
        let mut rng = StdRng::from_entropy();
        self.reencrypt_if_needed_with_rng(&mut rng).await
    }

    /// Re-encrypt everything queued for this user.
    ///
    /// Stops at the first failure. A `StaleGraph` error means another
    /// writer moved the graph on; the caller should refresh and call again.
    pub async fn reencrypt_if_needed_with_rng(&self, rng: &mut StdRng) -> Result<ReencryptReport> {
        let config = self.config.reencryption.clone();
        let mut report = ReencryptReport::default();

        loop {
            let graph = self.graph().await?;
            if queued_for(&graph, &self.ctx.user_id).is_empty() {
                break;
            }

            let delay = jittered_delay(&config, rng);
            if !delay.is_zero() {
                debug!(delay_ms = delay.as_millis() as u64, "waiting before re-encryption batch");
                sleep(delay).await;
            }

            self.refresh_graph().await?;
            let graph = self.graph().await?;
            let queue = queued_for(&graph, &self.ctx.user_id);
            if queue.is_empty() {
                break;
            }
            let batch = select_batch(&queue, config.batch_size, rng);
            debug!(queued = queue.len(), batch = batch.len(), "selected re-encryption batch");

            match self.reencrypt_batch(&graph, &batch).await {
                Ok(()) => report.batches.push(batch),
                Err(err @ ClientError::StaleGraph { .. }) => {
                    warn!(error = %err, "graph moved on during re-encryption");
                    return Err(err);
                }
                Err(err) => {
                    error!(error = %err, "re-encryption failed");
                    self.reset_on_fatal(&err).await;
                    return Err(err);
                }
            }
        }

        if !report.batches.is_empty() {
            info!(
                batches = report.batches.len(),
                environments = report.environment_count(),
                "re-encryption finished"
            );
        }
        Ok(report)
    }

    /// Wait until no fetch or update is running on `env_parent_ids`.
    async fn wait_for_in_flight(&self, env_parent_ids: &BTreeSet<EnvParentId>) -> Result<()> {
        let config = &self.config.reencryption;
        let deadline = Instant::now() + config.in_flight_timeout;
        loop {
            let count = self.snapshot().await.in_flight_count(env_parent_ids);
            if count == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(ClientError::Timeout(format!(
                    "{} operations still in flight on {} env parents",
                    count,
                    env_parent_ids.len()
                )));
            }
            sleep(config.poll_interval).await;
        }
    }

    async fn reencrypt_batch(&self, graph: &OrgGraph, batch: &BTreeSet<EnvironmentId>) -> Result<()> {
        let env_parent_ids: BTreeSet<EnvParentId> =
            batch.iter().filter_map(|id| graph.env_parent_of(id)).collect();

        self.wait_for_in_flight(&env_parent_ids).await?;
        let _guards = self.lock_env_parents(&env_parent_ids).await;
        self.fetch_envs(&env_parent_ids, true).await?;

        let state = self.snapshot().await;
        let encryptor = Encryptor {
            state: &state,
            graph,
            crypto: self.services.crypto.as_ref(),
            oracle: self.services.oracle.as_ref(),
            ctx: &self.ctx,
            now: now_millis(),
        };
        let opts = EncryptOptions {
            reencrypt_changesets: true,
            ..Default::default()
        };
        let encrypted = encryptor
            .encrypted_key_params_for_environments(batch, opts)
            .await?;

        self.send_ok(ApiRequest::ReencryptEnvs(ReencryptEnvsParams {
            graph_updated_at: graph.updated_at,
            environment_ids: batch.clone(),
            env_params: encrypted.env_params,
        }))
        .await?;

        self.trust_verified(encrypted.newly_trusted).await;
        self.apply(StateAction::StoreEnvs {
            envs: encrypted.envs,
            changesets: encrypted.changesets,
        })
        .await;
        info!(environments = batch.len(), "re-encrypted batch");
        Ok(())
    }
}
