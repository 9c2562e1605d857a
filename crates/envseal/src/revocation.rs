//! Reconciling local trust with graph changes.
//!
//! Runs after every graph load:
//!
//! 1. verified root replacements swap the persisted root entry
//! 2. session entries the graph no longer vouches for are evicted
//! 3. revocation requests evict their targets and every dependent entry
//!
//! Processed requests are acknowledged so the server stops sending them to
//! this device.

use std::collections::BTreeSet;
use tracing::{info, warn};

use envseal_core::{KeyableId, RequestId};
use envseal_sync::ApiRequest;

use crate::client::Client;
use crate::error::Result;
use crate::state::StateAction;
use crate::trust;

impl Client {
    pub(crate) async fn reconcile_trust(&self) -> Result<()> {
        let result: Result<()> = async {
            self.process_root_replacements_if_needed().await?;
            self.clear_revoked_or_outdated_session_pubkeys().await;
            self.process_revocation_requests_if_needed().await
        }
        .await;
        if let Err(err) = &result {
            self.reset_on_fatal(err).await;
        }
        result
    }

    async fn ack(&self, request_ids: BTreeSet<RequestId>) -> Result<()> {
        if request_ids.is_empty() {
            return Ok(());
        }
        self.send_ok(ApiRequest::AckRequests { request_ids }).await?;
        Ok(())
    }

    /// Apply every root replacement that verifies against the local root.
    pub async fn process_root_replacements_if_needed(&self) -> Result<()> {
        let state = self.snapshot().await;
        let Some(graph) = state.graph.as_ref() else {
            return Ok(());
        };
        if graph.root_pubkey_replacements.is_empty() {
            return Ok(());
        }

        let mut processed = BTreeSet::new();
        let mut root = state.trusted_root.clone();
        for replacement in graph.root_pubkey_replacements.values() {
            let verified =
                trust::verify_root_replacement(self.services.crypto.as_ref(), &root, replacement)
                    .await?;
            if let Some(verified) = verified {
                self.services
                    .store
                    .replace_root(
                        &self.ctx.account_id,
                        &verified.replacing_id,
                        &verified.replacement_id,
                        &verified.replacement,
                    )
                    .await?;
                root.remove(&verified.replacing_id);
                root.insert(verified.replacement_id.clone(), verified.replacement.clone());
                info!(
                    replacing = %verified.replacing_id,
                    replacement = %verified.replacement_id,
                    "replaced trusted root"
                );
                self.apply(StateAction::ReplaceRoot {
                    replacing_id: verified.replacing_id,
                    replacement_id: verified.replacement_id,
                    replacement: verified.replacement,
                })
                .await;
            }
            processed.insert(replacement.id.clone());
        }
        self.ack(processed).await
    }

    /// Evict session entries whose graph attributes changed or whose
    /// keyable is gone, along with everything they vouched for.
    pub async fn clear_revoked_or_outdated_session_pubkeys(&self) {
        let state = self.snapshot().await;
        let Some(graph) = state.graph.as_ref() else {
            return;
        };
        let evicted = trust::revoked_or_outdated(graph, &state.trusted_session_pubkeys);
        if !evicted.is_empty() {
            self.apply(StateAction::RemoveSessionPubkeys(evicted)).await;
        }
    }

    /// Evict the targets of pending revocation requests and their
    /// dependents, then acknowledge the requests.
    pub async fn process_revocation_requests_if_needed(&self) -> Result<()> {
        let state = self.snapshot().await;
        let Some(graph) = state.graph.as_ref() else {
            return Ok(());
        };
        if graph.pubkey_revocation_requests.is_empty() {
            return Ok(());
        }

        let mut targets: Vec<KeyableId> = Vec::new();
        for request in graph.pubkey_revocation_requests.values() {
            if state.trusted_root.contains_key(&request.target_id) {
                warn!(target = %request.target_id, "ignoring revocation of a root pubkey");
            } else if state.trusted_session_pubkeys.contains_key(&request.target_id) {
                targets.push(request.target_id.clone());
            }
        }

        let evicted = trust::revocation_cascade(&state.trusted_session_pubkeys, targets);
        if !evicted.is_empty() {
            info!(count = evicted.len(), "cleared revoked session pubkeys");
            self.apply(StateAction::RemoveSessionPubkeys(evicted)).await;
        }
        self.ack(graph.pubkey_revocation_requests.keys().cloned().collect())
            .await
    }
}
