//! Identity of the signed-in device.

use envseal_core::{AccountId, KeyableId, OrgId, Privkey, Pubkey, UserId};
use envseal_sync::RequestContext;

/// Who the client acts as, and the key it acts with.
#[derive(Clone)]
pub struct ClientContext {
    pub account_id: AccountId,
    pub org_id: OrgId,
    pub user_id: UserId,
    /// The device or CLI user id holding `privkey`.
    pub device_id: KeyableId,
    pub privkey: Privkey,
}

impl ClientContext {
    pub fn request_context(&self) -> RequestContext {
        RequestContext {
            account_id: self.account_id.clone(),
            org_id: self.org_id.clone(),
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
        }
    }

    pub fn pubkey(&self) -> Pubkey {
        self.privkey.pubkey()
    }
}

impl std::fmt::Debug for ClientContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientContext")
            .field("account_id", &self.account_id)
            .field("org_id", &self.org_id)
            .field("user_id", &self.user_id)
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}
