//! Keyable kinds and trusted pubkey records.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::crypto::Pubkey;
use crate::types::KeyableId;

/// The kind of graph object a pubkey belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyableType {
    OrgUserDevice,
    CliUser,
    Invite,
    DeviceGrant,
    RecoveryKey,
    GeneratedEnvkey,
}

impl fmt::Display for KeyableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            KeyableType::OrgUserDevice => "orgUserDevice",
            KeyableType::CliUser => "cliUser",
            KeyableType::Invite => "invite",
            KeyableType::DeviceGrant => "deviceGrant",
            KeyableType::RecoveryKey => "recoveryKey",
            KeyableType::GeneratedEnvkey => "generatedEnvkey",
        };
        f.write_str(s)
    }
}

/// A pubkey this device has decided to trust, with the attributes it was
/// trusted under.
///
/// Equality is exact: if any attribute differs from what the graph now
/// reports, the record no longer vouches for the keyable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustedPubkey {
    pub keyable_type: KeyableType,
    pub pubkey: Pubkey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invite_pubkey: Option<Pubkey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signed_by_pubkey_id: Option<KeyableId>,
}

/// A trust registry keyed by pubkey id.
pub type TrustedPubkeys = BTreeMap<KeyableId, TrustedPubkey>;
