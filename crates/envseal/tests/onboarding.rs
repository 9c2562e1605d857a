//! Invites, device grants and recovery keys end to end.

mod common;

use std::sync::Arc;
use std::time::Duration;

use envseal::core::{AccountId, Blake3Hash, EnvParentId, RoleId};
use envseal::graph::{ApprovedBy, Composite};
use envseal::store::MemoryTrustStore;
use envseal::{Client, ClientConfig, ClientError, OnboardingRequest, OnboardingToken, Services};
use envseal_testkit::{env, parents, test_config, OrgFixture, ADMIN, DEV, DEV_SECOND, OWNER};

use common::{init_tracing, read, write};

fn fresh_services(org: &OrgFixture) -> Services {
    Services::new(org.server.clone(), Arc::new(MemoryTrustStore::new()))
}

async fn load(org: &OrgFixture, account: &str, token: &OnboardingToken) -> envseal::Result<envseal::LoadedOnboarding> {
    Client::load_onboarding(AccountId::new(account), token, test_config(), fresh_services(org)).await
}

fn developer_invite(name: &str) -> OnboardingRequest {
    OnboardingRequest::Invite {
        name: name.into(),
        org_role_id: RoleId::new("basic"),
        app_roles: vec![(EnvParentId::new("app"), RoleId::new("developer"))],
    }
}

#[tokio::test]
async fn test_invited_user_reads_envs_after_accepting() {
    init_tracing();
    let org = OrgFixture::new();
    let owner = org.client(OWNER).await.unwrap();
    write(&owner, "app-dev", "API_URL", "https://dev").await;

    let token = owner.create_onboarding(developer_invite("Grace")).await.unwrap();
    let loaded = load(&org, "acct-grace", &token).await.unwrap();
    assert!(loaded.envs().envs.contains_key(&Composite::env(&env("app-dev"))));
    assert_eq!(loaded.trusted_root(), org.root());

    let grace = loaded.accept("laptop").await.unwrap();
    assert_eq!(&grace.trusted_root().await, org.root());
    assert_eq!(read(&grace, "app-dev", "API_URL").await.as_deref(), Some("https://dev"));

    let graph = org.server.graph().await;
    let device = graph
        .devices
        .values()
        .find(|d| d.user_id == token.user_id)
        .unwrap();
    assert_eq!(device.approved_by, Some(ApprovedBy::Invite(token.onboarding_id.clone())));
    assert!(graph.onboardings[&token.onboarding_id].accepted_at.is_some());

    // Later commits reach the new device too.
    write(&owner, "app-dev", "API_URL", "https://dev-2").await;
    grace.fetch_envs(&parents(&["app"]), false).await.unwrap();
    assert_eq!(read(&grace, "app-dev", "API_URL").await.as_deref(), Some("https://dev-2"));
}

#[tokio::test]
async fn test_accepted_onboarding_cannot_be_loaded_again() {
    let org = OrgFixture::new();
    let owner = org.client(OWNER).await.unwrap();
    let token = owner.create_onboarding(developer_invite("Grace")).await.unwrap();
    load(&org, "acct-grace", &token).await.unwrap().accept("laptop").await.unwrap();

    assert!(load(&org, "acct-grace-2", &token).await.is_err());
}

#[tokio::test]
async fn test_device_grant_adds_a_device_for_the_same_user() {
    let org = OrgFixture::new();
    let owner = org.client(OWNER).await.unwrap();
    write(&owner, "app-dev", "A", "shared").await;

    let dev = org.client(DEV).await.unwrap();
    let token = dev
        .create_onboarding(OnboardingRequest::DeviceGrant {
            user_id: DEV.user_id(),
        })
        .await
        .unwrap();
    assert_eq!(token.user_id, DEV.user_id());

    let phone = load(&org, "acct-dev-phone", &token)
        .await
        .unwrap()
        .accept("phone")
        .await
        .unwrap();
    assert_eq!(read(&phone, "app-dev", "A").await.as_deref(), Some("shared"));

    let graph = org.server.graph().await;
    let devices: Vec<_> = graph.devices.values().filter(|d| d.user_id == DEV.user_id()).collect();
    assert_eq!(devices.len(), 3);
    assert!(devices
        .iter()
        .any(|d| d.approved_by == Some(ApprovedBy::DeviceGrant(token.onboarding_id.clone()))));
}

#[tokio::test]
async fn test_recovery_key_replaces_every_other_device() {
    let org = OrgFixture::new();
    let owner = org.client(OWNER).await.unwrap();
    write(&owner, "app-dev", "A", "before").await;

    let dev = org.client(DEV).await.unwrap();
    let token = dev.create_onboarding(OnboardingRequest::RecoveryKey).await.unwrap();
    let recovered = load(&org, "acct-dev-recovered", &token)
        .await
        .unwrap()
        .accept("new laptop")
        .await
        .unwrap();
    assert_eq!(read(&recovered, "app-dev", "A").await.as_deref(), Some("before"));

    let graph = org.server.graph().await;
    assert!(!graph.devices.contains_key(&DEV.device_id()));
    assert!(!graph.devices.contains_key(&DEV_SECOND.device_id()));
    assert!(graph.revoked_devices.contains_key(&DEV.device_id()));

    // Writers still verify the recovered device through its revoked signer.
    let writer = org.client(OWNER).await.unwrap();
    write(&writer, "app-dev", "A", "after").await;
    recovered.fetch_envs(&parents(&["app"]), false).await.unwrap();
    assert_eq!(read(&recovered, "app-dev", "A").await.as_deref(), Some("after"));
}

#[tokio::test]
async fn test_tampered_identity_hash_is_rejected() {
    let org = OrgFixture::new();
    let owner = org.client(OWNER).await.unwrap();
    let mut token = owner.create_onboarding(developer_invite("Grace")).await.unwrap();
    token.identity_hash = Blake3Hash::hash(b"forged");

    let err = load(&org, "acct-grace", &token).await.unwrap_err();
    assert!(matches!(err, ClientError::Integrity(_)));
}

#[tokio::test]
async fn test_onboarding_with_swapped_signer_is_rejected() {
    let org = OrgFixture::new();
    let owner = org.client(OWNER).await.unwrap();
    let token = owner.create_onboarding(developer_invite("Grace")).await.unwrap();

    org.server
        .update_graph(|g| {
            if let Some(onboarding) = g.onboardings.get_mut(&token.onboarding_id) {
                onboarding.signed_by_id = ADMIN.device_id();
            }
        })
        .await
        .unwrap();

    let err = load(&org, "acct-grace", &token).await.unwrap_err();
    assert!(matches!(err, ClientError::Integrity(_)));
}

#[tokio::test]
async fn test_wrong_encryption_token_cannot_open_the_onboarding_key() {
    let org = OrgFixture::new();
    let owner = org.client(OWNER).await.unwrap();
    let mut token = owner.create_onboarding(developer_invite("Grace")).await.unwrap();
    token.encryption_token = hex::encode([7u8; 32]);

    assert!(load(&org, "acct-grace", &token).await.is_err());
}

#[tokio::test]
async fn test_expired_onboarding_cannot_be_loaded() {
    let org = OrgFixture::new();
    let config = ClientConfig {
        onboarding_ttl: Some(Duration::from_secs(1)),
        ..test_config()
    };
    let owner = org
        .client_with(OWNER, org.server.clone(), config)
        .await
        .unwrap();
    let token = owner.create_onboarding(developer_invite("Grace")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert!(load(&org, "acct-grace", &token).await.is_err());
}
