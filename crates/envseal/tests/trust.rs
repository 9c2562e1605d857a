//! Trust chains, tampering and revocation as a client sees them.

mod common;

use std::sync::Arc;

use envseal::core::{DalekCrypto, KeyableId, KeyableType, Keypair, RequestId, TrustedPubkey};
use envseal::graph::{Composite, EnvEntry, PubkeyRevocationRequest};
use envseal::store::{MemoryTrustStore, SqliteTrustStore, TrustStore};
use envseal::trust::verify_org_keyable;
use envseal::{Client, ClientError, EnvEdit, Services};
use envseal_testkit::{env, parents, seed, test_config, OrgFixture, ADMIN, CLI, DEV, DEV_SECOND, OWNER};

use common::{read, write};

#[tokio::test]
async fn test_writer_verifies_every_recipient() {
    let org = OrgFixture::new();
    let owner = org.client(OWNER).await.unwrap();
    assert!(owner.trusted_session_pubkeys().await.is_empty());

    write(&owner, "app-dev", "A", "1").await;

    let session = owner.trusted_session_pubkeys().await;
    for member in [ADMIN, DEV, DEV_SECOND, CLI] {
        assert!(session.contains_key(&member.device_id()), "{} not trusted", member.device);
    }
    // Roots are never copied into the session registry.
    assert!(!session.contains_key(&OWNER.device_id()));
}

#[tokio::test]
async fn test_reader_trusts_writer_through_its_root() {
    let org = OrgFixture::new();
    let dev = org.client(DEV).await.unwrap();
    write(&dev, "app-dev", "A", "from-dev").await;

    let admin = org.client(ADMIN).await.unwrap();
    admin.fetch_envs(&parents(&["app"]), false).await.unwrap();
    assert_eq!(read(&admin, "app-dev", "A").await.as_deref(), Some("from-dev"));
    assert!(admin
        .trusted_session_pubkeys()
        .await
        .contains_key(&DEV.device_id()));
    assert_eq!(&admin.trusted_root().await, org.root());
}

#[tokio::test]
async fn test_unknown_root_is_rejected() {
    let org = OrgFixture::new();
    let owner = org.client(OWNER).await.unwrap();
    write(&owner, "app-dev", "A", "1").await;

    let rogue = Keypair::from_seed(&seed("rogue"));
    let store = Arc::new(MemoryTrustStore::new());
    store
        .insert_root_if_absent(
            &OrgFixture::account_id(DEV),
            &KeyableId::new("rogue"),
            &TrustedPubkey {
                keyable_type: KeyableType::OrgUserDevice,
                pubkey: rogue.pubkey,
                invite_pubkey: None,
                signed_by_pubkey_id: None,
            },
        )
        .await
        .unwrap();
    let dev = Client::open(
        org.context(DEV),
        test_config(),
        Services::new(org.server.clone(), store),
    )
    .await
    .unwrap();

    let err = dev.fetch_envs(&parents(&["app"]), false).await.unwrap_err();
    assert!(matches!(err, ClientError::Integrity(_)));
    assert!(dev.snapshot().await.graph.is_none());
}

#[tokio::test]
async fn test_swapped_pubkey_blocks_encryption_and_resets_state() {
    let org = OrgFixture::new();
    let owner = org.client(OWNER).await.unwrap();
    owner.fetch_envs(&parents(&["app"]), false).await.unwrap();

    let attacker = Keypair::from_seed(&seed("attacker"));
    org.server
        .update_graph(|g| {
            if let Some(device) = g.devices.get_mut(&DEV.device_id()) {
                device.pubkey = Some(attacker.pubkey.clone());
            }
        })
        .await
        .unwrap();
    owner.refresh_graph().await.unwrap();

    owner
        .update_env(
            &env("app-dev"),
            EnvEdit::Set {
                key: "A".into(),
                entry: EnvEntry::value("1"),
            },
        )
        .await
        .unwrap();
    let err = owner.commit_envs().await.unwrap_err();
    assert!(matches!(err, ClientError::Integrity(_)));

    let state = owner.snapshot().await;
    assert!(state.graph.is_none());
    assert!(state.envs.is_empty());
    assert!(state.trusted_session_pubkeys.is_empty());
    assert_eq!(&state.trusted_root, org.root());
    assert!(org.server.blob(&Composite::env(&env("app-dev"))).await.is_none());
}

#[tokio::test]
async fn test_removed_signer_evicts_everything_it_vouched_for() {
    let org = OrgFixture::new();
    let owner = org.client(OWNER).await.unwrap();
    write(&owner, "app-dev", "A", "1").await;
    let session = owner.trusted_session_pubkeys().await;
    assert!(session.contains_key(&DEV.device_id()));
    assert!(session.contains_key(&DEV_SECOND.device_id()));

    org.server
        .update_graph(|g| {
            g.remove_device(&DEV.device_id());
        })
        .await
        .unwrap();
    owner.refresh_graph().await.unwrap();

    let session = owner.trusted_session_pubkeys().await;
    assert!(!session.contains_key(&DEV.device_id()));
    // d-dev-2 was approved by a grant d-dev signed.
    assert!(!session.contains_key(&DEV_SECOND.device_id()));
    assert!(session.contains_key(&ADMIN.device_id()));

    let graph = org.server.graph().await;
    let err = verify_org_keyable(&graph, org.root(), &session, &DalekCrypto, &DEV_SECOND.device_id())
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Integrity(_)));
}

#[tokio::test]
async fn test_revocation_requests_are_applied_then_acknowledged() {
    let org = OrgFixture::new();
    let owner = org.client(OWNER).await.unwrap();
    write(&owner, "app-dev", "A", "1").await;
    assert!(owner
        .trusted_session_pubkeys()
        .await
        .contains_key(&ADMIN.device_id()));

    let request_id = RequestId::new("req-admin");
    org.server
        .update_graph(|g| {
            g.pubkey_revocation_requests.insert(
                request_id.clone(),
                PubkeyRevocationRequest {
                    id: request_id.clone(),
                    target_id: ADMIN.device_id(),
                    creator_id: OWNER.user_id(),
                    created_at: 1,
                },
            );
        })
        .await
        .unwrap();

    owner.refresh_graph().await.unwrap();
    assert!(!owner
        .trusted_session_pubkeys()
        .await
        .contains_key(&ADMIN.device_id()));

    owner.refresh_graph().await.unwrap();
    let graph = owner.snapshot().await.graph.unwrap();
    assert!(graph.pubkey_revocation_requests.is_empty());
    // Other devices still see the request until they acknowledge it.
    assert!(org
        .server
        .graph()
        .await
        .pubkey_revocation_requests
        .contains_key(&request_id));
}

#[tokio::test]
async fn test_revocation_of_a_root_is_ignored() {
    let org = OrgFixture::new();
    let admin = org.client(ADMIN).await.unwrap();

    let request_id = RequestId::new("req-root");
    org.server
        .update_graph(|g| {
            g.pubkey_revocation_requests.insert(
                request_id.clone(),
                PubkeyRevocationRequest {
                    id: request_id.clone(),
                    target_id: OWNER.device_id(),
                    creator_id: ADMIN.user_id(),
                    created_at: 1,
                },
            );
        })
        .await
        .unwrap();

    admin.refresh_graph().await.unwrap();
    assert_eq!(&admin.trusted_root().await, org.root());
}

#[tokio::test]
async fn test_bootstrapped_root_survives_reopening() {
    let org = OrgFixture::new();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("trust.db");

    let open = |store: SqliteTrustStore| {
        Client::open(
            org.context(OWNER),
            test_config(),
            Services::new(org.server.clone(), Arc::new(store)),
        )
    };
    let first = open(SqliteTrustStore::open(&path).unwrap()).await.unwrap();
    assert_eq!(&first.trusted_root().await, org.root());
    drop(first);

    let store = SqliteTrustStore::open(&path).unwrap();
    let stored = store.load_root(&OrgFixture::account_id(OWNER)).await.unwrap();
    assert_eq!(&stored, org.root());
    let reopened = open(store).await.unwrap();
    assert_eq!(&reopened.trusted_root().await, org.root());
}
