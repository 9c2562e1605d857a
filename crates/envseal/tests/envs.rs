//! Editing, committing and fetching envs against the in-memory server.

mod common;

use std::sync::Arc;

use envseal::core::KeyableId;
use envseal::graph::{Composite, EnvEntry};
use envseal::sync::{FlakyTransport, MemoryServerConfig};
use envseal::{ClientError, EnvEdit};
use envseal_testkit::{env, parents, test_config, OrgFixture, ADMIN, CLI, DEV, OWNER};

use common::{init_tracing, read, write};

#[tokio::test]
async fn test_committed_env_is_readable_by_entitled_members() {
    init_tracing();
    let org = OrgFixture::new();
    let owner = org.client(OWNER).await.unwrap();
    write(&owner, "app-dev", "DATABASE_URL", "postgres://dev").await;
    write(&owner, "app-prod", "STRIPE_KEY", "sk_live").await;

    let dev = org.client(DEV).await.unwrap();
    dev.fetch_envs(&parents(&["app"]), false).await.unwrap();
    assert_eq!(read(&dev, "app-dev", "DATABASE_URL").await.as_deref(), Some("postgres://dev"));

    // Developers only see which keys production has.
    let prod = dev.env(&env("app-prod")).await.unwrap();
    assert!(prod.variables.contains_key("STRIPE_KEY"));
    assert_eq!(read(&dev, "app-prod", "STRIPE_KEY").await, None);

    let cli = org.client(CLI).await.unwrap();
    cli.fetch_envs(&parents(&["app"]), false).await.unwrap();
    assert_eq!(read(&cli, "app-dev", "DATABASE_URL").await.as_deref(), Some("postgres://dev"));

    let admin = org.client(ADMIN).await.unwrap();
    admin.fetch_envs(&parents(&["app"]), false).await.unwrap();
    assert_eq!(read(&admin, "app-prod", "STRIPE_KEY").await.as_deref(), Some("sk_live"));
}

#[tokio::test]
async fn test_each_commit_rotates_the_env_key() {
    let org = OrgFixture::new();
    let owner = org.client(OWNER).await.unwrap();
    write(&owner, "app-dev", "PORT", "3000").await;
    let first = org.server.blob(&Composite::env(&env("app-dev"))).await.unwrap();

    write(&owner, "app-dev", "PORT", "3001").await;
    let second = org.server.blob(&Composite::env(&env("app-dev"))).await.unwrap();
    assert_ne!(first, second);

    let dev = org.client(DEV).await.unwrap();
    dev.fetch_envs(&parents(&["app"]), false).await.unwrap();
    assert_eq!(read(&dev, "app-dev", "PORT").await.as_deref(), Some("3001"));
}

#[tokio::test]
async fn test_edits_that_cancel_out_leave_nothing_pending() {
    let org = OrgFixture::new();
    let owner = org.client(OWNER).await.unwrap();
    write(&owner, "app-dev", "PORT", "3000").await;

    owner
        .update_env(
            &env("app-dev"),
            EnvEdit::Set {
                key: "PORT".into(),
                entry: EnvEntry::value("4000"),
            },
        )
        .await
        .unwrap();
    assert_eq!(owner.pending().await.len(), 1);
    assert_eq!(read(&owner, "app-dev", "PORT").await.as_deref(), Some("4000"));

    owner
        .update_env(
            &env("app-dev"),
            EnvEdit::Set {
                key: "PORT".into(),
                entry: EnvEntry::value("3000"),
            },
        )
        .await
        .unwrap();
    assert!(owner.pending().await.is_empty());
}

#[tokio::test]
async fn test_reset_discards_pending_edits() {
    let org = OrgFixture::new();
    let owner = org.client(OWNER).await.unwrap();
    owner.fetch_envs(&parents(&["app"]), false).await.unwrap();

    for (environment, key) in [("app-dev", "A"), ("app-staging", "B")] {
        owner
            .update_env(
                &env(environment),
                EnvEdit::Set {
                    key: key.into(),
                    entry: EnvEntry::value("1"),
                },
            )
            .await
            .unwrap();
    }

    let only_dev = [env("app-dev")].into_iter().collect();
    owner.reset_envs(Some(&only_dev)).await;
    let pending = owner.pending().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].meta.environment_id, env("app-staging"));

    owner.reset_envs(None).await;
    assert!(owner.pending().await.is_empty());
    assert_eq!(read(&owner, "app-staging", "B").await, None);
}

#[tokio::test]
async fn test_update_requires_fetched_parent() {
    let org = OrgFixture::new();
    let owner = org.client(OWNER).await.unwrap();
    let err = owner
        .update_env(
            &env("app-dev"),
            EnvEdit::Set {
                key: "A".into(),
                entry: EnvEntry::value("1"),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::TransientFetch(_)));
}

#[tokio::test]
async fn test_update_requires_write_permission() {
    let org = OrgFixture::new();
    let dev = org.client(DEV).await.unwrap();
    dev.fetch_envs(&parents(&["app"]), false).await.unwrap();
    let err = dev
        .update_env(
            &env("app-prod"),
            EnvEdit::Set {
                key: "A".into(),
                entry: EnvEntry::value("1"),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Authorization(_)));
}

#[tokio::test]
async fn test_commits_are_recorded_as_changesets() {
    let org = OrgFixture::new();
    let owner = org.client(OWNER).await.unwrap();
    write(&owner, "app-dev", "A", "1").await;
    write(&owner, "app-dev", "B", "2").await;

    let history = owner.changesets(&env("app-dev")).await;
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|c| c.created_by_id == OWNER.user_id()));

    let admin = org.client(ADMIN).await.unwrap();
    admin.fetch_envs(&parents(&["app"]), true).await.unwrap();
    let seen = admin.changesets(&env("app-dev")).await;
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].id, history[0].id);
    assert_eq!(seen[1].actions, history[1].actions);
}

#[tokio::test]
async fn test_inheritance_overrides_reach_only_readers_of_the_inheriting_env() {
    let org = OrgFixture::new();
    let owner = org.client(OWNER).await.unwrap();
    owner.fetch_envs(&parents(&["app"]), false).await.unwrap();

    owner
        .update_env(
            &env("app-prod-sub"),
            EnvEdit::Set {
                key: "REGION".into(),
                entry: EnvEntry::inherits(&env("app-staging")),
            },
        )
        .await
        .unwrap();
    owner
        .update_env(
            &env("app-staging"),
            EnvEdit::Set {
                key: "REGION".into(),
                entry: EnvEntry::value("us"),
            },
        )
        .await
        .unwrap();
    owner
        .update_env(
            &env("app-staging"),
            EnvEdit::SetOverride {
                inheriting_environment_id: env("app-prod-sub"),
                key: "REGION".into(),
                entry: Some(EnvEntry::value("eu")),
            },
        )
        .await
        .unwrap();
    owner.commit_envs().await.unwrap();

    let admin = org.client(ADMIN).await.unwrap();
    admin.fetch_envs(&parents(&["app"]), false).await.unwrap();
    let staging = admin.committed_env(&env("app-staging")).await.unwrap();
    assert_eq!(staging.variables["REGION"].val.as_deref(), Some("us"));
    assert_eq!(
        staging.inheritance_overrides[&env("app-prod-sub")]["REGION"].val.as_deref(),
        Some("eu")
    );
    let sub = admin.committed_env(&env("app-prod-sub")).await.unwrap();
    assert_eq!(
        sub.variables["REGION"].inherits_environment_id,
        Some(env("app-staging"))
    );

    // Developers read staging but not production, so they get no override.
    let dev = org.client(DEV).await.unwrap();
    dev.fetch_envs(&parents(&["app"]), false).await.unwrap();
    let staging = dev.committed_env(&env("app-staging")).await.unwrap();
    assert_eq!(staging.variables["REGION"].val.as_deref(), Some("us"));
    assert!(staging.inheritance_overrides.is_empty());
}

#[tokio::test]
async fn test_stale_graph_keeps_pending_edits() {
    let org = OrgFixture::new();
    let owner = org.client(OWNER).await.unwrap();
    owner.fetch_envs(&parents(&["app"]), false).await.unwrap();
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

    let bumped = org.server.update_graph(|_| {}).await.unwrap();
    let err = owner.commit_envs().await.unwrap_err();
    assert!(matches!(err, ClientError::StaleGraph { server_updated_at } if server_updated_at == bumped));
    assert_eq!(owner.pending().await.len(), 1);
    assert!(owner.snapshot().await.graph.is_some());

    assert_eq!(owner.refresh_graph().await.unwrap(), bumped);
    owner.commit_envs().await.unwrap();
    assert!(owner.pending().await.is_empty());
    assert_eq!(read(&owner, "app-dev", "A").await.as_deref(), Some("1"));
}

#[tokio::test]
async fn test_throttled_commit_sets_and_clears_throttle_error() {
    let org = OrgFixture::with_config(MemoryServerConfig {
        write_limit: Some(1),
    });
    let owner = org.client(OWNER).await.unwrap();
    write(&owner, "app-dev", "A", "1").await;

    owner
        .update_env(
            &env("app-dev"),
            EnvEdit::Set {
                key: "A".into(),
                entry: EnvEntry::value("2"),
            },
        )
        .await
        .unwrap();
    let err = owner.commit_envs().await.unwrap_err();
    assert!(matches!(err, ClientError::Throttled(_)));
    assert!(owner.throttle_error().await.is_some());
    assert_eq!(owner.pending().await.len(), 1);

    org.server.set_throttled(false).await;
    owner.clear_throttle_error().await;
    assert!(owner.throttle_error().await.is_none());
    owner.commit_envs().await.unwrap();
    assert_eq!(read(&owner, "app-dev", "A").await.as_deref(), Some("2"));
}

#[tokio::test]
async fn test_grant_fetches_missing_envs_between_attempts() {
    let org = OrgFixture::new();
    let writer = org.client(OWNER).await.unwrap();
    write(&writer, "app-dev", "A", "1").await;

    let flaky = Arc::new(FlakyTransport::new(org.server.clone()));
    let owner = org
        .client_with(OWNER, flaky.clone(), test_config())
        .await
        .unwrap();
    flaky.fail_next("fetch_envs", 1).await;

    let dev_device = DEV.device_id();
    owner.grant_keys_to(&dev_device).await.unwrap();
    assert!(org
        .server
        .keys_held_by(&dev_device)
        .await
        .contains(&Composite::env(&env("app-dev"))));
}

#[tokio::test]
async fn test_grant_times_out_when_fetches_keep_failing() {
    let org = OrgFixture::new();
    let writer = org.client(OWNER).await.unwrap();
    write(&writer, "app-dev", "A", "1").await;

    let flaky = Arc::new(FlakyTransport::new(org.server.clone()));
    let owner = org
        .client_with(OWNER, flaky.clone(), test_config())
        .await
        .unwrap();
    flaky.fail_next("fetch_envs", 100).await;

    let err = owner
        .grant_keys_to(&KeyableId::new(DEV.device))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Timeout(_)));
    // Timeouts are fatal: cached graph and envs are dropped.
    assert!(owner.snapshot().await.graph.is_none());
}
