//! Shared helpers for the integration tests.

#![allow(dead_code)]

use envseal::graph::EnvEntry;
use envseal::{Client, EnvEdit};
use envseal_testkit::{env, parents};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("envseal=debug")
        .with_test_writer()
        .try_init();
}

/// Fetch `environment`'s env parent if needed, set `key` and commit.
pub async fn write(client: &Client, environment: &str, key: &str, val: &str) {
    let parent = client
        .snapshot()
        .await
        .graph
        .and_then(|g| g.env_parent_of(&env(environment)))
        .expect("environment in graph");
    client
        .fetch_envs(&parents(&[parent.as_str()]), false)
        .await
        .unwrap();
    client
        .update_env(
            &env(environment),
            EnvEdit::Set {
                key: key.into(),
                entry: EnvEntry::value(val),
            },
        )
        .await
        .unwrap();
    client.commit_envs().await.unwrap();
}

/// Value of `key` in `environment` as `client` currently sees it.
pub async fn read(client: &Client, environment: &str, key: &str) -> Option<String> {
    client
        .env(&env(environment))
        .await
        .unwrap()
        .variables
        .get(key)
        .and_then(|entry| entry.val.clone())
}
