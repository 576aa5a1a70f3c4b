//! Opening safes from configuration files

mod common;

use std::sync::Arc;

use ::common::config::CONFIG_FILE_NAME;
use ::common::prelude::*;
use object_store::{ObjectStoreConfig, Storage};
use tempfile::TempDir;

#[tokio::test]
async fn test_open_from_config_file() {
    common::init_tracing();
    let temp_dir = TempDir::new().unwrap();
    let alice = common::identity("alice");
    let url = format!("file:///{}/vault", alice.id());
    let store_config = ObjectStoreConfig::Local {
        path: temp_dir.path().join("store"),
    };

    // Bootstrap through a store rooted the way the config will root it
    let root = format!("{}/vault", alice.id());
    let storage = Storage::new(store_config.clone()).await.unwrap().with_root(&root);
    let cache = Cache::in_memory().await.unwrap();
    let created = Safe::create(Arc::new(storage), cache, alice.clone(), &url, common::options())
        .await
        .unwrap();
    let expected = created.get_groups().await.unwrap();

    let mut config = SafeConfig::new(&url);
    config.store = store_config;
    config.cache_path = Some(temp_dir.path().join("cache").join("safe.sqlite"));
    config.lock = common::options().lock;
    let path = temp_dir.path().join(CONFIG_FILE_NAME);
    std::fs::write(&path, config.to_toml_string().unwrap()).unwrap();

    let loaded = SafeConfig::from_file(&path).unwrap();
    assert_eq!(loaded, config);
    let safe = Safe::from_config(&loaded, alice.clone()).await.unwrap();
    assert_eq!(safe.creator(), alice.id());
    assert_eq!(safe.get_groups().await.unwrap(), expected);
    assert_eq!(safe.get_keys(&GroupName::users(), 1).await.unwrap().epochs(), 1);

    // The cache file persists the chain for the next open
    drop(safe);
    let reopened = Safe::from_config(&loaded, alice).await.unwrap();
    assert_eq!(reopened.sync_groups(false).await.unwrap(), ChainStatus::Unchanged);
    assert_eq!(reopened.get_groups().await.unwrap(), expected);
}

#[tokio::test]
async fn test_config_rejects_bad_urls() {
    let alice = common::identity("alice");
    let config = SafeConfig::new("mem://local/vault");
    assert!(matches!(
        Safe::from_config(&config, alice).await,
        Err(SafeError::InvalidUrl(_))
    ));
}
