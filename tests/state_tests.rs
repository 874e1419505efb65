//! State integration tests
//!
//! Tests for persistent state on the file backend: snapshots surviving a
//! restart, corrupt blobs, derived video settings and module flags.

use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tronclass_enhancer::browser::{Page, StaticTransport};
use tronclass_enhancer::feature::{Cleanups, Feature, FeatureContext, FeatureModule};
use tronclass_enhancer::state::{
    FileStorage, PersistentState, StorageBackend, VideoSettingsStore, VIDEO_SETTINGS_KEY,
};
use tronclass_enhancer::Services;

fn defaults() -> Value {
    json!({
        "enabled": true,
        "groupA": { "featA": false, "featB": true },
    })
}

fn file_state(dir: &TempDir) -> PersistentState {
    let storage: Arc<dyn StorageBackend> = Arc::new(FileStorage::new(dir.path()));
    PersistentState::new("mk-test", defaults(), storage).unwrap()
}

// ============================================================================
// Persistence Tests
// ============================================================================

#[tokio::test]
async fn test_set_survives_reconstruction() {
    let dir = TempDir::new().unwrap();

    let first = file_state(&dir);
    first.init().await;
    assert!(first.set("groupA.featA", json!(true)).await.unwrap());

    let second = file_state(&dir);
    assert!(!second.get_bool("groupA.featA"));
    second.init().await;
    assert!(second.get_bool("groupA.featA"));
    assert!(second.get_bool("groupA.featB"));
}

#[tokio::test]
async fn test_stored_blob_is_json_file() {
    let dir = TempDir::new().unwrap();
    let state = file_state(&dir);
    state.set("groupA.featB", json!(false)).await.unwrap();

    let path = FileStorage::new(dir.path()).path_for("mk-test");
    let stored: Value = serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    assert_eq!(stored["groupA"]["featB"], json!(false));
}

#[tokio::test]
async fn test_corrupt_blob_keeps_defaults() {
    let dir = TempDir::new().unwrap();
    let storage = FileStorage::new(dir.path());
    storage.set_item("mk-test", "{not json").await.unwrap();

    let state = file_state(&dir);
    state.init().await;
    assert_eq!(state.get(), defaults());
}

#[tokio::test]
async fn test_unknown_stored_paths_are_ignored() {
    let dir = TempDir::new().unwrap();
    FileStorage::new(dir.path())
        .set_item("mk-test", r#"{"groupA":{"featA":true,"gone":true},"legacy":1}"#)
        .await
        .unwrap();

    let state = file_state(&dir);
    state.init().await;
    assert!(state.get_bool("groupA.featA"));
    assert_eq!(state.get_path("groupA.gone"), None);
    assert_eq!(state.get_path("legacy"), None);
}

#[tokio::test]
async fn test_subscribers_see_old_and_new_values() {
    let dir = TempDir::new().unwrap();
    let state = file_state(&dir);
    let changes = Arc::new(Mutex::new(Vec::new()));
    let seen = changes.clone();
    let subscription = state.subscribe(
        "groupA.featA",
        move |change| seen.lock().push((change.old_value.clone(), change.value.clone())),
        false,
    );

    state.set("groupA.featA", json!(true)).await.unwrap();
    state.set("groupA.featA", json!(true)).await.unwrap();
    subscription.unsubscribe();
    state.set("groupA.featA", json!(false)).await.unwrap();

    assert_eq!(*changes.lock(), vec![(json!(false), json!(true))]);
}

// ============================================================================
// Video Settings Tests
// ============================================================================

#[tokio::test]
async fn test_video_settings_persist_without_derived_threshold() {
    let dir = TempDir::new().unwrap();
    let storage: Arc<dyn StorageBackend> = Arc::new(FileStorage::new(dir.path()));

    let store = VideoSettingsStore::new(storage.clone()).unwrap();
    store.init().await;
    store.set_playback_rate(2.0).await.unwrap();

    let blob = storage.get_item(VIDEO_SETTINGS_KEY).await.unwrap().unwrap();
    let stored: Value = serde_json::from_str(&blob).unwrap();
    assert_eq!(stored["playbackRate"], json!(2.0));
    assert!(stored.get("customAutoNextThreshold").is_none());

    let reloaded = VideoSettingsStore::new(storage).unwrap();
    reloaded.init().await;
    assert_eq!(reloaded.playback_rate(), 2.0);
    let threshold = reloaded.custom_auto_next_threshold();
    assert!((0.90..=1.0).contains(&threshold), "threshold {}", threshold);
}

// ============================================================================
// Module Flag Tests
// ============================================================================

#[tokio::test]
async fn test_module_flags_survive_restart() {
    let dir = TempDir::new().unwrap();
    let module = |dir: &TempDir| {
        let page = Page::new(
            "https://lms.example.edu/user/index",
            Arc::new(StaticTransport::new()),
        )
        .unwrap();
        let storage: Arc<dyn StorageBackend> = Arc::new(FileStorage::new(dir.path()));
        let services = Arc::new(Services::with_storage(page, storage).unwrap());
        FeatureModule::new("sample", services)
            .unwrap()
            .with_feature(
                "group",
                Feature::enable("flag", |_ctx: FeatureContext<()>| async move {
                    Ok(Cleanups::new())
                }),
            )
            .unwrap()
    };

    let before = module(&dir);
    before.init().await;
    assert_eq!(before.click("group", "flag").await.unwrap(), Some(false));

    let after = module(&dir);
    after.init().await;
    assert!(!after.is_feature_enabled("group", "flag"));

    assert_eq!(after.reset().await.unwrap().len(), 1);
    assert!(after.is_feature_enabled("group", "flag"));
}
