//! Filesystem cache store behaviour.

use std::path::Path;

use tempfile::TempDir;
use tessera_cache::CacheStore;
use tessera_cache::FsCacheStore;
use tessera_cache::RestoreOutcome;
use tessera_cache::key_digest;

fn workspace_with_dataset(bytes: &[u8]) -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::create_dir_all(dir.path().join("tests")).unwrap();
    std::fs::write(dir.path().join("tests/S1A_Stack.tar.gz"), bytes).unwrap();
    dir
}

fn read(path: &Path) -> Vec<u8> {
    std::fs::read(path).unwrap()
}

#[tokio::test]
async fn test_miss_on_empty_store() {
    let state = TempDir::new().unwrap();
    let store = FsCacheStore::new(state.path().join("cache"));
    let dest = TempDir::new().unwrap();

    let outcome = store.restore("S1A_Stack", &["S1A_".to_string()], dest.path()).await.unwrap();
    assert_eq!(outcome, RestoreOutcome::Miss);
    assert!(store.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_save_then_exact_hit() {
    let state = TempDir::new().unwrap();
    let store = FsCacheStore::new(state.path().join("cache"));
    let ws = workspace_with_dataset(b"radar scenes");
    let paths = vec!["tests/S1A_Stack.tar.gz".to_string()];

    let entry = store.save("S1A_Stack", ws.path(), &paths).await.unwrap();
    assert_eq!(entry.paths, paths);
    assert!(state.path().join("cache").join(key_digest("S1A_Stack")).join("meta.json").exists());

    let dest = TempDir::new().unwrap();
    let outcome = store.restore("S1A_Stack", &[], dest.path()).await.unwrap();
    assert!(outcome.is_exact_hit());
    assert_eq!(read(&dest.path().join("tests/S1A_Stack.tar.gz")), b"radar scenes");
}

#[tokio::test]
async fn test_unchanged_key_restores_identical_bytes() {
    let state = TempDir::new().unwrap();
    let store = FsCacheStore::new(state.path().join("cache"));
    let ws = workspace_with_dataset(b"immutable fixture");
    let paths = vec!["tests".to_string()];
    let entry = store.save("fixture-v1", ws.path(), &paths).await.unwrap();

    let first = TempDir::new().unwrap();
    let second = TempDir::new().unwrap();
    let a = store.restore("fixture-v1", &[], first.path()).await.unwrap();
    let b = store.restore("fixture-v1", &[], second.path()).await.unwrap();

    assert_eq!(a, b);
    assert_eq!(a, RestoreOutcome::ExactHit {
        key: "fixture-v1".to_string(),
        digest: entry.digest.clone(),
    });
    assert_eq!(
        read(&first.path().join("tests/S1A_Stack.tar.gz")),
        read(&second.path().join("tests/S1A_Stack.tar.gz"))
    );
}

#[tokio::test]
async fn test_prefix_fallback() {
    let state = TempDir::new().unwrap();
    let store = FsCacheStore::new(state.path().join("cache"));
    let ws = workspace_with_dataset(b"older dataset");
    store.save("S1A_Stack_v1", ws.path(), &["tests".to_string()]).await.unwrap();

    let dest = TempDir::new().unwrap();
    let outcome = store.restore("S1A_Stack_v2", &["S1A_Stack_".to_string()], dest.path()).await.unwrap();
    match outcome {
        RestoreOutcome::PrefixHit { key, restore_key, .. } => {
            assert_eq!(key, "S1A_Stack_v1");
            assert_eq!(restore_key, "S1A_Stack_");
        }
        other => panic!("expected prefix hit, got {other:?}"),
    }
    assert!(dest.path().join("tests/S1A_Stack.tar.gz").exists());
}

#[tokio::test]
async fn test_corrupted_archive_is_a_miss() {
    let state = TempDir::new().unwrap();
    let store = FsCacheStore::new(state.path().join("cache"));
    let ws = workspace_with_dataset(b"fixture");
    let entry = store.save("dataset", ws.path(), &["tests".to_string()]).await.unwrap();

    let archive = state.path().join("cache").join(key_digest("dataset")).join(&entry.archive);
    std::fs::write(&archive, b"garbage").unwrap();

    let dest = TempDir::new().unwrap();
    assert_eq!(store.restore("dataset", &[], dest.path()).await.unwrap(), RestoreOutcome::Miss);

    std::fs::remove_file(&archive).unwrap();
    assert_eq!(store.restore("dataset", &[], dest.path()).await.unwrap(), RestoreOutcome::Miss);
}

#[tokio::test]
async fn test_corrupted_metadata_is_a_miss() {
    let state = TempDir::new().unwrap();
    let store = FsCacheStore::new(state.path().join("cache"));
    let ws = workspace_with_dataset(b"fixture");
    store.save("dataset", ws.path(), &["tests".to_string()]).await.unwrap();

    let meta = state.path().join("cache").join(key_digest("dataset")).join("meta.json");
    std::fs::write(&meta, b"{not json").unwrap();

    let dest = TempDir::new().unwrap();
    assert_eq!(store.restore("dataset", &[], dest.path()).await.unwrap(), RestoreOutcome::Miss);
    assert_eq!(
        store.restore("dataset", &["data".to_string()], dest.path()).await.unwrap(),
        RestoreOutcome::Miss
    );
    assert!(!dest.path().join("tests/S1A_Stack.tar.gz").exists());
}

#[tokio::test]
async fn test_concurrent_saves_of_same_key() {
    let state = TempDir::new().unwrap();
    let store = FsCacheStore::new(state.path().join("cache"));
    let ws_one = workspace_with_dataset(b"one");
    let ws_two = workspace_with_dataset(b"two");
    let paths = vec!["tests".to_string()];

    let (first, second) = tokio::join!(
        store.save("dataset", ws_one.path(), &paths),
        store.save("dataset", ws_two.path(), &paths)
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    let current = store.get("dataset").await.unwrap().unwrap();
    let expected: &[u8] = if current.digest == first.digest {
        b"one"
    } else {
        assert_eq!(current.digest, second.digest);
        b"two"
    };

    let dest = TempDir::new().unwrap();
    let outcome = store.restore("dataset", &[], dest.path()).await.unwrap();
    assert_eq!(outcome, RestoreOutcome::ExactHit {
        key: "dataset".to_string(),
        digest: current.digest.clone(),
    });
    assert_eq!(read(&dest.path().join("tests/S1A_Stack.tar.gz")), expected);
}

#[tokio::test]
async fn test_resave_is_last_write_wins() {
    let state = TempDir::new().unwrap();
    let store = FsCacheStore::new(state.path().join("cache"));
    let first = store.save("dataset", workspace_with_dataset(b"one").path(), &["tests".to_string()]).await.unwrap();
    let second = store.save("dataset", workspace_with_dataset(b"two").path(), &["tests".to_string()]).await.unwrap();
    assert_ne!(first.archive, second.archive);

    let current = store.get("dataset").await.unwrap().unwrap();
    assert_eq!(current.digest, second.digest);

    let dest = TempDir::new().unwrap();
    store.restore("dataset", &[], dest.path()).await.unwrap();
    assert_eq!(read(&dest.path().join("tests/S1A_Stack.tar.gz")), b"two");
}

#[tokio::test]
async fn test_save_without_existing_paths_fails() {
    let state = TempDir::new().unwrap();
    let store = FsCacheStore::new(state.path().join("cache"));
    let ws = TempDir::new().unwrap();
    assert!(store.save("dataset", ws.path(), &["missing".to_string()]).await.is_err());
    assert!(store.get("dataset").await.unwrap().is_none());
}

#[tokio::test]
async fn test_remove() {
    let state = TempDir::new().unwrap();
    let store = FsCacheStore::new(state.path().join("cache"));
    let ws = workspace_with_dataset(b"x");
    store.save("dataset", ws.path(), &["tests".to_string()]).await.unwrap();

    assert!(store.remove("dataset").await.unwrap());
    assert!(!store.remove("dataset").await.unwrap());
    assert!(store.list().await.unwrap().is_empty());
}
