use std::io::Write;
use tollgate_core::error::GatewayError;
use tollgate_core::keystore::KeyStore;

// =============================================================================
// Loading from disk
// =============================================================================

#[test]
fn test_load_reads_one_key_per_line() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "abc123\nteam-ops-key\nci-runner\n").unwrap();

    let store = KeyStore::load(file.path()).unwrap();
    assert_eq!(store.len(), 3);
    assert!(store.contains("abc123"));
    assert!(store.contains("team-ops-key"));
    assert!(store.contains("ci-runner"));
    assert!(!store.contains("wrong"));
}

#[test]
fn test_load_skips_blank_lines() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "\nabc123\n\n\n").unwrap();

    let store = KeyStore::load(file.path()).unwrap();
    assert_eq!(store.len(), 1);
    assert!(!store.contains(""), "missing header must never match a blank line");
}

#[test]
fn test_load_missing_file_is_key_source_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("keys.txt");

    let err = KeyStore::load(&missing).unwrap_err();
    match err {
        GatewayError::KeySource { path, source } => {
            assert_eq!(path, missing);
            assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
        }
        other => panic!("expected KeySource, got {other:?}"),
    }
}

#[test]
fn test_load_empty_file_gives_empty_store() {
    let file = tempfile::NamedTempFile::new().unwrap();
    let store = KeyStore::load(file.path()).unwrap();
    assert!(store.is_empty());
}

// =============================================================================
// Shared read access
// =============================================================================

#[test]
fn test_concurrent_lookups_from_many_threads() {
    let store = std::sync::Arc::new(KeyStore::from_lines("abc123\ndef456\n"));
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let store = std::sync::Arc::clone(&store);
            std::thread::spawn(move || {
                for _ in 0..1000 {
                    assert!(store.contains("abc123"));
                    assert!(!store.contains(&format!("probe-{i}")));
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}
