mod helpers;

use helpers::{test_store, FlakyEmbedder, MockEmbedder};
use mnemon::db::EntryInput;
use mnemon::dedup::bulk_ingest;
use mnemon::embed::BatchEmbedder;

#[tokio::test]
async fn bulk_ingest_writes_and_rebuilds_indexes() {
    let store = test_store();
    let embedder = BatchEmbedder::new(MockEmbedder::new());

    let inputs: Vec<EntryInput> = (0..25)
        .map(|i| EntryInput::new(format!("imported knowledge item number {i}")).kind("fact"))
        .collect();
    let report = bulk_ingest(&store, &embedder, inputs).await.unwrap();

    assert_eq!(report.written, 25);
    assert_eq!(store.active_count(), 25);
    // Flag cleared, FTS consistent, vector index populated.
    assert_eq!(store.get_meta("bulk_phase"), None);
    let report = store.integrity_check().unwrap();
    assert!(report.ok, "fts rows {} vs entries {}", report.fts_rows, report.entries);
    assert_eq!(report.missing_embedding, 0);
    assert_eq!(store.vec_index_len(), 25);

    // FTS actually works post-rebuild.
    let hits = store.search_fts("imported knowledge", 50).unwrap();
    assert_eq!(hits.len(), 25);
}

#[tokio::test]
async fn bulk_ingest_skips_invalid_rows() {
    let store = test_store();
    let embedder = BatchEmbedder::new(MockEmbedder::new());
    let inputs = vec![
        EntryInput::new("a valid entry"),
        EntryInput::new("   "),
        EntryInput::new("another valid entry"),
    ];
    // The blank entry is skipped with a warning, not a batch failure.
    let report = bulk_ingest(&store, &embedder, inputs).await.unwrap();
    assert_eq!(report.written, 2);
}

#[tokio::test]
async fn bulk_ingest_flags_near_duplicate_pairs() {
    let store = test_store();
    let embedder = BatchEmbedder::new(MockEmbedder::new());
    let long = "the deploy pipeline builds the image runs the suite pushes to \
        the registry waits for approval then rolls out region by region with \
        automatic rollback on elevated error rates";
    let inputs = vec![
        EntryInput::new(long),
        EntryInput::new(long.replace("approval", "signoff")),
        EntryInput::new("completely different knowledge about the billing system"),
    ];

    let report = bulk_ingest(&store, &embedder, inputs).await.unwrap();
    assert_eq!(report.written, 3);
    // Only the one-word-changed pair trips the MinHash floor.
    assert_eq!(report.near_duplicates, 1);
}

#[test]
fn recovery_replays_missing_rebuild_after_write_crash() {
    let store = test_store();
    for i in 0..5 {
        store
            .insert(
                EntryInput::new(format!("entry {i}")),
                Some(&[i as f32, 1.0]),
            )
            .unwrap();
    }
    // Simulate a crash mid-bulk: triggers dropped, index cleared, flag stuck.
    store.begin_bulk().unwrap();
    assert_eq!(store.get_meta("bulk_phase").as_deref(), Some("writing"));
    assert_eq!(store.vec_index_len(), 0);

    let recovered = store.recover_bulk().unwrap();
    assert!(recovered);
    assert_eq!(store.get_meta("bulk_phase"), None);
    assert_eq!(store.vec_index_len(), 5);
    assert!(store.integrity_check().unwrap().ok);

    // Idempotent: a second recovery is a no-op.
    assert!(!store.recover_bulk().unwrap());
}

#[test]
fn recovery_replays_vector_rebuild_only() {
    let store = test_store();
    store
        .insert(EntryInput::new("needs reindexing"), Some(&[1.0, 0.0]))
        .unwrap();
    store.set_meta("bulk_phase", "rebuilding_vector").unwrap();
    store.clear_vec_index();

    assert!(store.recover_bulk().unwrap());
    assert_eq!(store.get_meta("bulk_phase"), None);
    assert_eq!(store.vec_index_len(), 1);
}

#[tokio::test]
async fn embedder_retries_rate_limits_with_backoff() {
    let store = test_store();
    let flaky = FlakyEmbedder::new(2);
    let embedder = BatchEmbedder::new(flaky.clone());

    let report = bulk_ingest(
        &store,
        &embedder,
        vec![EntryInput::new("survives two rate limits")],
    )
    .await
    .unwrap();

    assert_eq!(report.written, 1);
    // Two rate-limited attempts, then the success.
    assert_eq!(flaky.calls(), 1);
}
