mod helpers;

use helpers::{mk_entry, test_store, MockEmbedder, MockJudge};
use mnemon::consolidate::{merge_cluster, Cluster, MergeOutcome, ReviewQueue, DRY_RUN_ID};
use mnemon::db::{Entry, EntryStatus, Tier};
use mnemon::embed::BatchEmbedder;
use serde_json::json;

const MERGED_TEXT: &str = "deploys ship every Friday at 16:00 UTC via the blue-green pipeline";

fn embedded(mut e: Entry, emb: Vec<f32>) -> Entry {
    e.embedding = Some(emb);
    e
}

/// Three near-identical fact entries, imported and clustered by hand.
fn fixture(store: &mnemon::SharedStore) -> Cluster {
    let mut a = embedded(
        mk_entry("src-a", "fact", "deploy schedule", "deploys ship friday"),
        vec![1.0, 0.0, 0.0],
    );
    a.confirmations = 3;
    a.tags = vec!["deploy".into()];
    let mut b = embedded(
        mk_entry("src-b", "fact", "deploy schedule", "we deploy every friday afternoon"),
        vec![0.99, 0.1, 0.0],
    );
    b.recall_count = 2;
    b.tags = vec!["release".into()];
    let mut c = embedded(
        mk_entry("src-c", "preference", "deploy schedule", "friday 16:00 UTC deploys"),
        vec![0.98, 0.12, 0.0],
    );
    c.tags = vec!["deploy".into()];
    store.import(&[a.clone(), b.clone(), c.clone()]).unwrap();
    Cluster {
        members: vec![
            (a, vec![1.0, 0.0, 0.0]),
            (b, vec![0.99, 0.1, 0.0]),
            (c, vec![0.98, 0.12, 0.0]),
        ],
    }
}

fn merge_response() -> serde_json::Value {
    json!({
        "content": MERGED_TEXT,
        "subject": "deploy schedule",
        "kind": "preference",
        "importance": 6,
        "expiry": "permanent",
        "tags": ["pipeline"],
        "notes": "combined three near-duplicates"
    })
}

fn review_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("mnemon-review-{name}-{}.jsonl", std::process::id()))
}

#[tokio::test]
async fn successful_merge_commits_atomically() {
    let store = test_store();
    let cluster = fixture(&store);
    let provider = MockEmbedder::new().register(MERGED_TEXT, vec![0.995, 0.07, 0.0]);
    let embedder = BatchEmbedder::new(provider);
    let judge = MockJudge::new().on("merge", merge_response());
    let client = judge.as_client();
    let path = review_path("ok");
    let review = ReviewQueue::new(&path);

    let (outcome, llm_calls) =
        merge_cluster(&store, &embedder, &client, &review, &cluster, false)
            .await
            .unwrap();

    assert_eq!(llm_calls, 1);
    let MergeOutcome::Merged { id, absorbed } = outcome else {
        panic!("expected merge, got {outcome:?}");
    };
    assert_eq!(absorbed, 3);

    let merged = store.get(&id).unwrap().unwrap();
    assert_eq!(merged.content, MERGED_TEXT);
    // Majority kind (fact 2:1) overrides the LLM's "preference".
    assert_eq!(merged.kind, "fact");
    assert_eq!(merged.importance, 6);
    assert_eq!(merged.tier, Tier::Permanent);
    assert_eq!(merged.merged_from, 3);
    assert_eq!(merged.confirmations, 3);
    assert_eq!(merged.recall_count, 2);
    assert!(merged.consolidated_at.is_some());
    // Draft tags first, then source tags deduped.
    assert_eq!(merged.tags, vec!["pipeline", "deploy", "release"]);

    // Every source: superseded, provenance row, supersedes relation.
    for src in ["src-a", "src-b", "src-c"] {
        let e = store.get(src).unwrap().unwrap();
        assert_eq!(e.status, EntryStatus::Superseded { by: id.clone() });
    }
    let sources = store.sources_for(&id).unwrap();
    assert_eq!(sources.len(), 3);
    let by_src: Vec<&str> = sources.iter().map(|s| s.source_id.as_str()).collect();
    assert!(by_src.contains(&"src-a"));
    let a_row = sources.iter().find(|s| s.source_id == "src-a").unwrap();
    assert_eq!(a_row.confirmations, 3);
    assert_eq!(
        store.relation_count(Some(mnemon::db::RelationKind::Supersedes)),
        3
    );
    assert_eq!(store.active_count(), 1);

    // Nothing landed in the review queue.
    assert!(review.load().unwrap().is_empty());
    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn fidelity_failure_flags_and_writes_nothing() {
    let store = test_store();
    let cluster = fixture(&store);
    // Merged text embeds orthogonally to every source — fidelity must fail.
    let provider = MockEmbedder::new().register(MERGED_TEXT, vec![0.0, 0.0, 1.0]);
    let embedder = BatchEmbedder::new(provider);
    let judge = MockJudge::new().on("merge", merge_response());
    let client = judge.as_client();
    let path = review_path("flagged");
    let _ = std::fs::remove_file(&path);
    let review = ReviewQueue::new(&path);

    let (outcome, _) = merge_cluster(&store, &embedder, &client, &review, &cluster, false)
        .await
        .unwrap();

    let MergeOutcome::Flagged { reason } = outcome else {
        panic!("expected flag, got {outcome:?}");
    };
    assert!(reason.contains("fidelity"));

    // No DB writes of any kind.
    assert_eq!(store.active_count(), 3);
    assert_eq!(store.stats().unwrap().total, 3);
    assert_eq!(store.relation_count(None), 0);

    // Durable review item with the evidence.
    let items = review.load().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].cluster_ids.len(), 3);
    assert!(items[0].worst_source_sim.unwrap() < 0.65);
    assert_eq!(items[0].draft_content.as_deref(), Some(MERGED_TEXT));
    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn judge_failure_flags_for_review() {
    let store = test_store();
    let cluster = fixture(&store);
    let embedder = BatchEmbedder::new(MockEmbedder::new());
    // No scripted "merge" response.
    let judge = MockJudge::new();
    let client = judge.as_client();
    let path = review_path("judge-err");
    let _ = std::fs::remove_file(&path);
    let review = ReviewQueue::new(&path);

    let (outcome, _) = merge_cluster(&store, &embedder, &client, &review, &cluster, false)
        .await
        .unwrap();

    assert!(matches!(outcome, MergeOutcome::Flagged { .. }));
    assert_eq!(store.active_count(), 3);
    assert_eq!(review.load().unwrap().len(), 1);
    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn dry_run_verifies_but_writes_nothing() {
    let store = test_store();
    let cluster = fixture(&store);
    let provider = MockEmbedder::new().register(MERGED_TEXT, vec![0.995, 0.07, 0.0]);
    let embedder = BatchEmbedder::new(provider);
    let judge = MockJudge::new().on("merge", merge_response());
    let client = judge.as_client();
    let path = review_path("dry");
    let _ = std::fs::remove_file(&path);
    let review = ReviewQueue::new(&path);

    let (outcome, _) = merge_cluster(&store, &embedder, &client, &review, &cluster, true)
        .await
        .unwrap();

    let MergeOutcome::DryRun { id } = outcome else {
        panic!("expected dry run, got {outcome:?}");
    };
    assert_eq!(id, DRY_RUN_ID);
    assert_eq!(store.active_count(), 3);
    assert_eq!(store.stats().unwrap().total, 3);
    assert!(review.load().unwrap().is_empty());
    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn dry_run_fidelity_failure_skips_review_queue() {
    let store = test_store();
    let cluster = fixture(&store);
    let provider = MockEmbedder::new().register(MERGED_TEXT, vec![0.0, 0.0, 1.0]);
    let embedder = BatchEmbedder::new(provider);
    let judge = MockJudge::new().on("merge", merge_response());
    let client = judge.as_client();
    let path = review_path("dry-flag");
    let _ = std::fs::remove_file(&path);
    let review = ReviewQueue::new(&path);

    let (outcome, _) = merge_cluster(&store, &embedder, &client, &review, &cluster, true)
        .await
        .unwrap();

    assert!(matches!(outcome, MergeOutcome::Flagged { .. }));
    assert!(review.load().unwrap().is_empty());
    let _ = std::fs::remove_file(path);
}

#[tokio::test]
async fn empty_synthesis_flags() {
    let store = test_store();
    let cluster = fixture(&store);
    let embedder = BatchEmbedder::new(MockEmbedder::new());
    let judge = MockJudge::new().on(
        "merge",
        json!({"content": "  ", "subject": "x", "kind": "fact", "importance": 5, "expiry": "permanent"}),
    );
    let client = judge.as_client();
    let path = review_path("empty");
    let _ = std::fs::remove_file(&path);
    let review = ReviewQueue::new(&path);

    let (outcome, _) = merge_cluster(&store, &embedder, &client, &review, &cluster, false)
        .await
        .unwrap();
    let MergeOutcome::Flagged { reason } = outcome else {
        panic!("expected flag");
    };
    assert!(reason.contains("empty"));
    assert_eq!(store.active_count(), 3);
    let _ = std::fs::remove_file(path);
}
