mod helpers;

use helpers::{mk_entry, test_store, MockJudge};
use mnemon::consolidate::{build_clusters, validate_cluster, ClusterParams};
use mnemon::db::Entry;
use serde_json::json;

fn embedded(mut e: Entry, emb: Vec<f32>) -> Entry {
    e.embedding = Some(emb);
    e
}

#[tokio::test]
async fn tight_same_kind_pairs_cluster() {
    let store = test_store();
    store
        .import(&[
            embedded(
                mk_entry("a", "fact", "deploy day", "deploys happen friday"),
                vec![1.0, 0.0, 0.0],
            ),
            embedded(
                mk_entry("b", "fact", "release day", "releases go out friday"),
                vec![0.99, 0.14, 0.0],
            ),
            embedded(
                mk_entry("c", "fact", "standup", "standup is daily"),
                vec![0.0, 0.0, 1.0],
            ),
        ])
        .unwrap();

    let build = build_clusters(&store, None, &ClusterParams::tight(Some("fact".into())))
        .await
        .unwrap();

    assert_eq!(build.pool_size, 3);
    assert_eq!(build.clusters.len(), 1);
    assert_eq!(build.clusters[0].len(), 2);
    assert_eq!(build.llm_calls, 0);
    let mut ids: Vec<&str> = build.clusters[0]
        .members
        .iter()
        .map(|(e, _)| e.id.as_str())
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, vec!["a", "b"]);
}

#[tokio::test]
async fn different_kinds_do_not_union_on_similarity_alone() {
    let store = test_store();
    store
        .import(&[
            embedded(
                mk_entry("a", "fact", "payments", "stripe handles payments"),
                vec![1.0, 0.0],
            ),
            embedded(
                mk_entry("b", "decision", "billing", "we picked stripe"),
                vec![0.999, 0.04],
            ),
        ])
        .unwrap();

    let build = build_clusters(&store, None, &ClusterParams::tight(None))
        .await
        .unwrap();
    assert!(build.clusters.is_empty());
}

#[tokio::test]
async fn same_subject_cross_kind_unions_at_stricter_threshold() {
    let store = test_store();
    store
        .import(&[
            embedded(
                mk_entry("a", "fact", "Payment Provider", "stripe handles payments"),
                vec![1.0, 0.0],
            ),
            embedded(
                mk_entry("b", "decision", "payment provider", "we picked stripe for payments"),
                vec![0.999, 0.04],
            ),
        ])
        .unwrap();

    let build = build_clusters(&store, None, &ClusterParams::tight(None))
        .await
        .unwrap();
    assert_eq!(build.clusters.len(), 1);
    assert_eq!(build.clusters[0].len(), 2);
}

#[tokio::test]
async fn loose_band_with_matching_subjects_unions_without_llm() {
    let store = test_store();
    store
        .import(&[
            embedded(
                mk_entry("a", "fact", "API Gateway", "the gateway fronts all traffic"),
                vec![1.0, 0.0],
            ),
            embedded(
                mk_entry("b", "fact", "api gateway", "gateway terminates TLS"),
                vec![0.81, 0.5858],
            ),
        ])
        .unwrap();

    let build = build_clusters(&store, None, &ClusterParams::tight(Some("fact".into())))
        .await
        .unwrap();
    assert_eq!(build.clusters.len(), 1);
    assert_eq!(build.llm_calls, 0);
}

#[tokio::test]
async fn loose_band_consults_judge_when_subjects_differ() {
    let store = test_store();
    store
        .import(&[
            embedded(
                mk_entry("a", "fact", "ingress", "the gateway fronts all traffic"),
                vec![1.0, 0.0],
            ),
            embedded(
                mk_entry("b", "fact", "tls", "gateway terminates TLS"),
                vec![0.81, 0.5858],
            ),
        ])
        .unwrap();

    let judge = MockJudge::new().on("cluster", json!({"same": true}));
    let client = judge.as_client();
    let build = build_clusters(
        &store,
        Some(&client),
        &ClusterParams::tight(Some("fact".into())),
    )
    .await
    .unwrap();

    assert_eq!(build.clusters.len(), 1);
    assert_eq!(build.llm_calls, 1);
    assert_eq!(judge.calls("cluster"), 1);

    // A refusal keeps them apart.
    let store2 = test_store();
    store2
        .import(&[
            embedded(
                mk_entry("a", "fact", "ingress", "the gateway fronts all traffic"),
                vec![1.0, 0.0],
            ),
            embedded(
                mk_entry("b", "fact", "tls", "gateway terminates TLS"),
                vec![0.81, 0.5858],
            ),
        ])
        .unwrap();
    let judge2 = MockJudge::new().on("cluster", json!({"same": false}));
    let client2 = judge2.as_client();
    let build2 = build_clusters(
        &store2,
        Some(&client2),
        &ClusterParams::tight(Some("fact".into())),
    )
    .await
    .unwrap();
    assert!(build2.clusters.is_empty());
}

#[tokio::test]
async fn consolidated_entries_respect_idempotency_window() {
    let store = test_store();
    let mut a = embedded(
        mk_entry("a", "fact", "deploy", "deploys happen friday"),
        vec![1.0, 0.0],
    );
    a.consolidated_at = Some(mnemon::db::now_ms());
    let b = embedded(
        mk_entry("b", "fact", "release", "releases ship friday"),
        vec![0.99, 0.14],
    );
    store.import(&[a, b]).unwrap();

    let build = build_clusters(&store, None, &ClusterParams::tight(Some("fact".into())))
        .await
        .unwrap();
    assert_eq!(build.pool_size, 1);
    assert!(build.clusters.is_empty());

    let mut open = ClusterParams::tight(Some("fact".into()));
    open.idempotency_days = 0;
    let build = build_clusters(&store, None, &open).await.unwrap();
    assert_eq!(build.pool_size, 2);
    assert_eq!(build.clusters.len(), 1);
}

#[test]
fn validation_evicts_low_support_below_diameter_floor() {
    let params = ClusterParams::tight(None); // floor = 0.80

    let mut a = mk_entry("a", "fact", "s", "a");
    a.confirmations = 5;
    let b = mk_entry("b", "fact", "s", "b");
    let c = mk_entry("c", "fact", "s", "c");

    let members = vec![
        (a, vec![1.0, 0.0]),
        (b, vec![0.9, 0.435_889_9]),
        (c, vec![0.62, 0.784_577]),
    ];
    let cluster = validate_cluster(members, &params).expect("cluster survives");
    assert_eq!(cluster.len(), 2);
    let ids: Vec<&str> = cluster.members.iter().map(|(e, _)| e.id.as_str()).collect();
    assert!(ids.contains(&"a"));
    assert!(ids.contains(&"b"));
    assert!(!ids.contains(&"c"));
}

#[test]
fn validation_drops_groups_that_shrink_below_min() {
    let params = ClusterParams::tight(None);
    let members = vec![
        (mk_entry("a", "fact", "s", "a"), vec![1.0, 0.0]),
        (mk_entry("b", "fact", "s", "b"), vec![0.0, 1.0]),
    ];
    assert!(validate_cluster(members, &params).is_none());
}

#[test]
fn validation_caps_oversized_clusters() {
    let mut params = ClusterParams::tight(None);
    params.max_cluster = 4;

    let members: Vec<_> = (0..10)
        .map(|i| {
            let e = mk_entry(&format!("m{i}"), "fact", "s", &format!("text {i}"));
            // Nearly identical vectors, tiny perturbation.
            (e, vec![1.0, 0.001 * i as f32])
        })
        .collect();
    let cluster = validate_cluster(members, &params).expect("capped cluster");
    assert_eq!(cluster.len(), 4);
}

#[test]
fn cluster_fingerprint_ignores_member_order() {
    let a = (mk_entry("a", "fact", "s", "a"), vec![1.0, 0.0]);
    let b = (mk_entry("b", "fact", "s", "b"), vec![1.0, 0.0]);
    let c1 = mnemon::consolidate::Cluster {
        members: vec![a.clone(), b.clone()],
    };
    let c2 = mnemon::consolidate::Cluster {
        members: vec![b, a],
    };
    assert_eq!(c1.fingerprint(), c2.fingerprint());
}
