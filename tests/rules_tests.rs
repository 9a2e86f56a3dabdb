mod helpers;

use helpers::{mk_entry, test_store};
use mnemon::consolidate::{run_rules, RulesOptions};
use mnemon::db::{Entry, EntryStatus, EntryStore, RelationKind, Tier};

const DAY_MS: i64 = 86_400_000;

fn embedded(mut e: Entry, emb: Vec<f32>) -> Entry {
    e.embedding = Some(emb);
    e
}

fn aged(mut e: Entry, days_ago: i64) -> Entry {
    let then = mnemon::db::now_ms() - days_ago * DAY_MS;
    e.created_at = then;
    e.updated_at = then;
    e
}

#[test]
fn temporary_entries_expire_below_recency_floor() {
    let store = test_store();
    let mut old_temp = aged(mk_entry("old-temp", "event", "sprint", "sprint 12 started"), 20);
    old_temp.tier = Tier::Temporary;
    let mut fresh_temp = aged(mk_entry("fresh-temp", "event", "sprint", "sprint 14 started"), 2);
    fresh_temp.tier = Tier::Temporary;
    let mut old_core = aged(mk_entry("old-core", "fact", "name", "the product is mnemon"), 400);
    old_core.tier = Tier::Core;
    let mut old_perm = aged(mk_entry("old-perm", "fact", "lang", "written in rust"), 400);
    old_perm.tier = Tier::Permanent;
    store
        .import(&[old_temp, fresh_temp, old_core, old_perm])
        .unwrap();

    let stats = run_rules(&store, &RulesOptions::default()).unwrap();

    assert_eq!(stats.expired, 1);
    assert_eq!(stats.merged, 0);
    assert!(stats.invariant_ok);
    assert_eq!(
        store.get("old-temp").unwrap().unwrap().status,
        EntryStatus::Expired
    );
    // Core and permanent never expire, no matter the age.
    for id in ["fresh-temp", "old-core", "old-perm"] {
        assert_eq!(store.get(id).unwrap().unwrap().status, EntryStatus::Active);
    }
    assert_eq!(stats.entries_after, 3);
}

#[test]
fn near_exact_triplet_merges_into_highest_support_keeper() {
    let store = test_store();
    let mut a = embedded(
        mk_entry("a", "fact", "deploy day", "deploys go out on friday"),
        vec![1.0, 0.0, 0.0],
    );
    a.confirmations = 1;
    let mut b = embedded(
        mk_entry("b", "fact", "Deploy Day", "deploys happen friday"),
        vec![0.999, 0.02, 0.0],
    );
    b.confirmations = 4;
    b.recall_count = 2;
    let mut c = embedded(
        mk_entry("c", "fact", "deploy day", "friday is deploy day"),
        vec![0.998, 0.03, 0.0],
    );
    c.recall_count = 1;
    store.import(&[a, b, c]).unwrap();

    let before = store.active_count();
    let stats = run_rules(&store, &RulesOptions::default()).unwrap();

    assert_eq!(stats.merged, 2);
    assert_eq!(stats.expired, 0);
    assert!(stats.invariant_ok);
    assert_eq!(stats.entries_after, before - 2);

    // Keeper is b (support 6); a and c absorbed into it.
    let keeper = store.get("b").unwrap().unwrap();
    assert_eq!(keeper.status, EntryStatus::Active);
    assert_eq!(keeper.merged_from, 2);
    assert_eq!(keeper.confirmations, 4 + 1);
    assert_eq!(keeper.recall_count, 2 + 1);
    assert!(keeper.consolidated_at.is_some());
    for id in ["a", "c"] {
        let e = store.get(id).unwrap().unwrap();
        assert_eq!(e.status, EntryStatus::Superseded { by: "b".into() });
    }
    let sources = store.sources_for("b").unwrap();
    assert_eq!(sources.len(), 2);
    assert_eq!(store.relation_count(Some(RelationKind::Supersedes)), 2);
}

#[test]
fn near_exact_requires_same_kind_and_subject() {
    let store = test_store();
    // Same vectors but different kinds or subjects — no rule merge.
    store
        .import(&[
            embedded(mk_entry("a", "fact", "deploy day", "deploys friday"), vec![1.0, 0.0]),
            embedded(
                mk_entry("b", "decision", "deploy day", "we deploy friday"),
                vec![1.0, 0.0],
            ),
            embedded(mk_entry("c", "fact", "release day", "deploys friday v2"), vec![1.0, 0.0]),
        ])
        .unwrap();

    let stats = run_rules(&store, &RulesOptions::default()).unwrap();
    assert_eq!(stats.merged, 0);
    assert_eq!(store.active_count(), 3);
}

#[test]
fn orphaned_relations_pruned_supersedes_kept() {
    let store = test_store();
    store
        .import(&[
            mk_entry("a", "fact", "x", "entry a"),
            mk_entry("b", "fact", "y", "entry b"),
            mk_entry("c", "fact", "z", "entry c"),
        ])
        .unwrap();
    store.supersede("a", "b").unwrap();
    // A related edge touching the now-inactive entry is an orphan.
    store.insert_relation("a", "c", RelationKind::Related).unwrap();
    // One between two active entries stays.
    store.insert_relation("b", "c", RelationKind::Related).unwrap();

    let stats = run_rules(&store, &RulesOptions::default()).unwrap();

    assert_eq!(stats.relations_pruned, 1);
    assert_eq!(store.relation_count(Some(RelationKind::Supersedes)), 1);
    assert_eq!(store.relation_count(Some(RelationKind::Related)), 1);
}

#[test]
fn dry_run_reports_counts_without_writing() {
    let store = test_store();
    let mut old_temp = aged(mk_entry("old-temp", "event", "sprint", "sprint 12 started"), 20);
    old_temp.tier = Tier::Temporary;
    store
        .import(&[
            old_temp,
            embedded(mk_entry("a", "fact", "deploy day", "deploys friday"), vec![1.0, 0.0]),
            embedded(mk_entry("b", "fact", "deploy day", "friday deploys"), vec![0.999, 0.02]),
        ])
        .unwrap();

    let before = store.active_count();
    let stats = run_rules(
        &store,
        &RulesOptions {
            dry_run: true,
            ..Default::default()
        },
    )
    .unwrap();

    assert!(stats.dry_run);
    assert_eq!(stats.expired, 1);
    assert_eq!(stats.merged, 1);
    // Nothing actually changed.
    assert_eq!(store.active_count(), before);
    assert_eq!(
        store.get("old-temp").unwrap().unwrap().status,
        EntryStatus::Active
    );
    assert!(store.sources_for("a").unwrap().is_empty());
}

#[test]
fn backup_written_and_pruned_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("mnemon.db");
    let store = EntryStore::open(db_path.to_str().unwrap()).unwrap();
    store
        .import(&[mk_entry("a", "fact", "x", "something worth backing up")])
        .unwrap();

    let opts = RulesOptions {
        backup_keep: 2,
        ..Default::default()
    };
    let mut paths = Vec::new();
    for _ in 0..4 {
        let stats = run_rules(&store, &opts).unwrap();
        let p = stats.backup_path.expect("on-disk store backs up");
        assert!(std::path::Path::new(&p).exists());
        paths.push(p);
        // Distinct timestamp suffix per backup.
        std::thread::sleep(std::time::Duration::from_millis(5));
    }

    let backups: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.contains(".backup."))
        .collect();
    assert_eq!(backups.len(), 2, "only the most recent backups survive: {backups:?}");
    // The newest backup is among the survivors.
    let newest = paths.last().unwrap();
    assert!(backups
        .iter()
        .any(|n| newest.ends_with(n.as_str())));
}

#[test]
fn invariant_holds_with_mixed_mutations() {
    let store = test_store();
    let mut t = aged(mk_entry("t", "event", "old", "stale temporary note"), 30);
    t.tier = Tier::Temporary;
    store
        .import(&[
            t,
            embedded(mk_entry("a", "fact", "cache", "cache ttl is 60s"), vec![1.0, 0.0]),
            embedded(mk_entry("b", "fact", "cache", "ttl of cache: 60s"), vec![0.999, 0.01]),
            embedded(mk_entry("x", "fact", "other", "unrelated knowledge"), vec![0.0, 1.0]),
        ])
        .unwrap();

    let stats = run_rules(&store, &RulesOptions::default()).unwrap();
    assert_eq!(stats.entries_before, 4);
    assert_eq!(stats.expired, 1);
    assert_eq!(stats.merged, 1);
    assert_eq!(stats.entries_after, 2);
    assert!(stats.invariant_ok);
}
