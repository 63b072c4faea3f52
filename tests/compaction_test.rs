//! Compaction and Reindex Tests
//!
//! Both operations follow the same swap discipline: build a new dataset,
//! publish it, drop the sources, all inside one task commit. Subsequent
//! snapshots see the new id only.

mod common;

use common::{open_service, request_json, request_ok, topology_ids};

#[tokio::test]
async fn compact_all_merges_datasets_under_a_new_id() {
    let (_corpus, corpus_path) = common::sample_corpus();
    let (_dir, db) = open_service(2);

    // Two single-file datasets.
    request_ok(
        &db,
        &format!("index \"{}\";", corpus_path.join("a.bin").display()),
    )
    .await;
    request_ok(
        &db,
        &format!("index \"{}\";", corpus_path.join("b.bin").display()),
    )
    .await;
    let before = topology_ids(&db).await;
    assert_eq!(before.len(), 2);

    request_ok(&db, "compact all;").await;

    let after = topology_ids(&db).await;
    assert_eq!(after.len(), 1);
    assert!(
        !before.contains(&after[0]),
        "merged dataset must carry a fresh id"
    );

    let reply = request_json(&db, "topology;").await;
    assert_eq!(reply["datasets"][0]["file_count"], 2);

    // Queries keep working against the merged dataset.
    let reply = request_json(&db, "select \"hello\";").await;
    assert_eq!(reply["files"].as_array().unwrap().len(), 1);

    db.shutdown();
}

#[tokio::test]
async fn compact_with_one_dataset_is_a_noop() {
    let (_corpus, corpus_path) = common::sample_corpus();
    let (_dir, db) = open_service(1);

    request_ok(&db, &format!("index \"{}\";", corpus_path.display())).await;
    let before = topology_ids(&db).await;

    request_ok(&db, "compact all;").await;
    request_ok(&db, "compact smart;").await;

    // Nothing to merge: same dataset, same id.
    assert_eq!(topology_ids(&db).await, before);

    db.shutdown();
}

#[tokio::test]
async fn compact_smart_merges_equal_small_datasets() {
    let (_corpus, corpus_path) = common::sample_corpus();
    let (_dir, db) = open_service(1);

    request_ok(
        &db,
        &format!("index \"{}\";", corpus_path.join("a.bin").display()),
    )
    .await;
    request_ok(
        &db,
        &format!("index \"{}\";", corpus_path.join("b.bin").display()),
    )
    .await;

    // Both datasets sit at (or below) the mean size, so smart mode picks
    // them both up.
    request_ok(&db, "compact smart;").await;
    assert_eq!(topology_ids(&db).await.len(), 1);

    db.shutdown();
}

#[tokio::test]
async fn reindex_rebuilds_under_a_new_id() {
    let (_corpus, corpus_path) = common::sample_corpus();
    let (_dir, db) = open_service(1);

    request_ok(&db, &format!("index \"{}\" with [gram3];", corpus_path.display())).await;
    let before = topology_ids(&db).await;
    assert_eq!(before.len(), 1);

    request_ok(&db, &format!("reindex \"{}\" with [text4];", before[0])).await;

    let reply = request_json(&db, "topology;").await;
    let datasets = reply["datasets"].as_array().unwrap();
    assert_eq!(datasets.len(), 1);
    assert_ne!(datasets[0]["id"].as_str().unwrap(), before[0]);
    assert_eq!(datasets[0]["indexes"][0]["type"], "text4");
    assert_eq!(datasets[0]["file_count"], 3);

    // Reindexing something that was already swapped away fails cleanly.
    let reply = request_json(&db, &format!("reindex \"{}\";", before[0])).await;
    assert_eq!(reply["type"], "error");

    db.shutdown();
}

#[tokio::test]
async fn taints_survive_reindex_and_merge_on_compact() {
    let (_corpus, corpus_path) = common::sample_corpus();
    let (_dir, db) = open_service(1);

    request_ok(
        &db,
        &format!(
            "index \"{}\" with taints [\"evil\"];",
            corpus_path.join("a.bin").display()
        ),
    )
    .await;
    request_ok(
        &db,
        &format!(
            "index \"{}\" with taints [\"fresh\"];",
            corpus_path.join("b.bin").display()
        ),
    )
    .await;

    request_ok(&db, "compact all;").await;

    let reply = request_json(&db, "topology;").await;
    let taints = reply["datasets"][0]["taints"].as_array().unwrap();
    let mut taints: Vec<&str> = taints.iter().map(|t| t.as_str().unwrap()).collect();
    taints.sort_unstable();
    assert_eq!(taints, vec!["evil", "fresh"]);

    db.shutdown();
}
