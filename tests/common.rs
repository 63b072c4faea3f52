#![allow(dead_code)]

use std::path::PathBuf;

use grimdb::GrimDb;

/// A small corpus of files to index: two containing "hello", one not.
pub fn sample_corpus() -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create corpus dir");
    std::fs::write(dir.path().join("a.bin"), b"hello world").unwrap();
    std::fs::write(dir.path().join("b.bin"), b"xor xor xor").unwrap();
    std::fs::create_dir(dir.path().join("sub")).unwrap();
    std::fs::write(dir.path().join("sub/c.bin"), b"say hello again").unwrap();
    let root = dir.path().to_path_buf();
    (dir, root)
}

/// Starts a service over a fresh database directory.
pub fn open_service(workers: usize) -> (tempfile::TempDir, GrimDb) {
    let dir = tempfile::TempDir::new().expect("create db dir");
    let db = GrimDb::open_with_workers(dir.path(), workers).expect("open service");
    (dir, db)
}

/// Submits a request and parses the JSON reply.
pub async fn request_json(db: &GrimDb, request: &str) -> serde_json::Value {
    let reply = db.request(request).await.expect("service alive");
    serde_json::from_str(&reply).expect("reply is JSON")
}

/// Asserts the reply is `{"type":"ok"}`.
pub async fn request_ok(db: &GrimDb, request: &str) {
    let reply = request_json(db, request).await;
    assert_eq!(reply["type"], "ok", "request {:?} got {}", request, reply);
}

/// The dataset ids currently visible in topology.
pub async fn topology_ids(db: &GrimDb) -> Vec<String> {
    let reply = request_json(db, "topology;").await;
    reply["datasets"]
        .as_array()
        .expect("datasets array")
        .iter()
        .map(|ds| ds["id"].as_str().unwrap().to_string())
        .collect()
}
