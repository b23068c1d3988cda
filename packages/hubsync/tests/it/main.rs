use std::path::Path;

use serde_json::json;
use tempfile::TempDir;

use hubsync::config::Options;

pub mod assets;
pub mod fake;
pub mod sync;

#[track_caller]
pub fn temporary_directory() -> (TempDir, std::path::PathBuf) {
    let dir = TempDir::new().expect("create temporary directory");
    let path = dir.path().to_path_buf();
    (dir, path)
}

/// Options every flow test starts from: a fixed tenant, hashes flushed on
/// every mutation, and fast deterministic retries.
pub fn test_options() -> Options {
    options_with(json!({}))
}

pub fn options_with(overlay: serde_json::Value) -> Options {
    let base = json!({
        "x-ibm-dx-tenant-id": "tenant-test",
        "hashesWriteThreshold": 1,
        "retryMaxAttempts": 3,
        "retryMinTimeout": 1,
        "retryMaxTimeout": 10,
        "retryRandomize": false,
    });
    let base = Options::from_object(as_object(base));
    base.merged_with(&Options::from_object(as_object(overlay)))
}

fn as_object(value: serde_json::Value) -> serde_json::Map<String, serde_json::Value> {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("expected JSON object, got {other}"),
    }
}

pub async fn open_hashes(dir: &Path, options: &Options) -> hubsync::hashes::Hashes {
    hubsync::hashes::Hashes::open(dir, options)
        .await
        .expect("open hashes store")
}
