//! Spawns the real `source-fs`/`destination-fs` reference plugins over
//! the actual mTLS RPC transport and drives one full list → download →
//! store cycle, exercising the path the `EarlyStream` buffering fix in
//! `plugin-rpc` protects.

use std::collections::BTreeMap;
use std::path::PathBuf;

use ingest_api::{Destination, Source};
use plugin_manager::{PluginLabels, PluginManager};
use tokio_util::sync::CancellationToken;

fn source_labels() -> PluginLabels {
    PluginLabels { component: "source", plugin_type: "source-fs".to_string(), name: "fs-in".to_string() }
}

fn destination_labels() -> PluginLabels {
    PluginLabels { component: "destination", plugin_type: "destination-fs".to_string(), name: "fs-out".to_string() }
}

#[tokio::test]
async fn lists_downloads_and_stores_through_real_plugin_processes() {
    let in_dir = tempdir("in");
    let out_dir = tempdir("out");
    tokio::fs::write(in_dir.join("a.txt"), b"hello from source-fs").await.unwrap();

    let manager = PluginManager::new();
    let source_path = sibling_binary("source-fs");
    let destination_path = sibling_binary("destination-fs");

    let source = manager
        .new_source(&source_path, config(&in_dir), source_labels())
        .await
        .expect("spawn source-fs");
    let destination = manager
        .new_destination(&destination_path, config(&out_dir), destination_labels())
        .await
        .expect("spawn destination-fs");

    let cancel = CancellationToken::new();
    source.reset(&cancel).await.unwrap();
    let reference = source.next(&cancel).await.unwrap();
    assert_eq!(reference.name, "a.txt");

    let object = source.download(&reference, &cancel).await.unwrap();
    assert_eq!(object.mime_type, "text/plain");

    let url = destination.store(&reference, object, &cancel).await.unwrap();
    assert!(url.starts_with("file://"));

    let stored = tokio::fs::read(out_dir.join("a.txt")).await.unwrap();
    assert_eq!(stored, b"hello from source-fs");

    assert!(matches!(source.next(&cancel).await, Err(e) if e.is_eof()));

    manager.stop().await;
    let _ = tokio::fs::remove_dir_all(&in_dir).await;
    let _ = tokio::fs::remove_dir_all(&out_dir).await;
}

fn config(dir: &std::path::Path) -> BTreeMap<String, String> {
    BTreeMap::from([("root".to_string(), dir.display().to_string())])
}

/// This test's own binary lives under `target/<profile>/deps/`; the
/// reference plugin binaries are built as siblings one level up.
fn sibling_binary(name: &str) -> PathBuf {
    let exe = std::env::current_exe().unwrap();
    let profile_dir = exe.ancestors().nth(2).expect("deps/ has a target/<profile> ancestor");
    let path = profile_dir.join(name);
    assert!(path.is_file(), "expected plugin binary at {} (run `cargo build --workspace` first)", path.display());
    path
}

fn tempdir(suffix: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("ingest-fs-plugin-test-{}-{suffix}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}
