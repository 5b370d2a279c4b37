//! Snapshot Tests - Persistence Boundary and Degraded Mode
//!
//! Export/restore through the catalog, fresh starts on missing or corrupt
//! buffers, flush counting for deferred bulk writes, file-backed reopen.

use geocatalog::*;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn populated(config: CatalogConfig) -> Catalog {
    let catalog = Catalog::open(config);
    catalog
        .upsert(
            Resource::new("a")
                .with_scalar("dct_title_s", "Alpha")
                .with_scalar("dcat_bbox", "ENVELOPE(-10,10,10,-10)")
                .with_values("dct_subject_sm", ["History"]),
            vec![Distribution::new("url", "https://example.org/a")],
        )
        .await
        .unwrap();
    catalog
}

/// Test: a snapshot restores into an equivalent catalog
#[tokio::test]
async fn test_snapshot_round_trip() {
    init_tracing();
    let source = populated(CatalogConfig::default()).await;

    let snapshot = source.export_snapshot().await.unwrap();
    assert!(snapshot.metadata.compressed);
    assert_eq!(snapshot.metadata.resource_count, 1);

    let restored = Catalog::restore_snapshot(&snapshot, CatalogConfig::default());
    assert!(restored.is_available());

    let a = restored.get_resource("a").await.unwrap();
    assert_eq!(a.title(), Some("Alpha"));
    assert_eq!(a.distributions.len(), 1);

    let response = restored
        .faceted_search(
            &SearchRequest::new()
                .with_bbox(BoundingBox::new(-1.0, -1.0, 1.0, 1.0))
                .with_facet("dct_subject_sm", None),
        )
        .await
        .unwrap();
    assert_eq!(response.ids(), vec!["a"]);
    assert_eq!(response.facets["dct_subject_sm"][0].count, 1);
}

/// Test: uncompressed snapshots restore through the plain entry point
#[tokio::test]
async fn test_uncompressed_snapshot_restores() {
    init_tracing();
    let config = CatalogConfig {
        compress_snapshots: false,
        ..Default::default()
    };
    let source = populated(config.clone()).await;
    let snapshot = source.export_snapshot().await.unwrap();
    assert!(!snapshot.metadata.compressed);

    let restored = Catalog::restore(Some(snapshot.bytes.as_slice()), config);
    assert_eq!(restored.count().await.unwrap(), 1);
}

/// Test: absent and empty buffers start fresh
#[tokio::test]
async fn test_restore_without_bytes_starts_empty() {
    init_tracing();

    let absent = Catalog::restore(None, CatalogConfig::default());
    assert!(absent.is_available());
    assert_eq!(absent.count().await.unwrap(), 0);

    let empty = Catalog::restore(Some(&[][..]), CatalogConfig::default());
    assert!(empty.is_available());
    assert_eq!(empty.count().await.unwrap(), 0);
}

/// Test: corrupt buffers are logged and the catalog starts fresh
#[tokio::test]
async fn test_restore_corrupt_bytes_starts_empty() {
    init_tracing();

    let corrupt = Catalog::restore(Some(&b"this is not a database image"[..]), CatalogConfig::default());
    assert!(corrupt.is_available());
    assert_eq!(corrupt.count().await.unwrap(), 0);

    let source = populated(CatalogConfig::default()).await;
    let mut snapshot = source.export_snapshot().await.unwrap();
    snapshot.metadata.checksum = "0".repeat(64);
    let mismatched = Catalog::restore_snapshot(&snapshot, CatalogConfig::default());
    assert!(mismatched.is_available());
    assert_eq!(mismatched.count().await.unwrap(), 0);

    // Restored catalogs accept writes
    mismatched.upsert(Resource::new("z"), Vec::new()).await.unwrap();
    assert_eq!(mismatched.count().await.unwrap(), 1);
}

/// Test: each single write flushes, a bulk import flushes once
#[tokio::test]
async fn test_bulk_import_flushes_once() {
    init_tracing();
    let sink = Arc::new(MemorySink::new());
    let catalog = Catalog::open(CatalogConfig::default()).with_sink(sink.clone());

    catalog.upsert(Resource::new("first"), Vec::new()).await.unwrap();
    catalog.delete("first").await.unwrap();
    assert_eq!(sink.flush_count(), 2);

    let records: Vec<_> = (0..25)
        .map(|i| json!({"id": format!("r{}", i), "dct_title_s": format!("Record {}", i)}))
        .collect();
    let report = catalog.import_bulk(records).await.unwrap();
    assert_eq!(report.processed, 25);
    assert_eq!(sink.flush_count(), 3);

    let latest = sink.latest().unwrap();
    assert_eq!(latest.metadata.resource_count, 25);

    let restored = Catalog::restore_snapshot(&latest, CatalogConfig::default());
    assert_eq!(restored.count().await.unwrap(), 25);
}

/// Test: a file-backed catalog keeps its data across reopen
#[tokio::test]
async fn test_file_backed_catalog_reopens() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let config = CatalogConfig {
        database_path: Some(dir.path().join("catalog.sqlite")),
        ..Default::default()
    };

    {
        let catalog = populated(config.clone()).await;
        assert_eq!(catalog.count().await.unwrap(), 1);
    }

    let reopened = Catalog::open(config);
    let a = reopened.get_resource("a").await.unwrap();
    assert_eq!(a.geometry, Some(Envelope::new(-10.0, -10.0, 10.0, 10.0)));
}

/// Test: config loads from JSON, missing keys take defaults
#[test]
fn test_config_from_json_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("catalog.json");
    std::fs::write(
        &path,
        r#"{"default_page_size": 25, "timeline_field": "gbl_indexYear_im", "compress_snapshots": false}"#,
    )
    .unwrap();

    let config = CatalogConfig::from_json_file(&path).unwrap();
    assert_eq!(config.default_page_size, 25);
    assert!(!config.compress_snapshots);
    assert_eq!(config.default_facet_limit, 10);
    assert_eq!(config.relation_key_for("http://schema.org/downloadUrl"), "download");
}

/// Test: an engine that cannot open leaves a degraded but usable catalog
#[tokio::test]
async fn test_degraded_catalog() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let config = CatalogConfig {
        database_path: Some(dir.path().join("missing").join("nested").join("catalog.sqlite")),
        ..Default::default()
    };
    let sink = Arc::new(MemorySink::new());
    let catalog = Catalog::open(config).with_sink(sink.clone());
    assert!(!catalog.is_available());

    catalog.upsert(Resource::new("a"), Vec::new()).await.unwrap();
    let report = catalog.import_bulk(vec![json!({"id": "b"})]).await.unwrap();
    assert_eq!(report.processed, 0);
    assert_eq!(sink.flush_count(), 0);

    let response = catalog
        .faceted_search(&SearchRequest::new().with_query("anything"))
        .await
        .unwrap();
    assert!(response.results.is_empty());
    assert!(catalog.distinct_values("dct_subject_sm", None).await.unwrap().is_empty());
    assert!(catalog.export_records().await.unwrap().is_empty());
}
