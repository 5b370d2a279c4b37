//! Import Tests - Bulk JSON and Tabular Write Paths
//!
//! Bulk reconciliation counts, reference round trips through export and
//! re-import, and the tabular resources/distributions split.

use geocatalog::*;
use serde_json::json;
use std::collections::HashMap;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn catalog() -> Catalog {
    init_tracing();
    Catalog::open(CatalogConfig::default())
}

fn row(cells: &[(&str, &str)]) -> TabularRow {
    cells
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn sorted(mut dists: Vec<Distribution>) -> Vec<Distribution> {
    dists.sort_by(|a, b| (&a.relation_key, &a.url).cmp(&(&b.relation_key, &b.url)));
    dists
}

/// Test: four records, one without an id
#[tokio::test]
async fn test_bulk_import_skips_record_without_id() {
    let catalog = catalog();

    let records = vec![
        json!({"id": "a", "dct_title_s": "Alpha", "dct_subject_sm": ["Roads"]}),
        json!({"id": "b", "dct_title_s": "Bravo"}),
        json!({"dct_title_s": "Nobody"}),
        json!({
            "id": "c",
            "dct_title_s": "Charlie",
            "dct_references_s": "{\"http://schema.org/downloadUrl\": \"https://example.org/c.zip\"}"
        }),
    ];
    let report = catalog.import_bulk(records).await.unwrap();

    assert_eq!(report.processed, 3);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(catalog.count().await.unwrap(), 3);

    let c = catalog.get_resource("c").await.unwrap();
    assert_eq!(
        c.distributions,
        vec![Distribution::new("download", "https://example.org/c.zip")]
    );
}

/// Test: a bad record is counted and does not stop the batch
#[tokio::test]
async fn test_bulk_import_continues_after_failure() {
    let catalog = catalog();

    let records = vec![
        json!({"id": "a", "dct_references_s": "{\"http://schema.org/url\": 7}"}),
        json!({"id": "b", "dct_title_s": "Bravo"}),
        json!("not an object"),
    ];
    let report = catalog.import_bulk(records).await.unwrap();

    assert_eq!(report.processed, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(report.failed, 1);
    assert!(catalog.get_resource("b").await.is_ok());
}

/// Test: references collapse and expand the same way in both directions
#[tokio::test]
async fn test_distribution_round_trip() {
    let source = catalog();
    let distributions = vec![
        Distribution::new("url", "https://example.org/landing"),
        Distribution::new("download", "https://example.org/a.zip"),
        Distribution::new("download", "https://example.org/b.zip"),
        Distribution::new("wms", "https://example.org/wms").with_label("Web Map Service"),
    ];
    source
        .upsert(
            Resource::new("r1").with_scalar("dct_title_s", "Round Trip"),
            distributions.clone(),
        )
        .await
        .unwrap();

    let records = source.export_records().await.unwrap();
    assert_eq!(records.len(), 1);

    let references: serde_json::Value =
        serde_json::from_str(records[0]["dct_references_s"].as_str().unwrap()).unwrap();
    assert_eq!(references["http://schema.org/url"], json!("https://example.org/landing"));
    assert_eq!(
        references["http://schema.org/downloadUrl"],
        json!([{"url": "https://example.org/a.zip"}, {"url": "https://example.org/b.zip"}])
    );
    assert_eq!(
        references["http://www.opengis.net/def/serviceType/ogc/wms"],
        json!([{"url": "https://example.org/wms", "label": "Web Map Service"}])
    );

    let target = catalog();
    let report = target.import_bulk(records).await.unwrap();
    assert_eq!(report.processed, 1);

    let restored = target.get_resource("r1").await.unwrap();
    assert_eq!(restored.title(), Some("Round Trip"));
    assert_eq!(sorted(restored.distributions), sorted(distributions));
}

/// Test: one URL offered under two labels keeps both rows
#[tokio::test]
async fn test_same_url_with_distinct_labels() {
    let source = catalog();
    let record = json!({
        "id": "a",
        "dct_title_s": "Alpha",
        "dct_references_s": {
            "http://schema.org/downloadUrl": [
                {"url": "https://example.org/a.zip", "label": "Shapefile"},
                {"url": "https://example.org/a.zip", "label": "GeoJSON"},
                {"url": "https://example.org/a.zip", "label": "GeoJSON"}
            ]
        }
    });
    let report = source.import_bulk(vec![record]).await.unwrap();
    assert_eq!(report.processed, 1);

    let expected = vec![
        Distribution::new("download", "https://example.org/a.zip").with_label("Shapefile"),
        Distribution::new("download", "https://example.org/a.zip").with_label("GeoJSON"),
    ];
    let a = source.get_resource("a").await.unwrap();
    assert_eq!(a.distributions, expected);

    let target = catalog();
    target.import_bulk(source.export_records().await.unwrap()).await.unwrap();
    let restored = target.get_resource("a").await.unwrap();
    assert_eq!(restored.distributions, expected);
}

/// Test: tabular resources replace metadata but keep distributions
#[tokio::test]
async fn test_tabular_resource_import() {
    let catalog = catalog();
    catalog
        .upsert(
            Resource::new("a")
                .with_scalar("dct_title_s", "Old title")
                .with_values("dct_subject_sm", ["Stale"]),
            vec![Distribution::new("url", "https://example.org/a")],
        )
        .await
        .unwrap();

    let rows = vec![
        row(&[
            ("ID", "a"),
            ("Title", "New title"),
            ("Subject", "Roads | History | Roads"),
            ("Bounding Box", "ENVELOPE(-1,1,1,-1)"),
        ]),
        row(&[
            ("ID", "b"),
            ("Title", "Bravo"),
            ("References", "{\"http://schema.org/downloadUrl\": \"https://example.org/b.zip\"}"),
        ]),
    ];
    let summary = catalog.import_tabular(rows, None).await.unwrap();
    assert_eq!(summary.kind, TableKind::Resources);
    assert_eq!(summary.added_count, 2);

    let a = catalog.get_resource("a").await.unwrap();
    assert_eq!(a.title(), Some("New title"));
    assert_eq!(a.values("dct_subject_sm"), ["History", "Roads"]);
    assert_eq!(a.geometry, Some(Envelope::new(-1.0, -1.0, 1.0, 1.0)));
    assert_eq!(a.distributions, vec![Distribution::new("url", "https://example.org/a")]);

    let b = catalog.get_resource("b").await.unwrap();
    assert_eq!(
        b.distributions,
        vec![Distribution::new("download", "https://example.org/b.zip")]
    );

    let response = catalog
        .search(&SearchRequest::new().with_query("stale"))
        .await
        .unwrap();
    assert_eq!(response.total, 0);
}

/// Test: distributions table appends without touching metadata
#[tokio::test]
async fn test_tabular_distribution_import() {
    let catalog = catalog();
    catalog
        .upsert(
            Resource::new("a")
                .with_scalar("dct_title_s", "Alpha")
                .with_values("dct_subject_sm", ["Roads"]),
            vec![Distribution::new("url", "https://example.org/a")],
        )
        .await
        .unwrap();

    let rows = vec![
        row(&[
            ("ID", "a"),
            ("Type", "http://schema.org/downloadUrl"),
            ("URL", "https://example.org/a.zip"),
            ("Label", "Shapefile"),
        ]),
        row(&[("ID", "a"), ("Type", "url"), ("URL", "https://example.org/a")]),
    ];
    let summary = catalog.import_tabular(rows, None).await.unwrap();
    assert_eq!(summary.kind, TableKind::Distributions);
    assert_eq!(summary.added_count, 1);

    let a = catalog.get_resource("a").await.unwrap();
    assert_eq!(a.values("dct_subject_sm"), ["Roads"]);
    assert_eq!(
        a.distributions,
        vec![
            Distribution::new("url", "https://example.org/a"),
            Distribution::new("download", "https://example.org/a.zip").with_label("Shapefile"),
        ]
    );
}

/// Test: caller-supplied aliases map custom headers
#[tokio::test]
async fn test_tabular_custom_aliases() {
    let catalog = catalog();

    let mut aliases = HashMap::new();
    aliases.insert("Record".to_string(), "id".to_string());
    aliases.insert("Name".to_string(), "dct_title_s".to_string());
    aliases.insert("Tags".to_string(), "dcat_keyword_sm".to_string());

    let rows = vec![row(&[("Record", "x1"), ("Name", "Parcels"), ("Tags", "cadastre|land")])];
    let summary = catalog.import_tabular(rows, Some(aliases)).await.unwrap();
    assert_eq!(summary.kind, TableKind::Resources);

    let response = catalog
        .search(&SearchRequest::new().with_query("cadastre"))
        .await
        .unwrap();
    assert_eq!(response.ids(), vec!["x1"]);
}

/// Test: unrecognized tables are rejected
#[tokio::test]
async fn test_tabular_unrecognized() {
    let catalog = catalog();

    let rows = vec![row(&[("Name", "x"), ("Value", "y")])];
    assert!(matches!(
        catalog.import_tabular(rows, None).await,
        Err(Error::InvalidInput(_))
    ));
}

/// Test: classification needs nothing but column names
#[test]
fn test_classify_columns_in_isolation() {
    assert_eq!(classify_columns(&["id", "dct_title_s", "dct_subject_sm"]), TableKind::Resources);
    assert_eq!(classify_columns(&["id", "type", "url"]), TableKind::Distributions);
    assert_eq!(classify_columns(&["dct_title_s"]), TableKind::Unrecognized);
}

/// Test: delete removes every trace of a resource
#[tokio::test]
async fn test_delete_resource() {
    let catalog = catalog();
    catalog
        .upsert_record(json!({
            "id": "a",
            "dct_title_s": "Alpha",
            "dct_subject_sm": ["Roads"],
            "dct_references_s": {"http://schema.org/url": "https://example.org/a"}
        }))
        .await
        .unwrap();
    catalog.cache_thumbnail("a", "https://img.example.org/a.png").await.unwrap();
    catalog.cache_static_map("a", "https://maps.example.org/a.png").await.unwrap();

    let a = catalog.get_resource("a").await.unwrap();
    assert_eq!(a.thumbnail.as_deref(), Some("https://img.example.org/a.png"));
    assert!(catalog.static_map("a").await.unwrap().is_some());

    assert!(catalog.delete("a").await.unwrap());
    assert!(!catalog.delete("a").await.unwrap());
    assert!(matches!(catalog.get_resource("a").await, Err(Error::NotFound(_))));
    assert!(catalog.static_map("a").await.unwrap().is_none());
    assert!(catalog.distinct_values("dct_subject_sm", None).await.unwrap().is_empty());
    assert_eq!(
        catalog.search(&SearchRequest::new().with_query("alpha")).await.unwrap().total,
        0
    );
}
