//! Bulk JSON and tabular import, record export
//!
//! Bulk records are loosely typed JSON objects keyed by field name. Tabular
//! rows are column -> cell maps whose column names go through the alias
//! table before they are matched against the schema.

use crate::config::CatalogConfig;
use crate::error::{Error, Result};
use crate::reconcile::{append_distributions, replace_resource, upsert_resource, ReplaceMode};
use crate::references::{parse_references, references_text};
use crate::schema::ResourceSchema;
use crate::types::{Distribution, Resource, REFERENCES_FIELD};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, info, warn};

/// One tabular row: column name -> cell text
pub type TabularRow = BTreeMap<String, String>;

/// Per-record outcome counts of a bulk import
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportReport {
    pub processed: usize,
    /// Records without an ID
    pub skipped: usize,
    pub failed: usize,
}

/// What a tabular input holds, judged from its column names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TableKind {
    Resources,
    Distributions,
    Unrecognized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabularImportSummary {
    pub kind: TableKind,
    /// Resources replaced, or distribution rows inserted
    pub added_count: usize,
}

/// Non-empty ID of a record; numbers are accepted and stringified
pub fn record_id(record: &Value) -> Option<String> {
    let id = match record.get("id")? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    if id.is_empty() {
        None
    } else {
        Some(id)
    }
}

fn cell_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

/// Normalize one bulk record into a resource and its distributions
pub fn resource_from_record(
    record: &Value,
    schema: &ResourceSchema,
    config: &CatalogConfig,
) -> Result<(Resource, Vec<Distribution>)> {
    let object = record
        .as_object()
        .ok_or_else(|| Error::InvalidInput("record is not a JSON object".to_string()))?;
    let id = record_id(record).ok_or_else(|| Error::InvalidInput("resource id is required".to_string()))?;

    let mut resource = Resource::new(id);
    let mut distributions = Vec::new();

    for (key, value) in object {
        if key == "id" {
            continue;
        }
        if key == REFERENCES_FIELD {
            distributions = parse_references(value, config)?;
            continue;
        }
        if schema.validate_field_name(key).is_err() {
            debug!(id = %resource.id, field = %key, "ignoring malformed field name");
            continue;
        }

        if schema.is_scalar(key) {
            let text = match value {
                Value::Array(items) => items.iter().find_map(cell_text),
                other => cell_text(other),
            };
            if let Some(text) = text {
                resource.set_scalar(key.as_str(), text);
            }
        } else {
            let values: Vec<String> = match value {
                Value::Array(items) => items.iter().filter_map(cell_text).collect(),
                other => cell_text(other).into_iter().collect(),
            };
            if !values.is_empty() {
                resource.set_values(key.as_str(), values);
            }
        }
    }

    Ok((resource, distributions))
}

/// Upsert each record in order. One record's failure does not stop the batch.
pub fn import_records(
    conn: &mut Connection,
    schema: &ResourceSchema,
    config: &CatalogConfig,
    records: &[Value],
) -> ImportReport {
    let mut report = ImportReport::default();

    for (index, record) in records.iter().enumerate() {
        if record_id(record).is_none() {
            warn!(index, "skipping record without id");
            report.skipped += 1;
            continue;
        }

        let outcome = resource_from_record(record, schema, config)
            .and_then(|(resource, distributions)| upsert_resource(conn, schema, &resource, &distributions));
        match outcome {
            Ok(()) => report.processed += 1,
            Err(e) => {
                warn!(index, error = %e, "record import failed");
                report.failed += 1;
            }
        }
    }

    info!(
        processed = report.processed,
        skipped = report.skipped,
        failed = report.failed,
        "bulk import finished"
    );
    report
}

/// Canonical name for a tabular column.
///
/// Aliases are tried exactly, then case-insensitively, then the column is
/// matched against the schema's field names case-insensitively. Anything else
/// is returned trimmed and unchanged.
pub fn resolve_column(column: &str, aliases: &HashMap<String, String>, schema: &ResourceSchema) -> String {
    let column = column.trim();
    if let Some(field) = aliases.get(column) {
        return field.clone();
    }
    if let Some((_, field)) = aliases.iter().find(|(alias, _)| alias.eq_ignore_ascii_case(column)) {
        return field.clone();
    }
    schema
        .canonical_name(column)
        .map(str::to_string)
        .unwrap_or_else(|| column.to_string())
}

/// Classify a tabular input from its resolved column names
///
/// ID and title columns make a resources table. ID, Type and URL columns
/// without a title make a distributions table.
pub fn classify_columns<S: AsRef<str>>(columns: &[S]) -> TableKind {
    let names: HashSet<String> = columns
        .iter()
        .map(|c| c.as_ref().trim().to_ascii_lowercase())
        .collect();

    let has_id = names.contains("id");
    let has_title = names.contains("dct_title_s") || names.contains("title");

    if has_id && has_title {
        TableKind::Resources
    } else if has_id && names.contains("type") && names.contains("url") {
        TableKind::Distributions
    } else {
        TableKind::Unrecognized
    }
}

/// Split a pipe-delimited cell. Values come back trimmed, deduplicated and sorted.
pub fn split_repeatable(cell: &str) -> Vec<String> {
    cell.split('|')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// Import tabular rows, routing on the detected table kind
pub fn import_rows(
    conn: &mut Connection,
    schema: &ResourceSchema,
    config: &CatalogConfig,
    rows: &[TabularRow],
    aliases: &HashMap<String, String>,
) -> Result<TabularImportSummary> {
    let resolved: HashMap<&str, String> = rows
        .iter()
        .flat_map(|row| row.keys())
        .map(|c| (c.as_str(), resolve_column(c, aliases, schema)))
        .collect();
    let columns: Vec<&String> = resolved.values().collect();

    let kind = classify_columns(&columns);
    let added_count = match kind {
        TableKind::Resources => import_resource_rows(conn, schema, config, rows, &resolved)?,
        TableKind::Distributions => import_distribution_rows(conn, config, rows, &resolved)?,
        TableKind::Unrecognized => {
            return Err(Error::InvalidInput(
                "tabular input is neither a resources nor a distributions table".to_string(),
            ))
        }
    };

    info!(kind = ?kind, added = added_count, rows = rows.len(), "tabular import finished");
    Ok(TabularImportSummary { kind, added_count })
}

/// Cells of a row keyed by resolved, lowercased column name
fn resolved_cells<'r>(row: &'r TabularRow, resolved: &HashMap<&str, String>) -> Vec<(String, &'r str)> {
    row.iter()
        .map(|(column, cell)| {
            let name = resolved
                .get(column.as_str())
                .cloned()
                .unwrap_or_else(|| column.trim().to_string());
            (name, cell.as_str())
        })
        .collect()
}

fn cell<'r>(cells: &[(String, &'r str)], name: &str) -> Option<&'r str> {
    cells
        .iter()
        .find(|(column, _)| column.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.trim())
        .filter(|value| !value.is_empty())
}

fn import_resource_rows(
    conn: &mut Connection,
    schema: &ResourceSchema,
    config: &CatalogConfig,
    rows: &[TabularRow],
    resolved: &HashMap<&str, String>,
) -> Result<usize> {
    let mut added = 0;

    for (index, row) in rows.iter().enumerate() {
        let cells = resolved_cells(row, resolved);
        let Some(id) = cell(&cells, "id") else {
            warn!(index, "skipping tabular row without id");
            continue;
        };

        let mut resource = Resource::new(id);
        let mut distributions = Vec::new();
        for (column, value) in &cells {
            let value = value.trim();
            if value.is_empty() || column.eq_ignore_ascii_case("id") {
                continue;
            }
            if column == REFERENCES_FIELD {
                match parse_references(&Value::String(value.to_string()), config) {
                    Ok(parsed) => distributions = parsed,
                    Err(e) => warn!(id, error = %e, "ignoring malformed references cell"),
                }
                continue;
            }
            if schema.validate_field_name(column).is_err() {
                debug!(id, column = %column, "ignoring unmapped column");
                continue;
            }
            if schema.is_scalar(column) {
                resource.set_scalar(column.as_str(), value);
            } else {
                let values = split_repeatable(value);
                if !values.is_empty() {
                    resource.set_values(column.as_str(), values);
                }
            }
        }

        let outcome = schema.validate_resource(&resource).and_then(|()| {
            let tx = conn.transaction()?;
            replace_resource(&tx, schema, &resource, &distributions, ReplaceMode::MetadataRefresh)?;
            tx.commit()?;
            Ok(())
        });
        match outcome {
            Ok(()) => added += 1,
            Err(e) => warn!(id, error = %e, "tabular row import failed"),
        }
    }

    Ok(added)
}

fn import_distribution_rows(
    conn: &mut Connection,
    config: &CatalogConfig,
    rows: &[TabularRow],
    resolved: &HashMap<&str, String>,
) -> Result<usize> {
    let mut added = 0;

    for (index, row) in rows.iter().enumerate() {
        let cells = resolved_cells(row, resolved);
        let (Some(id), Some(kind), Some(url)) = (cell(&cells, "id"), cell(&cells, "type"), cell(&cells, "url")) else {
            warn!(index, "skipping distribution row without id, type or url");
            continue;
        };

        let mut dist = Distribution::new(config.relation_key_for(kind), url);
        if let Some(label) = cell(&cells, "label") {
            dist = dist.with_label(label);
        }
        let outcome = conn.transaction().map_err(Error::from).and_then(|tx| {
            let inserted = append_distributions(&tx, id, &[dist])?;
            tx.commit()?;
            Ok(inserted)
        });
        match outcome {
            Ok(inserted) => added += inserted,
            Err(e) => warn!(index, id, error = %e, "distribution row import failed"),
        }
    }

    Ok(added)
}

/// Interchange form of a stored resource
///
/// Scalars are strings, repeatables are arrays, and distributions are folded
/// back into `dct_references_s` text.
pub fn record_from_resource(resource: &Resource, config: &CatalogConfig) -> Result<Value> {
    let mut record = Map::new();
    record.insert("id".to_string(), Value::String(resource.id.clone()));
    for (field, value) in &resource.scalars {
        record.insert(field.clone(), Value::String(value.clone()));
    }
    for (field, values) in &resource.repeatables {
        record.insert(
            field.clone(),
            Value::Array(values.iter().cloned().map(Value::String).collect()),
        );
    }
    if let Some(text) = references_text(&resource.distributions, config)? {
        record.insert(REFERENCES_FIELD.to_string(), Value::String(text));
    }
    Ok(Value::Object(record))
}

/// Every resource ID in ascending order
pub fn all_ids(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT id FROM resources ORDER BY id")?;
    let rows = stmt.query_map([], |row| row.get(0))?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StorageEngine;
    use serde_json::json;
    use std::sync::Arc;

    fn engine() -> StorageEngine {
        StorageEngine::open_in_memory(Arc::new(ResourceSchema::aardvark())).unwrap()
    }

    fn row(cells: &[(&str, &str)]) -> TabularRow {
        cells
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_classify_columns() {
        assert_eq!(classify_columns(&["id", "dct_title_s"]), TableKind::Resources);
        assert_eq!(classify_columns(&["ID", "Type", "URL", "Label"]), TableKind::Distributions);
        assert_eq!(
            classify_columns(&["id", "type", "url", "dct_title_s"]),
            TableKind::Resources
        );
        assert_eq!(classify_columns(&["id", "url"]), TableKind::Unrecognized);
        assert_eq!(classify_columns::<&str>(&[]), TableKind::Unrecognized);
    }

    #[test]
    fn test_resolve_column_through_aliases() {
        let config = CatalogConfig::default();
        let schema = ResourceSchema::aardvark();

        assert_eq!(resolve_column("Title", &config.column_aliases, &schema), "dct_title_s");
        assert_eq!(resolve_column("subject", &config.column_aliases, &schema), "dct_subject_sm");
        assert_eq!(resolve_column("DCT_SUBJECT_SM", &config.column_aliases, &schema), "dct_subject_sm");
        assert_eq!(resolve_column("Extra", &config.column_aliases, &schema), "Extra");
    }

    #[test]
    fn test_split_repeatable() {
        assert_eq!(
            split_repeatable(" Roads | History||Roads |  "),
            vec!["History".to_string(), "Roads".to_string()]
        );
        assert!(split_repeatable(" | ").is_empty());
    }

    #[test]
    fn test_resource_from_record() {
        let config = CatalogConfig::default();
        let schema = ResourceSchema::aardvark();
        let record = json!({
            "id": 42,
            "dct_title_s": ["Roads"],
            "dct_subject_sm": ["Transportation", ""],
            "gbl_indexYear_im": [1990, 1991],
            "custom_field": "x",
            "bad field": "ignored",
            "dct_references_s": "{\"http://schema.org/url\": \"https://example.org\"}"
        });

        let (resource, dists) = resource_from_record(&record, &schema, &config).unwrap();
        assert_eq!(resource.id, "42");
        assert_eq!(resource.title(), Some("Roads"));
        assert_eq!(resource.values("dct_subject_sm"), ["Transportation"]);
        assert_eq!(resource.values("gbl_indexYear_im"), ["1990", "1991"]);
        assert_eq!(resource.values("custom_field"), ["x"]);
        assert!(!resource.repeatables.contains_key("bad field"));
        assert_eq!(dists, vec![Distribution::new("url", "https://example.org")]);
    }

    #[test]
    fn test_import_records_counts() {
        let engine = engine();
        let schema = ResourceSchema::aardvark();
        let config = CatalogConfig::default();
        let records = vec![
            json!({"id": "a", "dct_title_s": "A"}),
            json!({"dct_title_s": "no id"}),
            json!({"id": "b", "dct_references_s": "{broken"}),
            json!({"id": "c", "dct_title_s": "C"}),
        ];

        let report = engine
            .run_blocking(|conn| Ok(import_records(conn, &schema, &config, &records)))
            .unwrap();
        assert_eq!(
            report,
            ImportReport {
                processed: 2,
                skipped: 1,
                failed: 1
            }
        );
    }

    #[test]
    fn test_tabular_distributions_are_additive() {
        let engine = engine();
        let schema = ResourceSchema::aardvark();
        let config = CatalogConfig::default();
        let rows = vec![
            row(&[("ID", "a"), ("Type", "download"), ("URL", "https://example.org/a.zip")]),
            row(&[("ID", "a"), ("Type", "http://schema.org/url"), ("URL", "https://example.org/a")]),
            row(&[("ID", "a"), ("Type", "download"), ("URL", "https://example.org/a.zip")]),
        ];

        let summary = engine
            .run_blocking(|conn| import_rows(conn, &schema, &config, &rows, &config.column_aliases))
            .unwrap();
        assert_eq!(summary.kind, TableKind::Distributions);
        assert_eq!(summary.added_count, 2);

        let (keys, scalars): (Vec<String>, i64) = engine
            .run_blocking(|conn| {
                let mut stmt = conn.prepare("SELECT relation_key FROM distributions ORDER BY position")?;
                let keys = stmt
                    .query_map([], |r| r.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                let scalars = conn.query_row("SELECT COUNT(*) FROM resources", [], |r| r.get(0))?;
                Ok((keys, scalars))
            })
            .unwrap();
        assert_eq!(keys, vec!["download", "url"]);
        assert_eq!(scalars, 0);
    }

    #[test]
    fn test_tabular_distribution_failure_is_per_row() {
        let engine = engine();
        let schema = ResourceSchema::aardvark();
        let config = CatalogConfig::default();
        engine
            .run_blocking(|conn| {
                conn.execute_batch(
                    "CREATE TRIGGER reject_locked BEFORE INSERT ON distributions
                     WHEN NEW.resource_id = 'locked'
                     BEGIN SELECT RAISE(ABORT, 'locked resource'); END;",
                )?;
                Ok(())
            })
            .unwrap();

        let rows = vec![
            row(&[("ID", "a"), ("Type", "download"), ("URL", "https://example.org/a.zip")]),
            row(&[("ID", "locked"), ("Type", "download"), ("URL", "https://example.org/l.zip")]),
            row(&[("ID", "b"), ("Type", "url"), ("URL", "https://example.org/b")]),
        ];
        let summary = engine
            .run_blocking(|conn| import_rows(conn, &schema, &config, &rows, &config.column_aliases))
            .unwrap();
        assert_eq!(summary.added_count, 2);

        let ids: Vec<String> = engine
            .run_blocking(|conn| {
                let mut stmt = conn.prepare("SELECT resource_id FROM distributions ORDER BY resource_id")?;
                let ids = stmt
                    .query_map([], |r| r.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                Ok(ids)
            })
            .unwrap();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_tabular_resources_keep_distributions() {
        let engine = engine();
        let schema = ResourceSchema::aardvark();
        let config = CatalogConfig::default();
        engine
            .run_blocking(|conn| {
                upsert_resource(
                    conn,
                    &schema,
                    &Resource::new("a").with_values("dct_subject_sm", ["Old"]),
                    &[Distribution::new("url", "https://example.org/a")],
                )
            })
            .unwrap();

        let rows = vec![
            row(&[("ID", "a"), ("Title", "Alpha"), ("Subject", "Roads|History| Roads")]),
            row(&[("ID", ""), ("Title", "orphan")]),
            row(&[
                ("ID", "b"),
                ("Title", "Bravo"),
                ("References", "not json"),
            ]),
        ];
        let summary = engine
            .run_blocking(|conn| import_rows(conn, &schema, &config, &rows, &config.column_aliases))
            .unwrap();
        assert_eq!(summary.kind, TableKind::Resources);
        assert_eq!(summary.added_count, 2);

        let (subjects, dists): (Vec<String>, i64) = engine
            .run_blocking(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT value FROM resources_mv WHERE id = 'a' AND field = 'dct_subject_sm' ORDER BY rowid",
                )?;
                let subjects = stmt
                    .query_map([], |r| r.get(0))?
                    .collect::<rusqlite::Result<Vec<String>>>()?;
                let dists = conn.query_row("SELECT COUNT(*) FROM distributions WHERE resource_id = 'a'", [], |r| {
                    r.get(0)
                })?;
                Ok((subjects, dists))
            })
            .unwrap();
        assert_eq!(subjects, vec!["History", "Roads"]);
        assert_eq!(dists, 1);
    }

    #[test]
    fn test_tabular_unrecognized_is_rejected() {
        let engine = engine();
        let schema = ResourceSchema::aardvark();
        let config = CatalogConfig::default();
        let rows = vec![row(&[("Name", "x")])];

        let err = engine
            .run_blocking(|conn| import_rows(conn, &schema, &config, &rows, &config.column_aliases))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_record_from_resource() {
        let config = CatalogConfig::default();
        let mut resource = Resource::new("a")
            .with_scalar("dct_title_s", "Alpha")
            .with_values("dct_subject_sm", ["Roads"]);
        resource.distributions = vec![Distribution::new("download", "https://example.org/a.zip")];

        let record = record_from_resource(&resource, &config).unwrap();
        assert_eq!(record["dct_title_s"], json!("Alpha"));
        assert_eq!(record["dct_subject_sm"], json!(["Roads"]));
        assert_eq!(
            record["dct_references_s"],
            json!("{\"http://schema.org/downloadUrl\":\"https://example.org/a.zip\"}")
        );
    }
}
