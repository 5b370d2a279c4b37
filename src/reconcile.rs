//! Resource reconciler
//!
//! Every write of a resource is a replace: the scalar row, attribute rows,
//! distributions and search content for the ID are removed before the new
//! values go in. The whole protocol runs inside one SQLite transaction, so a
//! failing step rolls everything back instead of leaving a resource with new
//! scalar data and stale attribute rows.

use crate::error::{Error, Result};
use crate::geometry::Envelope;
use crate::schema::ResourceSchema;
use crate::storage::GEOMETRY_COLUMNS;
use crate::types::{Distribution, Resource};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Which row sets a write replaces
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaceMode {
    /// Scalar, attribute, distribution and search rows
    Full,
    /// Scalar, attribute and search rows; existing distributions stay
    MetadataRefresh,
}

/// Replace all stored state for one resource
pub fn upsert_resource(
    conn: &mut Connection,
    schema: &ResourceSchema,
    resource: &Resource,
    distributions: &[Distribution],
) -> Result<()> {
    schema.validate_resource(resource)?;

    let tx = conn.transaction()?;
    replace_resource(&tx, schema, resource, distributions, ReplaceMode::Full)?;
    tx.commit().map_err(|e| partial(&resource.id, "commit", e))?;

    debug!(id = %resource.id, distributions = distributions.len(), "resource replaced");
    Ok(())
}

/// Apply the replace protocol inside an open transaction.
///
/// With [`ReplaceMode::MetadataRefresh`] the given distributions are appended
/// to whatever the resource already has.
pub fn replace_resource(
    tx: &Connection,
    schema: &ResourceSchema,
    resource: &Resource,
    distributions: &[Distribution],
    mode: ReplaceMode,
) -> Result<()> {
    let id = resource.id.as_str();

    step(id, "delete scalar row", tx.execute("DELETE FROM resources WHERE id = ?1", [id]))?;
    step(id, "delete attribute rows", tx.execute("DELETE FROM resources_mv WHERE id = ?1", [id]))?;
    if mode == ReplaceMode::Full {
        step(
            id,
            "delete distributions",
            tx.execute("DELETE FROM distributions WHERE resource_id = ?1", [id]),
        )?;
    }
    step(id, "delete search content", tx.execute("DELETE FROM resources_search WHERE id = ?1", [id]))?;

    insert_scalar_row(tx, resource)?;
    insert_attribute_rows(tx, resource)?;
    append_distributions(tx, id, distributions)?;

    let content = schema.search_content(resource);
    step(
        id,
        "insert search content",
        tx.execute(
            "INSERT INTO resources_search (id, content) VALUES (?1, ?2)",
            params![id, content],
        ),
    )?;

    Ok(())
}

fn insert_scalar_row(tx: &Connection, resource: &Resource) -> Result<()> {
    let geometry = resource.bbox_text().and_then(|text| {
        let parsed = Envelope::parse(text);
        if parsed.is_none() {
            warn!(id = %resource.id, bbox = %text, "malformed bbox, storing without geometry");
        }
        parsed
    });

    let mut columns = vec!["id".to_string()];
    let mut values: Vec<Value> = vec![Value::Text(resource.id.clone())];
    for (field, value) in &resource.scalars {
        columns.push(format!("\"{}\"", field));
        values.push(Value::Text(value.clone()));
    }
    let coords = geometry.map(|g| [g.min_x, g.min_y, g.max_x, g.max_y]);
    for (idx, column) in GEOMETRY_COLUMNS.iter().enumerate() {
        columns.push(column.to_string());
        values.push(coords.map(|c| Value::Real(c[idx])).unwrap_or(Value::Null));
    }

    let placeholders = (1..=values.len())
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "INSERT INTO resources ({}) VALUES ({})",
        columns.join(", "),
        placeholders
    );
    step(&resource.id, "insert scalar row", tx.execute(&sql, params_from_iter(values)))?;
    Ok(())
}

fn insert_attribute_rows(tx: &Connection, resource: &Resource) -> Result<()> {
    let mut stmt = step(
        &resource.id,
        "prepare attribute insert",
        tx.prepare("INSERT INTO resources_mv (id, field, value) VALUES (?1, ?2, ?3)"),
    )?;
    for (field, values) in &resource.repeatables {
        let mut seen = HashSet::new();
        for value in values {
            if value.trim().is_empty() || !seen.insert(value.as_str()) {
                continue;
            }
            step(
                &resource.id,
                "insert attribute row",
                stmt.execute(params![resource.id, field, value]),
            )?;
        }
    }
    Ok(())
}

/// Append distributions after the resource's existing ones.
///
/// Rows already present with the same relation key, URL and label are
/// ignored and logged. Returns the number of rows inserted.
pub fn append_distributions(tx: &Connection, id: &str, distributions: &[Distribution]) -> Result<usize> {
    if distributions.is_empty() {
        return Ok(0);
    }

    let next: i64 = step(
        id,
        "read distribution position",
        tx.query_row(
            "SELECT COALESCE(MAX(position) + 1, 0) FROM distributions WHERE resource_id = ?1",
            [id],
            |row| row.get(0),
        ),
    )?;

    let mut stmt = step(
        id,
        "prepare distribution insert",
        tx.prepare(
            "INSERT OR IGNORE INTO distributions (resource_id, relation_key, url, label, position)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        ),
    )?;
    let mut inserted = 0;
    for (offset, dist) in distributions.iter().enumerate() {
        let changed = step(
            id,
            "insert distribution",
            stmt.execute(params![
                id,
                dist.relation_key,
                dist.url,
                dist.label,
                next + offset as i64
            ]),
        )?;
        if changed == 0 {
            warn!(
                id,
                relation = %dist.relation_key,
                url = %dist.url,
                "duplicate distribution ignored"
            );
        }
        inserted += changed;
    }
    Ok(inserted)
}

/// Remove a resource and everything derived from it.
///
/// Returns whether a scalar row existed.
pub fn delete_resource(conn: &mut Connection, id: &str) -> Result<bool> {
    if id.trim().is_empty() {
        return Err(Error::InvalidInput("resource id is required".to_string()));
    }

    let tx = conn.transaction()?;
    let removed = step(id, "delete scalar row", tx.execute("DELETE FROM resources WHERE id = ?1", [id]))?;
    for (what, sql) in [
        ("delete attribute rows", "DELETE FROM resources_mv WHERE id = ?1"),
        ("delete distributions", "DELETE FROM distributions WHERE resource_id = ?1"),
        ("delete search content", "DELETE FROM resources_search WHERE id = ?1"),
        ("delete thumbnail", "DELETE FROM resources_image_service WHERE id = ?1"),
        ("delete static map", "DELETE FROM static_maps WHERE id = ?1"),
    ] {
        step(id, what, tx.execute(sql, [id]))?;
    }
    tx.commit().map_err(|e| partial(id, "commit", e))?;
    Ok(removed > 0)
}

pub fn cache_thumbnail(conn: &Connection, id: &str, url: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO resources_image_service (id, thumbnail_url, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET thumbnail_url = excluded.thumbnail_url, updated_at = excluded.updated_at",
        params![id, url, chrono::Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

pub fn cache_static_map(conn: &Connection, id: &str, url: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO static_maps (id, image_url, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(id) DO UPDATE SET image_url = excluded.image_url, updated_at = excluded.updated_at",
        params![id, url, chrono::Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

fn step<T>(id: &str, step: &'static str, result: rusqlite::Result<T>) -> Result<T> {
    result.map_err(|e| partial(id, step, e))
}

fn partial(id: &str, step: &'static str, source: rusqlite::Error) -> Error {
    Error::ReconciliationPartialFailure {
        id: id.to_string(),
        step,
        source,
    }
}
