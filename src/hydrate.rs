//! Resource hydration
//!
//! Loads full resources for a list of IDs. The scalar row (with geometry and
//! cached thumbnail), attribute rows and distributions are read concurrently
//! and merged; output follows the input order and unknown IDs are dropped.

use crate::error::Result;
use crate::geometry::Envelope;
use crate::storage::{try_num, StorageEngine, GEOMETRY_COLUMNS};
use crate::types::{Distribution, Resource};
use rusqlite::types::{Value, ValueRef};
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use std::collections::HashMap;
use tracing::debug;

/// IDs bound per statement
const CHUNK_SIZE: usize = 500;

pub async fn hydrate(engine: &StorageEngine, ids: Vec<String>) -> Result<Vec<Resource>> {
    let mut by_id: HashMap<String, Resource> = HashMap::with_capacity(ids.len());

    for chunk in ids.chunks(CHUNK_SIZE) {
        let scalar_ids = chunk.to_vec();
        let attribute_ids = chunk.to_vec();
        let distribution_ids = chunk.to_vec();

        let (rows, attributes, distributions) = tokio::try_join!(
            engine.run(move |conn| read_scalar_rows(conn, &scalar_ids)),
            engine.run(move |conn| read_attributes(conn, &attribute_ids)),
            engine.run(move |conn| read_distributions(conn, &distribution_ids)),
        )?;

        for resource in rows {
            by_id.insert(resource.id.clone(), resource);
        }
        for (id, field, value) in attributes {
            if let Some(resource) = by_id.get_mut(&id) {
                resource.repeatables.entry(field).or_default().push(value);
            }
        }
        for (id, dist) in distributions {
            if let Some(resource) = by_id.get_mut(&id) {
                resource.distributions.push(dist);
            }
        }
    }

    let requested = ids.len();
    let resources: Vec<Resource> = ids.iter().filter_map(|id| by_id.remove(id)).collect();
    debug!(requested, found = resources.len(), "hydrated resources");
    Ok(resources)
}

/// Cached static map image URL for a resource
pub async fn static_map(engine: &StorageEngine, id: &str) -> Result<Option<String>> {
    let id = id.to_string();
    engine
        .run(move |conn| {
            let url = conn
                .query_row("SELECT image_url FROM static_maps WHERE id = ?1", [&id], |row| {
                    row.get::<_, Option<String>>(0)
                })
                .optional()?;
            Ok(url.flatten())
        })
        .await
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn id_params(ids: &[String]) -> Vec<Value> {
    ids.iter().map(|id| Value::Text(id.clone())).collect()
}

fn text_of(value: ValueRef<'_>) -> Option<String> {
    match value {
        ValueRef::Null | ValueRef::Blob(_) => None,
        ValueRef::Integer(i) => Some(i.to_string()),
        ValueRef::Real(f) => Some(f.to_string()),
        ValueRef::Text(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
    }
}

fn read_scalar_rows(conn: &Connection, ids: &[String]) -> Result<Vec<Resource>> {
    let sql = format!(
        "SELECT r.*, t.thumbnail_url AS __thumbnail FROM resources r \
         LEFT JOIN resources_image_service t ON t.id = r.id WHERE r.id IN ({})",
        placeholders(ids.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();

    let mut rows = stmt.query(params_from_iter(id_params(ids)))?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut resource = Resource::default();
        let mut coords = [None; 4];
        for (idx, column) in columns.iter().enumerate() {
            let value = row.get_ref(idx)?;
            if let Some(slot) = GEOMETRY_COLUMNS.iter().position(|g| g == column) {
                coords[slot] = try_num(value);
                continue;
            }
            let Some(text) = text_of(value) else { continue };
            match column.as_str() {
                "id" => resource.id = text,
                "__thumbnail" => resource.thumbnail = Some(text),
                _ => {
                    resource.scalars.insert(column.clone(), text);
                }
            }
        }
        if let [Some(min_x), Some(min_y), Some(max_x), Some(max_y)] = coords {
            resource.geometry = Some(Envelope::new(min_x, min_y, max_x, max_y));
        }
        out.push(resource);
    }
    Ok(out)
}

fn read_attributes(conn: &Connection, ids: &[String]) -> Result<Vec<(String, String, String)>> {
    let sql = format!(
        "SELECT id, field, value FROM resources_mv WHERE id IN ({}) ORDER BY id, field, rowid",
        placeholders(ids.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(id_params(ids)), |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
    })?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

fn read_distributions(conn: &Connection, ids: &[String]) -> Result<Vec<(String, Distribution)>> {
    let sql = format!(
        "SELECT resource_id, relation_key, url, label FROM distributions \
         WHERE resource_id IN ({}) ORDER BY resource_id, position, rowid",
        placeholders(ids.len())
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(id_params(ids)), |row| {
        Ok((
            row.get::<_, String>(0)?,
            Distribution {
                relation_key: row.get(1)?,
                url: row.get(2)?,
                label: row.get(3)?,
            },
        ))
    })?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}
