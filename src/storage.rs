//! Embedded storage engine backed by SQLite
//!
//! Owns the single connection, creates and migrates the relational layout,
//! and backfills derived geometry. Table layout:
//!
//! - `resources`: one row per resource, one column per scalar field, plus the
//!   cached envelope (`geom_minx`, `geom_miny`, `geom_maxx`, `geom_maxy`)
//! - `resources_mv`: `(id, field, value)` rows for repeatable fields
//! - `distributions`: `(resource_id, relation_key, url, label, position)`
//! - `resources_search`: one lowercased text blob per resource
//! - `resources_image_service`: thumbnail cache
//! - `static_maps`: static map image cache

use crate::config::CatalogConfig;
use crate::error::Result;
use crate::geometry::{iou_from_parts, Envelope};
use crate::schema::ResourceSchema;
use parking_lot::Mutex;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub const RESOURCES_TABLE: &str = "resources";
pub const ATTRIBUTES_TABLE: &str = "resources_mv";
pub const DISTRIBUTIONS_TABLE: &str = "distributions";
pub const SEARCH_TABLE: &str = "resources_search";
pub const THUMBNAIL_TABLE: &str = "resources_image_service";
pub const STATIC_MAP_TABLE: &str = "static_maps";

/// Envelope cache columns on the scalar table
pub const GEOMETRY_COLUMNS: [&str; 4] = ["geom_minx", "geom_miny", "geom_maxx", "geom_maxy"];

const BASE_DDL: &str = r#"
    CREATE TABLE IF NOT EXISTS resources_mv (
        id TEXT NOT NULL,
        field TEXT NOT NULL,
        value TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_resources_mv_field_value ON resources_mv(field, value);
    CREATE INDEX IF NOT EXISTS idx_resources_mv_id ON resources_mv(id);

    CREATE TABLE IF NOT EXISTS distributions (
        resource_id TEXT NOT NULL,
        relation_key TEXT NOT NULL,
        url TEXT NOT NULL,
        label TEXT,
        position INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_distributions_resource ON distributions(resource_id);

    CREATE TABLE IF NOT EXISTS resources_search (
        id TEXT PRIMARY KEY,
        content TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS resources_image_service (
        id TEXT PRIMARY KEY,
        thumbnail_url TEXT
    );

    CREATE TABLE IF NOT EXISTS static_maps (
        id TEXT PRIMARY KEY,
        image_url TEXT
    );
"#;

/// Indexes over columns that older layouts may lack or hold duplicates in
const DERIVED_INDEXES: [(&str, &str); 2] = [
    (
        "idx_resources_geom",
        "CREATE INDEX IF NOT EXISTS idx_resources_geom ON resources(geom_minx, geom_maxx, geom_miny, geom_maxy);",
    ),
    (
        "idx_distributions_labeled",
        "DROP INDEX IF EXISTS idx_distributions_unique;
         CREATE UNIQUE INDEX IF NOT EXISTS idx_distributions_labeled
             ON distributions(resource_id, relation_key, url, IFNULL(label, ''));",
    ),
];

/// Storage engine over one SQLite connection
///
/// Cloning shares the connection.
#[derive(Clone)]
pub struct StorageEngine {
    conn: Arc<Mutex<Connection>>,
    schema: Arc<ResourceSchema>,
}

impl StorageEngine {
    /// Open the database named by the config, or an in-memory one
    pub fn open(config: &CatalogConfig, schema: Arc<ResourceSchema>) -> Result<Self> {
        let conn = match &config.database_path {
            Some(path) => {
                info!(path = %path.display(), "opening catalog database");
                Connection::open(path)?
            }
            None => {
                debug!("opening in-memory catalog database");
                Connection::open_in_memory()?
            }
        };
        Self::from_connection(conn, schema)
    }

    pub fn open_in_memory(schema: Arc<ResourceSchema>) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, schema)
    }

    /// Register SQL functions and bring the layout up to date
    pub fn from_connection(conn: Connection, schema: Arc<ResourceSchema>) -> Result<Self> {
        register_functions(&conn)?;
        initialize(&conn, &schema)?;
        Ok(StorageEngine {
            conn: Arc::new(Mutex::new(conn)),
            schema,
        })
    }

    pub fn schema(&self) -> &Arc<ResourceSchema> {
        &self.schema
    }

    /// Run a closure against the connection on the blocking pool
    pub async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await?
    }

    /// Run a closure against the connection on the current thread
    pub fn run_blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut guard = self.conn.lock();
        f(&mut guard)
    }
}

/// Create missing tables, apply additive migrations, backfill geometry.
///
/// Only failure to create the base tables is fatal; every later step logs
/// and moves on.
pub fn initialize(conn: &Connection, schema: &ResourceSchema) -> Result<()> {
    conn.execute_batch(&resources_ddl(schema))?;
    conn.execute_batch(BASE_DDL)?;

    for (table, column, decl) in migration_steps(schema) {
        match add_column_if_missing(conn, table, &column, decl) {
            Ok(true) => info!(table, column = %column, "added missing column"),
            Ok(false) => {}
            Err(e) => warn!(table, column = %column, error = %e, "migration step failed, continuing"),
        }
    }

    for (name, ddl) in DERIVED_INDEXES {
        if let Err(e) = conn.execute_batch(ddl) {
            warn!(index = name, error = %e, "index creation failed, continuing");
        }
    }

    match backfill_geometry(conn) {
        Ok(0) => {}
        Ok(n) => info!(rows = n, "backfilled resource geometry"),
        Err(e) => warn!(error = %e, "geometry backfill failed, continuing"),
    }

    Ok(())
}

fn resources_ddl(schema: &ResourceSchema) -> String {
    let mut columns = vec!["id TEXT PRIMARY KEY".to_string()];
    columns.extend(schema.scalar_columns().map(|c| format!("\"{}\" TEXT", c)));
    columns.extend(GEOMETRY_COLUMNS.iter().map(|c| format!("{} REAL", c)));
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    {}\n);",
        RESOURCES_TABLE,
        columns.join(",\n    ")
    )
}

/// Every column the current layout expects on tables that may predate it
fn migration_steps(schema: &ResourceSchema) -> Vec<(&'static str, String, &'static str)> {
    let mut steps: Vec<(&'static str, String, &'static str)> = schema
        .scalar_columns()
        .map(|c| (RESOURCES_TABLE, c.to_string(), "TEXT"))
        .collect();
    steps.extend(
        GEOMETRY_COLUMNS
            .iter()
            .map(|c| (RESOURCES_TABLE, c.to_string(), "REAL")),
    );
    steps.push((DISTRIBUTIONS_TABLE, "label".to_string(), "TEXT"));
    steps.push((DISTRIBUTIONS_TABLE, "position".to_string(), "INTEGER NOT NULL DEFAULT 0"));
    steps.push((THUMBNAIL_TABLE, "updated_at".to_string(), "TEXT"));
    steps.push((STATIC_MAP_TABLE, "updated_at".to_string(), "TEXT"));
    steps
}

fn table_columns(conn: &Connection, table: &str) -> rusqlite::Result<HashSet<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    rows.map(|r| r.map(|name| name.to_lowercase())).collect()
}

/// Returns whether the column was added
pub fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column: &str,
    decl: &str,
) -> rusqlite::Result<bool> {
    if table_columns(conn, table)?.contains(&column.to_lowercase()) {
        return Ok(false);
    }
    conn.execute_batch(&format!(
        "ALTER TABLE {} ADD COLUMN \"{}\" {}",
        table, column, decl
    ))?;
    Ok(true)
}

/// Rows awaiting geometry: `(parseable, malformed)`
///
/// Both counts cover rows with `ENVELOPE(`-prefixed bbox text and NULL
/// envelope columns.
pub fn pending_backfill(conn: &Connection) -> Result<(i64, i64)> {
    Ok(conn.query_row(
        "SELECT COALESCE(SUM(is_envelope(dcat_bbox)), 0), COALESCE(SUM(NOT is_envelope(dcat_bbox)), 0)
         FROM resources WHERE geom_minx IS NULL AND dcat_bbox LIKE 'ENVELOPE(%'",
        [],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?)
}

/// Fill the envelope columns for rows that have bbox text but no geometry.
///
/// Only rows whose bbox text parses are candidates, so once they are filled
/// a repeat run stops at the count. Rows with malformed bbox text stay NULL;
/// they were warned about when written and only show up here as a count.
pub fn backfill_geometry(conn: &Connection) -> Result<usize> {
    let (pending, malformed) = pending_backfill(conn)?;
    if malformed > 0 {
        debug!(rows = malformed, "resources with malformed bbox text have no geometry");
    }
    if pending == 0 {
        return Ok(0);
    }

    let candidates: Vec<(String, String)> = {
        let mut stmt = conn.prepare(
            "SELECT id, dcat_bbox FROM resources
             WHERE geom_minx IS NULL AND dcat_bbox LIKE 'ENVELOPE(%' AND is_envelope(dcat_bbox)",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<rusqlite::Result<_>>()?
    };

    let tx = conn.unchecked_transaction()?;
    let mut updated = 0;
    {
        let mut stmt = tx.prepare(
            "UPDATE resources SET geom_minx = ?1, geom_miny = ?2, geom_maxx = ?3, geom_maxy = ?4 WHERE id = ?5",
        )?;
        for (id, bbox) in candidates {
            match Envelope::parse(&bbox) {
                Some(env) => {
                    updated += stmt.execute(params![env.min_x, env.min_y, env.max_x, env.max_y, id])?;
                }
                None => warn!(id = %id, bbox = %bbox, "skipping malformed bbox during backfill"),
            }
        }
    }
    tx.commit()?;
    Ok(updated)
}

/// Best-effort numeric cast; anything that is not a finite number is NULL
pub fn try_num(value: ValueRef<'_>) -> Option<f64> {
    match value {
        ValueRef::Null | ValueRef::Blob(_) => None,
        ValueRef::Integer(i) => Some(i as f64),
        ValueRef::Real(f) => Some(f).filter(|f| f.is_finite()),
        ValueRef::Text(bytes) => std::str::from_utf8(bytes)
            .ok()?
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|f| f.is_finite()),
    }
}

fn register_functions(conn: &Connection) -> Result<()> {
    let flags = FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC;

    conn.create_scalar_function("try_num", 1, flags, |ctx| Ok(try_num(ctx.get_raw(0))))?;

    conn.create_scalar_function("is_envelope", 1, flags, |ctx| {
        let parsed = match ctx.get_raw(0) {
            ValueRef::Text(bytes) => std::str::from_utf8(bytes).ok().and_then(Envelope::parse),
            _ => None,
        };
        Ok(parsed.is_some())
    })?;

    conn.create_scalar_function("bbox_iou", 8, flags, |ctx| {
        let mut coords = [None; 8];
        for (idx, slot) in coords.iter_mut().enumerate() {
            *slot = try_num(ctx.get_raw(idx));
        }
        let [a, b, c, d, e, f, g, h] = coords;
        Ok(iou_from_parts([a, b, c, d], [e, f, g, h]))
    })?;

    Ok(())
}

impl std::fmt::Debug for StorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageEngine").finish_non_exhaustive()
    }
}
