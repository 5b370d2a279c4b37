//! Catalog facade
//!
//! The public entry point. Wraps the storage engine, search executor and
//! snapshot sink behind async operations.
//!
//! When the engine cannot be initialized the catalog still opens, in a
//! degraded state: reads return empty results and writes are logged and
//! ignored. `is_available()` reports which state the catalog is in.

use crate::config::CatalogConfig;
use crate::error::{Error, Result};
use crate::hydrate::{self, hydrate};
use crate::import::{
    all_ids, classify_columns, import_records, import_rows, record_from_resource, resolve_column,
    resource_from_record, ImportReport, TabularImportSummary, TabularRow,
};
use crate::query_executor::SearchExecutor;
use crate::query_request::{FacetValue, SearchRequest, SearchResponse};
use crate::reconcile::{self, upsert_resource};
use crate::schema::ResourceSchema;
use crate::snapshot::{export_snapshot, restore_connection, Snapshot, SnapshotSink};
use crate::storage::StorageEngine;
use crate::types::{Distribution, Resource};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Engine plus the executor bound to it
struct Backend {
    engine: StorageEngine,
    executor: SearchExecutor,
}

/// Faceted geospatial metadata catalog
pub struct Catalog {
    backend: Option<Backend>,
    config: Arc<CatalogConfig>,
    schema: Arc<ResourceSchema>,
    sink: Option<Arc<dyn SnapshotSink>>,
}

impl Catalog {
    /// Open the catalog described by the config.
    ///
    /// Engine failures are logged and yield a degraded catalog.
    pub fn open(config: CatalogConfig) -> Self {
        let schema = Arc::new(ResourceSchema::aardvark());
        let engine = match StorageEngine::open(&config, Arc::clone(&schema)) {
            Ok(engine) => Some(engine),
            Err(e) => {
                warn!(error = %e, "catalog engine failed to initialize, running degraded");
                None
            }
        };
        Self::assemble(engine, config, schema)
    }

    /// Open an in-memory catalog from snapshot bytes.
    ///
    /// An absent or empty buffer starts fresh. So does a buffer that is not a
    /// valid database, after logging.
    pub fn restore(bytes: Option<&[u8]>, config: CatalogConfig) -> Self {
        Self::restore_checked(bytes, None, config)
    }

    /// Restore a snapshot, verifying its checksum when the config asks for it
    pub fn restore_snapshot(snapshot: &Snapshot, config: CatalogConfig) -> Self {
        let checksum = config
            .verify_snapshots
            .then_some(snapshot.metadata.checksum.as_str());
        Self::restore_checked(Some(snapshot.bytes.as_slice()), checksum, config)
    }

    fn restore_checked(bytes: Option<&[u8]>, checksum: Option<&str>, mut config: CatalogConfig) -> Self {
        config.database_path = None;
        let schema = Arc::new(ResourceSchema::aardvark());

        let bytes = match bytes {
            Some(bytes) if !bytes.is_empty() => bytes,
            _ => {
                info!("no snapshot supplied, starting with an empty catalog");
                return Self::open(config);
            }
        };

        let restored = restore_connection(bytes, checksum)
            .and_then(|conn| StorageEngine::from_connection(conn, Arc::clone(&schema)));
        match restored {
            Ok(engine) => Self::assemble(Some(engine), config, schema),
            Err(e) => {
                warn!(error = %e, bytes = bytes.len(), "snapshot could not be restored, starting with an empty catalog");
                Self::open(config)
            }
        }
    }

    fn assemble(engine: Option<StorageEngine>, config: CatalogConfig, schema: Arc<ResourceSchema>) -> Self {
        let config = Arc::new(config);
        let backend = engine.map(|engine| Backend {
            executor: SearchExecutor::new(engine.clone(), Arc::clone(&config)),
            engine,
        });
        Catalog {
            backend,
            config,
            schema,
            sink: None,
        }
    }

    /// Hand a snapshot to `sink` after every write
    pub fn with_sink(mut self, sink: Arc<dyn SnapshotSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn is_available(&self) -> bool {
        self.backend.is_some()
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.config
    }

    pub fn schema(&self) -> &ResourceSchema {
        &self.schema
    }

    fn engine(&self) -> Result<&StorageEngine> {
        self.backend
            .as_ref()
            .map(|b| &b.engine)
            .ok_or_else(|| Error::EngineUnavailable("catalog engine is not initialized".to_string()))
    }

    // ---- writes ----

    /// Replace everything stored for the resource
    pub async fn upsert(&self, resource: Resource, distributions: Vec<Distribution>) -> Result<()> {
        self.schema.validate_resource(&resource)?;
        let Some(backend) = &self.backend else {
            warn!(id = %resource.id, "catalog unavailable, upsert ignored");
            return Ok(());
        };

        let schema = Arc::clone(&self.schema);
        backend
            .engine
            .run(move |conn| upsert_resource(conn, &schema, &resource, &distributions))
            .await?;
        self.flush().await
    }

    /// Upsert a loosely typed JSON record, parsing its references
    pub async fn upsert_record(&self, record: Value) -> Result<()> {
        let (resource, distributions) = resource_from_record(&record, &self.schema, &self.config)?;
        self.upsert(resource, distributions).await
    }

    /// Remove a resource. Returns whether it existed.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let Some(backend) = &self.backend else {
            warn!(id, "catalog unavailable, delete ignored");
            return Ok(false);
        };

        let owned = id.to_string();
        let existed = backend
            .engine
            .run(move |conn| reconcile::delete_resource(conn, &owned))
            .await?;
        self.flush().await?;
        Ok(existed)
    }

    /// Upsert a batch of records, flushing once at the end
    pub async fn import_bulk(&self, records: Vec<Value>) -> Result<ImportReport> {
        let Some(backend) = &self.backend else {
            warn!(records = records.len(), "catalog unavailable, bulk import ignored");
            return Ok(ImportReport::default());
        };

        let schema = Arc::clone(&self.schema);
        let config = Arc::clone(&self.config);
        let report = backend
            .engine
            .run(move |conn| Ok(import_records(conn, &schema, &config, &records)))
            .await?;
        self.flush().await?;
        Ok(report)
    }

    /// Import tabular rows. `aliases` defaults to the configured column aliases.
    pub async fn import_tabular(
        &self,
        rows: Vec<TabularRow>,
        aliases: Option<HashMap<String, String>>,
    ) -> Result<TabularImportSummary> {
        let aliases = aliases.unwrap_or_else(|| self.config.column_aliases.clone());
        let Some(backend) = &self.backend else {
            let columns: Vec<String> = rows
                .iter()
                .flat_map(|row| row.keys())
                .map(|c| resolve_column(c, &aliases, &self.schema))
                .collect();
            warn!(rows = rows.len(), "catalog unavailable, tabular import ignored");
            return Ok(TabularImportSummary {
                kind: classify_columns(&columns),
                added_count: 0,
            });
        };

        let schema = Arc::clone(&self.schema);
        let config = Arc::clone(&self.config);
        let summary = backend
            .engine
            .run(move |conn| import_rows(conn, &schema, &config, &rows, &aliases))
            .await?;
        self.flush().await?;
        Ok(summary)
    }

    pub async fn cache_thumbnail(&self, id: &str, url: &str) -> Result<()> {
        self.cache_write(id, url, reconcile::cache_thumbnail).await
    }

    pub async fn cache_static_map(&self, id: &str, url: &str) -> Result<()> {
        self.cache_write(id, url, reconcile::cache_static_map).await
    }

    async fn cache_write(
        &self,
        id: &str,
        url: &str,
        write: fn(&rusqlite::Connection, &str, &str) -> Result<()>,
    ) -> Result<()> {
        let Some(backend) = &self.backend else {
            warn!(id, "catalog unavailable, cache write ignored");
            return Ok(());
        };
        let (id, url) = (id.to_string(), url.to_string());
        backend.engine.run(move |conn| write(conn, &id, &url)).await?;
        self.flush().await
    }

    async fn flush(&self) -> Result<()> {
        let Some(sink) = &self.sink else {
            return Ok(());
        };
        let sink = Arc::clone(sink);
        let compress = self.config.compress_snapshots;
        let snapshot_id = self
            .engine()?
            .run(move |conn| {
                let snapshot = export_snapshot(conn, compress)?;
                sink.store(&snapshot)?;
                Ok(snapshot.metadata.snapshot_id)
            })
            .await?;
        debug!(snapshot_id = %snapshot_id, "flushed snapshot to sink");
        Ok(())
    }

    // ---- reads ----

    /// Ordered, paged results without facets
    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        match &self.backend {
            Some(backend) => backend.executor.search(request).await,
            None => Ok(SearchResponse::default()),
        }
    }

    /// Ordered, paged results plus facet counts
    pub async fn faceted_search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        match &self.backend {
            Some(backend) => backend.executor.faceted_search(request).await,
            None => Ok(SearchResponse::default()),
        }
    }

    /// All values of a field with resource counts
    pub async fn distinct_values(&self, field: &str, limit: Option<usize>) -> Result<Vec<FacetValue>> {
        match &self.backend {
            Some(backend) => backend.executor.distinct_values(field, limit).await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn get_resource(&self, id: &str) -> Result<Resource> {
        self.get_resources(vec![id.to_string()])
            .await?
            .pop()
            .ok_or_else(|| Error::NotFound(format!("resource '{}'", id)))
    }

    /// Hydrated resources in the given order; unknown IDs are left out
    pub async fn get_resources(&self, ids: Vec<String>) -> Result<Vec<Resource>> {
        match &self.backend {
            Some(backend) => hydrate(&backend.engine, ids).await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn count(&self) -> Result<u64> {
        let Some(backend) = &self.backend else {
            return Ok(0);
        };
        backend
            .engine
            .run(|conn| {
                let n: i64 = conn.query_row("SELECT COUNT(*) FROM resources", [], |row| row.get(0))?;
                Ok(n as u64)
            })
            .await
    }

    /// Every resource in interchange form, ordered by ID
    pub async fn export_records(&self) -> Result<Vec<Value>> {
        let Some(backend) = &self.backend else {
            return Ok(Vec::new());
        };
        let ids = backend.engine.run(|conn| all_ids(conn)).await?;
        let resources = hydrate(&backend.engine, ids).await?;
        resources
            .iter()
            .map(|r| record_from_resource(r, &self.config))
            .collect()
    }

    pub async fn static_map(&self, id: &str) -> Result<Option<String>> {
        match &self.backend {
            Some(backend) => hydrate::static_map(&backend.engine, id).await,
            None => Ok(None),
        }
    }

    /// Snapshot of the current database
    pub async fn export_snapshot(&self) -> Result<Snapshot> {
        let compress = self.config.compress_snapshots;
        self.engine()?
            .run(move |conn| export_snapshot(conn, compress))
            .await
    }
}

impl std::fmt::Debug for Catalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalog")
            .field("available", &self.is_available())
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}
