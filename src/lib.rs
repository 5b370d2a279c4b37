//! Geocatalog - faceted geospatial metadata store
//!
//! Stores geospatial metadata records ("resources") over an embedded SQLite
//! database and compiles declarative filter/facet requests into SQL.
//!
//! # Architecture
//!
//! - Storage Layer: SQLite schema, additive migrations, geometry backfill
//! - Reconciler: transactional replace of a resource across all row sets
//! - Import Layer: bulk JSON records and tabular rows
//! - Query Compiler: request DSL -> parameterized SQL fragments
//! - Search Executor: hit-set materialization, paging, concurrent facets
//! - Hydration Layer: full resources in result order
//! - Snapshots: database images handed to an external durable store

pub mod config;
pub mod error;
pub mod geometry;
pub mod schema;
pub mod storage;
pub mod types;

// Write path
pub mod import;
pub mod reconcile;
pub mod references;

// Read path
pub mod hydrate;
pub mod query_compiler;
pub mod query_executor;
pub mod query_request;

// Persistence
pub mod snapshot;

pub mod catalog;

pub use catalog::Catalog;
pub use config::CatalogConfig;
pub use error::{Error, Result};
pub use geometry::Envelope;
pub use schema::{Field, FieldKind, ResourceSchema};
pub use storage::StorageEngine;
pub use types::{Distribution, Resource};

// Import exports
pub use import::{classify_columns, ImportReport, TableKind, TabularImportSummary, TabularRow};

// Query exports
pub use query_compiler::{Fragment, QueryCompiler};
pub use query_executor::{HitSet, SearchExecutor};
pub use query_request::{
    BoundingBox, FacetSpec, FacetValue, FilterCondition, PageSpec, SearchRequest, SearchResponse, SortDirection,
    SortSpec, RELEVANCE,
};

// Snapshot exports
pub use snapshot::{MemorySink, Snapshot, SnapshotMetadata, SnapshotSink};
