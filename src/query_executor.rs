//! Search executor and facet aggregator
//!
//! Runs compiled requests against the engine:
//!
//! 1. materialize the global hit set (free text, bbox) when one applies
//! 2. page the ordered ID list and count the total under the same predicate
//! 3. count each requested facet with its own filter left out, concurrently
//! 4. hydrate the page
//!
//! The hit set is a temp table owned by a [`HitSet`] guard, so it is dropped
//! on every exit path of the invocation.

use crate::config::CatalogConfig;
use crate::error::Result;
use crate::hydrate::hydrate;
use crate::query_compiler::{scalar_column, Fragment, QueryCompiler};
use crate::query_request::{FacetSpec, FacetValue, PageSpec, SearchRequest, SearchResponse};
use crate::storage::StorageEngine;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Query-scoped materialization of IDs matching the global predicates
///
/// The temp table name carries a random suffix so concurrent invocations on
/// the shared connection never see or drop each other's sets.
pub struct HitSet {
    engine: StorageEngine,
    name: String,
}

impl HitSet {
    /// Create the temp table from a global predicate
    pub async fn materialize(engine: &StorageEngine, global: Fragment) -> Result<HitSet> {
        let guard = HitSet {
            engine: engine.clone(),
            name: format!("hitset_{:016x}", rand::random::<u64>()),
        };

        let sql = format!(
            "CREATE TEMP TABLE {} AS SELECT r.id AS id FROM resources r WHERE {}",
            guard.name, global.sql
        );
        engine
            .run(move |conn| {
                conn.execute(&sql, params_from_iter(global.params))?;
                Ok(())
            })
            .await?;

        debug!(hit_set = %guard.name, "materialized global hit set");
        Ok(guard)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Join clause restricting alias `r` to the hit set
    pub fn join_clause(&self) -> String {
        format!(" JOIN temp.{} h ON h.id = r.id", self.name)
    }
}

impl Drop for HitSet {
    fn drop(&mut self) {
        let sql = format!("DROP TABLE IF EXISTS temp.{}", self.name);
        match self.engine.run_blocking(|conn| Ok(conn.execute_batch(&sql)?)) {
            Ok(()) => debug!(hit_set = %self.name, "dropped global hit set"),
            Err(e) => warn!(hit_set = %self.name, error = %e, "failed to drop global hit set"),
        }
    }
}

/// One facet's aggregation query
#[derive(Debug, Clone)]
struct FacetPlan {
    field: String,
    sql: String,
    params: Vec<Value>,
}

/// Executes searches and facet counts
pub struct SearchExecutor {
    engine: StorageEngine,
    config: Arc<CatalogConfig>,
}

impl SearchExecutor {
    pub fn new(engine: StorageEngine, config: Arc<CatalogConfig>) -> Self {
        SearchExecutor { engine, config }
    }

    /// Results, total and facets for a request
    pub async fn faceted_search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        let schema = Arc::clone(self.engine.schema());
        let compiler = QueryCompiler::new(&schema);

        for facet in &request.facets {
            schema.validate_field_name(&facet.field)?;
        }
        let order = compiler.order_by(request)?;

        let hit_set = if request.has_global_predicates() {
            Some(HitSet::materialize(&self.engine, compiler.compile_global(request)).await?)
        } else {
            None
        };
        let join = hit_set.as_ref().map(HitSet::join_clause).unwrap_or_default();
        let predicate = compiler.compile(request, None, hit_set.is_none())?;

        let page = request.page.unwrap_or(PageSpec {
            size: self.config.default_page_size,
            from: 0,
        });

        let ids = {
            let sql = format!(
                "SELECT r.id FROM resources r{} WHERE {} ORDER BY {} LIMIT ? OFFSET ?",
                join, predicate.sql, order.sql
            );
            let mut params = predicate.params.clone();
            params.extend(order.params);
            params.push(Value::Integer(page.size as i64));
            params.push(Value::Integer(page.from as i64));
            self.engine
                .run(move |conn| query_ids(conn, &sql, params))
                .await?
        };

        let total = {
            let sql = format!("SELECT COUNT(*) FROM resources r{} WHERE {}", join, predicate.sql);
            let params = predicate.params;
            self.engine
                .run(move |conn| {
                    let n: i64 = conn.query_row(&sql, params_from_iter(params), |row| row.get(0))?;
                    Ok(n as u64)
                })
                .await?
        };

        let mut tasks = JoinSet::new();
        for facet in &request.facets {
            let plan = match self.facet_plan(&compiler, request, facet, &join, hit_set.is_none()) {
                Ok(plan) => plan,
                Err(e) => {
                    warn!(field = %facet.field, error = %e, "facet could not be compiled");
                    continue;
                }
            };
            let engine = self.engine.clone();
            tasks.spawn(async move {
                let field = plan.field.clone();
                let counted = engine
                    .run(move |conn| query_facet(conn, &plan.sql, plan.params))
                    .await;
                (field, counted)
            });
        }

        let mut facets = BTreeMap::new();
        for facet in &request.facets {
            facets.insert(facet.field.clone(), Vec::new());
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((field, Ok(values))) => {
                    facets.insert(field, values);
                }
                Ok((field, Err(e))) => warn!(field = %field, error = %e, "facet query failed"),
                Err(e) => warn!(error = %e, "facet task failed"),
            }
        }

        let results = if ids.is_empty() {
            Vec::new()
        } else {
            hydrate(&self.engine, ids).await?
        };

        drop(hit_set);
        Ok(SearchResponse {
            results,
            facets,
            total,
        })
    }

    /// Results and total only
    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        let mut request = request.clone();
        request.facets.clear();
        self.faceted_search(&request).await
    }

    /// Every value of a field across the catalog with its resource count
    pub async fn distinct_values(&self, field: &str, limit: Option<usize>) -> Result<Vec<FacetValue>> {
        let schema = Arc::clone(self.engine.schema());
        schema.validate_field_name(field)?;
        let compiler = QueryCompiler::new(&schema);
        let spec = FacetSpec {
            field: field.to_string(),
            limit,
        };
        let plan = self.facet_plan(&compiler, &SearchRequest::default(), &spec, "", true)?;
        self.engine
            .run(move |conn| query_facet(conn, &plan.sql, plan.params))
            .await
    }

    fn facet_plan(
        &self,
        compiler: &QueryCompiler<'_>,
        request: &SearchRequest,
        facet: &FacetSpec,
        join: &str,
        include_global: bool,
    ) -> Result<FacetPlan> {
        let field = facet.field.as_str();
        let predicate = compiler.compile(request, Some(field), include_global)?;
        let is_timeline = field == self.config.timeline_field;

        let limit = facet.limit.unwrap_or(self.config.default_facet_limit);
        let limit = if is_timeline {
            limit.max(self.config.timeline_facet_limit)
        } else {
            limit
        };
        let schema = self.engine.schema();
        let scalar = schema.is_scalar(field);
        let value = if scalar { scalar_column(field) } else { "m.value".to_string() };
        let order = if is_timeline {
            format!("try_num({v}) IS NULL, try_num({v}) ASC, {v} ASC", v = value)
        } else {
            format!("cnt DESC, {} ASC", value)
        };

        let (sql, mut params) = if scalar {
            (
                format!(
                    "SELECT {v} AS value, COUNT(DISTINCT r.id) AS cnt FROM resources r{join} \
                     WHERE ({pred}) AND {v} IS NOT NULL AND {v} <> '' \
                     GROUP BY {v} ORDER BY {order} LIMIT ?",
                    v = value,
                    join = join,
                    pred = predicate.sql,
                    order = order
                ),
                predicate.params,
            )
        } else {
            let mut params = vec![Value::Text(field.to_string())];
            params.extend(predicate.params);
            (
                format!(
                    "SELECT m.value AS value, COUNT(DISTINCT m.id) AS cnt \
                     FROM resources_mv m JOIN resources r ON r.id = m.id{join} \
                     WHERE m.field = ? AND ({pred}) \
                     GROUP BY m.value ORDER BY {order} LIMIT ?",
                    join = join,
                    pred = predicate.sql,
                    order = order
                ),
                params,
            )
        };
        params.push(Value::Integer(limit as i64));

        Ok(FacetPlan {
            field: field.to_string(),
            sql,
            params,
        })
    }
}

fn query_ids(conn: &Connection, sql: &str, params: Vec<Value>) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params_from_iter(params), |row| row.get::<_, String>(0))?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}

fn query_facet(conn: &Connection, sql: &str, params: Vec<Value>) -> Result<Vec<FacetValue>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params_from_iter(params), |row| {
        Ok(FacetValue {
            value: row.get(0)?,
            count: row.get::<_, i64>(1)? as u64,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<_>>()?)
}
