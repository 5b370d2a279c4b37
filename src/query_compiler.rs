//! Query compiler
//!
//! Lowers a [`SearchRequest`] into SQL predicate fragments over the scalar
//! table (alias `r`). User values only ever travel as bind parameters; field
//! names are checked against the registry and the identifier alphabet before
//! they reach SQL text.
//!
//! Field routing:
//! - scalar fields compare against their column
//! - every other field is a correlated test against `resources_mv`
//!
//! Free-text and spatial predicates are "global": they apply identically to
//! the result set and every facet, so the executor may materialize them once
//! into a hit set and compile the rest with `include_global = false`.

use crate::error::{Error, Result};
use crate::query_request::{FilterCondition, SearchRequest, SortDirection, RELEVANCE};
use crate::schema::ResourceSchema;
use crate::types::TITLE_FIELD;
use rusqlite::types::Value;
use std::collections::BTreeSet;

/// SQL boolean expression plus its positional bind values
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Fragment {
    pub sql: String,
    pub params: Vec<Value>,
}

impl Fragment {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Fragment {
            sql: sql.into(),
            params,
        }
    }

    /// Always-true predicate
    pub fn truth() -> Self {
        Fragment::new("1=1", Vec::new())
    }

    pub fn is_truth(&self) -> bool {
        self.sql == "1=1"
    }

    /// Conjunction of fragments; empty input is [`Fragment::truth`]
    pub fn and_all(parts: Vec<Fragment>) -> Self {
        if parts.is_empty() {
            return Fragment::truth();
        }
        let mut sql = Vec::with_capacity(parts.len());
        let mut params = Vec::new();
        for part in parts {
            sql.push(format!("({})", part.sql));
            params.extend(part.params);
        }
        Fragment::new(sql.join(" AND "), params)
    }
}

/// Compiles requests against a field registry
pub struct QueryCompiler<'a> {
    schema: &'a ResourceSchema,
}

impl<'a> QueryCompiler<'a> {
    pub fn new(schema: &'a ResourceSchema) -> Self {
        QueryCompiler { schema }
    }

    /// Compile the request's predicate.
    ///
    /// `omit_field` drops that field's own condition, which is how a facet
    /// counts values reachable if only its filter were cleared.
    /// `include_global` controls whether free-text and bbox predicates are
    /// emitted inline.
    pub fn compile(
        &self,
        request: &SearchRequest,
        omit_field: Option<&str>,
        include_global: bool,
    ) -> Result<Fragment> {
        let mut parts = Vec::new();

        if include_global {
            let global = self.compile_global(request);
            if !global.is_truth() {
                parts.push(global);
            }
        }

        for (field, condition) in &request.filters {
            if omit_field == Some(field.as_str()) {
                continue;
            }
            if let Some(fragment) = self.compile_condition(field, condition)? {
                parts.push(fragment);
            }
        }

        Ok(Fragment::and_all(parts))
    }

    /// Free-text and spatial predicates only
    pub fn compile_global(&self, request: &SearchRequest) -> Fragment {
        let mut parts = Vec::new();

        if let Some(q) = request.text_query() {
            let terms: Vec<String> = q
                .split_whitespace()
                .map(|t| format!("%{}%", escape_like(&t.to_lowercase())))
                .collect();
            let likes = vec!["s.content LIKE ? ESCAPE '\\'"; terms.len()].join(" AND ");
            parts.push(Fragment::new(
                format!(
                    "EXISTS (SELECT 1 FROM resources_search s WHERE s.id = r.id AND {})",
                    likes
                ),
                terms.into_iter().map(Value::Text).collect(),
            ));
        }

        if let Some(bbox) = &request.bbox {
            parts.push(Fragment::new(
                "r.geom_minx IS NOT NULL AND r.geom_minx <= ? AND r.geom_maxx >= ? \
                 AND r.geom_miny <= ? AND r.geom_maxy >= ?",
                vec![
                    Value::Real(bbox.max_x),
                    Value::Real(bbox.min_x),
                    Value::Real(bbox.max_y),
                    Value::Real(bbox.min_y),
                ],
            ));
        }

        Fragment::and_all(parts)
    }

    /// Predicate for one field condition; `None` when the condition is empty
    pub fn compile_condition(&self, field: &str, condition: &FilterCondition) -> Result<Option<Fragment>> {
        self.schema.validate_field_name(field)?;
        if condition.is_empty() {
            return Ok(None);
        }

        let fragment = if self.schema.is_scalar(field) {
            self.scalar_condition(field, condition)
        } else {
            self.repeatable_condition(field, condition)
        };
        Ok(Some(fragment))
    }

    fn scalar_condition(&self, field: &str, condition: &FilterCondition) -> Fragment {
        let column = scalar_column(field);
        let mut parts = Vec::new();

        let any = distinct(&condition.any);
        if !any.is_empty() {
            parts.push(Fragment::new(
                format!("{} IN ({})", column, placeholders(any.len())),
                texts(&any),
            ));
        }
        // A single column can only equal every requested value if there is one
        for value in distinct(&condition.all) {
            parts.push(Fragment::new(format!("{} = ?", column), vec![Value::Text(value)]));
        }
        if let Some(gte) = condition.gte {
            parts.push(Fragment::new(format!("try_num({}) >= ?", column), vec![Value::Real(gte)]));
        }
        if let Some(lte) = condition.lte {
            parts.push(Fragment::new(format!("try_num({}) <= ?", column), vec![Value::Real(lte)]));
        }

        Fragment::and_all(parts)
    }

    fn repeatable_condition(&self, field: &str, condition: &FilterCondition) -> Fragment {
        let field_value = Value::Text(field.to_string());
        let mut parts = Vec::new();

        let any = distinct(&condition.any);
        if !any.is_empty() {
            let mut params = vec![field_value.clone()];
            params.extend(texts(&any));
            parts.push(Fragment::new(
                format!(
                    "EXISTS (SELECT 1 FROM resources_mv m WHERE m.id = r.id AND m.field = ? AND m.value IN ({}))",
                    placeholders(any.len())
                ),
                params,
            ));
        }

        let all = distinct(&condition.all);
        if !all.is_empty() {
            let mut params = vec![field_value.clone()];
            params.extend(texts(&all));
            params.push(Value::Integer(all.len() as i64));
            parts.push(Fragment::new(
                format!(
                    "(SELECT COUNT(DISTINCT m.value) FROM resources_mv m \
                     WHERE m.id = r.id AND m.field = ? AND m.value IN ({})) = ?",
                    placeholders(all.len())
                ),
                params,
            ));
        }

        if condition.gte.is_some() || condition.lte.is_some() {
            let mut sql = String::from(
                "EXISTS (SELECT 1 FROM resources_mv m WHERE m.id = r.id AND m.field = ? \
                 AND try_num(m.value) IS NOT NULL",
            );
            let mut params = vec![field_value];
            if let Some(gte) = condition.gte {
                sql.push_str(" AND try_num(m.value) >= ?");
                params.push(Value::Real(gte));
            }
            if let Some(lte) = condition.lte {
                sql.push_str(" AND try_num(m.value) <= ?");
                params.push(Value::Real(lte));
            }
            sql.push(')');
            parts.push(Fragment::new(sql, params));
        }

        Fragment::and_all(parts)
    }

    /// `ORDER BY` body for the request.
    ///
    /// The relevance key is the IoU with the query box when one is present and
    /// otherwise falls through to the title. Title then id always close the
    /// ordering so pages are stable.
    pub fn order_by(&self, request: &SearchRequest) -> Result<Fragment> {
        let mut keys: Vec<String> = Vec::new();
        let mut params = Vec::new();

        let relevance_only = [(RELEVANCE.to_string(), SortDirection::Desc)];
        let requested: Vec<(String, SortDirection)> = request
            .sort
            .iter()
            .map(|s| (s.field.clone(), s.dir))
            .collect();
        let specs: &[(String, SortDirection)] = if requested.is_empty() {
            &relevance_only
        } else {
            &requested
        };

        for (field, dir) in specs {
            if field == RELEVANCE {
                if let Some(bbox) = &request.bbox {
                    keys.push(
                        "COALESCE(bbox_iou(r.geom_minx, r.geom_miny, r.geom_maxx, r.geom_maxy, ?, ?, ?, ?), -1) DESC"
                            .to_string(),
                    );
                    params.extend([
                        Value::Real(bbox.min_x),
                        Value::Real(bbox.min_y),
                        Value::Real(bbox.max_x),
                        Value::Real(bbox.max_y),
                    ]);
                }
                continue;
            }

            self.schema.validate_field_name(field)?;
            if self.schema.field(field).is_none() {
                return Err(Error::InvalidInput(format!("unknown sort field '{}'", field)));
            }

            let numeric = self.schema.is_numeric(field);
            let (expr, expr_params) = if self.schema.is_scalar(field) {
                let column = scalar_column(field);
                let expr = if numeric {
                    format!("try_num({})", column)
                } else {
                    column
                };
                (expr, Vec::new())
            } else {
                let aggregate = if *dir == SortDirection::Desc { "MAX" } else { "MIN" };
                let value = if numeric { "try_num(m.value)" } else { "m.value" };
                (
                    format!(
                        "(SELECT {}({}) FROM resources_mv m WHERE m.id = r.id AND m.field = ?)",
                        aggregate, value
                    ),
                    vec![Value::Text(field.clone())],
                )
            };

            // Missing and non-numeric values sort last in either direction
            keys.push(format!("{} IS NULL", expr));
            params.extend(expr_params.iter().cloned());
            let collate = if numeric { "" } else { " COLLATE NOCASE" };
            keys.push(format!("{}{} {}", expr, collate, dir.sql()));
            params.extend(expr_params);
        }

        let title = scalar_column(TITLE_FIELD);
        keys.push(format!("{} IS NULL", title));
        keys.push(format!("{} COLLATE NOCASE ASC", title));
        keys.push("r.id ASC".to_string());

        Ok(Fragment::new(keys.join(", "), params))
    }
}

/// Quoted column reference on the scalar table alias
pub fn scalar_column(field: &str) -> String {
    format!("r.\"{}\"", field)
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn texts(values: &[String]) -> Vec<Value> {
    values.iter().cloned().map(Value::Text).collect()
}

fn distinct(values: &[String]) -> Vec<String> {
    values
        .iter()
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn escape_like(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
