//! Filter/facet request DSL
//!
//! JSON-shaped request and response types. A request carries an optional
//! free-text query, an optional bounding box, per-field conditions, sort keys,
//! a page window and the facets to compute.

use crate::geometry::Envelope;
use crate::types::Resource;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Sort key name meaning "best match"
pub const RELEVANCE: &str = "relevance";

/// Search request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchRequest {
    /// Free-text query
    pub q: Option<String>,
    /// Field name -> condition
    pub filters: BTreeMap<String, FilterCondition>,
    pub sort: Vec<SortSpec>,
    pub page: Option<PageSpec>,
    pub facets: Vec<FacetSpec>,
    pub bbox: Option<BoundingBox>,
}

impl SearchRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_query(mut self, q: impl Into<String>) -> Self {
        self.q = Some(q.into());
        self
    }

    pub fn with_filter(mut self, field: impl Into<String>, condition: FilterCondition) -> Self {
        self.filters.insert(field.into(), condition);
        self
    }

    pub fn with_bbox(mut self, bbox: BoundingBox) -> Self {
        self.bbox = Some(bbox);
        self
    }

    pub fn with_sort(mut self, field: impl Into<String>, dir: SortDirection) -> Self {
        self.sort.push(SortSpec {
            field: field.into(),
            dir,
        });
        self
    }

    pub fn with_page(mut self, size: usize, from: usize) -> Self {
        self.page = Some(PageSpec { size, from });
        self
    }

    pub fn with_facet(mut self, field: impl Into<String>, limit: Option<usize>) -> Self {
        self.facets.push(FacetSpec {
            field: field.into(),
            limit,
        });
        self
    }

    /// Free-text query, if it has any non-blank content
    pub fn text_query(&self) -> Option<&str> {
        self.q.as_deref().map(str::trim).filter(|q| !q.is_empty())
    }

    /// Whether free-text or spatial predicates apply
    pub fn has_global_predicates(&self) -> bool {
        self.text_query().is_some() || self.bbox.is_some()
    }
}

/// Condition on one field. All present parts must hold.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterCondition {
    /// At least one of these values
    pub any: Vec<String>,
    /// Every one of these values
    pub all: Vec<String>,
    pub gte: Option<f64>,
    pub lte: Option<f64>,
}

impl FilterCondition {
    pub fn any_of<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FilterCondition {
            any: values.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn all_of<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FilterCondition {
            all: values.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn range(gte: Option<f64>, lte: Option<f64>) -> Self {
        FilterCondition {
            gte,
            lte,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.any.is_empty() && self.all.is_empty() && self.gte.is_none() && self.lte.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    #[serde(default)]
    pub dir: SortDirection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSpec {
    pub size: usize,
    #[serde(default)]
    pub from: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetSpec {
    pub field: String,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// Query bounding box in lon/lat degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        BoundingBox {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn envelope(&self) -> Envelope {
        Envelope::new(self.min_x, self.min_y, self.max_x, self.max_y)
    }
}

/// One facet bucket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetValue {
    pub value: String,
    pub count: u64,
}

/// Search response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<Resource>,
    pub facets: BTreeMap<String, Vec<FacetValue>>,
    pub total: u64,
}

impl SearchResponse {
    pub fn ids(&self) -> Vec<&str> {
        self.results.iter().map(|r| r.id.as_str()).collect()
    }
}
