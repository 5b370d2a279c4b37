//! Core type definitions for the catalog

use crate::geometry::Envelope;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Field holding the resource title
pub const TITLE_FIELD: &str = "dct_title_s";

/// Field holding the `ENVELOPE(w,e,n,s)` bounding box text
pub const BBOX_FIELD: &str = "dcat_bbox";

/// Structured reference field, parsed into distributions
pub const REFERENCES_FIELD: &str = "dct_references_s";

/// One access point for a resource ("where to get or view it")
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Distribution {
    pub relation_key: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Distribution {
    pub fn new(relation_key: impl Into<String>, url: impl Into<String>) -> Self {
        Distribution {
            relation_key: relation_key.into(),
            url: url.into(),
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// One metadata record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    /// Single-valued fields, keyed by field name (excluding `id`)
    pub scalars: BTreeMap<String, String>,
    /// Multi-valued fields, keyed by field name
    pub repeatables: BTreeMap<String, Vec<String>>,
    /// Filled in on read; writes take distributions separately
    #[serde(default)]
    pub distributions: Vec<Distribution>,
    /// Derived from `dcat_bbox` on write, filled in on read
    #[serde(default)]
    pub geometry: Option<Envelope>,
    /// Cached thumbnail URL, filled in on read
    #[serde(default)]
    pub thumbnail: Option<String>,
}

impl Resource {
    pub fn new(id: impl Into<String>) -> Self {
        Resource {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_scalar(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_scalar(field, value);
        self
    }

    pub fn with_values<I, S>(mut self, field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.set_values(field, values);
        self
    }

    pub fn set_scalar(&mut self, field: impl Into<String>, value: impl Into<String>) {
        self.scalars.insert(field.into(), value.into());
    }

    pub fn set_values<I, S>(&mut self, field: impl Into<String>, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.repeatables
            .insert(field.into(), values.into_iter().map(Into::into).collect());
    }

    pub fn scalar(&self, field: &str) -> Option<&str> {
        self.scalars.get(field).map(String::as_str)
    }

    /// Values of a repeatable field; empty when absent
    pub fn values(&self, field: &str) -> &[String] {
        self.repeatables
            .get(field)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn title(&self) -> Option<&str> {
        self.scalar(TITLE_FIELD)
    }

    pub fn bbox_text(&self) -> Option<&str> {
        self.scalar(BBOX_FIELD)
    }
}
