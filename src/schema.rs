//! Field registry for resources
//!
//! Scalar fields form a closed set, each stored as one column of the
//! `resources` table. Every other field name is repeatable and lives in the
//! attribute/value table. The query compiler routes on this registry, so a
//! field must be declared scalar here to be compared against a column.

use crate::error::{Error, Result};
use crate::types::Resource;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Storage shape of a field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldKind {
    /// One column in the scalar table
    Scalar,
    /// Zero or more rows in the attribute/value table
    Repeatable,
}

/// Field definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub kind: FieldKind,
    /// Sorted and range-filtered through a numeric cast
    pub numeric: bool,
    /// Contributes to the search content blob
    pub searchable: bool,
}

impl Field {
    pub fn scalar(name: &str) -> Self {
        Field {
            name: name.to_string(),
            kind: FieldKind::Scalar,
            numeric: false,
            searchable: false,
        }
    }

    pub fn repeatable(name: &str) -> Self {
        Field {
            name: name.to_string(),
            kind: FieldKind::Repeatable,
            numeric: false,
            searchable: false,
        }
    }

    pub fn numeric(mut self) -> Self {
        self.numeric = true;
        self
    }

    pub fn searchable(mut self) -> Self {
        self.searchable = true;
        self
    }

    pub fn is_scalar(&self) -> bool {
        self.kind == FieldKind::Scalar
    }
}

/// Registry of known resource fields
#[derive(Debug, Clone)]
pub struct ResourceSchema {
    fields: Vec<Field>,
    by_name: HashMap<String, usize>,
}

impl ResourceSchema {
    pub fn new(fields: Vec<Field>) -> Self {
        let by_name = fields
            .iter()
            .enumerate()
            .map(|(idx, f)| (f.name.clone(), idx))
            .collect();
        ResourceSchema { fields, by_name }
    }

    /// OpenGeoMetadata Aardvark layout
    pub fn aardvark() -> Self {
        Self::new(vec![
            Field::scalar("id"),
            Field::scalar("dct_title_s").searchable(),
            Field::scalar("dct_accessRights_s"),
            Field::scalar("dct_format_s"),
            Field::scalar("dct_issued_s"),
            Field::scalar("schema_provider_s"),
            Field::scalar("dcat_bbox"),
            Field::scalar("locn_geometry"),
            Field::scalar("dcat_centroid"),
            Field::scalar("gbl_fileSize_s"),
            Field::scalar("gbl_wxsIdentifier_s"),
            Field::scalar("gbl_mdModified_dt"),
            Field::scalar("gbl_mdVersion_s"),
            Field::scalar("gbl_suppressed_b"),
            Field::scalar("gbl_georeferenced_b"),
            Field::repeatable("dct_alternative_sm"),
            Field::repeatable("dct_description_sm").searchable(),
            Field::repeatable("dct_language_sm"),
            Field::repeatable("dct_creator_sm"),
            Field::repeatable("dct_publisher_sm"),
            Field::repeatable("gbl_resourceClass_sm"),
            Field::repeatable("gbl_resourceType_sm"),
            Field::repeatable("dct_subject_sm").searchable(),
            Field::repeatable("dcat_theme_sm"),
            Field::repeatable("dcat_keyword_sm").searchable(),
            Field::repeatable("dct_temporal_sm"),
            Field::repeatable("gbl_indexYear_im").numeric(),
            Field::repeatable("gbl_dateRange_drsim"),
            Field::repeatable("dct_spatial_sm"),
            Field::repeatable("dct_relation_sm"),
            Field::repeatable("pcdm_memberOf_sm"),
            Field::repeatable("dct_isPartOf_sm"),
            Field::repeatable("dct_source_sm"),
            Field::repeatable("dct_isVersionOf_sm"),
            Field::repeatable("dct_replaces_sm"),
            Field::repeatable("dct_isReplacedBy_sm"),
            Field::repeatable("dct_rights_sm"),
            Field::repeatable("dct_rightsHolder_sm"),
            Field::repeatable("dct_license_sm"),
            Field::repeatable("dct_identifier_sm"),
        ])
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.by_name.get(name).map(|&idx| &self.fields[idx])
    }

    /// Declared spelling of a field name, matched case-insensitively
    pub fn canonical_name(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
            .map(|f| f.name.as_str())
    }

    /// Scalar routing. Unknown names are repeatable.
    pub fn is_scalar(&self, name: &str) -> bool {
        self.field(name).map(Field::is_scalar).unwrap_or(false)
    }

    pub fn is_numeric(&self, name: &str) -> bool {
        self.field(name).map(|f| f.numeric).unwrap_or(false)
    }

    /// Scalar columns other than `id`, in declaration order
    pub fn scalar_columns(&self) -> impl Iterator<Item = &str> {
        self.fields
            .iter()
            .filter(|f| f.is_scalar() && f.name != "id")
            .map(|f| f.name.as_str())
    }

    /// Fields concatenated into the search content, title first
    pub fn searchable_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| f.searchable)
    }

    /// Field names may only contain ASCII letters, digits and underscores
    pub fn validate_field_name(&self, name: &str) -> Result<()> {
        let well_formed = !name.is_empty()
            && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if well_formed {
            Ok(())
        } else {
            Err(Error::InvalidInput(format!("malformed field name '{}'", name)))
        }
    }

    /// Check a resource before it is written
    pub fn validate_resource(&self, resource: &Resource) -> Result<()> {
        if resource.id.trim().is_empty() {
            return Err(Error::InvalidInput("resource id is required".to_string()));
        }

        for name in resource.scalars.keys() {
            if name == "id" || !self.is_scalar(name) {
                return Err(Error::InvalidInput(format!(
                    "'{}' is not a scalar field",
                    name
                )));
            }
        }

        for name in resource.repeatables.keys() {
            self.validate_field_name(name)?;
            if self.is_scalar(name) {
                return Err(Error::InvalidInput(format!(
                    "'{}' is a scalar field, not repeatable",
                    name
                )));
            }
        }

        Ok(())
    }

    /// Lowercased search blob: title followed by searchable repeatable values
    pub fn search_content(&self, resource: &Resource) -> String {
        let mut parts: Vec<&str> = Vec::new();
        for field in self.searchable_fields() {
            match field.kind {
                FieldKind::Scalar => parts.extend(resource.scalar(&field.name)),
                FieldKind::Repeatable => {
                    parts.extend(resource.values(&field.name).iter().map(String::as_str))
                }
            }
        }
        parts
            .into_iter()
            .filter(|p| !p.trim().is_empty())
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase()
    }
}

impl Default for ResourceSchema {
    fn default() -> Self {
        Self::aardvark()
    }
}
