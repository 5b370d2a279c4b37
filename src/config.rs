//! Catalog configuration.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Configuration for a catalog instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Database file; `None` keeps everything in memory
    pub database_path: Option<PathBuf>,
    /// Page size used when a request does not carry one
    pub default_page_size: usize,
    /// Facet cap used when a facet spec does not carry one
    pub default_facet_limit: usize,
    /// Field rendered as a continuous timeline rather than a top-N list
    pub timeline_field: String,
    /// Cap applied to the timeline facet
    pub timeline_facet_limit: usize,
    /// Relation URI -> relation key, used to parse `dct_references_s`
    pub reference_relations: BTreeMap<String, String>,
    /// Friendly tabular column name -> canonical field name
    pub column_aliases: HashMap<String, String>,
    /// Gzip snapshot bytes
    pub compress_snapshots: bool,
    /// Verify snapshot checksums on restore when one is supplied
    pub verify_snapshots: bool,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        CatalogConfig {
            database_path: None,
            default_page_size: 10,
            default_facet_limit: 10,
            timeline_field: "gbl_indexYear_im".to_string(),
            timeline_facet_limit: 1000,
            reference_relations: default_reference_relations(),
            column_aliases: default_column_aliases(),
            compress_snapshots: true,
            verify_snapshots: true,
        }
    }
}

impl CatalogConfig {
    /// Load configuration from a JSON file; missing keys fall back to defaults
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Relation key for a reference URI. Unknown URIs are kept verbatim.
    pub fn relation_key_for(&self, uri: &str) -> String {
        self.reference_relations
            .get(uri)
            .cloned()
            .unwrap_or_else(|| uri.to_string())
    }

    /// Reference URI for a relation key. Unknown keys are kept verbatim.
    pub fn relation_uri_for(&self, key: &str) -> String {
        self.reference_relations
            .iter()
            .find(|(_, k)| k.as_str() == key)
            .map(|(uri, _)| uri.clone())
            .unwrap_or_else(|| key.to_string())
    }
}

fn default_reference_relations() -> BTreeMap<String, String> {
    [
        ("http://schema.org/url", "url"),
        ("http://schema.org/downloadUrl", "download"),
        ("http://schema.org/thumbnailUrl", "thumbnail"),
        ("http://www.opengis.net/def/serviceType/ogc/wms", "wms"),
        ("http://www.opengis.net/def/serviceType/ogc/wfs", "wfs"),
        ("http://www.opengis.net/def/serviceType/ogc/wcs", "wcs"),
        ("http://www.opengis.net/def/serviceType/ogc/wmts", "wmts"),
        ("http://iiif.io/api/image", "iiif_image"),
        ("http://iiif.io/api/presentation#manifest", "iiif_manifest"),
        ("https://openindexmaps.org", "open_index_map"),
        ("https://github.com/cogeotiff/cog-spec", "cog"),
        ("https://github.com/protomaps/PMTiles", "pmtiles"),
        ("https://wiki.osgeo.org/wiki/XYZ", "xyz_tiles"),
        ("https://wiki.osgeo.org/wiki/Tile_Map_Service", "tile_map_service"),
        ("https://developers.arcgis.com/rest/services-reference/enterprise/feature-service.htm", "arcgis_feature_service"),
        ("urn:x-esri:serviceType:ArcGIS#FeatureLayer", "arcgis_feature_layer"),
        ("urn:x-esri:serviceType:ArcGIS#DynamicMapLayer", "arcgis_dynamic_map_layer"),
        ("urn:x-esri:serviceType:ArcGIS#ImageMapLayer", "arcgis_image_map_layer"),
        ("urn:x-esri:serviceType:ArcGIS#TiledMapLayer", "arcgis_tiled_map_layer"),
        ("http://www.isotc211.org/schemas/2005/gmd/", "metadata_iso"),
        ("http://www.opengis.net/cat/csw/csdgm", "metadata_fgdc"),
        ("http://www.loc.gov/mods/v3", "metadata_mods"),
        ("http://www.w3.org/1999/xhtml", "metadata_html"),
        ("http://lccn.loc.gov/sh85035852", "documentation_download"),
        ("http://schema.org/image", "image"),
    ]
    .into_iter()
    .map(|(uri, key)| (uri.to_string(), key.to_string()))
    .collect()
}

fn default_column_aliases() -> HashMap<String, String> {
    [
        ("ID", "id"),
        ("Title", "dct_title_s"),
        ("Alternative Title", "dct_alternative_sm"),
        ("Description", "dct_description_sm"),
        ("Language", "dct_language_sm"),
        ("Creator", "dct_creator_sm"),
        ("Publisher", "dct_publisher_sm"),
        ("Provider", "schema_provider_s"),
        ("Resource Class", "gbl_resourceClass_sm"),
        ("Resource Type", "gbl_resourceType_sm"),
        ("Subject", "dct_subject_sm"),
        ("Theme", "dcat_theme_sm"),
        ("Keyword", "dcat_keyword_sm"),
        ("Temporal Coverage", "dct_temporal_sm"),
        ("Date Issued", "dct_issued_s"),
        ("Index Year", "gbl_indexYear_im"),
        ("Date Range", "gbl_dateRange_drsim"),
        ("Spatial Coverage", "dct_spatial_sm"),
        ("Geometry", "locn_geometry"),
        ("Bounding Box", "dcat_bbox"),
        ("Centroid", "dcat_centroid"),
        ("Member Of", "pcdm_memberOf_sm"),
        ("Is Part Of", "dct_isPartOf_sm"),
        ("Rights", "dct_rights_sm"),
        ("Rights Holder", "dct_rightsHolder_sm"),
        ("License", "dct_license_sm"),
        ("Access Rights", "dct_accessRights_s"),
        ("Format", "dct_format_s"),
        ("File Size", "gbl_fileSize_s"),
        ("WxS Identifier", "gbl_wxsIdentifier_s"),
        ("References", "dct_references_s"),
        ("Identifier", "dct_identifier_sm"),
        ("Modified", "gbl_mdModified_dt"),
        ("Metadata Version", "gbl_mdVersion_s"),
        ("Suppressed", "gbl_suppressed_b"),
        ("Georeferenced", "gbl_georeferenced_b"),
    ]
    .into_iter()
    .map(|(alias, field)| (alias.to_string(), field.to_string()))
    .collect()
}
