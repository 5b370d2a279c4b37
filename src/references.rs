//! `dct_references_s` <-> distribution rows
//!
//! The interchange form is a JSON object keyed by relation URI. A relation
//! with exactly one unlabeled URL is written as a plain string; a relation with
//! several URLs, or with any label, is written as a list of
//! `{"url": .., "label": ..}` objects. Both forms are accepted on input, as are
//! bare strings inside lists and a single object in place of a list.

use crate::config::CatalogConfig;
use crate::error::{Error, Result};
use crate::types::Distribution;
use serde_json::{Map, Value};

/// Parse a references blob (JSON text or an already-decoded object)
pub fn parse_references(value: &Value, config: &CatalogConfig) -> Result<Vec<Distribution>> {
    let object = match value {
        Value::Null => return Ok(Vec::new()),
        Value::String(text) if text.trim().is_empty() => return Ok(Vec::new()),
        Value::String(text) => match serde_json::from_str::<Value>(text)? {
            Value::Object(map) => map,
            other => return Err(malformed(&other)),
        },
        Value::Object(map) => map.clone(),
        other => return Err(malformed(other)),
    };

    let mut distributions = Vec::new();
    for (uri, entry) in &object {
        let key = config.relation_key_for(uri);
        match entry {
            Value::String(url) => push_url(&mut distributions, &key, url, None),
            Value::Array(items) => {
                for item in items {
                    let (url, label) = link_parts(item)?;
                    push_url(&mut distributions, &key, &url, label);
                }
            }
            Value::Object(_) => {
                let (url, label) = link_parts(entry)?;
                push_url(&mut distributions, &key, &url, label);
            }
            Value::Null => {}
            other => return Err(malformed(other)),
        }
    }
    Ok(distributions)
}

fn push_url(out: &mut Vec<Distribution>, key: &str, url: &str, label: Option<String>) {
    let url = url.trim();
    if url.is_empty() {
        return;
    }
    out.push(Distribution {
        relation_key: key.to_string(),
        url: url.to_string(),
        label: label.filter(|l| !l.trim().is_empty()),
    });
}

fn link_parts(item: &Value) -> Result<(String, Option<String>)> {
    match item {
        Value::String(url) => Ok((url.clone(), None)),
        Value::Object(map) => {
            let url = map
                .get("url")
                .and_then(Value::as_str)
                .ok_or_else(|| Error::InvalidInput("reference entry without url".to_string()))?;
            let label = map.get("label").and_then(Value::as_str).map(str::to_string);
            Ok((url.to_string(), label))
        }
        other => Err(malformed(other)),
    }
}

fn malformed(value: &Value) -> Error {
    Error::InvalidInput(format!("malformed references value: {}", value))
}

/// Group distributions back into the interchange object.
///
/// Relations keep the order their first distribution appears in; URLs keep
/// their order within a relation.
pub fn group_distributions(distributions: &[Distribution], config: &CatalogConfig) -> Map<String, Value> {
    let mut groups: Vec<(&str, Vec<&Distribution>)> = Vec::new();
    for dist in distributions {
        match groups.iter_mut().find(|(key, _)| *key == dist.relation_key) {
            Some((_, members)) => members.push(dist),
            None => groups.push((dist.relation_key.as_str(), vec![dist])),
        }
    }

    let mut out = Map::new();
    for (key, members) in groups {
        let value = match members.as_slice() {
            [only] if only.label.is_none() => Value::String(only.url.clone()),
            _ => Value::Array(
                members
                    .iter()
                    .map(|d| {
                        let mut link = Map::new();
                        link.insert("url".to_string(), Value::String(d.url.clone()));
                        if let Some(label) = &d.label {
                            link.insert("label".to_string(), Value::String(label.clone()));
                        }
                        Value::Object(link)
                    })
                    .collect(),
            ),
        };
        out.insert(config.relation_uri_for(key), value);
    }
    out
}

/// Serialized `dct_references_s` text, or `None` when there is nothing to say
pub fn references_text(distributions: &[Distribution], config: &CatalogConfig) -> Result<Option<String>> {
    if distributions.is_empty() {
        return Ok(None);
    }
    let grouped = group_distributions(distributions, config);
    Ok(Some(serde_json::to_string(&Value::Object(grouped))?))
}
