//! Template/data separation, data diffing and document rebuilding.
//!
//! A document marks its dynamic regions with paired comments:
//!
//! ```text
//! <!--sonicdiff-NAME--> ... <!--sonicdiff-NAME-end-->
//! ```
//!
//! The `<title>` element is always treated as a region named `title`.
//! Separation swaps every region for a `{NAME}` placeholder and records the
//! region's full original text under the key `"{NAME}"`, so merging the two
//! parts reproduces the input byte for byte. Region names are word
//! characters only and regions do not nest.
//!
//! Everything here is pure; persistence belongs to the caller.

use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;

use crate::Error;
use crate::cache::hash::content_hash;

/// Structured data of a document: `"{NAME}"` to region text.
pub type DataMap = serde_json::Map<String, Value>;

static REGION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)<!--sonicdiff-(\w+)-->.*?<!--sonicdiff-(\w+)-end-->|<title>.*?</title>")
        .unwrap_or_else(|e| panic!("invalid region pattern: {e}"))
});

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\w+\}").unwrap_or_else(|e| panic!("invalid placeholder pattern: {e}")));

/// A document split into template and data.
#[derive(Debug, Clone, PartialEq)]
pub struct Separated {
    pub template: String,
    pub data: DataMap,
}

/// A rebuilt document with its content hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedDocument {
    pub html: String,
    pub hash: String,
}

/// Split `html` into a template and its data regions.
///
/// # Errors
///
/// `Error::SplitHtml` when the document has no regions, a region's end
/// marker names a different region, a region name repeats, or the
/// document already contains one of the placeholders.
pub fn separate(html: &str) -> Result<Separated, Error> {
    let mut data = DataMap::new();
    let mut template = String::with_capacity(html.len());
    let mut last = 0;

    for caps in REGION.captures_iter(html) {
        let whole = caps.get(0).map(|m| (m.start(), m.end(), m.as_str())).unwrap_or_default();
        let name = region_name(&caps)?;
        let placeholder = format!("{{{name}}}");

        if data.contains_key(&placeholder) {
            return Err(Error::SplitHtml(format!("duplicate region '{name}'")));
        }
        if html.contains(&placeholder) {
            return Err(Error::SplitHtml(format!("document already contains '{placeholder}'")));
        }

        template.push_str(&html[last..whole.0]);
        template.push_str(&placeholder);
        data.insert(placeholder, Value::String(whole.2.to_string()));
        last = whole.1;
    }

    if data.is_empty() {
        return Err(Error::SplitHtml("no dynamic regions found".into()));
    }
    template.push_str(&html[last..]);

    Ok(Separated { template, data })
}

fn region_name(caps: &Captures<'_>) -> Result<String, Error> {
    match (caps.get(1), caps.get(2)) {
        (Some(open), Some(close)) if open.as_str() == close.as_str() => Ok(open.as_str().to_string()),
        (Some(open), Some(close)) => Err(Error::SplitHtml(format!(
            "region '{}' closed by '{}'",
            open.as_str(),
            close.as_str()
        ))),
        _ => Ok("title".to_string()),
    }
}

/// Entries of `fresh` that are new or differ from `cached`.
///
/// Returns `None` when nothing changed.
pub fn diff(cached: &DataMap, fresh: &DataMap) -> Option<DataMap> {
    let patch: DataMap = fresh
        .iter()
        .filter(|(k, v)| cached.get(*k) != Some(*v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    if patch.is_empty() { None } else { Some(patch) }
}

/// `cached` with every entry of `update` applied on top.
pub fn overlay(cached: &DataMap, update: &DataMap) -> DataMap {
    let mut merged = cached.clone();
    for (k, v) in update {
        merged.insert(k.clone(), v.clone());
    }
    merged
}

/// Parse a data-update response body of the form `{"data": {...}}`.
///
/// # Errors
///
/// `Error::MergeDiff` if the body is not JSON or lacks a `data` object.
pub fn parse_update(body: &[u8]) -> Result<DataMap, Error> {
    let value: Value = serde_json::from_slice(body).map_err(|e| Error::MergeDiff(format!("invalid JSON: {e}")))?;
    match value {
        Value::Object(mut obj) => match obj.remove("data") {
            Some(Value::Object(data)) => Ok(data),
            _ => Err(Error::MergeDiff("missing 'data' object".into())),
        },
        _ => Err(Error::MergeDiff("body is not a JSON object".into())),
    }
}

/// Rebuild a document by filling the template's placeholders from `data`.
///
/// Placeholders without a data entry are left as they are.
///
/// # Errors
///
/// `Error::BuildHtml` if the result is empty.
pub fn merge(template: &str, data: &DataMap) -> Result<MergedDocument, Error> {
    let html = PLACEHOLDER
        .replace_all(template, |caps: &Captures<'_>| {
            let placeholder = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
            match data.get(placeholder) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) => String::new(),
                Some(other) => other.to_string(),
                None => placeholder.to_string(),
            }
        })
        .into_owned();

    if html.is_empty() {
        return Err(Error::BuildHtml("merged document is empty".into()));
    }

    let hash = content_hash(html.as_bytes());
    Ok(MergedDocument { html, hash })
}
