//! Theses: the documents model plus defence information and supervisors.

use serde_json::{json, Map, Value};

use crate::cleaners::clean_str;
use crate::dispatcher::Accumulator;
use crate::error::{MigrationError, Result};
use crate::record::Occurrence;
use crate::rules::{HandlerOutcome, HandlerResult, Model, Rule};

use super::documents::{collections, creatibutor, parse_date, subfields};

fn thesis_information(acc: &mut Accumulator, key: &str, occurrence: &Occurrence) -> HandlerResult {
    let map = subfields(occurrence)?;
    let mut info = Map::new();

    if let Some(degree) = clean_str('a', map, false)? {
        info.insert("type".into(), Value::String(degree));
    }
    let Some(university) = clean_str('b', map, true)? else {
        return Ok(HandlerOutcome::Dropped);
    };
    info.insert("university".into(), Value::String(university));

    if let Some(raw) = clean_str('c', map, false)? {
        let (date, exact) = parse_date(&raw).ok_or_else(|| {
            MigrationError::unexpected(Some('c'), Some(&raw), "unrecognised date")
        })?;
        if !exact {
            acc.flag_curation(
                key,
                Some(&raw),
                format!("defence year {date} extracted from free text"),
            );
        }
        info.insert("defense_date".into(), Value::String(date));
    }
    Ok(HandlerOutcome::Written(Value::Object(info)))
}

fn thesis_resource_type(
    _acc: &mut Accumulator,
    _key: &str,
    occurrences: &[Occurrence],
) -> HandlerResult {
    collections(occurrences)?;
    Ok(HandlerOutcome::written(json!({"id": "publication-thesis"})))
}

/// Build the thesis model on top of `base`.
///
/// # Errors
///
/// Returns [`MigrationError::Configuration`] if the rule table is inconsistent.
pub fn thesis_model(base: &Model) -> Result<Model> {
    Model::builder("thesis")
        .extend(base)
        .rule(Rule::collect("resource_type", "980__", thesis_resource_type).overriding())
        .rule(Rule::new("thesis_information", "502__", thesis_information))
        .rule(
            Rule::new("contributors", "701__", |acc, key, occ| {
                creatibutor(acc, key, occ, Some("supervisor"), None)
            })
            .append()
            .requires(&['a']),
        )
        .build()
}
