//! Rules of the general documents model.
//!
//! Every other model starts from [`base_model`] and overrides what its
//! collection does differently.

use std::sync::Arc;

use chrono::NaiveDate;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{json, Map, Value};

use crate::cleaners::{
    clean_email, clean_str, clean_strs, clean_val, CleanOptions, Cleaned, Scalar, Transform,
    ValueType,
};
use crate::collaborators::{resolve_term, LookupPolicy, VocabularyLookup};
use crate::dispatcher::Accumulator;
use crate::error::{MigrationError, Result};
use crate::record::{Occurrence, SubfieldMap};
use crate::rules::{HandlerOutcome, HandlerResult, Model, Rule};

lazy_static! {
    static ref LANGUAGE: Regex = Regex::new(r"^[a-z]{2,3}$").unwrap();
    static ref ISO_DATE: Regex = Regex::new(r"^\d{4}(?:-\d{2}(?:-\d{2})?)?$").unwrap();
    static ref EMBEDDED_YEAR: Regex = Regex::new(r"\b(1[5-9]\d{2}|20\d{2})\b").unwrap();
    static ref PAGES: Regex = Regex::new(r"^(\d+)(?:\s*p\.?)?(?:\s|$)").unwrap();
    static ref LEGACY_FILE_URL: Regex =
        Regex::new(r"^https?://cds\.cern\.ch/record/\d+/files/").unwrap();
    static ref DOI: Regex = Regex::new(r"^10\.\d{4,9}/\S+$").unwrap();
}

/// Tag patterns dropped knowingly: system numbers, legacy admin fields,
/// holdings and collection bookkeeping.
pub const IGNORED: &[&str] = &[
    "003", "005", "008", "035__", "595..", "852..", "859__", "916__", "96[0-9]..", "970__", "981__",
];

/// Collection values mapped to resource types.
const RESOURCE_TYPES: &[(&str, &str)] = &[
    ("ARTICLE", "publication-article"),
    ("PREPRINT", "publication-preprint"),
    ("BOOK", "publication-book"),
    ("REPORT", "publication-report"),
    ("THESIS", "publication-thesis"),
    ("NOTE", "publication-technicalnote"),
    ("PRESENTATION", "presentation"),
];

/// Bibliographic (ISO 639-2/B) codes still found in legacy records.
const LANGUAGE_ALIASES: &[(&str, &str)] = &[
    ("fre", "fra"),
    ("ger", "deu"),
    ("cze", "ces"),
    ("dut", "nld"),
    ("chi", "zho"),
    ("en", "eng"),
    ("fr", "fra"),
    ("de", "deu"),
    ("it", "ita"),
    ("es", "spa"),
];

/// Data subfields of an occurrence, or an error for a control field.
pub(crate) fn subfields(occurrence: &Occurrence) -> Result<&SubfieldMap> {
    occurrence
        .subfields()
        .ok_or_else(|| {
            MigrationError::unexpected(None, occurrence.control_value(), "expected a data field")
        })
}

/// `{"type": "personal", "name", "family_name", "given_name"}` from `Family, Given`.
///
/// Collaboration names become organisations.
#[must_use]
pub fn person_or_org(name: &str) -> Value {
    if name.to_lowercase().ends_with("collaboration") {
        return json!({"type": "organizational", "name": name});
    }
    match name.split_once(',') {
        Some((family, given)) if !given.trim().is_empty() => json!({
            "type": "personal",
            "name": name,
            "family_name": family.trim(),
            "given_name": given.trim(),
        }),
        _ => json!({
            "type": "personal",
            "name": name,
            "family_name": name.trim_end_matches(',').trim(),
        }),
    }
}

/// Optional vocabulary resolution for affiliations.
#[derive(Clone)]
pub(crate) struct AffiliationLookup {
    pub(crate) lookup: Arc<dyn VocabularyLookup>,
    pub(crate) policy: LookupPolicy,
}

fn affiliations(
    acc: &mut Accumulator,
    key: &str,
    map: &SubfieldMap,
    lookup: Option<&AffiliationLookup>,
) -> Result<Vec<Value>> {
    let names = clean_strs('u', map)?;
    Ok(names
        .iter()
        .map(|name| match lookup {
            None => json!({"name": name}),
            Some(l) => {
                let (resolution, note) =
                    resolve_term(l.lookup.as_ref(), "affiliations", name, key, &l.policy);
                if let Some(note) = note {
                    acc.push_note(note);
                }
                resolution.to_value()
            },
        })
        .collect())
}

/// Build a creatibutor entry from a `100`/`700`-shaped occurrence.
pub(crate) fn creatibutor(
    acc: &mut Accumulator,
    key: &str,
    occurrence: &Occurrence,
    role: Option<&str>,
    lookup: Option<&AffiliationLookup>,
) -> HandlerResult {
    let map = subfields(occurrence)?;
    let Some(name) = clean_str('a', map, true)? else {
        return Ok(HandlerOutcome::Dropped);
    };

    let mut entry = Map::new();
    let mut person = person_or_org(&name);

    if let Some(email) = clean_email('m', map)? {
        if let Value::Object(p) = &mut person {
            p.insert("identifiers".into(), json!([{"scheme": "email", "identifier": email}]));
        }
    }
    entry.insert("person_or_org".into(), person);

    let affiliations = affiliations(acc, key, map, lookup)?;
    if !affiliations.is_empty() {
        entry.insert("affiliations".into(), Value::Array(affiliations));
    }

    let role = match role {
        Some(fixed) => Some(fixed.to_string()),
        None => clean_str('e', map, false)?.map(|r| r.to_lowercase()),
    };
    if let Some(role) = role {
        entry.insert("role".into(), json!({"id": role}));
    }

    Ok(HandlerOutcome::Written(Value::Object(entry)))
}

pub(crate) fn creator_rules(lookup: Option<AffiliationLookup>) -> [Rule; 2] {
    let first = lookup.clone();
    [
        Rule::new("creators", "100__", move |acc, key, occ| {
            creatibutor(acc, key, occ, None, first.as_ref())
        })
        .append()
        .requires(&['a']),
        Rule::new("contributors", "700__", move |acc, key, occ| {
            creatibutor(acc, key, occ, None, lookup.as_ref())
        })
        .append()
        .requires(&['a']),
    ]
}

/// Parse a legacy date into ISO form. The flag is false when only a year
/// could be extracted from free text.
pub(crate) fn parse_date(raw: &str) -> Option<(String, bool)> {
    let raw = raw.trim().trim_end_matches('.');
    if ISO_DATE.is_match(raw) {
        let valid = match raw.len() {
            4 => true,
            7 => NaiveDate::parse_from_str(&format!("{raw}-01"), "%Y-%m-%d").is_ok(),
            _ => NaiveDate::parse_from_str(raw, "%Y-%m-%d").is_ok(),
        };
        return valid.then(|| (raw.to_string(), true));
    }
    for format in ["%d %b %Y", "%d %B %Y", "%d/%m/%Y", "%Y%m%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return Some((date.format("%Y-%m-%d").to_string(), true));
        }
    }
    let mut years = EMBEDDED_YEAR.captures_iter(raw).filter_map(|c| c.get(1));
    match (years.next(), years.next()) {
        (Some(year), None) => Some((year.as_str().to_string(), false)),
        _ => None,
    }
}

fn publication_date(acc: &mut Accumulator, key: &str, occurrences: &[Occurrence]) -> HandlerResult {
    let mut dates: Vec<String> = Vec::new();
    for occurrence in occurrences {
        let map = subfields(occurrence)?;
        for raw in clean_strs('c', map)? {
            let (date, exact) = parse_date(&raw).ok_or_else(|| {
                MigrationError::unexpected(Some('c'), Some(&raw), "unrecognised date")
            })?;
            if !exact {
                acc.flag_curation(key, Some(&raw), format!("year {date} extracted from free text"));
            }
            if !dates.contains(&date) {
                dates.push(date);
            }
        }
    }

    let Some(earliest) = dates.iter().min().cloned() else {
        return Ok(HandlerOutcome::Dropped);
    };
    if dates.len() > 1 {
        acc.flag_curation(
            key,
            Some(&dates.join(" | ")),
            "conflicting publication dates, kept the earliest",
        );
    }

    match acc.get("publication_date").and_then(Value::as_str) {
        Some(existing) if existing == earliest => Ok(HandlerOutcome::Dropped),
        Some(existing) => {
            let kept = existing.to_string();
            acc.flag_curation(
                key,
                Some(&earliest),
                format!("publication date differs from {kept} found earlier, kept {kept}"),
            );
            Ok(HandlerOutcome::Dropped)
        },
        None => Ok(HandlerOutcome::written(earliest)),
    }
}

fn title(acc: &mut Accumulator, _key: &str, occurrence: &Occurrence) -> HandlerResult {
    let map = subfields(occurrence)?;
    let Some(title) = clean_str('a', map, true)? else {
        return Ok(HandlerOutcome::Dropped);
    };
    if let Some(existing) = acc.get("title").and_then(Value::as_str) {
        if existing != title {
            return Err(MigrationError::unexpected(
                Some('a'),
                Some(&title),
                "record has more than one main title",
            ));
        }
    }
    if let Some(subtitle) = clean_str('b', map, false)? {
        acc.append("additional_titles", json!({"title": subtitle, "type": {"id": "subtitle"}}));
    }
    Ok(HandlerOutcome::written(title))
}

fn alternative_title(_acc: &mut Accumulator, _key: &str, occurrence: &Occurrence) -> HandlerResult {
    let map = subfields(occurrence)?;
    Ok(clean_str('a', map, true)?.map_or(HandlerOutcome::Dropped, |t| {
        HandlerOutcome::written(json!({"title": t, "type": {"id": "alternative-title"}}))
    }))
}

fn languages(_acc: &mut Accumulator, _key: &str, occurrence: &Occurrence) -> HandlerResult {
    let map = subfields(occurrence)?;
    let opts = CleanOptions::new()
        .multiple()
        .transform(Transform::Lower)
        .matching(LANGUAGE.clone());
    let Some(Cleaned::Many(codes)) = clean_val('a', map, ValueType::String, &opts)? else {
        return Ok(HandlerOutcome::Dropped);
    };
    let codes: Vec<Value> = codes
        .into_iter()
        .filter_map(|code| match code {
            Scalar::Str(code) => Some(code),
            _ => None,
        })
        .map(|code| {
            let canonical = LANGUAGE_ALIASES
                .iter()
                .find(|(alias, _)| *alias == code)
                .map_or(code.clone(), |(_, iso)| (*iso).to_string());
            json!({"id": canonical})
        })
        .collect();
    if codes.is_empty() {
        return Ok(HandlerOutcome::Dropped);
    }
    Ok(HandlerOutcome::Written(Value::Array(codes)))
}

fn publisher(acc: &mut Accumulator, key: &str, occurrence: &Occurrence) -> HandlerResult {
    let map = subfields(occurrence)?;
    let Some(name) = clean_str('b', map, false)? else {
        return Ok(HandlerOutcome::Dropped);
    };
    if let Some(existing) = acc.get("publisher").and_then(Value::as_str) {
        if existing != name {
            let message = format!("second publisher ignored, kept {existing}");
            acc.flag_curation(key, Some(&name), message);
        }
        return Ok(HandlerOutcome::Dropped);
    }
    Ok(HandlerOutcome::written(name))
}

fn description(acc: &mut Accumulator, _key: &str, occurrence: &Occurrence) -> HandlerResult {
    let map = subfields(occurrence)?;
    let Some(text) = clean_str('a', map, true)? else {
        return Ok(HandlerOutcome::Dropped);
    };
    if acc.contains("description") {
        acc.append(
            "additional_descriptions",
            json!({"description": text, "type": {"id": "abstract"}}),
        );
        return Ok(HandlerOutcome::Dropped);
    }
    Ok(HandlerOutcome::written(text))
}

fn subject(_acc: &mut Accumulator, key: &str, occurrence: &Occurrence) -> HandlerResult {
    let map = subfields(occurrence)?;
    let Some(term) = clean_str('a', map, true)? else {
        return Ok(HandlerOutcome::Dropped);
    };
    let mut entry = json!({"subject": term});
    if key == "65017" {
        if let Some(scheme) = clean_str('2', map, false)? {
            entry["scheme"] = Value::String(scheme);
        }
    }
    Ok(HandlerOutcome::Written(entry))
}

fn related_identifier(
    _acc: &mut Accumulator,
    _key: &str,
    occurrence: &Occurrence,
) -> HandlerResult {
    let map = subfields(occurrence)?;
    let Some(url) = clean_str('u', map, true)? else {
        return Ok(HandlerOutcome::Dropped);
    };
    // attached files come from the dump's file list
    if LEGACY_FILE_URL.is_match(&url) {
        return Ok(HandlerOutcome::Dropped);
    }
    let mut entry = json!({
        "identifier": url,
        "scheme": "url",
        "relation_type": {"id": "references"}
    });
    if let Some(label) = clean_str('y', map, false)? {
        entry["description"] = Value::String(label);
    }
    Ok(HandlerOutcome::Written(entry))
}

fn report_number(_acc: &mut Accumulator, _key: &str, occurrence: &Occurrence) -> HandlerResult {
    let map = subfields(occurrence)?;
    Ok(clean_str('a', map, true)?.map_or(HandlerOutcome::Dropped, |number| {
        HandlerOutcome::written(json!({"identifier": number, "scheme": "cds_ref"}))
    }))
}

fn standard_identifier(
    _acc: &mut Accumulator,
    _key: &str,
    occurrence: &Occurrence,
) -> HandlerResult {
    let map = subfields(occurrence)?;
    let Some(value) = clean_str('a', map, true)? else {
        return Ok(HandlerOutcome::Dropped);
    };
    let scheme = clean_val(
        '2',
        map,
        ValueType::String,
        &CleanOptions::new().required().transform(Transform::Lower),
    )?;
    let Some(Cleaned::One(Scalar::Str(scheme))) = scheme else {
        return Err(MigrationError::missing(Some('2')));
    };
    if scheme == "doi" && !DOI.is_match(&value) {
        return Err(MigrationError::unexpected(Some('a'), Some(&value), "malformed DOI"));
    }
    Ok(HandlerOutcome::written(json!({"identifier": value, "scheme": scheme})))
}

fn pages(_acc: &mut Accumulator, _key: &str, occurrence: &Occurrence) -> HandlerResult {
    let map = subfields(occurrence)?;
    let Some(raw) = clean_str('a', map, false)? else {
        return Ok(HandlerOutcome::Dropped);
    };
    let count = PAGES
        .captures(&raw)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse::<u64>().ok())
        .ok_or_else(|| MigrationError::unexpected(Some('a'), Some(&raw), "expected a page count"))?;
    Ok(HandlerOutcome::written(count))
}

fn internal_note(_acc: &mut Accumulator, _key: &str, occurrence: &Occurrence) -> HandlerResult {
    let map = subfields(occurrence)?;
    Ok(clean_str('a', map, true)?.map_or(HandlerOutcome::Dropped, |note| {
        HandlerOutcome::written(json!({"note": note}))
    }))
}

/// Collection values of a `980` tag, uppercased. Deleted records need a human.
pub(crate) fn collections(occurrences: &[Occurrence]) -> Result<Vec<String>> {
    let mut found = Vec::new();
    for occurrence in occurrences {
        let map = subfields(occurrence)?;
        if let Some(flag) = clean_str('c', map, false)? {
            if flag.eq_ignore_ascii_case("DELETED") {
                return Err(MigrationError::manual(Some(&flag), "record is marked as deleted"));
            }
        }
        found.extend(clean_strs('a', map)?.into_iter().map(|c| c.to_uppercase()));
    }
    Ok(found)
}

fn resource_type(_acc: &mut Accumulator, _key: &str, occurrences: &[Occurrence]) -> HandlerResult {
    let found = collections(occurrences)?;
    let mapped = found.iter().find_map(|c| {
        RESOURCE_TYPES
            .iter()
            .find(|(name, _)| *name == c.as_str())
            .map(|(_, id)| *id)
    });
    match mapped {
        Some(id) => Ok(HandlerOutcome::written(json!({"id": id}))),
        None => Err(MigrationError::unexpected(
            Some('a'),
            Some(&found.join(" | ")),
            "no known collection to derive the resource type from",
        )),
    }
}

fn recid(_acc: &mut Accumulator, _key: &str, occurrence: &Occurrence) -> HandlerResult {
    let raw = occurrence
        .control_value()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| MigrationError::missing(None))?;
    if !raw.chars().all(|c| c.is_ascii_digit()) {
        return Err(MigrationError::unexpected(None, Some(raw), "record id must be numeric"));
    }
    Ok(HandlerOutcome::written(raw))
}

pub(crate) fn build(name: &str, lookup: Option<AffiliationLookup>) -> Result<Model> {
    let [creators, contributors] = creator_rules(lookup);
    Model::builder(name)
        .rule(Rule::new("recid", "001", recid))
        .rule(Rule::new("report_numbers", "037__|088__", report_number).append().requires(&['a']))
        .rule(Rule::new("identifiers", "0247_", standard_identifier).append().requires(&['a']))
        .rule(Rule::new("languages", "041__", languages).extend().requires(&['a']))
        .rule(creators)
        .rule(Rule::new("title", "245__", title).requires(&['a']))
        .rule(
            Rule::new("additional_titles", "246_[_3]", alternative_title)
                .append()
                .requires(&['a']),
        )
        .rule(Rule::collect("publication_date", "26[09]__", publication_date).requires(&['c']))
        .rule(Rule::new("publisher", "260__", publisher).requires(&['b']))
        .rule(Rule::new("number_of_pages", "300__", pages).requires(&['a']))
        .rule(Rule::new("internal_notes", "500__", internal_note).append().requires(&['a']))
        .rule(Rule::new("description", "520__", description).requires(&['a']))
        .rule(Rule::new("subjects", "65017|6531_", subject).append().requires(&['a']))
        .rule(contributors)
        .rule(
            Rule::new("related_identifiers", "8564_", related_identifier)
                .append()
                .requires(&['u']),
        )
        .rule(Rule::collect("resource_type", "980__", resource_type))
        .ignore(IGNORED.iter().copied())
        .build()
}

/// The documents model every other model extends.
///
/// # Errors
///
/// Returns [`MigrationError::Configuration`] if the rule table is inconsistent.
pub fn base_model() -> Result<Model> {
    build("documents", None)
}

/// The documents model with creator and contributor affiliations resolved
/// against a vocabulary.
///
/// # Errors
///
/// Returns [`MigrationError::Configuration`] if the rule table is inconsistent.
pub fn model_with_lookup(lookup: Arc<dyn VocabularyLookup>, policy: LookupPolicy) -> Result<Model> {
    let [creators, contributors] = creator_rules(Some(AffiliationLookup { lookup, policy }));
    Model::builder("documents")
        .extend(&base_model()?)
        .rule(creators.overriding())
        .rule(contributors.overriding())
        .build()
}
