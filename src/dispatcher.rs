//! Rule dispatch over one revision's structured MARC.
//!
//! [`dispatch`] visits every tag key of a [`MarcBlob`] in source order,
//! invokes the handlers of every matching [`Rule`](crate::rules::Rule) and
//! merges their output into an [`Accumulator`]. Errors raised by a handler
//! are contained at that single call: they are collected and dispatch moves
//! on to the next occurrence.
//!
//! After the walk, every key is classified as matched, ignored or unmatched;
//! the caller decides whether unmatched keys amount to a lossy conversion.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{MigrationError, Result};
use crate::record::{MarcBlob, Occurrence};
use crate::rules::{Handler, HandlerOutcome, Merge, Model, Rule};

/// In-progress output document of one revision.
///
/// Handlers receive it by mutable reference, so a handler can read keys
/// written by tags processed earlier and write auxiliary keys besides its
/// rule's output key.
#[derive(Debug, Default)]
pub struct Accumulator {
    values: IndexMap<String, Value>,
    notes: Vec<MigrationError>,
}

impl Accumulator {
    /// Create an empty accumulator
    #[must_use]
    pub fn new() -> Self {
        Accumulator::default()
    }

    /// Value currently stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Whether `key` holds a value.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Overwrite `key`.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    /// Push `value` onto the list under `key`, creating the list if needed.
    ///
    /// A scalar already stored under `key` becomes the first list element.
    pub fn append(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let slot = self.values.entry(key.into()).or_insert_with(|| Value::Array(Vec::new()));
        if !slot.is_array() {
            let previous = slot.take();
            *slot = Value::Array(vec![previous]);
        }
        if let Value::Array(items) = slot {
            items.push(value.into());
        }
    }

    /// Push every element of `values` onto the list under `key`.
    pub fn extend<I>(&mut self, key: impl Into<String>, values: I)
    where
        I: IntoIterator<Item = Value>,
    {
        let key = key.into();
        for value in values {
            self.append(key.clone(), value);
        }
    }

    /// Remove and return the value under `key`.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.shift_remove(key)
    }

    /// Record a best-effort decision a curator should confirm.
    pub fn flag_curation(&mut self, field: &str, value: Option<&str>, message: impl Into<String>) {
        self.notes.push(MigrationError::curation(field, value, message));
    }

    /// Keep a curation note produced elsewhere (e.g. by a vocabulary lookup).
    pub fn push_note(&mut self, note: MigrationError) {
        self.notes.push(note);
    }

    /// Curation notes recorded so far.
    #[must_use]
    pub fn notes(&self) -> &[MigrationError] {
        &self.notes
    }

    fn merge(&mut self, key: &str, value: Value, mode: Merge) {
        match (mode, value) {
            (Merge::Replace, value) => self.set(key, value),
            (Merge::Append, value) => self.append(key, value),
            (Merge::Extend, Value::Array(items)) => self.extend(key, items),
            (Merge::Extend, value) => self.append(key, value),
        }
    }

    /// Freeze into the finished document, returning the curation notes alongside.
    #[must_use]
    pub fn finalize(self) -> (Document, Vec<MigrationError>) {
        let map: Map<String, Value> = self.values.into_iter().collect();
        (Document(map), self.notes)
    }
}

/// Finished, immutable output document.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Document(Map<String, Value>);

impl Document {
    /// Value under a top-level key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Top-level keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// Whether the document is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The document as a JSON object.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    /// Pretty JSON rendering.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.0)?)
    }
}

/// Outcome of dispatching one revision.
#[derive(Debug)]
pub struct Dispatch {
    /// The finished document
    pub document: Document,
    /// Contained handler errors, in the order they were raised
    pub errors: Vec<MigrationError>,
    /// Curation notes (success with a note)
    pub notes: Vec<MigrationError>,
    /// Keys matched by at least one rule
    pub matched: BTreeSet<String>,
    /// Keys without a rule but in the ignore set
    pub ignored: BTreeSet<String>,
    /// Keys without a rule and not ignored
    pub unmatched: BTreeSet<String>,
}

impl Dispatch {
    /// Whether any source tag was left untransformed.
    #[must_use]
    pub fn is_lossy(&self) -> bool {
        !self.unmatched.is_empty()
    }

    /// The lossy-conversion condition for this revision, if any.
    #[must_use]
    pub fn lossy_error(&self) -> Option<MigrationError> {
        self.is_lossy().then(|| MigrationError::LossyConversion {
            missing: self.unmatched.clone(),
        })
    }
}

fn contain(
    acc: &mut Accumulator,
    errors: &mut Vec<MigrationError>,
    rule: &Rule,
    key: &str,
    result: Result<HandlerOutcome>,
) {
    match result {
        Ok(HandlerOutcome::Written(value)) => acc.merge(rule.output_key(), value, rule.merge()),
        Ok(HandlerOutcome::Dropped) => {},
        Err(MigrationError::RecordFlaggedCuration { field, value, message }) => {
            let field = if field.is_empty() { key.to_string() } else { field };
            acc.notes.push(MigrationError::RecordFlaggedCuration { field, value, message });
        },
        Err(error) => {
            let error = error.in_field(key);
            tracing::warn!(
                tag = %key,
                output = %rule.output_key(),
                %error,
                "handler error contained"
            );
            errors.push(error);
        },
    }
}

fn run_rule(
    acc: &mut Accumulator,
    errors: &mut Vec<MigrationError>,
    rule: &Rule,
    key: &str,
    occurrences: &[Occurrence],
) {
    match rule.handler() {
        Handler::PerOccurrence(handler) => {
            for occurrence in occurrences {
                if !rule.accepts(occurrence) {
                    tracing::trace!(
                        tag = %key,
                        output = %rule.output_key(),
                        "required subfields absent, skipped"
                    );
                    continue;
                }
                let result = handler(acc, key, occurrence);
                contain(acc, errors, rule, key, result);
            }
        },
        Handler::CollectAll(handler) => {
            let accepted: Vec<Occurrence> = occurrences
                .iter()
                .filter(|occurrence| rule.accepts(occurrence))
                .cloned()
                .collect();
            if accepted.is_empty() {
                return;
            }
            let result = handler(acc, key, &accepted);
            contain(acc, errors, rule, key, result);
        },
    }
}

/// Run `model` over `blob`.
///
/// Keys are visited in first-appearance order and occurrences in source
/// order; rules matching the same key run in registration order.
#[must_use]
pub fn dispatch(model: &Model, blob: &MarcBlob) -> Dispatch {
    let mut acc = Accumulator::new();
    let mut errors = Vec::new();
    let mut matched = BTreeSet::new();
    let mut ignored = BTreeSet::new();
    let mut unmatched = BTreeSet::new();

    for (key, occurrences) in blob.iter() {
        let mut any = false;
        for rule in model.rules_for(key) {
            any = true;
            tracing::debug!(
                model = %model.name(),
                tag = %key,
                output = %rule.output_key(),
                "dispatching"
            );
            run_rule(&mut acc, &mut errors, rule, key, occurrences);
        }

        if any {
            matched.insert(key.to_string());
        } else if model.ignores_occurrences(key, occurrences) {
            ignored.insert(key.to_string());
        } else {
            unmatched.insert(key.to_string());
        }
    }

    let (document, notes) = acc.finalize();
    Dispatch {
        document,
        errors,
        notes,
        matched,
        ignored,
        unmatched,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cleaners::clean_str;
    use crate::record::SubfieldMap;
    use serde_json::json;

    fn data(pairs: &[(char, &str)]) -> SubfieldMap {
        pairs.iter().map(|(c, v)| (*c, *v)).collect()
    }

    fn name_rule(key: &str, pattern: &str) -> Rule {
        Rule::new(key, pattern, |_, _, occ| {
            let map = occ
                .subfields()
                .ok_or_else(|| MigrationError::unexpected(None, None, "control field"))?;
            Ok(clean_str('a', map, true)?.map_or(HandlerOutcome::Dropped, HandlerOutcome::written))
        })
        .append()
        .requires(&['a'])
    }

    #[test]
    fn test_append_preserves_source_order() {
        let model = Model::builder("m").rule(name_rule("contributors", "700__")).build().unwrap();
        let mut blob = MarcBlob::new();
        for name in ["A", "B", "C"] {
            blob.add_data("700", ' ', ' ', data(&[('a', name)]));
        }

        let out = dispatch(&model, &blob);
        assert_eq!(out.document.get("contributors"), Some(&json!(["A", "B", "C"])));
        assert!(out.errors.is_empty());
        assert!(!out.is_lossy());
    }

    #[test]
    fn test_requires_skips_silently() {
        let model = Model::builder("m").rule(name_rule("contributors", "700__")).build().unwrap();
        let mut blob = MarcBlob::new();
        blob.add_data("700", ' ', ' ', data(&[('u', "CERN")]));

        let out = dispatch(&model, &blob);
        assert!(out.document.get("contributors").is_none());
        assert!(out.errors.is_empty());
        assert!(out.matched.contains("700__"));
    }

    #[test]
    fn test_error_is_contained_per_occurrence() {
        let model = Model::builder("m").rule(name_rule("contributors", "700__")).build().unwrap();
        let mut blob = MarcBlob::new();
        blob.add_data("700", ' ', ' ', data(&[('a', "A"), ('a', "A2")]));
        blob.add_data("700", ' ', ' ', data(&[('a', "B")]));

        let out = dispatch(&model, &blob);
        assert_eq!(out.document.get("contributors"), Some(&json!(["B"])));
        assert_eq!(out.errors.len(), 1);
        assert_eq!(out.errors[0].field(), Some("700__"));
    }

    #[test]
    fn test_unmatched_and_ignored_classification() {
        let model = Model::builder("m")
            .rule(name_rule("contributors", "700__"))
            .ignore(["005"])
            .build()
            .unwrap();
        let mut blob = MarcBlob::new();
        blob.add_control("005", "20200101");
        blob.add_data("999", ' ', ' ', data(&[('a', "x")]));

        let out = dispatch(&model, &blob);
        assert!(out.ignored.contains("005"));
        assert_eq!(out.unmatched.iter().collect::<Vec<_>>(), vec!["999__"]);
        assert!(matches!(
            out.lossy_error(),
            Some(MigrationError::LossyConversion { ref missing }) if missing.len() == 1
        ));
    }

    #[test]
    fn test_subfield_level_ignore() {
        let model = Model::builder("m")
            .ignore(["999C5[xy]"])
            .build()
            .unwrap();
        let mut covered = MarcBlob::new();
        covered.add_data("999", 'C', '5', data(&[('x', "citation"), ('y', "2001")]));
        covered.add_data("999", 'C', '5', data(&[('y', "2002")]));
        let out = dispatch(&model, &covered);
        assert!(out.ignored.contains("999C5"));
        assert!(!out.is_lossy());

        let mut partly = MarcBlob::new();
        partly.add_data("999", 'C', '5', data(&[('x', "citation"), ('a', "kept")]));
        let out = dispatch(&model, &partly);
        assert_eq!(out.unmatched.iter().collect::<Vec<_>>(), vec!["999C5"]);
    }

    #[test]
    fn test_handlers_see_earlier_output() {
        let model = Model::builder("m")
            .rule(Rule::new("title", "245__", |_, _, _| Ok(HandlerOutcome::written("Main"))))
            .rule(Rule::new("description", "520__", |acc, _, _| {
                let title = acc.get("title").and_then(Value::as_str).unwrap_or("none");
                Ok(HandlerOutcome::written(format!("about {title}")))
            }))
            .build()
            .unwrap();
        let mut blob = MarcBlob::new();
        blob.add_data("245", ' ', ' ', data(&[('a', "x")]));
        blob.add_data("520", ' ', ' ', data(&[('a', "y")]));

        let out = dispatch(&model, &blob);
        assert_eq!(out.document.get("description"), Some(&json!("about Main")));
    }

    #[test]
    fn test_collect_all_and_extend() {
        let model = Model::builder("m")
            .rule(
                Rule::collect("subjects", "65017", |_, _, occurrences| {
                    let all: Vec<Value> = occurrences
                        .iter()
                        .filter_map(Occurrence::subfields)
                        .filter_map(|m| m.first('a'))
                        .map(|s| json!(s))
                        .collect();
                    Ok(HandlerOutcome::Written(Value::Array(all)))
                })
                .extend(),
            )
            .build()
            .unwrap();
        let mut blob = MarcBlob::new();
        blob.add_data("650", '1', '7', data(&[('a', "Physics")]));
        blob.add_data("650", '1', '7', data(&[('a', "Computing")]));

        let out = dispatch(&model, &blob);
        assert_eq!(out.document.get("subjects"), Some(&json!(["Physics", "Computing"])));
    }

    #[test]
    fn test_curation_error_becomes_note() {
        let model = Model::builder("m")
            .rule(Rule::new("title", "245__", |_, _, _| {
                Err(MigrationError::curation("", Some("t"), "guessed"))
            }))
            .build()
            .unwrap();
        let mut blob = MarcBlob::new();
        blob.add_data("245", ' ', ' ', data(&[('a', "t")]));

        let out = dispatch(&model, &blob);
        assert!(out.errors.is_empty());
        assert_eq!(out.notes.len(), 1);
        assert_eq!(out.notes[0].field(), Some("245__"));
    }

    #[test]
    fn test_accumulator_append_wraps_scalar() {
        let mut acc = Accumulator::new();
        acc.set("k", "a");
        acc.append("k", "b");
        let (doc, _) = acc.finalize();
        assert_eq!(doc.get("k"), Some(&json!(["a", "b"])));
    }
}
