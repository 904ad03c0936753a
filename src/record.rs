//! Structured MARC data for one revision.
//!
//! This module provides the in-memory shape the rule dispatcher works on:
//! - [`MarcBlob`]: ordered map from tag key to occurrences
//! - [`Occurrence`]: one physical control field or data field
//! - [`SubfieldMap`]: subfield code to [`SubfieldValue`]
//!
//! Tag keys follow the legacy convention: control fields are keyed by their
//! tag (`"001"`), data fields by tag plus both indicators with blanks written
//! as `_` (`"100__"`, `"8564_"`).
//!
//! # Examples
//!
//! ```ignore
//! use cds_migrator::record::{MarcBlob, SubfieldMap};
//!
//! let mut blob = MarcBlob::new();
//! blob.add_control("001", "12345");
//!
//! let mut subfields = SubfieldMap::new();
//! subfields.push('a', "Doe, Jane");
//! blob.add_data("100", ' ', ' ', subfields);
//!
//! assert_eq!(blob.keys().collect::<Vec<_>>(), vec!["001", "100__"]);
//! ```

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Value of one subfield code within one data field occurrence.
///
/// MARC subfields are repeatable: a code seen more than once in the same
/// data field becomes [`SubfieldValue::Repeated`], in source order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SubfieldValue {
    /// The code occurs once
    Single(String),
    /// The code occurs several times
    Repeated(Vec<String>),
}

impl SubfieldValue {
    /// Whether the code was repeated in the source.
    #[must_use]
    pub fn is_repeated(&self) -> bool {
        matches!(self, SubfieldValue::Repeated(_))
    }

    /// Iterate over every raw value, in source order.
    pub fn values(&self) -> impl Iterator<Item = &str> {
        let slice: &[String] = match self {
            SubfieldValue::Single(value) => std::slice::from_ref(value),
            SubfieldValue::Repeated(values) => values,
        };
        slice.iter().map(String::as_str)
    }

    /// First raw value.
    #[must_use]
    pub fn first(&self) -> Option<&str> {
        self.values().next()
    }

    fn push(&mut self, value: String) {
        match self {
            SubfieldValue::Single(existing) => {
                let first = std::mem::take(existing);
                *self = SubfieldValue::Repeated(vec![first, value]);
            },
            SubfieldValue::Repeated(values) => values.push(value),
        }
    }
}

/// Subfields of one data field occurrence, keyed by code in first-seen order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubfieldMap(IndexMap<char, SubfieldValue>);

impl SubfieldMap {
    /// Create an empty subfield map
    #[must_use]
    pub fn new() -> Self {
        SubfieldMap(IndexMap::new())
    }

    /// Add a subfield value; a repeated code turns into [`SubfieldValue::Repeated`].
    pub fn push(&mut self, code: char, value: impl Into<String>) {
        let value = value.into();
        match self.0.get_mut(&code) {
            Some(existing) => existing.push(value),
            None => {
                self.0.insert(code, SubfieldValue::Single(value));
            },
        }
    }

    /// Raw value for a code.
    #[must_use]
    pub fn get(&self, code: char) -> Option<&SubfieldValue> {
        self.0.get(&code)
    }

    /// First raw value for a code.
    #[must_use]
    pub fn first(&self, code: char) -> Option<&str> {
        self.0.get(&code).and_then(SubfieldValue::first)
    }

    /// Whether the code is present.
    #[must_use]
    pub fn contains(&self, code: char) -> bool {
        self.0.contains_key(&code)
    }

    /// Iterate over `(code, value)` pairs in first-seen order.
    pub fn iter(&self) -> impl Iterator<Item = (char, &SubfieldValue)> {
        self.0.iter().map(|(code, value)| (*code, value))
    }

    /// Subfield codes in first-seen order.
    pub fn codes(&self) -> impl Iterator<Item = char> + '_ {
        self.0.keys().copied()
    }

    /// Number of distinct codes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no subfields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(char, S)> for SubfieldMap {
    fn from_iter<I: IntoIterator<Item = (char, S)>>(iter: I) -> Self {
        let mut map = SubfieldMap::new();
        for (code, value) in iter {
            map.push(code, value);
        }
        map
    }
}

/// One physical occurrence of a tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Occurrence {
    /// Control field (001-009) value
    Control(String),
    /// Data field subfields
    Data(SubfieldMap),
}

impl Occurrence {
    /// Subfields of a data field occurrence.
    #[must_use]
    pub fn subfields(&self) -> Option<&SubfieldMap> {
        match self {
            Occurrence::Data(map) => Some(map),
            Occurrence::Control(_) => None,
        }
    }

    /// Value of a control field occurrence.
    #[must_use]
    pub fn control_value(&self) -> Option<&str> {
        match self {
            Occurrence::Control(value) => Some(value),
            Occurrence::Data(_) => None,
        }
    }

    /// Whether every code in `codes` is present. Control fields only satisfy an empty set.
    #[must_use]
    pub fn has_subfields(&self, codes: &[char]) -> bool {
        match self {
            Occurrence::Data(map) => codes.iter().all(|code| map.contains(*code)),
            Occurrence::Control(_) => codes.is_empty(),
        }
    }
}

/// Structured MARC of one revision: tag key → occurrences.
///
/// Keys are kept in first-appearance order and occurrences in source order,
/// which the dispatcher relies on for order-sensitive output fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarcBlob {
    /// Leader string, when the payload carried one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader: Option<String>,
    /// Tag key → occurrences
    pub tags: IndexMap<String, Vec<Occurrence>>,
}

/// Build the tag key of a data field: tag plus indicators, blanks as `_`.
#[must_use]
pub fn tag_key(tag: &str, ind1: char, ind2: char) -> String {
    let normalize = |c: char| if c == ' ' || c == '#' { '_' } else { c };
    format!("{tag}{}{}", normalize(ind1), normalize(ind2))
}

impl MarcBlob {
    /// Create an empty blob
    #[must_use]
    pub fn new() -> Self {
        MarcBlob::default()
    }

    /// Add a control field occurrence.
    pub fn add_control(&mut self, tag: impl Into<String>, value: impl Into<String>) {
        self.tags
            .entry(tag.into())
            .or_default()
            .push(Occurrence::Control(value.into()));
    }

    /// Add a data field occurrence under its tag key.
    pub fn add_data(&mut self, tag: &str, ind1: char, ind2: char, subfields: SubfieldMap) {
        self.tags
            .entry(tag_key(tag, ind1, ind2))
            .or_default()
            .push(Occurrence::Data(subfields));
    }

    /// Occurrences for a tag key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&[Occurrence]> {
        self.tags.get(key).map(Vec::as_slice)
    }

    /// Tag keys in first-appearance order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.tags.keys().map(String::as_str)
    }

    /// Iterate over `(key, occurrences)` in first-appearance order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[Occurrence])> {
        self.tags.iter().map(|(key, occ)| (key.as_str(), occ.as_slice()))
    }

    /// All values of one subfield across every occurrence of a key.
    pub fn subfield_values<'a>(&'a self, key: &str, code: char) -> impl Iterator<Item = &'a str> {
        self.tags
            .get(key)
            .into_iter()
            .flatten()
            .filter_map(Occurrence::subfields)
            .filter_map(move |map| map.get(code))
            .flat_map(SubfieldValue::values)
    }

    /// Number of distinct tag keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    /// Whether the blob has no tags.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_key_blank_indicators() {
        assert_eq!(tag_key("100", ' ', ' '), "100__");
        assert_eq!(tag_key("856", '4', ' '), "8564_");
        assert_eq!(tag_key("650", '1', '7'), "65017");
    }

    #[test]
    fn test_repeated_subfield_becomes_tuple() {
        let mut map = SubfieldMap::new();
        map.push('a', "one");
        map.push('b', "x");
        map.push('a', "two");

        assert_eq!(
            map.get('a'),
            Some(&SubfieldValue::Repeated(vec!["one".into(), "two".into()]))
        );
        assert_eq!(map.get('b'), Some(&SubfieldValue::Single("x".into())));
        assert_eq!(map.codes().collect::<Vec<_>>(), vec!['a', 'b']);
    }

    #[test]
    fn test_blob_preserves_order() {
        let mut blob = MarcBlob::new();
        blob.add_data("700", ' ', ' ', [('a', "A")].into_iter().collect());
        blob.add_control("001", "1");
        blob.add_data("700", ' ', ' ', [('a', "B")].into_iter().collect());

        assert_eq!(blob.keys().collect::<Vec<_>>(), vec!["700__", "001"]);
        assert_eq!(
            blob.subfield_values("700__", 'a').collect::<Vec<_>>(),
            vec!["A", "B"]
        );
    }

    #[test]
    fn test_has_subfields() {
        let data = Occurrence::Data([('a', "x")].into_iter().collect());
        assert!(data.has_subfields(&['a']));
        assert!(!data.has_subfields(&['a', 'u']));

        let control = Occurrence::Control("x".into());
        assert!(control.has_subfields(&[]));
        assert!(!control.has_subfields(&['a']));
    }
}
