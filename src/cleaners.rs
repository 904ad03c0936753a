//! Typed cleaning of raw subfield values.
//!
//! Rule handlers never read raw subfield strings directly; they go through
//! [`clean_val`] (or one of the typed wrappers) which trims and normalises
//! text, coerces it to the expected type, and signals every problem through
//! the error taxonomy instead of falling back to silent defaults.
//!
//! # Examples
//!
//! ```ignore
//! use cds_migrator::cleaners::{clean_str, clean_strs};
//! use cds_migrator::record::SubfieldMap;
//!
//! let map: SubfieldMap = [('a', "  Doe,   Jane "), ('u', "CERN"), ('u', "MIT")]
//!     .into_iter()
//!     .collect();
//!
//! assert_eq!(clean_str('a', &map, true)?, Some("Doe, Jane".to_string()));
//! assert_eq!(clean_strs('u', &map)?, vec!["CERN", "MIT"]);
//! # Ok::<(), cds_migrator::MigrationError>(())
//! ```

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use unicode_normalization::UnicodeNormalization;

use crate::error::{MigrationError, Result};
use crate::record::{SubfieldMap, SubfieldValue};

lazy_static! {
    static ref WHITESPACE_RUN: Regex = Regex::new(r"\s+").unwrap();
    static ref EMAIL: Regex = Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").unwrap();
}

/// Type a subfield value is expected to have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    /// Trimmed, normalised text
    String,
    /// `true/false/yes/no/y/n/1/0`
    Bool,
    /// Signed integer
    Int,
}

/// Case transformation applied to cleaned strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    /// Lowercase
    Lower,
    /// Uppercase
    Upper,
    /// First letter of every word uppercased
    Title,
}

/// A single cleaned value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scalar {
    /// Text
    Str(String),
    /// Boolean
    Bool(bool),
    /// Integer
    Int(i64),
}

impl From<Scalar> for Value {
    fn from(scalar: Scalar) -> Self {
        match scalar {
            Scalar::Str(s) => Value::String(s),
            Scalar::Bool(b) => Value::Bool(b),
            Scalar::Int(i) => Value::from(i),
        }
    }
}

/// Result of cleaning one subfield.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cleaned {
    /// `multiple = false`
    One(Scalar),
    /// `multiple = true`; always a list, even for one occurrence
    Many(Vec<Scalar>),
}

impl From<Cleaned> for Value {
    fn from(cleaned: Cleaned) -> Self {
        match cleaned {
            Cleaned::One(scalar) => scalar.into(),
            Cleaned::Many(scalars) => Value::Array(scalars.into_iter().map(Value::from).collect()),
        }
    }
}

/// Options for [`clean_val`].
#[derive(Debug, Clone, Default)]
pub struct CleanOptions {
    /// A missing or empty value is an error unless `default` is set
    pub required: bool,
    /// Accept repeated subfields and always return a list
    pub multiple: bool,
    /// Value used when the subfield is missing or empty
    pub default: Option<Scalar>,
    /// Every cleaned string must match this pattern
    pub regex: Option<Regex>,
    /// Case transformation for strings
    pub transform: Option<Transform>,
    /// Raise `ManualImportRequired` instead of `MissingRequiredField`
    pub manual: bool,
}

impl CleanOptions {
    /// Options for an optional single value.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the value as required.
    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    /// Accept repeated subfields.
    #[must_use]
    pub fn multiple(mut self) -> Self {
        self.multiple = true;
        self
    }

    /// Fallback value for a missing subfield.
    #[must_use]
    pub fn default_value(mut self, default: Scalar) -> Self {
        self.default = Some(default);
        self
    }

    /// Require every value to match `regex`.
    #[must_use]
    pub fn matching(mut self, regex: Regex) -> Self {
        self.regex = Some(regex);
        self
    }

    /// Apply a case transformation.
    #[must_use]
    pub fn transform(mut self, transform: Transform) -> Self {
        self.transform = Some(transform);
        self
    }

    /// Escalate a missing required value to manual import.
    #[must_use]
    pub fn manual(mut self) -> Self {
        self.manual = true;
        self
    }
}

/// Trim, NFC-normalise and collapse inner whitespace.
#[must_use]
pub fn normalize_text(raw: &str) -> String {
    let composed: String = raw.nfc().collect();
    WHITESPACE_RUN.replace_all(composed.trim(), " ").into_owned()
}

fn apply_transform(value: String, transform: Option<Transform>) -> String {
    match transform {
        None => value,
        Some(Transform::Lower) => value.to_lowercase(),
        Some(Transform::Upper) => value.to_uppercase(),
        Some(Transform::Title) => value
            .split(' ')
            .map(|word| {
                let mut chars = word.chars();
                match chars.next() {
                    Some(first) => first
                        .to_uppercase()
                        .chain(chars.flat_map(char::to_lowercase))
                        .collect(),
                    None => String::new(),
                }
            })
            .collect::<Vec<String>>()
            .join(" "),
    }
}

fn coerce(code: char, raw: &str, ty: ValueType, opts: &CleanOptions) -> Result<Option<Scalar>> {
    let text = normalize_text(raw);
    if text.is_empty() {
        return Ok(None);
    }

    match ty {
        ValueType::String => {
            let text = apply_transform(text, opts.transform);
            if let Some(regex) = &opts.regex {
                if !regex.is_match(&text) {
                    return Err(MigrationError::unexpected(
                        Some(code),
                        Some(raw),
                        format!("value does not match format {}", regex.as_str()),
                    ));
                }
            }
            Ok(Some(Scalar::Str(text)))
        },
        ValueType::Int => text.parse::<i64>().map(|i| Some(Scalar::Int(i))).map_err(|_| {
            MigrationError::unexpected(Some(code), Some(raw), "expected an integer")
        }),
        ValueType::Bool => match text.to_lowercase().as_str() {
            "true" | "yes" | "y" | "1" => Ok(Some(Scalar::Bool(true))),
            "false" | "no" | "n" | "0" => Ok(Some(Scalar::Bool(false))),
            _ => Err(MigrationError::unexpected(
                Some(code),
                Some(raw),
                "expected a boolean",
            )),
        },
    }
}

fn missing_error(code: char, opts: &CleanOptions) -> MigrationError {
    if opts.manual {
        MigrationError::manual(None, format!("missing required subfield ${code}"))
    } else {
        MigrationError::missing(Some(code))
    }
}

/// Clean one subfield of one tag occurrence.
///
/// Returns `Ok(None)` for an absent optional value. With `multiple` the
/// result is always [`Cleaned::Many`]; empty items are dropped.
///
/// # Errors
///
/// - `UnexpectedValue` if the subfield is repeated and `multiple` is false,
///   or a value cannot be coerced, or it fails the `regex` check
/// - `MissingRequiredField` (or `ManualImportRequired` with `manual`) if
///   `required` is set, the value is missing or empty and no default exists
pub fn clean_val(
    code: char,
    container: &SubfieldMap,
    ty: ValueType,
    opts: &CleanOptions,
) -> Result<Option<Cleaned>> {
    let raw = container.get(code);

    if let (Some(value @ SubfieldValue::Repeated(_)), false) = (raw, opts.multiple) {
        let joined = value.values().collect::<Vec<_>>().join(" | ");
        return Err(MigrationError::unexpected(
            Some(code),
            Some(&joined),
            "subfield is repeated but a single value is expected",
        ));
    }

    let cleaned = match raw {
        None => Vec::new(),
        Some(value) => value
            .values()
            .map(|v| coerce(code, v, ty, opts))
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .flatten()
            .collect(),
    };

    let cleaned = if cleaned.is_empty() {
        match (&opts.default, opts.required) {
            (Some(default), _) => vec![default.clone()],
            (None, true) => return Err(missing_error(code, opts)),
            (None, false) => Vec::new(),
        }
    } else {
        cleaned
    };

    if opts.multiple {
        Ok(Some(Cleaned::Many(cleaned)))
    } else {
        Ok(cleaned.into_iter().next().map(Cleaned::One))
    }
}

/// Clean a single string subfield.
///
/// # Errors
///
/// See [`clean_val`].
pub fn clean_str(code: char, container: &SubfieldMap, required: bool) -> Result<Option<String>> {
    let opts = if required {
        CleanOptions::new().required()
    } else {
        CleanOptions::new()
    };
    match clean_val(code, container, ValueType::String, &opts)? {
        Some(Cleaned::One(Scalar::Str(s))) => Ok(Some(s)),
        _ => Ok(None),
    }
}

/// Clean a repeatable string subfield into a list.
///
/// # Errors
///
/// See [`clean_val`].
pub fn clean_strs(code: char, container: &SubfieldMap) -> Result<Vec<String>> {
    match clean_val(code, container, ValueType::String, &CleanOptions::new().multiple())? {
        Some(Cleaned::Many(values)) => Ok(values
            .into_iter()
            .filter_map(|v| match v {
                Scalar::Str(s) => Some(s),
                _ => None,
            })
            .collect()),
        _ => Ok(Vec::new()),
    }
}

/// Clean a single integer subfield.
///
/// # Errors
///
/// See [`clean_val`].
pub fn clean_int(code: char, container: &SubfieldMap, required: bool) -> Result<Option<i64>> {
    let opts = if required {
        CleanOptions::new().required()
    } else {
        CleanOptions::new()
    };
    match clean_val(code, container, ValueType::Int, &opts)? {
        Some(Cleaned::One(Scalar::Int(i))) => Ok(Some(i)),
        _ => Ok(None),
    }
}

/// Clean a single boolean subfield.
///
/// # Errors
///
/// See [`clean_val`].
pub fn clean_bool(code: char, container: &SubfieldMap, required: bool) -> Result<Option<bool>> {
    let opts = if required {
        CleanOptions::new().required()
    } else {
        CleanOptions::new()
    };
    match clean_val(code, container, ValueType::Bool, &opts)? {
        Some(Cleaned::One(Scalar::Bool(b))) => Ok(Some(b)),
        _ => Ok(None),
    }
}

/// Clean a single e-mail address subfield, lowercased.
///
/// # Errors
///
/// `UnexpectedValue` if the value is not shaped like an address.
pub fn clean_email(code: char, container: &SubfieldMap) -> Result<Option<String>> {
    let opts = CleanOptions::new()
        .transform(Transform::Lower)
        .matching(EMAIL.clone());
    match clean_val(code, container, ValueType::String, &opts)? {
        Some(Cleaned::One(Scalar::Str(s))) => Ok(Some(s)),
        _ => Ok(None),
    }
}

/// Keep only the values matching `pattern`, normalised.
pub fn filter_values<'a, I>(values: I, pattern: &Regex) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    values
        .into_iter()
        .map(normalize_text)
        .filter(|v| !v.is_empty() && pattern.is_match(v))
        .collect()
}
