//! Error types for migration operations.
//!
//! This module provides the [`MigrationError`] type and the [`Result`]
//! convenience type. `MigrationError` carries two families of variants:
//!
//! - **Migration conditions** raised while transforming one record
//!   (`UnexpectedValue`, `MissingRequiredField`, `ManualImportRequired`,
//!   `RecordFlaggedCuration`, `LossyConversion`). These are contained per
//!   tag by the dispatcher and routed into the ledger.
//! - **Infrastructure failures** (`InvalidMarc`, `InvalidDump`,
//!   `Configuration`, `Io`, `Json`) that abort the operation that hit them.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Severity of a migration condition.
///
/// Ordered so that `None < Warning < Critical`; the ledger keeps the highest
/// priority seen per record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Nothing to act on
    #[default]
    None,
    /// Recoverable by fixing a rule and re-running
    Warning,
    /// Needs a manual fix before the record can migrate
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Pipeline stage in which a condition was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Reading dump files and MARCXML payloads
    Extract,
    /// Rule dispatch
    #[default]
    Transform,
    /// Handing documents to the record store
    Load,
    /// File and version reconciliation
    Files,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Extract => write!(f, "extract"),
            Self::Transform => write!(f, "transform"),
            Self::Load => write!(f, "load"),
            Self::Files => write!(f, "files"),
        }
    }
}

/// Discriminant of a [`MigrationError`], used for ledger routing and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// See [`MigrationError::UnexpectedValue`]
    UnexpectedValue,
    /// See [`MigrationError::MissingRequiredField`]
    MissingRequiredField,
    /// See [`MigrationError::ManualImportRequired`]
    ManualImportRequired,
    /// See [`MigrationError::RecordFlaggedCuration`]
    RecordFlaggedCuration,
    /// See [`MigrationError::LossyConversion`]
    LossyConversion,
    /// Any infrastructure failure
    Infrastructure,
}

/// Error type for all migration operations.
#[derive(Error, Debug)]
pub enum MigrationError {
    /// A value is present but does not conform to the expected shape or vocabulary.
    #[error(
        "Unexpected value in {field}${}: {message} (value: {})",
        .subfield.map(String::from).unwrap_or_default(),
        .value.as_deref().unwrap_or("-")
    )]
    UnexpectedValue {
        /// Tag key being transformed (e.g. `"100__"`)
        field: String,
        /// Offending subfield code, if any
        subfield: Option<char>,
        /// Offending raw value, if any
        value: Option<String>,
        /// Human readable explanation
        message: String,
        /// Stage that raised it
        stage: Stage,
        /// Severity
        priority: Priority,
    },

    /// A required subfield is absent.
    #[error("Missing required field {field}${}", .subfield.map(String::from).unwrap_or_default())]
    MissingRequiredField {
        /// Tag key being transformed
        field: String,
        /// Missing subfield code, if the whole tag is not missing
        subfield: Option<char>,
        /// Severity
        priority: Priority,
    },

    /// The record migrated (or can migrate) but a human must complete it.
    #[error("Manual import required for {field}: {message}")]
    ManualImportRequired {
        /// Field or file concerned
        field: String,
        /// Value that triggered the condition
        value: Option<String>,
        /// Human readable explanation
        message: String,
        /// Stage that raised it
        stage: Stage,
        /// Severity
        priority: Priority,
        /// Legacy record identifier, when known at raise time
        recid: Option<String>,
    },

    /// A best-effort guess a curator should confirm. Not a failure.
    #[error("Flagged for curation in {field}: {message}")]
    RecordFlaggedCuration {
        /// Field concerned
        field: String,
        /// Value that was guessed or kept verbatim
        value: Option<String>,
        /// Human readable explanation
        message: String,
    },

    /// Tags present in the source had no matching rule.
    #[error(
        "Lossy conversion, untransformed tags: {}",
        .missing.iter().cloned().collect::<Vec<_>>().join(", ")
    )]
    LossyConversion {
        /// Tag keys with no rule and not in the ignore set
        missing: BTreeSet<String>,
    },

    /// The MARCXML payload of a revision could not be parsed.
    #[error("Invalid MARCXML: {0}")]
    InvalidMarc(String),

    /// The dump record itself is malformed.
    #[error("Invalid dump record: {0}")]
    InvalidDump(String),

    /// Model or runtime configuration is inconsistent.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error from the underlying source/destination.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MigrationError {
    /// Build an `UnexpectedValue` raised during transformation with warning priority.
    ///
    /// The field is left empty; the dispatcher fills it with the tag key.
    pub fn unexpected(
        subfield: Option<char>,
        value: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        MigrationError::UnexpectedValue {
            field: String::new(),
            subfield,
            value: value.map(str::to_string),
            message: message.into(),
            stage: Stage::Transform,
            priority: Priority::Warning,
        }
    }

    /// Build a `MissingRequiredField` for a subfield with warning priority.
    #[must_use]
    pub fn missing(subfield: Option<char>) -> Self {
        MigrationError::MissingRequiredField {
            field: String::new(),
            subfield,
            priority: Priority::Warning,
        }
    }

    /// Build a critical `ManualImportRequired` raised during transformation.
    pub fn manual(value: Option<&str>, message: impl Into<String>) -> Self {
        MigrationError::ManualImportRequired {
            field: String::new(),
            value: value.map(str::to_string),
            message: message.into(),
            stage: Stage::Transform,
            priority: Priority::Critical,
            recid: None,
        }
    }

    /// Build a curation note.
    pub fn curation(
        field: impl Into<String>,
        value: Option<&str>,
        message: impl Into<String>,
    ) -> Self {
        MigrationError::RecordFlaggedCuration {
            field: field.into(),
            value: value.map(str::to_string),
            message: message.into(),
        }
    }

    /// Kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::UnexpectedValue { .. } => ErrorKind::UnexpectedValue,
            Self::MissingRequiredField { .. } => ErrorKind::MissingRequiredField,
            Self::ManualImportRequired { .. } => ErrorKind::ManualImportRequired,
            Self::RecordFlaggedCuration { .. } => ErrorKind::RecordFlaggedCuration,
            Self::LossyConversion { .. } => ErrorKind::LossyConversion,
            Self::InvalidMarc(_)
            | Self::InvalidDump(_)
            | Self::Configuration(_)
            | Self::Io(_)
            | Self::Json(_) => ErrorKind::Infrastructure,
        }
    }

    /// Whether this is one of the per-record migration conditions.
    #[must_use]
    pub fn is_migration_condition(&self) -> bool {
        self.kind() != ErrorKind::Infrastructure
    }

    /// Severity of this error.
    #[must_use]
    pub fn priority(&self) -> Priority {
        match self {
            Self::UnexpectedValue { priority, .. }
            | Self::MissingRequiredField { priority, .. }
            | Self::ManualImportRequired { priority, .. } => *priority,
            Self::RecordFlaggedCuration { .. } => Priority::None,
            Self::LossyConversion { .. }
            | Self::InvalidMarc(_)
            | Self::InvalidDump(_)
            | Self::Configuration(_)
            | Self::Io(_)
            | Self::Json(_) => Priority::Critical,
        }
    }

    /// Replace the priority of a taxonomy condition. Other variants are returned unchanged.
    #[must_use]
    pub fn with_priority(mut self, new: Priority) -> Self {
        match &mut self {
            Self::UnexpectedValue { priority, .. }
            | Self::MissingRequiredField { priority, .. }
            | Self::ManualImportRequired { priority, .. } => *priority = new,
            _ => {},
        }
        self
    }

    /// Replace the stage of a condition that carries one.
    #[must_use]
    pub fn at_stage(mut self, new: Stage) -> Self {
        match &mut self {
            Self::UnexpectedValue { stage, .. } | Self::ManualImportRequired { stage, .. } => {
                *stage = new;
            },
            _ => {},
        }
        self
    }

    /// Fill an empty `field` with the tag key currently being dispatched.
    #[must_use]
    pub fn in_field(mut self, tag: &str) -> Self {
        match &mut self {
            Self::UnexpectedValue { field, .. }
            | Self::MissingRequiredField { field, .. }
            | Self::ManualImportRequired { field, .. }
            | Self::RecordFlaggedCuration { field, .. } => {
                if field.is_empty() {
                    *field = tag.to_string();
                }
            },
            _ => {},
        }
        self
    }

    /// Field the condition refers to, if any.
    #[must_use]
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::UnexpectedValue { field, .. }
            | Self::MissingRequiredField { field, .. }
            | Self::ManualImportRequired { field, .. }
            | Self::RecordFlaggedCuration { field, .. } => Some(field),
            _ => None,
        }
    }
}

/// Convenience type alias for [`std::result::Result`] with [`MigrationError`].
pub type Result<T> = std::result::Result<T, MigrationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::None < Priority::Warning);
        assert!(Priority::Warning < Priority::Critical);
        assert_eq!(Priority::Warning.max(Priority::Critical), Priority::Critical);
    }

    #[test]
    fn test_in_field_only_fills_empty() {
        let err = MigrationError::unexpected(Some('a'), Some("x"), "bad").in_field("100__");
        assert_eq!(err.field(), Some("100__"));

        let err = err.in_field("700__");
        assert_eq!(err.field(), Some("100__"));
    }

    #[test]
    fn test_kinds_and_priorities() {
        let lossy = MigrationError::LossyConversion {
            missing: ["999__".to_string()].into_iter().collect(),
        };
        assert_eq!(lossy.kind(), ErrorKind::LossyConversion);
        assert_eq!(lossy.priority(), Priority::Critical);
        assert!(lossy.is_migration_condition());

        let note = MigrationError::curation("245__", Some("t"), "guess");
        assert_eq!(note.priority(), Priority::None);

        let infra = MigrationError::Configuration("x".into());
        assert!(!infra.is_migration_condition());
    }

    #[test]
    fn test_display_messages() {
        let err =
            MigrationError::unexpected(Some('c'), Some("19xx"), "not a date").in_field("260__");
        assert_eq!(
            err.to_string(),
            "Unexpected value in 260__$c: not a date (value: 19xx)"
        );

        let lossy = MigrationError::LossyConversion {
            missing: ["999__".to_string(), "595__".to_string()].into_iter().collect(),
        };
        assert_eq!(lossy.to_string(), "Lossy conversion, untransformed tags: 595__, 999__");
    }

    #[test]
    fn test_with_priority_and_stage() {
        let err = MigrationError::unexpected(None, None, "x")
            .with_priority(Priority::Critical)
            .at_stage(Stage::Load);
        match err {
            MigrationError::UnexpectedValue { priority, stage, .. } => {
                assert_eq!(priority, Priority::Critical);
                assert_eq!(stage, Stage::Load);
            },
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
