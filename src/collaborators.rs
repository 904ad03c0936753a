//! Interfaces to the systems around the migration engine.
//!
//! The target repository is reached through [`RecordStore`]: it takes a
//! finished [`Document`] and either persists it or rejects it. Controlled
//! vocabularies (affiliations, subjects, ...) are reached through
//! [`VocabularyLookup`]. Both are traits so runs can be wired to a real
//! service, a directory of JSON files, or an in-memory fake in tests.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;

use crate::dispatcher::Document;
use crate::error::{MigrationError, Priority, Stage};
use crate::versions::{AccessDecision, VersionGroup};

/// Context passed alongside a document to the store.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecordMetadata {
    /// Legacy identifier
    pub legacy_id: String,
    /// Model that produced the document
    pub model: String,
    /// Record-level access for metadata and files
    pub access: AccessDecision,
    /// Reconciled versions, oldest first
    pub versions: Vec<VersionGroup>,
}

/// Successful store call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreReceipt {
    /// Identifier assigned by the target repository
    pub persistent_id: String,
    /// Non-fatal remarks the store made about the document
    pub warnings: Vec<String>,
}

/// Rejection from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The document fails the target schema
    Validation(String),
    /// The record was already loaded
    Duplicate(String),
    /// The store could not be reached
    Unavailable(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Validation(msg) => write!(f, "validation failed: {msg}"),
            StoreError::Duplicate(msg) => write!(f, "duplicate record: {msg}"),
            StoreError::Unavailable(msg) => write!(f, "store unavailable: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Persistence service of the target repository.
pub trait RecordStore {
    /// Persist a finished document.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] when the document is rejected or the store
    /// cannot be reached.
    fn create(
        &mut self,
        document: &Document,
        metadata: &RecordMetadata,
    ) -> Result<StoreReceipt, StoreError>;
}

impl<S: RecordStore + ?Sized> RecordStore for &mut S {
    fn create(
        &mut self,
        document: &Document,
        metadata: &RecordMetadata,
    ) -> Result<StoreReceipt, StoreError> {
        (**self).create(document, metadata)
    }
}

/// Load one document and translate the store's answer into migration conditions.
///
/// Receipt warnings become curation notes. A rejection becomes
/// `ManualImportRequired` in the load stage: critical for validation and
/// duplicate errors, warning when the store is unavailable.
///
/// # Errors
///
/// Returns the `ManualImportRequired` condition when the store rejects the document.
pub fn load_record(
    store: &mut dyn RecordStore,
    document: &Document,
    metadata: &RecordMetadata,
) -> Result<(StoreReceipt, Vec<MigrationError>), MigrationError> {
    match store.create(document, metadata) {
        Ok(receipt) => {
            tracing::debug!(
                legacy_id = %metadata.legacy_id,
                id = %receipt.persistent_id,
                "record loaded"
            );
            let notes = receipt
                .warnings
                .iter()
                .map(|w| MigrationError::curation("store", None, w.clone()))
                .collect();
            Ok((receipt, notes))
        },
        Err(err) => {
            let priority = match err {
                StoreError::Validation(_) | StoreError::Duplicate(_) => Priority::Critical,
                StoreError::Unavailable(_) => Priority::Warning,
            };
            tracing::warn!(legacy_id = %metadata.legacy_id, error = %err, "store rejected record");
            Err(MigrationError::ManualImportRequired {
                field: "store".into(),
                value: None,
                message: err.to_string(),
                stage: Stage::Load,
                priority,
                recid: Some(metadata.legacy_id.clone()),
            })
        },
    }
}

/// Store keeping documents in memory, keyed by legacy identifier.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    records: IndexMap<String, (Value, RecordMetadata)>,
}

impl InMemoryRecordStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored document of a legacy record.
    #[must_use]
    pub fn get(&self, legacy_id: &str) -> Option<&Value> {
        self.records.get(legacy_id).map(|(document, _)| document)
    }

    /// Structural metadata a legacy record was stored with.
    #[must_use]
    pub fn metadata(&self, legacy_id: &str) -> Option<&RecordMetadata> {
        self.records.get(legacy_id).map(|(_, metadata)| metadata)
    }

    /// Number of stored records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing was stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl RecordStore for InMemoryRecordStore {
    fn create(
        &mut self,
        document: &Document,
        metadata: &RecordMetadata,
    ) -> Result<StoreReceipt, StoreError> {
        if self.records.contains_key(&metadata.legacy_id) {
            return Err(StoreError::Duplicate(metadata.legacy_id.clone()));
        }
        self.records
            .insert(metadata.legacy_id.clone(), (document.to_value(), metadata.clone()));
        Ok(StoreReceipt {
            persistent_id: format!("mem-{}", self.records.len()),
            warnings: Vec::new(),
        })
    }
}

/// Store writing one `<id>.json` file per record into a directory.
///
/// Documents without a `title` are rejected as invalid.
#[derive(Debug, Clone)]
pub struct DirectoryRecordStore {
    root: PathBuf,
}

impl DirectoryRecordStore {
    /// Store rooted at `root`; the directory is created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DirectoryRecordStore { root: root.into() }
    }

    /// Directory the store writes to.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, legacy_id: &str) -> PathBuf {
        self.root.join(format!("{legacy_id}.json"))
    }
}

impl RecordStore for DirectoryRecordStore {
    fn create(
        &mut self,
        document: &Document,
        metadata: &RecordMetadata,
    ) -> Result<StoreReceipt, StoreError> {
        match document.get("title") {
            Some(Value::String(title)) if !title.is_empty() => {},
            _ => return Err(StoreError::Validation("title is required".into())),
        }

        let path = self.path_for(&metadata.legacy_id);
        if path.exists() {
            return Err(StoreError::Duplicate(path.display().to_string()));
        }

        let body = serde_json::json!({
            "legacy_id": metadata.legacy_id,
            "model": metadata.model,
            "access": metadata.access,
            "metadata": document,
            "versions": metadata.versions,
        });
        let rendered =
            serde_json::to_string_pretty(&body).map_err(|e| StoreError::Validation(e.to_string()))?;

        fs::create_dir_all(&self.root).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        fs::write(&path, rendered).map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let mut warnings = Vec::new();
        if metadata.versions.iter().all(|v| v.files.is_empty()) {
            warnings.push("record has no files".to_string());
        }
        Ok(StoreReceipt {
            persistent_id: metadata.legacy_id.clone(),
            warnings,
        })
    }
}

/// A vocabulary entry proposed for a term.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    /// Vocabulary identifier
    pub id: String,
    /// Preferred label
    pub label: String,
    /// Similarity in `[0, 1]`
    pub score: f64,
    /// The service marked this candidate as the exact match
    pub chosen: bool,
}

/// Lookup failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupError {
    /// Worth retrying (timeout, rate limit)
    Transient(String),
    /// Retrying will not help
    Permanent(String),
}

impl fmt::Display for LookupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LookupError::Transient(msg) => write!(f, "transient lookup failure: {msg}"),
            LookupError::Permanent(msg) => write!(f, "lookup failure: {msg}"),
        }
    }
}

impl std::error::Error for LookupError {}

/// Controlled vocabulary matching service.
pub trait VocabularyLookup: Send + Sync {
    /// Candidates for `term` in `vocabulary`, best first.
    ///
    /// # Errors
    ///
    /// Returns a [`LookupError`] if the service fails.
    fn lookup(&self, vocabulary: &str, term: &str) -> Result<Vec<Candidate>, LookupError>;
}

/// Retry and acceptance policy for [`resolve_term`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LookupPolicy {
    /// Retries after the first transient failure
    pub retries: u32,
    /// Minimum score accepted as a (flagged) match
    pub curation_threshold: f64,
}

impl Default for LookupPolicy {
    fn default() -> Self {
        LookupPolicy {
            retries: 3,
            curation_threshold: 0.9,
        }
    }
}

/// Outcome of resolving one term.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Exact or chosen match
    Matched(Candidate),
    /// Accepted by score; a curator should confirm
    MatchedFlagged(Candidate),
    /// Kept as free text
    Unmatched(String),
}

impl Resolution {
    /// JSON form: `{"id": ..}` for matches, `{"name": ..}` for free text.
    #[must_use]
    pub fn to_value(&self) -> Value {
        match self {
            Resolution::Matched(c) | Resolution::MatchedFlagged(c) => {
                serde_json::json!({ "id": c.id })
            },
            Resolution::Unmatched(text) => serde_json::json!({ "name": text }),
        }
    }
}

/// Resolve `term` against `vocabulary`.
///
/// Returns the resolution and, for flagged or unmatched terms, the curation
/// note attributed to `field`. Transient failures are retried
/// `policy.retries` times; a term that still cannot be looked up is kept as
/// free text.
pub fn resolve_term(
    lookup: &dyn VocabularyLookup,
    vocabulary: &str,
    term: &str,
    field: &str,
    policy: &LookupPolicy,
) -> (Resolution, Option<MigrationError>) {
    let mut attempt = 0;
    let candidates = loop {
        match lookup.lookup(vocabulary, term) {
            Ok(candidates) => break Some(candidates),
            Err(LookupError::Transient(msg)) if attempt < policy.retries => {
                attempt += 1;
                tracing::debug!(vocabulary, term, attempt, error = %msg, "retrying lookup");
            },
            Err(err) => {
                tracing::warn!(vocabulary, term, error = %err, "lookup failed");
                break None;
            },
        }
    };

    let unmatched = |message: &str| {
        (
            Resolution::Unmatched(term.to_string()),
            Some(MigrationError::curation(field, Some(term), message)),
        )
    };

    let Some(candidates) = candidates else {
        return unmatched("vocabulary lookup failed, kept as free text");
    };

    if let Some(exact) = candidates
        .iter()
        .find(|c| c.chosen || c.label.eq_ignore_ascii_case(term))
    {
        return (Resolution::Matched(exact.clone()), None);
    }

    match candidates.iter().find(|c| c.score >= policy.curation_threshold) {
        Some(best) => (
            Resolution::MatchedFlagged(best.clone()),
            Some(MigrationError::curation(
                field,
                Some(term),
                format!("matched {} ({}) with score {:.2}", best.id, best.label, best.score),
            )),
        ),
        None => unmatched(&format!("no {vocabulary} match, kept as free text")),
    }
}
