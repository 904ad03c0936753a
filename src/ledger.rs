//! Migration progress ledger.
//!
//! The ledger keeps one [`OutcomeEntry`] per legacy identifier and routes
//! every migration condition into the matching bucket. It is idempotent:
//! starting the same record twice or recording the same condition twice
//! never produces duplicate rows, so an unchanged dump re-run yields an
//! identical report.
//!
//! The report file is a JSON array of entries. Each write goes to its own
//! temporary file in the report's directory and is renamed into place, so
//! readers never observe a half-written report.

use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::{ErrorKind, MigrationError, Priority, Result, Stage};

/// Lifecycle of an entry within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    /// No error recorded
    #[default]
    Clean,
    /// At least one error recorded; never returns to `Clean` within a run
    Errored,
}

/// Context of one recorded condition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    /// Field (tag key, file name, ...)
    pub field: String,
    /// Subfield code
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subfield: Option<char>,
    /// Offending value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Explanation
    #[serde(default)]
    pub message: String,
    /// Stage that raised it
    #[serde(default)]
    pub stage: Stage,
    /// Severity
    #[serde(default)]
    pub priority: Priority,
}

/// Outcome of one legacy record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeEntry {
    /// Legacy identifier
    pub legacy_id: String,
    /// No error recorded
    pub clean: bool,
    /// Mirror of `clean`
    #[serde(default)]
    pub status: EntryStatus,
    /// Highest severity seen
    #[serde(default)]
    pub priority: Priority,
    /// Needs a human to complete
    #[serde(default)]
    pub manual_migration: Vec<ErrorDetail>,
    /// Values that did not conform
    #[serde(default)]
    pub unexpected_value: Vec<ErrorDetail>,
    /// Required values that were absent
    #[serde(default)]
    pub missing_required_field: Vec<ErrorDetail>,
    /// Untransformed tag keys
    #[serde(default)]
    pub lost_data: Vec<String>,
    /// Best-effort guesses to confirm; do not affect `clean`
    #[serde(default)]
    pub curation: Vec<ErrorDetail>,
}

impl OutcomeEntry {
    fn new(legacy_id: &str) -> Self {
        OutcomeEntry {
            legacy_id: legacy_id.to_string(),
            clean: true,
            status: EntryStatus::Clean,
            priority: Priority::None,
            manual_migration: Vec::new(),
            unexpected_value: Vec::new(),
            missing_required_field: Vec::new(),
            lost_data: Vec::new(),
            curation: Vec::new(),
        }
    }

    fn mark_errored(&mut self, priority: Priority) {
        self.clean = false;
        self.status = EntryStatus::Errored;
        self.priority = self.priority.max(priority);
    }

    fn absorb(&mut self, other: OutcomeEntry) {
        if !other.clean {
            self.mark_errored(other.priority);
        }
        self.priority = self.priority.max(other.priority);
        push_all(&mut self.manual_migration, other.manual_migration);
        push_all(&mut self.unexpected_value, other.unexpected_value);
        push_all(&mut self.missing_required_field, other.missing_required_field);
        push_all(&mut self.lost_data, other.lost_data);
        push_all(&mut self.curation, other.curation);
    }
}

fn push_unique<T: PartialEq>(bucket: &mut Vec<T>, item: T) {
    if !bucket.contains(&item) {
        bucket.push(item);
    }
}

fn push_all<T: PartialEq>(bucket: &mut Vec<T>, items: Vec<T>) {
    for item in items {
        push_unique(bucket, item);
    }
}

fn detail(error: &MigrationError) -> ErrorDetail {
    match error {
        MigrationError::UnexpectedValue {
            field,
            subfield,
            value,
            message,
            stage,
            priority,
        } => ErrorDetail {
            field: field.clone(),
            subfield: *subfield,
            value: value.clone(),
            message: message.clone(),
            stage: *stage,
            priority: *priority,
        },
        MigrationError::MissingRequiredField {
            field,
            subfield,
            priority,
        } => ErrorDetail {
            field: field.clone(),
            subfield: *subfield,
            value: None,
            message: error.to_string(),
            stage: Stage::Transform,
            priority: *priority,
        },
        MigrationError::ManualImportRequired {
            field,
            value,
            message,
            stage,
            priority,
            ..
        } => ErrorDetail {
            field: field.clone(),
            subfield: None,
            value: value.clone(),
            message: message.clone(),
            stage: *stage,
            priority: *priority,
        },
        MigrationError::RecordFlaggedCuration {
            field,
            value,
            message,
        } => ErrorDetail {
            field: field.clone(),
            subfield: None,
            value: value.clone(),
            message: message.clone(),
            stage: Stage::Transform,
            priority: Priority::None,
        },
        other => ErrorDetail {
            field: String::new(),
            subfield: None,
            value: None,
            message: other.to_string(),
            stage: Stage::Transform,
            priority: other.priority(),
        },
    }
}

/// Which entries a page listing includes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntryFilter {
    /// Every entry
    #[default]
    All,
    /// Clean entries only
    Clean,
    /// Errored entries only
    Errored,
    /// Entries whose highest priority is exactly this
    Priority(Priority),
}

impl EntryFilter {
    /// Whether `entry` passes the filter.
    #[must_use]
    pub fn matches(self, entry: &OutcomeEntry) -> bool {
        match self {
            EntryFilter::All => true,
            EntryFilter::Clean => entry.clean,
            EntryFilter::Errored => !entry.clean,
            EntryFilter::Priority(priority) => entry.priority == priority,
        }
    }
}

/// Aggregate counts for operator dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LedgerStats {
    /// Entries with critical priority
    pub critical: usize,
    /// Entries with warning priority
    pub warning: usize,
    /// Clean entries
    pub migrated: usize,
    /// Errored entries
    pub errored: usize,
}

/// One page of entries.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerPage<'a> {
    /// Entries of this page
    pub entries: Vec<&'a OutcomeEntry>,
    /// Entries matching the filter
    pub total: usize,
    /// 1-based page number
    pub page: usize,
    /// Page size
    pub per_page: usize,
    /// Aggregate counts over the whole ledger
    pub stats: LedgerStats,
}

/// Per-record migration outcomes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationLedger {
    entries: IndexMap<String, OutcomeEntry>,
}

impl MigrationLedger {
    /// Create an empty ledger
    #[must_use]
    pub fn new() -> Self {
        MigrationLedger::default()
    }

    /// Load a report file; a missing file yields an empty ledger.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let ledger = MigrationLedger::parse_report(read_report(path)?.as_deref())?;
        tracing::debug!(path = %path.display(), entries = ledger.len(), "report loaded");
        Ok(ledger)
    }

    fn parse_report(raw: Option<&str>) -> Result<Self> {
        let mut ledger = MigrationLedger::new();
        if let Some(raw) = raw {
            let entries: Vec<OutcomeEntry> = serde_json::from_str(raw)?;
            for entry in entries {
                ledger.upsert(entry);
            }
        }
        Ok(ledger)
    }

    fn render(&self) -> Result<String> {
        let entries: Vec<&OutcomeEntry> = self.entries.values().collect();
        Ok(serde_json::to_string_pretty(&entries)?)
    }

    /// Write the report atomically, replacing whatever the file held.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        stage(path, &self.render()?)?
            .persist(path)
            .map_err(|e| e.error)?;
        tracing::debug!(path = %path.display(), entries = self.len(), "report saved");
        Ok(())
    }

    /// Upsert this ledger's entries into the on-disk report.
    ///
    /// Entries held here replace the stored entry with the same legacy id;
    /// every other stored entry is kept. Workers running over disjoint
    /// record subsets share one report this way. The report is re-read
    /// right before the rename, and again after it; the merge starts over
    /// if another writer replaced it in between or dropped these entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the report cannot be read, parsed or written, or
    /// if it kept changing for every attempt.
    pub fn save_merged(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        for attempt in 1..=MERGE_ATTEMPTS {
            let before = read_report(path)?;
            let mut merged = MigrationLedger::parse_report(before.as_deref())?;
            for entry in self.entries.values() {
                merged.entries.insert(entry.legacy_id.clone(), entry.clone());
            }
            let staged = stage(path, &merged.render()?)?;

            if read_report(path)? == before {
                staged.persist(path).map_err(|e| e.error)?;
                if self.is_contained_in(&MigrationLedger::load(path)?) {
                    tracing::debug!(
                        path = %path.display(),
                        entries = merged.len(),
                        attempt,
                        "report merged"
                    );
                    return Ok(());
                }
            }
            tracing::debug!(
                path = %path.display(),
                attempt,
                "report changed during merge, retrying"
            );
        }
        Err(MigrationError::Io(io::Error::new(
            io::ErrorKind::Other,
            format!("report {} kept changing during merge", path.display()),
        )))
    }

    fn is_contained_in(&self, other: &MigrationLedger) -> bool {
        self.entries
            .iter()
            .all(|(id, entry)| other.entries.get(id) == Some(entry))
    }

    fn upsert(&mut self, entry: OutcomeEntry) {
        match self.entries.get_mut(&entry.legacy_id) {
            Some(existing) => existing.absorb(entry),
            None => {
                self.entries.insert(entry.legacy_id.clone(), entry);
            },
        }
    }

    fn entry_mut(&mut self, legacy_id: &str) -> &mut OutcomeEntry {
        self.entries
            .entry(legacy_id.to_string())
            .or_insert_with(|| OutcomeEntry::new(legacy_id))
    }

    /// Create a clean entry for `legacy_id` unless one exists.
    pub fn record_started(&mut self, legacy_id: &str) {
        self.entry_mut(legacy_id);
    }

    /// Route a migration condition into the entry for `legacy_id`.
    ///
    /// Curation notes are recorded without affecting `clean`.
    ///
    /// # Errors
    ///
    /// Infrastructure errors are not migration conditions; they are handed
    /// back unchanged so the caller cannot lose them.
    pub fn record_error(&mut self, legacy_id: &str, error: MigrationError) -> Result<()> {
        let kind = error.kind();
        if kind == ErrorKind::Infrastructure {
            return Err(error);
        }

        let entry = self.entry_mut(legacy_id);
        let item = detail(&error);
        match kind {
            ErrorKind::UnexpectedValue => push_unique(&mut entry.unexpected_value, item),
            ErrorKind::MissingRequiredField => push_unique(&mut entry.missing_required_field, item),
            ErrorKind::ManualImportRequired => push_unique(&mut entry.manual_migration, item),
            ErrorKind::RecordFlaggedCuration => {
                push_unique(&mut entry.curation, item);
                return Ok(());
            },
            ErrorKind::LossyConversion | ErrorKind::Infrastructure => {
                if let MigrationError::LossyConversion { missing } = &error {
                    for tag in missing {
                        push_unique(&mut entry.lost_data, tag.clone());
                    }
                }
            },
        }
        entry.mark_errored(error.priority());
        tracing::debug!(legacy_id, %error, "condition recorded");
        Ok(())
    }

    /// Entry for `legacy_id`.
    #[must_use]
    pub fn entries_for(&self, legacy_id: &str) -> Option<&OutcomeEntry> {
        self.entries.get(legacy_id)
    }

    /// Whether `legacy_id` has an entry.
    #[must_use]
    pub fn contains(&self, legacy_id: &str) -> bool {
        self.entries.contains_key(legacy_id)
    }

    /// Drop the entry of one record so it can be retried from `NEW`.
    pub fn forget(&mut self, legacy_id: &str) -> Option<OutcomeEntry> {
        self.entries.shift_remove(legacy_id)
    }

    /// Start a new full run.
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    /// Merge another ledger, entry by entry.
    pub fn merge(&mut self, other: MigrationLedger) {
        for (_, entry) in other.entries {
            self.upsert(entry);
        }
    }

    /// Entries in first-seen order.
    pub fn entries(&self) -> impl Iterator<Item = &OutcomeEntry> {
        self.entries.values()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the ledger is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Aggregate counts.
    #[must_use]
    pub fn stats(&self) -> LedgerStats {
        let mut stats = LedgerStats::default();
        for entry in self.entries.values() {
            if entry.clean {
                stats.migrated += 1;
            } else {
                stats.errored += 1;
            }
            match entry.priority {
                Priority::Critical => stats.critical += 1,
                Priority::Warning => stats.warning += 1,
                Priority::None => {},
            }
        }
        stats
    }

    /// One page of entries matching `filter`; `page` is 1-based.
    #[must_use]
    pub fn page(&self, page: usize, per_page: usize, filter: EntryFilter) -> LedgerPage<'_> {
        let page = page.max(1);
        let per_page = per_page.max(1);
        let matching: Vec<&OutcomeEntry> =
            self.entries.values().filter(|e| filter.matches(e)).collect();
        let total = matching.len();
        let entries = matching
            .into_iter()
            .skip((page - 1) * per_page)
            .take(per_page)
            .collect();

        LedgerPage {
            entries,
            total,
            page,
            per_page,
            stats: self.stats(),
        }
    }

    /// Untransformed tags across the whole ledger.
    #[must_use]
    pub fn lost_tags(&self) -> BTreeSet<&str> {
        self.entries
            .values()
            .flat_map(|e| e.lost_data.iter().map(String::as_str))
            .collect()
    }
}

const MERGE_ATTEMPTS: u32 = 8;

fn read_report(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(Some(raw)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write `body` to a fresh temporary file next to `path`.
fn stage(path: &Path, body: &str) -> Result<NamedTempFile> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir)?;
    let mut staged = NamedTempFile::new_in(dir)?;
    staged.write_all(body.as_bytes())?;
    staged.as_file().sync_all()?;
    Ok(staged)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_started_is_idempotent() {
        let mut ledger = MigrationLedger::new();
        ledger.record_started("1");
        ledger.record_started("1");
        assert_eq!(ledger.len(), 1);
        assert!(ledger.entries_for("1").unwrap().clean);
    }

    #[test]
    fn test_routing_into_buckets() {
        let mut ledger = MigrationLedger::new();
        ledger
            .record_error(
                "1",
                MigrationError::unexpected(Some('c'), Some("x"), "bad").in_field("260__"),
            )
            .unwrap();
        ledger
            .record_error("1", MigrationError::missing(Some('a')).in_field("245__"))
            .unwrap();
        ledger
            .record_error("1", MigrationError::manual(Some("f.pdf"), "checksum mismatch"))
            .unwrap();
        ledger
            .record_error(
                "1",
                MigrationError::LossyConversion {
                    missing: ["999__".to_string()].into_iter().collect(),
                },
            )
            .unwrap();

        let entry = ledger.entries_for("1").unwrap();
        assert!(!entry.clean);
        assert_eq!(entry.status, EntryStatus::Errored);
        assert_eq!(entry.unexpected_value.len(), 1);
        assert_eq!(entry.missing_required_field.len(), 1);
        assert_eq!(entry.manual_migration.len(), 1);
        assert_eq!(entry.lost_data, vec!["999__"]);
        assert_eq!(entry.priority, Priority::Critical);
    }

    #[test]
    fn test_curation_keeps_entry_clean() {
        let mut ledger = MigrationLedger::new();
        ledger
            .record_error("1", MigrationError::curation("269__", Some("2001"), "first date kept"))
            .unwrap();
        let entry = ledger.entries_for("1").unwrap();
        assert!(entry.clean);
        assert_eq!(entry.curation.len(), 1);
    }

    #[test]
    fn test_infrastructure_error_propagates() {
        let mut ledger = MigrationLedger::new();
        let result = ledger.record_error("1", MigrationError::Configuration("x".into()));
        assert!(matches!(result, Err(MigrationError::Configuration(_))));
    }

    #[test]
    fn test_errored_never_returns_to_clean() {
        let mut ledger = MigrationLedger::new();
        ledger
            .record_error("1", MigrationError::missing(Some('a')))
            .unwrap();
        ledger.record_started("1");
        ledger
            .record_error("1", MigrationError::curation("x", None, "note"))
            .unwrap();
        assert!(!ledger.entries_for("1").unwrap().clean);
    }

    #[test]
    fn test_same_error_twice_is_not_duplicated() {
        let mut ledger = MigrationLedger::new();
        for _ in 0..2 {
            ledger
                .record_error(
                    "1",
                    MigrationError::unexpected(Some('a'), Some("v"), "m").in_field("100__"),
                )
                .unwrap();
        }
        assert_eq!(ledger.entries_for("1").unwrap().unexpected_value.len(), 1);
    }

    #[test]
    fn test_page_and_stats() {
        let mut ledger = MigrationLedger::new();
        for id in 1..=5 {
            ledger.record_started(&id.to_string());
        }
        ledger.record_error("2", MigrationError::missing(None)).unwrap();
        ledger
            .record_error("4", MigrationError::manual(None, "dup pid"))
            .unwrap();

        let stats = ledger.stats();
        assert_eq!(stats.migrated, 3);
        assert_eq!(stats.errored, 2);
        assert_eq!(stats.warning, 1);
        assert_eq!(stats.critical, 1);

        let page = ledger.page(2, 2, EntryFilter::All);
        assert_eq!(page.total, 5);
        let ids: Vec<_> = page.entries.iter().map(|e| e.legacy_id.as_str()).collect();
        assert_eq!(ids, vec!["3", "4"]);

        let errored = ledger.page(1, 10, EntryFilter::Errored);
        assert_eq!(errored.total, 2);
        let critical = ledger.page(1, 10, EntryFilter::Priority(Priority::Critical));
        assert_eq!(critical.entries[0].legacy_id, "4");
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");

        let mut ledger = MigrationLedger::new();
        ledger.record_started("1");
        ledger
            .record_error(
                "2",
                MigrationError::unexpected(Some('a'), Some("x"), "bad").in_field("041__"),
            )
            .unwrap();
        ledger.save(&path).unwrap();

        let loaded = MigrationLedger::load(&path).unwrap();
        assert_eq!(loaded, ledger);
        assert!(MigrationLedger::load(dir.path().join("missing.json")).unwrap().is_empty());
    }

    #[test]
    fn test_save_merged_keeps_other_workers_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");

        let mut first = MigrationLedger::new();
        first.record_started("1");
        first.save_merged(&path).unwrap();

        let mut second = MigrationLedger::new();
        second.record_error("2", MigrationError::missing(None)).unwrap();
        second.save_merged(&path).unwrap();

        let merged = MigrationLedger::load(&path).unwrap();
        assert_eq!(merged.len(), 2);
        assert!(merged.entries_for("1").unwrap().clean);
        assert!(!merged.entries_for("2").unwrap().clean);
    }

    #[test]
    fn test_save_merged_replaces_own_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");

        let mut earlier = MigrationLedger::new();
        earlier.record_error("1", MigrationError::missing(Some('a')).in_field("100__")).unwrap();
        earlier.record_started("2");
        earlier.save(&path).unwrap();

        let mut rerun = MigrationLedger::new();
        rerun.record_started("1");
        rerun.save_merged(&path).unwrap();

        let merged = MigrationLedger::load(&path).unwrap();
        assert_eq!(
            merged.entries().map(|e| e.legacy_id.as_str()).collect::<Vec<_>>(),
            vec!["1", "2"]
        );
        assert!(merged.entries_for("1").unwrap().clean);
        assert!(merged.entries_for("1").unwrap().missing_required_field.is_empty());
    }

    #[test]
    fn test_save_leaves_no_temporary_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let mut ledger = MigrationLedger::new();
        ledger.record_started("1");
        ledger.save(&path).unwrap();
        ledger.save_merged(&path).unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("report.json")]);
    }
}
