//! Extract, transform and load of dump records with a persistent ledger.
//!
//! [`MigrationRunner`] processes records in chunks of
//! `checkpoint_interval`. Within a chunk the transform phase (revision
//! conversion and version reconciliation) is pure and may run on a `rayon`
//! pool; ledger updates, previews and store loads are then applied one
//! record at a time in input order. After every chunk this run's entries
//! are upserted into the report file, so an interrupted run never leaves a
//! half-processed record marked clean and runners over disjoint records
//! can share one report.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use serde_json::{json, Value};

use crate::collaborators::{load_record, RecordMetadata, RecordStore};
use crate::config::MigrationConfig;
use crate::dump::{read_dump_file, DumpRecord, DumpedRecord, RecordDumper};
use crate::error::{MigrationError, Priority, Result, Stage};
use crate::ledger::MigrationLedger;
use crate::models::ModelRegistry;
use crate::versions::{metadata_date, reconcile, AccessDecision, Reconciliation};

/// Counts of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunSummary {
    /// Records transformed in this run
    pub processed: usize,
    /// Records skipped because the report already had them
    pub skipped: usize,
    /// Processed records without errors
    pub clean: usize,
    /// Processed records with at least one error
    pub errored: usize,
    /// Records accepted by the store
    pub loaded: usize,
}

struct Transformed {
    legacy_id: String,
    outcome: Result<(DumpedRecord, Reconciliation)>,
}

fn transform(
    registry: &ModelRegistry,
    config: &MigrationConfig,
    record: &DumpRecord,
) -> Transformed {
    let outcome = RecordDumper::new(registry)
        .latest_only(config.latest_only)
        .tolerate_lossy(config.tolerate_lossy)
        .dump(record)
        .and_then(|dumped| {
            let fallback = dumped
                .document
                .get("publication_date")
                .and_then(Value::as_str)
                .and_then(metadata_date)
                .or(record.latest_revision()?.modified_at().map(|at| at.date()));
            let versions = reconcile(&record.files, record_access(config), fallback);
            Ok((dumped, versions))
        });
    Transformed {
        legacy_id: record.legacy_id.clone(),
        outcome,
    }
}

fn record_access(config: &MigrationConfig) -> AccessDecision {
    AccessDecision::uniform(config.record_access)
}

/// A payload or dump problem confined to one record.
fn extraction_failure(legacy_id: &str, error: &MigrationError) -> MigrationError {
    let field = match error {
        MigrationError::InvalidMarc(_) => "marcxml",
        _ => "record",
    };
    MigrationError::ManualImportRequired {
        field: field.into(),
        value: None,
        message: error.to_string(),
        stage: Stage::Extract,
        priority: Priority::Critical,
        recid: Some(legacy_id.to_string()),
    }
}

/// Drives a migration run.
pub struct MigrationRunner<'a> {
    config: MigrationConfig,
    registry: &'a ModelRegistry,
    store: Option<Box<dyn RecordStore + 'a>>,
    ledger: MigrationLedger,
    reported: HashSet<String>,
}

impl std::fmt::Debug for MigrationRunner<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationRunner")
            .field("config", &self.config)
            .field("registry", self.registry)
            .field("store", &self.store.is_some())
            .field("ledger", &self.ledger.len())
            .field("reported", &self.reported.len())
            .finish()
    }
}

impl<'a> MigrationRunner<'a> {
    /// Runner over `registry`.
    ///
    /// With `resume` the legacy ids of the existing report are remembered
    /// and skipped. The ledger itself only ever holds this run's records.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the report to
    /// resume from cannot be read.
    pub fn new(config: MigrationConfig, registry: &'a ModelRegistry) -> Result<Self> {
        config.validate()?;
        let reported = match (&config.report_path, config.resume) {
            (Some(path), true) => MigrationLedger::load(path)?
                .entries()
                .map(|entry| entry.legacy_id.clone())
                .collect(),
            _ => HashSet::new(),
        };
        Ok(MigrationRunner {
            config,
            registry,
            store: None,
            ledger: MigrationLedger::new(),
            reported,
        })
    }

    /// Load migrated documents into `store` (ignored in dry-run mode).
    #[must_use]
    pub fn with_store(mut self, store: impl RecordStore + 'a) -> Self {
        self.store = Some(Box::new(store));
        self
    }

    /// Ledger of this run.
    #[must_use]
    pub fn ledger(&self) -> &MigrationLedger {
        &self.ledger
    }

    /// Consume the runner, returning its ledger.
    #[must_use]
    pub fn into_ledger(self) -> MigrationLedger {
        self.ledger
    }

    /// Read and migrate every record of the given dump files.
    ///
    /// # Errors
    ///
    /// Returns an error if a dump file cannot be read or the report,
    /// previews or store fail at the infrastructure level.
    pub fn run_files<P: AsRef<Path>>(&mut self, paths: &[P]) -> Result<RunSummary> {
        let mut records = Vec::new();
        for path in paths {
            records.extend(read_dump_file(path)?);
        }
        self.run(&records)
    }

    /// Migrate `records` in input order.
    ///
    /// # Errors
    ///
    /// Returns an error on infrastructure failures (report, previews).
    /// Per-record problems are recorded in the ledger instead.
    pub fn run(&mut self, records: &[DumpRecord]) -> Result<RunSummary> {
        let mut summary = RunSummary::default();

        let pending: Vec<&DumpRecord> = records
            .iter()
            .filter(|r| {
                let done = self.reported.contains(&r.legacy_id);
                if done {
                    tracing::debug!(legacy_id = %r.legacy_id, "already in report, skipped");
                    summary.skipped += 1;
                }
                !done
            })
            .collect();

        tracing::info!(
            records = records.len(),
            pending = pending.len(),
            dry_run = self.config.dry_run,
            parallel = self.config.parallel,
            "migration started"
        );

        for chunk in pending.chunks(self.config.checkpoint_interval) {
            let registry = self.registry;
            let config = &self.config;
            let transformed: Vec<Transformed> = if config.parallel {
                chunk.par_iter().map(|r| transform(registry, config, r)).collect()
            } else {
                chunk.iter().map(|r| transform(registry, config, r)).collect()
            };

            for item in transformed {
                self.apply(item, &mut summary)?;
            }
            self.checkpoint()?;
        }

        tracing::info!(
            processed = summary.processed,
            skipped = summary.skipped,
            clean = summary.clean,
            errored = summary.errored,
            loaded = summary.loaded,
            "migration finished"
        );
        Ok(summary)
    }

    fn checkpoint(&self) -> Result<()> {
        if let Some(path) = &self.config.report_path {
            self.ledger.save_merged(path)?;
            tracing::debug!(path = %path.display(), entries = self.ledger.len(), "checkpoint");
        }
        Ok(())
    }

    fn apply(&mut self, item: Transformed, summary: &mut RunSummary) -> Result<()> {
        let id = item.legacy_id;
        self.ledger.record_started(&id);
        summary.processed += 1;

        match item.outcome {
            Err(error) if error.is_migration_condition() => self.ledger.record_error(&id, error)?,
            Err(error @ (MigrationError::InvalidMarc(_) | MigrationError::InvalidDump(_))) => {
                tracing::warn!(legacy_id = %id, %error, "record could not be extracted");
                self.ledger.record_error(&id, extraction_failure(&id, &error))?;
            },
            Err(error) => return Err(error),
            Ok((dumped, reconciliation)) => self.finish(&id, dumped, reconciliation, summary)?,
        }

        match self.ledger.entries_for(&id) {
            Some(entry) if entry.clean => summary.clean += 1,
            _ => summary.errored += 1,
        }
        Ok(())
    }

    fn finish(
        &mut self,
        id: &str,
        dumped: DumpedRecord,
        reconciliation: Reconciliation,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let DumpedRecord {
            model,
            document,
            errors,
            notes,
            lost_data,
            ..
        } = dumped;

        for error in errors.into_iter().chain(notes).chain(reconciliation.notes) {
            self.ledger.record_error(id, error)?;
        }
        // Tolerated lost data is reported but does not block loading.
        let blocked = self
            .ledger
            .entries_for(id)
            .is_some_and(|entry| entry.priority >= Priority::Critical);
        if !lost_data.is_empty() {
            self.ledger
                .record_error(id, MigrationError::LossyConversion { missing: lost_data })?;
        }

        let metadata = RecordMetadata {
            legacy_id: id.to_string(),
            model,
            access: record_access(&self.config),
            versions: reconciliation.versions,
        };

        if let Some(dir) = &self.config.preview_dir {
            write_preview(dir, &metadata, &document)?;
        }

        match (&mut self.store, self.config.dry_run, blocked) {
            (Some(store), false, false) => match load_record(store.as_mut(), &document, &metadata) {
                Ok((_, notes)) => {
                    summary.loaded += 1;
                    for note in notes {
                        self.ledger.record_error(id, note)?;
                    }
                },
                Err(error) => self.ledger.record_error(id, error)?,
            },
            (Some(_), false, true) => {
                tracing::info!(legacy_id = %id, "critical conditions, not loaded");
            },
            _ => {},
        }
        Ok(())
    }
}

fn write_preview(
    dir: &Path,
    metadata: &RecordMetadata,
    document: &crate::dispatcher::Document,
) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}.json", metadata.legacy_id));
    let body = json!({
        "legacy_id": metadata.legacy_id,
        "model": metadata.model,
        "access": metadata.access,
        "metadata": document,
        "versions": metadata.versions,
    });
    fs::write(&path, serde_json::to_string_pretty(&body)?)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::InMemoryRecordStore;
    use crate::dump::Revision;

    fn record(id: &str, body: &str) -> DumpRecord {
        DumpRecord::new(
            id,
            vec![Revision {
                modification_timestamp: "2020-01-02 03:04:05".into(),
                raw_marc_payload: format!("<record>{body}</record>"),
            }],
            Vec::new(),
        )
        .unwrap()
    }

    fn datafield(tag: &str, ind1: char, ind2: char, value: &str) -> String {
        let subfield = format!(r#"<subfield code="a">{value}</subfield>"#);
        format!(r#"<datafield tag="{tag}" ind1="{ind1}" ind2="{ind2}">{subfield}</datafield>"#)
    }

    fn clean_body(id: &str) -> String {
        format!(
            r#"<controlfield tag="001">{id}</controlfield>{}{}"#,
            datafield("245", ' ', ' ', &format!("Title {id}")),
            datafield("980", ' ', ' ', "ARTICLE")
        )
    }

    #[test]
    fn test_invalid_payload_recorded_not_fatal() {
        let registry = ModelRegistry::standard().unwrap();
        let mut runner = MigrationRunner::new(MigrationConfig::new(), &registry).unwrap();
        let records = [record("1", &clean_body("1")), record("2", "<datafield")];

        let summary = runner.run(&records).unwrap();
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.clean, 1);
        assert_eq!(summary.errored, 1);
        let entry = runner.ledger().entries_for("2").unwrap();
        assert_eq!(entry.manual_migration.len(), 1);
        assert_eq!(entry.manual_migration[0].stage, Stage::Extract);
    }

    #[test]
    fn test_path_like_id_gets_no_preview() {
        let dir = tempfile::tempdir().unwrap();
        let previews = dir.path().join("previews");
        let registry = ModelRegistry::standard().unwrap();
        let config = MigrationConfig::new().with_preview_dir(&previews);
        let mut runner = MigrationRunner::new(config, &registry).unwrap();
        let mut escaping = record("1", &clean_body("1"));
        escaping.legacy_id = "../escaped".into();

        let summary = runner.run(&[escaping]).unwrap();
        assert_eq!(summary.errored, 1);
        assert!(!dir.path().join("escaped.json").exists());
        let entry = runner.ledger().entries_for("../escaped").unwrap();
        assert_eq!(entry.manual_migration[0].stage, Stage::Extract);
    }

    #[test]
    fn test_dry_run_does_not_load() {
        let registry = ModelRegistry::standard().unwrap();
        let config = MigrationConfig::new().with_dry_run(true);
        let mut runner = MigrationRunner::new(config, &registry)
            .unwrap()
            .with_store(InMemoryRecordStore::new());

        let summary = runner.run(&[record("1", &clean_body("1"))]).unwrap();
        assert_eq!(summary.loaded, 0);
        assert_eq!(summary.clean, 1);
    }

    #[test]
    fn test_lossy_record_not_loaded() {
        let registry = ModelRegistry::standard().unwrap();
        let mut runner = MigrationRunner::new(MigrationConfig::new(), &registry)
            .unwrap()
            .with_store(InMemoryRecordStore::new());
        let body = clean_body("1") + &datafield("999", 'C', '5', "x");

        let summary = runner.run(&[record("1", &body), record("2", &clean_body("2"))]).unwrap();
        assert_eq!(summary.loaded, 1);
        let entry = runner.ledger().entries_for("1").unwrap();
        assert_eq!(entry.lost_data, vec!["999C5".to_string()]);
        assert_eq!(entry.priority, Priority::Critical);
    }

    #[test]
    fn test_tolerated_lossy_record_loaded() {
        let registry = ModelRegistry::standard().unwrap();
        let config = MigrationConfig::new().with_tolerate_lossy(true);
        let mut runner = MigrationRunner::new(config, &registry)
            .unwrap()
            .with_store(InMemoryRecordStore::new());
        let body = clean_body("1") + &datafield("999", 'C', '5', "x");

        let summary = runner.run(&[record("1", &body)]).unwrap();
        assert_eq!(summary.loaded, 1);
        assert_eq!(summary.errored, 1);
        let entry = runner.ledger().entries_for("1").unwrap();
        assert_eq!(entry.lost_data, vec!["999C5".to_string()]);
    }
}
