//! Legacy dump records and the revision resolver.
//!
//! A dump file is a JSON array of [`DumpRecord`]s, each carrying the full
//! revision history of one legacy record plus its file attachments.
//! [`RecordDumper`] turns one dump record into a finished document by
//! parsing the authoritative revision (or every revision in full-history
//! mode) and running it through the rule dispatcher.
//!
//! # Examples
//!
//! ```ignore
//! use cds_migrator::dump::{read_dump_file, RecordDumper};
//! use cds_migrator::models::ModelRegistry;
//!
//! let registry = ModelRegistry::standard()?;
//! let dumper = RecordDumper::new(&registry);
//! for record in read_dump_file("records.json.gz")? {
//!     let dumped = dumper.dump(&record)?;
//!     println!("{}", dumped.document.to_json_pretty()?);
//! }
//! # Ok::<(), cds_migrator::MigrationError>(())
//! ```

use std::collections::BTreeSet;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::OnceLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use flate2::read::GzDecoder;
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};

use crate::dispatcher::{dispatch, Document};
use crate::error::{MigrationError, Result};
use crate::marcxml::parse_revision_payload;
use crate::models::ModelRegistry;
use crate::record::MarcBlob;

/// Parse the timestamp formats found in legacy dumps.
///
/// Accepts RFC 3339, `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DDTHH:MM:SS` and bare dates.
#[must_use]
pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_utc());
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(dt);
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

fn id_from_string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Str(String),
        Num(u64),
    }
    Ok(match Id::deserialize(deserializer)? {
        Id::Str(s) => s,
        Id::Num(n) => n.to_string(),
    })
}

/// One historical snapshot of a record's MARC data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Revision {
    /// When the snapshot was taken, as found in the dump
    #[serde(alias = "modification_datetime")]
    pub modification_timestamp: String,
    /// MARCXML payload
    #[serde(alias = "marcxml")]
    pub raw_marc_payload: String,
}

impl Revision {
    /// Parse the MARCXML payload.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError::InvalidMarc`] if the payload is malformed.
    pub fn parse(&self) -> Result<MarcBlob> {
        parse_revision_payload(&self.raw_marc_payload)
    }

    /// Parsed modification timestamp.
    #[must_use]
    pub fn modified_at(&self) -> Option<NaiveDateTime> {
        parse_timestamp(&self.modification_timestamp)
    }
}

/// One physical file observation attached to a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    /// File name including extension
    #[serde(alias = "full_name")]
    pub name: String,
    /// Declared version number (1-based)
    #[serde(alias = "version")]
    pub version_number: u32,
    /// Creation time as found in the dump
    #[serde(default, alias = "creation_date")]
    pub creation_timestamp: Option<String>,
    /// `algorithm:digest`, e.g. `md5:...`
    #[serde(default)]
    pub checksum: Option<String>,
    /// Free-text access directive
    #[serde(default, alias = "status")]
    pub restriction_marker: Option<String>,
    /// Location on the legacy storage
    #[serde(default, alias = "path")]
    pub storage_path: Option<String>,
    /// Size in bytes
    #[serde(default)]
    pub size: Option<u64>,
}

impl FileDescriptor {
    /// Creation date, when parsable.
    #[must_use]
    pub fn creation_date(&self) -> Option<NaiveDate> {
        self.creation_timestamp
            .as_deref()
            .and_then(parse_timestamp)
            .map(|dt| dt.date())
    }

    /// Split the checksum into algorithm and digest. A bare digest is reported as md5.
    #[must_use]
    pub fn checksum_parts(&self) -> Option<(&str, &str)> {
        let checksum = self.checksum.as_deref()?.trim();
        if checksum.is_empty() {
            return None;
        }
        Some(checksum.split_once(':').unwrap_or(("md5", checksum)))
    }

    /// The restriction marker, when non-blank.
    #[must_use]
    pub fn restriction(&self) -> Option<&str> {
        self.restriction_marker
            .as_deref()
            .map(str::trim)
            .filter(|marker| !marker.is_empty())
    }
}

/// One legacy record with its revision history and files.
#[derive(Debug, Serialize, Deserialize)]
pub struct DumpRecord {
    /// Legacy identifier
    #[serde(alias = "recid", deserialize_with = "id_from_string_or_number")]
    pub legacy_id: String,
    /// Revisions, oldest first
    #[serde(alias = "record")]
    pub revisions: Vec<Revision>,
    /// File observations, unordered
    #[serde(default)]
    pub files: Vec<FileDescriptor>,
    #[serde(skip)]
    files_by_name: OnceLock<IndexMap<String, Vec<FileDescriptor>>>,
}

impl Clone for DumpRecord {
    fn clone(&self) -> Self {
        DumpRecord {
            legacy_id: self.legacy_id.clone(),
            revisions: self.revisions.clone(),
            files: self.files.clone(),
            files_by_name: OnceLock::new(),
        }
    }
}

impl DumpRecord {
    /// Build a dump record, checking that it has at least one revision.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError::InvalidDump`] for an empty revision list.
    pub fn new(
        legacy_id: impl Into<String>,
        revisions: Vec<Revision>,
        files: Vec<FileDescriptor>,
    ) -> Result<Self> {
        let record = DumpRecord {
            legacy_id: legacy_id.into(),
            revisions,
            files,
            files_by_name: OnceLock::new(),
        };
        record.validate()?;
        Ok(record)
    }

    /// Check the record invariants.
    ///
    /// The legacy id names preview and store files, so it must be a plain
    /// file name.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError::InvalidDump`] for an empty revision list or
    /// a legacy id that is empty, contains a path separator or is `..`.
    pub fn validate(&self) -> Result<()> {
        let id = self.legacy_id.as_str();
        if id.trim().is_empty() || id.contains(['/', '\\', '\0']) || id.contains("..") {
            return Err(MigrationError::InvalidDump(format!(
                "legacy id {id:?} is not a plain identifier"
            )));
        }
        if self.revisions.is_empty() {
            return Err(MigrationError::InvalidDump(format!(
                "record {} has no revisions",
                self.legacy_id
            )));
        }
        Ok(())
    }

    /// The authoritative revision.
    ///
    /// # Errors
    ///
    /// Returns [`MigrationError::InvalidDump`] for an empty revision list.
    pub fn latest_revision(&self) -> Result<&Revision> {
        self.revisions.last().ok_or_else(|| {
            MigrationError::InvalidDump(format!("record {} has no revisions", self.legacy_id))
        })
    }

    /// Files grouped by name, each group sorted by ascending version.
    ///
    /// Computed once and cached.
    pub fn files_by_name(&self) -> &IndexMap<String, Vec<FileDescriptor>> {
        self.files_by_name.get_or_init(|| {
            let mut grouped: IndexMap<String, Vec<FileDescriptor>> = IndexMap::new();
            for file in &self.files {
                grouped.entry(file.name.clone()).or_default().push(file.clone());
            }
            for group in grouped.values_mut() {
                group.sort_by_key(|f| f.version_number);
            }
            grouped
        })
    }
}

/// Read a dump file (a JSON array of records), gunzipping `*.gz` files.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or if a record
/// has no revisions.
pub fn read_dump_file(path: impl AsRef<Path>) -> Result<Vec<DumpRecord>> {
    let path = path.as_ref();
    let file = BufReader::new(File::open(path)?);
    let reader: Box<dyn Read> = if path.extension().is_some_and(|ext| ext == "gz") {
        Box::new(GzDecoder::new(file))
    } else {
        Box::new(file)
    };

    let records: Vec<DumpRecord> = serde_json::from_reader(reader)?;
    for record in &records {
        record.validate()?;
    }
    tracing::info!(path = %path.display(), records = records.len(), "dump file loaded");
    Ok(records)
}

/// A dump record converted to a document.
#[derive(Debug)]
pub struct DumpedRecord {
    /// Legacy identifier
    pub legacy_id: String,
    /// Name of the model that converted it
    pub model: String,
    /// Converted authoritative revision
    pub document: Document,
    /// Contained tag errors of the authoritative revision
    pub errors: Vec<MigrationError>,
    /// Curation notes of the authoritative revision
    pub notes: Vec<MigrationError>,
    /// Untransformed tags, only non-empty when lossy output is tolerated
    pub lost_data: BTreeSet<String>,
    /// Number of revisions converted
    pub revisions_processed: usize,
}

impl DumpedRecord {
    /// Whether the conversion raised no errors and lost nothing.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.lost_data.is_empty()
    }
}

/// Selects, parses and converts revisions of dump records.
#[derive(Debug)]
pub struct RecordDumper<'a> {
    registry: &'a ModelRegistry,
    latest_only: bool,
    tolerate_lossy: bool,
}

impl<'a> RecordDumper<'a> {
    /// Latest-revision, lossy-intolerant dumper.
    #[must_use]
    pub fn new(registry: &'a ModelRegistry) -> Self {
        RecordDumper {
            registry,
            latest_only: true,
            tolerate_lossy: false,
        }
    }

    /// Convert only the latest revision (default) or walk the full history.
    #[must_use]
    pub fn latest_only(mut self, latest_only: bool) -> Self {
        self.latest_only = latest_only;
        self
    }

    /// Report untransformed tags instead of failing.
    #[must_use]
    pub fn tolerate_lossy(mut self, tolerate: bool) -> Self {
        self.tolerate_lossy = tolerate;
        self
    }

    /// Convert a dump record.
    ///
    /// # Errors
    ///
    /// - [`MigrationError::InvalidDump`] if the record has no revisions
    /// - [`MigrationError::InvalidMarc`] if a processed payload is malformed
    /// - [`MigrationError::LossyConversion`] if a processed revision has
    ///   untransformed tags and lossy output is not tolerated
    pub fn dump(&self, record: &DumpRecord) -> Result<DumpedRecord> {
        record.validate()?;

        let revisions: &[Revision] = if self.latest_only {
            std::slice::from_ref(record.latest_revision()?)
        } else {
            &record.revisions
        };

        let mut last = None;
        for (index, revision) in revisions.iter().enumerate() {
            let blob = revision.parse()?;
            let model = self.registry.select(&blob);
            let outcome = dispatch(model, &blob);

            tracing::debug!(
                legacy_id = %record.legacy_id,
                revision = index,
                model = %model.name(),
                errors = outcome.errors.len(),
                "revision converted"
            );

            if let Some(lossy) = outcome.lossy_error() {
                if !self.tolerate_lossy {
                    return Err(lossy);
                }
                tracing::warn!(legacy_id = %record.legacy_id, %lossy, "lossy conversion tolerated");
            }
            last = Some((model.name().to_string(), outcome));
        }

        let (model, outcome) = last.ok_or_else(|| {
            MigrationError::InvalidDump(format!("record {} has no revisions", record.legacy_id))
        })?;

        Ok(DumpedRecord {
            legacy_id: record.legacy_id.clone(),
            model,
            document: outcome.document,
            errors: outcome.errors,
            notes: outcome.notes,
            lost_data: outcome.unmatched,
            revisions_processed: revisions.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn revision(body: &str) -> Revision {
        Revision {
            modification_timestamp: "2019-03-01 10:00:00".into(),
            raw_marc_payload: format!("<record>{body}</record>"),
        }
    }

    #[test]
    fn test_deserialize_legacy_dump_shape() {
        let raw = json!({
            "recid": 2045,
            "record": [{
                "modification_datetime": "2015-05-06T12:00:00",
                "marcxml": "<record><controlfield tag=\"001\">2045</controlfield></record>"
            }],
            "files": [{
                "full_name": "thesis.pdf",
                "version": 2,
                "creation_date": "2015-05-06 12:00:00",
                "checksum": "md5:abc",
                "status": "",
                "path": "/opt/cds/files/g0/1/thesis.pdf;2"
            }]
        });

        let record: DumpRecord = serde_json::from_value(raw).unwrap();
        assert_eq!(record.legacy_id, "2045");
        assert_eq!(record.files[0].name, "thesis.pdf");
        assert_eq!(record.files[0].version_number, 2);
        assert_eq!(record.files[0].restriction(), None);
        assert_eq!(record.files[0].checksum_parts(), Some(("md5", "abc")));
        assert_eq!(
            record.files[0].creation_date(),
            NaiveDate::from_ymd_opt(2015, 5, 6)
        );
    }

    #[test]
    fn test_empty_revisions_rejected() {
        assert!(matches!(
            DumpRecord::new("1", Vec::new(), Vec::new()),
            Err(MigrationError::InvalidDump(_))
        ));
    }

    #[test]
    fn test_path_like_legacy_id_rejected() {
        for id in ["../x", "a/b", "a\\b", "..", " "] {
            assert!(
                matches!(
                    DumpRecord::new(id, vec![revision("")], Vec::new()),
                    Err(MigrationError::InvalidDump(_))
                ),
                "{id:?} accepted"
            );
        }
        assert!(DumpRecord::new("2045", vec![revision("")], Vec::new()).is_ok());
    }

    #[test]
    fn test_files_by_name_sorted_by_version() {
        let file = |name: &str, version| FileDescriptor {
            name: name.into(),
            version_number: version,
            creation_timestamp: None,
            checksum: None,
            restriction_marker: None,
            storage_path: None,
            size: None,
        };
        let record = DumpRecord::new(
            "1",
            vec![revision("")],
            vec![file("a.pdf", 3), file("b.pdf", 1), file("a.pdf", 1)],
        )
        .unwrap();

        let grouped = record.files_by_name();
        assert_eq!(grouped.keys().collect::<Vec<_>>(), vec!["a.pdf", "b.pdf"]);
        let versions: Vec<u32> = grouped["a.pdf"].iter().map(|f| f.version_number).collect();
        assert_eq!(versions, vec![1, 3]);
    }

    #[test]
    fn test_parse_timestamp_formats() {
        assert!(parse_timestamp("2015-05-06T12:00:00+02:00").is_some());
        assert!(parse_timestamp("2015-05-06 12:00:00").is_some());
        assert!(parse_timestamp("2015-05-06").is_some());
        assert!(parse_timestamp("May 2015").is_none());
    }
}
