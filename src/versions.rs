//! Version and file reconciliation.
//!
//! Legacy history is file-driven: a record's versions are the version
//! numbers declared by its files. [`reconcile`] derives, for each version,
//! the cumulative set of visible files (a file stays visible until a
//! same-named file supersedes it) and the access decision to apply.
//!
//! Restriction markers are free-text directives such as
//! `allow group "physics-dept [CERN]"` or `allow email "jane@cern.ch"`;
//! [`parse_restriction`] turns them into read grants and reports whatever
//! it could not understand.

use chrono::NaiveDate;
use indexmap::IndexMap;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::dump::FileDescriptor;
use crate::error::{MigrationError, Priority, Stage};

lazy_static! {
    static ref ALLOW_CLAUSE: Regex =
        Regex::new(r#"(?i)\ballow\s+(group|email)((?:\s*,?\s*"[^"]*")+)"#).unwrap();
    static ref QUOTED: Regex = Regex::new(r#""([^"]*)""#).unwrap();
    static ref ORG_SUFFIX: Regex = Regex::new(r"\s*\[[^\]]*\]\s*$").unwrap();
    static ref SEPARATORS: Regex = Regex::new(r"(?i)^(?:[\s,;]|\bor\b|\band\b)*$").unwrap();
}

/// Public or restricted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Anyone can read
    #[default]
    Public,
    /// Only granted subjects can read
    Restricted,
}

/// Access for metadata and for files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AccessDecision {
    /// Metadata access
    pub record: Visibility,
    /// Files access
    pub files: Visibility,
}

impl AccessDecision {
    /// Same visibility for metadata and files.
    #[must_use]
    pub fn uniform(visibility: Visibility) -> Self {
        AccessDecision {
            record: visibility,
            files: visibility,
        }
    }
}

/// Who a grant applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", content = "id", rename_all = "lowercase")]
pub enum GrantSubject {
    /// Group name, without organisation suffix
    Group(String),
    /// E-mail address
    Email(String),
}

/// Permission level of a grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    /// Read access to restricted files
    View,
}

/// A read grant derived from a restriction marker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Grant {
    /// Grantee
    pub subject: GrantSubject,
    /// Permission
    pub permission: Permission,
}

/// Parsed restriction marker.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Restriction {
    /// Grants found, in marker order
    pub grants: Vec<Grant>,
    /// Text that matched no known directive
    pub unrecognized: Option<String>,
}

/// Parse a restriction marker into grants.
///
/// Quoted names after `allow group` become group grants with a trailing
/// `[ORG]` suffix stripped; quoted values after `allow email` become e-mail
/// grants. Remaining text other than separators is returned as
/// `unrecognized`.
#[must_use]
pub fn parse_restriction(marker: &str) -> Restriction {
    let mut grants = Vec::new();
    let mut leftover = String::new();
    let mut last = 0;

    for clause in ALLOW_CLAUSE.captures_iter(marker) {
        let (Some(whole), Some(kind), Some(values)) =
            (clause.get(0), clause.get(1), clause.get(2))
        else {
            continue;
        };
        leftover.push_str(&marker[last..whole.start()]);
        last = whole.end();

        let is_group = kind.as_str().eq_ignore_ascii_case("group");
        for quoted in QUOTED.captures_iter(values.as_str()) {
            let raw = quoted.get(1).map_or("", |m| m.as_str());
            let subject = if is_group {
                GrantSubject::Group(ORG_SUFFIX.replace(raw, "").trim().to_string())
            } else {
                GrantSubject::Email(raw.trim().to_lowercase())
            };
            let grant = Grant {
                subject,
                permission: Permission::View,
            };
            if !grants.contains(&grant) {
                grants.push(grant);
            }
        }
    }
    leftover.push_str(&marker[last..]);

    let unrecognized = (!SEPARATORS.is_match(&leftover)).then(|| leftover.trim().to_string());
    Restriction {
        grants,
        unrecognized,
    }
}

/// Access applied to one version.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct VersionAccess {
    /// Visibility decision
    pub decision: AccessDecision,
    /// Marker(s) the decision was derived from
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub markers: Vec<String>,
    /// Read grants
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub grants: Vec<Grant>,
}

/// Cumulative file set visible at one version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionGroup {
    /// Version number (1-based)
    pub version: u32,
    /// Visible files by name
    pub files: IndexMap<String, FileDescriptor>,
    /// Publication date of this version
    pub publication_date: Option<NaiveDate>,
    /// Access decision
    pub access: VersionAccess,
}

impl VersionGroup {
    /// Visible file names, in first-seen order.
    pub fn file_names(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }
}

/// Versions of one record plus the conditions raised while deriving them.
#[derive(Debug, Default)]
pub struct Reconciliation {
    /// Versions, ascending
    pub versions: Vec<VersionGroup>,
    /// Manual-import conditions and curation notes
    pub notes: Vec<MigrationError>,
}

fn access_for(
    files: &IndexMap<String, FileDescriptor>,
    record_access: AccessDecision,
    version: u32,
    notes: &mut Vec<MigrationError>,
) -> VersionAccess {
    let markers: Vec<(&str, &str)> = files
        .values()
        .filter_map(|f| f.restriction().map(|m| (f.name.as_str(), m)))
        .collect();

    if markers.is_empty() {
        return VersionAccess {
            decision: record_access,
            markers: Vec::new(),
            grants: Vec::new(),
        };
    }

    let mut distinct: Vec<String> = Vec::new();
    let mut grants: Vec<Grant> = Vec::new();
    for (name, marker) in &markers {
        if !distinct.iter().any(|m| m == marker) {
            distinct.push((*marker).to_string());
        }
        let parsed = parse_restriction(marker);
        if let Some(text) = parsed.unrecognized {
            tracing::warn!(
                file = %name,
                version,
                marker = %marker,
                "unrecognized restriction format"
            );
            notes.push(MigrationError::curation(
                *name,
                Some(marker),
                format!("unrecognized restriction format: {text}"),
            ));
        }
        if parsed.grants.is_empty() {
            notes.push(MigrationError::curation(
                *name,
                Some(marker),
                "restricted file without any grant",
            ));
        }
        for grant in parsed.grants {
            if !grants.contains(&grant) {
                grants.push(grant);
            }
        }
    }

    if distinct.len() > 1 {
        notes.push(MigrationError::curation(
            format!("version {version}"),
            Some(&distinct.join(" | ")),
            "several restriction markers merged into one file access",
        ));
    }

    VersionAccess {
        decision: AccessDecision {
            record: record_access.record,
            files: Visibility::Restricted,
        },
        markers: distinct,
        grants,
    }
}

/// Publication date of a converted document (`YYYY`, `YYYY-MM` or
/// `YYYY-MM-DD`), reduced to its first day.
#[must_use]
pub fn metadata_date(raw: &str) -> Option<NaiveDate> {
    let mut parts = raw.trim().splitn(3, '-');
    let year = parts.next()?.parse().ok()?;
    let month = parts.next().map_or(Some(1), |m| m.parse().ok())?;
    let day = parts.next().map_or(Some(1), |d| d.parse().ok())?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Derive the cumulative file set and access decision of every version.
///
/// A record without files gets one synthetic version 1 with the record
/// access and `fallback_date` as publication date.
#[must_use]
pub fn reconcile(
    files: &[FileDescriptor],
    record_access: AccessDecision,
    fallback_date: Option<NaiveDate>,
) -> Reconciliation {
    let mut notes = Vec::new();

    if files.is_empty() {
        return Reconciliation {
            versions: vec![VersionGroup {
                version: 1,
                files: IndexMap::new(),
                publication_date: fallback_date,
                access: VersionAccess {
                    decision: record_access,
                    ..VersionAccess::default()
                },
            }],
            notes,
        };
    }

    let mut declared: IndexMap<u32, Vec<&FileDescriptor>> = IndexMap::new();
    for file in files {
        declared.entry(file.version_number).or_default().push(file);
    }
    declared.sort_keys();

    let mut visible: IndexMap<String, FileDescriptor> = IndexMap::new();
    let mut versions = Vec::with_capacity(declared.len());

    for (version, new_files) in &declared {
        let mut introduced: IndexMap<&str, &FileDescriptor> = IndexMap::new();
        for file in new_files {
            if let Some(previous) = introduced.get(file.name.as_str()) {
                if previous.checksum_parts() != file.checksum_parts() {
                    notes.push(MigrationError::ManualImportRequired {
                        field: file.name.clone(),
                        value: file.checksum.clone(),
                        message: format!(
                            "file declared twice in version {version} with different checksums"
                        ),
                        stage: Stage::Files,
                        priority: Priority::Critical,
                        recid: None,
                    });
                } else {
                    continue;
                }
            }
            introduced.insert(file.name.as_str(), file);
        }

        let publication_date = introduced
            .values()
            .filter_map(|f| f.creation_date())
            .min()
            .or(fallback_date);

        for (name, file) in introduced {
            visible.insert(name.to_string(), file.clone());
        }

        let access = access_for(&visible, record_access, *version, &mut notes);
        versions.push(VersionGroup {
            version: *version,
            files: visible.clone(),
            publication_date,
            access,
        });
    }

    Reconciliation { versions, notes }
}
