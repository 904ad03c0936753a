//! CSV export of the migration ledger.
//!
//! Operators triage failed records in spreadsheets; [`ledger_to_csv`]
//! renders one row per entry with the bucket sizes and the fields involved.
//!
//! # Examples
//!
//! ```ignore
//! use cds_migrator::csv::ledger_to_csv;
//! use cds_migrator::ledger::{EntryFilter, MigrationLedger};
//!
//! let ledger = MigrationLedger::load("report.json")?;
//! std::fs::write("errored.csv", ledger_to_csv(&ledger, EntryFilter::Errored)?)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use std::collections::BTreeSet;
use std::io;

use crate::error::Result;
use crate::ledger::{EntryFilter, ErrorDetail, MigrationLedger, OutcomeEntry};

const HEADER: [&str; 9] = [
    "legacy_id",
    "status",
    "priority",
    "manual_migration",
    "unexpected_value",
    "missing_required_field",
    "curation",
    "lost_data",
    "fields",
];

fn fields_of(entry: &OutcomeEntry) -> String {
    let fields: BTreeSet<&str> = [
        &entry.manual_migration,
        &entry.unexpected_value,
        &entry.missing_required_field,
        &entry.curation,
    ]
    .into_iter()
    .flat_map(|bucket| bucket.iter().map(|d: &ErrorDetail| d.field.as_str()))
    .filter(|f| !f.is_empty())
    .collect();
    fields.into_iter().collect::<Vec<_>>().join(" ")
}

fn row(entry: &OutcomeEntry) -> [String; 9] {
    [
        entry.legacy_id.clone(),
        if entry.clean { "clean" } else { "errored" }.to_string(),
        entry.priority.to_string(),
        entry.manual_migration.len().to_string(),
        entry.unexpected_value.len().to_string(),
        entry.missing_required_field.len().to_string(),
        entry.curation.len().to_string(),
        entry.lost_data.join(" "),
        fields_of(entry),
    ]
}

/// Render the entries selected by `filter` as CSV with a header row.
///
/// # Errors
///
/// Returns an IO error if the CSV writer fails.
pub fn ledger_to_csv(ledger: &MigrationLedger, filter: EntryFilter) -> Result<String> {
    let mut writer = ::csv::Writer::from_writer(Vec::new());
    writer.write_record(HEADER).map_err(io::Error::from)?;
    for entry in ledger.entries().filter(|e| filter.matches(e)) {
        writer.write_record(row(entry)).map_err(io::Error::from)?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e).into())
}
