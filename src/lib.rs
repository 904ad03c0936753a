#![warn(missing_docs)]

//! # cds-migrator: legacy CDS records to repository JSON
//!
//! A rule-driven engine that converts MARC21/MARCXML dumps of the CERN
//! Document Server into JSON documents for a new repository, and keeps an
//! auditable, resumable report of what did not convert cleanly.
//!
//! ## Quick Start
//!
//! ### Converting one dump record
//!
//! ```ignore
//! use cds_migrator::{read_dump_file, ModelRegistry, RecordDumper};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = ModelRegistry::standard()?;
//! let dumper = RecordDumper::new(&registry).tolerate_lossy(true);
//!
//! for record in read_dump_file("dump.json.gz")? {
//!     let dumped = dumper.dump(&record)?;
//!     println!("{}", dumped.document.to_json_pretty()?);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ### Running a migration with a report
//!
//! ```ignore
//! use cds_migrator::{MigrationConfig, MigrationRunner, ModelRegistry};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = ModelRegistry::standard()?;
//! let config = MigrationConfig::new()
//!     .with_dry_run(true)
//!     .with_report_path("report.json");
//!
//! let mut runner = MigrationRunner::new(config, &registry)?;
//! let summary = runner.run_files(&["dump.json"])?;
//! println!("{} clean, {} errored", summary.clean, summary.errored);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`record`]: Structured MARC of one revision (`MarcBlob`, tag keys)
//! - [`marcxml`]: MARCXML payload parsing
//! - [`cleaners`]: Typed cleaning of subfield values
//! - [`error`]: Migration error taxonomy
//! - [`rules`]: Tag pattern rules and model tables
//! - [`dispatcher`]: Running a model over a revision
//! - [`models`]: Documents and thesis rule content
//! - [`dump`]: Dump records and revision selection
//! - [`versions`]: File versions and access reconciliation
//! - [`ledger`]: Per-record outcome report
//! - [`csv`]: CSV export of the report
//! - [`collaborators`]: Record store and vocabulary interfaces
//! - [`pipeline`]: Run driver
//! - [`config`]: Run configuration
//! - [`logging`]: Tracing setup

pub mod cleaners;
pub mod collaborators;
pub mod config;
pub mod csv;
pub mod dispatcher;
pub mod dump;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod marcxml;
pub mod models;
pub mod pipeline;
pub mod record;
pub mod rules;
pub mod versions;

pub use cleaners::{clean_val, CleanOptions, Cleaned, Scalar, ValueType};
pub use collaborators::{
    DirectoryRecordStore, InMemoryRecordStore, RecordStore, Resolution, VocabularyLookup,
};
pub use config::MigrationConfig;
pub use dispatcher::{dispatch, Accumulator, Dispatch, Document};
pub use dump::{read_dump_file, DumpRecord, DumpedRecord, FileDescriptor, RecordDumper, Revision};
pub use error::{MigrationError, Priority, Result, Stage};
pub use ledger::{EntryFilter, MigrationLedger, OutcomeEntry};
pub use models::ModelRegistry;
pub use pipeline::{MigrationRunner, RunSummary};
pub use record::{MarcBlob, Occurrence, SubfieldMap, SubfieldValue};
pub use rules::{HandlerOutcome, Model, Rule};
pub use versions::{reconcile, AccessDecision, VersionGroup, Visibility};
