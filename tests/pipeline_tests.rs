//! End-to-end runs over dump files with report, previews and a store.

mod common;

use std::fs::{self, File};
use std::io::Write;

use cds_migrator::collaborators::InMemoryRecordStore;
use cds_migrator::ledger::{EntryFilter, MigrationLedger};
use cds_migrator::versions::Visibility;
use cds_migrator::{
    AccessDecision, DirectoryRecordStore, MigrationConfig, MigrationRunner, ModelRegistry, Priority,
};
use chrono::NaiveDate;
use common::{article, controlfield, datafield, dump_record, file, lossy_article};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;

fn write_dump(path: &std::path::Path, records: &[cds_migrator::DumpRecord]) {
    fs::write(path, serde_json::to_string(records).unwrap()).unwrap();
}

#[test]
fn test_full_run_writes_report_previews_and_store() {
    let dir = tempfile::tempdir().unwrap();
    let dump = dir.path().join("dump.json");
    let report = dir.path().join("out/report.json");
    let previews = dir.path().join("previews");
    let store = dir.path().join("store");

    let mut with_files = article("3");
    with_files.files = vec![
        file("paper.pdf", 1, "2020-01-01 10:00:00"),
        file("paper.pdf", 2, "2020-02-01 10:00:00"),
    ];
    write_dump(&dump, &[article("1"), lossy_article("2"), with_files]);

    let registry = ModelRegistry::standard().unwrap();
    let config = MigrationConfig::new()
        .with_report_path(&report)
        .with_preview_dir(&previews)
        .with_checkpoint_interval(2);
    let mut runner = MigrationRunner::new(config, &registry)
        .unwrap()
        .with_store(DirectoryRecordStore::new(&store));

    let summary = runner.run_files(&[&dump]).unwrap();
    assert_eq!(summary.processed, 3);
    assert_eq!(summary.clean, 2);
    assert_eq!(summary.errored, 1);
    assert_eq!(summary.loaded, 2);

    let ledger = MigrationLedger::load(&report).unwrap();
    assert_eq!(ledger.len(), 3);
    let lossy = ledger.entries_for("2").unwrap();
    assert!(!lossy.clean);
    assert_eq!(lossy.priority, Priority::Critical);
    assert_eq!(lossy.lost_data, vec!["999C5".to_string()]);

    let preview: Value =
        serde_json::from_str(&fs::read_to_string(previews.join("3.json")).unwrap()).unwrap();
    assert_eq!(preview["metadata"]["title"], "Measurement 3");
    assert_eq!(preview["versions"].as_array().unwrap().len(), 2);
    assert!(!previews.join("2.json").exists());

    assert!(store.join("1.json").exists());
    assert!(!store.join("2.json").exists());
}

#[test]
fn test_gzipped_dump() {
    let dir = tempfile::tempdir().unwrap();
    let dump = dir.path().join("dump.json.gz");
    let mut encoder = GzEncoder::new(File::create(&dump).unwrap(), Compression::default());
    encoder
        .write_all(serde_json::to_string(&[article("10")]).unwrap().as_bytes())
        .unwrap();
    encoder.finish().unwrap();

    let registry = ModelRegistry::standard().unwrap();
    let mut runner = MigrationRunner::new(MigrationConfig::new(), &registry).unwrap();
    let summary = runner.run_files(&[&dump]).unwrap();
    assert_eq!(summary.clean, 1);
}

#[test]
fn test_rerun_produces_identical_report() {
    let dir = tempfile::tempdir().unwrap();
    let report = dir.path().join("report.json");
    let records = [article("1"), lossy_article("2"), article("3")];
    let registry = ModelRegistry::standard().unwrap();

    for _ in 0..2 {
        let config = MigrationConfig::new().with_report_path(&report).with_dry_run(true);
        MigrationRunner::new(config, &registry).unwrap().run(&records).unwrap();
    }
    let first = fs::read_to_string(&report).unwrap();

    let config = MigrationConfig::new().with_report_path(&report).with_dry_run(true);
    MigrationRunner::new(config, &registry).unwrap().run(&records).unwrap();
    assert_eq!(fs::read_to_string(&report).unwrap(), first);
}

#[test]
fn test_resume_skips_reported_records() {
    let dir = tempfile::tempdir().unwrap();
    let report = dir.path().join("report.json");
    let registry = ModelRegistry::standard().unwrap();

    let config = MigrationConfig::new().with_report_path(&report);
    MigrationRunner::new(config, &registry)
        .unwrap()
        .run(&[article("1")])
        .unwrap();

    let config = MigrationConfig::new().with_report_path(&report).with_resume(true);
    let mut runner = MigrationRunner::new(config, &registry).unwrap();
    let summary = runner.run(&[article("1"), article("2")]).unwrap();
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.processed, 1);
    assert_eq!(MigrationLedger::load(&report).unwrap().len(), 2);
}

#[test]
fn test_parallel_matches_sequential() {
    let records: Vec<_> = (1..=12)
        .map(|i| {
            if i % 3 == 0 {
                lossy_article(&i.to_string())
            } else {
                article(&i.to_string())
            }
        })
        .collect();
    let registry = ModelRegistry::standard().unwrap();

    let run = |parallel: bool| {
        let config = MigrationConfig::new()
            .with_parallel(parallel)
            .with_checkpoint_interval(5);
        let mut runner = MigrationRunner::new(config, &registry).unwrap();
        runner.run(&records).unwrap();
        runner.into_ledger()
    };

    let sequential = run(false);
    let parallel = run(true);
    let ids = |l: &MigrationLedger| l.entries().map(|e| e.legacy_id.clone()).collect::<Vec<_>>();
    assert_eq!(ids(&sequential), ids(&parallel));
    assert_eq!(
        sequential.entries().cloned().collect::<Vec<_>>(),
        parallel.entries().cloned().collect::<Vec<_>>()
    );
    assert_eq!(sequential.page(1, 50, EntryFilter::Errored).total, 4);
}

#[test]
fn test_restricted_record_access_in_metadata() {
    let registry = ModelRegistry::standard().unwrap();
    let mut store = InMemoryRecordStore::new();
    {
        let config = MigrationConfig::new().with_record_access(Visibility::Restricted);
        let mut runner = MigrationRunner::new(config, &registry)
            .unwrap()
            .with_store(&mut store);
        let summary = runner.run(&[article("5")]).unwrap();
        assert_eq!(summary.loaded, 1);
    }
    assert_eq!(store.get("5").unwrap()["title"], "Measurement 5");
    let metadata = store.metadata("5").unwrap();
    assert_eq!(metadata.access, AccessDecision::uniform(Visibility::Restricted));
    assert_eq!(metadata.versions[0].access.decision.files, Visibility::Restricted);
}

#[test]
fn test_directory_store_and_preview_carry_access() {
    let dir = tempfile::tempdir().unwrap();
    let previews = dir.path().join("previews");
    let store = dir.path().join("store");
    let registry = ModelRegistry::standard().unwrap();
    let config = MigrationConfig::new()
        .with_record_access(Visibility::Restricted)
        .with_preview_dir(&previews);
    let mut runner = MigrationRunner::new(config, &registry)
        .unwrap()
        .with_store(DirectoryRecordStore::new(&store));
    runner.run(&[article("6")]).unwrap();

    for path in [previews.join("6.json"), store.join("6.json")] {
        let stored: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(stored["access"]["record"], "restricted");
        assert_eq!(stored["access"]["files"], "restricted");
    }
}

#[test]
fn test_record_without_files_dated_from_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let previews = dir.path().join("previews");
    let record = dump_record(
        "20",
        &[
            controlfield("001", "20"),
            datafield("245", ' ', ' ', &[('a', "Undated files")]),
            datafield("269", ' ', ' ', &[('c', "2009-04-01")]),
        ],
    );
    let registry = ModelRegistry::standard().unwrap();
    let mut store = InMemoryRecordStore::new();
    {
        let config = MigrationConfig::new().with_preview_dir(&previews);
        let mut runner = MigrationRunner::new(config, &registry)
            .unwrap()
            .with_store(&mut store);
        runner.run(&[record]).unwrap();
    }

    let versions = &store.metadata("20").unwrap().versions;
    assert_eq!(versions.len(), 1);
    assert!(versions[0].files.is_empty());
    assert_eq!(versions[0].publication_date, NaiveDate::from_ymd_opt(2009, 4, 1));

    let preview: Value =
        serde_json::from_str(&fs::read_to_string(previews.join("20.json")).unwrap()).unwrap();
    assert_eq!(preview["metadata"]["publication_date"], "2009-04-01");
    assert_eq!(preview["versions"][0]["publication_date"], "2009-04-01");
}

#[test]
fn test_record_without_any_date_falls_back_to_revision() {
    let registry = ModelRegistry::standard().unwrap();
    let mut store = InMemoryRecordStore::new();
    let record = dump_record(
        "21",
        &[controlfield("001", "21"), datafield("245", ' ', ' ', &[('a', "No date")])],
    );
    MigrationRunner::new(MigrationConfig::new(), &registry)
        .unwrap()
        .with_store(&mut store)
        .run(&[record])
        .unwrap();

    let versions = &store.metadata("21").unwrap().versions;
    assert_eq!(versions[0].publication_date, NaiveDate::from_ymd_opt(2021, 6, 1));
}

#[test]
fn test_only_creator_record_is_clean_in_ledger() {
    let registry = ModelRegistry::standard().unwrap();
    let record = dump_record("1", &[datafield("100", ' ', ' ', &[('a', "Doe, Jane")])]);
    let mut runner = MigrationRunner::new(MigrationConfig::new(), &registry).unwrap();

    let summary = runner.run(&[record]).unwrap();
    assert_eq!(summary.clean, 1);
    let entry = runner.ledger().entries_for("1").unwrap();
    assert!(entry.clean);
    assert_eq!(entry.priority, Priority::None);
}

#[test]
fn test_workers_share_one_report() {
    let dir = tempfile::tempdir().unwrap();
    let report = dir.path().join("report.json");
    let registry = ModelRegistry::standard().unwrap();
    let config = || MigrationConfig::new().with_report_path(&report).with_resume(true);

    let mut worker_a = MigrationRunner::new(config(), &registry).unwrap();
    let mut worker_b = MigrationRunner::new(config(), &registry).unwrap();
    worker_a.run(&[article("1"), lossy_article("2")]).unwrap();
    worker_b.run(&[article("3")]).unwrap();

    let ledger = MigrationLedger::load(&report).unwrap();
    let ids: Vec<&str> = ledger.entries().map(|e| e.legacy_id.as_str()).collect();
    assert_eq!(ids, vec!["1", "2", "3"]);
    assert!(!ledger.entries_for("2").unwrap().clean);
}

#[test]
fn test_workers_in_threads_share_one_report() {
    let dir = tempfile::tempdir().unwrap();
    let report = dir.path().join("report.json");
    let registry = ModelRegistry::standard().unwrap();

    std::thread::scope(|scope| {
        for worker in 0..4 {
            let report = &report;
            let registry = &registry;
            scope.spawn(move || {
                let records: Vec<_> =
                    (0..6).map(|i| article(&(worker * 100 + i).to_string())).collect();
                let config = MigrationConfig::new()
                    .with_report_path(report)
                    .with_checkpoint_interval(1);
                MigrationRunner::new(config, registry).unwrap().run(&records).unwrap();
            });
        }
    });

    assert_eq!(MigrationLedger::load(&report).unwrap().len(), 24);
}
