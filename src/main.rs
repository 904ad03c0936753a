use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use cds_migrator::config::MigrationConfig;
use cds_migrator::csv::ledger_to_csv;
use cds_migrator::ledger::{EntryFilter, MigrationLedger};
use cds_migrator::{logging, DirectoryRecordStore, MigrationRunner, ModelRegistry};

#[derive(Parser)]
#[command(name = "cds-migrate", version, about = "Migrate legacy CDS dumps to repository JSON")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Convert dump files and update the report
    Run(RunArgs),
    /// List or export a report
    Report(ReportArgs),
}

#[derive(Parser)]
#[allow(clippy::struct_excessive_bools)]
struct RunArgs {
    /// Dump files (JSON arrays, optionally gzipped)
    #[arg(required = true, value_name = "DUMP")]
    dumps: Vec<PathBuf>,
    /// TOML configuration file
    #[arg(long, value_name = "PATH", env = "CDS_MIGRATE_CONFIG")]
    config: Option<PathBuf>,
    /// Report file
    #[arg(long, value_name = "PATH")]
    report: Option<PathBuf>,
    /// Write one JSON preview per record into this directory
    #[arg(long, value_name = "DIR")]
    preview_dir: Option<PathBuf>,
    /// Load documents as JSON files into this directory
    #[arg(long, value_name = "DIR")]
    store_dir: Option<PathBuf>,
    /// Transform and report without loading
    #[arg(long)]
    dry_run: bool,
    /// Convert every revision instead of only the latest
    #[arg(long)]
    full_history: bool,
    /// Keep documents with untransformed tags
    #[arg(long)]
    tolerate_lossy: bool,
    /// Transform records on all cores
    #[arg(long)]
    parallel: bool,
    /// Skip records already in the report
    #[arg(long)]
    resume: bool,
}

#[derive(Parser)]
struct ReportArgs {
    /// Report file
    report: PathBuf,
    /// 1-based page
    #[arg(long, default_value_t = 1)]
    page: usize,
    /// Entries per page
    #[arg(long, default_value_t = 20)]
    per_page: usize,
    /// Only errored entries
    #[arg(long)]
    errored_only: bool,
    /// Export the selected entries as CSV instead of listing them
    #[arg(long, value_name = "OUT")]
    csv: Option<PathBuf>,
}

fn run(args: RunArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => {
            MigrationConfig::load(path).with_context(|| format!("loading {}", path.display()))?
        },
        None => MigrationConfig::default(),
    };
    logging::init(&config.logging.level, config.logging.json);

    let dry_run = config.dry_run || args.dry_run;
    let latest_only = config.latest_only && !args.full_history;
    let tolerate_lossy = config.tolerate_lossy || args.tolerate_lossy;
    let parallel = config.parallel || args.parallel;
    let resume = config.resume || args.resume;
    config = config
        .with_dry_run(dry_run)
        .with_latest_only(latest_only)
        .with_tolerate_lossy(tolerate_lossy)
        .with_parallel(parallel)
        .with_resume(resume);
    if let Some(path) = args.report {
        config = config.with_report_path(path);
    }
    if let Some(dir) = args.preview_dir {
        config = config.with_preview_dir(dir);
    }

    let registry = ModelRegistry::standard()?;
    let mut runner = MigrationRunner::new(config, &registry)?;
    if let Some(dir) = args.store_dir {
        runner = runner.with_store(DirectoryRecordStore::new(dir));
    }

    let summary = runner.run_files(args.dumps.as_slice())?;
    println!(
        "processed {}, skipped {}, clean {}, errored {}, loaded {}",
        summary.processed, summary.skipped, summary.clean, summary.errored, summary.loaded
    );
    Ok(())
}

fn report(args: ReportArgs) -> Result<()> {
    logging::init("warn", false);
    let ledger = MigrationLedger::load(&args.report)
        .with_context(|| format!("loading {}", args.report.display()))?;
    let filter = if args.errored_only {
        EntryFilter::Errored
    } else {
        EntryFilter::All
    };

    if let Some(out) = args.csv {
        fs::write(&out, ledger_to_csv(&ledger, filter)?)
            .with_context(|| format!("writing {}", out.display()))?;
        return Ok(());
    }

    let page = ledger.page(args.page, args.per_page, filter);
    println!(
        "page {} ({} matching) | migrated {} errored {} critical {} warning {}",
        page.page,
        page.total,
        page.stats.migrated,
        page.stats.errored,
        page.stats.critical,
        page.stats.warning
    );
    for entry in page.entries {
        let status = if entry.clean { "clean" } else { "errored" };
        println!(
            "{:>10}  {:<8} {:<8} manual={} unexpected={} missing={} lost=[{}]",
            entry.legacy_id,
            status,
            entry.priority.to_string(),
            entry.manual_migration.len(),
            entry.unexpected_value.len(),
            entry.missing_required_field.len(),
            entry.lost_data.join(" ")
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(args),
        Commands::Report(args) => report(args),
    }
}
