use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use rentsync_core::LocalTable;
use rentsync_storage::{read_dataset, SnapshotOutcome};
use rentsync_sync::{ExportOptions, MergedDataset, SyncConfig, SyncPipeline};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_LOG_FILTER: &str = "rentsync=info,warn";

#[derive(Debug, Parser)]
#[command(name = "rentsync-cli")]
#[command(about = "Rent and cost-of-living dataset sync")]
struct Cli {
    /// Print override diagnostics and the first merged row with overrides.
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch, merge, write the dataset, and run every configured push path.
    Sync(SnapshotArgs),
    /// Fetch, merge, and write the dataset only.
    Export(SnapshotArgs),
    /// Upsert a dataset file into the destination table.
    Push(CsvArgs),
    /// Sync a dataset file into the linked fact table.
    PushLinked(CsvArgs),
    /// Dump raw override records.
    InspectOverrides {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

#[derive(Debug, Args, Default)]
struct SnapshotArgs {
    #[arg(long)]
    no_snapshot: bool,
    #[arg(long, conflicts_with = "no_snapshot")]
    force_snapshot: bool,
}

impl SnapshotArgs {
    fn options(&self) -> ExportOptions {
        ExportOptions {
            snapshot: !self.no_snapshot,
            force_snapshot: self.force_snapshot,
        }
    }
}

#[derive(Debug, Args)]
struct CsvArgs {
    /// Defaults to the configured dataset path.
    #[arg(long)]
    csv: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(log_filter(Path::new(".env.local")))
        .init();

    let cli = Cli::parse();
    let pipeline = SyncPipeline::new(SyncConfig::from_env())?;

    match cli.command.unwrap_or(Commands::Sync(SnapshotArgs::default())) {
        Commands::Sync(args) => {
            let summary = pipeline.run_once(args.options()).await?;
            if cli.debug {
                println!("override stats: {}", serde_json::to_string_pretty(&summary.overrides)?);
                match &summary.first_with_overrides {
                    Some(row) => println!("first row with overrides: {}", serde_json::to_string(row)?),
                    None => println!("no merged row carries overrides"),
                }
            }
            for skipped in &summary.skipped_paths {
                println!("skipped: {skipped}");
            }
            let counters = summary.counters();
            println!(
                "sync complete: run_id={} fetched={} skipped={} updated={} created={} failed={} dataset={}{}",
                summary.run_id,
                counters.fetched,
                counters.skipped,
                counters.updated,
                counters.created,
                counters.failed,
                summary.dataset_path,
                if summary.dataset_unchanged { " (unchanged)" } else { "" },
            );
        }
        Commands::Export(args) => {
            let export = pipeline.export(args.options()).await?;
            if cli.debug {
                print_merge_diagnostics(&export.merged)?;
            }
            if let Some(snapshot) = &export.snapshot {
                match snapshot {
                    SnapshotOutcome::Written(path) => println!("snapshot written: {}", path.display()),
                    SnapshotOutcome::Kept(path) => println!("snapshot kept: {}", path.display()),
                }
            }
            println!(
                "export complete: rows={} rows_with_overrides={} skipped_overrides={} sha256={} dataset={}{}",
                export.written.rows,
                export.merged.merge.rows_with_overrides,
                export.merged.overrides.skipped,
                export.written.content_hash,
                export.written.path.display(),
                if export.written.unchanged { " (unchanged)" } else { "" },
            );
        }
        Commands::Push(args) => {
            let rows = load_rows(&pipeline, args.csv).await?;
            let summary = pipeline.push_upsert(&rows).await?;
            if let Some(preferred) = &summary.downgraded_from {
                println!("schema downgraded from {preferred} to {}", summary.schema);
            }
            println!(
                "push complete: table={} schema={} batches={} created={} updated={} skipped={}",
                summary.table,
                summary.schema,
                summary.batches,
                summary.created,
                summary.updated,
                summary.skipped_empty,
            );
        }
        Commands::PushLinked(args) => {
            let rows = load_rows(&pipeline, args.csv).await?;
            let summary = pipeline.push_linked(&rows).await?;
            println!(
                "push-linked complete: rows={} created={} updated={} degraded={} failed={} skipped={} parents_created={}",
                summary.rows,
                summary.created,
                summary.updated,
                summary.degraded,
                summary.failed,
                summary.skipped,
                summary.parents.created,
            );
        }
        Commands::InspectOverrides { limit } => {
            let records = pipeline.inspect_overrides(limit).await?;
            for record in &records {
                println!("{} {}", record.id, serde_json::to_string_pretty(&record.fields)?);
            }
            println!("{} override record(s)", records.len());
        }
    }

    Ok(())
}

/// Loads `env_file` first so a RUST_LOG set there reaches the filter.
fn log_filter(env_file: &Path) -> EnvFilter {
    // A missing file is fine; the process environment may carry everything.
    dotenvy::from_path(env_file).ok();
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

async fn load_rows(pipeline: &SyncPipeline, csv: Option<PathBuf>) -> Result<LocalTable> {
    let path = csv.unwrap_or_else(|| pipeline.config().dataset_path.clone());
    read_dataset(&path)
        .await
        .with_context(|| format!("loading rows to push from {}", path.display()))
}

fn print_merge_diagnostics(merged: &MergedDataset) -> Result<()> {
    let stats = &merged.overrides;
    println!("composite key samples: {:?}", stats.composite_key_samples);
    println!("raw entity labels: {:?}", stats.raw_entity_labels);
    println!("canonical entities: {:?}", stats.canonical_entities);
    for (reason, count) in &stats.skipped_by_reason {
        println!("skipped {}: {count}", reason.as_str());
    }
    match merged.merge.first_with_overrides() {
        Some(row) => println!("first row with overrides: {}", serde_json::to_string(row)?),
        None => println!("no merged row carries overrides"),
    }
    Ok(())
}
