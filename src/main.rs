// GP System Index - Command Line
// Monthly update plus read-only queries against the stored index

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use gp_system_index::{
    CancelToken, Config, Month, MonthSource, Orchestrator, PipelineReport, QueryIndex,
    EnrichedRecord,
};

#[derive(Debug, Parser)]
#[command(name = "gp-index")]
#[command(about = "GP practice clinical IT system index", version)]
struct Cli {
    /// Month (YYYY-MM). Queries default to the latest stored month, update to the previous calendar month.
    #[arg(long, global = true)]
    month: Option<Month>,

    /// Print results as JSON
    #[arg(long, global = true, default_value_t = false)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Download, extract, reconcile and store one month
    Update {
        /// Directory, .zip archive, or archive URL. Defaults to the month's publication page.
        #[arg(long)]
        source: Option<String>,
    },
    /// Look up one practice by code
    Lookup { code: String },
    /// Search practices by name
    Search {
        term: String,
        #[arg(long, default_value_t = false)]
        exact: bool,
    },
    /// Practices on one clinical system, grouped by commissioner
    System { label: String },
    /// Share of practices per clinical system
    Stats,
    /// Months with a stored dataset
    Months,
    /// Seed the commissioner cache from a legacy map CSV
    ImportMap { path: PathBuf },
    /// Write a stored month to CSV
    Export { out: Option<PathBuf> },
    /// Forget practices previously confirmed to have no commissioner
    InvalidateAbsent,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env().context("invalid configuration")?;
    init_tracing(&config.log_filter);

    let orchestrator = Orchestrator::from_config(config).context("failed to open index database")?;
    let month = cli.month.as_ref();

    match cli.command {
        Command::Update { source } => run_update(&orchestrator, cli.month.clone(), source, cli.json)?,
        Command::Lookup { code } => {
            let index = orchestrator.index_for(month)?;
            match index.lookup_exact(&code) {
                Some(record) if cli.json => print_json(record)?,
                Some(record) => print_record(record),
                None => bail!("no practice with code {} in {}", code.trim().to_uppercase(), index.month()),
            }
        }
        Command::Search { term, exact } => {
            let index = orchestrator.index_for(month)?;
            let results = index.search_by_name(&term, exact)?;
            if cli.json {
                print_json(&results)?;
            } else {
                println!("🔎 {} match(es) for \"{}\" in {}", results.total_matches, results.term, index.month());
                println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
                for record in &results.matches {
                    print_record(record);
                }
                if results.truncated {
                    println!("… showing first {} of {}", results.matches.len(), results.total_matches);
                }
            }
        }
        Command::System { label } => {
            let index = orchestrator.index_for(month)?;
            let filter = index.filter_by_system(&label)?;
            if cli.json {
                print_json(&filter)?;
            } else {
                println!("🖥️  {} practice(s) on {} in {}", filter.total, filter.system, index.month());
                println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
                for group in &filter.groups {
                    let commissioner = group.commissioner_code.as_deref().unwrap_or("(no commissioner)");
                    println!("\n{} ({})", commissioner, group.count);
                    for record in &group.records {
                        println!("  {}  {}", record.facility_code(), record.name());
                    }
                }
            }
        }
        Command::Stats => {
            let index = orchestrator.index_for(month)?;
            print_stats(&index, cli.json)?;
        }
        Command::Months => {
            let months = orchestrator.available_months()?;
            if cli.json {
                print_json(&months)?;
            } else if months.is_empty() {
                println!("No months processed yet. Run: gp-index update --month YYYY-MM");
            } else {
                for m in months {
                    match orchestrator.dataset_summary(&m)? {
                        Some(summary) => println!(
                            "{}  {:>6} practices  {:>4} skipped rows  built {}",
                            m, summary.record_count, summary.skipped_rows, summary.created_at
                        ),
                        None => println!("{}", m),
                    }
                }
            }
        }
        Command::ImportMap { path } => {
            let imported = orchestrator
                .import_commissioner_map(&path)
                .with_context(|| format!("failed to import {}", path.display()))?;
            let (resolved, absent) = orchestrator.cache_counts();
            println!("✓ Imported {} commissioner mapping(s)", imported);
            println!("  Cache now holds {} resolved, {} confirmed absent", resolved, absent);
        }
        Command::Export { out } => {
            let target = match (out, month) {
                (Some(path), _) => path,
                (None, Some(m)) => orchestrator.config().export_path(m.as_str()),
                (None, None) => {
                    let latest = orchestrator.current_dataset(None)?.month;
                    orchestrator.config().export_path(latest.as_str())
                }
            };
            let written = orchestrator.export(month, &target)?;
            println!("✓ Wrote {} practice(s) to {}", written, target.display());
        }
        Command::InvalidateAbsent => {
            let removed = orchestrator.invalidate_absent()?;
            println!("✓ Removed {} confirmed-absent cache entries", removed);
        }
    }

    Ok(())
}

fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_update(orchestrator: &Orchestrator, month: Option<Month>, source: Option<String>, json: bool) -> Result<()> {
    let month = month.unwrap_or_else(Month::previous);
    let source = match source {
        Some(location) => MonthSource::parse(&location),
        None => MonthSource::Publication(orchestrator.config().publication_base_url.clone()),
    };

    if !json {
        println!("🗄️  Updating {} from {}", month, source.location());
        println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    let report = orchestrator
        .run_pipeline(&month, &source, &CancelToken::new())
        .with_context(|| format!("update for {} failed", month))?;

    if json {
        print_json(&report)
    } else {
        print_report(&report);
        Ok(())
    }
}

fn print_report(report: &PipelineReport) {
    println!("✓ {} practices from {} file(s), {} row(s) skipped", report.records, report.files, report.skipped_rows);
    println!("✓ {} practice(s) with no resolvable system", report.unresolved_systems);
    println!(
        "✓ Commissioners: {} cached, {} looked up ({} resolved, {} absent)",
        report.cache_hits, report.lookups, report.newly_resolved, report.confirmed_absent
    );
    if !report.failures.is_empty() {
        println!("⚠️  {} lookup(s) failed and will be retried next run:", report.failures.len());
        for failure in &report.failures {
            println!("   {}: {}", failure.facility_code, failure.failure);
        }
    }
    if report.unchanged {
        println!("ℹ️  Content identical to the previously stored {}", report.month);
    }
    println!("\n🎉 {} stored (run {})", report.month, report.run_id);
}

fn print_record(record: &EnrichedRecord) {
    println!(
        "{:<8} {:<45} {:<12} {}",
        record.facility_code(),
        record.name(),
        record.record.system_label(),
        record.commissioner_code.as_deref().unwrap_or("-"),
    );
}

fn print_stats(index: &QueryIndex, json: bool) -> Result<()> {
    let stats = index.statistics();
    if json {
        return print_json(&stats);
    }

    println!("📊 {} practices in {}", stats.total_records, stats.month);
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    for share in &stats.systems {
        println!("{:<15} {:>6}  {:>5.1}%", share.system, share.count, share.percentage);
    }
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
