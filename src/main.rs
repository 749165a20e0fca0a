use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use dicom_cohort::config::{ENV_DOWNLOADED_DATA_PATH, ENV_ROOT_DATA_PATH};
use dicom_cohort::{
    ConfigBuilder, Coordinator, DicomNiftiConverter, LabelColumn, Pipeline, RunReport,
};

#[derive(Parser)]
#[command(name = "dicom-cohort")]
#[command(about = "Organize zipped DICOM archives into a labeled NIfTI cohort")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// TOML config file with [paths] and [data] tables
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding the input ZIP archives
    #[arg(long, global = true, env = ENV_DOWNLOADED_DATA_PATH)]
    archives: Option<PathBuf>,

    /// Root directory for the canonical trees and processed outputs
    #[arg(long, global = true, env = ENV_ROOT_DATA_PATH)]
    root: Option<PathBuf>,

    /// Convert series in parallel (faster for large datasets)
    #[arg(long, global = true)]
    parallel: bool,

    /// Worker threads for parallel conversion (defaults to available cores)
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Pretty print JSON output
    #[arg(short, long, global = true)]
    pretty: bool,

    /// Verbose output with progress bars
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Extract archives into the canonical DICOM tree
    Organize,
    /// Convert every canonical series into a NIfTI volume
    Convert,
    /// Rebuild the label table from the NIfTI tree
    Labels {
        /// Column to one-hot encode: category, stage or age_range
        #[arg(long, default_value = "stage")]
        label_column: LabelColumn,
    },
    /// Organize, convert and label in one go
    Run {
        #[arg(long, default_value = "stage")]
        label_column: LabelColumn,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let mut builder = ConfigBuilder::new();
    if let Some(path) = &cli.config {
        builder = builder.with_file(path)?;
    }
    let config = builder
        .with_env()
        .archive_dir(cli.archives.clone())
        .root_dir(cli.root.clone())
        .workers(cli.workers)
        .build()
        .context("incomplete configuration")?;
    config.validate().context("invalid configuration")?;

    let coordinator = if cli.parallel {
        Coordinator::parallel(config.workers)
    } else {
        Coordinator::sequential()
    }
    .with_progress(cli.verbose);

    let converter = Arc::new(DicomNiftiConverter::new(config.slice_extension.clone()));
    let pipeline = Pipeline::new(Arc::new(config), converter, coordinator).with_pretty_output(cli.pretty);

    let report = match cli.command {
        Command::Organize => {
            let mut report = RunReport::start();
            report.record_organize(&pipeline.organize()?);
            pipeline.finish(report)?
        }
        Command::Convert => {
            let mut report = RunReport::start();
            report.record_conversion(&pipeline.convert()?);
            pipeline.finish(report)?
        }
        Command::Labels { label_column } => {
            let mut report = RunReport::start();
            report.label_records = Some(pipeline.labels(label_column)?.records.len());
            pipeline.finish(report)?
        }
        Command::Run { label_column } => pipeline.run(label_column)?,
    };

    print_summary(&report);
    Ok(())
}

fn print_summary(report: &RunReport) {
    println!("\nRun {}:", report.run_id);
    if let Some(archives) = &report.archives {
        println!(
            "   Archives: {} seen, {} organized, {} skipped, {} series",
            archives.seen, archives.organized, archives.skipped, archives.series
        );
    }
    if let Some(series) = &report.series {
        println!(
            "   Series: {} discovered, {} converted, {} skipped, {} without output, {} failed",
            series.discovered, series.converted, series.skipped, series.no_output, series.failed
        );
    }
    if let Some(records) = report.label_records {
        println!("   Label records: {records}");
    }
    for failure in &report.failures {
        println!("     - {failure}");
    }
}
