use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use kira_delivery::app::{App, RunResult};
use kira_delivery::config::ConfigLoader;
use kira_delivery::error::DeliveryError;
use kira_delivery::lims::ClarityHttpClient;
use kira_delivery::manifest::ManifestResolver;
use kira_delivery::output::{HumanOutput, JsonOutput, OutputMode};
use kira_delivery::store::RestRecordStore;

#[derive(Parser)]
#[command(name = "kira-delivery")]
#[command(about = "Confirm customer downloads of delivered data from transfer reports")]
#[command(version, author)]
struct Cli {
    /// Configuration file (defaults to ./kira-delivery.json)
    #[arg(long)]
    config: Option<String>,

    /// Transfer-audit CSV exports to ingest
    #[arg(long = "report", alias = "csv-files", num_args = 1..)]
    reports: Vec<PathBuf>,

    /// Samples to check
    #[arg(long, num_args = 1.., conflicts_with = "queued_samples")]
    samples: Vec<String>,

    /// Check every sample queued for download confirmation
    #[arg(long)]
    queued_samples: bool,

    /// Confirm every successfully checked sample in the LIMS
    #[arg(long)]
    confirm_in_lims: bool,

    #[arg(long)]
    json: bool,

    #[arg(long)]
    debug: bool,
}

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(error) = report.downcast_ref::<DeliveryError>() {
            return ExitCode::from(map_exit_code(error));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &DeliveryError) -> u8 {
    match error {
        DeliveryError::Format { .. }
        | DeliveryError::MissingConfig
        | DeliveryError::ConfigRead(_)
        | DeliveryError::ConfigParse(_)
        | DeliveryError::InvalidConfig(_) => 2,
        error if error.is_external() => 3,
        _ => 1,
    }
}

fn run() -> miette::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if cli.debug { "debug" } else { "info" }));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let output_mode = if cli.json {
        OutputMode::Json
    } else {
        OutputMode::Human
    };

    let config = ConfigLoader::resolve(cli.config.as_deref())?;
    let store = RestRecordStore::new(&config.rest_api)?;
    let lims = ClarityHttpClient::new(&config.clarity)?;
    let resolver = ManifestResolver::new(
        store,
        lims,
        config.delivery_root.clone(),
        config.tracked_extensions.clone(),
    );
    let mut app = App::new(resolver, config.workflow.clone());

    let mut result = RunResult::default();
    if !cli.reports.is_empty() {
        result.ingest = Some(app.ingest(&cli.reports)?);
    }

    if cli.queued_samples {
        result.checks = app.check_all_queued()?;
    } else {
        for sample in &cli.samples {
            result.checks.push(app.check(sample)?);
        }
    }

    if cli.confirm_in_lims {
        result.confirmation = app.confirm_in_lims()?;
    }

    match output_mode {
        OutputMode::Json => JsonOutput::print_run(&result).into_diagnostic()?,
        OutputMode::Human => HumanOutput::print_run(&result).into_diagnostic()?,
    }
    Ok(())
}
