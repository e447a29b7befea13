use std::{
    fs,
    path::{Path, PathBuf},
    process::ExitCode,
    sync::Arc,
};

use clap::Parser;
use pruefstand::{
    load_scenarios, Concurrency, JsonlRecorder, RunConfig, RunReport, ScenarioRunner, StepRecorder,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "scenario-run")]
#[command(about = "Run end-to-end scenarios against the assistant service")]
struct Args {
    /// Run a single scenario file (or every scenario in a directory)
    #[arg(long, conflicts_with = "all")]
    scenario: Option<PathBuf>,

    /// Run every scenario in this directory
    #[arg(long, default_value = "scenarios")]
    all: PathBuf,

    /// Only run scenarios whose name contains this substring (repeatable)
    #[arg(long)]
    name: Vec<String>,

    /// Run configuration (YAML); defaults are used when the file is absent
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Maximum number of scenarios run in parallel
    #[arg(long)]
    concurrency: Option<usize>,

    /// Write the JSON run report to this path
    #[arg(long)]
    report: Option<PathBuf>,
}

fn ensure_parent_dir(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

fn load_config(path: &Path) -> Result<RunConfig, pruefstand::ConfigError> {
    if path.exists() {
        RunConfig::from_path(path)
    } else {
        tracing::warn!(path = %path.display(), "config file not found, using defaults");
        Ok(RunConfig::default())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,pruefstand=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(report) if report.is_success() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(1),
        Err(err) => {
            eprintln!("error: {err}");
            ExitCode::from(2)
        }
    }
}

async fn run(args: Args) -> Result<RunReport, Box<dyn std::error::Error>> {
    let mut config = load_config(&args.config)?;
    if let Some(concurrency) = args.concurrency {
        config.runtime.concurrency = concurrency.max(1);
    }

    let source = args.scenario.as_deref().unwrap_or(&args.all);
    let mut set = load_scenarios(source)?;
    set.retain_names(&args.name);
    if set.is_empty() {
        return Err(format!("no scenarios found in {}", source.display()).into());
    }

    let run_log_dir = config.report.run_log_dir.clone();
    let concurrency = Concurrency::from_limit(config.runtime.concurrency);
    let mut runner = ScenarioRunner::from_config(config)?;
    match JsonlRecorder::create(&run_log_dir) {
        Ok(recorder) => {
            tracing::info!(path = %recorder.path().display(), "writing run log");
            let recorder: Arc<dyn StepRecorder> = Arc::new(recorder);
            runner = runner.with_recorder(recorder);
        }
        Err(err) => tracing::warn!(error = %err, dir = %run_log_dir, "run log disabled"),
    }

    let report = runner.run_with(set, concurrency).await?;

    if let Some(path) = &args.report {
        ensure_parent_dir(path)?;
        fs::write(path, serde_json::to_vec_pretty(&report)?)?;
    }
    print_summary(&report, args.report.as_deref());
    Ok(report)
}

fn print_summary(report: &RunReport, report_path: Option<&Path>) {
    for scenario in &report.scenarios {
        println!(
            "{:<8} {} ({} steps, {}ms)",
            scenario.verdict.to_string().to_uppercase(),
            scenario.name,
            scenario.steps.len(),
            scenario.duration.as_millis()
        );
        if let Some(error) = &scenario.error {
            println!("  - {error}");
        }
        for step in scenario.steps.iter().filter(|s| !s.verdict.is_pass()) {
            let reason = step
                .first_failure
                .as_deref()
                .or(step.error.as_deref())
                .unwrap_or("-");
            println!("  - step {} [{}] {}: {reason}", step.index, step.kind, step.verdict);
        }
    }

    let totals = &report.totals;
    println!(
        "Steps: {} passed, {} failed, {} errors, {} timeouts, {} skipped",
        totals.pass, totals.fail, totals.error, totals.timeout, totals.skipped
    );
    match report.pass_rate() {
        Some(rate) => println!(
            "Pass rate: {:.1}% (skip ratio {:.1}%)",
            rate * 100.0,
            report.skip_ratio() * 100.0
        ),
        None => println!("Pass rate: n/a (nothing decided)"),
    }
    if let Some(path) = report_path {
        println!("Report: {}", path.display());
    }
}
