use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use sweeplib::artifacts::collect;
use sweeplib::config::{SizeUnit, SweepConfig};
use sweeplib::driver::SweepDriver;
use sweeplib::interrupt::{install_handlers, stop_flag};
use sweeplib::invoke::{command_line, RunInvoker};
use sweeplib::plan::{plan, CellKey};
use sweeplib::store::{ExportFormat, ResultStore};
use sweeplib::traces;

#[cfg(debug_assertions)]
const DEBUG_DEFAULT: bool = true;

#[cfg(not(debug_assertions))]
const DEBUG_DEFAULT: bool = false;

#[derive(Parser, Debug)]
#[command(about = String::from("Runs a cache simulator over traces, cache sizes and policies, and summarises the results"))]
struct Args {
    #[command(subcommand)]
    command: Cmd,

    /// Log debug output. RUST_LOG takes precedence
    #[arg(short, long, default_value_t = DEBUG_DEFAULT)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run every cell without a stored result, then print the summaries
    Run {
        config: PathBuf,

        /// Overrides the number of cells run at once
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Print the cells of a sweep and the command each would run
    Plan { config: PathBuf },
    /// Render stored results without running anything
    Export {
        config: PathBuf,

        #[arg(short, long, default_value = "csv")]
        format: ExportFormat,

        /// Only export this policy
        #[arg(short, long)]
        policy: Option<String>,
    },
    /// Rebuild a policy's summary from the .cachesim artifacts in a directory
    Collect {
        results_dir: PathBuf,
        policy: String,

        #[arg(short, long, default_value = "bytes")]
        unit: SizeUnit,

        /// Also write the collected results to the policy's results file
        #[arg(long)]
        write: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    let level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| level.into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match args.command {
        Cmd::Run { config, workers } => run(config, workers),
        Cmd::Plan { config } => print_plan(config),
        Cmd::Export { config, format, policy } => export(config, format, policy),
        Cmd::Collect { results_dir, policy, unit, write } => collect_artifacts(results_dir, policy, unit, write),
    }
}

fn load_config(path: &Path) -> Result<SweepConfig> {
    SweepConfig::from_file(path).with_context(|| format!("Couldn't load the config file at path {}", path.display()))
}

fn run(config_path: PathBuf, workers: Option<usize>) -> Result<()> {
    let mut config = load_config(&config_path)?;
    if let Some(workers) = workers {
        config.workers = workers;
        config.validate()?;
    }
    let traces = traces::from_config(&config)?;
    let sweep = plan(&traces, &config.sizes(), &config.policies);
    info!("Found {} trace(s), {} cell(s) planned", traces.len(), sweep.len());

    let invoker = RunInvoker::from_config(&config).context("Couldn't set up the simulator")?;
    let driver = SweepDriver::from_config(&config, invoker).context("Couldn't load existing results")?;
    install_handlers()?;
    let report = driver.run(&sweep, stop_flag())?;

    for summary in &report.summaries {
        println!("# {} ({})", summary.policy, summary.path.display());
        print!("{}", summary.csv);
    }
    if !report.failures.is_empty() {
        eprintln!("{} cell(s) failed:", report.failures.len());
        for failure in &report.failures {
            eprintln!("  {}: {}", failure.key, failure.reason);
        }
    }
    Ok(())
}

fn print_plan(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    let traces = traces::from_config(&config)?;
    let sweep = plan(&traces, &config.sizes(), &config.policies);
    // The simulator doesn't need to exist to show what would be run
    let invoker = RunInvoker::new(config.simulator.clone(), &config);
    let mut stores = BTreeMap::new();
    for policy in sweep.policies() {
        stores.insert(policy, ResultStore::load(&config.store_path(policy), policy, config.size_unit)?);
    }
    for cell in sweep.cells() {
        let recorded = stores.get(cell.policy.as_str()).is_some_and(|store| store.has(&cell.key()));
        let marker = if recorded { "done" } else { "todo" };
        println!("{marker}\t{}\t{}", cell.key(), command_line(&invoker.command(cell)));
    }
    println!("{} cell(s)", sweep.len());
    Ok(())
}

fn export(config_path: PathBuf, format: ExportFormat, only: Option<String>) -> Result<()> {
    let config = load_config(&config_path)?;
    let policies: Vec<&String> = match &only {
        Some(policy) if !config.policies.contains(policy) => bail!("Policy {policy} is not part of this sweep"),
        Some(policy) => vec![policy],
        None => config.policies.iter().collect(),
    };
    for policy in policies {
        let store = ResultStore::load(&config.store_path(policy), policy, config.size_unit)?;
        print!("{}", store.export(format)?);
    }
    Ok(())
}

fn collect_artifacts(results_dir: PathBuf, policy: String, unit: SizeUnit, write: bool) -> Result<()> {
    let store = collect(&results_dir, &policy, unit)?;
    info!("Collected {} result(s) for {policy}", store.len());
    let csv = store.export(ExportFormat::Csv)?;
    let summary_path = results_dir.join(format!("{policy}_summary.csv"));
    fs::write(&summary_path, &csv).with_context(|| format!("Couldn't write {}", summary_path.display()))?;
    if write {
        // Merge rather than replace, results recorded by sweeps are kept as they are
        let mut existing = ResultStore::load(store.path(), &policy, unit)?;
        for (trace, cache_size, result) in store.records() {
            let key = CellKey {
                trace: trace.to_string(),
                policy: policy.clone(),
                cache_size,
            };
            if !existing.has(&key) {
                existing.put(&key, result.clone())?;
            }
        }
        existing.flush()?;
        info!("Wrote {} result(s) to {}", existing.len(), existing.path().display());
    }
    print!("{csv}");
    Ok(())
}
