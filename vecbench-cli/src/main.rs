use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;
use vecbench_core::{Config, Experiment, JsonlDataset, ResultStore, RunOptions, engines, summarize};

#[derive(Parser)]
#[command(name = "vecbench")]
#[command(about = "Resumable vector search engine benchmarks", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one experiment against one dataset
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "vecbench.yaml")]
        config: PathBuf,

        /// Experiment name from the configuration
        #[arg(short, long)]
        experiment: String,

        /// Dataset name from the configuration
        #[arg(short, long)]
        dataset: String,

        /// Do not configure the engine or upload records
        #[arg(long)]
        skip_upload: bool,

        /// Do not run search configurations
        #[arg(long)]
        skip_search: bool,

        /// Re-run work that already has stored results
        #[arg(long)]
        force: bool,

        /// Only run search configurations with these parallel values
        #[arg(long, value_delimiter = ',')]
        parallels: Vec<usize>,
    },

    /// Aggregate numeric results across stored records
    Summary {
        /// Result directory
        #[arg(short, long, default_value = "results")]
        results: PathBuf,

        /// Only include records of this experiment
        #[arg(short, long)]
        experiment: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Run {
            config,
            experiment,
            dataset,
            skip_upload,
            skip_search,
            force,
            parallels,
        } => {
            let options = RunOptions {
                skip_upload,
                skip_search,
                skip_if_exists: !force,
                parallels,
            };
            run(config, &experiment, &dataset, options).await
        }
        Command::Summary { results, experiment } => summary(results, experiment.as_deref()),
    }
}

async fn run(config_path: PathBuf, experiment: &str, dataset: &str, options: RunOptions) -> Result<()> {
    let config = Config::from_file(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    let experiment_config = config.experiment(experiment)?.clone();
    let dataset = JsonlDataset::new(config.dataset(dataset)?.clone());

    let clients = engines::build(&experiment_config)?;
    let store = ResultStore::open(&config.results_dir)?;
    let mut experiment = Experiment::new(experiment_config, clients, store)?;

    let outcome = experiment.run(&dataset, &options).await;

    // teardown runs whether or not the run succeeded
    if let Err(e) = experiment.delete_client().await {
        error!(error = %e, "Teardown failed");
    }

    let outcome = outcome.with_context(|| format!("Experiment '{}' failed", experiment.name()))?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

fn summary(results: PathBuf, experiment: Option<&str>) -> Result<()> {
    let store = ResultStore::open_existing(results)?;
    let kpis = summarize(&store, experiment)?;

    for (kpi, stats) in kpis {
        println!("sum({}) = {}", kpi, stats.sum);
        println!("count({}) = {}", kpi, stats.count);
        println!("mean({}) = {}", kpi, stats.mean());
    }
    Ok(())
}
