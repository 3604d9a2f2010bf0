// src/main.rs
//! url-sentinel command line entry point
use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use url_sentinel::detection::{build_index, load_stage2_input, DetectionConfig, Pipeline};

const DEFAULT_CONFIG: &str = "sentinel.toml";

#[derive(Parser)]
#[command(name = "sentinel")]
#[command(about = "Hybrid URL attack detection")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// TOML configuration file (defaults to ./sentinel.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify the labeled URL files and report metrics
    Detect(DetectArgs),
    /// Deep-analyze URLs flagged malicious
    Analyze(AnalyzeArgs),
    /// Build the retrieval index from the labeled URL files
    BuildIndex,
    /// Write the effective configuration to a file
    InitConfig {
        #[arg(long, default_value = DEFAULT_CONFIG)]
        output: PathBuf,
    },
}

#[derive(ClapArgs)]
struct DetectArgs {
    /// Run Stage 2 on every URL flagged malicious
    #[arg(long)]
    deep: bool,
    /// Override `pipeline.workers`
    #[arg(long)]
    workers: Option<usize>,
}

#[derive(ClapArgs)]
struct AnalyzeArgs {
    /// Stage-1 results JSON or a plain URL list; defaults to the configured Stage-1 output
    #[arg(long)]
    input: Option<PathBuf>,
    /// Report file; defaults to the configured Stage-2 output
    #[arg(long)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging()?;

    info!("Starting url-sentinel v{}", env!("CARGO_PKG_VERSION"));
    let mut config = load_config(args.config.as_deref())?;

    match args.command {
        Commands::Detect(detect) => {
            if let Some(workers) = detect.workers {
                config.pipeline.workers = workers;
                config.validate()?;
            }
            let pipeline = Pipeline::from_config(config)?;
            let (stage1, stage2) = pipeline.run(detect.deep)?;

            println!("{}", stage1.snapshot.render_report());
            if let Some(stage2) = stage2 {
                println!(
                    "Stage 2: {} reports ({} failed) in {:.2}s",
                    stage2.summary.count, stage2.summary.failed, stage2.summary.elapsed_time
                );
            }
        }
        Commands::Analyze(analyze) => {
            let pipeline = Pipeline::from_config(config)?;
            let input = analyze
                .input
                .unwrap_or_else(|| pipeline.store().stage1_path());
            let items = load_stage2_input(&input)
                .with_context(|| format!("loading Stage-2 input {}", input.display()))?;

            let stage2 = pipeline.run_stage2(&items, analyze.output.as_deref())?;
            println!(
                "Stage 2: {} reports ({} failed) in {:.2}s",
                stage2.summary.count, stage2.summary.failed, stage2.summary.elapsed_time
            );
        }
        Commands::BuildIndex => {
            let engine = build_index(&config).context("building retrieval index")?;
            println!(
                "Indexed {} entries ({} dimensions) into {}",
                engine.index().len(),
                engine.index().dimension(),
                config.rag.index_path.display()
            );
        }
        Commands::InitConfig { output } => {
            config
                .save_to_file(&output)
                .with_context(|| format!("writing {}", output.display()))?;
            println!("Wrote {}", output.display());
        }
    }

    Ok(())
}

fn init_logging() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Explicit path must exist; the implicit default falls back to built-in defaults
fn load_config(path: Option<&Path>) -> Result<DetectionConfig> {
    match path {
        Some(path) => DetectionConfig::from_file(path)
            .with_context(|| format!("loading configuration {}", path.display())),
        None if Path::new(DEFAULT_CONFIG).exists() => {
            info!("Using configuration {}", DEFAULT_CONFIG);
            Ok(DetectionConfig::from_file(Path::new(DEFAULT_CONFIG))?)
        }
        None => {
            warn!("No {} found, using default configuration", DEFAULT_CONFIG);
            Ok(DetectionConfig::default())
        }
    }
}
