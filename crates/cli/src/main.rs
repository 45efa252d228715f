use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use lora_bench::config::BenchConfig;
use lora_bench::logging::{self, LogFormat};
use lora_bench_core::check::Precision;
use lora_bench_core::problem::OpType;
use lora_bench_core::record::{RecordStore, DEFAULT_RECORD_FILE};
use lora_bench_core::report::Reporter;
use lora_bench_core::sweep::SweepDriver;

#[derive(Parser)]
#[command(
    name = "lora-bench",
    about = "Benchmark and cross-check batched LoRA shrink/expand kernels"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Time every kernel over the parameter sweep and check their outputs
    Sweep {
        #[command(flatten)]
        overrides: SweepArgs,

        /// Skip rendering plots after the sweep
        #[arg(long)]
        no_plot: bool,
    },
    /// Render plots from an existing record document
    Plot {
        /// Config file (default: ~/.config/lora-bench/config.toml)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Record document (default: <output>/record_bgmv_lee_cudagraph.json)
        #[arg(long)]
        records: Option<PathBuf>,

        /// Directory to write plots to
        #[arg(long)]
        output: Option<PathBuf>,

        /// Batch sizes to plot (default: every batch size in the records)
        #[arg(long = "batch")]
        batches: Vec<usize>,

        /// Operations to plot (default: shrink and expand)
        #[arg(long = "op")]
        ops: Vec<OpType>,

        /// Log level when RUST_LOG is unset
        #[arg(long)]
        log_level: Option<String>,
    },
    /// Inspect or persist the configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show {
        #[command(flatten)]
        overrides: SweepArgs,
    },
    /// Write the effective configuration to the config file
    Save {
        #[command(flatten)]
        overrides: SweepArgs,
    },
}

/// Sweep settings that override the config file.
#[derive(Args)]
struct SweepArgs {
    /// Config file (default: ~/.config/lora-bench/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for the record document and plots
    #[arg(long)]
    output: Option<PathBuf>,

    /// Devices to run on (cpu, cuda, cuda:N)
    #[arg(long = "device")]
    devices: Vec<String>,

    /// Hidden sizes to sweep
    #[arg(long = "hidden-size")]
    hidden_sizes: Vec<usize>,

    /// Batch counts to sweep (0 runs as 1)
    #[arg(long = "batch")]
    batch_counts: Vec<usize>,

    /// Data types (f16, bf16, f32)
    #[arg(long = "dtype")]
    dtypes: Vec<Precision>,

    /// Operations (shrink, expand)
    #[arg(long = "op")]
    op_types: Vec<OpType>,

    /// RNG seeds
    #[arg(long = "seed")]
    seeds: Vec<u64>,

    /// Launches recorded per captured unit
    #[arg(long)]
    capture_size: Option<usize>,

    /// Timed replays per measurement
    #[arg(long)]
    replays: Option<usize>,

    /// Log level when RUST_LOG is unset
    #[arg(long)]
    log_level: Option<String>,
}

impl SweepArgs {
    fn to_config(&self) -> BenchConfig {
        fn non_empty<T: Clone>(values: &[T]) -> Option<Vec<T>> {
            (!values.is_empty()).then(|| values.to_vec())
        }
        BenchConfig {
            output_dir: self.output.clone(),
            hidden_sizes: non_empty(&self.hidden_sizes),
            batch_counts: non_empty(&self.batch_counts),
            dtypes: non_empty(&self.dtypes),
            op_types: non_empty(&self.op_types),
            seeds: non_empty(&self.seeds),
            devices: non_empty(&self.devices),
            capture_size: self.capture_size,
            replays: self.replays,
            log_level: self.log_level.clone(),
            ..Default::default()
        }
    }

    /// Config file merged with the command-line overrides.
    fn resolve(&self) -> anyhow::Result<BenchConfig> {
        let mut config = load_config(self.config.as_deref())?;
        config.merge(&self.to_config());
        Ok(config)
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<BenchConfig> {
    match path {
        Some(path) => BenchConfig::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(BenchConfig::load()),
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Sweep { overrides, no_plot } => {
            let mut config = overrides.resolve()?;
            if no_plot {
                config.plot = Some(false);
            }
            logging::init_with_level_and_format(config.log_level.as_deref(), LogFormat::from_env());
            run_sweep(&config)
        }
        Command::Plot {
            config,
            records,
            output,
            batches,
            ops,
            log_level,
        } => {
            let mut file_config = load_config(config.as_deref())?;
            file_config.merge(&BenchConfig {
                output_dir: output,
                log_level,
                ..Default::default()
            });
            logging::init_with_level_and_format(
                file_config.log_level.as_deref(),
                LogFormat::from_env(),
            );
            let records =
                records.unwrap_or_else(|| file_config.output_dir().join(DEFAULT_RECORD_FILE));
            run_plot(&file_config, &records, batches, ops)
        }
        Command::Config { action } => match action {
            ConfigAction::Show { overrides } => {
                let config = overrides.resolve()?;
                let mut effective = BenchConfig::from_sweep(&config.sweep_config());
                effective.output_dir = Some(config.output_dir());
                effective.plot = Some(config.plot_enabled());
                effective.log_level = config.log_level;
                print!("{}", effective.to_toml()?);
                Ok(())
            }
            ConfigAction::Save { overrides } => {
                let config = overrides.resolve()?;
                let mut effective = BenchConfig::from_sweep(&config.sweep_config());
                effective.output_dir = config.output_dir;
                effective.plot = config.plot;
                effective.log_level = config.log_level;
                let path = match &overrides.config {
                    Some(path) => {
                        effective.save_to(path)?;
                        path.clone()
                    }
                    None => effective.save()?,
                };
                eprintln!("Saved config to: {}", path.display());
                Ok(())
            }
        },
    }
}

fn run_sweep(config: &BenchConfig) -> anyhow::Result<()> {
    let sweep = config.sweep_config();
    let output_dir = config.output_dir();
    let record_path = output_dir.join(DEFAULT_RECORD_FILE);

    let mut store = RecordStore::new();
    let summary = SweepDriver::new(sweep.clone(), &mut store)?
        .with_record_path(&record_path)
        .run()
        .with_context(|| format!("sweep aborted; records so far are in {}", record_path.display()))?;

    tracing::info!(
        path = %record_path.display(),
        measured = summary.measured,
        skipped = summary.skipped,
        "records written"
    );

    if config.plot_enabled() {
        let written = Reporter::new(&output_dir, sweep.rank, sweep.seq_len).plot_all(
            &store,
            &sweep.batch_counts,
            &sweep.op_types,
        )?;
        tracing::info!(plots = written.len(), dir = %output_dir.display(), "plots written");
    }
    Ok(())
}

fn run_plot(
    config: &BenchConfig,
    records: &Path,
    batches: Vec<usize>,
    ops: Vec<OpType>,
) -> anyhow::Result<()> {
    let store = RecordStore::load(records)
        .with_context(|| format!("failed to load records from {}", records.display()))?;
    let sweep = config.sweep_config();

    let batches = if batches.is_empty() {
        store.batch_counts()
    } else {
        batches
    };
    let ops = if ops.is_empty() {
        OpType::ALL.to_vec()
    } else {
        ops
    };

    let written = Reporter::new(config.output_dir(), sweep.rank, sweep.seq_len)
        .plot_all(&store, &batches, &ops)?;
    if written.is_empty() {
        anyhow::bail!("no records matched the requested batch sizes and operations");
    }
    for path in &written {
        println!("{}", path.display());
    }
    Ok(())
}
