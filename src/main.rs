use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use flow_trainer::checkpoint::{
    list_named, list_numbered, read_record, CheckpointRecord, CheckpointStore, ModelTag,
    RetentionPolicy,
};
use flow_trainer::config::AppConfig;
use flow_trainer::training::state::Stats;

/// Inspect and maintain optical-flow training checkpoints.
#[derive(Parser)]
#[command(name = "flowtrain", about = "Inspect and maintain training checkpoints")]
struct Cli {
    /// Path to TOML configuration file
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List checkpoints in the project directory
    List {
        /// Directory to list instead of the configured project directory
        #[arg(long)]
        dir: Option<PathBuf>,

        /// Only list numbered checkpoints of this model type
        #[arg(long)]
        model: Option<String>,
    },
    /// Print the metadata of one checkpoint file
    Show {
        path: PathBuf,

        /// Include per-epoch stats
        #[arg(long)]
        stats: bool,
    },
    /// Delete all but the newest numbered checkpoints of a model type
    Prune {
        #[arg(long)]
        model: String,

        /// Override env.keep_last_checkpoints
        #[arg(long)]
        keep: Option<usize>,

        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Print a configuration file with every default filled in
    Config,
}

/// What `show` prints. Weights and optimizer state are reported by size only.
#[derive(Serialize)]
struct CheckpointSummary {
    path: PathBuf,
    format_version: u32,
    epoch: u32,
    actor_type: String,
    net_type: String,
    state_dict_bytes: usize,
    optimizer_bytes: usize,
    has_lr_scheduler: bool,
    net_info: Option<String>,
    constructor: Option<String>,
    best_val: Option<f64>,
    epoch_of_best_val: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    stats: Option<Stats>,
}

impl CheckpointSummary {
    fn new(path: &Path, record: CheckpointRecord, with_stats: bool) -> Self {
        CheckpointSummary {
            path: path.to_path_buf(),
            format_version: record.format_version,
            epoch: record.epoch,
            actor_type: record.actor_type,
            net_type: record.net_type,
            state_dict_bytes: record.state_dict.len(),
            optimizer_bytes: record.optimizer.len(),
            has_lr_scheduler: record.lr_scheduler.is_some(),
            net_info: record.net_info,
            constructor: record
                .constructor
                .map(|c| format!("{}.{}", c.fun_module, c.fun_name)),
            best_val: record.best_val.is_finite().then_some(record.best_val),
            epoch_of_best_val: record.epoch_of_best_val,
            stats: with_stats.then_some(record.stats),
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Config => {
            let toml = AppConfig::default_toml().context("serializing default config")?;
            print!("{toml}");
        }
        Command::Show { path, stats } => {
            let record = read_record(&path)
                .with_context(|| format!("reading checkpoint {}", path.display()))?;
            let summary = CheckpointSummary::new(&path, record, stats);
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Command::List { dir, model } => {
            let dir = match dir {
                Some(dir) => dir,
                None => project_dir(&cli.config)?,
            };
            let entries = list_numbered(&dir)
                .with_context(|| format!("listing checkpoints in {}", dir.display()))?;
            let mut shown = 0;
            for entry in entries
                .iter()
                .filter(|e| model.as_deref().map_or(true, |m| e.model_type == m))
            {
                println!("{:>6}  {:<16}  {}", entry.epoch, entry.model_type, entry.path.display());
                shown += 1;
            }
            for path in list_named(&dir)? {
                println!("{:>6}  {:<16}  {}", "-", "named", path.display());
                shown += 1;
            }
            if shown == 0 {
                println!("No checkpoints in {}", dir.display());
            }
        }
        Command::Prune { model, keep, dir } => {
            let config = AppConfig::load_or_default(&cli.config)
                .with_context(|| format!("loading config from {}", cli.config.display()))?;
            let keep_last_n = keep.unwrap_or(config.env.keep_last_checkpoints);
            if keep_last_n == 0 {
                bail!("--keep must be at least 1");
            }
            let tag = ModelTag::new(model)?;
            let store = match dir {
                Some(dir) => CheckpointStore::new(&dir, Path::new(""), tag),
                None => {
                    let workspace = config
                        .env
                        .workspace()
                        .context("env.workspace_dir is not set and no --dir was given")?;
                    CheckpointStore::new(&workspace, &config.env.project_path, tag)
                }
            };
            let removed = store
                .prune(RetentionPolicy { keep_last_n })
                .with_context(|| format!("pruning {}", store.dir().display()))?;
            for path in &removed {
                println!("removed {}", path.display());
            }
            println!("{} checkpoint(s) removed", removed.len());
        }
    }

    Ok(())
}

/// `{workspace}/{project_path}` from the config file.
fn project_dir(config_path: &Path) -> Result<PathBuf> {
    let config = AppConfig::load_or_default(config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;
    let workspace = config
        .env
        .workspace()
        .context("env.workspace_dir is not set and no --dir was given")?;
    Ok(workspace.join(&config.env.project_path))
}
