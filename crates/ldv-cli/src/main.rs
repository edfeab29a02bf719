use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use ldv_pipeline::{load_column_registry, MergeConfig, MergeOutcome, MergePipeline};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "ldv-cli")]
#[command(about = "Lead Drop Vault command-line interface")]
struct Cli {
    /// Directory for the append-only run log (ldv.log); stderr-only when unset.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one merge against the target directories.
    Merge(TargetArgs),
    /// Serve the HTTP scheduler for the target directories.
    Serve {
        #[arg(long, default_value = "0.0.0.0:8000")]
        addr: String,
        #[command(flatten)]
        target: TargetArgs,
    },
}

#[derive(Debug, Args)]
struct TargetArgs {
    /// Directory holding the input drop files.
    #[arg(long, short)]
    input: PathBuf,
    /// Directory holding the live output version.
    #[arg(long, short)]
    output: PathBuf,
    /// Backup directory for retired versions; omit to delete on rotation.
    #[arg(long)]
    backup: Option<PathBuf>,
    #[arg(long, default_value = ldv_pipeline::DEFAULT_GLOB_PATTERN)]
    pattern: String,
    #[arg(long, default_value_t = ldv_pipeline::DEFAULT_CHUNK_SIZE)]
    chunk_size: usize,
    #[arg(long, default_value = ldv_pipeline::DEFAULT_VERSION_PREFIX)]
    prefix: String,
    /// YAML column registry (columns: [...]); defaults to the built-in schema.
    #[arg(long)]
    schema: Option<PathBuf>,
    /// Always write a new version, even when content is unchanged.
    #[arg(long)]
    overwrite: bool,
}

impl TargetArgs {
    fn into_config(self) -> Result<MergeConfig> {
        let mut config = MergeConfig::new(self.input, self.output);
        config.backup_dir = self.backup;
        config.pattern = self.pattern;
        config.chunk_size = self.chunk_size;
        config.version_prefix = self.prefix;
        config.overwrite_existing = self.overwrite;
        if let Some(path) = self.schema {
            config.schema = load_column_registry(&path)?;
        }
        Ok(config)
    }
}

fn init_telemetry(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    let Some(dir) = log_dir else {
        registry.init();
        return None;
    };
    match std::fs::create_dir_all(dir) {
        Ok(()) => {
            let appender = tracing_appender::rolling::never(dir, "ldv.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            registry
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        Err(err) => {
            // log sink failure must never abort the pipeline
            eprintln!(
                "could not open log directory {}: {err}; logging to stderr only",
                dir.display()
            );
            registry.init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_telemetry(cli.log_dir.as_deref());

    match cli.command {
        Commands::Merge(target) => {
            let config = target.into_config()?;
            let summary =
                tokio::task::spawn_blocking(move || MergePipeline::new(config).run_once())
                    .await
                    .context("merge task aborted")??;
            match &summary.outcome {
                MergeOutcome::NoInput => {
                    println!("merge complete: run_id={} no input files", summary.run_id);
                }
                MergeOutcome::Unchanged { version } => {
                    println!(
                        "merge complete: run_id={} unchanged, existing version {}",
                        summary.run_id,
                        version.display()
                    );
                }
                MergeOutcome::Written { version, backup } => {
                    println!(
                        "merge complete: run_id={} rows={} version={} backup={}",
                        summary.run_id,
                        summary.total_rows,
                        version.display(),
                        backup
                            .as_ref()
                            .map(|p| p.display().to_string())
                            .unwrap_or_else(|| "none".to_string())
                    );
                }
            }
        }
        Commands::Serve { addr, target } => {
            let config = target.into_config()?;
            ldv_web::serve(&addr, config).await?;
        }
    }

    Ok(())
}
