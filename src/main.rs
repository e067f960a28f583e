use anyhow::{ensure, Context, Result};
use clap::Parser;
use odata_sync::{config, sync};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "odata-sync", about = "Mirror OData feeds into SQL tables")]
struct Args {
    /// Directory scanned for `*.yaml` / `*.yml` job files.
    #[arg(long, default_value = ".")]
    jobs_dir: PathBuf,

    /// Print an example job file and exit.
    #[arg(long)]
    example: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if args.example {
        print!("{}", config::example());
        return Ok(());
    }

    let files = job_files(&args.jobs_dir)?;
    ensure!(
        !files.is_empty(),
        "no job files found in {}",
        args.jobs_dir.display()
    );

    init_tracing(&files);
    sqlx::any::install_default_drivers();

    // Job files run one after another; a failed file never stops the rest.
    for path in &files {
        if let Err(err) = sync::run_job_file(path).await {
            error!(path = %path.display(), ?err, "job file failed");
        }
    }
    Ok(())
}

fn job_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        if matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        ) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// `RUST_LOG` wins; otherwise any job file asking for verbose logging turns
/// on debug output for the whole run.
fn init_tracing(files: &[PathBuf]) {
    let filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(directives) if !directives.is_empty() => EnvFilter::new(directives),
        _ => {
            let verbose = files.iter().any(|path| {
                config::load(path)
                    .map(|cfg| cfg.global_config.is_verbose())
                    .unwrap_or(false)
            });
            EnvFilter::new(if verbose { "debug" } else { "info" })
        }
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}
