use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use dlman::{
    create_engine, EngineOptions, FileStore, ManagerConfig, Result, TaskId, TaskManager,
    TaskOptions, TaskState,
};

#[derive(Parser)]
#[command(name = "dlman")]
#[command(about = "Download task manager with pause/resume and durable state")]
struct Cli {
    /// Directory holding task records
    #[arg(long, default_value = "./data", global = true)]
    data_dir: PathBuf,

    /// Destination directory for downloaded files
    #[arg(long, global = true)]
    output_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a URL without starting the transfer
    New {
        url: String,

        /// Media format hint
        #[arg(long)]
        format: Option<String>,

        /// Rate cap in bytes per second
        #[arg(long)]
        rate_limit: Option<u64>,

        /// Retry attempts for transient failures
        #[arg(long)]
        retries: Option<u32>,
    },

    /// Register a URL (if needed) and run the transfer to completion
    Fetch {
        url: String,

        /// Restart from scratch, discarding stored progress
        #[arg(long)]
        fresh: bool,
    },

    /// Show the stored status of a task, by identifier or URL
    Status { target: String },

    /// List all known tasks
    List,
}

fn task_options(
    format: Option<String>,
    rate_limit: Option<u64>,
    retries: Option<u32>,
    output_dir: Option<PathBuf>,
) -> TaskOptions {
    let mut options = TaskOptions::new();
    options.format = format;
    options.rate_limit = rate_limit;
    options.retries = retries;
    options.output_dir = output_dir;
    options
}

/// Resolve a CLI target to an identifier: a well-formed identifier is used
/// as-is, anything else is treated as a URL.
fn resolve_target(target: &str) -> TaskId {
    TaskId::parse(target).unwrap_or_else(|_| TaskId::derive(target))
}

async fn run_fetch(manager: &TaskManager, url: &str, options: TaskOptions, fresh: bool) -> Result<()> {
    let id = manager.new_task(url, &options).await?;
    manager.start_task(&id, true, fresh).await?;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(500)) => {
                let status = manager.task_status(&id).await?;
                match status.state {
                    TaskState::Running => {
                        let total = status
                            .total_bytes
                            .map(|t| format!("/{}", t))
                            .unwrap_or_default();
                        let speed = status
                            .speed_bytes_per_sec
                            .map(|s| format!(" at {} B/s", s))
                            .unwrap_or_default();
                        println!("{} bytes{}{}", status.downloaded_bytes, total, speed);
                    }
                    TaskState::Finished => {
                        manager.finish_task(&id).await?;
                        println!("finished: {} bytes", status.downloaded_bytes);
                        return Ok(());
                    }
                    TaskState::Errored => {
                        manager.halt_task(&id).await?;
                        eprintln!(
                            "failed: {}",
                            status.error.as_deref().unwrap_or("unknown error")
                        );
                        std::process::exit(1);
                    }
                    _ => {
                        manager.halt_task(&id).await?;
                        return Ok(());
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                manager.halt_task(&id).await?;
                println!("halted");
                return Ok(());
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("dlman=info")),
        )
        .init();

    let cli = Cli::parse();

    let mut defaults = EngineOptions::from_env();
    if let Some(dir) = &cli.output_dir {
        defaults.output_dir = dir.clone();
    }
    let config = ManagerConfig::new().with_defaults(defaults);
    let engine = create_engine(config.backend);
    let store = Arc::new(FileStore::new(&cli.data_dir));
    let manager = TaskManager::new(store, engine, config);

    match cli.command {
        Commands::New {
            url,
            format,
            rate_limit,
            retries,
        } => {
            let options = task_options(format, rate_limit, retries, cli.output_dir);
            let id = manager.new_task(&url, &options).await?;
            println!("{}", id);
        }
        Commands::Fetch { url, fresh } => {
            let options = task_options(None, None, None, cli.output_dir);
            run_fetch(&manager, &url, options, fresh).await?;
        }
        Commands::Status { target } => {
            let id = resolve_target(&target);
            let status = manager.task_status(&id).await?;
            let info = manager.task_info(&id).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&serde_json::json!({
                    "id": id,
                    "info": info,
                    "status": status,
                }))
                .map_err(dlman::TaskError::from)?
            );
        }
        Commands::List => {
            for (id, status) in manager.list_tasks().await? {
                println!(
                    "{}  {:?}  {} bytes",
                    id.short(),
                    status.state,
                    status.downloaded_bytes
                );
            }
        }
    }

    Ok(())
}
