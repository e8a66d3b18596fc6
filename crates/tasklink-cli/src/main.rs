//! tasklink CLI - start, cancel, dismiss and watch Registry tasks.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast::error::RecvError;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tasklink_client::{
    ClientConfig, CommandGateway, StoreSnapshot, TaskLink, TaskStore, TerminalNotice,
};
use tasklink_core::{
    AdoptRepairMetadata, DownloadMetadata, InstallMetadata, RunMetadata, TaskHandle, TaskRecord,
};

/// tasklink - track long-running Registry tasks
#[derive(Parser)]
#[command(name = "tasklink")]
#[command(about = "Client for the task Registry", long_about = None)]
struct Cli {
    /// Base URL of the Registry task endpoints
    #[arg(long, default_value = "http://127.0.0.1:7860/api/tasks")]
    base_url: String,

    /// Status channel URL (defaults to <base-url>/events over ws/wss)
    #[arg(long)]
    channel_url: Option<String>,

    /// Timeout for each command call, in seconds
    #[arg(long, default_value = "10")]
    timeout_secs: u64,

    /// Log level when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download a file from a repository
    #[command(name = "start-download")]
    StartDownload {
        #[arg(long)]
        repo: String,

        #[arg(long)]
        file: String,

        #[arg(long)]
        target_path: Option<String>,

        /// Make the file active once the download completes
        #[arg(long)]
        activate: bool,
    },

    /// Install an environment
    #[command(name = "start-install")]
    StartInstall {
        #[arg(long)]
        environment: String,

        #[arg(long)]
        target_path: String,

        /// Make the environment active once the install completes
        #[arg(long)]
        activate: bool,
    },

    /// Launch an environment
    #[command(name = "start-run")]
    StartRun {
        #[arg(long)]
        environment: String,

        #[arg(long)]
        target_path: Option<String>,

        /// Extra launch argument (repeatable)
        #[arg(long = "arg", allow_hyphen_values = true)]
        args: Vec<String>,
    },

    /// Repair an adopted installation
    #[command(name = "start-adopt-repair")]
    StartAdoptRepair {
        #[arg(long)]
        path: String,

        #[arg(long)]
        environment: Option<String>,
    },

    /// Ask the Registry to cancel a task
    Cancel {
        /// Task handle
        handle: String,
    },

    /// Dismiss a finished task
    Dismiss {
        /// Task handle
        handle: String,
    },

    /// Print every task the Registry knows
    List,

    /// Follow task updates until Ctrl-C
    Watch,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr so stdout stays machine-readable.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = client_config(&cli);

    if let Commands::Watch = cli.command {
        return watch(config).await;
    }

    let (store, _store_task) = TaskStore::spawn(config.store_queue_capacity, config.notice_capacity);
    let gateway = CommandGateway::new(&config, store)?;

    match cli.command {
        Commands::StartDownload {
            repo,
            file,
            target_path,
            activate,
        } => {
            let record = gateway
                .start_download(DownloadMetadata {
                    repo,
                    file,
                    target_path,
                    set_as_active_on_completion: activate,
                })
                .await?;
            print_json(&record)?;
        }
        Commands::StartInstall {
            environment,
            target_path,
            activate,
        } => {
            let record = gateway
                .start_install(InstallMetadata {
                    environment,
                    target_path,
                    set_as_active_on_completion: activate,
                })
                .await?;
            print_json(&record)?;
        }
        Commands::StartRun {
            environment,
            target_path,
            args,
        } => {
            let record = gateway
                .start_run(RunMetadata {
                    environment,
                    target_path,
                    args,
                })
                .await?;
            print_json(&record)?;
        }
        Commands::StartAdoptRepair { path, environment } => {
            let record = gateway
                .start_adopt_repair(AdoptRepairMetadata { path, environment })
                .await?;
            print_json(&record)?;
        }
        Commands::Cancel { handle } => {
            // Terminal tasks are answered locally, which needs their status.
            gateway.load_snapshot().await?;
            let outcome = gateway.cancel(&TaskHandle::new(handle)).await?;
            println!("{}", outcome.message);
        }
        Commands::Dismiss { handle } => {
            // The store needs the task's status before it will dismiss.
            gateway.load_snapshot().await?;
            let handle = TaskHandle::new(handle);
            gateway.dismiss(&handle).await?;
            println!("Task {handle} dismissed");
        }
        Commands::List => {
            let records = gateway.snapshot().await?;
            print_json(&records)?;
        }
        Commands::Watch => {}
    }

    gateway.store().shutdown().await;
    Ok(())
}

fn client_config(cli: &Cli) -> ClientConfig {
    let mut config = ClientConfig::for_base_url(&cli.base_url)
        .with_request_timeout(Duration::from_secs(cli.timeout_secs));
    if let Some(url) = &cli.channel_url {
        config.channel_url = url.clone();
    }
    config
}

async fn watch(config: ClientConfig) -> Result<(), Box<dyn std::error::Error>> {
    let link = TaskLink::start(config)?;
    let mut changes = link.store().subscribe();
    let mut notices = link.store().terminal_notices();
    let mut last = Arc::new(StoreSnapshot::default());

    info!("Watching tasks, press Ctrl-C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,

            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = changes.borrow_and_update().clone();
                print_changes(&last, &current);
                last = current;
            }

            notice = notices.recv() => match notice {
                Ok(notice) => print_notice(&notice),
                Err(RecvError::Lagged(missed)) => {
                    eprintln!("missed {missed} terminal notices");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    link.shutdown().await;
    Ok(())
}

fn print_changes(last: &StoreSnapshot, current: &StoreSnapshot) {
    let now = chrono::Utc::now().format("%H:%M:%S");

    if last.connection != current.connection {
        println!("{now}  channel {}", current.connection.label());
    }
    for (handle, record) in &current.tasks {
        if last.get(handle) != Some(record) {
            println!("{now}  {}", task_line(record));
        }
    }
    for handle in last.tasks.keys() {
        if current.get(handle).is_none() {
            println!("{now}  {:<16}  removed", handle.as_str());
        }
    }
}

fn print_notice(notice: &TerminalNotice) {
    let record = &notice.record;
    match &record.error_detail {
        Some(detail) => println!("task {} finished: {} ({detail})", record.handle, record.status),
        None => println!("task {} finished: {}", record.handle, record.status),
    }
    if notice.set_as_active_on_completion() {
        println!("task {} result should be made active", record.handle);
    }
}

fn task_line(record: &TaskRecord) -> String {
    let counters = record
        .counters
        .map(|c| format!("  {}/{}", c.done, c.total))
        .unwrap_or_default();
    format!(
        "{:<16}  {:<12}  {:<10}  {:>5.1}%{}",
        record.handle.as_str(),
        record.kind().as_str(),
        record.status.as_str(),
        record.progress,
        counters
    )
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), serde_json::Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
