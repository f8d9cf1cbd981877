//! Binary entrypoint for the Tempus backup host.
//!
//! Commands:
//! - `start` - run the scheduler and accept `backup ...` commands on stdin
//! - `init` - create a starter `tempus.toml`
//! - `status` - print the schedule settings and the archives on disk
//! - `now` - take one snapshot, apply retention, and exit
//!
//! See the library crate docs for module-level details: `tempus::`.
use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{error, info};
use std::sync::Arc;
use tokio::io::BufReader;

use tempus::config::{Config, ConfigStore, JsonConfigStore};
use tempus::control::{ControlSurface, InputEnd};
use tempus::storage::{list_archives, BackupJob, BackupScheduler};

#[derive(Parser)]
#[command(name = "tempus")]
#[command(about = "Scheduled, rotating snapshots of a live world directory")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "tempus.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the backup scheduler and read operator commands from stdin
    Start,
    /// Write a default configuration file
    Init,
    /// Show schedule settings and existing archives
    Status,
    /// Take a single backup immediately and exit
    Now,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Init = cli.command {
        init_logging(&None, cli.verbose);
        Config::create_default(&cli.config).await?;
        info!("Configuration file created at {}", cli.config);
        return Ok(());
    }

    let config = Config::load_or_default(&cli.config).await?;
    init_logging(&Some(config.clone()), cli.verbose);

    let job = BackupJob::new(config.paths.world_dir(), config.paths.backup_dir());
    let store: Arc<dyn ConfigStore> = Arc::new(JsonConfigStore::new(config.paths.settings_file()));

    match cli.command {
        Commands::Start => run_host(job, store).await?,
        Commands::Status => {
            let settings = store.load()?.unwrap_or_default().normalized();
            println!(
                "Backup interval: {} minutes ({}ms)",
                settings.interval_millis / 60_000,
                settings.interval_millis
            );
            println!("Max backups: {}", settings.max_backups);
            println!("World: {}", job.source_dir.display());
            let archives = list_archives(&job.backup_dir)?;
            println!("Archives in {}: {}", job.backup_dir.display(), archives.len());
            for archive in archives.iter().rev() {
                println!("  {}", archive.file_name());
            }
        }
        Commands::Now => {
            let max_backups = store.load()?.unwrap_or_default().normalized().max_backups;
            let report = tokio::task::spawn_blocking(move || job.run_cycle(max_backups as usize)).await?;
            if !report.succeeded() {
                std::process::exit(1);
            }
        }
        // Written before logging was configured
        Commands::Init => {}
    }

    Ok(())
}

async fn run_host(job: BackupJob, store: Arc<dyn ConfigStore>) -> Result<()> {
    info!("Starting Tempus v{}", env!("CARGO_PKG_VERSION"));
    let scheduler = BackupScheduler::init(job, store)?;
    let control = ControlSurface::new(scheduler.clone());
    info!("Accepting backup commands on stdin (type 'stop' to exit)");

    let commands = control.serve(BufReader::new(tokio::io::stdin()), tokio::io::stdout());
    tokio::select! {
        ended = commands => match ended {
            Ok(InputEnd::Stop) => info!("Stop requested"),
            Ok(InputEnd::Closed) => {
                // Detached runs have no stdin; keep the schedule alive.
                info!("Command input closed; running until interrupted");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!("Failed to wait for interrupt: {}", e);
                }
            }
            Err(e) => error!("Failed to read command input: {}", e),
        },
        _ = tokio::signal::ctrl_c() => info!("Interrupt received"),
    }

    info!("Waiting for running backups to finish...");
    scheduler.shutdown().await;
    Ok(())
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let base_level = match (verbosity, config) {
        (0, Some(cfg)) => cfg.logging.level_filter(),
        (0, None) => log::LevelFilter::Info,
        (1, _) => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config
        .as_ref()
        .and_then(|cfg| cfg.logging.file.as_ref())
        .and_then(|file| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(file)
                .ok()
        });

    if let Some(f) = log_file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Echo to the console only when someone is watching it
        let is_tty = atty::is(atty::Stream::Stdout);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            writeln!(fmt, "{} [{}] {}", ts, record.level(), record.args())
        });
    }
    let _ = builder.try_init();
}
