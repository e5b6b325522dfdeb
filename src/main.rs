//! Mount a document store as a read-only filesystem.
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use docfs::path::ObjectPath;
use tracing::{debug, error, info};

mod app_config;
mod daemon;
mod trc;

use crate::app_config::Config;
use crate::trc::Trc;

#[derive(Parser)]
#[command(version, about = "Mount a document store as a read-only filesystem.")]
struct Args {
    #[arg(
        short,
        long,
        value_parser,
        env = "DOCFS_CONFIG",
        help = "Optional path to a docfs config TOML."
    )]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Mount the store and serve it until interrupted.
    Run {
        /// Run the daemon in the background.
        #[arg(short, long, help = "Run the daemon in the background.")]
        daemonize: bool,
    },

    /// Validate the configuration and check that the store is reachable.
    Check,
}

fn init_tracing(trc: Trc) {
    if let Err(e) = trc.init() {
        eprintln!(
            "Failed to initialize logging. Without logging, we can't provide any useful error \
             messages, so we have to exit: {e}"
        );
        std::process::exit(1);
    }
}

/// Start the background daemon. Only returns in the daemonized child.
fn daemonize(config: &Config) -> Result<(), String> {
    // Safe: Config.validate() guarantees pid_file's parent exists.
    let pid_file_parent = config
        .daemon
        .pid_file
        .parent()
        .unwrap_or_else(|| unreachable!("Config.validate() ensures pid_file has a parent"));
    std::fs::create_dir_all(pid_file_parent)
        .map_err(|e| format!("Failed to create PID file directory: {e}"))?;

    let mut daemonize = daemonize::Daemonize::new()
        .pid_file(&config.daemon.pid_file)
        .chown_pid_file(true)
        .user(config.uid)
        .group(config.gid);

    if let Some(log_path) = &config.daemon.log_file {
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create log directory: {e}"))?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .map_err(|e| format!("Failed to open log file: {e}"))?;
        let clone = file
            .try_clone()
            .map_err(|e| format!("Failed to clone log file handle: {e}"))?;
        daemonize = daemonize.stdout(file).stderr(clone);
    }

    daemonize
        .start()
        .map_err(|e| format!("Failed to spawn the daemon: {e}"))
}

fn check(config: &Config) -> Result<(), String> {
    let ctx = daemon::connect(config).map_err(|e| format!("Store is not reachable: {e}"))?;
    let root = ctx
        .list(&ObjectPath::root())
        .map_err(|e| format!("Failed to list the store root: {e}"))?;
    info!(entries = root.len(), "Store is reachable.");
    ctx.shutdown()
        .map_err(|e| format!("Failed to tear down the check mount: {e}"))?;
    Ok(())
}

/// Main entry point for the application.
fn main() {
    let args = Args::parse();

    // Errors use eprintln since tracing isn't initialized yet.
    let config = Config::load(args.config_path.as_deref()).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        std::process::exit(1);
    });
    if let Err(error_messages) = config.validate() {
        eprintln!("Configuration is invalid.");
        for msg in &error_messages {
            eprintln!(" - {msg}");
        }
        std::process::exit(1);
    }

    match args.command.unwrap_or(Command::Run { daemonize: false }) {
        Command::Run { daemonize: true } => {
            // Forking first: the tracing subscriber must be installed in the daemonized child.
            if let Err(msg) = daemonize(&config) {
                eprintln!("{msg}");
                std::process::exit(1);
            }
            init_tracing(Trc::daemon());
            debug!(config = ?config, "Initialized daemon with configuration.");
            if let Err(e) = daemon::spawn(config) {
                error!("Daemon failed: {e}");
                std::process::exit(1);
            }
        }
        Command::Run { daemonize: false } => {
            init_tracing(Trc::default());
            if let Err(e) = daemon::spawn(config) {
                error!("Daemon failed: {e}");
                std::process::exit(1);
            }
        }
        Command::Check => {
            init_tracing(Trc::default());
            if let Err(msg) = check(&config) {
                error!("{msg}");
                std::process::exit(1);
            }
            info!("Configuration OK.");
        }
    }
}
