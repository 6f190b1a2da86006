//! AVD Pilot command line harness
//!
//! Small entry points for CI scripts: list or track devices and boot an AVD.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use avd_pilot::commands::{BootCommand, DevicesCommand, ListAvdsCommand, WatchCommand};
use avd_pilot::core::{PilotConfig, VERSION};
use avd_pilot::emulator::EmulatorOptions;

#[derive(Parser)]
#[command(name = "avd-pilot")]
#[command(about = "Unattended Android emulator provisioning for CI")]
#[command(version)]
struct Cli {
    /// Android SDK root, overrides the configured one
    #[arg(long, global = true)]
    sdk_root: Option<PathBuf>,

    /// Configuration file (default: platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List devices known to the ADB daemon
    Devices {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Print device list changes until Ctrl-C
    Watch,

    /// List available AVDs
    Avds,

    /// Boot an AVD and wait until it is ready
    Boot {
        /// AVD name
        avd: String,

        /// Show the emulator window
        #[arg(long)]
        window: bool,

        /// Wipe user data before booting
        #[arg(long)]
        wipe_data: bool,

        /// Boot timeout in seconds (0 = configured default)
        #[arg(long, default_value_t = 0)]
        timeout: u64,

        /// Keep the emulator running until Ctrl-C
        #[arg(long)]
        hold: bool,

        /// Additional arguments to pass to the emulator
        #[arg(last = true)]
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    let cli = Cli::parse();
    info!("avd-pilot v{}", VERSION);

    let mut config = match &cli.config {
        Some(path) => PilotConfig::load_from(path).await?,
        None => PilotConfig::load().await?,
    };
    if let Some(sdk_root) = cli.sdk_root {
        config.tools.sdk_root = Some(sdk_root);
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            on_interrupt.cancel();
        }
    });

    match cli.command {
        Commands::Devices { json } => DevicesCommand { json }.execute(&config, cancel).await,
        Commands::Watch => WatchCommand.execute(&config, cancel).await,
        Commands::Avds => ListAvdsCommand.execute(&config).await,
        Commands::Boot { avd, window, wipe_data, timeout, hold, args } => {
            let mut options = EmulatorOptions::headless();
            options.no_window = !window;
            options.wipe_data = wipe_data;
            options.extra_args = args;

            let timeout = if timeout == 0 {
                config.emulator.boot_timeout()
            } else {
                Duration::from_secs(timeout)
            };

            BootCommand {
                avd_name: avd,
                options,
                timeout,
                hold,
            }
            .execute(&config, cancel)
            .await
        }
    }
}
