//! CLI commands for AVD Pilot
//!
//! Provides command-line interface functionality for automation and scripting.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use avd_pilot_core::{AdbServerConfig, PilotConfig, ToolPaths};
use avd_pilot_emulator_bridge::{AdbCli, AdbdClient, Device, Emulator, EmulatorOptions};

/// Wire client with `adb` as its restart fallback when the tool is configured
fn adbd_client(adb: &AdbServerConfig, tools: &ToolPaths, cancel: CancellationToken) -> AdbdClient {
    let client = AdbdClient::new(adb).with_cancellation(cancel);

    match AdbCli::from_tools(tools) {
        Ok(cli) => client.with_server_control(Arc::new(cli)),
        Err(_) => {
            warn!("adb is not configured, the ADB server will not be restarted on failures");
            client
        }
    }
}

fn print_device(device: &Device) {
    println!("{}\t{}\t{}", device.serial, device.state.as_str(), device.display_name());
}

/// List the devices known to the ADB daemon
pub struct DevicesCommand {
    pub json: bool,
}

impl DevicesCommand {
    pub async fn execute(&self, config: &PilotConfig, cancel: CancellationToken) -> Result<()> {
        let mut client = adbd_client(&config.adb, &config.tools(), cancel);
        let devices = client.list_devices().await?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&devices)?);
        } else {
            devices.iter().for_each(print_device);
        }

        Ok(())
    }
}

/// Print every device list change until cancelled
pub struct WatchCommand;

impl WatchCommand {
    pub async fn execute(&self, config: &PilotConfig, cancel: CancellationToken) -> Result<()> {
        let mut client = adbd_client(&config.adb, &config.tools(), cancel);

        info!("Tracking devices on {}", client.address());
        client
            .watch_devices(|devices| {
                println!("-- {} device(s)", devices.len());
                devices.iter().for_each(print_device);
            })
            .await?;

        Ok(())
    }
}

/// List the AVDs the emulator knows about
pub struct ListAvdsCommand;

impl ListAvdsCommand {
    pub async fn execute(&self, config: &PilotConfig) -> Result<()> {
        let emulator = Emulator::from_tools(&config.tools(), &config.emulator)?;
        for name in emulator.list_avds().await? {
            println!("{}", name);
        }
        Ok(())
    }
}

/// Boot an AVD, optionally hold it until cancelled, then shut it down
pub struct BootCommand {
    pub avd_name: String,
    pub options: EmulatorOptions,
    /// Zero waits forever
    pub timeout: Duration,
    pub hold: bool,
}

impl BootCommand {
    pub async fn execute(&self, config: &PilotConfig, cancel: CancellationToken) -> Result<()> {
        let emulator = Emulator::from_tools(&config.tools(), &config.emulator)?;
        let mut handle = emulator.start(&self.avd_name, &self.options)?;

        if !handle.wait_for_boot(self.timeout, &cancel).await {
            let state = handle.state();
            handle.shutdown().await;
            bail!("{} did not boot (state: {})", self.avd_name, state);
        }

        let serial = handle.serial().unwrap_or_default().to_string();
        info!("{} is ready as {}", self.avd_name, serial);

        if let Err(e) = handle.disable_animations().await {
            warn!("Failed to disable animations on {}: {}", serial, e);
        }
        println!("{}", serial);

        if self.hold {
            info!("Holding {} until interrupted", serial);
            cancel.cancelled().await;
        }

        if !handle.shutdown().await {
            warn!("No shutdown step succeeded for {}", self.avd_name);
        }
        let exit_code = handle.wait_for_exit().await?;
        info!("{} exited with status {}", self.avd_name, exit_code);

        Ok(())
    }
}
