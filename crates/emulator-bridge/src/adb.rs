//! ADB (Android Debug Bridge) CLI adapter
//!
//! Shells out to the `adb` executable for one-shot queries. The executable
//! starts the daemon on demand, which makes it the robust path for "is this
//! device there" questions and for emulator console commands such as
//! `emu avd name` and `emu kill`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use avd_pilot_core::config::ToolPaths;
use avd_pilot_core::error::PilotError;
use avd_pilot_core::process::{ProcessError, ProcessOutput, ProcessSpec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::device::{parse_device_list, Device};

/// ADB errors
#[derive(Debug, thiserror::Error)]
pub enum AdbError {
    #[error("Connection to adb server failed: {0}")]
    Connection(#[from] std::io::Error),
    #[error("Connection closed by adb server")]
    ConnectionClosed,
    #[error("Command '{command}' rejected: {reason}")]
    CommandRejected { command: String, reason: String },
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Command is {0} bytes, a frame holds at most 65535")]
    CommandTooLong(usize),
    #[error("Operation cancelled")]
    Cancelled,
    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// What the emulator lifecycle needs from adb
#[async_trait]
pub trait DeviceBridge: Send + Sync {
    /// Actionable devices; offline entries are excluded
    async fn list_devices(&self) -> Result<Vec<Device>, AdbError>;

    /// AVD name reported by an emulator's console
    async fn emulator_name(&self, serial: &str) -> Result<Option<String>, AdbError>;

    /// Run a shell command on the device and return its output lines
    async fn shell(&self, serial: &str, command: &str) -> Result<Vec<String>, AdbError>;

    /// Ask an emulator to shut itself down through its console
    async fn emu_kill(&self, serial: &str) -> Result<bool, AdbError>;
}

/// Restarting the local daemon, used when the wire client can't reach it
#[async_trait]
pub trait ServerControl: Send + Sync {
    async fn kill_server(&self) -> Result<(), AdbError>;
    async fn start_server(&self) -> Result<(), AdbError>;
}

/// ADB CLI client
#[derive(Debug, Clone)]
pub struct AdbCli {
    adb_path: PathBuf,
    cancel: Option<CancellationToken>,
}

impl AdbCli {
    pub fn new(adb_path: impl Into<PathBuf>) -> Self {
        Self {
            adb_path: adb_path.into(),
            cancel: None,
        }
    }

    pub fn from_tools(tools: &ToolPaths) -> Result<Self, PilotError> {
        Ok(Self::new(tools.adb()?))
    }

    /// Kill in-flight adb invocations when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Get the ADB executable path
    pub fn path(&self) -> &Path {
        &self.adb_path
    }

    /// Check if ADB is available
    pub fn is_available(&self) -> bool {
        self.adb_path.exists()
    }

    /// Start building an arbitrary adb invocation
    pub fn command(&self) -> AdbCommand<'_> {
        AdbCommand::new(self)
    }

    /// Run an ADB command
    async fn run(&self, args: &[&str]) -> Result<ProcessOutput, AdbError> {
        let mut spec = ProcessSpec::new(&self.adb_path).args(args);
        if let Some(token) = &self.cancel {
            spec = spec.cancel_on(token.clone());
        }

        Ok(spec.run().await?)
    }

    /// Run an ADB command for a specific device
    async fn run_for_device(&self, serial: &str, args: &[&str]) -> Result<ProcessOutput, AdbError> {
        let mut full_args = vec!["-s", serial];
        full_args.extend(args);
        self.run(&full_args).await
    }

    /// Start the ADB server
    pub async fn start_server(&self) -> Result<(), AdbError> {
        self.run(&["start-server"]).await?;
        Ok(())
    }

    /// Kill the ADB server
    pub async fn kill_server(&self) -> Result<(), AdbError> {
        self.run(&["kill-server"]).await?;
        Ok(())
    }

    /// First line of `adb version`
    pub async fn version(&self) -> Result<String, AdbError> {
        let output = self.run(&["version"]).await?;
        Ok(output.stdout.into_iter().find(|l| !l.trim().is_empty()).unwrap_or_default())
    }

    /// List connected devices
    pub async fn devices(&self) -> Result<Vec<Device>, AdbError> {
        let output = self.run(&["devices", "-l"]).await?;
        Ok(parse_device_list(&output.stdout_text()))
    }

    /// Run a shell command on device
    pub async fn shell(&self, serial: &str, command: &str) -> Result<Vec<String>, AdbError> {
        let output = self.run_for_device(serial, &["shell", command]).await?;
        Ok(output.stdout)
    }

    /// Get device property
    pub async fn get_prop(&self, serial: &str, prop: &str) -> Result<String, AdbError> {
        let lines = self.shell(serial, &format!("getprop {}", prop)).await?;
        Ok(lines.join("\n").trim().to_string())
    }

    /// `adb -s <serial> emu kill`; true when the console acknowledged it
    pub async fn emu_kill(&self, serial: &str) -> Result<bool, AdbError> {
        let output = self.run_for_device(serial, &["emu", "kill"]).await?;
        let acknowledged = output.interleaved.iter().any(|line| {
            let line = line.to_ascii_lowercase();
            line.contains("stopping emulator") || line.contains("killing emulator") || line.trim() == "ok"
        });

        debug!("emu kill {}: acknowledged={}", serial, acknowledged);
        Ok(acknowledged)
    }

    /// `adb -s <serial> emu avd name`
    pub async fn emulator_name(&self, serial: &str) -> Result<Option<String>, AdbError> {
        let output = self.run_for_device(serial, &["emu", "avd", "name"]).await?;
        Ok(parse_avd_name(&output.stdout))
    }

    /// Pull a file from device
    pub async fn pull(&self, serial: &str, remote: &str, local: &Path) -> Result<(), AdbError> {
        let local_str = local.to_string_lossy();
        self.run_for_device(serial, &["pull", remote, &local_str]).await?;
        Ok(())
    }

    /// Push a file to device
    pub async fn push(&self, serial: &str, local: &Path, remote: &str) -> Result<(), AdbError> {
        let local_str = local.to_string_lossy();
        self.run_for_device(serial, &["push", &local_str, remote]).await?;
        Ok(())
    }

    /// Install an APK
    pub async fn install(
        &self,
        serial: &str,
        apk_path: &Path,
        options: &InstallOptions,
    ) -> Result<(), AdbError> {
        let path_str = apk_path.to_string_lossy();
        let mut args = vec!["install"];
        args.extend(options.flags());
        args.push(&path_str);

        self.run_for_device(serial, &args).await?;
        Ok(())
    }

    /// Uninstall a package
    pub async fn uninstall(&self, serial: &str, package: &str, keep_data: bool) -> Result<(), AdbError> {
        let args = if keep_data {
            vec!["uninstall", "-k", package]
        } else {
            vec!["uninstall", package]
        };

        self.run_for_device(serial, &args).await?;
        Ok(())
    }
}

#[async_trait]
impl DeviceBridge for AdbCli {
    async fn list_devices(&self) -> Result<Vec<Device>, AdbError> {
        self.devices().await
    }

    async fn emulator_name(&self, serial: &str) -> Result<Option<String>, AdbError> {
        AdbCli::emulator_name(self, serial).await
    }

    async fn shell(&self, serial: &str, command: &str) -> Result<Vec<String>, AdbError> {
        AdbCli::shell(self, serial, command).await
    }

    async fn emu_kill(&self, serial: &str) -> Result<bool, AdbError> {
        AdbCli::emu_kill(self, serial).await
    }
}

#[async_trait]
impl ServerControl for AdbCli {
    async fn kill_server(&self) -> Result<(), AdbError> {
        AdbCli::kill_server(self).await
    }

    async fn start_server(&self) -> Result<(), AdbError> {
        AdbCli::start_server(self).await
    }
}

/// The console answers `<name>` followed by `OK`
fn parse_avd_name(lines: &[String]) -> Option<String> {
    let name = lines
        .iter()
        .map(|l| l.trim())
        .find(|l| !l.is_empty() && !l.eq_ignore_ascii_case("ok"))?;

    if name.starts_with("KO:") || name.starts_with("error:") {
        warn!("Emulator console refused avd name: {}", name);
        return None;
    }

    Some(name.to_string())
}

/// APK install options
#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    /// Replace existing app
    pub replace: bool,
    /// Allow version downgrade
    pub allow_downgrade: bool,
    /// Grant all permissions
    pub grant_permissions: bool,
    /// Allow test packages
    pub allow_test_packages: bool,
}

impl InstallOptions {
    fn flags(&self) -> Vec<&'static str> {
        let mut flags = Vec::new();
        if self.replace {
            flags.push("-r");
        }
        if self.allow_downgrade {
            flags.push("-d");
        }
        if self.grant_permissions {
            flags.push("-g");
        }
        if self.allow_test_packages {
            flags.push("-t");
        }
        flags
    }
}

/// ADB command builder
pub struct AdbCommand<'a> {
    cli: &'a AdbCli,
    serial: Option<String>,
    args: Vec<String>,
}

impl<'a> AdbCommand<'a> {
    fn new(cli: &'a AdbCli) -> Self {
        Self {
            cli,
            serial: None,
            args: Vec::new(),
        }
    }

    pub fn device(mut self, serial: &str) -> Self {
        self.serial = Some(serial.to_string());
        self
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.args.push(arg.to_string());
        self
    }

    pub fn args(mut self, args: &[&str]) -> Self {
        self.args.extend(args.iter().map(|s| s.to_string()));
        self
    }

    pub async fn run(self) -> Result<ProcessOutput, AdbError> {
        let args: Vec<&str> = self.args.iter().map(|s| s.as_str()).collect();

        if let Some(serial) = &self.serial {
            self.cli.run_for_device(serial, &args).await
        } else {
            self.cli.run(&args).await
        }
    }
}
