//! Emulator Lifecycle
//!
//! Launches an AVD and follows it through three independently timed
//! sources of truth until it is usable:
//!
//! ```text
//! NotStarted -> Launching -> SerialResolving -> Booting -> LauncherSettling -> Ready
//!                   any -> ShuttingDown -> Stopped
//! Launching | SerialResolving | Booting -> Failed
//! ```
//!
//! The emulator process says nothing about readiness, so every step polls
//! adb on a fixed interval. Timeouts and early exits come back as `false`,
//! never as errors.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use avd_pilot_core::config::{EmulatorConfig, ToolPaths};
use avd_pilot_core::error::PilotError;
use avd_pilot_core::events::EventBus;
use avd_pilot_core::process::{
    ExitWatch, ProcessError, ProcessOutput, ProcessSpec, RunningProcess, SIGNAL_EXIT_CODE,
};
use once_cell::sync::OnceCell;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adb::{AdbCli, AdbError, DeviceBridge};
use crate::device::props;
use crate::poll::{PollResult, Poller, Probe};

/// Both boot properties in one shell round trip
const BOOT_PROBE: &str = "getprop dev.bootcomplete; getprop sys.boot_completed";
const WINDOW_DUMP: &str = "dumpsys window displays";
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Emulator errors
#[derive(Debug, thiserror::Error)]
pub enum EmulatorError {
    #[error("Emulator not found: {}", .0.display())]
    ToolNotFound(PathBuf),
    #[error("AVD name must be provided")]
    InvalidAvdName,
    #[error("Serial of {0} is not known yet")]
    SerialUnknown(String),
    #[error(transparent)]
    Process(ProcessError),
    #[error(transparent)]
    Adb(#[from] AdbError),
}

impl From<ProcessError> for EmulatorError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::ToolNotFound(path) => EmulatorError::ToolNotFound(path),
            other => EmulatorError::Process(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum LifecycleState {
    #[default]
    NotStarted,
    Launching,
    SerialResolving,
    Booting,
    LauncherSettling,
    Ready,
    ShuttingDown,
    Stopped,
    Failed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::NotStarted => "not-started",
            LifecycleState::Launching => "launching",
            LifecycleState::SerialResolving => "serial-resolving",
            LifecycleState::Booting => "booting",
            LifecycleState::LauncherSettling => "launcher-settling",
            LifecycleState::Ready => "ready",
            LifecycleState::ShuttingDown => "shutting-down",
            LifecycleState::Stopped => "stopped",
            LifecycleState::Failed => "failed",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle notifications
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmulatorEvent {
    StateChanged { avd_name: String, state: LifecycleState },
    SerialResolved { avd_name: String, serial: String },
}

/// Emulator launch options
#[derive(Debug, Clone, Default)]
pub struct EmulatorOptions {
    /// GPU mode (auto, host, swiftshader_indirect, etc.)
    pub gpu: Option<String>,
    /// Enable/disable audio
    pub no_audio: bool,
    /// Enable/disable window
    pub no_window: bool,
    /// Enable/disable boot animation
    pub no_boot_anim: bool,
    /// Cold boot
    pub no_snapshot_load: bool,
    pub no_snapshot_save: bool,
    /// Neither load nor save snapshots
    pub no_snapshot: bool,
    /// Wipe data on launch
    pub wipe_data: bool,
    /// Memory size in MB
    pub memory_mb: Option<u32>,
    pub partition_size_mb: Option<u32>,
    pub cache_size_mb: Option<u32>,
    /// Number of cores
    pub cores: Option<u32>,
    /// Console and adb port pair; takes precedence over `port`
    pub ports: Option<(u16, u16)>,
    /// Port for console
    pub port: Option<u16>,
    /// DNS servers
    pub dns_servers: Vec<String>,
    /// HTTP proxy
    pub http_proxy: Option<String>,
    pub timezone: Option<String>,
    pub verbose: bool,
    /// Additional arguments
    pub extra_args: Vec<String>,
}

impl EmulatorOptions {
    /// Options for headless/CI environments
    pub fn headless() -> Self {
        Self {
            gpu: Some("swiftshader_indirect".to_string()),
            no_audio: true,
            no_window: true,
            no_boot_anim: true,
            no_snapshot_save: true,
            ..Default::default()
        }
    }

    /// Convert to command line arguments
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        let mut flag = |name: &str, enabled: bool| {
            if enabled {
                args.push(name.to_string());
            }
        };

        flag("-no-snapshot-load", self.no_snapshot_load);
        flag("-no-snapshot-save", self.no_snapshot_save);
        flag("-no-snapshot", self.no_snapshot);
        flag("-wipe-data", self.wipe_data);
        flag("-verbose", self.verbose);
        flag("-no-window", self.no_window);
        flag("-no-audio", self.no_audio);
        flag("-no-boot-anim", self.no_boot_anim);

        let mut option = |name: &str, value: Option<String>| {
            if let Some(value) = value {
                args.push(name.to_string());
                args.push(value);
            }
        };

        option("-memory", self.memory_mb.map(|m| m.to_string()));
        option("-partition-size", self.partition_size_mb.map(|m| m.to_string()));
        option("-cache-size", self.cache_size_mb.map(|m| m.to_string()));
        option("-cores", self.cores.map(|c| c.to_string()));
        option(
            "-dns-server",
            (!self.dns_servers.is_empty()).then(|| self.dns_servers.join(",")),
        );
        option("-http-proxy", self.http_proxy.clone());

        match (self.ports, self.port) {
            (Some((console, adb)), _) => option("-ports", Some(format!("{},{}", console, adb))),
            (None, Some(port)) => option("-port", Some(port.to_string())),
            (None, None) => {}
        }

        option("-gpu", self.gpu.as_ref().map(|g| g.to_lowercase()));
        option("-timezone", self.timezone.clone());

        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// Either boot property reported "1"
fn is_boot_complete(lines: &[String]) -> bool {
    lines.iter().any(|line| line.trim() == "1")
}

/// The home launcher owns window focus
fn launcher_has_focus(lines: &[String]) -> bool {
    lines.iter().any(|line| {
        let line = line.to_ascii_lowercase();
        line.contains("mcurrentfocus") && line.contains("launcher")
    })
}

/// Serial of the running emulator whose console reports `avd_name`.
///
/// Adb failures count as "no match yet": the daemon restarts and emulator
/// consoles reject commands while booting or shutting down.
pub async fn find_serial_by_avd_name(bridge: &dyn DeviceBridge, avd_name: &str) -> Option<String> {
    let devices = match bridge.list_devices().await {
        Ok(devices) => devices,
        Err(e) => {
            debug!("Listing devices failed: {}", e);
            return None;
        }
    };

    for device in devices.iter().filter(|d| d.is_emulator()) {
        match bridge.emulator_name(&device.serial).await {
            Ok(Some(name)) if name.eq_ignore_ascii_case(avd_name) => return Some(device.serial.clone()),
            Ok(_) => {}
            Err(e) => debug!("Querying AVD name of {} failed: {}", device.serial, e),
        }
    }

    None
}

/// Launches emulators and stops running ones
pub struct Emulator {
    emulator_path: PathBuf,
    bridge: Arc<dyn DeviceBridge>,
    config: EmulatorConfig,
    events: Option<Arc<EventBus<EmulatorEvent>>>,
}

impl Emulator {
    pub fn new(emulator_path: impl Into<PathBuf>, bridge: Arc<dyn DeviceBridge>, config: EmulatorConfig) -> Self {
        Self {
            emulator_path: emulator_path.into(),
            bridge,
            config,
            events: None,
        }
    }

    /// Emulator backed by the `adb` executable
    pub fn from_tools(tools: &ToolPaths, config: &EmulatorConfig) -> Result<Self, PilotError> {
        let adb = AdbCli::from_tools(tools)?;
        Ok(Self::new(tools.emulator()?, Arc::new(adb), config.clone()))
    }

    /// Publish every lifecycle transition on `bus`
    pub fn with_events(mut self, bus: Arc<EventBus<EmulatorEvent>>) -> Self {
        self.events = Some(bus);
        self
    }

    pub fn path(&self) -> &Path {
        &self.emulator_path
    }

    /// `emulator -list-avds`
    pub async fn list_avds(&self) -> Result<Vec<String>, EmulatorError> {
        let output = ProcessSpec::new(&self.emulator_path).arg("-list-avds").run().await?;

        // Newer emulators mix `INFO | ...` lines into this output
        Ok(output
            .stdout
            .iter()
            .map(|l| l.trim())
            .filter(|l| !l.is_empty() && !l.contains(char::is_whitespace))
            .map(str::to_string)
            .collect())
    }

    /// Launch `avd_name`. The returned handle owns the emulator process.
    pub fn start(&self, avd_name: &str, options: &EmulatorOptions) -> Result<EmulatorHandle, EmulatorError> {
        if avd_name.trim().is_empty() {
            return Err(EmulatorError::InvalidAvdName);
        }

        let mut args = vec!["-avd".to_string(), avd_name.to_string()];
        args.extend(options.to_args());

        info!("Launching emulator {}", avd_name);
        debug!("Emulator args: {:?}", args);
        emit(&self.events, avd_name, LifecycleState::Launching);

        let process = match ProcessSpec::new(&self.emulator_path).args(&args).launch() {
            Ok(process) => process,
            Err(e) => {
                emit(&self.events, avd_name, LifecycleState::Failed);
                return Err(e.into());
            }
        };

        Ok(EmulatorHandle::new(
            avd_name,
            process,
            Arc::clone(&self.bridge),
            self.config.clone(),
            self.events.clone(),
        ))
    }

    /// Stop an emulator this process didn't start, found by AVD name.
    ///
    /// Returns `false` when no emulator runs `avd_name` or it is still
    /// listed once `timeout` elapsed.
    pub async fn stop_avd(&self, avd_name: &str, timeout: Duration) -> Result<bool, EmulatorError> {
        if avd_name.trim().is_empty() {
            return Err(EmulatorError::InvalidAvdName);
        }

        let Some(serial) = find_serial_by_avd_name(self.bridge.as_ref(), avd_name).await else {
            debug!("No running emulator for {}", avd_name);
            return Ok(false);
        };

        info!("Stopping {} ({})", avd_name, serial);
        if let Err(e) = self.bridge.emu_kill(&serial).await {
            debug!("emu kill {} failed: {}", serial, e);
        }

        let bridge = self.bridge.as_ref();
        let serial_ref = serial.as_str();
        let poller = Poller::new(STOP_POLL_INTERVAL, CancellationToken::new()).deadline(Instant::now() + timeout);
        let gone = poller
            .run(|| async move {
                match device_gone(bridge, serial_ref).await {
                    Some(true) => Probe::Ready(()),
                    _ => Probe::Pending,
                }
            })
            .await;

        if gone.is_ready() {
            return Ok(true);
        }

        Ok(device_gone(self.bridge.as_ref(), &serial).await.unwrap_or(false))
    }
}

/// `None` when adb couldn't be asked; it can fail transiently during shutdown
async fn device_gone(bridge: &dyn DeviceBridge, serial: &str) -> Option<bool> {
    let devices = bridge.list_devices().await.ok()?;
    Some(!devices.iter().any(|d| d.serial.eq_ignore_ascii_case(serial)))
}

fn emit(events: &Option<Arc<EventBus<EmulatorEvent>>>, avd_name: &str, state: LifecycleState) {
    if let Some(bus) = events {
        bus.emit(EmulatorEvent::StateChanged {
            avd_name: avd_name.to_string(),
            state,
        });
    }
}

/// Outcome of each shutdown step
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    steps: Vec<(&'static str, bool)>,
}

impl ShutdownReport {
    fn attempt<E: fmt::Display>(&mut self, step: &'static str, result: Result<bool, E>) {
        let ok = match result {
            Ok(ok) => ok,
            Err(e) => {
                debug!("Shutdown step {} failed: {}", step, e);
                false
            }
        };
        self.steps.push((step, ok));
    }

    /// True if any step succeeded
    pub fn succeeded(&self) -> bool {
        self.steps.iter().any(|(_, ok)| *ok)
    }

    pub fn steps(&self) -> &[(&'static str, bool)] {
        &self.steps
    }
}

/// A launched emulator
pub struct EmulatorHandle {
    avd_name: String,
    serial: OnceCell<String>,
    state: LifecycleState,
    process: RunningProcess,
    bridge: Arc<dyn DeviceBridge>,
    config: EmulatorConfig,
    events: Option<Arc<EventBus<EmulatorEvent>>>,
    /// Set once shutdown terminated the process itself
    killed: bool,
}

impl EmulatorHandle {
    pub(crate) fn new(
        avd_name: &str,
        process: RunningProcess,
        bridge: Arc<dyn DeviceBridge>,
        config: EmulatorConfig,
        events: Option<Arc<EventBus<EmulatorEvent>>>,
    ) -> Self {
        Self {
            avd_name: avd_name.to_string(),
            serial: OnceCell::new(),
            state: LifecycleState::Launching,
            process,
            bridge,
            config,
            events,
            killed: false,
        }
    }

    pub fn avd_name(&self) -> &str {
        &self.avd_name
    }

    /// ADB serial, known once resolution succeeded
    pub fn serial(&self) -> Option<&str> {
        self.serial.get().map(String::as_str)
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn has_exited(&self) -> bool {
        self.process.has_exited()
    }

    /// Emulator output captured so far
    pub fn output(&self) -> ProcessOutput {
        self.process.output()
    }

    fn transition(&mut self, state: LifecycleState) {
        if self.state == state {
            return;
        }

        debug!("{}: {} -> {}", self.avd_name, self.state, state);
        self.state = state;
        emit(&self.events, &self.avd_name, state);
    }

    fn latch_serial(&mut self, serial: String) {
        info!("{} is {}", self.avd_name, serial);
        if let Some(bus) = &self.events {
            bus.emit(EmulatorEvent::SerialResolved {
                avd_name: self.avd_name.clone(),
                serial: serial.clone(),
            });
        }
        let _ = self.serial.set(serial);
    }

    /// Wait until the guest has booted and the launcher settled.
    ///
    /// `timeout` bounds serial resolution and boot together; zero waits
    /// forever. Returns `false` when the emulator exited, the timeout
    /// elapsed or `cancel` fired.
    pub async fn wait_for_boot(&mut self, timeout: Duration, cancel: &CancellationToken) -> bool {
        match self.state {
            LifecycleState::Ready => return true,
            LifecycleState::ShuttingDown | LifecycleState::Stopped => return false,
            _ => {}
        }

        let cancel = cancel.child_token();
        let interval = self.config.poll_interval();
        let deadline = (!timeout.is_zero()).then(|| Instant::now() + timeout);
        let poller = || {
            let poller = Poller::new(interval, cancel.clone());
            match deadline {
                Some(deadline) => poller.deadline(deadline),
                None => poller,
            }
        };

        let exit = self.process.exit_watch();
        let bridge = Arc::clone(&self.bridge);

        if self.serial.get().is_none() {
            self.transition(LifecycleState::SerialResolving);
            let avd_name = self.avd_name.clone();

            let resolved = poller()
                .run(|| {
                    let exit = exit.clone();
                    let bridge = Arc::clone(&bridge);
                    let avd_name = avd_name.clone();
                    async move {
                        if exit.has_exited() {
                            return Probe::Abort;
                        }
                        match find_serial_by_avd_name(bridge.as_ref(), &avd_name).await {
                            Some(serial) => Probe::Ready(serial),
                            None => Probe::Pending,
                        }
                    }
                })
                .await;

            match resolved {
                PollResult::Ready(serial) => self.latch_serial(serial),
                other => return self.stop_waiting("resolving its serial", other),
            }
        }

        let Some(serial) = self.serial.get().cloned() else {
            return false;
        };

        self.transition(LifecycleState::Booting);
        let booted = poller()
            .run(|| {
                let exit = exit.clone();
                let bridge = Arc::clone(&bridge);
                let serial = serial.clone();
                async move {
                    if exit.has_exited() {
                        return Probe::Abort;
                    }
                    match bridge.shell(&serial, BOOT_PROBE).await {
                        Ok(lines) if is_boot_complete(&lines) => Probe::Ready(()),
                        Ok(_) => Probe::Pending,
                        Err(e) => {
                            debug!("Boot probe on {} failed: {}", serial, e);
                            Probe::Pending
                        }
                    }
                }
            })
            .await;

        if !booted.is_ready() {
            return self.stop_waiting("booting", booted);
        }
        info!("{} booted", self.avd_name);

        self.settle_launcher(&serial, poller(), &exit, &bridge).await;
        self.transition(LifecycleState::Ready);
        true
    }

    /// Best effort: wait for the launcher to own focus within the grace window
    async fn settle_launcher(
        &mut self,
        serial: &str,
        poller: Poller,
        exit: &ExitWatch,
        bridge: &Arc<dyn DeviceBridge>,
    ) {
        let grace = self.config.launcher_grace();
        if grace.is_zero() {
            return;
        }

        self.transition(LifecycleState::LauncherSettling);
        let settled = poller
            .within(grace)
            .run(|| {
                let exit = exit.clone();
                let bridge = Arc::clone(bridge);
                async move {
                    if exit.has_exited() {
                        return Probe::Abort;
                    }
                    match bridge.shell(serial, WINDOW_DUMP).await {
                        Ok(lines) if launcher_has_focus(&lines) => Probe::Ready(()),
                        _ => Probe::Pending,
                    }
                }
            })
            .await;

        match settled {
            PollResult::Ready(()) => debug!("{}: launcher has focus", self.avd_name),
            PollResult::TimedOut => info!("{}: launcher not focused after {:?}, continuing", self.avd_name, grace),
            PollResult::Aborted => warn!("{}: emulator exited while settling", self.avd_name),
            PollResult::Cancelled => debug!("{}: launcher wait cancelled", self.avd_name),
        }
    }

    fn stop_waiting<T>(&mut self, step: &str, result: PollResult<T>) -> bool {
        match result {
            PollResult::Ready(_) => return true,
            PollResult::Aborted => {
                let code = self.process.exit_code().unwrap_or(-1);
                warn!("{} exited with {} while {}", self.avd_name, code, step);
            }
            PollResult::TimedOut => warn!("{} timed out while {}", self.avd_name, step),
            PollResult::Cancelled => {
                debug!("{}: wait cancelled while {}", self.avd_name, step);
                return false;
            }
        }

        self.transition(LifecycleState::Failed);
        false
    }

    /// Turn off window, transition and animator animations
    pub async fn disable_animations(&self) -> Result<(), EmulatorError> {
        let serial = self
            .serial()
            .ok_or_else(|| EmulatorError::SerialUnknown(self.avd_name.clone()))?;

        for setting in ["window_animation_scale", "transition_animation_scale", "animator_duration_scale"] {
            self.bridge
                .shell(serial, &format!("settings put global {} 0", setting))
                .await?;
        }
        Ok(())
    }

    /// Read a system property from the booted guest
    pub async fn get_prop(&self, property: &str) -> Result<String, EmulatorError> {
        let serial = self
            .serial()
            .ok_or_else(|| EmulatorError::SerialUnknown(self.avd_name.clone()))?;
        let lines = self.bridge.shell(serial, &format!("getprop {}", property)).await?;
        Ok(lines.join("\n").trim().to_string())
    }

    /// API level of the booted guest
    pub async fn sdk_version(&self) -> Result<Option<u32>, EmulatorError> {
        Ok(self.get_prop(props::SDK_VERSION).await?.parse().ok())
    }

    /// Attempt every shutdown step and report each outcome
    pub async fn shutdown_steps(&mut self) -> ShutdownReport {
        self.transition(LifecycleState::ShuttingDown);
        let mut report = ShutdownReport::default();

        if let Some(serial) = self.serial.get() {
            report.attempt("emu kill", self.bridge.emu_kill(serial).await);
        }

        if !self.process.has_exited() {
            let killed = self.process.kill().await;
            self.killed |= killed;
            report.attempt::<AdbError>("kill", Ok(killed));
        }

        self.transition(LifecycleState::Stopped);
        debug!("{} shutdown: {:?}", self.avd_name, report.steps());
        report
    }

    /// Idempotent shutdown; true if any step succeeded
    pub async fn shutdown(&mut self) -> bool {
        self.shutdown_steps().await.succeeded()
    }

    /// Wait for the emulator process. Exit code 1 is what a console kill
    /// produces and counts as success, as does the signal exit left by
    /// [`shutdown`](Self::shutdown) killing the process.
    pub async fn wait_for_exit(self) -> Result<i32, EmulatorError> {
        let killed = self.killed;
        let output = self.process.wait_with_output().await;

        match output.exit_code {
            0 | 1 => Ok(output.exit_code),
            SIGNAL_EXIT_CODE if killed => Ok(output.exit_code),
            exit_code => Err(EmulatorError::Process(ProcessError::Failed {
                program: "emulator".to_string(),
                exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Device, DeviceState};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeBridge {
        devices: Mutex<Vec<Device>>,
        names: HashMap<String, String>,
        boot_after: usize,
        boot_polls: AtomicUsize,
        launcher_focused: AtomicBool,
        emu_kills: AtomicUsize,
    }

    impl FakeBridge {
        fn with_emulators(emulators: &[(&str, &str)]) -> Self {
            Self {
                devices: Mutex::new(
                    emulators
                        .iter()
                        .map(|(serial, _)| Device::new(*serial, DeviceState::Device))
                        .collect(),
                ),
                names: emulators
                    .iter()
                    .map(|(serial, name)| (serial.to_string(), name.to_string()))
                    .collect(),
                launcher_focused: AtomicBool::new(true),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl DeviceBridge for FakeBridge {
        async fn list_devices(&self) -> Result<Vec<Device>, AdbError> {
            Ok(self.devices.lock().unwrap().clone())
        }

        async fn emulator_name(&self, serial: &str) -> Result<Option<String>, AdbError> {
            Ok(self.names.get(serial).cloned())
        }

        async fn shell(&self, _serial: &str, command: &str) -> Result<Vec<String>, AdbError> {
            if command == BOOT_PROBE {
                let polls = self.boot_polls.fetch_add(1, Ordering::SeqCst);
                let value = if polls >= self.boot_after { "1" } else { "" };
                return Ok(vec!["".to_string(), value.to_string()]);
            }
            if command == WINDOW_DUMP {
                let focus = if self.launcher_focused.load(Ordering::SeqCst) {
                    "  mCurrentFocus=Window{1f u0 com.google.android.apps.nexuslauncher/.NexusLauncherActivity}"
                } else {
                    "  mCurrentFocus=null"
                };
                return Ok(vec![focus.to_string()]);
            }
            Ok(Vec::new())
        }

        async fn emu_kill(&self, serial: &str) -> Result<bool, AdbError> {
            if self.emu_kills.fetch_add(1, Ordering::SeqCst) > 0 {
                return Err(AdbError::Protocol("console gone".into()));
            }
            self.devices.lock().unwrap().retain(|d| d.serial != serial);
            Ok(true)
        }
    }

    fn test_config() -> EmulatorConfig {
        EmulatorConfig {
            poll_interval_ms: 10,
            launcher_grace_secs: 1,
            ..Default::default()
        }
    }

    #[test]
    fn test_headless_args() {
        let args = EmulatorOptions::headless().to_args();
        assert!(args.contains(&"-no-window".to_string()));
        assert!(args.contains(&"-no-audio".to_string()));
        assert!(args.windows(2).any(|w| w == ["-gpu", "swiftshader_indirect"]));
    }

    #[test]
    fn test_port_pair_wins() {
        let options = EmulatorOptions {
            ports: Some((5560, 5561)),
            port: Some(5554),
            memory_mb: Some(2048),
            dns_servers: vec!["8.8.8.8".into(), "1.1.1.1".into()],
            extra_args: vec!["-prop".into(), "persist.sys.language=en".into()],
            ..Default::default()
        };
        let args = options.to_args();

        assert!(args.windows(2).any(|w| w == ["-ports", "5560,5561"]));
        assert!(!args.contains(&"-port".to_string()));
        assert!(args.windows(2).any(|w| w == ["-memory", "2048"]));
        assert!(args.windows(2).any(|w| w == ["-dns-server", "8.8.8.8,1.1.1.1"]));
        assert_eq!(&args[args.len() - 2..], ["-prop", "persist.sys.language=en"]);
    }

    #[test]
    fn test_boot_complete_is_either_property() {
        let lines = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert!(is_boot_complete(&lines(&["1", ""])));
        assert!(is_boot_complete(&lines(&["", "1"])));
        assert!(is_boot_complete(&lines(&["1\r", "1"])));
        assert!(!is_boot_complete(&lines(&["", ""])));
        assert!(!is_boot_complete(&lines(&["0", "10"])));
    }

    #[test]
    fn test_launcher_focus() {
        let focused = vec![
            "  mCurrentFocus=Window{2c6 u0 com.android.launcher3/com.android.launcher3.uioverrides.QuickstepLauncher}".to_string(),
        ];
        let unfocused = vec!["  mCurrentFocus=Window{9a u0 com.android.systemui/.Keyguard}".to_string()];
        let no_focus_line = vec!["  mFocusedApp=com.android.launcher3".to_string()];

        assert!(launcher_has_focus(&focused));
        assert!(!launcher_has_focus(&unfocused));
        assert!(!launcher_has_focus(&no_focus_line));
    }

    #[test]
    fn test_shutdown_report() {
        let mut report = ShutdownReport::default();
        report.attempt("emu kill", Err::<bool, _>("refused"));
        assert!(!report.succeeded());

        report.attempt::<String>("kill", Ok(true));
        assert!(report.succeeded());
        assert_eq!(report.steps(), &[("emu kill", false), ("kill", true)]);
    }

    #[cfg(unix)]
    mod lifecycle {
        use super::*;

        fn sh(script: &str) -> RunningProcess {
            ProcessSpec::new("/bin/sh").arg("-c").arg(script).launch().unwrap()
        }

        fn handle(avd: &str, script: &str, bridge: Arc<FakeBridge>) -> EmulatorHandle {
            EmulatorHandle::new(avd, sh(script), bridge, test_config(), None)
        }

        #[tokio::test]
        async fn test_boot_reaches_ready() {
            let bridge = Arc::new(FakeBridge {
                boot_after: 2,
                ..FakeBridge::with_emulators(&[("emulator-5554", "Other"), ("emulator-5556", "pixel_5")])
            });
            let bus = Arc::new(EventBus::new());
            let events = bus.subscribe();

            let mut emulator =
                EmulatorHandle::new("Pixel_5", sh("sleep 30"), bridge.clone(), test_config(), Some(bus));

            let ready = emulator.wait_for_boot(Duration::from_secs(10), &CancellationToken::new()).await;

            assert!(ready);
            assert_eq!(emulator.serial(), Some("emulator-5556"));
            assert_eq!(emulator.state(), LifecycleState::Ready);
            assert_eq!(bridge.boot_polls.load(Ordering::SeqCst), 3);

            let states: Vec<_> = events
                .drain()
                .into_iter()
                .filter_map(|e| match e {
                    EmulatorEvent::StateChanged { state, .. } => Some(state),
                    EmulatorEvent::SerialResolved { .. } => None,
                })
                .collect();
            assert_eq!(
                states,
                vec![
                    LifecycleState::SerialResolving,
                    LifecycleState::Booting,
                    LifecycleState::LauncherSettling,
                    LifecycleState::Ready,
                ]
            );

            // Already ready, no further polling
            assert!(emulator.wait_for_boot(Duration::ZERO, &CancellationToken::new()).await);
            assert!(emulator.shutdown().await);
        }

        #[tokio::test]
        async fn test_early_exit_fails() {
            let bridge = Arc::new(FakeBridge::default());
            let mut emulator = handle("Pixel_5", "exit 0", bridge);

            let ready = emulator.wait_for_boot(Duration::from_secs(10), &CancellationToken::new()).await;

            assert!(!ready);
            assert_eq!(emulator.state(), LifecycleState::Failed);
            assert!(emulator.serial().is_none());
        }

        #[tokio::test]
        async fn test_timeout_fails_then_shutdown_kills() {
            let bridge = Arc::new(FakeBridge::default());
            let mut emulator = handle("Pixel_5", "sleep 30", bridge);

            let ready = emulator.wait_for_boot(Duration::from_millis(50), &CancellationToken::new()).await;
            assert!(!ready);
            assert_eq!(emulator.state(), LifecycleState::Failed);

            // No serial, so only the process kill runs
            let report = emulator.shutdown_steps().await;
            assert_eq!(report.steps(), &[("kill", true)]);
            assert!(emulator.has_exited());
            assert_eq!(emulator.state(), LifecycleState::Stopped);
        }

        #[tokio::test]
        async fn test_cancel_returns_false_promptly() {
            let bridge = Arc::new(FakeBridge::default());
            let mut emulator = handle("Pixel_5", "sleep 30", bridge);
            let token = CancellationToken::new();

            let canceller = {
                let token = token.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    token.cancel();
                })
            };

            let ready = tokio::time::timeout(Duration::from_secs(5), emulator.wait_for_boot(Duration::ZERO, &token))
                .await
                .unwrap();
            canceller.await.unwrap();

            assert!(!ready);
            assert_eq!(emulator.state(), LifecycleState::SerialResolving);
            emulator.shutdown().await;
        }

        #[tokio::test]
        async fn test_launcher_timeout_is_advisory() {
            let bridge = Arc::new(FakeBridge::with_emulators(&[("emulator-5554", "Pixel_5")]));
            bridge.launcher_focused.store(false, Ordering::SeqCst);
            let mut emulator = handle("Pixel_5", "sleep 30", bridge);

            let ready = emulator.wait_for_boot(Duration::ZERO, &CancellationToken::new()).await;

            assert!(ready);
            assert_eq!(emulator.state(), LifecycleState::Ready);
            emulator.shutdown().await;
        }

        #[tokio::test]
        async fn test_shutdown_is_idempotent() {
            let bridge = Arc::new(FakeBridge::with_emulators(&[("emulator-5554", "Pixel_5")]));
            let mut emulator = handle("Pixel_5", "sleep 30", bridge.clone());
            assert!(emulator.wait_for_boot(Duration::ZERO, &CancellationToken::new()).await);

            assert!(emulator.shutdown().await);
            assert!(emulator.has_exited());

            // Console is gone and the process already exited
            assert!(!emulator.shutdown().await);
            assert_eq!(bridge.emu_kills.load(Ordering::SeqCst), 2);
            assert_eq!(emulator.state(), LifecycleState::Stopped);
        }

        #[tokio::test]
        async fn test_wait_for_exit_after_shutdown() {
            let bridge = Arc::new(FakeBridge::with_emulators(&[("emulator-5554", "Pixel_5")]));
            let mut emulator = handle("Pixel_5", "sleep 30", bridge);
            assert!(emulator.wait_for_boot(Duration::ZERO, &CancellationToken::new()).await);

            let report = emulator.shutdown_steps().await;
            assert_eq!(report.steps(), &[("emu kill", true), ("kill", true)]);

            let exit_code = tokio_test::assert_ok!(emulator.wait_for_exit().await);
            assert_eq!(exit_code, SIGNAL_EXIT_CODE);
        }

        #[tokio::test]
        async fn test_signal_exit_without_shutdown_is_failure() {
            let bridge = Arc::new(FakeBridge::default());
            let emulator = handle("Pixel_5", "kill -9 $$", bridge);

            let err = tokio_test::assert_err!(emulator.wait_for_exit().await);
            assert!(matches!(
                err,
                EmulatorError::Process(ProcessError::Failed { exit_code: SIGNAL_EXIT_CODE, .. })
            ));
        }

        #[tokio::test]
        async fn test_shutdown_after_own_exit() {
            let bridge = Arc::new(FakeBridge::default());
            let mut emulator = handle("Pixel_5", "exit 0", bridge);
            emulator.process.exit_watch().wait().await;

            assert!(!emulator.shutdown().await);
            assert!(!emulator.shutdown().await);
        }

        #[tokio::test]
        async fn test_disable_animations_needs_serial() {
            let bridge = Arc::new(FakeBridge::default());
            let mut emulator = handle("Pixel_5", "sleep 30", bridge);

            let err = emulator.disable_animations().await.unwrap_err();
            assert!(matches!(err, EmulatorError::SerialUnknown(_)));
            emulator.shutdown().await;
        }

        #[tokio::test]
        async fn test_stop_avd() {
            let bridge = Arc::new(FakeBridge::with_emulators(&[("emulator-5554", "Pixel_5")]));
            let emulator = Emulator::new("/nonexistent/emulator", bridge.clone(), test_config());

            assert!(matches!(
                emulator.stop_avd(" ", Duration::from_secs(1)).await,
                Err(EmulatorError::InvalidAvdName)
            ));
            assert!(!emulator.stop_avd("Nexus_9", Duration::from_secs(1)).await.unwrap());
            assert!(emulator.stop_avd("pixel_5", Duration::from_secs(1)).await.unwrap());
            assert!(bridge.devices.lock().unwrap().is_empty());
        }

        fn fake_emulator(dir: &Path, exit_code: i32) -> PathBuf {
            use std::os::unix::fs::PermissionsExt;

            let path = dir.join("emulator");
            std::fs::write(&path, format!("#!/bin/sh\necho \"$@\"\nexit {}\n", exit_code)).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        #[tokio::test]
        async fn test_console_kill_exit_code_is_success() {
            let dir = tempfile::tempdir().unwrap();
            let emulator = Emulator::new(fake_emulator(dir.path(), 1), Arc::new(FakeBridge::default()), test_config());

            let handle = emulator.start("Pixel_5", &EmulatorOptions::headless()).unwrap();
            assert_eq!(handle.avd_name(), "Pixel_5");
            assert_eq!(handle.wait_for_exit().await.unwrap(), 1);
        }

        #[tokio::test]
        async fn test_crash_exit_code_is_failure() {
            let dir = tempfile::tempdir().unwrap();
            let emulator = Emulator::new(fake_emulator(dir.path(), 3), Arc::new(FakeBridge::default()), test_config());

            let handle = emulator.start("Pixel_5", &EmulatorOptions::default()).unwrap();
            match handle.wait_for_exit().await.unwrap_err() {
                EmulatorError::Process(ProcessError::Failed { exit_code, stdout, .. }) => {
                    assert_eq!(exit_code, 3);
                    assert_eq!(stdout, vec!["-avd Pixel_5"]);
                }
                other => panic!("unexpected error: {other:?}"),
            }
        }

        #[tokio::test]
        async fn test_start_without_emulator_binary() {
            let emulator = Emulator::new("/nonexistent/emulator/emulator", Arc::new(FakeBridge::default()), test_config());
            let err = emulator.start("Pixel_5", &EmulatorOptions::default()).err().unwrap();
            assert!(matches!(err, EmulatorError::ToolNotFound(_)));
        }
    }
}
