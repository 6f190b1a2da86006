//! Pilot Configuration
//!
//! Manages every knob the emulator pipeline needs:
//! - Tool paths (adb, emulator, avdmanager, sdkmanager, JDK)
//! - ADB daemon address and reconnect backoff
//! - Emulator polling and grace intervals
//!
//! Values are passed explicitly into each component's constructor; nothing
//! here is cached process-wide.

use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use directories::ProjectDirs;
use tracing::{info, debug};

use crate::error::{PilotError, Result};

/// Absolute paths of the external tools
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ToolPaths {
    /// Android SDK root, used to fill in any tool left unset
    pub sdk_root: Option<PathBuf>,
    /// `adb` executable
    pub adb: Option<PathBuf>,
    /// `emulator` executable
    pub emulator: Option<PathBuf>,
    /// `avdmanager` script
    pub avdmanager: Option<PathBuf>,
    /// `sdkmanager` script
    pub sdkmanager: Option<PathBuf>,
    /// JDK home passed as JAVA_HOME to the Java based tools
    pub java_home: Option<PathBuf>,
}

impl ToolPaths {
    /// Conventional tool layout under an SDK root
    pub fn from_sdk_root(sdk_root: impl Into<PathBuf>) -> Self {
        let sdk_root = sdk_root.into();
        let (exe, script) = if cfg!(windows) { (".exe", ".bat") } else { ("", "") };
        let cmdline_bin = sdk_root.join("cmdline-tools").join("latest").join("bin");

        Self {
            adb: Some(sdk_root.join("platform-tools").join(format!("adb{}", exe))),
            emulator: Some(sdk_root.join("emulator").join(format!("emulator{}", exe))),
            avdmanager: Some(cmdline_bin.join(format!("avdmanager{}", script))),
            sdkmanager: Some(cmdline_bin.join(format!("sdkmanager{}", script))),
            java_home: None,
            sdk_root: Some(sdk_root),
        }
    }

    /// Fill unset tools from `sdk_root`, keeping explicit paths
    pub fn resolved(&self) -> Self {
        match &self.sdk_root {
            Some(root) => {
                let defaults = Self::from_sdk_root(root);
                Self {
                    sdk_root: self.sdk_root.clone(),
                    adb: self.adb.clone().or(defaults.adb),
                    emulator: self.emulator.clone().or(defaults.emulator),
                    avdmanager: self.avdmanager.clone().or(defaults.avdmanager),
                    sdkmanager: self.sdkmanager.clone().or(defaults.sdkmanager),
                    java_home: self.java_home.clone(),
                }
            }
            None => self.clone(),
        }
    }

    pub fn adb(&self) -> Result<&Path> {
        Self::require(&self.adb, "adb")
    }

    pub fn emulator(&self) -> Result<&Path> {
        Self::require(&self.emulator, "emulator")
    }

    pub fn avdmanager(&self) -> Result<&Path> {
        Self::require(&self.avdmanager, "avdmanager")
    }

    pub fn sdkmanager(&self) -> Result<&Path> {
        Self::require(&self.sdkmanager, "sdkmanager")
    }

    fn require<'a>(path: &'a Option<PathBuf>, tool: &'static str) -> Result<&'a Path> {
        path.as_deref().ok_or(PilotError::ToolNotConfigured(tool))
    }
}

/// Port the adb server listens on unless told otherwise
pub const DEFAULT_ADB_PORT: u16 = 5037;

/// ADB daemon connection settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdbServerConfig {
    /// Daemon host
    pub host: String,
    /// Daemon port
    pub port: u16,
    /// First reconnect delay in milliseconds
    pub backoff_base_ms: u64,
    /// Growth factor applied to the delay after each failed attempt
    pub backoff_factor: f64,
    /// Consecutive failures before the daemon is killed and restarted
    pub restart_after_failures: u32,
}

impl Default for AdbServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_ADB_PORT,
            backoff_base_ms: 1000,
            backoff_factor: 1.5,
            restart_after_failures: 3,
        }
    }
}

impl AdbServerConfig {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

/// Emulator lifecycle timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EmulatorConfig {
    /// Interval between serial/boot/launcher probes in milliseconds
    pub poll_interval_ms: u64,
    /// How long to wait for the launcher to take focus after boot
    pub launcher_grace_secs: u64,
    /// Boot timeout in seconds, 0 waits forever
    pub boot_timeout_secs: u64,
    /// Interval between auto-responses written to interactive tools
    pub prompt_interval_ms: u64,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            launcher_grace_secs: 60,
            boot_timeout_secs: 0,
            prompt_interval_ms: 250,
        }
    }
}

impl EmulatorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn launcher_grace(&self) -> Duration {
        Duration::from_secs(self.launcher_grace_secs)
    }

    pub fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_timeout_secs)
    }

    pub fn prompt_interval(&self) -> Duration {
        Duration::from_millis(self.prompt_interval_ms)
    }
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PilotConfig {
    /// Configuration version for migrations
    pub version: u32,
    /// External tool locations
    pub tools: ToolPaths,
    /// ADB daemon settings
    pub adb: AdbServerConfig,
    /// Emulator settings
    pub emulator: EmulatorConfig,
}

impl Default for PilotConfig {
    fn default() -> Self {
        Self {
            version: 1,
            tools: ToolPaths::default(),
            adb: AdbServerConfig::default(),
            emulator: EmulatorConfig::default(),
        }
    }
}

impl PilotConfig {
    /// Get the configuration directory path
    pub fn config_dir() -> Option<PathBuf> {
        ProjectDirs::from("dev", "avd-pilot", "avd-pilot")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the configuration file path
    pub fn config_file() -> Option<PathBuf> {
        Self::config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Load configuration from the default location, creating it if missing
    pub async fn load() -> Result<Self> {
        let config_file = Self::config_file()
            .ok_or_else(|| PilotError::Config("Cannot determine config path".into()))?;
        Self::load_from(&config_file).await
    }

    /// Load configuration from a specific file, creating it if missing
    pub async fn load_from(config_file: &Path) -> Result<Self> {
        if config_file.exists() {
            debug!("Loading config from {:?}", config_file);
            let contents = tokio::fs::read_to_string(config_file).await?;
            let config: PilotConfig = toml::from_str(&contents)?;
            Ok(config)
        } else {
            info!("Config file not found, using defaults");
            let config = PilotConfig::default();
            config.save_to(config_file).await?;
            Ok(config)
        }
    }

    /// Save configuration to the default location
    pub async fn save(&self) -> Result<()> {
        let config_file = Self::config_file()
            .ok_or_else(|| PilotError::Config("Cannot determine config path".into()))?;
        self.save_to(&config_file).await
    }

    /// Save configuration to a specific file
    pub async fn save_to(&self, config_file: &Path) -> Result<()> {
        if let Some(parent) = config_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let contents = toml::to_string_pretty(self)?;
        tokio::fs::write(config_file, contents).await?;

        debug!("Config saved to {:?}", config_file);
        Ok(())
    }

    /// Tool paths with SDK-root defaults applied
    pub fn tools(&self) -> ToolPaths {
        self.tools.resolved()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PilotConfig::default();
        assert_eq!(config.adb.port, DEFAULT_ADB_PORT);
        assert_eq!(config.adb.host, "127.0.0.1");
        assert_eq!(config.emulator.poll_interval(), Duration::from_secs(1));
        assert_eq!(config.emulator.launcher_grace(), Duration::from_secs(60));
        assert_eq!(config.emulator.boot_timeout(), Duration::ZERO);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: PilotConfig = toml::from_str("[adb]\nport = 5038\n").unwrap();
        assert_eq!(config.adb.port, 5038);
        assert_eq!(config.adb.backoff_factor, 1.5);
        assert_eq!(config.emulator, EmulatorConfig::default());
    }

    #[test]
    fn test_sdk_root_fills_unset_tools() {
        let tools = ToolPaths {
            sdk_root: Some(PathBuf::from("/sdk")),
            adb: Some(PathBuf::from("/opt/adb")),
            ..Default::default()
        };
        let resolved = tools.resolved();

        assert_eq!(resolved.adb().unwrap(), Path::new("/opt/adb"));
        assert!(resolved.emulator().unwrap().starts_with("/sdk/emulator"));
        assert!(resolved.sdkmanager().unwrap().starts_with("/sdk/cmdline-tools/latest/bin"));
    }

    #[test]
    fn test_missing_tool_is_reported() {
        let tools = ToolPaths::default();
        assert!(matches!(tools.emulator(), Err(PilotError::ToolNotConfigured("emulator"))));
    }

    #[tokio::test]
    async fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = PilotConfig::load_from(&path).await.unwrap();
        assert_eq!(config, PilotConfig::default());
        assert!(path.exists());

        let mut changed = config.clone();
        changed.emulator.launcher_grace_secs = 5;
        changed.save_to(&path).await.unwrap();

        let reloaded = PilotConfig::load_from(&path).await.unwrap();
        assert_eq!(reloaded.emulator.launcher_grace_secs, 5);
    }
}
