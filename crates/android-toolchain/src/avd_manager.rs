//! AVD Manager
//!
//! Creates and removes Android Virtual Devices through `avdmanager`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use avd_pilot_core::{AutoResponder, EmulatorConfig, PilotError, ProcessSpec, ToolPaths};
use tracing::{debug, info};

use crate::error::Result;

/// Arguments for `avdmanager create avd`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AvdCreateOptions {
    pub name: String,
    /// System image package, e.g. `system-images;android-34;google_apis;x86_64`
    pub package: String,
    pub abi: Option<String>,
    /// Hardware profile id, e.g. `pixel_6`
    pub device: Option<String>,
    /// SD card size (`512M`) or path to an existing image
    pub sdcard: Option<String>,
    pub skin: Option<String>,
    /// Directory for the AVD files
    pub path: Option<PathBuf>,
    /// Overwrite an existing AVD with the same name
    pub force: bool,
}

impl AvdCreateOptions {
    pub fn new(name: impl Into<String>, package: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            package: package.into(),
            ..Default::default()
        }
    }

    pub fn device(mut self, device: impl Into<String>) -> Self {
        self.device = Some(device.into());
        self
    }

    pub fn abi(mut self, abi: impl Into<String>) -> Self {
        self.abi = Some(abi.into());
        self
    }

    pub fn sdcard(mut self, sdcard: impl Into<String>) -> Self {
        self.sdcard = Some(sdcard.into());
        self
    }

    pub fn force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "create".to_string(),
            "avd".to_string(),
            "-n".to_string(),
            self.name.clone(),
            "-k".to_string(),
            self.package.clone(),
        ];

        if let Some(abi) = &self.abi {
            args.extend(["-b".to_string(), abi.clone()]);
        }
        if let Some(device) = &self.device {
            args.extend(["--device".to_string(), device.clone()]);
        }
        if let Some(sdcard) = &self.sdcard {
            args.extend(["-c".to_string(), sdcard.clone()]);
        }
        if let Some(skin) = &self.skin {
            args.extend(["--skin".to_string(), skin.clone()]);
        }
        if self.force {
            args.push("--force".to_string());
        }
        if let Some(path) = &self.path {
            args.extend(["-p".to_string(), path.display().to_string()]);
        }

        args
    }
}

/// `avdmanager` wrapper
#[derive(Debug, Clone)]
pub struct AvdManager {
    avdmanager_path: PathBuf,
    sdk_root: Option<PathBuf>,
    java_home: Option<PathBuf>,
    responder: AutoResponder,
}

impl AvdManager {
    pub fn new(avdmanager_path: impl Into<PathBuf>) -> Self {
        Self {
            avdmanager_path: avdmanager_path.into(),
            sdk_root: None,
            java_home: None,
            // "Do you wish to create a custom hardware profile? [no]"
            responder: AutoResponder::accept_default(),
        }
    }

    pub fn from_tools(tools: &ToolPaths, config: &EmulatorConfig) -> std::result::Result<Self, PilotError> {
        let mut manager = Self::new(tools.avdmanager()?).with_prompt_interval(config.prompt_interval());
        manager.sdk_root = tools.sdk_root.clone();
        manager.java_home = tools.java_home.clone();
        Ok(manager)
    }

    pub fn with_sdk_root(mut self, sdk_root: impl Into<PathBuf>) -> Self {
        self.sdk_root = Some(sdk_root.into());
        self
    }

    pub fn with_java_home(mut self, java_home: impl Into<PathBuf>) -> Self {
        self.java_home = Some(java_home.into());
        self
    }

    pub fn with_prompt_interval(mut self, interval: Duration) -> Self {
        self.responder = self.responder.with_interval(interval);
        self
    }

    pub fn path(&self) -> &Path {
        &self.avdmanager_path
    }

    fn command(&self) -> ProcessSpec {
        let mut spec = ProcessSpec::new(&self.avdmanager_path);

        if let Some(sdk_root) = &self.sdk_root {
            spec = spec
                .env("ANDROID_SDK_ROOT", sdk_root)
                .env("ANDROID_HOME", sdk_root);
        }
        if let Some(java_home) = &self.java_home {
            spec = spec.env("JAVA_HOME", java_home);
        }

        spec
    }

    /// Create an AVD, taking the default answer to the hardware profile prompt
    pub async fn create(&self, options: &AvdCreateOptions) -> Result<()> {
        info!("Creating AVD {} from {}", options.name, options.package);

        let output = self.responder.run(self.command().args(options.to_args())).await?;
        debug!("avdmanager: {}", output.all_text());

        info!("AVD {} created", options.name);
        Ok(())
    }

    pub async fn delete(&self, name: &str) -> Result<()> {
        info!("Deleting AVD {}", name);
        self.command().args(["delete", "avd", "-n", name]).run().await?;
        Ok(())
    }

    /// Rename and/or relocate an AVD
    pub async fn move_avd(&self, name: &str, new_path: Option<&Path>, new_name: Option<&str>) -> Result<()> {
        let mut spec = self.command().args(["move", "avd", "-n", name]);
        if let Some(path) = new_path {
            spec = spec.arg("-p").arg(path);
        }
        if let Some(new_name) = new_name {
            spec = spec.arg("-r").arg(new_name);
        }

        spec.run().await?;
        Ok(())
    }

    /// Names of the existing AVDs
    pub async fn list_avds(&self) -> Result<Vec<String>> {
        let output = self.command().args(["list", "avd", "-c"]).run().await?;
        Ok(parse_avd_names(&output.stdout))
    }
}

/// Names from `list avd -c`, skipping diagnostics printed before them
pub fn parse_avd_names<I, S>(lines: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    lines
        .into_iter()
        .filter_map(|line| {
            let name = line.as_ref().trim();
            let is_name = !name.is_empty() && !name.contains(char::is_whitespace) && !name.contains(':');
            is_name.then(|| name.to_string())
        })
        .collect()
}
