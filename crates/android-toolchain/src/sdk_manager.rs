//! SDK Manager
//!
//! Wraps the Android `sdkmanager` tool to list, install and update SDK
//! packages. Every mutating command can stop on a license question, so they
//! all run under an affirmative [`AutoResponder`].
//!
//! `--list --verbose` output is not a clean table: progress bars (one line
//! with embedded `\r` separators), `Info:`/`Warning:` diagnostics and
//! `Loading ...` lines from either stream show up between the records. The
//! parser only starts a package on a bare package path and ignores
//! everything else that is not an indented detail line.

use std::path::{Path, PathBuf};
use std::time::Duration;

use avd_pilot_core::{AutoResponder, EmulatorConfig, PilotError, ProcessSpec, ToolPaths};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{Result, SdkToolError};

static LICENSE_HEADER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:\d+/\d+:\s+)?License\s+([A-Za-z0-9\-]+):$").expect("valid regex")
});

static TOOL_VERSION: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d+(?:\.\d+)+$").expect("valid regex"));

/// Prompt printed after each license text
const ACCEPT_PROMPT: &str = "Accept? (y/N):";

/// SDK component types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdkComponent {
    Platform(u32),          // android-XX
    BuildTools(String),     // build-tools;XX.X.X
    PlatformTools,          // platform-tools
    CmdlineTools(String),   // cmdline-tools;XX.X
    Sources(u32),           // sources;android-XX
    SystemImage(u32, String, String), // system-images;android-XX;tag;abi
    Emulator,               // emulator
}

impl SdkComponent {
    /// Get the SDK manager package name
    pub fn package_name(&self) -> String {
        match self {
            SdkComponent::Platform(api) => format!("platforms;android-{}", api),
            SdkComponent::BuildTools(version) => format!("build-tools;{}", version),
            SdkComponent::PlatformTools => "platform-tools".to_string(),
            SdkComponent::CmdlineTools(version) => format!("cmdline-tools;{}", version),
            SdkComponent::Sources(api) => format!("sources;android-{}", api),
            SdkComponent::SystemImage(api, abi, tag) => {
                format!("system-images;android-{};{};{}", api, tag, abi)
            }
            SdkComponent::Emulator => "emulator".to_string(),
        }
    }
}

/// One installed or available package
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SdkPackage {
    pub path: String,
    pub version: String,
    pub description: String,
    /// Only set for installed packages
    pub location: Option<PathBuf>,
}

/// An installed package with a newer version available
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SdkUpdate {
    pub path: String,
    pub local_version: String,
    pub remote_version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SdkPackageList {
    pub installed: Vec<SdkPackage>,
    pub available: Vec<SdkPackage>,
    pub updates: Vec<SdkUpdate>,
}

impl SdkPackageList {
    pub fn installed_package(&self, path: &str) -> Option<&SdkPackage> {
        self.installed.iter().find(|p| p.path == path)
    }

    pub fn is_installed(&self, component: &SdkComponent) -> bool {
        self.installed_package(&component.package_name()).is_some()
    }
}

/// A license shown by `sdkmanager --licenses`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SdkLicense {
    pub id: String,
    pub accepted: bool,
    pub text: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Installed,
    Available,
    Updates,
}

impl Section {
    fn from_header(line: &str) -> Option<Self> {
        let lower = line.to_ascii_lowercase();
        if lower.contains("installed packages:") {
            Some(Section::Installed)
        } else if lower.contains("available packages:") {
            Some(Section::Available)
        } else if lower.contains("available updates:") {
            Some(Section::Updates)
        } else {
            None
        }
    }
}

#[derive(Debug)]
struct PendingPackage {
    section: Section,
    path: String,
    description: String,
    version: String,
    location: Option<PathBuf>,
    local_version: String,
    remote_version: String,
}

impl PendingPackage {
    fn new(section: Section, path: &str) -> Self {
        Self {
            section,
            path: path.to_string(),
            description: String::new(),
            version: String::new(),
            location: None,
            local_version: String::new(),
            remote_version: String::new(),
        }
    }

    fn apply_detail(&mut self, key: &str, value: &str) {
        let value = value.trim().to_string();
        match key.trim().to_ascii_lowercase().as_str() {
            "description" => self.description = value,
            "version" => self.version = value,
            "installed location" => self.location = Some(PathBuf::from(value)),
            "local version" => self.local_version = value,
            "remote version" => self.remote_version = value,
            _ => {}
        }
    }

    fn commit(self, list: &mut SdkPackageList) {
        match self.section {
            Section::Installed => list.installed.push(SdkPackage {
                path: self.path,
                version: self.version,
                description: self.description,
                location: self.location,
            }),
            Section::Available => list.available.push(SdkPackage {
                path: self.path,
                version: self.version,
                description: self.description,
                location: None,
            }),
            Section::Updates => list.updates.push(SdkUpdate {
                path: self.path,
                local_version: self.local_version,
                remote_version: self.remote_version,
            }),
        }
    }
}

/// A package path is one bare token such as `platforms;android-34`
fn is_package_path(line: &str) -> bool {
    !line.is_empty()
        && !line.starts_with(char::is_whitespace)
        && !line.contains(char::is_whitespace)
        && !line.contains(':')
        && !line.starts_with('[')
        && !line.starts_with('-')
}

/// Parse `sdkmanager --list --verbose` output
pub fn parse_package_list<I, S>(lines: I) -> SdkPackageList
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut list = SdkPackageList::default();
    let mut section = None;
    let mut pending: Option<PendingPackage> = None;

    for line in lines {
        let line = line.as_ref();

        // Progress bar redraws
        if line.contains('\r') {
            continue;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("---") {
            continue;
        }

        if let Some(next) = Section::from_header(trimmed) {
            if let Some(package) = pending.take() {
                package.commit(&mut list);
            }
            section = Some(next);
            continue;
        }

        let Some(current) = section else {
            continue;
        };

        if line.starts_with(char::is_whitespace) {
            if let (Some(package), Some((key, value))) = (pending.as_mut(), trimmed.split_once(':')) {
                package.apply_detail(key, value);
            }
            continue;
        }

        if is_package_path(line) {
            if let Some(package) = pending.replace(PendingPackage::new(current, line)) {
                package.commit(&mut list);
            }
        }
    }

    if let Some(package) = pending {
        package.commit(&mut list);
    }

    list
}

/// Parse `sdkmanager --licenses` output as reviewed through the responder
///
/// Stdin is a pipe, so the answer is never echoed and the text following an
/// `Accept? (y/N):` prompt lands on the same line. A license counts as
/// accepted once its prompt has been answered or an `Accepted` line follows it.
pub fn parse_licenses<I, S>(lines: I) -> Vec<SdkLicense>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut licenses = Vec::new();
    let mut current: Option<SdkLicense> = None;

    for line in lines {
        let mut line = line.as_ref().trim_end();

        if line.contains('\r') {
            continue;
        }

        let mut answered = false;
        if let Some(rest) = line.trim_start().strip_prefix(ACCEPT_PROMPT) {
            if let Some(license) = current.as_mut() {
                license.accepted = true;
            }
            answered = true;
            line = rest.trim_start();
        }

        if let Some(caps) = LICENSE_HEADER.captures(line.trim()) {
            if let Some(license) = current.take() {
                licenses.push(license);
            }
            current = Some(SdkLicense {
                id: caps[1].to_string(),
                ..Default::default()
            });
            continue;
        }

        // Whatever follows an answered prompt is status text, not license text
        if answered {
            continue;
        }

        let Some(license) = current.as_mut() else {
            continue;
        };

        if line.starts_with("---") && line.ends_with("---") {
            continue;
        }
        if line.get(..8).is_some_and(|prefix| prefix.eq_ignore_ascii_case("accepted")) {
            license.accepted = true;
            continue;
        }
        if line.contains("(y/N)") {
            continue;
        }

        license.text.push(line.to_string());
    }

    if let Some(license) = current {
        licenses.push(license);
    }

    // Trailing blank lines before the prompt
    for license in &mut licenses {
        while license.text.last().is_some_and(|l| l.is_empty()) {
            license.text.pop();
        }
    }

    licenses
}

/// Android SDK Manager wrapper
#[derive(Debug, Clone)]
pub struct SdkManager {
    sdkmanager_path: PathBuf,
    sdk_root: Option<PathBuf>,
    java_home: Option<PathBuf>,
    responder: AutoResponder,
}

impl SdkManager {
    pub fn new(sdkmanager_path: impl Into<PathBuf>) -> Self {
        Self {
            sdkmanager_path: sdkmanager_path.into(),
            sdk_root: None,
            java_home: None,
            responder: AutoResponder::affirmative(),
        }
    }

    /// Configured tool paths plus the prompt interval from `config`
    pub fn from_tools(tools: &ToolPaths, config: &EmulatorConfig) -> std::result::Result<Self, PilotError> {
        let mut manager = Self::new(tools.sdkmanager()?).with_prompt_interval(config.prompt_interval());
        manager.sdk_root = tools.sdk_root.clone();
        manager.java_home = tools.java_home.clone();
        Ok(manager)
    }

    /// SDK root passed as `--sdk_root` and ANDROID_SDK_ROOT/ANDROID_HOME
    pub fn with_sdk_root(mut self, sdk_root: impl Into<PathBuf>) -> Self {
        self.sdk_root = Some(sdk_root.into());
        self
    }

    /// Set the JAVA_HOME for SDK manager operations
    pub fn with_java_home(mut self, java_home: impl Into<PathBuf>) -> Self {
        self.java_home = Some(java_home.into());
        self
    }

    pub fn with_prompt_interval(mut self, interval: Duration) -> Self {
        self.responder = self.responder.with_interval(interval);
        self
    }

    pub fn path(&self) -> &Path {
        &self.sdkmanager_path
    }

    pub fn sdk_root(&self) -> Option<&Path> {
        self.sdk_root.as_deref()
    }

    /// Create the base command with environment variables
    fn command(&self) -> ProcessSpec {
        let mut spec = ProcessSpec::new(&self.sdkmanager_path);

        if let Some(sdk_root) = &self.sdk_root {
            spec = spec
                .env("ANDROID_SDK_ROOT", sdk_root)
                .env("ANDROID_HOME", sdk_root)
                .arg(format!("--sdk_root={}", sdk_root.display()));
        }
        if let Some(java_home) = &self.java_home {
            spec = spec.env("JAVA_HOME", java_home);
        }

        spec
    }

    /// `sdkmanager --version`
    pub async fn version(&self) -> Result<String> {
        let output = self.command().arg("--version").run().await?;

        output
            .stdout
            .iter()
            .map(|line| line.trim())
            .find(|line| TOOL_VERSION.is_match(line))
            .map(str::to_string)
            .ok_or_else(|| SdkToolError::Parse {
                tool: "sdkmanager",
                message: format!("no version in {:?}", output.stdout_text()),
            })
    }

    /// List installed, available and updatable packages
    pub async fn list(&self) -> Result<SdkPackageList> {
        debug!("Listing SDK packages...");

        let output = self.command().args(["--list", "--verbose"]).run().await?;
        let list = parse_package_list(&output.interleaved);

        debug!(
            "{} installed, {} available, {} updates",
            list.installed.len(),
            list.available.len(),
            list.updates.len()
        );
        Ok(list)
    }

    /// Review every pending license. Reviewing through the responder accepts each one shown.
    pub async fn licenses(&self) -> Result<Vec<SdkLicense>> {
        let output = self.responder.run(self.command().arg("--licenses")).await?;
        Ok(parse_licenses(&output.stdout))
    }

    /// Accept all licenses
    pub async fn accept_licenses(&self) -> Result<()> {
        info!("Accepting Android SDK licenses...");
        let licenses = self.licenses().await?;
        info!("Accepted {} license(s)", licenses.len());
        Ok(())
    }

    /// Ids of the licenses recorded as accepted under `<sdk_root>/licenses`
    pub async fn accepted_license_ids(&self) -> Result<Vec<String>> {
        let Some(sdk_root) = &self.sdk_root else {
            return Ok(Vec::new());
        };

        let dir = sdk_root.join("licenses");
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let contents = tokio::fs::read_to_string(&path).await.unwrap_or_default();

            // Each accepted license file holds one 40 character hash
            let accepted = contents.lines().any(|line| line.trim().len() == 40);
            if accepted {
                if let Some(stem) = path.file_stem() {
                    ids.push(stem.to_string_lossy().into_owned());
                }
            }
        }

        ids.sort();
        Ok(ids)
    }

    /// Install SDK packages
    pub async fn install<I, S>(&self, packages: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let packages: Vec<String> = packages.into_iter().map(|p| p.as_ref().to_string()).collect();
        info!("Installing SDK packages: {:?}", packages);

        self.responder.run(self.command().args(&packages)).await?;

        info!("SDK packages installed successfully");
        Ok(())
    }

    pub async fn install_components(&self, components: &[SdkComponent]) -> Result<()> {
        self.install(components.iter().map(SdkComponent::package_name)).await
    }

    /// Uninstall SDK packages
    pub async fn uninstall<I, S>(&self, packages: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let packages: Vec<String> = packages.into_iter().map(|p| p.as_ref().to_string()).collect();
        info!("Uninstalling SDK packages: {:?}", packages);

        self.responder
            .run(self.command().arg("--uninstall").args(&packages))
            .await?;

        info!("SDK packages uninstalled successfully");
        Ok(())
    }

    /// Update all installed packages
    pub async fn update_all(&self) -> Result<()> {
        info!("Updating all SDK packages...");
        self.responder.run(self.command().arg("--update")).await?;
        info!("SDK packages updated successfully");
        Ok(())
    }

    /// Check if a component is installed
    pub async fn is_installed(&self, component: &SdkComponent) -> bool {
        match self.list().await {
            Ok(list) => list.is_installed(component),
            Err(_) => false,
        }
    }
}
