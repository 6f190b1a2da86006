//! Device Types and State
//!
//! Devices as reported by the ADB daemon, and the `devices -l` line grammar
//! shared by the wire client and the CLI adapter:
//!
//! ```text
//! <serial>\s+<state>(\s+<key>:<value>)*
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Well known device property names
pub mod props {
    pub const BOOT_COMPLETE: &str = "dev.bootcomplete";
    pub const SYS_BOOT_COMPLETED: &str = "sys.boot_completed";
    pub const SDK_VERSION: &str = "ro.build.version.sdk";
    pub const RELEASE_VERSION: &str = "ro.build.version.release";
    pub const MODEL: &str = "ro.product.model";
    pub const MANUFACTURER: &str = "ro.product.manufacturer";
    pub const CPU_ABI: &str = "ro.product.cpu.abi";
    pub const AVD_NAME: &str = "ro.boot.qemu.avd_name";
    pub const KERNEL_AVD_NAME: &str = "ro.kernel.qemu.avd_name";
}

const EMULATOR_PREFIX: &str = "emulator-";

/// Device state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceState {
    /// Not actionable; also used for any state the daemon reports that we don't know
    Offline,
    /// Waiting for the user to accept the host key
    Authorizing,
    /// Online and ready
    Device,
}

impl DeviceState {
    pub fn parse(state: &str) -> Self {
        match state.to_ascii_lowercase().as_str() {
            "device" => DeviceState::Device,
            "authorizing" | "unauthorized" => DeviceState::Authorizing,
            _ => DeviceState::Offline,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Offline => "offline",
            DeviceState::Authorizing => "authorizing",
            DeviceState::Device => "device",
        }
    }

    pub fn is_usable(&self) -> bool {
        matches!(self, DeviceState::Device)
    }
}

/// Device information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Device serial number
    pub serial: String,
    /// Device state
    pub state: DeviceState,
    pub usb: Option<String>,
    /// Device product name
    pub product: Option<String>,
    /// Device model (e.g., "Pixel_5")
    pub model: Option<String>,
    pub device: Option<String>,
    /// Transport ID
    pub transport_id: Option<u32>,
    /// Every `key:value` pair on the line, keys lowercased
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extras: BTreeMap<String, String>,
}

impl Device {
    pub fn new(serial: impl Into<String>, state: DeviceState) -> Self {
        Self {
            serial: serial.into(),
            state,
            usb: None,
            product: None,
            model: None,
            device: None,
            transport_id: None,
            extras: BTreeMap::new(),
        }
    }

    /// Check if device is online and usable
    pub fn is_usable(&self) -> bool {
        self.state.is_usable()
    }

    /// Emulators are named `emulator-<console port>`
    pub fn is_emulator(&self) -> bool {
        self.serial.starts_with(EMULATOR_PREFIX)
    }

    pub fn console_port(&self) -> Option<u16> {
        self.serial.strip_prefix(EMULATOR_PREFIX)?.parse().ok()
    }

    /// Get display name
    pub fn display_name(&self) -> String {
        if let Some(ref model) = self.model {
            format!("{} ({})", model.replace('_', " "), self.serial)
        } else {
            self.serial.clone()
        }
    }

    /// Parse one `devices -l` line. Headers, daemon banners and blank lines yield `None`.
    pub fn parse_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('*') || line.starts_with("List of devices") {
            return None;
        }

        let mut parts = line.split_whitespace();
        let serial = parts.next()?;
        let state = parts.next().map(DeviceState::parse).unwrap_or(DeviceState::Offline);

        let mut device = Device::new(serial, state);

        for part in parts {
            let Some((key, value)) = part.split_once(':') else {
                continue;
            };
            let key = key.to_ascii_lowercase();

            match key.as_str() {
                "usb" => device.usb = Some(value.to_string()),
                "product" => device.product = Some(value.to_string()),
                "model" => device.model = Some(value.to_string()),
                "device" => device.device = Some(value.to_string()),
                "transport_id" => device.transport_id = value.parse().ok(),
                _ => {}
            }
            device.extras.insert(key, value.to_string());
        }

        Some(device)
    }
}

/// Parse a full device listing, offline entries included
pub fn parse_device_snapshot(text: &str) -> Vec<Device> {
    text.lines().filter_map(Device::parse_line).collect()
}

/// Parse a device listing into actionable devices; offline entries are dropped
pub fn parse_device_list(text: &str) -> Vec<Device> {
    parse_device_snapshot(text)
        .into_iter()
        .filter(|d| d.state != DeviceState::Offline)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_emulator_line() {
        let devices = parse_device_list("emulator-5554\tdevice\tmodel:Pixel_5");

        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].serial, "emulator-5554");
        assert_eq!(devices[0].state, DeviceState::Device);
        assert_eq!(devices[0].model.as_deref(), Some("Pixel_5"));
        assert!(devices[0].is_emulator());
        assert_eq!(devices[0].console_port(), Some(5554));
    }

    #[test]
    fn test_offline_never_listed() {
        let text = "List of devices attached\n\
                    emulator-5554          offline transport_id:1\n\
                    emulator-5556          device product:sdk_gphone64_x86_64 model:sdk_gphone64_x86_64 device:emu64x transport_id:2\n\
                    R58M123ABC             unauthorized usb:1-1 transport_id:3\n\
                    \n";

        let devices = parse_device_list(text);
        assert_eq!(devices.len(), 2);
        assert!(devices.iter().all(|d| d.state != DeviceState::Offline));

        let emu = &devices[0];
        assert_eq!(emu.serial, "emulator-5556");
        assert_eq!(emu.device.as_deref(), Some("emu64x"));
        assert_eq!(emu.transport_id, Some(2));

        let phone = &devices[1];
        assert_eq!(phone.state, DeviceState::Authorizing);
        assert_eq!(phone.usb.as_deref(), Some("1-1"));
        assert!(!phone.is_emulator());
    }

    #[test]
    fn test_snapshot_keeps_offline() {
        let devices = parse_device_snapshot("emulator-5554\toffline\n");
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].state, DeviceState::Offline);
    }

    #[test]
    fn test_banner_lines_are_skipped() {
        let text = "* daemon not running; starting now at tcp:5037\n\
                    * daemon started successfully\n\
                    List of devices attached\n";
        assert!(parse_device_snapshot(text).is_empty());
    }

    #[test]
    fn test_unknown_state_is_offline() {
        assert_eq!(DeviceState::parse("recovery"), DeviceState::Offline);
        assert_eq!(DeviceState::parse("DEVICE"), DeviceState::Device);
    }

    #[test]
    fn test_extras_keep_unknown_keys() {
        let device = Device::parse_line("abc device Features:shell_v2").unwrap();
        assert_eq!(device.extras.get("features").map(String::as_str), Some("shell_v2"));
    }
}
