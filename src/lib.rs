//! AVD Pilot - unattended Android emulator provisioning
//!
//! Boots Android Virtual Devices, waits until they are usable and talks to
//! them through the ADB daemon, for CI pipelines that need a device without
//! a human at the keyboard.
//!
//! ## Architecture
//!
//! AVD Pilot is organized into specialized crates:
//!
//! - `avd-pilot-core`: configuration, errors, process execution and the prompt auto-responder
//! - `avd-pilot-emulator-bridge`: ADB wire client, `adb` CLI adapter and emulator lifecycle
//! - `avd-pilot-android-toolchain`: `sdkmanager` and `avdmanager` wrappers

#![warn(clippy::all)]

pub mod commands;

// Re-export main components for library usage
pub use avd_pilot_core as core;
pub use avd_pilot_android_toolchain as toolchain;
pub use avd_pilot_emulator_bridge as emulator;

/// Prelude module for convenient imports
pub mod prelude {
    pub use avd_pilot_core::{AutoResponder, PilotConfig, ProcessSpec, ToolPaths};
    pub use avd_pilot_android_toolchain::{AvdCreateOptions, AvdManager, SdkManager};
    pub use avd_pilot_emulator_bridge::{
        AdbCli, AdbdClient, Device, DeviceState, Emulator, EmulatorHandle, EmulatorOptions, LifecycleState,
    };
}
