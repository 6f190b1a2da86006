//! Android Emulator Bridge
//!
//! Talks to the ADB daemon (over its wire protocol and through the `adb`
//! executable) and drives emulator instances from launch to shutdown.

pub mod adb;
pub mod adbd;
pub mod device;
pub mod emulator;
pub mod poll;
pub mod protocol;

pub use adb::{AdbCli, AdbCommand, AdbError, DeviceBridge, InstallOptions, ServerControl};
pub use adbd::AdbdClient;
pub use device::{Device, DeviceState};
pub use emulator::{
    Emulator, EmulatorError, EmulatorEvent, EmulatorHandle, EmulatorOptions, LifecycleState, ShutdownReport,
};
pub use poll::{PollResult, Poller, Probe};
