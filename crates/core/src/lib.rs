//! AVD Pilot Core - shared plumbing for the emulator pipeline
//!
//! This crate provides configuration, error types, the event bus and the
//! process execution engine that every SDK tool wrapper runs on.

pub mod config;
pub mod error;
pub mod events;
pub mod process;
pub mod prompt;

pub use config::{AdbServerConfig, EmulatorConfig, PilotConfig, ToolPaths};
pub use error::{PilotError, Result};
pub use events::{EventBus, EventSubscription};
pub use process::{ExitWatch, ProcessError, ProcessOutput, ProcessSpec, RunningProcess};
pub use prompt::AutoResponder;

/// AVD Pilot version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
