//! Error types for AVD Pilot
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

use crate::process::ProcessError;

/// Main error type for configuration and shared plumbing
#[derive(Error, Debug)]
pub enum PilotError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("Tool path not configured: {0}")]
    ToolNotConfigured(&'static str),
}

/// Result type alias for AVD Pilot operations
pub type Result<T> = std::result::Result<T, PilotError>;

impl PilotError {
    /// Get a user-friendly error message
    pub fn user_message(&self) -> String {
        match self {
            PilotError::Io(e) => format!("File operation failed: {}", e),
            PilotError::Config(msg) => format!("Configuration error: {}", msg),
            PilotError::ToolNotConfigured(tool) => {
                format!("No path configured for `{}`. Set it under [tools] in config.toml", tool)
            }
            PilotError::Process(ProcessError::MultipleDevices { .. }) => {
                "More than one device/emulator is attached; pass a serial to target one".to_string()
            }
            _ => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multiple_devices_message_is_actionable() {
        let err = PilotError::from(ProcessError::MultipleDevices {
            stdout: Vec::new(),
            stderr: vec!["error: more than one device/emulator".to_string()],
        });
        assert!(err.user_message().contains("serial"));
    }

    #[test]
    fn test_tool_not_configured_names_tool() {
        let err = PilotError::ToolNotConfigured("emulator");
        assert!(err.user_message().contains("`emulator`"));
    }
}
