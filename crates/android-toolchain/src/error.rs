//! Errors shared by the SDK tool wrappers

use avd_pilot_core::ProcessError;

#[derive(Debug, thiserror::Error)]
pub enum SdkToolError {
    #[error(transparent)]
    Process(#[from] ProcessError),
    #[error("Unexpected {tool} output: {message}")]
    Parse { tool: &'static str, message: String },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SdkToolError>;
