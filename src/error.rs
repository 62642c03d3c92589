//! Top-level error types for the kodegen_bundler_port binary.
//!
//! Wraps converter errors and CLI errors, and maps each to actionable
//! recovery suggestions.

use crate::converter::{self, ErrorClass};
use thiserror::Error;

/// Result type alias for CLI operations
pub type Result<T> = std::result::Result<T, PortError>;

/// Main error type for the binary
#[derive(Error, Debug)]
pub enum PortError {
    /// Conversion errors
    #[error("{0}")]
    Conversion(#[from] converter::Error),

    /// CLI argument errors
    #[error("CLI error: {0}")]
    Cli(#[from] CliError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// CLI-specific errors
#[derive(Error, Debug)]
pub enum CliError {
    /// Invalid command line arguments
    #[error("Invalid arguments: {reason}")]
    InvalidArguments {
        /// Reason for the error
        reason: String,
    },

    /// Missing required argument
    #[error("Missing required argument: {argument}")]
    MissingArgument {
        /// Argument name
        argument: String,
    },

    /// Conversion cancelled by the user
    #[error("Interrupted; nothing was installed")]
    Interrupted,
}

impl PortError {
    /// Coarse class of the underlying failure
    pub fn class(&self) -> ErrorClass {
        match self {
            PortError::Conversion(e) => e.class(),
            PortError::Cli(CliError::Interrupted) => ErrorClass::Internal,
            PortError::Cli(_) => ErrorClass::InputValidation,
            _ => ErrorClass::Internal,
        }
    }

    /// Get actionable recovery suggestions for this error
    pub fn recovery_suggestions(&self) -> Vec<String> {
        match self {
            PortError::Cli(CliError::Interrupted) => {
                vec!["Re-run the same command to start the conversion again".to_string()]
            }
            PortError::Cli(CliError::MissingArgument { argument }) => vec![
                format!("Pass {argument} explicitly"),
                "Run with --help to see all options".to_string(),
            ],
            PortError::Cli(_) => vec!["Run with --help to see all options".to_string()],
            _ => match self.class() {
                ErrorClass::InputValidation => vec![
                    "Pass the official release disk image as INPUT".to_string(),
                    "Re-download the image if it may be truncated".to_string(),
                ],
                ErrorClass::ResolutionExhausted => vec![
                    "Download the release disk image into ~/Downloads, or pass its path as INPUT"
                        .to_string(),
                    "Check network access to the download location".to_string(),
                ],
                ErrorClass::ClassificationAmbiguous => vec![
                    "The image does not look like a known release of this application".to_string(),
                    "Pass --profile with an updated signature table".to_string(),
                ],
                ErrorClass::PatchInvariantViolation => vec![
                    "The application changed upstream; its patch table needs updating".to_string(),
                    "Pass --profile with patches matching this release".to_string(),
                ],
                ErrorClass::BuildFailure => vec![
                    "Install Node.js, npm, python3 and a C/C++ toolchain (make, g++)".to_string(),
                    "Re-run with --verbose to see the full tool output".to_string(),
                ],
                ErrorClass::Timeout => vec![
                    "Retry on a faster connection or machine".to_string(),
                    "Place the disk image locally to skip the download".to_string(),
                ],
                _ => vec!["Re-run with --verbose (or RUST_LOG=debug) for details".to_string()],
            },
        }
    }
}
