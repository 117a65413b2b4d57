/// Error handling module for the harness supervisor.
///
/// This module defines the error types used throughout the library.
/// Only construction-time failures are ever returned to callers at runtime;
/// problems inside the running server's output stream are logged and dropped.
///
/// # Example
///
/// ```
/// use harness_supervisor::error::{Error, Result};
///
/// fn report(result: Result<()>) {
///     match result {
///         Ok(_) => println!("Server started"),
///         Err(Error::Spawn(msg)) => println!("Could not start: {}", msg),
///         Err(Error::ConfigInvalid(msg)) => println!("Bad settings: {}", msg),
///         Err(e) => println!("Other error: {}", e),
///     }
/// }
/// ```
use thiserror::Error;

/// Errors that can occur in the harness-supervisor library.
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to read or parse server settings from a file or string.
    ///
    /// This error occurs when:
    /// - The settings file cannot be read
    /// - The JSON or YAML is malformed
    /// - Field types are incorrect
    #[error("Failed to parse settings: {0}")]
    ConfigParse(String),

    /// Settings parsed but contain values that cannot be used for a launch.
    ///
    /// This error occurs when:
    /// - The interpreter or server script is empty
    /// - The configuration file has no parent directory
    /// - The event marker is empty or contains a line break
    #[error("Invalid settings: {0}")]
    ConfigInvalid(String),

    /// The server process could not be created.
    ///
    /// Carries the rendered command line and the OS error. This is fatal to
    /// construction: no supervisor is returned.
    #[error("Could not start server: {0}")]
    Spawn(String),

    /// Error while controlling or observing a running server process.
    #[error("Server process error: {0}")]
    Process(String),

    /// The coordination thread could not be started or has gone away.
    #[error("Coordinator error: {0}")]
    Coordinator(String),

    /// Operation timed out.
    ///
    /// This error occurs when:
    /// - A torn-down server does not exit within the restart grace period
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Any other error not covered by the above categories.
    #[error("Other error: {0}")]
    Other(String),
}

/// Result type for harness-supervisor operations.
pub type Result<T> = std::result::Result<T, Error>;
