//! Launch settings for the supervised server.
//!
//! This module handles parsing and validation of the settings that describe
//! how to start a test-runner server process. Settings can be loaded from
//! JSON or YAML files, parsed from a JSON string, or built in code.
//!
//! # Examples
//!
//! Loading settings from a file:
//!
//! ```no_run
//! use harness_supervisor::config::{ServerSettings, validate_settings};
//!
//! let settings = ServerSettings::from_file("harness.json").unwrap();
//! validate_settings(&settings).unwrap();
//! println!("Will run {}", settings.command_line(None));
//! ```
mod parser;
pub mod validator;

pub use parser::{
    DEFAULT_EVENT_MARKER, DEFAULT_OUTPUT_HISTORY, DEFAULT_SHUTDOWN_TIMEOUT_MS, ServerSettings,
};
pub use validator::validate_settings;
