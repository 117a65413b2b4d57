use crate::config::ServerSettings;
use crate::error::{Error, Result};

/// Validates the launch paths of a settings value
pub fn validate_paths(settings: &ServerSettings) -> Result<()> {
    if settings.interpreter.as_os_str().is_empty() {
        return Err(Error::ConfigInvalid("Interpreter path is empty".to_string()));
    }

    if settings.server_script.as_os_str().is_empty() {
        return Err(Error::ConfigInvalid("Server script path is empty".to_string()));
    }

    if settings.working_dir().is_none() {
        return Err(Error::ConfigInvalid(format!(
            "Configuration file '{}' has no parent directory",
            settings.config_file.display()
        )));
    }

    Ok(())
}

/// Validates the event marker used to frame stdout events
pub fn validate_event_marker(marker: &str) -> Result<()> {
    if marker.is_empty() {
        return Err(Error::ConfigInvalid("Event marker is empty".to_string()));
    }

    // Frames are cut on line boundaries and split on the first ':'
    if marker.contains(['\n', '\r', ':']) {
        return Err(Error::ConfigInvalid(format!(
            "Event marker '{}' must not contain line breaks or ':'",
            marker.escape_debug()
        )));
    }

    Ok(())
}

/// Full settings validation
pub fn validate_settings(settings: &ServerSettings) -> Result<()> {
    validate_paths(settings)?;
    validate_event_marker(&settings.event_marker)?;

    if settings.shutdown_timeout_ms == 0 {
        return Err(Error::ConfigInvalid("Shutdown timeout must be positive".to_string()));
    }

    if settings.browsers.iter().any(|b| b.trim().is_empty() || b.contains(',')) {
        return Err(Error::ConfigInvalid(format!(
            "Browser names must be non-empty and comma-free: {:?}",
            settings.browsers
        )));
    }

    Ok(())
}
