use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Marker that brackets framed events in the server's stdout unless overridden.
pub const DEFAULT_EVENT_MARKER: &str = "##harness-event##";

/// Default grace period between the interrupt and the hard kill.
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 1000;

/// Default number of plain output lines kept by the output archive.
pub const DEFAULT_OUTPUT_HISTORY: usize = 1000;

fn default_true() -> bool {
    true
}

fn default_shutdown_timeout_ms() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT_MS
}

fn default_event_marker() -> String {
    DEFAULT_EVENT_MARKER.to_string()
}

fn default_output_history() -> usize {
    DEFAULT_OUTPUT_HISTORY
}

/// Everything needed to launch one test-runner server process.
///
/// The process is started as
/// `<interpreter> <serverScript> --workingPackageDir=<packageDir> --configFile=<configFile>
/// [--browsers=<csv>] [--coverageTempDir=<dir>]` with the configuration file's
/// parent directory as working directory.
///
/// # JSON Schema
///
/// ```json
/// {
///   "interpreter": "/usr/bin/node",
///   "serverScript": "/opt/harness/server.js",
///   "packageDir": "/work/app/node_modules/karma",
///   "configFile": "/work/app/karma.conf.js",
///   "browsers": ["Chrome"],
///   "withCoverage": false,
///   "env": { "CHROME_BIN": "/usr/bin/chromium" },
///   "passParentEnv": true,
///   "shutdownTimeoutMs": 1000,
///   "eventMarker": "##harness-event##"
/// }
/// ```
///
/// # Examples
///
/// ```
/// use harness_supervisor::config::ServerSettings;
///
/// let settings = ServerSettings::new("node", "server.js", "/pkg", "/work/karma.conf.js")
///     .with_browsers(vec!["Chrome".to_string(), "Firefox".to_string()]);
///
/// assert_eq!(settings.working_dir().unwrap().to_str(), Some("/work"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSettings {
    /// Interpreter used to run the server entry script.
    pub interpreter: PathBuf,

    /// Server entry script handed to the interpreter.
    pub server_script: PathBuf,

    /// Directory of the test-runner package the script should load.
    pub package_dir: PathBuf,

    /// Test-runner configuration file. Its parent is the working directory.
    pub config_file: PathBuf,

    /// Browsers to launch. Empty means "whatever the configuration file says".
    #[serde(default)]
    pub browsers: Vec<String>,

    /// Create a coverage temp directory and pass it to the server.
    #[serde(default)]
    pub with_coverage: bool,

    /// Extra environment variables for the server process.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Inherit the current process environment.
    #[serde(default = "default_true")]
    pub pass_parent_env: bool,

    /// Grace period between the interrupt and the hard kill, in milliseconds.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,

    /// Marker bracketing framed events in stdout.
    #[serde(default = "default_event_marker")]
    pub event_marker: String,

    /// Number of plain output lines the archive keeps for replay.
    #[serde(default = "default_output_history")]
    pub output_history: usize,
}

impl ServerSettings {
    /// Create settings with defaults for every optional field.
    pub fn new(
        interpreter: impl Into<PathBuf>,
        server_script: impl Into<PathBuf>,
        package_dir: impl Into<PathBuf>,
        config_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            interpreter: interpreter.into(),
            server_script: server_script.into(),
            package_dir: package_dir.into(),
            config_file: config_file.into(),
            browsers: Vec::new(),
            with_coverage: false,
            env: HashMap::new(),
            pass_parent_env: true,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            event_marker: DEFAULT_EVENT_MARKER.to_string(),
            output_history: DEFAULT_OUTPUT_HISTORY,
        }
    }

    pub fn with_browsers(mut self, browsers: Vec<String>) -> Self {
        self.browsers = browsers;
        self
    }

    pub fn with_coverage(mut self, enabled: bool) -> Self {
        self.with_coverage = enabled;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_pass_parent_env(mut self, pass: bool) -> Self {
        self.pass_parent_env = pass;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_event_marker(mut self, marker: impl Into<String>) -> Self {
        self.event_marker = marker.into();
        self
    }

    pub fn with_output_history(mut self, lines: usize) -> Self {
        self.output_history = lines;
        self
    }

    /// Loads settings from a file path.
    ///
    /// Files ending in `.yaml` or `.yml` are parsed as YAML, everything else
    /// as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// * The file cannot be read
    /// * The file contents are not valid JSON/YAML
    /// * The document does not match the expected schema
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigParse(format!("Failed to read settings file: {}", e)))?;

        let is_yaml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml"));

        if is_yaml {
            serde_yaml::from_str(&content)
                .map_err(|e| Error::ConfigParse(format!("Failed to parse YAML settings: {}", e)))
        } else {
            Self::parse_from_str(&content)
        }
    }

    /// Parses settings from a JSON string.
    pub fn parse_from_str(content: &str) -> Result<Self> {
        serde_json::from_str(content)
            .map_err(|e| Error::ConfigParse(format!("Failed to parse JSON settings: {}", e)))
    }

    /// Grace period between the interrupt and the hard kill.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Working directory of the server: the configuration file's parent.
    pub fn working_dir(&self) -> Option<&Path> {
        self.config_file
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
    }

    /// Arguments passed to the interpreter, script first.
    pub fn command_args(&self, coverage_dir: Option<&Path>) -> Vec<String> {
        let mut args = vec![
            self.server_script.display().to_string(),
            format!("--workingPackageDir={}", self.package_dir.display()),
            format!("--configFile={}", self.config_file.display()),
        ];
        if !self.browsers.is_empty() {
            args.push(format!("--browsers={}", self.browsers.join(",")));
        }
        if let Some(dir) = coverage_dir {
            args.push(format!("--coverageTempDir={}", dir.display()));
        }
        args
    }

    /// The full command line as a single printable string, for logs and errors.
    pub fn command_line(&self, coverage_dir: Option<&Path>) -> String {
        std::iter::once(self.interpreter.display().to_string())
            .chain(self.command_args(coverage_dir))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_settings() {
        let settings = ServerSettings::parse_from_str(
            r#"{
                "interpreter": "node",
                "serverScript": "/opt/harness/server.js",
                "packageDir": "/work/node_modules/karma",
                "configFile": "/work/karma.conf.js"
            }"#,
        )
        .unwrap();

        assert!(settings.browsers.is_empty());
        assert!(settings.pass_parent_env);
        assert_eq!(settings.shutdown_timeout(), Duration::from_millis(1000));
        assert_eq!(settings.event_marker, DEFAULT_EVENT_MARKER);
        assert_eq!(settings.output_history, DEFAULT_OUTPUT_HISTORY);
    }

    #[test]
    fn test_command_args_optional_flags() {
        let settings = ServerSettings::new("node", "server.js", "/pkg", "/work/karma.conf.js");
        assert_eq!(
            settings.command_args(None),
            vec![
                "server.js",
                "--workingPackageDir=/pkg",
                "--configFile=/work/karma.conf.js"
            ]
        );

        let settings = settings.with_browsers(vec!["Chrome".into(), "Firefox".into()]);
        let args = settings.command_args(Some(Path::new("/tmp/cov")));
        assert_eq!(args[3], "--browsers=Chrome,Firefox");
        assert_eq!(args[4], "--coverageTempDir=/tmp/cov");
        assert_eq!(
            settings.command_line(None),
            "node server.js --workingPackageDir=/pkg --configFile=/work/karma.conf.js --browsers=Chrome,Firefox"
        );
    }

    #[test]
    fn test_working_dir_requires_parent() {
        let settings = ServerSettings::new("node", "server.js", "/pkg", "karma.conf.js");
        assert!(settings.working_dir().is_none());
    }
}
