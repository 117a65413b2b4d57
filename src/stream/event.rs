use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Event type announcing the port the server is listening on.
pub const PORT_EVENT: &str = "PORT";

/// Event type carrying the parsed test-runner configuration.
pub const CONFIG_EVENT: &str = "CONFIG";

/// Event type announcing a captured browser.
pub const BROWSER_EVENT: &str = "BROWSER";

/// A framed event extracted from the server's stdout.
///
/// Produced once per frame and handed straight to dispatch; never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    /// Type tag preceding the first `:` in the frame
    pub event_type: String,
    /// Parsed JSON body following the first `:`
    pub event_body: Value,
}

impl EventRecord {
    pub fn new(event_type: impl Into<String>, event_body: Value) -> Self {
        Self {
            event_type: event_type.into(),
            event_body,
        }
    }
}

impl fmt::Display for EventRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.event_type, self.event_body)
    }
}

/// Body of a [`PORT_EVENT`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortEvent {
    pub port: u16,
}

/// Body of a [`BROWSER_EVENT`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowserEvent {
    /// Browser id assigned by the runner; defaults to the name when absent
    #[serde(default)]
    pub id: Option<String>,
    /// Human-readable name, e.g. `Chrome 120.0 (Linux x86_64)`
    pub name: String,
    /// Whether the runner launched this browser itself
    #[serde(default)]
    pub auto_capturing: bool,
}
