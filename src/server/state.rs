use crate::server::lifecycle::{Lifecycle, ServerLifecycleEvent};
use crate::server::signal::Signals;
use crate::stream::{
    BROWSER_EVENT, BrowserEvent, CONFIG_EVENT, HandlerRegistry, PORT_EVENT, PortEvent,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use indexmap::IndexMap;
use serde_json::Value;
use std::sync::{Arc, Mutex, MutexGuard};

fn default_hostname() -> String {
    "localhost".to_string()
}

fn default_url_root() -> String {
    "/".to_string()
}

fn default_protocol() -> String {
    "http:".to_string()
}

/// Runner configuration as reported by the server after it loaded its config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerConfig {
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_url_root")]
    pub url_root: String,
    #[serde(default)]
    pub browsers: Vec<String>,
    #[serde(default)]
    pub auto_watch: bool,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            url_root: default_url_root(),
            browsers: Vec::new(),
            auto_watch: false,
            protocol: default_protocol(),
        }
    }
}

impl RunnerConfig {
    /// Build a URL on the test server for `path`.
    ///
    /// The url root is inserted when `with_url_root` is set and it is not `/`.
    pub fn format_url(&self, port: u16, path: &str, with_url_root: bool) -> String {
        let scheme = self.protocol.trim_end_matches(':');
        let base = format!("{}://{}:{}", scheme, self.hostname, port);
        let path = if path.starts_with('/') {
            path.to_string()
        } else {
            format!("/{}", path)
        };

        let root = self.url_root.trim_end_matches('/');
        if !with_url_root || root.is_empty() {
            return format!("{}{}", base, path);
        }
        if root.starts_with('/') {
            format!("{}{}{}", base, root, path)
        } else {
            format!("{}/{}{}", base, root, path)
        }
    }
}

/// A browser connected to the test server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CapturedBrowser {
    pub id: String,
    pub name: String,
    pub auto_capturing: bool,
}

impl CapturedBrowser {
    /// Whether this browser satisfies a requested browser name such as `Chrome`.
    ///
    /// Runners report full names (`Chrome 120.0 (Linux x86_64)`), so a name
    /// followed by a space also counts.
    pub fn matches(&self, requested: &str) -> bool {
        let name = self.name.to_ascii_lowercase();
        let requested = requested.trim().to_ascii_lowercase();
        name == requested || name.starts_with(&format!("{} ", requested))
    }
}

impl From<BrowserEvent> for CapturedBrowser {
    fn from(event: BrowserEvent) -> Self {
        Self {
            id: event.id.unwrap_or_else(|| event.name.clone()),
            name: event.name,
            auto_capturing: event.auto_capturing,
        }
    }
}

#[derive(Default)]
struct StateInner {
    server_port: Option<u16>,
    config: Option<RunnerConfig>,
    // Capture order; a re-capture keeps its first position
    captured: IndexMap<String, CapturedBrowser>,
    browsers_ready: bool,
}

/// Facts about the running server, derived only from its events.
///
/// The port and the config are set at most once. Captured browsers only
/// accumulate. Readiness is edge-triggered: the browsers-ready signal fires on
/// the first time the predicate holds and never again for this instance.
pub struct ServerState {
    inner: Mutex<StateInner>,
    requested_browsers: Vec<String>,
    signals: Arc<Signals>,
    lifecycle: Arc<Lifecycle>,
}

impl ServerState {
    pub(crate) fn new(
        requested_browsers: Vec<String>,
        signals: Arc<Signals>,
        lifecycle: Arc<Lifecycle>,
    ) -> Self {
        Self {
            inner: Mutex::new(StateInner::default()),
            requested_browsers,
            signals,
            lifecycle,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StateInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Install the handlers for the built-in event types.
    pub(crate) fn register_handlers(self: &Arc<Self>, registry: &HandlerRegistry) {
        let state = Arc::clone(self);
        registry.register(PORT_EVENT, move |body: &Value| {
            if let Some(event) = parse_body::<PortEvent>(PORT_EVENT, body) {
                state.on_port_event(event.port);
            }
        });

        let state = Arc::clone(self);
        registry.register(CONFIG_EVENT, move |body: &Value| {
            if let Some(config) = parse_body::<RunnerConfig>(CONFIG_EVENT, body) {
                state.on_config_event(config);
            }
        });

        let state = Arc::clone(self);
        registry.register(BROWSER_EVENT, move |body: &Value| {
            if let Some(event) = parse_body::<BrowserEvent>(BROWSER_EVENT, body) {
                state.on_browser_captured(event.into());
            }
        });
    }

    pub(crate) fn on_port_event(&self, port: u16) {
        {
            let mut inner = self.lock();
            if let Some(existing) = inner.server_port {
                tracing::warn!(existing, port, "Ignoring repeated port event");
                return;
            }
            inner.server_port = Some(port);
        }

        tracing::info!(port, "Server port bound");
        self.lifecycle
            .record_event(ServerLifecycleEvent::PortBound, Some(format!("port {}", port)));
        self.signals.port_bound.fire(port);
    }

    pub(crate) fn on_config_event(&self, config: RunnerConfig) {
        let mut inner = self.lock();
        if inner.config.is_some() {
            tracing::warn!("Ignoring repeated config event");
            return;
        }
        tracing::debug!(?config, "Runner config received");
        inner.config = Some(config);
    }

    pub(crate) fn on_browser_captured(&self, browser: CapturedBrowser) {
        let became_ready = {
            let mut inner = self.lock();
            tracing::info!(id = %browser.id, name = %browser.name, "Browser captured");
            inner.captured.insert(browser.id.clone(), browser);

            if inner.browsers_ready || !self.is_ready(&inner) {
                None
            } else {
                inner.browsers_ready = true;
                Some(inner.captured.values().cloned().collect::<Vec<_>>())
            }
        };

        if let Some(browsers) = became_ready {
            self.lifecycle.record_event(
                ServerLifecycleEvent::BrowsersReady,
                Some(format!("{} browser(s) captured", browsers.len())),
            );
            self.signals.browsers_ready.fire(browsers);
        }
    }

    fn expected_browsers<'a>(&'a self, inner: &'a StateInner) -> &'a [String] {
        if !self.requested_browsers.is_empty() {
            return &self.requested_browsers;
        }
        inner
            .config
            .as_ref()
            .map(|config| config.browsers.as_slice())
            .unwrap_or_default()
    }

    fn is_ready(&self, inner: &StateInner) -> bool {
        !inner.captured.is_empty()
            && self
                .expected_browsers(inner)
                .iter()
                .all(|expected| inner.captured.values().any(|b| b.matches(expected)))
    }

    pub fn server_port(&self) -> Option<u16> {
        self.lock().server_port
    }

    pub fn config(&self) -> Option<RunnerConfig> {
        self.lock().config.clone()
    }

    pub fn captured_browsers(&self) -> Vec<CapturedBrowser> {
        self.lock().captured.values().cloned().collect()
    }

    pub fn are_browsers_ready(&self) -> bool {
        self.lock().browsers_ready
    }
}

fn parse_body<T: DeserializeOwned>(event_type: &str, body: &Value) -> Option<T> {
    match T::deserialize(body) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            tracing::warn!(event_type, body = %body, error = %e, "Unexpected event payload");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::CoordinatorThread;
    use crate::server::lifecycle::ServerPhase;
    use crate::stream::EventRecord;
    use serde_json::json;

    fn state_with(requested: &[&str]) -> Arc<ServerState> {
        let coordinator = CoordinatorThread::spawn("state-test").unwrap();
        let signals = Arc::new(Signals::new(coordinator));
        let requested = requested.iter().map(|s| s.to_string()).collect();
        Arc::new(ServerState::new(requested, signals, Arc::new(Lifecycle::new())))
    }

    fn browser(id: &str, name: &str) -> CapturedBrowser {
        CapturedBrowser {
            id: id.to_string(),
            name: name.to_string(),
            auto_capturing: true,
        }
    }

    #[test]
    fn test_port_is_set_once() {
        let state = state_with(&[]);
        state.on_port_event(9876);
        state.on_port_event(1234);

        assert_eq!(state.server_port(), Some(9876));
        assert!(state.signals.port_bound.is_fired());
        assert_eq!(state.lifecycle.phase(), ServerPhase::Running);
    }

    #[test]
    fn test_ready_when_all_requested_browsers_captured() {
        let state = state_with(&["Chrome", "Firefox"]);

        state.on_browser_captured(browser("1", "Chrome 120.0 (Linux x86_64)"));
        assert!(!state.are_browsers_ready());

        state.on_browser_captured(browser("2", "Firefox 121.0 (Linux x86_64)"));
        assert!(state.are_browsers_ready());
        assert!(state.signals.browsers_ready.is_fired());
        assert_eq!(state.lifecycle.phase(), ServerPhase::BrowsersReady);
    }

    #[test]
    fn test_config_browsers_used_when_none_requested() {
        let state = state_with(&[]);
        state.on_config_event(RunnerConfig {
            browsers: vec!["Chrome".into(), "Safari".into()],
            ..RunnerConfig::default()
        });

        state.on_browser_captured(browser("1", "Chrome"));
        assert!(!state.are_browsers_ready());
        state.on_browser_captured(browser("2", "Safari 17"));
        assert!(state.are_browsers_ready());
    }

    #[test]
    fn test_ready_needs_at_least_one_browser() {
        let state = state_with(&[]);
        assert!(!state.are_browsers_ready());
        state.on_browser_captured(browser("1", "Chromium"));
        assert!(state.are_browsers_ready());
    }

    #[test]
    fn test_handlers_parse_builtin_events() {
        let state = state_with(&[]);
        let registry = HandlerRegistry::new();
        state.register_handlers(&registry);

        registry.dispatch(&EventRecord::new(PORT_EVENT, json!({"port": "not a number"})));
        assert_eq!(state.server_port(), None);

        registry.dispatch(&EventRecord::new(PORT_EVENT, json!({"port": 9999})));
        registry.dispatch(&EventRecord::new(CONFIG_EVENT, json!({"hostname": "127.0.0.1", "urlRoot": "/tests/"})));
        registry.dispatch(&EventRecord::new(BROWSER_EVENT, json!({"name": "Chrome"})));

        assert_eq!(state.server_port(), Some(9999));
        assert_eq!(state.config().unwrap().hostname, "127.0.0.1");
        assert_eq!(state.captured_browsers(), vec![CapturedBrowser {
            id: "Chrome".into(),
            name: "Chrome".into(),
            auto_capturing: false,
        }]);
    }

    #[test]
    fn test_captured_browsers_keep_capture_order() {
        let state = state_with(&["Safari", "Chrome"]);

        state.on_browser_captured(browser("z-9", "Safari 17"));
        state.on_browser_captured(browser("a-1", "Chrome 120"));
        state.on_browser_captured(browser("z-9", "Safari 17.1"));

        let names: Vec<String> = state.captured_browsers().into_iter().map(|b| b.name).collect();
        assert_eq!(names, vec!["Safari 17.1", "Chrome 120"]);
        assert!(state.are_browsers_ready());
    }

    #[test]
    fn test_format_url() {
        let config = RunnerConfig {
            hostname: "127.0.0.1".into(),
            url_root: "/tests/".into(),
            ..RunnerConfig::default()
        };
        assert_eq!(config.format_url(9876, "debug.html", true), "http://127.0.0.1:9876/tests/debug.html");
        assert_eq!(config.format_url(9876, "/debug.html", false), "http://127.0.0.1:9876/debug.html");
        assert_eq!(RunnerConfig::default().format_url(80, "/", true), "http://localhost:80/");
    }
}
