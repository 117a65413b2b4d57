use crate::config::{ServerSettings, validate_settings};
use crate::coordinator::{Coordinator, CoordinatorThread};
use crate::error::{Error, Result};
use crate::server::lifecycle::{Lifecycle, LifecycleEntry, ServerLifecycleEvent, ServerPhase};
use crate::server::process::{self, ProcessHandle, UNKNOWN_EXIT_CODE};
use crate::server::signal::Signals;
use crate::server::state::{CapturedBrowser, RunnerConfig, ServerState};
use crate::stream::{HandlerRegistry, OutputListener, ProcessOutputArchive, StreamEventHandler};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// How long output may keep flowing after the process exited before
/// termination is reported anyway (grandchildren can hold the pipes open).
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Unique identifier for a supervisor instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SupervisorId(Uuid);

impl SupervisorId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SupervisorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A collaborator living alongside one supervisor instance, such as a file
/// watcher or a coverage collector.
///
/// Peers register their own event handlers before any output is read and are
/// stopped when the supervisor is disposed.
pub trait SupervisorPeer: Send + Sync {
    fn register_handlers(&self, _registry: &HandlerRegistry) {}

    fn stop(&self);
}

/// Creates the peer for a new supervisor instance.
pub type PeerFactory = Arc<dyn Fn(&ServerSettings) -> Arc<dyn SupervisorPeer> + Send + Sync>;

/// Everything a launch needs; reused unchanged by restarts.
#[derive(Clone)]
pub struct SupervisorOptions {
    settings: ServerSettings,
    coordinator: Arc<dyn Coordinator>,
    peers: Vec<PeerFactory>,
}

impl SupervisorOptions {
    pub fn new(settings: ServerSettings, coordinator: Arc<dyn Coordinator>) -> Self {
        Self {
            settings,
            coordinator,
            peers: Vec::new(),
        }
    }

    /// Options with a dedicated coordination thread.
    pub fn with_coordinator_thread(settings: ServerSettings) -> Result<Self> {
        let coordinator = CoordinatorThread::spawn("harness-coordinator")?;
        Ok(Self::new(settings, coordinator))
    }

    /// Attach a peer created afresh for every launch.
    pub fn with_peer<F>(mut self, factory: F) -> Self
    where
        F: Fn(&ServerSettings) -> Arc<dyn SupervisorPeer> + Send + Sync + 'static,
    {
        self.peers.push(Arc::new(factory));
        self
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.settings
    }

    pub fn coordinator(&self) -> &Arc<dyn Coordinator> {
        &self.coordinator
    }
}

/// Supervises one run of the test-runner server.
///
/// Starting a supervisor spawns the process and begins pumping its output:
/// framed events go to the handler registry (the built-in ones update the
/// [`ServerState`]), plain lines go to the output archive. Interested parties
/// subscribe to three fire-once signals: port bound, browsers ready and
/// terminated. Subscriptions made before a signal fires are queued, later ones
/// run right away with the fired value, and every callback runs on the
/// coordinator, never on the output task.
///
/// Termination is final for an instance. Use a
/// [`Restarter`](crate::server::Restarter) to launch a fresh one with the same
/// options.
///
/// # Example
///
/// ```no_run
/// use harness_supervisor::{ServerSettings, ServerSupervisor, SupervisorOptions};
///
/// #[tokio::main]
/// async fn main() -> harness_supervisor::Result<()> {
///     let settings = ServerSettings::new("node", "server.js", "/pkg", "/work/karma.conf.js");
///     let supervisor = ServerSupervisor::start(SupervisorOptions::with_coordinator_thread(settings)?)?;
///
///     supervisor.on_port_bound(|port| println!("listening on {}", port));
///     supervisor.on_browsers_ready(|browsers| println!("{} browser(s) ready", browsers.len()));
///     supervisor.on_terminated(|code| println!("exited with {}", code));
///
///     supervisor.wait_for_exit().await?;
///     Ok(())
/// }
/// ```
pub struct ServerSupervisor {
    id: SupervisorId,
    options: SupervisorOptions,
    process: ProcessHandle,
    archive: Arc<ProcessOutputArchive>,
    registry: Arc<HandlerRegistry>,
    state: Arc<ServerState>,
    signals: Arc<Signals>,
    lifecycle: Arc<Lifecycle>,
    peers: Vec<Arc<dyn SupervisorPeer>>,
    coverage_dir: Mutex<Option<TempDir>>,
    coverage_path: Option<PathBuf>,
    disposed: AtomicBool,
    exit_rx: watch::Receiver<Option<i32>>,
}

impl ServerSupervisor {
    /// Spawn the server and start supervising it.
    ///
    /// Must be called from within a Tokio runtime. Fails without leaving
    /// anything running if the settings are invalid or the process cannot be
    /// created.
    #[tracing::instrument(skip(options), fields(interpreter = %options.settings.interpreter.display()))]
    pub fn start(options: SupervisorOptions) -> Result<Arc<Self>> {
        let settings = &options.settings;
        validate_settings(settings)?;

        let coverage_dir = if settings.with_coverage {
            let dir = tempfile::Builder::new()
                .prefix("harness-coverage-")
                .tempdir()
                .map_err(|e| Error::Spawn(format!("Failed to create coverage temp dir: {}", e)))?;
            Some(dir)
        } else {
            None
        };
        let coverage_path = coverage_dir.as_ref().map(|dir| dir.path().to_path_buf());

        let launched = process::launch(settings, coverage_path.as_deref())?;
        let id = SupervisorId::new();

        let lifecycle = Arc::new(Lifecycle::new());
        lifecycle.record_event(
            ServerLifecycleEvent::Spawned,
            Some(format!("pid {}", launched.handle.pid())),
        );

        let signals = Arc::new(Signals::new(Arc::clone(&options.coordinator)));
        let state = Arc::new(ServerState::new(
            settings.browsers.clone(),
            Arc::clone(&signals),
            Arc::clone(&lifecycle),
        ));

        // Everything is registered before the first byte of output is read
        let registry = Arc::new(HandlerRegistry::new());
        state.register_handlers(&registry);
        let peers: Vec<Arc<dyn SupervisorPeer>> =
            options.peers.iter().map(|factory| factory(settings)).collect();
        for peer in &peers {
            peer.register_handlers(&registry);
        }

        let archive = Arc::new(ProcessOutputArchive::new(
            &settings.event_marker,
            settings.output_history,
        ));
        archive.add_listener(Arc::clone(&registry) as Arc<dyn OutputListener>);

        let (exit_tx, exit_rx) = watch::channel(None);

        let supervisor = Arc::new(Self {
            id,
            options: options.clone(),
            process: launched.handle,
            archive: Arc::clone(&archive),
            registry,
            state,
            signals: Arc::clone(&signals),
            lifecycle: Arc::clone(&lifecycle),
            peers,
            coverage_dir: Mutex::new(coverage_dir),
            coverage_path,
            disposed: AtomicBool::new(false),
            exit_rx,
        });

        let output_done = archive.pump(launched.stdout, launched.stderr);
        tokio::spawn(observe_termination(
            Arc::downgrade(&supervisor),
            id,
            launched.exit,
            output_done,
            exit_tx,
            signals,
            lifecycle,
        ));

        tracing::info!(supervisor_id = %id, pid = supervisor.pid(), "Server supervisor started");
        Ok(supervisor)
    }

    pub fn id(&self) -> SupervisorId {
        self.id
    }

    pub fn options(&self) -> &SupervisorOptions {
        &self.options
    }

    pub fn settings(&self) -> &ServerSettings {
        &self.options.settings
    }

    pub fn pid(&self) -> u32 {
        self.process.pid()
    }

    pub fn command_line(&self) -> &str {
        self.process.command_line()
    }

    pub fn coverage_temp_dir(&self) -> Option<&Path> {
        self.coverage_path.as_deref()
    }

    pub fn output_archive(&self) -> &Arc<ProcessOutputArchive> {
        &self.archive
    }

    /// Register a handler for framed events of `event_type`, replacing any
    /// earlier one. Events that arrived before registration are not replayed.
    pub fn register_stream_event_handler(
        &self,
        event_type: impl Into<String>,
        handler: impl StreamEventHandler + 'static,
    ) {
        self.registry.register(event_type, handler);
    }

    /// Receive plain output lines and events as they are decoded.
    pub fn add_output_listener(&self, listener: Arc<dyn OutputListener>) {
        self.archive.add_listener(listener);
    }

    /// Run `callback` on the coordinator with the server port once it is bound.
    pub fn on_port_bound(&self, callback: impl FnOnce(u16) + Send + 'static) {
        self.signals.port_bound.subscribe(Box::new(callback));
    }

    /// Run `callback` on the coordinator once at least one browser is captured
    /// and every expected browser is among them.
    pub fn on_browsers_ready(&self, callback: impl FnOnce(Vec<CapturedBrowser>) + Send + 'static) {
        self.signals.browsers_ready.subscribe(Box::new(callback));
    }

    /// Run `callback` on the coordinator with the exit code once the process is gone.
    pub fn on_terminated(&self, callback: impl FnOnce(i32) + Send + 'static) {
        self.signals.terminated.subscribe(Box::new(callback));
    }

    pub fn is_port_bound(&self) -> bool {
        self.signals.port_bound.is_fired()
    }

    pub fn server_port(&self) -> Option<u16> {
        self.state.server_port()
    }

    pub fn are_browsers_ready(&self) -> bool {
        self.state.are_browsers_ready()
    }

    pub fn captured_browsers(&self) -> Vec<CapturedBrowser> {
        self.state.captured_browsers()
    }

    pub fn runner_config(&self) -> Option<RunnerConfig> {
        self.state.config()
    }

    pub fn phase(&self) -> ServerPhase {
        self.lifecycle.phase()
    }

    /// Lifecycle events, newest first
    pub fn history(&self, limit: Option<usize>) -> Vec<LifecycleEntry> {
        self.lifecycle.events(limit)
    }

    /// Exit code, once the process has terminated
    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_rx.borrow()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// URL of `path` on the test server, including the configured url root.
    /// `None` until the port is bound.
    pub fn format_url(&self, path: &str) -> Option<String> {
        self.format_url_inner(path, true)
    }

    /// URL of `path` on the test server, ignoring the url root.
    pub fn format_url_without_url_root(&self, path: &str) -> Option<String> {
        self.format_url_inner(path, false)
    }

    fn format_url_inner(&self, path: &str, with_url_root: bool) -> Option<String> {
        let port = self.state.server_port()?;
        let config = self.state.config().unwrap_or_else(|| {
            tracing::warn!(supervisor_id = %self.id, "Runner config not received yet; assuming defaults");
            RunnerConfig::default()
        });
        Some(config.format_url(port, path, with_url_root))
    }

    /// Resolve with the exit code once the process has terminated and its
    /// output has been fully dispatched.
    pub async fn wait_for_exit(&self) -> Result<i32> {
        let mut exit_rx = self.exit_rx.clone();
        let code = *exit_rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::Process("Termination observer went away".to_string()))?;
        Ok(code.unwrap_or(UNKNOWN_EXIT_CODE))
    }

    /// Schedule interrupt, bounded wait and kill on a background task.
    ///
    /// Never blocks. A no-op once the process has terminated or a shutdown is
    /// already under way.
    #[tracing::instrument(skip(self), fields(supervisor_id = %self.id))]
    pub fn shutdown_async(&self) {
        tracing::info!("Shutting down server asynchronously");
        self.shutdown();
    }

    fn shutdown(&self) {
        if self.process.request_shutdown() {
            self.lifecycle
                .record_event(ServerLifecycleEvent::ShutdownRequested, None);
        }
    }

    /// Tear the instance down: stop peers, delete the coverage directory, drop
    /// queued port and browser callbacks, terminate the process if still alive.
    ///
    /// Only the first call does anything.
    #[tracing::instrument(skip(self), fields(supervisor_id = %self.id))]
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("Disposing server supervisor");

        for peer in &self.peers {
            peer.stop();
        }

        let coverage_dir = self
            .coverage_dir
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(dir) = coverage_dir {
            remove_coverage_dir(dir);
        }

        self.signals.port_bound.clear();
        self.signals.browsers_ready.clear();
        self.lifecycle
            .record_event(ServerLifecycleEvent::Disposed, None);
        self.shutdown();
    }
}

impl Drop for ServerSupervisor {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for ServerSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSupervisor")
            .field("id", &self.id)
            .field("pid", &self.process.pid())
            .field("phase", &self.lifecycle.phase())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

fn remove_coverage_dir(dir: TempDir) {
    let close = move || {
        let path = dir.path().to_path_buf();
        if let Err(e) = dir.close() {
            tracing::warn!(path = %path.display(), error = %e, "Failed to delete coverage temp dir");
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(close);
        }
        Err(_) => close(),
    }
}

/// Wait for the process to exit and the output to drain, then tear the
/// supervisor down and fire the terminated signal.
async fn observe_termination(
    supervisor: Weak<ServerSupervisor>,
    id: SupervisorId,
    exit: JoinHandle<i32>,
    output_done: JoinHandle<()>,
    exit_tx: watch::Sender<Option<i32>>,
    signals: Arc<Signals>,
    lifecycle: Arc<Lifecycle>,
) {
    let exit_code = match exit.await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(supervisor_id = %id, error = %e, "Process watcher failed");
            UNKNOWN_EXIT_CODE
        }
    };

    // Events written just before exit are dispatched before termination is reported
    if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, output_done).await.is_err() {
        tracing::warn!(supervisor_id = %id, "Output pipes still open after exit");
    }

    tracing::info!(supervisor_id = %id, exit_code, "Server terminated");
    lifecycle.record_event(
        ServerLifecycleEvent::Terminated,
        Some(format!("exit code {}", exit_code)),
    );
    if let Some(supervisor) = supervisor.upgrade() {
        supervisor.dispose();
    }

    exit_tx.send_replace(Some(exit_code));
    signals.terminated.fire(exit_code);
}
