/// Supervision of the test-runner server process.
///
/// This module spawns the server, tracks what it reports about itself and
/// notifies subscribers when it binds its port, when its browsers are ready and
/// when it terminates. All public components are instrumented with `tracing`
/// spans.
///
/// # Components
///
/// * `supervisor` - Owns one server run and its fire-once signals
/// * `restarter` - Replaces a supervisor with a fresh one built from the same options
/// * `state` - Port, runner config and captured browsers derived from events
/// * `lifecycle` - Monotonic phase tracking and event history
/// * `process` - Spawning and interrupt-then-kill shutdown of the OS process
///
/// # Examples
///
/// Restarting a server once its browsers are ready:
///
/// ```no_run
/// use harness_supervisor::ServerSettings;
/// use harness_supervisor::server::{Restarter, ServerSupervisor, SupervisorOptions};
///
/// # async fn run() -> harness_supervisor::Result<()> {
/// let settings = ServerSettings::from_file("harness.yaml")?;
/// let supervisor = ServerSupervisor::start(SupervisorOptions::with_coordinator_thread(settings)?)?;
///
/// let restarter = Restarter::new(supervisor);
/// restarter.on_restart(|fresh| println!("now running pid {}", fresh.pid()));
///
/// let fresh = restarter.restart().await?;
/// fresh.on_browsers_ready(|browsers| println!("{:?}", browsers));
/// # Ok(())
/// # }
/// ```
pub mod lifecycle;
pub mod process;
pub mod restarter;
pub(crate) mod signal;
pub mod state;
pub mod supervisor;

pub use lifecycle::{Lifecycle, LifecycleEntry, ServerLifecycleEvent, ServerPhase};
pub use process::{ProcessHandle, UNKNOWN_EXIT_CODE};
pub use restarter::{RestartListener, Restarter};
pub use state::{CapturedBrowser, RunnerConfig, ServerState};
pub use supervisor::{
    PeerFactory, ServerSupervisor, SupervisorId, SupervisorOptions, SupervisorPeer,
};
