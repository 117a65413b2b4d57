#![cfg(unix)]

use anyhow::Result;
use assert_fs::TempDir;
use assert_fs::prelude::*;
use harness_supervisor::error::Error;
use harness_supervisor::server::{
    ServerLifecycleEvent, ServerPhase, ServerSupervisor, SupervisorOptions, SupervisorPeer,
    UNKNOWN_EXIT_CODE,
};
use harness_supervisor::stream::{HandlerRegistry, OutputKind};
use harness_supervisor::ServerSettings;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

const READY_SCRIPT: &str = r#"
echo "booting"
echo '##harness-event##PORT:{"port":9999}##harness-event##'
echo '##harness-event##CONFIG:{"hostname":"127.0.0.1","urlRoot":"/tests/","browsers":["Chrome"]}##harness-event##'
echo '##harness-event##BROWSER:{"id":"b1","name":"Chrome 120.0 (Linux x86_64)"}##harness-event##'
exit 0
"#;

const SLEEPING_SCRIPT: &str = r#"
echo '##harness-event##PORT:{"port":9999}##harness-event##'
exec sleep 30
"#;

#[derive(Debug, PartialEq)]
enum Seen {
    Port(u16),
    Browsers(Vec<String>),
    Terminated(i32),
}

fn script_settings(temp: &TempDir, body: &str) -> ServerSettings {
    let script = temp.child("server.sh");
    script.write_str(body).unwrap();
    ServerSettings::new("sh", script.path(), temp.path(), temp.child("karma.conf.js").path())
        .with_shutdown_timeout(Duration::from_millis(300))
}

fn start(settings: ServerSettings) -> Result<Arc<ServerSupervisor>> {
    Ok(ServerSupervisor::start(SupervisorOptions::with_coordinator_thread(settings)?)?)
}

fn record_all(supervisor: &ServerSupervisor) -> UnboundedReceiver<Seen> {
    let (tx, rx) = unbounded_channel();

    let port_tx = tx.clone();
    supervisor.on_port_bound(move |port| {
        let _ = port_tx.send(Seen::Port(port));
    });
    let browsers_tx = tx.clone();
    supervisor.on_browsers_ready(move |browsers| {
        let names = browsers.into_iter().map(|b| b.name).collect();
        let _ = browsers_tx.send(Seen::Browsers(names));
    });
    supervisor.on_terminated(move |code| {
        let _ = tx.send(Seen::Terminated(code));
    });

    rx
}

async fn next(rx: &mut UnboundedReceiver<Seen>) -> Seen {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a callback")
        .expect("callback channel closed")
}

#[tokio::test]
async fn test_port_browsers_and_clean_exit() -> Result<()> {
    let temp = TempDir::new()?;
    let settings = script_settings(&temp, READY_SCRIPT).with_browsers(vec!["Chrome".to_string()]);
    let supervisor = start(settings)?;
    let mut seen = record_all(&supervisor);

    assert_eq!(timeout(WAIT, supervisor.wait_for_exit()).await??, 0);

    assert_eq!(next(&mut seen).await, Seen::Port(9999));
    assert_eq!(
        next(&mut seen).await,
        Seen::Browsers(vec!["Chrome 120.0 (Linux x86_64)".to_string()])
    );
    assert_eq!(next(&mut seen).await, Seen::Terminated(0));

    assert!(supervisor.is_port_bound());
    assert_eq!(supervisor.server_port(), Some(9999));
    assert!(supervisor.are_browsers_ready());
    assert_eq!(supervisor.captured_browsers()[0].id, "b1");
    assert_eq!(supervisor.exit_code(), Some(0));
    assert_eq!(supervisor.phase(), ServerPhase::Terminated);
    assert!(supervisor.is_disposed());
    assert_eq!(
        supervisor.format_url("debug.html").as_deref(),
        Some("http://127.0.0.1:9999/tests/debug.html")
    );
    assert_eq!(
        supervisor.format_url_without_url_root("debug.html").as_deref(),
        Some("http://127.0.0.1:9999/debug.html")
    );

    let lines = supervisor.output_archive().lines();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].text, "booting");
    Ok(())
}

#[tokio::test]
async fn test_early_failure_and_late_subscribers() -> Result<()> {
    let temp = TempDir::new()?;
    let supervisor = start(script_settings(&temp, "echo 'fatal: no config' >&2\nexit 1\n"))?;

    assert_eq!(timeout(WAIT, supervisor.wait_for_exit()).await??, 1);

    // Registered after termination: runs with the recorded exit code
    let mut seen = record_all(&supervisor);
    assert_eq!(next(&mut seen).await, Seen::Terminated(1));

    // Port and browser subscribers are never called for this instance
    assert!(timeout(Duration::from_millis(300), seen.recv()).await.is_err());
    assert!(!supervisor.is_port_bound());
    assert!(supervisor.format_url("/").is_none());
    assert_eq!(supervisor.phase(), ServerPhase::Terminated);

    let lines = supervisor.output_archive().lines();
    assert_eq!(lines[0].kind, OutputKind::Stderr);
    assert_eq!(lines[0].text, "fatal: no config");
    Ok(())
}

#[tokio::test]
async fn test_shutdown_interrupts_running_server() -> Result<()> {
    let temp = TempDir::new()?;
    let supervisor = start(script_settings(&temp, SLEEPING_SCRIPT))?;
    let mut seen = record_all(&supervisor);

    assert_eq!(next(&mut seen).await, Seen::Port(9999));
    assert_eq!(supervisor.phase(), ServerPhase::Running);

    supervisor.shutdown_async();
    supervisor.shutdown_async();

    assert_eq!(timeout(WAIT, supervisor.wait_for_exit()).await??, UNKNOWN_EXIT_CODE);
    assert_eq!(next(&mut seen).await, Seen::Terminated(UNKNOWN_EXIT_CODE));

    let shutdown_requests = supervisor
        .history(None)
        .iter()
        .filter(|entry| entry.event == ServerLifecycleEvent::ShutdownRequested)
        .count();
    assert_eq!(shutdown_requests, 1);
    Ok(())
}

#[tokio::test]
async fn test_dispose_is_idempotent_and_removes_coverage_dir() -> Result<()> {
    let temp = TempDir::new()?;
    let settings = script_settings(&temp, "exec sleep 30\n").with_coverage(true);
    let supervisor = start(settings)?;

    let coverage_dir = supervisor.coverage_temp_dir().expect("coverage dir").to_path_buf();
    assert!(coverage_dir.is_dir());
    assert!(
        supervisor
            .command_line()
            .contains(&format!("--coverageTempDir={}", coverage_dir.display()))
    );

    let (tx, mut rx) = unbounded_channel();
    supervisor.on_port_bound(move |port| {
        let _ = tx.send(port);
    });

    supervisor.dispose();
    supervisor.dispose();
    assert!(supervisor.is_disposed());

    assert_eq!(timeout(WAIT, supervisor.wait_for_exit()).await??, UNKNOWN_EXIT_CODE);
    assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());

    let disposals = supervisor
        .history(None)
        .iter()
        .filter(|entry| entry.event == ServerLifecycleEvent::Disposed)
        .count();
    assert_eq!(disposals, 1);

    timeout(WAIT, async {
        while coverage_dir.exists() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await?;
    Ok(())
}

#[tokio::test]
async fn test_spawn_failure_is_reported() -> Result<()> {
    let temp = TempDir::new()?;
    let mut settings = script_settings(&temp, "exit 0\n");
    settings.interpreter = "/nonexistent/harness-interpreter".into();

    match start(settings) {
        Err(e) => match e.downcast::<Error>()? {
            Error::Spawn(msg) => assert!(msg.contains("/nonexistent/harness-interpreter")),
            other => panic!("unexpected error: {}", other),
        },
        Ok(supervisor) => panic!("started pid {}", supervisor.pid()),
    }
    Ok(())
}

#[tokio::test]
async fn test_invalid_settings_are_rejected() -> Result<()> {
    let temp = TempDir::new()?;
    let settings = script_settings(&temp, "exit 0\n").with_event_marker("");

    let result = ServerSupervisor::start(SupervisorOptions::with_coordinator_thread(settings)?);
    assert!(matches!(result, Err(Error::ConfigInvalid(_))));
    Ok(())
}

#[derive(Default)]
struct ResultCollector {
    results: Arc<Mutex<Vec<Value>>>,
    stopped: Arc<AtomicBool>,
}

impl SupervisorPeer for ResultCollector {
    fn register_handlers(&self, registry: &HandlerRegistry) {
        let results = Arc::clone(&self.results);
        registry.register("RESULT", move |body: &Value| {
            results.lock().unwrap().push(body.clone());
        });
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_peer_handlers_see_custom_events() -> Result<()> {
    let temp = TempDir::new()?;
    let script = "echo '@@ev@@RESULT:{\"passed\":3}@@ev@@'\n\
                  echo '##harness-event##RESULT:{\"passed\":99}##harness-event##'\n";
    let settings = script_settings(&temp, script).with_event_marker("@@ev@@");

    let results = Arc::new(Mutex::new(Vec::new()));
    let stopped = Arc::new(AtomicBool::new(false));
    let (peer_results, peer_stopped) = (Arc::clone(&results), Arc::clone(&stopped));

    let options = SupervisorOptions::with_coordinator_thread(settings)?.with_peer(
        move |_settings: &ServerSettings| -> Arc<dyn SupervisorPeer> {
            Arc::new(ResultCollector {
                results: Arc::clone(&peer_results),
                stopped: Arc::clone(&peer_stopped),
            })
        },
    );
    let supervisor = ServerSupervisor::start(options)?;

    assert_eq!(timeout(WAIT, supervisor.wait_for_exit()).await??, 0);

    assert_eq!(*results.lock().unwrap(), vec![json!({"passed": 3})]);
    assert!(stopped.load(Ordering::SeqCst));
    // The default marker means nothing with a custom one configured
    assert_eq!(supervisor.output_archive().lines().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_environment_reaches_server() -> Result<()> {
    let temp = TempDir::new()?;
    let settings = script_settings(&temp, "echo \"greeting=$HARNESS_GREETING\"\n")
        .with_env("HARNESS_GREETING", "hello");
    let supervisor = start(settings)?;

    timeout(WAIT, supervisor.wait_for_exit()).await??;

    assert_eq!(supervisor.output_archive().lines()[0].text, "greeting=hello");
    Ok(())
}

#[test]
fn test_start_outside_runtime_is_an_error() -> Result<()> {
    let temp = TempDir::new()?;
    let settings = script_settings(&temp, "exit 0\n");

    let result = ServerSupervisor::start(SupervisorOptions::with_coordinator_thread(settings)?);
    match result {
        Err(Error::Spawn(msg)) => assert!(msg.contains("Tokio runtime")),
        other => panic!("unexpected result: {:?}", other),
    }
    Ok(())
}

/// Whether `pid` is a live (not zombie) process
#[cfg(target_os = "linux")]
fn is_running(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => !stat
            .rsplit(')')
            .next()
            .is_some_and(|rest| rest.trim_start().starts_with('Z')),
        Err(_) => false,
    }
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_shutdown_reaches_background_helpers() -> Result<()> {
    let temp = TempDir::new()?;
    let script = "sleep 30 &\n\
                  echo \"helper=$!\"\n\
                  echo '##harness-event##PORT:{\"port\":9999}##harness-event##'\n\
                  wait\n";
    let supervisor = start(script_settings(&temp, script))?;
    let mut seen = record_all(&supervisor);
    assert_eq!(next(&mut seen).await, Seen::Port(9999));

    let helper: u32 = supervisor
        .output_archive()
        .lines()
        .iter()
        .find_map(|line| line.text.strip_prefix("helper="))
        .expect("helper pid line")
        .parse()?;
    assert!(is_running(helper));

    let started = std::time::Instant::now();
    supervisor.shutdown_async();
    timeout(WAIT, supervisor.wait_for_exit()).await??;

    // Output closes with the whole group, well before the drain timeout
    assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
    timeout(WAIT, async {
        while is_running(helper) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await?;
    Ok(())
}
