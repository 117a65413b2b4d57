use anyhow::Result;
use harness_supervisor::{ServerSettings, ServerSupervisor, SupervisorOptions};
use std::time::Duration;
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> Result<()> {
    // `RUST_LOG=harness_supervisor=debug` also shows the server's own output
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .init();

    let settings_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "demos/harness.json".to_string());
    tracing::info!(path = %settings_path, "Loading server settings");
    let settings = ServerSettings::from_file(&settings_path)?;

    let supervisor = ServerSupervisor::start(SupervisorOptions::with_coordinator_thread(settings)?)?;
    println!("Started: {}", supervisor.command_line());

    supervisor.on_port_bound(|port| println!("Server listening on port {}", port));
    supervisor.on_browsers_ready(|browsers| {
        println!("Browsers ready:");
        for browser in browsers {
            println!("- {} ({})", browser.name, browser.id);
        }
    });
    supervisor.on_terminated(|code| println!("Server terminated with exit code {}", code));

    supervisor.register_stream_event_handler("RESULT", |body: &serde_json::Value| {
        println!("Result: {}", body);
    });

    // Give the server a while, then shut it down
    match tokio::time::timeout(Duration::from_secs(60), supervisor.wait_for_exit()).await {
        Ok(code) => println!("Exit code: {}", code?),
        Err(_) => {
            if let Some(url) = supervisor.format_url("debug.html") {
                println!("Debug page was at {}", url);
            }
            println!("Stopping server...");
            supervisor.shutdown_async();
            println!("Exit code: {}", supervisor.wait_for_exit().await?);
        }
    }

    Ok(())
}
