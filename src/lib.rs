/*!
 # Harness Supervisor

 A Rust library for launching a browser-based test-runner server as a child
 process and keeping track of what it is doing.

 ## Overview

 Harness Supervisor provides functionality to:
 - Start the server with the right interpreter, script and arguments
 - Separate its free-form log output from framed events written to stdout
 - Route events to handlers keyed by event type
 - Notify subscribers when the port is bound, when every expected browser is
   captured and when the process terminates
 - Shut the server down (interrupt, bounded wait, kill) and restart it

 ## Basic Usage

 ```no_run
 use harness_supervisor::{Result, ServerSettings, ServerSupervisor, SupervisorOptions};

 #[tokio::main]
 async fn main() -> Result<()> {
     // Describe the launch
     let settings = ServerSettings::from_file("harness.json")?
         .with_browsers(vec!["Chrome".to_string()]);

     // Spawn the server; callbacks run on a dedicated coordination thread
     let supervisor = ServerSupervisor::start(SupervisorOptions::with_coordinator_thread(settings)?)?;

     supervisor.on_port_bound(|port| println!("Server listening on {}", port));
     supervisor.on_browsers_ready(|browsers| {
         for browser in browsers {
             println!("Captured {}", browser.name);
         }
     });

     // Custom events written by the server as <marker>TYPE:{json}<marker>
     supervisor.register_stream_event_handler("RESULT", |body: &serde_json::Value| {
         println!("Result: {}", body);
     });

     let exit_code = supervisor.wait_for_exit().await?;
     println!("Server exited with {}", exit_code);

     Ok(())
 }
 ```

 ## Features

 - **Event Framing**: Marker-delimited events survive arbitrary pipe chunking
 - **Fire-once Signals**: Late subscribers still hear about events that already happened
 - **Single Coordination Context**: Callbacks never run on the output task
 - **Configuration**: Load launch settings from JSON or YAML files
 - **Error Handling**: Construction failures are returned, stream problems are logged
 - **Async Support**: Process and pipes are driven by Tokio
 - **Tracing**: Structured logging through the `tracing` crate; server output
   is emitted under the `harness_supervisor::output` target
*/

pub mod config;
pub mod coordinator;
pub mod error;
pub mod server;
pub mod stream;

pub use config::ServerSettings;
pub use coordinator::{Coordinator, CoordinatorThread};
pub use error::{Error, Result};
pub use server::{
    CapturedBrowser, Restarter, RunnerConfig, ServerPhase, ServerSupervisor, SupervisorOptions,
    SupervisorPeer,
};
pub use stream::{EventRecord, OutputKind, OutputLine, OutputListener, StreamEventHandler};
