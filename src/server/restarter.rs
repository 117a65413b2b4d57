use crate::coordinator::Coordinator;
use crate::error::{Error, Result};
use crate::server::supervisor::ServerSupervisor;
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Extra time allowed on top of the shutdown timeout for the old process to be reaped.
const TEARDOWN_SLACK: Duration = Duration::from_secs(2);

/// Listener notified with the fresh instance after every successful restart.
pub type RestartListener = Arc<dyn Fn(Arc<ServerSupervisor>) + Send + Sync>;

/// Replaces a supervisor with a freshly launched one built from the same options.
///
/// Restarts are serialized. The old process is fully terminated before the new
/// one is spawned, so two servers never compete for the same port.
pub struct Restarter {
    gate: tokio::sync::Mutex<()>,
    current: RwLock<Arc<ServerSupervisor>>,
    listeners: RwLock<Vec<RestartListener>>,
}

impl Restarter {
    pub fn new(supervisor: Arc<ServerSupervisor>) -> Self {
        Self {
            gate: tokio::sync::Mutex::new(()),
            current: RwLock::new(supervisor),
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// The live instance
    pub fn current(&self) -> Arc<ServerSupervisor> {
        let current = self.current.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(&current)
    }

    /// Run `listener` on the coordinator after each restart, in registration order.
    pub fn on_restart(&self, listener: impl Fn(Arc<ServerSupervisor>) + Send + Sync + 'static) {
        self.listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Arc::new(listener));
    }

    /// Dispose the current instance, wait for its process to be gone, then start
    /// a new one.
    ///
    /// If the old process cannot be confirmed dead in time the current instance
    /// is kept and [`Error::Timeout`] is returned; calling `restart` again
    /// resumes waiting.
    #[tracing::instrument(skip(self))]
    pub async fn restart(&self) -> Result<Arc<ServerSupervisor>> {
        let _gate = self.gate.lock().await;
        let old = self.current();
        tracing::info!(supervisor_id = %old.id(), "Restarting server");

        old.dispose();
        let budget = old.settings().shutdown_timeout() + TEARDOWN_SLACK;
        match tokio::time::timeout(budget, old.wait_for_exit()).await {
            Ok(Ok(exit_code)) => {
                tracing::debug!(supervisor_id = %old.id(), exit_code, "Previous server gone")
            }
            Ok(Err(e)) => {
                tracing::warn!(supervisor_id = %old.id(), error = %e, "Could not observe previous server exit")
            }
            Err(_) => {
                return Err(Error::Timeout(format!(
                    "Previous server (pid {}) still running after {:?}",
                    old.pid(),
                    budget
                )));
            }
        }

        let fresh = ServerSupervisor::start(old.options().clone())?;
        *self.current.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Arc::clone(&fresh);
        tracing::info!(supervisor_id = %fresh.id(), pid = fresh.pid(), "Server restarted");

        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        let coordinator: &Arc<dyn Coordinator> = fresh.options().coordinator();
        for listener in listeners {
            let instance = Arc::clone(&fresh);
            coordinator.post(Box::new(move || listener(instance)));
        }

        Ok(fresh)
    }
}
