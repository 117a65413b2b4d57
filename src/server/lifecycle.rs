use std::sync::{Mutex, MutexGuard};
use std::time::Instant;

/// Supervisor-level phase. Only ever moves forward; `Terminated` is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ServerPhase {
    /// Process spawned, port not bound yet
    Starting,
    /// Server port bound
    Running,
    /// Every expected browser captured
    BrowsersReady,
    /// Process exited
    Terminated,
}

/// Things that happen to a supervised server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerLifecycleEvent {
    /// Process spawned
    Spawned,
    /// Server reported its port
    PortBound,
    /// Readiness predicate became true
    BrowsersReady,
    /// Forced shutdown scheduled
    ShutdownRequested,
    /// Supervisor torn down
    Disposed,
    /// Process exited
    Terminated,
}

impl ServerLifecycleEvent {
    fn target_phase(self) -> Option<ServerPhase> {
        match self {
            ServerLifecycleEvent::Spawned => Some(ServerPhase::Starting),
            ServerLifecycleEvent::PortBound => Some(ServerPhase::Running),
            ServerLifecycleEvent::BrowsersReady => Some(ServerPhase::BrowsersReady),
            ServerLifecycleEvent::Terminated => Some(ServerPhase::Terminated),
            ServerLifecycleEvent::ShutdownRequested | ServerLifecycleEvent::Disposed => None,
        }
    }
}

/// One recorded lifecycle event
#[derive(Debug, Clone)]
pub struct LifecycleEntry {
    /// Event type
    pub event: ServerLifecycleEvent,
    /// Phase right after the event
    pub phase: ServerPhase,
    /// Event timestamp
    pub timestamp: Instant,
    /// Event details
    pub details: Option<String>,
}

struct Inner {
    phase: ServerPhase,
    entries: Vec<LifecycleEntry>,
}

/// Phase tracker and event log for one supervisor instance
pub struct Lifecycle {
    inner: Mutex<Inner>,
}

impl Lifecycle {
    /// Create a lifecycle in the `Starting` phase
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                phase: ServerPhase::Starting,
                entries: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record an event and return the phase after it.
    ///
    /// Events that would move the phase backwards are still logged but leave
    /// the phase untouched.
    pub fn record_event(&self, event: ServerLifecycleEvent, details: Option<String>) -> ServerPhase {
        let mut inner = self.lock();

        if let Some(target) = event.target_phase() {
            if target > inner.phase {
                inner.phase = target;
            }
        }

        let phase = inner.phase;
        inner.entries.push(LifecycleEntry {
            event,
            phase,
            timestamp: Instant::now(),
            details,
        });

        // Limit event history
        if inner.entries.len() > 100 {
            inner.entries.remove(0);
        }

        phase
    }

    /// Current phase
    pub fn phase(&self) -> ServerPhase {
        self.lock().phase
    }

    pub fn is_terminated(&self) -> bool {
        self.phase() == ServerPhase::Terminated
    }

    /// Recorded events, newest first
    pub fn events(&self, limit: Option<usize>) -> Vec<LifecycleEntry> {
        let mut events: Vec<LifecycleEntry> = self.lock().entries.iter().rev().cloned().collect();

        if let Some(limit) = limit {
            events.truncate(limit);
        }

        events
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
