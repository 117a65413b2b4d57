use crate::coordinator::Coordinator;
use crate::server::state::CapturedBrowser;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Callback run once a signal has fired.
pub type Callback<T> = Box<dyn FnOnce(T) + Send + 'static>;

/// Phase of a fire-once signal.
enum SignalState<T> {
    /// Not fired yet; callbacks wait in registration order
    Pending(Vec<Callback<T>>),
    /// Fired with this value; new callbacks run right away
    Fired(T),
}

/// A fire-once notification whose callbacks all run on the coordinator.
///
/// The queue is only touched from jobs posted to the coordinator, so
/// registration, firing and clearing are totally ordered.
pub(crate) struct Signal<T> {
    name: &'static str,
    fired: AtomicBool,
    state: Arc<Mutex<SignalState<T>>>,
    coordinator: Arc<dyn Coordinator>,
}

fn lock<T>(state: &Mutex<SignalState<T>>) -> MutexGuard<'_, SignalState<T>> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<T> Signal<T>
where
    T: Clone + Send + 'static,
{
    pub(crate) fn new(name: &'static str, coordinator: Arc<dyn Coordinator>) -> Self {
        Self {
            name,
            fired: AtomicBool::new(false),
            state: Arc::new(Mutex::new(SignalState::Pending(Vec::new()))),
            coordinator,
        }
    }

    /// Whether [`fire`](Self::fire) has been called. Callbacks may still be in flight.
    pub(crate) fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Queue `callback`, or run it with the fired value if the signal already fired.
    pub(crate) fn subscribe(&self, callback: Callback<T>) {
        let state = Arc::clone(&self.state);
        self.coordinator.post(Box::new(move || {
            let value = match &mut *lock(&state) {
                SignalState::Pending(callbacks) => {
                    callbacks.push(callback);
                    return;
                }
                SignalState::Fired(value) => value.clone(),
            };
            callback(value);
        }));
    }

    /// Fire the signal. Only the first call has any effect; returns whether it was this one.
    pub(crate) fn fire(&self, value: T) -> bool {
        if self
            .fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        tracing::debug!(signal = self.name, "Signal fired");
        let state = Arc::clone(&self.state);
        self.coordinator.post(Box::new(move || {
            let previous = std::mem::replace(&mut *lock(&state), SignalState::Fired(value.clone()));
            if let SignalState::Pending(callbacks) = previous {
                for callback in callbacks {
                    callback(value.clone());
                }
            }
        }));
        true
    }

    /// Drop every queued callback without running it. Late registrations still queue.
    pub(crate) fn clear(&self) {
        let state = Arc::clone(&self.state);
        self.coordinator.post(Box::new(move || {
            if let SignalState::Pending(callbacks) = &mut *lock(&state) {
                callbacks.clear();
            }
        }));
    }
}

/// The three lifecycle signals of one supervisor instance.
pub(crate) struct Signals {
    pub(crate) port_bound: Signal<u16>,
    pub(crate) browsers_ready: Signal<Vec<CapturedBrowser>>,
    pub(crate) terminated: Signal<i32>,
}

impl Signals {
    pub(crate) fn new(coordinator: Arc<dyn Coordinator>) -> Self {
        Self {
            port_bound: Signal::new("port-bound", Arc::clone(&coordinator)),
            browsers_ready: Signal::new("browsers-ready", Arc::clone(&coordinator)),
            terminated: Signal::new("terminated", coordinator),
        }
    }
}
