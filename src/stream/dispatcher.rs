use super::archive::OutputListener;
use super::event::EventRecord;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;

/// Handles the body of one event type.
///
/// Handlers run synchronously on the task that pumps the server's output, so
/// they must only do quick state updates or hand work off elsewhere.
#[cfg_attr(test, mockall::automock)]
pub trait StreamEventHandler: Send + Sync {
    fn handle(&self, event_body: &Value);
}

impl<F> StreamEventHandler for F
where
    F: Fn(&Value) + Send + Sync,
{
    fn handle(&self, event_body: &Value) {
        self(event_body)
    }
}

/// Maps event type names to their handler and routes parsed events.
///
/// Registration may happen at any time, concurrently with dispatch. The last
/// registration for a type wins.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Arc<dyn StreamEventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event_type`, replacing any previous handler.
    pub fn register(&self, event_type: impl Into<String>, handler: impl StreamEventHandler + 'static) {
        self.register_arc(event_type, Arc::new(handler));
    }

    pub fn register_arc(&self, event_type: impl Into<String>, handler: Arc<dyn StreamEventHandler>) {
        let event_type = event_type.into();
        if self.handlers.insert(event_type.clone(), handler).is_some() {
            tracing::debug!(event_type = %event_type, "Replaced stream event handler");
        }
    }

    pub fn is_registered(&self, event_type: &str) -> bool {
        self.handlers.contains_key(event_type)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Invoke the handler registered for `record.event_type`, if any.
    ///
    /// Returns whether a handler ran. Unknown types are logged and dropped.
    pub fn dispatch(&self, record: &EventRecord) -> bool {
        // Clone the handler out so the shard lock is not held while it runs
        let handler = self
            .handlers
            .get(&record.event_type)
            .map(|entry| Arc::clone(entry.value()));

        match handler {
            Some(handler) => {
                tracing::debug!(event_type = %record.event_type, body = %record.event_body, "Dispatching event");
                handler.handle(&record.event_body);
                true
            }
            None => {
                tracing::warn!(event_type = %record.event_type, "No handler registered for event");
                false
            }
        }
    }
}

impl OutputListener for HandlerRegistry {
    fn on_event(&self, record: &EventRecord) {
        self.dispatch(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_dispatch_invokes_registered_handler() {
        let mut mock = MockStreamEventHandler::new();
        mock.expect_handle()
            .with(eq(json!({"port": 9876})))
            .times(1)
            .return_const(());

        let registry = HandlerRegistry::new();
        registry.register_arc("PORT", Arc::new(mock));

        assert!(registry.dispatch(&EventRecord::new("PORT", json!({"port": 9876}))));
    }

    #[test]
    fn test_unknown_event_type_is_dropped() {
        let registry = HandlerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        registry.register("KNOWN", move |_: &Value| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!registry.dispatch(&EventRecord::new("UNKNOWN", json!(null))));
        assert!(registry.dispatch(&EventRecord::new("KNOWN", json!(null))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_register_overwrites_previous_handler() {
        let mut old = MockStreamEventHandler::new();
        old.expect_handle().times(0);
        let mut new = MockStreamEventHandler::new();
        new.expect_handle().times(2).return_const(());

        let registry = HandlerRegistry::new();
        registry.register_arc("EVT", Arc::new(old));
        registry.register_arc("EVT", Arc::new(new));

        assert_eq!(registry.len(), 1);
        registry.dispatch(&EventRecord::new("EVT", json!(1)));
        registry.dispatch(&EventRecord::new("EVT", json!(2)));
    }
}
