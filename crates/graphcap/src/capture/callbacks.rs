//! Deferred cleanup hooks tied to captured-graph teardown.

use std::mem;
use std::sync::Mutex;

/// Cleanup hook run when a captured graph is discarded.
pub type ResetCallback = Box<dyn FnOnce() + Send + 'static>;

/// Registry of hooks to run at the current (or, if none is open, the next)
/// capture's eventual teardown.
///
/// The graph returned by a session can outlive the session's `end` call, so
/// releases that must wait for the graph (the memory-pool arena above all)
/// are decoupled from `end` through this registry: `end` drains it into the
/// graph, whose teardown invokes the callbacks in registration order.
#[derive(Default)]
pub struct ResetCallbackRegistry {
    callbacks: Mutex<Vec<ResetCallback>>,
}

impl ResetCallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback`; callbacks run in registration order.
    pub fn add(&self, callback: impl FnOnce() + Send + 'static) {
        self.callbacks
            .lock()
            .expect("reset callbacks poisoned")
            .push(Box::new(callback));
    }

    /// Runs every registered callback in registration order, then empties the
    /// registry.
    pub fn invoke_and_clear(&self) {
        for callback in self.drain() {
            callback();
        }
    }

    /// Empties the registry, handing the callbacks to the caller unrun.
    pub(crate) fn drain(&self) -> Vec<ResetCallback> {
        mem::take(&mut *self.callbacks.lock().expect("reset callbacks poisoned"))
    }

    pub fn len(&self) -> usize {
        self.callbacks.lock().expect("reset callbacks poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[test]
    fn callbacks_run_in_registration_order() {
        let registry = ResetCallbackRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for id in 0..3 {
            let order = Arc::clone(&order);
            registry.add(move || order.lock().unwrap().push(id));
        }
        assert_eq!(registry.len(), 3);

        registry.invoke_and_clear();
        assert_eq!(*order.lock().unwrap(), [0, 1, 2]);
        assert!(registry.is_empty());
    }

    #[test]
    fn invoke_on_an_empty_registry_is_a_no_op() {
        let registry = ResetCallbackRegistry::new();
        registry.invoke_and_clear();
        assert!(registry.is_empty());
    }
}
