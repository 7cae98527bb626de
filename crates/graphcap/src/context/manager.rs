//! Bookkeeping for contexts participating in a multi-stream capture.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::backend::spec::DeviceBackend;
use crate::error::CaptureResult;
use crate::memory::MemoryPoolId;
use crate::place::Place;

use super::DeviceContext;

/// Tracks the contexts a scheduler has pre-registered for capture, plus the
/// dedicated contexts created per `(pool, place, stream)` when a capture needs
/// a stream of its own.
pub struct CapturingContextManager<B: DeviceBackend> {
    backend: Arc<B>,
    capturing: Mutex<Vec<Arc<DeviceContext<B>>>>,
    pooled: Mutex<HashMap<(MemoryPoolId, Place, usize), Arc<DeviceContext<B>>>>,
}

impl<B: DeviceBackend> CapturingContextManager<B> {
    pub fn new(backend: Arc<B>) -> Self {
        CapturingContextManager {
            backend,
            capturing: Mutex::new(Vec::new()),
            pooled: Mutex::new(HashMap::new()),
        }
    }

    /// Registers `ctx` as a capture participant. Registration order is
    /// preserved; re-registering the same context is a no-op.
    pub fn record_capturing(&self, ctx: Arc<DeviceContext<B>>) {
        let mut capturing = self.capturing.lock().expect("capturing contexts poisoned");
        if capturing.iter().any(|existing| Arc::ptr_eq(existing, &ctx)) {
            return;
        }
        capturing.push(ctx);
    }

    /// Contexts pre-registered for the next capture, in registration order.
    pub fn all_capturing(&self) -> Vec<Arc<DeviceContext<B>>> {
        self.capturing
            .lock()
            .expect("capturing contexts poisoned")
            .clone()
    }

    /// Returns the context for `(pool, place, stream_index)`, creating it on a
    /// fresh stream on first request.
    pub fn get(
        &self,
        pool: MemoryPoolId,
        place: Place,
        stream_index: usize,
    ) -> CaptureResult<Arc<DeviceContext<B>>> {
        let mut pooled = self.pooled.lock().expect("pooled contexts poisoned");
        let key = (pool, place, stream_index);
        if let Some(ctx) = pooled.get(&key) {
            return Ok(Arc::clone(ctx));
        }
        let ctx = Arc::new(DeviceContext::new(self.backend.as_ref(), place)?);
        pooled.insert(key, Arc::clone(&ctx));
        Ok(ctx)
    }

    /// Drops both the capturing set and the per-pool context records,
    /// returning every participant to the not-capturing state.
    pub fn clear_records(&self) {
        self.capturing
            .lock()
            .expect("capturing contexts poisoned")
            .clear();
        self.pooled.lock().expect("pooled contexts poisoned").clear();
    }
}
