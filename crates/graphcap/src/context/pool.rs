//! Lookup-or-create registry of default per-place contexts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::backend::spec::DeviceBackend;
use crate::error::CaptureResult;
use crate::place::Place;

use super::DeviceContext;

/// One default context per place, created on first request and reused for the
/// lifetime of the owning environment.
pub struct DeviceContextPool<B: DeviceBackend> {
    backend: Arc<B>,
    contexts: Mutex<HashMap<Place, Arc<DeviceContext<B>>>>,
}

impl<B: DeviceBackend> DeviceContextPool<B> {
    pub fn new(backend: Arc<B>) -> Self {
        DeviceContextPool {
            backend,
            contexts: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the default context for `place`, creating it on first request.
    pub fn get(&self, place: Place) -> CaptureResult<Arc<DeviceContext<B>>> {
        let mut contexts = self.contexts.lock().expect("device context pool poisoned");
        if let Some(ctx) = contexts.get(&place) {
            return Ok(Arc::clone(ctx));
        }
        let ctx = Arc::new(DeviceContext::new(self.backend.as_ref(), place)?);
        contexts.insert(place, Arc::clone(&ctx));
        Ok(ctx)
    }
}
