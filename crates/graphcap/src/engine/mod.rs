//! Named registry of inference-engine instances.
//!
//! The predictor library behind an [`Engine`] is a third-party concern; this
//! module owns only the naming contract: a named instance can be created,
//! fetched, replaced, and destroyed. Engine construction goes through an
//! injected [`EngineFactory`] so no predictor dependency leaks into this
//! crate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::error::{CaptureError, CaptureResult};
use crate::place::Place;

/// Opaque predictor instance owned by the [`EngineManager`].
pub trait Engine: Send + Sync + std::fmt::Debug {
    /// Identifies the adapter that produced this engine.
    fn kind(&self) -> &str;
}

/// Build-time configuration for one engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Serialized model program.
    #[serde(default)]
    pub model: Vec<u8>,
    /// Serialized model parameters.
    #[serde(default)]
    pub params: Vec<u8>,
    /// Device the engine should execute on; `None` means host.
    #[serde(default)]
    pub place: Option<Place>,
    /// Host math-library thread count.
    #[serde(default = "default_math_threads")]
    pub math_threads: usize,
}

fn default_math_threads() -> usize {
    1
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            model: Vec::new(),
            params: Vec::new(),
            place: None,
            math_threads: default_math_threads(),
        }
    }
}

/// Builds engines from configuration.
pub type EngineFactory =
    Arc<dyn Fn(&EngineConfig) -> CaptureResult<Arc<dyn Engine>> + Send + Sync>;

/// Name-keyed registry of engines. Names are unique; `create` replaces any
/// existing instance under the same name.
pub struct EngineManager {
    factory: EngineFactory,
    engines: Mutex<HashMap<String, Arc<dyn Engine>>>,
}

impl EngineManager {
    pub fn new(factory: EngineFactory) -> Self {
        EngineManager {
            factory,
            engines: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_factory<F>(factory: F) -> Self
    where
        F: Fn(&EngineConfig) -> CaptureResult<Arc<dyn Engine>> + Send + Sync + 'static,
    {
        Self::new(Arc::new(factory))
    }

    pub fn is_empty(&self) -> bool {
        self.engines.lock().expect("engine registry poisoned").is_empty()
    }

    pub fn len(&self) -> usize {
        self.engines.lock().expect("engine registry poisoned").len()
    }

    pub fn has(&self, name: &str) -> bool {
        self.engines
            .lock()
            .expect("engine registry poisoned")
            .contains_key(name)
    }

    /// Returns the engine registered under `name`. Looking up a name that was
    /// never created is a programmer error.
    pub fn get(&self, name: &str) -> CaptureResult<Arc<dyn Engine>> {
        self.engines
            .lock()
            .expect("engine registry poisoned")
            .get(name)
            .cloned()
            .ok_or_else(|| {
                CaptureError::null_access(format!("no engine registered under '{name}'"))
            })
    }

    /// Builds an engine from `config` and registers it under `name`,
    /// replacing any existing instance.
    pub fn create(&self, name: &str, config: &EngineConfig) -> CaptureResult<Arc<dyn Engine>> {
        let engine = (self.factory)(config)?;
        self.engines
            .lock()
            .expect("engine registry poisoned")
            .insert(name.to_string(), Arc::clone(&engine));
        Ok(engine)
    }

    /// Registers an externally built engine under `name`, replacing any
    /// existing instance.
    pub fn set(&self, name: &str, engine: Arc<dyn Engine>) {
        self.engines
            .lock()
            .expect("engine registry poisoned")
            .insert(name.to_string(), engine);
    }

    /// Releases every owned engine.
    pub fn delete_all(&self) {
        self.engines.lock().expect("engine registry poisoned").clear();
    }
}
