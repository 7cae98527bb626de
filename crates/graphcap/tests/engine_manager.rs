use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use graphcap::engine::{Engine, EngineConfig, EngineManager};
use graphcap::{CaptureError, Place};

#[derive(Debug)]
struct StubEngine;

impl Engine for StubEngine {
    fn kind(&self) -> &str {
        "stub"
    }
}

fn manager_with_counter() -> (EngineManager, Arc<AtomicUsize>) {
    let built = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&built);
    let manager = EngineManager::with_factory(move |_config: &EngineConfig| {
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(StubEngine) as Arc<dyn Engine>)
    });
    (manager, built)
}

#[test]
fn create_then_has_then_delete_all() {
    let (manager, built) = manager_with_counter();
    assert!(manager.is_empty());

    manager.create("m", &EngineConfig::default()).unwrap();
    assert!(manager.has("m"));
    assert_eq!(manager.len(), 1);
    assert_eq!(built.load(Ordering::Relaxed), 1);

    manager.delete_all();
    assert!(!manager.has("m"));
    assert!(manager.is_empty());
}

#[test]
fn get_on_an_unknown_name_is_a_null_access() {
    let (manager, _built) = manager_with_counter();

    let err = manager.get("never-created").unwrap_err();
    assert!(matches!(err, CaptureError::NullAccess { .. }));
}

#[test]
fn create_overwrites_an_existing_engine() {
    let (manager, built) = manager_with_counter();

    let first = manager.create("m", &EngineConfig::default()).unwrap();
    let second = manager.create("m", &EngineConfig::default()).unwrap();
    assert_eq!(manager.len(), 1);
    assert_eq!(built.load(Ordering::Relaxed), 2);
    assert!(!Arc::ptr_eq(&first, &second));

    let fetched = manager.get("m").unwrap();
    assert!(Arc::ptr_eq(&fetched, &second));
}

#[test]
fn set_registers_an_externally_built_engine() {
    let (manager, built) = manager_with_counter();

    let engine: Arc<dyn Engine> = Arc::new(StubEngine);
    manager.set("external", Arc::clone(&engine));
    assert!(manager.has("external"));
    assert_eq!(built.load(Ordering::Relaxed), 0);

    let fetched = manager.get("external").unwrap();
    assert!(Arc::ptr_eq(&fetched, &engine));
    assert_eq!(fetched.kind(), "stub");
}

#[test]
fn factory_failures_do_not_register_anything() {
    let manager = EngineManager::with_factory(|_config: &EngineConfig| {
        Err(graphcap::CaptureError::resource_exhausted("device out of memory"))
    });

    let err = manager.create("m", &EngineConfig::default()).unwrap_err();
    assert!(matches!(err, CaptureError::ResourceExhausted { .. }));
    assert!(!manager.has("m"));
}

#[test]
fn config_round_trips_through_json() {
    let config = EngineConfig {
        model: b"program".to_vec(),
        params: b"weights".to_vec(),
        place: Some(Place(1)),
        math_threads: 4,
    };

    let encoded = serde_json::to_string(&config).unwrap();
    let decoded: EngineConfig = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded.model, config.model);
    assert_eq!(decoded.place, Some(Place(1)));
    assert_eq!(decoded.math_threads, 4);
}
