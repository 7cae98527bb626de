//! Invariant suites runnable against any backend.
//!
//! Each function drives a capture session through a scenario that must hold
//! for every [`DeviceBackend`] implementation; per-backend integration tests
//! call them with their own backend instance.

use std::sync::Arc;

use graphcap::{
    CaptureEnv, CaptureError, CaptureMode, CaptureSession, DeviceBackend, MemoryPoolId, Place,
};

/// `begin` immediately followed by `end` succeeds, returns a usable graph,
/// and leaves the session idle.
pub fn begin_end_round_trip<B: DeviceBackend>(backend: Arc<B>) {
    let env = CaptureEnv::new(backend);
    let session = CaptureSession::new(env);

    session
        .begin(Place(0), CaptureMode::Relaxed, MemoryPoolId::INVALID)
        .expect("begin failed");
    assert!(session.is_capturing());
    assert_eq!(session.capturing_place(), Some(Place(0)));

    let graph = session.end().expect("end failed");
    assert!(graph.raw().is_ok());
    assert_eq!(graph.place(), Place(0));
    assert!(graph.pool_id().is_valid());
    assert!(!session.is_capturing());
}

/// A second `begin` while the first capture is open fails fast and leaves the
/// open capture undisturbed.
pub fn nested_begin_fails<B: DeviceBackend>(backend: Arc<B>) {
    let env = CaptureEnv::new(backend);
    let session = CaptureSession::new(env);

    session
        .begin(Place(0), CaptureMode::Relaxed, MemoryPoolId::INVALID)
        .expect("begin failed");

    let err = session
        .begin(Place(0), CaptureMode::Relaxed, MemoryPoolId::INVALID)
        .expect_err("nested begin must fail");
    assert!(matches!(err, CaptureError::Precondition { .. }));

    assert!(session.is_capturing());
    session.end().expect("first capture must still end cleanly");
}

/// Sequential captures with unset pool hints never share a pool id, even
/// while the earlier graph's reset callback has not run yet.
pub fn pool_ids_are_unique<B: DeviceBackend>(backend: Arc<B>) {
    let env = CaptureEnv::new(backend);
    let session = CaptureSession::new(env);

    session
        .begin(Place(0), CaptureMode::Relaxed, MemoryPoolId::INVALID)
        .expect("first begin failed");
    let first = session.end().expect("first end failed");

    session
        .begin(Place(0), CaptureMode::Relaxed, MemoryPoolId::INVALID)
        .expect("second begin failed");
    let second = session.end().expect("second end failed");

    assert_ne!(first.pool_id(), second.pool_id());
}
