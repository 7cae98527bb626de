use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use graphcap::{CaptureEnv, CaptureError, CaptureMode, CaptureSession, MemoryPoolId, Place};
use graphcap_backend_tests::{DriverCall, RecordingBackend};

#[test]
fn shared_invariants_hold_for_the_recording_backend() {
    use graphcap_backend_tests::session_invariants;

    session_invariants::begin_end_round_trip(Arc::new(RecordingBackend::new()));
    session_invariants::nested_begin_fails(Arc::new(RecordingBackend::new()));
    session_invariants::pool_ids_are_unique(Arc::new(RecordingBackend::new()));
}

#[test]
fn single_stream_capture_uses_the_default_context() -> anyhow::Result<()> {
    let backend = Arc::new(RecordingBackend::new());
    let env = CaptureEnv::new(Arc::clone(&backend));
    let session = CaptureSession::new(Arc::clone(&env));
    let place = Place(0);

    session.begin(place, CaptureMode::Relaxed, MemoryPoolId::INVALID)?;

    let default_ctx = env.device_contexts().get(place)?;
    assert!(default_ctx.has_capture_allocator());
    assert_eq!(session.capturing_place(), Some(place));
    let pool_id = session.capturing_pool_id().expect("pool id assigned");
    assert!(pool_id.is_valid());
    assert!(env.allocators().is_pool_live(pool_id));

    // The recording began on the default context's stream.
    let begin_stream = default_ctx.stream().id();
    assert_eq!(
        backend.count(|call| matches!(
            call,
            DriverCall::BeginCapture { stream, .. } if *stream == begin_stream
        )),
        1
    );

    backend.record_operation(default_ctx.stream(), "matmul")?;
    let graph = session.end()?;

    assert!(!session.is_capturing());
    assert!(!default_ctx.has_capture_allocator());
    assert_eq!(graph.pool_id(), pool_id);
    assert_eq!(graph.raw()?.body.len(), 1);

    // No events are involved in a single-stream capture.
    assert_eq!(backend.count(|call| matches!(call, DriverCall::WaitEvent { .. })), 0);
    Ok(())
}

#[test]
fn nested_begin_is_a_precondition_violation() {
    let backend = Arc::new(RecordingBackend::new());
    let session = CaptureSession::new(CaptureEnv::new(backend));

    session
        .begin(Place(0), CaptureMode::Strict, MemoryPoolId::INVALID)
        .unwrap();
    let err = session
        .begin(Place(0), CaptureMode::Strict, MemoryPoolId::INVALID)
        .unwrap_err();
    assert!(matches!(err, CaptureError::Precondition { .. }));

    // The open capture is intact and still ends cleanly.
    assert_eq!(session.capturing_mode(), Some(CaptureMode::Strict));
    session.end().unwrap();
}

#[test]
fn end_without_begin_is_a_precondition_violation() {
    let backend = Arc::new(RecordingBackend::new());
    let session = CaptureSession::new(CaptureEnv::new(backend));

    let err = session.end().unwrap_err();
    assert!(matches!(err, CaptureError::Precondition { .. }));
}

#[test]
fn reset_callbacks_fire_at_graph_teardown_not_at_end() -> anyhow::Result<()> {
    let backend = Arc::new(RecordingBackend::new());
    let env = CaptureEnv::new(Arc::clone(&backend));
    let session = CaptureSession::new(Arc::clone(&env));

    let fired = Arc::new(AtomicBool::new(false));
    session.begin(Place(0), CaptureMode::Relaxed, MemoryPoolId::INVALID)?;
    let pool_id = session.capturing_pool_id().expect("pool id assigned");
    {
        let fired = Arc::clone(&fired);
        session.add_reset_callback(move || fired.store(true, Ordering::Release));
    }

    let graph = session.end()?;
    assert!(!fired.load(Ordering::Acquire));
    assert!(env.allocators().is_pool_live(pool_id));

    drop(graph);
    assert!(fired.load(Ordering::Acquire));
    assert!(!env.allocators().is_pool_live(pool_id));
    assert_eq!(
        backend.count(|call| matches!(call, DriverCall::ReleasePool { pool } if *pool == pool_id)),
        1
    );
    Ok(())
}

#[test]
fn reset_callbacks_run_in_registration_order() -> anyhow::Result<()> {
    let backend = Arc::new(RecordingBackend::new());
    let session = CaptureSession::new(CaptureEnv::new(backend));

    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    session.begin(Place(0), CaptureMode::Relaxed, MemoryPoolId::INVALID)?;
    for id in 0..3 {
        let order = Arc::clone(&order);
        session.add_reset_callback(move || order.lock().unwrap().push(id));
    }

    let mut graph = session.end()?;
    graph.reset();
    assert_eq!(*order.lock().unwrap(), [0, 1, 2]);

    // Teardown runs once: dropping after an explicit reset re-runs nothing.
    drop(graph);
    assert_eq!(*order.lock().unwrap(), [0, 1, 2]);
    Ok(())
}

#[test]
fn explicit_pool_hint_is_adopted_verbatim() -> anyhow::Result<()> {
    let backend = Arc::new(RecordingBackend::new());
    let session = CaptureSession::new(CaptureEnv::new(backend));
    let hint = MemoryPoolId::from_raw(41);

    session.begin(Place(0), CaptureMode::Relaxed, hint)?;
    assert_eq!(session.capturing_pool_id(), Some(hint));
    let graph = session.end()?;
    assert_eq!(graph.pool_id(), hint);
    Ok(())
}

#[test]
fn failed_library_materialization_leaves_the_session_idle() {
    let backend = Arc::new(RecordingBackend::new());
    let env = CaptureEnv::new(Arc::clone(&backend));
    let session = CaptureSession::new(Arc::clone(&env));

    backend.fail_library_handles(true);
    let err = session
        .begin(Place(0), CaptureMode::Relaxed, MemoryPoolId::INVALID)
        .unwrap_err();
    assert!(matches!(err, CaptureError::ResourceExhausted { .. }));
    assert!(!session.is_capturing());

    // Handle creation failed before the recording started.
    assert_eq!(backend.count(|call| matches!(call, DriverCall::BeginCapture { .. })), 0);

    // Recovery: the next begin succeeds once the device cooperates.
    backend.fail_library_handles(false);
    session
        .begin(Place(0), CaptureMode::Relaxed, MemoryPoolId::INVALID)
        .unwrap();
    session.end().unwrap();
}

#[test]
fn failed_allocator_setup_unwinds_the_recording() {
    let backend = Arc::new(RecordingBackend::new());
    let env = CaptureEnv::new(Arc::clone(&backend));
    let session = CaptureSession::new(Arc::clone(&env));
    let place = Place(0);

    backend.fail_pool_allocators(true);
    let err = session
        .begin(place, CaptureMode::Relaxed, MemoryPoolId::INVALID)
        .unwrap_err();
    assert!(matches!(err, CaptureError::Backend(_)));
    assert!(!session.is_capturing());

    // The recording that was started got abandoned and nothing stayed attached.
    let default_ctx = env.device_contexts().get(place).unwrap();
    assert!(!default_ctx.has_capture_allocator());
    assert_eq!(backend.count(|call| matches!(call, DriverCall::EndCapture { .. })), 1);

    backend.fail_pool_allocators(false);
    session
        .begin(place, CaptureMode::Relaxed, MemoryPoolId::INVALID)
        .unwrap();
    let graph = session.end().unwrap();
    assert!(graph.raw().is_ok());
}

#[test]
fn replay_submits_to_the_requested_stream() -> anyhow::Result<()> {
    let backend = Arc::new(RecordingBackend::new());
    let env = CaptureEnv::new(Arc::clone(&backend));
    let session = CaptureSession::new(Arc::clone(&env));
    let place = Place(0);

    session.begin(place, CaptureMode::Relaxed, MemoryPoolId::INVALID)?;
    let graph = session.end()?;

    let stream = env.device_contexts().get(place)?.stream().clone();
    graph.replay(&stream)?;
    graph.replay(&stream)?;
    assert_eq!(backend.count(|call| matches!(call, DriverCall::ReplayGraph { .. })), 2);
    Ok(())
}

#[test]
fn workspace_reservations_are_cleared_by_the_session() -> anyhow::Result<()> {
    let backend = Arc::new(RecordingBackend::new());
    let env = CaptureEnv::new(Arc::clone(&backend));
    let session = CaptureSession::new(Arc::clone(&env));
    let place = Place(0);

    let ctx = env.device_contexts().get(place)?;
    ctx.reserve_workspace(1 << 20);
    assert_eq!(ctx.workspace_bytes(), 1 << 20);

    // Begin resets the scratch state before the recording starts.
    session.begin(place, CaptureMode::Relaxed, MemoryPoolId::INVALID)?;
    assert_eq!(ctx.workspace_bytes(), 0);

    ctx.reserve_workspace(1 << 16);
    session.end()?;
    assert_eq!(ctx.workspace_bytes(), 0);
    Ok(())
}
