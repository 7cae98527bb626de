use std::sync::Arc;

use graphcap::context::DeviceContext;
use graphcap::{CaptureEnv, CaptureError, CaptureMode, CaptureSession, MemoryPoolId, Place};
use graphcap_backend_tests::{DriverCall, RecordingBackend};

fn env_with_capturing_contexts(
    count: usize,
) -> (
    Arc<RecordingBackend>,
    Arc<CaptureEnv<RecordingBackend>>,
    Vec<Arc<DeviceContext<RecordingBackend>>>,
) {
    let backend = Arc::new(RecordingBackend::new());
    let env = CaptureEnv::new(Arc::clone(&backend));
    let place = Place(0);

    let mut registered = Vec::with_capacity(count);
    for _ in 0..count {
        let ctx = Arc::new(DeviceContext::new(backend.as_ref(), place).unwrap());
        env.capturing_contexts().record_capturing(Arc::clone(&ctx));
        registered.push(ctx);
    }
    (backend, env, registered)
}

#[test]
fn multi_stream_capture_requires_the_mode_flag() {
    let (_backend, env, _registered) = env_with_capturing_contexts(2);
    let session = CaptureSession::new(env);

    let err = session
        .begin(Place(0), CaptureMode::Relaxed, MemoryPoolId::INVALID)
        .unwrap_err();
    assert!(matches!(err, CaptureError::Precondition { .. }));
    assert!(!session.is_capturing());
}

#[test]
fn one_registered_context_drives_the_capture_on_its_own_stream() -> anyhow::Result<()> {
    let (backend, env, registered) = env_with_capturing_contexts(1);
    let session = CaptureSession::new(Arc::clone(&env));
    let ctx = &registered[0];

    // A single pre-registered stream needs no mode flag and no fencing.
    session.begin(Place(0), CaptureMode::Relaxed, MemoryPoolId::INVALID)?;
    assert!(ctx.has_capture_allocator());
    let begin_stream = ctx.stream().id();
    assert_eq!(
        backend.count(|call| matches!(
            call,
            DriverCall::BeginCapture { stream, .. } if *stream == begin_stream
        )),
        1
    );
    assert_eq!(backend.count(|call| matches!(call, DriverCall::CreateEvent { .. })), 0);

    session.end()?;
    assert!(!ctx.has_capture_allocator());
    assert!(env.capturing_contexts().all_capturing().is_empty());
    Ok(())
}

#[test]
fn fan_out_and_fan_in_fence_every_secondary_stream() -> anyhow::Result<()> {
    const SECONDARIES: usize = 3;
    let (backend, env, registered) = env_with_capturing_contexts(SECONDARIES);
    env.flags().set_multi_stream_capture(true);
    let session = CaptureSession::new(Arc::clone(&env));
    let place = Place(0);

    session.begin(place, CaptureMode::Relaxed, MemoryPoolId::INVALID)?;
    let pool_id = session.capturing_pool_id().expect("pool id assigned");
    assert!(pool_id.is_valid());

    // The recording runs on a dedicated stream, not on any registered one.
    let primary = env.capturing_contexts().get(pool_id, place, 0)?;
    let primary_stream = primary.stream().id();
    for ctx in &registered {
        assert_ne!(ctx.stream().id(), primary_stream);
    }

    let begin_calls = backend.calls();
    // Fan-out: one event recorded on the primary, one wait per secondary.
    assert_eq!(
        begin_calls
            .iter()
            .filter(|call| matches!(
                call,
                DriverCall::RecordEvent { stream, .. } if *stream == primary_stream
            ))
            .count(),
        1
    );
    let fan_out_waits: Vec<usize> = begin_calls
        .iter()
        .filter_map(|call| match call {
            DriverCall::WaitEvent { stream, .. } => Some(*stream),
            _ => None,
        })
        .collect();
    assert_eq!(fan_out_waits.len(), SECONDARIES);
    for ctx in &registered {
        assert!(fan_out_waits.contains(&ctx.stream().id()));
    }

    // Every participant has the pool-scoped allocator attached.
    assert_eq!(
        begin_calls
            .iter()
            .filter(|call| matches!(call, DriverCall::CreatePoolAllocator { .. }))
            .count(),
        SECONDARIES + 1
    );
    assert!(primary.has_capture_allocator());
    for ctx in &registered {
        assert!(ctx.has_capture_allocator());
    }

    let seen_before_end = begin_calls.len();
    let graph = session.end()?;
    let end_calls = backend.calls().split_off(seen_before_end);

    // Fan-in mirror: one event per secondary, recorded on the secondary and
    // waited on by the primary, all before the recording is sealed.
    let records: Vec<usize> = end_calls
        .iter()
        .filter_map(|call| match call {
            DriverCall::RecordEvent { stream, .. } => Some(*stream),
            _ => None,
        })
        .collect();
    assert_eq!(records.len(), SECONDARIES);
    for ctx in &registered {
        assert!(records.contains(&ctx.stream().id()));
    }
    assert_eq!(
        end_calls
            .iter()
            .filter(|call| matches!(
                call,
                DriverCall::WaitEvent { stream, .. } if *stream == primary_stream
            ))
            .count(),
        SECONDARIES
    );
    let seal = end_calls
        .iter()
        .position(|call| matches!(call, DriverCall::EndCapture { .. }))
        .expect("capture sealed");
    let last_wait = end_calls
        .iter()
        .rposition(|call| matches!(call, DriverCall::WaitEvent { .. }))
        .expect("fan-in waits present");
    assert!(last_wait < seal);

    // Every attach is paired with a detach.
    assert!(!primary.has_capture_allocator());
    for ctx in &registered {
        assert!(!ctx.has_capture_allocator());
    }
    assert!(env.capturing_contexts().all_capturing().is_empty());
    assert_eq!(graph.pool_id(), pool_id);
    Ok(())
}

#[test]
fn multi_stream_pool_id_comes_from_the_hint_when_valid() -> anyhow::Result<()> {
    let (_backend, env, _registered) = env_with_capturing_contexts(2);
    env.flags().set_multi_stream_capture(true);
    let session = CaptureSession::new(env);
    let hint = MemoryPoolId::from_raw(7);

    session.begin(Place(0), CaptureMode::Relaxed, hint)?;
    assert_eq!(session.capturing_pool_id(), Some(hint));
    let graph = session.end()?;
    assert_eq!(graph.pool_id(), hint);
    Ok(())
}

#[test]
fn library_handles_are_materialized_on_every_participant_before_recording() -> anyhow::Result<()> {
    const SECONDARIES: usize = 2;
    let (backend, env, _registered) = env_with_capturing_contexts(SECONDARIES);
    env.flags().set_multi_stream_capture(true);
    let session = CaptureSession::new(env);

    session.begin(Place(0), CaptureMode::Relaxed, MemoryPoolId::INVALID)?;

    let calls = backend.calls();
    let begin_at = calls
        .iter()
        .position(|call| matches!(call, DriverCall::BeginCapture { .. }))
        .expect("recording started");
    let handles_created = calls
        .iter()
        .filter(|call| matches!(call, DriverCall::CreateLibraryHandle { .. }))
        .count();
    // Four handle kinds per participant, all created before the recording.
    assert_eq!(handles_created, 4 * (SECONDARIES + 1));
    assert!(calls[..begin_at]
        .iter()
        .filter(|call| matches!(call, DriverCall::CreateLibraryHandle { .. }))
        .count()
        == handles_created);

    session.end()?;
    Ok(())
}
