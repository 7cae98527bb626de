use std::sync::Arc;

use anyhow::Result;
use graphcap::context::DeviceContext;
use graphcap::{CaptureEnv, CaptureMode, CaptureSession, MemoryPoolId, Place};
use graphcap_backend_tests::{DriverCall, RecordingBackend};

fn main() -> Result<()> {
    let backend = Arc::new(RecordingBackend::new());
    let env = CaptureEnv::new(Arc::clone(&backend));
    let session = CaptureSession::new(Arc::clone(&env));
    let place = Place(0);

    // Single-stream capture on the default context for place 0.
    session.begin(place, CaptureMode::Relaxed, MemoryPoolId::INVALID)?;
    let ctx = env.device_contexts().get(place)?;
    backend.record_operation(ctx.stream(), "embed")?;
    backend.record_operation(ctx.stream(), "matmul")?;
    backend.record_operation(ctx.stream(), "softmax")?;
    let graph = session.end()?;

    println!(
        "captured {} operations into {} on stream {}",
        graph.raw()?.body.len(),
        graph.pool_id(),
        graph.raw()?.stream
    );
    for op in &graph.raw()?.body {
        println!("  replayable op: {}", op.name());
    }

    graph.replay(ctx.stream())?;
    graph.replay(ctx.stream())?;
    let replays = backend.count(|call| matches!(call, DriverCall::ReplayGraph { .. }));
    println!("replayed the recording {replays} times");
    drop(graph);

    // Multi-stream capture: two pre-registered contexts fenced behind a
    // dedicated primary stream.
    env.flags().set_multi_stream_capture(true);
    for _ in 0..2 {
        let secondary = Arc::new(DeviceContext::new(backend.as_ref(), place)?);
        env.capturing_contexts().record_capturing(secondary);
    }
    backend.clear_calls();

    session.begin(place, CaptureMode::Relaxed, MemoryPoolId::INVALID)?;
    let graph = session.end()?;
    let fences = backend.count(|call| matches!(call, DriverCall::WaitEvent { .. }));
    println!(
        "multi-stream capture in {} needed {} stream fences",
        graph.pool_id(),
        fences
    );

    Ok(())
}
