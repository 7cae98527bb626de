//! Participant selection for a capture session.

use std::sync::Arc;

use crate::backend::spec::DeviceBackend;
use crate::context::DeviceContext;
use crate::error::{CaptureError, CaptureResult};
use crate::memory::MemoryPoolId;
use crate::place::Place;

use super::CaptureEnv;

/// Resolves the context that will drive the recording for `place`, together
/// with the pool id the session should adopt.
///
/// Selection depends only on the capturing set registered at call time:
///
/// - nothing registered: the default context for `place` records on its own
///   stream (single-stream legacy path);
/// - exactly one registered: that context's stream is reused for the
///   recording;
/// - more than one registered: the recording needs a dedicated stream, so the
///   context for `(pool, place, stream 0)` drives it and every registered
///   context is fenced in as a secondary. This path requires the
///   multi-stream capture flag.
///
/// Selection never mutates session state; resolving a fresh pool id draws
/// from the environment's counter but records nothing.
pub fn select_capture_context<B: DeviceBackend>(
    env: &CaptureEnv<B>,
    place: Place,
    pool_hint: MemoryPoolId,
) -> CaptureResult<(Arc<DeviceContext<B>>, MemoryPoolId)> {
    let capturing = env.capturing_contexts().all_capturing();
    match capturing.len() {
        0 => {
            tracing::debug!(%place, "capturing on the default stream");
            Ok((env.device_contexts().get(place)?, pool_hint))
        }
        1 => {
            tracing::debug!(%place, "capturing on the pre-registered stream");
            let ctx = capturing.into_iter().next().expect("one capturing context");
            Ok((ctx, pool_hint))
        }
        registered => {
            if !env.flags().multi_stream_capture() {
                return Err(CaptureError::precondition(format!(
                    "{registered} streams are registered for capture on {place} \
                     but multi-stream capture is disabled"
                )));
            }
            let pool_id = if pool_hint.is_valid() {
                pool_hint
            } else {
                env.unique_pool_id()
            };
            tracing::debug!(
                %place,
                pool = %pool_id,
                registered,
                "capturing on a dedicated stream with fenced secondaries"
            );
            let ctx = env.capturing_contexts().get(pool_id, place, 0)?;
            Ok((ctx, pool_id))
        }
    }
}
