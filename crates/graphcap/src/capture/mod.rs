//! Graph-capture session lifecycle.
//!
//! A [`CaptureSession`] records everything submitted to its participant
//! streams between [`begin`](CaptureSession::begin) and
//! [`end`](CaptureSession::end) into a replayable [`CapturedGraph`]. The
//! session owns the ordering obligations that make a multi-stream recording
//! sound: every secondary stream is fenced behind the primary at begin
//! (fan-out) and joined back before the graph is sealed at end (fan-in), so
//! no participant can run outside the captured region. Allocations made
//! while the session is open land in a capture-scoped memory pool that stays
//! alive until the graph itself is torn down.

pub mod callbacks;
pub mod coordinator;

use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use crate::backend::spec::{CaptureMode, DeviceBackend};
use crate::context::{CapturingContextManager, DeviceContext, DeviceContextPool};
use crate::error::{CaptureError, CaptureResult};
use crate::flags::ExecutionFlags;
use crate::memory::{AllocatorFacade, MemoryPoolId};
use crate::place::Place;

pub use callbacks::{ResetCallback, ResetCallbackRegistry};
pub use coordinator::select_capture_context;

/// Shared collaborators for capture sessions.
///
/// Everything that used to be process-global (the context pool, the
/// capturing-context records, the allocator facade, the mode flags, the pool
/// id counter) hangs off one environment object instead, so independent
/// environments never contaminate each other.
pub struct CaptureEnv<B: DeviceBackend> {
    backend: Arc<B>,
    device_contexts: DeviceContextPool<B>,
    capturing_contexts: CapturingContextManager<B>,
    allocators: AllocatorFacade<B>,
    flags: ExecutionFlags,
    next_pool_id: AtomicI64,
}

impl<B: DeviceBackend> CaptureEnv<B> {
    pub fn new(backend: Arc<B>) -> Arc<Self> {
        Arc::new(CaptureEnv {
            device_contexts: DeviceContextPool::new(Arc::clone(&backend)),
            capturing_contexts: CapturingContextManager::new(Arc::clone(&backend)),
            allocators: AllocatorFacade::new(Arc::clone(&backend)),
            backend,
            flags: ExecutionFlags::new(),
            next_pool_id: AtomicI64::new(0),
        })
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn device_contexts(&self) -> &DeviceContextPool<B> {
        &self.device_contexts
    }

    pub fn capturing_contexts(&self) -> &CapturingContextManager<B> {
        &self.capturing_contexts
    }

    pub fn allocators(&self) -> &AllocatorFacade<B> {
        &self.allocators
    }

    pub fn flags(&self) -> &ExecutionFlags {
        &self.flags
    }

    /// Returns a pool id this environment has never handed out before.
    pub fn unique_pool_id(&self) -> MemoryPoolId {
        MemoryPoolId::from_raw(self.next_pool_id.fetch_add(1, AtomicOrdering::Relaxed))
    }
}

struct ActiveCapture<B: DeviceBackend> {
    place: Place,
    mode: CaptureMode,
    pool_id: MemoryPoolId,
    primary: Arc<DeviceContext<B>>,
    secondaries: Vec<Arc<DeviceContext<B>>>,
}

/// State machine driving one graph capture at a time.
///
/// The session is `Idle` until `begin` succeeds and returns to `Idle` when
/// `end` seals the recording. A second `begin` while capturing fails fast;
/// there is no way to abandon an open capture other than driving it through
/// `end`.
pub struct CaptureSession<B: DeviceBackend> {
    env: Arc<CaptureEnv<B>>,
    active: Mutex<Option<ActiveCapture<B>>>,
    callbacks: ResetCallbackRegistry,
}

impl<B: DeviceBackend> CaptureSession<B> {
    pub fn new(env: Arc<CaptureEnv<B>>) -> Self {
        CaptureSession {
            env,
            active: Mutex::new(None),
            callbacks: ResetCallbackRegistry::new(),
        }
    }

    pub fn env(&self) -> &Arc<CaptureEnv<B>> {
        &self.env
    }

    pub fn is_capturing(&self) -> bool {
        self.active.lock().expect("capture session poisoned").is_some()
    }

    pub fn capturing_place(&self) -> Option<Place> {
        self.active
            .lock()
            .expect("capture session poisoned")
            .as_ref()
            .map(|open| open.place)
    }

    pub fn capturing_pool_id(&self) -> Option<MemoryPoolId> {
        self.active
            .lock()
            .expect("capture session poisoned")
            .as_ref()
            .map(|open| open.pool_id)
    }

    pub fn capturing_mode(&self) -> Option<CaptureMode> {
        self.active
            .lock()
            .expect("capture session poisoned")
            .as_ref()
            .map(|open| open.mode)
    }

    /// Registers `callback` to run when the graph produced by this session
    /// (the open capture, or the next one if none is open) is torn down.
    pub fn add_reset_callback(&self, callback: impl FnOnce() + Send + 'static) {
        self.callbacks.add(callback);
    }

    /// Opens a capture on `place`.
    ///
    /// Resolves the participants, eagerly materializes library handles on all
    /// of them, starts the hardware recording on the primary stream, scopes a
    /// memory pool to the session and attaches its allocator to every
    /// participant, and fences every secondary stream behind the primary.
    /// On failure nothing is left attached and the session stays idle.
    pub fn begin(
        &self,
        place: Place,
        mode: CaptureMode,
        pool_hint: MemoryPoolId,
    ) -> CaptureResult<()> {
        let mut active = self.active.lock().expect("capture session poisoned");
        if let Some(open) = active.as_ref() {
            return Err(CaptureError::precondition(format!(
                "a capture is already open on {}; end it before beginning another",
                open.place
            )));
        }

        let env = self.env.as_ref();
        let (primary, resolved) = coordinator::select_capture_context(env, place, pool_hint)?;

        let capturing = env.capturing_contexts().all_capturing();
        let secondaries = if capturing.len() > 1 {
            capturing
        } else {
            Vec::new()
        };

        let backend = env.backend().as_ref();
        primary.reset_workspace();
        primary.materialize_library_handles(backend)?;
        for ctx in &secondaries {
            ctx.reset_workspace();
            ctx.materialize_library_handles(backend)?;
        }

        backend.begin_capture(primary.stream(), mode)?;

        // The session-identifying pool id is established here and nowhere
        // else; `end` treats it as authoritative.
        let pool_id = if resolved.is_valid() {
            resolved
        } else {
            env.unique_pool_id()
        };

        if let Err(err) = Self::scope_allocators(env, place, pool_id, &primary, &secondaries) {
            Self::unwind_begin(env, pool_id, &primary, &secondaries);
            return Err(err);
        }

        let reset_env = Arc::clone(&self.env);
        self.callbacks.add(move || {
            if let Err(err) = reset_env.allocators().remove_pool(pool_id) {
                tracing::warn!(pool = %pool_id, "failed to release capture memory pool: {err}");
            }
        });

        *active = Some(ActiveCapture {
            place,
            mode,
            pool_id,
            primary,
            secondaries,
        });
        Ok(())
    }

    /// Scopes the session's memory pool and attaches its allocator to every
    /// participant, fencing secondaries behind the primary stream.
    fn scope_allocators(
        env: &CaptureEnv<B>,
        place: Place,
        pool_id: MemoryPoolId,
        primary: &Arc<DeviceContext<B>>,
        secondaries: &[Arc<DeviceContext<B>>],
    ) -> CaptureResult<()> {
        // The stream-safe allocator policy deadlocks against arena setup
        // unless the multi-stream execution mode is driving the capture;
        // lower it for the primary attachment only and restore immediately.
        let flags = env.flags();
        let suppress = flags.stream_safe_allocator() && !flags.multi_stream_capture();
        {
            let _policy = suppress.then(|| flags.suppress_stream_safe_allocator());
            env.allocators().prepare_pool(pool_id)?;
            let allocator = env.allocators().allocator(place, primary.stream())?;
            primary.set_capture_allocator(Some(allocator));
        }

        if !secondaries.is_empty() {
            // Fan-out: one event recorded after primary setup, waited on by
            // every secondary, so all secondary work is captured as a
            // dependent of the primary recording.
            let backend = env.backend().as_ref();
            let fence = backend.create_event(place)?;
            backend.record_event(&fence, primary.stream())?;
            for ctx in secondaries {
                let allocator = env.allocators().allocator(place, ctx.stream())?;
                ctx.set_capture_allocator(Some(allocator));
                backend.wait_event(&fence, ctx.stream())?;
                tracing::debug!(place = %ctx.place(), "secondary stream fenced behind capture start");
            }
        }
        Ok(())
    }

    /// Rolls a failed `begin` back: nothing stays attached, the recording is
    /// abandoned, and the pool arena is released.
    fn unwind_begin(
        env: &CaptureEnv<B>,
        pool_id: MemoryPoolId,
        primary: &Arc<DeviceContext<B>>,
        secondaries: &[Arc<DeviceContext<B>>],
    ) {
        for ctx in secondaries {
            ctx.set_capture_allocator(None);
        }
        primary.set_capture_allocator(None);
        let _ = env.backend().end_capture(primary.stream());
        let _ = env.allocators().remove_pool(pool_id);
    }

    /// Seals the recording and returns the captured graph.
    ///
    /// Every secondary stream is joined back to the primary before the graph
    /// is finalized, each attach from `begin` is paired with a detach, and
    /// the per-session context records are cleared. The returned graph owns
    /// the session's reset callbacks; dropping it releases the memory pool.
    pub fn end(&self) -> CaptureResult<CapturedGraph<B>> {
        let mut active = self.active.lock().expect("capture session poisoned");
        let open = active
            .take()
            .ok_or_else(|| CaptureError::precondition("no capture is open"))?;

        let env = self.env.as_ref();
        // Re-resolution with the pool id recorded at begin must agree on the
        // driving context; the id itself stays authoritative.
        let (primary, _) = coordinator::select_capture_context(env, open.place, open.pool_id)?;
        if !Arc::ptr_eq(&primary, &open.primary) {
            return Err(CaptureError::precondition(
                "capture participants changed between begin and end",
            ));
        }

        let backend = env.backend().as_ref();
        if !open.secondaries.is_empty() {
            // Fan-in: the primary recording must include every secondary
            // stream's final work before the graph is sealed.
            for ctx in &open.secondaries {
                let fence = backend.create_event(ctx.place())?;
                backend.record_event(&fence, ctx.stream())?;
                backend.wait_event(&fence, primary.stream())?;
                ctx.reset_workspace();
                ctx.set_capture_allocator(None);
                tracing::debug!(place = %ctx.place(), "secondary stream joined into capture");
            }
        }

        env.capturing_contexts().clear_records();
        primary.reset_workspace();
        primary.set_capture_allocator(None);

        let graph = backend.end_capture(primary.stream())?;
        tracing::debug!(place = %open.place, pool = %open.pool_id, "capture sealed");

        Ok(CapturedGraph {
            backend: Arc::clone(env.backend()),
            graph: Some(graph),
            place: open.place,
            pool_id: open.pool_id,
            reset_callbacks: self.callbacks.drain(),
        })
    }
}

/// Opaque replayable recording returned by [`CaptureSession::end`].
///
/// The graph owns the reset callbacks registered during its capture. They run
/// exactly once, at explicit [`reset`](CapturedGraph::reset) or at drop; the
/// capture memory pool stays valid until then, because replays reference
/// memory inside it.
pub struct CapturedGraph<B: DeviceBackend> {
    backend: Arc<B>,
    graph: Option<B::Graph>,
    place: Place,
    pool_id: MemoryPoolId,
    reset_callbacks: Vec<ResetCallback>,
}

impl<B: DeviceBackend> std::fmt::Debug for CapturedGraph<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapturedGraph")
            .field("place", &self.place)
            .field("pool_id", &self.pool_id)
            .finish_non_exhaustive()
    }
}

impl<B: DeviceBackend> CapturedGraph<B> {
    pub fn place(&self) -> Place {
        self.place
    }

    pub fn pool_id(&self) -> MemoryPoolId {
        self.pool_id
    }

    /// Borrows the backend recording. Fails after `reset`.
    pub fn raw(&self) -> CaptureResult<&B::Graph> {
        self.graph
            .as_ref()
            .ok_or_else(|| CaptureError::null_access("captured graph was already reset"))
    }

    /// Submits one replay of the recording to `stream`.
    pub fn replay(&self, stream: &B::Stream) -> CaptureResult<()> {
        let graph = self.raw()?;
        Ok(self.backend.replay_graph(graph, stream)?)
    }

    /// Releases the recording and runs its teardown callbacks in
    /// registration order.
    pub fn reset(&mut self) {
        self.graph = None;
        for callback in self.reset_callbacks.drain(..) {
            callback();
        }
    }
}

impl<B: DeviceBackend> Drop for CapturedGraph<B> {
    fn drop(&mut self) {
        self.reset();
    }
}
