//! Reusable per-device execution contexts.
//!
//! A context owns one backend stream plus the lazily created compute-library
//! handles bound to it. Contexts live in the [`DeviceContextPool`] (one
//! default context per place) or the [`CapturingContextManager`] (contexts
//! pre-registered for capture by a scheduler); the capture subsystem never
//! creates or destroys them on its own, it only attaches a temporary
//! allocator and resets transient workspace state.

pub mod manager;
pub mod pool;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::backend::spec::{DeviceBackend, LibraryKind};
use crate::error::{CaptureError, CaptureResult};
use crate::place::Place;

pub use manager::CapturingContextManager;
pub use pool::DeviceContextPool;

/// One execution stream plus its lazily initialized compute-library handles.
pub struct DeviceContext<B: DeviceBackend> {
    place: Place,
    stream: B::Stream,
    libraries: Mutex<[Option<B::LibraryHandle>; 4]>,
    workspace_bytes: AtomicUsize,
    capture_allocator: Mutex<Option<B::Allocator>>,
}

impl<B: DeviceBackend> DeviceContext<B> {
    /// Creates a context on a fresh stream for `place`.
    pub fn new(backend: &B, place: Place) -> CaptureResult<Self> {
        let stream = backend.create_stream(place).map_err(|err| {
            CaptureError::resource_exhausted(format!("failed to create stream on {place}: {err}"))
        })?;
        Ok(DeviceContext {
            place,
            stream,
            libraries: Mutex::new([None, None, None, None]),
            workspace_bytes: AtomicUsize::new(0),
            capture_allocator: Mutex::new(None),
        })
    }

    pub fn place(&self) -> Place {
        self.place
    }

    pub fn stream(&self) -> &B::Stream {
        &self.stream
    }

    /// Returns the handle for `kind`, creating it on first use.
    pub fn library_handle(
        &self,
        backend: &B,
        kind: LibraryKind,
    ) -> CaptureResult<B::LibraryHandle> {
        let mut slots = self.libraries.lock().expect("library handles poisoned");
        if let Some(handle) = &slots[kind.index()] {
            return Ok(handle.clone());
        }
        let handle = backend
            .create_library_handle(kind, &self.stream)
            .map_err(|err| {
                CaptureError::resource_exhausted(format!(
                    "failed to create {} handle on {}: {err}",
                    kind.as_str(),
                    self.place
                ))
            })?;
        slots[kind.index()] = Some(handle.clone());
        Ok(handle)
    }

    /// Eagerly materializes every compute-library handle on this context.
    ///
    /// A handle first touched during capture would allocate and launch outside
    /// the capture boundary and corrupt the recording, so sessions call this
    /// on every participant before recording starts.
    pub fn materialize_library_handles(&self, backend: &B) -> CaptureResult<()> {
        for kind in LibraryKind::ALL {
            self.library_handle(backend, kind)?;
        }
        Ok(())
    }

    /// Grows the scratch-workspace reservation used by dnn calls.
    pub fn reserve_workspace(&self, bytes: usize) {
        self.workspace_bytes.fetch_max(bytes, Ordering::AcqRel);
    }

    pub fn workspace_bytes(&self) -> usize {
        self.workspace_bytes.load(Ordering::Acquire)
    }

    /// Drops the scratch-workspace reservation back to a clean state.
    pub fn reset_workspace(&self) {
        self.workspace_bytes.store(0, Ordering::Release);
    }

    /// Attaches (`Some`) or detaches (`None`) the capture-scoped allocator.
    pub fn set_capture_allocator(&self, allocator: Option<B::Allocator>) {
        *self
            .capture_allocator
            .lock()
            .expect("capture allocator poisoned") = allocator;
    }

    pub fn capture_allocator(&self) -> Option<B::Allocator> {
        self.capture_allocator
            .lock()
            .expect("capture allocator poisoned")
            .clone()
    }

    pub fn has_capture_allocator(&self) -> bool {
        self.capture_allocator
            .lock()
            .expect("capture allocator poisoned")
            .is_some()
    }
}
