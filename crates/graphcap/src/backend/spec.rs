//! Backend contract for graph-capture orchestration.
//!
//! The core crate never talks to a device driver directly; everything it
//! needs from the hardware layer is expressed through [`DeviceBackend`].
//! Backend crates implement the trait for one driver each, and the build
//! configuration decides which implementations are linked in.

use std::fmt;

use crate::memory::MemoryPoolId;
use crate::place::Place;

/// How the hardware recorder treats operations that are not capture-safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureMode {
    /// Non-capture-safe operations elsewhere in the process are tolerated.
    Relaxed,
    /// Any non-capture-safe operation aborts the recording.
    Strict,
}

/// Compute-library handle families a device context materializes.
///
/// Handles are created lazily during ordinary execution. Capture recording
/// cannot tolerate a first touch inside the capture window (handle creation
/// allocates and launches outside the recorded stream), so sessions force all
/// of them eagerly before recording starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LibraryKind {
    Blas,
    BlasLt,
    Dnn,
    Solver,
}

impl LibraryKind {
    pub const ALL: [LibraryKind; 4] = [
        LibraryKind::Blas,
        LibraryKind::BlasLt,
        LibraryKind::Dnn,
        LibraryKind::Solver,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LibraryKind::Blas => "blas",
            LibraryKind::BlasLt => "blaslt",
            LibraryKind::Dnn => "dnn",
            LibraryKind::Solver => "solver",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            LibraryKind::Blas => 0,
            LibraryKind::BlasLt => 1,
            LibraryKind::Dnn => 2,
            LibraryKind::Solver => 3,
        }
    }
}

#[derive(Debug, Clone)]
pub enum BackendError {
    Unavailable { message: String },
    Execution { message: String },
}

impl BackendError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        BackendError::Unavailable {
            message: message.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Unavailable { message } => {
                write!(f, "backend unavailable: {message}")
            }
            BackendError::Execution { message } => {
                write!(f, "backend execution failure: {message}")
            }
        }
    }
}

impl std::error::Error for BackendError {}

pub type BackendResult<T> = Result<T, BackendError>;

/// Driver-level operations the capture subsystem is built on.
///
/// Streams order work, events fence streams against each other, and the
/// capture pair turns everything submitted to a stream between `begin` and
/// `end` into a replayable graph. Allocators handed out by
/// [`create_pool_allocator`](DeviceBackend::create_pool_allocator) draw from
/// an arena identified by pool id, isolated from every other allocation in
/// the process until [`release_pool`](DeviceBackend::release_pool).
pub trait DeviceBackend: Send + Sync + 'static {
    type Stream: Clone + Send + Sync + 'static;
    type Event: Send + Sync + 'static;
    type Graph: Send + 'static;
    type Allocator: Clone + Send + Sync + 'static;
    type LibraryHandle: Clone + Send + Sync + 'static;

    /// Returns a human-readable backend identifier (e.g., `"cuda"`).
    fn backend_name(&self) -> &str;

    fn create_stream(&self, place: Place) -> BackendResult<Self::Stream>;

    fn create_event(&self, place: Place) -> BackendResult<Self::Event>;

    /// Marks `event` as reached once all work currently queued on `stream`
    /// has executed.
    fn record_event(&self, event: &Self::Event, stream: &Self::Stream) -> BackendResult<()>;

    /// Queues a device-side wait: work submitted to `stream` after this call
    /// does not run until `event` is reached. Never blocks the host.
    fn wait_event(&self, event: &Self::Event, stream: &Self::Stream) -> BackendResult<()>;

    /// Creates a compute-library handle of `kind` bound to `stream`.
    fn create_library_handle(
        &self,
        kind: LibraryKind,
        stream: &Self::Stream,
    ) -> BackendResult<Self::LibraryHandle>;

    /// Starts recording everything submitted to `stream`.
    fn begin_capture(&self, stream: &Self::Stream, mode: CaptureMode) -> BackendResult<()>;

    /// Seals the recording started on `stream` and returns the graph.
    fn end_capture(&self, stream: &Self::Stream) -> BackendResult<Self::Graph>;

    /// Submits one replay of `graph` to `stream`.
    fn replay_graph(&self, graph: &Self::Graph, stream: &Self::Stream) -> BackendResult<()>;

    /// Returns an allocator whose allocations land in the arena identified by
    /// `pool` and are ordered on `stream`.
    fn create_pool_allocator(
        &self,
        place: Place,
        stream: &Self::Stream,
        pool: MemoryPoolId,
    ) -> BackendResult<Self::Allocator>;

    /// Releases the device-side arena for `pool`.
    fn release_pool(&self, pool: MemoryPoolId) -> BackendResult<()>;
}
