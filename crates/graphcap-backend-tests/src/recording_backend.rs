//! Test-only backend that journals every driver-level call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use graphcap::backend::spec::{
    BackendError, BackendResult, CaptureMode, DeviceBackend, LibraryKind,
};
use graphcap::ir::{Block, Operation};
use graphcap::memory::MemoryPoolId;
use graphcap::place::Place;

/// One driver-level call observed by [`RecordingBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    CreateStream { place: Place, stream: usize },
    CreateEvent { place: Place, event: usize },
    RecordEvent { event: usize, stream: usize },
    WaitEvent { event: usize, stream: usize },
    CreateLibraryHandle { kind: LibraryKind, stream: usize },
    BeginCapture { stream: usize, mode: CaptureMode },
    EndCapture { stream: usize },
    ReplayGraph { stream: usize },
    CreatePoolAllocator { place: Place, stream: usize, pool: MemoryPoolId },
    ReleasePool { pool: MemoryPoolId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecStream {
    id: usize,
    place: Place,
}

impl RecStream {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn place(&self) -> Place {
        self.place
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecEvent {
    id: usize,
}

/// Finalized recording: the stream that drove it plus the operations captured
/// between begin and end, in submission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedGraph {
    pub stream: usize,
    pub body: Block,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecAllocator {
    pub pool: MemoryPoolId,
    pub stream: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecLibraryHandle {
    pub kind: LibraryKind,
}

/// In-memory backend for exercising the capture subsystem without hardware.
///
/// Every trait operation appends to a journal that tests inspect to assert
/// ordering and pairing properties (fence counts, attach/detach balance).
/// Work "submitted" while a stream is capturing can be simulated with
/// [`record_operation`](RecordingBackend::record_operation); it shows up in
/// the finalized graph's body.
#[derive(Default)]
pub struct RecordingBackend {
    calls: Mutex<Vec<DriverCall>>,
    capturing: Mutex<HashMap<usize, Block>>,
    next_stream: AtomicUsize,
    next_event: AtomicUsize,
    fail_library_handles: AtomicBool,
    fail_pool_allocators: AtomicBool,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the journal in call order.
    pub fn calls(&self) -> Vec<DriverCall> {
        self.calls.lock().expect("call journal poisoned").clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().expect("call journal poisoned").clear();
    }

    pub fn count(&self, predicate: impl Fn(&DriverCall) -> bool) -> usize {
        self.calls
            .lock()
            .expect("call journal poisoned")
            .iter()
            .filter(|call| predicate(call))
            .count()
    }

    /// Makes every subsequent `create_library_handle` fail until disabled.
    pub fn fail_library_handles(&self, fail: bool) {
        self.fail_library_handles.store(fail, Ordering::Release);
    }

    /// Makes every subsequent `create_pool_allocator` fail until disabled.
    pub fn fail_pool_allocators(&self, fail: bool) {
        self.fail_pool_allocators.store(fail, Ordering::Release);
    }

    /// Simulates work submitted to `stream` while it is capturing.
    pub fn record_operation(&self, stream: &RecStream, name: &str) -> BackendResult<()> {
        let mut capturing = self.capturing.lock().expect("capture table poisoned");
        let body = capturing.get_mut(&stream.id).ok_or_else(|| {
            BackendError::execution(format!("stream {} is not capturing", stream.id))
        })?;
        body.push_back(Operation::new(name, stream.id));
        Ok(())
    }

    fn log(&self, call: DriverCall) {
        self.calls.lock().expect("call journal poisoned").push(call);
    }
}

impl DeviceBackend for RecordingBackend {
    type Stream = RecStream;
    type Event = RecEvent;
    type Graph = RecordedGraph;
    type Allocator = RecAllocator;
    type LibraryHandle = RecLibraryHandle;

    fn backend_name(&self) -> &str {
        "recording"
    }

    fn create_stream(&self, place: Place) -> BackendResult<Self::Stream> {
        let id = self.next_stream.fetch_add(1, Ordering::Relaxed);
        self.log(DriverCall::CreateStream { place, stream: id });
        Ok(RecStream { id, place })
    }

    fn create_event(&self, place: Place) -> BackendResult<Self::Event> {
        let id = self.next_event.fetch_add(1, Ordering::Relaxed);
        self.log(DriverCall::CreateEvent { place, event: id });
        Ok(RecEvent { id })
    }

    fn record_event(&self, event: &Self::Event, stream: &Self::Stream) -> BackendResult<()> {
        self.log(DriverCall::RecordEvent {
            event: event.id,
            stream: stream.id,
        });
        Ok(())
    }

    fn wait_event(&self, event: &Self::Event, stream: &Self::Stream) -> BackendResult<()> {
        self.log(DriverCall::WaitEvent {
            event: event.id,
            stream: stream.id,
        });
        Ok(())
    }

    fn create_library_handle(
        &self,
        kind: LibraryKind,
        stream: &Self::Stream,
    ) -> BackendResult<Self::LibraryHandle> {
        if self.fail_library_handles.load(Ordering::Acquire) {
            return Err(BackendError::execution(format!(
                "injected failure creating {} handle",
                kind.as_str()
            )));
        }
        self.log(DriverCall::CreateLibraryHandle {
            kind,
            stream: stream.id,
        });
        Ok(RecLibraryHandle { kind })
    }

    fn begin_capture(&self, stream: &Self::Stream, mode: CaptureMode) -> BackendResult<()> {
        let mut capturing = self.capturing.lock().expect("capture table poisoned");
        if capturing.contains_key(&stream.id) {
            return Err(BackendError::execution(format!(
                "stream {} is already capturing",
                stream.id
            )));
        }
        capturing.insert(stream.id, Block::new());
        drop(capturing);
        self.log(DriverCall::BeginCapture {
            stream: stream.id,
            mode,
        });
        Ok(())
    }

    fn end_capture(&self, stream: &Self::Stream) -> BackendResult<Self::Graph> {
        let body = self
            .capturing
            .lock()
            .expect("capture table poisoned")
            .remove(&stream.id)
            .ok_or_else(|| {
                BackendError::execution(format!("stream {} is not capturing", stream.id))
            })?;
        self.log(DriverCall::EndCapture { stream: stream.id });
        Ok(RecordedGraph {
            stream: stream.id,
            body,
        })
    }

    fn replay_graph(&self, graph: &Self::Graph, stream: &Self::Stream) -> BackendResult<()> {
        let _ = graph;
        self.log(DriverCall::ReplayGraph { stream: stream.id });
        Ok(())
    }

    fn create_pool_allocator(
        &self,
        place: Place,
        stream: &Self::Stream,
        pool: MemoryPoolId,
    ) -> BackendResult<Self::Allocator> {
        if self.fail_pool_allocators.load(Ordering::Acquire) {
            return Err(BackendError::execution(format!(
                "injected failure creating allocator for {pool}"
            )));
        }
        self.log(DriverCall::CreatePoolAllocator {
            place,
            stream: stream.id,
            pool,
        });
        Ok(RecAllocator {
            pool,
            stream: stream.id,
        })
    }

    fn release_pool(&self, pool: MemoryPoolId) -> BackendResult<()> {
        self.log(DriverCall::ReleasePool { pool });
        Ok(())
    }
}
