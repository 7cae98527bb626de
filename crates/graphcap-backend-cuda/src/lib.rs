//! CUDA implementation of the graphcap backend contract.
//!
//! The driver API is bound at runtime via `libloading`, so this crate links
//! against nothing and degrades to [`CudaBackend::is_available`] returning
//! `false` on machines without a driver. Compute-library handles (blas,
//! blaslt, dnn, solver) load their owning shared library on first use.

mod driver;

use std::collections::HashMap;
use std::ffi::c_void;
use std::sync::{Arc, Mutex};

use graphcap::backend::spec::{
    BackendError, BackendResult, CaptureMode, DeviceBackend, LibraryKind,
};
use graphcap::memory::MemoryPoolId;
use graphcap::place::Place;
use libloading::Library;

pub use driver::{CudaDriver, CudaEvent, CudaGraph, CudaStream, DeviceBuffer};

type LibStatus = i32;
type CreateHandleFn = unsafe extern "C" fn(handle: *mut *mut c_void) -> LibStatus;
type DestroyHandleFn = unsafe extern "C" fn(handle: *mut c_void) -> LibStatus;
type SetStreamFn = unsafe extern "C" fn(handle: *mut c_void, stream: *mut c_void) -> LibStatus;

struct ComputeLibrary {
    _lib: Library,
    create: CreateHandleFn,
    destroy: DestroyHandleFn,
    set_stream: Option<SetStreamFn>,
}

struct LibrarySpec {
    kind: LibraryKind,
    candidates: &'static [&'static str],
    create: &'static [u8],
    destroy: &'static [u8],
    set_stream: Option<&'static [u8]>,
}

const LIBRARY_SPECS: [LibrarySpec; 4] = [
    LibrarySpec {
        kind: LibraryKind::Blas,
        candidates: &["libcublas.so.12", "libcublas.so.11", "libcublas.so"],
        create: b"cublasCreate_v2\0",
        destroy: b"cublasDestroy_v2\0",
        set_stream: Some(b"cublasSetStream_v2\0"),
    },
    LibrarySpec {
        kind: LibraryKind::BlasLt,
        candidates: &["libcublasLt.so.12", "libcublasLt.so.11", "libcublasLt.so"],
        create: b"cublasLtCreate\0",
        destroy: b"cublasLtDestroy\0",
        set_stream: None,
    },
    LibrarySpec {
        kind: LibraryKind::Dnn,
        candidates: &["libcudnn.so.9", "libcudnn.so.8", "libcudnn.so"],
        create: b"cudnnCreate\0",
        destroy: b"cudnnDestroy\0",
        set_stream: Some(b"cudnnSetStream\0"),
    },
    LibrarySpec {
        kind: LibraryKind::Solver,
        candidates: &["libcusolver.so.11", "libcusolver.so.10", "libcusolver.so"],
        create: b"cusolverDnCreate\0",
        destroy: b"cusolverDnDestroy\0",
        set_stream: Some(b"cusolverDnSetStream\0"),
    },
];

fn library_spec(kind: LibraryKind) -> &'static LibrarySpec {
    LIBRARY_SPECS
        .iter()
        .find(|spec| spec.kind == kind)
        .expect("every library kind has a spec")
}

fn load_compute_library(spec: &LibrarySpec) -> BackendResult<ComputeLibrary> {
    let mut lib = None;
    for candidate in spec.candidates {
        // SAFETY: Dynamic library probe only; no symbols are invoked here.
        if let Ok(loaded) = unsafe { Library::new(candidate) } {
            lib = Some(loaded);
            break;
        }
    }
    let lib = lib.ok_or_else(|| {
        BackendError::unavailable(format!(
            "failed to load {} library (tried {})",
            spec.kind.as_str(),
            spec.candidates.join(", ")
        ))
    })?;

    let create = get_symbol::<CreateHandleFn>(&lib, spec.create)?;
    let destroy = get_symbol::<DestroyHandleFn>(&lib, spec.destroy)?;
    let set_stream = match spec.set_stream {
        Some(name) => Some(get_symbol::<SetStreamFn>(&lib, name)?),
        None => None,
    };

    Ok(ComputeLibrary {
        _lib: lib,
        create,
        destroy,
        set_stream,
    })
}

fn get_symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> BackendResult<T> {
    // SAFETY: Symbol types match the published C signatures of these libraries.
    let sym = unsafe { lib.get::<T>(name) }.map_err(|err| {
        BackendError::unavailable(format!(
            "failed to resolve symbol {}: {err}",
            String::from_utf8_lossy(name)
        ))
    })?;
    Ok(*sym)
}

struct LibraryHandleInner {
    library: Arc<ComputeLibrary>,
    raw: usize,
    kind: LibraryKind,
}

impl Drop for LibraryHandleInner {
    fn drop(&mut self) {
        // SAFETY: Handle was created by this library and is destroyed once.
        let _ = unsafe { (self.library.destroy)(self.raw as *mut c_void) };
    }
}

/// Shared compute-library handle bound to one stream.
#[derive(Clone)]
pub struct CudaLibraryHandle {
    inner: Arc<LibraryHandleInner>,
}

impl CudaLibraryHandle {
    pub fn kind(&self) -> LibraryKind {
        self.inner.kind
    }

    pub fn raw(&self) -> usize {
        self.inner.raw
    }
}

/// Capture-pool allocator ordered on one stream.
#[derive(Clone)]
pub struct CudaPoolAllocator {
    driver: Arc<CudaDriver>,
    stream: CudaStream,
    pool: MemoryPoolId,
}

impl CudaPoolAllocator {
    pub fn pool(&self) -> MemoryPoolId {
        self.pool
    }

    /// Allocates `bytes` in this allocator's pool arena.
    pub fn alloc(&self, bytes: usize) -> BackendResult<DeviceBuffer> {
        self.driver
            .alloc(self.stream.device(), self.pool.raw(), bytes)
    }
}

/// CUDA backend for capture orchestration.
pub struct CudaBackend {
    driver: Arc<CudaDriver>,
    libraries: Mutex<HashMap<LibraryKind, Arc<ComputeLibrary>>>,
}

impl CudaBackend {
    pub fn new() -> BackendResult<Self> {
        Ok(Self {
            driver: driver::driver()?,
            libraries: Mutex::new(HashMap::new()),
        })
    }

    pub fn is_available() -> bool {
        driver::is_available()
    }

    pub fn driver(&self) -> &Arc<CudaDriver> {
        &self.driver
    }

    fn compute_library(&self, kind: LibraryKind) -> BackendResult<Arc<ComputeLibrary>> {
        let mut libraries = self.libraries.lock().expect("compute libraries poisoned");
        if let Some(library) = libraries.get(&kind) {
            return Ok(Arc::clone(library));
        }
        let library = Arc::new(load_compute_library(library_spec(kind))?);
        libraries.insert(kind, Arc::clone(&library));
        Ok(library)
    }
}

impl DeviceBackend for CudaBackend {
    type Stream = CudaStream;
    type Event = CudaEvent;
    type Graph = CudaGraph;
    type Allocator = CudaPoolAllocator;
    type LibraryHandle = CudaLibraryHandle;

    fn backend_name(&self) -> &str {
        "cuda"
    }

    fn create_stream(&self, place: Place) -> BackendResult<Self::Stream> {
        self.driver.create_stream(place.index() as i32)
    }

    fn create_event(&self, place: Place) -> BackendResult<Self::Event> {
        self.driver.create_event(place.index() as i32)
    }

    fn record_event(&self, event: &Self::Event, stream: &Self::Stream) -> BackendResult<()> {
        self.driver.record_event(event, stream)
    }

    fn wait_event(&self, event: &Self::Event, stream: &Self::Stream) -> BackendResult<()> {
        self.driver.wait_event(event, stream)
    }

    fn create_library_handle(
        &self,
        kind: LibraryKind,
        stream: &Self::Stream,
    ) -> BackendResult<Self::LibraryHandle> {
        let library = self.compute_library(kind)?;
        self.driver.ensure_current(stream.device())?;

        let mut raw: *mut c_void = std::ptr::null_mut();
        // SAFETY: Out pointer is a valid local; the create symbol matches its C signature.
        let status = unsafe { (library.create)(&mut raw) };
        if status != 0 {
            return Err(BackendError::execution(format!(
                "{} handle creation failed with status {status}",
                kind.as_str()
            )));
        }

        let handle = CudaLibraryHandle {
            inner: Arc::new(LibraryHandleInner {
                library: Arc::clone(&library),
                raw: raw as usize,
                kind,
            }),
        };

        if let Some(set_stream) = library.set_stream {
            // SAFETY: Handle and stream are live; the set-stream symbol matches its C signature.
            let status = unsafe { set_stream(raw, stream.raw_handle()) };
            if status != 0 {
                return Err(BackendError::execution(format!(
                    "binding {} handle to stream failed with status {status}",
                    kind.as_str()
                )));
            }
        }

        Ok(handle)
    }

    fn begin_capture(&self, stream: &Self::Stream, mode: CaptureMode) -> BackendResult<()> {
        self.driver.begin_capture(stream, mode)
    }

    fn end_capture(&self, stream: &Self::Stream) -> BackendResult<Self::Graph> {
        self.driver.end_capture(stream)
    }

    fn replay_graph(&self, graph: &Self::Graph, stream: &Self::Stream) -> BackendResult<()> {
        self.driver.replay_graph(graph, stream)
    }

    fn create_pool_allocator(
        &self,
        place: Place,
        stream: &Self::Stream,
        pool: MemoryPoolId,
    ) -> BackendResult<Self::Allocator> {
        if stream.device() != place.index() as i32 {
            return Err(BackendError::execution(format!(
                "allocator stream belongs to device {} but {place} was requested",
                stream.device()
            )));
        }
        Ok(CudaPoolAllocator {
            driver: Arc::clone(&self.driver),
            stream: stream.clone(),
            pool,
        })
    }

    fn release_pool(&self, pool: MemoryPoolId) -> BackendResult<()> {
        self.driver.release_pool(pool.raw());
        Ok(())
    }
}