use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};

use graphcap::backend::spec::{BackendError, BackendResult, CaptureMode};
use libloading::Library;

type CUresult = i32;
type CUdevice = i32;
type CUcontext = *mut c_void;
type CUstream = *mut c_void;
type CUevent = *mut c_void;
type CUgraph = *mut c_void;
type CUgraphExec = *mut c_void;
type CUdeviceptr = u64;

const CUDA_SUCCESS: CUresult = 0;
const CU_STREAM_NON_BLOCKING: u32 = 0x1;
const CU_EVENT_DISABLE_TIMING: u32 = 0x2;
const CU_STREAM_CAPTURE_MODE_GLOBAL: u32 = 0;
const CU_STREAM_CAPTURE_MODE_RELAXED: u32 = 2;

type CuInitFn = unsafe extern "C" fn(flags: u32) -> CUresult;
type CuDeviceGetFn = unsafe extern "C" fn(device: *mut CUdevice, ordinal: i32) -> CUresult;
type CuDevicePrimaryCtxRetainFn =
    unsafe extern "C" fn(ctx: *mut CUcontext, dev: CUdevice) -> CUresult;
type CuDevicePrimaryCtxReleaseFn = unsafe extern "C" fn(dev: CUdevice) -> CUresult;
type CuCtxSetCurrentFn = unsafe extern "C" fn(ctx: CUcontext) -> CUresult;
type CuStreamCreateFn = unsafe extern "C" fn(stream: *mut CUstream, flags: u32) -> CUresult;
type CuStreamDestroyFn = unsafe extern "C" fn(stream: CUstream) -> CUresult;
type CuEventCreateFn = unsafe extern "C" fn(event: *mut CUevent, flags: u32) -> CUresult;
type CuEventDestroyFn = unsafe extern "C" fn(event: CUevent) -> CUresult;
type CuEventRecordFn = unsafe extern "C" fn(event: CUevent, stream: CUstream) -> CUresult;
type CuStreamWaitEventFn =
    unsafe extern "C" fn(stream: CUstream, event: CUevent, flags: u32) -> CUresult;
type CuStreamBeginCaptureFn = unsafe extern "C" fn(stream: CUstream, mode: u32) -> CUresult;
type CuStreamEndCaptureFn =
    unsafe extern "C" fn(stream: CUstream, graph: *mut CUgraph) -> CUresult;
type CuGraphDestroyFn = unsafe extern "C" fn(graph: CUgraph) -> CUresult;
type CuGraphInstantiateFn =
    unsafe extern "C" fn(exec: *mut CUgraphExec, graph: CUgraph, flags: u64) -> CUresult;
type CuGraphLaunchFn = unsafe extern "C" fn(exec: CUgraphExec, stream: CUstream) -> CUresult;
type CuGraphExecDestroyFn = unsafe extern "C" fn(exec: CUgraphExec) -> CUresult;
type CuMemAllocFn = unsafe extern "C" fn(dptr: *mut CUdeviceptr, bytesize: usize) -> CUresult;
type CuMemFreeFn = unsafe extern "C" fn(dptr: CUdeviceptr) -> CUresult;

struct DriverFns {
    cu_init: CuInitFn,
    cu_device_get: CuDeviceGetFn,
    cu_device_primary_ctx_retain: CuDevicePrimaryCtxRetainFn,
    cu_device_primary_ctx_release: CuDevicePrimaryCtxReleaseFn,
    cu_ctx_set_current: CuCtxSetCurrentFn,
    cu_stream_create: CuStreamCreateFn,
    cu_stream_destroy: CuStreamDestroyFn,
    cu_event_create: CuEventCreateFn,
    cu_event_destroy: CuEventDestroyFn,
    cu_event_record: CuEventRecordFn,
    cu_stream_wait_event: CuStreamWaitEventFn,
    cu_stream_begin_capture: CuStreamBeginCaptureFn,
    cu_stream_end_capture: CuStreamEndCaptureFn,
    cu_graph_destroy: CuGraphDestroyFn,
    cu_graph_instantiate: CuGraphInstantiateFn,
    cu_graph_launch: CuGraphLaunchFn,
    cu_graph_exec_destroy: CuGraphExecDestroyFn,
    cu_mem_alloc: CuMemAllocFn,
    cu_mem_free: CuMemFreeFn,
}

/// Process-wide binding of the CUDA driver API.
///
/// Raw handles are stored as `usize` so driver-owned types satisfy the
/// `Send`/`Sync` requirements of the backend traits.
pub struct CudaDriver {
    _lib: Library,
    fns: DriverFns,
    // Device ordinal -> retained primary context.
    contexts: Mutex<HashMap<i32, usize>>,
    // Pool id -> outstanding arena bytes.
    pools: Mutex<HashMap<i64, usize>>,
}

impl Drop for CudaDriver {
    fn drop(&mut self) {
        let contexts = self.contexts.lock().expect("driver contexts poisoned");
        for device in contexts.keys() {
            // SAFETY: Each context was retained once per device by this driver.
            let _ = unsafe { (self.fns.cu_device_primary_ctx_release)(*device) };
        }
    }
}

static CUDA_DRIVER: OnceLock<Result<Arc<CudaDriver>, String>> = OnceLock::new();

pub fn is_available() -> bool {
    driver().is_ok()
}

pub fn driver() -> BackendResult<Arc<CudaDriver>> {
    let init = CUDA_DRIVER.get_or_init(|| match CudaDriver::new() {
        Ok(driver) => Ok(Arc::new(driver)),
        Err(err) => Err(err.to_string()),
    });
    match init {
        Ok(driver) => Ok(Arc::clone(driver)),
        Err(msg) => Err(BackendError::unavailable(format!(
            "CUDA driver unavailable: {msg}"
        ))),
    }
}

impl CudaDriver {
    fn new() -> BackendResult<Self> {
        let lib = load_cuda_library()?;
        let fns = DriverFns {
            cu_init: load_symbol(&lib, b"cuInit\0")?,
            cu_device_get: load_symbol(&lib, b"cuDeviceGet\0")?,
            cu_device_primary_ctx_retain: load_symbol(&lib, b"cuDevicePrimaryCtxRetain\0")?,
            cu_device_primary_ctx_release: load_symbol(&lib, b"cuDevicePrimaryCtxRelease_v2\0")?,
            cu_ctx_set_current: load_symbol(&lib, b"cuCtxSetCurrent\0")?,
            cu_stream_create: load_symbol(&lib, b"cuStreamCreate\0")?,
            cu_stream_destroy: load_symbol(&lib, b"cuStreamDestroy_v2\0")?,
            cu_event_create: load_symbol(&lib, b"cuEventCreate\0")?,
            cu_event_destroy: load_symbol(&lib, b"cuEventDestroy_v2\0")?,
            cu_event_record: load_symbol(&lib, b"cuEventRecord\0")?,
            cu_stream_wait_event: load_symbol(&lib, b"cuStreamWaitEvent\0")?,
            cu_stream_begin_capture: load_symbol(&lib, b"cuStreamBeginCapture_v2\0")?,
            cu_stream_end_capture: load_symbol(&lib, b"cuStreamEndCapture\0")?,
            cu_graph_destroy: load_symbol(&lib, b"cuGraphDestroy\0")?,
            cu_graph_instantiate: load_symbol(&lib, b"cuGraphInstantiateWithFlags\0")?,
            cu_graph_launch: load_symbol(&lib, b"cuGraphLaunch\0")?,
            cu_graph_exec_destroy: load_symbol(&lib, b"cuGraphExecDestroy\0")?,
            cu_mem_alloc: load_symbol(&lib, b"cuMemAlloc_v2\0")?,
            cu_mem_free: load_symbol(&lib, b"cuMemFree_v2\0")?,
        };

        // SAFETY: cuInit takes no pointers and is required before any other call.
        unsafe {
            check_cuda((fns.cu_init)(0), "cuInit")?;
        }

        Ok(Self {
            _lib: lib,
            fns,
            contexts: Mutex::new(HashMap::new()),
            pools: Mutex::new(HashMap::new()),
        })
    }

    /// Makes `device`'s primary context current on this thread, retaining it
    /// on first use.
    pub fn ensure_current(&self, device: i32) -> BackendResult<()> {
        let mut contexts = self.contexts.lock().expect("driver contexts poisoned");
        let ctx = match contexts.get(&device) {
            Some(ctx) => *ctx,
            None => {
                let mut dev: CUdevice = 0;
                let mut ctx: CUcontext = std::ptr::null_mut();
                // SAFETY: Out pointers are valid locals; ordinal comes from the caller's Place.
                unsafe {
                    check_cuda((self.fns.cu_device_get)(&mut dev, device), "cuDeviceGet")?;
                    check_cuda(
                        (self.fns.cu_device_primary_ctx_retain)(&mut ctx, dev),
                        "cuDevicePrimaryCtxRetain",
                    )?;
                }
                contexts.insert(device, ctx as usize);
                ctx as usize
            }
        };
        // SAFETY: Context was retained above and stays valid until driver drop.
        unsafe { check_cuda((self.fns.cu_ctx_set_current)(ctx as CUcontext), "cuCtxSetCurrent") }
    }

    pub fn create_stream(self: &Arc<Self>, device: i32) -> BackendResult<CudaStream> {
        self.ensure_current(device)?;
        let mut raw: CUstream = std::ptr::null_mut();
        // SAFETY: Out pointer is a valid local.
        unsafe {
            check_cuda(
                (self.fns.cu_stream_create)(&mut raw, CU_STREAM_NON_BLOCKING),
                "cuStreamCreate",
            )?;
        }
        Ok(CudaStream {
            inner: Arc::new(StreamInner {
                driver: Arc::clone(self),
                raw: raw as usize,
                device,
            }),
        })
    }

    pub fn create_event(self: &Arc<Self>, device: i32) -> BackendResult<CudaEvent> {
        self.ensure_current(device)?;
        let mut raw: CUevent = std::ptr::null_mut();
        // SAFETY: Out pointer is a valid local.
        unsafe {
            check_cuda(
                (self.fns.cu_event_create)(&mut raw, CU_EVENT_DISABLE_TIMING),
                "cuEventCreate",
            )?;
        }
        Ok(CudaEvent {
            driver: Arc::clone(self),
            raw: raw as usize,
            device,
        })
    }

    pub fn record_event(&self, event: &CudaEvent, stream: &CudaStream) -> BackendResult<()> {
        self.ensure_current(stream.device())?;
        // SAFETY: Both handles are live driver objects owned by this process.
        unsafe {
            check_cuda(
                (self.fns.cu_event_record)(event.raw(), stream.raw()),
                "cuEventRecord",
            )
        }
    }

    pub fn wait_event(&self, event: &CudaEvent, stream: &CudaStream) -> BackendResult<()> {
        self.ensure_current(stream.device())?;
        // SAFETY: Both handles are live driver objects; flags must be 0.
        unsafe {
            check_cuda(
                (self.fns.cu_stream_wait_event)(stream.raw(), event.raw(), 0),
                "cuStreamWaitEvent",
            )
        }
    }

    pub fn begin_capture(&self, stream: &CudaStream, mode: CaptureMode) -> BackendResult<()> {
        self.ensure_current(stream.device())?;
        let mode = match mode {
            CaptureMode::Relaxed => CU_STREAM_CAPTURE_MODE_RELAXED,
            CaptureMode::Strict => CU_STREAM_CAPTURE_MODE_GLOBAL,
        };
        // SAFETY: Stream is a live driver object.
        unsafe {
            check_cuda(
                (self.fns.cu_stream_begin_capture)(stream.raw(), mode),
                "cuStreamBeginCapture_v2",
            )
        }
    }

    pub fn end_capture(self: &Arc<Self>, stream: &CudaStream) -> BackendResult<CudaGraph> {
        self.ensure_current(stream.device())?;
        let mut raw: CUgraph = std::ptr::null_mut();
        // SAFETY: Stream is a live driver object and the out pointer is a valid local.
        unsafe {
            check_cuda(
                (self.fns.cu_stream_end_capture)(stream.raw(), &mut raw),
                "cuStreamEndCapture",
            )?;
        }
        Ok(CudaGraph {
            driver: Arc::clone(self),
            device: stream.device(),
            graph: raw as usize,
            exec: Mutex::new(None),
        })
    }

    /// Launches one replay of `graph` on `stream`, instantiating the
    /// executable form on first use.
    pub fn replay_graph(&self, graph: &CudaGraph, stream: &CudaStream) -> BackendResult<()> {
        self.ensure_current(stream.device())?;
        let mut exec = graph.exec.lock().expect("graph exec poisoned");
        let exec_raw = match *exec {
            Some(raw) => raw,
            None => {
                let mut raw: CUgraphExec = std::ptr::null_mut();
                // SAFETY: Graph handle is live; out pointer is a valid local.
                unsafe {
                    check_cuda(
                        (self.fns.cu_graph_instantiate)(&mut raw, graph.graph as CUgraph, 0),
                        "cuGraphInstantiateWithFlags",
                    )?;
                }
                *exec = Some(raw as usize);
                raw as usize
            }
        };
        // SAFETY: Executable graph and stream are live driver objects.
        unsafe {
            check_cuda(
                (self.fns.cu_graph_launch)(exec_raw as CUgraphExec, stream.raw()),
                "cuGraphLaunch",
            )
        }
    }

    /// Allocates `bytes` on `device`, accounted against `pool`.
    pub fn alloc(
        self: &Arc<Self>,
        device: i32,
        pool: i64,
        bytes: usize,
    ) -> BackendResult<DeviceBuffer> {
        self.ensure_current(device)?;
        let mut ptr: CUdeviceptr = 0;
        // SAFETY: Out pointer is a valid local.
        unsafe {
            check_cuda((self.fns.cu_mem_alloc)(&mut ptr, bytes), "cuMemAlloc_v2")?;
        }
        *self
            .pools
            .lock()
            .expect("driver pools poisoned")
            .entry(pool)
            .or_insert(0) += bytes;
        Ok(DeviceBuffer {
            driver: Arc::clone(self),
            ptr,
            bytes,
            pool,
        })
    }

    /// Outstanding arena bytes accounted against `pool`.
    pub fn pool_bytes(&self, pool: i64) -> usize {
        self.pools
            .lock()
            .expect("driver pools poisoned")
            .get(&pool)
            .copied()
            .unwrap_or(0)
    }

    pub fn release_pool(&self, pool: i64) {
        self.pools.lock().expect("driver pools poisoned").remove(&pool);
    }

    fn note_free(&self, pool: i64, bytes: usize) {
        let mut pools = self.pools.lock().expect("driver pools poisoned");
        if let Some(outstanding) = pools.get_mut(&pool) {
            *outstanding = outstanding.saturating_sub(bytes);
        }
    }
}

struct StreamInner {
    driver: Arc<CudaDriver>,
    raw: usize,
    device: i32,
}

impl Drop for StreamInner {
    fn drop(&mut self) {
        if self.driver.ensure_current(self.device).is_ok() {
            // SAFETY: Stream was created by this driver and is destroyed once.
            let _ = unsafe { (self.driver.fns.cu_stream_destroy)(self.raw as CUstream) };
        }
    }
}

/// Shared handle to one execution stream.
#[derive(Clone)]
pub struct CudaStream {
    inner: Arc<StreamInner>,
}

impl CudaStream {
    pub fn device(&self) -> i32 {
        self.inner.device
    }

    fn raw(&self) -> CUstream {
        self.inner.raw as CUstream
    }

    pub(crate) fn raw_handle(&self) -> *mut c_void {
        self.inner.raw as *mut c_void
    }
}

impl fmt::Debug for CudaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CudaStream")
            .field("raw", &self.inner.raw)
            .field("device", &self.inner.device)
            .finish()
    }
}

pub struct CudaEvent {
    driver: Arc<CudaDriver>,
    raw: usize,
    device: i32,
}

impl CudaEvent {
    fn raw(&self) -> CUevent {
        self.raw as CUevent
    }
}

impl Drop for CudaEvent {
    fn drop(&mut self) {
        if self.driver.ensure_current(self.device).is_ok() {
            // SAFETY: Event was created by this driver and is destroyed once.
            let _ = unsafe { (self.driver.fns.cu_event_destroy)(self.raw as CUevent) };
        }
    }
}

/// Finalized capture recording plus its lazily instantiated executable form.
pub struct CudaGraph {
    driver: Arc<CudaDriver>,
    device: i32,
    graph: usize,
    exec: Mutex<Option<usize>>,
}

impl Drop for CudaGraph {
    fn drop(&mut self) {
        if self.driver.ensure_current(self.device).is_err() {
            return;
        }
        let exec = self.exec.lock().expect("graph exec poisoned").take();
        if let Some(raw) = exec {
            // SAFETY: Executable graph belongs to this driver and is destroyed once.
            let _ = unsafe { (self.driver.fns.cu_graph_exec_destroy)(raw as CUgraphExec) };
        }
        // SAFETY: Graph belongs to this driver and is destroyed once.
        let _ = unsafe { (self.driver.fns.cu_graph_destroy)(self.graph as CUgraph) };
    }
}

/// Raw device allocation accounted against a capture pool.
pub struct DeviceBuffer {
    driver: Arc<CudaDriver>,
    ptr: CUdeviceptr,
    bytes: usize,
    pool: i64,
}

impl DeviceBuffer {
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn device_ptr(&self) -> u64 {
        self.ptr
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        // SAFETY: Device pointer was allocated by this driver and is released once.
        let _ = unsafe { (self.driver.fns.cu_mem_free)(self.ptr) };
        self.driver.note_free(self.pool, self.bytes);
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("ptr", &self.ptr)
            .field("bytes", &self.bytes)
            .field("pool", &self.pool)
            .finish()
    }
}

fn load_cuda_library() -> BackendResult<Library> {
    let candidates = ["libcuda.so.1", "libcuda.so", "nvcuda.dll", "libcuda.dylib"];

    for candidate in candidates {
        // SAFETY: Dynamic library probe only; no symbols are invoked at this stage.
        if let Ok(lib) = unsafe { Library::new(candidate) } {
            return Ok(lib);
        }
    }

    Err(BackendError::unavailable(
        "failed to load CUDA driver library (tried libcuda.so.1, libcuda.so, nvcuda.dll, libcuda.dylib)",
    ))
}

fn load_symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> BackendResult<T> {
    // SAFETY: Caller provides the expected symbol type from the CUDA driver API.
    let sym = unsafe { lib.get::<T>(name) }.map_err(|err| {
        BackendError::unavailable(format!(
            "failed to resolve CUDA symbol {}: {err}",
            String::from_utf8_lossy(name)
        ))
    })?;
    Ok(*sym)
}

fn check_cuda(code: CUresult, op: &str) -> BackendResult<()> {
    if code == CUDA_SUCCESS {
        Ok(())
    } else {
        Err(BackendError::execution(format!(
            "CUDA driver call {op} failed with code {code}"
        )))
    }
}
