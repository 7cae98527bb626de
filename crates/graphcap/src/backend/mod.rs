pub mod spec;

pub use spec::{BackendError, BackendResult, CaptureMode, DeviceBackend, LibraryKind};
