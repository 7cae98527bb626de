pub mod recording_backend;
pub mod session_invariants;

pub use recording_backend::{DriverCall, RecordedGraph, RecordingBackend};
