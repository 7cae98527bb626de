use std::sync::Arc;

use graphcap_backend_cuda::CudaBackend;
use graphcap_backend_tests::session_invariants;

#[test]
fn capture_round_trip_on_hardware() {
    if !CudaBackend::is_available() {
        eprintln!("skipping: CUDA driver not available");
        return;
    }

    let backend = Arc::new(CudaBackend::new().expect("driver probed available"));
    session_invariants::begin_end_round_trip(Arc::clone(&backend));
    session_invariants::nested_begin_fails(Arc::clone(&backend));
    session_invariants::pool_ids_are_unique(backend);
}
