//! Capture-scoped memory pools.
//!
//! While a capture is open, every participating stream allocates from an
//! isolated arena named by a [`MemoryPoolId`]. The arena outlives the capture
//! session: replays of the finalized graph reference memory inside it, so it
//! is only released when the graph's reset callbacks run at teardown.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::backend::spec::DeviceBackend;
use crate::error::{CaptureError, CaptureResult};
use crate::place::Place;

/// Identifier for an isolated allocation arena scoped to one capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemoryPoolId(i64);

impl MemoryPoolId {
    /// Sentinel meaning "unset, allocate a fresh unique id".
    pub const INVALID: MemoryPoolId = MemoryPoolId(-1);

    pub fn from_raw(raw: i64) -> Self {
        MemoryPoolId(raw)
    }

    pub fn raw(self) -> i64 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self.0 > Self::INVALID.0
    }
}

impl fmt::Display for MemoryPoolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "pool:{}", self.0)
        } else {
            write!(f, "pool:unset")
        }
    }
}

/// Facade over the backend's allocator that carves out capture-scoped arenas.
///
/// One pool at a time serves capture allocations; [`remove_pool`] is
/// idempotent because the reset callback releasing a pool can be invoked more
/// than once without disturbing unrelated pools.
///
/// [`remove_pool`]: AllocatorFacade::remove_pool
pub struct AllocatorFacade<B: DeviceBackend> {
    backend: Arc<B>,
    live: Mutex<HashSet<MemoryPoolId>>,
    active: Mutex<Option<MemoryPoolId>>,
}

impl<B: DeviceBackend> AllocatorFacade<B> {
    pub fn new(backend: Arc<B>) -> Self {
        AllocatorFacade {
            backend,
            live: Mutex::new(HashSet::new()),
            active: Mutex::new(None),
        }
    }

    /// Opens (or refreshes) the arena for `pool` and makes it the pool that
    /// serves capture allocations.
    pub fn prepare_pool(&self, pool: MemoryPoolId) -> CaptureResult<()> {
        if !pool.is_valid() {
            return Err(CaptureError::precondition(
                "cannot prepare an arena for the unset pool id",
            ));
        }
        self.live
            .lock()
            .expect("allocator facade poisoned")
            .insert(pool);
        *self.active.lock().expect("allocator facade poisoned") = Some(pool);
        Ok(())
    }

    /// Returns the allocator for `place` ordered on `stream`, drawing from the
    /// active capture pool.
    pub fn allocator(&self, place: Place, stream: &B::Stream) -> CaptureResult<B::Allocator> {
        let active = *self.active.lock().expect("allocator facade poisoned");
        let pool = active.ok_or_else(|| {
            CaptureError::precondition("no capture memory pool has been prepared")
        })?;
        Ok(self.backend.create_pool_allocator(place, stream, pool)?)
    }

    /// Releases the arena for `pool`. A second call for the same id is a
    /// no-op; other pools, live or future, are unaffected.
    pub fn remove_pool(&self, pool: MemoryPoolId) -> CaptureResult<()> {
        let removed = self
            .live
            .lock()
            .expect("allocator facade poisoned")
            .remove(&pool);
        if !removed {
            return Ok(());
        }

        let mut active = self.active.lock().expect("allocator facade poisoned");
        if *active == Some(pool) {
            *active = None;
        }
        drop(active);

        Ok(self.backend.release_pool(pool)?)
    }

    pub fn is_pool_live(&self, pool: MemoryPoolId) -> bool {
        self.live
            .lock()
            .expect("allocator facade poisoned")
            .contains(&pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_pool_id_compares_below_every_valid_id() {
        assert!(!MemoryPoolId::INVALID.is_valid());
        assert!(MemoryPoolId::from_raw(0).is_valid());
        assert!(MemoryPoolId::INVALID < MemoryPoolId::from_raw(0));
    }

    #[test]
    fn display_marks_the_unset_id() {
        assert_eq!(MemoryPoolId::INVALID.to_string(), "pool:unset");
        assert_eq!(MemoryPoolId::from_raw(3).to_string(), "pool:3");
    }
}
