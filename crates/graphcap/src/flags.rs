//! Execution-mode switches consulted by the capture subsystem.

use std::sync::atomic::{AtomicBool, Ordering};

/// Mode flags owned by a capture environment.
///
/// These were process-wide globals in older designs; carrying them on the
/// environment keeps independent environments isolated, which is what makes
/// sessions testable side by side.
#[derive(Debug, Default)]
pub struct ExecutionFlags {
    multi_stream_capture: AtomicBool,
    stream_safe_allocator: AtomicBool,
}

impl ExecutionFlags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the execution engine records capturing contexts, permitting
    /// captures that span more than one stream.
    pub fn multi_stream_capture(&self) -> bool {
        self.multi_stream_capture.load(Ordering::Acquire)
    }

    pub fn set_multi_stream_capture(&self, value: bool) {
        self.multi_stream_capture.store(value, Ordering::Release);
    }

    /// Whether the allocator tracks per-stream safety of frees.
    pub fn stream_safe_allocator(&self) -> bool {
        self.stream_safe_allocator.load(Ordering::Acquire)
    }

    pub fn set_stream_safe_allocator(&self, value: bool) {
        self.stream_safe_allocator.store(value, Ordering::Release);
    }

    /// Forces the stream-safe allocator policy off until the returned guard
    /// drops. The prior value is restored on every exit path.
    pub fn suppress_stream_safe_allocator(&self) -> FlagGuard<'_> {
        FlagGuard::set(&self.stream_safe_allocator, false)
    }
}

/// Drop guard that flips a boolean flag and restores the prior value.
pub struct FlagGuard<'a> {
    flag: &'a AtomicBool,
    prior: bool,
}

impl<'a> FlagGuard<'a> {
    /// Sets `flag` to `value`; the previous value comes back when the guard
    /// is dropped, including on unwind.
    pub fn set(flag: &'a AtomicBool, value: bool) -> Self {
        let prior = flag.swap(value, Ordering::AcqRel);
        FlagGuard { flag, prior }
    }

    pub fn prior(&self) -> bool {
        self.prior
    }
}

impl Drop for FlagGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(self.prior, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_restores_prior_value() {
        let flags = ExecutionFlags::new();
        flags.set_stream_safe_allocator(true);

        {
            let guard = flags.suppress_stream_safe_allocator();
            assert!(guard.prior());
            assert!(!flags.stream_safe_allocator());
        }

        assert!(flags.stream_safe_allocator());
    }

    #[test]
    fn guard_restores_on_early_exit() {
        fn failing(flags: &ExecutionFlags) -> Result<(), ()> {
            let _guard = flags.suppress_stream_safe_allocator();
            Err(())
        }

        let flags = ExecutionFlags::new();
        flags.set_stream_safe_allocator(true);
        assert!(failing(&flags).is_err());
        assert!(flags.stream_safe_allocator());
    }

    #[test]
    fn guard_over_an_unset_flag_is_a_no_op_on_drop() {
        let flag = AtomicBool::new(false);
        {
            let _guard = FlagGuard::set(&flag, true);
            assert!(flag.load(Ordering::Acquire));
        }
        assert!(!flag.load(Ordering::Acquire));
    }
}
