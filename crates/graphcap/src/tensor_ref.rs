//! Non-owning tensor view for static pre-analysis passes, where a referenced
//! tensor may not carry data yet.

use crate::error::{CaptureError, CaptureResult};

/// Borrowed reference to a tensor that may be unset.
#[derive(Debug)]
pub struct TensorRef<'a, T> {
    inner: Option<&'a T>,
}

impl<'a, T> TensorRef<'a, T> {
    pub fn new(tensor: &'a T) -> Self {
        TensorRef {
            inner: Some(tensor),
        }
    }

    pub fn unset() -> Self {
        TensorRef { inner: None }
    }

    pub fn is_set(&self) -> bool {
        self.inner.is_some()
    }

    /// Returns the referenced tensor. Dereferencing an unset reference is a
    /// programmer error, not a recoverable runtime condition.
    pub fn get(&self) -> CaptureResult<&'a T> {
        self.inner
            .ok_or_else(|| CaptureError::null_access("tensor reference is unset"))
    }
}

impl<T> Default for TensorRef<'_, T> {
    fn default() -> Self {
        TensorRef { inner: None }
    }
}

impl<T> Clone for TensorRef<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for TensorRef<'_, T> {}
