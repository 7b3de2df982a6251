//! Cancellation context threaded through every suspending operation.
//!
//! A [`Cx`] is the capability a caller passes into an acquire operation so the
//! primitive can observe cooperative cancellation. Cancellation is requested
//! out of band with [`Cx::set_cancel_requested`] and observed at checkpoints;
//! a pending acquire future re-checks its context on every poll.
//!
//! Checkpoints can be temporarily suppressed with [`Cx::masked`], which is
//! useful for cleanup sections that must run to completion even when the
//! surrounding operation is being cancelled.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::error::Error;

/// Capability context for cancellation-aware operations.
///
/// Cheap to clone; all clones observe the same cancellation state.
#[derive(Debug, Clone)]
pub struct Cx {
    inner: Arc<RwLock<CxInner>>,
}

#[derive(Debug)]
struct CxInner {
    /// Set when cancellation has been requested.
    cancel_requested: bool,
    /// Depth of nested `masked` sections; checkpoints pass while nonzero.
    mask_depth: u32,
}

impl Cx {
    /// Creates a fresh context with no cancellation requested.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(CxInner {
                cancel_requested: false,
                mask_depth: 0,
            })),
        }
    }

    /// Creates a context for tests.
    #[must_use]
    pub fn for_testing() -> Self {
        Self::new()
    }

    /// Returns true if cancellation has been requested.
    #[must_use]
    pub fn is_cancel_requested(&self) -> bool {
        self.inner.read().cancel_requested
    }

    /// Requests or withdraws cancellation.
    pub fn set_cancel_requested(&self, requested: bool) {
        self.inner.write().cancel_requested = requested;
    }

    /// Cancellation checkpoint.
    ///
    /// Returns `Err` once cancellation has been requested, unless the caller
    /// is inside a [`masked`](Self::masked) section.
    pub fn checkpoint(&self) -> Result<(), Error> {
        let inner = self.inner.read();
        if inner.cancel_requested && inner.mask_depth == 0 {
            return Err(Error::cancelled());
        }
        Ok(())
    }

    /// Runs `f` with cancellation checkpoints masked.
    ///
    /// Nested calls stack; checkpoints observe cancellation again once every
    /// mask has been popped.
    pub fn masked<R>(&self, f: impl FnOnce(&Self) -> R) -> R {
        {
            let mut inner = self.inner.write();
            inner.mask_depth += 1;
        }
        let result = f(self);
        {
            let mut inner = self.inner.write();
            inner.mask_depth -= 1;
        }
        result
    }

    /// Emits a breadcrumb trace event for this context.
    pub fn trace(&self, message: &str) {
        tracing::trace!(target: "synckit::cx", message);
    }
}

impl Default for Cx {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_passes_when_not_cancelled() {
        let cx = Cx::for_testing();
        assert!(cx.checkpoint().is_ok());
        assert!(!cx.is_cancel_requested());
    }

    #[test]
    fn checkpoint_fails_after_cancel() {
        let cx = Cx::for_testing();
        cx.set_cancel_requested(true);
        let err = cx.checkpoint().expect_err("checkpoint should fail");
        assert!(err.is_cancelled());
    }

    #[test]
    fn masked_suppresses_checkpoint() {
        let cx = Cx::for_testing();
        cx.set_cancel_requested(true);
        cx.masked(|cx| {
            assert!(cx.checkpoint().is_ok());
            cx.masked(|cx| assert!(cx.checkpoint().is_ok()));
            assert!(cx.checkpoint().is_ok());
        });
        assert!(cx.checkpoint().is_err());
    }

    #[test]
    fn clones_share_state() {
        let cx = Cx::for_testing();
        let clone = cx.clone();
        clone.set_cancel_requested(true);
        assert!(cx.is_cancel_requested());
        cx.set_cancel_requested(false);
        assert!(clone.checkpoint().is_ok());
    }
}
