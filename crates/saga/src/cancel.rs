use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::SagaError;

const OPEN: u8 = 0;
const REQUESTED: u8 = 1;
const SEALED: u8 = 2;

/// External cancellation switch for one saga run.
///
/// Cancellation is accepted until the orchestrator seals the handle, which it
/// does before starting an irreversible step and when the saga finishes.
#[derive(Debug, Clone, Default)]
pub struct SagaCancelHandle {
    state: Arc<AtomicU8>,
}

impl SagaCancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Repeated requests are accepted.
    pub fn cancel(&self) -> Result<(), SagaError> {
        match self
            .state
            .compare_exchange(OPEN, REQUESTED, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) | Err(REQUESTED) => Ok(()),
            Err(_) => Err(SagaError::NotCancellable),
        }
    }

    pub fn is_requested(&self) -> bool {
        self.state.load(Ordering::SeqCst) == REQUESTED
    }

    /// Refuse further cancellation. Returns false if a cancellation got in first.
    pub(crate) fn seal(&self) -> bool {
        match self
            .state
            .compare_exchange(OPEN, SEALED, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => true,
            Err(current) => current == SEALED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_is_accepted_until_sealed() {
        let handle = SagaCancelHandle::new();
        assert!(handle.cancel().is_ok());
        assert!(handle.cancel().is_ok());
        assert!(handle.is_requested());
        assert!(!handle.seal());
    }

    #[test]
    fn sealed_handle_refuses_cancel() {
        let handle = SagaCancelHandle::new();
        assert!(handle.seal());
        assert!(handle.seal());
        assert!(matches!(handle.cancel(), Err(SagaError::NotCancellable)));
        assert!(!handle.is_requested());
    }
}
