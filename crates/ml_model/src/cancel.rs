use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::ForecastError;

/// Shared stop flag for a training run.
///
/// Forecasters poll it between boosting rounds and epochs, so a caller that
/// gave up on a run can stop the thread instead of leaving it to finish.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fails with [`ForecastError::Cancelled`] once [`cancel`](Self::cancel) was called.
    pub fn check(&self) -> Result<(), ForecastError> {
        if self.is_cancelled() {
            return Err(ForecastError::Cancelled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_the_flag() {
        let token = CancelToken::new();
        let worker = token.clone();
        assert!(worker.check().is_ok());

        token.cancel();
        assert!(worker.is_cancelled());
        assert!(matches!(worker.check(), Err(ForecastError::Cancelled)));
    }
}
