//! The three pipeline stages, usable on their own.
//!
//! - [`StateReconciler`] replaces each folder's mirror with the server's state
//! - [`DeltaFetcher`] works out which identifiers still need downloading
//! - [`RawMessagePersister`] downloads, seals and stores them
//!
//! Each stage borrows its stores and a [`MailRemote`](crate::MailRemote), so
//! it can be driven by the job orchestrator or directly by tests.

mod delta;
mod persist;
mod reconcile;

pub use delta::{Delta, DeltaFetcher};
pub use persist::{PersistReport, RawMessagePersister};
pub use reconcile::StateReconciler;

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation signal shared between a job and its stages.
///
/// Stages check it between folders, batches and messages; an in-flight
/// protocol call is allowed to finish.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Creates a token that is not cancelled.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Fails with [`Error::Cancelled`] once cancellation was requested.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if the token is cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(token.check().is_ok());

        clone.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(Error::Cancelled)));
    }
}
