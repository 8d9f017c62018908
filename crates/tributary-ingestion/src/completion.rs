//! Completion Futures
//!
//! Lightweight one-shot completion signals used to chain asynchronous
//! stages: the version-topic produce gate (each produce waits on the
//! previous call having been queued) and the per-record persist future
//! (resolved once the producer acknowledged and the record reached the
//! drainer).
//!
//! A [`CompletionFuture`] is cloneable and can be awaited by any number of
//! observers; the matching [`CompletionHandle`] resolves it exactly once.
//! Dropping a handle without resolving it fails the future, so a lost
//! producer callback can never wedge the ordering chain silently.

use futures::future::{BoxFuture, FutureExt, Shared};
use thiserror::Error;
use tokio::sync::oneshot;

/// Error carried by a failed completion. Cloneable so every observer of a
/// shared future sees the same failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct CompletionError(pub String);

/// A shared future resolving when the associated stage finished.
pub type CompletionFuture = Shared<BoxFuture<'static, Result<(), CompletionError>>>;

/// Resolver side of a [`CompletionFuture`].
#[derive(Debug)]
pub struct CompletionHandle {
    tx: Option<oneshot::Sender<Result<(), CompletionError>>>,
}

impl CompletionHandle {
    /// Resolve the future successfully. No-op if already resolved.
    pub fn complete(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Ok(()));
        }
    }

    /// Resolve the future with a failure. No-op if already resolved.
    pub fn fail(mut self, error: CompletionError) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(error));
        }
    }
}

impl Drop for CompletionHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(CompletionError(
                "completion handle dropped without resolution".to_string(),
            )));
        }
    }
}

/// A fresh (handle, future) pair.
pub fn completion_pair() -> (CompletionHandle, CompletionFuture) {
    let (tx, rx) = oneshot::channel();
    let future = async move {
        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(CompletionError("completion sender dropped".to_string())),
        }
    }
    .boxed()
    .shared();
    (CompletionHandle { tx: Some(tx) }, future)
}

/// An already-resolved future, used as the initial state of ordering chains.
pub fn completed() -> CompletionFuture {
    futures::future::ready(Ok(())).boxed().shared()
}
