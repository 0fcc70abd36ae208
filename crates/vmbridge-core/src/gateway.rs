//! Async Operation Gateway.
//!
//! Runs long engine calls on runtime workers and turns each into a
//! [`Pending`] result. The caller's thread never waits on the engine.

use crate::error::Result;
use crate::handle::Handle;
use crate::operation::{pending, OperationKind, Pending};
use std::future::Future;
use std::time::Instant;

/// Spawns operations on a tokio runtime.
#[derive(Debug, Clone)]
pub(crate) struct Gateway {
    runtime: tokio::runtime::Handle,
}

impl Gateway {
    pub(crate) fn new(runtime: tokio::runtime::Handle) -> Self {
        Self { runtime }
    }

    pub(crate) fn runtime(&self) -> &tokio::runtime::Handle {
        &self.runtime
    }

    /// Run `fut` off the caller's thread.
    ///
    /// The returned [`Pending`] resolves exactly once with the future's output.
    pub(crate) fn run<T, F>(
        &self,
        kind: OperationKind,
        handle: Option<Handle>,
        fut: F,
    ) -> Pending<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let (completion, pending) = pending(kind, handle);

        self.runtime.spawn(async move {
            let start = Instant::now();
            let result = fut.await;
            let elapsed_ms = start.elapsed().as_millis() as u64;

            match &result {
                Ok(_) => {
                    tracing::debug!(op = %kind, ?handle, elapsed_ms, "Operation succeeded")
                }
                Err(e) => {
                    tracing::debug!(
                        op = %kind,
                        ?handle,
                        elapsed_ms,
                        error = %e,
                        "Operation failed"
                    )
                }
            }
            completion.complete(result);
        });

        pending
    }

    /// Fire-and-forget background work with no caller waiting.
    pub(crate) fn detach<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.runtime.spawn(fut);
    }
}
