use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument::WithSubscriber;
use tracing::{Dispatch, Instrument, Span};

use crate::error::{Error, Result};

pub fn now_seconds() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Run a backend call, failing with `Error::Timeout` if it does not finish in time.
pub async fn bounded<T, E, F>(operation: &'static str, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    Error: From<E>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(Error::from),
        Err(_) => Err(Error::Timeout { operation, timeout }),
    }
}

/// Sort and dedup a membership listing so snapshots compare order-insensitively.
pub fn normalize_nodes(mut nodes: Vec<String>) -> Vec<String> {
    nodes.sort();
    nodes.dedup();
    nodes
}

/// Spawn a background loop inside `make_span`, reporting to `dispatch` when one
/// was injected and to the spawning task's subscriber otherwise.
pub fn spawn_instrumented<F>(
    dispatch: Option<&Dispatch>,
    make_span: impl FnOnce() -> Span,
    fut: F,
) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    match dispatch {
        Some(dispatch) => {
            let span = tracing::dispatcher::with_default(dispatch, make_span);
            tokio::spawn(fut.instrument(span).with_subscriber(dispatch.clone()))
        }
        None => tokio::spawn(fut.instrument(make_span()).with_current_subscriber()),
    }
}

/// A cancellable background loop and the handle to join it.
pub struct BackgroundTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl BackgroundTask {
    pub fn spawn<F, Fut>(dispatch: Option<&Dispatch>, make_span: impl FnOnce() -> Span, f: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let handle = spawn_instrumented(dispatch, make_span, f(cancel.clone()));
        Self { cancel, handle }
    }

    /// Token that fires when the loop is asked to stop.
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel the loop and wait until it has exited.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            if e.is_panic() {
                tracing::error!(error = %e, "background task panicked");
            }
        }
    }
}
