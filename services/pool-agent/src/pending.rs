//! Pending results of background creation tasks.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{watch, Semaphore};

use crate::error::PoolError;

/// Resolved value of a [`Pending`].
pub type Outcome<T> = Result<Arc<T>, Arc<PoolError>>;

/// Result of a creation task that runs in the background.
///
/// Clones observe the same task. Waiting never cancels the task, and
/// dropping every clone lets it run to completion.
pub struct Pending<T> {
    rx: watch::Receiver<Option<Outcome<T>>>,
}

impl<T> Clone for Pending<T> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Pending<T> {
    /// Runs `task` on the runtime and returns its pending result.
    ///
    /// The task may yield the value itself or an `Arc` it already shares.
    pub fn spawn<F, V>(task: F) -> Self
    where
        F: Future<Output = Result<V, PoolError>> + Send + 'static,
        V: Into<Arc<T>> + Send + 'static,
    {
        let (tx, rx) = watch::channel(None);
        tokio::spawn(async move {
            let outcome = task.await.map(Into::into).map_err(Arc::new);
            tx.send_replace(Some(outcome));
        });
        Self { rx }
    }

    /// Like [`Pending::spawn`], but holds a permit of `permits` while the
    /// task runs.
    pub fn spawn_limited<F, V>(permits: Arc<Semaphore>, task: F) -> Self
    where
        F: Future<Output = Result<V, PoolError>> + Send + 'static,
        V: Into<Arc<T>> + Send + 'static,
    {
        Self::spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|_| PoolError::ShutDown)?;
            task.await
        })
    }

    pub fn is_done(&self) -> bool {
        self.rx.borrow().is_some()
    }

    /// The result, if the task has finished.
    pub fn peek(&self) -> Option<Outcome<T>> {
        self.rx.borrow().clone()
    }

    /// Waits for the task to finish.
    pub async fn wait(&self) -> Outcome<T> {
        let mut rx = self.rx.clone();
        let resolved = rx.wait_for(Option::is_some).await.map(|v| v.clone());
        match resolved {
            Ok(Some(outcome)) => outcome,
            _ => Err(Arc::new(PoolError::TaskFailed(
                "creation task ended without a result".to_string(),
            ))),
        }
    }
}
