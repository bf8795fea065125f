use tokio::runtime::Handle;
use tracing::warn;

use crate::error::{StoreError, StoreResult};
use crate::storage::BoxFuture;

/// Runs the store's background work: continuations of deferred adapter
/// calls and debounced invalidation flushes.
pub trait Scheduler: Send + Sync {
    /// Start `task`. On error the task has been dropped without running.
    fn spawn(&self, task: BoxFuture<()>) -> StoreResult<()>;
}

/// Spawns onto a tokio runtime.
///
/// Uses the runtime captured at construction, or the ambient one at spawn
/// time.
#[derive(Clone, Debug)]
pub struct TokioScheduler {
    handle: Option<Handle>,
}

impl TokioScheduler {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle: Some(handle),
        }
    }
}

impl Default for TokioScheduler {
    fn default() -> Self {
        Self {
            handle: Handle::try_current().ok(),
        }
    }
}

impl Scheduler for TokioScheduler {
    fn spawn(&self, task: BoxFuture<()>) -> StoreResult<()> {
        let handle = match &self.handle {
            Some(handle) => handle.clone(),
            None => match Handle::try_current() {
                Ok(handle) => handle,
                Err(_) => {
                    warn!("no tokio runtime available, dropping store task");
                    return Err(StoreError::NoRuntime);
                }
            },
        };
        handle.spawn(task);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn spawns_on_the_ambient_runtime() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let (tx, rx) = tokio::sync::oneshot::channel();

        TokioScheduler::default()
            .spawn(Box::pin(async move {
                flag.store(true, Ordering::SeqCst);
                let _ = tx.send(());
            }))
            .unwrap();

        rx.await.unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn drops_tasks_without_a_runtime() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let scheduler = TokioScheduler { handle: None };

        let err = scheduler
            .spawn(Box::pin(async move { flag.store(true, Ordering::SeqCst) }))
            .unwrap_err();
        assert_eq!(err, StoreError::NoRuntime);
        assert!(!ran.load(Ordering::SeqCst));
    }
}
