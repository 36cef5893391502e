//! The Worker Bridge: a generic CPU-offload primitive. spec.md describes
//! this as a structured-clone message port to a background worker; §9
//! explicitly permits "a pure-main-thread fallback using a
//! background-priority scheduler... semantically equivalent provided the
//! 30s timeout remains." This is that fallback: `spawn_blocking` wrapped in
//! a 30s timeout, with a UUID correlation id attached for tracing —
//! grounded in the teacher's own `spawn_blocking` usage in
//! `features/save/provider.rs`.

use std::time::Duration;

use tokio::task::JoinError;
use uuid::Uuid;

use crate::error::EngineError;

pub const WORKER_TASK_TIMEOUT: Duration = Duration::from_secs(30);

/// Dispatches `task` onto the blocking thread pool and waits up to
/// `WORKER_TASK_TIMEOUT`. On timeout the callback result is discarded (the
/// blocking thread keeps running to completion in the background, matching
/// a rejected-and-removed correlation entry rather than a cancelled task).
pub async fn dispatch<F, T>(task: F) -> Result<T, EngineError>
where
    F: FnOnce() -> Result<T, EngineError> + Send + 'static,
    T: Send + 'static,
{
    let correlation_id = Uuid::new_v4();
    tracing::debug!(correlation_id = %correlation_id, "dispatching worker task");

    let handle = tokio::task::spawn_blocking(task);
    match tokio::time::timeout(WORKER_TASK_TIMEOUT, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_err)) => Err(join_panic_error(correlation_id, join_err)),
        Err(_elapsed) => {
            tracing::warn!(correlation_id = %correlation_id, "worker task timed out after 30s");
            Err(EngineError::Transient(format!(
                "worker task {correlation_id} timed out"
            )))
        }
    }
}

fn join_panic_error(correlation_id: Uuid, err: JoinError) -> EngineError {
    tracing::error!(correlation_id = %correlation_id, error = %err, "worker task panicked");
    EngineError::Internal(format!("worker task {correlation_id} panicked: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dispatch_returns_task_result() {
        let result = dispatch(|| Ok(2 + 2)).await.unwrap();
        assert_eq!(result, 4);
    }

    #[tokio::test]
    async fn dispatch_propagates_task_error() {
        let result: Result<(), EngineError> =
            dispatch(|| Err(EngineError::Validation("bad input".into()))).await;
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_times_out_after_30s() {
        let handle = tokio::spawn(async {
            dispatch(|| {
                std::thread::sleep(Duration::from_secs(60));
                Ok(())
            })
            .await
        });
        tokio::time::advance(Duration::from_secs(31)).await;
        let result: Result<(), EngineError> = handle.await.unwrap();
        assert!(matches!(result, Err(EngineError::Transient(_))));
    }
}
