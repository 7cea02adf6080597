//! Task spawning for the engine's background loops

use tokio::task::JoinHandle;

/// Spawn an async task on the current tokio runtime
///
/// With the `profiling` feature the task runs inside a profiling scope tagged
/// with `name`, so the engine's loops are easy to tell apart in traces.
pub fn spawn<F>(name: &'static str, future: F) -> JoinHandle<F::Output>
where
    F: std::future::Future + Send + 'static,
    F::Output: Send + 'static,
{
    #[cfg(feature = "profiling")]
    {
        tokio::spawn(async move {
            profiling::scope!("async_runtime::spawn", name);
            future.await
        })
    }
    #[cfg(not(feature = "profiling"))]
    {
        tracing::trace!(task = name, "Spawning task");
        tokio::spawn(future)
    }
}

/// Check if we're running inside a tokio runtime context
pub fn in_runtime_context() -> bool {
    tokio::runtime::Handle::try_current().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_spawn_returns_output() {
        assert!(in_runtime_context());
        let handle = spawn("answer", async { 42 });
        assert_eq!(handle.await.unwrap(), 42);
    }

    #[test]
    fn test_outside_runtime() {
        assert!(!in_runtime_context());
    }
}
