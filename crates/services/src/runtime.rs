use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Runs `task` after `delay` on the ambient tokio runtime.
///
/// Returns `None` when called outside a runtime; the task is dropped.
pub(crate) fn spawn_after<F>(delay: Duration, task: F) -> Option<JoinHandle<()>>
where
    F: Future<Output = ()> + Send + 'static,
{
    let handle = Handle::try_current().ok()?;
    Some(handle.spawn(async move {
        tokio::time::sleep(delay).await;
        task.await;
    }))
}

/// Locks `mutex`, recovering the data if a listener panicked while holding it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
