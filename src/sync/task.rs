// src/sync/task.rs
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Handle to a spawned timer or loop. The job receives the token and must
/// stop waiting once it is cancelled, which happens when the handle is
/// dropped. Work the job already started is left to finish.
#[derive(Debug)]
pub struct ScheduledTask {
    cancel_token: CancellationToken,
}

impl ScheduledTask {
    pub fn spawn<F, Fut>(job: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let cancel_token = CancellationToken::new();
        tokio::spawn(job(cancel_token.clone()));
        Self { cancel_token }
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Sleep unless cancelled first. Returns `false` when cancelled.
pub async fn sleep_or_cancel(token: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn delayed_flag(delay: Duration) -> (ScheduledTask, Arc<AtomicBool>) {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        let task = ScheduledTask::spawn(move |token| async move {
            if sleep_or_cancel(&token, delay).await {
                flag.store(true, Ordering::SeqCst);
            }
        });
        (task, fired)
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_cancels_timer() {
        let (task, fired) = delayed_flag(Duration::from_secs(5));
        drop(task);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_while_handle_is_held() {
        let (_task, fired) = delayed_flag(Duration::from_secs(5));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(fired.load(Ordering::SeqCst));
    }
}
