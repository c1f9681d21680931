//! Thin wrapper around `tokio::spawn` that names the task for logging.
//! Every background ticker and reconciler in `meshcloud-daemon` is spawned
//! through this so a panicking task is never silent.

use std::future::Future;

use tokio::task::JoinHandle;

pub fn spawn_task<F>(name: &'static str, future: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        future.await;
        log::debug!("task '{name}' exited");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn runs_the_future() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        spawn_task("test", async move {
            ran2.store(true, Ordering::SeqCst);
        })
        .await
        .unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }
}
