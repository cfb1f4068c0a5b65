use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{self, Instant};

#[derive(Clone)]
pub struct Heartbeat {
    sender: watch::Sender<Instant>,
}

impl Heartbeat {
    pub fn new() -> (Self, watch::Receiver<Instant>) {
        let (sender, receiver) = watch::channel(Instant::now());
        (Self { sender }, receiver)
    }

    pub fn tick(&self) {
        let _ = self.sender.send(Instant::now());
    }
}

/// Runs the task produced by `spawn` until shutdown, restarting it after
/// `restart_backoff` whenever it returns, panics, or (with `idle_timeout`
/// set) stops ticking its heartbeat.
pub async fn supervise<F, Fut, E>(
    name: &'static str,
    restart_backoff: Duration,
    idle_timeout: Option<Duration>,
    mut shutdown: watch::Receiver<bool>,
    mut spawn: F,
) where
    F: FnMut(Heartbeat) -> Fut,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: Display + Send + 'static,
{
    loop {
        if *shutdown.borrow() {
            break;
        }

        let (heartbeat, mut heartbeat_rx) = Heartbeat::new();
        let mut join = tokio::spawn(spawn(heartbeat));

        let mut interval = time::interval(Duration::from_millis(250));
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    join.abort();
                    return;
                }
                _ = interval.tick(), if idle_timeout.is_some() => {
                    let last = *heartbeat_rx.borrow();
                    if idle_timeout.is_some_and(|timeout| last.elapsed() > timeout) {
                        tracing::warn!(task = name, "watchdog timeout, restarting task");
                        join.abort();
                        break;
                    }
                }
                result = &mut join => {
                    match result {
                        Ok(Ok(())) => tracing::warn!(task = name, "task exited, restarting"),
                        Ok(Err(err)) => tracing::warn!(task = name, "task failed: {}, restarting", err),
                        Err(_) => tracing::warn!(task = name, "task aborted, restarting"),
                    }
                    break;
                }
                Ok(()) = heartbeat_rx.changed() => {
                    // heartbeat updated
                }
            }
        }

        tokio::select! {
            _ = shutdown.changed() => return,
            _ = time::sleep(restart_backoff) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn restarts_failed_task_after_backoff() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runs = Arc::new(AtomicUsize::new(0));
        let started = time::Instant::now();

        let counter = runs.clone();
        let supervisor = tokio::spawn(supervise(
            "flaky",
            Duration::from_secs(5),
            None,
            shutdown_rx,
            move |_heartbeat| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("connection refused")
                }
            },
        ));

        while runs.load(Ordering::SeqCst) < 3 {
            time::sleep(Duration::from_millis(100)).await;
        }
        assert!(started.elapsed() >= Duration::from_secs(10));

        shutdown_tx.send(true).unwrap();
        supervisor.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn restarts_task_that_stops_ticking() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = runs.clone();
        let supervisor = tokio::spawn(supervise(
            "stalled",
            Duration::from_millis(100),
            Some(Duration::from_secs(1)),
            shutdown_rx,
            move |_heartbeat| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    std::future::pending::<()>().await;
                    Ok::<(), String>(())
                }
            },
        ));

        time::sleep(Duration::from_secs(4)).await;
        assert!(runs.load(Ordering::SeqCst) >= 2);

        shutdown_tx.send(true).unwrap();
        supervisor.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_shutdown() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let supervisor = tokio::spawn(supervise(
            "idle",
            Duration::from_secs(5),
            None,
            shutdown_rx,
            |heartbeat: Heartbeat| async move {
                for _ in 0..1_000 {
                    heartbeat.tick();
                    time::sleep(Duration::from_millis(50)).await;
                }
                Ok::<(), String>(())
            },
        ));

        time::sleep(Duration::from_secs(1)).await;
        shutdown_tx.send(true).unwrap();
        supervisor.await.unwrap();
    }
}
