use std::{
    future::Future,
    sync::Mutex,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tokio::{sync::watch, task::JoinHandle, time};
use tracing::debug;

pub fn get_epoch_time_in_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Runs named jobs on an interval or once after a delay. Injected into the
/// components that need background work so there is no process-wide
/// scheduler state; `shutdown()` stops every job cooperatively and awaits
/// task completion.
pub struct PeriodicJobService {
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PeriodicJobService {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Runs `job` every `every`, starting one interval from now.
    pub fn spawn_interval<F, Fut>(&self, name: &'static str, every: Duration, job: F)
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval(every);
            ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            // the first tick fires immediately; consume it so the job runs
            // one interval from now
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        job().await;
                    }
                    _ = shutdown_rx.changed() => {
                        debug!(job = name, "stopping periodic job");
                        return;
                    }
                }
            }
        });
        self.tasks.lock().unwrap().push(handle);
    }

    /// Runs `job` once after `delay`, unless shut down first.
    pub fn spawn_once<F, Fut>(&self, name: &'static str, delay: Duration, job: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = time::sleep(delay) => {
                    job().await;
                }
                _ = shutdown_rx.changed() => {
                    debug!(job = name, "cancelling one-shot job");
                }
            }
        });
        self.tasks.lock().unwrap().push(handle);
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl Default for PeriodicJobService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_interval_job_runs_until_shutdown() {
        let service = PeriodicJobService::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        service.spawn_interval("ticker", Duration::from_secs(1), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        time::sleep(Duration::from_millis(3500)).await;
        service.shutdown().await;
        let seen = runs.load(Ordering::SeqCst);
        assert_eq!(seen, 3);

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), seen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_shot_job_runs_once() {
        let service = PeriodicJobService::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        service.spawn_once("once", Duration::from_secs(2), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        time::sleep(Duration::from_secs(3)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        service.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_cancels_pending_one_shot() {
        let service = PeriodicJobService::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        service.spawn_once("never", Duration::from_secs(60), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        service.shutdown().await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
