//! Periodic background tasks with explicit start and stop.

use std::future::Future;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// A task that runs `tick` every `interval` until stopped.
///
/// Ticks never overlap: a slow tick delays the next one.
pub struct PeriodicTask {
    name: &'static str,
    stop_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<u64>>,
}

impl PeriodicTask {
    /// Spawns the task on the current runtime. The first tick runs immediately.
    pub fn start<F, Fut>(name: &'static str, interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut ticks = 0u64;
            loop {
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = ticker.tick() => {
                        tick().await;
                        ticks += 1;
                    }
                }
            }
            tracing::debug!(task = name, ticks, "periodic task stopped");
            ticks
        });
        tracing::info!(task = name, interval_ms = interval.as_millis() as u64, "periodic task started");
        Self {
            name,
            stop_tx,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signals the task and waits for the in-flight tick to finish.
    ///
    /// Returns the number of ticks that ran.
    pub async fn stop(mut self) -> u64 {
        let _ = self.stop_tx.send(true);
        match self.handle.take() {
            Some(handle) => handle.await.unwrap_or_else(|e| {
                tracing::error!(task = self.name, error = %e, "periodic task panicked");
                0
            }),
            None => 0,
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.stop_tx.send(true);
            handle.abort();
        }
    }
}
