use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::engine::ReconciliationEngine;
use crate::error::AppResult;

/// Periodically picks up pending payments and hands each one to the engine
pub struct Poller {
    engine: Arc<ReconciliationEngine>,
    semaphore: Arc<Semaphore>,
    /// Dispatch tasks spawned by ticks that may still be running
    running: Mutex<Vec<JoinHandle<()>>>,
}

/// Outcome of one tick. Dispatches keep running after `tick` returns;
/// wait for them with [`Poller::drain`].
#[derive(Debug, Clone, Copy)]
pub struct TickSummary {
    pub candidates: usize,
    pub dispatched: usize,
}

/// Running background loop; stop it with [`TaskHandle::shutdown`]
pub struct TaskHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TaskHandle {
    pub fn spawn<F, Fut>(body: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (shutdown, rx) = watch::channel(false);
        let task = tokio::spawn(body(rx));
        Self { shutdown, task }
    }

    /// Signals the loop and waits for it, including its own cleanup
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            error!("Background task ended abnormally: {}", e);
        }
    }
}

impl Poller {
    pub fn new(engine: Arc<ReconciliationEngine>) -> Self {
        let permits = engine.config().max_concurrent_dispatches.max(1);
        Self {
            engine,
            semaphore: Arc::new(Semaphore::new(permits)),
            running: Mutex::new(Vec::new()),
        }
    }

    /// Start polling in the background.
    ///
    /// On shutdown the loop stops ticking, then waits for dispatches already
    /// under way so no credit is cut off before its outcome is recorded.
    pub fn start(self: Arc<Self>) -> TaskHandle {
        let period = self.engine.config().poll_interval();
        info!("⏰ Payment poller started, every {}s", period.as_secs());

        TaskHandle::spawn(move |mut shutdown| async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.tick().await {
                            error!("❌ Poll tick failed: {}", e);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }

            let grace = self.engine.config().dispatch_grace();
            if !self.drain(grace).await {
                warn!("Dispatches still running after {}s, abandoning them", grace.as_secs());
            }

            self.engine.inflight().clear();
            info!("Payment poller stopped");
        })
    }

    /// Waits up to `limit` for every dispatch spawned so far.
    /// Returns false if some were still running at the deadline.
    pub async fn drain(&self, limit: Duration) -> bool {
        let tasks = std::mem::take(&mut *self.running.lock());
        if tasks.is_empty() {
            return true;
        }

        info!("Waiting for {} in-progress dispatches", tasks.len());
        match tokio::time::timeout(limit, join_all(tasks)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        error!("Dispatch task panicked: {}", e);
                    }
                }
                true
            }
            Err(_) => false,
        }
    }

    /// Query pending payments and dispatch every one not already in flight
    pub async fn tick(&self) -> AppResult<TickSummary> {
        let rows = self.engine.store().pending_payments().await?;
        let candidates = rows.len();
        let mut tasks = Vec::new();

        for row in rows {
            let payment = row.payment;
            if !self.engine.inflight().try_mark(payment.id) {
                debug!("Payment {} already in flight, skipping", payment.id);
                continue;
            }

            let engine = self.engine.clone();
            let semaphore = self.semaphore.clone();
            tasks.push(tokio::spawn(async move {
                let payment_id = payment.id;
                match semaphore.acquire_owned().await {
                    Ok(_permit) => match engine.confirm_and_dispatch(&payment).await {
                        Ok(report) => debug!("Payment {}: {:?}", payment_id, report.outcome),
                        Err(e) => warn!("Payment {} not reconciled this tick: {}", payment_id, e),
                    },
                    Err(e) => error!("Dispatch semaphore closed: {}", e),
                }

                tokio::time::sleep(engine.config().inflight_cooldown()).await;
                engine.inflight().release(payment_id);
            }));
        }

        let dispatched = tasks.len();
        if candidates > 0 {
            info!("🔄 Poll tick: {} pending, {} dispatched", candidates, dispatched);
        }

        {
            let mut running = self.running.lock();
            running.retain(|task| !task.is_finished());
            running.extend(tasks);
        }

        Ok(TickSummary {
            candidates,
            dispatched,
        })
    }
}
