//! Background fetch loop: one long-lived task per active stream.
//!
//! The loop wakes on a fuzzed interval, an explicit trigger, or shutdown.
//! Trigger waiters are snapshotted before the next ingest call and notified
//! exactly when that call returns; triggers arriving while an ingest is in
//! flight are coalesced into the next iteration rather than lost.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mpf_db::Store;
use mpf_mastodon::MastodonClient;
use mpf_schemas::{Error, Result};
use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Base wake interval; each sleep is fuzzed by ±10 %.
    pub interval: Duration,
    /// Ingest rounds per wake-up, to drain a paginated backlog.
    pub max_rounds: usize,
    /// Page budget handed to each ingest call.
    pub max_batches: usize,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            max_rounds: 10,
            max_batches: mpf_ingest::DEFAULT_MAX_BATCHES,
        }
    }
}

type Waiter = oneshot::Sender<()>;

/// Handle to a running fetch loop.
pub struct FetcherHandle {
    trigger_tx: mpsc::UnboundedSender<Waiter>,
    fetching: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl FetcherHandle {
    /// Whether an ingest pass is currently in flight.
    pub fn is_fetching(&self) -> bool {
        self.fetching.load(Ordering::Relaxed)
    }

    /// Request a fetch without waiting for it.
    pub fn trigger(&self) {
        let (tx, _rx) = oneshot::channel();
        let _ = self.trigger_tx.send(tx);
    }

    /// Request a fetch and wait until the ingest call issued after this
    /// trigger has returned.
    pub async fn trigger_and_wait(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.trigger_tx
            .send(tx)
            .map_err(|_| Error::Internal("fetcher is gone".to_string()))?;
        rx.await
            .map_err(|_| Error::Internal("fetcher dropped the trigger".to_string()))
    }

    /// Stop the loop. The in-flight ingest round (if any) finishes first;
    /// no transaction is held across the exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.join.await;
    }
}

/// Spawn the fetch loop for one stream.
pub fn spawn(
    store: Arc<Store>,
    client: Arc<dyn MastodonClient>,
    stid: i64,
    config: FetcherConfig,
) -> FetcherHandle {
    let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let fetching = Arc::new(AtomicBool::new(false));

    let flag = Arc::clone(&fetching);
    let join = tokio::spawn(async move {
        run_loop(store, client, stid, config, trigger_rx, shutdown_rx, flag).await;
    });

    FetcherHandle {
        trigger_tx,
        fetching,
        shutdown_tx,
        join,
    }
}

fn fuzzed(interval: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.9..=1.1);
    interval.mul_f64(factor)
}

async fn run_loop(
    store: Arc<Store>,
    client: Arc<dyn MastodonClient>,
    stid: i64,
    config: FetcherConfig,
    mut trigger_rx: mpsc::UnboundedReceiver<Waiter>,
    mut shutdown_rx: watch::Receiver<bool>,
    fetching: Arc<AtomicBool>,
) {
    info!(stid, "fetcher started");
    loop {
        let mut waiters: Vec<Waiter> = Vec::new();
        tokio::select! {
            _ = tokio::time::sleep(fuzzed(config.interval)) => {}
            w = trigger_rx.recv() => match w {
                Some(w) => waiters.push(w),
                None => break,
            },
            _ = shutdown_rx.changed() => break,
        }
        // Snapshot every trigger issued before the ingest call below; later
        // arrivals coalesce into the next iteration.
        while let Ok(w) = trigger_rx.try_recv() {
            waiters.push(w);
        }

        fetching.store(true, Ordering::Relaxed);
        run_rounds(&store, client.as_ref(), stid, &config, waiters, &shutdown_rx).await;
        fetching.store(false, Ordering::Relaxed);

        if *shutdown_rx.borrow() {
            break;
        }
    }
    info!(stid, "fetcher stopped");
}

async fn run_rounds(
    store: &Store,
    client: &dyn MastodonClient,
    stid: i64,
    config: &FetcherConfig,
    waiters: Vec<Waiter>,
    shutdown_rx: &watch::Receiver<bool>,
) {
    let mut waiters = Some(waiters);
    for round in 0..config.max_rounds {
        let result = mpf_ingest::ingest_home(store, client, stid, config.max_batches).await;

        // The first ingest call of this wake-up is the one the snapshotted
        // waiters were promised.
        if let Some(ws) = waiters.take() {
            for w in ws {
                let _ = w.send(());
            }
        }

        match result {
            Ok(stats) => {
                debug!(stid, round, fetched = stats.fetched, "ingest round");
                if stats.fetched == 0 {
                    break;
                }
            }
            Err(e) => {
                // Transient upstream failures retry at the next tick.
                warn!(stid, error = %e, "ingest round failed");
                break;
            }
        }
        if *shutdown_rx.borrow() {
            return;
        }
    }

    if let Err(e) = mpf_ingest::update_notifications(store, client, stid).await {
        warn!(stid, error = %e, "notification refresh failed");
    }
}
