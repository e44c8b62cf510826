//! Shared runtime state for the RPC daemon.
//!
//! Handlers receive `State<Arc<AppState>>` from Axum; this module owns
//! nothing async itself beyond the fetcher registry lock.

use std::collections::HashMap;
use std::sync::Arc;

use mpf_db::Store;
use mpf_fetcher::{FetcherConfig, FetcherHandle};
use mpf_mastodon::MastodonClient;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

/// Static build metadata included in health responses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

/// Cloneable (Arc) handle shared across all Axum handlers.
pub struct AppState {
    pub store: Arc<Store>,
    pub client: Arc<dyn MastodonClient>,
    /// When set, `Authorize` requires this invite code.
    pub invite_code: Option<String>,
    /// Default-server hint handed to the frontend bootstrap.
    pub default_server: Option<String>,
    pub build: BuildInfo,
    /// One background fetch loop per active stream.
    fetchers: Mutex<HashMap<i64, FetcherHandle>>,
}

impl AppState {
    pub fn new(
        store: Arc<Store>,
        client: Arc<dyn MastodonClient>,
        invite_code: Option<String>,
        default_server: Option<String>,
    ) -> Self {
        Self {
            store,
            client,
            invite_code,
            default_server,
            build: BuildInfo {
                service: "mastopoof",
                version: env!("CARGO_PKG_VERSION"),
            },
            fetchers: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn the stream's background fetcher if it is not running yet.
    pub async fn ensure_fetcher(&self, stid: i64) {
        let mut fetchers = self.fetchers.lock().await;
        fetchers.entry(stid).or_insert_with(|| {
            mpf_fetcher::spawn(
                Arc::clone(&self.store),
                Arc::clone(&self.client),
                stid,
                FetcherConfig::default(),
            )
        });
    }

    /// Whether the stream's fetcher has an ingest pass in flight.
    pub async fn is_fetching(&self, stid: i64) -> bool {
        let fetchers = self.fetchers.lock().await;
        fetchers.get(&stid).map(|f| f.is_fetching()).unwrap_or(false)
    }

    /// Stop every fetch loop cleanly.
    pub async fn shutdown_fetchers(&self) {
        let mut fetchers = self.fetchers.lock().await;
        for (_, handle) in fetchers.drain() {
            handle.shutdown().await;
        }
    }
}
