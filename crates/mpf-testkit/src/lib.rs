//! In-process fake Mastodon server for tests and `testserve`.
//!
//! [`FakeMastodon`] implements the upstream adapter trait over an in-memory
//! timeline with deterministic ids (sequential, starting at 10) and
//! timestamps (one minute apart). Pagination mirrors the real server's
//! `min_id` semantics: the page immediately newer than the given id,
//! presented newest-first, with the next-newer window advertised as `prev`.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use mpf_mastodon::{id_newer, MastodonClient, Page, Pagination, RegisteredApp};
use mpf_schemas::mastodon::{Filter, Marker, MastodonAccount, Notification, Status};
use mpf_schemas::{Error, Result};

pub const FAKE_SERVER: &str = "https://fake.example";
pub const FAKE_ACCOUNT_ID: &str = "f0001";
pub const FAKE_USERNAME: &str = "testuser";

const DEFAULT_PAGE_LIMIT: usize = 20;

#[derive(Default)]
struct Inner {
    /// Chronological, oldest first.
    statuses: Vec<Status>,
    filters: Vec<Filter>,
    notifications: Vec<Notification>,
    notification_marker: Option<Marker>,
    next_id: u64,
    register_calls: u64,
    token_calls: u64,
}

pub struct FakeMastodon {
    inner: Mutex<Inner>,
}

impl Default for FakeMastodon {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeMastodon {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_id: 10,
                ..Default::default()
            }),
        }
    }

    fn base_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("fake server lock poisoned")
    }

    fn make_status(inner: &mut Inner, content: &str, tags: &[&str]) -> Status {
        let id = inner.next_id;
        inner.next_id += 1;
        let created_at = Self::base_time() + Duration::minutes(inner.statuses.len() as i64);
        serde_json::from_value(serde_json::json!({
            "id": id.to_string(),
            "created_at": created_at.to_rfc3339(),
            "content": content,
            "tags": tags.iter().map(|t| serde_json::json!({"name": t})).collect::<Vec<_>>(),
        }))
        .expect("fake status must deserialize")
    }

    /// Publish a status on the fake timeline; returns its id.
    pub fn post_status(&self, content: &str, tags: &[&str]) -> String {
        let mut inner = self.lock();
        let status = Self::make_status(&mut inner, content, tags);
        let id = status.id.clone();
        inner.statuses.push(status);
        id
    }

    /// Publish a reblog of an existing status; returns the reblog's id.
    pub fn post_reblog(&self, target_id: &str) -> String {
        let mut inner = self.lock();
        let target = inner
            .statuses
            .iter()
            .find(|s| s.id == target_id)
            .expect("reblog target must exist")
            .clone();
        let mut status = Self::make_status(&mut inner, "", &[]);
        status.reblog = Some(Box::new(target));
        let id = status.id.clone();
        inner.statuses.push(status);
        id
    }

    pub fn set_filters(&self, filters: Vec<Filter>) {
        self.lock().filters = filters;
    }

    pub fn add_notification(&self, id: &str) {
        let n: Notification = serde_json::from_value(serde_json::json!({
            "id": id,
            "type": "mention",
        }))
        .expect("fake notification must deserialize");
        self.lock().notifications.push(n);
    }

    pub fn set_notification_marker(&self, last_read_id: &str) {
        let m: Marker = serde_json::from_value(serde_json::json!({
            "last_read_id": last_read_id,
        }))
        .expect("fake marker must deserialize");
        self.lock().notification_marker = Some(m);
    }

    /// Network-call counter for app registrations (cache-hit assertions).
    pub fn register_calls(&self) -> u64 {
        self.lock().register_calls
    }

    fn check_server(server_addr: &str) -> Result<()> {
        if server_addr == FAKE_SERVER {
            Ok(())
        } else {
            Err(Error::upstream(
                None,
                format!("fake server does not serve {server_addr}"),
            ))
        }
    }
}

#[async_trait]
impl MastodonClient for FakeMastodon {
    async fn register_app(
        &self,
        server_addr: &str,
        _scopes: &str,
        _redirect_uri: &str,
    ) -> Result<RegisteredApp> {
        Self::check_server(server_addr)?;
        let mut inner = self.lock();
        inner.register_calls += 1;
        Ok(RegisteredApp {
            client_id: "fake-client-id".to_string(),
            client_secret: "fake-client-secret".to_string(),
        })
    }

    async fn obtain_token(
        &self,
        server_addr: &str,
        _client_id: &str,
        _client_secret: &str,
        _redirect_uri: &str,
        auth_code: &str,
    ) -> Result<String> {
        Self::check_server(server_addr)?;
        if auth_code.is_empty() {
            return Err(Error::upstream(Some(400), "empty auth code"));
        }
        let mut inner = self.lock();
        inner.token_calls += 1;
        Ok(format!("fake-token-{}", inner.token_calls))
    }

    async fn verify_credentials(
        &self,
        server_addr: &str,
        _access_token: &str,
    ) -> Result<MastodonAccount> {
        Self::check_server(server_addr)?;
        Ok(serde_json::from_value(serde_json::json!({
            "id": FAKE_ACCOUNT_ID,
            "username": FAKE_USERNAME,
        }))?)
    }

    async fn home_timeline(
        &self,
        server_addr: &str,
        _access_token: &str,
        pagination: &Pagination,
    ) -> Result<Page<Status>> {
        Self::check_server(server_addr)?;
        let inner = self.lock();
        let limit = pagination.limit.unwrap_or(DEFAULT_PAGE_LIMIT as i64) as usize;

        // Statuses strictly newer than min_id, oldest first.
        let newer: Vec<&Status> = inner
            .statuses
            .iter()
            .filter(|s| match &pagination.min_id {
                Some(min) => id_newer(&s.id, min),
                None => true,
            })
            .collect();

        let window: Vec<Status> = match &pagination.min_id {
            // min_id pages walk forward from the oldest unseen status.
            Some(_) => newer.iter().take(limit).map(|s| (*s).clone()).collect(),
            // Without min_id the newest `limit` items are returned.
            None => {
                let skip = newer.len().saturating_sub(limit);
                newer.iter().skip(skip).map(|s| (*s).clone()).collect()
            }
        };

        if window.is_empty() {
            return Ok(Page::default());
        }

        let newest = window.last().map(|s| s.id.clone());
        let oldest = window.first().map(|s| s.id.clone());
        // Newest first, like the real API.
        let mut items = window;
        items.reverse();

        Ok(Page {
            items,
            prev: Some(Pagination {
                min_id: newest,
                ..Default::default()
            }),
            next: Some(Pagination {
                max_id: oldest,
                ..Default::default()
            }),
        })
    }

    async fn filters(&self, server_addr: &str, _access_token: &str) -> Result<Vec<Filter>> {
        Self::check_server(server_addr)?;
        Ok(self.lock().filters.clone())
    }

    async fn markers(
        &self,
        server_addr: &str,
        _access_token: &str,
        timelines: &[&str],
    ) -> Result<HashMap<String, Marker>> {
        Self::check_server(server_addr)?;
        let inner = self.lock();
        let mut out = HashMap::new();
        if timelines.contains(&"notifications") {
            if let Some(m) = &inner.notification_marker {
                out.insert("notifications".to_string(), m.clone());
            }
        }
        Ok(out)
    }

    async fn status(&self, server_addr: &str, _access_token: &str, id: &str) -> Result<Status> {
        Self::check_server(server_addr)?;
        self.lock()
            .statuses
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(|| Error::upstream(Some(404), format!("no status {id}")))
    }

    async fn favourite(
        &self,
        server_addr: &str,
        _access_token: &str,
        id: &str,
    ) -> Result<Status> {
        Self::check_server(server_addr)?;
        let mut inner = self.lock();
        let status = inner
            .statuses
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| Error::upstream(Some(404), format!("no status {id}")))?;
        status.favourited = Some(true);
        Ok(status.clone())
    }

    async fn unfavourite(
        &self,
        server_addr: &str,
        _access_token: &str,
        id: &str,
    ) -> Result<Status> {
        Self::check_server(server_addr)?;
        let mut inner = self.lock();
        let status = inner
            .statuses
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| Error::upstream(Some(404), format!("no status {id}")))?;
        status.favourited = Some(false);
        Ok(status.clone())
    }

    async fn notifications(
        &self,
        server_addr: &str,
        _access_token: &str,
        _pagination: &Pagination,
    ) -> Result<Page<Notification>> {
        Self::check_server(server_addr)?;
        let inner = self.lock();
        let mut items = inner.notifications.clone();
        items.reverse();
        Ok(Page {
            items,
            prev: None,
            next: None,
        })
    }
}
