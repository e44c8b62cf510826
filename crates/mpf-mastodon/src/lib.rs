//! Upstream Mastodon adapter.
//!
//! The core consumes the [`MastodonClient`] trait; the REST implementation
//! lives in [`rest`]. Implementations must be object-safe so callers can
//! hold an `Arc<dyn MastodonClient>` without knowing the concrete type, and
//! `Send + Sync` so they can be used across task boundaries.

use std::collections::HashMap;

use async_trait::async_trait;
use mpf_schemas::mastodon::{Filter, Marker, MastodonAccount, Notification, Status};
use mpf_schemas::Result;

pub mod rest;

pub use rest::RestClient;

/// Ordering of opaque upstream ids, per Mastodon convention: longer id
/// strings are newer; for equal length, lexicographic order applies.
pub fn id_newer(a: &str, b: &str) -> bool {
    match a.len().cmp(&b.len()) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => a > b,
    }
}

/// Pagination parameters for timeline-shaped endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pagination {
    pub limit: Option<i64>,
    pub min_id: Option<String>,
    pub max_id: Option<String>,
    pub since_id: Option<String>,
}

impl Pagination {
    pub fn with_min_id(min_id: Option<String>) -> Self {
        Self {
            min_id,
            ..Default::default()
        }
    }

    pub fn query(&self) -> Vec<(&'static str, String)> {
        let mut q = Vec::new();
        if let Some(v) = self.limit {
            q.push(("limit", v.to_string()));
        }
        if let Some(v) = &self.min_id {
            q.push(("min_id", v.clone()));
        }
        if let Some(v) = &self.max_id {
            q.push(("max_id", v.clone()));
        }
        if let Some(v) = &self.since_id {
            q.push(("since_id", v.clone()));
        }
        q
    }
}

/// One page of a paginated endpoint, with the pagination parameters the
/// upstream advertised in its `Link` header.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Parameters for newer items (`rel="prev"`).
    pub prev: Option<Pagination>,
    /// Parameters for older items (`rel="next"`).
    pub next: Option<Pagination>,
}

impl<T> Default for Page<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            prev: None,
            next: None,
        }
    }
}

/// Result of registering an OAuth app on an upstream server.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RegisteredApp {
    pub client_id: String,
    pub client_secret: String,
}

/// The capability set the core consumes from an upstream Mastodon server.
#[async_trait]
pub trait MastodonClient: Send + Sync {
    async fn register_app(
        &self,
        server_addr: &str,
        scopes: &str,
        redirect_uri: &str,
    ) -> Result<RegisteredApp>;

    async fn obtain_token(
        &self,
        server_addr: &str,
        client_id: &str,
        client_secret: &str,
        redirect_uri: &str,
        auth_code: &str,
    ) -> Result<String>;

    async fn verify_credentials(
        &self,
        server_addr: &str,
        access_token: &str,
    ) -> Result<MastodonAccount>;

    async fn home_timeline(
        &self,
        server_addr: &str,
        access_token: &str,
        pagination: &Pagination,
    ) -> Result<Page<Status>>;

    async fn filters(&self, server_addr: &str, access_token: &str) -> Result<Vec<Filter>>;

    /// Read markers for the named timelines (e.g. `["notifications"]`).
    async fn markers(
        &self,
        server_addr: &str,
        access_token: &str,
        timelines: &[&str],
    ) -> Result<HashMap<String, Marker>>;

    async fn status(&self, server_addr: &str, access_token: &str, id: &str) -> Result<Status>;

    async fn favourite(&self, server_addr: &str, access_token: &str, id: &str)
        -> Result<Status>;

    async fn unfavourite(
        &self,
        server_addr: &str,
        access_token: &str,
        id: &str,
    ) -> Result<Status>;

    async fn notifications(
        &self,
        server_addr: &str,
        access_token: &str,
        pagination: &Pagination,
    ) -> Result<Page<Notification>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_newer_prefers_longer() {
        assert!(id_newer("100", "99"));
        assert!(!id_newer("99", "100"));
    }

    #[test]
    fn id_newer_same_length_is_lexicographic() {
        assert!(id_newer("12", "11"));
        assert!(!id_newer("11", "12"));
        assert!(!id_newer("11", "11"));
    }

    #[test]
    fn pagination_query_skips_unset() {
        let p = Pagination {
            limit: Some(40),
            min_id: Some("7".to_string()),
            ..Default::default()
        };
        assert_eq!(
            p.query(),
            vec![("limit", "40".to_string()), ("min_id", "7".to_string())]
        );
    }
}
