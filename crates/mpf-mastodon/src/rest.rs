//! reqwest-backed [`MastodonClient`] implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use mpf_schemas::mastodon::{Filter, Marker, MastodonAccount, Notification, Status};
use mpf_schemas::{Error, Result};
use serde::de::DeserializeOwned;

use crate::{MastodonClient, Page, Pagination, RegisteredApp};

#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
}

impl Default for RestClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RestClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    fn url(server_addr: &str, path: &str) -> String {
        format!("{}{}", server_addr.trim_end_matches('/'), path)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        server_addr: &str,
        path: &str,
        access_token: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let resp = self
            .http
            .get(Self::url(server_addr, path))
            .bearer_auth(access_token)
            .query(query)
            .send()
            .await
            .map_err(transport)?;
        decode(resp).await
    }

    async fn get_page<T: DeserializeOwned>(
        &self,
        server_addr: &str,
        path: &str,
        access_token: &str,
        pagination: &Pagination,
    ) -> Result<Page<T>> {
        let resp = self
            .http
            .get(Self::url(server_addr, path))
            .bearer_auth(access_token)
            .query(&pagination.query())
            .send()
            .await
            .map_err(transport)?;

        let link = resp
            .headers()
            .get("link")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let items = decode(resp).await?;

        let (prev, next) = match link {
            Some(h) => parse_link_header(&h),
            None => (None, None),
        };
        Ok(Page { items, prev, next })
    }

    async fn post_json<T: DeserializeOwned>(
        &self,
        server_addr: &str,
        path: &str,
        access_token: &str,
    ) -> Result<T> {
        let resp = self
            .http
            .post(Self::url(server_addr, path))
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(transport)?;
        decode(resp).await
    }
}

fn transport(e: reqwest::Error) -> Error {
    Error::upstream(e.status().map(|s| s.as_u16()), format!("transport: {e}"))
}

async fn decode<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(Error::upstream(
            Some(status.as_u16()),
            format!("http {}: {}", status.as_u16(), body),
        ));
    }
    resp.json::<T>()
        .await
        .map_err(|e| Error::upstream(Some(status.as_u16()), format!("decode: {e}")))
}

/// Parse a Mastodon `Link` header into (prev, next) pagination parameters.
///
/// The header carries full URIs; only the pagination query parameters are
/// retained, since the caller re-issues requests against its own base URL.
pub fn parse_link_header(header: &str) -> (Option<Pagination>, Option<Pagination>) {
    let mut prev = None;
    let mut next = None;
    for part in header.split(',') {
        let part = part.trim();
        let Some(uri_end) = part.find('>') else {
            continue;
        };
        let Some(uri) = part.strip_prefix('<').map(|s| &s[..uri_end - 1]) else {
            continue;
        };
        let pagination = pagination_from_uri(uri);
        if part[uri_end..].contains("rel=\"prev\"") {
            prev = Some(pagination);
        } else if part[uri_end..].contains("rel=\"next\"") {
            next = Some(pagination);
        }
    }
    (prev, next)
}

fn pagination_from_uri(uri: &str) -> Pagination {
    let mut p = Pagination::default();
    let Some(query) = uri.split_once('?').map(|(_, q)| q) else {
        return p;
    };
    for pair in query.split('&') {
        let (k, v) = match pair.split_once('=') {
            Some(kv) => kv,
            None => continue,
        };
        match k {
            "limit" => p.limit = v.parse().ok(),
            "min_id" => p.min_id = Some(v.to_string()),
            "max_id" => p.max_id = Some(v.to_string()),
            "since_id" => p.since_id = Some(v.to_string()),
            _ => {}
        }
    }
    p
}

#[async_trait]
impl MastodonClient for RestClient {
    async fn register_app(
        &self,
        server_addr: &str,
        scopes: &str,
        redirect_uri: &str,
    ) -> Result<RegisteredApp> {
        let resp = self
            .http
            .post(Self::url(server_addr, "/api/v1/apps"))
            .form(&[
                ("client_name", "mastopoof"),
                ("redirect_uris", redirect_uri),
                ("scopes", scopes),
            ])
            .send()
            .await
            .map_err(transport)?;
        decode(resp).await
    }

    async fn obtain_token(
        &self,
        server_addr: &str,
        client_id: &str,
        client_secret: &str,
        redirect_uri: &str,
        auth_code: &str,
    ) -> Result<String> {
        #[derive(serde::Deserialize)]
        struct TokenResponse {
            access_token: String,
        }

        let resp = self
            .http
            .post(Self::url(server_addr, "/oauth/token"))
            .form(&[
                ("grant_type", "authorization_code"),
                ("client_id", client_id),
                ("client_secret", client_secret),
                ("redirect_uri", redirect_uri),
                ("code", auth_code),
            ])
            .send()
            .await
            .map_err(transport)?;
        let token: TokenResponse = decode(resp).await?;
        Ok(token.access_token)
    }

    async fn verify_credentials(
        &self,
        server_addr: &str,
        access_token: &str,
    ) -> Result<MastodonAccount> {
        self.get_json(
            server_addr,
            "/api/v1/accounts/verify_credentials",
            access_token,
            &[],
        )
        .await
    }

    async fn home_timeline(
        &self,
        server_addr: &str,
        access_token: &str,
        pagination: &Pagination,
    ) -> Result<Page<Status>> {
        self.get_page(server_addr, "/api/v1/timelines/home", access_token, pagination)
            .await
    }

    async fn filters(&self, server_addr: &str, access_token: &str) -> Result<Vec<Filter>> {
        self.get_json(server_addr, "/api/v1/filters", access_token, &[])
            .await
    }

    async fn markers(
        &self,
        server_addr: &str,
        access_token: &str,
        timelines: &[&str],
    ) -> Result<HashMap<String, Marker>> {
        let query: Vec<(&str, String)> = timelines
            .iter()
            .map(|t| ("timeline[]", t.to_string()))
            .collect();
        self.get_json(server_addr, "/api/v1/markers", access_token, &query)
            .await
    }

    async fn status(&self, server_addr: &str, access_token: &str, id: &str) -> Result<Status> {
        self.get_json(
            server_addr,
            &format!("/api/v1/statuses/{id}"),
            access_token,
            &[],
        )
        .await
    }

    async fn favourite(
        &self,
        server_addr: &str,
        access_token: &str,
        id: &str,
    ) -> Result<Status> {
        self.post_json(
            server_addr,
            &format!("/api/v1/statuses/{id}/favourite"),
            access_token,
        )
        .await
    }

    async fn unfavourite(
        &self,
        server_addr: &str,
        access_token: &str,
        id: &str,
    ) -> Result<Status> {
        self.post_json(
            server_addr,
            &format!("/api/v1/statuses/{id}/unfavourite"),
            access_token,
        )
        .await
    }

    async fn notifications(
        &self,
        server_addr: &str,
        access_token: &str,
        pagination: &Pagination,
    ) -> Result<Page<Notification>> {
        self.get_page(server_addr, "/api/v1/notifications", access_token, pagination)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_header_both_directions() {
        let h = "<https://mast.example/api/v1/timelines/home?max_id=100&limit=20>; rel=\"next\", \
                 <https://mast.example/api/v1/timelines/home?min_id=120>; rel=\"prev\"";
        let (prev, next) = parse_link_header(h);
        let prev = prev.unwrap();
        assert_eq!(prev.min_id.as_deref(), Some("120"));
        let next = next.unwrap();
        assert_eq!(next.max_id.as_deref(), Some("100"));
        assert_eq!(next.limit, Some(20));
    }

    #[test]
    fn link_header_missing_rels() {
        let (prev, next) = parse_link_header("");
        assert!(prev.is_none());
        assert!(next.is_none());
    }
}
