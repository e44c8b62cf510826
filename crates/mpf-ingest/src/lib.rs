//! Ingestion coordinator: pages the upstream home timeline into the local
//! pool, deduplicating and evaluating filters on the way.
//!
//! All upstream HTTP happens before the insert transaction opens; no lock or
//! transaction is held across a network call.

use chrono::Utc;
use mpf_db::{
    account_has_status, account_state, first_account_for_user, insert_status_to_pool,
    set_account_state, set_stream_state, stream_has_upstream_id, stream_state, user_state, Store,
};
use mpf_mastodon::{id_newer, MastodonClient, Pagination};
use mpf_schemas::mastodon::{Filter, Status};
use mpf_schemas::{
    AlreadySeen, FilterMatch, NotificationState, Result, SeenReblogs, StatusMeta,
    StreamStatusState,
};
use tracing::{debug, info, warn};

/// Upper bound on timeline pages fetched per ingest call.
pub const DEFAULT_MAX_BATCHES: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Statuses inserted into the pool.
    pub fetched: i64,
    /// Statuses skipped because the account already had their upstream id.
    pub duplicates: i64,
    /// True when the page budget ran out with the upstream still advertising
    /// newer items.
    pub hit_batch_cap: bool,
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Whether a filter matches a status.
///
/// The phrase (case-folded) matches as a substring of the reblog-unwrapped
/// content; a phrase starting with `#` additionally matches a tag of the
/// same name.
pub fn filter_matches(filter: &Filter, status: &Status) -> bool {
    let target = status.unwrapped();
    let phrase = filter.phrase.to_lowercase();
    if target.content.to_lowercase().contains(&phrase) {
        return true;
    }
    if let Some(tag) = phrase.strip_prefix('#') {
        return target.tags.iter().any(|t| t.name.to_lowercase() == tag);
    }
    false
}

/// Evaluate every filter against a status. The result list is stored with
/// the status; filtered statuses are never dropped server-side.
pub fn eval_filters(filters: &[Filter], status: &Status) -> StatusMeta {
    StatusMeta {
        filters: filters
            .iter()
            .map(|f| FilterMatch {
                id: f.id.clone(),
                matched: filter_matches(f, status),
            })
            .collect(),
    }
}

// ---------------------------------------------------------------------------
// Ingest
// ---------------------------------------------------------------------------

/// Fetch everything newer than the account's `last_home_status_id` (up to
/// `max_batches` pages) and insert the kept statuses into the stream's pool
/// in a single transaction.
pub async fn ingest_home(
    store: &Store,
    client: &dyn MastodonClient,
    stid: i64,
    max_batches: usize,
) -> Result<IngestStats> {
    let (account, seen_reblogs) = {
        let mut conn = store.read().await?;
        let stream = stream_state(conn.as_mut(), stid).await?;
        let account = first_account_for_user(conn.as_mut(), stream.uid).await?;
        let user = user_state(conn.as_mut(), stream.uid).await?;
        (account, user.settings.seen_reblogs())
    };

    let filters = client
        .filters(&account.server_addr, &account.access_token)
        .await?;

    // Page strictly newer than what we have. The upstream returns each page
    // newest-first and advertises the next-newer window as rel="prev".
    let mut pages: Vec<Vec<Status>> = Vec::new();
    let mut pagination = Pagination::with_min_id(account.last_home_status_id.clone());
    let mut hit_batch_cap = false;
    for batch in 0..max_batches {
        let page = client
            .home_timeline(&account.server_addr, &account.access_token, &pagination)
            .await?;
        if page.items.is_empty() {
            break;
        }
        let newest = page
            .items
            .iter()
            .map(|s| s.id.clone())
            .reduce(|a, b| if id_newer(&b, &a) { b } else { a });
        pages.push(page.items);

        pagination = match page.prev {
            Some(p) => p,
            None => Pagination::with_min_id(newest),
        };
        if batch == max_batches - 1 {
            hit_batch_cap = true;
        }
    }

    if pages.is_empty() {
        debug!(stid, "no new statuses upstream");
        touch_last_fetch(store, stid).await?;
        return Ok(IngestStats::default());
    }

    let mut stats = IngestStats {
        hit_batch_cap,
        ..Default::default()
    };
    let mut txn = store.begin().await?;
    let conn = txn.conn();

    let mut last_id = account.last_home_status_id.clone();
    // Pages walk old -> new; within a page items are newest-first. Insert in
    // chronological order so sids follow creation order for same-timestamp
    // tie-breaks.
    for page in &pages {
        for status in page.iter().rev() {
            if last_id
                .as_deref()
                .map(|prev| id_newer(&status.id, prev))
                .unwrap_or(true)
            {
                last_id = Some(status.id.clone());
            }

            // Re-ingesting the same upstream id is benign: skip and continue.
            if account_has_status(conn, account.asid, &status.id).await? {
                stats.duplicates += 1;
                continue;
            }

            let state = match status.reblog_id() {
                Some(reblog_id) => {
                    let seen = stream_has_upstream_id(conn, stid, reblog_id).await?;
                    let already_seen = match (seen, seen_reblogs) {
                        (false, _) => AlreadySeen::No,
                        (true, SeenReblogs::Hide) => AlreadySeen::Yes,
                        (true, SeenReblogs::Show) => AlreadySeen::No,
                    };
                    StreamStatusState { already_seen }
                }
                None => StreamStatusState::default(),
            };

            let meta = eval_filters(&filters, status);
            insert_status_to_pool(conn, stid, account.asid, status, &meta, &state).await?;
            stats.fetched += 1;
        }
    }

    let mut stream = stream_state(conn, stid).await?;
    stream.remaining += stats.fetched;
    stream.last_fetch_secs = Some(Utc::now().timestamp());
    set_stream_state(conn, &stream).await?;

    let mut account = account_state(conn, account.asid).await?;
    account.last_home_status_id = last_id;
    set_account_state(conn, &account).await?;

    txn.commit().await?;
    info!(
        stid,
        fetched = stats.fetched,
        duplicates = stats.duplicates,
        "ingest pass done"
    );
    Ok(stats)
}

async fn touch_last_fetch(store: &Store, stid: i64) -> Result<()> {
    let mut txn = store.begin().await?;
    let mut stream = stream_state(txn.conn(), stid).await?;
    stream.last_fetch_secs = Some(Utc::now().timestamp());
    set_stream_state(txn.conn(), &stream).await?;
    txn.commit().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Notification snapshot
// ---------------------------------------------------------------------------

/// Refresh the stream's notification counter from upstream notifications and
/// the notifications marker. Failures are logged and swallowed; the counter
/// is best-effort state, not timeline data.
pub async fn update_notifications(
    store: &Store,
    client: &dyn MastodonClient,
    stid: i64,
) -> Result<()> {
    let account = {
        let mut conn = store.read().await?;
        let stream = stream_state(conn.as_mut(), stid).await?;
        first_account_for_user(conn.as_mut(), stream.uid).await?
    };

    let snapshot = fetch_notification_snapshot(client, &account.server_addr, &account.access_token)
        .await;
    let (state, count) = match snapshot {
        Ok(v) => v,
        Err(e) => {
            warn!(stid, error = %e, "notification snapshot failed");
            return Ok(());
        }
    };

    let mut txn = store.begin().await?;
    let mut stream = stream_state(txn.conn(), stid).await?;
    stream.notification_state = state;
    stream.notification_count = count;
    set_stream_state(txn.conn(), &stream).await?;
    txn.commit().await?;
    Ok(())
}

async fn fetch_notification_snapshot(
    client: &dyn MastodonClient,
    server_addr: &str,
    access_token: &str,
) -> Result<(NotificationState, i64)> {
    let markers = client
        .markers(server_addr, access_token, &["notifications"])
        .await?;
    let page = client
        .notifications(server_addr, access_token, &Pagination::default())
        .await?;

    let Some(marker) = markers.get("notifications") else {
        return Ok((NotificationState::Unknown, page.items.len() as i64));
    };

    let unread = page
        .items
        .iter()
        .filter(|n| id_newer(&n.id, &marker.last_read_id))
        .count() as i64;
    let state = if unread == 0 {
        NotificationState::None
    } else if unread == page.items.len() as i64 && page.next.is_some() {
        // Every item on the page is unread and older pages exist: the true
        // count is larger than what we saw.
        NotificationState::More
    } else {
        NotificationState::Some
    };
    Ok((state, unread))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(raw: serde_json::Value) -> Status {
        serde_json::from_value(raw).unwrap()
    }

    fn filter(id: &str, phrase: &str) -> Filter {
        serde_json::from_value(serde_json::json!({ "id": id, "phrase": phrase })).unwrap()
    }

    #[test]
    fn filter_matches_content_case_folded() {
        let s = status(serde_json::json!({
            "id": "1",
            "created_at": "2024-03-01T10:00:00Z",
            "content": "Hello #LinuxKernel world",
            "tags": [{"name": "LinuxKernel"}],
        }));
        assert!(filter_matches(&filter("f1", "hello"), &s));
        assert!(filter_matches(&filter("f2", "#linuxkernel"), &s));
        assert!(!filter_matches(&filter("f3", "absent"), &s));
    }

    #[test]
    fn filter_matches_tag_without_content_hit() {
        let s = status(serde_json::json!({
            "id": "1",
            "created_at": "2024-03-01T10:00:00Z",
            "content": "no hash mark here",
            "tags": [{"name": "Rustlang"}],
        }));
        assert!(filter_matches(&filter("f", "#rustlang"), &s));
        assert!(!filter_matches(&filter("f", "#golang"), &s));
    }

    #[test]
    fn filter_matches_unwraps_reblogs() {
        let s = status(serde_json::json!({
            "id": "2",
            "created_at": "2024-03-01T10:00:00Z",
            "content": "",
            "reblog": {
                "id": "1",
                "created_at": "2024-03-01T09:00:00Z",
                "content": "inner payload",
            },
        }));
        assert!(filter_matches(&filter("f", "inner"), &s));
    }

    #[test]
    fn eval_filters_keeps_order_and_ids() {
        let s = status(serde_json::json!({
            "id": "1",
            "created_at": "2024-03-01T10:00:00Z",
            "content": "Hello #LinuxKernel world",
            "tags": [{"name": "LinuxKernel"}],
        }));
        let meta = eval_filters(
            &[
                filter("f1", "hello"),
                filter("f2", "#linuxkernel"),
                filter("f3", "absent"),
            ],
            &s,
        );
        let got: Vec<(&str, bool)> = meta
            .filters
            .iter()
            .map(|m| (m.id.as_str(), m.matched))
            .collect();
        assert_eq!(got, vec![("f1", true), ("f2", true), ("f3", false)]);
    }
}
