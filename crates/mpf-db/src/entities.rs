//! Entity records over the state tables.
//!
//! All functions take `&mut SqliteConnection` so callers can pass a reader
//! connection or an open write transaction interchangeably. Entity state
//! lives in JSON `state` columns; ids and foreign keys are real columns.

use mpf_schemas::mastodon::Status;
use mpf_schemas::{
    AccountState, AppRegState, Error, Result, StatusMeta, StreamState, StreamStatusState,
    UserState,
};
use sqlx::SqliteConnection;

fn is_unique_violation(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => {
            // SQLite primary-key / unique-constraint extended result codes.
            matches!(db.code().as_deref(), Some("1555") | Some("2067"))
        }
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

/// Create a user together with its default stream. Both rows are written in
/// the caller's transaction; ids come from the database.
pub async fn create_user(conn: &mut SqliteConnection) -> Result<UserState> {
    let res = sqlx::query("INSERT INTO userstate (state) VALUES ('{}')")
        .execute(&mut *conn)
        .await?;
    let uid = res.last_insert_rowid();

    let res = sqlx::query("INSERT INTO streamstate (state) VALUES ('{}')")
        .execute(&mut *conn)
        .await?;
    let stid = res.last_insert_rowid();

    let stream = StreamState::new(stid, uid);
    set_stream_state(conn, &stream).await?;

    let user = UserState {
        uid,
        default_stid: stid,
        ..Default::default()
    };
    set_user_state(conn, &user).await?;
    Ok(user)
}

pub async fn user_state(conn: &mut SqliteConnection, uid: i64) -> Result<UserState> {
    let state: Option<String> =
        sqlx::query_scalar("SELECT state FROM userstate WHERE uid = ?")
            .bind(uid)
            .fetch_optional(&mut *conn)
            .await?;
    match state {
        Some(s) => Ok(serde_json::from_str(&s)?),
        None => Err(Error::NotFound(format!("user {uid}"))),
    }
}

pub async fn set_user_state(conn: &mut SqliteConnection, user: &UserState) -> Result<()> {
    let state = serde_json::to_string(user)?;
    sqlx::query("UPDATE userstate SET state = ? WHERE uid = ?")
        .bind(state)
        .bind(user.uid)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn list_users(conn: &mut SqliteConnection) -> Result<Vec<UserState>> {
    let rows: Vec<String> = sqlx::query_scalar("SELECT state FROM userstate ORDER BY uid")
        .fetch_all(&mut *conn)
        .await?;
    let mut out = Vec::with_capacity(rows.len());
    for s in rows {
        out.push(serde_json::from_str(&s)?);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------------

pub async fn create_account(
    conn: &mut SqliteConnection,
    uid: i64,
    server_addr: &str,
    account_id: &str,
    username: &str,
    access_token: &str,
) -> Result<AccountState> {
    let res = sqlx::query("INSERT INTO accountstate (state, uid) VALUES ('{}', ?)")
        .bind(uid)
        .execute(&mut *conn)
        .await?;
    let asid = res.last_insert_rowid();

    let account = AccountState {
        asid,
        uid,
        server_addr: server_addr.to_string(),
        account_id: account_id.to_string(),
        username: username.to_string(),
        access_token: access_token.to_string(),
        last_home_status_id: None,
    };
    set_account_state(conn, &account).await?;
    Ok(account)
}

pub async fn account_state(conn: &mut SqliteConnection, asid: i64) -> Result<AccountState> {
    let state: Option<String> =
        sqlx::query_scalar("SELECT state FROM accountstate WHERE asid = ?")
            .bind(asid)
            .fetch_optional(&mut *conn)
            .await?;
    match state {
        Some(s) => Ok(serde_json::from_str(&s)?),
        None => Err(Error::NotFound(format!("account {asid}"))),
    }
}

pub async fn set_account_state(
    conn: &mut SqliteConnection,
    account: &AccountState,
) -> Result<()> {
    let state = serde_json::to_string(account)?;
    sqlx::query("UPDATE accountstate SET state = ? WHERE asid = ?")
        .bind(state)
        .bind(account.asid)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Look up an account by its upstream identity.
pub async fn account_for_upstream(
    conn: &mut SqliteConnection,
    server_addr: &str,
    account_id: &str,
) -> Result<Option<AccountState>> {
    let state: Option<String> = sqlx::query_scalar(
        "SELECT state FROM accountstate
         WHERE json_extract(state, '$.server_addr') = ?
           AND json_extract(state, '$.account_id') = ?",
    )
    .bind(server_addr)
    .bind(account_id)
    .fetch_optional(&mut *conn)
    .await?;
    match state {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub async fn accounts_for_user(
    conn: &mut SqliteConnection,
    uid: i64,
) -> Result<Vec<AccountState>> {
    let rows: Vec<String> =
        sqlx::query_scalar("SELECT state FROM accountstate WHERE uid = ? ORDER BY asid")
            .bind(uid)
            .fetch_all(&mut *conn)
            .await?;
    let mut out = Vec::with_capacity(rows.len());
    for s in rows {
        out.push(serde_json::from_str(&s)?);
    }
    Ok(out)
}

/// The account a stream ingests from. In practice one per user.
pub async fn first_account_for_user(
    conn: &mut SqliteConnection,
    uid: i64,
) -> Result<AccountState> {
    accounts_for_user(conn, uid)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| Error::NotFound(format!("no account for user {uid}")))
}

// ---------------------------------------------------------------------------
// App registrations
// ---------------------------------------------------------------------------

pub async fn app_registration(
    conn: &mut SqliteConnection,
    key: &str,
) -> Result<Option<AppRegState>> {
    let state: Option<String> =
        sqlx::query_scalar("SELECT state FROM appregstate WHERE key = ?")
            .bind(key)
            .fetch_optional(&mut *conn)
            .await?;
    match state {
        Some(s) => Ok(Some(serde_json::from_str(&s)?)),
        None => Ok(None),
    }
}

pub async fn set_app_registration(
    conn: &mut SqliteConnection,
    reg: &AppRegState,
) -> Result<()> {
    let state = serde_json::to_string(reg)?;
    sqlx::query(
        "INSERT INTO appregstate (key, state) VALUES (?, ?)
         ON CONFLICT (key) DO UPDATE SET state = excluded.state",
    )
    .bind(&reg.key)
    .bind(state)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Streams
// ---------------------------------------------------------------------------

pub async fn stream_state(conn: &mut SqliteConnection, stid: i64) -> Result<StreamState> {
    let state: Option<String> =
        sqlx::query_scalar("SELECT state FROM streamstate WHERE stid = ?")
            .bind(stid)
            .fetch_optional(&mut *conn)
            .await?;
    match state {
        Some(s) => Ok(serde_json::from_str(&s)?),
        None => Err(Error::NotFound(format!("stream {stid}"))),
    }
}

pub async fn set_stream_state(
    conn: &mut SqliteConnection,
    stream: &StreamState,
) -> Result<()> {
    let state = serde_json::to_string(stream)?;
    sqlx::query("UPDATE streamstate SET state = ? WHERE stid = ?")
        .bind(state)
        .bind(stream.stid)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// A status row joined with its metadata, as read back from the store.
#[derive(Debug, Clone)]
pub struct StatusRow {
    pub sid: i64,
    pub asid: i64,
    pub status: Status,
    pub meta: StatusMeta,
}

fn parse_status_row(sid: i64, asid: i64, status: &str, meta: &str) -> Result<StatusRow> {
    Ok(StatusRow {
        sid,
        asid,
        status: serde_json::from_str(status)?,
        meta: serde_json::from_str(meta)?,
    })
}

/// Find local statuses matching an upstream id among the user's accounts.
/// Matches the status's own id as well as its reblog target's.
pub async fn search_statuses(
    conn: &mut SqliteConnection,
    uid: i64,
    status_id: &str,
) -> Result<Vec<StatusRow>> {
    let rows: Vec<(i64, i64, String, String)> = sqlx::query_as(
        "SELECT s.sid, s.asid, s.status, s.status_meta
         FROM statuses s JOIN accountstate a ON a.asid = s.asid
         WHERE a.uid = ? AND (s.status_id = ? OR s.status_reblog_id = ?)
         ORDER BY s.sid",
    )
    .bind(uid)
    .bind(status_id)
    .bind(status_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for (sid, asid, status, meta) in rows {
        out.push(parse_status_row(sid, asid, &status, &meta)?);
    }
    Ok(out)
}

/// Fetch one status row, checking it belongs to the given user.
pub async fn status_for_user(
    conn: &mut SqliteConnection,
    uid: i64,
    sid: i64,
) -> Result<StatusRow> {
    let row: Option<(i64, i64, String, String)> = sqlx::query_as(
        "SELECT s.sid, s.asid, s.status, s.status_meta
         FROM statuses s JOIN accountstate a ON a.asid = s.asid
         WHERE a.uid = ? AND s.sid = ?",
    )
    .bind(uid)
    .bind(sid)
    .fetch_optional(&mut *conn)
    .await?;
    match row {
        Some((sid, asid, status, meta)) => parse_status_row(sid, asid, &status, &meta),
        None => Err(Error::NotFound(format!("status {sid}"))),
    }
}

/// Replace a status payload in place (favourite/refresh updates). The
/// generated id columns recompute from the new payload.
pub async fn update_status(
    conn: &mut SqliteConnection,
    sid: i64,
    status: &Status,
) -> Result<()> {
    let payload = serde_json::to_string(status)?;
    let res = sqlx::query("UPDATE statuses SET status = ? WHERE sid = ?")
        .bind(payload)
        .bind(sid)
        .execute(&mut *conn)
        .await?;
    if res.rows_affected() == 0 {
        return Err(Error::NotFound(format!("status {sid}")));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Pool insertion
// ---------------------------------------------------------------------------

/// Insert a status and its pool membership row (NULL position) for the given
/// stream. Does not touch the stream's `remaining` counter; the ingestion
/// transaction owns that accounting.
pub async fn insert_status_to_pool(
    conn: &mut SqliteConnection,
    stid: i64,
    asid: i64,
    status: &Status,
    meta: &StatusMeta,
    state: &StreamStatusState,
) -> Result<i64> {
    let payload = serde_json::to_string(status)?;
    let meta_json = serde_json::to_string(meta)?;
    let state_json = serde_json::to_string(state)?;

    let res = sqlx::query("INSERT INTO statuses (asid, status, status_meta) VALUES (?, ?, ?)")
        .bind(asid)
        .bind(payload)
        .bind(meta_json)
        .execute(&mut *conn)
        .await?;
    let sid = res.last_insert_rowid();

    sqlx::query(
        "INSERT INTO streamcontent
           (stid, sid, position, status_id, status_reblog_id, status_in_reply_to_id,
            stream_status_state)
         VALUES (?, ?, NULL, ?, ?, ?, ?)",
    )
    .bind(stid)
    .bind(sid)
    .bind(&status.id)
    .bind(status.reblog_id())
    .bind(status.in_reply_to_id.as_deref())
    .bind(state_json)
    .execute(&mut *conn)
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            Error::Conflict(format!("status {sid} already present in stream {stid}"))
        } else {
            e.into()
        }
    })?;
    Ok(sid)
}

/// Whether the stream already carries a status with this upstream id, either
/// as an original or as a reblog target.
pub async fn stream_has_upstream_id(
    conn: &mut SqliteConnection,
    stid: i64,
    upstream_id: &str,
) -> Result<bool> {
    let n: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM streamcontent
         WHERE stid = ? AND (status_id = ? OR status_reblog_id = ?)",
    )
    .bind(stid)
    .bind(upstream_id)
    .bind(upstream_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(n > 0)
}

/// Whether an account already has a status row for this upstream id.
pub async fn account_has_status(
    conn: &mut SqliteConnection,
    asid: i64,
    upstream_id: &str,
) -> Result<bool> {
    let n: i64 =
        sqlx::query_scalar("SELECT count(*) FROM statuses WHERE asid = ? AND status_id = ?")
            .bind(asid)
            .bind(upstream_id)
            .fetch_one(&mut *conn)
            .await?;
    Ok(n > 0)
}

// ---------------------------------------------------------------------------
// Clearing
// ---------------------------------------------------------------------------

/// Delete a stream's content and the statuses that are now orphaned, and
/// reset the stream's cursors. Administrative; not reachable from the RPC
/// surface.
pub async fn clear_stream(conn: &mut SqliteConnection, stid: i64) -> Result<StreamState> {
    let mut stream = stream_state(conn, stid).await?;

    sqlx::query("DELETE FROM streamcontent WHERE stid = ?")
        .bind(stid)
        .execute(&mut *conn)
        .await?;

    // Statuses referenced by no stream at all are unreachable; drop them.
    sqlx::query(
        "DELETE FROM statuses
         WHERE asid IN (SELECT asid FROM accountstate WHERE uid = ?)
           AND sid NOT IN (SELECT sid FROM streamcontent)",
    )
    .bind(stream.uid)
    .execute(&mut *conn)
    .await?;

    stream.first_position = 0;
    stream.last_position = 0;
    stream.last_read = 0;
    stream.remaining = 0;
    set_stream_state(conn, &stream).await?;
    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{schema, Store};

    #[tokio::test]
    async fn create_user_wires_default_stream() -> Result<()> {
        let store = Store::open_in_memory().await?;
        schema::migrate(&store).await?;

        let mut txn = store.begin().await?;
        let user = create_user(txn.conn()).await?;
        let stream = stream_state(txn.conn(), user.default_stid).await?;
        txn.commit().await?;

        assert_eq!(stream.uid, user.uid);
        assert_eq!(stream.first_position, 0);
        assert_eq!(stream.last_position, 0);
        Ok(())
    }

    #[tokio::test]
    async fn account_upstream_lookup() -> Result<()> {
        let store = Store::open_in_memory().await?;
        schema::migrate(&store).await?;

        let mut txn = store.begin().await?;
        let user = create_user(txn.conn()).await?;
        let account = create_account(
            txn.conn(),
            user.uid,
            "https://mast.example",
            "acc1",
            "alice",
            "token-1",
        )
        .await?;
        txn.commit().await?;

        let mut conn = store.read().await?;
        let found = account_for_upstream(conn.as_mut(), "https://mast.example", "acc1")
            .await?
            .expect("account should resolve");
        assert_eq!(found.asid, account.asid);
        assert!(
            account_for_upstream(conn.as_mut(), "https://other.example", "acc1")
                .await?
                .is_none()
        );
        Ok(())
    }

    #[tokio::test]
    async fn app_registration_upsert_roundtrip() -> Result<()> {
        let store = Store::open_in_memory().await?;
        schema::migrate(&store).await?;

        let reg = AppRegState {
            key: "k1".to_string(),
            server_addr: "https://mast.example".to_string(),
            scopes: "read".to_string(),
            redirect_uri: "urn:ietf:wg:oauth:2.0:oob".to_string(),
            client_id: "cid".to_string(),
            client_secret: "secret".to_string(),
            auth_uri: "https://mast.example/oauth/authorize".to_string(),
        };

        let mut txn = store.begin().await?;
        set_app_registration(txn.conn(), &reg).await?;
        txn.commit().await?;

        let mut conn = store.read().await?;
        let got = app_registration(conn.as_mut(), "k1").await?.unwrap();
        assert_eq!(got, reg);
        assert!(app_registration(conn.as_mut(), "k2").await?.is_none());
        Ok(())
    }
}
