//! The stream engine: triage from the pool into positioned slots, list
//! windows in both directions, and the read cursor.
//!
//! Every function here expects to run on a connection with an open write
//! transaction when it mutates (the caller owns commit/rollback), so a list
//! call that drains the pool observes and produces a self-consistent window
//! even while a fetcher appends concurrently.

use chrono::{DateTime, Utc};
use mpf_db::{set_stream_state, stream_state};
use mpf_schemas::mastodon::Status;
use mpf_schemas::{Error, ReadMode, Result, StatusMeta, StreamState, StreamStatusState};
use sqlx::SqliteConnection;
use tracing::info;

/// One positioned item as served to the RPC layer.
#[derive(Debug, Clone)]
pub struct StreamItem {
    pub position: i64,
    pub sid: i64,
    pub asid: i64,
    pub status: Status,
    pub meta: StatusMeta,
    pub state: StreamStatusState,
}

#[derive(Debug)]
struct PoolRow {
    sid: i64,
    asid: i64,
    status: Status,
    meta: StatusMeta,
    state: StreamStatusState,
    created_at: DateTime<Utc>,
}

async fn load_pool(conn: &mut SqliteConnection, stid: i64) -> Result<Vec<PoolRow>> {
    let rows: Vec<(i64, i64, String, String, String)> = sqlx::query_as(
        "SELECT sc.sid, s.asid, s.status, s.status_meta, sc.stream_status_state
         FROM streamcontent sc JOIN statuses s ON s.sid = sc.sid
         WHERE sc.stid = ? AND sc.position IS NULL",
    )
    .bind(stid)
    .fetch_all(&mut *conn)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for (sid, asid, status, meta, state) in rows {
        let status: Status = serde_json::from_str(&status)?;
        let created_at = status.created_at;
        out.push(PoolRow {
            sid,
            asid,
            status,
            meta: serde_json::from_str(&meta)?,
            state: serde_json::from_str(&state)?,
            created_at,
        });
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Triage
// ---------------------------------------------------------------------------

/// Move one pool row into the stream at the next position.
///
/// Ordering policy: earliest upstream creation time wins; ties break to the
/// lower sid. Returns `None` when the pool is empty (and resyncs
/// `remaining` to 0 in that case).
pub async fn pick_next(conn: &mut SqliteConnection, stid: i64) -> Result<Option<StreamItem>> {
    let mut stream = stream_state(conn, stid).await?;
    let pool = load_pool(conn, stid).await?;

    let Some(best) = pool
        .iter()
        .min_by(|a, b| (a.created_at, a.sid).cmp(&(b.created_at, b.sid)))
    else {
        if stream.remaining != 0 {
            stream.remaining = 0;
            set_stream_state(conn, &stream).await?;
        }
        return Ok(None);
    };

    stream.last_position += 1;
    let position = stream.last_position;
    if stream.first_position == 0 {
        stream.first_position = position;
    }
    stream.remaining = pool.len() as i64 - 1;

    let res = sqlx::query(
        "UPDATE streamcontent SET position = ?
         WHERE stid = ? AND sid = ? AND position IS NULL",
    )
    .bind(position)
    .bind(stid)
    .bind(best.sid)
    .execute(&mut *conn)
    .await?;
    if res.rows_affected() != 1 {
        return Err(Error::Internal(format!(
            "triage of status sid={} in stream {stid} updated {} rows",
            best.sid,
            res.rows_affected()
        )));
    }

    set_stream_state(conn, &stream).await?;
    Ok(Some(StreamItem {
        position,
        sid: best.sid,
        asid: best.asid,
        status: best.status.clone(),
        meta: best.meta.clone(),
        state: best.state.clone(),
    }))
}

// ---------------------------------------------------------------------------
// Listing
// ---------------------------------------------------------------------------

async fn positioned_rows(
    conn: &mut SqliteConnection,
    stid: i64,
    where_clause: &str,
    ref_position: i64,
    limit: i64,
    descending: bool,
) -> Result<Vec<StreamItem>> {
    let order = if descending { "DESC" } else { "ASC" };
    let sql = format!(
        "SELECT sc.position, sc.sid, s.asid, s.status, s.status_meta, sc.stream_status_state
         FROM streamcontent sc JOIN statuses s ON s.sid = sc.sid
         WHERE sc.stid = ? AND {where_clause}
         ORDER BY sc.position {order} LIMIT ?"
    );
    let rows: Vec<(i64, i64, i64, String, String, String)> = sqlx::query_as(&sql)
        .bind(stid)
        .bind(ref_position)
        .bind(limit)
        .fetch_all(&mut *conn)
        .await?;

    let mut out = Vec::with_capacity(rows.len());
    for (position, sid, asid, status, meta, state) in rows {
        out.push(StreamItem {
            position,
            sid,
            asid,
            status: serde_json::from_str(&status)?,
            meta: serde_json::from_str(&meta)?,
            state: serde_json::from_str(&state)?,
        });
    }
    Ok(out)
}

/// List up to `list_count` items with positions after `ref_position`,
/// triaging from the pool to fill the window.
///
/// With `is_initial`, `ref_position` is overridden by the stream's read
/// cursor; otherwise it must name an existing position (or 0 on an empty
/// stream). Items return in ascending position order, together with the
/// stream state as of the end of the call.
pub async fn list_forward(
    conn: &mut SqliteConnection,
    stid: i64,
    ref_position: i64,
    is_initial: bool,
    list_count: i64,
) -> Result<(Vec<StreamItem>, StreamState)> {
    let stream = stream_state(conn, stid).await?;

    let ref_position = if is_initial {
        stream.last_read
    } else {
        // An empty stream only accepts 0; otherwise the reference must name
        // an existing position.
        let valid = if stream.last_position == 0 {
            ref_position == 0
        } else {
            ref_position >= stream.first_position && ref_position <= stream.last_position
        };
        if !valid {
            return Err(Error::InvalidArgument(format!(
                "position {ref_position} does not exist in stream {stid}"
            )));
        }
        ref_position
    };

    let mut items =
        positioned_rows(conn, stid, "sc.position > ?", ref_position, list_count, false).await?;

    // Fill the window from the pool.
    while (items.len() as i64) < list_count {
        match pick_next(conn, stid).await? {
            Some(item) => items.push(item),
            None => break,
        }
    }

    let stream = stream_state(conn, stid).await?;
    Ok((items, stream))
}

/// List up to `list_count` items strictly before `ref_position`, returned in
/// ascending order. Backward never triages from the pool.
pub async fn list_backward(
    conn: &mut SqliteConnection,
    stid: i64,
    ref_position: i64,
    list_count: i64,
) -> Result<(Vec<StreamItem>, StreamState)> {
    let stream = stream_state(conn, stid).await?;

    if ref_position < 1 || stream.last_position == 0 {
        return Err(Error::InvalidArgument(format!(
            "position {ref_position} does not exist in stream {stid}"
        )));
    }
    if ref_position < stream.first_position || ref_position > stream.last_position {
        return Err(Error::InvalidArgument(format!(
            "position {ref_position} does not exist in stream {stid}"
        )));
    }

    let mut items =
        positioned_rows(conn, stid, "sc.position < ?", ref_position, list_count, true).await?;
    items.reverse();
    Ok((items, stream))
}

// ---------------------------------------------------------------------------
// Read cursor
// ---------------------------------------------------------------------------

/// Move the read cursor. ADVANCE never regresses; ABSOLUTE sets the clamped
/// value unconditionally. Both are idempotent.
pub async fn set_read(
    conn: &mut SqliteConnection,
    stid: i64,
    position: i64,
    mode: ReadMode,
) -> Result<StreamState> {
    let mut stream = stream_state(conn, stid).await?;
    let clamped = position.clamp(0, stream.last_position);
    stream.last_read = match mode {
        ReadMode::Advance => stream.last_read.max(clamped),
        ReadMode::Absolute => clamped,
    };
    set_stream_state(conn, &stream).await?;
    Ok(stream)
}

// ---------------------------------------------------------------------------
// Repairs
// ---------------------------------------------------------------------------

/// Drop all but the lowest-positioned row when a status appears at several
/// positions of the same stream. Earlier schema versions permitted this
/// drift; under current invariants this deletes nothing.
pub async fn fix_duplicate_statuses(conn: &mut SqliteConnection, stid: i64) -> Result<u64> {
    let res = sqlx::query(
        "DELETE FROM streamcontent
         WHERE stid = ?1 AND position IS NOT NULL AND EXISTS (
           SELECT 1 FROM streamcontent b
           WHERE b.stid = streamcontent.stid AND b.sid = streamcontent.sid
             AND b.position IS NOT NULL AND b.position < streamcontent.position
         )",
    )
    .bind(stid)
    .execute(&mut *conn)
    .await?;
    let deleted = res.rows_affected();
    if deleted > 0 {
        info!(stid, deleted, "removed duplicate stream rows");
    }
    Ok(deleted)
}

/// Delete rows whose status belongs to an account of a different user than
/// the stream's owner.
pub async fn fix_cross_statuses(conn: &mut SqliteConnection, stid: i64) -> Result<u64> {
    let stream = stream_state(conn, stid).await?;
    let res = sqlx::query(
        "DELETE FROM streamcontent
         WHERE stid = ?1 AND sid IN (
           SELECT s.sid FROM statuses s
           WHERE s.asid NOT IN (SELECT asid FROM accountstate WHERE uid = ?2)
         )",
    )
    .bind(stid)
    .bind(stream.uid)
    .execute(&mut *conn)
    .await?;
    let deleted = res.rows_affected();
    if deleted > 0 {
        info!(stid, deleted, "removed cross-account stream rows");
    }
    Ok(deleted)
}

/// Derive the stream counters from the streamcontent table. Pure read: the
/// caller decides whether to persist the returned record.
pub async fn recompute_stream_state(
    conn: &mut SqliteConnection,
    stid: i64,
) -> Result<StreamState> {
    let mut stream = stream_state(conn, stid).await?;

    let (min_pos, max_pos): (Option<i64>, Option<i64>) = sqlx::query_as(
        "SELECT MIN(position), MAX(position) FROM streamcontent
         WHERE stid = ? AND position IS NOT NULL",
    )
    .bind(stid)
    .fetch_one(&mut *conn)
    .await?;

    let remaining: i64 = sqlx::query_scalar(
        "SELECT count(*) FROM streamcontent WHERE stid = ? AND position IS NULL",
    )
    .bind(stid)
    .fetch_one(&mut *conn)
    .await?;

    stream.first_position = min_pos.unwrap_or(0);
    stream.last_position = max_pos.unwrap_or(0);
    stream.remaining = remaining;
    stream.last_read = stream.last_read.clamp(0, stream.last_position);
    Ok(stream)
}
