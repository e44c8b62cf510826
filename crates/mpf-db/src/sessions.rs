//! Cookie-session persistence over the `sessions` table.

use chrono::Utc;
use mpf_schemas::Result;
use serde::{Deserialize, Serialize};
use sqlx::SqliteConnection;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionData {
    uid: i64,
}

/// Create a session row and return its token.
pub async fn create_session(
    conn: &mut SqliteConnection,
    uid: i64,
    ttl_secs: i64,
) -> Result<String> {
    let token = Uuid::new_v4().to_string();
    let data = serde_json::to_string(&SessionData { uid })?;
    let expiry = Utc::now().timestamp() + ttl_secs;
    sqlx::query("INSERT INTO sessions (token, data, expiry) VALUES (?, ?, ?)")
        .bind(&token)
        .bind(data)
        .bind(expiry)
        .execute(&mut *conn)
        .await?;
    Ok(token)
}

/// Resolve a session token to a uid, ignoring expired rows. Expired rows are
/// purged opportunistically on the way.
pub async fn session_uid(conn: &mut SqliteConnection, token: &str) -> Result<Option<i64>> {
    let now = Utc::now().timestamp();
    sqlx::query("DELETE FROM sessions WHERE expiry < ?")
        .bind(now)
        .execute(&mut *conn)
        .await?;

    let data: Option<String> =
        sqlx::query_scalar("SELECT data FROM sessions WHERE token = ? AND expiry >= ?")
            .bind(token)
            .bind(now)
            .fetch_optional(&mut *conn)
            .await?;
    match data {
        Some(d) => {
            let parsed: SessionData = serde_json::from_str(&d)?;
            Ok(Some(parsed.uid))
        }
        None => Ok(None),
    }
}

pub async fn delete_session(conn: &mut SqliteConnection, token: &str) -> Result<()> {
    sqlx::query("DELETE FROM sessions WHERE token = ?")
        .bind(token)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{schema, Store};

    #[tokio::test]
    async fn session_roundtrip_and_delete() -> Result<()> {
        let store = Store::open_in_memory().await?;
        schema::migrate(&store).await?;

        let mut txn = store.begin().await?;
        let token = create_session(txn.conn(), 7, 3600).await?;
        assert_eq!(session_uid(txn.conn(), &token).await?, Some(7));
        delete_session(txn.conn(), &token).await?;
        assert_eq!(session_uid(txn.conn(), &token).await?, None);
        txn.commit().await?;
        Ok(())
    }

    #[tokio::test]
    async fn expired_session_is_purged() -> Result<()> {
        let store = Store::open_in_memory().await?;
        schema::migrate(&store).await?;

        let mut txn = store.begin().await?;
        let token = create_session(txn.conn(), 7, -10).await?;
        assert_eq!(session_uid(txn.conn(), &token).await?, None);

        let count: i64 = sqlx::query_scalar("SELECT count(*) FROM sessions")
            .fetch_one(txn.conn())
            .await?;
        assert_eq!(count, 0, "expired row should have been purged");
        txn.commit().await?;
        Ok(())
    }
}
