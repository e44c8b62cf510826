//! Versioned schema and step-wise migrator.
//!
//! The database carries its schema version in `PRAGMA user_version`. At
//! startup [`migrate`] replays every step above the current version, each in
//! its own `BEGIN IMMEDIATE` transaction followed by a foreign-key
//! consistency check. Steps are append-only: a released step is never
//! reordered or edited.
//!
//! Version history:
//! - v1: entity-state tables (userstate, accountstate, appregstate,
//!   streamstate).
//! - v2: statuses + streamcontent.
//! - v3: sessions.
//! - v4: statuses rebuild — adds `status_meta` and the generated
//!   `status_id` / `status_reblog_id` columns (foreign keys off).
//! - v5: streamcontent rebuild — adds projected id columns and
//!   `stream_status_state`, backfilled from statuses (foreign keys off).
//! - v6: indexes.

use futures_util::future::BoxFuture;
use mpf_schemas::{Error, Result};
use sqlx::SqliteConnection;
use tracing::info;

use crate::Store;

// ---------------------------------------------------------------------------
// Reference schema
// ---------------------------------------------------------------------------

/// The target of the final migration step, as idempotent statements.
///
/// Used only by the self-test that compares a database built from this
/// schema with one brought to max version by replaying steps from zero.
/// Never executed at runtime.
pub const REFERENCE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS userstate (
  uid INTEGER PRIMARY KEY,
  state TEXT NOT NULL DEFAULT '{}'
) STRICT;

CREATE TABLE IF NOT EXISTS accountstate (
  asid INTEGER PRIMARY KEY,
  state TEXT NOT NULL DEFAULT '{}',
  uid INTEGER NOT NULL,
  FOREIGN KEY (uid) REFERENCES userstate (uid)
) STRICT;

CREATE TABLE IF NOT EXISTS appregstate (
  key TEXT NOT NULL PRIMARY KEY,
  state TEXT NOT NULL DEFAULT '{}'
) STRICT;

CREATE TABLE IF NOT EXISTS streamstate (
  stid INTEGER PRIMARY KEY,
  state TEXT NOT NULL DEFAULT '{}'
) STRICT;

CREATE TABLE IF NOT EXISTS statuses (
  sid INTEGER PRIMARY KEY AUTOINCREMENT,
  asid INTEGER NOT NULL,
  status TEXT NOT NULL,
  status_meta TEXT NOT NULL DEFAULT '{}',
  status_id TEXT GENERATED ALWAYS AS (json_extract(status, '$.id')) STORED,
  status_reblog_id TEXT GENERATED ALWAYS AS (json_extract(status, '$.reblog.id')) STORED,
  FOREIGN KEY (asid) REFERENCES accountstate (asid)
) STRICT;

CREATE TABLE IF NOT EXISTS streamcontent (
  stid INTEGER NOT NULL,
  sid INTEGER NOT NULL,
  position INTEGER,
  status_id TEXT,
  status_reblog_id TEXT,
  status_in_reply_to_id TEXT,
  stream_status_state TEXT NOT NULL DEFAULT '{}',
  PRIMARY KEY (stid, sid),
  FOREIGN KEY (stid) REFERENCES streamstate (stid),
  FOREIGN KEY (sid) REFERENCES statuses (sid)
) STRICT;

CREATE TABLE IF NOT EXISTS sessions (
  token TEXT NOT NULL PRIMARY KEY,
  data TEXT NOT NULL DEFAULT '{}',
  expiry INTEGER NOT NULL
) STRICT;

CREATE INDEX IF NOT EXISTS statuses_asid_status_id ON statuses (asid, status_id);
CREATE INDEX IF NOT EXISTS statuses_status_id ON statuses (status_id);
CREATE INDEX IF NOT EXISTS statuses_status_reblog_id ON statuses (status_reblog_id);
CREATE INDEX IF NOT EXISTS streamcontent_sid ON streamcontent (sid);
CREATE INDEX IF NOT EXISTS streamcontent_position ON streamcontent (stid, position);
CREATE INDEX IF NOT EXISTS streamcontent_status_id ON streamcontent (status_id);
CREATE INDEX IF NOT EXISTS streamcontent_status_reblog_id ON streamcontent (status_reblog_id);
CREATE INDEX IF NOT EXISTS sessions_expiry_idx ON sessions (expiry);
"#;

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

type StepFn = fn(&mut SqliteConnection) -> BoxFuture<'_, Result<()>>;

pub struct MigrationStep {
    pub to_version: i64,
    /// Table rebuilds with referential cycles need enforcement disabled;
    /// the pragma is a no-op inside a transaction, so the migrator toggles
    /// it around the step's transaction.
    pub foreign_keys_off: bool,
    pub apply: StepFn,
}

pub fn steps() -> Vec<MigrationStep> {
    vec![
        MigrationStep {
            to_version: 1,
            foreign_keys_off: false,
            apply: step_v1,
        },
        MigrationStep {
            to_version: 2,
            foreign_keys_off: false,
            apply: step_v2,
        },
        MigrationStep {
            to_version: 3,
            foreign_keys_off: false,
            apply: step_v3,
        },
        MigrationStep {
            to_version: 4,
            foreign_keys_off: true,
            apply: step_v4,
        },
        MigrationStep {
            to_version: 5,
            foreign_keys_off: true,
            apply: step_v5,
        },
        MigrationStep {
            to_version: 6,
            foreign_keys_off: false,
            apply: step_v6,
        },
    ]
}

pub fn target_version() -> i64 {
    steps().last().map(|s| s.to_version).unwrap_or(0)
}

async fn exec_batch(conn: &mut SqliteConnection, sql: &str) -> Result<()> {
    for stmt in sql.split(';') {
        let stmt = stmt.trim();
        if stmt.is_empty() {
            continue;
        }
        sqlx::query(stmt).execute(&mut *conn).await?;
    }
    Ok(())
}

fn step_v1(conn: &mut SqliteConnection) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        exec_batch(
            conn,
            r#"
            CREATE TABLE userstate (
              uid INTEGER PRIMARY KEY,
              state TEXT NOT NULL DEFAULT '{}'
            ) STRICT;

            CREATE TABLE accountstate (
              asid INTEGER PRIMARY KEY,
              state TEXT NOT NULL DEFAULT '{}',
              uid INTEGER NOT NULL,
              FOREIGN KEY (uid) REFERENCES userstate (uid)
            ) STRICT;

            CREATE TABLE appregstate (
              key TEXT NOT NULL PRIMARY KEY,
              state TEXT NOT NULL DEFAULT '{}'
            ) STRICT;

            CREATE TABLE streamstate (
              stid INTEGER PRIMARY KEY,
              state TEXT NOT NULL DEFAULT '{}'
            ) STRICT;
            "#,
        )
        .await
    })
}

fn step_v2(conn: &mut SqliteConnection) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        exec_batch(
            conn,
            r#"
            CREATE TABLE statuses (
              sid INTEGER PRIMARY KEY AUTOINCREMENT,
              asid INTEGER NOT NULL,
              status TEXT NOT NULL,
              FOREIGN KEY (asid) REFERENCES accountstate (asid)
            ) STRICT;

            CREATE TABLE streamcontent (
              stid INTEGER NOT NULL,
              sid INTEGER NOT NULL,
              position INTEGER,
              PRIMARY KEY (stid, sid),
              FOREIGN KEY (stid) REFERENCES streamstate (stid),
              FOREIGN KEY (sid) REFERENCES statuses (sid)
            ) STRICT;
            "#,
        )
        .await
    })
}

fn step_v3(conn: &mut SqliteConnection) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        exec_batch(
            conn,
            r#"
            CREATE TABLE sessions (
              token TEXT NOT NULL PRIMARY KEY,
              data TEXT NOT NULL DEFAULT '{}',
              expiry INTEGER NOT NULL
            ) STRICT;
            "#,
        )
        .await
    })
}

/// Rebuild statuses with filter metadata and generated upstream-id columns
/// projected out of the payload for indexed lookup.
fn step_v4(conn: &mut SqliteConnection) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        exec_batch(
            conn,
            r#"
            CREATE TABLE statuses_new (
              sid INTEGER PRIMARY KEY AUTOINCREMENT,
              asid INTEGER NOT NULL,
              status TEXT NOT NULL,
              status_meta TEXT NOT NULL DEFAULT '{}',
              status_id TEXT GENERATED ALWAYS AS (json_extract(status, '$.id')) STORED,
              status_reblog_id TEXT GENERATED ALWAYS AS (json_extract(status, '$.reblog.id')) STORED,
              FOREIGN KEY (asid) REFERENCES accountstate (asid)
            ) STRICT;

            INSERT INTO statuses_new (sid, asid, status)
              SELECT sid, asid, status FROM statuses;

            DROP TABLE statuses;
            ALTER TABLE statuses_new RENAME TO statuses;
            "#,
        )
        .await
    })
}

/// Rebuild streamcontent with projected id columns (backfilled from the
/// status payloads) and the per-stream status state document.
fn step_v5(conn: &mut SqliteConnection) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        exec_batch(
            conn,
            r#"
            CREATE TABLE streamcontent_new (
              stid INTEGER NOT NULL,
              sid INTEGER NOT NULL,
              position INTEGER,
              status_id TEXT,
              status_reblog_id TEXT,
              status_in_reply_to_id TEXT,
              stream_status_state TEXT NOT NULL DEFAULT '{}',
              PRIMARY KEY (stid, sid),
              FOREIGN KEY (stid) REFERENCES streamstate (stid),
              FOREIGN KEY (sid) REFERENCES statuses (sid)
            ) STRICT;

            INSERT INTO streamcontent_new
              (stid, sid, position, status_id, status_reblog_id, status_in_reply_to_id)
              SELECT sc.stid, sc.sid, sc.position,
                     s.status_id, s.status_reblog_id,
                     json_extract(s.status, '$.in_reply_to_id')
              FROM streamcontent sc JOIN statuses s ON s.sid = sc.sid;

            DROP TABLE streamcontent;
            ALTER TABLE streamcontent_new RENAME TO streamcontent;
            "#,
        )
        .await
    })
}

fn step_v6(conn: &mut SqliteConnection) -> BoxFuture<'_, Result<()>> {
    Box::pin(async move {
        exec_batch(
            conn,
            r#"
            CREATE INDEX statuses_asid_status_id ON statuses (asid, status_id);
            CREATE INDEX statuses_status_id ON statuses (status_id);
            CREATE INDEX statuses_status_reblog_id ON statuses (status_reblog_id);
            CREATE INDEX streamcontent_sid ON streamcontent (sid);
            CREATE INDEX streamcontent_position ON streamcontent (stid, position);
            CREATE INDEX streamcontent_status_id ON streamcontent (status_id);
            CREATE INDEX streamcontent_status_reblog_id ON streamcontent (status_reblog_id);
            CREATE INDEX sessions_expiry_idx ON sessions (expiry);
            "#,
        )
        .await
    })
}

// ---------------------------------------------------------------------------
// Migrator
// ---------------------------------------------------------------------------

pub async fn user_version(conn: &mut SqliteConnection) -> Result<i64> {
    Ok(sqlx::query_scalar::<_, i64>("PRAGMA user_version")
        .fetch_one(conn)
        .await?)
}

/// Bring the database to the current code's schema version.
///
/// Each pending step runs in its own transaction; a failed step rolls back
/// and aborts startup. After the last step the database is vacuumed and an
/// optimize pass is requested.
pub async fn migrate(store: &Store) -> Result<()> {
    let mut conn = store.writer().await?;
    let current = user_version(conn.as_mut()).await?;
    let target = target_version();
    if current > target {
        return Err(Error::Internal(format!(
            "database version {current} is newer than this build's {target}"
        )));
    }

    let mut applied = 0;
    for step in steps() {
        if step.to_version <= current {
            continue;
        }
        info!(to_version = step.to_version, "applying migration step");

        if step.foreign_keys_off {
            sqlx::query("PRAGMA foreign_keys = OFF")
                .execute(conn.as_mut())
                .await?;
        }

        let res = run_step(conn.as_mut(), &step).await;

        if step.foreign_keys_off {
            let re = sqlx::query("PRAGMA foreign_keys = ON")
                .execute(conn.as_mut())
                .await;
            // Step failure takes precedence; a re-enable failure must still
            // surface when the step itself succeeded.
            res?;
            re?;
        } else {
            res?;
        }
        applied += 1;
    }

    if applied > 0 {
        sqlx::query("VACUUM").execute(conn.as_mut()).await?;
        sqlx::query("PRAGMA optimize").execute(conn.as_mut()).await?;
        info!(version = target, steps = applied, "database migrated");
    }
    Ok(())
}

async fn run_step(conn: &mut SqliteConnection, step: &MigrationStep) -> Result<()> {
    sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

    let res = apply_and_check(conn, step).await;
    match res {
        Ok(()) => {
            sqlx::query("COMMIT").execute(&mut *conn).await?;
            Ok(())
        }
        Err(e) => {
            // Rollback failure is secondary to the step error.
            let _ = sqlx::query("ROLLBACK").execute(&mut *conn).await;
            Err(e)
        }
    }
}

async fn apply_and_check(conn: &mut SqliteConnection, step: &MigrationStep) -> Result<()> {
    (step.apply)(conn).await?;

    let violations: i64 = sqlx::query_scalar("SELECT count(*) FROM pragma_foreign_key_check")
        .fetch_one(&mut *conn)
        .await?;
    if violations > 0 {
        return Err(Error::Internal(format!(
            "migration to version {} leaves {} foreign key violation(s)",
            step.to_version, violations
        )));
    }

    // PRAGMA does not take bind parameters.
    sqlx::query(&format!("PRAGMA user_version = {}", step.to_version))
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Schema signature (self-test support)
// ---------------------------------------------------------------------------

/// Canonical description of tables, columns, indexes and foreign keys,
/// suitable for equality comparison between two databases.
pub async fn schema_signature(conn: &mut SqliteConnection) -> Result<String> {
    let tables: Vec<String> = sqlx::query_scalar(
        "SELECT name FROM sqlite_schema
         WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
         ORDER BY name",
    )
    .fetch_all(&mut *conn)
    .await?;

    let mut out = String::new();
    for table in tables {
        out.push_str(&format!("table {table}\n"));

        let cols: Vec<(i64, String, String, i64, Option<String>, i64, i64)> = sqlx::query_as(
            "SELECT cid, name, type, \"notnull\", dflt_value, pk, hidden
             FROM pragma_table_xinfo(?) ORDER BY cid",
        )
        .bind(&table)
        .fetch_all(&mut *conn)
        .await?;
        for (cid, name, typ, notnull, dflt, pk, hidden) in cols {
            out.push_str(&format!(
                "  col {cid} {name} {typ} notnull={notnull} dflt={dflt:?} pk={pk} hidden={hidden}\n"
            ));
        }

        let mut indexes: Vec<(String, i64, String)> = sqlx::query_as(
            "SELECT name, \"unique\", origin FROM pragma_index_list(?) ORDER BY name",
        )
        .bind(&table)
        .fetch_all(&mut *conn)
        .await?;
        indexes.sort();
        for (iname, unique, origin) in indexes {
            let cols: Vec<(i64, Option<String>)> = sqlx::query_as(
                "SELECT seqno, name FROM pragma_index_info(?) ORDER BY seqno",
            )
            .bind(&iname)
            .fetch_all(&mut *conn)
            .await?;
            let cols: Vec<String> = cols
                .into_iter()
                .map(|(_, n)| n.unwrap_or_else(|| "<expr>".to_string()))
                .collect();
            out.push_str(&format!(
                "  index {iname} unique={unique} origin={origin} cols={}\n",
                cols.join(",")
            ));
        }

        let mut fks: Vec<(i64, i64, String, String, Option<String>)> = sqlx::query_as(
            "SELECT id, seq, \"table\", \"from\", \"to\" FROM pragma_foreign_key_list(?)",
        )
        .bind(&table)
        .fetch_all(&mut *conn)
        .await?;
        fks.sort();
        for (id, seq, reftable, from, to) in fks {
            out.push_str(&format!(
                "  fk {id}.{seq} {from} -> {reftable}.{to:?}\n"
            ));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Replaying every migration from zero must produce exactly the schema
    /// described by [`REFERENCE_SCHEMA`].
    #[tokio::test]
    async fn migrations_match_reference_schema() -> Result<()> {
        let migrated = Store::open_in_memory().await?;
        migrate(&migrated).await?;
        let mut conn = migrated.writer().await?;
        let replayed = schema_signature(conn.as_mut()).await?;

        let reference = Store::open_in_memory().await?;
        let mut conn = reference.writer().await?;
        exec_batch(conn.as_mut(), REFERENCE_SCHEMA).await?;
        let canonical = schema_signature(conn.as_mut()).await?;

        assert_eq!(
            replayed, canonical,
            "replayed migrations diverge from the reference schema"
        );
        Ok(())
    }

    #[tokio::test]
    async fn migrate_is_idempotent() -> Result<()> {
        let store = Store::open_in_memory().await?;
        migrate(&store).await?;
        migrate(&store).await?;
        let mut conn = store.writer().await?;
        assert_eq!(user_version(conn.as_mut()).await?, target_version());
        Ok(())
    }

    #[tokio::test]
    async fn newer_database_is_rejected() -> Result<()> {
        let store = Store::open_in_memory().await?;
        let mut conn = store.writer().await?;
        sqlx::query("PRAGMA user_version = 99")
            .execute(conn.as_mut())
            .await?;
        drop(conn);
        assert!(migrate(&store).await.is_err());
        Ok(())
    }
}
