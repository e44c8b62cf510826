use anyhow::Result;
use mpf_schemas::{StatusMeta, StreamStatusState};
use mpf_testkit::{FakeMastodon, FAKE_ACCOUNT_ID, FAKE_SERVER, FAKE_USERNAME};

fn status(id: &str) -> mpf_schemas::mastodon::Status {
    serde_json::from_value(serde_json::json!({
        "id": id,
        "created_at": "2024-03-01T10:00:00Z",
        "content": format!("status {id}"),
    }))
    .unwrap()
}

#[tokio::test]
async fn cross_account_rows_are_removed_and_state_recomputed() -> Result<()> {
    let store = mpf_db::Store::open_in_memory().await?;
    mpf_db::migrate(&store).await?;

    let mut txn = store.begin().await?;
    let alice = mpf_db::create_user(txn.conn()).await?;
    let alice_acc = mpf_db::create_account(
        txn.conn(),
        alice.uid,
        FAKE_SERVER,
        FAKE_ACCOUNT_ID,
        FAKE_USERNAME,
        "tok",
    )
    .await?;
    let bob = mpf_db::create_user(txn.conn()).await?;
    let bob_acc = mpf_db::create_account(
        txn.conn(),
        bob.uid,
        FAKE_SERVER,
        "f0002",
        "bob",
        "tok2",
    )
    .await?;

    // One legitimate row and one that leaked in from bob's account.
    mpf_db::insert_status_to_pool(
        txn.conn(),
        alice.default_stid,
        alice_acc.asid,
        &status("100"),
        &StatusMeta::default(),
        &StreamStatusState::default(),
    )
    .await?;
    mpf_db::insert_status_to_pool(
        txn.conn(),
        alice.default_stid,
        bob_acc.asid,
        &status("200"),
        &StatusMeta::default(),
        &StreamStatusState::default(),
    )
    .await?;
    txn.commit().await?;

    let mut txn = store.begin().await?;
    let deleted = mpf_stream::fix_cross_statuses(txn.conn(), alice.default_stid).await?;
    assert_eq!(deleted, 1);
    let deleted = mpf_stream::fix_duplicate_statuses(txn.conn(), alice.default_stid).await?;
    assert_eq!(deleted, 0, "nothing to do under intact invariants");

    let recomputed = mpf_stream::recompute_stream_state(txn.conn(), alice.default_stid).await?;
    assert_eq!(recomputed.remaining, 1);
    assert_eq!(recomputed.first_position, 0);
    assert_eq!(recomputed.last_position, 0);
    mpf_db::set_stream_state(txn.conn(), &recomputed).await?;
    txn.commit().await?;
    Ok(())
}

#[tokio::test]
async fn clear_stream_resets_cursors_and_drops_orphans() -> Result<()> {
    let store = mpf_db::Store::open_in_memory().await?;
    mpf_db::migrate(&store).await?;
    let mut txn = store.begin().await?;
    let user = mpf_db::create_user(txn.conn()).await?;
    mpf_db::create_account(
        txn.conn(),
        user.uid,
        FAKE_SERVER,
        FAKE_ACCOUNT_ID,
        FAKE_USERNAME,
        "tok",
    )
    .await?;
    txn.commit().await?;
    let stid = user.default_stid;

    let fake = FakeMastodon::new();
    fake.post_status("one", &[]);
    fake.post_status("two", &[]);
    mpf_ingest::ingest_home(&store, &fake, stid, 10).await?;

    let mut txn = store.begin().await?;
    mpf_stream::list_forward(txn.conn(), stid, 0, true, 10).await?;
    mpf_stream::set_read(txn.conn(), stid, 2, mpf_schemas::ReadMode::Advance).await?;
    let cleared = mpf_db::clear_stream(txn.conn(), stid).await?;
    txn.commit().await?;

    assert_eq!(cleared.first_position, 0);
    assert_eq!(cleared.last_position, 0);
    assert_eq!(cleared.last_read, 0);
    assert_eq!(cleared.remaining, 0);

    let mut conn = store.read().await?;
    let statuses: i64 = sqlx::query_scalar("SELECT count(*) FROM statuses")
        .fetch_one(conn.as_mut())
        .await?;
    let content: i64 = sqlx::query_scalar("SELECT count(*) FROM streamcontent")
        .fetch_one(conn.as_mut())
        .await?;
    assert_eq!((statuses, content), (0, 0));
    Ok(())
}
