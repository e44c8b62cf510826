use anyhow::Result;
use mpf_testkit::{FakeMastodon, FAKE_ACCOUNT_ID, FAKE_SERVER, FAKE_USERNAME};

#[tokio::test]
async fn refetch_without_new_statuses_changes_nothing() -> Result<()> {
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

    let stats = mpf_ingest::ingest_home(&store, &fake, stid, 10).await?;
    assert_eq!(stats.fetched, 2);

    let before = {
        let mut conn = store.read().await?;
        mpf_db::stream_state(conn.as_mut(), stid).await?
    };

    let stats = mpf_ingest::ingest_home(&store, &fake, stid, 10).await?;
    assert_eq!(stats.fetched, 0);
    assert_eq!(stats.duplicates, 0, "the cursor prevents re-reading old pages");

    let after = {
        let mut conn = store.read().await?;
        mpf_db::stream_state(conn.as_mut(), stid).await?
    };
    assert_eq!(after.remaining, before.remaining);
    assert_eq!(after.first_position, before.first_position);
    assert_eq!(after.last_position, before.last_position);
    Ok(())
}

#[tokio::test]
async fn reingesting_a_known_id_is_skipped_silently() -> Result<()> {
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
    mpf_ingest::ingest_home(&store, &fake, stid, 10).await?;

    // Rewind the cursor so the next pass re-reads the same page, as a
    // misbehaving upstream could make happen.
    let mut txn = store.begin().await?;
    let mut account =
        mpf_db::first_account_for_user(txn.conn(), user.uid).await?;
    account.last_home_status_id = None;
    mpf_db::set_account_state(txn.conn(), &account).await?;
    txn.commit().await?;

    let stats = mpf_ingest::ingest_home(&store, &fake, stid, 10).await?;
    assert_eq!(stats.fetched, 0);
    assert_eq!(stats.duplicates, 1, "the duplicate is skipped, not an error");

    let mut conn = store.read().await?;
    let n: i64 = sqlx::query_scalar("SELECT count(*) FROM statuses")
        .fetch_one(conn.as_mut())
        .await?;
    assert_eq!(n, 1, "a status is recorded exactly once");
    Ok(())
}
